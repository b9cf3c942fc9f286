// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides the [`Queue`] component. A queue is either standalone,
//! opening its own connection, or an exchange subscriber: it then reuses the
//! channel of its [`Exchange`] and binds itself to that exchange with one or
//! more routing keys once it is asserted.
//!
//! A queue asserted with an empty name is named by the broker; the assigned
//! name replaces the empty placeholder.

use crate::{
    channel::{BrokerChannel, Connector, LapinConnector, QueueParams},
    component::{self, BrokerComponent, ComponentSetup, ComponentState},
    errors::AmqpError,
    exchange::Exchange,
    settings::ConnectionSettings,
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error, info};

/// Exchange a subscriber queue binds to once asserted.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueBinding {
    exchange_name: String,
    routing_keys: Vec<String>,
}

impl QueueBinding {
    /// The keys to bind with; the empty key when none were requested.
    fn keys(&self) -> Vec<&str> {
        if self.routing_keys.is_empty() {
            return vec![""];
        }
        self.routing_keys.iter().map(String::as_str).collect()
    }
}

/// A broker queue, optionally bound to an exchange.
pub struct Queue {
    component: BrokerComponent,
    exclusive: bool,
    auto_deleted: bool,
    binding: Option<QueueBinding>,
    queue_ready: AtomicBool,
}

impl Queue {
    fn start(
        component: BrokerComponent,
        exclusive: bool,
        auto_deleted: bool,
        binding: Option<QueueBinding>,
    ) -> Arc<Queue> {
        let queue = Arc::new(Queue {
            component,
            exclusive,
            auto_deleted,
            binding,
            queue_ready: AtomicBool::new(false),
        });
        component::spawn_setup(queue.clone());
        queue
    }

    /// Creates a standalone queue on its own connection opened through
    /// `connector`.
    ///
    /// # Panics
    /// When called outside a tokio runtime, as every factory of this type
    /// asserts the queue on a spawned task.
    pub fn with_connector(
        connector: Arc<dyn Connector>,
        settings: &ConnectionSettings,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_deleted: bool,
    ) -> Arc<Queue> {
        Queue::start(
            BrokerComponent::init(connector, settings, name, durable),
            exclusive,
            auto_deleted,
            None,
        )
    }

    /// Creates a standalone queue on its own lapin connection and channel.
    ///
    /// # Parameters
    /// * `settings` - The broker to connect to
    /// * `name` - The queue name, or empty for a broker assigned one
    /// * `durable` - Whether the queue survives a broker restart
    /// * `exclusive` - Whether only this connection may use the queue
    /// * `auto_deleted` - Whether the broker deletes it once unused
    ///
    /// # Returns
    /// The queue, being asserted in the background
    pub fn factory(
        settings: &ConnectionSettings,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_deleted: bool,
    ) -> Arc<Queue> {
        Queue::with_connector(
            LapinConnector::shared(),
            settings,
            name,
            durable,
            exclusive,
            auto_deleted,
        )
    }

    /// A non-durable, non-exclusive queue that is not auto-deleted.
    pub fn factory_underlying_queue(settings: &ConnectionSettings, name: &str) -> Arc<Queue> {
        Queue::factory(settings, name, false, false, false)
    }

    /// A durable, non-exclusive queue that is not auto-deleted.
    pub fn factory_durable_instance(settings: &ConnectionSettings, name: &str) -> Arc<Queue> {
        Queue::factory(settings, name, true, false, false)
    }

    /// A durable, exclusive queue that is not auto-deleted.
    pub fn factory_durable_exclusive_instance(
        settings: &ConnectionSettings,
        name: &str,
    ) -> Arc<Queue> {
        Queue::factory(settings, name, true, true, false)
    }

    /// A queue bound to a fanout `exchange` with the empty routing key,
    /// reusing the exchange's channel.
    ///
    /// # Errors
    /// `ChannelNotReady` when the exchange's channel is not open.
    pub fn factory_fanout_exchange_subscriber(
        exchange: &Exchange,
        name: &str,
        durable: bool,
        auto_deleted: bool,
        exclusive: bool,
    ) -> Result<Arc<Queue>, AmqpError> {
        Queue::factory_exchange_subscriber_with_routing_keys_with_name(
            exchange,
            name,
            Vec::<String>::new(),
            durable,
            auto_deleted,
            exclusive,
        )
    }

    /// A broker named queue bound to `exchange` with every key of
    /// `routing_keys`. Best suited as a temporary direct or topic subscriber.
    pub fn factory_exchange_subscriber_with_routing_keys_auto_name(
        exchange: &Exchange,
        routing_keys: impl IntoIterator<Item = impl Into<String>>,
        durable: bool,
        auto_deleted: bool,
        exclusive: bool,
    ) -> Result<Arc<Queue>, AmqpError> {
        Queue::factory_exchange_subscriber_with_routing_keys_with_name(
            exchange,
            "",
            routing_keys,
            durable,
            auto_deleted,
            exclusive,
        )
    }

    /// A queue named `name` (broker named when empty) bound to `exchange`
    /// with every key of `routing_keys`, or with the empty key when there is
    /// none. The connection and channel of the exchange are reused.
    ///
    /// # Errors
    /// `ChannelNotReady` when the exchange's channel is not open.
    pub fn factory_exchange_subscriber_with_routing_keys_with_name(
        exchange: &Exchange,
        name: &str,
        routing_keys: impl IntoIterator<Item = impl Into<String>>,
        durable: bool,
        auto_deleted: bool,
        exclusive: bool,
    ) -> Result<Arc<Queue>, AmqpError> {
        let component = BrokerComponent::dependent_of(exchange.component(), name, durable)?;
        let binding = QueueBinding {
            exchange_name: exchange.name(),
            routing_keys: routing_keys.into_iter().map(Into::into).collect(),
        };
        debug!(
            durable,
            auto_deleted, exclusive, "factory an exchange subscriber queue"
        );

        Ok(Queue::start(component, exclusive, auto_deleted, Some(binding)))
    }

    /// Like [`Queue::factory`], resolving once the queue is asserted. A
    /// failed queue is closed before the error is returned.
    pub async fn async_factory(
        settings: &ConnectionSettings,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_deleted: bool,
    ) -> Result<Arc<Queue>, AmqpError> {
        Queue::factory(settings, name, durable, exclusive, auto_deleted)
            .settle()
            .await
    }

    pub async fn async_factory_underlying_queue(
        settings: &ConnectionSettings,
        name: &str,
    ) -> Result<Arc<Queue>, AmqpError> {
        Queue::factory_underlying_queue(settings, name).settle().await
    }

    pub async fn async_factory_durable_instance(
        settings: &ConnectionSettings,
        name: &str,
    ) -> Result<Arc<Queue>, AmqpError> {
        Queue::factory_durable_instance(settings, name).settle().await
    }

    pub async fn async_factory_durable_exclusive_instance(
        settings: &ConnectionSettings,
        name: &str,
    ) -> Result<Arc<Queue>, AmqpError> {
        Queue::factory_durable_exclusive_instance(settings, name)
            .settle()
            .await
    }

    pub async fn async_factory_fanout_exchange_subscriber(
        exchange: &Exchange,
        name: &str,
        durable: bool,
        auto_deleted: bool,
        exclusive: bool,
    ) -> Result<Arc<Queue>, AmqpError> {
        Queue::factory_fanout_exchange_subscriber(exchange, name, durable, auto_deleted, exclusive)?
            .settle()
            .await
    }

    pub async fn async_factory_exchange_subscriber_with_routing_keys_auto_name(
        exchange: &Exchange,
        routing_keys: impl IntoIterator<Item = impl Into<String>>,
        durable: bool,
        auto_deleted: bool,
        exclusive: bool,
    ) -> Result<Arc<Queue>, AmqpError> {
        Queue::factory_exchange_subscriber_with_routing_keys_auto_name(
            exchange,
            routing_keys,
            durable,
            auto_deleted,
            exclusive,
        )?
        .settle()
        .await
    }

    pub async fn async_factory_exchange_subscriber_with_routing_keys_with_name(
        exchange: &Exchange,
        name: &str,
        routing_keys: impl IntoIterator<Item = impl Into<String>>,
        durable: bool,
        auto_deleted: bool,
        exclusive: bool,
    ) -> Result<Arc<Queue>, AmqpError> {
        Queue::factory_exchange_subscriber_with_routing_keys_with_name(
            exchange,
            name,
            routing_keys,
            durable,
            auto_deleted,
            exclusive,
        )?
        .settle()
        .await
    }

    /// Waits for readiness and hands the queue back, closing it on failure.
    pub async fn settle(self: Arc<Self>) -> Result<Arc<Queue>, AmqpError> {
        match self.ready().await {
            Ok(()) => Ok(self),
            Err(err) => {
                let _ = self.close().await;
                Err(err)
            }
        }
    }

    /// Resolves once the queue is asserted and all its bindings completed.
    pub async fn ready(&self) -> Result<(), AmqpError> {
        self.component.ready().await
    }

    /// Resolves once the queue is dead or closed.
    pub async fn closed(&self) -> ComponentState {
        self.component.closed().await
    }

    /// Closes the queue. A subscriber leaves the channel it borrowed from
    /// its exchange open; only the exchange closes it.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.queue_ready.store(false, Ordering::SeqCst);
        self.component.close().await
    }

    pub fn component(&self) -> &BrokerComponent {
        &self.component
    }

    /// The queue name, which is broker assigned once a queue declared
    /// without a name is ready.
    pub fn name(&self) -> String {
        self.component.name()
    }

    pub fn is_durable(&self) -> bool {
        self.component.is_durable()
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_deleted(&self) -> bool {
        self.auto_deleted
    }

    /// Whether the queue was asserted and its channel is still alive.
    pub fn is_queue_ready(&self) -> bool {
        self.queue_ready.load(Ordering::SeqCst) && self.component.state() == ComponentState::Ready
    }

    /// The exchange this queue subscribes to, if any.
    pub fn exchange_name(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.exchange_name.as_str())
    }

    /// The keys the queue is bound with; `[""]` for a fanout subscriber and
    /// none for a standalone queue.
    pub fn routing_keys(&self) -> Vec<String> {
        self.binding
            .as_ref()
            .map(|b| b.keys().into_iter().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    /// The open channel, shared with the exchange for a subscriber.
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.component.channel()
    }

    async fn bind(&self, channel: &Arc<dyn BrokerChannel>, queue_name: &str) -> Result<(), AmqpError> {
        let Some(binding) = &self.binding else {
            return Ok(());
        };

        for routing_key in binding.keys() {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                queue_name, binding.exchange_name, routing_key
            );
            channel
                .queue_bind(queue_name, &binding.exchange_name, routing_key)
                .await?;
        }

        debug!("queue was bounded");
        Ok(())
    }
}

#[async_trait]
impl ComponentSetup for Queue {
    fn component(&self) -> &BrokerComponent {
        &self.component
    }

    async fn setup(&self, channel: &Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        let params = QueueParams {
            durable: self.component.is_durable(),
            exclusive: self.exclusive,
            auto_delete: self.auto_deleted,
        };

        let declared = match channel.queue_declare(&self.name(), params).await {
            Err(err) => {
                error!(error = err.to_string(), name = self.name(), "failure to declare queue");
                Err(err)
            }
            Ok(declared) => {
                info!(name = declared, "queue was created");
                Ok(declared)
            }
        }?;

        // broker assigned name when the queue was declared without one
        self.component.set_name(&declared);

        self.bind(channel, &declared).await?;
        self.queue_ready.store(true, Ordering::SeqCst);

        Ok(())
    }
}
