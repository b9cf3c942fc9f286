// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides the exchange types and the [`Exchange`] component.
//! Exchanges are the routing mechanism of the broker: they receive published
//! messages and forward them to the bound queues according to their type.
//!
//! An `Exchange` opens its own connection and channel, asserts the exchange
//! once the channel is open and owns both until it is closed. Queues that
//! subscribe to it reuse that channel.

use crate::{
    channel::{BrokerChannel, Connector, ExchangeParams, LapinConnector},
    component::{self, BrokerComponent, ComponentSetup, ComponentState},
    errors::AmqpError,
    publisher::{self, OutboundMessage},
    settings::ConnectionSettings,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{error, info};

/// Represents the types of exchanges understood by the broker.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - Match: Header matching exchange declared under its legacy `match` name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    Match,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Match => "match",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Match => lapin::ExchangeKind::Custom(kind.as_str().to_owned()),
        }
    }
}

/// A broker exchange asserted on a channel this component owns.
pub struct Exchange {
    component: BrokerComponent,
    kind: ExchangeKind,
    auto_delete: bool,
    exchange_ready: AtomicBool,
}

impl Exchange {
    /// Creates the exchange and starts asserting it through `connector`.
    ///
    /// The returned exchange is not ready yet: await [`Exchange::ready`] or
    /// use one of the `async_` factories.
    ///
    /// # Panics
    /// When called outside a tokio runtime, as the assertion runs on a
    /// spawned task.
    pub fn with_connector(
        connector: Arc<dyn Connector>,
        settings: &ConnectionSettings,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
    ) -> Arc<Exchange> {
        let exchange = Arc::new(Exchange {
            component: BrokerComponent::init(connector, settings, name, durable),
            kind,
            auto_delete,
            exchange_ready: AtomicBool::new(false),
        });
        component::spawn_setup(exchange.clone());
        exchange
    }

    /// Creates an exchange on its own lapin connection and channel.
    ///
    /// # Parameters
    /// * `settings` - The broker to connect to
    /// * `name` - The name of the exchange
    /// * `kind` - The exchange type
    /// * `durable` - Whether the exchange survives a broker restart
    /// * `auto_delete` - Whether the broker deletes it once unbound
    ///
    /// # Returns
    /// The exchange, being asserted in the background
    ///
    /// # Panics
    /// When called outside a tokio runtime.
    pub fn factory(
        settings: &ConnectionSettings,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
    ) -> Arc<Exchange> {
        Exchange::with_connector(
            LapinConnector::shared(),
            settings,
            name,
            kind,
            durable,
            auto_delete,
        )
    }

    /// [`Exchange::factory`] for a direct exchange.
    pub fn direct_instance(
        settings: &ConnectionSettings,
        name: &str,
        durable: bool,
        auto_delete: bool,
    ) -> Arc<Exchange> {
        Exchange::factory(settings, name, ExchangeKind::Direct, durable, auto_delete)
    }

    /// [`Exchange::factory`] for a fanout exchange.
    pub fn fanout_instance(
        settings: &ConnectionSettings,
        name: &str,
        durable: bool,
        auto_delete: bool,
    ) -> Arc<Exchange> {
        Exchange::factory(settings, name, ExchangeKind::Fanout, durable, auto_delete)
    }

    /// [`Exchange::factory`] for a headers exchange.
    pub fn header_instance(
        settings: &ConnectionSettings,
        name: &str,
        durable: bool,
        auto_delete: bool,
    ) -> Arc<Exchange> {
        Exchange::factory(settings, name, ExchangeKind::Headers, durable, auto_delete)
    }

    /// Like [`Exchange::factory`], resolving once the broker acknowledged the
    /// assertion. A failed exchange is closed before the error is returned.
    pub async fn async_factory(
        settings: &ConnectionSettings,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
    ) -> Result<Arc<Exchange>, AmqpError> {
        Exchange::factory(settings, name, kind, durable, auto_delete)
            .settle()
            .await
    }

    pub async fn async_direct_instance(
        settings: &ConnectionSettings,
        name: &str,
        durable: bool,
        auto_delete: bool,
    ) -> Result<Arc<Exchange>, AmqpError> {
        Exchange::direct_instance(settings, name, durable, auto_delete)
            .settle()
            .await
    }

    pub async fn async_fanout_instance(
        settings: &ConnectionSettings,
        name: &str,
        durable: bool,
        auto_delete: bool,
    ) -> Result<Arc<Exchange>, AmqpError> {
        Exchange::fanout_instance(settings, name, durable, auto_delete)
            .settle()
            .await
    }

    pub async fn async_header_instance(
        settings: &ConnectionSettings,
        name: &str,
        durable: bool,
        auto_delete: bool,
    ) -> Result<Arc<Exchange>, AmqpError> {
        Exchange::header_instance(settings, name, durable, auto_delete)
            .settle()
            .await
    }

    /// Waits for readiness and hands the exchange back, closing it on
    /// failure so that no connection is leaked.
    pub async fn settle(self: Arc<Self>) -> Result<Arc<Exchange>, AmqpError> {
        match self.ready().await {
            Ok(()) => Ok(self),
            Err(err) => {
                let _ = self.close().await;
                Err(err)
            }
        }
    }

    /// Resolves once the broker acknowledged the assertion.
    ///
    /// # Errors
    /// The assertion failure, `ChannelClosed` when the broker closed the
    /// channel, `ComponentClosed` when closed first.
    pub async fn ready(&self) -> Result<(), AmqpError> {
        self.component.ready().await
    }

    /// Resolves once the exchange is dead or closed.
    pub async fn closed(&self) -> ComponentState {
        self.component.closed().await
    }

    /// Closes the channel and then the connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.exchange_ready.store(false, Ordering::SeqCst);
        self.component.close().await
    }

    /// Publishes `message` on this exchange's channel.
    ///
    /// # Returns
    /// The message id the message was sent with
    pub async fn publish(
        &self,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<String, AmqpError> {
        let channel = self
            .component
            .channel()
            .ok_or_else(|| AmqpError::ChannelNotReady(self.name()))?;

        publisher::publish(channel.as_ref(), &self.name(), routing_key, message).await
    }

    pub fn component(&self) -> &BrokerComponent {
        &self.component
    }

    pub fn name(&self) -> String {
        self.component.name()
    }

    /// The exchange type it was asserted with
    pub fn exchange_type(&self) -> ExchangeKind {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.component.is_durable()
    }

    /// Whether the broker deletes the exchange once no queue is bound to it
    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    /// Whether the exchange was asserted and its channel is still alive.
    pub fn is_exchange_ready(&self) -> bool {
        self.exchange_ready.load(Ordering::SeqCst) && self.component.state() == ComponentState::Ready
    }

    /// The open channel, which subscriber queues share.
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.component.channel()
    }
}

#[async_trait]
impl ComponentSetup for Exchange {
    fn component(&self) -> &BrokerComponent {
        &self.component
    }

    async fn setup(&self, channel: &Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        let name = self.name();
        info!(name, kind = self.kind.as_str(), "setup exchange start");

        let params = ExchangeParams {
            kind: self.kind,
            durable: self.component.is_durable(),
            auto_delete: self.auto_delete,
        };
        if let Err(err) = channel.exchange_declare(&name, params).await {
            error!(
                error = err.to_string(),
                name, "error to declare the exchange"
            );
            return Err(err);
        }

        info!(name, "declare exchange successfully");
        self.exchange_ready.store(true, Ordering::SeqCst);

        Ok(())
    }
}
