// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Listener
//!
//! An [`ExchangeListener`] assembles the whole subscriber pipeline of an
//! application component: it asserts an [`Exchange`], asserts and binds a
//! [`Queue`] on the exchange's channel, then registers a [`MessageConsumer`]
//! whose deliveries go through an idempotency check before reaching the
//! application.
//!
//! The application side is an [`EventListener`]: it names the exchange and
//! the queue, lists the message types it listens to and handles the
//! filtered notifications.
//!
//! ```text
//! Idle -> ExchangeAsserting -> QueueAsserting -> ConsumerRegistering -> Ready
//!                 \________________ any failure ________________/
//!                                     Error
//! ```
//!
//! [`ExchangeListener::stop`] may be called in any state: whatever part of
//! the pipeline exists is closed, including parts still being set up.

use crate::{
    channel::{Connector, LapinConnector},
    component::ComponentState,
    consumer::MessageConsumer,
    errors::AmqpError,
    exchange::{Exchange, ExchangeKind},
    message_listener::MessageListener,
    queue::Queue,
    settings::ConnectionSettings,
    tracker::EventHandlingTracker,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A message that passed the type filter and the idempotency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNotification {
    pub kind: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the epoch
    pub timestamp: Option<u64>,
    /// Message body, decoded as UTF-8
    pub message: String,
    pub delivery_tag: u64,
    pub is_redelivery: bool,
}

/// The application side of an [`ExchangeListener`].
#[async_trait]
pub trait EventListener: Send + Sync + 'static {
    /// Name of the exchange I listen to.
    fn exchange_name(&self) -> &str;

    /// Name of the queue I consume.
    fn queue_name(&self) -> &str;

    /// Message types I listen to; other types are acknowledged and dropped.
    fn listen_to(&self) -> Vec<String>;

    /// Keys to bind the queue with, when they differ from
    /// [`listen_to`](Self::listen_to).
    fn queue_routing_keys(&self) -> Option<Vec<String>> {
        None
    }

    /// Handles a message that was not handled before. An error leaves the
    /// message unmarked and negatively acknowledged.
    async fn filtered_dispatch(&self, notification: EventNotification) -> Result<(), AmqpError>;
}

/// Topology and delivery options of a listener.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ListenerOptions {
    pub exchange_durable: bool,
    pub exchange_auto_delete: bool,
    pub exchange_kind: ExchangeKind,
    pub queue_durable: bool,
    pub queue_auto_deleted: bool,
    pub queue_exclusive: bool,
    pub auto_ack: bool,
    pub retry: bool,
    pub label: String,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        ListenerOptions {
            exchange_durable: true,
            exchange_auto_delete: false,
            exchange_kind: ExchangeKind::default(),
            queue_durable: true,
            queue_auto_deleted: false,
            queue_exclusive: true,
            auto_ack: false,
            retry: false,
            label: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    ExchangeAsserting,
    QueueAsserting,
    ConsumerRegistering,
    Ready,
    Error(AmqpError),
    Stopped,
}

impl ListenerState {
    fn is_settled(&self) -> bool {
        matches!(
            self,
            ListenerState::Ready | ListenerState::Error(_) | ListenerState::Stopped
        )
    }
}

#[derive(Default)]
struct Pipeline {
    exchange: Option<Arc<Exchange>>,
    queue: Option<Arc<Queue>>,
    consumer: Option<Arc<MessageConsumer>>,
}

/// Subscriber pipeline of one [`EventListener`].
pub struct ExchangeListener<L: EventListener> {
    settings: ConnectionSettings,
    options: ListenerOptions,
    connector: Arc<dyn Connector>,
    listener: Arc<L>,
    tracker: Arc<dyn EventHandlingTracker>,
    pipeline: Mutex<Pipeline>,
    state: watch::Sender<ListenerState>,
}

impl<L: EventListener> ExchangeListener<L> {
    pub fn new(
        settings: &ConnectionSettings,
        listener: L,
        tracker: Arc<dyn EventHandlingTracker>,
        options: ListenerOptions,
    ) -> Arc<ExchangeListener<L>> {
        ExchangeListener::with_connector(LapinConnector::shared(), settings, listener, tracker, options)
    }

    pub fn with_connector(
        connector: Arc<dyn Connector>,
        settings: &ConnectionSettings,
        listener: L,
        tracker: Arc<dyn EventHandlingTracker>,
        options: ListenerOptions,
    ) -> Arc<ExchangeListener<L>> {
        Arc::new(ExchangeListener {
            settings: settings.clone(),
            options,
            connector,
            listener: Arc::new(listener),
            tracker,
            pipeline: Mutex::new(Pipeline::default()),
            state: watch::Sender::new(ListenerState::Idle),
        })
    }

    /// Starts assembling the pipeline in the background. Use
    /// [`wait_ready`](Self::wait_ready) or
    /// [`register_on_ready`](Self::register_on_ready) to learn the outcome.
    ///
    /// # Errors
    /// `InternalError` when the listener was already started.
    ///
    /// # Panics
    /// When called outside a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<(), AmqpError> {
        let started = self.state.send_if_modified(|state| {
            if *state != ListenerState::Idle {
                return false;
            }
            *state = ListenerState::ExchangeAsserting;
            true
        });

        if !started {
            return Err(AmqpError::InternalError(format!(
                "listener of `{}` was already started",
                self.listener.queue_name()
            )));
        }

        tokio::spawn(self.clone().run());
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let exchange = match self.attach_to_queue().await {
            Ok(exchange) => exchange,
            Err(err) => {
                self.fail(err);
                self.teardown().await;
                return;
            }
        };

        if let ComponentState::Dead(reason) = exchange.closed().await {
            self.fail(AmqpError::ChannelClosed(reason));
            self.teardown().await;
        }
    }

    async fn attach_to_queue(&self) -> Result<Arc<Exchange>, AmqpError> {
        let exchange = Exchange::with_connector(
            self.connector.clone(),
            &self.settings,
            self.listener.exchange_name(),
            self.options.exchange_kind,
            self.options.exchange_durable,
            self.options.exchange_auto_delete,
        );
        self.attach(|pipeline| pipeline.exchange = Some(exchange.clone()))?;
        exchange.ready().await?;
        self.advance(ListenerState::QueueAsserting)?;

        let routing_keys = self
            .listener
            .queue_routing_keys()
            .unwrap_or_else(|| self.listener.listen_to());
        let queue = Queue::factory_exchange_subscriber_with_routing_keys_with_name(
            &exchange,
            self.listener.queue_name(),
            routing_keys,
            self.options.queue_durable,
            self.options.queue_auto_deleted,
            self.options.queue_exclusive,
        )?;
        self.attach(|pipeline| pipeline.queue = Some(queue.clone()))?;
        queue.ready().await?;
        self.advance(ListenerState::ConsumerRegistering)?;

        info!(
            label = self.options.label,
            "Queue declaring finished, now register consumer"
        );
        let consumer = MessageConsumer::factory(
            queue,
            self.options.auto_ack,
            self.options.retry,
            &self.options.label,
        )
        .await?;
        self.attach(|pipeline| pipeline.consumer = Some(consumer.clone()))?;

        let dispatch = Arc::new(IdempotentDispatch {
            listener: self.listener.clone(),
            tracker: self.tracker.clone(),
        });
        consumer.receive_only(self.listener.listen_to(), dispatch).await?;

        self.advance(ListenerState::Ready)?;
        info!(
            label = self.options.label,
            "Message Consumer registered successfully"
        );

        Ok(exchange)
    }

    /// Stores a piece of the pipeline. A piece built after a stop is still
    /// stored, for the teardown that follows to close it.
    fn attach(&self, store: impl FnOnce(&mut Pipeline)) -> Result<(), AmqpError> {
        let mut pipeline = self.pipeline();
        store(&mut pipeline);

        if *self.state.borrow() == ListenerState::Stopped {
            return Err(AmqpError::ListenerStopped(self.listener.queue_name().to_owned()));
        }
        Ok(())
    }

    fn advance(&self, next: ListenerState) -> Result<(), AmqpError> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if matches!(state, ListenerState::Stopped | ListenerState::Error(_)) {
                result = Err(AmqpError::ListenerStopped(
                    self.listener.queue_name().to_owned(),
                ));
                return false;
            }
            debug!(from = ?state, to = ?next, "listener state");
            *state = next;
            true
        });
        result
    }

    fn fail(&self, err: AmqpError) {
        let reported = self.state.send_if_modified(|state| {
            if *state == ListenerState::Stopped {
                return false;
            }
            *state = ListenerState::Error(err.clone());
            true
        });

        if reported {
            error!(
                error = err.to_string(),
                exchange = self.listener.exchange_name(),
                queue = self.listener.queue_name(),
                "listener failure"
            );
        }
    }

    async fn teardown(&self) {
        let pipeline = std::mem::take(&mut *self.pipeline());
        if let Err(err) = close_pipeline(pipeline).await {
            warn!(error = err.to_string(), "failure to release the listener pipeline");
        }
    }

    /// Stops consuming and closes the consumer, the queue and the exchange,
    /// whatever state the listener is in.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        let pipeline = {
            let mut pipeline = self.pipeline();
            self.state.send_replace(ListenerState::Stopped);
            std::mem::take(&mut *pipeline)
        };
        info!(label = self.options.label, "stopping listener");

        close_pipeline(pipeline).await
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.stop().await
    }

    /// Waits until the pipeline is ready.
    ///
    /// # Errors
    /// The assembly failure, or `ListenerStopped` when stopped first.
    pub async fn wait_ready(&self) -> Result<(), AmqpError> {
        let mut receiver = self.state.subscribe();
        let state = match receiver.wait_for(ListenerState::is_settled).await {
            Ok(state) => (*state).clone(),
            Err(_) => ListenerState::Stopped,
        };

        match state {
            ListenerState::Ready => Ok(()),
            ListenerState::Error(err) => Err(err),
            _ => Err(AmqpError::ListenerStopped(
                self.listener.queue_name().to_owned(),
            )),
        }
    }

    /// Calls `callback` once the pipeline is ready, also when it already
    /// is. The callback is dropped if the listener fails or stops first.
    ///
    /// # Panics
    /// When called outside a tokio runtime.
    pub fn register_on_ready<F>(self: &Arc<Self>, callback: F)
    where
        F: FnOnce(Arc<ExchangeListener<L>>) + Send + 'static,
    {
        let listener = Arc::downgrade(self);
        let mut receiver = self.state.subscribe();

        tokio::spawn(async move {
            let ready = receiver
                .wait_for(ListenerState::is_settled)
                .await
                .map(|state| *state == ListenerState::Ready)
                .unwrap_or(false);

            if let Some(listener) = listener.upgrade().filter(|_| ready) {
                callback(listener);
            }
        });
    }

    fn pipeline(&self) -> MutexGuard<'_, Pipeline> {
        match self.pipeline.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> ListenerState {
        (*self.state.borrow()).clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.state.borrow() == ListenerState::Ready
    }

    pub fn is_ready_for_consuming(&self) -> bool {
        self.pipeline()
            .consumer
            .as_ref()
            .is_some_and(|consumer| consumer.is_consuming())
    }

    pub fn exchange(&self) -> Option<Arc<Exchange>> {
        self.pipeline().exchange.clone()
    }

    pub fn queue(&self) -> Option<Arc<Queue>> {
        self.pipeline().queue.clone()
    }

    pub fn message_consumer(&self) -> Option<Arc<MessageConsumer>> {
        self.pipeline().consumer.clone()
    }

    pub fn listener(&self) -> &Arc<L> {
        &self.listener
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.options
    }
}

async fn close_pipeline(pipeline: Pipeline) -> Result<(), AmqpError> {
    let mut result = Ok(());

    if let Some(consumer) = pipeline.consumer {
        result = result.and(consumer.close().await);
    }
    if let Some(queue) = pipeline.queue {
        result = result.and(queue.close().await);
    }
    if let Some(exchange) = pipeline.exchange {
        result = result.and(exchange.close().await);
    }

    result
}

/// Hands a delivery to the application only when its id was not handled
/// yet, and marks it handled afterwards.
struct IdempotentDispatch<L> {
    listener: Arc<L>,
    tracker: Arc<dyn EventHandlingTracker>,
}

#[async_trait]
impl<L: EventListener> MessageListener for IdempotentDispatch<L> {
    async fn handle_message(
        &self,
        kind: Option<&str>,
        message_id: Option<&str>,
        timestamp: Option<u64>,
        body: &[u8],
        delivery_tag: u64,
        is_redelivery: bool,
    ) -> Result<(), AmqpError> {
        let notification = EventNotification {
            kind: kind.map(str::to_owned),
            message_id: message_id.map(str::to_owned),
            timestamp,
            message: String::from_utf8_lossy(body).into_owned(),
            delivery_tag,
            is_redelivery,
        };

        let Some(message_id) = message_id else {
            warn!(delivery_tag, "message without id, dispatching it untracked");
            return self.listener.filtered_dispatch(notification).await;
        };

        if self.tracker.check_if_notif_handled(message_id).await? {
            debug!(message_id, "message already handled");
            return Ok(());
        }

        self.listener.filtered_dispatch(notification).await?;
        self.tracker.mark_notif_as_handled(message_id).await
    }
}
