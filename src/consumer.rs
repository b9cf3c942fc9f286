// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! A [`MessageConsumer`] registers itself on the channel of a [`Queue`] and
//! hands every accepted delivery to a [`MessageListener`]. Deliveries are
//! handled one at a time, in the order the broker sends them: the prefetch
//! bound is set to one before the consumer is usable.
//!
//! Acknowledgement policy:
//! - a delivery whose type is not listened to is acknowledged and dropped;
//! - a handled delivery is acknowledged;
//! - a delivery the listener failed on is negatively acknowledged, and
//!   requeued only when the consumer was built with `retry`.
//!
//! With `auto_ack` the broker considers messages delivered as soon as they
//! are sent, so neither ack nor nack is issued.

use crate::{
    channel::{BrokerChannel, BrokerEvent, Delivery, DeliveryStream, EventSender},
    errors::AmqpError,
    message_listener::MessageListener,
    otel,
    queue::Queue,
};
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, RwLock,
    },
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Unacknowledged deliveries a consumer holds at most
pub const DEFAULT_PREFETCH_COUNT: u16 = 1;

/// Consumes the deliveries of one queue.
pub struct MessageConsumer {
    queue: Arc<Queue>,
    channel: Arc<dyn BrokerChannel>,
    events: EventSender,
    auto_ack: bool,
    retry: bool,
    prefetch_count: u16,
    message_types: RwLock<HashSet<String>>,
    tag: Mutex<Option<String>>,
    consuming: AtomicBool,
    ready: AtomicBool,
    closed: AtomicBool,
    label: String,
}

impl MessageConsumer {
    /// Creates a consumer over `queue` once the queue is ready and the
    /// prefetch bound of its channel is set.
    ///
    /// # Parameters
    /// * `queue` - The queue to consume from
    /// * `auto_ack` - Whether the broker settles deliveries on sending
    /// * `retry` - Whether a failed delivery is requeued rather than dropped
    /// * `label` - Prefix of the consumer tag and log label; the queue name
    ///   is used when empty
    ///
    /// # Errors
    /// The queue setup failure, or `QoSDeclarationError` when the prefetch
    /// bound cannot be set. There is no degraded mode: the caller must give
    /// up on this queue.
    pub async fn factory(
        queue: Arc<Queue>,
        auto_ack: bool,
        retry: bool,
        label: &str,
    ) -> Result<Arc<MessageConsumer>, AmqpError> {
        queue.ready().await?;

        let shared = queue
            .component()
            .shared_channel()
            .filter(|s| s.channel.is_open())
            .ok_or_else(|| AmqpError::ChannelNotReady(queue.name()))?;

        let consumer = MessageConsumer {
            queue,
            channel: shared.channel,
            events: shared.events,
            auto_ack,
            retry,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            message_types: RwLock::new(HashSet::new()),
            tag: Mutex::new(None),
            consuming: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            label: label.to_owned(),
        };
        consumer.equalize_message_distribution().await?;

        Ok(Arc::new(consumer))
    }

    async fn equalize_message_distribution(&self) -> Result<(), AmqpError> {
        if let Err(err) = self.channel.basic_qos(self.prefetch_count).await {
            error!(
                error = err.to_string(),
                label = self.label,
                "failure to set the prefetch count"
            );
            return Err(match err {
                AmqpError::QoSDeclarationError(_) => err,
                other => AmqpError::QoSDeclarationError(other.to_string()),
            });
        }

        info!(label = self.label, "QOS set to: {}", self.prefetch_count);
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Consumes every message type.
    pub async fn receive_all(
        self: &Arc<Self>,
        listener: Arc<dyn MessageListener>,
    ) -> Result<String, AmqpError> {
        self.receive_for(listener).await
    }

    /// Consumes only the messages whose type is one of `message_types`.
    /// An empty list accepts every type.
    pub async fn receive_only(
        self: &Arc<Self>,
        message_types: impl IntoIterator<Item = impl Into<String>>,
        listener: Arc<dyn MessageListener>,
    ) -> Result<String, AmqpError> {
        {
            let mut types = match self.message_types.write() {
                Ok(types) => types,
                Err(poisoned) => poisoned.into_inner(),
            };
            *types = message_types.into_iter().map(Into::into).collect();
        }

        self.receive_for(listener).await
    }

    /// Registers the consumer on the broker and starts handing deliveries to
    /// `listener`, one at a time.
    ///
    /// # Returns
    /// The consumer tag
    ///
    /// # Errors
    /// `ComponentClosed` after [`MessageConsumer::close`], and
    /// `BindingConsumerError` when already consuming or refused by the broker.
    pub async fn receive_for(
        self: &Arc<Self>,
        listener: Arc<dyn MessageListener>,
    ) -> Result<String, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ComponentClosed(self.label.clone()));
        }
        if self.is_consuming() {
            return Err(AmqpError::BindingConsumerError(format!(
                "consumer `{}` is already registered",
                self.label
            )));
        }

        let queue_name = self.queue.name();
        let tag = format!("{}-{}", self.label_or_queue(&queue_name), Uuid::new_v4());
        let registration = self
            .channel
            .basic_consume(&queue_name, &tag, self.auto_ack)
            .await?;

        *self.tag_slot() = Some(registration.consumer_tag.clone());
        self.consuming.store(true, Ordering::SeqCst);
        info!(
            queue = queue_name,
            tag = registration.consumer_tag,
            "register message listener success"
        );

        tokio::spawn(self.clone().consume_loop(registration.deliveries, listener));

        Ok(registration.consumer_tag)
    }

    async fn consume_loop(
        self: Arc<Self>,
        mut deliveries: DeliveryStream,
        listener: Arc<dyn MessageListener>,
    ) {
        let tracer = global::tracer(otel::CONSUMER_TRACER);

        while let Some(result) = deliveries.next().await {
            match result {
                Ok(delivery) => {
                    if let Err(err) = self
                        .handle_delivery(&tracer, &delivery, listener.as_ref())
                        .await
                    {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }
                Err(err) => {
                    error!(error = err.to_string(), "consumer stream failure");
                    break;
                }
            }
        }

        self.consuming.store(false, Ordering::SeqCst);
        if self.is_closed() {
            debug!(label = self.label, "consumer stopped");
            return;
        }

        warn!(
            label = self.label,
            "consumer was cancelled remotely, shutting down"
        );
        let reason = format!("consumer of `{}` was cancelled", self.queue.name());
        let _ = self.events.send(BrokerEvent::ChannelClosed(reason));
    }

    /// Filters, dispatches and settles a single delivery.
    pub(crate) async fn handle_delivery(
        &self,
        tracer: &BoxedTracer,
        delivery: &Delivery,
        listener: &dyn MessageListener,
    ) -> Result<(), AmqpError> {
        let kind = delivery.kind().unwrap_or_default();
        let (_ctx, mut span) = otel::consumer_span(&delivery.properties, tracer, kind);

        debug!("received: {} - exchange: {}", kind, delivery.exchange);

        if !self.is_target_message_type(delivery.kind()) {
            debug!("removing message from queue - reason: not listened type");
            span.set_status(Status::Ok);
            return self.ack(delivery.delivery_tag, &mut span).await;
        }

        let handled = listener
            .handle_message(
                delivery.kind(),
                delivery.message_id(),
                delivery.timestamp(),
                &delivery.data,
                delivery.delivery_tag,
                delivery.redelivered,
            )
            .await;

        match handled {
            Ok(()) => {
                debug!("message successfully processed");
                span.set_status(Status::Ok);
                self.ack(delivery.delivery_tag, &mut span).await
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    requeue = self.retry,
                    "exception on handle delivery"
                );
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
                self.nack(delivery.delivery_tag, &mut span).await
            }
        }
    }

    async fn ack(&self, delivery_tag: u64, span: &mut BoxedSpan) -> Result<(), AmqpError> {
        if self.auto_ack {
            return Ok(());
        }

        match self.channel.basic_ack(delivery_tag).await {
            Ok(()) => {
                debug!(delivery_tag, "ACK handle message success");
                Ok(())
            }
            Err(err) => {
                error!("error whiling ack msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(AmqpError::AckMessageError)
            }
        }
    }

    async fn nack(&self, delivery_tag: u64, span: &mut BoxedSpan) -> Result<(), AmqpError> {
        if self.auto_ack {
            return Ok(());
        }

        match self.channel.basic_nack(delivery_tag, self.retry).await {
            Ok(()) => {
                debug!(delivery_tag, requeue = self.retry, "NACK message");
                Ok(())
            }
            Err(err) => {
                error!("error whiling nack msg");
                span.record_error(&err);
                Err(AmqpError::NackMessageError)
            }
        }
    }

    /// Whether a delivery of type `kind` is for this consumer. Everything is
    /// when no type was listed; an untyped delivery is not otherwise.
    pub fn is_target_message_type(&self, kind: Option<&str>) -> bool {
        let types = match self.message_types.read() {
            Ok(types) => types,
            Err(poisoned) => poisoned.into_inner(),
        };

        if types.is_empty() {
            return true;
        }
        kind.is_some_and(|k| types.contains(k))
    }

    /// Stops consuming and closes the queue. A consumer that never consumed
    /// only closes the queue.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ready.store(false, Ordering::SeqCst);

        let tag = self.tag_slot().take();
        if self.is_consuming() {
            if let Some(tag) = tag {
                self.stop_consuming(&tag).await;
            }
        }

        self.queue.close().await
    }

    async fn stop_consuming(&self, tag: &str) {
        if !self.channel.is_open() {
            debug!(tag, "channel already closed, nothing to cancel");
            return;
        }

        match self.channel.basic_cancel(tag).await {
            Ok(()) => debug!(tag, "consumer cancelled"),
            Err(err) => error!(error = err.to_string(), tag, "failure to cancel consumer"),
        }
    }

    fn tag_slot(&self) -> MutexGuard<'_, Option<String>> {
        match self.tag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn label_or_queue<'a>(&'a self, queue_name: &'a str) -> &'a str {
        if self.label.is_empty() {
            return queue_name;
        }
        &self.label
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// The broker consumer tag, while consuming
    pub fn tag(&self) -> Option<String> {
        self.tag_slot().clone()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The accepted message types; empty accepts every type.
    pub fn message_types(&self) -> HashSet<String> {
        match self.message_types.read() {
            Ok(types) => types.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Unacknowledged deliveries the broker sends ahead, always 1
    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count
    }

    pub fn is_auto_acknowledge(&self) -> bool {
        self.auto_ack
    }

    /// Whether a failed delivery is requeued
    pub fn is_retry(&self) -> bool {
        self.retry
    }

    /// Whether the prefetch bound is set
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
