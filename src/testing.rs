// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker behind the driver traits, so that components can be
//! exercised without a running RabbitMQ.
//!
//! It routes direct, fanout and topic exchanges (headers and match exchanges
//! deliver to every binding), keeps the unacknowledged deliveries of each
//! channel within its prefetch count, requeues nacked and orphaned
//! deliveries as redelivered at the head of their queue, and closes a
//! channel the way the broker does on a conflicting redeclaration.

use crate::{
    channel::{
        BrokerChannel, BrokerConnection, BrokerEvent, ConsumerRegistration, Connector, Delivery,
        EventSender, ExchangeParams, QueueParams,
    },
    errors::AmqpError,
    exchange::ExchangeKind,
    settings::ConnectionSettings,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Notify};

/// What a publisher sent, as seen by the broker.
#[derive(Debug, Clone)]
pub(crate) struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub payload: Vec<u8>,
}

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

struct ConsumerSlot {
    tag: String,
    channel: u64,
    no_ack: bool,
    sender: DeliverySender,
}

#[derive(Default)]
struct QueueSlot {
    pending: VecDeque<Delivery>,
    consumer: Option<ConsumerSlot>,
}

struct ChannelSlot {
    connection: u64,
    open: bool,
    events: EventSender,
    /// 0 until `basic.qos`, meaning unlimited
    prefetch: u16,
}

struct Unacked {
    queue: String,
    channel: u64,
    delivery: Delivery,
}

#[derive(Default)]
struct BrokerState {
    refuse_connections: bool,
    next_id: u64,
    next_delivery_tag: u64,
    exchanges: HashMap<String, ExchangeParams>,
    queues: HashMap<String, QueueSlot>,
    bindings: Vec<(String, String, String)>,
    channels: HashMap<u64, ChannelSlot>,
    unacked: HashMap<u64, Unacked>,
    connections_opened: usize,
    connections_closed: usize,
    channels_opened: usize,
    channels_closed: usize,
    acks: Vec<u64>,
    nacks: Vec<(u64, bool)>,
    qos: Vec<u16>,
    cancelled: Vec<String>,
    published: Vec<PublishedMessage>,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_open(&self, channel: u64) -> bool {
        self.channels.get(&channel).is_some_and(|slot| slot.open)
    }

    /// Closes `channel`, dropping its consumers and requeueing what it left
    /// unacknowledged. Answers where to report the closure, if it was open.
    fn close_channel(&mut self, channel: u64) -> Option<EventSender> {
        let slot = self.channels.get_mut(&channel)?;
        if !slot.open {
            return None;
        }
        slot.open = false;
        let events = slot.events.clone();
        self.channels_closed += 1;

        for queue in self.queues.values_mut() {
            if queue.consumer.as_ref().is_some_and(|c| c.channel == channel) {
                queue.consumer = None;
            }
        }

        let orphans: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in orphans {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }

        Some(events)
    }

    fn requeue(&mut self, unacked: Unacked) {
        let mut delivery = unacked.delivery;
        delivery.redelivered = true;
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            queue.pending.push_front(delivery);
        }
        self.dispatch(&unacked.queue);
    }

    fn enqueue(&mut self, queue_name: &str, delivery: Delivery) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        queue.pending.push_back(delivery);
        self.dispatch(queue_name);
    }

    /// Hands pending deliveries to the queue's consumer while its channel
    /// has room under the prefetch count.
    fn dispatch(&mut self, queue_name: &str) {
        while let Some(queue) = self.queues.get_mut(queue_name) {
            let Some(consumer) = &queue.consumer else {
                return;
            };
            let (channel, no_ack) = (consumer.channel, consumer.no_ack);

            if !no_ack {
                let prefetch = self.channels.get(&channel).map_or(0, |slot| slot.prefetch);
                let in_flight = self.unacked.values().filter(|u| u.channel == channel).count();
                if prefetch > 0 && in_flight >= usize::from(prefetch) {
                    return;
                }
            }

            let Some(mut delivery) = queue.pending.pop_front() else {
                return;
            };
            self.next_delivery_tag += 1;
            delivery.delivery_tag = self.next_delivery_tag;

            let sent = consumer.sender.send(Ok(delivery.clone())).is_ok();
            if !sent {
                queue.pending.push_front(delivery);
                queue.consumer = None;
                return;
            }

            if !no_ack {
                self.unacked.insert(
                    delivery.delivery_tag,
                    Unacked {
                        queue: queue_name.to_owned(),
                        channel,
                        delivery,
                    },
                );
            }
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str, delivery: Delivery) -> Result<(), AmqpError> {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else {
            let kind = self
                .exchanges
                .get(exchange)
                .map(|params| params.kind)
                .ok_or_else(|| AmqpError::PublishingError(format!("no exchange `{exchange}`")))?;

            let mut targets = Vec::new();
            for (queue, bound, key) in &self.bindings {
                if bound == exchange && routes(kind, key, routing_key) && !targets.contains(queue) {
                    targets.push(queue.clone());
                }
            }
            targets
        };

        for queue in targets {
            self.enqueue(&queue, delivery.clone());
        }
        Ok(())
    }
}

fn routes(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &words)
        }
        ExchangeKind::Fanout | ExchangeKind::Headers | ExchangeKind::Match => true,
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.split_first(), words.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_matches(rest, words) || (!words.is_empty() && topic_matches(pattern, &words[1..]))
        }
        (Some((&"*", rest)), Some((_, tail))) => topic_matches(rest, tail),
        (Some((p, rest)), Some((w, tail))) => p == w && topic_matches(rest, tail),
        _ => false,
    }
}

/// An operation held until the test resumes it.
#[derive(Default)]
struct Pause {
    reached: AtomicBool,
    resume: Notify,
}

#[derive(Clone, Default)]
pub(crate) struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    pauses: Arc<Mutex<HashMap<String, Arc<Pause>>>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    /// Holds every later `operation` (`queue.declare`, `basic.qos`...) until
    /// [`MemoryBroker::resume`].
    pub fn pause(&self, operation: &str) {
        self.pauses().insert(operation.to_owned(), Arc::default());
    }

    pub fn resume(&self, operation: &str) {
        if let Some(pause) = self.pauses().remove(operation) {
            pause.resume.notify_waiters();
            pause.resume.notify_one();
        }
    }

    /// Whether an `operation` is currently held.
    pub fn is_held(&self, operation: &str) -> bool {
        self.pauses()
            .get(operation)
            .is_some_and(|pause| pause.reached.load(Ordering::SeqCst))
    }

    async fn hold(&self, operation: &str) {
        let pause = self.pauses().get(operation).cloned();
        if let Some(pause) = pause {
            let resumed = pause.resume.notified();
            pause.reached.store(true, Ordering::SeqCst);
            resumed.await;
        }
    }

    fn pauses(&self) -> MutexGuard<'_, HashMap<String, Arc<Pause>>> {
        self.pauses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every later connection attempt fails.
    pub fn refuse_connections(&self) {
        self.state().refuse_connections = true;
    }

    /// Publishes with raw properties, bypassing any channel.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        let delivery = Delivery {
            delivery_tag: 0,
            redelivered: false,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            data: body.to_vec(),
        };
        self.state().route(exchange, routing_key, delivery)
    }

    /// Closes every open channel from the broker side with `reason`.
    pub fn close_channels(&self, reason: &str) {
        let closed: Vec<EventSender> = {
            let mut state = self.state();
            let ids: Vec<u64> = state.channels.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| state.close_channel(id))
                .collect()
        };

        for events in closed {
            let _ = events.send(BrokerEvent::ChannelClosed(reason.to_owned()));
        }
    }

    /// Cancels the consumer of `queue` from the broker side.
    pub fn cancel_consumers(&self, queue: &str) {
        if let Some(slot) = self.state().queues.get_mut(queue) {
            slot.consumer = None;
        }
    }

    pub fn delete_exchange(&self, name: &str) {
        let mut state = self.state();
        state.exchanges.remove(name);
        state.bindings.retain(|(_, exchange, _)| exchange != name);
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.state().queues.keys().cloned().collect()
    }

    pub fn pending(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|slot| slot.pending.len())
            .unwrap_or_default()
    }

    /// `(queue, exchange, routing key)` in binding order.
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.state().bindings.clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.state().acks.clone()
    }

    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.state().nacks.clone()
    }

    pub fn qos(&self) -> Vec<u16> {
        self.state().qos.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state().cancelled.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    pub fn connections_closed(&self) -> usize {
        self.state().connections_closed
    }

    pub fn channels_opened(&self) -> usize {
        self.state().channels_opened
    }

    pub fn channels_closed(&self) -> usize {
        self.state().channels_closed
    }

    /// Polls `check` for about a second, for effects of background tasks.
    pub async fn eventually(&self, check: impl Fn(&MemoryBroker) -> bool) -> bool {
        for _ in 0..200 {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check(self)
    }
}

struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
        events: EventSender,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.broker.state();
        if state.refuse_connections {
            return Err(AmqpError::ConnectionError(format!(
                "connection refused: {}",
                settings.to_url()
            )));
        }

        let id = state.next_id();
        state.connections_opened += 1;

        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            id,
            events,
            connected: AtomicBool::new(true),
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    events: EventSender,
    connected: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.is_connected() {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let mut state = self.broker.state();
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelSlot {
                connection: self.id,
                open: true,
                events: self.events.clone(),
                prefetch: 0,
            },
        );
        state.channels_opened += 1;

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut state = self.broker.state();
        state.connections_closed += 1;
        let ids: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, slot)| slot.connection == self.id)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            state.close_channel(id);
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

impl MemoryChannel {
    fn open_state(&self, err: AmqpError) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        let state = self.broker.state();
        if !state.is_open(self.id) {
            return Err(err);
        }
        Ok(state)
    }

    fn closed(what: &str) -> AmqpError {
        AmqpError::ChannelError(format!("{what} on a closed channel"))
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn exchange_declare(&self, name: &str, params: ExchangeParams) -> Result<(), AmqpError> {
        let mut state = self.open_state(MemoryChannel::closed("exchange.declare"))?;

        let conflicting = state
            .exchanges
            .get(name)
            .is_some_and(|existing| *existing != params);
        if !conflicting {
            state.exchanges.insert(name.to_owned(), params);
            return Ok(());
        }

        let events = state.close_channel(self.id);
        drop(state);
        if let Some(events) = events {
            let _ = events.send(BrokerEvent::ChannelClosed(format!(
                "PRECONDITION_FAILED - inequivalent arg for exchange '{name}'"
            )));
        }
        Err(AmqpError::DeclareExchangeError(name.to_owned()))
    }

    async fn queue_declare(&self, name: &str, _params: QueueParams) -> Result<String, AmqpError> {
        self.broker.hold("queue.declare").await;
        let mut state = self.open_state(MemoryChannel::closed("queue.declare"))?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", state.next_id())
        } else {
            name.to_owned()
        };
        state.queues.entry(name.clone()).or_default();

        Ok(name)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let mut state = self.open_state(MemoryChannel::closed("queue.bind"))?;
        if !state.exchanges.contains_key(exchange) || !state.queues.contains_key(queue) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        let binding = (queue.to_owned(), exchange.to_owned(), routing_key.to_owned());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.broker.hold("basic.qos").await;
        let mut state = self.open_state(AmqpError::QoSDeclarationError("channel closed".to_owned()))?;
        state.qos.push(prefetch_count);
        if let Some(slot) = state.channels.get_mut(&self.id) {
            slot.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<ConsumerRegistration, AmqpError> {
        self.broker.hold("basic.consume").await;
        let mut state = self.open_state(MemoryChannel::closed("basic.consume"))?;
        let (sender, receiver) = mpsc::unbounded_channel();

        {
            let Some(slot) = state.queues.get_mut(queue) else {
                return Err(AmqpError::BindingConsumerError(format!("no queue `{queue}`")));
            };
            if slot.consumer.is_some() {
                return Err(AmqpError::BindingConsumerError(format!(
                    "queue `{queue}` already has a consumer"
                )));
            }
            slot.consumer = Some(ConsumerSlot {
                tag: consumer_tag.to_owned(),
                channel: self.id,
                no_ack,
                sender,
            });
        }
        state.dispatch(queue);

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed();

        Ok(ConsumerRegistration {
            consumer_tag: consumer_tag.to_owned(),
            deliveries,
        })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.open_state(AmqpError::AckMessageError)?;
        state.acks.push(delivery_tag);
        if let Some(unacked) = state.unacked.remove(&delivery_tag) {
            state.dispatch(&unacked.queue);
        }
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.open_state(AmqpError::NackMessageError)?;
        state.nacks.push((delivery_tag, requeue));

        if let Some(unacked) = state.unacked.remove(&delivery_tag) {
            if requeue {
                state.requeue(unacked);
            } else {
                state.dispatch(&unacked.queue);
            }
        }
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state =
            self.open_state(AmqpError::CancelConsumerError(consumer_tag.to_owned()))?;

        for slot in state.queues.values_mut() {
            if slot.consumer.as_ref().is_some_and(|c| c.tag == consumer_tag) {
                slot.consumer = None;
            }
        }
        state.cancelled.push(consumer_tag.to_owned());
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.open_state(AmqpError::PublishingError("channel closed".to_owned()))?;

        state.published.push(PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            kind: properties.kind().as_ref().map(|k| k.to_string()),
            message_id: properties.message_id().as_ref().map(|id| id.to_string()),
            payload: payload.to_vec(),
        });

        let delivery = Delivery {
            delivery_tag: 0,
            redelivered: false,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            data: payload.to_vec(),
        };
        state.route(exchange, routing_key, delivery)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state().close_channel(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker.state().is_open(self.id)
    }
}

/// Connector handing out a single prepared channel, typically a mock.
pub(crate) struct StaticConnector {
    channel: Arc<dyn BrokerChannel>,
}

impl StaticConnector {
    pub fn shared(channel: Arc<dyn BrokerChannel>) -> Arc<dyn Connector> {
        Arc::new(StaticConnector { channel })
    }
}

#[async_trait]
impl Connector for StaticConnector {
    async fn connect(
        &self,
        _settings: &ConnectionSettings,
        _events: EventSender,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        Ok(Arc::new(StaticConnection {
            channel: self.channel.clone(),
        }))
    }
}

struct StaticConnection {
    channel: Arc<dyn BrokerChannel>,
}

#[async_trait]
impl BrokerConnection for StaticConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        Ok(self.channel.clone())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_match_topic_patterns() {
        assert!(routes(ExchangeKind::Topic, "audit.*", "audit.login"));
        assert!(!routes(ExchangeKind::Topic, "audit.*", "audit.login.failed"));
        assert!(routes(ExchangeKind::Topic, "audit.#", "audit.login.failed"));
        assert!(routes(ExchangeKind::Topic, "#", "anything.at.all"));
        assert!(!routes(ExchangeKind::Direct, "k1", "k2"));
        assert!(routes(ExchangeKind::Fanout, "", "whatever"));
    }
}
