// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module defines the seam between the broker components and the AMQP
//! driver. A [`Connector`] opens a [`BrokerConnection`] for some
//! [`ConnectionSettings`], the connection hands out [`BrokerChannel`]s and
//! every protocol round-trip the components need (declare, bind, qos,
//! consume, ack/nack, cancel, publish) goes through the channel.
//!
//! The production implementation is backed by lapin ([`LapinConnector`]).
//! Broker-side failures that kill a connection, or one of its channels, are
//! reported on the [`EventSender`] handed to [`Connector::connect`].

use crate::{errors::AmqpError, exchange::ExchangeKind, settings::ConnectionSettings};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Reply code sent when this side closes a channel or a connection
pub const AMQP_REPLY_SUCCESS: u16 = 200;

/// Name lapin announces to the broker when none is configured
pub const DEFAULT_CONNECTION_NAME: &str = "rabbitmq-listener";

/// Unsolicited notifications coming from the broker side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// The channel (or its connection) was closed by the broker
    ChannelClosed(String),
}

pub type EventSender = mpsc::UnboundedSender<BrokerEvent>;

pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Parameters of an exchange assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeParams {
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Parameters of a queue assertion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueParams {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// A message handed to a consumer, detached from the driver's acker.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl Delivery {
    pub fn kind(&self) -> Option<&str> {
        self.properties.kind().as_ref().map(|k| k.as_str())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id().as_ref().map(|id| id.as_str())
    }

    pub fn timestamp(&self) -> Option<u64> {
        *self.properties.timestamp()
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

/// A registered broker consumer and the deliveries it receives.
pub struct ConsumerRegistration {
    pub consumer_tag: String,
    pub deliveries: DeliveryStream,
}

/// The protocol operations performed on an open channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, name: &str, params: ExchangeParams) -> Result<(), AmqpError>;

    /// Declares a queue and answers the name the broker gave it, which
    /// differs from `name` when `name` is empty.
    async fn queue_declare(&self, name: &str, params: QueueParams) -> Result<String, AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<ConsumerRegistration, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;
}

/// A physical connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn is_connected(&self) -> bool;
}

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
        events: EventSender,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// lapin backed [`Connector`].
#[derive(Debug, Clone)]
pub struct LapinConnector {
    connection_name: String,
}

impl LapinConnector {
    pub fn new(connection_name: &str) -> LapinConnector {
        LapinConnector {
            connection_name: connection_name.to_owned(),
        }
    }

    /// Shared default instance, used by the factories that only take
    /// [`ConnectionSettings`].
    pub fn shared() -> Arc<dyn Connector> {
        Arc::new(LapinConnector::default())
    }
}

impl Default for LapinConnector {
    fn default() -> Self {
        LapinConnector::new(DEFAULT_CONNECTION_NAME)
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
        events: EventSender,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!(host = settings.hostname(), "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&settings.to_url(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;

        let on_error = events.clone();
        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection failure");
            let _ = on_error.send(BrokerEvent::ChannelClosed(err.to_string()));
        });
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { conn, events }))
    }
}

struct LapinConnection {
    conn: Connection,
    events: EventSender,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                // channel.close sent by the broker, e.g. PRECONDITION_FAILED
                let events = self.events.clone();
                channel.on_error(move |err| {
                    error!(error = err.to_string(), "amqp channel closed by the broker");
                    let _ = events.send(BrokerEvent::ChannelClosed(err.to_string()));
                });
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(AMQP_REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn exchange_declare(&self, name: &str, params: ExchangeParams) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                name,
                params.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: params.durable,
                    auto_delete: params.auto_delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(err.to_string()))
    }

    async fn queue_declare(&self, name: &str, params: QueueParams) -> Result<String, AmqpError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: params.durable,
                    exclusive: params.exclusive,
                    auto_delete: params.auto_delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::DeclareQueueError(err.to_string()))?;

        Ok(queue.name().to_string())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<ConsumerRegistration, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(err.to_string())
            })?;

        let deliveries = consumer
            .map(|result| {
                result
                    .map(Delivery::from)
                    .map_err(|err| AmqpError::ChannelClosed(err.to_string()))
            })
            .boxed();

        Ok(ConsumerRegistration {
            consumer_tag: consumer_tag.to_owned(),
            deliveries,
        })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|_| AmqpError::AckMessageError)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|_| AmqpError::NackMessageError)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| AmqpError::CancelConsumerError(err.to_string()))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(AMQP_REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}
