// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publishing
//!
//! [`OutboundMessage`] describes a message to publish on an
//! [`Exchange`](crate::exchange::Exchange): its type string, used by consumers
//! for filtering, its message id, used for idempotent handling, and the
//! remaining AMQP metadata read on the consuming side. The current
//! OpenTelemetry context is propagated in the message headers.

use crate::{channel::BrokerChannel, errors::AmqpError, otel};
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::debug;
use uuid::Uuid;

/// Default content type of outbound messages
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Default content encoding of outbound messages
pub const UTF8_CONTENT_ENCODING: &str = "utf-8";
/// AMQP delivery mode asking the broker to persist the message
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;
/// AMQP delivery mode for messages the broker may keep in memory only
pub const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// A message to publish, built with chained setters.
///
/// ```
/// use rabbitmq_listener::publisher::OutboundMessage;
///
/// let message = OutboundMessage::new("UserCreated", r#"{"id":1}"#)
///     .message_id("m1")
///     .content_type("application/json");
/// assert_eq!(message.kind(), "UserCreated");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    kind: String,
    message_id: Option<String>,
    timestamp: Option<u64>,
    delivery_mode: u8,
    content_type: String,
    content_encoding: String,
    headers: BTreeMap<String, String>,
    payload: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(kind: &str, payload: impl Into<Vec<u8>>) -> OutboundMessage {
        OutboundMessage {
            kind: kind.to_owned(),
            message_id: None,
            timestamp: None,
            delivery_mode: PERSISTENT_DELIVERY_MODE,
            content_type: TEXT_CONTENT_TYPE.to_owned(),
            content_encoding: UTF8_CONTENT_ENCODING.to_owned(),
            headers: BTreeMap::default(),
            payload: payload.into(),
        }
    }

    /// Sets the message id. A random uuid is used when none is set.
    pub fn message_id(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_owned());
        self
    }

    /// Sets the timestamp in seconds since the epoch. The publishing time
    /// is used when none is set.
    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn delivery_mode(mut self, delivery_mode: u8) -> Self {
        self.delivery_mode = delivery_mode;
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    pub fn content_encoding(mut self, content_encoding: &str) -> Self {
        self.content_encoding = content_encoding.to_owned();
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Builds the AMQP properties of this message, `message_id` included.
    pub(crate) fn properties(&self, message_id: &str, ctx: &Context) -> BasicProperties {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_context(ctx, &mut headers);

        for (key, value) in &self.headers {
            headers.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }

        BasicProperties::default()
            .with_type(ShortString::from(self.kind.clone()))
            .with_message_id(ShortString::from(message_id.to_owned()))
            .with_timestamp(self.timestamp.unwrap_or_else(now))
            .with_delivery_mode(self.delivery_mode)
            .with_content_type(ShortString::from(self.content_type.clone()))
            .with_content_encoding(ShortString::from(self.content_encoding.clone()))
            .with_headers(FieldTable::from(headers))
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Publishes `message` to `exchange` on `channel`.
///
/// # Returns
/// The message id the message was published with
pub(crate) async fn publish(
    channel: &dyn BrokerChannel,
    exchange: &str,
    routing_key: &str,
    message: &OutboundMessage,
) -> Result<String, AmqpError> {
    let message_id = match &message.message_id {
        Some(id) => id.clone(),
        None => Uuid::new_v4().to_string(),
    };
    let properties = message.properties(&message_id, &Context::current());

    debug!(
        exchange,
        routing_key,
        kind = message.kind,
        message_id,
        "publishing message"
    );
    channel
        .basic_publish(exchange, routing_key, &message.payload, properties)
        .await?;

    Ok(message_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_fill_the_amqp_metadata() {
        let message = OutboundMessage::new("UserCreated", "{}")
            .message_id("m1")
            .timestamp(1_700_000_000)
            .content_type(JSON_CONTENT_TYPE)
            .header("tenant", "acme");

        let props = message.properties("m1", &Context::new());

        assert_eq!(props.kind().as_ref().map(|k| k.as_str()), Some("UserCreated"));
        assert_eq!(props.message_id().as_ref().map(|id| id.as_str()), Some("m1"));
        assert_eq!(*props.timestamp(), Some(1_700_000_000));
        assert_eq!(*props.delivery_mode(), Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(
            props.content_type().as_ref().map(|c| c.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
        assert_eq!(
            props.content_encoding().as_ref().map(|c| c.as_str()),
            Some(UTF8_CONTENT_ENCODING)
        );
        let headers = props.headers().clone().unwrap_or_default();
        assert!(headers.inner().contains_key("tenant"));
    }

    #[test]
    fn should_default_to_persistent_text() {
        let message = OutboundMessage::new("Ping", vec![1, 2, 3]).delivery_mode(TRANSIENT_DELIVERY_MODE);

        let props = message.properties("generated", &Context::new());

        assert_eq!(message.id(), None);
        assert_eq!(message.payload(), &[1, 2, 3]);
        assert_eq!(*props.delivery_mode(), Some(TRANSIENT_DELIVERY_MODE));
        assert_eq!(
            props.content_type().as_ref().map(|c| c.as_str()),
            Some(TEXT_CONTENT_TYPE)
        );
        assert!(props.timestamp().is_some());
    }

    #[tokio::test]
    async fn should_generate_a_message_id_when_missing() {
        let broker = crate::testing::MemoryBroker::new();
        let exchange = crate::exchange::Exchange::with_connector(
            broker.connector(),
            &crate::settings::ConnectionSettings::new("localhost"),
            "ids",
            crate::exchange::ExchangeKind::Fanout,
            false,
            true,
        )
        .settle()
        .await
        .unwrap();

        let id = exchange
            .publish("", &OutboundMessage::new("Ping", "pong"))
            .await
            .unwrap();

        assert!(Uuid::parse_str(&id).is_ok());
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "ids");
        assert_eq!(published[0].message_id.as_deref(), Some(id.as_str()));
    }
}
