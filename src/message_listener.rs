// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Listeners
//!
//! The callback a [`MessageConsumer`](crate::consumer::MessageConsumer)
//! hands its accepted deliveries to.

use crate::errors::AmqpError;
use async_trait::async_trait;

/// Declared shape of the messages a listener expects. Informative only, the
/// transport does not enforce it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageType {
    #[default]
    Text,
    Binary,
}

impl MessageType {
    pub fn content_type(&self) -> &'static str {
        match self {
            MessageType::Text => "text/plain",
            MessageType::Binary => "application/octet-stream",
        }
    }
}

/// Receives every delivery a [`MessageConsumer`](crate::consumer::MessageConsumer)
/// accepts.
///
/// Returning an error means the message was not handled: the consumer then
/// negatively acknowledges it, requeueing it only when it was built with
/// retry enabled.
#[async_trait]
pub trait MessageListener: Send + Sync {
    fn message_type(&self) -> MessageType {
        MessageType::Text
    }

    /// Handles one delivery.
    ///
    /// * `kind` - type string of the message, if sent
    /// * `message_id` - id of the message, if sent
    /// * `timestamp` - seconds since the epoch, if sent
    /// * `body` - raw message content
    /// * `delivery_tag` - broker handle of this delivery
    /// * `is_redelivery` - whether the broker delivered it before
    #[allow(clippy::too_many_arguments)]
    async fn handle_message(
        &self,
        kind: Option<&str>,
        message_id: Option<&str>,
        timestamp: Option<u64>,
        body: &[u8],
        delivery_tag: u64,
        is_redelivery: bool,
    ) -> Result<(), AmqpError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;

    #[async_trait]
    impl MessageListener for Silent {
        async fn handle_message(
            &self,
            _kind: Option<&str>,
            _message_id: Option<&str>,
            _timestamp: Option<u64>,
            _body: &[u8],
            _delivery_tag: u64,
            _is_redelivery: bool,
        ) -> Result<(), AmqpError> {
            Ok(())
        }
    }

    #[test]
    fn should_default_to_text() {
        assert_eq!(Silent.message_type(), MessageType::Text);
        assert_eq!(MessageType::Binary.content_type(), "application/octet-stream");
    }
}
