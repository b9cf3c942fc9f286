// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Broker Listener Layer
//!
//! This module provides the error type shared by every component of the crate.
//! The `AmqpError` enum represents the failure scenarios of topology setup
//! (connection, channel, exchange, queue and binding), of delivery handling
//! (acknowledgement, handler and idempotency tracker failures) and of
//! programming errors such as invalid settings.

use thiserror::Error;

/// Represents errors that can occur while talking to the broker.
///
/// The enum is `Clone` so that a failure can be stored in the readiness state
/// of a component and handed to every caller awaiting it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error `{0}`")]
    InternalError(String),

    /// Connection settings that violate their invariants
    #[error("invalid connection settings `{0}`")]
    InvalidSettings(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// The broker closed the channel or the connection underneath a component
    #[error("channel closed by the broker `{0}`")]
    ChannelClosed(String),

    /// A component was asked to share a channel that is not open yet
    #[error("channel of `{0}` is not open")]
    ChannelNotReady(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error raised by application code while handling a message
    #[error("failure to handle message `{0}`")]
    HandlerError(String),

    /// Error reading or writing the idempotency bookkeeping
    #[error("failure to track message handling `{0}`")]
    TrackerError(String),

    /// The component was closed before or while it was used
    #[error("component `{0}` is closed")]
    ComponentClosed(String),

    /// The listener was stopped before its pipeline was assembled
    #[error("listener `{0}` was stopped")]
    ListenerStopped(String),
}
