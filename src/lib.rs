// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Exchange Listeners
//!
//! Topology components ([`exchange::Exchange`], [`queue::Queue`]), a
//! [`consumer::MessageConsumer`] with type filtering and retry policy, and
//! the [`exchange_listener::ExchangeListener`] that assembles them into an
//! idempotent subscriber.

mod otel;

pub mod channel;
pub mod component;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod exchange_listener;
pub mod message_listener;
pub mod publisher;
pub mod queue;
pub mod settings;
pub mod tracker;

#[cfg(test)]
mod testing;
