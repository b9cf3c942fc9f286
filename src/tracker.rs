// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Handling Tracker
//!
//! Bookkeeping of the message ids that were already handled, so that a
//! message the broker delivers twice only reaches application code once.
//!
//! [`KeyValueEventHandlingTracker`] keeps the marks in any [`KeyValueStore`]
//! as `prefix:messageId -> "true"`. [`InMemoryKeyValueStore`] is a process
//! local store with expiring entries, suited to single instance deployments
//! and tests.

use crate::errors::AmqpError;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::RwLock, time::Instant};
use tracing::debug;

/// Value stored for a handled message
pub const HANDLED_MARKER: &str = "true";

/// Remembers which messages were handled.
///
/// A mark must be visible to every later check of the same id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventHandlingTracker: Send + Sync {
    async fn check_if_notif_handled(&self, message_id: &str) -> Result<bool, AmqpError>;

    async fn mark_notif_as_handled(&self, message_id: &str) -> Result<(), AmqpError>;
}

/// Minimal string key-value backend.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AmqpError>;

    /// Stores `value` under `key`, forgetting it after `ttl` when given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AmqpError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Arc<InMemoryKeyValueStore> {
        Arc::new(InMemoryKeyValueStore::default())
    }

    /// Drops the expired entries.
    pub async fn purge(&self) {
        let now = Instant::now();
        self.entries.write().await.retain(|_, entry| entry.is_live(now));
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AmqpError> {
        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .await
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    /// Stores `value`, evicting the entries that expired meanwhile.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AmqpError> {
        let now = Instant::now();
        let entry = Entry {
            value: value.to_owned(),
            expires_at: ttl.map(|ttl| now + ttl),
        };

        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.is_live(now));
        entries.insert(key.to_owned(), entry);
        Ok(())
    }
}

/// [`EventHandlingTracker`] over a [`KeyValueStore`].
pub struct KeyValueEventHandlingTracker {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    ttl: Option<Duration>,
}

impl KeyValueEventHandlingTracker {
    /// Keys are `prefix:messageId`, or the bare message id when `prefix` is
    /// empty. Marks never expire unless [`with_ttl`](Self::with_ttl) is used,
    /// so without a TTL an in-memory store keeps every id it was given.
    pub fn factory(store: Arc<dyn KeyValueStore>, prefix: &str) -> KeyValueEventHandlingTracker {
        KeyValueEventHandlingTracker {
            store,
            prefix: prefix.to_owned(),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn key_with_prefix(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            return key.to_owned();
        }
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl EventHandlingTracker for KeyValueEventHandlingTracker {
    async fn check_if_notif_handled(&self, message_id: &str) -> Result<bool, AmqpError> {
        let value = self.store.get(&self.key_with_prefix(message_id)).await?;
        Ok(value.as_deref() == Some(HANDLED_MARKER))
    }

    async fn mark_notif_as_handled(&self, message_id: &str) -> Result<(), AmqpError> {
        let key = self.key_with_prefix(message_id);
        debug!(key, "marking message as handled");
        self.store.set(&key, HANDLED_MARKER, self.ttl).await
    }
}
