//! Counter store abstraction
//!
//! Quota state is the only mutable state shared across requests, so it sits
//! behind a narrow async trait. `MemoryCounterStore` is the single-process
//! implementation; a networked store (Redis `HINCRBY` in a `MULTI`, for
//! example) can implement the same contract.

use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Atomic multi-field counters with per-key expiry
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add every delta to its field as one atomic unit and return the new values
    ///
    /// A key that does not exist (or has expired) is created with `ttl`.
    /// The expiry of an existing key is not extended.
    async fn increment(&self, key: &str, deltas: &[(&str, i64)], ttl: Duration)
        -> Result<Vec<i64>>;

    /// Subtract every delta from its field as one atomic unit and return the new values
    async fn decrement(&self, key: &str, deltas: &[(&str, i64)]) -> Result<Vec<i64>>;

    /// Current value of a field (0 when missing or expired)
    async fn get(&self, key: &str, field: &str) -> Result<i64>;
}

#[derive(Debug)]
struct CounterEntry {
    fields: HashMap<String, i64>,
    expires_at: Instant,
}

impl CounterEntry {
    fn new(ttl: Duration) -> Self {
        Self {
            fields: HashMap::new(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory counter store
///
/// Each key lives in a `DashMap` shard; holding the entry guard for the whole
/// update makes multi-field increments atomic with respect to other callers
/// touching the same key.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: DashMap<String, CounterEntry>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired keys, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "Purged expired rate-limit counters");
        }
        removed
    }

    /// Number of live and not-yet-purged keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(
        &self,
        key: &str,
        deltas: &[(&str, i64)],
        ttl: Duration,
    ) -> Result<Vec<i64>> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry::new(ttl));
        if entry.is_expired(now) {
            *entry = CounterEntry::new(ttl);
        }

        let values = deltas
            .iter()
            .map(|(field, delta)| {
                let value = entry.fields.entry(field.to_string()).or_insert(0);
                *value += delta;
                *value
            })
            .collect();
        Ok(values)
    }

    async fn decrement(&self, key: &str, deltas: &[(&str, i64)]) -> Result<Vec<i64>> {
        let now = Instant::now();
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(vec![0; deltas.len()]);
        };
        if entry.is_expired(now) {
            return Ok(vec![0; deltas.len()]);
        }

        let values = deltas
            .iter()
            .map(|(field, delta)| {
                let value = entry.fields.entry(field.to_string()).or_insert(0);
                *value = (*value - delta).max(0);
                *value
            })
            .collect();
        Ok(values)
    }

    async fn get(&self, key: &str, field: &str) -> Result<i64> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.fields.get(field).copied())
            .unwrap_or(0))
    }
}
