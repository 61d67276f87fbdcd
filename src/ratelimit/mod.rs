//! Per-actor request and token quotas
//!
//! Fixed windows keyed `rl:{actor}:{window_index}` with two counters,
//! `requests` and `tokens`. Admission is increment-check-rollback executed
//! under a per-actor lock, so concurrent admissions for one actor never
//! admit more than the ceiling and never observe each other's rolled-back
//! increments.

pub mod store;

use crate::config::{TierLimit, TierLimits};
use crate::error::{GuardError, Result};
use crate::types::{now_millis, Tier};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub use store::{CounterStore, MemoryCounterStore};

const REQUESTS_FIELD: &str = "requests";
const TOKENS_FIELD: &str = "tokens";

/// Why an admission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// Single request estimated above the tier's per-request maximum
    RequestTooLarge,
    /// Request count ceiling reached for this window
    RequestCeiling,
    /// Token ceiling reached for this window
    TokenCeiling,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::RequestTooLarge => write!(f, "request exceeds per-request token maximum"),
            DenyReason::RequestCeiling => write!(f, "request ceiling reached"),
            DenyReason::TokenCeiling => write!(f, "token ceiling reached"),
        }
    }
}

/// Outcome of a quota check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    pub remaining_requests: u64,
    pub remaining_tokens: u64,
    /// Unix ms at which the current window ends
    pub reset_at_ms: u64,
    /// Present when waiting for the next window can help
    pub retry_after_ms: Option<u64>,
}

impl RateDecision {
    /// Convert a denial into [`GuardError::RateLimited`]
    pub fn into_result(self) -> Result<RateDecision> {
        if self.allowed {
            return Ok(self);
        }
        Err(GuardError::RateLimited {
            reason: self
                .reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "denied".to_string()),
            retry_after_ms: self.retry_after_ms.unwrap_or(0),
        })
    }
}

/// Snapshot of an actor's current window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateBudget {
    pub window_start_ms: u64,
    pub request_count: u64,
    pub token_count: u64,
    pub request_ceiling: u64,
    pub token_ceiling: u64,
}

/// Position of `now` within a fixed window
#[derive(Debug, Clone, Copy)]
pub(crate) struct Window {
    pub index: u64,
    pub start_ms: u64,
    pub length_ms: u64,
    pub now_ms: u64,
}

impl Window {
    pub fn at(now_ms: u64, length_ms: u64) -> Self {
        let length_ms = length_ms.max(1);
        let index = now_ms / length_ms;
        Self {
            index,
            start_ms: index * length_ms,
            length_ms,
            now_ms,
        }
    }

    pub fn reset_at_ms(&self) -> u64 {
        self.start_ms + self.length_ms
    }

    pub fn remaining_ms(&self) -> u64 {
        self.reset_at_ms().saturating_sub(self.now_ms)
    }

    /// Fraction of the window already elapsed, in `[0, 1)`
    pub fn elapsed_fraction(&self) -> f64 {
        (self.now_ms - self.start_ms) as f64 / self.length_ms as f64
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.length_ms)
    }
}

/// Non-negative counter value at `idx`, 0 when the store returned fewer values
pub(crate) fn count_at(counts: &[i64], idx: usize) -> u64 {
    counts.get(idx).copied().unwrap_or(0).max(0) as u64
}

/// Per-key async locks, created on first use and removed once no caller
/// holds or waits on them
#[derive(Debug, Default)]
pub(crate) struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyedGuard {
            guard: Some(lock.lock_owned().await),
            key: key.to_string(),
            locks: self,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Held lock on one key
pub(crate) struct KeyedGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    locks: &'a KeyedLocks,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody is waiting
        self.locks
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Quota gate for inbound requests
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    limits: TierLimits,
    locks: KeyedLocks,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, limits: TierLimits) -> Self {
        Self {
            store,
            limits,
            locks: KeyedLocks::default(),
        }
    }

    fn window_key(actor: &str, window: &Window) -> String {
        format!("rl:{}:{}", actor, window.index)
    }

    /// Try to admit one request costing `estimated_tokens`
    ///
    /// Denials are returned as `Ok(RateDecision { allowed: false, .. })`;
    /// `Err` is reserved for counter store failures.
    pub async fn check(&self, actor: &str, tier: Tier, estimated_tokens: u64) -> Result<RateDecision> {
        let limit = self.limits.for_tier(tier);
        let window = Window::at(now_millis(), self.limits.window_ms);

        if estimated_tokens > limit.max_tokens_per_request {
            tracing::warn!(
                actor = %actor,
                tier = %tier,
                estimated_tokens,
                max = limit.max_tokens_per_request,
                "Request exceeds per-request token maximum"
            );
            let budget = self.read_budget(actor, &limit, &window).await?;
            return Ok(RateDecision {
                allowed: false,
                reason: Some(DenyReason::RequestTooLarge),
                remaining_requests: limit.requests.saturating_sub(budget.request_count),
                remaining_tokens: limit.tokens.saturating_sub(budget.token_count),
                reset_at_ms: window.reset_at_ms(),
                retry_after_ms: None,
            });
        }

        let key = Self::window_key(actor, &window);
        let _guard = self.locks.lock(actor).await;

        let tokens = estimated_tokens as i64;
        let counts = self
            .store
            .increment(
                &key,
                &[(REQUESTS_FIELD, 1), (TOKENS_FIELD, tokens)],
                window.ttl(),
            )
            .await?;
        let requests = count_at(&counts, 0);
        let used_tokens = count_at(&counts, 1);

        let reason = if requests > limit.requests {
            Some(DenyReason::RequestCeiling)
        } else if used_tokens > limit.tokens {
            Some(DenyReason::TokenCeiling)
        } else {
            None
        };

        if let Some(reason) = reason {
            self.store
                .decrement(&key, &[(REQUESTS_FIELD, 1), (TOKENS_FIELD, tokens)])
                .await?;
            let requests = requests.saturating_sub(1);
            let used_tokens = used_tokens.saturating_sub(estimated_tokens);
            tracing::warn!(
                actor = %actor,
                tier = %tier,
                reason = %reason,
                retry_after_ms = window.remaining_ms(),
                "Rate limit exceeded"
            );
            return Ok(RateDecision {
                allowed: false,
                reason: Some(reason),
                remaining_requests: limit.requests.saturating_sub(requests),
                remaining_tokens: limit.tokens.saturating_sub(used_tokens),
                reset_at_ms: window.reset_at_ms(),
                retry_after_ms: Some(window.remaining_ms()),
            });
        }

        tracing::debug!(actor = %actor, requests, tokens = used_tokens, "Request admitted");
        Ok(RateDecision {
            allowed: true,
            reason: None,
            remaining_requests: limit.requests.saturating_sub(requests),
            remaining_tokens: limit.tokens.saturating_sub(used_tokens),
            reset_at_ms: window.reset_at_ms(),
            retry_after_ms: None,
        })
    }

    /// Read-only view of the actor's current window
    pub async fn budget(&self, actor: &str, tier: Tier) -> Result<RateBudget> {
        let limit = self.limits.for_tier(tier);
        let window = Window::at(now_millis(), self.limits.window_ms);
        self.read_budget(actor, &limit, &window).await
    }

    async fn read_budget(&self, actor: &str, limit: &TierLimit, window: &Window) -> Result<RateBudget> {
        let key = Self::window_key(actor, window);
        let requests = self.store.get(&key, REQUESTS_FIELD).await?;
        let tokens = self.store.get(&key, TOKENS_FIELD).await?;
        Ok(RateBudget {
            window_start_ms: window.start_ms,
            request_count: requests.max(0) as u64,
            token_count: tokens.max(0) as u64,
            request_ceiling: limit.requests,
            token_ceiling: limit.tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        // Day-long windows keep tests clear of window boundaries
        let limits = TierLimits {
            window_ms: 86_400_000,
            ..TierLimits::default()
        };
        RateLimiter::new(Arc::new(MemoryCounterStore::new()), limits)
    }

    #[tokio::test]
    async fn test_admits_within_ceiling() {
        let limiter = limiter();
        let decision = limiter.check("alice", Tier::Free, 100).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining_requests, 9);
        assert_eq!(decision.remaining_tokens, 4_900);
        assert!(decision.retry_after_ms.is_none());
    }

    #[tokio::test]
    async fn test_actor_locks_released() {
        let limiter = limiter();
        for actor in ["a", "b", "c"] {
            limiter.check(actor, Tier::Free, 10).await.unwrap();
        }
        assert_eq!(limiter.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_keyed_lock_kept_while_contended() {
        let locks = KeyedLocks::default();
        let held = locks.lock("k").await;
        let waiter = locks.lock("k");
        tokio::pin!(waiter);
        assert!(futures::poll!(waiter.as_mut()).is_pending());

        drop(held);
        assert_eq!(locks.len(), 1);
        let second = waiter.await;
        drop(second);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_oversized_request_denied_without_touching_counters() {
        let limiter = limiter();
        let decision = limiter.check("alice", Tier::Free, 6_000).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::RequestTooLarge));

        let budget = limiter.budget("alice", Tier::Free).await.unwrap();
        assert_eq!(budget.request_count, 0);
        assert_eq!(budget.token_count, 0);
    }

    #[tokio::test]
    async fn test_request_ceiling_and_rollback() {
        let limiter = limiter();
        for _ in 0..10 {
            assert!(limiter.check("bob", Tier::Free, 10).await.unwrap().allowed);
        }
        let denied = limiter.check("bob", Tier::Free, 10).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(DenyReason::RequestCeiling));
        assert!(denied.retry_after_ms.is_some());

        let budget = limiter.budget("bob", Tier::Free).await.unwrap();
        assert_eq!(budget.request_count, 10);
        assert_eq!(budget.token_count, 100);
    }

    #[tokio::test]
    async fn test_token_ceiling() {
        let limiter = limiter();
        for _ in 0..5 {
            assert!(limiter.check("carol", Tier::Free, 1_000).await.unwrap().allowed);
        }
        let denied = limiter.check("carol", Tier::Free, 1).await.unwrap();
        assert_eq!(denied.reason, Some(DenyReason::TokenCeiling));
        assert_eq!(denied.remaining_tokens, 0);
    }

    #[tokio::test]
    async fn test_actors_are_isolated() {
        let limiter = limiter();
        for _ in 0..10 {
            limiter.check("dave", Tier::Free, 1).await.unwrap();
        }
        assert!(!limiter.check("dave", Tier::Free, 1).await.unwrap().allowed);
        assert!(limiter.check("erin", Tier::Free, 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_tier_ceilings_differ() {
        let limiter = limiter();
        assert!(!limiter.check("x", Tier::Free, 2_000).await.unwrap().allowed);
        assert!(limiter.check("x", Tier::Pro, 2_000).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_into_result_maps_denial() {
        let limiter = limiter();
        let err = limiter
            .check("y", Tier::Free, 5_000)
            .await
            .unwrap()
            .into_result()
            .unwrap_err();
        assert!(matches!(err, GuardError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_admissions_never_exceed_ceiling() {
        let limiter = Arc::new(limiter());
        let mut handles = Vec::new();
        for _ in 0..40 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check("zed", Tier::Free, 400).await.unwrap()
            }));
        }

        let mut admitted_tokens = 0;
        for handle in handles {
            let decision = handle.await.unwrap();
            if decision.allowed {
                admitted_tokens += 400;
            }
        }
        assert!(admitted_tokens <= 5_000);
        // The 10-request ceiling binds before the token ceiling
        assert_eq!(admitted_tokens, 4_000);

        let budget = limiter.budget("zed", Tier::Free).await.unwrap();
        assert_eq!(budget.token_count, admitted_tokens);
    }

    #[test]
    fn test_window_math() {
        let window = Window::at(125_000, 60_000);
        assert_eq!(window.index, 2);
        assert_eq!(window.start_ms, 120_000);
        assert_eq!(window.reset_at_ms(), 180_000);
        assert_eq!(window.remaining_ms(), 55_000);
    }
}
