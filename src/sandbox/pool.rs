//! Bounded pool of reusable execution contexts
//!
//! A semaphore holds one permit per context. Callers that cannot get a
//! permit immediately queue for up to `acquire_timeout`; once `max_waiters`
//! callers are already queued, further callers are rejected at once. A
//! [`ContextLease`] resets its slot and returns it when dropped, whatever
//! happened during execution.

use super::context::Meter;
use crate::config::PoolConfig;
use crate::error::{GuardError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// One reusable execution context
#[derive(Debug)]
struct Slot {
    id: usize,
    executions: u64,
    meter: Arc<Meter>,
}

impl Slot {
    fn new(id: usize) -> Self {
        Self {
            id,
            executions: 0,
            meter: Arc::new(Meter::default()),
        }
    }

    /// Fresh meter, so a torn-down execution still holding the old one
    /// cannot affect the next lease
    fn reset(&mut self) {
        self.executions += 1;
        self.meter = Arc::new(Meter::default());
    }
}

#[derive(Debug)]
struct PoolInner {
    semaphore: Arc<Semaphore>,
    slots: Mutex<Vec<Slot>>,
    size: usize,
    waiters: AtomicUsize,
    max_waiters: usize,
    acquire_timeout: Duration,
}

impl PoolInner {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Context pool lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// Shared handle to the pool
#[derive(Debug, Clone)]
pub struct ContextPool {
    inner: Arc<PoolInner>,
}

impl ContextPool {
    pub fn new(config: &PoolConfig) -> Self {
        let size = config.size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(size)),
                slots: Mutex::new((0..size).rev().map(Slot::new).collect()),
                size,
                waiters: AtomicUsize::new(0),
                max_waiters: config.max_waiters,
                acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Contexts not currently leased
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Callers currently queued for a context
    pub fn waiting(&self) -> usize {
        self.inner.waiters.load(Ordering::SeqCst)
    }

    /// Lease a context, waiting briefly when all are in use
    pub async fn acquire(&self) -> Result<ContextLease> {
        if let Ok(permit) = self.inner.semaphore.clone().try_acquire_owned() {
            return Ok(self.lease(permit));
        }

        let queued = self.inner.waiters.fetch_add(1, Ordering::SeqCst);
        let _waiter = WaiterGuard(&self.inner.waiters);
        if queued >= self.inner.max_waiters {
            tracing::warn!(waiting = queued, "Context pool queue full, rejecting");
            return Err(GuardError::PoolExhausted("too many callers waiting".to_string()));
        }

        let acquire = self.inner.semaphore.clone().acquire_owned();
        match tokio::time::timeout(self.inner.acquire_timeout, acquire).await {
            Ok(Ok(permit)) => Ok(self.lease(permit)),
            Ok(Err(_)) => Err(GuardError::PoolExhausted("pool closed".to_string())),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.inner.acquire_timeout.as_millis() as u64,
                    "Timed out waiting for an execution context"
                );
                Err(GuardError::PoolExhausted(
                    "timed out waiting for an execution context".to_string(),
                ))
            }
        }
    }

    fn lease(&self, permit: OwnedSemaphorePermit) -> ContextLease {
        let slot = self.inner.slots().pop().unwrap_or_else(|| {
            // One slot per permit, so this only happens if a lease leaked its slot
            tracing::error!("Context pool has a permit but no slot, creating one");
            Slot::new(self.inner.size)
        });
        ContextLease {
            slot: Some(slot),
            pool: self.inner.clone(),
            _permit: permit,
        }
    }
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive use of one context; returned to the pool on drop
#[derive(Debug)]
pub struct ContextLease {
    slot: Option<Slot>,
    pool: Arc<PoolInner>,
    // Released after the slot is back in the pool
    _permit: OwnedSemaphorePermit,
}

impl ContextLease {
    pub fn slot_id(&self) -> usize {
        self.slot.as_ref().map_or(0, |s| s.id)
    }

    /// Executions previously run in this context
    pub fn executions(&self) -> u64 {
        self.slot.as_ref().map_or(0, |s| s.executions)
    }

    pub(crate) fn meter(&self) -> Arc<Meter> {
        self.slot
            .as_ref()
            .map(|s| s.meter.clone())
            .unwrap_or_default()
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        if let Some(mut slot) = self.slot.take() {
            slot.reset();
            tracing::debug!(slot = slot.id, "Execution context returned");
            self.pool.slots().push(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(size: usize, max_waiters: usize, acquire_timeout_ms: u64) -> ContextPool {
        ContextPool::new(&PoolConfig {
            size,
            max_waiters,
            acquire_timeout_ms,
        })
    }

    #[tokio::test]
    async fn test_lease_returns_on_drop() {
        let pool = pool(2, 4, 100);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.slot_id(), b.slot_id());
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.available(), 1);
        let c = pool.acquire().await.unwrap();
        assert_eq!(c.executions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let pool = pool(1, 4, 50);
        let _held = pool.acquire().await.unwrap();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(GuardError::PoolExhausted(_))));
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test]
    async fn test_waiter_bound_rejects_immediately() {
        let pool = pool(1, 0, 5_000);
        let _held = pool.acquire().await.unwrap();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(GuardError::PoolExhausted(m)) if m.contains("waiting")));
    }

    #[tokio::test]
    async fn test_waiter_gets_released_context() {
        let pool = pool(1, 4, 5_000);
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|l| l.slot_id()) })
        };
        tokio::task::yield_now().await;
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_replaces_meter() {
        let pool = pool(1, 1, 100);
        let lease = pool.acquire().await.unwrap();
        let old = lease.meter();
        drop(lease);
        let lease = pool.acquire().await.unwrap();
        assert!(!Arc::ptr_eq(&old, &lease.meter()));
    }
}
