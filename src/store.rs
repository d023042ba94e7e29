use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::Result;

#[cfg(feature = "store-redis")]
pub mod redis;

/// Result of one atomic window check: whether the increment was admitted,
/// the window total after pruning (including the increment when admitted),
/// and the age of the oldest surviving entry in seconds.
#[derive(Clone, Copy, Debug)]
pub struct WindowOutcome {
    pub allowed: bool,
    pub current: u64,
    pub oldest_age_seconds: u64,
}

/// Boundary to the shared atomic-counter store. The gateway runs as
/// multiple memory-isolated instances, so `check_window` must perform
/// prune + count + conditional append as one linearizable operation per
/// key. Unreachability surfaces as `CounterStoreUnavailable`, never as a
/// limit decision.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Prunes entries older than the window, sums the survivors, and
    /// atomically appends `amount` only if the sum plus `amount` stays
    /// within `limit`.
    async fn check_window(
        &self,
        key: &str,
        window_seconds: u64,
        amount: u64,
        limit: u64,
        now_ms: u64,
    ) -> Result<WindowOutcome>;

    /// Appends without a limit check (post-completion usage recording).
    async fn append_window(
        &self,
        key: &str,
        window_seconds: u64,
        amount: u64,
        now_ms: u64,
    ) -> Result<()>;

    async fn read_counter(&self, key: &str, now_ms: u64) -> Result<u64>;

    /// Adds to a plain counter, refreshing its expiry. `ttl_seconds` of
    /// `None` means the counter never expires.
    async fn add_counter(
        &self,
        key: &str,
        amount: u64,
        ttl_seconds: Option<u64>,
        now_ms: u64,
    ) -> Result<u64>;
}

#[derive(Clone, Copy, Debug)]
struct WindowEntry {
    ts_ms: u64,
    amount: u64,
}

#[derive(Clone, Copy, Debug)]
struct CounterEntry {
    value: u64,
    expires_at_ms: Option<u64>,
}

/// Reference in-memory implementation: a mutex over time-ordered entries.
/// Behaviorally interchangeable with the redis store and used by tests;
/// the mutex makes each check-and-increment linearizable within one
/// process.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    windows: Mutex<HashMap<String, VecDeque<WindowEntry>>>,
    counters: Mutex<HashMap<String, CounterEntry>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_windows(&self) -> MutexGuard<'_, HashMap<String, VecDeque<WindowEntry>>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_counters(&self) -> MutexGuard<'_, HashMap<String, CounterEntry>> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn prune(entries: &mut VecDeque<WindowEntry>, window_seconds: u64, now_ms: u64) {
    let cutoff = now_ms.saturating_sub(window_seconds.saturating_mul(1000));
    while entries.front().map(|e| e.ts_ms <= cutoff).unwrap_or(false) {
        entries.pop_front();
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn check_window(
        &self,
        key: &str,
        window_seconds: u64,
        amount: u64,
        limit: u64,
        now_ms: u64,
    ) -> Result<WindowOutcome> {
        let mut windows = self.lock_windows();
        let entries = windows.entry(key.to_string()).or_default();
        prune(entries, window_seconds, now_ms);

        let current: u64 = entries.iter().map(|e| e.amount).sum();
        let oldest_age_seconds = entries
            .front()
            .map(|e| now_ms.saturating_sub(e.ts_ms) / 1000)
            .unwrap_or(0);

        if current.saturating_add(amount) > limit {
            if entries.is_empty() {
                windows.remove(key);
            }
            return Ok(WindowOutcome {
                allowed: false,
                current,
                oldest_age_seconds,
            });
        }

        entries.push_back(WindowEntry {
            ts_ms: now_ms,
            amount,
        });
        Ok(WindowOutcome {
            allowed: true,
            current: current.saturating_add(amount),
            oldest_age_seconds,
        })
    }

    async fn append_window(
        &self,
        key: &str,
        window_seconds: u64,
        amount: u64,
        now_ms: u64,
    ) -> Result<()> {
        let mut windows = self.lock_windows();
        let entries = windows.entry(key.to_string()).or_default();
        prune(entries, window_seconds, now_ms);
        entries.push_back(WindowEntry {
            ts_ms: now_ms,
            amount,
        });
        Ok(())
    }

    async fn read_counter(&self, key: &str, now_ms: u64) -> Result<u64> {
        let mut counters = self.lock_counters();
        let Some(entry) = counters.get(key).copied() else {
            return Ok(0);
        };
        if entry.expires_at_ms.map(|at| now_ms >= at).unwrap_or(false) {
            counters.remove(key);
            return Ok(0);
        }
        Ok(entry.value)
    }

    async fn add_counter(
        &self,
        key: &str,
        amount: u64,
        ttl_seconds: Option<u64>,
        now_ms: u64,
    ) -> Result<u64> {
        let mut counters = self.lock_counters();
        let entry = counters.entry(key.to_string()).or_insert(CounterEntry {
            value: 0,
            expires_at_ms: None,
        });
        if entry.expires_at_ms.map(|at| now_ms >= at).unwrap_or(false) {
            entry.value = 0;
        }
        entry.value = entry.value.saturating_add(amount);
        entry.expires_at_ms = ttl_seconds.map(|ttl| now_ms.saturating_add(ttl.saturating_mul(1000)));
        Ok(entry.value)
    }
}

// Keeps RouteError construction for store backends in one place.
#[cfg(feature = "store-redis")]
pub(crate) fn unavailable(message: impl std::fmt::Display) -> crate::error::RouteError {
    crate::error::RouteError::CounterStoreUnavailable {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn window_prunes_expired_entries_at_read_time() {
        let store = MemoryCounterStore::new();
        let t0 = 1_000_000u64;

        for i in 0..3 {
            let outcome = store
                .check_window("k", 60, 1, 3, t0 + i * 1000)
                .await
                .expect("check");
            assert!(outcome.allowed);
        }
        let outcome = store.check_window("k", 60, 1, 3, t0 + 3000).await.expect("check");
        assert!(!outcome.allowed);
        assert_eq!(outcome.current, 3);

        // first entry ages out after the 60s window
        let outcome = store
            .check_window("k", 60, 1, 3, t0 + 61_000)
            .await
            .expect("check");
        assert!(outcome.allowed);
    }

    #[tokio::test]
    async fn rejected_checks_do_not_charge_the_window() {
        let store = MemoryCounterStore::new();
        let outcome = store.check_window("k", 60, 10, 5, 1_000).await.expect("check");
        assert!(!outcome.allowed);
        assert_eq!(outcome.current, 0);

        let outcome = store.check_window("k", 60, 5, 5, 2_000).await.expect("check");
        assert!(outcome.allowed);
    }

    #[tokio::test]
    async fn counters_expire_and_reset() {
        let store = MemoryCounterStore::new();
        let value = store
            .add_counter("c", 100, Some(60), 1_000)
            .await
            .expect("add");
        assert_eq!(value, 100);
        assert_eq!(store.read_counter("c", 2_000).await.expect("read"), 100);
        assert_eq!(store.read_counter("c", 61_001).await.expect("read"), 0);

        let value = store
            .add_counter("c", 5, Some(60), 61_001)
            .await
            .expect("add");
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn expired_state_is_dropped_not_retained() {
        let store = MemoryCounterStore::new();

        let outcome = store.check_window("w", 60, 1, 1, 1_000).await.expect("check");
        assert!(outcome.allowed);

        // the only entry ages out, so the rejected check leaves no key behind
        let outcome = store.check_window("w", 60, 5, 1, 62_000).await.expect("check");
        assert!(!outcome.allowed);
        assert!(!store.lock_windows().contains_key("w"));

        store.add_counter("c", 1, Some(60), 1_000).await.expect("add");
        assert_eq!(store.read_counter("c", 61_001).await.expect("read"), 0);
        assert!(!store.lock_counters().contains_key("c"));
    }

    #[tokio::test]
    async fn append_window_never_rejects() {
        let store = MemoryCounterStore::new();
        store.append_window("k", 60, 1_000_000, 1_000).await.expect("append");
        let outcome = store.check_window("k", 60, 1, 10, 2_000).await.expect("check");
        assert!(!outcome.allowed);
        assert_eq!(outcome.current, 1_000_000);
    }
}
