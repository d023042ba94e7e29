use std::sync::atomic::{AtomicU64, Ordering};

/// Time source for breakers, rate limits and quotas. Injected so tests and
/// embedders can simulate clock advancement without sleeping.
pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;

    fn now_epoch_millis(&self) -> u64 {
        self.now_epoch_seconds().saturating_mul(1000)
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        self.now_epoch_millis() / 1000
    }

    fn now_epoch_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock used by tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(epoch_seconds: u64) -> Self {
        Self {
            millis: AtomicU64::new(epoch_seconds.saturating_mul(1000)),
        }
    }

    pub fn set_seconds(&self, epoch_seconds: u64) {
        self.millis
            .store(epoch_seconds.saturating_mul(1000), Ordering::SeqCst);
    }

    pub fn advance_seconds(&self, seconds: u64) {
        self.millis
            .fetch_add(seconds.saturating_mul(1000), Ordering::SeqCst);
    }

    pub fn advance_millis(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_seconds(&self) -> u64 {
        self.now_epoch_millis() / 1000
    }

    fn now_epoch_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
