use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineStatsSnapshot {
    pub requests: u64,
    pub matched: u64,
    pub default_route_used: u64,
    pub fallback_used: u64,
    pub no_route: u64,
    pub no_healthy_upstream: u64,
}

/// Decision counters kept by the engine. Dry runs do not record here.
#[derive(Debug, Default)]
pub struct EngineStats {
    requests: AtomicU64,
    matched: AtomicU64,
    default_route_used: AtomicU64,
    fallback_used: AtomicU64,
    no_route: AtomicU64,
    no_healthy_upstream: AtomicU64,
}

impl EngineStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_matched(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_default_route_used(&self) {
        self.default_route_used.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_used(&self) {
        self.fallback_used.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_no_route(&self) {
        self.no_route.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_no_healthy_upstream(&self) {
        self.no_healthy_upstream.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            default_route_used: self.default_route_used.load(Ordering::Relaxed),
            fallback_used: self.fallback_used.load(Ordering::Relaxed),
            no_route: self.no_route.load(Ordering::Relaxed),
            no_healthy_upstream: self.no_healthy_upstream.load(Ordering::Relaxed),
        }
    }
}
