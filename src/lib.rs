//! Routing decision core for an AI request gateway.
//!
//! Given one inbound call (endpoint, virtual model, tenant, optional api
//! key, tags), decide which upstream provider serves it, which concrete
//! model name to send, how to fail over around unhealthy upstreams, and
//! whether the caller is within rate and quota limits. The core never
//! executes requests: adapters, HTTP, persistence and auth are the
//! caller's collaborators, and the caller reports outcomes back into the
//! breaker, rate and quota state after each call.

pub mod breaker;
pub mod clock;
pub mod context;
pub mod engine;
pub mod error;
pub mod limits;
pub mod matcher;
pub mod policy;
pub mod quota;
pub mod selector;
pub mod stats;
pub mod store;
pub mod upstream;

pub use breaker::{
    BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerSnapshot,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::RoutingContext;
pub use engine::{DryRunReport, PolicyReport, RoutingEngine, RoutingSnapshot, SelectedRoute};
pub use error::{Result, RouteError};
pub use limits::{RateLimitConfig, RateLimiter};
pub use matcher::{MatchOutcome, PatternMatcher, PolicyMatcher, WildcardMatcher};
pub use policy::{
    CachePolicy, PolicyAction, PolicyMatch, RetryPolicy, RoutingPolicy, WeightedUpstream,
};
pub use quota::{QuotaConfig, QuotaManager, QuotaResetInterval};
pub use selector::{Selection, UpstreamSelector};
pub use stats::EngineStatsSnapshot;
#[cfg(feature = "store-redis")]
pub use store::redis::RedisCounterStore;
pub use store::{CounterStore, MemoryCounterStore, WindowOutcome};
pub use upstream::{Upstream, VirtualModel};
