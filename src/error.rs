use thiserror::Error;

/// Decision failures returned to the caller. Routing and admission errors
/// are never substituted with a default upstream; the caller decides what
/// to do with each variant.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no route found for virtual model: {virtual_model}")]
    NoRouteFound { virtual_model: String },
    #[error("no healthy upstream for policy: {policy}")]
    NoHealthyUpstream { policy: String },
    #[error("rate limit exceeded: {window} (retry after {retry_after_seconds}s)")]
    RateLimitExceeded {
        window: String,
        retry_after_seconds: u64,
    },
    #[error("quota exceeded (resets at epoch second {reset_at_epoch_seconds})")]
    QuotaExceeded { reset_at_epoch_seconds: u64 },
    /// The shared counter store could not be reached. Deliberately distinct
    /// from `RateLimitExceeded`/`QuotaExceeded` so the integrator can choose
    /// a fail-open or fail-closed policy instead of this crate choosing one.
    #[error("counter store unavailable: {message}")]
    CounterStoreUnavailable { message: String },
    #[error("invalid snapshot: {reason}")]
    InvalidSnapshot { reason: String },
}

pub type Result<T> = std::result::Result<T, RouteError>;
