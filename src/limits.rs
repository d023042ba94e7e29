use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{Result, RouteError};
use crate::store::CounterStore;

/// Sliding-window limits per scope. Absent fields impose no limit; a
/// limit of zero admits nothing.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per minute.
    pub rpm: Option<u64>,
    /// Requests per hour.
    pub rph: Option<u64>,
    /// Requests per day.
    pub rpd: Option<u64>,
    /// Tokens per minute.
    pub tpm: Option<u64>,
    /// Tokens per day.
    pub tpd: Option<u64>,
}

const MINUTE: u64 = 60;
const HOUR: u64 = 3_600;
const DAY: u64 = 86_400;

fn request_windows(config: &RateLimitConfig) -> [(&'static str, u64, Option<u64>); 3] {
    [
        ("rpm", MINUTE, config.rpm),
        ("rph", HOUR, config.rph),
        ("rpd", DAY, config.rpd),
    ]
}

fn token_windows(config: &RateLimitConfig) -> [(&'static str, u64, Option<u64>); 2] {
    [("tpm", MINUTE, config.tpm), ("tpd", DAY, config.tpd)]
}

/// Sliding-window admission against the shared counter store. Each
/// configured window is one atomic check-and-increment round trip;
/// evaluation stops (and later windows stay uncharged) at the first
/// window that would be exceeded.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            prefix: "modelgate".to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn window_key(&self, scope: &str, window: &str) -> String {
        format!("{}:rate:{scope}:{window}", self.prefix)
    }

    pub async fn check_rate_limit(
        &self,
        scope: &str,
        config: &RateLimitConfig,
        requests: u64,
        tokens: u64,
    ) -> Result<()> {
        let now_ms = self.clock.now_epoch_millis();

        if requests > 0 {
            for (name, seconds, limit) in request_windows(config) {
                let Some(limit) = limit else { continue };
                self.check_window(scope, name, seconds, requests, limit, now_ms)
                    .await?;
            }
        }

        if tokens > 0 {
            for (name, seconds, limit) in token_windows(config) {
                let Some(limit) = limit else { continue };
                self.check_window(scope, name, seconds, tokens, limit, now_ms)
                    .await?;
            }
        }

        Ok(())
    }

    async fn check_window(
        &self,
        scope: &str,
        name: &'static str,
        seconds: u64,
        amount: u64,
        limit: u64,
        now_ms: u64,
    ) -> Result<()> {
        let key = self.window_key(scope, name);
        let outcome = self
            .store
            .check_window(&key, seconds, amount, limit, now_ms)
            .await?;
        if outcome.allowed {
            return Ok(());
        }
        let retry_after_seconds = seconds
            .saturating_sub(outcome.oldest_age_seconds)
            .max(1);
        tracing::debug!(scope, window = name, limit, "rate limit exceeded");
        Err(RouteError::RateLimitExceeded {
            window: name.to_string(),
            retry_after_seconds,
        })
    }

    /// Records actual token usage after the request completed. Appends to
    /// the configured token windows without re-checking limits; real
    /// usage is unknown before completion.
    pub async fn record_tokens(
        &self,
        scope: &str,
        config: &RateLimitConfig,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Result<()> {
        let total = prompt_tokens.saturating_add(completion_tokens);
        if total == 0 {
            return Ok(());
        }
        let now_ms = self.clock.now_epoch_millis();
        for (name, seconds, limit) in token_windows(config) {
            if limit.is_none() {
                continue;
            }
            let key = self.window_key(scope, name);
            self.store.append_window(&key, seconds, total, now_ms).await?;
        }
        Ok(())
    }
}
