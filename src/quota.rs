use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Date, Duration as TimeDuration, Month, OffsetDateTime};

use crate::clock::Clock;
use crate::error::{Result, RouteError};
use crate::store::CounterStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaResetInterval {
    Daily,
    Weekly,
    #[default]
    Monthly,
    Never,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub max_tokens: Option<u64>,
    pub max_requests: Option<u64>,
    #[serde(default)]
    pub reset_interval: QuotaResetInterval,
}

const TTL_SLACK_SECONDS: u64 = 3_600;

/// Calendar-period cumulative usage, keyed by UTC period. The period key
/// changes at the calendar boundary, which is how quotas reset: no
/// explicit reset action exists. Checks read only; usage is committed
/// after the request completes.
pub struct QuotaManager {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
}

impl QuotaManager {
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

    fn key_tokens(&self, scope: &str, period: &str) -> String {
        format!("{}:quota:{scope}:{period}:tokens", self.prefix)
    }

    fn key_requests(&self, scope: &str, period: &str) -> String {
        format!("{}:quota:{scope}:{period}:requests", self.prefix)
    }

    /// Rejects with the next period boundary when the proposed usage
    /// would exceed a configured cap. Mutates nothing.
    pub async fn check_quota(
        &self,
        scope: &str,
        config: &QuotaConfig,
        tokens_to_use: u64,
        requests_to_use: u64,
    ) -> Result<()> {
        if config.max_tokens.is_none() && config.max_requests.is_none() {
            return Ok(());
        }

        let now = self.clock.now_epoch_seconds();
        let now_ms = self.clock.now_epoch_millis();
        let period = period_key(config.reset_interval, now);
        // 0 means the quota never resets
        let reset_at = period_end_epoch_seconds(config.reset_interval, now).unwrap_or(0);

        if let Some(limit) = config.max_tokens {
            let used = self
                .store
                .read_counter(&self.key_tokens(scope, &period), now_ms)
                .await?;
            if used.saturating_add(tokens_to_use) > limit {
                tracing::debug!(scope, period = %period, used, limit, "token quota exceeded");
                return Err(RouteError::QuotaExceeded {
                    reset_at_epoch_seconds: reset_at,
                });
            }
        }

        if let Some(limit) = config.max_requests {
            let used = self
                .store
                .read_counter(&self.key_requests(scope, &period), now_ms)
                .await?;
            if used.saturating_add(requests_to_use) > limit {
                tracing::debug!(scope, period = %period, used, limit, "request quota exceeded");
                return Err(RouteError::QuotaExceeded {
                    reset_at_epoch_seconds: reset_at,
                });
            }
        }

        Ok(())
    }

    /// Commits confirmed usage into the current period. The counter's
    /// expiry runs slightly past one period to tolerate clock skew
    /// between gateway instances.
    pub async fn record_usage(
        &self,
        scope: &str,
        config: &QuotaConfig,
        tokens_used: u64,
        requests_used: u64,
    ) -> Result<()> {
        let now = self.clock.now_epoch_seconds();
        let now_ms = self.clock.now_epoch_millis();
        let period = period_key(config.reset_interval, now);
        let ttl = period_ttl_seconds(config.reset_interval);

        if tokens_used > 0 {
            self.store
                .add_counter(&self.key_tokens(scope, &period), tokens_used, ttl, now_ms)
                .await?;
        }
        if requests_used > 0 {
            self.store
                .add_counter(&self.key_requests(scope, &period), requests_used, ttl, now_ms)
                .await?;
        }
        Ok(())
    }
}

fn utc_date(epoch_seconds: u64) -> Date {
    OffsetDateTime::from_unix_timestamp(epoch_seconds as i64)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
        .date()
}

fn period_key(interval: QuotaResetInterval, epoch_seconds: u64) -> String {
    let date = utc_date(epoch_seconds);
    match interval {
        QuotaResetInterval::Daily => format!(
            "{:04}-{:02}-{:02}",
            date.year(),
            u8::from(date.month()),
            date.day()
        ),
        QuotaResetInterval::Weekly => {
            let (year, week, _) = date.to_iso_week_date();
            format!("{year:04}-W{week:02}")
        }
        QuotaResetInterval::Monthly => {
            format!("{:04}-{:02}", date.year(), u8::from(date.month()))
        }
        QuotaResetInterval::Never => "all".to_string(),
    }
}

/// Next period boundary (midnight UTC) as an absolute timestamp; `None`
/// for quotas that never reset.
fn period_end_epoch_seconds(interval: QuotaResetInterval, epoch_seconds: u64) -> Option<u64> {
    let date = utc_date(epoch_seconds);
    let boundary = match interval {
        QuotaResetInterval::Daily => date.saturating_add(TimeDuration::days(1)),
        QuotaResetInterval::Weekly => {
            let days_to_monday = 7 - u64::from(date.weekday().number_days_from_monday());
            date.saturating_add(TimeDuration::days(days_to_monday as i64))
        }
        QuotaResetInterval::Monthly => {
            let (year, month) = match date.month() {
                Month::December => (date.year() + 1, Month::January),
                month => (date.year(), month.next()),
            };
            Date::from_calendar_date(year, month, 1).unwrap_or(date)
        }
        QuotaResetInterval::Never => return None,
    };
    let ts = boundary.midnight().assume_utc().unix_timestamp();
    Some(ts.max(0) as u64)
}

fn period_ttl_seconds(interval: QuotaResetInterval) -> Option<u64> {
    match interval {
        QuotaResetInterval::Daily => Some(86_400 + TTL_SLACK_SECONDS),
        QuotaResetInterval::Weekly => Some(7 * 86_400 + TTL_SLACK_SECONDS),
        QuotaResetInterval::Monthly => Some(31 * 86_400 + TTL_SLACK_SECONDS),
        QuotaResetInterval::Never => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryCounterStore;

    const DAY: u64 = 86_400;

    fn manager(clock: Arc<ManualClock>) -> QuotaManager {
        QuotaManager::new(Arc::new(MemoryCounterStore::new()), clock)
    }

    fn daily(max_tokens: u64) -> QuotaConfig {
        QuotaConfig {
            max_tokens: Some(max_tokens),
            max_requests: None,
            reset_interval: QuotaResetInterval::Daily,
        }
    }

    #[tokio::test]
    async fn daily_token_quota_exhausts_and_reports_next_midnight() {
        // noon on day 20 (UTC)
        let clock = Arc::new(ManualClock::new(20 * DAY + 12 * 3_600));
        let manager = manager(clock);
        let config = daily(1_000);

        manager.check_quota("t1", &config, 1_000, 1).await.expect("allowed");
        manager.record_usage("t1", &config, 1_000, 1).await.expect("recorded");

        let err = manager.check_quota("t1", &config, 1, 0).await.unwrap_err();
        match err {
            RouteError::QuotaExceeded {
                reset_at_epoch_seconds,
            } => assert_eq!(reset_at_epoch_seconds, 21 * DAY),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn quota_resets_at_the_calendar_boundary() {
        let clock = Arc::new(ManualClock::new(20 * DAY + 12 * 3_600));
        let manager = manager(clock.clone());
        let config = daily(1_000);

        manager.record_usage("t1", &config, 1_000, 1).await.expect("recorded");
        assert!(manager.check_quota("t1", &config, 1, 0).await.is_err());

        // roll into the next day: new period key, fresh usage
        clock.advance_seconds(DAY);
        manager
            .check_quota("t1", &config, 1_000, 1)
            .await
            .expect("fresh period");
    }

    #[tokio::test]
    async fn request_quota_is_enforced_independently() {
        let clock = Arc::new(ManualClock::new(20 * DAY));
        let manager = manager(clock);
        let config = QuotaConfig {
            max_tokens: None,
            max_requests: Some(2),
            reset_interval: QuotaResetInterval::Daily,
        };

        manager.record_usage("t1", &config, 50, 2).await.expect("recorded");
        let err = manager.check_quota("t1", &config, 0, 1).await.unwrap_err();
        assert!(matches!(err, RouteError::QuotaExceeded { .. }));
    }

    #[tokio::test]
    async fn unlimited_config_never_rejects() {
        let clock = Arc::new(ManualClock::new(20 * DAY));
        let manager = manager(clock);
        let config = QuotaConfig::default();

        manager
            .check_quota("t1", &config, u64::MAX, u64::MAX)
            .await
            .expect("no caps configured");
    }

    #[test]
    fn period_keys_follow_the_calendar() {
        let ts: u64 = 1_787_659_200; // 2026-08-25 12:00:00 UTC
        assert_eq!(period_key(QuotaResetInterval::Daily, ts), "2026-08-25");
        assert_eq!(period_key(QuotaResetInterval::Monthly, ts), "2026-08");
        assert_eq!(period_key(QuotaResetInterval::Weekly, ts), "2026-W35");
        assert_eq!(period_key(QuotaResetInterval::Never, ts), "all");
    }

    #[test]
    fn period_boundaries_land_on_utc_midnights() {
        let noon_day_20 = 20 * DAY + 12 * 3_600;
        assert_eq!(
            period_end_epoch_seconds(QuotaResetInterval::Daily, noon_day_20),
            Some(21 * DAY)
        );
        assert_eq!(
            period_end_epoch_seconds(QuotaResetInterval::Never, noon_day_20),
            None
        );

        // 1970-01-21 was a Wednesday; the next Monday is 1970-01-26 (day 25)
        assert_eq!(
            period_end_epoch_seconds(QuotaResetInterval::Weekly, noon_day_20),
            Some(25 * DAY)
        );

        // first of February 1970 is day 31
        assert_eq!(
            period_end_epoch_seconds(QuotaResetInterval::Monthly, noon_day_20),
            Some(31 * DAY)
        );
    }
}
