use std::time::Duration;

use rand::Rng;

/// Retry budget for rate-limited and transient server responses.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based). Exponential, capped at
    /// `max_backoff`, with equal jitter when enabled.
    pub(crate) fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let half = base / 2;
        let spread = half.as_millis() as u64;
        let extra = rand::thread_rng().gen_range(0..=spread);
        half + Duration::from_millis(extra)
    }

    /// Vendor-provided delay wins but is still capped by `max_backoff`.
    pub(crate) fn rate_limit_delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(d) => d.min(self.max_backoff),
            None => self.backoff(retry),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncPolicy {
    /// Minimum time between unforced state refreshes of one account.
    pub min_refresh_interval: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            min_refresh_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandPolicy {
    pub poll_interval: Duration,
    pub confirm_timeout: Duration,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            confirm_timeout: Duration::from_secs(60),
        }
    }
}
