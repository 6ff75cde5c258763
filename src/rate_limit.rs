use std::{cell::Cell, time::Duration};

use tracing::instrument;

use crate::api::{Quota, QuotaSource};

/// Used when the service does not tell us its quota.
/// MediaWiki's default edit limit for new and logged-out users.
pub const DEFAULT_QUOTA: Quota = Quota {
    requests_per_window: 8,
    window_seconds: 60.0,
};

pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Fixed minimum spacing between two consecutive requests to the remote service.
///
/// Derived once per run and shared by every component that talks to the service. Not a token
/// bucket: every request of the run except the first waits out the full interval, whichever
/// component issues it. The quota query of [`RateLimiter::from_quota_source`] counts as the
/// first request.
#[derive(Debug, Clone)]
pub struct RateLimiter<S = ThreadSleeper> {
    interval: Duration,
    sleeper: S,
    issued: Cell<bool>,
}

impl RateLimiter<ThreadSleeper> {
    pub fn new(interval: Duration) -> Self {
        Self::with_sleeper(interval, ThreadSleeper)
    }

    pub fn from_quota_source(source: &mut impl QuotaSource) -> Self {
        Self::from_quota_source_with(source, ThreadSleeper)
    }
}

impl<S: Sleeper> RateLimiter<S> {
    pub fn with_sleeper(interval: Duration, sleeper: S) -> Self {
        Self {
            interval,
            sleeper,
            issued: Cell::new(false),
        }
    }

    pub fn from_quota(quota: Quota, sleeper: S) -> Self {
        let interval = match quota.interval() {
            Some(interval) => interval,
            None => {
                tracing::warn!(
                    message = "Degenerate rate limit quota, using the default",
                    requests_per_window = quota.requests_per_window,
                    window_seconds = quota.window_seconds,
                );
                default_interval()
            }
        };
        Self::with_sleeper(interval, sleeper)
    }

    #[instrument(skip_all)]
    pub fn from_quota_source_with(source: &mut impl QuotaSource, sleeper: S) -> Self {
        let limiter = Self::query_quota(source, sleeper);
        // the quota query itself was a request of this run
        limiter.issued.set(true);
        limiter
    }

    fn query_quota(source: &mut impl QuotaSource, sleeper: S) -> Self {
        match source.rate_limit_quota() {
            Ok(quota) => {
                let limiter = Self::from_quota(quota, sleeper);
                tracing::info!(
                    message = "Derived request interval from quota",
                    requests_per_window = quota.requests_per_window,
                    window_seconds = quota.window_seconds,
                    interval = ?limiter.interval
                );
                limiter
            }
            Err(error) => {
                tracing::warn!(
                    message = "Could not query the rate limit quota, using the default",
                    error = %error,
                    interval = ?default_interval()
                );
                Self::with_sleeper(default_interval(), sleeper)
            }
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    /// Call right before every remote request. Waits out the interval unless this is the first
    /// request of the run.
    pub fn before_request(&self) {
        if self.issued.replace(true) {
            self.pause();
        }
    }

    /// Wait out the interval unconditionally.
    pub fn pause(&self) {
        if self.interval.is_zero() {
            return;
        }
        tracing::trace!(message = "Pausing before next request", interval = ?self.interval);
        self.sleeper.sleep(self.interval);
    }
}

fn default_interval() -> Duration {
    // the default quota is well-formed
    DEFAULT_QUOTA
        .interval()
        .unwrap_or(Duration::from_millis(7500))
}
