//! Token-bucket rate limiting for calls to an external resource.
//!
//! Bounds permits to "no more than `permits` per `period`" using a GCRA limiter
//! from `governor`. Waiters are served in arrival order.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use batchflow_core::{defaults, Error, Result};

type DirectLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Permits granted per period.
    pub permits: u32,
    /// Length of the rolling window.
    pub period: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            permits: defaults::RATE_LIMIT_PERMITS,
            period: Duration::from_millis(defaults::RATE_LIMIT_PERIOD_MS),
        }
    }
}

impl RateLimitConfig {
    pub fn new(permits: u32, period: Duration) -> Self {
        Self { permits, period }
    }

    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `BATCH_RATE_LIMIT_PERMITS` | `10` | Permits per period |
    /// | `BATCH_RATE_LIMIT_PERIOD_MS` | `1000` | Period length in milliseconds |
    pub fn from_env() -> Self {
        let permits = std::env::var("BATCH_RATE_LIMIT_PERMITS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults::RATE_LIMIT_PERMITS);

        let period_ms = std::env::var("BATCH_RATE_LIMIT_PERIOD_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::RATE_LIMIT_PERIOD_MS);

        Self {
            permits,
            period: Duration::from_millis(period_ms),
        }
    }

    /// Minimum spacing between two grants.
    pub fn emission_interval(&self) -> Duration {
        self.period / self.permits.max(1)
    }
}

/// Decrements the waiter count when an acquisition finishes or is dropped.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared rate limiter.
///
/// Grants are spaced by `period / permits` with a burst of one, so no rolling
/// window of length `period` ever sees more than `permits` grants. A cost of
/// `n` units is paid one unit at a time while holding a fair mutex, which
/// keeps waiters in FIFO order and stops small requests from starving a large
/// one.
pub struct RateLimiter {
    config: RateLimitConfig,
    limiter: DirectLimiter,
    gate: Mutex<()>,
    waiting: AtomicUsize,
    paused_until: StdMutex<Option<Instant>>,
}

impl RateLimiter {
    /// Create a limiter; fails when `permits` or `period` is zero.
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        if config.permits == 0 {
            return Err(Error::Config("rate limit permits must be non-zero".into()));
        }
        let quota = Quota::with_period(config.emission_interval())
            .ok_or_else(|| Error::Config("rate limit period must be non-zero".into()))?
            .allow_burst(NonZeroU32::MIN);

        info!(
            subsystem = "jobs",
            component = "rate_limiter",
            op = "create",
            permits = config.permits,
            period_ms = config.period.as_millis() as u64,
            "Rate limiter configured"
        );

        Ok(Self {
            config,
            limiter: GovernorLimiter::direct(quota),
            gate: Mutex::new(()),
            waiting: AtomicUsize::new(0),
            paused_until: StdMutex::new(None),
        })
    }

    /// Create a limiter from `BATCH_RATE_LIMIT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(RateLimitConfig::from_env())
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Wait until `cost` units are available, then take them.
    ///
    /// Never fails. A cost of zero returns immediately.
    pub async fn acquire(&self, cost: u32) {
        if cost == 0 {
            return;
        }
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = WaitingGuard(&self.waiting);

        let _gate = self.gate.lock().await;
        self.wait_for_pause().await;
        for _ in 0..cost {
            self.limiter.until_ready().await;
        }
        debug!(
            subsystem = "jobs",
            component = "rate_limiter",
            op = "acquire",
            cost,
            "Permits granted"
        );
    }

    /// Like [`acquire`](Self::acquire), but gives up when `token` is cancelled.
    ///
    /// Units already taken before cancellation are not returned.
    pub async fn acquire_cancellable(&self, cost: u32, token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(Error::Cancelled("rate limiter wait aborted".into()));
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled("rate limiter wait aborted".into())),
            _ = self.acquire(cost) => Ok(()),
        }
    }

    /// Number of acquisitions currently waiting (including the one being
    /// served). Observability only.
    pub fn queue_length(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Hold back every grant for `duration`.
    ///
    /// Called when the downstream service reports throttling. Overlapping
    /// calls keep the later deadline.
    pub fn throttle(&self, duration: Duration) {
        let until = Instant::now() + duration;
        if let Ok(mut paused) = self.paused_until.lock() {
            if paused.map_or(true, |current| current < until) {
                *paused = Some(until);
            }
        }
        info!(
            subsystem = "jobs",
            component = "rate_limiter",
            op = "throttle",
            pause_ms = duration.as_millis() as u64,
            "Downstream throttling reported, pausing grants"
        );
    }

    async fn wait_for_pause(&self) {
        loop {
            let until = match self.paused_until.lock() {
                Ok(paused) => *paused,
                Err(_) => None,
            };
            match until {
                Some(until) if until > Instant::now() => tokio::time::sleep_until(until).await,
                _ => return,
            }
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("waiting", &self.queue_length())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant as StdInstant;

    // governor runs on the wall clock, so these tests use real time with
    // short periods.

    #[test]
    fn test_config_default() {
        let config = RateLimitConfig::default();
        assert_eq!(config.permits, 10);
        assert_eq!(config.period, Duration::from_secs(1));
        assert_eq!(config.emission_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_zero_permits_rejected() {
        let err = RateLimiter::new(RateLimitConfig::new(0, Duration::from_secs(1))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_zero_period_rejected() {
        let err = RateLimiter::new(RateLimitConfig::new(5, Duration::ZERO)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_zero_cost_returns_immediately() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, Duration::from_secs(60))).unwrap();
        limiter.acquire(1).await;
        let start = StdInstant::now();
        limiter.acquire(0).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_grants_are_spaced_by_emission_interval() {
        let period = Duration::from_millis(200);
        let limiter = RateLimiter::new(RateLimitConfig::new(4, period)).unwrap();

        let start = StdInstant::now();
        for _ in 0..5 {
            limiter.acquire(1).await;
        }
        // 5 grants need at least 4 emission intervals (= one full period)
        assert!(start.elapsed() >= period - Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_multi_unit_cost_waits_for_capacity() {
        let period = Duration::from_millis(200);
        let limiter = RateLimiter::new(RateLimitConfig::new(4, period)).unwrap();

        let start = StdInstant::now();
        limiter.acquire(5).await;
        assert!(start.elapsed() >= period - Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_cancelled_wait_returns_error() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, Duration::from_secs(60))).unwrap();
        limiter.acquire(1).await;

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let start = StdInstant::now();
        let err = limiter.acquire_cancellable(1, &token).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(limiter.queue_length(), 0);
    }

    #[tokio::test]
    async fn test_queue_length_counts_waiters() {
        let limiter =
            Arc::new(RateLimiter::new(RateLimitConfig::new(1, Duration::from_secs(60))).unwrap());
        limiter.acquire(1).await;
        assert_eq!(limiter.queue_length(), 0);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let l = limiter.clone();
            handles.push(tokio::spawn(async move { l.acquire(1).await }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.queue_length(), 3);

        for h in handles {
            h.abort();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.queue_length(), 0);
    }

    #[tokio::test]
    async fn test_waiters_served_in_arrival_order() {
        let limiter =
            Arc::new(RateLimiter::new(RateLimitConfig::new(20, Duration::from_millis(200))).unwrap());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let l = limiter.clone();
            let o = order.clone();
            handles.push(tokio::spawn(async move {
                // a large request first, then small ones that must not overtake it
                let cost = if i == 0 { 4 } else { 1 };
                l.acquire(cost).await;
                o.lock().unwrap().push(i);
            }));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_throttle_pauses_grants() {
        let limiter =
            RateLimiter::new(RateLimitConfig::new(100, Duration::from_millis(100))).unwrap();
        limiter.throttle(Duration::from_millis(100));

        let start = StdInstant::now();
        limiter.acquire(1).await;
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
