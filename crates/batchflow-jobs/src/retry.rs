//! Retry policy with exponential backoff.
//!
//! All retrying of external calls goes through [`RetryPolicy::execute`]; the
//! scheduler never loops on its own.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio_retry2::strategy::jitter_range;
use tokio_retry2::{Retry, RetryError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use batchflow_core::{defaults, ErrorKind, ItemError};

/// Bounded exponential backoff.
///
/// Attempt `n` (zero-based) that fails with a retryable error is followed by a
/// wait of `base_delay * 2^n`, capped at `max_delay`. At most
/// `max_retries + 1` attempts are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `[0.5, 1.0]` to spread out
    /// concurrent retries.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::MAX_RETRIES,
            base_delay: Duration::from_millis(defaults::RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(defaults::RETRY_MAX_DELAY_MS),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Create policy from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `BATCH_MAX_RETRIES` | `3` | Retries after the first attempt |
    /// | `BATCH_RETRY_BASE_MS` | `1000` | Base backoff delay |
    /// | `BATCH_RETRY_MAX_MS` | `60000` | Backoff cap |
    /// | `BATCH_RETRY_JITTER` | `false` | Randomize delays |
    pub fn from_env() -> Self {
        let max_retries = std::env::var("BATCH_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults::MAX_RETRIES);

        let base_ms = std::env::var("BATCH_RETRY_BASE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::RETRY_BASE_DELAY_MS);

        let max_ms = std::env::var("BATCH_RETRY_MAX_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::RETRY_MAX_DELAY_MS);

        let jitter = std::env::var("BATCH_RETRY_JITTER")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Self {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            jitter,
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether the attempt numbered `attempt` (zero-based) may be followed by
    /// another one.
    pub fn should_retry(&self, error: &ItemError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_retries
    }

    /// Backoff after the failed attempt numbered `attempt`, before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Wait before the next attempt, honouring a server-supplied hint for
    /// rate-limit errors.
    pub fn backoff_for(&self, error: &ItemError, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        let computed = if self.jitter {
            jitter_range(0.5, 1.0)(delay).min(delay)
        } else {
            delay
        };
        match (error.kind, error.retry_after) {
            (ErrorKind::RateLimit, Some(hint)) => hint.min(self.max_delay),
            _ => computed,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// `op` receives the zero-based attempt number. The token is checked before
    /// every attempt; an attempt already running is never interrupted. The
    /// last error is returned when retries are exhausted.
    pub async fn execute<F, Fut, T>(&self, mut op: F, token: &CancellationToken) -> Result<T, ItemError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ItemError>>,
    {
        let policy = *self;
        let attempts = AtomicU32::new(0);
        let attempts_ref = &attempts;
        let op_ref = &mut op;

        // the strategy only bounds the loop; each transient error carries its
        // own delay so rate-limit hints take effect
        let strategy = (0..policy.max_retries).map(move |attempt| policy.delay_for(attempt));

        Retry::spawn(strategy, move || {
            let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst);
            let fut = if token.is_cancelled() {
                None
            } else {
                Some(op_ref(attempt))
            };
            async move {
                let Some(fut) = fut else {
                    return Err(RetryError::Permanent(ItemError::cancelled(format!(
                        "stopped before attempt {}",
                        attempt + 1
                    ))));
                };
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(err) if policy.should_retry(&err, attempt) => {
                        let delay = policy.backoff_for(&err, attempt);
                        debug!(
                            subsystem = "jobs",
                            component = "retry",
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Transient failure, retrying"
                        );
                        Err(RetryError::Transient {
                            err,
                            retry_after: Some(delay),
                        })
                    }
                    Err(err) => {
                        if err.is_retryable() {
                            warn!(
                                subsystem = "jobs",
                                component = "retry",
                                attempts = attempt + 1,
                                error = %err,
                                "Retry budget exhausted"
                            );
                        }
                        Err(RetryError::Permanent(err))
                    }
                }
            }
        })
        .await
    }
}
