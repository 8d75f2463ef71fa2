//! Bounded attempt loop with optional backoff
//!
//! Downloads run the external tool up to [`RetryConfig::max_attempts`] times.
//! Each failure is classified; errors that say another attempt is pointless
//! (see [`IsRetryable`]) stop the loop early.
//!
//! # Example
//!
//! ```no_run
//! use dlbox::retry::{IsRetryable, download_with_retry};
//! use dlbox::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! download_with_retry(&config, |attempt| async move {
//!     println!("attempt {attempt}");
//!     Ok::<_, MyError>(())
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::TaskError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
pub trait IsRetryable {
    /// Returns true if another attempt might succeed
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for TaskError {
    fn is_retryable(&self) -> bool {
        match self {
            // Content is gone or blocked, no egress change will help
            TaskError::VideoNotAvailable => false,
            // Likely the egress address; the next attempt draws a new one
            TaskError::ConnectionForciblyClosed => true,
            TaskError::Unknown => true,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or the budget runs out
///
/// `operation` receives the 1-based attempt number. The first delay is
/// `initial_delay`; later delays grow by `backoff_multiplier` up to `max_delay`.
/// A zero delay skips sleeping altogether.
///
/// Returns the successful value or the error of the last attempt.
pub async fn download_with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    let mut delay = config.initial_delay;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                tracing::warn!(
                    error = %e,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying"
                );

                if !delay.is_zero() {
                    let wait = if config.jitter { add_jitter(delay) } else { delay };
                    tokio::time::sleep(wait).await;

                    let next = Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                    delay = next.min(config.max_delay);
                }

                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(error = %e, attempts = attempt, "All attempts exhausted");
                } else {
                    tracing::error!(error = %e, attempt, "Attempt failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Add up to 100% random jitter: the result lies in `delay..=2 * delay`
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
