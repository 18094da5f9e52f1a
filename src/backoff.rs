//! Retries with exponential backoff and jitter.
//!
//! # Example
//!
//! ```ignore
//! use ad_unmigration::backoff::{retry_with_backoff, Backoff};
//!
//! let created = retry_with_backoff(&Backoff::api(), "create crtb", Error::is_internal, || async {
//!     api.create(&crtb).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;

/// Retry schedule: the first wait is `duration`, every following wait is `factor` times longer, each wait
/// varies randomly by up to `jitter` of its length, and the operation runs at most `steps` times.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    pub duration: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub steps: u32,
}

impl Backoff {
    /// From 2 seconds for minor blips up to about 51 seconds for the last wait, around two and a half
    /// minutes of waiting in total.
    pub fn directory() -> Self {
        Self {
            duration: Duration::from_secs(2),
            factor: 1.5,
            jitter: 0.1,
            steps: 10,
        }
    }

    /// Used for api writes, which fail with internal errors when the admission webhook is overwhelmed.
    pub fn api() -> Self {
        Self {
            duration: Duration::from_secs(5),
            factor: 1.1,
            jitter: 0.1,
            steps: 10,
        }
    }

    /// Runs every attempt immediately. Handy in tests.
    pub fn immediate(steps: u32) -> Self {
        Self {
            duration: Duration::ZERO,
            factor: 1.0,
            jitter: 0.0,
            steps,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let variance = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + variance)).max(0.0))
    }

    /// The waits between attempts, without jitter.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut delay = self.duration;
        (1..self.steps).map(move |_| {
            let current = delay;
            delay = Duration::from_secs_f64(delay.as_secs_f64() * self.factor);
            current
        })
    }
}

/// Runs `operation` until it succeeds, fails with an error that `is_retryable` rejects, or `backoff.steps`
/// attempts have been made.
///
/// Errors rejected by `is_retryable` are returned as they are. Running out of attempts returns
/// [`Error::RetriesExhausted`] wrapping the last error.
pub async fn retry_with_backoff<T, F, Fut, P>(
    backoff: &Backoff,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let steps = backoff.steps.max(1);
    let mut delays = backoff.delays();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let error = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !is_retryable(&e) => return Err(e),
            Err(e) => e,
        };

        let Some(delay) = delays.next().filter(|_| attempt < steps) else {
            return Err(Error::RetriesExhausted {
                operation: operation_name.to_owned(),
                attempts: attempt,
                source: Box::new(error),
            });
        };

        let delay = backoff.jittered(delay);
        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %error,
            delay_ms = delay.as_millis(),
            "Operation failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
