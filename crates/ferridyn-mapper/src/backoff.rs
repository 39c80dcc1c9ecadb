//! Bounded retries with exponential backoff and jitter.
//!
//! [`run_with_backoff`] repeatedly invokes a fallible async operation. Errors
//! the caller classifies as transient are retried after a growing delay;
//! anything else aborts immediately. Retrying stops with
//! [`BackoffError::TimedOut`] once either the attempt budget or the
//! wall-clock budget is spent, whichever comes first.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

/// Retry budget and delay curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffOptions {
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    pub max_attempts: u32,
    #[serde(rename = "max_time_ms", with = "millis")]
    pub max_time: Duration,
    pub factor: f64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            max_attempts: 10,
            max_time: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl BackoffOptions {
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn max_time(mut self, budget: Duration) -> Self {
        self.max_time = budget;
        self
    }

    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Delay sequence: `initial_delay`, then `min(max_delay, previous * factor)`,
/// each with ±10% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    previous: Option<Duration>,
}

impl Backoff {
    pub fn new(options: &BackoffOptions) -> Self {
        Self {
            initial: options.initial_delay,
            max: options.max_delay,
            factor: options.factor,
            previous: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = match self.previous {
            None => self.initial.min(self.max),
            // Saturates at `max` for factors that overflow a Duration.
            Some(prev) => {
                let grown = prev.as_secs_f64() * self.factor.max(1.0);
                Duration::try_from_secs_f64(grown).map_or(self.max, |d| d.min(self.max))
            }
        };
        self.previous = Some(base);
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        Duration::try_from_secs_f64(base.as_secs_f64() * jitter).unwrap_or(base)
    }
}

/// Why [`run_with_backoff`] gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffError<E> {
    /// The operation failed with an error that must not be retried.
    Aborted(E),
    /// The attempt or time budget ran out. `last` is the final operation
    /// error, if the last attempt completed at all.
    TimedOut {
        attempts: u32,
        elapsed: Duration,
        last: Option<E>,
    },
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the budget in `options` is exhausted.
///
/// Attempts are sequential. The first success is returned unmodified.
pub async fn run_with_backoff<T, E, F, Fut>(
    options: &BackoffOptions,
    should_retry: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, BackoffError<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let mut backoff = Backoff::new(options);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let remaining = options.max_time.saturating_sub(started.elapsed());
        let error = match tokio::time::timeout(remaining, operation()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => {
                return Err(BackoffError::TimedOut {
                    attempts,
                    elapsed: started.elapsed(),
                    last: None,
                });
            }
        };

        if !should_retry(&error) {
            return Err(BackoffError::Aborted(error));
        }

        let delay = backoff.next_delay();
        let elapsed = started.elapsed();
        if attempts >= options.max_attempts || elapsed + delay > options.max_time {
            return Err(BackoffError::TimedOut {
                attempts,
                elapsed,
                last: Some(error),
            });
        }

        warn!(attempt = attempts, delay = ?delay, error = %error, "retrying after transient failure");
        tokio::time::sleep(delay).await;
    }
}
