//! Retry strategies for transient transport failures.
//!
//! Sends between the controller and workers are non-blocking and can surface
//! backpressure; worker handshakes can race a controller that is still
//! starting up. Both are transient conditions that the caller retries with a
//! [`RetryStrategy`] rather than treating as fatal.

use std::{num::NonZeroU32, time::Duration};

use futures::Future;

/// How to respond to a transient failure.
///
/// - `Immediate`: retry right away, up to `max_retries` times.
/// - `After`: retry after a fixed pause.
/// - `Exponential`: retry with exponential backoff between the two bounds.
#[derive(Debug, Clone, Copy)]
pub enum RetryStrategy {
    Immediate {
        max_retries: NonZeroU32,
    },
    After {
        max_retries: NonZeroU32,
        duration: Duration,
    },
    Exponential {
        min_duration: Duration,
        max_duration: Duration,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::After {
            max_retries: NonZeroU32::new(5).unwrap(),
            duration: Duration::from_millis(20),
        }
    }
}

impl RetryStrategy {
    /// Drive `f` to success under this strategy, returning the last error
    /// once the policy is exhausted.
    pub async fn retry<O, E, Fut, F>(self, f: F) -> std::result::Result<O, E>
    where
        E: std::fmt::Debug,
        Fut: Future<Output = std::result::Result<O, E>>,
        F: Fn() -> Fut,
    {
        match self {
            Self::Immediate { max_retries } => retry_simple(f, max_retries, None).await,
            Self::After {
                max_retries,
                duration,
            } => retry_simple(f, max_retries, Some(duration)).await,
            Self::Exponential {
                min_duration,
                max_duration,
            } => {
                let backoff = backoff::ExponentialBackoffBuilder::new()
                    .with_initial_interval(min_duration)
                    .with_max_elapsed_time(Some(max_duration))
                    .build();
                backoff::future::retry(backoff, || async {
                    f().await.map_err(backoff::Error::transient)
                })
                .await
            }
        }
    }
}

async fn retry_simple<O, E, Fut, F>(
    f: F,
    max_retries: NonZeroU32,
    duration: Option<Duration>,
) -> std::result::Result<O, E>
where
    E: std::fmt::Debug,
    Fut: Future<Output = std::result::Result<O, E>>,
    F: Fn() -> Fut,
{
    let mut num_retries = 0;
    let mut result = f().await;
    while let Err(err) = result {
        if num_retries >= max_retries.get() {
            return Err(err);
        }
        num_retries += 1;
        if let Some(duration) = duration {
            tokio::time::sleep(duration).await;
        }
        result = f().await;
    }
    Ok(result.unwrap())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn immediate_recovers_within_allowed_retries() {
        let attempts = AtomicU32::new(0);
        let strategy = RetryStrategy::Immediate {
            max_retries: NonZeroU32::new(3).unwrap(),
        };
        let result: Result<u32, &str> = strategy
            .retry(|| async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("not yet")
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn immediate_exhausts_and_returns_last_error() {
        let strategy = RetryStrategy::Immediate {
            max_retries: NonZeroU32::new(2).unwrap(),
        };
        let result: Result<(), &str> = strategy.retry(|| async { Err("still down") }).await;
        assert_eq!(result.unwrap_err(), "still down");
    }
}
