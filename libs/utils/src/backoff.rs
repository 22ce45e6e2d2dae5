use std::fmt::{Debug, Display};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Schedule for [`retry`]: the wait before attempt `n` is
/// `base_seconds * 2^(n-1)`, capped at `cap_seconds`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub attempts: u32,
    pub base_seconds: f64,
    pub cap_seconds: f64,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, base_seconds: f64) -> Self {
        Self {
            attempts,
            base_seconds,
            cap_seconds: DEFAULT_CAP_SECONDS,
        }
    }
}

pub const DEFAULT_CAP_SECONDS: f64 = 60.0;

/// Delay in seconds before attempt `n`. The first attempt is `n = 0` and
/// waits nothing.
pub fn exponential_backoff_duration_seconds(n: u32, base_seconds: f64, cap_seconds: f64) -> f64 {
    if n == 0 {
        0.0
    } else {
        (base_seconds * 2_f64.powi(n as i32 - 1)).min(cap_seconds)
    }
}

pub async fn exponential_backoff(
    n: u32,
    base_seconds: f64,
    cap_seconds: f64,
    cancel: &CancellationToken,
) {
    let backoff_duration_seconds = exponential_backoff_duration_seconds(n, base_seconds, cap_seconds);
    if backoff_duration_seconds > 0.0 {
        info!("Backoff: waiting {backoff_duration_seconds} seconds before retrying");
        drop(
            tokio::time::timeout(
                Duration::from_secs_f64(backoff_duration_seconds),
                cancel.cancelled(),
            )
            .await,
        );
    }
}

/// Retries `op` according to `policy`.
///
/// Returns `None` if the cancellation token fired, otherwise the result of
/// the last attempt. `is_permanent` short-circuits errors that retrying
/// cannot fix.
pub async fn retry<T, O, F, E>(
    mut op: O,
    is_permanent: impl Fn(&E) -> bool,
    policy: RetryPolicy,
    description: &str,
    cancel: &CancellationToken,
) -> Option<Result<T, E>>
where
    O: FnMut() -> F,
    F: std::future::Future<Output = Result<T, E>>,
    E: Display + Debug + 'static,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        let result = op().await;
        match &result {
            Ok(_) => {
                if attempt > 0 {
                    info!("{description} succeeded after {attempt} retries");
                }
                return Some(result);
            }
            Err(e) if is_permanent(e) => {
                return Some(result);
            }
            Err(e) => {
                if attempt + 1 >= policy.attempts {
                    warn!(
                        "{description} still failed after {} attempts, giving up: {e:#}",
                        policy.attempts
                    );
                    return Some(result);
                }
                info!("{description} failed, will retry (attempt {attempt}): {e:#}");
            }
        }
        exponential_backoff(attempt + 1, policy.base_seconds, policy.cap_seconds, cancel).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_durations() {
        assert_eq!(exponential_backoff_duration_seconds(0, 1.0, 60.0), 0.0);
        assert_eq!(exponential_backoff_duration_seconds(1, 1.0, 60.0), 1.0);
        assert_eq!(exponential_backoff_duration_seconds(2, 1.0, 60.0), 2.0);
        assert_eq!(exponential_backoff_duration_seconds(3, 1.0, 60.0), 4.0);
        // base 3s schedule used by the mirror executors
        assert_eq!(exponential_backoff_duration_seconds(1, 3.0, 60.0), 3.0);
        assert_eq!(exponential_backoff_duration_seconds(2, 3.0, 60.0), 6.0);
        // the cap wins eventually
        assert_eq!(exponential_backoff_duration_seconds(30, 1.0, 60.0), 60.0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Option<Result<(), anyhow::Error>> = retry(
            || async {
                calls.fetch_add(1, Ordering::Relaxed);
                anyhow::bail!("nope")
            },
            |_| false,
            RetryPolicy::new(3, 1.0),
            "test op",
            &CancellationToken::new(),
        )
        .await;
        assert!(result.unwrap().is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Option<Result<(), anyhow::Error>> = retry(
            || async {
                calls.fetch_add(1, Ordering::Relaxed);
                anyhow::bail!("permanent")
            },
            |_| true,
            RetryPolicy::new(3, 1.0),
            "test op",
            &CancellationToken::new(),
        )
        .await;
        assert!(result.unwrap().is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_none_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Option<Result<(), anyhow::Error>> = retry(
            || async { Ok(()) },
            |_| false,
            RetryPolicy::new(3, 1.0),
            "test op",
            &cancel,
        )
        .await;
        assert!(result.is_none());
    }
}
