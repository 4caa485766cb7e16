//! Small shared helpers.

use crate::error::Result;
use std::future::Future;
use std::time::{Duration, Instant};

/// Poll an async probe until it reports success or the time budget runs out.
///
/// Returns `Ok(true)` once the probe returns `true`, `Ok(false)` if the
/// budget elapses first, and propagates the probe's error immediately. A
/// `timeout` of `None` waits without limit. Sleeps `interval` between
/// probes, capped to the remaining budget, so the wait never busy-spins.
pub async fn poll_until<F, Fut>(
    mut probe: F,
    interval: Duration,
    timeout: Option<Duration>,
) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    loop {
        if probe().await? {
            return Ok(true);
        }
        let sleep = match timeout {
            None => interval,
            Some(budget) => {
                let remaining = budget.saturating_sub(start.elapsed());
                if remaining.is_zero() {
                    return Ok(false);
                }
                interval.min(remaining)
            }
        };
        tokio::time::sleep(sleep).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_poll_until_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let ok = poll_until(
            move || {
                let calls = Arc::clone(&calls2);
                async move { Ok(calls.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
            Duration::from_millis(5),
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap();
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let ok = poll_until(
            || async { Ok(false) },
            Duration::from_millis(5),
            Some(Duration::from_millis(30)),
        )
        .await
        .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_poll_until_propagates_error() {
        let res: Result<bool> = poll_until(
            || async { Err(Error::Internal("probe failed".to_string())) },
            Duration::from_millis(5),
            None,
        )
        .await;
        assert!(res.is_err());
    }
}
