//! Bounded polling of read-only probes

use std::future::Future;
use std::time::Duration;

use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::trace;

use crate::Error;

/// Poll `check_fn` every `poll_interval` until it returns `Ok(true)` or
/// `timeout` elapses.
///
/// The deadline and the tick are separate clocks: a slow probe does not push
/// the deadline out, and the deadline can fire in the middle of a probe.
/// Probe errors are treated like "not yet" and retried on the next tick.
///
/// The first probe runs one interval after the call.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    probe: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let probe = probe.into();
    let deadline = sleep(timeout);
    tokio::pin!(deadline);

    let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut deadline => return Err(Error::timeout(probe, timeout)),
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            biased;
            _ = &mut deadline => return Err(Error::timeout(probe, timeout)),
            outcome = check_fn() => outcome,
        };

        match outcome {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(probe = %probe, "condition not met yet"),
            Err(e) => trace!(probe = %probe, error = %e, "probe failed, retrying"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn never_succeeding_probe_times_out_at_deadline() {
        let start = Instant::now();
        let result = poll_until(
            Duration::from_secs(2),
            Duration::from_millis(500),
            "runtime active",
            || async { Ok(false) },
        )
        .await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_millis(2500));
        match result {
            Err(Error::Timeout { probe, timeout }) => {
                assert_eq!(probe, "runtime active");
                assert_eq!(timeout, Duration::from_secs(2));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_as_soon_as_probe_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let start = Instant::now();

        poll_until(
            Duration::from_secs(10),
            Duration::from_secs(1),
            "third time lucky",
            move || {
                let counter = counter.clone();
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst) == 2) }
            },
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        poll_until(
            Duration::from_secs(5),
            Duration::from_millis(100),
            "flaky",
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::internal("connection reset"))
                    } else {
                        Ok(true)
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Story: a probe that hangs longer than the deadline must not hold the
    /// caller past the timeout.
    #[tokio::test(start_paused = true)]
    async fn slow_probe_does_not_extend_deadline() {
        let start = Instant::now();
        let result = poll_until(
            Duration::from_secs(2),
            Duration::from_millis(500),
            "hung probe",
            || async {
                sleep(Duration::from_secs(60)).await;
                Ok(true)
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
