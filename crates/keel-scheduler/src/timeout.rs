use std::{future::Future, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation timed out after {0:?}")]
pub struct TimedOut(pub Duration);

/// Awaits `future` for at most `duration`. The future is dropped on timeout.
pub async fn with_timeout<F>(duration: Duration, future: F) -> Result<F::Output, TimedOut>
where
    F: Future,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimedOut(duration))
}

/// Races `future` against `duration` without cancelling it.
///
/// If the timer wins, `future` keeps running on a spawned task and `on_late` receives its
/// output once it resolves.
pub async fn race_with_timeout<F, C>(
    duration: Duration,
    future: F,
    on_late: C,
) -> Result<F::Output, TimedOut>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
    C: FnOnce(F::Output) + Send + 'static,
{
    let mut future = Box::pin(future);
    tokio::select! {
        biased;
        output = &mut future => Ok(output),
        _ = tokio::time::sleep(duration) => {
            tracing::debug!(
                target = "keel.scheduler",
                timeout_ms = duration.as_millis() as u64,
                "operation outlived its timeout; continuing in the background"
            );
            tokio::spawn(async move {
                let output = future.await;
                on_late(output);
            });
            Err(TimedOut(duration))
        }
    }
}
