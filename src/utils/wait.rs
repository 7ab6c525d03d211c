use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::errors::{RestoreError, Result};

/// Polls `check` until it reports ready, the deadline passes, or the token
/// is cancelled. An error from `check` ends the wait immediately.
pub async fn wait_until<F, Fut>(
    what: &str,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(RestoreError::Cancelled(format!("stopped waiting for {}", what)));
        }
        if check().await? {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(RestoreError::Transport(format!(
                "Timed out after {:?} waiting for {}",
                timeout, what
            )));
        }
        let nap = poll_interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RestoreError::Cancelled(format!("stopped waiting for {}", what)));
            }
            _ = sleep(nap) => {}
        }
    }
}
