//! Termination and teardown of a restore run.
//!
//! The terminated flag is set once, by the first of a signal or a fatal
//! error. Cleanup runs once, by whichever of the signal path or the normal
//! teardown gets there first; the other waits for it to finish.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Completed,
    Terminated,
    Failed,
    Cleaned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    Signal,
    Fatal,
}

/// Teardown work registered by the restore once it owns cluster resources.
#[async_trait]
pub trait Cleanup: Send + Sync {
    async fn cleanup(&self, restore_failed: bool, cause: Option<TerminationCause>) -> Result<()>;
}

pub struct Lifecycle {
    token: CancellationToken,
    cause: OnceLock<TerminationCause>,
    state: Mutex<RunState>,
    cleanup_claimed: AtomicBool,
    cleanup_done: watch::Sender<bool>,
    action: Mutex<Option<Arc<dyn Cleanup>>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (cleanup_done, _) = watch::channel(false);
        Lifecycle {
            token: CancellationToken::new(),
            cause: OnceLock::new(),
            state: Mutex::new(RunState::Running),
            cleanup_claimed: AtomicBool::new(false),
            cleanup_done,
            action: Mutex::new(None),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_terminated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cause(&self) -> Option<TerminationCause> {
        self.cause.get().copied()
    }

    pub fn state(&self) -> RunState {
        self.state.lock().map(|s| *s).unwrap_or(RunState::Failed)
    }

    fn advance(&self, next: RunState) {
        if let Ok(mut state) = self.state.lock() {
            let allowed = match (*state, next) {
                (RunState::Running, RunState::Completed | RunState::Terminated | RunState::Failed) => true,
                (RunState::Cleaned, _) => false,
                (_, RunState::Cleaned) => true,
                _ => false,
            };
            if allowed {
                *state = next;
            }
        }
    }

    /// Sets the terminated flag. Returns true only for the caller that set
    /// it; later callers leave the recorded cause untouched.
    pub fn terminate(&self, cause: TerminationCause) -> bool {
        let first = self.cause.set(cause).is_ok();
        if first {
            self.advance(match cause {
                TerminationCause::Signal => RunState::Terminated,
                TerminationCause::Fatal => RunState::Failed,
            });
            self.token.cancel();
        }
        first
    }

    pub fn mark_completed(&self) {
        self.advance(RunState::Completed);
    }

    pub fn mark_failed(&self) {
        self.advance(RunState::Failed);
    }

    pub fn register_cleanup(&self, action: Arc<dyn Cleanup>) {
        if let Ok(mut slot) = self.action.lock() {
            *slot = Some(action);
        }
    }

    /// Runs the registered cleanup exactly once. A second caller blocks until
    /// the first one has finished. Errors and panics inside the cleanup are
    /// logged and never escape.
    pub async fn do_cleanup(&self, restore_failed: bool) {
        if self.cleanup_claimed.swap(true, Ordering::SeqCst) {
            self.wait_for_cleanup().await;
            return;
        }
        debug!("Beginning cleanup");
        let action = self.action.lock().ok().and_then(|slot| slot.clone());
        if let Some(action) = action {
            let cause = self.cause();
            match tokio::spawn(async move { action.cleanup(restore_failed, cause).await }).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Encountered error during cleanup: {}", e),
                Err(e) => warn!("Encountered error during cleanup: {}", e),
            }
        }
        self.advance(RunState::Cleaned);
        debug!("Cleanup complete");
        self.cleanup_done.send_replace(true);
    }

    pub async fn wait_for_cleanup(&self) {
        let mut done = self.cleanup_done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Resolves once a SIGINT or SIGTERM has been received and cleanup for it
/// has completed.
pub async fn handle_signals(lifecycle: Arc<Lifecycle>) -> Result<()> {
    wait_for_signal().await?;
    warn!("Received a termination signal, aborting restore process");
    if !lifecycle.terminate(TerminationCause::Signal) {
        info!("Restore was already stopping; waiting for cleanup");
    }
    lifecycle.do_cleanup(true).await;
    Ok(())
}
