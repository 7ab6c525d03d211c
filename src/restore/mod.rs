// clusterrestore/src/restore/mod.rs
pub mod data;
pub mod db_restore;
pub mod logic;
pub mod parallel;
pub mod plugin;
pub mod remote;
pub mod report;
pub mod validation;

use std::sync::Arc;
use tracing::{error, info};

use crate::cluster::SshExecutor;
use crate::config::RestoreConfig;
use crate::errors::Result;
use crate::lifecycle::{Lifecycle, TerminationCause};
use db_restore::PgConnector;
use logic::RestoreContext;
use report::RestoreStatus;

/// Runs one restore to completion and reports how it ended. Cleanup has
/// finished and the report is written by the time this returns.
pub async fn run_restore_flow(config: RestoreConfig, lifecycle: Arc<Lifecycle>) -> Result<RestoreStatus> {
    let executor = Arc::new(SshExecutor::new()?);
    let restore_start = logic::restore_start_timestamp();
    let app_name = logic::application_name(&config.timestamp, &restore_start);
    let connector = Arc::new(PgConnector::new(&config.target_db_url, &app_name)?);
    let ctx = RestoreContext::new(config, restore_start, connector, executor, lifecycle.clone());
    Ok(finish(&ctx, &lifecycle, ctx.run().await).await)
}

/// How a run ended, once the lifecycle has had its say.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Completed,
    Interrupted,
    Failed,
}

impl Ending {
    fn of(outcome: &Result<u32>, cause: Option<TerminationCause>) -> Self {
        match outcome {
            Ok(_) => Ending::Completed,
            Err(e) if e.is_cancellation() => Ending::Interrupted,
            // Statements cut short by a signal surface as ordinary errors.
            Err(_) if cause == Some(TerminationCause::Signal) => Ending::Interrupted,
            Err(_) => Ending::Failed,
        }
    }
}

async fn finish(ctx: &RestoreContext, lifecycle: &Lifecycle, outcome: Result<u32>) -> RestoreStatus {
    let num_errors = *outcome.as_ref().unwrap_or(&0);
    let ending = Ending::of(&outcome, lifecycle.cause());
    match (&outcome, ending) {
        (Ok(_), _) => lifecycle.mark_completed(),
        (Err(e), Ending::Failed) => {
            error!("{}", e);
            lifecycle.terminate(TerminationCause::Fatal);
            lifecycle.mark_failed();
        }
        (Err(e), _) => info!("Restore interrupted: {}", e),
    }
    lifecycle.do_cleanup(ending != Ending::Completed).await;

    let terminated = lifecycle.cause() == Some(TerminationCause::Signal);
    let status = RestoreStatus::from_outcome(&outcome, num_errors, terminated);
    if let Some((path, report)) = ctx.report() {
        let message = outcome.as_ref().err().map(|e| e.to_string());
        if let Err(e) = report.write(&path, status, message.as_deref()) {
            error!("{}", e);
        }
    }
    match status {
        RestoreStatus::Success => info!("Restore completed successfully"),
        RestoreStatus::SuccessWithErrors => {
            info!("Restore completed with {} non-fatal error(s); see the log file for details", num_errors)
        }
        RestoreStatus::Failure => error!("Restore failed"),
        RestoreStatus::Terminated => info!("Restore terminated"),
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RestoreError;
    use crate::lifecycle::{Cleanup, RunState};
    use crate::testutils::{MockConnector, MockExecutor};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCleanup {
        calls: Mutex<Vec<(bool, Option<TerminationCause>)>>,
    }

    #[async_trait]
    impl Cleanup for RecordingCleanup {
        async fn cleanup(&self, restore_failed: bool, cause: Option<TerminationCause>) -> Result<()> {
            self.calls.lock().unwrap().push((restore_failed, cause));
            Ok(())
        }
    }

    fn context(lifecycle: &Arc<Lifecycle>) -> anyhow::Result<RestoreContext> {
        let raw: crate::config::RawJsonConfig = serde_json::from_value(serde_json::json!({
            "target_database_url": "postgres://gpadmin@cdw:5432/postgres",
            "restore_options": { "timestamp": "20240101010101", "backup_dir": "/backups" }
        }))?;
        let config = crate::config::load_restore_config_from_json(&raw)?;
        Ok(RestoreContext::new(
            config,
            "20240102030405".into(),
            Arc::new(MockConnector::new("gpadmin")),
            Arc::new(MockExecutor::default()),
            lifecycle.clone(),
        ))
    }

    #[test]
    fn test_ending_of_outcome() {
        let broken: Result<u32> = Err(RestoreError::Execution("canceling statement due to user request".into()));
        assert_eq!(Ending::of(&Ok(0), None), Ending::Completed);
        assert_eq!(Ending::of(&broken, None), Ending::Failed);
        assert_eq!(Ending::of(&broken, Some(TerminationCause::Fatal)), Ending::Failed);
        assert_eq!(Ending::of(&broken, Some(TerminationCause::Signal)), Ending::Interrupted);
        let cancelled: Result<u32> = Err(RestoreError::Cancelled("data restore was interrupted".into()));
        assert_eq!(Ending::of(&cancelled, None), Ending::Interrupted);
    }

    #[tokio::test]
    async fn test_error_after_signal_finishes_as_terminated() -> anyhow::Result<()> {
        let lifecycle = Arc::new(Lifecycle::new());
        let cleanup = Arc::new(RecordingCleanup::default());
        lifecycle.register_cleanup(cleanup.clone());
        let ctx = context(&lifecycle)?;
        assert!(lifecycle.terminate(TerminationCause::Signal));

        let outcome = Err(RestoreError::Execution("canceling statement due to user request".into()));
        let status = finish(&ctx, &lifecycle, outcome).await;

        assert_eq!(status, RestoreStatus::Terminated);
        assert_eq!(lifecycle.cause(), Some(TerminationCause::Signal));
        assert_eq!(*cleanup.calls.lock().unwrap(), vec![(true, Some(TerminationCause::Signal))]);
        Ok(())
    }

    #[tokio::test]
    async fn test_fatal_error_finishes_as_failure() -> anyhow::Result<()> {
        let lifecycle = Arc::new(Lifecycle::new());
        let cleanup = Arc::new(RecordingCleanup::default());
        lifecycle.register_cleanup(cleanup.clone());
        let ctx = context(&lifecycle)?;

        let status = finish(&ctx, &lifecycle, Err(RestoreError::Execution("relation does not exist".into()))).await;

        assert_eq!(status, RestoreStatus::Failure);
        assert_eq!(lifecycle.cause(), Some(TerminationCause::Fatal));
        assert_eq!(lifecycle.state(), RunState::Cleaned);
        assert_eq!(*cleanup.calls.lock().unwrap(), vec![(true, Some(TerminationCause::Fatal))]);
        Ok(())
    }

    #[tokio::test]
    async fn test_success_cleans_up_without_failure() -> anyhow::Result<()> {
        let lifecycle = Arc::new(Lifecycle::new());
        let cleanup = Arc::new(RecordingCleanup::default());
        lifecycle.register_cleanup(cleanup.clone());
        let ctx = context(&lifecycle)?;

        assert_eq!(finish(&ctx, &lifecycle, Ok(2)).await, RestoreStatus::SuccessWithErrors);
        assert_eq!(*cleanup.calls.lock().unwrap(), vec![(false, None)]);
        Ok(())
    }
}
