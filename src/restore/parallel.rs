// clusterrestore/src/restore/parallel.rs
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::db_restore::RestoreConnection;
use crate::errors::{RestoreError, Result};
use crate::toc::{FilterSet, StatementWithType, object_type};

/// Pause between handing statements to workers. Index builds on the same
/// table from separate sessions still contend on catalog locks after
/// batching; spacing them out makes that rarer.
pub const DISPATCH_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy)]
pub struct ExecOptions {
    pub parallel: bool,
    pub on_error_continue: bool,
    pub dispatch_delay: Duration,
}

impl ExecOptions {
    pub fn new(parallel: bool, on_error_continue: bool) -> Self {
        ExecOptions { parallel, on_error_continue, dispatch_delay: DISPATCH_DELAY }
    }
}

pub(super) fn as_execution_error(err: RestoreError) -> RestoreError {
    match err {
        RestoreError::Execution(message) => RestoreError::Execution(message),
        other => RestoreError::Execution(other.to_string()),
    }
}

/// Runs one statement when its object type passes `should_execute`.
/// Returns whether it was run.
pub async fn execute_statement(
    conn: &mut dyn RestoreConnection,
    statement: &StatementWithType,
    should_execute: &FilterSet,
) -> Result<bool> {
    if !should_execute.matches_filter(&statement.object_type) {
        return Ok(false);
    }
    match conn.exec(&statement.statement).await {
        Ok(_) => Ok(true),
        Err(e) => {
            debug!(
                "Error encountered when executing statement: {} Error was: {}",
                statement.statement.trim(),
                e
            );
            Err(as_execution_error(e))
        }
    }
}

/// Shared bookkeeping of one `execute_statements` call.
pub(super) struct Outcome {
    num_errors: AtomicU32,
    fatal: std::sync::Mutex<Option<RestoreError>>,
    pub(super) stop: CancellationToken,
}

impl Outcome {
    pub(super) fn new(cancel: &CancellationToken) -> Self {
        Outcome {
            num_errors: AtomicU32::new(0),
            fatal: std::sync::Mutex::new(None),
            stop: cancel.child_token(),
        }
    }

    pub(super) fn record<T>(&self, result: Result<T>, on_error_continue: bool) {
        if let Err(e) = result {
            if on_error_continue {
                self.num_errors.fetch_add(1, Ordering::SeqCst);
                return;
            }
            if let Ok(mut slot) = self.fatal.lock() {
                if slot.is_none() {
                    *slot = Some(e);
                }
            }
            self.stop.cancel();
        }
    }

    pub(super) fn finish(self) -> Result<u32> {
        if let Ok(mut slot) = self.fatal.lock() {
            if let Some(e) = slot.take() {
                return Err(e);
            }
        }
        Ok(self.num_errors.load(Ordering::SeqCst))
    }
}

/// Executes `statements` serially on the first connection, or across every
/// connection in `conns` through a shared queue.
///
/// Returns the number of failed statements. Without `on_error_continue` the
/// first failure stops dispatch and is returned. A cancelled token stops
/// dispatch as well; statements already running are left to finish.
pub async fn execute_statements(
    conns: &mut [Box<dyn RestoreConnection>],
    statements: &[StatementWithType],
    should_execute: &FilterSet,
    options: ExecOptions,
    cancel: &CancellationToken,
) -> Result<u32> {
    let outcome = Outcome::new(cancel);

    if !options.parallel || conns.len() <= 1 {
        let Some(conn) = conns.first_mut() else {
            return Err(RestoreError::Execution("No database connection available".into()));
        };
        for statement in statements {
            if outcome.stop.is_cancelled() {
                break;
            }
            let result = execute_statement(conn.as_mut(), statement, should_execute).await;
            outcome.record(result, options.on_error_continue);
        }
    } else {
        let (tx, rx) = mpsc::unbounded_channel::<&StatementWithType>();
        let rx = Arc::new(Mutex::new(rx));

        let workers = conns.iter_mut().map(|conn| {
            let rx = rx.clone();
            let outcome = &outcome;
            async move {
                loop {
                    if outcome.stop.is_cancelled() {
                        break;
                    }
                    let next = rx.lock().await.recv().await;
                    let Some(statement) = next else { break };
                    if outcome.stop.is_cancelled() {
                        break;
                    }
                    let result = execute_statement(conn.as_mut(), statement, should_execute).await;
                    outcome.record(result, options.on_error_continue);
                }
            }
        });

        let dispatch = async {
            for statement in statements {
                if outcome.stop.is_cancelled() || tx.send(statement).is_err() {
                    break;
                }
                tokio::select! {
                    _ = outcome.stop.cancelled() => break,
                    _ = tokio::time::sleep(options.dispatch_delay) => {}
                }
            }
            drop(tx);
        };

        futures::join!(dispatch, join_all(workers));
    }

    let num_errors = outcome.finish()?;
    if num_errors > 0 {
        error!(
            "Encountered {} errors during metadata restore; see log file for a list of failed statements.",
            num_errors
        );
    }
    Ok(num_errors)
}

/// Creates schemas one at a time before anything that lives in them. A
/// schema that already exists is only a warning.
pub async fn restore_schemas(
    conn: &mut dyn RestoreConnection,
    schemas: &[StatementWithType],
    on_error_continue: bool,
    cancel: &CancellationToken,
) -> Result<u32> {
    let mut num_errors = 0u32;
    for schema in schemas {
        if cancel.is_cancelled() {
            break;
        }
        if let Err(e) = conn.exec(&schema.statement).await {
            let message = e.to_string();
            if message.contains("already exists") {
                warn!("Schema {} already exists", schema.name);
            } else if on_error_continue {
                error!("Error encountered while creating schema {}: {}", schema.name, message);
                num_errors += 1;
            } else {
                return Err(as_execution_error(e));
            }
        }
    }
    if num_errors > 0 {
        error!("Encountered {} errors during schema restore", num_errors);
    }
    Ok(num_errors)
}

/// Splits post-data statements into a first batch holding at most one index
/// per table and a second batch with everything else, input order kept.
pub fn batch_postdata_statements(
    statements: Vec<StatementWithType>,
) -> (Vec<StatementWithType>, Vec<StatementWithType>) {
    let mut first_batch = Vec::new();
    let mut second_batch = Vec::new();
    let mut seen_tables: HashSet<String> = HashSet::new();
    for statement in statements {
        let is_index = statement.object_type == object_type::INDEX;
        if is_index && seen_tables.insert(statement.reference_object.clone()) {
            first_batch.push(statement);
        } else {
            second_batch.push(statement);
        }
    }
    (first_batch, second_batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{MockConnection, MockDb};

    fn stmt(name: &str, object_type: &str, reference: &str) -> StatementWithType {
        StatementWithType {
            schema: "public".into(),
            name: name.into(),
            object_type: object_type.into(),
            reference_object: reference.into(),
            statement: format!("CREATE {} {};", object_type, name),
        }
    }

    fn pool(db: &Arc<MockDb>, size: usize) -> Vec<Box<dyn RestoreConnection>> {
        (0..size)
            .map(|n| Box::new(MockConnection::on(db.clone(), n)) as Box<dyn RestoreConnection>)
            .collect()
    }

    fn fast(parallel: bool, on_error_continue: bool) -> ExecOptions {
        ExecOptions { parallel, on_error_continue, dispatch_delay: Duration::from_millis(1) }
    }

    fn everything() -> FilterSet {
        let none: [&str; 0] = [];
        FilterSet::new_include(&none)
    }

    #[test]
    fn test_batch_postdata_statements() {
        let statements = vec![
            stmt("index_on_a_1", object_type::INDEX, "public.a"),
            stmt("index_on_a_2", object_type::INDEX, "public.a"),
            stmt("index_on_b", object_type::INDEX, "public.b"),
            stmt("trigger_on_b", "TRIGGER", "public.b"),
        ];
        let (first, second) = batch_postdata_statements(statements);
        let names = |batch: &[StatementWithType]| batch.iter().map(|s| s.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&first), vec!["index_on_a_1", "index_on_b"]);
        assert_eq!(names(&second), vec!["index_on_a_2", "trigger_on_b"]);
    }

    #[test]
    fn test_batch_partition_keeps_every_statement_once() {
        let statements = vec![
            stmt("rule_c", "RULE", "public.c"),
            stmt("idx_c", object_type::INDEX, "public.c"),
            stmt("idx_d_1", object_type::INDEX, "public.d"),
            stmt("idx_c_2", object_type::INDEX, "public.c"),
            stmt("idx_d_2", object_type::INDEX, "public.d"),
            stmt("event_trigger", "EVENT TRIGGER", ""),
        ];
        let (first, second) = batch_postdata_statements(statements.clone());
        assert_eq!(first.len() + second.len(), statements.len());
        let mut seen = HashSet::new();
        for s in &first {
            assert!(seen.insert(s.reference_object.clone()), "two first-batch entries for one table");
        }
        let mut merged: Vec<_> = first.iter().chain(second.iter()).map(|s| s.name.clone()).collect();
        merged.sort();
        let mut input: Vec<_> = statements.iter().map(|s| s.name.clone()).collect();
        input.sort();
        assert_eq!(merged, input);
        // Relative order inside each batch follows the input.
        assert_eq!(
            second.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["rule_c", "idx_c_2", "idx_d_2", "event_trigger"]
        );
    }

    #[tokio::test]
    async fn test_serial_execution_runs_in_order() -> anyhow::Result<()> {
        let db = MockDb::new();
        let mut conns = pool(&db, 1);
        let statements = vec![stmt("t1", "TABLE", ""), stmt("v1", "VIEW", ""), stmt("f1", "FUNCTION", "")];
        let token = CancellationToken::new();
        let errors = execute_statements(&mut conns, &statements, &everything(), fast(false, false), &token).await?;
        assert_eq!(errors, 0);
        assert_eq!(
            db.executed(),
            vec!["CREATE TABLE t1;", "CREATE VIEW v1;", "CREATE FUNCTION f1;"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_should_execute_skips_other_types() -> anyhow::Result<()> {
        let db = MockDb::new();
        let mut conns = pool(&db, 1);
        let statements = vec![stmt("t1", "TABLE", ""), stmt("s1", "SEQUENCE", "")];
        let only_sequences = FilterSet::new_include(&["SEQUENCE"]);
        let token = CancellationToken::new();
        execute_statements(&mut conns, &statements, &only_sequences, fast(false, false), &token).await?;
        assert_eq!(db.executed(), vec!["CREATE SEQUENCE s1;"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_parallel_execution_uses_every_connection() -> anyhow::Result<()> {
        let db = MockDb::new();
        db.delay_when_contains("CREATE", Duration::from_millis(10));
        let mut conns = pool(&db, 3);
        let statements: Vec<_> = (0..9).map(|i| stmt(&format!("t{}", i), "TABLE", "")).collect();
        let token = CancellationToken::new();
        let errors = execute_statements(&mut conns, &statements, &everything(), fast(true, false), &token).await?;
        assert_eq!(errors, 0);
        assert_eq!(db.executed().len(), 9);
        for n in 0..3 {
            assert!(!db.executed_on(n).is_empty(), "connection {} did no work", n);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_on_error_continue_counts_failures() -> anyhow::Result<()> {
        let db = MockDb::new();
        db.fail_when_contains("bad", "syntax error");
        let statements = vec![stmt("bad1", "TABLE", ""), stmt("good", "TABLE", ""), stmt("bad2", "TABLE", "")];
        let token = CancellationToken::new();
        for parallel in [false, true] {
            let mut conns = pool(&db, 2);
            let errors =
                execute_statements(&mut conns, &statements, &everything(), fast(parallel, true), &token).await?;
            assert_eq!(errors, 2);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_first_failure_is_fatal_without_continue() {
        let db = MockDb::new();
        db.fail_when_contains("bad", "relation does not exist");
        let mut conns = pool(&db, 1);
        let statements = vec![stmt("good1", "TABLE", ""), stmt("bad", "TABLE", ""), stmt("good2", "TABLE", "")];
        let token = CancellationToken::new();
        let result = execute_statements(&mut conns, &statements, &everything(), fast(false, false), &token).await;
        assert!(matches!(result, Err(RestoreError::Execution(msg)) if msg.contains("relation does not exist")));
        assert_eq!(db.executed(), vec!["CREATE TABLE good1;", "CREATE TABLE bad;"]);
        assert!(!token.is_cancelled(), "a statement failure must not cancel the caller's token");
    }

    #[tokio::test]
    async fn test_parallel_failure_stops_dispatch() {
        let db = MockDb::new();
        db.fail_when_contains("t0", "boom");
        let mut conns = pool(&db, 2);
        let statements: Vec<_> = (0..50).map(|i| stmt(&format!("t{}", i), "TABLE", "")).collect();
        let token = CancellationToken::new();
        let result = execute_statements(&mut conns, &statements, &everything(), fast(true, false), &token).await;
        assert!(result.is_err());
        assert!(db.executed().len() < statements.len());
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_dispatch() -> anyhow::Result<()> {
        let db = MockDb::new();
        let mut conns = pool(&db, 1);
        let statements = vec![stmt("t1", "TABLE", "")];
        let token = CancellationToken::new();
        token.cancel();
        let errors = execute_statements(&mut conns, &statements, &everything(), fast(false, false), &token).await?;
        assert_eq!(errors, 0);
        assert!(db.executed().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_schemas_tolerates_existing() -> anyhow::Result<()> {
        let mut conn = MockConnection::new(0);
        conn.fail_when_contains("public", "schema \"public\" already exists");
        let schemas = vec![stmt("public", "SCHEMA", ""), stmt("sales", "SCHEMA", "")];
        let token = CancellationToken::new();
        let errors = restore_schemas(&mut conn, &schemas, false, &token).await?;
        assert_eq!(errors, 0);
        assert_eq!(conn.executed().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_schemas_other_errors() -> anyhow::Result<()> {
        let schemas = vec![stmt("sales", "SCHEMA", ""), stmt("hr", "SCHEMA", "")];
        let token = CancellationToken::new();

        let mut conn = MockConnection::new(0);
        conn.fail_when_contains("sales", "permission denied");
        assert!(restore_schemas(&mut conn, &schemas, false, &token).await.is_err());
        assert_eq!(conn.executed().len(), 1);

        let mut conn = MockConnection::new(0);
        conn.fail_when_contains("sales", "permission denied");
        assert_eq!(restore_schemas(&mut conn, &schemas, true, &token).await?, 1);
        assert_eq!(conn.executed().len(), 2);
        Ok(())
    }
}
