// clusterrestore/src/restore/data.rs
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::db_restore::RestoreConnection;
use super::parallel::{Outcome, as_execution_error};
use super::remote::SegmentCoordinator;
use crate::cluster::FilePathInfo;
use crate::errors::{RestoreError, Result};
use crate::toc::CoordinatorDataEntry;
use crate::utils::escape_single_quotes;

/// Where the segments read a table's bytes from.
#[derive(Debug, Clone)]
pub enum DataSource {
    /// Per-table pipes fed by the helper agents.
    SingleDataFile { pipe_template: String },
    /// One file per table on every segment.
    Files { fp: FilePathInfo, extension: String, decompress: String },
    /// One file per table, fetched through the storage plugin.
    Plugin {
        executable: String,
        config_path: String,
        fp: FilePathInfo,
        extension: String,
        decompress: String,
    },
}

impl DataSource {
    fn program(&self, oid: u32) -> String {
        match self {
            DataSource::SingleDataFile { pipe_template } => format!("cat {}_{}", pipe_template, oid),
            DataSource::Files { fp, extension, decompress } => {
                let file = fp.get_table_backup_file_path_for_copy_command(oid, extension, false);
                format!("{} {}", decompress, file)
            }
            DataSource::Plugin { executable, config_path, fp, extension, decompress } => {
                let file = fp.get_table_backup_file_path_for_copy_command(oid, extension, false);
                let fetch = format!("{} restore_data {} {}", executable, config_path, file);
                if decompress == "cat" {
                    fetch
                } else {
                    format!("{} | {}", fetch, decompress)
                }
            }
        }
    }
}

pub fn copy_command(entry: &CoordinatorDataEntry, source: &DataSource) -> String {
    format!(
        "COPY {}{} FROM PROGRAM '{}' WITH CSV DELIMITER ',' ON SEGMENT;",
        entry.fqn(),
        entry.attribute_string,
        escape_single_quotes(&source.program(entry.oid))
    )
}

/// Session settings applied once on every connection when the pool opens.
/// `data_phase` adds what table data loading needs.
pub fn session_gucs(application_name: &str, data_phase: bool) -> Vec<String> {
    let mut gucs = vec![
        format!("SET application_name TO '{}'", escape_single_quotes(application_name)),
        "SET search_path TO pg_catalog".to_string(),
        "SET client_min_messages TO error".to_string(),
    ];
    if data_phase {
        gucs.push("SET gp_enable_segment_copy_checking TO false".to_string());
    }
    gucs
}

pub async fn set_session_gucs(conn: &mut dyn RestoreConnection, gucs: &[String]) -> Result<()> {
    for guc in gucs {
        conn.exec(guc).await?;
    }
    Ok(())
}

/// Replicated tables report one copy of every row per segment.
pub fn rows_restored(copied: u64, entry: &CoordinatorDataEntry, num_segments: usize) -> u64 {
    if entry.is_replicated && num_segments > 0 {
        copied / num_segments as u64
    } else {
        copied
    }
}

pub fn check_rows_restored(copied: u64, entry: &CoordinatorDataEntry, num_segments: usize) -> Result<()> {
    let restored = rows_restored(copied, entry, num_segments);
    let expected = u64::try_from(entry.rows_copied).map_err(|_| {
        RestoreError::Integrity(format!(
            "Table of contents records {} rows for table {}",
            entry.rows_copied,
            entry.fqn()
        ))
    })?;
    if restored != expected {
        return Err(RestoreError::Execution(format!(
            "Expected to restore {} rows to table {}, but restored {} instead",
            expected,
            entry.fqn(),
            restored
        )));
    }
    Ok(())
}

/// Everything a data worker needs besides its connection and the queue.
pub struct DataJob<'a> {
    pub source: &'a DataSource,
    pub num_segments: usize,
    pub on_error_continue: bool,
    /// Set in single-data-file mode so a failed table can be skipped.
    pub agents: Option<&'a SegmentCoordinator<'a>>,
}

async fn restore_single_table(
    conn: &mut dyn RestoreConnection,
    entry: &CoordinatorDataEntry,
    job: &DataJob<'_>,
) -> Result<()> {
    let copy = copy_command(entry, job.source);
    debug!("Restoring table {} on connection {}: {}", entry.fqn(), conn.conn_num(), copy);
    let result = match conn.exec(&copy).await {
        Ok(copied) => check_rows_restored(copied, entry, job.num_segments),
        Err(e) => {
            let detail = match as_execution_error(e) {
                RestoreError::Execution(message) => message,
                other => other.to_string(),
            };
            Err(RestoreError::Execution(format!(
                "Error loading data into table {}: {}",
                entry.fqn(),
                detail
            )))
        }
    };
    if let Err(e) = &result {
        if job.on_error_continue {
            error!("{}", e);
            if let Some(agents) = job.agents {
                if let Err(skip_err) = agents.write_skip_files(entry.oid).await {
                    warn!("Could not tell helper agents to skip table {}: {}", entry.fqn(), skip_err);
                }
            }
        }
    }
    result
}

/// Copies every entry through a pool of one worker per connection pulling
/// from a FIFO queue. Returns the number of tables that failed.
///
/// In single-data-file mode the queue order is the order the agents serve
/// tables, so `entries` must be in oid-list order.
pub async fn restore_data_entries(
    conns: &mut [Box<dyn RestoreConnection>],
    entries: &[CoordinatorDataEntry],
    job: &DataJob<'_>,
    cancel: &CancellationToken,
) -> Result<u32> {
    if conns.is_empty() {
        return Err(RestoreError::Execution("No database connection available".into()));
    }
    let outcome = Outcome::new(cancel);
    let (tx, rx) = mpsc::unbounded_channel::<&CoordinatorDataEntry>();
    for entry in entries {
        // The receiver outlives this loop, so the send cannot fail.
        let _ = tx.send(entry);
    }
    drop(tx);
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
                let Some(entry) = next else { break };
                let result = restore_single_table(conn.as_mut(), entry, job).await;
                outcome.record(result, job.on_error_continue);
            }
        }
    });
    join_all(workers).await;

    let num_errors = outcome.finish()?;
    if num_errors > 0 {
        error!("Encountered errors restoring data to {} table(s)", num_errors);
    }
    Ok(num_errors)
}
