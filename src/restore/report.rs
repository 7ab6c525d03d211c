// clusterrestore/src/restore/report.rs
use chrono::{Local, NaiveDateTime};
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info};

use crate::errors::Result;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const DISPLAY_FORMAT: &str = "%a %b %d %Y %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStatus {
    Success,
    SuccessWithErrors,
    Failure,
    Terminated,
}

impl RestoreStatus {
    /// `num_errors` counts the statements and tables skipped under
    /// on-error-continue.
    pub fn from_outcome<T>(outcome: &Result<T>, num_errors: u32, terminated: bool) -> Self {
        match outcome {
            Err(e) if terminated || e.is_cancellation() => RestoreStatus::Terminated,
            Err(_) => RestoreStatus::Failure,
            Ok(_) if terminated => RestoreStatus::Terminated,
            Ok(_) if num_errors > 0 => RestoreStatus::SuccessWithErrors,
            Ok(_) => RestoreStatus::Success,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            RestoreStatus::Success => 0,
            RestoreStatus::SuccessWithErrors => 1,
            RestoreStatus::Failure | RestoreStatus::Terminated => 2,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }
}

/// What the report file needs to know about the run.
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub backup_timestamp: String,
    pub restore_start: String,
    pub database: String,
    pub command_line: String,
    pub segment_count: usize,
}

fn reformat_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!("{}:{:02}:{:02}", seconds / 3600, (seconds % 3600) / 60, seconds % 60)
}

impl RestoreReport {
    pub fn render(&self, end: NaiveDateTime, status: RestoreStatus, error_message: Option<&str>) -> String {
        let start = NaiveDateTime::parse_from_str(&self.restore_start, TIMESTAMP_FORMAT).unwrap_or(end);
        let mut lines: Vec<(&str, String)> = vec![
            ("timestamp key:", self.backup_timestamp.clone()),
            ("database name:", self.database.clone()),
            ("command line:", format!("{}\n", self.command_line)),
            ("restore segment count:", self.segment_count.to_string()),
            ("start time:", start.format(DISPLAY_FORMAT).to_string()),
            ("end time:", end.format(DISPLAY_FORMAT).to_string()),
            ("duration:", reformat_duration((end - start).num_seconds())),
            ("", String::new()),
        ];
        match status {
            RestoreStatus::SuccessWithErrors => lines.push((
                "restore status:",
                "Success but non-fatal errors occurred. See log file for details.".to_string(),
            )),
            RestoreStatus::Failure | RestoreStatus::Terminated => {
                lines.push(("restore status:", "Failure".to_string()));
                lines.push(("restore error:", error_message.unwrap_or_default().to_string()));
            }
            RestoreStatus::Success => lines.push(("restore status:", "Success".to_string())),
        }

        let width = lines.iter().map(|(k, _)| k.len()).max().unwrap_or_default() + 3;
        let mut out = String::from("Cloudberry Database Restore Report\n\n");
        for (key, value) in lines {
            if key.is_empty() {
                out.push('\n');
            } else {
                out.push_str(&format!("{:<width$}{}\n", key, value, width = width));
            }
        }
        out
    }

    /// Terminated runs leave no report behind.
    pub fn write(&self, path: &Path, status: RestoreStatus, error_message: Option<&str>) -> Result<()> {
        if status == RestoreStatus::Terminated {
            return Ok(());
        }
        let contents = self.render(Local::now().naive_local(), status, error_message);
        if let Err(e) = std::fs::write(path, contents) {
            error!("Unable to write restore report file {}: {}", path.display(), e);
            return Err(e.into());
        }
        info!("Restore report written to {}", path.display());
        Ok(())
    }
}
