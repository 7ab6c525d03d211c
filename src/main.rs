//! Cluster restore tool
//!
//! Restores a parallel database backup set into a running cluster.

// clusterrestore/src/main.rs
mod cluster;
mod config;
mod errors;
mod lifecycle;
mod restore;
mod toc;
mod utils;

#[cfg(test)]
mod testutils;

use anyhow::{Context, Result};
use config::{AppConfig, load_restore_config_from_json};
use dotenv::dotenv;
use lifecycle::{Lifecycle, handle_signals};
use restore::report::RestoreStatus;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "config.json";

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    match run_app().await {
        Ok(status) => status.exit_code(),
        Err(e) => {
            // The subscriber may not be installed yet.
            eprintln!("Error: {:?}", e);
            error!("{:#}", e);
            RestoreStatus::Failure.exit_code()
        }
    }
}

async fn run_app() -> Result<RestoreStatus> {
    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let app_config = AppConfig::load_from_json(&config_path)
        .with_context(|| format!("Failed to load application configuration from {}", config_path.display()))?;

    tracing_subscriber::fmt()
        .with_max_level(app_config.verbosity.max_level())
        .with_target(false)
        .init();

    let restore_config = load_restore_config_from_json(&app_config.raw_json_config)
        .context("Failed to load restore configuration from JSON")?;
    info!(
        "Restoring backup {} from {} into {}",
        restore_config.timestamp,
        restore_config.backup_dir,
        restore_config
            .redirect_db
            .as_deref()
            .unwrap_or("the database it was taken from")
    );

    let lifecycle = Arc::new(Lifecycle::new());
    let signals = tokio::spawn(handle_signals(lifecycle.clone()));
    let status = restore::run_restore_flow(restore_config, lifecycle)
        .await
        .context("Restore process failed")?;
    signals.abort();
    Ok(status)
}
