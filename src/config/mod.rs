// clusterrestore/src/config/mod.rs
pub mod history;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

use crate::cluster::filepath::is_valid_timestamp;
use crate::errors::RestoreError;
use crate::toc::Filters;
use crate::utils::{validate_fqns, validate_full_path};

pub use history::{BackupConfig, RestorePlanEntry};

const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_AGENT_POLL_MILLIS: u64 = 100;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRestoreOptions {
    pub timestamp: Option<String>,
    pub backup_dir: Option<String>,
    pub plugin_config: Option<String>,
    pub redirect_db: Option<String>,
    pub redirect_schema: Option<String>,
    pub jobs: Option<usize>,
    #[serde(default)]
    pub data_only: bool,
    #[serde(default)]
    pub metadata_only: bool,
    #[serde(default)]
    pub with_globals: bool,
    #[serde(default)]
    pub create_db: bool,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub on_error_continue: bool,
    #[serde(default)]
    pub with_stats: bool,
    #[serde(default)]
    pub run_analyze: bool,
    #[serde(default)]
    pub include_schemas: Vec<String>,
    #[serde(default)]
    pub exclude_schemas: Vec<String>,
    #[serde(default)]
    pub include_relations: Vec<String>,
    #[serde(default)]
    pub exclude_relations: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonClusterOptions {
    pub gphome: Option<String>,
    pub seg_prefix: Option<String>,
    pub helper_version: Option<String>,
    pub agent_timeout_secs: Option<u64>,
    pub agent_poll_millis: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub target_database_url: Option<String>,
    pub verbosity: Option<String>,
    pub restore_options: Option<JsonRestoreOptions>,
    pub cluster: Option<JsonClusterOptions>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Info,
    Verbose,
    Debug,
}

impl Verbosity {
    pub fn parse(value: Option<&str>) -> std::result::Result<Self, RestoreError> {
        match value.map(str::to_ascii_lowercase).as_deref() {
            None | Some("") | Some("info") => Ok(Verbosity::Info),
            Some("quiet") => Ok(Verbosity::Quiet),
            Some("verbose") => Ok(Verbosity::Verbose),
            Some("debug") => Ok(Verbosity::Debug),
            Some(other) => Err(RestoreError::Config(format!(
                "Unknown verbosity '{}'. Expected one of quiet, info, verbose, debug.",
                other
            ))),
        }
    }

    pub fn max_level(&self) -> Level {
        match self {
            Verbosity::Quiet => Level::ERROR,
            Verbosity::Info => Level::INFO,
            Verbosity::Verbose => Level::DEBUG,
            Verbosity::Debug => Level::TRACE,
        }
    }
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub gphome: String,
    pub seg_prefix: String,
    pub helper_version: String,
    pub agent_timeout: Duration,
    pub agent_poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub target_db_url: String,
    pub timestamp: String,
    pub backup_dir: String,
    pub plugin_config: Option<PathBuf>,
    pub redirect_db: Option<String>,
    /// Existing schema every included relation is restored into.
    pub redirect_schema: Option<String>,
    pub jobs: usize,
    pub data_only: bool,
    pub metadata_only: bool,
    pub with_globals: bool,
    pub create_db: bool,
    pub incremental: bool,
    pub on_error_continue: bool,
    pub with_stats: bool,
    pub run_analyze: bool,
    pub filters: Filters,
    pub cluster: ClusterOptions,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub verbosity: Verbosity,
    pub raw_json_config: RawJsonConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })?;
        let verbosity = Verbosity::parse(raw_json_config.verbosity.as_deref())?;

        Ok(AppConfig {
            verbosity,
            raw_json_config,
        })
    }
}

fn exclusive(a: (&str, bool), b: (&str, bool)) -> std::result::Result<(), RestoreError> {
    if a.1 && b.1 {
        return Err(RestoreError::Config(format!(
            "The following options may not be specified together: {}, {}",
            a.0, b.0
        )));
    }
    Ok(())
}

fn load_cluster_options(raw: Option<&JsonClusterOptions>) -> ClusterOptions {
    let gphome = raw
        .and_then(|c| c.gphome.clone())
        .or_else(|| std::env::var("GPHOME").ok())
        .unwrap_or_default();
    ClusterOptions {
        gphome,
        seg_prefix: raw
            .and_then(|c| c.seg_prefix.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "gpseg".to_string()),
        helper_version: raw
            .and_then(|c| c.helper_version.clone())
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
        agent_timeout: Duration::from_secs(
            raw.and_then(|c| c.agent_timeout_secs).unwrap_or(DEFAULT_AGENT_TIMEOUT_SECS),
        ),
        agent_poll_interval: Duration::from_millis(
            raw.and_then(|c| c.agent_poll_millis).unwrap_or(DEFAULT_AGENT_POLL_MILLIS),
        ),
    }
}

/// Turns the raw JSON into a validated restore configuration. The target URL
/// may come from `TARGET_DATABASE_URL` when config.json leaves it out.
pub fn load_restore_config_from_json(raw_config: &RawJsonConfig) -> Result<RestoreConfig> {
    let target_db_url = raw_config
        .target_database_url
        .clone()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var("TARGET_DATABASE_URL").ok())
        .context("target_database_url must be set in config.json or TARGET_DATABASE_URL for restore")?;

    let opts = raw_config
        .restore_options
        .as_ref()
        .context("restore_options must be defined in config.json for restore")?;

    let timestamp = opts
        .timestamp
        .clone()
        .context("restore_options.timestamp must be set in config.json for restore")?;
    if !is_valid_timestamp(&timestamp) {
        return Err(RestoreError::Config(format!(
            "Timestamp {} is invalid.  Timestamps must be in the format YYYYMMDDHHMMSS.",
            timestamp
        ))
        .into());
    }

    let jobs = opts.jobs.unwrap_or(1);
    if jobs < 1 {
        return Err(RestoreError::Config("jobs must be at least 1".into()).into());
    }

    exclusive(("data_only", opts.data_only), ("metadata_only", opts.metadata_only))?;
    exclusive(("data_only", opts.data_only), ("with_globals", opts.with_globals))?;
    exclusive(("data_only", opts.data_only), ("create_db", opts.create_db))?;
    exclusive(
        ("include_schemas", !opts.include_schemas.is_empty()),
        ("exclude_schemas", !opts.exclude_schemas.is_empty()),
    )?;
    exclusive(
        ("include_relations", !opts.include_relations.is_empty()),
        ("exclude_relations", !opts.exclude_relations.is_empty()),
    )?;

    validate_fqns(&opts.include_relations)?;
    validate_fqns(&opts.exclude_relations)?;

    let redirect_schema = opts.redirect_schema.clone().filter(|s| !s.is_empty());
    if redirect_schema.is_some() {
        let has_redirect = ("redirect_schema", true);
        exclusive(has_redirect, ("include_schemas", !opts.include_schemas.is_empty()))?;
        exclusive(has_redirect, ("exclude_schemas", !opts.exclude_schemas.is_empty()))?;
        exclusive(has_redirect, ("exclude_relations", !opts.exclude_relations.is_empty()))?;
        if opts.include_relations.is_empty() {
            return Err(RestoreError::Config("Cannot use redirect_schema without include_relations".into()).into());
        }
    }

    let backup_dir = opts.backup_dir.clone().unwrap_or_default();
    validate_full_path(Path::new(&backup_dir))?;
    let plugin_config = opts.plugin_config.clone().filter(|p| !p.is_empty()).map(PathBuf::from);
    if let Some(path) = &plugin_config {
        validate_full_path(path)?;
    }
    exclusive(("backup_dir", !backup_dir.is_empty()), ("plugin_config", plugin_config.is_some()))?;

    Ok(RestoreConfig {
        target_db_url,
        timestamp,
        backup_dir,
        plugin_config,
        redirect_db: opts.redirect_db.clone().filter(|s| !s.is_empty()),
        redirect_schema,
        jobs,
        data_only: opts.data_only,
        metadata_only: opts.metadata_only,
        with_globals: opts.with_globals,
        create_db: opts.create_db,
        incremental: opts.incremental,
        on_error_continue: opts.on_error_continue,
        with_stats: opts.with_stats,
        run_analyze: opts.run_analyze,
        filters: Filters {
            include_schemas: opts.include_schemas.clone(),
            exclude_schemas: opts.exclude_schemas.clone(),
            include_relations: opts.include_relations.clone(),
            exclude_relations: opts.exclude_relations.clone(),
        },
        cluster: load_cluster_options(raw_config.cluster.as_ref()),
    })
}
