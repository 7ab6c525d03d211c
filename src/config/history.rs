// clusterrestore/src/config/history.rs
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::{RestoreError, Result};

/// One link of an incremental chain: the backup whose files hold the data
/// of `table_fqns`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePlanEntry {
    #[serde(rename = "timestamp")]
    pub timestamp: String,
    #[serde(rename = "tablefqns", default)]
    pub table_fqns: Vec<String>,
}

/// The `gpbackup_<ts>_config.yaml` record written next to every backup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    #[serde(rename = "backupdir")]
    pub backup_dir: String,
    #[serde(rename = "backupversion")]
    pub backup_version: String,
    #[serde(rename = "compressed")]
    pub compressed: bool,
    #[serde(rename = "compressiontype")]
    pub compression_type: String,
    #[serde(rename = "databasename")]
    pub database_name: String,
    #[serde(rename = "databaseversion")]
    pub database_version: String,
    #[serde(rename = "dataonly")]
    pub data_only: bool,
    #[serde(rename = "excluderelations")]
    pub exclude_relations: Vec<String>,
    #[serde(rename = "excludeschemas")]
    pub exclude_schemas: Vec<String>,
    #[serde(rename = "includerelations")]
    pub include_relations: Vec<String>,
    #[serde(rename = "includeschemas")]
    pub include_schemas: Vec<String>,
    #[serde(rename = "includetablefiltered")]
    pub include_table_filtered: bool,
    #[serde(rename = "incremental")]
    pub incremental: bool,
    #[serde(rename = "leafpartitiondata")]
    pub leaf_partition_data: bool,
    #[serde(rename = "metadataonly")]
    pub metadata_only: bool,
    #[serde(rename = "plugin")]
    pub plugin: String,
    #[serde(rename = "pluginversion")]
    pub plugin_version: String,
    #[serde(rename = "restoreplan")]
    pub restore_plan: Vec<RestorePlanEntry>,
    #[serde(rename = "singledatafile")]
    pub single_data_file: bool,
    #[serde(rename = "timestamp")]
    pub timestamp: String,
    #[serde(rename = "withstatistics")]
    pub with_statistics: bool,
    #[serde(rename = "status")]
    pub status: String,
}

impl BackupConfig {
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RestoreError::Config(format!("Cannot read backup config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn failed(&self) -> bool {
        self.status == "Failure"
    }

    /// File extension of the per-table data files.
    pub fn data_file_extension(&self) -> &'static str {
        if !self.compressed {
            return "";
        }
        match self.compression_type.as_str() {
            "zstd" => ".zst",
            _ => ".gz",
        }
    }

    /// Program that decompresses a data file onto stdout.
    pub fn decompress_program(&self) -> &'static str {
        if !self.compressed {
            return "cat";
        }
        match self.compression_type.as_str() {
            "zstd" => "zstd --decompress -c",
            _ => "gzip -d -c",
        }
    }

    /// Every table with data anywhere in the chain, in chain order.
    pub fn all_restore_plan_tables(&self) -> Vec<String> {
        self.restore_plan
            .iter()
            .flat_map(|entry| entry.table_fqns.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_YAML: &str = r#"
backupdir: ""
backupversion: 1.30.5
compressed: true
compressiontype: gzip
databasename: testdb
databaseversion: 6.24.0
dataonly: false
includetablefiltered: false
incremental: true
metadataonly: false
plugin: ""
restoreplan:
- timestamp: "20240101000000"
  tablefqns:
  - public.foo
  - public.bar
- timestamp: "20240102000000"
  tablefqns:
  - public.foo
singledatafile: true
timestamp: "20240102000000"
withstatistics: false
status: Success
"#;

    #[test]
    fn test_parse_backup_config() -> anyhow::Result<()> {
        let config = BackupConfig::from_yaml_str(CONFIG_YAML)?;
        assert_eq!(config.database_name, "testdb");
        assert!(config.single_data_file);
        assert!(!config.failed());
        assert_eq!(config.restore_plan.len(), 2);
        assert_eq!(config.restore_plan[1].timestamp, "20240102000000");
        assert_eq!(
            config.all_restore_plan_tables(),
            vec!["public.foo", "public.bar", "public.foo"]
        );
        assert_eq!(config.data_file_extension(), ".gz");
        assert_eq!(config.decompress_program(), "gzip -d -c");
        Ok(())
    }

    #[test]
    fn test_missing_fields_default() -> anyhow::Result<()> {
        let config = BackupConfig::from_yaml_str("databasename: db\ntimestamp: \"20240101000000\"\n")?;
        assert!(config.restore_plan.is_empty());
        assert_eq!(config.data_file_extension(), "");
        assert_eq!(config.decompress_program(), "cat");
        Ok(())
    }

    #[test]
    fn test_from_file_reads_yaml() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gpbackup_20240102000000_config.yaml");
        std::fs::write(&path, CONFIG_YAML)?;
        let config = BackupConfig::from_file(&path)?;
        assert_eq!(config.timestamp, "20240102000000");
        assert!(BackupConfig::from_file(&dir.path().join("missing.yaml")).is_err());
        Ok(())
    }
}
