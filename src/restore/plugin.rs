// clusterrestore/src/restore/plugin.rs
use regex::{Captures, Regex};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, error, info};

use crate::cluster::{COORDINATOR_CONTENT, Cluster, FilePathInfo, Scope};
use crate::errors::{RestoreError, Result};
use crate::utils::validate_full_path;

static ENV_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{(\w+)\}|\$(\w+)").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginScope {
    Coordinator,
    SegmentHost,
    Segment,
}

impl PluginScope {
    fn as_str(&self) -> &'static str {
        match self {
            PluginScope::Coordinator => "master",
            PluginScope::SegmentHost => "segment_host",
            PluginScope::Segment => "segment",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawPluginConfig {
    #[serde(rename = "executablepath")]
    executable_path: String,
    #[serde(default)]
    options: BTreeMap<String, serde_yaml::Value>,
}

/// A storage plugin: an executable plus the YAML config handed to it.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub executable_path: String,
    /// Where the config lives on every host once copied there.
    pub config_path: String,
    pub local_config_path: String,
    pub options: BTreeMap<String, serde_yaml::Value>,
    gphome: String,
}

fn expand_env(value: &str) -> String {
    ENV_VAR
        .replace_all(value, |caps: &Captures| {
            let name = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()).unwrap_or_default();
            std::env::var(name).unwrap_or_default()
        })
        .into_owned()
}

impl PluginConfig {
    pub fn read(config_file: &Path, gphome: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(config_file).map_err(|e| {
            RestoreError::Config(format!("Cannot read plugin config {}: {}", config_file.display(), e))
        })?;
        let raw: RawPluginConfig = serde_yaml::from_str(&contents)?;
        let executable_path = expand_env(&raw.executable_path);
        validate_full_path(Path::new(&executable_path))?;
        let file_name = config_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(PluginConfig {
            executable_path,
            config_path: format!("/tmp/{}", file_name),
            local_config_path: config_file.display().to_string(),
            options: raw.options,
            gphome: gphome.to_string(),
        })
    }

    /// Fetches one coordinator file from plugin storage.
    pub async fn restore_file(&self, cluster: &Cluster, path: &str) -> Result<()> {
        if let Some(dir) = Path::new(path).parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let command = format!("{} restore_file {} {}", self.executable_path, self.config_path, path);
        debug!("Running plugin command: {}", command);
        let output = cluster.execute_local(&command).await?;
        if !output.success() {
            return Err(RestoreError::Transport(format!(
                "Plugin failed to restore {}. {}",
                path,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Metadata files are the only files fetched through the plugin on the
    /// coordinator.
    pub async fn restore_metadata(&self, cluster: &Cluster, path: &str) -> Result<()> {
        self.restore_file(cluster, path).await
    }

    pub async fn copy_config_to_all_hosts(&self, cluster: &Cluster) -> Result<()> {
        let coordinator = cluster
            .execute_local(&format!(
                "scp {} {}:/tmp/.",
                self.local_config_path,
                cluster.coordinator_host()
            ))
            .await?;
        if !coordinator.success() {
            return Err(RestoreError::Transport(format!(
                "Unable to copy plugin config to coordinator: {}",
                coordinator.stderr.trim()
            )));
        }
        let output = cluster
            .generate_and_execute("Copying plugin config to all hosts", Scope::CoordinatorToSegments, |content| {
                format!("scp {} {}:/tmp/.", self.local_config_path, cluster.host_for_content(content))
            })
            .await;
        cluster.check_cluster_error(&output, "Unable to copy plugin config", |_| "Unable to copy plugin config".into(), false)
    }

    /// Fetches every segment's table of contents for the helper agents.
    pub async fn restore_segment_tocs(&self, cluster: &Cluster, fp: &FilePathInfo) -> Result<()> {
        let output = cluster
            .generate_and_execute("Processing segment TOC files with plugin", Scope::Segments, |content| {
                format!(
                    "mkdir -p {} && source {}/greenplum_path.sh && {} restore_file {} {}",
                    fp.get_dir_for_content(content),
                    self.gphome,
                    self.executable_path,
                    self.config_path,
                    fp.get_segment_toc_file_path(content)
                )
            })
            .await;
        cluster.check_cluster_error(
            &output,
            "Unable to process segment TOC files using plugin",
            |_| "Unable to process segment TOC files using plugin".into(),
            false,
        )
    }

    fn hook_string(&self, command: &str, fp: &FilePathInfo, scope: PluginScope, content: i32) -> String {
        let content_arg = match scope {
            PluginScope::Coordinator | PluginScope::Segment => format!(" \\\"{}\\\"", content),
            PluginScope::SegmentHost => String::new(),
        };
        format!(
            "source {}/greenplum_path.sh && {} {} {} {} {}{}",
            self.gphome,
            self.executable_path,
            command,
            self.config_path,
            fp.get_dir_for_content(content),
            scope.as_str(),
            content_arg
        )
    }

    async fn execute_hook(&self, cluster: &Cluster, command: &str, fp: &FilePathInfo, non_fatal: bool) -> Result<()> {
        let error_message = |scope: PluginScope| {
            format!(
                "Unable to execute command: {} at: {}, on: {}",
                command,
                self.executable_path,
                scope.as_str()
            )
        };

        let coordinator = cluster
            .execute_local(&self.hook_string(command, fp, PluginScope::Coordinator, COORDINATOR_CONTENT))
            .await?;
        if !coordinator.success() {
            if non_fatal {
                error!("{}: {}", error_message(PluginScope::Coordinator), coordinator.stderr.trim());
                return Ok(());
            }
            return Err(RestoreError::Transport(format!(
                "{}: {}",
                error_message(PluginScope::Coordinator),
                coordinator.stderr.trim()
            )));
        }

        for (scope, cluster_scope, target) in [
            (PluginScope::SegmentHost, Scope::Hosts, "segment hosts"),
            (PluginScope::Segment, Scope::Segments, "segments"),
        ] {
            let output = cluster
                .generate_and_execute(&format!("Running plugin {} on {}", command, target), cluster_scope, |content| {
                    self.hook_string(command, fp, scope, content)
                })
                .await;
            let message = error_message(scope);
            cluster.check_cluster_error(&output, &message, |_| message.clone(), non_fatal)?;
        }
        Ok(())
    }

    pub async fn setup_plugin_for_restore(&self, cluster: &Cluster, fp: &FilePathInfo) -> Result<()> {
        info!("Running plugin setup for restore");
        self.execute_hook(cluster, "setup_plugin_for_restore", fp, false).await
    }

    /// Failures here are logged only.
    pub async fn cleanup_plugin_for_restore(&self, cluster: &Cluster, fp: &FilePathInfo) -> Result<()> {
        self.execute_hook(cluster, "cleanup_plugin_for_restore", fp, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::SegConfig;
    use crate::testutils::MockExecutor;
    use std::sync::Arc;

    const TS: &str = "20240101010101";

    fn setup(executor: Arc<MockExecutor>) -> (Cluster, FilePathInfo) {
        let segments = vec![
            SegConfig::new(-1, "cdw", "/data/gpseg-1"),
            SegConfig::new(0, "sdw1", "/data/gpseg0"),
            SegConfig::new(1, "sdw1", "/data/gpseg1"),
        ];
        let fp = FilePathInfo::new(&segments, "", TS, "gpseg", 7);
        (Cluster::new(segments, executor), fp)
    }

    fn plugin(dir: &Path) -> anyhow::Result<PluginConfig> {
        let path = dir.join("s3_config.yaml");
        std::fs::write(
            &path,
            "executablepath: /usr/local/bin/s3plugin\noptions:\n  bucket: backups\n  region: us-east-1\n  multipart_chunksize: 500\n",
        )?;
        Ok(PluginConfig::read(&path, "/usr/local/gp")?)
    }

    #[test]
    fn test_read_plugin_config() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = plugin(dir.path())?;
        assert_eq!(config.executable_path, "/usr/local/bin/s3plugin");
        assert_eq!(config.config_path, "/tmp/s3_config.yaml");
        assert_eq!(config.options.len(), 3);
        Ok(())
    }

    #[test]
    fn test_relative_executable_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "executablepath: bin/plugin\n")?;
        assert!(PluginConfig::read(&path, "/usr/local/gp").is_err());
        Ok(())
    }

    #[test]
    fn test_expand_env() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("CLUSTERRESTORE_TEST_HOME", "/opt/plugins") };
        assert_eq!(expand_env("$CLUSTERRESTORE_TEST_HOME/bin/p"), "/opt/plugins/bin/p");
        assert_eq!(expand_env("${CLUSTERRESTORE_TEST_HOME}/p"), "/opt/plugins/p");
        assert_eq!(expand_env("/plain/path"), "/plain/path");
    }

    #[test]
    fn test_hook_strings_per_scope() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = plugin(dir.path())?;
        let (_, fp) = setup(Arc::new(MockExecutor::default()));
        assert_eq!(
            config.hook_string("setup_plugin_for_restore", &fp, PluginScope::Coordinator, -1),
            format!(
                "source /usr/local/gp/greenplum_path.sh && /usr/local/bin/s3plugin setup_plugin_for_restore /tmp/s3_config.yaml /data/gpseg-1/backups/20240101/{} master \\\"-1\\\"",
                TS
            )
        );
        assert!(config
            .hook_string("setup_plugin_for_restore", &fp, PluginScope::SegmentHost, 0)
            .ends_with("segment_host"));
        Ok(())
    }

    #[tokio::test]
    async fn test_setup_runs_on_coordinator_hosts_and_segments() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = plugin(dir.path())?;
        let executor = Arc::new(MockExecutor::default());
        let (cluster, fp) = setup(executor.clone());
        config.setup_plugin_for_restore(&cluster, &fp).await?;
        assert_eq!(executor.local_commands().len(), 1);
        // One host, two segments.
        assert_eq!(executor.remote_commands().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_cleanup_failures_are_not_fatal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = plugin(dir.path())?;
        let executor = Arc::new(MockExecutor::default());
        executor.fail_when_contains("cleanup_plugin_for_restore");
        let (cluster, fp) = setup(executor.clone());
        config.cleanup_plugin_for_restore(&cluster, &fp).await?;

        executor.fail_when_contains("setup_plugin_for_restore");
        assert!(config.setup_plugin_for_restore(&cluster, &fp).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_file_failure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = plugin(dir.path())?;
        let executor = Arc::new(MockExecutor::default());
        executor.fail_when_contains("restore_file");
        let (cluster, _) = setup(executor.clone());
        let target = dir.path().join("restored/gpbackup_config.yaml");
        let result = config.restore_metadata(&cluster, &target.display().to_string()).await;
        assert!(matches!(result, Err(RestoreError::Transport(_))));
        assert!(dir.path().join("restored").is_dir());
        Ok(())
    }
}
