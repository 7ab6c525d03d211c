// clusterrestore/src/restore/remote.rs
use std::io::Write;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, FilePathInfo, Scope};
use crate::errors::{RestoreError, Result};
use crate::utils::wait::wait_until;

/// Drives the helper agents that demultiplex a single-data-file backup into
/// per-table pipes on every segment.
pub struct SegmentCoordinator<'a> {
    cluster: &'a Cluster,
    fp: &'a FilePathInfo,
    gphome: &'a str,
    plugin_config_path: Option<String>,
}

impl<'a> SegmentCoordinator<'a> {
    /// `plugin_config_path` is where the plugin config was copied on every
    /// host, when a plugin is in use.
    pub fn new(cluster: &'a Cluster, fp: &'a FilePathInfo, gphome: &'a str, plugin_config_path: Option<String>) -> Self {
        SegmentCoordinator { cluster, fp, gphome, plugin_config_path }
    }

    pub fn pipe_file(&self, content: i32) -> String {
        self.fp.get_segment_pipe_file_path(content)
    }

    fn oid_file(&self, content: i32) -> String {
        self.fp.get_segment_helper_file_path(content, "oid")
    }

    fn script_file(&self, content: i32) -> String {
        self.fp.get_segment_helper_file_path(content, "script")
    }

    fn error_file(&self, content: i32) -> String {
        format!("{}_error", self.pipe_file(content))
    }

    fn toc_file(&self, content: i32) -> String {
        self.fp.get_segment_toc_file_path(content)
    }

    fn agent_pattern(&self, content: i32) -> String {
        format!("gpbackup_helper --restore-agent --toc-file {}", self.toc_file(content))
    }

    pub async fn verify_helper_version(&self, expected: &str) -> Result<()> {
        let gphome = self.gphome;
        let output = self
            .cluster
            .generate_and_execute("Verifying gpbackup_helper version", Scope::Hosts, |_| {
                format!("{}/bin/gpbackup_helper --version", gphome)
            })
            .await;
        self.cluster.check_cluster_error(
            &output,
            "Could not verify gpbackup_helper version",
            |_| "Could not verify gpbackup_helper version".to_string(),
            false,
        )?;

        let mut num_incorrect = 0;
        for (content, result) in &output.outputs {
            // Format is "gpbackup_helper version <version>"
            let found = result.stdout.split_whitespace().last().unwrap_or_default();
            if found != expected {
                debug!(
                    "Version mismatch for gpbackup_helper on host {}: Expected version {}, found version {}.",
                    self.cluster.host_for_content(*content),
                    expected,
                    found
                );
                num_incorrect += 1;
            }
        }
        if num_incorrect > 0 {
            return Err(RestoreError::Transport(format!(
                "The version of gpbackup_helper must match the version of gprestore, but found gpbackup_helper binaries with invalid version on {} host{}",
                num_incorrect,
                if num_incorrect == 1 { "" } else { "s" }
            )));
        }
        Ok(())
    }

    pub async fn verify_backup_directories(&self) -> Result<()> {
        let fp = self.fp;
        let output = self
            .cluster
            .generate_and_execute("Verifying backup directories exist", Scope::Segments, |content| {
                format!("test -d {}", fp.get_dir_for_content(content))
            })
            .await;
        self.cluster.check_cluster_error(
            &output,
            "Backup directories missing or inaccessible",
            |content| format!("Backup directory {} missing or inaccessible", fp.get_dir_for_content(content)),
            false,
        )
    }

    /// Copies the ordered oid list to every segment. The agents serve tables
    /// strictly in this order.
    pub async fn write_oid_list(&self, oids: &[u32]) -> Result<()> {
        let mut local = tempfile::NamedTempFile::new()?;
        for oid in oids {
            writeln!(local, "{}", oid)?;
        }
        local.flush()?;
        let local_path = local.path().display().to_string();

        let output = self
            .cluster
            .generate_and_execute("Writing filtered oid list to segments", Scope::CoordinatorToSegments, |content| {
                format!(
                    "scp {} {}:{}",
                    local_path,
                    self.cluster.host_for_content(content),
                    self.oid_file(content)
                )
            })
            .await;
        self.cluster.check_cluster_error(
            &output,
            "Unable to write oid list to segments",
            |content| {
                format!(
                    "Unable to write oid list for segment {} on host {}",
                    content,
                    self.cluster.host_for_content(content)
                )
            },
            false,
        )
    }

    /// Creates the pipe of the first table; the agents create the rest.
    pub async fn create_first_pipe(&self, oid: u32) -> Result<()> {
        let output = self
            .cluster
            .generate_and_execute("Creating segment data pipes", Scope::Segments, |content| {
                format!("mkfifo {}_{}", self.pipe_file(content), oid)
            })
            .await;
        self.cluster.check_cluster_error(
            &output,
            "Unable to create segment data pipes",
            |_| "Unable to create segment data pipe".to_string(),
            false,
        )
    }

    fn agent_script(&self, content: i32, data_file: &str) -> String {
        let plugin = self
            .plugin_config_path
            .as_ref()
            .map(|path| format!(" --plugin-config {}", path))
            .unwrap_or_default();
        let script = self.script_file(content);
        format!(
            "cat << HEREDOC > {script}\n#!/bin/bash\nsource {gphome}/greenplum_path.sh\n{gphome}/bin/gpbackup_helper --restore-agent --toc-file {toc} --oid-file {oid} --pipe-file {pipe} --data-file {data} --content {content}{plugin}\n\nHEREDOC\n\nchmod +x {script}; (nohup {script} > /dev/null 2>&1 &) &",
            script = script,
            gphome = self.gphome,
            toc = self.toc_file(content),
            oid = self.oid_file(content),
            pipe = self.pipe_file(content),
            data = data_file,
            content = content,
            plugin = plugin,
        )
    }

    /// Launches one restore agent per segment reading `data_file_for(content)`.
    pub async fn start_agents<F>(&self, data_file_for: F) -> Result<()>
    where
        F: Fn(i32) -> String,
    {
        let output = self
            .cluster
            .generate_and_execute("Starting gpbackup_helper agent", Scope::Segments, |content| {
                self.agent_script(content, &data_file_for(content))
            })
            .await;
        self.cluster.check_cluster_error(
            &output,
            "Error starting gpbackup_helper agent",
            |content| {
                format!(
                    "Error starting gpbackup_helper agent for segment {} on host {}",
                    content,
                    self.cluster.host_for_content(content)
                )
            },
            false,
        )
    }

    /// Waits until an agent is running on every segment. An agent that has
    /// already left an error file fails the wait.
    pub async fn wait_for_agents(&self, timeout: Duration, poll_interval: Duration, cancel: &CancellationToken) -> Result<()> {
        wait_until("gpbackup_helper agents to start", timeout, poll_interval, cancel, || async move {
            let output = self
                .cluster
                .generate_and_execute("Checking gpbackup_helper agents", Scope::Segments, |content| {
                    format!(
                        "if [[ -f {err} ]]; then echo 'error'; elif ps ux | grep \"{pattern}\" | grep -v grep > /dev/null; then echo 'running'; else echo 'waiting'; fi",
                        err = self.error_file(content),
                        pattern = self.agent_pattern(content)
                    )
                })
                .await;
            self.cluster.check_cluster_error(
                &output,
                "Unable to check gpbackup_helper agents",
                |_| "Unable to check gpbackup_helper agent".to_string(),
                false,
            )?;
            let failed = output.outputs.values().filter(|o| o.stdout.trim() == "error").count();
            if failed > 0 {
                return Err(RestoreError::Transport(format!(
                    "gpbackup_helper agent failed to start on {} segment{}",
                    failed,
                    if failed == 1 { "" } else { "s" }
                )));
            }
            Ok(output.outputs.values().all(|o| o.stdout.trim() == "running"))
        })
        .await
    }

    /// Tells every agent to skip the table whose COPY failed.
    pub async fn write_skip_files(&self, oid: u32) -> Result<()> {
        let output = self
            .cluster
            .generate_and_execute("Writing skip files to segments", Scope::Segments, |content| {
                format!("touch {}_skip_{}", self.pipe_file(content), oid)
            })
            .await;
        self.cluster.check_cluster_error(
            &output,
            "Unable to write skip files",
            |content| format!("Unable to write skip file for segment {}", content),
            false,
        )
    }

    /// Fails when any agent reported an error during the data phase.
    pub async fn check_agent_errors(&self, helper_log: &str) -> Result<()> {
        let output = self
            .cluster
            .generate_and_execute(
                "Checking whether segment agents had errors during restore",
                Scope::Segments,
                |content| {
                    let err = self.error_file(content);
                    format!("if [[ -f {err} ]]; then echo 'error'; fi; rm -f {err}", err = err)
                },
            )
            .await;
        self.cluster.check_cluster_error(
            &output,
            "Unable to check gpbackup_helper agent status",
            |_| "Unable to check gpbackup_helper agent status".to_string(),
            false,
        )?;
        let num_errors = output.outputs.values().filter(|o| o.stdout.trim() == "error").count();
        if num_errors > 0 {
            return Err(RestoreError::Transport(format!(
                "Encountered errors with {} restore helper agent(s). See {} on the affected hosts for details.",
                num_errors, helper_log
            )));
        }
        Ok(())
    }

    /// Kills leftover agents. Finding none is not an error.
    pub async fn terminate_agents(&self) -> Result<()> {
        let output = self
            .cluster
            .generate_and_execute("Cleaning up segment restore agent processes", Scope::Segments, |content| {
                format!(
                    "PIDS=`ps ux | grep \"{}\" | grep -v grep | awk '{{print $2}}'`; if [[ ! -z \"$PIDS\" ]]; then kill $PIDS; fi",
                    self.agent_pattern(content)
                )
            })
            .await;
        self.cluster.check_cluster_error(
            &output,
            "Unable to clean up restore agent processes",
            |_| "Unable to clean up restore agent process".to_string(),
            true,
        )
    }

    /// Removes pipes, skip and error files, the oid list and the script.
    pub async fn cleanup_helper_files(&self) -> Result<()> {
        let output = self
            .cluster
            .generate_and_execute(
                "Removing oid list and helper script files from segment data directories",
                Scope::Segments,
                |content| {
                    format!(
                        "rm -f {}_* && rm -f {} && rm -f {}",
                        self.pipe_file(content),
                        self.oid_file(content),
                        self.script_file(content)
                    )
                },
            )
            .await;
        if output.num_errors == 0 {
            info!("Removed helper files for backup {}", self.fp.timestamp);
        }
        self.cluster.check_cluster_error(
            &output,
            "Unable to remove segment helper file(s). Remove them manually.",
            |content| {
                format!(
                    "Unable to remove helper files for segment {} on host {}",
                    content,
                    self.cluster.host_for_content(content)
                )
            },
            true,
        )
    }

    /// Everything the data phase needs before its first COPY.
    pub async fn prepare(
        &self,
        oids: &[u32],
        data_file_for: impl Fn(i32) -> String,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(first) = oids.first() else {
            warn!("No tables to restore from backup {}", self.fp.timestamp);
            return Ok(());
        };
        self.write_oid_list(oids).await?;
        self.create_first_pipe(*first).await?;
        self.start_agents(data_file_for).await?;
        self.wait_for_agents(timeout, poll_interval, cancel).await
    }
}
