// clusterrestore/src/cluster/mod.rs
pub mod filepath;

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, error, warn};

use crate::errors::{RestoreError, Result};
use crate::utils::find_executable;

pub use filepath::{COORDINATOR_CONTENT, FilePathInfo};

/// One primary segment (or the coordinator, content -1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegConfig {
    pub content_id: i32,
    pub hostname: String,
    pub data_dir: String,
}

impl SegConfig {
    pub fn new(content_id: i32, hostname: &str, data_dir: &str) -> Self {
        SegConfig {
            content_id,
            hostname: hostname.to_string(),
            data_dir: data_dir.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs shell commands on cluster hosts. Returning `Err` means the command
/// could not be launched at all; a non-zero exit is reported in the output.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute_remote(&self, host: &str, command: &str) -> Result<CommandOutput>;
    async fn execute_local(&self, command: &str) -> Result<CommandOutput>;
}

/// Executes through `ssh` for remote hosts and `bash -c` locally.
pub struct SshExecutor {
    ssh_path: PathBuf,
}

impl SshExecutor {
    pub fn new() -> Result<Self> {
        Ok(SshExecutor { ssh_path: find_executable("ssh")? })
    }

    async fn run(mut command: Command) -> Result<CommandOutput> {
        let output = command
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute_remote(&self, host: &str, command: &str) -> Result<CommandOutput> {
        let mut ssh = Command::new(&self.ssh_path);
        ssh.arg("-o").arg("StrictHostKeyChecking=no").arg(host).arg(command);
        Self::run(ssh).await
    }

    async fn execute_local(&self, command: &str) -> Result<CommandOutput> {
        let mut bash = Command::new("bash");
        bash.arg("-c").arg(command);
        Self::run(bash).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Once per primary segment, on that segment's host.
    Segments,
    /// Once per distinct segment host.
    Hosts,
    /// Once per primary segment, on the coordinator.
    CoordinatorToSegments,
}

impl Scope {
    fn noun(&self) -> &'static str {
        match self {
            Scope::Hosts => "host",
            Scope::Segments | Scope::CoordinatorToSegments => "segment",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub scope: Scope,
    pub num_errors: usize,
    pub commands: BTreeMap<i32, String>,
    pub outputs: BTreeMap<i32, CommandOutput>,
}

pub struct Cluster {
    pub segments: Vec<SegConfig>,
    executor: Arc<dyn RemoteExecutor>,
}

impl Cluster {
    pub fn new(segments: Vec<SegConfig>, executor: Arc<dyn RemoteExecutor>) -> Self {
        Cluster { segments, executor }
    }

    pub fn executor(&self) -> Arc<dyn RemoteExecutor> {
        self.executor.clone()
    }

    /// Primary segments, coordinator excluded.
    pub fn primaries(&self) -> impl Iterator<Item = &SegConfig> {
        self.segments.iter().filter(|s| s.content_id >= 0)
    }

    pub fn num_segments(&self) -> usize {
        self.primaries().count()
    }

    pub fn host_for_content(&self, content: i32) -> &str {
        self.segments
            .iter()
            .find(|s| s.content_id == content)
            .map(|s| s.hostname.as_str())
            .unwrap_or_default()
    }

    pub fn coordinator_host(&self) -> &str {
        self.host_for_content(COORDINATOR_CONTENT)
    }

    /// Segment hosts in content order, each represented by the first
    /// content that lives on it.
    pub fn hosts(&self) -> Vec<(i32, String)> {
        let mut seen = Vec::<(i32, String)>::new();
        for segment in self.primaries() {
            if !seen.iter().any(|(_, h)| h == &segment.hostname) {
                seen.push((segment.content_id, segment.hostname.clone()));
            }
        }
        seen
    }

    pub async fn execute_local(&self, command: &str) -> Result<CommandOutput> {
        self.executor.execute_local(command).await
    }

    /// Builds one command per target of `scope` and runs them concurrently.
    pub async fn generate_and_execute<F>(&self, message: &str, scope: Scope, generate: F) -> RemoteOutput
    where
        F: Fn(i32) -> String,
    {
        debug!("{}", message);
        let targets: Vec<(i32, String)> = match scope {
            Scope::Hosts => self.hosts(),
            Scope::Segments | Scope::CoordinatorToSegments => self
                .primaries()
                .map(|s| (s.content_id, s.hostname.clone()))
                .collect(),
        };
        let commands: BTreeMap<i32, String> = targets.iter().map(|(content, _)| (*content, generate(*content))).collect();

        let runs = targets.iter().map(|(content, host)| {
            let executor = self.executor.clone();
            let command = commands.get(content).cloned().unwrap_or_default();
            let host = host.clone();
            let content = *content;
            async move {
                let result = match scope {
                    Scope::CoordinatorToSegments => executor.execute_local(&command).await,
                    Scope::Segments | Scope::Hosts => executor.execute_remote(&host, &command).await,
                };
                let output = result.unwrap_or_else(|e| CommandOutput {
                    stdout: String::new(),
                    stderr: e.to_string(),
                    exit_code: -1,
                });
                (content, output)
            }
        });

        let outputs: BTreeMap<i32, CommandOutput> = join_all(runs).await.into_iter().collect();
        let num_errors = outputs.values().filter(|o| !o.success()).count();
        RemoteOutput { scope, num_errors, commands, outputs }
    }

    /// Logs every failed target and turns any failure into a transport
    /// error, or only a warning when `non_fatal` is set.
    pub fn check_cluster_error<F>(
        &self,
        output: &RemoteOutput,
        final_message: &str,
        per_content_message: F,
        non_fatal: bool,
    ) -> Result<()>
    where
        F: Fn(i32) -> String,
    {
        if output.num_errors == 0 {
            return Ok(());
        }
        for (content, result) in output.outputs.iter().filter(|(_, o)| !o.success()) {
            error!(
                "{} on host {} with error {}: {}",
                per_content_message(*content),
                self.host_for_content(*content),
                result.exit_code,
                result.stderr.trim()
            );
            debug!(
                "Command was: {}",
                output.commands.get(content).map(String::as_str).unwrap_or_default()
            );
        }
        let summary = format!(
            "{}. {} {}{} had errors",
            final_message,
            output.num_errors,
            output.scope.noun(),
            if output.num_errors == 1 { "" } else { "s" }
        );
        if non_fatal {
            warn!("{}", summary);
            Ok(())
        } else {
            Err(RestoreError::Transport(summary))
        }
    }
}
