//! Remote execution
//!
//! `RemoteExecutor` is the seam between the pipeline and the target host.
//! `SshExecutor` drives the system `ssh` and `rsync` binaries.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::target::TargetConfig;
use crate::domain::deploy::LogLine;
use crate::error::{DeployError, DeployResult};

use super::command::{shell_quote, CommandError, CommandOutput, CommandRunner};

/// Runs work on the target host
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a POSIX shell script on the host
    async fn run(&self, script: &str) -> Result<CommandOutput, CommandError>;

    /// Like `run`, but output is only captured, never streamed to the log
    async fn run_quiet(&self, script: &str) -> Result<CommandOutput, CommandError>;

    /// Write `contents` to `remote_path`, replacing it
    async fn upload(&self, remote_path: &str, contents: &[u8]) -> Result<CommandOutput, CommandError>;

    /// Mirror a local directory into `remote_dir`, skipping `excludes`
    async fn push_tree(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        excludes: &[&str],
    ) -> Result<CommandOutput, CommandError>;
}

/// `ssh`-backed executor
pub struct SshExecutor {
    target: TargetConfig,
    destination: String,
    timeout: Duration,
    log_tx: Option<broadcast::Sender<LogLine>>,
}

impl SshExecutor {
    pub fn new(target: TargetConfig, timeout: Duration) -> DeployResult<Self> {
        let destination = target
            .destination()
            .ok_or_else(|| DeployError::config("no target host (set DEPLOY_HOST or --host)"))?;
        Ok(Self {
            target,
            destination,
            timeout,
            log_tx: None,
        })
    }

    /// Stream remote output into a log channel
    pub fn with_log_sender(mut self, log_tx: broadcast::Sender<LogLine>) -> Self {
        self.log_tx = Some(log_tx);
        self
    }

    /// Arguments for `ssh` running `remote_command`
    fn ssh_args(&self, remote_command: String) -> Vec<String> {
        let mut args = self.target.ssh_options();
        args.push(self.destination.clone());
        args.push(remote_command);
        args
    }

    /// Arguments for `rsync` mirroring `local_dir` into `remote_dir`
    ///
    /// The deploy directory belongs to the application user, so a non-root
    /// login runs the receiving rsync under `sudo -n`.
    fn rsync_args(&self, local_dir: &Path, remote_dir: &str, excludes: &[&str]) -> Vec<String> {
        // Trailing slash: copy the directory's contents, not the directory
        let source = format!("{}/", local_dir.display().to_string().trim_end_matches('/'));
        // rsync splits `-e` like a shell would
        let ssh_cmd = std::iter::once("ssh".to_string())
            .chain(self.target.ssh_options().iter().map(|opt| shell_quote(opt)))
            .collect::<Vec<_>>()
            .join(" ");

        let mut args = vec![
            "-az".to_string(),
            "--delete".to_string(),
            "-e".to_string(),
            ssh_cmd,
        ];
        if self.target.needs_sudo() {
            args.push("--rsync-path=sudo -n rsync".to_string());
        }
        for pattern in excludes {
            args.push(format!("--exclude={}", pattern));
        }
        args.push(source);
        args.push(format!("{}:{}/", self.destination, remote_dir.trim_end_matches('/')));
        args
    }
}

/// Wrap a script for `sh -c` on the remote side
///
/// `ssh` joins its arguments into one command line, so the script travels as a
/// single quoted word. `set -eu` makes every script fail fast.
pub fn remote_shell_command(script: &str) -> String {
    format!("sh -c {}", shell_quote(&format!("set -eu\n{}", script)))
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, script: &str) -> Result<CommandOutput, CommandError> {
        debug!(host = %self.destination, "ssh run:\n{}", script);
        let args = self.ssh_args(remote_shell_command(script));
        CommandRunner::run_with_streaming("ssh", &args, None, None, self.log_tx.clone(), self.timeout)
            .await
    }

    async fn run_quiet(&self, script: &str) -> Result<CommandOutput, CommandError> {
        debug!(host = %self.destination, "ssh run (quiet)");
        let args = self.ssh_args(remote_shell_command(script));
        CommandRunner::run_with_streaming("ssh", &args, None, None, None, self.timeout).await
    }

    async fn upload(&self, remote_path: &str, contents: &[u8]) -> Result<CommandOutput, CommandError> {
        debug!(host = %self.destination, path = %remote_path, bytes = contents.len(), "ssh upload");
        let script = format!("umask 077; cat > {}", shell_quote(remote_path));
        let args = self.ssh_args(remote_shell_command(&script));
        CommandRunner::run_with_streaming(
            "ssh",
            &args,
            None,
            Some(contents.to_vec()),
            None,
            self.timeout,
        )
        .await
    }

    async fn push_tree(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        excludes: &[&str],
    ) -> Result<CommandOutput, CommandError> {
        let args = self.rsync_args(local_dir, remote_dir, excludes);
        debug!(host = %self.destination, ?args, "rsync");
        CommandRunner::run_with_streaming("rsync", &args, None, None, self.log_tx.clone(), self.timeout)
            .await
    }
}
