//! Deployment context
//!
//! Everything a pipeline stage needs: configuration, the remote executor, the
//! probe, the log channel and the cancellation token.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::env::EnvConfig;
use crate::domain::deploy::{LogLine, StageKind};
use crate::error::{DeployError, DeployResult};
use crate::infra::command::CommandOutput;
use crate::infra::remote::RemoteExecutor;
use crate::services::health::Probe;

use super::steps;

/// Deployment execution context
#[derive(Clone)]
pub struct DeployContext {
    /// Release being deployed
    pub release_id: String,
    pub config: Arc<EnvConfig>,
    pub executor: Arc<dyn RemoteExecutor>,
    /// Local-vantage health probe
    pub probe: Arc<dyn Probe>,
    /// Log channel
    pub log_tx: Option<broadcast::Sender<LogLine>>,
    pub cancel_token: CancellationToken,
}

impl DeployContext {
    /// Send a log line
    pub async fn log(&self, stream: &str, content: &str) {
        if stream == "stderr" {
            tracing::warn!(release_id = %self.release_id, "{}", content);
        } else {
            tracing::debug!(release_id = %self.release_id, "{}", content);
        }

        if let Some(ref tx) = self.log_tx {
            let _ = tx.send(LogLine::new(stream, content));
        }
    }

    pub async fn log_stdout(&self, content: &str) {
        self.log("stdout", content).await;
    }

    pub async fn log_stderr(&self, content: &str) {
        self.log("stderr", content).await;
    }

    /// Check whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    fn root_script(&self, script: &str) -> String {
        steps::as_root(self.config.target.needs_sudo(), script)
    }

    /// Run a stage script as root, streaming its output
    pub async fn run_root(&self, stage: StageKind, script: &str) -> DeployResult<CommandOutput> {
        let output = self.executor.run(&self.root_script(script)).await?;
        check(stage, output)
    }

    /// Run a stage script as root without logging its output
    pub async fn run_root_quiet(&self, stage: StageKind, script: &str) -> DeployResult<CommandOutput> {
        let output = self.executor.run_quiet(&self.root_script(script)).await?;
        check(stage, output)
    }

    /// Upload a file for a stage
    pub async fn upload(&self, stage: StageKind, remote_path: &str, contents: &[u8]) -> DeployResult<()> {
        let output = self.executor.upload(remote_path, contents).await?;
        check(stage, output).map(|_| ())
    }
}

/// Turn a finished command into a stage result
pub(crate) fn check(stage: StageKind, output: CommandOutput) -> DeployResult<CommandOutput> {
    if output.timed_out {
        return Err(DeployError::step(stage, output.exit_code, "timed out"));
    }
    if !output.success() {
        let message = match output.last_error_line() {
            line if line.is_empty() => "command failed".to_string(),
            line => line,
        };
        return Err(DeployError::step(stage, output.exit_code, message));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_success() {
        let output = check(StageKind::Migrate, CommandOutput::ok("Applying core.0005... OK\n")).unwrap();
        assert!(output.stdout.contains("0005"));
    }

    #[test]
    fn test_check_failure_uses_last_stderr_line() {
        let output = CommandOutput::failed(
            1,
            "Traceback (most recent call last):\ndjango.db.utils.OperationalError: no such table\n",
        );
        let err = check(StageKind::Migrate, output).unwrap_err();
        assert_eq!(
            err.to_string(),
            "stage migrate failed (exit code 1): django.db.utils.OperationalError: no such table"
        );
    }

    #[test]
    fn test_check_timeout() {
        let output = CommandOutput {
            exit_code: -1,
            timed_out: true,
            ..Default::default()
        };
        assert!(matches!(
            check(StageKind::InstallDependencies, output),
            Err(DeployError::StepFailed { message, .. }) if message == "timed out"
        ));
    }
}
