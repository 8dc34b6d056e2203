//! Command runner
//!
//! Unified local process execution:
//! - live line streaming into a log channel
//! - captured stdout/stderr
//! - optional stdin payload
//! - timeout

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::error;

use crate::domain::deploy::LogLine;

/// Command runner
pub struct CommandRunner;

/// Command execution error
#[derive(Debug)]
pub enum CommandError {
    /// The program could not be started
    SpawnFailed(std::io::Error),
    /// Writing stdin failed
    StdinFailed(std::io::Error),
    /// Waiting for the process failed
    WaitFailed(std::io::Error),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::SpawnFailed(e) => write!(f, "Failed to spawn command: {}", e),
            CommandError::StdinFailed(e) => write!(f, "Failed to write command stdin: {}", e),
            CommandError::WaitFailed(e) => write!(f, "Failed to wait for command: {}", e),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::SpawnFailed(e)
            | CommandError::StdinFailed(e)
            | CommandError::WaitFailed(e) => Some(e),
        }
    }
}

/// Result of a finished command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (-1 when killed by a signal)
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Killed because the timeout elapsed
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    /// Last non-empty stderr line, falling back to stdout
    pub fn last_error_line(&self) -> String {
        let last = |text: &str| {
            text.lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
        };
        last(&self.stderr)
            .or_else(|| last(&self.stdout))
            .unwrap_or_default()
    }
}

impl CommandRunner {
    /// Run a command, streaming every output line into `log_tx` while capturing it
    ///
    /// # Arguments
    /// * `program` - program to execute
    /// * `args` - arguments
    /// * `work_dir` - working directory (inherited when `None`)
    /// * `stdin` - bytes written to the child's stdin, which is then closed
    /// * `log_tx` - log channel
    /// * `timeout` - the child is killed once this elapses
    pub async fn run_with_streaming(
        program: &str,
        args: &[String],
        work_dir: Option<&Path>,
        stdin: Option<Vec<u8>>,
        log_tx: Option<broadcast::Sender<LogLine>>,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = work_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(CommandError::SpawnFailed)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_tx = log_tx.clone();
        let stdout_task = tokio::spawn(async move {
            let mut captured = String::new();
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(ref tx) = stdout_tx {
                        let _ = tx.send(LogLine::stdout(line.clone()));
                    }
                    captured.push_str(&line);
                    captured.push('\n');
                }
            }
            captured
        });

        let stderr_tx = log_tx;
        let stderr_task = tokio::spawn(async move {
            let mut captured = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(ref tx) = stderr_tx {
                        let _ = tx.send(LogLine::stderr(line.clone()));
                    }
                    captured.push_str(&line);
                    captured.push('\n');
                }
            }
            captured
        });

        if let Some(payload) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(&payload)
                    .await
                    .map_err(CommandError::StdinFailed)?;
                pipe.shutdown().await.map_err(CommandError::StdinFailed)?;
            }
        }

        let (exit_code, timed_out) = tokio::select! {
            status = child.wait() => {
                let status = status.map_err(CommandError::WaitFailed)?;
                (status.code().unwrap_or(-1), false)
            }
            _ = tokio::time::sleep(timeout) => {
                error!(program = %program, "Command timed out after {:?}", timeout);
                let _ = child.kill().await;
                let status = child.wait().await.map_err(CommandError::WaitFailed)?;
                (status.code().unwrap_or(-1), true)
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
            timed_out,
        })
    }
}

/// Quote a string for POSIX `sh`
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_streaming_captures_and_broadcasts() {
        let (tx, mut rx) = broadcast::channel(16);
        let output = CommandRunner::run_with_streaming(
            "sh",
            &args(&["-c", "echo out; echo err >&2; exit 3"]),
            None,
            None,
            Some(tx),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.last_error_line(), "err");

        let mut streams = Vec::new();
        while let Ok(line) = rx.try_recv() {
            streams.push((line.stream, line.content));
        }
        assert!(streams.contains(&("stdout".to_string(), "out".to_string())));
        assert!(streams.contains(&("stderr".to_string(), "err".to_string())));
    }

    #[tokio::test]
    async fn test_streaming_stdin() {
        let output = CommandRunner::run_with_streaming(
            "cat",
            &[],
            None,
            Some(b"payload\n".to_vec()),
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "payload\n");
    }

    #[tokio::test]
    async fn test_streaming_timeout() {
        let output = CommandRunner::run_with_streaming(
            "sleep",
            &args(&["5"]),
            None,
            None,
            None,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/var/www/app"), "/var/www/app");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }
}
