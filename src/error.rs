//! Error handling
//!
//! `DeployError` covers every way a run can end badly; each variant maps to a
//! process exit code.

use std::path::PathBuf;
use thiserror::Error;

use crate::domain::deploy::StageKind;
use crate::infra::command::CommandError;

/// Exit codes of the CLI
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    /// A provisioning/deploy step failed
    pub const STEP_FAILED: i32 = 1;
    /// The post-deploy health check failed
    pub const UNHEALTHY: i32 = 2;
    /// Configuration or template error
    pub const CONFIG: i32 = 3;
    /// Another run holds the deploy lock
    pub const LOCKED: i32 = 4;
}

/// Deployment error
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("stage {stage} failed (exit code {exit_code}): {message}")]
    StepFailed {
        stage: StageKind,
        exit_code: i32,
        message: String,
    },

    #[error("health check failed: {0}")]
    Unhealthy(String),

    #[error("environment template error on line {line}: {message}")]
    Template { line: usize, message: String },

    #[error("placeholder tokens left in environment file: {}", .markers.join(", "))]
    PlaceholderLeak { markers: Vec<String> },

    #[error("environment file is missing required keys: {}", .keys.join(", "))]
    MissingKeys { keys: Vec<String> },

    #[error("invalid configuration object: {0}")]
    Render(String),

    #[error("invalid pipeline transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("deployment cancelled")]
    Cancelled,

    #[error("another deployment holds the lock at {}", .0.display())]
    Locked(PathBuf),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DeployError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn render(message: impl Into<String>) -> Self {
        Self::Render(message.into())
    }

    pub fn step(stage: StageKind, exit_code: i32, message: impl Into<String>) -> Self {
        Self::StepFailed {
            stage,
            exit_code,
            message: message.into(),
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployError::Unhealthy(_) => exit_code::UNHEALTHY,
            DeployError::Config(_)
            | DeployError::Template { .. }
            | DeployError::PlaceholderLeak { .. }
            | DeployError::MissingKeys { .. }
            | DeployError::Render(_) => exit_code::CONFIG,
            DeployError::Locked(_) => exit_code::LOCKED,
            _ => exit_code::STEP_FAILED,
        }
    }
}

pub type DeployResult<T> = Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(DeployError::Unhealthy("503".into()).exit_code(), 2);
        assert_eq!(
            DeployError::step(StageKind::Migrate, 1, "boom").exit_code(),
            exit_code::STEP_FAILED
        );
        assert_eq!(
            DeployError::PlaceholderLeak {
                markers: vec!["your-db-password".into()]
            }
            .exit_code(),
            exit_code::CONFIG
        );
        assert_eq!(DeployError::Locked(PathBuf::from("/tmp/x")).exit_code(), 4);
        assert_eq!(DeployError::Cancelled.exit_code(), 1);
    }

    #[test]
    fn test_messages() {
        let err = DeployError::step(StageKind::Migrate, 3, "migration 0005 failed");
        assert_eq!(
            err.to_string(),
            "stage migrate failed (exit code 3): migration 0005 failed"
        );

        let err = DeployError::PlaceholderLeak {
            markers: vec!["change-me".into(), "your-domain.com".into()],
        };
        assert_eq!(
            err.to_string(),
            "placeholder tokens left in environment file: change-me, your-domain.com"
        );
    }
}
