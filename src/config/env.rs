//! Environment variable configuration

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::app::AppConfig;
use crate::config::target::TargetConfig;
use crate::domain::deploy::ReleaseSource;
use crate::error::{DeployError, DeployResult};

/// Orchestrator configuration
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// Host being deployed to
    pub target: TargetConfig,
    /// Application layout on the host
    pub app: AppConfig,
    /// Where releases come from
    pub source: ReleaseSource,
    /// Health probe configuration
    pub health: HealthConfig,
    /// Local directory for deployment records and the lock file
    pub data_dir: PathBuf,
    /// Restore the backup when the health check fails
    pub rollback_enabled: bool,
    /// Regenerate the environment file even if one exists
    pub rematerialize_env: bool,
    /// Upper bound for a single remote step
    pub step_timeout_secs: u64,
    /// Who ran the deployment (defaults to the local hostname)
    pub operator: String,
}

/// Health probe configuration
#[derive(Clone, Debug, PartialEq)]
pub struct HealthConfig {
    /// Liveness path
    pub path: String,
    /// Public URL probed from the orchestrator; derived from the domain when unset
    pub public_url: Option<String>,
    /// Wait after reload before the local probe
    pub settle_secs: u64,
    /// Wait before the single re-check
    pub recheck_secs: u64,
    /// Per-request timeout
    pub timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: "/health/".to_string(),
            public_url: None,
            settle_secs: 10,
            recheck_secs: 10,
            timeout_secs: 10,
        }
    }
}

impl HealthConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let path = env::var("DEPLOY_HEALTH_PATH").unwrap_or(defaults.path);
        let public_url = env::var("DEPLOY_HEALTH_URL").ok().filter(|s| !s.is_empty());
        let settle_secs = env_parse("DEPLOY_SETTLE_SECS", defaults.settle_secs);
        let recheck_secs = env_parse("DEPLOY_RECHECK_SECS", defaults.recheck_secs);
        let timeout_secs = env_parse("DEPLOY_PROBE_TIMEOUT_SECS", defaults.timeout_secs);

        Self {
            path,
            public_url,
            settle_secs,
            recheck_secs,
            timeout_secs,
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn recheck_delay(&self) -> Duration {
        Duration::from_secs(self.recheck_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let target = TargetConfig::from_env();
        let app = AppConfig::from_env();
        let health = HealthConfig::from_env();

        let source = match env::var("DEPLOY_SOURCE_DIR").ok().filter(|s| !s.is_empty()) {
            Some(path) => ReleaseSource::LocalTree {
                path: PathBuf::from(path),
            },
            None => ReleaseSource::Git {
                repo_url: env::var("DEPLOY_REPO_URL").ok().filter(|s| !s.is_empty()),
                branch: env::var("DEPLOY_BRANCH").unwrap_or_else(|_| "main".to_string()),
            },
        };

        let data_dir = env::var("DEPLOY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".medplat-deploy"));

        let rollback_enabled = env_bool("DEPLOY_ROLLBACK", true);
        let rematerialize_env = env_bool("DEPLOY_REMATERIALIZE_ENV", false);
        let step_timeout_secs =
            env_parse("DEPLOY_STEP_TIMEOUT_SECS", constants::STEP_TIMEOUT_SECS);

        let operator = env::var("DEPLOY_OPERATOR").unwrap_or_else(|_| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        });

        Self {
            target,
            app,
            source,
            health,
            data_dir,
            rollback_enabled,
            rematerialize_env,
            step_timeout_secs,
            operator,
        }
    }

    /// Host name, or a configuration error when none is set
    pub fn host(&self) -> DeployResult<&str> {
        self.target
            .host
            .as_deref()
            .ok_or_else(|| DeployError::config("no target host (set DEPLOY_HOST or --host)"))
    }

    /// Public domain (falls back to the SSH host)
    pub fn domain(&self) -> DeployResult<String> {
        let host = self.host()?;
        Ok(self.app.public_domain(host).to_string())
    }

    /// URL probed from the orchestrator's vantage point
    pub fn public_health_url(&self) -> DeployResult<String> {
        if let Some(ref url) = self.health.public_url {
            return Ok(url.clone());
        }
        let scheme = if self.app.tls.is_some() { "https" } else { "http" };
        Ok(format!("{}://{}{}", scheme, self.domain()?, self.health.path))
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Check everything a remote run needs
    pub fn validate(&self) -> DeployResult<()> {
        self.host()?;
        self.app.validate()?;
        if !self.health.path.starts_with('/') {
            return Err(DeployError::config(format!(
                "health path must start with '/': {}",
                self.health.path
            )));
        }
        if let ReleaseSource::LocalTree { ref path } = self.source {
            if !path.is_dir() {
                return Err(DeployError::config(format!(
                    "release source is not a directory: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// Constants
pub mod constants {
    /// Upper bound for one remote step (seconds)
    pub const STEP_TIMEOUT_SECS: u64 = 1800; // 30 minutes

    /// Maximum number of deployment records kept
    pub const MAX_RECORD_HISTORY: usize = 100;

    /// Log channel capacity
    pub const LOG_CHANNEL_CAPACITY: usize = 1024;

    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
