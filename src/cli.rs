//! Command line interface
//!
//! Flags override the environment configuration loaded by
//! [`EnvConfig::from_env`].

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::env::EnvConfig;
use crate::domain::deploy::ReleaseSource;

#[derive(Parser, Debug)]
#[command(
    name = "medplat-deploy",
    version,
    about = "Provision and deploy the medical platform web application"
)]
pub struct Cli {
    #[command(flatten)]
    pub target: TargetArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Target host and local state
#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    /// Host to deploy to
    #[arg(long, global = true, env = "DEPLOY_HOST")]
    pub host: Option<String>,

    /// SSH login user
    #[arg(long, global = true, env = "DEPLOY_USER")]
    pub user: Option<String>,

    /// SSH port
    #[arg(long, global = true, env = "DEPLOY_SSH_PORT")]
    pub port: Option<u16>,

    /// SSH private key
    #[arg(long, global = true, env = "DEPLOY_SSH_KEY")]
    pub identity_file: Option<String>,

    /// Public domain (defaults to the host)
    #[arg(long, global = true, env = "DEPLOY_DOMAIN")]
    pub domain: Option<String>,

    /// Directory holding deployment records and the lock file
    #[arg(long, global = true, env = "DEPLOY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Prepare a fresh host and run the first deployment
    Provision(RunArgs),

    /// Deploy the current release to a provisioned host
    Deploy(RunArgs),

    /// Print a rendered configuration file
    Render {
        #[arg(value_enum)]
        what: RenderTarget,
    },

    /// Validate a materialized environment file
    CheckEnv {
        file: PathBuf,
    },

    /// Probe the liveness endpoint (exit 0 healthy, 1 unhealthy)
    Probe {
        /// URL to probe instead of the public health URL
        #[arg(long)]
        url: Option<String>,
    },

    /// Show the live release and recent deployments
    Status {
        /// Number of records to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

/// Options shared by `provision` and `deploy`
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Push this local tree instead of fetching from git
    #[arg(long, conflicts_with_all = ["branch", "repo_url"])]
    pub source: Option<PathBuf>,

    /// Branch to deploy
    #[arg(long)]
    pub branch: Option<String>,

    /// Repository cloned on a host without a checkout
    #[arg(long)]
    pub repo_url: Option<String>,

    /// Leave a release that fails the health check in place
    #[arg(long)]
    pub no_rollback: bool,

    /// Regenerate the environment file even when one exists
    #[arg(long)]
    pub rematerialize_env: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RenderTarget {
    /// systemd unit for Gunicorn
    Unit,
    /// nginx site
    Nginx,
    /// Container image recipe
    Dockerfile,
}

impl TargetArgs {
    pub fn apply(&self, config: &mut EnvConfig) {
        if let Some(ref host) = self.host {
            config.target.host = Some(host.clone());
        }
        if let Some(ref user) = self.user {
            config.target.user = user.clone();
        }
        if let Some(port) = self.port {
            config.target.port = port;
        }
        if let Some(ref key) = self.identity_file {
            config.target.identity_file = Some(key.clone());
        }
        if let Some(ref domain) = self.domain {
            config.app.domain = Some(domain.clone());
        }
        if let Some(ref dir) = self.data_dir {
            config.data_dir = dir.clone();
        }
    }
}

impl RunArgs {
    pub fn apply(&self, config: &mut EnvConfig) {
        if let Some(ref path) = self.source {
            config.source = ReleaseSource::LocalTree { path: path.clone() };
        } else if self.branch.is_some() || self.repo_url.is_some() {
            let (repo_url, branch) = match &config.source {
                ReleaseSource::Git { repo_url, branch } => (repo_url.clone(), branch.clone()),
                ReleaseSource::LocalTree { .. } => (None, "main".to_string()),
            };
            config.source = ReleaseSource::Git {
                repo_url: self.repo_url.clone().or(repo_url),
                branch: self.branch.clone().unwrap_or(branch),
            };
        }
        if self.no_rollback {
            config.rollback_enabled = false;
        }
        if self.rematerialize_env {
            config.rematerialize_env = true;
        }
    }
}
