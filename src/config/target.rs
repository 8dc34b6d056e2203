//! Target host identity

use std::env;

/// SSH identity of the host being deployed to
#[derive(Clone, Debug, PartialEq)]
pub struct TargetConfig {
    /// Host name or address; required for any remote operation
    pub host: Option<String>,
    pub user: String,
    pub port: u16,
    /// Private key passed to `ssh -i`
    pub identity_file: Option<String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: "deploy".to_string(),
            port: 22,
            identity_file: None,
        }
    }
}

impl TargetConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let host = env::var("DEPLOY_HOST").ok().filter(|s| !s.is_empty());
        let user = env::var("DEPLOY_USER").unwrap_or(defaults.user);
        let port = env::var("DEPLOY_SSH_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port);
        let identity_file = env::var("DEPLOY_SSH_KEY").ok().filter(|s| !s.is_empty());

        Self {
            host,
            user,
            port,
            identity_file,
        }
    }

    /// `user@host`
    pub fn destination(&self) -> Option<String> {
        self.host.as_ref().map(|h| format!("{}@{}", self.user, h))
    }

    /// Privileged commands need `sudo` unless we log in as root
    pub fn needs_sudo(&self) -> bool {
        self.user != "root"
    }

    /// Options shared by `ssh` and rsync's `-e ssh ...`
    pub fn ssh_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(ref key) = self.identity_file {
            opts.push("-i".to_string());
            opts.push(key.clone());
        }
        opts
    }
}
