//! Process supervisor configuration
//!
//! systemd unit running the application under Gunicorn.

use std::fmt::Write as _;

use crate::config::app::{AppConfig, BindAddress};
use crate::error::{DeployError, DeployResult};

/// Gunicorn worker timeout (seconds)
const GUNICORN_TIMEOUT_SECS: u32 = 60;

/// systemd service unit for the application process
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemdUnit {
    pub description: String,
    pub user: String,
    pub group: String,
    pub working_directory: String,
    pub environment_file: String,
    pub settings_module: String,
    pub venv: String,
    pub bind: BindAddress,
    pub workers: u32,
    pub wsgi_app: String,
}

impl SystemdUnit {
    pub fn from_app(app: &AppConfig) -> Self {
        Self {
            description: format!("{} gunicorn daemon", app.name),
            user: app.app_user.clone(),
            group: app.app_user.clone(),
            working_directory: app.deploy_path.clone(),
            environment_file: app.env_file.clone(),
            settings_module: app.settings_module.clone(),
            venv: app.venv_path(),
            bind: app.bind.clone(),
            workers: app.workers,
            wsgi_app: "config.wsgi:application".to_string(),
        }
    }

    fn validate(&self) -> DeployResult<()> {
        if self.workers == 0 {
            return Err(DeployError::render("gunicorn needs at least one worker"));
        }
        for path in [&self.working_directory, &self.environment_file, &self.venv] {
            if !path.starts_with('/') {
                return Err(DeployError::render(format!("path must be absolute: {}", path)));
            }
        }
        if self.user.is_empty() {
            return Err(DeployError::render("unit user is empty"));
        }
        Ok(())
    }

    /// `RuntimeDirectory=` name when bound to a socket under `/run`
    fn runtime_directory(&self) -> Option<&str> {
        match &self.bind {
            BindAddress::Unix { path } => path
                .strip_prefix("/run/")
                .and_then(|rest| rest.rsplit_once('/'))
                .map(|(dir, _)| dir),
            BindAddress::Tcp { .. } => None,
        }
    }

    pub fn exec_start(&self) -> String {
        format!(
            "{}/bin/gunicorn --workers {} --bind {} --timeout {} --access-logfile - --error-logfile - {}",
            self.venv, self.workers, self.bind, GUNICORN_TIMEOUT_SECS, self.wsgi_app
        )
    }

    /// Unit file contents
    pub fn render(&self) -> DeployResult<String> {
        self.validate()?;

        let mut out = String::new();
        let _ = writeln!(out, "[Unit]");
        let _ = writeln!(out, "Description={}", self.description);
        let _ = writeln!(out, "After=network.target");
        let _ = writeln!(out);
        let _ = writeln!(out, "[Service]");
        let _ = writeln!(out, "Type=simple");
        let _ = writeln!(out, "User={}", self.user);
        let _ = writeln!(out, "Group={}", self.group);
        let _ = writeln!(out, "WorkingDirectory={}", self.working_directory);
        let _ = writeln!(out, "EnvironmentFile={}", self.environment_file);
        let _ = writeln!(out, "Environment=DJANGO_SETTINGS_MODULE={}", self.settings_module);
        if let Some(dir) = self.runtime_directory() {
            let _ = writeln!(out, "RuntimeDirectory={}", dir);
        }
        let _ = writeln!(out, "ExecStart={}", self.exec_start());
        // HUP makes gunicorn re-read code and config with the listening socket kept
        let _ = writeln!(out, "ExecReload=/bin/kill -s HUP $MAINPID");
        let _ = writeln!(out, "KillMode=mixed");
        let _ = writeln!(out, "TimeoutStopSec=30");
        let _ = writeln!(out, "Restart=on-failure");
        let _ = writeln!(out, "RestartSec=5");
        let _ = writeln!(out);
        let _ = writeln!(out, "[Install]");
        let _ = writeln!(out, "WantedBy=multi-user.target");
        Ok(out)
    }
}
