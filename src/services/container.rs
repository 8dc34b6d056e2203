//! Container image recipe
//!
//! Dockerfile for running the application as a single container. The entry
//! command collects static assets before Gunicorn starts serving.

use std::fmt::Write as _;

use crate::config::app::AppConfig;
use crate::error::{DeployError, DeployResult};

/// HEALTHCHECK timing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthcheckSpec {
    pub interval: String,
    pub timeout: String,
    pub start_period: String,
    pub retries: u32,
}

impl Default for HealthcheckSpec {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
            timeout: "10s".to_string(),
            start_period: "20s".to_string(),
            retries: 3,
        }
    }
}

/// Dockerfile definition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSpec {
    pub base_image: String,
    pub workdir: String,
    pub port: u16,
    pub user: String,
    pub settings_module: String,
    pub wsgi_app: String,
    pub workers: u32,
    pub health_path: String,
    pub healthcheck: HealthcheckSpec,
    /// Debian packages installed into the image
    pub system_packages: Vec<String>,
}

impl ContainerSpec {
    pub fn from_app(app: &AppConfig, health_path: &str) -> Self {
        Self {
            base_image: "python:3.11-slim".to_string(),
            workdir: "/app".to_string(),
            port: 8000,
            user: "app".to_string(),
            settings_module: app.settings_module.clone(),
            wsgi_app: "config.wsgi:application".to_string(),
            workers: app.workers,
            health_path: health_path.to_string(),
            healthcheck: HealthcheckSpec::default(),
            system_packages: vec!["curl".to_string(), "libpq-dev".to_string(), "gcc".to_string()],
        }
    }

    fn validate(&self) -> DeployResult<()> {
        if self.port == 0 {
            return Err(DeployError::render("container port must be non-zero"));
        }
        if self.workers == 0 {
            return Err(DeployError::render("gunicorn needs at least one worker"));
        }
        if !self.workdir.starts_with('/') {
            return Err(DeployError::render(format!("workdir must be absolute: {}", self.workdir)));
        }
        if !self.health_path.starts_with('/') {
            return Err(DeployError::render(format!(
                "health path must start with '/': {}",
                self.health_path
            )));
        }
        if self.user.is_empty() || self.user == "root" {
            return Err(DeployError::render("container must run as a non-root user"));
        }
        Ok(())
    }

    /// Shell command the container starts with
    pub fn entry_command(&self) -> String {
        format!(
            "python manage.py collectstatic --noinput && exec gunicorn --workers {} --bind 0.0.0.0:{} --access-logfile - --error-logfile - {}",
            self.workers, self.port, self.wsgi_app
        )
    }

    /// Dockerfile contents
    pub fn render(&self) -> DeployResult<String> {
        self.validate()?;
        let hc = &self.healthcheck;

        let mut out = String::new();
        let _ = writeln!(out, "FROM {}", self.base_image);
        let _ = writeln!(out);
        let _ = writeln!(out, "ENV PYTHONDONTWRITEBYTECODE=1 \\");
        let _ = writeln!(out, "    PYTHONUNBUFFERED=1 \\");
        let _ = writeln!(out, "    DJANGO_SETTINGS_MODULE={}", self.settings_module);
        let _ = writeln!(out);
        let _ = writeln!(out, "WORKDIR {}", self.workdir);
        let _ = writeln!(out);
        if !self.system_packages.is_empty() {
            let _ = writeln!(out, "RUN apt-get update \\");
            let _ = writeln!(
                out,
                "    && apt-get install -y --no-install-recommends {} \\",
                self.system_packages.join(" ")
            );
            let _ = writeln!(out, "    && rm -rf /var/lib/apt/lists/*");
            let _ = writeln!(out);
        }
        let _ = writeln!(out, "COPY requirements.txt .");
        let _ = writeln!(out, "RUN pip install --no-cache-dir -r requirements.txt gunicorn");
        let _ = writeln!(out);
        let _ = writeln!(out, "COPY . .");
        let _ = writeln!(out);
        let _ = writeln!(out, "RUN useradd --create-home --shell /usr/sbin/nologin {} \\", self.user);
        let _ = writeln!(out, "    && mkdir -p staticfiles media \\");
        let _ = writeln!(out, "    && chown -R {0}:{0} {1}", self.user, self.workdir);
        let _ = writeln!(out, "USER {}", self.user);
        let _ = writeln!(out);
        let _ = writeln!(out, "EXPOSE {}", self.port);
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "HEALTHCHECK --interval={} --timeout={} --start-period={} --retries={} \\",
            hc.interval, hc.timeout, hc.start_period, hc.retries
        );
        let _ = writeln!(
            out,
            "    CMD curl -fsS http://localhost:{}{} || exit 1",
            self.port, self.health_path
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "CMD [\"sh\", \"-c\", {:?}]", self.entry_command());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec::from_app(&AppConfig::default(), "/health/")
    }

    #[test]
    fn test_render_dockerfile() {
        let text = spec().render().unwrap();
        assert!(text.starts_with("FROM python:3.11-slim\n"));
        assert!(text.contains("DJANGO_SETTINGS_MODULE=config.settings.prod\n"));
        assert!(text.contains("EXPOSE 8000\n"));
        assert!(text.contains(
            "HEALTHCHECK --interval=30s --timeout=10s --start-period=20s --retries=3 \\\n"
        ));
        assert!(text.contains("CMD curl -fsS http://localhost:8000/health/ || exit 1\n"));
        assert!(text.contains("USER app\n"));
    }

    #[test]
    fn test_collectstatic_runs_before_gunicorn() {
        let cmd = spec().entry_command();
        let collect = cmd.find("collectstatic --noinput").unwrap();
        let serve = cmd.find("gunicorn").unwrap();
        assert!(collect < serve);
        assert!(cmd.contains("--bind 0.0.0.0:8000"));
    }

    #[test]
    fn test_entry_command_is_json_string() {
        let text = spec().render().unwrap();
        let line = text.lines().last().unwrap();
        let json = line.strip_prefix("CMD ").unwrap();
        let argv: Vec<String> = serde_json::from_str(json).unwrap();
        assert_eq!(argv[0], "sh");
        assert_eq!(argv[2], spec().entry_command());
    }

    #[test]
    fn test_render_is_idempotent() {
        assert_eq!(spec().render().unwrap(), spec().render().unwrap());
    }

    #[test]
    fn test_root_user_rejected() {
        let mut spec = spec();
        spec.user = "root".to_string();
        assert!(matches!(spec.render(), Err(DeployError::Render(_))));
    }
}
