//! Application layout on the target host

use std::env;
use std::fmt;
use std::path::Path;

use crate::error::{DeployError, DeployResult};

/// Where the application process listens
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindAddress {
    Tcp { host: String, port: u16 },
    Unix { path: String },
}

impl BindAddress {
    /// Parse `host:port` or `unix:/path/to.sock`
    pub fn parse(value: &str) -> DeployResult<Self> {
        if let Some(path) = value.strip_prefix("unix:") {
            if !path.starts_with('/') {
                return Err(DeployError::config(format!(
                    "unix socket path must be absolute: {}",
                    path
                )));
            }
            return Ok(BindAddress::Unix {
                path: path.to_string(),
            });
        }

        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| DeployError::config(format!("invalid bind address: {}", value)))?;
        let port = port
            .parse()
            .map_err(|_| DeployError::config(format!("invalid bind port: {}", port)))?;
        if host.is_empty() {
            return Err(DeployError::config(format!("invalid bind address: {}", value)));
        }
        Ok(BindAddress::Tcp {
            host: host.to_string(),
            port,
        })
    }

    /// Local URL the liveness endpoint is reachable at on the host
    pub fn base_url(&self) -> String {
        match self {
            BindAddress::Tcp { host, port } => {
                let host = if host == "0.0.0.0" { "127.0.0.1" } else { host };
                format!("http://{}:{}", host, port)
            }
            BindAddress::Unix { .. } => "http://localhost".to_string(),
        }
    }
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindAddress::Tcp { host, port } => write!(f, "{}:{}", host, port),
            BindAddress::Unix { path } => write!(f, "unix:{}", path),
        }
    }
}

/// Certificate paths written by the external ACME client
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsConfig {
    pub certificate: String,
    pub certificate_key: String,
}

/// Application layout and process settings
#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    /// Used for unit, site and archive names
    pub name: String,
    pub deploy_path: String,
    pub backup_dir: String,
    pub env_file: String,
    /// Template path relative to `deploy_path`
    pub env_template: String,
    /// User the application process runs as
    pub app_user: String,
    /// Public domain; also the `your-domain.com` substitution
    pub domain: Option<String>,
    pub bind: BindAddress,
    pub workers: u32,
    pub settings_module: String,
    pub python: String,
    pub tls: Option<TlsConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let deploy_path = "/var/www/medical-platform".to_string();
        Self {
            name: "medical-platform".to_string(),
            env_file: format!("{}/.env", deploy_path),
            deploy_path,
            backup_dir: "/var/backups/medical-platform".to_string(),
            env_template: ".env.example".to_string(),
            app_user: "www-data".to_string(),
            domain: None,
            bind: BindAddress::Tcp {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            workers: 3,
            settings_module: "config.settings.prod".to_string(),
            python: "python3".to_string(),
            tls: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let name = env::var("DEPLOY_APP_NAME").unwrap_or(defaults.name);
        let deploy_path = env::var("DEPLOY_PATH").unwrap_or(defaults.deploy_path);
        let backup_dir = env::var("DEPLOY_BACKUP_DIR").unwrap_or(defaults.backup_dir);
        let env_file =
            env::var("DEPLOY_ENV_FILE").unwrap_or_else(|_| format!("{}/.env", deploy_path));
        let env_template = env::var("DEPLOY_ENV_TEMPLATE").unwrap_or(defaults.env_template);
        let app_user = env::var("DEPLOY_APP_USER").unwrap_or(defaults.app_user);
        let domain = env::var("DEPLOY_DOMAIN").ok().filter(|s| !s.is_empty());

        let bind = match env::var("DEPLOY_BIND") {
            Ok(v) => BindAddress::parse(&v).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Ignoring DEPLOY_BIND");
                defaults.bind.clone()
            }),
            Err(_) => defaults.bind,
        };

        let workers = env::var("DEPLOY_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.workers);
        let settings_module =
            env::var("DJANGO_SETTINGS_MODULE").unwrap_or(defaults.settings_module);
        let python = env::var("DEPLOY_PYTHON").unwrap_or(defaults.python);

        let tls = match (env::var("DEPLOY_TLS_CERT"), env::var("DEPLOY_TLS_KEY")) {
            (Ok(certificate), Ok(certificate_key)) => Some(TlsConfig {
                certificate,
                certificate_key,
            }),
            _ => None,
        };

        Self {
            name,
            deploy_path,
            backup_dir,
            env_file,
            env_template,
            app_user,
            domain,
            bind,
            workers,
            settings_module,
            python,
            tls,
        }
    }

    /// Virtualenv inside the deploy directory
    pub fn venv_path(&self) -> String {
        format!("{}/venv", self.deploy_path)
    }

    pub fn static_root(&self) -> String {
        format!("{}/staticfiles", self.deploy_path)
    }

    pub fn media_root(&self) -> String {
        format!("{}/media", self.deploy_path)
    }

    pub fn unit_name(&self) -> String {
        format!("{}.service", self.name)
    }

    pub fn unit_path(&self) -> String {
        format!("/etc/systemd/system/{}", self.unit_name())
    }

    pub fn site_available_path(&self) -> String {
        format!("/etc/nginx/sites-available/{}", self.name)
    }

    pub fn site_enabled_path(&self) -> String {
        format!("/etc/nginx/sites-enabled/{}", self.name)
    }

    /// Domain, or the given fallback host
    pub fn public_domain<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.domain.as_deref().unwrap_or(fallback)
    }

    pub fn validate(&self) -> DeployResult<()> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DeployError::config(format!("invalid app name: {:?}", self.name)));
        }
        for (label, path) in [
            ("deploy path", &self.deploy_path),
            ("backup dir", &self.backup_dir),
            ("env file", &self.env_file),
        ] {
            if !Path::new(path).is_absolute() {
                return Err(DeployError::config(format!("{} must be absolute: {}", label, path)));
            }
        }
        if self.workers == 0 {
            return Err(DeployError::config("worker count must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_parse_tcp() {
        let bind = BindAddress::parse("127.0.0.1:8000").unwrap();
        assert_eq!(
            bind,
            BindAddress::Tcp {
                host: "127.0.0.1".to_string(),
                port: 8000
            }
        );
        assert_eq!(bind.to_string(), "127.0.0.1:8000");
        assert_eq!(bind.base_url(), "http://127.0.0.1:8000");
        assert_eq!(
            BindAddress::parse("0.0.0.0:9000").unwrap().base_url(),
            "http://127.0.0.1:9000"
        );
    }

    #[test]
    fn test_bind_parse_unix() {
        let bind = BindAddress::parse("unix:/run/medical-platform/gunicorn.sock").unwrap();
        assert_eq!(bind.to_string(), "unix:/run/medical-platform/gunicorn.sock");
        assert!(BindAddress::parse("unix:relative.sock").is_err());
    }

    #[test]
    fn test_bind_parse_invalid() {
        assert!(BindAddress::parse("8000").is_err());
        assert!(BindAddress::parse(":8000").is_err());
        assert!(BindAddress::parse("localhost:http").is_err());
    }

    #[test]
    fn test_validate() {
        let mut app = AppConfig::default();
        assert!(app.validate().is_ok());

        app.workers = 0;
        assert!(app.validate().is_err());

        let mut app = AppConfig::default();
        app.deploy_path = "relative/path".to_string();
        assert!(app.validate().is_err());

        let mut app = AppConfig::default();
        app.name = "bad name".to_string();
        assert!(app.validate().is_err());
    }

    #[test]
    fn test_derived_paths() {
        let app = AppConfig::default();
        assert_eq!(app.venv_path(), "/var/www/medical-platform/venv");
        assert_eq!(app.unit_path(), "/etc/systemd/system/medical-platform.service");
        assert_eq!(app.site_enabled_path(), "/etc/nginx/sites-enabled/medical-platform");
        assert_eq!(app.public_domain("10.0.0.1"), "10.0.0.1");
    }
}
