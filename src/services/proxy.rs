//! Reverse proxy configuration
//!
//! Nginx site: static and media served from disk, everything else proxied to
//! the application process.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::config::app::{AppConfig, BindAddress, TlsConfig};
use crate::error::{DeployError, DeployResult};

/// Forwarded headers set on every proxied request
const PROXY_HEADERS: &[(&str, &str)] = &[
    ("Host", "$host"),
    ("X-Real-IP", "$remote_addr"),
    ("X-Forwarded-For", "$proxy_add_x_forwarded_for"),
    ("X-Forwarded-Proto", "$scheme"),
];

/// What a location serves
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteTarget {
    /// Files under a directory (`alias`)
    Directory { root: String, expires: Option<String> },
    /// The application upstream
    Upstream,
}

/// Nginx server definition for the application
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NginxSite {
    pub upstream_name: String,
    pub upstream: BindAddress,
    pub server_names: Vec<String>,
    pub client_max_body_size: String,
    pub tls: Option<TlsConfig>,
    /// Prefix → target, at most one entry per prefix
    routes: BTreeMap<String, RouteTarget>,
}

impl NginxSite {
    pub fn new(upstream_name: impl Into<String>, upstream: BindAddress, server_names: Vec<String>) -> Self {
        Self {
            upstream_name: upstream_name.into(),
            upstream,
            server_names,
            client_max_body_size: "20M".to_string(),
            tls: None,
            routes: BTreeMap::new(),
        }
    }

    /// Standard route table: `/static/`, `/media/` and the catch-all
    pub fn from_app(app: &AppConfig, host: &str) -> Self {
        let domain = app.public_domain(host);
        let mut server_names = vec![domain.to_string()];
        if domain.contains('.') && !domain.starts_with("www.") && domain.parse::<std::net::IpAddr>().is_err() {
            server_names.push(format!("www.{}", domain));
        }

        let mut site = Self::new(app.name.replace('-', "_"), app.bind.clone(), server_names);
        site.tls = app.tls.clone();
        site.route(
            "/static/",
            RouteTarget::Directory {
                root: format!("{}/", app.static_root()),
                expires: Some("30d".to_string()),
            },
        );
        site.route(
            "/media/",
            RouteTarget::Directory {
                root: format!("{}/", app.media_root()),
                expires: None,
            },
        );
        site.route("/", RouteTarget::Upstream);
        site
    }

    /// Insert or replace the route for `prefix`
    pub fn route(&mut self, prefix: impl Into<String>, target: RouteTarget) -> &mut Self {
        self.routes.insert(prefix.into(), target);
        self
    }

    pub fn routes(&self) -> impl Iterator<Item = (&str, &RouteTarget)> {
        self.routes.iter().map(|(p, t)| (p.as_str(), t))
    }

    /// Longest prefix first, then lexical
    fn ordered_routes(&self) -> Vec<(&String, &RouteTarget)> {
        let mut routes: Vec<_> = self.routes.iter().collect();
        routes.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        routes
    }

    fn validate(&self) -> DeployResult<()> {
        if self.server_names.is_empty() {
            return Err(DeployError::render("nginx site needs at least one server name"));
        }
        if !self.routes.contains_key("/") {
            return Err(DeployError::render("nginx site has no catch-all route"));
        }
        for prefix in self.routes.keys() {
            if !prefix.starts_with('/') {
                return Err(DeployError::render(format!("route prefix must start with '/': {}", prefix)));
            }
        }
        Ok(())
    }

    fn upstream_server(&self) -> String {
        match &self.upstream {
            BindAddress::Tcp { host, port } => {
                let host = if host == "0.0.0.0" { "127.0.0.1" } else { host };
                format!("{}:{}", host, port)
            }
            BindAddress::Unix { path } => format!("unix:{}", path),
        }
    }

    fn write_locations(&self, out: &mut String) {
        for (prefix, target) in self.ordered_routes() {
            let _ = writeln!(out);
            let _ = writeln!(out, "    location {} {{", prefix);
            match target {
                RouteTarget::Directory { root, expires } => {
                    let _ = writeln!(out, "        alias {};", root);
                    if let Some(expires) = expires {
                        let _ = writeln!(out, "        expires {};", expires);
                        let _ = writeln!(out, "        access_log off;");
                    }
                }
                RouteTarget::Upstream => {
                    let _ = writeln!(out, "        proxy_pass http://{};", self.upstream_name);
                    for (header, value) in PROXY_HEADERS {
                        let _ = writeln!(out, "        proxy_set_header {} {};", header, value);
                    }
                    let _ = writeln!(out, "        proxy_redirect off;");
                }
            }
            let _ = writeln!(out, "    }}");
        }
    }

    /// Site file contents
    pub fn render(&self) -> DeployResult<String> {
        self.validate()?;
        let names = self.server_names.join(" ");

        let mut out = String::new();
        let _ = writeln!(out, "upstream {} {{", self.upstream_name);
        let _ = writeln!(out, "    server {} fail_timeout=0;", self.upstream_server());
        let _ = writeln!(out, "}}");
        let _ = writeln!(out);

        match &self.tls {
            None => {
                let _ = writeln!(out, "server {{");
                let _ = writeln!(out, "    listen 80;");
                let _ = writeln!(out, "    server_name {};", names);
                let _ = writeln!(out, "    client_max_body_size {};", self.client_max_body_size);
                self.write_locations(&mut out);
                let _ = writeln!(out, "}}");
            }
            Some(tls) => {
                let _ = writeln!(out, "server {{");
                let _ = writeln!(out, "    listen 80;");
                let _ = writeln!(out, "    server_name {};", names);
                let _ = writeln!(out, "    return 301 https://$host$request_uri;");
                let _ = writeln!(out, "}}");
                let _ = writeln!(out);
                let _ = writeln!(out, "server {{");
                let _ = writeln!(out, "    listen 443 ssl;");
                let _ = writeln!(out, "    server_name {};", names);
                let _ = writeln!(out, "    ssl_certificate {};", tls.certificate);
                let _ = writeln!(out, "    ssl_certificate_key {};", tls.certificate_key);
                let _ = writeln!(out, "    client_max_body_size {};", self.client_max_body_size);
                self.write_locations(&mut out);
                let _ = writeln!(out, "}}");
            }
        }
        Ok(out)
    }
}
