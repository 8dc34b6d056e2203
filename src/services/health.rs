//! Health probes
//!
//! The local probe talks HTTP from the orchestrator to the public URL. The
//! remote probe runs curl on the host against the application binding, so a
//! broken proxy and a broken application can be told apart.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::app::BindAddress;
use crate::domain::health::{classify, HealthReport, HealthVerdict, Vantage};
use crate::error::{DeployError, DeployResult};
use crate::infra::command::{shell_quote, CommandOutput};
use crate::infra::remote::RemoteExecutor;

/// Something that can judge a liveness URL
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, url: &str) -> HealthReport;
}

/// reqwest-backed probe
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> DeployResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeployError::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self, url: &str) -> HealthReport {
        tracing::debug!(url = %url, "Probing liveness endpoint");

        let (status_code, verdict) = match self.client.get(url).send().await {
            Ok(response) => {
                let code = response.status().as_u16();
                match response.text().await {
                    Ok(body) => (Some(code), classify(Some(code), &body)),
                    Err(e) => (
                        Some(code),
                        HealthVerdict::unhealthy(format!("failed to read body: {}", e)),
                    ),
                }
            }
            Err(e) if e.is_timeout() => (None, HealthVerdict::unhealthy("request timed out")),
            Err(e) if e.is_connect() => (
                None,
                HealthVerdict::unhealthy(format!("connection failed: {}", e)),
            ),
            Err(e) => (None, HealthVerdict::unhealthy(format!("request failed: {}", e))),
        };

        HealthReport::new(Vantage::Local, url, status_code, verdict)
    }
}

/// URL the remote probe requests
pub fn remote_probe_url(bind: &BindAddress, path: &str) -> String {
    format!("{}{}", bind.base_url(), path)
}

/// curl invocation printing the body, a newline, then the status code
///
/// `host` is sent as the `Host` header so Django's `ALLOWED_HOSTS` check sees
/// the public domain rather than the loopback address. curl reports `000`
/// when no response arrived; the exit status is ignored so the status line
/// always gets printed.
pub fn remote_probe_script(bind: &BindAddress, path: &str, host: &str, timeout: Duration) -> String {
    let mut cmd = format!(
        "curl -sS --noproxy '*' --max-time {} -H {}",
        timeout.as_secs().max(1),
        shell_quote(&format!("Host: {}", host))
    );
    if let BindAddress::Unix { path } = bind {
        cmd.push_str(&format!(" --unix-socket {}", shell_quote(path)));
    }
    cmd.push_str(&format!(
        " -w '\\n%{{http_code}}' {} || true",
        shell_quote(&remote_probe_url(bind, path))
    ));
    cmd
}

/// Turn the remote curl output into a verdict
pub fn parse_remote_probe(output: &CommandOutput) -> (Option<u16>, HealthVerdict) {
    let stdout = output.stdout.trim_end_matches('\n');
    let (body, code) = match stdout.rsplit_once('\n') {
        Some((body, code)) => (body, code),
        None => ("", stdout),
    };

    match code.trim().parse::<u16>() {
        Ok(code) if code != 0 => (Some(code), classify(Some(code), body)),
        _ => {
            let reason = match output.stderr.trim() {
                "" => "no response".to_string(),
                _ => format!("no response: {}", output.last_error_line()),
            };
            (None, HealthVerdict::unhealthy(reason))
        }
    }
}

/// Probe the application binding from the host itself
pub async fn probe_remote(
    executor: &dyn RemoteExecutor,
    bind: &BindAddress,
    path: &str,
    host: &str,
    timeout: Duration,
) -> HealthReport {
    let url = remote_probe_url(bind, path);
    let target = match bind {
        BindAddress::Unix { path: socket } => format!("{} via {}", url, socket),
        BindAddress::Tcp { .. } => url,
    };

    let (status_code, verdict) = match executor.run(&remote_probe_script(bind, path, host, timeout)).await {
        Ok(output) if output.success() => parse_remote_probe(&output),
        Ok(output) => (
            None,
            HealthVerdict::unhealthy(format!(
                "probe command failed (exit code {})",
                output.exit_code
            )),
        ),
        Err(e) => (None, HealthVerdict::unhealthy(format!("probe command failed: {}", e))),
    };

    HealthReport::new(Vantage::Remote, target, status_code, verdict)
}
