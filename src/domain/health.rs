//! Liveness probe results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Value of the `status` field a healthy liveness endpoint reports
pub const HEALTHY_STATUS: &str = "healthy";

/// Last known health of a release
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Where a probe was issued from
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Vantage {
    /// On the target host, against the application binding
    Remote,
    /// From the orchestrator, against the public URL
    Local,
}

/// Outcome of one probe
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy,
    Unhealthy { reason: String },
}

impl HealthVerdict {
    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self::Unhealthy {
            reason: reason.into(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthVerdict::Healthy)
    }
}

/// A single probe report
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub vantage: Vantage,
    pub target: String,
    pub status_code: Option<u16>,
    pub verdict: HealthVerdict,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(vantage: Vantage, target: impl Into<String>, status_code: Option<u16>, verdict: HealthVerdict) -> Self {
        Self {
            vantage,
            target: target.into(),
            status_code,
            verdict,
            checked_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.verdict.is_healthy()
    }
}

/// Classify a liveness response
///
/// Healthy only for status 200 with a JSON body whose `status` field is `"healthy"`.
/// `None` means no HTTP response was received at all.
pub fn classify(status_code: Option<u16>, body: &str) -> HealthVerdict {
    let code = match status_code {
        Some(code) => code,
        None => return HealthVerdict::unhealthy("no response"),
    };
    if code != 200 {
        return HealthVerdict::unhealthy(format!("unexpected status {}", code));
    }

    let json: serde_json::Value = match serde_json::from_str(body.trim()) {
        Ok(v) => v,
        Err(e) => return HealthVerdict::unhealthy(format!("body is not JSON: {}", e)),
    };

    match json.get("status").and_then(|s| s.as_str()) {
        Some(HEALTHY_STATUS) => HealthVerdict::Healthy,
        Some(other) => HealthVerdict::unhealthy(format!("status field is {:?}", other)),
        None => HealthVerdict::unhealthy("status field missing"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_healthy() {
        let body = r#"{"status": "healthy", "database": "ok"}"#;
        assert_eq!(classify(Some(200), body), HealthVerdict::Healthy);
    }

    #[test]
    fn test_classify_non_200_is_unhealthy() {
        let body = r#"{"status": "healthy"}"#;
        for code in [201, 204, 301, 404, 500, 502, 503] {
            assert!(!classify(Some(code), body).is_healthy(), "status {}", code);
        }
    }

    #[test]
    fn test_classify_bad_bodies() {
        assert!(!classify(Some(200), "OK").is_healthy());
        assert!(!classify(Some(200), "").is_healthy());
        assert!(!classify(Some(200), r#"{"status": "degraded"}"#).is_healthy());
        assert!(!classify(Some(200), r#"{"state": "healthy"}"#).is_healthy());
        assert!(!classify(Some(200), r#"{"status": true}"#).is_healthy());
    }

    #[test]
    fn test_classify_no_response() {
        assert_eq!(classify(None, ""), HealthVerdict::unhealthy("no response"));
    }
}
