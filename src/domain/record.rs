//! Deployment record
//!
//! Versioned record of a deployment attempt: which release went out, what it
//! replaced, which backup protects it and how it ended. The record history
//! replaces reasoning about ambient remote state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::deploy::{DeployStage, DeployStatus, PipelineState, ReleaseSource, StageKind};
use super::health::{HealthReport, HealthStatus};
use crate::error::{DeployError, DeployResult};

/// Record of one deployment attempt
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Release identifier (`YYYYmmdd-HHMMSS-xxxxxxxx`)
    pub release_id: String,
    /// Release that was live before this attempt
    pub previous_release_id: Option<String>,
    pub host: String,
    /// Who ran the deployment
    #[serde(default)]
    pub operator: Option<String>,
    pub source: ReleaseSource,
    pub state: PipelineState,
    pub status: DeployStatus,
    /// Backup archive taken before this attempt
    pub backup_archive: Option<String>,
    /// SHA-256 of the live environment file
    pub env_digest: Option<String>,
    pub health: HealthStatus,
    #[serde(default)]
    pub health_reports: Vec<HealthReport>,
    #[serde(default)]
    pub stages: Vec<DeployStage>,
    pub failed_stage: Option<StageKind>,
    /// Working state the pipeline was in when it failed
    #[serde(default)]
    pub failed_from: Option<PipelineState>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DeploymentRecord {
    pub fn new(release_id: String, host: String, source: ReleaseSource, previous_release_id: Option<String>) -> Self {
        Self {
            release_id,
            previous_release_id,
            host,
            operator: None,
            source,
            state: PipelineState::Pending,
            status: DeployStatus::Running,
            backup_archive: None,
            env_digest: None,
            health: HealthStatus::Unknown,
            health_reports: Vec::new(),
            stages: Vec::new(),
            failed_stage: None,
            failed_from: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Release currently serving traffic according to this record
    pub fn live_release(&self) -> Option<&str> {
        match self.status {
            DeployStatus::Success => Some(&self.release_id),
            DeployStatus::RolledBack => self.previous_release_id.as_deref(),
            _ => None,
        }
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }

    /// Move the pipeline to `next`, rejecting illegal moves
    pub fn transition(&mut self, next: PipelineState) -> DeployResult<()> {
        let allowed = match (self.state, next) {
            (PipelineState::Failed, PipelineState::RollingBack) => {
                PipelineState::can_roll_back(self.failed_from)
            }
            (current, next) => current.can_transition_to(next),
        };
        if !allowed {
            return Err(DeployError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(
            release_id = %self.release_id,
            from = %self.state,
            to = %next,
            "Pipeline transition"
        );
        if next == PipelineState::Failed && self.state != PipelineState::RollingBack {
            self.failed_from = Some(self.state);
        }
        self.state = next;
        Ok(())
    }

    pub fn complete(&mut self, status: DeployStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// Generate a new release id
pub fn new_release_id() -> String {
    let short = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &short[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DeploymentRecord {
        DeploymentRecord::new(
            "20260101-000000-aaaaaaaa".to_string(),
            "app.example.com".to_string(),
            ReleaseSource::Git {
                repo_url: None,
                branch: "main".to_string(),
            },
            Some("20251231-000000-bbbbbbbb".to_string()),
        )
    }

    fn walk_to(rec: &mut DeploymentRecord, last: PipelineState) {
        for kind in StageKind::DEPLOY {
            rec.transition(kind.state()).unwrap();
            if kind.state() == last {
                return;
            }
        }
    }

    #[test]
    fn test_transition_rejects_illegal_moves() {
        let mut rec = record();
        rec.transition(PipelineState::BackingUp).unwrap();

        let err = rec.transition(PipelineState::Migrating).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid pipeline transition from backing_up to migrating"
        );
        assert_eq!(rec.state, PipelineState::BackingUp);

        let mut rec = record();
        walk_to(&mut rec, PipelineState::Migrating);
        let err = rec.transition(PipelineState::BackingUp).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid pipeline transition from migrating to backing_up"
        );
        assert_eq!(rec.state, PipelineState::Migrating);

        rec.transition(PipelineState::CollectingAssets).unwrap();
        rec.transition(PipelineState::Reloading).unwrap();
        rec.transition(PipelineState::HealthChecking).unwrap();
        rec.transition(PipelineState::Succeeded).unwrap();
        assert!(rec.transition(PipelineState::Migrating).is_err());
    }

    #[test]
    fn test_rollback_only_after_failed_health_check() {
        let mut rec = record();
        walk_to(&mut rec, PipelineState::Migrating);
        rec.transition(PipelineState::Failed).unwrap();
        assert_eq!(rec.failed_from, Some(PipelineState::Migrating));

        let err = rec.transition(PipelineState::RollingBack).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid pipeline transition from failed to rolling_back"
        );
        assert_eq!(rec.state, PipelineState::Failed);

        let mut rec = record();
        walk_to(&mut rec, PipelineState::HealthChecking);
        rec.transition(PipelineState::Failed).unwrap();
        rec.transition(PipelineState::RollingBack).unwrap();
        rec.transition(PipelineState::Failed).unwrap();
        assert_eq!(rec.failed_from, Some(PipelineState::HealthChecking));
    }

    #[test]
    fn test_release_id_format() {
        let id = new_release_id();
        assert_eq!(id.len(), "20260101-000000-".len() + 8);
        assert_ne!(id, new_release_id());
    }

    #[test]
    fn test_live_release() {
        let mut rec = record();
        assert_eq!(rec.live_release(), None);

        rec.complete(DeployStatus::Success);
        assert_eq!(rec.live_release(), Some("20260101-000000-aaaaaaaa"));

        rec.complete(DeployStatus::RolledBack);
        assert_eq!(rec.live_release(), Some("20251231-000000-bbbbbbbb"));

        rec.complete(DeployStatus::Failed);
        assert_eq!(rec.live_release(), None);
    }

    #[test]
    fn test_record_json_shape() {
        let rec = record();
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["state"], "pending");
        assert_eq!(json["status"], "running");
        assert_eq!(json["health"], "unknown");
        assert_eq!(json["source"]["type"], "git");
    }
}
