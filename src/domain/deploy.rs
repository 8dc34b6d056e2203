//! Deployment domain model
//!
//! Stages, pipeline states and log lines of a deployment run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Final outcome of a deployment run
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    Running,
    Success,
    Failed,
    /// Health check failed and the previous release was restored
    RolledBack,
}

impl DeployStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStatus::Running => "running",
            DeployStatus::Success => "success",
            DeployStatus::Failed => "failed",
            DeployStatus::RolledBack => "rolled_back",
        }
    }

    /// Whether the run has ended
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeployStatus::Running)
    }
}

/// Stage status
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// The ordered steps a pipeline can run
///
/// Declaration order is execution order.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    InstallPackages,
    Backup,
    Update,
    InstallDependencies,
    MaterializeEnvironment,
    Migrate,
    CollectStatic,
    Reload,
    HealthCheck,
    /// Restore of the pre-deploy backup after a failed health check
    Rollback,
}

impl StageKind {
    /// Stages of a regular deploy
    pub const DEPLOY: [StageKind; 8] = [
        StageKind::Backup,
        StageKind::Update,
        StageKind::InstallDependencies,
        StageKind::MaterializeEnvironment,
        StageKind::Migrate,
        StageKind::CollectStatic,
        StageKind::Reload,
        StageKind::HealthCheck,
    ];

    /// Stages of a fresh-host provision: packages first, then a full deploy
    pub const PROVISION: [StageKind; 9] = [
        StageKind::InstallPackages,
        StageKind::Backup,
        StageKind::Update,
        StageKind::InstallDependencies,
        StageKind::MaterializeEnvironment,
        StageKind::Migrate,
        StageKind::CollectStatic,
        StageKind::Reload,
        StageKind::HealthCheck,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::InstallPackages => "install_packages",
            StageKind::Backup => "backup",
            StageKind::Update => "update",
            StageKind::InstallDependencies => "install_dependencies",
            StageKind::MaterializeEnvironment => "materialize_environment",
            StageKind::Migrate => "migrate",
            StageKind::CollectStatic => "collect_static",
            StageKind::Reload => "reload",
            StageKind::HealthCheck => "health_check",
            StageKind::Rollback => "rollback",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            StageKind::InstallPackages => "Install Packages",
            StageKind::Backup => "Backup",
            StageKind::Update => "Code Update",
            StageKind::InstallDependencies => "Install Dependencies",
            StageKind::MaterializeEnvironment => "Materialize Environment",
            StageKind::Migrate => "Database Migration",
            StageKind::CollectStatic => "Collect Static Assets",
            StageKind::Reload => "Reload Services",
            StageKind::HealthCheck => "Health Check",
            StageKind::Rollback => "Rollback",
        }
    }

    /// Pipeline state while this stage runs
    pub fn state(&self) -> PipelineState {
        match self {
            StageKind::InstallPackages => PipelineState::InstallingPackages,
            StageKind::Backup => PipelineState::BackingUp,
            StageKind::Update => PipelineState::Updating,
            StageKind::InstallDependencies => PipelineState::InstallingDependencies,
            StageKind::MaterializeEnvironment => PipelineState::MaterializingEnvironment,
            StageKind::Migrate => PipelineState::Migrating,
            StageKind::CollectStatic => PipelineState::CollectingAssets,
            StageKind::Reload => PipelineState::Reloading,
            StageKind::HealthCheck => PipelineState::HealthChecking,
            StageKind::Rollback => PipelineState::RollingBack,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Deployment pipeline state machine
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Pending,
    InstallingPackages,
    BackingUp,
    Updating,
    InstallingDependencies,
    MaterializingEnvironment,
    Migrating,
    CollectingAssets,
    Reloading,
    HealthChecking,
    Succeeded,
    Failed,
    RollingBack,
    RolledBack,
}

impl PipelineState {
    /// Position of a working state in the forward sequence
    fn step_index(&self) -> Option<usize> {
        let idx = match self {
            PipelineState::InstallingPackages => 0,
            PipelineState::BackingUp => 1,
            PipelineState::Updating => 2,
            PipelineState::InstallingDependencies => 3,
            PipelineState::MaterializingEnvironment => 4,
            PipelineState::Migrating => 5,
            PipelineState::CollectingAssets => 6,
            PipelineState::Reloading => 7,
            PipelineState::HealthChecking => 8,
            _ => return None,
        };
        Some(idx)
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Succeeded | PipelineState::RolledBack
        )
    }

    /// Legal transitions
    ///
    /// A run starts at package installation (provision) or backup (deploy) and
    /// then advances one stage at a time. Any working state may fail. A failed
    /// rollback ends in `Failed` again.
    ///
    /// `Failed → RollingBack` is only legal after a failed health check. That
    /// depends on where the run failed, so it is decided by [`can_roll_back`].
    ///
    /// [`can_roll_back`]: PipelineState::can_roll_back
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (*self, next) {
            (Pending, InstallingPackages) | (Pending, BackingUp) | (Pending, Failed) => true,
            (HealthChecking, Succeeded) => true,
            (RollingBack, RolledBack) | (RollingBack, Failed) => true,
            (cur, Failed) => cur.step_index().is_some(),
            (cur, n) => match (cur.step_index(), n.step_index()) {
                (Some(a), Some(b)) => b == a + 1,
                _ => false,
            },
        }
    }

    /// Whether a run that failed in `failed_from` may enter rollback
    pub fn can_roll_back(failed_from: Option<PipelineState>) -> bool {
        failed_from == Some(PipelineState::HealthChecking)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Pending => "pending",
            PipelineState::InstallingPackages => "installing_packages",
            PipelineState::BackingUp => "backing_up",
            PipelineState::Updating => "updating",
            PipelineState::InstallingDependencies => "installing_dependencies",
            PipelineState::MaterializingEnvironment => "materializing_environment",
            PipelineState::Migrating => "migrating",
            PipelineState::CollectingAssets => "collecting_assets",
            PipelineState::Reloading => "reloading",
            PipelineState::HealthChecking => "health_checking",
            PipelineState::Succeeded => "succeeded",
            PipelineState::Failed => "failed",
            PipelineState::RollingBack => "rolling_back",
            PipelineState::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment stage info
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployStage {
    pub kind: StageKind,
    /// Display name (e.g. "Database Migration")
    pub display_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Duration in milliseconds
    pub duration_ms: Option<i64>,
    pub status: StageStatus,
    pub message: Option<String>,
}

impl DeployStage {
    /// Create a pending stage
    pub fn new(kind: StageKind) -> Self {
        Self {
            kind,
            display_name: kind.display_name().to_string(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            status: StageStatus::Pending,
            message: None,
        }
    }

    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
    }

    pub fn finish(&mut self, success: bool, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = if success {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };
        self.message = message;
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }

    pub fn skip(&mut self, reason: Option<String>) {
        self.status = StageStatus::Skipped;
        self.message = reason;
    }
}

/// Where the release comes from
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReleaseSource {
    /// Fetch a branch on the host (clone on first deploy)
    Git { repo_url: Option<String>, branch: String },
    /// Push an already-built local tree with rsync
    LocalTree { path: PathBuf },
}

impl ReleaseSource {
    pub fn name(&self) -> &'static str {
        match self {
            ReleaseSource::Git { .. } => "git",
            ReleaseSource::LocalTree { .. } => "local_tree",
        }
    }
}

/// Log line
#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: String, // stdout | stderr
    pub content: String,
}

impl LogLine {
    pub fn new(stream: &str, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: stream.to_string(),
            content: content.into(),
        }
    }

    pub fn stdout(content: impl Into<String>) -> Self {
        Self::new("stdout", content)
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self::new("stderr", content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_status_as_str() {
        assert_eq!(DeployStatus::Running.as_str(), "running");
        assert_eq!(DeployStatus::Success.as_str(), "success");
        assert_eq!(DeployStatus::Failed.as_str(), "failed");
        assert_eq!(DeployStatus::RolledBack.as_str(), "rolled_back");
    }

    #[test]
    fn test_deploy_status_is_terminal() {
        assert!(!DeployStatus::Running.is_terminal());
        assert!(DeployStatus::Success.is_terminal());
        assert!(DeployStatus::Failed.is_terminal());
        assert!(DeployStatus::RolledBack.is_terminal());
    }

    #[test]
    fn test_deploy_stage_lifecycle() {
        let mut stage = DeployStage::new(StageKind::Migrate);
        assert_eq!(stage.status, StageStatus::Pending);
        assert_eq!(stage.display_name, "Database Migration");

        stage.start();
        assert_eq!(stage.status, StageStatus::Running);
        assert!(stage.started_at.is_some());

        stage.finish(true, Some("Done".to_string()));
        assert_eq!(stage.status, StageStatus::Success);
        assert!(stage.finished_at.is_some());
        assert!(stage.duration_ms.is_some());
    }

    #[test]
    fn test_stage_order_matches_declaration() {
        let mut sorted = StageKind::DEPLOY;
        sorted.sort();
        assert_eq!(sorted, StageKind::DEPLOY);
        assert_eq!(&StageKind::PROVISION[1..], &StageKind::DEPLOY[..]);
    }

    #[test]
    fn test_forward_transitions() {
        use PipelineState::*;
        assert!(Pending.can_transition_to(BackingUp));
        assert!(BackingUp.can_transition_to(Updating));
        assert!(Migrating.can_transition_to(CollectingAssets));
        assert!(HealthChecking.can_transition_to(Succeeded));
        assert!(!Migrating.can_transition_to(BackingUp));
        assert!(!Succeeded.can_transition_to(Migrating));
        assert!(!Reloading.can_transition_to(Succeeded));
    }

    #[test]
    fn test_stages_cannot_be_skipped() {
        use PipelineState::*;
        assert!(Pending.can_transition_to(InstallingPackages));
        assert!(InstallingPackages.can_transition_to(BackingUp));
        assert!(!Pending.can_transition_to(Migrating));
        assert!(!Pending.can_transition_to(HealthChecking));
        assert!(!BackingUp.can_transition_to(Reloading));
        assert!(!Updating.can_transition_to(Migrating));
        assert!(!Pending.can_transition_to(RollingBack));

        for pair in StageKind::PROVISION.windows(2) {
            assert!(pair[0].state().can_transition_to(pair[1].state()));
        }
    }

    #[test]
    fn test_failure_and_rollback_transitions() {
        use PipelineState::*;
        assert!(Migrating.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(RollingBack));
        assert!(PipelineState::can_roll_back(Some(HealthChecking)));
        assert!(!PipelineState::can_roll_back(Some(Migrating)));
        assert!(!PipelineState::can_roll_back(Some(Reloading)));
        assert!(!PipelineState::can_roll_back(None));
        assert!(RollingBack.can_transition_to(RolledBack));
        assert!(RollingBack.can_transition_to(Failed));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!RolledBack.can_transition_to(RollingBack));
        assert!(!Failed.can_transition_to(Succeeded));
        assert!(RolledBack.is_terminal());
        assert!(!Failed.is_terminal());
    }

    #[test]
    fn test_log_line_creation() {
        let line = LogLine::stdout("Hello");
        assert_eq!(line.stream, "stdout");
        assert_eq!(line.content, "Hello");

        let line = LogLine::stderr("Error");
        assert_eq!(line.stream, "stderr");
    }
}
