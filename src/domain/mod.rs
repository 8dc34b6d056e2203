//! Domain model
//!
//! Plain data structures, independent of the remote transport

pub mod deploy;
pub mod health;
pub mod record;

// Re-exports for convenience
pub use deploy::{DeployStage, DeployStatus, LogLine, PipelineState, ReleaseSource, StageKind, StageStatus};
pub use health::{HealthReport, HealthStatus, HealthVerdict, Vantage};
pub use record::DeploymentRecord;
