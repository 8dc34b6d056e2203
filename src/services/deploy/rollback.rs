//! Rollback
//!
//! Restores the backup taken at the start of the same run after the health
//! check failed. The database schema is left as migrated.

use crate::domain::deploy::{DeployStage, PipelineState, StageKind};
use crate::domain::health::HealthReport;
use crate::domain::record::DeploymentRecord;
use crate::error::{DeployError, DeployResult};
use crate::services::backup;

use super::context::DeployContext;
use super::pipeline::{failure_reason, probe_both};
use super::steps;

/// Roll the host back to `record.backup_archive`
///
/// Moves the record from `Failed` through `RollingBack` to `RolledBack`, or
/// back to `Failed` when the restore itself fails.
pub async fn run(ctx: &DeployContext, record: &mut DeploymentRecord) -> DeployResult<()> {
    let archive = record
        .backup_archive
        .clone()
        .ok_or_else(|| DeployError::config("no backup archive recorded for this run"))?;

    record.transition(PipelineState::RollingBack)?;
    let mut stage = DeployStage::new(StageKind::Rollback);
    stage.start();

    ctx.log_stderr(&format!(
        "Rolling back to {} from {}",
        record.previous_release_id.as_deref().unwrap_or("the previous tree"),
        archive
    ))
    .await;
    tracing::warn!(
        release_id = %record.release_id,
        archive = %archive,
        "Rolling back"
    );

    match restore(ctx, &archive).await {
        Ok(reports) => {
            record.health_reports.extend(reports);
            stage.finish(true, Some(format!("restored {}", archive)));
            record.stages.push(stage);
            record.transition(PipelineState::RolledBack)?;
            ctx.log_stdout("Rollback complete").await;
            Ok(())
        }
        Err((e, reports)) => {
            record.health_reports.extend(reports);
            stage.finish(false, Some(e.to_string()));
            record.stages.push(stage);
            record.transition(PipelineState::Failed)?;
            record.error = Some(match record.error.take() {
                Some(previous) => format!("{}; rollback failed: {}", previous, e),
                None => format!("rollback failed: {}", e),
            });
            ctx.log_stderr(&format!("Rollback failed: {}", e)).await;
            tracing::error!(release_id = %record.release_id, error = %e, "Rollback failed");
            Err(e)
        }
    }
}

/// Restore the tree, reinstall dependencies, restart, then probe once
async fn restore(
    ctx: &DeployContext,
    archive: &str,
) -> Result<Vec<HealthReport>, (DeployError, Vec<HealthReport>)> {
    let app = &ctx.config.app;
    let kind = StageKind::Rollback;

    let scripts = [
        backup::restore_script(app, archive),
        steps::install_dependencies(app),
        steps::restart_services(app),
    ];
    for script in &scripts {
        ctx.run_root(kind, script).await.map_err(|e| (e, Vec::new()))?;
    }

    let url = ctx.config.public_health_url().map_err(|e| (e, Vec::new()))?;
    let domain = ctx.config.domain().map_err(|e| (e, Vec::new()))?;
    let reports = probe_both(ctx, &url, &domain, ctx.config.health.settle_delay()).await;
    if reports.iter().all(HealthReport::is_healthy) {
        Ok(reports)
    } else {
        let reason = failure_reason(&reports);
        Err((DeployError::Unhealthy(reason), reports))
    }
}
