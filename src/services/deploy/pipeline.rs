//! Deployment pipeline
//!
//! Runs the stages in order. The first failing stage stops the run and every
//! later stage is marked skipped. Cancellation is honoured between stages only.

use chrono::Utc;
use std::time::Duration;

use crate::domain::deploy::{DeployStage, PipelineState, ReleaseSource, StageKind, StageStatus};
use crate::domain::health::{HealthReport, HealthStatus, HealthVerdict, Vantage};
use crate::domain::record::DeploymentRecord;
use crate::error::{DeployError, DeployResult};
use crate::services::backup;
use crate::services::environment::{self, EnvFile, Substitutions};
use crate::services::health;
use crate::services::proxy::NginxSite;
use crate::services::supervisor::SystemdUnit;

use super::context::{check, DeployContext};
use super::steps;

/// Run `stages` against the host, recording progress in `record`
pub async fn run(
    ctx: &DeployContext,
    record: &mut DeploymentRecord,
    stages: &[StageKind],
) -> DeployResult<()> {
    record.stages = stages.iter().map(|kind| DeployStage::new(*kind)).collect();
    let total = stages.len();

    ctx.log_stdout(&format!(
        "=== Deploy {} to {} ===",
        record.release_id, record.host
    ))
    .await;
    ctx.log_stdout(&format!("Source: {}", describe_source(&ctx.config.source)))
        .await;
    if let Some(ref previous) = record.previous_release_id {
        ctx.log_stdout(&format!("Previous release: {}", previous)).await;
    }

    for (idx, kind) in stages.iter().copied().enumerate() {
        if ctx.is_cancelled() {
            ctx.log_stderr("Deployment cancelled").await;
            return fail(ctx, record, idx, None, DeployError::Cancelled).await;
        }

        if let Err(e) = record.transition(kind.state()) {
            record.stages[idx].finish(false, Some(e.to_string()));
            return fail(ctx, record, idx + 1, Some(kind), e).await;
        }
        record.stages[idx].start();
        ctx.log_stdout(&format!(
            "[{}/{}] {}...",
            idx + 1,
            total,
            kind.display_name()
        ))
        .await;

        match run_stage(ctx, record, kind).await {
            Ok(message) => {
                if let Some(ref message) = message {
                    ctx.log_stdout(&format!("{}: {}", kind.display_name(), message)).await;
                }
                record.stages[idx].finish(true, message);
            }
            Err(e) => {
                record.stages[idx].finish(false, Some(e.to_string()));
                return fail(ctx, record, idx + 1, Some(kind), e).await;
            }
        }
    }

    record.transition(PipelineState::Succeeded)?;
    tracing::info!(
        release_id = %record.release_id,
        host = %record.host,
        "Deployment pipeline succeeded"
    );
    Ok(())
}

/// Mark the run failed, skipping every stage from `skip_from` on
async fn fail(
    ctx: &DeployContext,
    record: &mut DeploymentRecord,
    skip_from: usize,
    failed_stage: Option<StageKind>,
    err: DeployError,
) -> DeployResult<()> {
    let reason = match err {
        DeployError::Cancelled => "cancelled",
        _ => "previous stage failed",
    };
    for stage in record.stages.iter_mut().skip(skip_from) {
        stage.skip(Some(reason.to_string()));
    }

    record.failed_stage = failed_stage;
    record.error = Some(err.to_string());
    record.transition(PipelineState::Failed)?;

    ctx.log_stderr(&format!("Error: {}", err)).await;
    tracing::error!(
        release_id = %record.release_id,
        stage = ?failed_stage,
        error = %err,
        "Deployment pipeline failed"
    );
    Err(err)
}

async fn run_stage(
    ctx: &DeployContext,
    record: &mut DeploymentRecord,
    kind: StageKind,
) -> DeployResult<Option<String>> {
    let app = &ctx.config.app;

    match kind {
        StageKind::InstallPackages => {
            ctx.run_root(kind, &steps::install_packages(app)).await?;
            Ok(None)
        }
        StageKind::Backup => {
            let archive = backup::archive_path(app, Utc::now(), &record.release_id);
            ctx.run_root(kind, &backup::create_script(app, &archive)).await?;
            record.backup_archive = Some(archive.clone());
            Ok(Some(archive))
        }
        StageKind::Update => update(ctx, kind).await,
        StageKind::InstallDependencies => {
            ctx.run_root(kind, &steps::install_dependencies(app)).await?;
            Ok(None)
        }
        StageKind::MaterializeEnvironment => {
            let digest = materialize_env(ctx, kind).await?;
            let short = format!("sha256:{}", &digest[..12]);
            record.env_digest = Some(digest);
            Ok(Some(short))
        }
        StageKind::Migrate => {
            ctx.run_root(kind, &steps::migrate(app)).await?;
            Ok(None)
        }
        StageKind::CollectStatic => {
            ctx.run_root(kind, &steps::collect_static(app)).await?;
            Ok(None)
        }
        StageKind::Reload => reload(ctx, kind).await,
        StageKind::HealthCheck => health_check(ctx, record).await,
        StageKind::Rollback => Err(DeployError::config(
            "rollback runs only after a failed health check",
        )),
    }
}

fn describe_source(source: &ReleaseSource) -> String {
    match source {
        ReleaseSource::Git {
            repo_url: Some(url),
            branch,
        } => format!("git {} ({})", url, branch),
        ReleaseSource::Git { repo_url: None, branch } => format!("git origin ({})", branch),
        ReleaseSource::LocalTree { path } => format!("local tree {}", path.display()),
    }
}

async fn update(ctx: &DeployContext, kind: StageKind) -> DeployResult<Option<String>> {
    let app = &ctx.config.app;

    match &ctx.config.source {
        ReleaseSource::Git { repo_url, branch } => {
            let output = ctx
                .run_root(kind, &steps::update_git(app, repo_url.as_deref(), branch))
                .await?;
            let commit = output
                .stdout
                .lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string);
            Ok(commit.map(|c| format!("{} at {}", branch, c)))
        }
        ReleaseSource::LocalTree { path } => {
            let excludes = steps::preserved_paths(app);
            let excludes: Vec<&str> = excludes.iter().map(String::as_str).collect();
            let output = ctx
                .executor
                .push_tree(path, &app.deploy_path, &excludes)
                .await?;
            check(kind, output)?;
            ctx.run_root(kind, &steps::fix_ownership(app)).await?;
            Ok(Some(format!("pushed {}", path.display())))
        }
    }
}

/// Keep and re-validate an existing env file, or materialize a new one
///
/// Returns the digest of the live file.
async fn materialize_env(ctx: &DeployContext, kind: StageKind) -> DeployResult<String> {
    let app = &ctx.config.app;

    let exists = if ctx.config.rematerialize_env {
        false
    } else {
        let output = ctx.run_root(kind, &steps::env_file_status(app)).await?;
        output.stdout.trim() == "present"
    };

    if exists {
        let output = ctx.run_root_quiet(kind, &steps::read_file(&app.env_file)).await?;
        let env = EnvFile::parse(&output.stdout)?;
        environment::validate(&env)?;
        ctx.log_stdout(&format!("Keeping existing {}", app.env_file)).await;
        return Ok(env.digest());
    }

    let template_path = steps::env_template_path(app);
    let output = ctx.run_root_quiet(kind, &steps::read_file(&template_path)).await?;
    let template = EnvFile::parse(&output.stdout)?;

    let domain = ctx.config.domain()?;
    let env = environment::materialize(&template, &Substitutions::generate(&domain))?;

    let uploaded = steps::upload_path(app, &ctx.release_id, "env");
    ctx.upload(kind, &uploaded, env.render().as_bytes()).await?;
    ctx.run_root(kind, &steps::install_env_file(app, &uploaded)).await?;

    ctx.log_stdout(&format!(
        "Materialized {} from {}",
        app.env_file, template_path
    ))
    .await;
    Ok(env.digest())
}

async fn reload(ctx: &DeployContext, kind: StageKind) -> DeployResult<Option<String>> {
    let app = &ctx.config.app;

    let unit = SystemdUnit::from_app(app).render()?;
    let site = NginxSite::from_app(app, ctx.config.host()?).render()?;

    let unit_upload = steps::upload_path(app, &ctx.release_id, "service");
    let site_upload = steps::upload_path(app, &ctx.release_id, "nginx");
    ctx.upload(kind, &unit_upload, unit.as_bytes()).await?;
    ctx.upload(kind, &site_upload, site.as_bytes()).await?;

    let output = ctx
        .run_root(kind, &steps::install_and_reload(app, &unit_upload, &site_upload))
        .await?;
    let installed = output
        .stdout
        .lines()
        .filter(|l| l.starts_with("installed "))
        .count();

    Ok(Some(match installed {
        0 => "configuration unchanged".to_string(),
        n => format!("{} configuration file(s) updated", n),
    }))
}

/// Probe from both vantage points, with one delayed re-check
async fn health_check(
    ctx: &DeployContext,
    record: &mut DeploymentRecord,
) -> DeployResult<Option<String>> {
    let health = &ctx.config.health;
    let url = ctx.config.public_health_url()?;
    let domain = ctx.config.domain()?;

    let reports = probe_both(ctx, &url, &domain, health.settle_delay()).await;
    let healthy = reports.iter().all(HealthReport::is_healthy);
    let reason = failure_reason(&reports);
    record.health_reports.extend(reports);
    if healthy {
        record.health = HealthStatus::Healthy;
        return Ok(Some("healthy".to_string()));
    }

    ctx.log_stderr(&format!(
        "Health check failed ({}), re-checking in {}s",
        reason, health.recheck_secs
    ))
    .await;
    tokio::time::sleep(health.recheck_delay()).await;

    let reports = probe_both(ctx, &url, &domain, Duration::ZERO).await;
    let healthy = reports.iter().all(HealthReport::is_healthy);
    let reason = failure_reason(&reports);
    record.health_reports.extend(reports);
    if healthy {
        record.health = HealthStatus::Healthy;
        return Ok(Some("healthy after re-check".to_string()));
    }

    record.health = HealthStatus::Unhealthy;
    Err(DeployError::Unhealthy(reason))
}

/// Remote probe right away, local probe after `settle`
///
/// The remote probe presents `domain` as its Host.
pub(crate) async fn probe_both(
    ctx: &DeployContext,
    public_url: &str,
    domain: &str,
    settle: Duration,
) -> Vec<HealthReport> {
    let app = &ctx.config.app;
    let health = &ctx.config.health;

    let remote = health::probe_remote(
        ctx.executor.as_ref(),
        &app.bind,
        &health.path,
        domain,
        health.timeout(),
    )
    .await;
    log_report(ctx, &remote).await;

    if !settle.is_zero() {
        ctx.log_stdout(&format!("Waiting {}s before probing {}", settle.as_secs(), public_url))
            .await;
        tokio::time::sleep(settle).await;
    }

    let local = ctx.probe.check(public_url).await;
    log_report(ctx, &local).await;

    vec![remote, local]
}

async fn log_report(ctx: &DeployContext, report: &HealthReport) {
    let code = report
        .status_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "-".to_string());
    match &report.verdict {
        HealthVerdict::Healthy => {
            ctx.log_stdout(&format!(
                "{:?} probe {}: healthy (status {})",
                report.vantage, report.target, code
            ))
            .await
        }
        HealthVerdict::Unhealthy { reason } => {
            ctx.log_stderr(&format!(
                "{:?} probe {}: unhealthy (status {}): {}",
                report.vantage, report.target, code, reason
            ))
            .await
        }
    }
}

/// `remote: ...; local: ...` for the unhealthy reports
pub(crate) fn failure_reason(reports: &[HealthReport]) -> String {
    reports
        .iter()
        .filter_map(|r| match &r.verdict {
            HealthVerdict::Unhealthy { reason } => Some(format!(
                "{} {}: {}",
                match r.vantage {
                    Vantage::Remote => "remote",
                    Vantage::Local => "local",
                },
                r.target,
                reason
            )),
            HealthVerdict::Healthy => None,
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Log the per-stage outcome table
pub async fn log_summary(ctx: &DeployContext, record: &DeploymentRecord) {
    ctx.log_stdout("").await;
    ctx.log_stdout("=== Stage Summary ===").await;
    for stage in &record.stages {
        let duration = stage
            .duration_ms
            .map(|d| format!("{}ms", d))
            .unwrap_or_else(|| "-".to_string());
        let status_icon = match stage.status {
            StageStatus::Success => "✓",
            StageStatus::Failed => "✗",
            StageStatus::Skipped => "⊘",
            StageStatus::Running => "⟳",
            StageStatus::Pending => "○",
        };
        ctx.log_stdout(&format!(
            "{} {} ({})",
            status_icon, stage.display_name, duration
        ))
        .await;
    }
    ctx.log_stdout(&format!("Result: {}", record.state)).await;
}
