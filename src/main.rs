//! medplat-deploy
//!
//! Usage:
//! - Fresh host: `medplat-deploy provision --host 203.0.113.10 --domain clinic.example.org`
//! - Update: `medplat-deploy deploy`
//! - Inspect: `medplat-deploy render nginx`, `medplat-deploy status`

use anyhow::Context;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use medplat_deploy::cli::{Cli, Command, RenderTarget};
use medplat_deploy::config::env::constants;
use medplat_deploy::domain::deploy::{LogLine, StageKind};
use medplat_deploy::domain::health::HealthVerdict;
use medplat_deploy::error::exit_code;
use medplat_deploy::infra::remote::SshExecutor;
use medplat_deploy::services::container::ContainerSpec;
use medplat_deploy::services::deploy;
use medplat_deploy::services::environment::{self, EnvFile};
use medplat_deploy::services::health::{HttpProbe, Probe};
use medplat_deploy::services::proxy::NginxSite;
use medplat_deploy::services::supervisor::SystemdUnit;
use medplat_deploy::state::RecordStore;
use medplat_deploy::{DeployError, EnvConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<DeployError>()
                .map(DeployError::exit_code)
                .unwrap_or(exit_code::STEP_FAILED)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = EnvConfig::from_env();
    cli.target.apply(&mut config);

    match cli.command {
        Command::Provision(args) => {
            args.apply(&mut config);
            run_pipeline(config, &StageKind::PROVISION).await
        }
        Command::Deploy(args) => {
            args.apply(&mut config);
            run_pipeline(config, &StageKind::DEPLOY).await
        }
        Command::Render { what } => render(&config, what),
        Command::CheckEnv { file } => check_env(&file).await,
        Command::Probe { url } => probe(&config, url).await,
        Command::Status { limit } => status(&config, limit).await,
    }
}

async fn run_pipeline(config: EnvConfig, stages: &[StageKind]) -> anyhow::Result<i32> {
    config.validate()?;
    let config = Arc::new(config);

    let (log_tx, log_rx) = broadcast::channel(constants::LOG_CHANNEL_CAPACITY);
    let printer = tokio::spawn(print_logs(log_rx));

    let executor = SshExecutor::new(config.target.clone(), config.step_timeout())?
        .with_log_sender(log_tx.clone());
    let probe = HttpProbe::new(config.health.timeout())?;

    let cancel_token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel_token.clone()));

    let outcome = deploy::execute(
        config,
        Arc::new(executor),
        Arc::new(probe),
        stages,
        Some(log_tx),
        cancel_token,
    )
    .await?;

    // Every sender is gone once execute returns
    let _ = printer.await;

    let record = &outcome.record;
    match outcome.error {
        None => println!("Release {} is live", record.release_id),
        Some(ref e) => {
            eprintln!("Release {} {}: {}", record.release_id, record.status.as_str(), e);
            if let Some(live) = record.live_release() {
                eprintln!("Live release: {}", live);
            }
        }
    }
    Ok(outcome.exit_code())
}

/// Cancel the run on Ctrl-C or SIGTERM so the lock and record are released cleanly
#[cfg(unix)]
async fn cancel_on_signal(token: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            return cancel_on_interrupt(token).await;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if result.is_err() {
                return;
            }
            tracing::warn!("Interrupt received, stopping after the current stage");
        }
        _ = terminate.recv() => {
            tracing::warn!("SIGTERM received, stopping after the current stage");
        }
    }
    token.cancel();
}

#[cfg(not(unix))]
async fn cancel_on_signal(token: CancellationToken) {
    cancel_on_interrupt(token).await
}

async fn cancel_on_interrupt(token: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("Interrupt received, stopping after the current stage");
        token.cancel();
    }
}

async fn print_logs(mut rx: broadcast::Receiver<LogLine>) {
    loop {
        match rx.recv().await {
            Ok(line) if line.stream == "stderr" => eprintln!("{}", line.content),
            Ok(line) => println!("{}", line.content),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "Log printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn render(config: &EnvConfig, what: RenderTarget) -> anyhow::Result<i32> {
    let text = match what {
        RenderTarget::Unit => SystemdUnit::from_app(&config.app).render()?,
        RenderTarget::Nginx => {
            let host = config
                .target
                .host
                .as_deref()
                .or(config.app.domain.as_deref())
                .ok_or_else(|| DeployError::config("nginx site needs --host or --domain"))?;
            NginxSite::from_app(&config.app, host).render()?
        }
        RenderTarget::Dockerfile => ContainerSpec::from_app(&config.app, &config.health.path).render()?,
    };
    print!("{}", text);
    Ok(exit_code::SUCCESS)
}

async fn check_env(file: &Path) -> anyhow::Result<i32> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let env = EnvFile::parse(&text)?;
    environment::validate(&env)?;

    let missing = env.missing_optional();
    if !missing.is_empty() {
        println!("Optional keys not set: {}", missing.join(", "));
    }
    println!("{}: ok (sha256:{})", file.display(), env.digest());
    Ok(exit_code::SUCCESS)
}

async fn probe(config: &EnvConfig, url: Option<String>) -> anyhow::Result<i32> {
    let url = match url {
        Some(url) => url,
        None => config.public_health_url()?,
    };
    let report = HttpProbe::new(config.health.timeout())?.check(&url).await;

    let code = report
        .status_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "-".to_string());
    match report.verdict {
        HealthVerdict::Healthy => {
            println!("{}: healthy (status {})", url, code);
            Ok(exit_code::SUCCESS)
        }
        HealthVerdict::Unhealthy { reason } => {
            println!("{}: unhealthy (status {}): {}", url, code, reason);
            Ok(1)
        }
    }
}

async fn status(config: &EnvConfig, limit: usize) -> anyhow::Result<i32> {
    let store = RecordStore::open(&config.data_dir).await?;

    match store.current_release() {
        Some(record) => println!(
            "Live release: {} (deployed {} by {})",
            record.release_id,
            record.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            record.operator.as_deref().unwrap_or("unknown")
        ),
        None => println!("Live release: none"),
    }
    if store.is_empty() {
        return Ok(exit_code::SUCCESS);
    }

    println!();
    for record in store.history().take(limit) {
        let detail = match (&record.failed_stage, &record.error) {
            (Some(stage), _) => format!("failed at {}", stage),
            (None, Some(error)) => error.clone(),
            (None, None) => String::new(),
        };
        println!(
            "{}  {:<11}  {:<10}  {}  {}",
            record.release_id,
            record.status.as_str(),
            record.source.name(),
            record.started_at.format("%Y-%m-%d %H:%M"),
            detail
        );
    }
    Ok(exit_code::SUCCESS)
}
