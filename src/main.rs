use anyhow::Context;
use clap::{Parser, ValueEnum};
use registry_mirror::{SyncConfig, SyncOrchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "registry-mirror", version, about = "Mirror container images between registries")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, short = 'c', env = "REGISTRY_MIRROR_CONFIG")]
    config: PathBuf,

    /// Run a single tick and exit, even if tasks have intervals
    #[arg(long)]
    once: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "REGISTRY_MIRROR_LOG_FORMAT")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}

async fn run(args: Args) -> anyhow::Result<bool> {
    let config = SyncConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let one_shot = args.once || config.is_one_off()?;
    let interval = config.tick_interval()?;

    let orchestrator = SyncOrchestrator::from_config(config).context("building orchestrator")?;

    if one_shot {
        info!("Running a single sync tick");
        let mut ticks = orchestrator.subscribe_ticks();
        orchestrator
            .start(interval.unwrap_or(Duration::from_secs(60)), 1)
            .await?;
        let report = tokio::select! {
            report = ticks.next() => report,
            () = shutdown_signal() => None,
        };
        orchestrator.shutdown().await?;

        return Ok(match report {
            Some(report) => report.is_success(),
            None => {
                warn!("Interrupted before the tick completed");
                false
            }
        });
    }

    let interval = interval.context("no periodic task configured")?;
    orchestrator.start(interval, 0).await?;
    shutdown_signal().await;
    orchestrator.shutdown().await?;

    let stats = orchestrator.stats();
    info!(
        ticks = stats.ticks_completed,
        failed = stats.ticks_failed,
        skipped = stats.ticks_skipped,
        "Exiting"
    );
    Ok(true)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_format);

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %format!("{e:#}"), "registry-mirror failed");
            ExitCode::FAILURE
        }
    }
}
