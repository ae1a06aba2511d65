// Brain - personal cognitive sidecar
//
// A long-lived service giving a conversational agent persistent memory
// (key/value with full-text search and tiering), a queued code-execution
// facility with audit logs, and ephemeral per-conversation sessions.
//
// Architecture:
// - Server process (`brain serve`): memory, sessions, orchestrator, the
//   read-only monitoring API, and the maintenance timers
// - Worker process (`brain worker`): claims queued executions atomically,
//   spawns child interpreters, streams output to log files
// - Both share one SQLite store in WAL mode; the atomic claim is the only
//   cross-process synchronization beyond WAL itself

mod cli;
mod config;
mod error;
mod executions;
mod memory;
mod monitor;
mod ops;
mod orchestrator;
mod sessions;
mod startup;
mod store;
mod util;
mod worker;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use config::Config;
use orchestrator::{Components, MaintenanceConfig, Orchestrator};
use std::time::Duration;
use store::Store;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Maintenance cadences: rebalance hourly, stale sweep every minute,
/// session cleanup every five minutes.
const REBALANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Idle delay between claim polls in the worker.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config management handles and exits before any runtime spins up.
    if let Commands::Config { show, reset, path } = &cli.command {
        cli::handle_config(*show, *reset, *path);
        return Ok(());
    }

    Config::ensure_config_exists();
    let config = Config::load();

    // Keep the non-blocking writer guard alive for the process lifetime.
    let _log_guard = init_tracing(&config);

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Worker {
            concurrency,
            worker_id,
        } => run_worker(config, concurrency, worker_id).await,
        Commands::Config { .. } => unreachable!("handled above"),
    }
}

/// Initialize tracing with conditional file output.
///
/// Precedence: RUST_LOG env var > config file level > default "info".
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_filter = format!("brain={},tower_http=info,axum=info", config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    if config.logging.file_enabled {
        let appender = tracing_appender::rolling::daily(config.log_dir(), "brain.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        None
    }
}

/// The server process: open + migrate the store, build components, sweep
/// stale claims once, start maintenance timers, then serve the monitoring
/// API until ctrl-c.
async fn serve(config: Config) -> Result<()> {
    startup::print_startup(&config);
    startup::log_startup(&config);

    let store = Store::open(config.db_path())?;
    let components = Components::build(
        store,
        config.hot_capacity,
        config.session_timeout_hours,
        config.executions_dir(),
    )?;
    let orchestrator = Orchestrator::new(components);

    // Recover anything a dead worker left behind before accepting work.
    let recovered = orchestrator
        .components()
        .executions
        .sweep_stale_claims(config.stale_claim_after(), &config.workers_dir())?;
    if recovered > 0 {
        tracing::info!(recovered, "startup stale-claim sweep");
    }

    let maintenance = orchestrator.start_maintenance(MaintenanceConfig {
        rebalance_interval: REBALANCE_INTERVAL,
        stale_sweep_interval: STALE_SWEEP_INTERVAL,
        session_cleanup_interval: SESSION_CLEANUP_INTERVAL,
        stale_claim_after: config.stale_claim_after(),
        workers_dir: config.workers_dir(),
    });

    let listener = tokio::net::TcpListener::bind(config.monitor_addr).await?;
    tracing::info!(addr = %config.monitor_addr, "monitoring API listening");

    axum::serve(listener, monitor::router(orchestrator))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    for task in maintenance {
        task.abort();
    }
    tracing::info!("shutdown complete");
    Ok(())
}

/// A worker process: claim loops on dedicated threads until ctrl-c.
async fn run_worker(
    config: Config,
    concurrency: Option<usize>,
    worker_id: Option<String>,
) -> Result<()> {
    let worker_id = worker_id.unwrap_or_else(default_worker_id);
    let concurrency = config.worker.clamp(concurrency);

    let store = Store::open(config.db_path())?;
    let handle = worker::start(
        store,
        worker::WorkerConfig {
            worker_id: worker_id.clone(),
            concurrency,
            exec_dir: config.executions_dir(),
            workers_dir: config.workers_dir(),
            wall_clock_limit: config.execution_timeout(),
            inline_output_cap: config.inline_output_cap,
            poll_interval: WORKER_POLL_INTERVAL,
        },
    )?;

    tracing::info!(%worker_id, concurrency, "worker running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    // stop() joins claim-loop threads; keep the async runtime responsive.
    tokio::task::spawn_blocking(move || handle.stop()).await?;
    Ok(())
}

/// hostname-pid, stable enough to correlate heartbeats with claims.
fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".into());
    format!("{host}-{}", std::process::id())
}
