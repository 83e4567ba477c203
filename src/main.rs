// SPDX-License-Identifier: MIT
use anyhow::{Context as _, Result};
use clap::Parser;
use premiumarr::clock::SystemClock;
use premiumarr::config::Config;
use premiumarr::engine::Engine;
use premiumarr::fetcher::Fetcher;
use premiumarr::remote::RemoteClient;
use premiumarr::storage::Storage;
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "premiumarr",
    about = "Blackhole-to-cloud-to-local mediator daemon",
    version
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL")]
    log: Option<String>,

    /// Directory watched for incoming .nzb descriptors
    #[arg(long, env = "BLACKHOLE_PATH")]
    blackhole_path: Option<PathBuf>,

    /// Directory local fetches land in before final integration
    #[arg(long, env = "DOWNLOAD_PATH")]
    download_path: Option<PathBuf>,

    /// Directory completed jobs are moved into
    #[arg(long, env = "DONE_PATH")]
    done_path: Option<PathBuf>,

    /// Directory holding the ledger, archive, and logs
    #[arg(long, env = "CONFIG_PATH")]
    config_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_env(
        args.log,
        args.blackhole_path,
        args.download_path,
        args.done_path,
        args.config_path,
    )
    .context("failed to load configuration")?;

    config.validate_paths().context("path validation failed")?;

    let _log_guard = setup_logging(&config.log_level, &config.log_path());

    info!(version = env!("CARGO_PKG_VERSION"), "premiumarr starting");
    info!(
        blackhole = %config.blackhole_path.display(),
        download = %config.download_path.display(),
        done = %config.done_path.display(),
        config = %config.config_path.display(),
        "configured directories"
    );

    loop {
        if let Err(err) = run_once(config.clone()).await {
            error!(%err, "engine exited with an unrecoverable error — restarting after cooldown");
            let cooldown = Duration::from_secs(rand::thread_rng().gen_range(60..=120));
            tokio::time::sleep(cooldown).await;
        }
    }
}

/// Build the engine from scratch and run its driver loop until it returns an
/// error. A fresh ledger connection and fresh in-memory queues are built
/// every time this is called, so a restart after a crash always starts from
/// `recover_from_ledger`'s view of the durable state.
async fn run_once(config: Config) -> Result<()> {
    let storage = Storage::new(&config.db_path())
        .await
        .context("failed to open ledger database")?;
    let remote = RemoteClient::new(config.api_key.clone());
    let fetcher = Fetcher::new(config.download_threads, config.download_speed_limit_kb);
    let clock = SystemClock;

    let mut engine = Engine::new(storage, remote, fetcher, clock, config)
        .await
        .context("failed to initialize engine")?;
    engine.run().await
}

/// Initialize the tracing subscriber: compact output to stdout, plus a
/// daily-rolling plain-text file under `log_dir` for the web viewer to tail.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
fn setup_logging(log_level: &str, log_dir: &std::path::Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        warn!("could not create log directory '{}': {e} — falling back to stdout-only", log_dir.display());
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(log_dir, "for_webviewer.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_level))
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Some(guard)
}
