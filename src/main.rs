use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use fastdl_mirror::mirror::{Backend, BackendReport, Compress, EngineSettings, MirrorEngine, ProcessedStore, Scheduler};
use fastdl_mirror::utils::{config::AppConfig, logging};

/// FastDL file compression tool for game server content
#[derive(Parser, Debug)]
#[command(
    name = "fastdl-mirror",
    version,
    disable_version_flag = true,
    about = "FastDL file compression tool for game server content",
    after_help = "EXAMPLES:\n    \
        fastdl-mirror                          # Normal operation\n    \
        fastdl-mirror --once                   # Process once and exit\n    \
        fastdl-mirror --debug                  # Enable debug logging\n    \
        fastdl-mirror --config myconfig.json"
)]
struct CliArgs {
    /// Show version information
    #[arg(short = 'v', long, action = ArgAction::Version)]
    version: Option<bool>,

    /// Use custom config file
    #[arg(long, value_name = "PATH", default_value = "config.json")]
    config: PathBuf,

    /// Process once and exit (no continuous monitoring)
    #[arg(long)]
    once: bool,

    /// Enable 24x7 continuous monitoring
    #[arg(long = "24x7")]
    run_24x7: bool,

    /// Enable debug logging (shows file details)
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    // A missing .env is the normal case
    dotenvy::dotenv().ok();
    let log = logging::init_tracing(args.debug);

    match run(args, log).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CliArgs, log: logging::LogHandle) -> Result<()> {
    let mut config = AppConfig::load(&args.config);
    if args.debug {
        config.debug_logs = true;
        info!("Debug mode enabled via command line");
    }
    if args.run_24x7 {
        config.run_24x7 = true;
    }
    log.set_debug(config.debug_logs);

    info!("Starting FastDL Mirror v{}", env!("CARGO_PKG_VERSION"));
    log_configuration(&args.config, &config);

    let tools = BackendReport::probe();
    tools.log();
    let backend = Backend::from_report(&tools, Duration::from_secs(config.compression_timeout_secs))
        .context("Failed to initialize compression tools")?;
    info!("Using compression backend: {}", backend.kind());

    let store = ProcessedStore::new(&config.processed_files_path);
    let processed = store
        .load()
        .with_context(|| format!("Cannot read processed list {}", config.processed_files_path.display()))?;

    let settings = EngineSettings::from_config(&config);
    info!("Compression workers: {} (batches of {})", settings.workers, settings.batch_size);
    let engine = MirrorEngine::new(settings, Arc::new(backend), store, processed)
        .context("Failed to start processing engine")?;

    let mut scheduler = Scheduler::new(
        Arc::new(engine),
        config.servers.clone(),
        Duration::from_secs(config.check_interval),
    );

    let shutdown = scheduler.shutdown_flag();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.store(true, Ordering::SeqCst);
    });

    if args.once || !config.run_24x7 {
        info!("Mode: process once and exit");
        scheduler.run_once().await?;
        info!("Processing completed. Exiting.");
    } else {
        info!("Mode: 24x7 continuous monitoring (press Ctrl+C to stop)");
        scheduler.run_continuous().await?;
        info!("Stopped gracefully");
    }

    Ok(())
}

fn log_configuration(path: &Path, config: &AppConfig) {
    info!("Configuration loaded from: {}", path.display());
    info!("Check interval: {} seconds", config.check_interval);
    info!("24x7 mode: {}", config.run_24x7);
    info!("Debug logs: {}", config.debug_logs);
    info!("Processed files path: {}", config.processed_files_path.display());
    info!("File types: {}", config.file_types);
    info!("Watching {} file extensions", config.extensions().len());
    info!("Loaded {} server configurations", config.servers.len());
    for server in &config.servers {
        info!("  {}", server.name);
        info!("    Source: {}", server.source.display());
        info!("    Destination: {}", server.destination.display());
    }
    if config.servers.is_empty() {
        warn!("No servers configured; add entries under \"Servers\" in {}", path.display());
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, finishing current batch");
}
