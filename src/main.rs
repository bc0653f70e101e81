use anyhow::{Context as _, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use roost::config::{default_config_path, ConfigOverrides, DaemonConfig};
use roost::engine::driver_for;
use roost::events::EventBus;
use roost::pool::{reaper, PoolManager};
use roost::{ipc, stream, AppContext};

#[derive(Parser)]
#[command(
    name = "roostd",
    about = "Roost — always-on browser engine pool daemon",
    version
)]
struct Args {
    /// Path to the TOML config file (default: ./roostd.toml)
    #[arg(long, env = "ROOSTD_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// JSON-RPC WebSocket server port
    #[arg(long, env = "ROOSTD_RPC_PORT")]
    rpc_port: Option<u16>,

    /// Event-stream WebSocket server port
    #[arg(long, env = "ROOSTD_EVENTS_PORT")]
    events_port: Option<u16>,

    /// Bind address for both listeners (default: 127.0.0.1; use 0.0.0.0 for LAN access)
    #[arg(long, env = "ROOSTD_BIND")]
    bind_address: Option<String>,

    /// Pool capacity: engines launched at startup and the session bound
    #[arg(long, env = "ROOSTD_MAX_ENGINES")]
    max_engines: Option<usize>,

    /// Engine backend: "chromium" or "mock"
    #[arg(long, env = "ROOSTD_ENGINE")]
    engine: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ROOSTD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "ROOSTD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Init once — must happen before any tracing calls.
    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let log_format =
        std::env::var("ROOSTD_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref(), &log_format);

    run_server(args).await
}

async fn run_server(args: Args) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "roostd starting");

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let config = Arc::new(DaemonConfig::load(
        Some(&config_path),
        ConfigOverrides {
            rpc_port: args.rpc_port,
            events_port: args.events_port,
            bind_address: args.bind_address,
            max_engines: args.max_engines,
            engine_type: args.engine,
            log: args.log,
        },
    ));
    info!(
        rpc_port = config.rpc_port,
        events_port = config.events_port,
        max_engines = config.max_engines,
        engine = %config.engine_type,
        "config loaded"
    );

    let driver = driver_for(&config)
        .map_err(|e| anyhow::anyhow!(e))
        .context("engine driver setup failed")?;
    let bus = EventBus::new();
    let pool = PoolManager::new(config.clone(), driver, bus.clone());

    pool.start()
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("engine pool startup failed")?;

    let ctx = Arc::new(AppContext::new(config.clone(), pool.clone(), bus));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(reaper::run(pool.clone(), shutdown_rx.clone()));

    {
        let ctx = ctx.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = ipc::run(ctx, rx).await {
                warn!(err = %e, "rpc server exited with error");
            }
        });
    }
    {
        let ctx = ctx.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = stream::run(ctx, rx).await {
                warn!(err = %e, "event server exited with error");
            }
        });
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received — draining");

    // Bounded drain: close sessions and engines, collecting errors, then
    // stop both planes. In-flight work past the deadline is cut off.
    let grace = Duration::from_secs(config.drain_grace_secs);
    match tokio::time::timeout(grace, pool.drain()).await {
        Ok(errors) if errors.is_empty() => info!("drain finished cleanly"),
        Ok(errors) => warn!(failed = errors.len(), "drain finished with session errors"),
        Err(_) => warn!(
            grace_secs = config.drain_grace_secs,
            "drain deadline exceeded — forcing shutdown"
        ),
    }

    // Flip the watch: event-plane clients get their draining notice and
    // every listener loop stops.
    let _ = shutdown_tx.send(true);
    // Give connection tasks a moment to flush close frames.
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("roostd stopped");
    Ok(())
}

/// Returns when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// `log_format` may be `"pretty"` (default) or `"json"` (structured JSON
/// for log aggregators).
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("roostd.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            if use_json {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(log_level)
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(log_level)
                    .compact()
                    .init();
            }
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if use_json {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().json())
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().compact())
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }
        Some(guard)
    } else if use_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(log_level)
            .init();
        None
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}
