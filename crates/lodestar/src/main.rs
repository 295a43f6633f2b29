mod ca;
pub(crate) mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use lodestar_core::ca::CertificateAuthority;
use lodestar_core::delegate::HttpDelegate;
use lodestar_core::store::MemoryStore;
use lodestar_core::LodestarCore;
use tokio_util::sync::CancellationToken;

use cli::{CaCommand, Cli, Command, Config};

/// Maximum time to wait for orderly shutdown before forcing exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);

/// Brief pause after cancellation to let in-flight requests complete.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => cli.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Hold the non-blocking guards for the lifetime of main so logs flush on exit.
    let _log_guards = init_logging(env_filter, cli.log_file.as_deref())?;

    // ── Synchronous subcommands (no runtime needed) ──────────────────
    match &cli.command {
        Some(Command::Version) => {
            println!("lodestar {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(Command::Ca { command }) => {
            return match command {
                CaCommand::Create {
                    name,
                    days,
                    networks,
                    groups,
                    out_dir,
                    force,
                } => ca::create(name, *days, networks, groups, out_dir, *force),
                CaCommand::Lighthouse {
                    name,
                    out_dir,
                    force,
                } => ca::lighthouse(&Config::from_cli(&cli).core, name, out_dir, *force),
            };
        }
        Some(Command::Serve) | None => {}
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(Config::from_cli(&cli)))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    startup_diagnostics(&config);
    config.core.validate()?;

    let ca = CertificateAuthority::load(
        &config.core.ca.cert_path,
        &config.core.ca.key_path,
        config.core.authority_settings(),
    )
    .context("load certificate authority")?;

    let store = Arc::new(match &config.store {
        Some(path) => MemoryStore::open(path)
            .with_context(|| format!("open store {}", path.display()))?,
        None => {
            tracing::warn!("No --store given; certificates are kept in memory only");
            MemoryStore::new()
        }
    });
    let delegate = Arc::new(HttpDelegate::new(&config.core.delegate)?);
    let core = LodestarCore::new(&config.core, ca, store.clone(), store, delegate)?;

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();
    tasks.push(core.spawn_cache_sweeper(config.core.sweep_interval, cancel.clone()));

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    tracing::info!("HTTP API listening on {}", config.listen);

    let app = core.routes();
    let token = cancel.clone();
    tasks.push(tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = served {
            tracing::error!(error = %e, "HTTP server failed");
        }
        tracing::debug!("HTTP server stopped");
    }));

    tracing::info!("Ready.");

    shutdown_signal().await;
    tracing::info!("Shutting down...");

    let shutdown = async {
        cancel.cancel();
        tokio::time::sleep(SHUTDOWN_DRAIN).await;
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown)
        .await
        .is_err()
    {
        tracing::warn!("Shutdown timed out after {:?}, forcing exit", SHUTDOWN_TIMEOUT);
    }

    Ok(())
}

/// Wait for Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn startup_diagnostics(config: &Config) {
    tracing::info!("Lodestar v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        network = %config.core.address_plan.network(),
        lighthouse = %config.core.lighthouse.internal_ip,
        "Overlay network"
    );
    tracing::info!(
        url = %config.core.delegate.validate_url(),
        "Authentication service"
    );
    tracing::info!(
        max_requests = config.core.rate_limit.max_requests,
        window_secs = config.core.rate_limit.window.as_secs(),
        "Per-user rate limit"
    );
}

// ── Logging setup ───────────────────────────────────────────────────

/// Initialize tracing with stderr + optional file output.
/// Returns guards that must be held for the lifetime of the program
/// to ensure the non-blocking writers flush on shutdown.
fn init_logging(
    env_filter: tracing_subscriber::EnvFilter,
    log_file: Option<&std::path::Path>,
) -> anyhow::Result<Vec<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::prelude::*;

    let (nb_stderr, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(nb_stderr);

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
        return Ok(vec![stderr_guard]);
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))?;
    let (nb_file, file_guard) = tracing_appender::non_blocking(file);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(nb_file);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(vec![stderr_guard, file_guard])
}
