#![forbid(unsafe_code)]

//! `activation-orchestrator` server binary.
//!
//! Loads configuration, opens the store, starts the orphan workspace sweep
//! and the HTTP surface, and stops every engine worker on shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use activation_orchestrator::config::GlobalConfig;
use activation_orchestrator::orchestrator::Orchestrator;
use activation_orchestrator::persistence::db;
use activation_orchestrator::store::SqliteDocumentStore;
use activation_orchestrator::workspace::sweeper;
use activation_orchestrator::{http, AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "activation-orchestrator",
    about = "Activation and deployment orchestrator for chatbot evaluations",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the HTTP port from the configuration file.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("activation-orchestrator bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    info!(
        workspace_root = %config.workspace_root.display(),
        engine = %config.engine.binary,
        "configuration loaded"
    );

    // ── Initialize database ─────────────────────────────
    let pool = Arc::new(db::connect(&config.database_path).await?);
    let store = Arc::new(SqliteDocumentStore::new(pool));
    info!("database connected");

    let orchestrator = Orchestrator::new(&config, store.clone(), store.clone())?;

    // ── Start orphan sweep ──────────────────────────────
    let ct = CancellationToken::new();
    let sweep_handle = config.sweep.enabled.then(|| {
        sweeper::spawn_sweep_task(
            Arc::clone(orchestrator.preparer()),
            store.clone(),
            std::time::Duration::from_secs(config.sweep.interval_seconds),
            config.orphan_max_age(),
            ct.clone(),
        )
    });

    // ── Start HTTP surface ──────────────────────────────
    let bind = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {bind}: {err}")))?;
    let ready_wait = if config.engine.train_before_launch {
        config.engine.train_timeout() + config.engine.readiness_timeout()
    } else {
        config.engine.readiness_timeout()
    };

    let http_ct = ct.clone();
    let http_orchestrator = Arc::clone(&orchestrator);
    let http_handle = tokio::spawn(async move {
        if let Err(err) = http::serve(listener, http_orchestrator, ready_wait, http_ct).await {
            error!(%err, "http server failed");
        }
    });

    info!(port = config.http_port, "activation orchestrator ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    orchestrator.shutdown().await;

    // ── Wait for background tasks ───────────────────────
    let _ = http_handle.await;
    if let Some(handle) = sweep_handle {
        let _ = handle.await;
    }
    info!("activation-orchestrator shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
