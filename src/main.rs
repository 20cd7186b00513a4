#![forbid(unsafe_code)]

//! `agent-foreman` — orchestrator binary.
//!
//! Bootstraps configuration, starts the hub HTTP endpoints and heartbeat
//! task, and either drives a task graph to completion or serves until a
//! shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_foreman::config::GlobalConfig;
use agent_foreman::hub::http::{serve_http, HttpContext};
use agent_foreman::hub::{hub::spawn_heartbeat, EventHub};
use agent_foreman::models::task::TaskGraph;
use agent_foreman::scheduler::{AdmissionController, TaskScheduler};
use agent_foreman::store::session_store::SessionStore;
use agent_foreman::supervisor::Supervisor;
use agent_foreman::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-foreman", about = "Coding-agent process orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Task graph document to run; with no graph the hub serves until a
    /// shutdown signal.
    #[arg(long)]
    graph: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured workspace root.
    #[arg(long)]
    workspace: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-foreman bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;

    if let Some(workspace) = args.workspace {
        let canonical = workspace
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid workspace override: {err}")))?;
        config.workspace_root = canonical;
    }

    let config = Arc::new(config);
    info!("configuration loaded");

    // ── Build shared components ─────────────────────────
    let store = Arc::new(
        SessionStore::new(config.store_path())
            .with_lock_deadline(Duration::from_millis(config.store.lock_deadline_ms))
            .with_lock_stale_ttl(Duration::from_millis(config.store.lock_stale_ms)),
    );
    let hub = Arc::new(EventHub::new(
        config.hub.history_capacity,
        config.hub.broadcast_capacity,
    ));
    let supervisor = Supervisor::new(Arc::clone(&config), Arc::clone(&store), Arc::clone(&hub));
    let admission = Arc::new(AdmissionController::new(&config.category_ceilings));

    let ct = CancellationToken::new();

    // ── Heartbeats ──────────────────────────────────────
    let heartbeat_handle = spawn_heartbeat(
        Arc::clone(&hub),
        Duration::from_secs(config.hub.heartbeat_seconds),
        ct.clone(),
    );

    // ── Hub HTTP endpoints ──────────────────────────────
    let http_ctx = Arc::new(HttpContext {
        hub: Arc::clone(&hub),
        admission: Some(Arc::clone(&admission)),
    });
    let http_ct = ct.clone();
    let http_port = config.http_port;
    let http_handle = tokio::spawn(async move {
        if let Err(err) = serve_http(http_ctx, http_port, http_ct).await {
            error!(%err, "hub HTTP endpoints failed");
        }
    });

    info!("orchestrator ready");

    // ── Run the graph, or serve until signalled ─────────
    if let Some(graph_path) = args.graph {
        let raw = std::fs::read_to_string(&graph_path)
            .map_err(|err| AppError::Graph(format!("cannot read task graph: {err}")))?;
        let graph = TaskGraph::from_json_str(&raw)?;
        let scheduler = TaskScheduler::new(
            graph,
            Arc::clone(&admission),
            supervisor,
            config.wave_policy,
        )?;

        let run_ct = ct.clone();
        let mut run_handle = tokio::spawn(async move { scheduler.run(run_ct).await });
        let report = tokio::select! {
            result = &mut run_handle => result
                .map_err(|err| AppError::Supervise(format!("scheduler task panicked: {err}")))?,
            () = shutdown_signal() => {
                info!("shutdown signal received mid-run; waiting for wave to settle");
                ct.cancel();
                run_handle
                    .await
                    .map_err(|err| AppError::Supervise(format!("scheduler task panicked: {err}")))?
            }
        };

        if report.needs_rework.is_empty() {
            info!(tasks = report.statuses.len(), "run complete");
        } else {
            warn!(
                tasks = report.statuses.len(),
                needs_rework = ?report.needs_rework,
                "run complete with failed tasks"
            );
        }
    } else {
        shutdown_signal().await;
        info!("shutdown signal received");
    }

    // ── Graceful shutdown ───────────────────────────────
    ct.cancel();
    let _ = tokio::join!(http_handle, heartbeat_handle);
    info!("agent-foreman shut down");

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
