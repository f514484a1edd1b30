mod channel;
mod container;
mod ipc;
mod message_loop;
mod process_group;
mod queue;
mod scheduler;
mod scheduler_wiring;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use clap::{Parser, Subcommand};
use nanoclaw_core::{
    NanoclawConfig, RegisteredGroup, SandboxKind, Store, load_allowlist, load_config,
};
use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tracing::{error, info, warn};

use channel::{LoggingChannel, SharedChannel};
use container::runner::RunConfig;

#[derive(Parser, Debug)]
#[command(name = "nanoclawd", version, about = "Nanoclaw orchestrator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the nanoclawd orchestrator service.
    Serve(ServeArgs),
    /// Print the effective nanoclawd config as JSON.
    PrintConfig(PrintConfigArgs),
    /// Validate the external mount allowlist and report what it would permit.
    CheckMounts(CheckMountsArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "config/nanoclaw.toml")]
    config: PathBuf,
    #[arg(long)]
    bind: Option<String>,
}

#[derive(clap::Args, Debug)]
struct PrintConfigArgs {
    #[arg(long, default_value = "config/nanoclaw.toml")]
    config: PathBuf,
}

#[derive(clap::Args, Debug)]
struct CheckMountsArgs {
    #[arg(long, default_value = "config/nanoclaw.toml")]
    config: PathBuf,
}

/// Shared orchestrator state: registered groups indexed by JID.
type Groups = HashMap<String, RegisteredGroup>;
/// Shared session state: group folder → session ID.
type Sessions = HashMap<String, String>;

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    config: Arc<NanoclawConfig>,
    queue: Arc<queue::GroupQueue>,
    groups: Arc<RwLock<Groups>>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    bind: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    runtime_profiles: usize,
    scheduler_enabled: bool,
    registered_groups: usize,
    active_containers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs {
        config: PathBuf::from("config/nanoclaw.toml"),
        bind: None,
    })) {
        Command::Serve(args) => serve(args).await,
        Command::PrintConfig(args) => print_config(args),
        Command::CheckMounts(args) => check_mounts(args),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let bind = config.server.bind.clone();
    let project_root =
        std::env::current_dir().context("failed to resolve current working directory")?;
    let data_dir = project_root.join("data");
    let groups_dir = project_root.join(&config.storage.groups_dir);

    let store = Store::open(&config.storage.store_path)
        .with_context(|| format!("failed to open store at {}", config.storage.store_path))?;

    let registered_groups = store.all_registered_groups().context("failed to load registered groups")?;
    info!(count = registered_groups.len(), "loaded registered groups");
    let groups_map: Groups = registered_groups
        .into_iter()
        .map(|g| (g.jid.clone(), g))
        .collect();
    let groups = Arc::new(RwLock::new(groups_map));

    let session_rows = store.all_sessions().context("failed to load sessions")?;
    let sessions_map: Sessions = session_rows.into_iter().collect();
    let sessions = Arc::new(RwLock::new(sessions_map));

    let channel: SharedChannel = Arc::new(LoggingChannel);
    channel.connect().await.context("failed to connect messaging channel")?;

    let queue = Arc::new(queue::GroupQueue::new(
        config.orchestrator.max_concurrent_containers,
        data_dir.clone(),
    ));

    let configured_default = SandboxKind::parse(&config.orchestrator.container_runtime).unwrap_or_else(|| {
        warn!(
            configured = %config.orchestrator.container_runtime,
            "unrecognized container_runtime, falling back to the container engine"
        );
        SandboxKind::Container
    });
    // §4.4 Runtime Selector: no workspace context at startup, so only the
    // settings/env/default steps apply here; per-run resolution happens per
    // workspace in process_group.rs / scheduler_wiring.rs.
    let sandbox_kind = process_group::resolve_sandbox_kind(&store, None, configured_default);
    let sandbox_kind = container::runner::resolve_available_sandbox_kind(sandbox_kind).await;
    info!(sandbox = sandbox_kind.as_str(), "sandbox engine selected");

    if let Err(e) = container::runner::ensure_runtime_available(sandbox_kind).await {
        warn!(err = %e, "sandbox runtime unavailable at startup — sandboxed agents will fail to launch");
    }
    container::runner::cleanup_orphans(sandbox_kind).await;

    let allowlist_path = config
        .mounts
        .allowlist_path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(nanoclaw_core::default_allowlist_path);
    let allowlist = match load_allowlist(&allowlist_path) {
        Ok(allowlist) => allowlist,
        Err(e) => {
            warn!(err = %e, "failed to load mount allowlist — additional mounts will be blocked");
            None
        }
    };

    let run_config = RunConfig {
        project_root: project_root.clone(),
        groups_dir,
        data_dir: data_dir.clone(),
        timezone: config.scheduler.timezone.clone(),
        idle_timeout_ms: config.orchestrator.idle_timeout_ms,
        allowlist,
        sandbox_kind,
    };

    let assistant_name = std::env::var("ASSISTANT_NAME").unwrap_or_else(|_| "Nanoclaw".into());

    let process_fn = process_group::build_process_messages_fn(
        store.clone(),
        queue.clone(),
        groups.clone(),
        sessions.clone(),
        channel.clone(),
        assistant_name.clone(),
        config.orchestrator.main_group_folder.clone(),
        run_config.clone(),
    );
    queue.set_process_messages_fn(process_fn).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ml_config = message_loop::MessageLoopConfig {
        poll_interval_ms: config.orchestrator.poll_interval_ms,
        assistant_name: assistant_name.clone(),
        main_group_folder: config.orchestrator.main_group_folder.clone(),
    };
    let ml_shutdown = shutdown_rx.clone();
    let message_loop_handle = tokio::spawn(message_loop::run_message_loop(
        ml_config,
        store.clone(),
        queue.clone(),
        groups.clone(),
        ml_shutdown,
    ));

    let sched_config = scheduler::SchedulerConfig {
        poll_interval: Duration::from_millis(config.scheduler.poll_interval_ms),
        timezone: config.scheduler.timezone.clone(),
        enabled: config.scheduler.enabled,
    };
    let task_callback = scheduler_wiring::build_task_callback(
        store.clone(),
        queue.clone(),
        groups.clone(),
        sessions.clone(),
        channel.clone(),
        run_config.clone(),
        config.scheduler.timezone.clone(),
    );
    let sched_shutdown = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(scheduler::run_scheduler_loop(
        sched_config,
        store.clone(),
        task_callback,
        sched_shutdown,
    ));

    let ipc_watcher = ipc::IpcWatcher::new(
        ipc::IpcWatcherConfig {
            ipc_base_dir: data_dir.join("ipc"),
            ..Default::default()
        },
        store.clone(),
        channel.clone(),
        groups.clone(),
    );
    let ipc_shutdown = shutdown_rx.clone();
    let ipc_handle = tokio::spawn(async move {
        ipc_watcher.run(ipc_shutdown).await;
    });

    info!(
        scheduler_enabled = config.scheduler.enabled,
        max_concurrent = config.orchestrator.max_concurrent_containers,
        sandbox = sandbox_kind.as_str(),
        "orchestrator loops wired: message loop + scheduler + IPC watcher"
    );

    let state = AppState {
        started_at: Instant::now(),
        config: Arc::new(config),
        queue: queue.clone(),
        groups: groups.clone(),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind listener on {bind}"))?;

    info!(bind = %bind, "nanoclawd listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited unexpectedly")?;

    let _ = shutdown_tx.send(true);
    queue.shutdown().await;
    let _ = message_loop_handle.await;
    let _ = scheduler_handle.await;
    let _ = ipc_handle.await;
    let _ = channel.disconnect().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!(err = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

fn print_config(args: PrintConfigArgs) -> anyhow::Result<()> {
    let cfg = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

fn check_mounts(args: CheckMountsArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    let allowlist_path = config
        .mounts
        .allowlist_path
        .map(PathBuf::from)
        .unwrap_or_else(nanoclaw_core::default_allowlist_path);

    match load_allowlist(&allowlist_path)? {
        Some(allowlist) => {
            println!("allowlist: {}", allowlist_path.display());
            println!("allowed_roots: {}", allowlist.allowed_roots.len());
            for root in &allowlist.allowed_roots {
                println!(
                    "  - {} (read_write={}){}",
                    root.path,
                    root.allow_read_write,
                    root.description
                        .as_deref()
                        .map(|d| format!(" — {d}"))
                        .unwrap_or_default()
                );
            }
            println!("blocked_patterns: {}", allowlist.blocked_patterns.len());
            println!("non_main_read_only: {}", allowlist.non_main_read_only);
        }
        None => {
            println!(
                "no allowlist found at {} — all additional mounts will be BLOCKED",
                allowlist_path.display()
            );
        }
    }

    Ok(())
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "nanoclawd",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        bind: state.config.server.bind.clone(),
    })
}

async fn readyz(State(state): State<AppState>) -> Json<ReadyResponse> {
    let groups_count = state.groups.read().await.len();
    let active = state.queue.active_count().await;
    Json(ReadyResponse {
        status: "ready",
        runtime_profiles: state.config.runtimes.profiles.len(),
        scheduler_enabled: state.config.scheduler.enabled,
        registered_groups: groups_count,
        active_containers: active,
    })
}
