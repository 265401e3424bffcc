//! payram-agent, the self-updating supervisor for the analytics children.
//!
//! Boots the on-disk layout (seeding the `0.0.0` release when the home
//! is fresh), starts the process supervisor for the chat and MCP
//! children, and serves the authenticated admin HTTP surface. SIGINT and
//! SIGTERM drain the HTTP server, cancel the supervisor, and wait for
//! both children to be reaped before exit.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use payram_agent_core::config::AgentConfig;
use payram_agent_core::layout::AgentPaths;
use payram_agent_core::secrets::SecretStore;
use payram_agent_core::status::StatusStore;
use payram_agent_core::supervisor::{RestartChildren, Supervisor, SupervisorConfig};
use payram_agent_core::update::UpdateController;

use payram_agent_daemon::admin::{self, AdminGuard, AppState, ChildSupervisor};
use payram_agent_daemon::metrics::AgentMetrics;

/// payram-agent supervises and updates the analytics children
#[derive(Parser, Debug)]
#[command(name = "payram-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Listen address override (otherwise PAYRAM_AGENT_LISTEN_ADDR)
    #[arg(long)]
    listen_addr: Option<String>,

    /// Home directory override (otherwise PAYRAM_AGENT_HOME)
    #[arg(long)]
    home: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = AgentConfig::from_env();
    if let Some(listen_addr) = args.listen_addr {
        config.listen_addr = payram_agent_core::config::normalize_listen_addr(&listen_addr);
    }
    if let Some(home) = args.home {
        config.home = home;
    }

    let paths = AgentPaths::new(&config.home);
    paths
        .ensure_base_dirs()
        .context("failed to create agent directories")?;

    match paths.ensure_seed_release(&config) {
        Ok(Some(version)) => info!(%version, "seeded bootstrap release"),
        Ok(None) => {}
        Err(err) => warn!(error = %err, "seed release unavailable"),
    }

    let supervisor_config =
        SupervisorConfig::resolve(&config, &paths).context("failed to configure supervisor")?;
    let supervisor = Arc::new(Supervisor::new(supervisor_config));

    let cancel = CancellationToken::new();
    supervisor
        .start(cancel.clone())
        .context("failed to start supervisor")?;

    let controller = UpdateController::new(
        config.clone(),
        Arc::clone(&supervisor) as Arc<dyn RestartChildren>,
    )
    .context("failed to build update controller")?;

    let metrics = Arc::new(AgentMetrics::new().context("failed to register metrics")?);
    let guard = Arc::new(AdminGuard::new(
        config.admin_token.clone(),
        &config.admin_allowlist,
    ));

    let state = AppState {
        config: Arc::new(config.clone()),
        supervisor: Arc::clone(&supervisor) as Arc<dyn ChildSupervisor>,
        controller: Arc::new(controller),
        status: StatusStore::new(&paths),
        secrets: SecretStore::new(&paths),
        metrics,
        guard,
        http: reqwest::Client::new(),
    };

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {:?}", config.listen_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, home = %paths.home().display(), "agent starting");

    let app = admin::router(state);
    let shutdown = shutdown_signal();
    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(error = %err, "admin server error");
    }

    info!("shutting down, stopping children");
    cancel.cancel();
    supervisor.wait().await;
    info!("agent stopped");

    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}
