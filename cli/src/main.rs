use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use relay_core::GatewayConfig;
use relay_core::secrets::EnvSecretFetcher;
use relay_core::store::SqliteConfigStore;
use relay_server::AppState;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay", about = "Multi-tenant agent gateway", version)]
struct Cli {
    /// Bind address; overrides MCP_SERVICE_HOST.
    #[arg(long)]
    host: Option<String>,

    /// Bind port; overrides MCP_SERVICE_PORT.
    #[arg(long)]
    port: Option<u16>,

    /// SQLite file for the user-config store; overrides the default under
    /// RELAY_DATA_DIR.
    #[arg(long)]
    store: Option<PathBuf>,
}

fn init_tracing(log_dir: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = GatewayConfig::from_env().context("invalid configuration")?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    let _log_guard = init_tracing(config.log_dir.as_ref());

    if let Some(parent) = config.store_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let store = Arc::new(
        SqliteConfigStore::open(&config.store_path).context("opening config store")?,
    );

    let state = AppState::new(config, store, Arc::new(EnvSecretFetcher::default()));

    // A bad credential should be a startup failure, not a surprise 401 for
    // every caller later.
    state
        .resolver
        .get()
        .await
        .context("resolving API credential")?;

    let sweep_interval = state.sessions.idle_horizon() / 2;
    let sweeper = state.sessions.clone().spawn_sweeper(sweep_interval);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("termination signal received, draining");
            shutdown.cancel();
        });
    }

    let result = relay_server::serve(state.clone(), shutdown.clone()).await;

    // Drain: cancel every stream, then close every MCP client within its
    // drain window.
    sweeper.cancel();
    state.sessions.shutdown();
    state.supervisor.shutdown().await;

    result.context("server error")?;
    info!("shutdown complete");
    Ok(())
}
