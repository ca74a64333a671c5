use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dbhubd::config;
use dbhubd::control::{run_control_server, PersistedState};
use dbhubd::remote::{RemoteListener, RemoteName};
use dbhubd::server::{run_remote_acceptor, Server};

/// JSON-RPC front end for an in-memory transactional database.
#[derive(Parser, Debug)]
#[command(name = "dbhubd", version)]
struct Cli {
    /// Path to the static TOML configuration file.
    #[arg(long, default_value = "/etc/dbhubd/dbhubd.toml")]
    config: std::path::PathBuf,

    /// Directory holding the persisted runtime-state file (`state.json`).
    #[arg(long, default_value = "/var/lib/dbhubd")]
    run_dir: std::path::PathBuf,

    /// Path to the control-socket; overrides the config file's value.
    #[arg(long)]
    unixctl: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(log_level)).init();

    let cfg = match config::load_config_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let state_path = cli.run_dir.join("state.json");
    let persisted = PersistedState::load(&state_path).unwrap_or_else(|e| {
        error!(error = %e, "failed to load persisted state, starting empty");
        PersistedState::default()
    });

    let server = Arc::new(Server::new(cfg.server.max_sessions, cfg.server.status_db.clone(), cfg.server.status_table.clone()));

    for db_cfg in &cfg.databases {
        let db: Arc<dyn db_core::Database> = Arc::new(db_core::mem::MemDatabase::new(&db_cfg.name));
        server.add_database(db_cfg.name.clone(), db).await;
    }

    let seed_remotes: Vec<String> = if persisted.remotes.is_empty() { cfg.remotes.iter().map(|r| r.name.clone()).collect() } else { persisted.remotes.clone() };
    let mut acceptor_tasks = Vec::new();
    for raw in &seed_remotes {
        match RemoteName::parse(raw) {
            Ok(name) if name.is_passive() => match RemoteListener::bind(&name, None).await {
                Ok(listener) => {
                    info!(remote = raw, "remote listener bound");
                    let server = Arc::clone(&server);
                    acceptor_tasks.push(tokio::spawn(run_remote_acceptor(server, listener, raw.clone())));
                }
                Err(e) => error!(remote = raw, error = %e, "failed to bind remote listener, skipping"),
            },
            Ok(_) => info!(remote = raw, "active remote reconnection is not started at bootstrap"),
            Err(e) => error!(remote = raw, error = %e, "failed to parse seed remote, skipping"),
        }
    }

    let socket_path = cli.unixctl.unwrap_or_else(|| cfg.control.socket_path.clone());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

    let status_task = {
        let server = Arc::clone(&server);
        tokio::spawn(server.run_status_tick())
    };

    let control_task = {
        let server = Arc::clone(&server);
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = run_control_server(&socket_path, server, shutdown_tx).await {
                error!(error = %e, "control server exited");
            }
        })
    };

    info!(max_sessions = cfg.server.max_sessions, "dbhubd started");

    tokio::select! {
        _ = shutdown_signal() => { info!("shutdown signal received"); }
        _ = shutdown_rx.changed() => { info!("shutdown requested via control socket"); }
    }

    status_task.abort();
    control_task.abort();
    for task in acceptor_tasks {
        task.abort();
    }
    info!("dbhubd shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler").recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
