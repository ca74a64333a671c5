//! Local control-socket interface and the persisted runtime-state file.
//!
//! Grounded on `services/receiver/src/control_api.rs`'s localhost control
//! surface, reimagined here as the specification's own line-oriented
//! Unix-socket protocol rather than HTTP, since the external interface
//! defines a plain-text request/reply command protocol over a local socket.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::remote::{RemoteCounters, RemoteListener, RemoteName};
use crate::server::{run_remote_acceptor, RemoteStatus, Server};

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct PersistedState {
    pub remotes: Vec<String>,
    pub db_filenames: Vec<String>,
}

impl PersistedState {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Atomic write-to-temp-then-rename, so a crash mid-write never leaves a
    /// torn state file behind.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let tmp_path = path.with_extension("tmp");
        let text = serde_json::to_string_pretty(self).expect("PersistedState always serializes");
        std::fs::write(&tmp_path, text)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

pub enum ControlCommand {
    Exit,
    Compact(Option<String>),
    Reconnect,
    AddRemote(String),
    RemoveRemote(String),
    ListRemotes,
    AddDb(String),
    RemoveDb(String),
    ListDbs,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("empty command")]
    Empty,
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("missing argument for {0:?}")]
    MissingArg(&'static str),
}

impl ControlCommand {
    pub fn parse(line: &str) -> Result<Self, ControlError> {
        let mut parts = line.split_whitespace();
        let cmd = parts.next().ok_or(ControlError::Empty)?;
        match cmd {
            "exit" => Ok(Self::Exit),
            "compact" => Ok(Self::Compact(parts.next().map(str::to_owned))),
            "reconnect" => Ok(Self::Reconnect),
            "add-remote" => Ok(Self::AddRemote(parts.next().ok_or(ControlError::MissingArg("add-remote"))?.to_owned())),
            "remove-remote" => Ok(Self::RemoveRemote(parts.next().ok_or(ControlError::MissingArg("remove-remote"))?.to_owned())),
            "list-remotes" => Ok(Self::ListRemotes),
            "add-db" => Ok(Self::AddDb(parts.next().ok_or(ControlError::MissingArg("add-db"))?.to_owned())),
            "remove-db" => Ok(Self::RemoveDb(parts.next().ok_or(ControlError::MissingArg("remove-db"))?.to_owned())),
            "list-dbs" => Ok(Self::ListDbs),
            other => Err(ControlError::Unknown(other.to_owned())),
        }
    }
}

pub async fn run_control_server(socket_path: &str, server: Arc<Server>, shutdown: tokio::sync::watch::Sender<bool>) -> std::io::Result<()> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    info!(path = socket_path, "control socket listening");
    loop {
        let (stream, _) = listener.accept().await?;
        let server = Arc::clone(&server);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_control_connection(stream, server, shutdown).await {
                warn!(error = %e, "control connection error");
            }
        });
    }
}

async fn handle_control_connection(stream: UnixStream, server: Arc<Server>, shutdown: tokio::sync::watch::Sender<bool>) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match ControlCommand::parse(&line) {
            Ok(cmd) => execute(cmd, &server, &shutdown).await,
            Err(e) => format!("error: {e}"),
        };
        write_half.write_all(reply.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
    }
    Ok(())
}

async fn execute(cmd: ControlCommand, server: &Arc<Server>, shutdown: &tokio::sync::watch::Sender<bool>) -> String {
    match cmd {
        ControlCommand::Exit => {
            let _ = shutdown.send(true);
            String::new()
        }
        // No on-disk storage engine exists in this build to compact; the
        // command is accepted and acknowledged as a no-op.
        ControlCommand::Compact(_db) => String::new(),
        // Active-remote reconnection (component C) is not wired to the
        // control socket yet -- there is nothing to force-reconnect.
        ControlCommand::Reconnect => String::new(),
        ControlCommand::AddRemote(name) => match RemoteName::parse(&name) {
            Ok(parsed) if parsed.is_passive() => match RemoteListener::bind(&parsed, None).await {
                Ok(listener) => {
                    let bound_port = listener.bound_port();
                    server
                        .add_remote(
                            name.clone(),
                            RemoteStatus { name: name.clone(), is_connected: true, state: "active", since: Instant::now(), disconnected_since: None, last_error: None, counters: Arc::new(RemoteCounters::default()), bound_port },
                        )
                        .await;
                    tokio::spawn(run_remote_acceptor(Arc::clone(server), listener, name.clone()));
                    String::new()
                }
                Err(e) => format!("error: {e}"),
            },
            Ok(_) => "error: only passive remotes can be added at runtime".to_owned(),
            Err(e) => format!("error: {e}"),
        },
        ControlCommand::RemoveRemote(name) => {
            if server.remove_remote(&name).await {
                String::new()
            } else {
                format!("error: unknown remote {name:?}")
            }
        }
        ControlCommand::ListRemotes => server.list_remotes().await.join(" "),
        ControlCommand::AddDb(path) => {
            let name = Path::new(&path).file_stem().and_then(|s| s.to_str()).unwrap_or(&path).to_owned();
            let db: Arc<dyn db_core::Database> = Arc::new(db_core::mem::MemDatabase::new(&name));
            server.add_database(name, db).await;
            String::new()
        }
        ControlCommand::RemoveDb(name) => {
            if server.remove_database(&name).await {
                String::new()
            } else {
                format!("error: unknown database {name:?}")
            }
        }
        ControlCommand::ListDbs => server.list_databases().await.join(" "),
    }
}
