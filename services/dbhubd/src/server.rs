//! Server: owns the database set, the remote set, the global session cap,
//! and the periodic (5 s) remote-status publication tick.
//!
//! Grounded on `services/server/src/state.rs`'s `AppState`
//! registry-of-registries shape, and on `services/server/src/announcer.rs`'s
//! periodic runtime-loop cadence (the closest analog in the teacher for a
//! fixed-interval background publish task).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use db_core::Database;
use lock_table::LockTable;
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tracing::info;
use wire_protocol::JsonRpcMessage;

use crate::remote::{RemoteCounters, RemoteName};

pub type DbRegistry = Arc<RwLock<HashMap<String, Arc<dyn Database>>>>;
pub type SessionId = u64;

pub struct RemoteStatus {
    pub name: String,
    pub is_connected: bool,
    pub state: &'static str,
    pub since: Instant,
    /// Set the last time this remote's session count dropped to zero; `None`
    /// if it has never had a session disconnect.
    pub disconnected_since: Option<Instant>,
    pub last_error: Option<String>,
    pub counters: Arc<RemoteCounters>,
    pub bound_port: Option<u16>,
}

pub struct Server {
    pub databases: DbRegistry,
    pub locks: Arc<LockTable>,
    remotes: RwLock<HashMap<String, RemoteStatus>>,
    sessions: RwLock<HashMap<SessionId, mpsc::UnboundedSender<JsonRpcMessage>>>,
    /// Which sessions belong to which remote, so the status tick can scope
    /// lock counts and connection counts per remote rather than globally.
    remote_sessions: RwLock<HashMap<String, std::collections::HashSet<SessionId>>>,
    n_sessions: AtomicU32,
    next_session_id: AtomicU64,
    pub max_sessions: u32,
    pub status_db: String,
    pub status_table: String,
}

impl Server {
    pub fn new(max_sessions: u32, status_db: String, status_table: String) -> Self {
        Self {
            databases: Arc::new(RwLock::new(HashMap::new())),
            locks: Arc::new(LockTable::new()),
            remotes: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            remote_sessions: RwLock::new(HashMap::new()),
            n_sessions: AtomicU32::new(0),
            next_session_id: AtomicU64::new(1),
            max_sessions,
            status_db,
            status_table,
        }
    }

    /// Records that `session` was accepted on `remote`, bumping that
    /// remote's connection counter.
    pub async fn bind_session_to_remote(&self, remote: &str, session: SessionId) {
        self.remote_sessions.write().await.entry(remote.to_owned()).or_default().insert(session);
        if let Some(status) = self.remotes.read().await.get(remote) {
            status.counters.incr();
        }
    }

    /// Reverses `bind_session_to_remote`; once the remote's last session
    /// leaves, stamps `disconnected_since` for `sec_since_disconnect`.
    pub async fn unbind_session_from_remote(&self, remote: &str, session: SessionId) {
        let remote_now_empty = {
            let mut map = self.remote_sessions.write().await;
            match map.get_mut(remote) {
                Some(set) => {
                    set.remove(&session);
                    let empty = set.is_empty();
                    if empty {
                        map.remove(remote);
                    }
                    empty
                }
                None => false,
            }
        };
        if let Some(status) = self.remotes.read().await.get(remote) {
            status.counters.decr();
        }
        if remote_now_empty {
            if let Some(status) = self.remotes.write().await.get_mut(remote) {
                status.disconnected_since = Some(Instant::now());
            }
        }
    }

    pub fn alloc_session_id(&self) -> SessionId {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a live session's outbound sender so another session's
    /// lock steal can route a `stolen` notify to it directly.
    pub async fn register_session(&self, id: SessionId, outbound: mpsc::UnboundedSender<JsonRpcMessage>) {
        self.sessions.write().await.insert(id, outbound);
    }

    pub async fn unregister_session(&self, id: SessionId) {
        self.sessions.write().await.remove(&id);
    }

    /// Best-effort delivery: a victim session that already disconnected
    /// simply has nothing to notify.
    pub async fn notify_session(&self, id: SessionId, msg: JsonRpcMessage) {
        if let Some(tx) = self.sessions.read().await.get(&id) {
            let _ = tx.send(msg);
        }
    }

    pub async fn add_database(&self, name: String, db: Arc<dyn Database>) {
        self.databases.write().await.insert(name, db);
    }

    pub async fn remove_database(&self, name: &str) -> bool {
        self.databases.write().await.remove(name).is_some()
    }

    pub async fn list_databases(&self) -> Vec<String> {
        self.databases.read().await.keys().cloned().collect()
    }

    pub fn try_reserve_session_slot(&self) -> bool {
        loop {
            let current = self.n_sessions.load(Ordering::Acquire);
            if current >= self.max_sessions {
                return false;
            }
            if self.n_sessions.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                return true;
            }
        }
    }

    pub fn release_session_slot(&self) {
        self.n_sessions.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn n_sessions(&self) -> u32 {
        self.n_sessions.load(Ordering::Acquire)
    }

    pub async fn add_remote(&self, name: String, status: RemoteStatus) {
        self.remotes.write().await.insert(name, status);
    }

    pub async fn remove_remote(&self, name: &str) -> bool {
        self.remotes.write().await.remove(name).is_some()
    }

    pub async fn list_remotes(&self) -> Vec<String> {
        self.remotes.read().await.keys().cloned().collect()
    }

    /// Resolves the desired remote set against the current one: returns
    /// `(to_add, to_remove)` names. `db:DB,TABLE,COLUMN` self-references must
    /// already be resolved to concrete target strings by the caller before
    /// calling this (§4.H's reconfiguration protocol).
    pub async fn diff_remotes(&self, desired: &[String]) -> (Vec<String>, Vec<String>) {
        let current: std::collections::HashSet<String> = self.remotes.read().await.keys().cloned().collect();
        let desired_set: std::collections::HashSet<String> = desired.iter().cloned().collect();
        let to_add = desired_set.difference(&current).cloned().collect();
        let to_remove = current.difference(&desired_set).cloned().collect();
        (to_add, to_remove)
    }

    /// Writes this tick's status document for every remote into the
    /// configured status table, via the same transactional write path
    /// ordinary `transact` requests use -- there is no separate privileged
    /// write path.
    pub async fn publish_status(&self) {
        let Some(db) = self.databases.read().await.get(&self.status_db).cloned() else { return };
        let remotes = self.remotes.read().await;
        let remote_sessions = self.remote_sessions.read().await;
        let mut ops = Vec::new();
        for (name, status) in remotes.iter() {
            let sessions = remote_sessions.get(name);
            let lock_counts = match sessions {
                Some(set) => self.locks.counts_for_sessions(set),
                None => lock_table::LockCounts::default(),
            };
            let row = json!({
                "name": name,
                "is_connected": status.is_connected,
                "state": status.state,
                "sec_since_connect": status.since.elapsed().as_secs(),
                "sec_since_disconnect": status.disconnected_since.map(|t| t.elapsed().as_secs()),
                "last_error": status.last_error,
                "locks_held": lock_counts.held,
                "locks_waiting": lock_counts.waiting,
                "locks_lost": lock_counts.lost,
                "n_connections": status.counters.current(),
                "bound_port": status.bound_port,
            });
            ops.push(json!({ "op": "insert", "table": self.status_table, "row": row }));
        }
        drop(remote_sessions);
        drop(remotes);
        if !ops.is_empty() {
            let rx = db.executor().submit(&self.status_db, ops);
            if let Ok(Err(e)) = rx.await {
                tracing::warn!(error = %e, "failed to publish remote status");
            }
        }
    }

    /// Runs the 5-second status tick forever; intended to be spawned as the
    /// server's own top-level task.
    pub async fn run_status_tick(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            self.publish_status().await;
            info!(n_sessions = self.n_sessions(), "status tick");
        }
    }
}

pub fn resolve_remote_name(raw: &str) -> Result<RemoteName, crate::remote::RemoteError> {
    RemoteName::parse(raw)
}

/// Runs one passive remote's accept loop forever: ticks a non-blocking
/// accept, and for each accepted stream either spawns a new session or
/// rejects it immediately when the server is already at its session cap.
/// Active remotes (`tcp:`/`unix:`/`ssl:`/`db:`) are the reconnecting-client
/// side and are not bound here.
pub async fn run_remote_acceptor(server: Arc<Server>, remote: crate::remote::RemoteListener, remote_name: String) {
    let mut tick = tokio::time::interval(Duration::from_millis(20));
    loop {
        tick.tick().await;
        match remote.try_accept() {
            Some(Ok(crate::remote::AcceptedStream::Tcp(stream, addr))) => spawn_accepted(&server, stream, Some(addr.to_string()), remote_name.clone()),
            Some(Ok(crate::remote::AcceptedStream::Unix(stream))) => spawn_accepted(&server, stream, None, remote_name.clone()),
            Some(Ok(crate::remote::AcceptedStream::TlsPending(stream, addr, acceptor))) => {
                // The handshake itself takes several round trips, so it runs
                // in its own task rather than blocking this tick's accept.
                let server = Arc::clone(&server);
                let remote_name = remote_name.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => spawn_accepted(&server, tls_stream, Some(addr.to_string()), remote_name),
                        Err(e) => tracing::warn!(error = %e, "TLS handshake failed"),
                    }
                });
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "accept failed on remote listener");
            }
            None => {}
        }
    }
}

fn spawn_accepted<S>(server: &Arc<Server>, stream: S, peer: Option<String>, remote_name: String)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    if !server.try_reserve_session_slot() {
        info!(peer = peer.as_deref().unwrap_or("unix"), "rejecting connection, session cap reached");
        return;
    }
    let server = Arc::clone(server);
    tokio::spawn(async move {
        let id = server.alloc_session_id();
        server.bind_session_to_remote(&remote_name, id).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = crate::session::Session::new(id, Arc::clone(&server), Arc::clone(&server.databases), Arc::clone(&server.locks), tx, Arc::new(crate::session::Backlog::default()));
        session.run(stream).await;
        server.unbind_session_from_remote(&remote_name, id).await;
        server.release_session_slot();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use db_core::mem::MemDatabase;

    #[tokio::test]
    async fn session_cap_is_enforced() {
        let server = Server::new(1, "status".to_owned(), "remote_status".to_owned());
        assert!(server.try_reserve_session_slot());
        assert!(!server.try_reserve_session_slot());
        server.release_session_slot();
        assert!(server.try_reserve_session_slot());
    }

    #[tokio::test]
    async fn diff_remotes_reports_additions_and_removals() {
        let server = Server::new(10, "status".to_owned(), "remote_status".to_owned());
        server.add_remote("ptcp:1".to_owned(), RemoteStatus { name: "ptcp:1".to_owned(), is_connected: true, state: "active", since: Instant::now(), disconnected_since: None, last_error: None, counters: Arc::new(RemoteCounters::default()), bound_port: Some(1) }).await;
        let (add, remove) = server.diff_remotes(&["ptcp:2".to_owned()]).await;
        assert_eq!(add, vec!["ptcp:2".to_owned()]);
        assert_eq!(remove, vec!["ptcp:1".to_owned()]);
    }

    #[tokio::test]
    async fn publish_status_writes_a_row_per_remote() {
        let server = Server::new(10, "status".to_owned(), "remote_status".to_owned());
        let db: Arc<dyn Database> = Arc::new(MemDatabase::new("status"));
        server.add_database("status".to_owned(), db.clone()).await;
        server.add_remote("ptcp:1".to_owned(), RemoteStatus { name: "ptcp:1".to_owned(), is_connected: true, state: "active", since: Instant::now(), disconnected_since: None, last_error: None, counters: Arc::new(RemoteCounters::default()), bound_port: Some(1) }).await;
        server.publish_status().await;
        let snap = db.snapshot_table("remote_status").await.unwrap();
        assert_eq!(snap.len(), 1);
    }
}
