//! Per-session state machine: owns one client's reconnecting-session handle,
//! lock waiters, trigger table, and monitor table; parses and dispatches
//! requests.
//!
//! Grounded on `services/server/src/ws_forwarder.rs`'s
//! `handle_forwarder_socket` main `tokio::select!` loop (inbound message /
//! heartbeat interval / command-channel arms) and
//! `services/receiver/src/session.rs`'s `SessionError` thiserror enum and
//! dispatch style.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use db_core::Database;
use futures_util::stream::FuturesUnordered;
use futures_util::{SinkExt, StreamExt};
use lock_table::{LockMode, LockTable, WaiterId};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::Framed;
use tracing::{info, warn};
use wire_protocol::{methods, JsonLineCodec, JsonRpcMessage, MessageKind, RequestId};

use crate::monitor::{Monitor, MonitorError};
use crate::reconnect::{ReconnectPolicy, ReconnectingSession};
use crate::server::Server;
use crate::trigger::{TriggerError, TriggerOutcome, TriggerTable};

pub type SessionId = u64;
pub type DbRegistry = Arc<RwLock<HashMap<String, Arc<dyn Database>>>>;

type TriggerFuture = Pin<Box<dyn Future<Output = (RequestId, TriggerOutcome)> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown database {0:?}")]
    UnknownDatabase(String),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Backlog watermark shared between a session's writer task and its main
/// loop, realizing the run-tick's backpressure check (step 4) without a
/// literal cooperative poll.
#[derive(Default)]
pub struct Backlog {
    bytes: AtomicU64,
}

impl Backlog {
    pub fn add(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::AcqRel);
    }

    pub fn sub(&self, n: u64) {
        self.bytes.fetch_sub(n.min(self.bytes.load(Ordering::Acquire)), Ordering::AcqRel);
    }

    pub fn current(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }
}

struct MonitorEntry {
    db: String,
    monitor: Monitor,
}

pub struct Session {
    pub id: SessionId,
    server: Arc<Server>,
    databases: DbRegistry,
    locks: Arc<LockTable>,
    outbound: mpsc::UnboundedSender<JsonRpcMessage>,
    triggers: TriggerTable,
    trigger_futures: FuturesUnordered<TriggerFuture>,
    monitors: HashMap<String, MonitorEntry>,
    lock_waiters: HashMap<String, WaiterId>,
    subscribed_dbs: HashSet<String>,
    change_tx: mpsc::UnboundedSender<(String, db_core::ChangeSet)>,
    change_rx: mpsc::UnboundedReceiver<(String, db_core::ChangeSet)>,
    backlog: Arc<Backlog>,
    backlog_threshold: u64,
    last_observed_backlog: u64,
    /// Drives this connection's own seqno/probe cycle. Accepted sessions set
    /// `allow_reconnect = false`: a transport error or missed probe tears the
    /// session down rather than retrying, since there is nothing to dial back
    /// into -- the peer is the one who reconnects.
    reconnect: ReconnectingSession,
    last_seqno: u64,
    pending_probe: Option<RequestId>,
}

const DEFAULT_BACKLOG_THRESHOLD: u64 = 64 * 1024;

impl Session {
    pub fn new(id: SessionId, server: Arc<Server>, databases: DbRegistry, locks: Arc<LockTable>, outbound: mpsc::UnboundedSender<JsonRpcMessage>, backlog: Arc<Backlog>) -> Self {
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        Self {
            id,
            server,
            databases,
            locks,
            outbound,
            triggers: TriggerTable::new(),
            trigger_futures: FuturesUnordered::new(),
            monitors: HashMap::new(),
            lock_waiters: HashMap::new(),
            subscribed_dbs: HashSet::new(),
            change_tx,
            change_rx,
            backlog,
            backlog_threshold: DEFAULT_BACKLOG_THRESHOLD,
            last_observed_backlog: 0,
            reconnect: ReconnectingSession::new(ReconnectPolicy::default(), false),
            last_seqno: 0,
            pending_probe: None,
        }
    }

    fn send(&self, msg: JsonRpcMessage) {
        let _ = self.outbound.send(msg);
    }

    async fn db(&self, name: &str) -> Result<Arc<dyn Database>, SessionError> {
        self.databases.read().await.get(name).cloned().ok_or_else(|| SessionError::UnknownDatabase(name.to_owned()))
    }

    /// Dispatches one inbound REQUEST. Synchronous replies are sent directly;
    /// `transact` instead registers a Trigger whose completion the run loop
    /// later picks up from `trigger_futures`.
    pub async fn dispatch_request(&mut self, msg: &JsonRpcMessage) {
        let id = msg.id.clone().expect("request always carries an id");
        let method = msg.method.as_deref().unwrap_or_default();
        let params = msg.params_or_empty();

        let result = match method {
            methods::ECHO => Ok(json!(params)),
            methods::LIST_DBS => {
                let names: Vec<String> = self.databases.read().await.keys().cloned().collect();
                Ok(json!(names))
            }
            methods::GET_SCHEMA => self.handle_get_schema(params).await,
            methods::TRANSACT => {
                self.handle_transact(id.clone(), params).await;
                return;
            }
            methods::MONITOR => self.handle_monitor(params).await,
            methods::MONITOR_CANCEL => self.handle_monitor_cancel(params),
            methods::LOCK => self.handle_lock(params, LockMode::Wait).await,
            methods::STEAL => self.handle_lock(params, LockMode::Steal).await,
            methods::UNLOCK => self.handle_unlock(params),
            other => Err(SessionError::Protocol(format!("unknown method {other:?}"))),
        };

        match result {
            Ok(value) => self.send(JsonRpcMessage::reply(id, value)),
            Err(e) => self.send(JsonRpcMessage::error_reply(Some(id), e.to_string())),
        }
    }

    /// Dispatches one inbound NOTIFY.
    pub fn dispatch_notify(&mut self, msg: &JsonRpcMessage) {
        let method = msg.method.as_deref().unwrap_or_default();
        if method == methods::CANCEL {
            if let Some(raw_id) = msg.params_or_empty().first() {
                let id = RequestId::new(raw_id.clone());
                if self.triggers.remove(&id).is_ok() {
                    self.send(JsonRpcMessage::error_reply(Some(id.into_value()), "canceled"));
                }
            }
        }
        // every other notify method is silently ignored per the dispatch table
    }

    async fn handle_get_schema(&self, params: &[Value]) -> Result<Value, SessionError> {
        let name = params.first().and_then(Value::as_str).ok_or_else(|| SessionError::Malformed("get_schema requires a database name".to_owned()))?;
        let db = self.db(name).await?;
        Ok(db.schema().await)
    }

    async fn handle_transact(&mut self, id: Value, params: &[Value]) {
        let req_id = RequestId::new(id.clone());
        if self.triggers.contains(&req_id) {
            self.send(JsonRpcMessage::error_reply(Some(id), "duplicate request ID"));
            return;
        }
        let Some(db_name) = params.first().and_then(Value::as_str) else {
            self.send(JsonRpcMessage::error_reply(Some(id), "transact requires a database name"));
            return;
        };
        let db = match self.db(db_name).await {
            Ok(db) => db,
            Err(e) => {
                self.send(JsonRpcMessage::error_reply(Some(id), e.to_string()));
                return;
            }
        };
        if self.triggers.insert(req_id.clone()).is_err() {
            self.send(JsonRpcMessage::error_reply(Some(id), "duplicate request ID"));
            return;
        }
        let tx_params = params[1..].to_vec();
        let rx = db.executor().submit(db_name, tx_params);
        self.trigger_futures.push(Box::pin(async move {
            let outcome = match rx.await {
                Ok(Ok(v)) => TriggerOutcome::Completed(Ok(v)),
                Ok(Err(e)) => TriggerOutcome::Completed(Err(e.to_string())),
                Err(_) => TriggerOutcome::Canceled,
            };
            (req_id, outcome)
        }));
    }

    async fn handle_monitor(&mut self, params: &[Value]) -> Result<Value, SessionError> {
        let db_name = params.first().and_then(Value::as_str).ok_or_else(|| SessionError::Malformed("monitor requires a database name".to_owned()))?;
        let monitor_id = params.get(1).and_then(Value::as_str).ok_or_else(|| SessionError::Malformed("monitor requires a monitor id".to_owned()))?;
        let spec = params.get(2).ok_or_else(|| SessionError::Malformed("monitor requires a subscription spec".to_owned()))?;

        if self.monitors.contains_key(monitor_id) {
            return Err(SessionError::Monitor(MonitorError::DuplicateMonitorId(monitor_id.to_owned())));
        }

        let db = self.db(db_name).await?;
        let table_columns = table_columns_from_schema(&db.schema().await);
        let monitor = Monitor::parse(spec, &table_columns)?;

        let mut current = HashMap::new();
        for table in monitor.tables.keys() {
            current.insert(table.clone(), db.snapshot_table(table).await?);
        }
        let snapshot = monitor.snapshot(&current);

        self.ensure_subscribed(db_name, &db);
        self.monitors.insert(monitor_id.to_owned(), MonitorEntry { db: db_name.to_owned(), monitor });
        Ok(snapshot)
    }

    /// Spawns one forwarder task per database the session monitors at least
    /// once, relaying that database's commit broadcast into this session's
    /// own change channel -- the async analogue of "the session reads the
    /// next commit for a database it subscribes to".
    fn ensure_subscribed(&mut self, db_name: &str, db: &Arc<dyn Database>) {
        if !self.subscribed_dbs.insert(db_name.to_owned()) {
            return;
        }
        let mut sub = db.subscribe();
        let tx = self.change_tx.clone();
        let db_name = db_name.to_owned();
        tokio::spawn(async move {
            while let Ok(changes) = sub.recv().await {
                if tx.send((db_name.clone(), changes)).is_err() {
                    break;
                }
            }
        });
    }

    fn handle_monitor_cancel(&mut self, params: &[Value]) -> Result<Value, SessionError> {
        let monitor_id = params.first().and_then(Value::as_str).ok_or_else(|| SessionError::Malformed("monitor_cancel requires a monitor id".to_owned()))?;
        self.monitors.remove(monitor_id).ok_or_else(|| SessionError::Monitor(MonitorError::UnknownMonitor(monitor_id.to_owned())))?;
        Ok(json!({}))
    }

    async fn handle_lock(&mut self, params: &[Value], mode: LockMode) -> Result<Value, SessionError> {
        let name = params.first().and_then(Value::as_str).ok_or_else(|| SessionError::Malformed("lock requires a name".to_owned()))?;
        let outcome = self.locks.lock(self.id, name, mode).map_err(|e| SessionError::Malformed(e.to_string()))?;
        self.lock_waiters.insert(name.to_owned(), outcome.waiter);
        if let Some(victim) = outcome.victim {
            let notify = JsonRpcMessage::notify(methods::STOLEN, vec![json!(name)]);
            self.server.notify_session(victim, notify).await;
        }
        Ok(json!({ "locked": outcome.acquired }))
    }

    fn handle_unlock(&mut self, params: &[Value]) -> Result<Value, SessionError> {
        let name = params.first().and_then(Value::as_str).ok_or_else(|| SessionError::Malformed("unlock requires a name".to_owned()))?;
        if let Some(waiter) = self.lock_waiters.remove(name) {
            let _ = self.locks.unlock(waiter);
        }
        Ok(json!({}))
    }

    /// Step 1 of the run tick: drop all per-connection state on reconnect.
    pub fn reset_per_connection_state(&mut self) {
        self.triggers.drain_all();
        self.trigger_futures.clear();
        self.monitors.clear();
        for (_, waiter) in self.lock_waiters.drain() {
            let _ = self.locks.unlock(waiter);
        }
    }

    /// Compares the reconnecting-session's current seqno against the last one
    /// this session observed, flushing all per-connection state if the
    /// connection underneath has been replaced since the last tick.
    fn check_seqno(&mut self) {
        let seqno = self.reconnect.seqno();
        if seqno != self.last_seqno {
            self.reset_per_connection_state();
            self.last_seqno = seqno;
        }
    }

    /// Coarse stand-in for "size of a full replica of all subscribed data":
    /// one monitored table costs roughly as much outbound traffic to rebuild
    /// as a handful of snapshot messages.
    fn estimated_replica_size(&self) -> u64 {
        self.monitors.len() as u64 * 4096
    }

    /// Step 4's backpressure heuristic: doubles the threshold (bounded) and
    /// reports whether a force-reconnect is warranted.
    pub fn check_backpressure(&mut self, last_observed_backlog: u64, replica_size_estimate: u64) -> bool {
        let current = self.backlog.current();
        let excess = current.saturating_sub(last_observed_backlog);
        if excess <= self.backlog_threshold {
            return false;
        }
        if excess > replica_size_estimate.saturating_mul(2) {
            return true;
        }
        self.backlog_threshold = (self.backlog_threshold * 2).min(replica_size_estimate.saturating_mul(2).max(1));
        false
    }

    fn complete_trigger(&mut self, id: RequestId, outcome: TriggerOutcome) {
        // A completion for an id the cancel notify already removed is stale
        // -- the canceled reply was already sent, so discard it silently.
        if self.triggers.remove(&id).is_err() {
            return;
        }
        let raw_id = id.into_value();
        match outcome {
            TriggerOutcome::Completed(Ok(value)) => self.send(JsonRpcMessage::reply(raw_id, value)),
            TriggerOutcome::Completed(Err(e)) => self.send(JsonRpcMessage::error_reply(Some(raw_id), e)),
            TriggerOutcome::Canceled => self.send(JsonRpcMessage::error_reply(Some(raw_id), "canceled")),
        }
    }

    /// Delivers one database's `ChangeSet` to every monitor bound to it,
    /// enqueuing an `update` NOTIFY per affected monitor.
    fn deliver_change(&self, db_name: &str, changes: &db_core::ChangeSet) {
        for (monitor_id, entry) in &self.monitors {
            if entry.db != db_name {
                continue;
            }
            if let Some(delta) = entry.monitor.delta(changes) {
                self.send(JsonRpcMessage::notify(methods::UPDATE, vec![json!(monitor_id), delta]));
            }
        }
    }

    pub fn teardown(&mut self) {
        info!(session = self.id, "tearing down session state");
        self.reset_per_connection_state();
    }

    /// Drives the session to completion over a framed stream: the async
    /// realization of component G's run tick, combining inbound requests,
    /// trigger completions, and monitor change delivery in one
    /// `tokio::select!`, mirroring `ws_forwarder_handler`'s loop shape.
    pub async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let framed = Framed::new(stream, JsonLineCodec::new());
        let (mut sink, mut source) = framed.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<JsonRpcMessage>();
        self.outbound = out_tx.clone();
        self.server.register_session(self.id, out_tx).await;

        let writer_backlog = Arc::clone(&self.backlog);
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let len = serde_json::to_string(&msg).map(|s| s.len() as u64).unwrap_or(0);
                writer_backlog.add(len);
                let result = sink.send(msg).await;
                writer_backlog.sub(len);
                if result.is_err() {
                    break;
                }
            }
        });

        let mut backpressure_tick = tokio::time::interval(std::time::Duration::from_secs(1));
        backpressure_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut probe_tick = tokio::time::interval(self.reconnect.probe_interval());
        probe_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        self.reconnect.begin_connecting();
        self.reconnect.on_connect_ok();
        self.check_seqno();

        loop {
            // Step 1 of the run tick: flush per-connection state if the
            // reconnecting-session's seqno moved since we last looked.
            self.check_seqno();

            tokio::select! {
                biased;

                Some((id, outcome)) = self.trigger_futures.next(), if !self.trigger_futures.is_empty() => {
                    self.complete_trigger(id, outcome);
                }

                Some((db_name, changes)) = self.change_rx.recv() => {
                    self.deliver_change(&db_name, &changes);
                }

                _ = backpressure_tick.tick() => {
                    let estimate = self.estimated_replica_size();
                    if self.check_backpressure(self.last_observed_backlog, estimate) {
                        warn!(session = self.id, "outbound backlog exceeds policy bound, forcing reconnect");
                        break;
                    }
                    self.last_observed_backlog = self.backlog.current();
                }

                _ = probe_tick.tick() => {
                    if self.pending_probe.take().is_some() {
                        self.reconnect.on_probe_missed();
                        warn!(session = self.id, "probe missed, forcing reconnect");
                        break;
                    }
                    let id = RequestId::new(json!(uuid::Uuid::new_v4().to_string()));
                    self.send(JsonRpcMessage::request(id.as_value().clone(), methods::ECHO, vec![]));
                    self.pending_probe = Some(id);
                }

                incoming = source.next() => {
                    match incoming {
                        Some(Ok(msg)) => match msg.kind() {
                            MessageKind::Request => self.dispatch_request(&msg).await,
                            MessageKind::Notify => self.dispatch_notify(&msg),
                            MessageKind::Reply | MessageKind::Error => {
                                if let Some(pending) = &self.pending_probe {
                                    if msg.id.as_ref() == Some(pending.as_value()) {
                                        self.pending_probe = None;
                                    }
                                }
                            }
                            MessageKind::Malformed => {
                                warn!(session = self.id, "dropping unclassified message, closing session");
                                break;
                            }
                        },
                        Some(Err(e)) => {
                            warn!(session = self.id, error = %e, "framer error, closing session");
                            break;
                        }
                        None => {
                            info!(session = self.id, "peer closed connection");
                            break;
                        }
                    }
                }
            }
        }

        self.teardown();
        self.server.unregister_session(self.id).await;
        writer.abort();
    }
}

fn table_columns_from_schema(schema: &Value) -> HashMap<String, Vec<String>> {
    let mut out = HashMap::new();
    if let Some(tables) = schema.get("tables").and_then(Value::as_array) {
        for t in tables {
            let (Some(name), Some(cols)) = (t.get("name").and_then(Value::as_str), t.get("columns").and_then(Value::as_array)) else { continue };
            let names: Vec<String> = cols.iter().filter_map(|c| c.get("name").and_then(Value::as_str).map(str::to_owned)).collect();
            out.insert(name.to_owned(), names);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use db_core::mem::MemDatabase;

    async fn test_session() -> (Session, mpsc::UnboundedReceiver<JsonRpcMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = Arc::new(Server::new(16, "status".to_owned(), "remote_status".to_owned()));
        let db: Arc<dyn Database> = Arc::new(MemDatabase::new("main"));
        server.add_database("main".to_owned(), db).await;
        let databases = Arc::clone(&server.databases);
        let locks = Arc::clone(&server.locks);
        let session = Session::new(1, server, databases, locks, tx, Arc::new(Backlog::default()));
        (session, rx)
    }

    #[tokio::test]
    async fn echo_replies_with_same_params() {
        let (mut session, mut rx) = test_session().await;
        let req = JsonRpcMessage::request(json!(1), methods::ECHO, vec![json!("x")]);
        session.dispatch_request(&req).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.result, Some(json!([json!("x")])));
    }

    #[tokio::test]
    async fn list_dbs_reports_registered_names() {
        let (mut session, mut rx) = test_session().await;
        let req = JsonRpcMessage::request(json!(1), methods::LIST_DBS, vec![]);
        session.dispatch_request(&req).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.result, Some(json!(["main"])));
    }

    #[tokio::test]
    async fn unknown_method_yields_error_reply() {
        let (mut session, mut rx) = test_session().await;
        let req = JsonRpcMessage::request(json!(1), "bogus", vec![]);
        session.dispatch_request(&req).await;
        let reply = rx.recv().await.unwrap();
        assert!(reply.error.is_some());
    }

    #[tokio::test]
    async fn lock_then_unlock_round_trips() {
        let (mut session, mut rx) = test_session().await;
        let lock_req = JsonRpcMessage::request(json!(1), methods::LOCK, vec![json!("L")]);
        session.dispatch_request(&lock_req).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.result, Some(json!({"locked": true})));

        let unlock_req = JsonRpcMessage::request(json!(2), methods::UNLOCK, vec![json!("L")]);
        session.dispatch_request(&unlock_req).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.result, Some(json!({})));
        assert!(session.lock_waiters.is_empty());
    }

    #[tokio::test]
    async fn steal_notifies_the_victim_session() {
        let (mut owner, mut owner_rx) = test_session().await;
        let lock_req = JsonRpcMessage::request(json!(1), methods::LOCK, vec![json!("L")]);
        owner.dispatch_request(&lock_req).await;
        owner_rx.recv().await.unwrap();

        let (victim_tx, mut victim_rx) = mpsc::unbounded_channel();
        owner.server.register_session(2, victim_tx).await;

        let mut thief = Session::new(2, Arc::clone(&owner.server), Arc::clone(&owner.databases), Arc::clone(&owner.locks), mpsc::unbounded_channel().0, Arc::new(Backlog::default()));
        let steal_req = JsonRpcMessage::request(json!(1), methods::STEAL, vec![json!("L")]);
        thief.dispatch_request(&steal_req).await;

        let victim_notify = victim_rx.recv().await.unwrap();
        assert_eq!(victim_notify.method.as_deref(), Some(methods::STOLEN));
    }

    #[tokio::test]
    async fn transact_with_reused_id_is_rejected() {
        let (mut session, mut rx) = test_session().await;
        let req = JsonRpcMessage::request(json!(1), methods::TRANSACT, vec![json!("main")]);
        session.dispatch_request(&req).await;
        session.dispatch_request(&req).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.error, Some(json!("duplicate request ID")));
    }

    #[tokio::test]
    async fn monitor_cancel_unknown_id_errors() {
        let (mut session, mut rx) = test_session().await;
        let req = JsonRpcMessage::request(json!(1), methods::MONITOR_CANCEL, vec![json!("nope")]);
        session.dispatch_request(&req).await;
        let reply = rx.recv().await.unwrap();
        assert!(reply.error.is_some());
    }

    #[tokio::test]
    async fn cancel_notify_completes_pending_trigger_with_canceled() {
        let (mut session, mut rx) = test_session().await;
        let req = JsonRpcMessage::request(json!(1), methods::TRANSACT, vec![json!("main")]);
        session.dispatch_request(&req).await;
        let cancel = JsonRpcMessage::notify(methods::CANCEL, vec![json!(1)]);
        session.dispatch_notify(&cancel);
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.error, Some(json!("canceled")));
    }

    #[tokio::test]
    async fn seqno_change_flushes_per_connection_state() {
        let (mut session, mut rx) = test_session().await;
        let lock_req = JsonRpcMessage::request(json!(1), methods::LOCK, vec![json!("L")]);
        session.dispatch_request(&lock_req).await;
        rx.recv().await.unwrap();
        assert!(!session.lock_waiters.is_empty());

        session.last_seqno = session.reconnect.seqno();
        session.reconnect.on_connect_ok();
        session.check_seqno();

        assert!(session.lock_waiters.is_empty());
        assert_eq!(session.last_seqno, session.reconnect.seqno());
    }

    #[tokio::test]
    async fn unchanged_seqno_leaves_state_alone() {
        let (mut session, mut rx) = test_session().await;
        let lock_req = JsonRpcMessage::request(json!(1), methods::LOCK, vec![json!("L")]);
        session.dispatch_request(&lock_req).await;
        rx.recv().await.unwrap();

        session.last_seqno = session.reconnect.seqno();
        session.check_seqno();

        assert!(!session.lock_waiters.is_empty());
    }

    #[test]
    fn backlog_add_and_sub_around_a_send_nets_to_zero() {
        let backlog = Backlog::default();
        backlog.add(42);
        assert_eq!(backlog.current(), 42);
        backlog.sub(42);
        assert_eq!(backlog.current(), 0);
    }

    #[tokio::test]
    async fn backpressure_threshold_doubles_before_forcing_reconnect() {
        let (mut session, _rx) = test_session().await;
        session.backlog.add(DEFAULT_BACKLOG_THRESHOLD + 1);
        // excess is just over the threshold but well under 2x the replica
        // estimate: the policy should defer by doubling, not disconnect.
        assert!(!session.check_backpressure(0, 1_000_000));
        assert_eq!(session.backlog_threshold, DEFAULT_BACKLOG_THRESHOLD * 2);

        session.backlog.add(10_000_000);
        assert!(session.check_backpressure(0, 1_000_000));
    }

    #[tokio::test]
    async fn stale_completion_after_cancel_is_discarded() {
        let (mut session, mut rx) = test_session().await;
        let req = JsonRpcMessage::request(json!(1), methods::TRANSACT, vec![json!("main")]);
        session.dispatch_request(&req).await;
        let id = RequestId::new(json!(1));
        session.dispatch_notify(&JsonRpcMessage::notify(methods::CANCEL, vec![json!(1)]));
        let canceled_reply = rx.recv().await.unwrap();
        assert_eq!(canceled_reply.error, Some(json!("canceled")));

        // A late completion for the same id (as if the real transaction
        // eventually finished) must not produce a second reply.
        session.complete_trigger(id, TriggerOutcome::Completed(Ok(json!("late"))));
        assert!(rx.try_recv().is_err());
    }
}
