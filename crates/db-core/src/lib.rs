//! Trait seam for the out-of-scope external collaborators: the real
//! transactional database and its transaction executor. The session/monitor/
//! trigger engine in `services/dbhubd` talks only to these traits; this crate
//! also ships a small in-memory reference implementation sufficient to drive
//! its tests, the way a mock WS peer stands in for a real one elsewhere in
//! this codebase.

pub mod change;
pub mod mem;
pub mod schema;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

pub use change::{ChangeSet, EventKind, RowChange};
pub use schema::{ColumnSchema, TableSchema};

pub type RowId = Uuid;
pub type TableName = String;
pub type ColumnName = String;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("unknown table {0:?}")]
    UnknownTable(String),
    #[error("unknown column {0:?} in table {1:?}")]
    UnknownColumn(String, String),
    #[error("malformed transaction: {0}")]
    Malformed(String),
    #[error("transaction canceled")]
    Canceled,
}

/// One row, keyed by column name, as it exists at a point in time.
pub type Row = HashMap<ColumnName, Value>;

/// A named, open database. Transactions are submitted through
/// `TransactionExecutor`; this trait covers the read-only surface a session
/// needs directly (schema introspection, full-table reads for monitor
/// snapshots).
#[async_trait]
pub trait Database: Send + Sync {
    fn name(&self) -> &str;

    async fn schema(&self) -> Value;

    /// All rows of `table`, keyed by row id. Used to build a monitor's
    /// initial snapshot.
    async fn snapshot_table(&self, table: &str) -> Result<HashMap<RowId, Row>, DbError>;

    fn executor(&self) -> &dyn TransactionExecutor;

    /// Subscribes to this database's commit stream; every committed
    /// transaction's `ChangeSet` is broadcast to every receiver.
    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ChangeSet>;
}

/// Given parsed transaction params, yields a result (or pending-wait state)
/// asynchronously. Matches the specification's framing of the transaction
/// executor as an external collaborator the trigger table hands work to and
/// later polls for completion.
#[async_trait]
pub trait TransactionExecutor: Send + Sync {
    /// Submits a transaction for execution; the returned receiver resolves
    /// once the executor completes (successfully, with an error, or because
    /// the trigger was dropped/canceled).
    fn submit(&self, db: &str, params: Vec<Value>) -> tokio::sync::oneshot::Receiver<Result<Value, DbError>>;
}
