//! Minimal in-memory reference implementation of [`Database`]/
//! [`TransactionExecutor`], sufficient to drive the session/monitor/trigger
//! engine's tests without a real storage engine wired in.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::{ChangeSet, ColumnSchema, Database, DbError, Row, RowChange, RowId, TableSchema};

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Default)]
struct Tables {
    by_table: HashMap<String, HashMap<RowId, Row>>,
    commit_seq: u64,
}

/// A transaction op understood by [`MemExecutor`]. Real transaction grammars
/// are out of this specification's scope; this shape exists only so the
/// reference implementation can exercise insert/delete/modify monitor deltas
/// end to end.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TxOp {
    Insert { table: String, row: Row },
    Update { table: String, row: RowId, set: Row },
    Delete { table: String, row: RowId },
}

pub struct MemExecutor {
    tables: Arc<Mutex<Tables>>,
    changes: broadcast::Sender<ChangeSet>,
}

pub struct MemDatabase {
    name: String,
    executor: MemExecutor,
}

impl MemDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            name: name.into(),
            executor: MemExecutor { tables: Arc::new(Mutex::new(Tables::default())), changes: tx },
        }
    }

    /// Reflects the tables actually populated so far: since this reference
    /// implementation has no declared-up-front schema grammar, a table's
    /// column list is inferred as the union of keys across its rows (empty
    /// if the table has no rows yet, since there is nothing to infer from).
    pub async fn schema_tables(&self) -> Vec<TableSchema> {
        let tables = self.executor.tables.lock().await;
        let mut out: Vec<TableSchema> = tables
            .by_table
            .iter()
            .map(|(name, rows)| {
                let mut columns: Vec<ColumnSchema> = Vec::new();
                let mut seen = std::collections::HashSet::new();
                for row in rows.values() {
                    for col in row.keys() {
                        if seen.insert(col.clone()) {
                            columns.push(ColumnSchema { name: col.clone(), kind: "any".to_owned() });
                        }
                    }
                }
                TableSchema { name: name.clone(), columns }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[async_trait]
impl Database for MemDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn schema(&self) -> Value {
        serde_json::json!({ "tables": self.schema_tables().await })
    }

    async fn snapshot_table(&self, table: &str) -> Result<HashMap<RowId, Row>, DbError> {
        let tables = self.executor.tables.lock().await;
        Ok(tables.by_table.get(table).cloned().unwrap_or_default())
    }

    fn executor(&self) -> &dyn crate::TransactionExecutor {
        &self.executor
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeSet> {
        self.executor.changes.subscribe()
    }
}

#[async_trait]
impl crate::TransactionExecutor for MemExecutor {
    fn submit(&self, _db: &str, params: Vec<Value>) -> tokio::sync::oneshot::Receiver<Result<Value, DbError>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tables = Arc::clone(&self.tables);
        let changes = self.changes.clone();
        tokio::spawn(async move {
            let result = run_ops(&tables, &changes, params).await;
            let _ = tx.send(result);
        });
        rx
    }
}

async fn run_ops(
    tables: &Arc<Mutex<Tables>>,
    changes: &broadcast::Sender<ChangeSet>,
    params: Vec<Value>,
) -> Result<Value, DbError> {
    let ops: Vec<TxOp> = params
        .into_iter()
        .map(serde_json::from_value)
        .collect::<Result<_, _>>()
        .map_err(|e| DbError::Malformed(e.to_string()))?;

    let mut tables = tables.lock().await;
    let mut by_table: HashMap<String, Vec<RowChange>> = HashMap::new();
    let mut inserted_ids = Vec::new();

    for op in ops {
        match op {
            TxOp::Insert { table, row } => {
                let id = Uuid::new_v4();
                tables.by_table.entry(table.clone()).or_default().insert(id, row.clone());
                by_table.entry(table).or_default().push(RowChange { row: id, old: None, new: Some(row) });
                inserted_ids.push(id);
            }
            TxOp::Update { table, row, set } => {
                let existing = tables
                    .by_table
                    .get_mut(&table)
                    .and_then(|t| t.get_mut(&row))
                    .ok_or_else(|| DbError::UnknownTable(table.clone()))?;
                let old = existing.clone();
                for (k, v) in set {
                    existing.insert(k, v);
                }
                let new = existing.clone();
                by_table.entry(table).or_default().push(RowChange { row, old: Some(old), new: Some(new) });
            }
            TxOp::Delete { table, row } => {
                let removed = tables.by_table.get_mut(&table).and_then(|t| t.remove(&row));
                if let Some(old) = removed {
                    by_table.entry(table).or_default().push(RowChange { row, old: Some(old), new: None });
                }
            }
        }
    }

    tables.commit_seq += 1;
    let commit_seq = tables.commit_seq;
    drop(tables);

    if !by_table.is_empty() {
        let _ = changes.send(ChangeSet { commit_seq, by_table });
    }

    Ok(serde_json::json!(inserted_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransactionExecutor;
    use serde_json::json;

    #[tokio::test]
    async fn insert_then_snapshot_shows_row() {
        let db = MemDatabase::new("d");
        let params = vec![json!({"op": "insert", "table": "widgets", "row": {"name": "a"}})];
        let rx = db.executor().submit("d", params);
        rx.await.unwrap().unwrap();
        let snap = db.snapshot_table("widgets").await.unwrap();
        assert_eq!(snap.len(), 1);
    }

    #[tokio::test]
    async fn commit_broadcasts_a_changeset() {
        let db = MemDatabase::new("d");
        let mut sub = db.subscribe();
        let params = vec![json!({"op": "insert", "table": "widgets", "row": {"name": "a"}})];
        db.executor().submit("d", params).await.unwrap().unwrap();
        let change = sub.recv().await.unwrap();
        assert_eq!(change.commit_seq, 1);
        assert!(change.by_table.contains_key("widgets"));
    }

    #[tokio::test]
    async fn schema_reflects_tables_populated_by_transact() {
        let db = MemDatabase::new("d");
        assert!(db.schema_tables().await.is_empty());

        let params = vec![json!({"op": "insert", "table": "widgets", "row": {"name": "a", "size": 1}})];
        db.executor().submit("d", params).await.unwrap().unwrap();

        let tables = db.schema_tables().await;
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "widgets");
        let col_names: std::collections::HashSet<_> = tables[0].columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(col_names, std::collections::HashSet::from(["name", "size"]));
    }

    #[tokio::test]
    async fn delete_unknown_row_is_a_silent_no_op() {
        let db = MemDatabase::new("d");
        let params = vec![json!({"op": "delete", "table": "widgets", "row": Uuid::new_v4().to_string()})];
        let result = db.executor().submit("d", params).await.unwrap();
        assert!(result.is_ok());
    }
}
