//! Monitor engine: per-session table subscriptions, snapshot construction,
//! and per-commit delta computation.
//!
//! Grounded on `services/server/src/state.rs`'s `get_or_create_broadcast()`
//! double-checked `HashMap<Uuid, broadcast::Sender<T>>` registry for the
//! database-side commit fan-out, and the supplementary `subxt` reconnecting
//! client's `Subscription`-as-stream pattern for the session-side consumption
//! of that fan-out.

use bitflags::bitflags;
use db_core::{ChangeSet, EventKind as DbEventKind, Row, RowChange, RowId};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u8 {
        const INITIAL = 0b0001;
        const INSERT  = 0b0010;
        const DELETE  = 0b0100;
        const MODIFY  = 0b1000;
    }
}

impl Default for EventMask {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Clone)]
pub struct MonitorRequest {
    pub columns: Option<Vec<String>>,
    pub select: EventMask,
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("duplicate column {0:?} in monitor request")]
    DuplicateColumn(String),
    #[error("duplicate monitor id {0:?}")]
    DuplicateMonitorId(String),
    #[error("unknown monitor {0:?}")]
    UnknownMonitor(String),
    #[error("malformed monitor request: {0}")]
    Malformed(String),
}

/// A single table's normalized subscription: which columns, and for each,
/// which event kinds are monitored.
#[derive(Debug, Clone)]
pub struct MonitorTable {
    pub columns: HashMap<String, EventMask>,
}

impl MonitorTable {
    fn from_requests(requests: &[MonitorRequest], all_columns: &[String]) -> Result<Self, MonitorError> {
        let mut columns: HashMap<String, EventMask> = HashMap::new();
        for req in requests {
            let names: Vec<String> = req.columns.clone().unwrap_or_else(|| all_columns.to_vec());
            let mut seen_in_this_request = std::collections::HashSet::new();
            for name in names {
                if !seen_in_this_request.insert(name.clone()) {
                    return Err(MonitorError::DuplicateColumn(name));
                }
                columns.entry(name).and_modify(|m| *m |= req.select).or_insert(req.select);
            }
        }
        Ok(Self { columns })
    }

    fn union_mask(&self) -> EventMask {
        self.columns.values().fold(EventMask::empty(), |acc, m| acc | *m)
    }
}

/// One client subscription, bound to one database.
pub struct Monitor {
    pub tables: HashMap<String, MonitorTable>,
}

impl Monitor {
    pub fn parse(spec: &Value, table_columns: &HashMap<String, Vec<String>>) -> Result<Self, MonitorError> {
        let obj = spec.as_object().ok_or_else(|| MonitorError::Malformed("expected object keyed by table name".to_owned()))?;
        let mut tables = HashMap::new();
        for (table, value) in obj {
            let requests = parse_requests_for_table(value)?;
            let all_columns = table_columns.get(table).cloned().unwrap_or_default();
            tables.insert(table.clone(), MonitorTable::from_requests(&requests, &all_columns)?);
        }
        Ok(Self { tables })
    }

    /// Builds the initial snapshot document for this monitor given the
    /// current contents of every subscribed table.
    pub fn snapshot(&self, current: &HashMap<String, HashMap<RowId, Row>>) -> Value {
        let mut out = Map::new();
        for (table, mt) in &self.tables {
            if !mt.union_mask().contains(EventMask::INITIAL) {
                continue;
            }
            let Some(rows) = current.get(table) else { continue };
            let mut table_out = Map::new();
            for (row_id, row) in rows {
                let new = select_columns(row, mt, DbEventKind::Initial);
                table_out.insert(row_id.to_string(), json!({ "new": new }));
            }
            if !table_out.is_empty() {
                out.insert(table.clone(), Value::Object(table_out));
            }
        }
        Value::Object(out)
    }

    /// Computes this monitor's delta for one committed `ChangeSet`, or `None`
    /// if no subscribed table was affected.
    pub fn delta(&self, changes: &ChangeSet) -> Option<Value> {
        let mut out = Map::new();
        for (table, rows) in &changes.by_table {
            let Some(mt) = self.tables.get(table) else { continue };
            let mut table_out = Map::new();
            for change in rows {
                if let Some(doc) = row_delta(change, mt) {
                    table_out.insert(change.row.to_string(), doc);
                }
            }
            if !table_out.is_empty() {
                out.insert(table.clone(), Value::Object(table_out));
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(Value::Object(out))
        }
    }
}

fn row_delta(change: &RowChange, mt: &MonitorTable) -> Option<Value> {
    let kind = change.kind();
    let db_kind_mask = match kind {
        DbEventKind::Insert => EventMask::INSERT,
        DbEventKind::Delete => EventMask::DELETE,
        DbEventKind::Modify => EventMask::MODIFY,
        DbEventKind::Initial => EventMask::INITIAL,
    };

    if !mt.union_mask().contains(db_kind_mask) {
        return None;
    }

    match kind {
        DbEventKind::Insert => {
            if !any_column_selects(mt, EventMask::INSERT) {
                return None;
            }
            let new = select_columns(change.new.as_ref()?, mt, DbEventKind::Insert);
            Some(json!({ "new": new }))
        }
        DbEventKind::Delete => {
            if !any_column_selects(mt, EventMask::DELETE) {
                return None;
            }
            let old = select_all_columns(change.old.as_ref()?, mt);
            Some(json!({ "old": old }))
        }
        DbEventKind::Modify => {
            let old_full = change.old.as_ref()?;
            let new_full = change.new.as_ref()?;
            let mut old_out = Map::new();
            let mut new_out = Map::new();
            for (col, mask) in &mt.columns {
                if !mask.contains(EventMask::MODIFY) {
                    continue;
                }
                let old_v = old_full.get(col);
                let new_v = new_full.get(col);
                // `old` carries only what changed; `new` is a full post-image
                // of every monitored column regardless of whether this
                // particular column moved.
                if old_v != new_v {
                    if let Some(v) = old_v {
                        old_out.insert(col.clone(), v.clone());
                    }
                }
                if let Some(v) = new_v {
                    new_out.insert(col.clone(), v.clone());
                }
            }
            if old_out.is_empty() {
                return None;
            }
            let mut doc = Map::new();
            doc.insert("old".to_owned(), Value::Object(old_out));
            if !new_out.is_empty() {
                doc.insert("new".to_owned(), Value::Object(new_out));
            }
            Some(Value::Object(doc))
        }
        DbEventKind::Initial => None,
    }
}

fn any_column_selects(mt: &MonitorTable, kind: EventMask) -> bool {
    mt.columns.values().any(|m| m.contains(kind))
}

fn select_columns(row: &Row, mt: &MonitorTable, kind: DbEventKind) -> Value {
    let mask = match kind {
        DbEventKind::Initial => EventMask::INITIAL,
        DbEventKind::Insert => EventMask::INSERT,
        DbEventKind::Delete => EventMask::DELETE,
        DbEventKind::Modify => EventMask::MODIFY,
    };
    let mut out = Map::new();
    for (col, col_mask) in &mt.columns {
        if col_mask.contains(mask) {
            if let Some(v) = row.get(col) {
                out.insert(col.clone(), v.clone());
            }
        }
    }
    Value::Object(out)
}

fn select_all_columns(row: &Row, mt: &MonitorTable) -> Value {
    let mut out = Map::new();
    for col in mt.columns.keys() {
        if let Some(v) = row.get(col) {
            out.insert(col.clone(), v.clone());
        }
    }
    Value::Object(out)
}

fn parse_requests_for_table(value: &Value) -> Result<Vec<MonitorRequest>, MonitorError> {
    match value {
        Value::Array(items) => items.iter().map(parse_one_request).collect(),
        Value::Object(_) => Ok(vec![parse_one_request(value)?]),
        _ => Err(MonitorError::Malformed("monitor-request must be object or array of objects".to_owned())),
    }
}

fn parse_one_request(value: &Value) -> Result<MonitorRequest, MonitorError> {
    let obj = value.as_object().ok_or_else(|| MonitorError::Malformed("monitor-request must be an object".to_owned()))?;
    let columns = match obj.get("columns") {
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .map(|v| v.as_str().map(str::to_owned).ok_or_else(|| MonitorError::Malformed("columns must be strings".to_owned())))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Some(_) => return Err(MonitorError::Malformed("columns must be an array".to_owned())),
        None => None,
    };

    let select = match obj.get("select") {
        Some(Value::Object(sel)) => {
            let mut mask = EventMask::empty();
            for (flag, key) in [(EventMask::INITIAL, "initial"), (EventMask::INSERT, "insert"), (EventMask::DELETE, "delete"), (EventMask::MODIFY, "modify")] {
                let enabled = sel.get(key).and_then(Value::as_bool).unwrap_or(true);
                if enabled {
                    mask |= flag;
                }
            }
            mask
        }
        Some(_) => return Err(MonitorError::Malformed("select must be an object".to_owned())),
        None => EventMask::all(),
    };

    Ok(MonitorRequest { columns, select })
}
