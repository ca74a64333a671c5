use serde_json::Value;
use std::collections::HashMap;

use crate::{ColumnName, RowId, TableName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Initial,
    Insert,
    Delete,
    Modify,
}

/// The before/after state of one changed row, as the database's executor
/// hands it to the monitor engine. `old`/`new` are full rows (all columns);
/// the monitor engine itself narrows this down to subscribed columns and
/// decides the event kind per the specification's rules.
#[derive(Debug, Clone)]
pub struct RowChange {
    pub row: RowId,
    pub old: Option<HashMap<ColumnName, Value>>,
    pub new: Option<HashMap<ColumnName, Value>>,
}

impl RowChange {
    pub fn kind(&self) -> EventKind {
        match (&self.old, &self.new) {
            (None, Some(_)) => EventKind::Insert,
            (Some(_), None) => EventKind::Delete,
            (Some(_), Some(_)) => EventKind::Modify,
            (None, None) => EventKind::Insert,
        }
    }
}

/// One committed transaction's effect, broadcast to every session with a
/// monitor on this database.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub commit_seq: u64,
    pub by_table: HashMap<TableName, Vec<RowChange>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_has_no_old_row() {
        let c = RowChange { row: uuid::Uuid::new_v4(), old: None, new: Some(HashMap::new()) };
        assert_eq!(c.kind(), EventKind::Insert);
    }

    #[test]
    fn delete_has_no_new_row() {
        let c = RowChange { row: uuid::Uuid::new_v4(), old: Some(HashMap::new()), new: None };
        assert_eq!(c.kind(), EventKind::Delete);
    }

    #[test]
    fn modify_has_both() {
        let c = RowChange { row: uuid::Uuid::new_v4(), old: Some(HashMap::new()), new: Some(HashMap::new()) };
        assert_eq!(c.kind(), EventKind::Modify);
    }
}
