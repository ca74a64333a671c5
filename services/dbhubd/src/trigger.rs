//! Per-session bookkeeping for in-flight transactions.
//!
//! Grounded on `services/server/src/state.rs`'s `ForwarderCommand` enum
//! (`oneshot::Sender<ForwarderProxyReply<T>>` correlation) and the
//! reconnecting RPC client's `Op::Call { send_back: oneshot::Sender<...> }`
//! pattern from the supplementary example pack.
//!
//! This table tracks only *which* request ids are currently in flight, for
//! the duplicate-id and cancel invariants; the actual `oneshot::Receiver`
//! futures are owned directly by the session's `FuturesUnordered` so a
//! completion can be polled without repeatedly draining this table.

use std::collections::HashSet;
use wire_protocol::RequestId;

#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Completed(Result<serde_json::Value, String>),
    Canceled,
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("duplicate request ID")]
    DuplicateId,
    #[error("unknown request ID")]
    UnknownId,
}

#[derive(Default)]
pub struct TriggerTable {
    pending: HashSet<RequestId>,
}

impl TriggerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.pending.contains(id)
    }

    pub fn insert(&mut self, id: RequestId) -> Result<(), TriggerError> {
        if !self.pending.insert(id) {
            return Err(TriggerError::DuplicateId);
        }
        Ok(())
    }

    /// Removes a Trigger so a later completion for the same id is discarded
    /// as stale. Returns an error if the id isn't currently pending.
    pub fn remove(&mut self, id: &RequestId) -> Result<(), TriggerError> {
        if self.pending.remove(id) {
            Ok(())
        } else {
            Err(TriggerError::UnknownId)
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn drain_all(&mut self) -> Vec<RequestId> {
        self.pending.drain().collect()
    }
}
