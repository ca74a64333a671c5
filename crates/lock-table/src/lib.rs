//! Named advisory locks with FIFO waiter queues and a "steal" operation.
//!
//! This is a plain, synchronous, CPU-bound data structure: no `.await` point
//! ever touches it, so it lives behind a `std::sync::Mutex` rather than an
//! async one wherever it's shared across session tasks.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub type SessionId = u64;
pub type LockName = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterState {
    Waiting,
    Owner,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterId(u64);

#[derive(Debug, Clone)]
struct Waiter {
    id: WaiterId,
    session: SessionId,
    state: WaiterState,
}

#[derive(Debug, Default)]
struct Lock {
    queue: VecDeque<Waiter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Wait,
    Steal,
}

/// What the caller must now do as a result of a `lock`/`steal`/`unlock` call.
/// The table itself never sends notifications -- it only reports what
/// happened so the async session layer can deliver `locked`/`stolen` itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOutcome {
    pub waiter: WaiterId,
    pub acquired: bool,
    /// Present on a successful `steal`: the session that was displaced.
    pub victim: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockOutcome {
    /// The session that newly became the owner, if any.
    pub new_owner: Option<SessionId>,
}

/// Waiter-state tally across a set of sessions, for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockCounts {
    pub held: u64,
    pub waiting: u64,
    pub lost: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LockError {
    #[error("session already holds or waits on lock {0:?}")]
    AlreadyQueued(LockName),
    #[error("unknown waiter")]
    UnknownWaiter,
}

#[derive(Default)]
pub struct LockTable {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    locks: HashMap<LockName, Lock>,
    next_waiter_id: u64,
    waiter_locations: HashMap<WaiterId, LockName>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, session: SessionId, name: &str, mode: LockMode) -> Result<LockOutcome, LockError> {
        let mut inner = self.inner.lock().unwrap();
        let lock = inner.locks.entry(name.to_owned()).or_default();

        if lock.queue.iter().any(|w| w.session == session) {
            return Err(LockError::AlreadyQueued(name.to_owned()));
        }

        inner.next_waiter_id += 1;
        let id = WaiterId(inner.next_waiter_id);

        let (acquired, victim) = match mode {
            LockMode::Wait => {
                let acquired = lock.queue.is_empty();
                let state = if acquired { WaiterState::Owner } else { WaiterState::Waiting };
                lock.queue.push_back(Waiter { id, session, state });
                (acquired, None)
            }
            LockMode::Steal => {
                let victim = lock.queue.front_mut().map(|head| {
                    head.state = WaiterState::Lost;
                    head.session
                });
                lock.queue.push_front(Waiter { id, session, state: WaiterState::Owner });
                (true, victim)
            }
        };

        inner.waiter_locations.insert(id, name.to_owned());
        Ok(LockOutcome { waiter: id, acquired, victim })
    }

    pub fn unlock(&self, waiter: WaiterId) -> Result<UnlockOutcome, LockError> {
        let mut inner = self.inner.lock().unwrap();
        let name = inner.waiter_locations.remove(&waiter).ok_or(LockError::UnknownWaiter)?;
        let lock = inner.locks.get_mut(&name).ok_or(LockError::UnknownWaiter)?;

        let was_owner = lock.queue.front().map(|w| w.id) == Some(waiter);
        lock.queue.retain(|w| w.id != waiter);

        let new_owner = if was_owner {
            if let Some(head) = lock.queue.front_mut() {
                head.state = WaiterState::Owner;
                Some(head.session)
            } else {
                None
            }
        } else {
            None
        };

        if lock.queue.is_empty() {
            inner.locks.remove(&name);
        }

        Ok(UnlockOutcome { new_owner })
    }

    /// Tallies held/waiting/lost waiters belonging to any of `sessions`, for
    /// per-remote status reporting.
    pub fn counts_for_sessions(&self, sessions: &std::collections::HashSet<SessionId>) -> LockCounts {
        let inner = self.inner.lock().unwrap();
        let mut counts = LockCounts::default();
        for lock in inner.locks.values() {
            for w in &lock.queue {
                if !sessions.contains(&w.session) {
                    continue;
                }
                match w.state {
                    WaiterState::Owner => counts.held += 1,
                    WaiterState::Waiting => counts.waiting += 1,
                    WaiterState::Lost => counts.lost += 1,
                }
            }
        }
        counts
    }

    /// Releases every waiter belonging to a session (used on session teardown).
    pub fn release_session(&self, session: SessionId) -> Vec<(LockName, UnlockOutcome)> {
        let mut inner = self.inner.lock().unwrap();
        let waiters: Vec<WaiterId> = inner
            .waiter_locations
            .iter()
            .filter(|(id, name)| {
                inner.locks.get(*name).map(|l| l.queue.iter().any(|w| w.id == **id && w.session == session)).unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        drop(inner);

        waiters
            .into_iter()
            .filter_map(|id| {
                let name = self.inner.lock().unwrap().waiter_locations.get(&id).cloned();
                name.and_then(|n| self.unlock(id).ok().map(|o| (n, o)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_locker_owns_immediately() {
        let t = LockTable::new();
        let outcome = t.lock(1, "L", LockMode::Wait).unwrap();
        assert!(outcome.acquired);
        assert!(outcome.victim.is_none());
    }

    #[test]
    fn second_locker_waits() {
        let t = LockTable::new();
        t.lock(1, "L", LockMode::Wait).unwrap();
        let outcome = t.lock(2, "L", LockMode::Wait).unwrap();
        assert!(!outcome.acquired);
    }

    #[test]
    fn unlock_promotes_next_waiter_fifo() {
        let t = LockTable::new();
        let a = t.lock(1, "L", LockMode::Wait).unwrap();
        t.lock(2, "L", LockMode::Wait).unwrap();
        let u = t.unlock(a.waiter).unwrap();
        assert_eq!(u.new_owner, Some(2));
    }

    #[test]
    fn steal_demotes_owner_and_reports_victim() {
        let t = LockTable::new();
        t.lock(1, "L", LockMode::Wait).unwrap();
        let steal = t.lock(2, "L", LockMode::Steal).unwrap();
        assert!(steal.acquired);
        assert_eq!(steal.victim, Some(1));
    }

    #[test]
    fn cannot_requeue_without_unlock() {
        let t = LockTable::new();
        t.lock(1, "L", LockMode::Wait).unwrap();
        let err = t.lock(1, "L", LockMode::Wait).unwrap_err();
        assert_eq!(err, LockError::AlreadyQueued("L".to_owned()));
    }

    #[test]
    fn empty_queue_after_last_unlock_frees_the_lock() {
        let t = LockTable::new();
        let a = t.lock(1, "L", LockMode::Wait).unwrap();
        t.unlock(a.waiter).unwrap();
        // lock should be gone, so a fresh lock is the sole owner again
        let again = t.lock(2, "L", LockMode::Wait).unwrap();
        assert!(again.acquired);
    }

    #[test]
    fn counts_for_sessions_tallies_held_waiting_and_lost() {
        let t = LockTable::new();
        t.lock(1, "L", LockMode::Wait).unwrap();
        t.lock(2, "L", LockMode::Wait).unwrap();
        t.lock(3, "L", LockMode::Steal).unwrap();

        let counts = t.counts_for_sessions(&[1, 2, 3].into_iter().collect());
        assert_eq!(counts.held, 1);
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.lost, 1);

        let scoped = t.counts_for_sessions(&[2].into_iter().collect());
        assert_eq!(scoped, LockCounts { held: 0, waiting: 1, lost: 0 });
    }

    #[test]
    fn release_session_unwinds_all_its_waiters() {
        let t = LockTable::new();
        let a = t.lock(1, "A", LockMode::Wait).unwrap();
        let _b = t.lock(1, "B", LockMode::Wait).unwrap();
        t.lock(2, "A", LockMode::Wait).unwrap();
        let released = t.release_session(1);
        assert_eq!(released.len(), 2);
        let promoted: Vec<_> = released.iter().filter(|(name, _)| name == "A").collect();
        assert_eq!(promoted[0].1.new_owner, Some(2));
        let _ = a;
    }
}
