//! Reconnecting-session state machine for active remotes.
//!
//! Grounded on `services/forwarder/src/uplink.rs`'s `UplinkSession` connect /
//! hello / heartbeat handshake, generalized into an explicit four-state
//! machine because a `dbhubd` active remote must cycle through backoff
//! indefinitely, where the teacher's uplink only ever runs the happy path
//! once per process lifetime. Passive (accepted) sessions never enter
//! `Backoff`/`Connecting` -- a transport error simply tears them down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Backoff,
    Connecting,
    Active,
    Dead,
}

pub struct ReconnectPolicy {
    pub max_backoff: Duration,
    pub probe_interval: Duration,
    base_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_backoff: Duration::from_secs(60), probe_interval: Duration::from_secs(5), base_backoff: Duration::from_millis(200) }
    }
}

/// Drives one active remote's reconnect/backoff/probe cycle. The seqno is
/// bumped on every successful (re)connect; session-owned state (monitors,
/// triggers, locks) compares its cached seqno against this once per tick to
/// detect a reconnection per the session's run-tick step 1.
pub struct ReconnectingSession {
    state: ReconnectState,
    seqno: AtomicU64,
    policy: ReconnectPolicy,
    attempt: u32,
    allow_reconnect: bool,
}

impl ReconnectingSession {
    pub fn new(policy: ReconnectPolicy, allow_reconnect: bool) -> Self {
        Self { state: ReconnectState::Backoff, seqno: AtomicU64::new(0), policy, attempt: 0, allow_reconnect }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    pub fn seqno(&self) -> u64 {
        self.seqno.load(Ordering::Acquire)
    }

    pub fn probe_interval(&self) -> Duration {
        self.policy.probe_interval
    }

    pub fn begin_connecting(&mut self) {
        self.state = ReconnectState::Connecting;
    }

    pub fn on_connect_ok(&mut self) {
        self.state = ReconnectState::Active;
        self.attempt = 0;
        self.seqno.fetch_add(1, Ordering::AcqRel);
    }

    pub fn on_transport_error(&mut self) {
        if self.allow_reconnect {
            self.attempt += 1;
            self.state = ReconnectState::Backoff;
        } else {
            self.state = ReconnectState::Dead;
        }
    }

    pub fn on_probe_missed(&mut self) {
        self.on_transport_error();
    }

    /// Exponential backoff with jitter, capped at `max_backoff`.
    pub fn backoff_delay(&self) -> Duration {
        let exp = self.policy.base_backoff.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(self.policy.max_backoff);
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4 + 1);
        capped + Duration::from_millis(jitter_ms)
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.state, ReconnectState::Dead)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Deadline(pub Instant);

impl Deadline {
    pub fn in_(duration: Duration) -> Self {
        Self(Instant::now() + duration)
    }

    pub fn has_passed(&self) -> bool {
        Instant::now() >= self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_backoff() {
        let s = ReconnectingSession::new(ReconnectPolicy::default(), true);
        assert_eq!(s.state(), ReconnectState::Backoff);
    }

    #[test]
    fn connect_ok_bumps_seqno_and_goes_active() {
        let mut s = ReconnectingSession::new(ReconnectPolicy::default(), true);
        s.begin_connecting();
        assert_eq!(s.state(), ReconnectState::Connecting);
        s.on_connect_ok();
        assert_eq!(s.state(), ReconnectState::Active);
        assert_eq!(s.seqno(), 1);
    }

    #[test]
    fn transport_error_with_reconnect_disabled_goes_dead() {
        let mut s = ReconnectingSession::new(ReconnectPolicy::default(), false);
        s.on_transport_error();
        assert_eq!(s.state(), ReconnectState::Dead);
        assert!(!s.is_alive());
    }

    #[test]
    fn transport_error_with_reconnect_enabled_backs_off() {
        let mut s = ReconnectingSession::new(ReconnectPolicy::default(), true);
        s.begin_connecting();
        s.on_connect_ok();
        s.on_transport_error();
        assert_eq!(s.state(), ReconnectState::Backoff);
        assert!(s.is_alive());
    }

    #[test]
    fn backoff_delay_is_capped() {
        let mut s = ReconnectingSession::new(ReconnectPolicy { max_backoff: Duration::from_millis(500), ..ReconnectPolicy::default() }, true);
        for _ in 0..30 {
            s.on_transport_error();
        }
        assert!(s.backoff_delay() <= Duration::from_millis(500) + Duration::from_millis(130));
    }
}
