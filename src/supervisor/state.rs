//! Shared state cells written by the supervisor thread.

use crate::types::{ConnectionState, Epoch};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

/// The connected signal.
///
/// Reads are lock-free. Writes happen only on the supervisor thread and are
/// published under `lock` so that waiters parked on `changed` cannot miss them.
pub struct StateCell {
    state: AtomicU8,
    epoch: AtomicU64,
    lock: Mutex<()>,
    changed: Condvar,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            epoch: AtomicU64::new(0),
            lock: Mutex::new(()),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Epoch of the most recent successful connect.
    pub fn epoch(&self) -> Epoch {
        Epoch(self.epoch.load(Ordering::Acquire))
    }

    pub(crate) fn transition(&self, to: ConnectionState) {
        let _guard = self.lock.lock();
        self.state.store(to as u8, Ordering::Release);
        self.changed.notify_all();
    }

    /// Enter `Connected` under a fresh epoch.
    pub(crate) fn mark_connected(&self) -> Epoch {
        let _guard = self.lock.lock();
        let epoch = self.epoch().next();
        self.epoch.store(epoch.0, Ordering::Release);
        self.state
            .store(ConnectionState::Connected as u8, Ordering::Release);
        self.changed.notify_all();
        epoch
    }

    /// Wake every waiter so it re-checks its exit condition.
    pub(crate) fn notify(&self) {
        let _guard = self.lock.lock();
        self.changed.notify_all();
    }

    /// Block until `ready` holds or `give_up` returns true.
    ///
    /// Both conditions are re-evaluated on every transition and at least
    /// once per `poll`.
    pub(crate) fn wait_until(
        &self,
        poll: Duration,
        give_up: impl Fn() -> bool,
        ready: impl Fn(ConnectionState, Epoch) -> bool,
    ) -> bool {
        let mut guard = self.lock.lock();
        loop {
            if ready(self.get(), self.epoch()) {
                return true;
            }
            if give_up() {
                return false;
            }
            self.changed.wait_for(&mut guard, poll);
        }
    }

    /// Sleep until the next transition, at most `poll`.
    pub(crate) fn park(&self, poll: Duration) {
        let mut guard = self.lock.lock();
        self.changed.wait_for(&mut guard, poll);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies one connect/close cycle of a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Session(u64);

/// The run flag.
///
/// `stop` clears it and retires the current session; anything that captured
/// the old session observes the stop even if the flag is re-armed later.
pub struct RunFlag {
    active: AtomicBool,
    session: AtomicU64,
}

impl RunFlag {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            session: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> Session {
        Session(self.session.load(Ordering::Acquire))
    }

    pub fn is_set(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_live(&self, session: Session) -> bool {
        self.is_set() && self.session.load(Ordering::Acquire) == session.0
    }

    pub(crate) fn stop(&self) {
        self.active.store(false, Ordering::Release);
        self.session.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn rearm(&self) {
        self.active.store(true, Ordering::Release);
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}
