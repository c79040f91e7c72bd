//! The supervisor: owns the connection handle and runs the background loop.

use super::state::{RunFlag, Session, StateCell};
use crate::backend::{Backend, StoreConnection};
use crate::config::ClientConfig;
use crate::error::{Error, Result, StoreResult};
use crate::journal::Journal;
use crate::keyspace::channel_for;
use crate::retry::RetryPolicy;
use crate::types::{ConnectionState, Endpoint, Epoch};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Subscription type of a backend's connections.
pub type SubscriptionOf<B> = <<B as Backend>::Connection as StoreConnection>::Subscription;

/// A connection handle tagged with the epoch it was established in.
pub struct Live<C> {
    pub conn: Arc<C>,
    pub epoch: Epoch,
}

impl<C> Clone for Live<C> {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            epoch: self.epoch,
        }
    }
}

/// Messages that cut a supervisor sleep short.
#[derive(Debug)]
enum Wake {
    Shutdown,
    /// A caller saw the connection of this epoch fail.
    Lost(Epoch),
}

/// How a supervisor sleep ended.
#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    Elapsed,
    Shutdown,
    Lost,
}

/// State shared between the caller side and the supervisor thread.
struct Shared<B: Backend> {
    backend: B,
    endpoint: Endpoint,
    journal: Journal,
    retry: RetryPolicy,
    state: StateCell,
    run: RunFlag,
    default_monitor_interval: Duration,
    monitor_interval: Mutex<Duration>,
    /// Written only by the supervisor thread.
    handle: RwLock<Option<Live<B::Connection>>>,
    /// Subscription of the current epoch, until a change stream claims it.
    /// Unclaimed, it keeps buffering notifications up to whatever limit the
    /// backend enforces (see `SUBSCRIBER_BUFFER` for the memory backend).
    subscription: Mutex<Option<(Epoch, SubscriptionOf<B>)>>,
    /// Subscription set: key names, fixed once the loop runs.
    keys: RwLock<Vec<String>>,
    wake_tx: Sender<Wake>,
    wake_rx: Receiver<Wake>,
}

/// Keeps one logical connection alive.
pub struct Supervisor<B: Backend> {
    shared: Arc<Shared<B>>,
    /// Background loop; present from `start` until `close`.
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Backend> Supervisor<B> {
    pub fn new(backend: B, config: &ClientConfig) -> Self {
        let (wake_tx, wake_rx) = unbounded();
        let shared = Shared {
            backend,
            endpoint: config.endpoint(),
            journal: Journal::new(&config.name, config.diagnostics, config.transactions),
            retry: config.retry.clone(),
            state: StateCell::new(),
            run: RunFlag::new(),
            default_monitor_interval: config.monitor_interval,
            monitor_interval: Mutex::new(config.monitor_interval),
            handle: RwLock::new(None),
            subscription: Mutex::new(None),
            keys: RwLock::new(Vec::new()),
            wake_tx,
            wake_rx,
        };
        Self {
            shared: Arc::new(shared),
            thread: Mutex::new(None),
        }
    }

    // --- Read-only Accessors ---

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn epoch(&self) -> Epoch {
        self.shared.state.epoch()
    }

    pub fn journal(&self) -> &Journal {
        &self.shared.journal
    }

    pub fn session(&self) -> Session {
        self.shared.run.session()
    }

    pub fn is_live(&self, session: Session) -> bool {
        self.shared.run.is_live(session)
    }

    /// Whether the background loop has been started and not yet closed.
    pub fn is_started(&self) -> bool {
        self.thread.lock().is_some()
    }

    pub fn monitor_interval(&self) -> Duration {
        *self.shared.monitor_interval.lock()
    }

    pub fn poll_interval(&self) -> Duration {
        self.shared.retry.poll_interval
    }

    pub fn keys(&self) -> Vec<String> {
        self.shared.keys.read().clone()
    }

    /// Current connection handle, if connected.
    pub fn current(&self) -> Option<Live<B::Connection>> {
        self.shared.handle.read().clone()
    }

    // --- Configuration (before start) ---

    pub fn set_monitor_interval(&self, interval: Duration) -> Result<()> {
        let thread = self.thread.lock();
        if thread.is_some() {
            return Err(Error::ConfigLocked);
        }
        if interval.is_zero() {
            return Err(Error::Config("monitor interval must be positive".into()));
        }
        *self.shared.monitor_interval.lock() = interval;
        Ok(())
    }

    pub fn register_keys(&self, keys: Vec<String>) -> Result<()> {
        let thread = self.thread.lock();
        if self.state().is_connected() {
            return Err(Error::SubscribeWhileConnected);
        }
        if thread.is_some() {
            return Err(Error::AlreadyStarted);
        }
        let mut registered = self.shared.keys.write();
        if !registered.is_empty() {
            return Err(Error::AlreadySubscribed);
        }
        *registered = keys;
        Ok(())
    }

    // --- Lifecycle ---

    /// Spawn the background loop. Returns the session it runs under.
    pub fn start(&self) -> Result<Session> {
        let mut thread = self.thread.lock();
        if self.state().is_connected() {
            return Err(Error::AlreadyConnected);
        }
        if thread.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let session = self.shared.run.session();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("kv-supervisor-{}", self.shared.journal.name()))
            .spawn(move || shared.run_loop(session))?;
        *thread = Some(handle);
        Ok(session)
    }

    /// Stop the loop, wait for it to exit and reset to the initial state.
    pub fn close(&self) {
        let journal = &self.shared.journal;
        // Held throughout so that a concurrent `start` cannot slip in mid-reset.
        let mut thread = self.thread.lock();

        journal.debug(format_args!("close..."));
        self.shared.stop();
        if let Some(handle) = thread.take() {
            journal.debug(format_args!("wait for supervisor thread"));
            if handle.join().is_err() {
                journal.warn(format_args!("supervisor thread panicked"));
            }
        }
        self.shared.reset();
        journal.debug(format_args!("ok, all closed"));
    }

    // --- Waiting ---

    /// Block until connected. Fails with `Closed` once the session ends.
    pub fn wait_connected(&self, session: Session) -> Result<Live<B::Connection>> {
        self.wait_for_epoch(Epoch(0), session)
    }

    /// Block until a connection newer than `failed` is up.
    pub fn await_reconnect(
        &self,
        failed: Epoch,
        session: Session,
    ) -> Result<Live<B::Connection>> {
        self.wait_for_epoch(failed, session)
    }

    fn wait_for_epoch(&self, after: Epoch, session: Session) -> Result<Live<B::Connection>> {
        let shared = &self.shared;
        loop {
            let ready = shared.state.wait_until(
                shared.retry.poll_interval,
                || !shared.run.is_live(session),
                |state, epoch| state.is_connected() && epoch > after,
            );
            if !ready {
                return Err(Error::Closed);
            }
            // The handle is installed before the state flips, so a miss here
            // means the connection dropped again in between.
            match self.current() {
                Some(live) if live.epoch > after => return Ok(live),
                _ => shared.state.park(shared.retry.poll_interval),
            }
        }
    }

    /// Sleep up to `duration`, waking early on close.
    pub fn pause(&self, duration: Duration) {
        self.shared.state.park(duration);
    }

    /// Tell the loop that the connection of `epoch` failed under a caller.
    pub fn report_lost(&self, epoch: Epoch) {
        let _ = self.shared.wake_tx.send(Wake::Lost(epoch));
    }

    // --- Subscription Handoff ---

    /// Claim the subscription of a connection newer than `after`.
    pub fn take_subscription(
        &self,
        after: Epoch,
        session: Session,
    ) -> Result<(Epoch, SubscriptionOf<B>)> {
        let shared = &self.shared;
        loop {
            if !shared.run.is_live(session) {
                return Err(Error::Closed);
            }
            {
                let mut slot = shared.subscription.lock();
                let current = shared.state.epoch();
                let fresh = matches!(slot.as_ref(), Some((epoch, _)) if *epoch > after && *epoch == current);
                if fresh && shared.state.get().is_connected() {
                    if let Some(held) = slot.take() {
                        return Ok(held);
                    }
                }
            }
            shared.state.park(shared.retry.poll_interval);
        }
    }

    /// Hand a claimed subscription back if it is still current.
    pub fn restore_subscription(
        &self,
        session: Session,
        epoch: Epoch,
        subscription: SubscriptionOf<B>,
    ) {
        if !self.shared.run.is_live(session) || epoch != self.shared.state.epoch() {
            return;
        }
        let mut slot = self.shared.subscription.lock();
        if slot.is_none() {
            *slot = Some((epoch, subscription));
        }
    }
}

impl<B: Backend> Drop for Supervisor<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.get_mut().take() {
            self.shared.stop();
            let _ = handle.join();
        }
    }
}

impl<B: Backend> Shared<B> {
    fn stop(&self) {
        self.run.stop();
        let _ = self.wake_tx.send(Wake::Shutdown);
        self.state.notify();
    }

    fn reset(&self) {
        // Stale wake-ups must not leak into the next session.
        while self.wake_rx.try_recv().is_ok() {}
        *self.handle.write() = None;
        *self.subscription.lock() = None;
        self.keys.write().clear();
        *self.monitor_interval.lock() = self.default_monitor_interval;
        self.state.transition(ConnectionState::Disconnected);
        self.run.rearm();
    }

    fn run_loop(&self, session: Session) {
        let journal = &self.journal;
        let mut attempt: u32 = 0;

        while self.run.is_live(session) {
            self.state.transition(ConnectionState::Connecting);
            journal.debug(format_args!("connect to {}..", self.endpoint));

            let live = match self.establish() {
                Ok(live) => {
                    attempt = 0;
                    live
                }
                Err(e) => {
                    journal.warn(format_args!("connection error: {e}"));
                    let delay = self.retry.delay_for(attempt);
                    attempt = attempt.saturating_add(1);
                    if self.sleep(delay, None) == Interrupt::Shutdown {
                        break;
                    }
                    continue;
                }
            };
            journal.debug(format_args!("connected (epoch {})", live.epoch));

            self.monitor(&live, session);
            drop(live);

            if !self.run.is_live(session) {
                break;
            }
            self.state.transition(ConnectionState::Disconnected);
            self.release();
            if self.sleep(self.monitor_interval(), None) == Interrupt::Shutdown {
                break;
            }
        }

        self.state.transition(ConnectionState::ShuttingDown);
        self.release();
        journal.debug(format_args!("supervisor stopped"));
    }

    /// Connect, probe, subscribe, then publish the handle and flip to `Connected`.
    fn establish(&self) -> StoreResult<Live<B::Connection>> {
        let conn = self.backend.connect(&self.endpoint)?;
        conn.ping()?;

        let keys = self.keys.read().clone();
        let subscription = if keys.is_empty() {
            self.journal
                .debug(format_args!("no init of subscriptions (empty)"));
            None
        } else {
            let patterns: Vec<String> = keys
                .iter()
                .map(|key| channel_for(self.endpoint.db, key))
                .collect();
            let subscription = conn.psubscribe(&patterns)?;
            for pattern in &patterns {
                self.journal.debug(format_args!("subscribe: {pattern}"));
            }
            Some(subscription)
        };

        // Single writer: the next epoch is known before it is published.
        let epoch = self.state.epoch().next();
        let live = Live {
            conn: Arc::new(conn),
            epoch,
        };
        *self.handle.write() = Some(live.clone());
        *self.subscription.lock() = subscription.map(|sub| (epoch, sub));
        let published = self.state.mark_connected();
        debug_assert_eq!(published, epoch);
        Ok(live)
    }

    /// Probe every monitor interval until the connection fails or the run ends.
    fn monitor(&self, live: &Live<B::Connection>, session: Session) {
        while self.run.is_live(session) {
            match self.sleep(self.monitor_interval(), Some(live.epoch)) {
                Interrupt::Shutdown => return,
                Interrupt::Lost => {
                    self.journal
                        .warn(format_args!("connection reported lost by caller"));
                    return;
                }
                Interrupt::Elapsed => {}
            }
            if let Err(e) = live.conn.ping() {
                self.journal.warn(format_args!("lost connection: {e}"));
                return;
            }
        }
    }

    fn release(&self) {
        *self.handle.write() = None;
        *self.subscription.lock() = None;
    }

    fn monitor_interval(&self) -> Duration {
        *self.monitor_interval.lock()
    }

    /// Cancellable sleep. Loss reports only count for the watched epoch.
    fn sleep(&self, duration: Duration, watching: Option<Epoch>) -> Interrupt {
        let deadline = Instant::now() + duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Interrupt::Elapsed;
            }
            match self.wake_rx.recv_timeout(remaining) {
                Ok(Wake::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    return Interrupt::Shutdown
                }
                Ok(Wake::Lost(epoch)) if Some(epoch) == watching => return Interrupt::Lost,
                Ok(Wake::Lost(_)) => continue,
                Err(RecvTimeoutError::Timeout) => return Interrupt::Elapsed,
            }
        }
    }
}
