//! In-process store with keyspace notifications and fault injection.
//!
//! A [`MemoryServer`] behaves like a small remote store: it keeps one key
//! space per database index, answers scans with glob patterns and publishes
//! `__keyspace@<db>__:<key>` notifications to pattern subscribers. Outages
//! are simulated by bumping a generation counter: every connection and
//! subscription opened under an older generation fails from then on.
//!
//! Each subscriber buffers at most [`SUBSCRIBER_BUFFER`] undelivered
//! notifications. A subscriber that falls further behind is disconnected,
//! the way a real server drops slow pub/sub clients, and its subscription
//! reports a lost connection once drained.

use super::glob::glob_match;
use super::{Backend, Delivery, KeyScan, NotificationSource, StoreConnection};
use crate::error::{StoreError, StoreResult};
use crate::keyspace::channel_for;
use crate::types::{Endpoint, Notification};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Undelivered notifications a subscriber may hold before it is dropped.
pub const SUBSCRIBER_BUFFER: usize = 1024;

/// Registered pattern subscriber.
struct Subscriber {
    db: u32,
    patterns: Vec<String>,
    sender: Sender<Notification>,
}

/// One-shot failures armed by tests.
#[derive(Default)]
struct Faults {
    refuse_connects: u32,
    fail_pings: u32,
    /// Break the next scan after this many keys.
    break_scan_after: Option<usize>,
}

/// Shared state of the simulated store.
pub struct MemoryServer {
    dbs: RwLock<HashMap<u32, BTreeMap<String, String>>>,
    online: AtomicBool,
    generation: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
    faults: Mutex<Faults>,
    connects: AtomicU64,
    pings: AtomicU64,
}

impl MemoryServer {
    fn new() -> Self {
        Self {
            dbs: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            connects: AtomicU64::new(0),
            pings: AtomicU64::new(0),
        }
    }

    // --- Fault Injection ---

    /// Take the server down. Live connections and subscriptions break.
    pub fn go_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
        self.reset_connections();
    }

    /// Accept connections again.
    pub fn go_online(&self) {
        self.online.store(true, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Break every live connection while staying reachable.
    pub fn reset_connections(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        // Dropping the senders ends every subscriber's stream.
        self.subscribers.lock().clear();
    }

    /// Refuse the next `count` connect attempts.
    pub fn refuse_connects(&self, count: u32) {
        self.faults.lock().refuse_connects = count;
    }

    /// Fail the next `count` health probes.
    pub fn fail_pings(&self, count: u32) {
        self.faults.lock().fail_pings = count;
    }

    /// Make the next scan yield `keys` keys and then fail.
    pub fn break_next_scan_after(&self, keys: usize) {
        self.faults.lock().break_scan_after = Some(keys);
    }

    // --- Direct Access ---

    /// Write a key as another client would; subscribers are notified.
    pub fn insert(&self, db: u32, key: &str, value: &str) {
        self.dbs
            .write()
            .entry(db)
            .or_default()
            .insert(key.to_string(), value.to_string());
        self.publish(db, key, "set");
    }

    /// Delete a key; subscribers are notified if it existed.
    pub fn remove(&self, db: u32, key: &str) -> bool {
        let removed = self
            .dbs
            .write()
            .get_mut(&db)
            .and_then(|space| space.remove(key))
            .is_some();
        if removed {
            self.publish(db, key, "del");
        }
        removed
    }

    pub fn value(&self, db: u32, key: &str) -> Option<String> {
        self.dbs.read().get(&db).and_then(|space| space.get(key).cloned())
    }

    // --- Stats ---

    /// Successful connects so far.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Health probes answered so far (including failed ones).
    pub fn ping_count(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    // --- Internals ---

    fn open(self: &Arc<Self>, db: u32) -> StoreResult<MemoryConnection> {
        {
            let mut faults = self.faults.lock();
            if faults.refuse_connects > 0 {
                faults.refuse_connects -= 1;
                return Err(StoreError::ConnectionRefused("injected refusal".into()));
            }
        }
        if !self.is_online() {
            return Err(StoreError::ConnectionRefused("server offline".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            server: Arc::clone(self),
            db,
            generation: self.generation.load(Ordering::SeqCst),
        })
    }

    fn check(&self, generation: u64) -> StoreResult<()> {
        if !self.is_online() {
            return Err(StoreError::ConnectionLost("server offline".into()));
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            return Err(StoreError::ConnectionLost("connection reset".into()));
        }
        Ok(())
    }

    fn publish(&self, db: u32, key: &str, event: &str) {
        let channel = channel_for(db, key);
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| {
            if sub.db != db {
                return true;
            }
            sub.patterns
                .iter()
                .filter(|pattern| glob_match(pattern, &channel))
                .all(|pattern| {
                    // A full buffer disconnects the subscriber, as does a dropped receiver.
                    sub.sender
                        .try_send(Notification::pattern_message(pattern.as_str(), &channel, event))
                        .is_ok()
                })
        });
    }
}

/// Backend handing out connections to a shared [`MemoryServer`].
#[derive(Clone)]
pub struct MemoryBackend {
    server: Arc<MemoryServer>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            server: Arc::new(MemoryServer::new()),
        }
    }

    /// The server behind this backend, for direct access and fault injection.
    pub fn server(&self) -> &Arc<MemoryServer> {
        &self.server
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    type Connection = MemoryConnection;

    fn connect(&self, endpoint: &Endpoint) -> StoreResult<MemoryConnection> {
        self.server.open(endpoint.db)
    }
}

/// A connection opened under one server generation.
pub struct MemoryConnection {
    server: Arc<MemoryServer>,
    db: u32,
    generation: u64,
}

impl StoreConnection for MemoryConnection {
    type Subscription = MemorySubscription;

    fn ping(&self) -> StoreResult<()> {
        self.server.pings.fetch_add(1, Ordering::SeqCst);
        self.server.check(self.generation)?;
        let mut faults = self.server.faults.lock();
        if faults.fail_pings > 0 {
            faults.fail_pings -= 1;
            return Err(StoreError::ConnectionLost("injected probe failure".into()));
        }
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.server.check(self.generation)?;
        Ok(self.server.value(self.db, key))
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.server.check(self.generation)?;
        self.server.insert(self.db, key, value);
        Ok(())
    }

    fn scan(&self, pattern: &str) -> StoreResult<KeyScan> {
        self.server.check(self.generation)?;
        let keys: Vec<String> = self
            .server
            .dbs
            .read()
            .get(&self.db)
            .map(|space| {
                space
                    .keys()
                    .filter(|key| glob_match(pattern, key))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let break_after = self.server.faults.lock().break_scan_after.take();

        Ok(Box::new(MemoryScan {
            keys: keys.into_iter(),
            remaining: break_after,
            server: Arc::clone(&self.server),
            generation: self.generation,
            done: false,
        }))
    }

    fn psubscribe(&self, patterns: &[String]) -> StoreResult<MemorySubscription> {
        self.server.check(self.generation)?;
        let (sender, receiver) = bounded(SUBSCRIBER_BUFFER + patterns.len());
        for (count, pattern) in patterns.iter().enumerate() {
            // Acknowledgements are queued before any event can arrive.
            let _ = sender.try_send(Notification::subscribed(pattern.as_str(), count + 1));
        }
        self.server.subscribers.lock().push(Subscriber {
            db: self.db,
            patterns: patterns.to_vec(),
            sender,
        });
        Ok(MemorySubscription {
            receiver,
            server: Arc::clone(&self.server),
            generation: self.generation,
        })
    }
}

/// Receiving end of a pattern subscription.
pub struct MemorySubscription {
    receiver: Receiver<Notification>,
    server: Arc<MemoryServer>,
    generation: u64,
}

impl NotificationSource for MemorySubscription {
    fn next_message(&mut self, timeout: Duration) -> StoreResult<Delivery> {
        match self.receiver.recv_timeout(timeout) {
            Ok(notification) => Ok(Delivery::Message(notification)),
            Err(RecvTimeoutError::Timeout) => {
                self.server.check(self.generation)?;
                Ok(Delivery::Idle)
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(StoreError::ConnectionLost("subscription closed".into()))
            }
        }
    }
}

/// Snapshot scan that re-checks the connection on every step.
struct MemoryScan {
    keys: std::vec::IntoIter<String>,
    remaining: Option<usize>,
    server: Arc<MemoryServer>,
    generation: u64,
    done: bool,
}

impl Iterator for MemoryScan {
    type Item = StoreResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let broken = match self.remaining.as_mut() {
            Some(0) => true,
            Some(left) => {
                *left -= 1;
                false
            }
            None => false,
        };
        if broken {
            self.done = true;
            return Some(Err(StoreError::ConnectionLost("scan interrupted".into())));
        }
        if let Err(e) = self.server.check(self.generation) {
            self.done = true;
            return Some(Err(e));
        }
        let key = self.keys.next();
        if key.is_none() {
            self.done = true;
        }
        key.map(Ok)
    }
}
