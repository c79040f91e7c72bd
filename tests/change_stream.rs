//! Change notification stream tests.

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use resilient_kv::{
    Backend, ClientConfig, Delivery, Endpoint, Epoch, Error, KeyChange, KeyExtraction, KeyScan,
    MemoryBackend, MemoryConnection, MemorySubscription, Notification, NotificationSource,
    ResilientClient, RetryPolicy, StoreConnection, StoreError, StoreResult,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

fn test_config() -> ClientConfig {
    ClientConfig {
        name: "changes".into(),
        monitor_interval: Duration::from_millis(30),
        diagnostics: true,
        retry: RetryPolicy::fixed(Duration::from_millis(5)),
        ..Default::default()
    }
}

fn connected_client<B: Backend + Clone>(backend: &B, keys: &[&str]) -> Arc<ResilientClient<B>> {
    let client = ResilientClient::new(backend.clone(), test_config()).unwrap();
    client.subscribe_to_list(keys.iter().copied()).unwrap();
    client.connect().unwrap();
    Arc::new(client)
}

/// Iterate the stream on a background thread, forwarding every change.
fn spawn_listener<B: Backend>(
    client: &Arc<ResilientClient<B>>,
) -> (Receiver<KeyChange>, JoinHandle<()>) {
    let (tx, rx) = unbounded();
    let client = Arc::clone(client);
    let handle = thread::spawn(move || {
        let stream = client.subscribed_changes().unwrap();
        for change in stream {
            if tx.send(change).is_err() {
                break;
            }
        }
    });
    (rx, handle)
}

fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Memory backend with scripted records and half-open subscriptions.
///
/// Records queued in `script` are handed out before anything the server
/// publishes. A subscription goes silent once its connection is dropped,
/// and reading the key `broken` fails with a non-transient error.
#[derive(Clone)]
struct ScriptedBackend {
    inner: MemoryBackend,
    script: Arc<Mutex<VecDeque<Delivery>>>,
}

impl ScriptedBackend {
    fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            script: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn push(&self, delivery: Delivery) {
        self.script.lock().push_back(delivery);
    }
}

struct ScriptedConnection {
    inner: MemoryConnection,
    script: Arc<Mutex<VecDeque<Delivery>>>,
    alive: Arc<AtomicBool>,
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

struct ScriptedSubscription {
    inner: MemorySubscription,
    script: Arc<Mutex<VecDeque<Delivery>>>,
    alive: Arc<AtomicBool>,
}

impl Backend for ScriptedBackend {
    type Connection = ScriptedConnection;

    fn connect(&self, endpoint: &Endpoint) -> StoreResult<ScriptedConnection> {
        Ok(ScriptedConnection {
            inner: self.inner.connect(endpoint)?,
            script: Arc::clone(&self.script),
            alive: Arc::new(AtomicBool::new(true)),
        })
    }
}

impl StoreConnection for ScriptedConnection {
    type Subscription = ScriptedSubscription;

    fn ping(&self) -> StoreResult<()> {
        self.inner.ping()
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        if key == "broken" {
            return Err(StoreError::WrongType(key.to_string()));
        }
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.inner.set(key, value)
    }

    fn scan(&self, pattern: &str) -> StoreResult<KeyScan> {
        self.inner.scan(pattern)
    }

    fn psubscribe(&self, patterns: &[String]) -> StoreResult<ScriptedSubscription> {
        Ok(ScriptedSubscription {
            inner: self.inner.psubscribe(patterns)?,
            script: Arc::clone(&self.script),
            alive: Arc::clone(&self.alive),
        })
    }
}

impl NotificationSource for ScriptedSubscription {
    fn next_message(&mut self, timeout: Duration) -> StoreResult<Delivery> {
        if !self.alive.load(Ordering::SeqCst) {
            // Half-open: the socket never reports the loss.
            thread::sleep(timeout);
            return Ok(Delivery::Idle);
        }
        if let Some(delivery) = self.script.lock().pop_front() {
            return Ok(delivery);
        }
        self.inner.next_message(timeout)
    }
}

fn keyspace_message(channel: &str) -> Delivery {
    Delivery::Message(Notification::pattern_message(
        "__keyspace@0__:*",
        channel,
        "set",
    ))
}

// --- Delivery ---

#[test]
fn test_changes_for_subscribed_keys() {
    let backend = MemoryBackend::new();
    let client = connected_client(&backend, &["Otto"]);
    let (rx, handle) = spawn_listener(&client);

    client.set("Otto", "2").unwrap();
    let change = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(
        change,
        KeyChange {
            key: "Otto".into(),
            value: Some("2".into()),
            event: "set".into(),
        }
    );

    // Unsubscribed keys stay silent.
    client.set("Anna", "1").unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    client.close();
    handle.join().unwrap();
}

#[test]
fn test_external_writes_and_deletes() {
    let backend = MemoryBackend::new();
    let client = connected_client(&backend, &["Otto", "Anna"]);
    let (rx, handle) = spawn_listener(&client);

    backend.server().insert(0, "Anna", "5");
    let change = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(change.key, "Anna");
    assert_eq!(change.value.as_deref(), Some("5"));

    backend.server().remove(0, "Anna");
    let change = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(change.key, "Anna");
    assert_eq!(change.value, None);
    assert_eq!(change.event, "del");

    client.close();
    handle.join().unwrap();
}

#[test]
fn test_wildcard_key_subscription() {
    let backend = MemoryBackend::new();
    let client = connected_client(&backend, &["sensor:*"]);
    let (rx, handle) = spawn_listener(&client);

    backend.server().insert(0, "sensor:1", "20.5");
    backend.server().insert(0, "actor:1", "on");
    backend.server().insert(0, "sensor:2", "19.0");

    let first = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    let second = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(first.key, "sensor:1");
    assert_eq!(second.key, "sensor:2");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    client.close();
    handle.join().unwrap();
}

// --- Reconnect ---

#[test]
fn test_stream_resumes_after_reconnect() {
    let backend = MemoryBackend::new();
    let client = connected_client(&backend, &["Otto"]);
    let (rx, handle) = spawn_listener(&client);

    client.set("Otto", "1").unwrap();
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap().value.as_deref(), Some("1"));

    backend.server().go_offline();
    assert!(wait_until(RECV_TIMEOUT, || !client.is_connected()));
    backend.server().go_online();
    assert!(wait_until(RECV_TIMEOUT, || client.is_connected() && client.epoch() >= Epoch(2)));

    // Written by another client after the reconnect; no caller intervention.
    backend.server().insert(0, "Otto", "3");
    let change = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(change.key, "Otto");
    assert_eq!(change.value.as_deref(), Some("3"));

    client.close();
    handle.join().unwrap();
}

#[test]
fn test_connection_reset_mid_listen() {
    let backend = MemoryBackend::new();
    let client = connected_client(&backend, &["Otto"]);
    let (rx, handle) = spawn_listener(&client);

    backend.server().reset_connections();
    assert!(wait_until(RECV_TIMEOUT, || client.epoch() >= Epoch(2) && client.is_connected()));

    client.set("Otto", "9").unwrap();
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap().value.as_deref(), Some("9"));

    client.close();
    handle.join().unwrap();
}

#[test]
fn test_unusable_records_are_skipped() {
    let backend = ScriptedBackend::new();
    let client = connected_client(&backend, &["Otto", "broken"]);

    backend.push(Delivery::Empty);
    // Channel without a key after the prefix.
    backend.push(keyspace_message("__keyspace@0__:"));
    // Value cannot be read.
    backend.push(keyspace_message("__keyspace@0__:broken"));
    let (rx, handle) = spawn_listener(&client);

    assert!(wait_until(RECV_TIMEOUT, || backend.script.lock().is_empty()));
    backend.inner.server().insert(0, "Otto", "1");
    let change = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(change.key, "Otto");
    assert_eq!(change.value.as_deref(), Some("1"));
    assert!(rx.try_recv().is_err());

    client.close();
    handle.join().unwrap();
}

#[test]
fn test_idle_stream_delivers_promptly() {
    let backend = MemoryBackend::new();
    let config = ClientConfig {
        retry: RetryPolicy::fixed(Duration::from_millis(5))
            .with_poll_interval(Duration::from_millis(400)),
        ..test_config()
    };
    let client = Arc::new(ResilientClient::new(backend.clone(), config).unwrap());
    client.subscribe_to_list(["Otto"]).unwrap();
    client.connect().unwrap();
    let (rx, handle) = spawn_listener(&client);

    let mut slowest = Duration::ZERO;
    for i in 0..4 {
        // Long enough for the listener to sit through an idle poll.
        thread::sleep(Duration::from_millis(450));
        let sent = Instant::now();
        backend.server().insert(0, "Otto", &i.to_string());
        rx.recv_timeout(RECV_TIMEOUT).unwrap();
        slowest = slowest.max(sent.elapsed());
    }
    assert!(slowest < Duration::from_millis(200), "slowest delivery {slowest:?}");

    client.close();
    handle.join().unwrap();
}

// --- Reconnect ---

#[test]
fn test_stream_follows_ping_failure_reconnect() {
    let backend = ScriptedBackend::new();
    let client = connected_client(&backend, &["Otto"]);
    let (rx, handle) = spawn_listener(&client);
    let server = backend.inner.server();

    client.set("Otto", "1").unwrap();
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap().value.as_deref(), Some("1"));

    // The ping fails; the old subscription goes silent without an error.
    server.fail_pings(1);
    assert!(wait_until(RECV_TIMEOUT, || client.is_connected() && client.epoch() == Epoch(2)));

    server.insert(0, "Otto", "2");
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap().value.as_deref(), Some("2"));

    // The abandoned subscriber is pruned on the next publish.
    server.insert(0, "Otto", "3");
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap().value.as_deref(), Some("3"));
    assert_eq!(server.subscriber_count(), 1);

    client.close();
    handle.join().unwrap();
}

// --- Lifecycle ---

#[test]
fn test_stream_requires_subscriptions() {
    let client = ResilientClient::new(MemoryBackend::new(), test_config()).unwrap();
    client.connect().unwrap();

    assert!(matches!(client.subscribed_changes(), Err(Error::NoSubscriptions)));
    client.close();
}

#[test]
fn test_stream_ends_on_close() {
    let backend = MemoryBackend::new();
    let client = connected_client(&backend, &["Otto"]);
    let (_rx, handle) = spawn_listener(&client);

    thread::sleep(Duration::from_millis(30));
    let start = Instant::now();
    client.close();
    handle.join().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_dropped_stream_hands_back_subscription() {
    let backend = MemoryBackend::new();
    let client = connected_client(&backend, &["Otto"]);

    {
        let mut stream = client.subscribed_changes().unwrap();
        client.set("Otto", "1").unwrap();
        assert_eq!(stream.next().unwrap().value.as_deref(), Some("1"));
        assert_eq!(stream.epoch(), Some(Epoch(1)));
    }

    let mut stream = client.subscribed_changes().unwrap();
    client.set("Otto", "2").unwrap();
    assert_eq!(stream.next().unwrap().value.as_deref(), Some("2"));
    assert_eq!(client.epoch(), Epoch(1));
    drop(stream);
    client.close();
}

#[test]
fn test_parsed_extraction_on_wide_db() {
    let backend = MemoryBackend::new();
    let config = ClientConfig {
        db: 12,
        key_extraction: KeyExtraction::Keyspace,
        ..test_config()
    };
    let client = Arc::new(ResilientClient::new(backend.clone(), config).unwrap());
    client.subscribe_to_list(["Otto"]).unwrap();
    client.connect().unwrap();
    let (rx, handle) = spawn_listener(&client);

    client.set("Otto", "4").unwrap();
    let change = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(change.key, "Otto");
    assert_eq!(backend.server().value(12, "Otto"), Some("4".to_string()));

    client.close();
    handle.join().unwrap();
}
