//! Store capability boundary.
//!
//! The supervisor never speaks a wire protocol itself. It drives a
//! [`Backend`] that can open connections, and each connection exposes the
//! handful of calls the resilience layer needs. Every call may fail with a
//! [`StoreError`](crate::StoreError); transient failures are retried by the
//! caller-facing client, everything else is surfaced as-is.
//!
//! [`MemoryBackend`] is a complete in-process store with fault injection.

mod glob;
mod memory;

pub use glob::glob_match;
pub use memory::{
    MemoryBackend, MemoryConnection, MemoryServer, MemorySubscription, SUBSCRIBER_BUFFER,
};

use crate::error::StoreResult;
use crate::types::{Endpoint, Notification};
use std::time::Duration;

/// Lazy sequence of keys produced by a pattern scan.
///
/// Iteration can fail part-way (the connection may drop between batches);
/// such failures are yielded as `Err` items and are not retried.
pub type KeyScan = Box<dyn Iterator<Item = StoreResult<String>> + Send>;

/// Opens connections to a store.
pub trait Backend: Send + Sync + 'static {
    type Connection: StoreConnection;

    /// Open a new connection. The supervisor verifies it with a probe.
    fn connect(&self, endpoint: &Endpoint) -> StoreResult<Self::Connection>;
}

/// One live connection to the store.
pub trait StoreConnection: Send + Sync + 'static {
    type Subscription: NotificationSource;

    /// Lightweight health probe.
    fn ping(&self) -> StoreResult<()>;

    /// Read a key; `None` if absent.
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Start a scan over keys matching a glob pattern.
    fn scan(&self, pattern: &str) -> StoreResult<KeyScan>;

    /// Subscribe to channel patterns.
    fn psubscribe(&self, patterns: &[String]) -> StoreResult<Self::Subscription>;
}

/// Outcome of one listen call on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Message(Notification),
    /// The store handed over an empty record.
    Empty,
    /// Nothing arrived before the timeout.
    Idle,
}

/// An active pattern subscription.
pub trait NotificationSource: Send + 'static {
    /// Block up to `timeout` for the next record.
    fn next_message(&mut self, timeout: Duration) -> StoreResult<Delivery>;
}
