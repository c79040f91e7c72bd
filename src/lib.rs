//! # Resilient KV
//!
//! A self-healing connection to a remote key-value store.
//!
//! ## Core Concepts
//!
//! - **Supervisor**: a background thread that connects, probes and
//!   reconnects forever, publishing a single connected signal
//! - **Resilient operations**: `get`, `set` and `match_keys` wait out outages
//!   and retry instead of failing
//! - **Change stream**: keyspace notifications for a fixed key set, turned
//!   into `(key, value)` changes that survive reconnects
//! - **Backends**: the store itself sits behind the [`Backend`] trait;
//!   [`MemoryBackend`] is an in-process store with fault injection
//!
//! ## Example
//!
//! ```ignore
//! use resilient_kv::{ClientConfig, MemoryBackend, ResilientClient};
//!
//! let client = ResilientClient::new(MemoryBackend::new(), ClientConfig {
//!     name: "sensors".into(),
//!     ..Default::default()
//! })?;
//! client.subscribe_to_list(["Otto"])?;
//! client.connect()?;
//!
//! for key in client.match_keys("Kontakt*/v0")? {
//!     println!("{}", key?);
//! }
//!
//! client.set("Otto", "2")?;
//! for change in client.subscribed_changes()? {
//!     println!("{} = {:?}", change.key, change.value);
//! }
//! ```

pub mod backend;
pub mod changes;
pub mod client;
pub mod config;
pub mod error;
pub mod journal;
pub mod keyspace;
pub mod retry;
pub mod supervisor;
pub mod types;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-exports
pub use backend::{
    glob_match, Backend, Delivery, KeyScan, MemoryBackend, MemoryConnection, MemoryServer,
    MemorySubscription, NotificationSource, StoreConnection, SUBSCRIBER_BUFFER,
};
pub use changes::ChangeStream;
pub use client::ResilientClient;
pub use config::ClientConfig;
pub use error::{Error, Result, StoreError, StoreResult};
pub use journal::{Journal, TraceOp};
pub use keyspace::{channel_for, KeyExtraction};
pub use retry::RetryPolicy;
pub use supervisor::{Live, RunFlag, Session, StateCell, Supervisor};
pub use types::*;
