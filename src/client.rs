//! Caller-facing client: lifecycle calls plus the resilient operation wrapper.
//!
//! `get`, `set` and `match_keys` never report a connectivity failure. When
//! the store call fails transiently the client tells the supervisor which
//! connection broke, waits until a newer one is up and runs the call again
//! from scratch, as often as it takes.

use crate::backend::{Backend, KeyScan, StoreConnection};
use crate::changes::ChangeStream;
use crate::config::ClientConfig;
use crate::error::{Error, Result, StoreResult};
use crate::journal::{Journal, TraceOp};
use crate::supervisor::Supervisor;
use crate::types::{ConnectionState, Epoch};
use std::time::Duration;

/// A self-healing connection to a key-value store.
pub struct ResilientClient<B: Backend> {
    config: ClientConfig,
    supervisor: Supervisor<B>,
}

impl<B: Backend> ResilientClient<B> {
    /// Create a client. Nothing connects until [`connect`](Self::connect).
    pub fn new(backend: B, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        if !config.key_extraction.fits_db(config.db) {
            tracing::warn!(
                connection = %config.name,
                db = config.db,
                extraction = ?config.key_extraction,
                "key extraction does not fit the channel prefix of this database; keys will be misread"
            );
        }
        let supervisor = Supervisor::new(backend, &config);
        Ok(Self { config, supervisor })
    }

    pub fn version() -> &'static str {
        crate::VERSION
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Number of successful connects over the client's lifetime.
    pub fn epoch(&self) -> Epoch {
        self.supervisor.epoch()
    }

    /// Whether `connect` has started supervision that `close` has not ended.
    pub fn is_started(&self) -> bool {
        self.supervisor.is_started()
    }

    pub fn monitor_interval(&self) -> Duration {
        self.supervisor.monitor_interval()
    }

    pub(crate) fn supervisor(&self) -> &Supervisor<B> {
        &self.supervisor
    }

    fn journal(&self) -> &Journal {
        self.supervisor.journal()
    }

    fn reject(&self, error: Error) -> Error {
        if error.is_misuse() {
            self.journal().misuse(&error);
        }
        error
    }

    // --- Configuration ---

    /// Change the probe period. Only allowed before `connect`.
    pub fn set_monitor_interval(&self, interval: Duration) -> Result<()> {
        self.supervisor
            .set_monitor_interval(interval)
            .map_err(|e| self.reject(e))
    }

    /// Register the keys whose changes [`subscribed_changes`](Self::subscribed_changes)
    /// reports. Allowed once, before `connect`.
    pub fn subscribe_to_list<I, S>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        let count = keys.len();
        self.supervisor
            .register_keys(keys)
            .map_err(|e| self.reject(e))?;
        self.journal()
            .debug(format_args!("subscribed to {count} keys"));
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.supervisor.keys()
    }

    // --- Lifecycle ---

    /// Start supervision and block until the first connection is up.
    ///
    /// There is no timeout; an unreachable store keeps this waiting until
    /// `close` is called from another thread.
    pub fn connect(&self) -> Result<()> {
        self.journal().debug(format_args!("issue connector"));
        let session = self.supervisor.start().map_err(|e| self.reject(e))?;

        self.journal().debug(format_args!("wait for connection..."));
        self.supervisor.wait_connected(session)?;
        self.journal().debug(format_args!("ok, connected"));
        Ok(())
    }

    /// Stop supervision and reset to the freshly constructed state.
    ///
    /// Calls blocked in other threads return [`Error::Closed`].
    pub fn close(&self) {
        self.supervisor.close();
    }

    // --- Resilient Operations ---

    /// Read a key; `None` if it does not exist.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self.with_retry("get", |conn| conn.get(key))?;
        self.journal()
            .transaction(TraceOp::Read, key, value.as_deref());
        Ok(value)
    }

    pub fn set(&self, key: &str, value: impl AsRef<str>) -> Result<()> {
        let value = value.as_ref();
        self.with_retry("set", |conn| conn.set(key, value))?;
        self.journal()
            .transaction(TraceOp::Write, key, Some(value));
        Ok(())
    }

    /// Scan keys matching a glob pattern.
    ///
    /// Only starting the scan is retried. Failures while iterating are
    /// yielded as `Err` items for the caller to handle.
    pub fn match_keys(&self, pattern: &str) -> Result<KeyScan> {
        self.with_retry("match", |conn| conn.scan(pattern))
    }

    /// Stream of changes to the subscribed keys.
    pub fn subscribed_changes(&self) -> Result<ChangeStream<'_, B>> {
        if self.supervisor.keys().is_empty() {
            return Err(self.reject(Error::NoSubscriptions));
        }
        if !self.supervisor.is_started() {
            return Err(self.reject(Error::NotStarted));
        }
        Ok(ChangeStream::new(self))
    }

    fn with_retry<T>(
        &self,
        what: &str,
        mut op: impl FnMut(&B::Connection) -> StoreResult<T>,
    ) -> Result<T> {
        if !self.supervisor.is_started() {
            return Err(self.reject(Error::NotStarted));
        }
        let session = self.supervisor.session();
        let mut live = self.supervisor.wait_connected(session)?;
        loop {
            match op(live.conn.as_ref()) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    self.journal()
                        .warn(format_args!("{what}: connection aborted ({e}), wait..."));
                    self.supervisor.report_lost(live.epoch);
                    live = self.supervisor.await_reconnect(live.epoch, session)?;
                    self.journal().debug(format_args!("ok, re-connected"));
                }
                Err(e) => return Err(Error::Store(e)),
            }
        }
    }
}
