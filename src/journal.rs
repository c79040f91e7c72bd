//! Numbered diagnostic and transaction records for one connection.
//!
//! Every record carries the connection name and a per-connection sequence
//! number so interleaved output from several connections stays readable.
//! Transaction records go to the `resilient_kv::trx` target so they can be
//! routed separately from diagnostics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Kind of a traced operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceOp {
    Read,
    Write,
}

impl TraceOp {
    pub fn as_str(self) -> &'static str {
        match self {
            TraceOp::Read => "READ",
            TraceOp::Write => "WRITE",
        }
    }
}

/// Per-connection log sink.
#[derive(Debug)]
pub struct Journal {
    name: String,
    diagnostics: bool,
    transactions: bool,
    seq: AtomicU64,
}

impl Journal {
    pub fn new(name: impl Into<String>, diagnostics: bool, transactions: bool) -> Self {
        Self {
            name: name.into(),
            diagnostics,
            transactions,
            seq: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of records emitted so far.
    pub fn emitted(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Lifecycle chatter; suppressed unless diagnostics are enabled.
    pub fn debug(&self, message: fmt::Arguments<'_>) {
        if self.diagnostics {
            tracing::debug!(connection = %self.name, seq = self.next_seq(), "{}", message);
        }
    }

    /// Connectivity trouble; suppressed unless diagnostics are enabled.
    pub fn warn(&self, message: fmt::Arguments<'_>) {
        if self.diagnostics {
            tracing::warn!(connection = %self.name, seq = self.next_seq(), "{}", message);
        }
    }

    /// Caller misuse. Always emitted.
    pub fn misuse(&self, error: &crate::Error) {
        tracing::error!(connection = %self.name, seq = self.next_seq(), error = %error, "rejected call");
    }

    /// Record a completed read or write.
    pub fn transaction(&self, op: TraceOp, key: &str, value: Option<&str>) {
        if !self.transactions {
            return;
        }
        tracing::info!(
            target: "resilient_kv::trx",
            connection = %self.name,
            seq = self.next_seq(),
            op = op.as_str(),
            key,
            value = value.unwrap_or("<nil>"),
            "transaction"
        );
    }
}
