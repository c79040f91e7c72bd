//! Core types shared by the supervisor, the operation wrapper and the change stream.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the logical connection.
///
/// Only the supervisor thread transitions this; everything else reads it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    ShuttingDown = 3,
}

impl ConnectionState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::ShuttingDown,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ShuttingDown => "shutting-down",
        };
        f.write_str(name)
    }
}

/// Counts successful connects within one session.
///
/// Zero means "never connected". Every reconnect produces a strictly larger
/// epoch, which is how waiters tell a fresh connection from the one that failed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Self {
        Epoch(self.0 + 1)
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch({})", self.0)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the store lives.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub db: u32,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.db)
    }
}

/// Kind of a raw pub/sub record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Message,
    PMessage,
    Subscribe,
    PSubscribe,
    Unsubscribe,
    PUnsubscribe,
    Other,
}

impl NotificationKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "message" => NotificationKind::Message,
            "pmessage" => NotificationKind::PMessage,
            "subscribe" => NotificationKind::Subscribe,
            "psubscribe" => NotificationKind::PSubscribe,
            "unsubscribe" => NotificationKind::Unsubscribe,
            "punsubscribe" => NotificationKind::PUnsubscribe,
            _ => NotificationKind::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Message => "message",
            NotificationKind::PMessage => "pmessage",
            NotificationKind::Subscribe => "subscribe",
            NotificationKind::PSubscribe => "psubscribe",
            NotificationKind::Unsubscribe => "unsubscribe",
            NotificationKind::PUnsubscribe => "punsubscribe",
            NotificationKind::Other => "other",
        }
    }
}

/// A raw record delivered by a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Pattern that matched (pattern messages only).
    pub pattern: Option<String>,
    pub channel: String,
    pub data: String,
}

impl Notification {
    /// A keyspace event delivered through a pattern subscription.
    pub fn pattern_message(
        pattern: impl Into<String>,
        channel: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            kind: NotificationKind::PMessage,
            pattern: Some(pattern.into()),
            channel: channel.into(),
            data: data.into(),
        }
    }

    /// Acknowledgement emitted once per pattern on subscribe.
    pub fn subscribed(pattern: impl Into<String>, count: usize) -> Self {
        Self {
            kind: NotificationKind::PSubscribe,
            pattern: None,
            channel: pattern.into(),
            data: count.to_string(),
        }
    }
}

/// A change to a subscribed key, with the value read after the notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChange {
    pub key: String,
    /// Current value; `None` if the key no longer exists.
    pub value: Option<String>,
    /// Notification payload, e.g. `set` or `del`.
    pub event: String,
}
