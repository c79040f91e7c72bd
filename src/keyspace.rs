//! Keyspace notification channel naming.
//!
//! Watched keys are subscribed as `__keyspace@<db>__:<key>` patterns and the
//! store publishes changes on channels of the same shape. The historical
//! behavior strips a fixed 15-character prefix, which is only correct for
//! single-digit database indexes; [`KeyExtraction::Keyspace`] parses the
//! prefix instead.

use serde::{Deserialize, Serialize};

const CHANNEL_HEAD: &str = "__keyspace@";
const CHANNEL_TAIL: &str = "__:";

/// Length of `__keyspace@0__:`.
pub const DEFAULT_PREFIX_LEN: usize = 15;

/// Channel (or pattern) name for a key in a database.
pub fn channel_for(db: u32, key: &str) -> String {
    format!("{CHANNEL_HEAD}{db}{CHANNEL_TAIL}{key}")
}

/// Length of the channel prefix for `db`.
pub fn prefix_len(db: u32) -> usize {
    CHANNEL_HEAD.len() + db.to_string().len() + CHANNEL_TAIL.len()
}

/// Strategy for recovering a key from a notification channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyExtraction {
    /// Drop the first `len` characters of the channel.
    FixedPrefix { len: usize },
    /// Parse `__keyspace@<db>__:` and return the remainder.
    Keyspace,
}

impl Default for KeyExtraction {
    fn default() -> Self {
        KeyExtraction::FixedPrefix {
            len: DEFAULT_PREFIX_LEN,
        }
    }
}

impl KeyExtraction {
    /// Extract the key, or `None` if the channel does not carry one.
    pub fn extract<'a>(&self, channel: &'a str) -> Option<&'a str> {
        let key = match *self {
            KeyExtraction::FixedPrefix { len } => channel.get(len..)?,
            KeyExtraction::Keyspace => {
                let rest = channel.strip_prefix(CHANNEL_HEAD)?;
                let (db, key) = rest.split_once(CHANNEL_TAIL)?;
                if db.is_empty() || !db.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                key
            }
        };
        (!key.is_empty()).then_some(key)
    }

    /// Whether this strategy recovers keys correctly for channels of `db`.
    pub fn fits_db(&self, db: u32) -> bool {
        match *self {
            KeyExtraction::FixedPrefix { len } => len == prefix_len(db),
            KeyExtraction::Keyspace => true,
        }
    }
}
