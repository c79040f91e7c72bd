//! Change notification stream.
//!
//! Turns the keyspace notifications of the subscribed keys into
//! [`KeyChange`] items. The stream survives reconnects: when listening
//! fails it reports the broken connection, waits for the supervisor to
//! reconnect (which re-subscribes the same key set) and resumes on the new
//! subscription. A subscription left behind by a reconnect the stream did
//! not see fail itself (a failed health probe, say) is dropped in favor of
//! the current one. It ends only when the client is closed.
//!
//! Delivery is best effort. A notification whose value cannot be read is
//! logged and dropped.

use crate::backend::{Backend, Delivery, NotificationSource};
use crate::client::ResilientClient;
use crate::error::Error;
use crate::keyspace::KeyExtraction;
use crate::supervisor::{Session, SubscriptionOf};
use crate::types::{Epoch, KeyChange, NotificationKind};
use std::time::Duration;

/// Blocking iterator over changes to subscribed keys.
///
/// Holds the client's subscription while alive; dropping the stream hands
/// it back so a later stream can continue where this one stopped.
pub struct ChangeStream<'a, B: Backend> {
    client: &'a ResilientClient<B>,
    session: Session,
    source: Option<(Epoch, SubscriptionOf<B>)>,
    /// Only subscriptions newer than this epoch are acceptable.
    failed: Epoch,
    idle: Duration,
    extraction: KeyExtraction,
}

impl<'a, B: Backend> ChangeStream<'a, B> {
    pub(crate) fn new(client: &'a ResilientClient<B>) -> Self {
        let supervisor = client.supervisor();
        Self {
            client,
            session: supervisor.session(),
            source: None,
            failed: Epoch(0),
            idle: supervisor.poll_interval(),
            extraction: client.config().key_extraction,
        }
    }

    /// Epoch of the subscription currently being read, if any.
    pub fn epoch(&self) -> Option<Epoch> {
        self.source.as_ref().map(|(epoch, _)| *epoch)
    }
}

impl<B: Backend> Iterator for ChangeStream<'_, B> {
    type Item = KeyChange;

    fn next(&mut self) -> Option<KeyChange> {
        let client = self.client;
        let supervisor = client.supervisor();
        let journal = supervisor.journal();

        loop {
            if !supervisor.is_live(self.session) {
                return None;
            }

            if let Some((held, _)) = self.source.as_ref() {
                let held = *held;
                if held < supervisor.epoch() {
                    journal.debug(format_args!(
                        "subscriber: epoch {held} superseded, switching subscription"
                    ));
                    self.source = None;
                    self.failed = held;
                }
            }

            if self.source.is_none() {
                journal.debug(format_args!("subscriber: wait for connection"));
                match supervisor.take_subscription(self.failed, self.session) {
                    Ok(held) => self.source = Some(held),
                    Err(_) => return None,
                }
            }
            let Some((epoch, source)) = self.source.as_mut() else {
                continue;
            };
            let epoch = *epoch;

            let notification = match source.next_message(self.idle) {
                Ok(Delivery::Message(notification)) => notification,
                Ok(Delivery::Idle) => continue,
                Ok(Delivery::Empty) => {
                    journal.debug(format_args!("subscriber: empty notification"));
                    supervisor.pause(self.idle);
                    continue;
                }
                Err(e) => {
                    journal.warn(format_args!("subscriber: connection aborted ({e}), wait..."));
                    self.source = None;
                    self.failed = epoch;
                    supervisor.report_lost(epoch);
                    continue;
                }
            };

            if notification.kind != NotificationKind::PMessage {
                journal.debug(format_args!(
                    "subscriber: skipping {} message",
                    notification.kind.as_str()
                ));
                continue;
            }

            let Some(key) = self.extraction.extract(&notification.channel) else {
                journal.debug(format_args!(
                    "subscriber: no key in channel {}",
                    notification.channel
                ));
                continue;
            };

            match client.get(key) {
                Ok(value) => {
                    return Some(KeyChange {
                        key: key.to_string(),
                        value,
                        event: notification.data,
                    })
                }
                Err(Error::Closed) => return None,
                Err(e) => {
                    journal.warn(format_args!("cannot read subscribed key {key}: {e}"));
                }
            }
        }
    }
}

impl<B: Backend> Drop for ChangeStream<'_, B> {
    fn drop(&mut self) {
        if let Some((epoch, source)) = self.source.take() {
            self.client
                .supervisor()
                .restore_subscription(self.session, epoch, source);
        }
    }
}
