//! Connection supervision.
//!
//! One background thread per client connects, health-checks and reconnects.
//! It is the only writer of the connection state and the connection handle;
//! callers observe both through read-only accessors and block on the state
//! cell while the connection is down.
//!
//! Loop outline:
//! 1. connect and probe; on failure sleep the retry backoff and try again
//! 2. subscribe the registered keys and publish `Connected` under a new epoch
//! 3. probe every monitor interval; a failed probe or a caller's loss report
//!    ends the connection
//! 4. publish `Disconnected`, sleep one monitor interval, back to 1

mod manager;
mod state;

pub use manager::{Live, SubscriptionOf, Supervisor};
pub use state::{RunFlag, Session, StateCell};
