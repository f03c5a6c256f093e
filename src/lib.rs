#![allow(clippy::collapsible_if)]
#![allow(clippy::collapsible_else_if)]
// TEMPORARILY
#![allow(clippy::uninlined_format_args)]

//! Grapevine is the nostr runtime behind the rhplay desktop application.
//! It keeps websocket sessions to a configurable relay set, pulls the
//! event kinds the application cares about into a local SQLite cache,
//! aggregates game ratings, and drains the outgoing publish queue under
//! rate limits. The UI talks to it over a JSON command surface and
//! receives pushed status snapshots.

pub mod commands;

/// Messages sent to the overlord and to the relay minions
pub mod comms;

mod db;
pub use db::{
    setup_database, DbFollow, DbQueuedEvent, DbRating, DbRatingSummary, DbRelay, FollowSource,
    ProcStatus, Queue, QueueRowProjection, RelayAddedBy, RelayPatch,
};

mod egress;

mod error;
pub use error::Error;

mod filter_fns;

mod follows;

mod globals;
pub use globals::{Globals, GLOBALS};

mod minion;

mod overlord;
pub use overlord::Overlord;

mod pool;

/// Processing incoming events
pub mod process;

mod ratings;

mod settings;
pub use settings::{ResourceLimits, Settings};

mod status;
pub use status::QueueStats;

mod subscriptions;

mod trust;
pub use trust::TrustTier;

#[macro_use]
extern crate lazy_static;

use crate::comms::ToOverlordMessage;

/// The USER_AGENT string grapevine (may) use when connecting to relays
pub static USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// The run state of the networking side of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initializing,
    Offline,
    Online,
    ShuttingDown,
}

impl RunState {
    /// Whether minions should keep (or start) running in this state
    pub fn going_online(&self) -> bool {
        matches!(*self, RunState::Online)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            RunState::Initializing => write!(f, "initializing"),
            RunState::Offline => write!(f, "offline"),
            RunState::Online => write!(f, "online"),
            RunState::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

// Any task can call this to shutdown
pub fn initiate_shutdown() -> Result<(), Error> {
    let to_overlord = GLOBALS.to_overlord.clone();
    let _ = to_overlord.send(ToOverlordMessage::Shutdown); // ignore errors
    Ok(())
}
