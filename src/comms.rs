use crate::commands::Command;
use nostr_types::{Event, Filter, RelayUrl};
use tokio::sync::oneshot;

/// A command from the IPC surface, paired with the channel its JSON
/// reply must be sent back on.
pub struct CommandJob {
    pub cmd: Command,
    pub reply: oneshot::Sender<serde_json::Value>,
}

/// This is a message sent to the Overlord
pub enum ToOverlordMessage {
    Command(CommandJob),
    FlushOutgoing,
    /// The relay delivered an event; proof the session is alive
    MinionActivity(RelayUrl),
    MinionIsReady(RelayUrl),
    ReconnectRelay(RelayUrl),
    SubscriptionEose(RelayUrl, String),
    Shutdown,
}

/// This is a message sent to the minions
#[derive(Debug, Clone)]
pub struct ToMinionMessage {
    /// The minion we are addressing, based on the URL they are listening to
    /// as a String.  "all" means all minions.
    pub target: String,

    pub payload: ToMinionPayload,
}

#[derive(Debug, Clone)]
pub enum ToMinionPayload {
    /// Open (or replace) the main subscription with these filters.
    /// The u64 is the subscription generation, used so stale EOSE
    /// reports can be told apart from current ones.
    Subscribe(Vec<Filter>, u64),

    /// Close the main subscription
    Unsubscribe,

    /// Broadcast this event to the relay
    PostEvent(Box<Event>),

    Shutdown,
}
