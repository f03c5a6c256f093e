use crate::comms::{ToMinionMessage, ToOverlordMessage};
use crate::pool::PublishRegistry;
use crate::settings::Settings;
use crate::status::QueueStats;
use crate::RunState;
use dashmap::DashMap;
use nostr_types::{Id, RelayUrl, Unixtime};
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64};
use tokio::sync::{broadcast, mpsc, watch};

/// Only one of these is ever created, via lazy_static!, and represents
/// global state for the runtime service
pub struct Globals {
    /// This is our connection to SQLite. Only one thread at a time.
    pub db: tokio::sync::Mutex<Option<Connection>>,

    /// This is a broadcast channel. All minions should listen on it.
    /// To create a receiver, just run .subscribe() on it.
    pub to_minions: broadcast::Sender<ToMinionMessage>,

    /// This is a mpsc channel. The Overlord listens on it.
    /// To create a sender, just clone() it.
    pub to_overlord: mpsc::UnboundedSender<ToOverlordMessage>,

    /// This is ephemeral. It is filled during lazy_static initialization,
    /// and stolen away when the Overlord is created.
    pub tmp_overlord_receiver: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<ToOverlordMessage>>>,

    /// Status snapshots are pushed here for the IPC layer to forward
    pub status_updates: broadcast::Sender<serde_json::Value>,

    /// Current networking run state. Minions watch this and exit
    /// when it moves away from Online.
    pub write_runstate: watch::Sender<RunState>,
    pub read_runstate: watch::Receiver<RunState>,

    /// Settings
    pub settings: RwLock<Settings>,

    /// The relays we currently hold a live session to
    pub connected_relays: DashMap<RelayUrl, ()>,

    /// In-flight publishes, keyed by event id
    pub publishes: PublishRegistry,

    /// Event ids already handed to ingress during the current
    /// subscription generation, for cross-relay dedup
    pub seen_ids: DashMap<Id, Unixtime>,

    /// Cached queue statistics, refreshed on a timer and after
    /// ingress/egress progress
    pub queue_stats: RwLock<QueueStats>,

    /// The last few human-readable status notes
    pub status_notes: Mutex<VecDeque<String>>,

    /// Guard so only one egress flush runs at a time
    pub flushing_outgoing: AtomicBool,

    /// Unix milliseconds until which egress is throttled, 0 = not throttled
    pub outgoing_throttle_until: AtomicI64,

    /// Sliding window of (unix_ms, units) credit spends
    pub message_units_history: Mutex<VecDeque<(i64, u64)>>,

    /// Unix milliseconds of each successful outgoing publish
    pub sent_log: Mutex<VecDeque<i64>>,

    /// Count of events rejected by structural/signature validation
    pub invalid_events: AtomicU64,

    /// Count of events dropped due to incoming backpressure
    pub dropped_events: AtomicU64,

    /// Whether the service has been started
    pub running: AtomicBool,

    /// Whether we keep the network side alive without status timers
    pub background: AtomicBool,

    /// Whether the configured mode is online
    pub mode_online: AtomicBool,

    /// Unix milliseconds of the last status broadcast
    pub last_heartbeat: AtomicI64,

    /// Unix milliseconds of the last mode change
    pub last_mode_change: AtomicI64,
}

lazy_static! {
    pub static ref GLOBALS: Globals = {

        // Setup a communications channel from the Overlord to the Minions.
        let (to_minions, _) = broadcast::channel(256);

        // Setup a communications channel from the Minions to the Overlord.
        let (to_overlord, tmp_overlord_receiver) = mpsc::unbounded_channel();

        let (status_updates, _) = broadcast::channel(32);

        let (write_runstate, read_runstate) = watch::channel(RunState::Initializing);

        Globals {
            db: tokio::sync::Mutex::new(None),
            to_minions,
            to_overlord,
            tmp_overlord_receiver: tokio::sync::Mutex::new(Some(tmp_overlord_receiver)),
            status_updates,
            write_runstate,
            read_runstate,
            settings: RwLock::new(Settings::default()),
            connected_relays: DashMap::new(),
            publishes: PublishRegistry::new(),
            seen_ids: DashMap::new(),
            queue_stats: RwLock::new(QueueStats::default()),
            status_notes: Mutex::new(VecDeque::new()),
            flushing_outgoing: AtomicBool::new(false),
            outgoing_throttle_until: AtomicI64::new(0),
            message_units_history: Mutex::new(VecDeque::new()),
            sent_log: Mutex::new(VecDeque::new()),
            invalid_events: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            running: AtomicBool::new(false),
            background: AtomicBool::new(false),
            mode_online: AtomicBool::new(true),
            last_heartbeat: AtomicI64::new(0),
            last_mode_change: AtomicI64::new(0),
        }
    };
}

impl Globals {
    /// Push a human-readable note onto the status ring (keeps the last 8)
    pub fn note(message: impl Into<String>) {
        let mut notes = GLOBALS.status_notes.lock();
        notes.push_front(message.into());
        notes.truncate(8);
    }
}
