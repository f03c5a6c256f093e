use crate::comms::{ToMinionMessage, ToMinionPayload};
use crate::db::DbRelay;
use crate::error::Error;
use crate::globals::GLOBALS;
use dashmap::DashMap;
use nostr_types::{Event, Id, Unixtime};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// What one relay said about one of our publishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayPublishResult {
    Accepted,
    Rejected(String),
}

/// The per-URL outcome of broadcasting one event across the pool.
/// Overall success means at least one relay accepted.
#[derive(Debug, Clone, Default)]
pub struct PublishOutcome {
    pub accepted: Vec<String>,
    pub rejected: Vec<(String, String)>,
    pub timed_out: usize,
}

impl PublishOutcome {
    pub fn success(&self) -> bool {
        !self.accepted.is_empty()
    }
}

struct PublishState {
    expected: usize,
    results: Mutex<HashMap<String, RelayPublishResult>>,
    notify: Notify,
}

/// In-flight publish tallies, keyed by event id. Minions feed OK/CLOSED
/// verdicts in; the egress dispatcher awaits the combined outcome.
pub struct PublishRegistry(DashMap<Id, Arc<PublishState>>);

impl PublishRegistry {
    pub fn new() -> PublishRegistry {
        PublishRegistry(DashMap::new())
    }

    pub fn begin(&self, id: Id, expected: usize) {
        self.0.insert(
            id,
            Arc::new(PublishState {
                expected,
                results: Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
        );
    }

    /// Record one relay's verdict. Unknown ids (e.g. OKs for events we
    /// did not publish this session) are ignored.
    pub fn record(&self, id: Id, url: &str, result: RelayPublishResult) {
        if let Some(state) = self.0.get(&id) {
            state.results.lock().insert(url.to_owned(), result);
            state.notify.notify_waiters();
        }
    }

    /// Await the outcome: resolves as soon as one relay accepts, or when
    /// every expected relay has answered, or at the timeout.
    pub async fn await_outcome(&self, id: Id, timeout: Duration) -> PublishOutcome {
        let state = match self.0.get(&id) {
            Some(entry) => entry.value().clone(),
            None => return PublishOutcome::default(),
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Arm the notification before checking, so a verdict landing
            // in between cannot be missed
            let notified = state.notify.notified();
            {
                let results = state.results.lock();
                let any_accepted = results
                    .values()
                    .any(|r| *r == RelayPublishResult::Accepted);
                if any_accepted || results.len() >= state.expected {
                    break;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        self.0.remove(&id);

        let results = state.results.lock();
        let mut outcome = PublishOutcome {
            timed_out: state.expected.saturating_sub(results.len()),
            ..Default::default()
        };
        for (url, result) in results.iter() {
            match result {
                RelayPublishResult::Accepted => outcome.accepted.push(url.clone()),
                RelayPublishResult::Rejected(msg) => {
                    outcome.rejected.push((url.clone(), msg.clone()))
                }
            }
        }
        outcome
    }
}

impl Default for PublishRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcast an event to every connected write relay and await the
/// pooled outcome.
pub async fn publish(event: &Event, timeout: Duration) -> Result<PublishOutcome, Error> {
    let connected: Vec<String> = GLOBALS
        .connected_relays
        .iter()
        .map(|entry| entry.key().as_str().to_owned())
        .collect();

    let expected = DbRelay::fetch(None)
        .await?
        .iter()
        .filter(|r| r.write && connected.contains(&r.url))
        .count();

    GLOBALS.publishes.begin(event.id, expected);

    let _ = GLOBALS.to_minions.send(ToMinionMessage {
        target: "all".to_string(),
        payload: ToMinionPayload::PostEvent(Box::new(event.clone())),
    });

    Ok(GLOBALS.publishes.await_outcome(event.id, timeout).await)
}

/// Record one relay's verdict on a publish we are waiting on
pub fn record_publish(id: Id, url: &str, result: RelayPublishResult) {
    GLOBALS.publishes.record(id, url, result);
}

/// Cross-relay dedup: true the first time an id is seen in the current
/// subscription generation.
pub fn note_seen(id: Id) -> bool {
    if GLOBALS.seen_ids.contains_key(&id) {
        false
    } else {
        GLOBALS.seen_ids.insert(id, Unixtime::now().unwrap());
        true
    }
}

/// Drop seen-id entries older than max_age_secs
pub fn prune_seen(max_age_secs: i64) {
    let cutoff = Unixtime::now().unwrap().0 - max_age_secs;
    GLOBALS.seen_ids.retain(|_, t| t.0 >= cutoff);
}

pub fn connected_relay_count() -> usize {
    GLOBALS.connected_relays.len()
}

#[cfg(test)]
mod test {
    use super::*;

    fn id(n: u8) -> Id {
        Id::try_from_hex_string(&format!("{:02x}", n).repeat(32)).unwrap()
    }

    #[tokio::test]
    async fn test_first_accept_resolves() {
        let registry = PublishRegistry::new();
        let id = id(1);
        registry.begin(id, 3);
        registry.record(id, "wss://one.example/", RelayPublishResult::Accepted);

        let outcome = registry.await_outcome(id, Duration::from_millis(50)).await;
        assert!(outcome.success());
        assert_eq!(outcome.accepted, vec!["wss://one.example/".to_owned()]);
    }

    #[tokio::test]
    async fn test_all_rejections_resolve_as_failure() {
        let registry = PublishRegistry::new();
        let id = id(2);
        registry.begin(id, 2);
        registry.record(
            id,
            "wss://one.example/",
            RelayPublishResult::Rejected("blocked: rate limited".to_owned()),
        );
        registry.record(
            id,
            "wss://two.example/",
            RelayPublishResult::Rejected("invalid: bad sig".to_owned()),
        );

        let outcome = registry.await_outcome(id, Duration::from_secs(5)).await;
        assert!(!outcome.success());
        assert_eq!(outcome.rejected.len(), 2);
        assert_eq!(outcome.timed_out, 0);
    }

    #[tokio::test]
    async fn test_silent_relays_time_out() {
        let registry = PublishRegistry::new();
        let id = id(3);
        registry.begin(id, 2);

        let outcome = registry.await_outcome(id, Duration::from_millis(20)).await;
        assert!(!outcome.success());
        assert_eq!(outcome.timed_out, 2);
    }
}
