use crate::comms::{ToMinionMessage, ToMinionPayload};
use crate::error::Error;
use crate::filter_fns;
use crate::follows;
use crate::globals::GLOBALS;
use nostr_types::Filter;

/// Owns the one logical subscription across the relay pool: computes
/// the active filter set, compares it against what is already open,
/// and replaces the subscription only when the canonical serialization
/// actually changed (or a refresh is forced).
pub struct SubscriptionManager {
    /// Canonical serialization of the filters currently subscribed,
    /// None when no subscription is open
    active: Option<String>,

    /// The filters behind `active`, kept so newly engaged minions can
    /// be handed the current subscription
    filters: Vec<Filter>,

    /// Bumped every time the subscription is (re)opened
    generation: u64,
}

impl SubscriptionManager {
    pub fn new() -> SubscriptionManager {
        SubscriptionManager {
            active: None,
            filters: Vec::new(),
            generation: 0,
        }
    }

    /// The payload to hand a minion that joins while a subscription is
    /// open
    pub fn current_subscribe_payload(&self) -> Option<ToMinionPayload> {
        self.active
            .as_ref()
            .map(|_| ToMinionPayload::Subscribe(self.filters.clone(), self.generation))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn compute_filters() -> Result<Vec<Filter>, Error> {
        let followed = follows::follow_set().await?;
        let limit = GLOBALS.settings.read().filter_limit as usize;
        Ok(filter_fns::main_filters(&followed, limit))
    }

    /// A stable serialization used to detect change. Inputs are already
    /// normalized (authors lowercase hex, sorted, deduplicated), so
    /// equal filter sets serialize identically.
    pub fn canonical(filters: &[Filter]) -> Result<String, Error> {
        Ok(serde_json::to_string(filters)?)
    }

    /// Recompute and (re)subscribe if anything changed. Returns whether
    /// the subscription was touched.
    pub async fn refresh(&mut self, force: bool) -> Result<bool, Error> {
        let filters = SubscriptionManager::compute_filters().await?;
        let canonical = SubscriptionManager::canonical(&filters)?;

        if !force && self.active.as_deref() == Some(canonical.as_str()) {
            return Ok(false);
        }

        self.generation += 1;
        GLOBALS.seen_ids.clear();

        let _ = GLOBALS.to_minions.send(ToMinionMessage {
            target: "all".to_string(),
            payload: ToMinionPayload::Subscribe(filters.clone(), self.generation),
        });

        tracing::debug!(
            "Subscription refreshed (generation {}): {}",
            self.generation,
            canonical
        );

        self.active = Some(canonical);
        self.filters = filters;
        Ok(true)
    }

    /// Close the subscription (the filters stay recomputable, so a
    /// later refresh reopens an identical one if nothing changed)
    pub fn close(&mut self) {
        if self.active.take().is_some() {
            self.filters.clear();
            let _ = GLOBALS.to_minions.send(ToMinionMessage {
                target: "all".to_string(),
                payload: ToMinionPayload::Unsubscribe,
            });
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::{DbFollow, FollowSource};
    use nostr_types::PublicKeyHex;

    const PK_HEX: &str = "ee11a5dff40c19a555f41fe42b48f00e618c91225622ae37b6c2bb67b76c4e49";

    #[test]
    fn test_canonical_is_stable() {
        let pkh = PublicKeyHex::try_from_str(PK_HEX).unwrap();
        let a = filter_fns::main_filters(&[pkh.clone()], 200);
        let b = filter_fns::main_filters(&[pkh], 200);
        assert_eq!(
            SubscriptionManager::canonical(&a).unwrap(),
            SubscriptionManager::canonical(&b).unwrap()
        );
    }

    #[test]
    fn test_baseline_only_without_follows() {
        let filters = filter_fns::main_filters(&[], 200);
        assert_eq!(filters.len(), 1);
        assert!(filters[0].authors.is_empty());
        assert_eq!(filters[0].limit, Some(200));
        assert_eq!(filters[0].kinds.len(), 5);
    }

    #[test]
    fn test_author_filter_added_with_follows() {
        let pkh = PublicKeyHex::try_from_str(PK_HEX).unwrap();
        let filters = filter_fns::main_filters(&[pkh.clone()], 200);
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[1].authors, vec![pkh]);
    }

    #[tokio::test]
    async fn test_refresh_is_stable_without_changes() {
        let _db = crate::db::test::setup();

        DbFollow::upsert(DbFollow {
            pubkey: PK_HEX.to_owned(),
            source: FollowSource::Manual,
            label: None,
        })
        .await
        .unwrap();

        let mut sm = SubscriptionManager::new();
        assert!(sm.refresh(false).await.unwrap());
        let generation = sm.generation();

        // Unchanged inputs: no touch, same generation
        assert!(!sm.refresh(false).await.unwrap());
        assert_eq!(sm.generation(), generation);

        // Forced: reopened
        assert!(sm.refresh(true).await.unwrap());
        assert_eq!(sm.generation(), generation + 1);

        // Changed inputs: reopened
        DbFollow::remove(PK_HEX.to_owned(), FollowSource::Manual)
            .await
            .unwrap();
        assert!(sm.refresh(false).await.unwrap());
    }
}
