use crate::db::{DbQueuedEvent, ProcStatus, Queue};
use crate::error::Error;
use crate::globals::GLOBALS;
use crate::ratings;
use crate::status;
use nostr_types::{Event, RelayUrl, Unixtime};
use std::sync::atomic::Ordering;
use unicode_normalization::UnicodeNormalization;

const DAY: i64 = 86_400;

/// Which application table a cached event correlates with. The
/// correlation itself happens in non-core consumers; we only stamp the
/// routing metadata.
pub fn table_name_for_kind(kind: u32) -> Option<&'static str> {
    match kind {
        0 => Some("user_profiles"),
        3 => Some("follow_lists"),
        31001 => Some("user_game_annotations"),
        31106 => Some("admindeclarations"),
        31107 => Some("admin_keypairs"),
        _ => None,
    }
}

/// Retention hint, in seconds, by kind
pub fn keep_for_kind(kind: u32) -> i64 {
    match kind {
        0 | 3 => 30 * DAY,
        31106 => 365 * DAY,
        31107 => 90 * DAY,
        31001 => 120 * DAY,
        _ => 14 * DAY,
    }
}

/// The first `d` tag value, trimmed and NFC-normalized
pub fn record_uuid_for(event: &Event) -> Option<String> {
    event
        .tags
        .iter()
        .find(|t| t.tagname() == "d")
        .map(|t| t.value().trim().nfc().collect::<String>())
        .filter(|s| !s.is_empty())
}

/// Structural + signature validation via the nostr-types primitive.
/// Invalid events are counted but never stored.
pub fn verify_event(event: &Event) -> bool {
    let mut maxtime = Unixtime::now().unwrap();
    maxtime.0 += 60 * 15; // tolerate 15 minutes of clock skew

    match event.verify(Some(maxtime)) {
        Ok(()) => true,
        Err(e) => {
            GLOBALS.invalid_events.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Rejecting invalid event {}: {}", event.id.as_hex_string(), e);
            false
        }
    }
}

/// Process one verified incoming event: apply backpressure, derive
/// routing and retention, persist into cache_in, run kind-specific
/// post-processing, and push fresh stats.
///
/// Events from one subscription arrive here serially, preserving the
/// relay's delivery order.
pub async fn process_new_event(event: &Event, seen_on: Option<&RelayUrl>) -> Result<(), Error> {
    let backlog = DbQueuedEvent::count(Queue::CacheIn, Some(ProcStatus::Pending)).await?;
    let backlog_max = GLOBALS.settings.read().limits.incoming_backlog_max;
    if backlog >= backlog_max {
        GLOBALS.dropped_events.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            "Incoming backlog at {} (max {}), dropping event {}",
            backlog,
            backlog_max,
            event.id.as_hex_string()
        );
        return Ok(());
    }

    let kind = u32::from(event.kind);
    let row = DbQueuedEvent::from_event(
        event,
        ProcStatus::Pending,
        Some(keep_for_kind(kind)),
        table_name_for_kind(kind).map(|s| s.to_owned()),
        record_uuid_for(event),
        None,
    )?;

    if !DbQueuedEvent::enqueue(Queue::CacheIn, row).await? {
        tracing::trace!(
            "{}: Old event: {} @{}",
            seen_on.map(|r| r.as_str()).unwrap_or("_"),
            event.id.as_hex_string(),
            event.created_at
        );
        return Ok(());
    }

    tracing::debug!(
        "{}: New event: kind {} @{}",
        seen_on.map(|r| r.as_str()).unwrap_or("_"),
        kind,
        event.created_at
    );

    if kind == 31001 {
        // The raw event stays cached even if aggregation fails
        if let Err(e) = ratings::ingest_rating(event).await {
            tracing::warn!(
                "Rating aggregation failed for {}: {}",
                event.id.as_hex_string(),
                e
            );
        }
    }

    status::refresh_queue_stats().await?;
    status::broadcast_status().await;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::test::setup;
    use serde_json::json;

    const PK_HEX: &str = "ee11a5dff40c19a555f41fe42b48f00e618c91225622ae37b6c2bb67b76c4e49";

    fn event(id_byte: u8, kind: u32, tags: serde_json::Value) -> Event {
        let json = json!({
            "id": format!("{:02x}", id_byte).repeat(32),
            "pubkey": PK_HEX,
            "created_at": 1_700_000_000,
            "kind": kind,
            "tags": tags,
            "content": "",
            "sig": "00".repeat(64),
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_routing_table() {
        assert_eq!(table_name_for_kind(0), Some("user_profiles"));
        assert_eq!(table_name_for_kind(3), Some("follow_lists"));
        assert_eq!(table_name_for_kind(31001), Some("user_game_annotations"));
        assert_eq!(table_name_for_kind(31106), Some("admindeclarations"));
        assert_eq!(table_name_for_kind(31107), Some("admin_keypairs"));
        assert_eq!(table_name_for_kind(1), None);
    }

    #[test]
    fn test_retention_table() {
        assert_eq!(keep_for_kind(0), 30 * DAY);
        assert_eq!(keep_for_kind(3), 30 * DAY);
        assert_eq!(keep_for_kind(31106), 365 * DAY);
        assert_eq!(keep_for_kind(31107), 90 * DAY);
        assert_eq!(keep_for_kind(31001), 120 * DAY);
        assert_eq!(keep_for_kind(1), 14 * DAY);
    }

    #[test]
    fn test_record_uuid_trims_and_normalizes() {
        // The decomposed form (e + combining acute) must match the
        // composed form after NFC
        let decomposed = event(1, 31001, json!([["d", "  cafe\u{0301}-42  "]]));
        assert_eq!(record_uuid_for(&decomposed).as_deref(), Some("caf\u{00e9}-42"));

        let no_d = event(2, 31001, json!([["p", "someone"]]));
        assert_eq!(record_uuid_for(&no_d), None);

        let empty_d = event(3, 31001, json!([["d", "   "]]));
        assert_eq!(record_uuid_for(&empty_d), None);
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent() {
        let _db = setup();

        let e = event(10, 1, json!([]));
        process_new_event(&e, None).await.unwrap();
        process_new_event(&e, None).await.unwrap();

        assert_eq!(
            DbQueuedEvent::count(Queue::CacheIn, None).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_backlog_full_drops_event() {
        let _db = setup();

        let old_max = GLOBALS.settings.read().limits.incoming_backlog_max;
        GLOBALS.settings.write().limits.incoming_backlog_max = 3;

        for n in 20..23 {
            process_new_event(&event(n, 1, json!([])), None).await.unwrap();
        }
        assert_eq!(
            DbQueuedEvent::count(Queue::CacheIn, None).await.unwrap(),
            3
        );

        let dropped_before = GLOBALS.dropped_events.load(Ordering::Relaxed);
        process_new_event(&event(23, 1, json!([])), None).await.unwrap();

        // Still 3: the new event was dropped, not stored
        assert_eq!(
            DbQueuedEvent::count(Queue::CacheIn, None).await.unwrap(),
            3
        );
        assert_eq!(
            GLOBALS.dropped_events.load(Ordering::Relaxed),
            dropped_before + 1
        );

        GLOBALS.settings.write().limits.incoming_backlog_max = old_max;
    }

    #[tokio::test]
    async fn test_routing_metadata_is_stamped() {
        let _db = setup();

        let e = event(30, 31001, json!([["d", "annotation-uuid-1"]]));
        process_new_event(&e, None).await.unwrap();

        let rows = DbQueuedEvent::list_by_status(Queue::CacheIn, ProcStatus::Pending, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].table_name.as_deref(), Some("user_game_annotations"));
        assert_eq!(rows[0].record_uuid.as_deref(), Some("annotation-uuid-1"));
        assert_eq!(rows[0].keep_for, Some(120 * DAY));
    }
}
