use crate::db::{DbFollow, DbQueuedEvent, DbRelay, FollowSource, ProcStatus, Queue};
use crate::error::Error;
use crate::globals::GLOBALS;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// Counters over the outgoing and incoming queues
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub outgoing_pending: u64,
    pub outgoing_processing: u64,
    pub outgoing_completed: u64,
    pub outgoing_failed: u64,
    pub outgoing_sent_last_minute: u64,
    pub incoming_backlog: u64,
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// How many publishes completed within the last minute
fn sent_last_minute() -> u64 {
    let cutoff = now_ms() - 60_000;
    let mut log = GLOBALS.sent_log.lock();
    while let Some(front) = log.front() {
        if *front < cutoff {
            log.pop_front();
        } else {
            break;
        }
    }
    log.len() as u64
}

/// Recount the queues and cache the result for snapshots
pub async fn refresh_queue_stats() -> Result<QueueStats, Error> {
    let stats = QueueStats {
        outgoing_pending: DbQueuedEvent::count(Queue::CacheOut, Some(ProcStatus::Pending)).await?,
        outgoing_processing: DbQueuedEvent::count(Queue::CacheOut, Some(ProcStatus::InFlight))
            .await?,
        outgoing_completed: DbQueuedEvent::count(Queue::StoreOut, None).await?,
        outgoing_failed: DbQueuedEvent::count(Queue::CacheOut, Some(ProcStatus::Failed)).await?,
        outgoing_sent_last_minute: sent_last_minute(),
        incoming_backlog: DbQueuedEvent::count(Queue::CacheIn, Some(ProcStatus::Pending)).await?,
    };

    *GLOBALS.queue_stats.write() = stats.clone();
    Ok(stats)
}

/// The full status snapshot pushed to the IPC layer and returned by
/// the status command. All timestamps here are unix milliseconds.
pub async fn build_snapshot() -> Result<serde_json::Value, Error> {
    let settings = GLOBALS.settings.read().clone();
    let mode = if GLOBALS.mode_online.load(Ordering::Relaxed) {
        "online"
    } else {
        "offline"
    };

    let relays = DbRelay::fetch(None).await?;
    let preferred: Vec<String> = DbRelay::select_active()
        .await?
        .iter()
        .map(|u| u.as_str().to_owned())
        .collect();
    let categories = DbRelay::get_category_preference().await?;
    let manual_follows = DbFollow::fetch(Some(FollowSource::Manual)).await?;
    let queue_stats = GLOBALS.queue_stats.read().clone();
    let notes: Vec<String> = GLOBALS.status_notes.lock().iter().cloned().collect();

    Ok(json!({
        "mode": mode,
        "resourceLimits": settings.limits,
        "relayCategories": categories,
        "relays": relays,
        "preferredRelays": preferred,
        "manualFollows": manual_follows,
        "queueStats": queue_stats,
        "runtime": {
            "running": GLOBALS.running.load(Ordering::Relaxed),
            "background": GLOBALS.background.load(Ordering::Relaxed),
            "lastHeartbeat": GLOBALS.last_heartbeat.load(Ordering::Relaxed),
            "lastModeChange": GLOBALS.last_mode_change.load(Ordering::Relaxed),
            "statusIntervalMs": settings.status_interval_ms,
            "queueIntervalMs": settings.queue_interval_ms,
            "outgoingFlushIntervalMs": settings.outgoing_flush_interval_ms,
            "subscriptionRefreshMs": settings.subscription_refresh_ms,
            "connectedRelays": GLOBALS.connected_relays.len(),
        },
        "timestamp": now_ms(),
        "notes": notes,
    }))
}

/// Build and push a snapshot; failures are logged, never propagated
pub async fn broadcast_status() {
    match build_snapshot().await {
        Ok(snapshot) => {
            GLOBALS.last_heartbeat.store(now_ms(), Ordering::Relaxed);
            let _ = GLOBALS.status_updates.send(snapshot);
        }
        Err(e) => tracing::warn!("Could not build status snapshot: {}", e),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_shape() {
        let _db = crate::db::test::setup();

        refresh_queue_stats().await.unwrap();
        let snapshot = build_snapshot().await.unwrap();

        assert!(snapshot["mode"].is_string());
        assert!(snapshot["resourceLimits"]["outgoingPerMinute"].is_u64());
        assert!(snapshot["queueStats"]["outgoingPending"].is_u64());
        assert!(snapshot["runtime"]["connectedRelays"].is_u64());
        assert!(snapshot["timestamp"].is_i64());
        // Defaults were seeded for the preferred set
        assert!(!snapshot["preferredRelays"].as_array().unwrap().is_empty());
    }
}
