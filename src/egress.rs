use crate::comms::ToOverlordMessage;
use crate::db::{DbQueuedEvent, ProcStatus, Queue};
use crate::error::Error;
use crate::globals::{Globals, GLOBALS};
use crate::pool;
use crate::status;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// One credit covers this many serialized bytes of an outbound event
pub const UNIT_SIZE: usize = 1024;

/// How long egress cools down once the credit budget is exhausted
pub const THROTTLE_COOLDOWN_SECS: u64 = 60;

pub fn units_for(serialized_len: usize) -> u64 {
    ((serialized_len + UNIT_SIZE - 1) / UNIT_SIZE) as u64
}

/// Drop credit entries that fell out of the sliding window
pub fn trim_credit_window(now_ms: i64, window_seconds: u64) {
    let cutoff = now_ms - (window_seconds as i64) * 1000;
    let mut window = GLOBALS.message_units_history.lock();
    while let Some((at, _)) = window.front() {
        if *at < cutoff {
            window.pop_front();
        } else {
            break;
        }
    }
}

pub fn used_credits() -> u64 {
    GLOBALS
        .message_units_history
        .lock()
        .iter()
        .map(|(_, units)| units)
        .sum()
}

pub fn record_credits(now_ms: i64, units: u64) {
    GLOBALS.message_units_history.lock().push_back((now_ms, units));
}

/// On startup, demote in-flight rows stranded by a previous run
pub async fn recover_in_flight() -> Result<(), Error> {
    let threshold = GLOBALS.settings.read().recovery_threshold_secs as i64;
    let recovered = DbQueuedEvent::recovery_sweep(threshold).await?;
    if recovered > 0 {
        tracing::info!(
            "Recovered {} stuck outgoing event(s) back to pending",
            recovered
        );
        Globals::note(format!("Recovered {} stuck outgoing event(s)", recovered));
    }
    Ok(())
}

/// Drain pending outgoing rows under the configured rate limits.
/// Only one flush runs at a time; overlapping calls return right away.
pub async fn flush_outgoing() -> Result<(), Error> {
    if GLOBALS
        .flushing_outgoing
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    let result = flush_inner().await;
    GLOBALS.flushing_outgoing.store(false, Ordering::SeqCst);
    result
}

async fn flush_inner() -> Result<(), Error> {
    if !GLOBALS.read_runstate.borrow().going_online() {
        return Ok(());
    }
    if pool::connected_relay_count() == 0 {
        return Ok(());
    }
    if GLOBALS.outgoing_throttle_until.load(Ordering::Relaxed) > status::now_ms() {
        return Ok(());
    }

    let (per_minute, rate_units, window_seconds, publish_timeout) = {
        let settings = GLOBALS.settings.read();
        (
            settings.limits.outgoing_per_minute,
            settings.limits.message_rate_units,
            settings.limits.message_rate_window_seconds,
            settings.publish_timeout_secs,
        )
    };

    trim_credit_window(status::now_ms(), window_seconds);

    let rows =
        DbQueuedEvent::list_by_status(Queue::CacheOut, ProcStatus::Pending, per_minute as usize)
            .await?;
    if rows.is_empty() {
        return Ok(());
    }

    let mut progressed = false;
    for row in rows {
        // An unsigned row can never publish. Terminal.
        let event = match row.to_event() {
            Ok(event) if !row.sig.is_empty() => event,
            _ => {
                tracing::warn!("Outgoing row {} has no usable signature, marking failed", row.id);
                DbQueuedEvent::update_status(Queue::CacheOut, row.id.clone(), ProcStatus::Failed)
                    .await?;
                progressed = true;
                continue;
            }
        };

        let wire = serde_json::to_string(&event)?;
        let units = units_for(wire.len());

        if used_credits() + units > rate_units {
            let until = status::now_ms() + (THROTTLE_COOLDOWN_SECS as i64) * 1000;
            GLOBALS
                .outgoing_throttle_until
                .store(until, Ordering::Relaxed);
            Globals::note("Outgoing throttled: message rate credits exhausted");
            tracing::info!(
                "Message rate credits exhausted; cooling down for {}s",
                THROTTLE_COOLDOWN_SECS
            );

            // Wake the flush again once the cool-down has passed
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(THROTTLE_COOLDOWN_SECS)).await;
                GLOBALS.outgoing_throttle_until.store(0, Ordering::Relaxed);
                let _ = GLOBALS.to_overlord.send(ToOverlordMessage::FlushOutgoing);
            });
            break;
        }

        DbQueuedEvent::update_status(Queue::CacheOut, row.id.clone(), ProcStatus::InFlight).await?;

        let outcome = pool::publish(&event, Duration::from_secs(publish_timeout)).await?;

        if outcome.success() {
            DbQueuedEvent::update_status(Queue::CacheOut, row.id.clone(), ProcStatus::Done).await?;
            DbQueuedEvent::move_queue(Queue::CacheOut, Queue::StoreOut, row.id.clone()).await?;
            record_credits(status::now_ms(), units);
            GLOBALS.sent_log.lock().push_back(status::now_ms());
            progressed = true;
            tracing::debug!(
                "Published {} to {} relay(s)",
                row.id,
                outcome.accepted.len()
            );
        } else {
            tracing::warn!(
                "Publish of {} failed ({} rejected, {} silent); queued for retry",
                row.id,
                outcome.rejected.len(),
                outcome.timed_out
            );
            DbQueuedEvent::update_status(Queue::CacheOut, row.id.clone(), ProcStatus::Pending)
                .await?;
        }
    }

    if progressed {
        status::refresh_queue_stats().await?;
        status::broadcast_status().await;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_units_are_ceiling_of_length() {
        assert_eq!(units_for(1), 1);
        assert_eq!(units_for(1024), 1);
        assert_eq!(units_for(1025), 2);
        assert_eq!(units_for(4096), 4);
    }

    #[test]
    fn test_credit_window_trims_and_sums() {
        GLOBALS.message_units_history.lock().clear();

        let now = 1_000_000;
        record_credits(now - 70_000, 5);
        record_credits(now - 30_000, 3);
        record_credits(now, 2);

        trim_credit_window(now, 60);
        assert_eq!(used_credits(), 5); // the 70s-old entry fell out

        trim_credit_window(now + 120_000, 60);
        assert_eq!(used_credits(), 0);
    }

    #[tokio::test]
    async fn test_recover_in_flight_logs_and_demotes() {
        let _db = crate::db::test::setup();
        use crate::db::{DbQueuedEvent, ProcStatus, Queue};

        let row = DbQueuedEvent {
            id: "aa".repeat(32),
            kind: 1,
            pubkey: "bb".repeat(32),
            created_at: 1_700_000_000,
            tags: "[]".to_owned(),
            content: String::new(),
            sig: "00".repeat(64),
            proc_status: ProcStatus::InFlight.to_i64(),
            proc_at: Some(1_700_000_000),
            keep_for: None,
            table_name: None,
            record_uuid: None,
            user_profile_uuid: None,
        };
        DbQueuedEvent::enqueue(Queue::CacheOut, row).await.unwrap();

        recover_in_flight().await.unwrap();
        assert_eq!(
            DbQueuedEvent::count(Queue::CacheOut, Some(ProcStatus::Pending))
                .await
                .unwrap(),
            1
        );
    }
}
