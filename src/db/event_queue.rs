use crate::error::Error;
use crate::globals::GLOBALS;
use nostr_types::{Event, Unixtime};
use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;

/// The four logical partitions of the raw-events table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    CacheIn,
    CacheOut,
    StoreIn,
    StoreOut,
}

impl Queue {
    pub fn as_str(&self) -> &'static str {
        match *self {
            Queue::CacheIn => "cache_in",
            Queue::CacheOut => "cache_out",
            Queue::StoreIn => "store_in",
            Queue::StoreOut => "store_out",
        }
    }
}

impl std::fmt::Display for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Processing state of a queued event row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl ProcStatus {
    pub fn to_i64(&self) -> i64 {
        match *self {
            ProcStatus::Pending => 0,
            ProcStatus::InFlight => 1,
            ProcStatus::Done => 2,
            ProcStatus::Failed => -1,
        }
    }

    pub fn from_i64(i: i64) -> Option<ProcStatus> {
        match i {
            0 => Some(ProcStatus::Pending),
            1 => Some(ProcStatus::InFlight),
            2 => Some(ProcStatus::Done),
            -1 => Some(ProcStatus::Failed),
            _ => None,
        }
    }
}

/// A raw event row. The same shape is used in all four queues; the
/// queue name itself is passed alongside, never stored in the struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbQueuedEvent {
    pub id: String,
    pub kind: u32,
    pub pubkey: String,
    pub created_at: i64,
    pub tags: String,
    pub content: String,
    pub sig: String,
    pub proc_status: i64,
    pub proc_at: Option<i64>,
    pub keep_for: Option<i64>,
    pub table_name: Option<String>,
    pub record_uuid: Option<String>,
    pub user_profile_uuid: Option<String>,
}

/// The subset of row fields exposed in queue snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRowProjection {
    pub id: String,
    pub kind: u32,
    pub pubkey: String,
    pub created_at: i64,
    pub proc_status: i64,
    pub proc_at: Option<i64>,
    pub table_name: Option<String>,
    pub record_uuid: Option<String>,
}

const COLUMNS: &str = "id, kind, pubkey, created_at, tags, content, sig, \
                       proc_status, proc_at, keep_for, table_name, record_uuid, user_profile_uuid";

impl DbQueuedEvent {
    pub fn from_event(
        event: &Event,
        status: ProcStatus,
        keep_for: Option<i64>,
        table_name: Option<String>,
        record_uuid: Option<String>,
        user_profile_uuid: Option<String>,
    ) -> Result<DbQueuedEvent, Error> {
        // The signature serializes as a bare hex string
        let sig = match serde_json::to_value(&event.sig)? {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };

        Ok(DbQueuedEvent {
            id: event.id.as_hex_string(),
            kind: u32::from(event.kind),
            pubkey: event.pubkey.as_hex_string(),
            created_at: event.created_at.0,
            tags: serde_json::to_string(&event.tags)?,
            content: event.content.clone(),
            sig,
            proc_status: status.to_i64(),
            proc_at: None,
            keep_for,
            table_name,
            record_uuid,
            user_profile_uuid,
        })
    }

    /// Reconstruct the wire event from the dissected columns.
    /// Fails if the signature column is empty or malformed.
    pub fn to_event(&self) -> Result<Event, Error> {
        let value = serde_json::json!({
            "id": self.id,
            "kind": self.kind,
            "pubkey": self.pubkey,
            "created_at": self.created_at,
            "tags": serde_json::from_str::<serde_json::Value>(&self.tags)?,
            "content": self.content,
            "sig": self.sig,
        });
        Ok(serde_json::from_value(value)?)
    }

    fn from_row(row: &rusqlite::Row) -> Result<DbQueuedEvent, rusqlite::Error> {
        Ok(DbQueuedEvent {
            id: row.get(0)?,
            kind: row.get(1)?,
            pubkey: row.get(2)?,
            created_at: row.get(3)?,
            tags: row.get(4)?,
            content: row.get(5)?,
            sig: row.get(6)?,
            proc_status: row.get(7)?,
            proc_at: row.get(8)?,
            keep_for: row.get(9)?,
            table_name: row.get(10)?,
            record_uuid: row.get(11)?,
            user_profile_uuid: row.get(12)?,
        })
    }

    /// Insert a row. Inserts are idempotent on (queue, id): a re-insert
    /// of an id already present returns Ok(false) without error.
    pub async fn enqueue(queue: Queue, event: DbQueuedEvent) -> Result<bool, Error> {
        let sql = format!(
            "INSERT OR IGNORE INTO event_queue (queue, {}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            COLUMNS
        );

        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt = db.prepare(&sql)?;
            let n = stmt.execute((
                queue.as_str(),
                &event.id,
                &event.kind,
                &event.pubkey,
                &event.created_at,
                &event.tags,
                &event.content,
                &event.sig,
                &event.proc_status,
                &event.proc_at,
                &event.keep_for,
                &event.table_name,
                &event.record_uuid,
                &event.user_profile_uuid,
            ))?;
            Ok::<bool, Error>(n > 0)
        })
        .await?
    }

    /// Transition a row's processing status, stamping proc_at
    pub async fn update_status(queue: Queue, id: String, status: ProcStatus) -> Result<(), Error> {
        let now = Unixtime::now()?.0;
        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt =
                db.prepare("UPDATE event_queue SET proc_status=?, proc_at=? WHERE queue=? AND id=?")?;
            stmt.execute((status.to_i64(), now, queue.as_str(), &id))?;
            Ok::<(), Error>(())
        })
        .await??;

        Ok(())
    }

    /// Move a row between queues. A single UPDATE of the queue column,
    /// so the delete+insert is atomic and the row can never be lost or
    /// duplicated. Returns false if the source row was not there.
    pub async fn move_queue(src: Queue, dst: Queue, id: String) -> Result<bool, Error> {
        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt = db.prepare("UPDATE event_queue SET queue=? WHERE queue=? AND id=?")?;
            let n = stmt.execute((dst.as_str(), src.as_str(), &id))?;
            Ok::<bool, Error>(n > 0)
        })
        .await?
    }

    /// Rows in the given status, oldest insertion first
    pub async fn list_by_status(
        queue: Queue,
        status: ProcStatus,
        limit: usize,
    ) -> Result<Vec<DbQueuedEvent>, Error> {
        let sql = format!(
            "SELECT {} FROM event_queue WHERE queue=? AND proc_status=? \
             ORDER BY rowid ASC LIMIT ?",
            COLUMNS
        );

        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt = db.prepare(&sql)?;
            let rows = stmt.query_map(
                (queue.as_str(), status.to_i64(), limit),
                DbQueuedEvent::from_row,
            )?;

            let mut output: Vec<DbQueuedEvent> = Vec::new();
            for row in rows {
                output.push(row?);
            }
            Ok::<Vec<DbQueuedEvent>, Error>(output)
        })
        .await?
    }

    pub async fn count(queue: Queue, status: Option<ProcStatus>) -> Result<u64, Error> {
        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let count: u64 = match status {
                Some(status) => db.query_row(
                    "SELECT COUNT(*) FROM event_queue WHERE queue=? AND proc_status=?",
                    (queue.as_str(), status.to_i64()),
                    |row| row.get(0),
                )?,
                None => db.query_row(
                    "SELECT COUNT(*) FROM event_queue WHERE queue=?",
                    (queue.as_str(),),
                    |row| row.get(0),
                )?,
            };
            Ok::<u64, Error>(count)
        })
        .await?
    }

    /// Most recent rows first, projected for snapshots
    pub async fn fetch_page(
        queue: Queue,
        status: Option<ProcStatus>,
        limit: usize,
    ) -> Result<Vec<QueueRowProjection>, Error> {
        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let sql = match status {
                Some(_) => {
                    "SELECT id, kind, pubkey, created_at, proc_status, proc_at, table_name, record_uuid \
                     FROM event_queue WHERE queue=?1 AND proc_status=?2 ORDER BY rowid DESC LIMIT ?3"
                }
                None => {
                    "SELECT id, kind, pubkey, created_at, proc_status, proc_at, table_name, record_uuid \
                     FROM event_queue WHERE queue=?1 ORDER BY rowid DESC LIMIT ?2"
                }
            };

            let mut stmt = db.prepare(sql)?;
            let map = |row: &rusqlite::Row| {
                Ok(QueueRowProjection {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    pubkey: row.get(2)?,
                    created_at: row.get(3)?,
                    proc_status: row.get(4)?,
                    proc_at: row.get(5)?,
                    table_name: row.get(6)?,
                    record_uuid: row.get(7)?,
                })
            };
            let mut output: Vec<QueueRowProjection> = Vec::new();
            match status {
                Some(status) => {
                    let rows = stmt.query_map((queue.as_str(), status.to_i64(), limit), map)?;
                    for row in rows {
                        output.push(row?);
                    }
                }
                None => {
                    let rows = stmt.query_map((queue.as_str(), limit), map)?;
                    for row in rows {
                        output.push(row?);
                    }
                }
            }
            Ok::<Vec<QueueRowProjection>, Error>(output)
        })
        .await?
    }

    /// Demote cache_out rows stuck in-flight (e.g. across a crash) whose
    /// last transition is older than the threshold back to pending.
    pub async fn recovery_sweep(threshold_secs: i64) -> Result<usize, Error> {
        let cutoff = Unixtime::now()?.0 - threshold_secs;
        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt = db.prepare(
                "UPDATE event_queue SET proc_status=0 \
                 WHERE queue='cache_out' AND proc_status=1 \
                 AND (proc_at IS NULL OR proc_at < ?)",
            )?;
            let n = stmt.execute((cutoff,))?;
            Ok::<usize, Error>(n)
        })
        .await?
    }

    /// Delete rows whose retention hint has expired. Rows still moving
    /// through the outgoing state machine are never touched.
    pub async fn retention_sweep(now: i64) -> Result<usize, Error> {
        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt = db.prepare(
                "DELETE FROM event_queue \
                 WHERE keep_for IS NOT NULL AND created_at + keep_for < ? \
                 AND NOT (queue='cache_out' AND proc_status IN (0, 1))",
            )?;
            let n = stmt.execute((now,))?;
            Ok::<usize, Error>(n)
        })
        .await?
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::test::setup;

    fn row(id: &str) -> DbQueuedEvent {
        DbQueuedEvent {
            id: id.to_owned(),
            kind: 31001,
            pubkey: "ee".repeat(32),
            created_at: 1_700_000_000,
            tags: "[]".to_owned(),
            content: "{}".to_owned(),
            sig: "00".repeat(64),
            proc_status: ProcStatus::Pending.to_i64(),
            proc_at: None,
            keep_for: Some(86400),
            table_name: Some("user_game_annotations".to_owned()),
            record_uuid: None,
            user_profile_uuid: None,
        }
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let _db = setup();

        assert!(DbQueuedEvent::enqueue(Queue::CacheIn, row("a1"))
            .await
            .unwrap());
        assert!(!DbQueuedEvent::enqueue(Queue::CacheIn, row("a1"))
            .await
            .unwrap());
        assert_eq!(DbQueuedEvent::count(Queue::CacheIn, None).await.unwrap(), 1);

        // The same id may exist in a different queue
        assert!(DbQueuedEvent::enqueue(Queue::CacheOut, row("a1"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_move_conserves_rows() {
        let _db = setup();

        DbQueuedEvent::enqueue(Queue::CacheOut, row("m1")).await.unwrap();
        assert!(
            DbQueuedEvent::move_queue(Queue::CacheOut, Queue::StoreOut, "m1".to_owned())
                .await
                .unwrap()
        );

        assert_eq!(
            DbQueuedEvent::count(Queue::CacheOut, None).await.unwrap(),
            0
        );
        assert_eq!(
            DbQueuedEvent::count(Queue::StoreOut, None).await.unwrap(),
            1
        );

        // Moving a row that is not there reports false
        assert!(
            !DbQueuedEvent::move_queue(Queue::CacheOut, Queue::StoreOut, "m1".to_owned())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_update_status_stamps_proc_at() {
        let _db = setup();

        DbQueuedEvent::enqueue(Queue::CacheOut, row("s1")).await.unwrap();
        DbQueuedEvent::update_status(Queue::CacheOut, "s1".to_owned(), ProcStatus::InFlight)
            .await
            .unwrap();

        let rows = DbQueuedEvent::list_by_status(Queue::CacheOut, ProcStatus::InFlight, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].proc_at.is_some());
    }

    #[tokio::test]
    async fn test_list_by_status_is_fifo() {
        let _db = setup();

        for id in ["f1", "f2", "f3"] {
            DbQueuedEvent::enqueue(Queue::CacheOut, row(id)).await.unwrap();
        }
        let rows = DbQueuedEvent::list_by_status(Queue::CacheOut, ProcStatus::Pending, 2)
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["f1", "f2"]);
    }

    #[tokio::test]
    async fn test_recovery_sweep_demotes_stale_inflight() {
        let _db = setup();

        let mut stale = row("r1");
        stale.proc_status = ProcStatus::InFlight.to_i64();
        stale.proc_at = Some(1_700_000_000); // long ago
        DbQueuedEvent::enqueue(Queue::CacheOut, stale).await.unwrap();

        let n = DbQueuedEvent::recovery_sweep(300).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            DbQueuedEvent::count(Queue::CacheOut, Some(ProcStatus::Pending))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_event_round_trip_through_columns() {
        let json = format!(
            r#"{{"id":"{}","pubkey":"{}","created_at":1700000000,"kind":31001,"tags":[["d","game-1"]],"content":"hello","sig":"{}"}}"#,
            "ab".repeat(32),
            "ee11a5dff40c19a555f41fe42b48f00e618c91225622ae37b6c2bb67b76c4e49",
            "0f".repeat(64),
        );
        let event: Event = serde_json::from_str(&json).unwrap();
        let row = DbQueuedEvent::from_event(&event, ProcStatus::Pending, None, None, None, None)
            .unwrap();
        assert_eq!(row.id, "ab".repeat(32));
        assert_eq!(row.kind, 31001);
        assert_eq!(row.sig, "0f".repeat(64));

        let back = row.to_event().unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.content, "hello");
    }
}
