use crate::error::Error;
use crate::globals::GLOBALS;
use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;

/// Projection of the most recent authoritative kind-31001 event per
/// (rater, game)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbRating {
    pub rater_pubkey: String,
    pub gameid: String,
    pub gvuuid: Option<String>,
    pub version: i64,
    pub status: String,
    pub rating_json: String,
    pub user_notes: Option<String>,
    pub overall_rating: Option<f64>,
    pub difficulty_rating: Option<f64>,
    pub created_at_ts: Option<i64>,
    pub updated_at_ts: Option<i64>,
    pub published_at: i64,
    pub received_at: i64,
    pub trust_level: i64,
    pub trust_tier: String,
    pub event_id: String,
    pub signature: String,
    pub tags_json: String,
}

const RATING_COLUMNS: &str =
    "rater_pubkey, gameid, gvuuid, version, status, rating_json, user_notes, \
     overall_rating, difficulty_rating, created_at_ts, updated_at_ts, \
     published_at, received_at, trust_level, trust_tier, event_id, signature, tags_json";

impl DbRating {
    fn from_row(row: &rusqlite::Row) -> Result<DbRating, rusqlite::Error> {
        Ok(DbRating {
            rater_pubkey: row.get(0)?,
            gameid: row.get(1)?,
            gvuuid: row.get(2)?,
            version: row.get(3)?,
            status: row.get(4)?,
            rating_json: row.get(5)?,
            user_notes: row.get(6)?,
            overall_rating: row.get(7)?,
            difficulty_rating: row.get(8)?,
            created_at_ts: row.get(9)?,
            updated_at_ts: row.get(10)?,
            published_at: row.get(11)?,
            received_at: row.get(12)?,
            trust_level: row.get(13)?,
            trust_tier: row.get(14)?,
            event_id: row.get(15)?,
            signature: row.get(16)?,
            tags_json: row.get(17)?,
        })
    }

    pub async fn fetch_one(
        rater_pubkey: String,
        gameid: String,
    ) -> Result<Option<DbRating>, Error> {
        let sql = format!(
            "SELECT {} FROM ratings WHERE rater_pubkey=? AND gameid=?",
            RATING_COLUMNS
        );

        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt = db.prepare(&sql)?;
            let mut rows = stmt.query((&rater_pubkey, &gameid))?;
            match rows.next()? {
                Some(row) => Ok(Some(DbRating::from_row(row)?)),
                None => Ok(None),
            }
        })
        .await?
    }

    pub async fn fetch_for_game(gameid: String) -> Result<Vec<DbRating>, Error> {
        let sql = format!(
            "SELECT {} FROM ratings WHERE gameid=? ORDER BY rater_pubkey ASC",
            RATING_COLUMNS
        );

        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt = db.prepare(&sql)?;
            let rows = stmt.query_map((&gameid,), DbRating::from_row)?;
            let mut output: Vec<DbRating> = Vec::new();
            for row in rows {
                output.push(row?);
            }
            Ok::<Vec<DbRating>, Error>(output)
        })
        .await?
    }

    pub async fn upsert(rating: DbRating) -> Result<(), Error> {
        let sql = format!(
            "INSERT OR REPLACE INTO ratings ({}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            RATING_COLUMNS
        );

        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt = db.prepare(&sql)?;
            stmt.execute((
                &rating.rater_pubkey,
                &rating.gameid,
                &rating.gvuuid,
                &rating.version,
                &rating.status,
                &rating.rating_json,
                &rating.user_notes,
                &rating.overall_rating,
                &rating.difficulty_rating,
                &rating.created_at_ts,
                &rating.updated_at_ts,
                &rating.published_at,
                &rating.received_at,
                &rating.trust_level,
                &rating.trust_tier,
                &rating.event_id,
                &rating.signature,
                &rating.tags_json,
            ))?;
            Ok::<(), Error>(())
        })
        .await??;

        Ok(())
    }
}

/// Per-(game, numeric field, trust tier) summary statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbRatingSummary {
    pub gameid: String,
    pub rating_category: String,
    pub trust_tier: String,
    pub count: i64,
    pub average: f64,
    pub median: f64,
    pub stddev: f64,
    pub updated_at: i64,
}

impl DbRatingSummary {
    /// Atomically replace all summary rows for a game. Tuples with no
    /// finite values simply do not reappear.
    pub async fn replace_for_game(
        gameid: String,
        summaries: Vec<DbRatingSummary>,
    ) -> Result<(), Error> {
        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            db.execute("BEGIN", ())?;
            db.execute("DELETE FROM rating_summaries WHERE gameid=?", (&gameid,))?;
            {
                let mut stmt = db.prepare(
                    "INSERT INTO rating_summaries \
                     (gameid, rating_category, trust_tier, count, average, median, stddev, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for s in summaries.iter() {
                    stmt.execute((
                        &s.gameid,
                        &s.rating_category,
                        &s.trust_tier,
                        &s.count,
                        &s.average,
                        &s.median,
                        &s.stddev,
                        &s.updated_at,
                    ))?;
                }
            }
            db.execute("COMMIT", ())?;
            Ok::<(), Error>(())
        })
        .await??;

        Ok(())
    }

    pub async fn fetch_for_game(gameid: String) -> Result<Vec<DbRatingSummary>, Error> {
        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt = db.prepare(
                "SELECT gameid, rating_category, trust_tier, count, average, median, stddev, updated_at \
                 FROM rating_summaries WHERE gameid=? \
                 ORDER BY rating_category ASC, trust_tier ASC",
            )?;
            let rows = stmt.query_map((&gameid,), |row| {
                Ok(DbRatingSummary {
                    gameid: row.get(0)?,
                    rating_category: row.get(1)?,
                    trust_tier: row.get(2)?,
                    count: row.get(3)?,
                    average: row.get(4)?,
                    median: row.get(5)?,
                    stddev: row.get(6)?,
                    updated_at: row.get(7)?,
                })
            })?;
            let mut output: Vec<DbRatingSummary> = Vec::new();
            for row in rows {
                output.push(row?);
            }
            Ok::<Vec<DbRatingSummary>, Error>(output)
        })
        .await?
    }
}
