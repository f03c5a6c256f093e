use crate::db::{DbRating, DbRatingSummary};
use crate::error::Error;
use crate::trust::{self, TrustTier};
use nostr_types::{Event, Unixtime};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// The numeric fields of a rating payload that feed summary statistics
pub const NUMERIC_RATING_FIELDS: [&str; 12] = [
    "user_review_rating",
    "user_difficulty_rating",
    "user_skill_rating",
    "user_skill_rating_when_beat",
    "user_recommendation_rating",
    "user_importance_rating",
    "user_technical_quality_rating",
    "user_gameplay_design_rating",
    "user_originality_rating",
    "user_visual_aesthetics_rating",
    "user_story_rating",
    "user_soundtrack_graphics_rating",
];

pub const TIMESTAMP_FIELDS: [&str; 2] = ["created_at_ts", "updated_at_ts"];

/// The comment field paired with a numeric field. `_when_beat` fields
/// keep their suffix after the `_comment` marker.
pub fn comment_field_for(numeric: &str) -> String {
    match numeric.strip_suffix("_when_beat") {
        Some(stem) => format!("{}_comment_when_beat", stem),
        None => format!("{}_comment", numeric),
    }
}

/// A JSON value as a finite number, if it is one (or parses as one)
fn to_finite(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// A JSON value floored to integer seconds, if possible
fn to_timestamp(value: &Value) -> Option<i64> {
    to_finite(value).map(|f| f.floor() as i64)
}

/// Normalize a rating payload in place: numeric fields become finite
/// numbers or null, comment fields become trimmed non-empty strings or
/// null, timestamp fields become integer seconds or null. Normalizing
/// an already-normalized payload yields an equal value.
pub fn normalize_rating(rating: &Value) -> Value {
    let mut map: Map<String, Value> = match rating {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    for field in NUMERIC_RATING_FIELDS.iter() {
        if let Some(value) = map.get(*field) {
            let normalized = match (value, to_finite(value)) {
                (Value::Number(_), Some(_)) => value.clone(),
                (_, Some(f)) => serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                (_, None) => Value::Null,
            };
            map.insert((*field).to_owned(), normalized);
        }

        let comment_field = comment_field_for(field);
        if let Some(value) = map.get(&comment_field) {
            let normalized = match value {
                Value::String(s) => {
                    let trimmed = s.trim();
                    if trimmed.is_empty() {
                        Value::Null
                    } else {
                        Value::String(trimmed.to_owned())
                    }
                }
                _ => Value::Null,
            };
            map.insert(comment_field, normalized);
        }
    }

    for field in TIMESTAMP_FIELDS.iter() {
        if let Some(value) = map.get(*field) {
            let normalized = match to_timestamp(value) {
                Some(ts) => Value::Number(ts.into()),
                None => Value::Null,
            };
            map.insert((*field).to_owned(), normalized);
        }
    }

    Value::Object(map)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RatingStats {
    pub count: usize,
    pub average: f64,
    pub median: f64,
    pub stddev: f64,
}

/// Summary statistics over a non-empty value set. Median of an even
/// count is the mean of the two middle elements; stddev is population
/// (divide by n).
pub fn compute_stats(values: &[f64]) -> Option<RatingStats> {
    if values.is_empty() {
        return None;
    }

    let n = values.len();
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let average = sorted.iter().sum::<f64>() / n as f64;
    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    };
    let variance = sorted.iter().map(|v| (v - average).powi(2)).sum::<f64>() / n as f64;

    Some(RatingStats {
        count: n,
        average,
        median,
        stddev: variance.sqrt(),
    })
}

lazy_static! {
    /// Striped per-game aggregation locks, garbage-collected when
    /// uncontended
    static ref GAME_LOCKS: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>> =
        Mutex::new(HashMap::new());
}

async fn lock_game(gameid: &str) -> tokio::sync::OwnedMutexGuard<()> {
    let lock = {
        let mut map = GAME_LOCKS.lock();
        map.entry(gameid.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    };
    lock.lock_owned().await
}

fn gc_game_lock(gameid: &str) {
    let mut map = GAME_LOCKS.lock();
    if let Some(arc) = map.get(gameid) {
        if Arc::strong_count(arc) == 1 {
            map.remove(gameid);
        }
    }
}

fn string_field(object: &Value, field: &str) -> Option<String> {
    object
        .get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

fn tag_value(event: &Event, name: &str) -> Option<String> {
    event
        .tags
        .iter()
        .find(|t| t.tagname() == name)
        .map(|t| t.value().trim().to_owned())
        .filter(|s| !s.is_empty())
}

/// Ingest one kind-31001 event: normalize the payload, apply the
/// freshness rule against the stored (rater, game) row, upsert, and
/// recompute that game's summaries.
pub async fn ingest_rating(event: &Event) -> Result<(), Error> {
    let content: Value = match serde_json::from_str(&event.content) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Unparseable rating content in {}: {}", event.id.as_hex_string(), e);
            return Ok(());
        }
    };

    let gameid = match string_field(&content, "gameid").or_else(|| tag_value(event, "gameid")) {
        Some(g) => g,
        None => {
            tracing::warn!("Rating event {} has no gameid", event.id.as_hex_string());
            return Ok(());
        }
    };
    let gvuuid = string_field(&content, "gvuuid").or_else(|| tag_value(event, "gvuuid"));
    let version = content
        .get("version")
        .and_then(|v| v.as_i64())
        .or_else(|| tag_value(event, "version").and_then(|s| s.parse::<i64>().ok()))
        .unwrap_or(1);
    let status = string_field(&content, "status").unwrap_or_else(|| "Default".to_owned());
    let user_notes = string_field(&content, "user_notes");

    let rating = normalize_rating(content.get("rating").unwrap_or(&Value::Null));
    let overall_rating = rating.get("user_review_rating").and_then(to_finite);
    let difficulty_rating = rating.get("user_difficulty_rating").and_then(to_finite);
    let created_at_ts = rating.get("created_at_ts").and_then(to_timestamp);
    let updated_at_ts = rating.get("updated_at_ts").and_then(to_timestamp);

    let rater_pubkey = event.pubkey.as_hex_string();

    // One trust resolution per event, held for the whole processing
    let (trust_level, trust_tier) = trust::resolve(rater_pubkey.clone()).await?;

    // At most one aggregation per game in flight
    let guard = lock_game(&gameid).await;
    let result = aggregate(
        event,
        &rater_pubkey,
        &gameid,
        gvuuid,
        version,
        status,
        user_notes,
        rating,
        overall_rating,
        difficulty_rating,
        created_at_ts,
        updated_at_ts,
        trust_level,
        trust_tier,
    )
    .await;
    drop(guard);
    gc_game_lock(&gameid);

    result
}

#[allow(clippy::too_many_arguments)]
async fn aggregate(
    event: &Event,
    rater_pubkey: &str,
    gameid: &str,
    gvuuid: Option<String>,
    version: i64,
    status: String,
    user_notes: Option<String>,
    rating: Value,
    overall_rating: Option<f64>,
    difficulty_rating: Option<f64>,
    created_at_ts: Option<i64>,
    updated_at_ts: Option<i64>,
    trust_level: i64,
    trust_tier: TrustTier,
) -> Result<(), Error> {
    let event_id = event.id.as_hex_string();

    if let Some(existing) =
        DbRating::fetch_one(rater_pubkey.to_owned(), gameid.to_owned()).await?
    {
        if existing.published_at > event.created_at.0 {
            tracing::debug!(
                "Skipping stale rating for ({}, {}): have {}, got {}",
                rater_pubkey,
                gameid,
                existing.published_at,
                event.created_at.0
            );
            return Ok(());
        }
        if existing.event_id == event_id {
            return Ok(()); // already stored
        }
    }

    let sig = match serde_json::to_value(&event.sig)? {
        Value::String(s) => s,
        other => other.to_string(),
    };

    DbRating::upsert(DbRating {
        rater_pubkey: rater_pubkey.to_owned(),
        gameid: gameid.to_owned(),
        gvuuid,
        version,
        status,
        rating_json: serde_json::to_string(&rating)?,
        user_notes,
        overall_rating,
        difficulty_rating,
        created_at_ts,
        updated_at_ts,
        published_at: event.created_at.0,
        received_at: Unixtime::now()?.0,
        trust_level,
        trust_tier: trust_tier.as_str().to_owned(),
        event_id,
        signature: sig,
        tags_json: serde_json::to_string(&event.tags)?,
    })
    .await?;

    recompute_summaries(gameid).await
}

/// Fully recompute the per-tier per-field summaries of one game
pub async fn recompute_summaries(gameid: &str) -> Result<(), Error> {
    let rows = DbRating::fetch_for_game(gameid.to_owned()).await?;

    let parsed: Vec<(String, Value)> = rows
        .iter()
        .map(|r| {
            (
                r.trust_tier.clone(),
                serde_json::from_str(&r.rating_json).unwrap_or(Value::Null),
            )
        })
        .collect();

    let mut tiers: BTreeSet<String> = parsed.iter().map(|(tier, _)| tier.clone()).collect();
    for tier in TrustTier::all() {
        tiers.insert(tier.as_str().to_owned());
    }

    let now = Unixtime::now()?.0;
    let mut summaries: Vec<DbRatingSummary> = Vec::new();
    for tier in tiers.iter() {
        for field in NUMERIC_RATING_FIELDS.iter() {
            let values: Vec<f64> = parsed
                .iter()
                .filter(|(t, _)| t == tier)
                .filter_map(|(_, json)| json.get(*field).and_then(to_finite))
                .collect();

            if let Some(stats) = compute_stats(&values) {
                summaries.push(DbRatingSummary {
                    gameid: gameid.to_owned(),
                    rating_category: (*field).to_owned(),
                    trust_tier: tier.clone(),
                    count: stats.count as i64,
                    average: stats.average,
                    median: stats.median,
                    stddev: stats.stddev,
                    updated_at: now,
                });
            }
        }
    }

    DbRatingSummary::replace_for_game(gameid.to_owned(), summaries).await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::test::setup;
    use crate::globals::GLOBALS;
    use serde_json::json;

    const PK_HEX: &str = "ee11a5dff40c19a555f41fe42b48f00e618c91225622ae37b6c2bb67b76c4e49";

    fn rating_event(id_byte: u8, pubkey: &str, created_at: i64, content: &Value) -> Event {
        let json = json!({
            "id": format!("{:02x}", id_byte).repeat(32),
            "pubkey": pubkey,
            "created_at": created_at,
            "kind": 31001,
            "tags": [["d", format!("game-rating-{}", id_byte)]],
            "content": serde_json::to_string(content).unwrap(),
            "sig": "00".repeat(64),
        });
        serde_json::from_value(json).unwrap()
    }

    fn set_trust(pubkey: &str, level: i64) {
        let mut maybe_db = GLOBALS.db.try_lock().unwrap();
        let db = maybe_db.as_mut().unwrap();
        db.execute(
            "INSERT OR REPLACE INTO trust_declarations (pubkey, trust_level) VALUES (?1, ?2)",
            (pubkey, level),
        )
        .unwrap();
    }

    #[test]
    fn test_comment_field_names() {
        assert_eq!(
            comment_field_for("user_review_rating"),
            "user_review_rating_comment"
        );
        assert_eq!(
            comment_field_for("user_skill_rating_when_beat"),
            "user_skill_rating_comment_when_beat"
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let messy = json!({
            "user_review_rating": "4.5",
            "user_difficulty_rating": 3,
            "user_skill_rating": "not a number",
            "user_review_rating_comment": "  nice game  ",
            "user_difficulty_rating_comment": "   ",
            "created_at_ts": 1700000000.9,
            "extra_field": "left alone",
        });

        let once = normalize_rating(&messy);
        assert_eq!(once["user_review_rating"], json!(4.5));
        assert_eq!(once["user_difficulty_rating"], json!(3));
        assert_eq!(once["user_skill_rating"], Value::Null);
        assert_eq!(once["user_review_rating_comment"], json!("nice game"));
        assert_eq!(once["user_difficulty_rating_comment"], Value::Null);
        assert_eq!(once["created_at_ts"], json!(1700000000));
        assert_eq!(once["extra_field"], json!("left alone"));

        let twice = normalize_rating(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_stats_odd_and_even() {
        let odd = compute_stats(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(odd.count, 3);
        assert_eq!(odd.average, 2.0);
        assert_eq!(odd.median, 2.0);
        assert!((odd.stddev - (2.0f64 / 3.0).sqrt()).abs() < 1e-12);

        let even = compute_stats(&[4.0, 5.0]).unwrap();
        assert_eq!(even.count, 2);
        assert_eq!(even.average, 4.5);
        assert_eq!(even.median, 4.5);
        assert!((even.stddev - 0.5).abs() < 1e-12);

        assert!(compute_stats(&[]).is_none());
    }

    #[tokio::test]
    async fn test_freshness_keeps_newest() {
        let _db = setup();

        let e1 = rating_event(
            1,
            PK_HEX,
            100,
            &json!({"gameid": "G", "rating": {"user_review_rating": 3}}),
        );
        let e2 = rating_event(
            2,
            PK_HEX,
            50,
            &json!({"gameid": "G", "rating": {"user_review_rating": 5}}),
        );

        ingest_rating(&e1).await.unwrap();
        ingest_rating(&e2).await.unwrap(); // older, must be skipped

        let row = DbRating::fetch_one(PK_HEX.to_owned(), "G".to_owned())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.overall_rating, Some(3.0));
        assert_eq!(row.event_id, "01".repeat(32));
        assert_eq!(row.published_at, 100);
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent_and_ties_go_to_later_arrival() {
        let _db = setup();

        let e1 = rating_event(
            3,
            PK_HEX,
            100,
            &json!({"gameid": "G2", "rating": {"user_review_rating": 3}}),
        );
        ingest_rating(&e1).await.unwrap();
        ingest_rating(&e1).await.unwrap(); // same event again

        let rows = DbRating::fetch_for_game("G2".to_owned()).await.unwrap();
        assert_eq!(rows.len(), 1);

        // Same created_at, different event: the later arrival wins
        let e2 = rating_event(
            4,
            PK_HEX,
            100,
            &json!({"gameid": "G2", "rating": {"user_review_rating": 4}}),
        );
        ingest_rating(&e2).await.unwrap();
        let row = DbRating::fetch_one(PK_HEX.to_owned(), "G2".to_owned())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.overall_rating, Some(4.0));
        assert_eq!(row.event_id, "04".repeat(32));
    }

    #[tokio::test]
    async fn test_summaries_per_tier() {
        let _db = setup();

        // Five raters: three standard (level 10), two high (level 60).
        // Valid secp256k1 x-only pubkeys.
        let standard = [
            "ee11a5dff40c19a555f41fe42b48f00e618c91225622ae37b6c2bb67b76c4e49",
            "82341f882b6eabcd2ba7f1ef90aad961cf074af15b9ef44a09f9d2a8fbfbe6a2",
            "32e1827635450ebb3c5a7d12c1f8e7b2b514439ac10a67eef3d9fd9c5c68e245",
        ];
        let high = [
            "3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d",
            "97c70a44366a6535c145b333f973ea86dfdc2d7a99da618c40c64705ad98e322",
        ];

        for (i, pk) in standard.iter().enumerate() {
            set_trust(pk, 10);
            let e = rating_event(
                10 + i as u8,
                pk,
                100 + i as i64,
                &json!({"gameid": "G3", "rating": {"user_difficulty_rating": (i + 1) as f64}}),
            );
            ingest_rating(&e).await.unwrap();
        }
        for (i, pk) in high.iter().enumerate() {
            set_trust(pk, 60);
            let e = rating_event(
                20 + i as u8,
                pk,
                200 + i as i64,
                &json!({"gameid": "G3", "rating": {"user_difficulty_rating": (i + 4) as f64}}),
            );
            ingest_rating(&e).await.unwrap();
        }

        let summaries = DbRatingSummary::fetch_for_game("G3".to_owned())
            .await
            .unwrap();

        let std_summary = summaries
            .iter()
            .find(|s| s.rating_category == "user_difficulty_rating" && s.trust_tier == "standard")
            .unwrap();
        assert_eq!(std_summary.count, 3);
        assert_eq!(std_summary.average, 2.0);
        assert_eq!(std_summary.median, 2.0);
        assert!((std_summary.stddev - (2.0f64 / 3.0).sqrt()).abs() < 1e-12);

        let high_summary = summaries
            .iter()
            .find(|s| s.rating_category == "user_difficulty_rating" && s.trust_tier == "high")
            .unwrap();
        assert_eq!(high_summary.count, 2);
        assert_eq!(high_summary.average, 4.5);
        assert_eq!(high_summary.median, 4.5);
        assert!((high_summary.stddev - 0.5).abs() < 1e-12);

        // No summary rows for fields nobody rated
        assert!(summaries
            .iter()
            .all(|s| s.rating_category == "user_difficulty_rating"));
    }
}
