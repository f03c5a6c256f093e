use crate::db::DbSetting;
use crate::error::Error;
use crate::globals::GLOBALS;
use nostr_types::RelayUrl;
use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;

/// Relays we seed on first run (and whenever the active set would
/// otherwise be empty)
pub const DEFAULT_RELAYS: [&str; 4] = [
    "wss://relay.damus.io/",
    "wss://nos.lol/",
    "wss://relay.snort.social/",
    "wss://offchain.pub/",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayAddedBy {
    System,
    User,
    AdminPublished,
}

impl RelayAddedBy {
    pub fn as_str(&self) -> &'static str {
        match *self {
            RelayAddedBy::System => "system",
            RelayAddedBy::User => "user",
            RelayAddedBy::AdminPublished => "admin-published",
        }
    }

    pub fn from_str(s: &str) -> RelayAddedBy {
        match s {
            "system" => RelayAddedBy::System,
            "admin-published" => RelayAddedBy::AdminPublished,
            _ => RelayAddedBy::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbRelay {
    pub url: String,
    pub label: Option<String>,
    pub categories: Vec<String>,
    pub priority: i64,
    pub auth_required: bool,
    pub read: bool,
    pub write: bool,
    pub added_by: RelayAddedBy,
    pub health_score: f64,
    pub last_success: Option<i64>,
    pub last_failure: Option<i64>,
    pub consecutive_failures: i64,
}

/// Fields of a relay record that the update command may change
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayPatch {
    pub label: Option<String>,
    pub categories: Option<Vec<String>>,
    pub priority: Option<i64>,
    pub auth_required: Option<bool>,
    pub read: Option<bool>,
    pub write: Option<bool>,
}

impl DbRelay {
    pub fn new(url: &str) -> Result<DbRelay, Error> {
        Ok(DbRelay {
            url: DbRelay::canonicalize(url)?,
            label: None,
            categories: Vec::new(),
            priority: 3,
            auth_required: false,
            read: true,
            write: true,
            added_by: RelayAddedBy::User,
            health_score: 0.5,
            last_success: None,
            last_failure: None,
            consecutive_failures: 0,
        })
    }

    /// Trim and canonicalize a relay URL. All registry rows are keyed
    /// by this form.
    pub fn canonicalize(url: &str) -> Result<String, Error> {
        let relay_url = RelayUrl::try_from_str(url.trim())
            .map_err(|_| Error::InvalidRelayUrl(url.to_owned()))?;
        Ok(relay_url.as_str().to_owned())
    }

    fn from_row(row: &rusqlite::Row) -> Result<DbRelay, rusqlite::Error> {
        let categories: String = row.get(2)?;
        let added_by: String = row.get(7)?;
        Ok(DbRelay {
            url: row.get(0)?,
            label: row.get(1)?,
            categories: serde_json::from_str(&categories).unwrap_or_default(),
            priority: row.get(3)?,
            auth_required: row.get::<usize, u32>(4)? > 0,
            read: row.get::<usize, u32>(5)? > 0,
            write: row.get::<usize, u32>(6)? > 0,
            added_by: RelayAddedBy::from_str(&added_by),
            health_score: row.get(8)?,
            last_success: row.get(9)?,
            last_failure: row.get(10)?,
            consecutive_failures: row.get(11)?,
        })
    }

    const COLUMNS: &'static str =
        "url, label, categories, priority, auth_required, can_read, can_write, \
         added_by, health_score, last_success, last_failure, consecutive_failures";

    /// All relays, optionally restricted to a category
    pub async fn fetch(category: Option<String>) -> Result<Vec<DbRelay>, Error> {
        let sql = format!("SELECT {} FROM relays ORDER BY url ASC", DbRelay::COLUMNS);

        let mut relays: Vec<DbRelay> = spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt = db.prepare(&sql)?;
            let rows = stmt.query_map([], DbRelay::from_row)?;
            let mut output: Vec<DbRelay> = Vec::new();
            for row in rows {
                output.push(row?);
            }
            Ok::<Vec<DbRelay>, Error>(output)
        })
        .await??;

        if let Some(cat) = category {
            relays.retain(|r| r.categories.iter().any(|c| *c == cat));
        }

        Ok(relays)
    }

    pub async fn fetch_one(url: &str) -> Result<Option<DbRelay>, Error> {
        let url = DbRelay::canonicalize(url)?;
        let sql = format!("SELECT {} FROM relays WHERE url=?", DbRelay::COLUMNS);

        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt = db.prepare(&sql)?;
            let mut rows = stmt.query((&url,))?;
            match rows.next()? {
                Some(row) => Ok(Some(DbRelay::from_row(row)?)),
                None => Ok(None),
            }
        })
        .await?
    }

    /// Insert or update a relay. Health counters of an existing row with
    /// the same URL are preserved.
    pub async fn upsert(relay: DbRelay) -> Result<(), Error> {
        let categories = serde_json::to_string(&relay.categories)?;

        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt = db.prepare(
                "INSERT INTO relays (url, label, categories, priority, auth_required, \
                                     can_read, can_write, added_by, health_score, \
                                     last_success, last_failure, consecutive_failures) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                 ON CONFLICT(url) DO UPDATE SET \
                   label=?2, categories=?3, priority=?4, auth_required=?5, \
                   can_read=?6, can_write=?7, added_by=?8",
            )?;
            stmt.execute((
                &relay.url,
                &relay.label,
                &categories,
                &relay.priority,
                relay.auth_required as u32,
                relay.read as u32,
                relay.write as u32,
                relay.added_by.as_str(),
                &relay.health_score,
                &relay.last_success,
                &relay.last_failure,
                &relay.consecutive_failures,
            ))?;
            Ok::<(), Error>(())
        })
        .await??;

        Ok(())
    }

    pub async fn update(url: &str, patch: RelayPatch) -> Result<(), Error> {
        let mut relay = match DbRelay::fetch_one(url).await? {
            Some(relay) => relay,
            None => return Err(Error::InvalidRelayUrl(url.to_owned())),
        };

        if let Some(label) = patch.label {
            relay.label = Some(label);
        }
        if let Some(categories) = patch.categories {
            let mut categories = categories;
            categories.sort();
            categories.dedup();
            relay.categories = categories;
        }
        if let Some(priority) = patch.priority {
            relay.priority = priority;
        }
        if let Some(auth_required) = patch.auth_required {
            relay.auth_required = auth_required;
        }
        if let Some(read) = patch.read {
            relay.read = read;
        }
        if let Some(write) = patch.write {
            relay.write = write;
        }

        DbRelay::upsert(relay).await
    }

    /// Remove a relay. Rows the system seeded refuse removal unless
    /// forced.
    pub async fn remove(url: &str, force: bool) -> Result<(), Error> {
        let url = DbRelay::canonicalize(url)?;

        if !force {
            if let Some(existing) = DbRelay::fetch_one(&url).await? {
                if existing.added_by == RelayAddedBy::System {
                    return Err(Error::RelayIsProtected);
                }
            }
        }

        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();
            db.execute("DELETE FROM relays WHERE url=?", (&url,))?;
            Ok::<(), Error>(())
        })
        .await??;

        Ok(())
    }

    /// Seed the default relay set (idempotent)
    pub async fn ensure_defaults() -> Result<(), Error> {
        for url in DEFAULT_RELAYS.iter() {
            if DbRelay::fetch_one(url).await?.is_none() {
                let mut relay = DbRelay::new(url)?;
                relay.added_by = RelayAddedBy::System;
                relay.categories = vec!["general".to_owned()];
                DbRelay::upsert(relay).await?;
            }
        }
        Ok(())
    }

    pub async fn get_category_preference() -> Result<Vec<String>, Error> {
        match DbSetting::fetch_setting_string("relay_categories").await? {
            Some(s) => Ok(serde_json::from_str(&s).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    pub async fn set_category_preference(categories: Vec<String>) -> Result<(), Error> {
        let mut categories = categories;
        categories.sort();
        categories.dedup();
        DbSetting::update_string("relay_categories", serde_json::to_string(&categories)?).await
    }

    /// The set of relays currently eligible for connection: readable,
    /// intersecting the category preference (an empty preference means
    /// all), deduplicated by canonical URL, ordered by
    /// (priority DESC, url ASC). Seeds defaults when the result would
    /// be empty.
    pub async fn select_active() -> Result<Vec<RelayUrl>, Error> {
        for attempt in 0..2 {
            let preference = DbRelay::get_category_preference().await?;
            let mut relays = DbRelay::fetch(None).await?;
            relays.retain(|r| {
                r.read
                    && (preference.is_empty()
                        || r.categories.iter().any(|c| preference.contains(c)))
            });
            relays.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.url.cmp(&b.url)));

            let mut output: Vec<RelayUrl> = Vec::new();
            for relay in relays.iter() {
                if let Ok(url) = RelayUrl::try_from_str(&relay.url) {
                    if !output.contains(&url) {
                        output.push(url);
                    }
                }
            }

            if !output.is_empty() {
                return Ok(output);
            }

            if attempt == 0 {
                tracing::info!("No eligible relays; seeding defaults");
                DbRelay::ensure_defaults().await?;
            }
        }

        Ok(Vec::new())
    }

    /// This also resets consecutive_failures
    pub async fn update_success(url: String, last_success: i64) -> Result<(), Error> {
        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt = db.prepare(
                "UPDATE relays SET health_score = health_score * 0.75 + 0.25, \
                 last_success=?, consecutive_failures=0 WHERE url=?",
            )?;
            stmt.execute((&last_success, &url))?;
            Ok::<(), Error>(())
        })
        .await??;

        Ok(())
    }

    pub async fn update_failure(url: String, last_failure: i64) -> Result<(), Error> {
        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt = db.prepare(
                "UPDATE relays SET health_score = health_score * 0.75, \
                 last_failure=?, consecutive_failures = consecutive_failures + 1 WHERE url=?",
            )?;
            stmt.execute((&last_failure, &url))?;
            Ok::<(), Error>(())
        })
        .await??;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::test::setup;

    #[tokio::test]
    async fn test_select_active_filters_and_orders() {
        let _db = setup();

        let mut a = DbRelay::new("wss://a.example.com").unwrap();
        a.priority = 1;
        a.categories = vec!["general".to_owned()];
        let mut b = DbRelay::new("wss://b.example.com").unwrap();
        b.priority = 9;
        b.categories = vec!["general".to_owned()];
        let mut c = DbRelay::new("wss://c.example.com").unwrap();
        c.priority = 9;
        c.categories = vec!["mirror".to_owned()];
        let mut d = DbRelay::new("wss://d.example.com").unwrap();
        d.read = false;
        d.categories = vec!["general".to_owned()];

        for relay in [a, b, c, d] {
            DbRelay::upsert(relay).await.unwrap();
        }

        let active = DbRelay::select_active().await.unwrap();
        let urls: Vec<&str> = active.iter().map(|u| u.as_str()).collect();
        assert_eq!(
            urls,
            [
                "wss://b.example.com/",
                "wss://c.example.com/",
                "wss://a.example.com/"
            ]
        );

        // Restricting the category preference excludes the mirror
        DbRelay::set_category_preference(vec!["general".to_owned()])
            .await
            .unwrap();
        let active = DbRelay::select_active().await.unwrap();
        let urls: Vec<&str> = active.iter().map(|u| u.as_str()).collect();
        assert_eq!(urls, ["wss://b.example.com/", "wss://a.example.com/"]);
    }

    #[tokio::test]
    async fn test_select_active_seeds_defaults_when_empty() {
        let _db = setup();

        let active = DbRelay::select_active().await.unwrap();
        assert_eq!(active.len(), DEFAULT_RELAYS.len());
    }

    #[tokio::test]
    async fn test_remove_refuses_system_rows() {
        let _db = setup();

        let mut relay = DbRelay::new("wss://seed.example.com").unwrap();
        relay.added_by = RelayAddedBy::System;
        DbRelay::upsert(relay).await.unwrap();

        assert!(matches!(
            DbRelay::remove("wss://seed.example.com", false).await,
            Err(Error::RelayIsProtected)
        ));
        DbRelay::remove("wss://seed.example.com", true).await.unwrap();
        assert!(DbRelay::fetch_one("wss://seed.example.com")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_upsert_preserves_health_counters() {
        let _db = setup();

        let relay = DbRelay::new("wss://h.example.com").unwrap();
        DbRelay::upsert(relay.clone()).await.unwrap();
        DbRelay::update_failure(relay.url.clone(), 100).await.unwrap();
        DbRelay::update_failure(relay.url.clone(), 200).await.unwrap();

        // Re-upsert with changed metadata
        let mut replacement = DbRelay::new("wss://h.example.com").unwrap();
        replacement.label = Some("house".to_owned());
        DbRelay::upsert(replacement).await.unwrap();

        let stored = DbRelay::fetch_one("wss://h.example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.label.as_deref(), Some("house"));
        assert_eq!(stored.consecutive_failures, 2);
        assert_eq!(stored.last_failure, Some(200));

        DbRelay::update_success(stored.url.clone(), 300).await.unwrap();
        let stored = DbRelay::fetch_one("wss://h.example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.consecutive_failures, 0);
        assert_eq!(stored.last_success, Some(300));
    }
}
