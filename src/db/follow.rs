use crate::error::Error;
use crate::globals::GLOBALS;
use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;

/// Where a follow entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FollowSource {
    Manual,
    AdminKeypair,
    ProfileKeypair,
}

impl FollowSource {
    pub fn as_str(&self) -> &'static str {
        match *self {
            FollowSource::Manual => "manual",
            FollowSource::AdminKeypair => "admin-keypair",
            FollowSource::ProfileKeypair => "profile-keypair",
        }
    }

    pub fn from_str(s: &str) -> FollowSource {
        match s {
            "admin-keypair" => FollowSource::AdminKeypair,
            "profile-keypair" => FollowSource::ProfileKeypair,
            _ => FollowSource::Manual,
        }
    }
}

/// A followed author. The pubkey is always stored normalized
/// (lowercase hex32).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbFollow {
    pub pubkey: String,
    pub source: FollowSource,
    pub label: Option<String>,
}

impl DbFollow {
    pub async fn fetch(source: Option<FollowSource>) -> Result<Vec<DbFollow>, Error> {
        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let sql = match source {
                Some(_) => {
                    "SELECT pubkey, source, label FROM follows WHERE source=? ORDER BY pubkey ASC"
                }
                None => "SELECT pubkey, source, label FROM follows ORDER BY pubkey ASC",
            };

            let mut stmt = db.prepare(sql)?;
            let map = |row: &rusqlite::Row| {
                let source: String = row.get(1)?;
                Ok(DbFollow {
                    pubkey: row.get(0)?,
                    source: FollowSource::from_str(&source),
                    label: row.get(2)?,
                })
            };
            let mut output: Vec<DbFollow> = Vec::new();
            match source {
                Some(source) => {
                    let rows = stmt.query_map((source.as_str(),), map)?;
                    for row in rows {
                        output.push(row?);
                    }
                }
                None => {
                    let rows = stmt.query_map([], map)?;
                    for row in rows {
                        output.push(row?);
                    }
                }
            }
            Ok::<Vec<DbFollow>, Error>(output)
        })
        .await?
    }

    pub async fn upsert(follow: DbFollow) -> Result<(), Error> {
        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt = db.prepare(
                "INSERT INTO follows (pubkey, source, label) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(pubkey, source) DO UPDATE SET label=?3",
            )?;
            stmt.execute((&follow.pubkey, follow.source.as_str(), &follow.label))?;
            Ok::<(), Error>(())
        })
        .await??;

        Ok(())
    }

    pub async fn remove(pubkey: String, source: FollowSource) -> Result<(), Error> {
        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();
            db.execute(
                "DELETE FROM follows WHERE pubkey=? AND source=?",
                (&pubkey, source.as_str()),
            )?;
            Ok::<(), Error>(())
        })
        .await??;

        Ok(())
    }

    /// Replace the full set of entries for one source
    pub async fn replace_source(source: FollowSource, follows: Vec<DbFollow>) -> Result<(), Error> {
        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            db.execute("BEGIN", ())?;
            db.execute("DELETE FROM follows WHERE source=?", (source.as_str(),))?;
            {
                let mut stmt = db
                    .prepare("INSERT OR REPLACE INTO follows (pubkey, source, label) VALUES (?1, ?2, ?3)")?;
                for follow in follows.iter() {
                    stmt.execute((&follow.pubkey, source.as_str(), &follow.label))?;
                }
            }
            db.execute("COMMIT", ())?;
            Ok::<(), Error>(())
        })
        .await??;

        Ok(())
    }
}
