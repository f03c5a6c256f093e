use crate::error::Error;
use crate::globals::GLOBALS;
use tokio::task::spawn_blocking;

pub struct DbSetting;

impl DbSetting {
    pub async fn fetch_setting_string(key: &'static str) -> Result<Option<String>, Error> {
        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt = db.prepare("SELECT value FROM settings WHERE key=?")?;
            let mut rows = stmt.query((key,))?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get(0)?)),
                None => Ok(None),
            }
        })
        .await?
    }

    pub async fn fetch_setting_u64_or_default(
        key: &'static str,
        default: u64,
    ) -> Result<u64, Error> {
        match DbSetting::fetch_setting_string(key).await? {
            Some(s) => Ok(s.parse::<u64>()?),
            None => Ok(default),
        }
    }

    pub async fn update(key: &'static str, value: impl ToString) -> Result<(), Error> {
        DbSetting::update_string(key, value.to_string()).await
    }

    pub async fn update_string(key: &'static str, value: String) -> Result<(), Error> {
        spawn_blocking(move || {
            let maybe_db = GLOBALS.db.blocking_lock();
            let db = maybe_db.as_ref().unwrap();

            let mut stmt = db.prepare(
                "INSERT INTO settings (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value=?2",
            )?;
            stmt.execute((key, &value))?;
            Ok::<(), Error>(())
        })
        .await??;

        Ok(())
    }
}
