mod event_queue;
pub use event_queue::{DbQueuedEvent, ProcStatus, Queue, QueueRowProjection};

mod follow;
pub use follow::{DbFollow, FollowSource};

mod rating;
pub use rating::{DbRating, DbRatingSummary};

mod relay;
pub use relay::{DbRelay, RelayAddedBy, RelayPatch};

mod setting;
pub use setting::DbSetting;

use crate::error::Error;
use crate::globals::GLOBALS;
use rusqlite::Connection;
use std::fs;

// This sets up the database
#[allow(clippy::or_fun_call)]
pub fn setup_database() -> Result<(), Error> {
    let mut data_dir = dirs::data_dir()
        .ok_or::<Error>("Cannot find a directory to store application data.".into())?;
    data_dir.push("grapevine");

    // Create our data directory only if it doesn't exist
    fs::create_dir_all(&data_dir)?;

    // Connect to (or create) our database
    let mut db_path = data_dir.clone();
    db_path.push("grapevine.sqlite");
    let connection = Connection::open_with_flags(
        &db_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
            | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX
            | rusqlite::OpenFlags::SQLITE_OPEN_NOFOLLOW,
    )?;

    // Turn on foreign keys
    connection.execute("PRAGMA foreign_keys = ON", ())?;

    // Save the connection globally
    {
        let mut db = GLOBALS.db.blocking_lock();
        *db = Some(connection);
    }

    // Check and upgrade our data schema
    check_and_upgrade()?;

    Ok(())
}

fn check_and_upgrade() -> Result<(), Error> {
    let maybe_db = GLOBALS.db.blocking_lock();
    let db = maybe_db.as_ref().unwrap();

    match db.query_row(
        "SELECT schema_version FROM local_settings LIMIT 1",
        [],
        |row| row.get::<usize, usize>(0),
    ) {
        Ok(version) => upgrade(db, version),
        Err(e) => {
            if let rusqlite::Error::SqliteFailure(_, Some(ref s)) = e {
                if s.contains("no such table") {
                    return upgrade(db, 0);
                }
            }
            Err(e.into())
        }
    }
}

fn upgrade(db: &Connection, mut version: usize) -> Result<(), Error> {
    if version > UPGRADE_SQL.len() {
        panic!(
            "Database version {} is newer than this binary which expects version {}.",
            version,
            UPGRADE_SQL.len()
        );
    }

    while version < UPGRADE_SQL.len() {
        tracing::info!("Upgrading database to version {}", version + 1);
        db.execute_batch(UPGRADE_SQL[version + 1 - 1])?;
        version += 1;
        db.execute("UPDATE local_settings SET schema_version=?", (version,))?;
    }

    tracing::info!("Database is at version {}", version);

    Ok(())
}

const UPGRADE_SQL: [&str; 1] = [include_str!("sql/schema1.sql")];

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use parking_lot::{Mutex, MutexGuard};

    lazy_static! {
        static ref TEST_DB_LOCK: Mutex<()> = Mutex::new(());
    }

    /// Installs a fresh in-memory database into GLOBALS for the duration
    /// of the returned guard. Tests that touch the store must hold one.
    pub(crate) struct TestDb(#[allow(dead_code)] MutexGuard<'static, ()>);

    pub(crate) fn setup() -> TestDb {
        let guard = TEST_DB_LOCK.lock();

        let connection = Connection::open_in_memory().unwrap();
        for sql in UPGRADE_SQL.iter() {
            connection.execute_batch(sql).unwrap();
        }

        let mut db = GLOBALS.db.try_lock().unwrap();
        *db = Some(connection);

        TestDb(guard)
    }

    impl Drop for TestDb {
        fn drop(&mut self) {
            if let Ok(mut db) = GLOBALS.db.try_lock() {
                *db = None;
            }
        }
    }
}
