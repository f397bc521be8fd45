//! Testing functionality that interacts with the testing database.

use crate::{
    datastore::{Datastore, MIGRATOR},
    test_util::noop_meter,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::time::Duration;
use tempfile::TempDir;
use trainyard_core::time::Clock;

pub const TEST_DATASTORE_MAX_TRANSACTION_RETRIES: u64 = 1000;

/// EphemeralDatastore represents an ephemeral datastore instance. It contains methods allowing
/// access to the underlying database, as well as for applying the Trainyard schema.
///
/// Dropping the EphemeralDatastore deletes the backing database file.
pub struct EphemeralDatastore {
    _db_dir: TempDir,
    pool: SqlitePool,
}

impl EphemeralDatastore {
    /// Creates a Datastore instance based on this EphemeralDatastore.
    pub async fn datastore<C: Clock>(&self, clock: C) -> Datastore<C> {
        Datastore::new(
            self.pool(),
            clock,
            &noop_meter(),
            TEST_DATASTORE_MAX_TRANSACTION_RETRIES,
        )
        .await
        .unwrap()
    }

    /// Retrieves the connection pool for the underlying database.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }
}

/// Creates a new, empty EphemeralDatastore with all schema migrations applied.
pub async fn ephemeral_datastore() -> EphemeralDatastore {
    let db_dir = tempfile::Builder::new()
        .prefix("trainyard-test-db-")
        .tempdir()
        .unwrap();
    let connect_options = SqliteConnectOptions::new()
        .filename(db_dir.path().join("trainyard.sqlite"))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .connect_with(connect_options)
        .await
        .unwrap();
    MIGRATOR.run(&pool).await.unwrap();

    EphemeralDatastore {
        _db_dir: db_dir,
        pool,
    }
}
