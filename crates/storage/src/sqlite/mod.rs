use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use thiserror::Error;
use turk_core::model::SetId;

use crate::repository::{
    ExperimentRepository, QuizRepository, SessionRepository, Storage, StorageError,
};

mod experiment_repo;
mod mapping;
mod migrate;
mod quiz_repo;
mod session_repo;

/// Pool sizing and lock waits for the session store.
///
/// Lobby traffic arrives as bursts of short writes (claims, logins,
/// placements) from many tasks at once. SQLite serialises writers, so a
/// writer waits on `busy_timeout` rather than failing, and the pool only
/// needs to cover concurrent readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SqliteInitError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("registering set failed: {0}")]
    Storage(#[from] StorageError),
}

impl SqliteRepository {
    /// Open the store with [`StoreOptions::default`].
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if the URL is invalid or no connection can
    /// be established.
    pub async fn connect(database_url: &str) -> Result<Self, SqliteInitError> {
        Self::open(database_url, &StoreOptions::default()).await
    }

    /// Open the store with foreign keys enforced, WAL journaling and the
    /// given pool sizing. Missing database files are created.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if the URL is invalid or no connection can
    /// be established.
    pub async fn open(
        database_url: &str,
        options: &StoreOptions,
    ) -> Result<Self, SqliteInitError> {
        let connect = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(options.busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections)
            .min_connections(options.min_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect_with(connect)
            .await?;
        tracing::debug!(
            url = database_url,
            max_connections = options.max_connections,
            "opened session store"
        );
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// # Errors
    ///
    /// Returns `SqliteInitError` if a migration fails.
    pub async fn migrate(&self) -> Result<(), SqliteInitError> {
        migrate::run_migrations(&self.pool).await
    }

    fn into_storage(self) -> Storage {
        let sessions: Arc<dyn SessionRepository> = Arc::new(self.clone());
        let quizzes: Arc<dyn QuizRepository> = Arc::new(self.clone());
        let experiments: Arc<dyn ExperimentRepository> = Arc::new(self);
        Storage {
            sessions,
            quizzes,
            experiments,
        }
    }
}

impl Storage {
    /// Migrated `SQLite` storage with default options.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if connection or migrations fail.
    pub async fn sqlite(database_url: &str) -> Result<Self, SqliteInitError> {
        let repo = SqliteRepository::connect(database_url).await?;
        repo.migrate().await?;
        Ok(repo.into_storage())
    }

    /// Migrated `SQLite` storage with `set_id` registered, ready for a
    /// server run on that set.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if connection, migrations or set
    /// registration fail.
    pub async fn sqlite_for_set(
        database_url: &str,
        options: &StoreOptions,
        set_id: &SetId,
    ) -> Result<Self, SqliteInitError> {
        let repo = SqliteRepository::open(database_url, options).await?;
        repo.migrate().await?;
        repo.ensure_set(set_id).await?;
        Ok(repo.into_storage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_leave_room_for_lobby_bursts() {
        let options = StoreOptions::default();
        assert!(options.max_connections > options.min_connections);
        assert!(options.acquire_timeout > options.busy_timeout);
    }

    #[tokio::test]
    async fn bootstrap_registers_the_set() {
        let storage = Storage::sqlite_for_set(
            "sqlite:file:memdb_bootstrap?mode=memory&cache=shared",
            &StoreOptions::default(),
            &SetId::new("pilot"),
        )
        .await
        .unwrap();
        assert_eq!(
            storage.sessions.list_sets().await.unwrap(),
            vec![SetId::new("pilot")]
        );
    }

    #[tokio::test]
    async fn rejects_malformed_url() {
        let err = SqliteRepository::connect("postgres://nope").await;
        assert!(matches!(err, Err(SqliteInitError::Sqlx(_))));
    }
}
