use chrono::Utc;
use sqlx::SqlitePool;

use super::SqliteInitError;

/// Runs the versioned migrations for the session store.
///
/// Version 1 creates sets, sessions, the expiry tombstones, quizzes,
/// experiments, rounds and their indexes.
#[allow(clippy::too_many_lines)]
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    async fn is_applied(pool: &SqlitePool, version: i64) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?1")
            .bind(version)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    if !is_applied(pool, 1).await? {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS sets (
                    id TEXT PRIMARY KEY,
                    created_at TEXT NOT NULL
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS sessions (
                    hit_id TEXT PRIMARY KEY,
                    set_id TEXT NOT NULL,
                    assignment_id TEXT,
                    worker_id TEXT,
                    username TEXT,
                    experiment_id TEXT,
                    inactive_percent REAL CHECK (inactive_percent BETWEEN 0.0 AND 1.0),
                    comment TEXT,
                    created_at TEXT NOT NULL,
                    assigned_at TEXT,
                    login_at TEXT,
                    completed_at TEXT,
                    CHECK ((assignment_id IS NULL) = (worker_id IS NULL)),
                    FOREIGN KEY (set_id) REFERENCES sets(id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS expired_sessions (
                    hit_id TEXT PRIMARY KEY,
                    set_id TEXT NOT NULL,
                    expired_at TEXT NOT NULL,
                    FOREIGN KEY (set_id) REFERENCES sets(id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS quizzes (
                    id INTEGER PRIMARY KEY,
                    set_id TEXT NOT NULL,
                    worker_id TEXT NOT NULL,
                    hit_id TEXT,
                    num_correct INTEGER NOT NULL CHECK (num_correct >= 0),
                    num_total INTEGER NOT NULL CHECK (num_total >= num_correct),
                    taken_at TEXT NOT NULL,
                    FOREIGN KEY (set_id) REFERENCES sets(id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS experiments (
                    id TEXT PRIMARY KEY,
                    set_id TEXT NOT NULL,
                    participants INTEGER NOT NULL CHECK (participants >= 0),
                    input_data TEXT,
                    started_at TEXT NOT NULL,
                    ended_at TEXT,
                    results TEXT,
                    FOREIGN KEY (set_id) REFERENCES sets(id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS rounds (
                    experiment_id TEXT NOT NULL,
                    round_num INTEGER NOT NULL CHECK (round_num >= 0),
                    started_at TEXT NOT NULL,
                    ended_at TEXT,
                    input_data TEXT,
                    results TEXT,
                    PRIMARY KEY (experiment_id, round_num),
                    FOREIGN KEY (experiment_id) REFERENCES experiments(id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_sessions_set_worker
                    ON sessions (set_id, worker_id);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_quizzes_set_worker_taken
                    ON quizzes (set_id, worker_id, taken_at);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_experiments_set_started
                    ON experiments (set_id, started_at);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                INSERT INTO schema_migrations (version, applied_at)
                VALUES (?1, ?2)
                ON CONFLICT(version) DO NOTHING
            ",
        )
        .bind(1_i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(version = 1, "applied session store migration");
    }

    Ok(())
}
