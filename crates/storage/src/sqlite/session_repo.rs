use chrono::{DateTime, Utc};
use sqlx::Row;
use turk_core::model::{
    AssignmentId, ExperimentId, HitId, SessionRecord, SessionSummary, SessionTransitionError,
    SetId, WorkerId,
};

use super::SqliteRepository;
use super::mapping::{SESSION_COLUMNS, db, map_session_row, ser, u32_from_i64};
use crate::repository::{SessionRepository, StorageError};

/// A row is unclaimed when nothing a worker does has touched it yet.
const UNUSED_PREDICATE: &str =
    "worker_id IS NULL AND experiment_id IS NULL AND inactive_percent IS NULL";

impl SqliteRepository {
    async fn fetch_session(&self, hit_id: &HitId) -> Result<Option<SessionRecord>, StorageError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE hit_id = ?1");
        let row = sqlx::query(&sql)
            .bind(hit_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(map_session_row).transpose()
    }

    async fn fetch_sessions(
        &self,
        filter: &str,
        set_id: &SetId,
        worker_id: Option<&WorkerId>,
    ) -> Result<Vec<SessionRecord>, StorageError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE {filter}");
        let mut query = sqlx::query(&sql).bind(set_id.as_str());
        if let Some(worker_id) = worker_id {
            query = query.bind(worker_id.as_str());
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db)?;
        rows.iter().map(map_session_row).collect()
    }

    /// Writes `next` only if the stored row still matches `prev` on the
    /// columns that decide its status.
    async fn write_session(
        &self,
        prev: &SessionRecord,
        next: &SessionRecord,
    ) -> Result<(), StorageError> {
        let res = sqlx::query(
            r"
            UPDATE sessions SET
                assignment_id = ?2,
                worker_id = ?3,
                username = ?4,
                experiment_id = ?5,
                inactive_percent = ?6,
                comment = ?7,
                assigned_at = ?8,
                login_at = ?9,
                completed_at = ?10
            WHERE hit_id = ?1
              AND worker_id IS ?11
              AND username IS ?12
              AND experiment_id IS ?13
              AND inactive_percent IS ?14
            ",
        )
        .bind(next.hit_id().as_str())
        .bind(next.assignment_id().map(AssignmentId::as_str))
        .bind(next.worker_id().map(WorkerId::as_str))
        .bind(next.username())
        .bind(next.experiment_id().map(|e| e.to_string()))
        .bind(next.inactive_percent())
        .bind(next.comment())
        .bind(next.assigned_at())
        .bind(next.login_at())
        .bind(next.completed_at())
        .bind(prev.worker_id().map(WorkerId::as_str))
        .bind(prev.username())
        .bind(prev.experiment_id().map(|e| e.to_string()))
        .bind(prev.inactive_percent())
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if res.rows_affected() == 0 {
            return Err(StorageError::Conflict);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SessionRepository for SqliteRepository {
    async fn ensure_set(&self, set_id: &SetId) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO sets (id, created_at) VALUES (?1, ?2)
            ON CONFLICT(id) DO NOTHING
            ",
        )
        .bind(set_id.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn list_sets(&self) -> Result<Vec<SetId>, StorageError> {
        let rows = sqlx::query("SELECT id FROM sets ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("id").map(SetId::new).map_err(ser))
            .collect()
    }

    async fn create_session(
        &self,
        hit_id: &HitId,
        set_id: &SetId,
        at: DateTime<Utc>,
    ) -> Result<SessionRecord, StorageError> {
        if self.is_expired(hit_id).await? {
            return Err(StorageError::Expired(hit_id.clone()));
        }
        self.ensure_set(set_id).await?;
        sqlx::query(
            r"
            INSERT INTO sessions (hit_id, set_id, created_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(hit_id) DO NOTHING
            ",
        )
        .bind(hit_id.as_str())
        .bind(set_id.as_str())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        self.fetch_session(hit_id).await?.ok_or(StorageError::NotFound)
    }

    async fn get_session(&self, hit_id: &HitId) -> Result<Option<SessionRecord>, StorageError> {
        self.fetch_session(hit_id).await
    }

    async fn is_expired(&self, hit_id: &HitId) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM expired_sessions WHERE hit_id = ?1")
            .bind(hit_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        Ok(row.is_some())
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<(), StorageError> {
        let stored = self
            .fetch_session(record.hit_id())
            .await?
            .ok_or(StorageError::NotFound)?;
        let (from, to) = (stored.status(), record.status());
        if !from.permits(to) {
            return Err(SessionTransitionError::InvalidTransition {
                hit_id: record.hit_id().clone(),
                from,
                to,
            }
            .into());
        }
        self.write_session(&stored, record).await
    }

    async fn claim(
        &self,
        hit_id: &HitId,
        assignment_id: &AssignmentId,
        worker_id: &WorkerId,
        at: DateTime<Utc>,
    ) -> Result<SessionRecord, StorageError> {
        // The conditional update is the claim; only one writer can win it.
        let sql = format!(
            "UPDATE sessions SET assignment_id = ?2, worker_id = ?3, assigned_at = ?4 \
             WHERE hit_id = ?1 AND {UNUSED_PREDICATE}"
        );
        let res = sqlx::query(&sql)
            .bind(hit_id.as_str())
            .bind(assignment_id.as_str())
            .bind(worker_id.as_str())
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db)?;

        let Some(mut record) = self.fetch_session(hit_id).await? else {
            if self.is_expired(hit_id).await? {
                return Err(StorageError::Expired(hit_id.clone()));
            }
            return Err(StorageError::NotFound);
        };
        if res.rows_affected() == 0 {
            if record.is_expirable() {
                // Released between the update and the read.
                return Err(StorageError::Conflict);
            }
            // Same holder is a no-op, anyone else gets the domain error.
            record.assign(assignment_id.clone(), worker_id.clone(), at)?;
        }
        Ok(record)
    }

    async fn withdraw_from_experiment(
        &self,
        hit_id: &HitId,
        experiment_id: ExperimentId,
    ) -> Result<SessionRecord, StorageError> {
        let mut record = self
            .fetch_session(hit_id)
            .await?
            .ok_or(StorageError::NotFound)?;
        if !record.withdraw_from_experiment(experiment_id)?.changed() {
            return Ok(record);
        }
        let res = sqlx::query(
            r"
            UPDATE sessions SET experiment_id = NULL
            WHERE hit_id = ?1 AND experiment_id = ?2 AND inactive_percent IS NULL
            ",
        )
        .bind(hit_id.as_str())
        .bind(experiment_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db)?;
        if res.rows_affected() == 0 {
            return Err(StorageError::Conflict);
        }
        Ok(record)
    }

    async fn clear_worker(&self, hit_id: &HitId) -> Result<SessionRecord, StorageError> {
        let stored = self
            .fetch_session(hit_id)
            .await?
            .ok_or(StorageError::NotFound)?;
        let mut cleared = stored.clone();
        cleared.clear_worker()?;
        self.write_session(&stored, &cleared).await?;
        Ok(cleared)
    }

    async fn delete_session(&self, hit_id: &HitId) -> Result<bool, StorageError> {
        let Some(stored) = self.fetch_session(hit_id).await? else {
            return Ok(false);
        };
        if let Err(e) = stored.check_deletable() {
            tracing::warn!(hit_id = %hit_id, error = %e, "refusing to delete session");
            return Ok(false);
        }
        let res = sqlx::query(
            r"
            DELETE FROM sessions
            WHERE hit_id = ?1 AND experiment_id IS NULL AND inactive_percent IS NULL
            ",
        )
        .bind(hit_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(res.rows_affected() > 0)
    }

    async fn list_completed(&self, set_id: &SetId) -> Result<Vec<SessionRecord>, StorageError> {
        self.fetch_sessions(
            "set_id = ?1 AND inactive_percent IS NOT NULL ORDER BY completed_at ASC, hit_id ASC",
            set_id,
            None,
        )
        .await
    }

    async fn sessions_for_worker(
        &self,
        set_id: &SetId,
        worker_id: &WorkerId,
    ) -> Result<Vec<SessionRecord>, StorageError> {
        self.fetch_sessions(
            "set_id = ?1 AND worker_id = ?2 ORDER BY created_at ASC, hit_id ASC",
            set_id,
            Some(worker_id),
        )
        .await
    }

    async fn summary(&self, set_id: &SetId) -> Result<SessionSummary, StorageError> {
        let row = sqlx::query(
            r"
            SELECT
                COUNT(*) AS created,
                COUNT(worker_id) AS assigned,
                COUNT(inactive_percent) AS completed,
                COUNT(comment) AS submitted
            FROM sessions
            WHERE set_id = ?1
            ",
        )
        .bind(set_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;

        Ok(SessionSummary {
            set_id: set_id.clone(),
            created: u32_from_i64("created", row.try_get("created").map_err(ser)?)?,
            assigned: u32_from_i64("assigned", row.try_get("assigned").map_err(ser)?)?,
            completed: u32_from_i64("completed", row.try_get("completed").map_err(ser)?)?,
            submitted: u32_from_i64("submitted", row.try_get("submitted").map_err(ser)?)?,
        })
    }

    async fn expire_unused(
        &self,
        set_id: &SetId,
        at: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let sql = format!(
            "DELETE FROM sessions WHERE set_id = ?1 AND {UNUSED_PREDICATE} \
             RETURNING {SESSION_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(set_id.as_str())
            .fetch_all(&mut *tx)
            .await
            .map_err(db)?;
        let expired = rows
            .iter()
            .map(map_session_row)
            .collect::<Result<Vec<_>, _>>()?;

        for record in &expired {
            sqlx::query(
                r"
                INSERT INTO expired_sessions (hit_id, set_id, expired_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(hit_id) DO NOTHING
                ",
            )
            .bind(record.hit_id().as_str())
            .bind(set_id.as_str())
            .bind(at)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }

        tx.commit().await.map_err(db)?;
        Ok(expired)
    }
}
