use chrono::{DateTime, Utc};
use turk_core::model::{ExperimentId, ExperimentRecord, RoundRecord, SetId};

use super::SqliteRepository;
use super::mapping::{db, map_experiment_row, map_round_row};
use crate::repository::{ExperimentRepository, SessionRepository, StorageError};

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(d) if d.is_unique_violation())
}

fn is_fk_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(d) if d.is_foreign_key_violation())
}

fn not_found_if_none(rows_affected: u64) -> Result<(), StorageError> {
    if rows_affected == 0 {
        Err(StorageError::NotFound)
    } else {
        Ok(())
    }
}

#[async_trait::async_trait]
impl ExperimentRepository for SqliteRepository {
    async fn start_experiment(&self, record: &ExperimentRecord) -> Result<(), StorageError> {
        self.ensure_set(&record.set_id).await?;
        sqlx::query(
            r"
            INSERT INTO experiments (id, set_id, participants, input_data, started_at, ended_at, results)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
        )
        .bind(record.id.to_string())
        .bind(record.set_id.as_str())
        .bind(i64::from(record.participants))
        .bind(record.input_data.as_deref())
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.results.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::Conflict
            } else {
                db(e)
            }
        })?;
        Ok(())
    }

    async fn end_experiment(
        &self,
        id: ExperimentId,
        at: DateTime<Utc>,
        results: &str,
    ) -> Result<(), StorageError> {
        let res = sqlx::query("UPDATE experiments SET ended_at = ?2, results = ?3 WHERE id = ?1")
            .bind(id.to_string())
            .bind(at)
            .bind(results)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        not_found_if_none(res.rows_affected())
    }

    async fn start_round(
        &self,
        id: ExperimentId,
        round_num: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO rounds (experiment_id, round_num, started_at)
            VALUES (?1, ?2, ?3)
            ",
        )
        .bind(id.to_string())
        .bind(i64::from(round_num))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::Conflict
            } else if is_fk_violation(&e) {
                StorageError::NotFound
            } else {
                db(e)
            }
        })?;
        Ok(())
    }

    async fn set_round_input(
        &self,
        id: ExperimentId,
        round_num: u32,
        input_data: &str,
    ) -> Result<(), StorageError> {
        let res = sqlx::query(
            "UPDATE rounds SET input_data = ?3 WHERE experiment_id = ?1 AND round_num = ?2",
        )
        .bind(id.to_string())
        .bind(i64::from(round_num))
        .bind(input_data)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        not_found_if_none(res.rows_affected())
    }

    async fn end_round(
        &self,
        id: ExperimentId,
        round_num: u32,
        at: DateTime<Utc>,
        results: &str,
    ) -> Result<(), StorageError> {
        let res = sqlx::query(
            r"
            UPDATE rounds SET ended_at = ?3, results = ?4
            WHERE experiment_id = ?1 AND round_num = ?2
            ",
        )
        .bind(id.to_string())
        .bind(i64::from(round_num))
        .bind(at)
        .bind(results)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        not_found_if_none(res.rows_affected())
    }

    async fn get_experiment(
        &self,
        id: ExperimentId,
    ) -> Result<Option<ExperimentRecord>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT id, set_id, participants, input_data, started_at, ended_at, results
            FROM experiments WHERE id = ?1
            ",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.as_ref().map(map_experiment_row).transpose()
    }

    async fn list_rounds(&self, id: ExperimentId) -> Result<Vec<RoundRecord>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT experiment_id, round_num, started_at, ended_at, input_data, results
            FROM rounds WHERE experiment_id = ?1
            ORDER BY round_num ASC
            ",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(map_round_row).collect()
    }

    async fn list_experiments(
        &self,
        set_id: &SetId,
    ) -> Result<Vec<ExperimentRecord>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT id, set_id, participants, input_data, started_at, ended_at, results
            FROM experiments WHERE set_id = ?1
            ORDER BY started_at ASC, id ASC
            ",
        )
        .bind(set_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(map_experiment_row).collect()
    }
}
