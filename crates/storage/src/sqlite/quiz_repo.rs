use turk_core::model::{HitId, Quiz, SetId, WorkerId};

use super::SqliteRepository;
use super::mapping::{db, map_quiz_row};
use crate::repository::{QuizRepository, SessionRepository, StorageError};

#[async_trait::async_trait]
impl QuizRepository for SqliteRepository {
    async fn save_quiz(&self, quiz: &Quiz) -> Result<i64, StorageError> {
        self.ensure_set(quiz.set_id()).await?;
        let res = sqlx::query(
            r"
            INSERT INTO quizzes (set_id, worker_id, hit_id, num_correct, num_total, taken_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
        )
        .bind(quiz.set_id().as_str())
        .bind(quiz.worker_id().as_str())
        .bind(quiz.hit_id().map(HitId::as_str))
        .bind(i64::from(quiz.num_correct()))
        .bind(i64::from(quiz.num_total()))
        .bind(quiz.taken_at())
        .execute(&self.pool)
        .await
        .map_err(db)?;

        Ok(res.last_insert_rowid())
    }

    async fn list_quizzes(
        &self,
        set_id: &SetId,
        worker_id: &WorkerId,
    ) -> Result<Vec<Quiz>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT set_id, worker_id, hit_id, num_correct, num_total, taken_at
            FROM quizzes
            WHERE set_id = ?1 AND worker_id = ?2
            ORDER BY taken_at ASC, id ASC
            ",
        )
        .bind(set_id.as_str())
        .bind(worker_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter().map(map_quiz_row).collect()
    }
}
