//! Enforces the session lifecycle against storage.

use std::sync::Arc;

use storage::repository::{QuizRepository, SessionRepository};
use turk_core::Clock;
use turk_core::model::{
    AssignmentId, ExperimentId, HitId, Quiz, SessionRecord, SessionSummary, SetId, WorkerId,
};

use crate::error::SessionError;

/// Loads a session, applies one transition in memory and persists it.
///
/// A failed write leaves the worker at its previous state: callers see the
/// error and must not treat the transition as done.
#[derive(Clone)]
pub struct SessionTracker {
    set_id: SetId,
    clock: Clock,
    sessions: Arc<dyn SessionRepository>,
    quizzes: Arc<dyn QuizRepository>,
}

impl SessionTracker {
    #[must_use]
    pub fn new(
        set_id: SetId,
        clock: Clock,
        sessions: Arc<dyn SessionRepository>,
        quizzes: Arc<dyn QuizRepository>,
    ) -> Self {
        Self {
            set_id,
            clock,
            sessions,
            quizzes,
        }
    }

    #[must_use]
    pub fn set_id(&self) -> &SetId {
        &self.set_id
    }

    /// # Errors
    ///
    /// Returns `SessionError::Expired` for a reclaimed HIT, `NotFound` if it
    /// was never created.
    pub async fn load(&self, hit_id: &HitId) -> Result<SessionRecord, SessionError> {
        match self.sessions.get_session(hit_id).await? {
            Some(record) => Ok(record),
            None if self.sessions.is_expired(hit_id).await? => {
                Err(SessionError::Expired(hit_id.clone()))
            }
            None => Err(SessionError::NotFound(hit_id.clone())),
        }
    }

    async fn persist(&self, record: &SessionRecord, changed: bool) -> Result<(), SessionError> {
        if changed {
            if let Err(e) = self.sessions.save_session(record).await {
                tracing::error!(hit_id = %record.hit_id(), error = %e, "failed to persist session");
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Create the session the first time its HIT is seen.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Expired` if the HIT was reclaimed.
    pub async fn open(&self, hit_id: &HitId) -> Result<SessionRecord, SessionError> {
        Ok(self
            .sessions
            .create_session(hit_id, &self.set_id, self.clock.now())
            .await?)
    }

    /// `UNUSED → ASSIGNED`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::AlreadyAssigned` if another worker holds it.
    pub async fn claim(
        &self,
        hit_id: &HitId,
        assignment_id: &AssignmentId,
        worker_id: &WorkerId,
    ) -> Result<SessionRecord, SessionError> {
        let record = self
            .sessions
            .claim(hit_id, assignment_id, worker_id, self.clock.now())
            .await?;
        tracing::debug!(hit_id = %hit_id, worker_id = %worker_id, "session claimed");
        Ok(record)
    }

    /// `ASSIGNED → ACTIVE`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the session is missing, in the wrong state,
    /// or cannot be saved.
    pub async fn login(&self, hit_id: &HitId, username: &str) -> Result<SessionRecord, SessionError> {
        let mut record = self.load(hit_id).await?;
        let transition = record.lobby_login(username, self.clock.now())?;
        self.persist(&record, transition.changed()).await?;
        Ok(record)
    }

    /// `ACTIVE → EXPERIMENT`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the session is missing, in the wrong state,
    /// or cannot be saved.
    pub async fn place(
        &self,
        hit_id: &HitId,
        experiment_id: ExperimentId,
    ) -> Result<SessionRecord, SessionError> {
        let mut record = self.load(hit_id).await?;
        let transition = record.place_in_experiment(experiment_id)?;
        self.persist(&record, transition.changed()).await?;
        Ok(record)
    }

    /// Undo a placement whose experiment never ran. The session is ACTIVE
    /// again.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the session is bound to another experiment,
    /// already completed, or the write fails.
    pub async fn withdraw(
        &self,
        hit_id: &HitId,
        experiment_id: ExperimentId,
    ) -> Result<SessionRecord, SessionError> {
        match self
            .sessions
            .withdraw_from_experiment(hit_id, experiment_id)
            .await
        {
            Ok(record) => Ok(record),
            Err(e) => {
                tracing::error!(
                    hit_id = %hit_id,
                    experiment_id = %experiment_id,
                    error = %e,
                    "failed to withdraw session"
                );
                Err(e.into())
            }
        }
    }

    /// `EXPERIMENT → COMPLETED`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the session is missing, in the wrong state,
    /// the percentage is out of range, or the save fails.
    pub async fn complete(
        &self,
        hit_id: &HitId,
        inactive_percent: f64,
    ) -> Result<SessionRecord, SessionError> {
        let mut record = self.load(hit_id).await?;
        let transition = record.complete(inactive_percent, self.clock.now())?;
        self.persist(&record, transition.changed()).await?;
        Ok(record)
    }

    /// Store the exit comment. Returns `false` if one was already stored.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the session is not completed or the save
    /// fails.
    pub async fn submit_comment(&self, hit_id: &HitId, comment: &str) -> Result<bool, SessionError> {
        let mut record = self.load(hit_id).await?;
        let stored = record.submit(comment)?;
        self.persist(&record, stored).await?;
        Ok(stored)
    }

    /// Release the worker's claim.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::RefusedDeletion` in EXPERIMENT or COMPLETED.
    pub async fn clear_worker(&self, hit_id: &HitId) -> Result<SessionRecord, SessionError> {
        match self.sessions.clear_worker(hit_id).await {
            Ok(record) => Ok(record),
            Err(e) => {
                let e = SessionError::from(e);
                if matches!(e, SessionError::RefusedDeletion { .. }) {
                    tracing::warn!(hit_id = %hit_id, "refusing to clear worker");
                }
                Err(e)
            }
        }
    }

    /// # Errors
    ///
    /// Returns `SessionError::RefusedDeletion` in EXPERIMENT or COMPLETED and
    /// `NotFound` if there is nothing to delete.
    pub async fn delete(&self, hit_id: &HitId) -> Result<(), SessionError> {
        let record = self.load(hit_id).await?;
        if record.status().is_protected() {
            tracing::warn!(hit_id = %hit_id, status = %record.status(), "refusing to delete session");
            return Err(SessionError::RefusedDeletion {
                hit_id: hit_id.clone(),
                status: record.status(),
            });
        }
        if !self.sessions.delete_session(hit_id).await? {
            return Err(SessionError::NotFound(hit_id.clone()));
        }
        Ok(())
    }

    /// Reclaim every never-claimed session of this set.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Storage` on backend failure.
    pub async fn expire_unused(&self) -> Result<Vec<HitId>, SessionError> {
        let expired = self
            .sessions
            .expire_unused(&self.set_id, self.clock.now())
            .await?;
        tracing::info!(set_id = %self.set_id, expired = expired.len(), "expired unused sessions");
        Ok(expired.iter().map(|r| r.hit_id().clone()).collect())
    }

    /// # Errors
    ///
    /// Returns `SessionError::Storage` on backend failure.
    pub async fn summary(&self) -> Result<SessionSummary, SessionError> {
        Ok(self.sessions.summary(&self.set_id).await?)
    }

    /// # Errors
    ///
    /// Returns `SessionError::Storage` on backend failure.
    pub async fn list_completed(&self) -> Result<Vec<SessionRecord>, SessionError> {
        Ok(self.sessions.list_completed(&self.set_id).await?)
    }

    /// # Errors
    ///
    /// Returns `SessionError::Storage` on backend failure.
    pub async fn past_quizzes(&self, worker_id: &WorkerId) -> Result<Vec<Quiz>, SessionError> {
        Ok(self.quizzes.list_quizzes(&self.set_id, worker_id).await?)
    }

    /// # Errors
    ///
    /// Returns `SessionError::Storage` on backend failure.
    pub async fn record_quiz(&self, quiz: &Quiz) -> Result<i64, SessionError> {
        Ok(self.quizzes.save_quiz(quiz).await?)
    }

    #[must_use]
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::repository::InMemoryRepository;
    use turk_core::model::SessionStatus;
    use turk_core::time::fixed_clock;

    fn tracker() -> SessionTracker {
        let repo = InMemoryRepository::new();
        SessionTracker::new(
            SetId::new("test"),
            fixed_clock(),
            Arc::new(repo.clone()),
            Arc::new(repo),
        )
    }

    #[tokio::test]
    async fn walks_session_to_completion() {
        let tracker = tracker();
        let hit = HitId::new("HIT 1");
        tracker.open(&hit).await.unwrap();
        tracker
            .claim(&hit, &AssignmentId::new("A1"), &WorkerId::new("W1"))
            .await
            .unwrap();
        tracker.login(&hit, "ann").await.unwrap();
        // Logging in twice is harmless.
        tracker.login(&hit, "ann").await.unwrap();
        tracker.place(&hit, ExperimentId::generate()).await.unwrap();
        let done = tracker.complete(&hit, 0.1).await.unwrap();
        assert_eq!(done.status(), SessionStatus::Completed);
        assert!(tracker.submit_comment(&hit, "fun").await.unwrap());
        assert!(!tracker.submit_comment(&hit, "again").await.unwrap());
        assert_eq!(tracker.summary().await.unwrap().submitted, 1);
    }

    #[tokio::test]
    async fn withdrawn_session_is_active_again() {
        let tracker = tracker();
        let hit = HitId::new("HIT 1");
        tracker.open(&hit).await.unwrap();
        tracker
            .claim(&hit, &AssignmentId::new("A1"), &WorkerId::new("W1"))
            .await
            .unwrap();
        tracker.login(&hit, "ann").await.unwrap();
        let experiment = ExperimentId::generate();
        tracker.place(&hit, experiment).await.unwrap();

        assert!(tracker.withdraw(&hit, ExperimentId::generate()).await.is_err());
        let record = tracker.withdraw(&hit, experiment).await.unwrap();
        assert_eq!(record.status(), SessionStatus::Active);
        assert_eq!(record.experiment_id(), None);
        tracker.login(&hit, "ann").await.unwrap();
        tracker.place(&hit, ExperimentId::generate()).await.unwrap();
    }

    #[tokio::test]
    async fn protected_sessions_refuse_delete_and_reset() {
        let tracker = tracker();
        let hit = HitId::new("HIT 1");
        tracker.open(&hit).await.unwrap();
        tracker
            .claim(&hit, &AssignmentId::new("A1"), &WorkerId::new("W1"))
            .await
            .unwrap();
        tracker.login(&hit, "ann").await.unwrap();
        tracker.place(&hit, ExperimentId::generate()).await.unwrap();

        assert!(matches!(
            tracker.delete(&hit).await,
            Err(SessionError::RefusedDeletion { .. })
        ));
        assert!(matches!(
            tracker.clear_worker(&hit).await,
            Err(SessionError::RefusedDeletion { .. })
        ));
        assert_eq!(
            tracker.load(&hit).await.unwrap().status(),
            SessionStatus::Experiment
        );

        let idle = HitId::new("HIT 2");
        tracker.open(&idle).await.unwrap();
        tracker.delete(&idle).await.unwrap();
        assert!(matches!(
            tracker.load(&idle).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn expired_sessions_report_expired() {
        let tracker = tracker();
        let hit = HitId::new("HIT 1");
        tracker.open(&hit).await.unwrap();
        assert_eq!(tracker.expire_unused().await.unwrap(), vec![hit.clone()]);
        assert!(matches!(
            tracker.load(&hit).await,
            Err(SessionError::Expired(_))
        ));
        assert!(matches!(
            tracker.open(&hit).await,
            Err(SessionError::Expired(_))
        ));
    }

    #[tokio::test]
    async fn second_claim_is_already_assigned() {
        let tracker = tracker();
        let hit = HitId::new("HIT 1");
        tracker.open(&hit).await.unwrap();
        tracker
            .claim(&hit, &AssignmentId::new("A1"), &WorkerId::new("W1"))
            .await
            .unwrap();
        assert!(matches!(
            tracker
                .claim(&hit, &AssignmentId::new("A2"), &WorkerId::new("W2"))
                .await,
            Err(SessionError::AlreadyAssigned { .. })
        ));
    }
}
