use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use turk_core::model::{
    AssignmentId, ExperimentId, ExperimentRecord, HitId, Quiz, RoundRecord, SessionRecord,
    SessionSummary, SessionTransitionError, SetId, WorkerId,
};

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("session {0} was reclaimed by an expiry sweep")]
    Expired(HitId),

    #[error(transparent)]
    Transition(#[from] SessionTransitionError),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

//
// ─── REPOSITORY CONTRACTS ──────────────────────────────────────────────────────
//

/// Durable session records, partitioned by set.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Register a set name. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the set cannot be stored.
    async fn ensure_set(&self, set_id: &SetId) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn list_sets(&self) -> Result<Vec<SetId>, StorageError>;

    /// Create the session for a HIT the first time it is seen, or return the
    /// existing one.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Expired` if the HIT was reclaimed, or other
    /// storage errors.
    async fn create_session(
        &self,
        hit_id: &HitId,
        set_id: &SetId,
        at: DateTime<Utc>,
    ) -> Result<SessionRecord, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn get_session(&self, hit_id: &HitId) -> Result<Option<SessionRecord>, StorageError>;

    /// Whether the HIT was deleted by [`SessionRepository::expire_unused`].
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn is_expired(&self, hit_id: &HitId) -> Result<bool, StorageError>;

    /// Overwrite a session after a transition.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing and
    /// `StorageError::Transition` if the stored status cannot move to the
    /// new one.
    async fn save_session(&self, record: &SessionRecord) -> Result<(), StorageError>;

    /// Set assignment and worker together, atomically, only while unclaimed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Transition(AlreadyAssigned)` if another worker
    /// holds the session, `StorageError::NotFound` if it does not exist.
    async fn claim(
        &self,
        hit_id: &HitId,
        assignment_id: &AssignmentId,
        worker_id: &WorkerId,
        at: DateTime<Utc>,
    ) -> Result<SessionRecord, StorageError>;

    /// Unbind a session from an experiment that never started. The session
    /// must still be bound to `experiment_id`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing and
    /// `StorageError::Transition` if it is completed or bound elsewhere.
    async fn withdraw_from_experiment(
        &self,
        hit_id: &HitId,
        experiment_id: ExperimentId,
    ) -> Result<SessionRecord, StorageError>;

    /// Release a worker's claim.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Transition(Refused)` for sessions in an
    /// experiment or completed.
    async fn clear_worker(&self, hit_id: &HitId) -> Result<SessionRecord, StorageError>;

    /// Delete a session. Returns `false` if it is missing or protected.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn delete_session(&self, hit_id: &HitId) -> Result<bool, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn list_completed(&self, set_id: &SetId) -> Result<Vec<SessionRecord>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn sessions_for_worker(
        &self,
        set_id: &SetId,
        worker_id: &WorkerId,
    ) -> Result<Vec<SessionRecord>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn summary(&self, set_id: &SetId) -> Result<SessionSummary, StorageError>;

    /// Delete every never-claimed session of the set and remember its HIT id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn expire_unused(
        &self,
        set_id: &SetId,
        at: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, StorageError>;
}

#[async_trait]
pub trait QuizRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError` if the quiz cannot be stored.
    async fn save_quiz(&self, quiz: &Quiz) -> Result<i64, StorageError>;

    /// Past quizzes of a worker within one set, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn list_quizzes(
        &self,
        set_id: &SetId,
        worker_id: &WorkerId,
    ) -> Result<Vec<Quiz>, StorageError>;
}

#[async_trait]
pub trait ExperimentRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if the id already exists.
    async fn start_experiment(&self, record: &ExperimentRecord) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the experiment does not exist.
    async fn end_experiment(
        &self,
        id: ExperimentId,
        at: DateTime<Utc>,
        results: &str,
    ) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` for an unknown experiment and
    /// `StorageError::Conflict` if the round already started.
    async fn start_round(
        &self,
        id: ExperimentId,
        round_num: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the round was never started.
    async fn set_round_input(
        &self,
        id: ExperimentId,
        round_num: u32,
        input_data: &str,
    ) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the round was never started.
    async fn end_round(
        &self,
        id: ExperimentId,
        round_num: u32,
        at: DateTime<Utc>,
        results: &str,
    ) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn get_experiment(&self, id: ExperimentId)
    -> Result<Option<ExperimentRecord>, StorageError>;

    /// Rounds ordered by number.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn list_rounds(&self, id: ExperimentId) -> Result<Vec<RoundRecord>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn list_experiments(&self, set_id: &SetId)
    -> Result<Vec<ExperimentRecord>, StorageError>;
}

//
// ─── IN-MEMORY ADAPTER ─────────────────────────────────────────────────────────
//

#[derive(Default)]
struct MemoryState {
    sets: HashSet<SetId>,
    sessions: HashMap<HitId, SessionRecord>,
    expired: HashSet<HitId>,
    quizzes: Vec<Quiz>,
    experiments: HashMap<ExperimentId, ExperimentRecord>,
    rounds: HashMap<(ExperimentId, u32), RoundRecord>,
}

/// Simple in-memory repository implementation for testing and prototyping.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StorageError> {
        self.state
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }
}

#[async_trait]
impl SessionRepository for InMemoryRepository {
    async fn ensure_set(&self, set_id: &SetId) -> Result<(), StorageError> {
        self.lock()?.sets.insert(set_id.clone());
        Ok(())
    }

    async fn list_sets(&self) -> Result<Vec<SetId>, StorageError> {
        let mut sets: Vec<SetId> = self.lock()?.sets.iter().cloned().collect();
        sets.sort();
        Ok(sets)
    }

    async fn create_session(
        &self,
        hit_id: &HitId,
        set_id: &SetId,
        at: DateTime<Utc>,
    ) -> Result<SessionRecord, StorageError> {
        let mut guard = self.lock()?;
        if guard.expired.contains(hit_id) {
            return Err(StorageError::Expired(hit_id.clone()));
        }
        guard.sets.insert(set_id.clone());
        let record = guard
            .sessions
            .entry(hit_id.clone())
            .or_insert_with(|| SessionRecord::new(hit_id.clone(), set_id.clone(), at));
        Ok(record.clone())
    }

    async fn get_session(&self, hit_id: &HitId) -> Result<Option<SessionRecord>, StorageError> {
        Ok(self.lock()?.sessions.get(hit_id).cloned())
    }

    async fn is_expired(&self, hit_id: &HitId) -> Result<bool, StorageError> {
        Ok(self.lock()?.expired.contains(hit_id))
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        let stored = guard
            .sessions
            .get_mut(record.hit_id())
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
        *stored = record.clone();
        Ok(())
    }

    async fn claim(
        &self,
        hit_id: &HitId,
        assignment_id: &AssignmentId,
        worker_id: &WorkerId,
        at: DateTime<Utc>,
    ) -> Result<SessionRecord, StorageError> {
        let mut guard = self.lock()?;
        if guard.expired.contains(hit_id) {
            return Err(StorageError::Expired(hit_id.clone()));
        }
        let stored = guard.sessions.get_mut(hit_id).ok_or(StorageError::NotFound)?;
        let mut updated = stored.clone();
        updated.assign(assignment_id.clone(), worker_id.clone(), at)?;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn withdraw_from_experiment(
        &self,
        hit_id: &HitId,
        experiment_id: ExperimentId,
    ) -> Result<SessionRecord, StorageError> {
        let mut guard = self.lock()?;
        let stored = guard.sessions.get_mut(hit_id).ok_or(StorageError::NotFound)?;
        let mut updated = stored.clone();
        updated.withdraw_from_experiment(experiment_id)?;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn clear_worker(&self, hit_id: &HitId) -> Result<SessionRecord, StorageError> {
        let mut guard = self.lock()?;
        let stored = guard.sessions.get_mut(hit_id).ok_or(StorageError::NotFound)?;
        let mut updated = stored.clone();
        updated.clear_worker()?;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn delete_session(&self, hit_id: &HitId) -> Result<bool, StorageError> {
        let mut guard = self.lock()?;
        let Some(stored) = guard.sessions.get(hit_id) else {
            return Ok(false);
        };
        if let Err(e) = stored.check_deletable() {
            tracing::warn!(hit_id = %hit_id, error = %e, "refusing to delete session");
            return Ok(false);
        }
        guard.sessions.remove(hit_id);
        Ok(true)
    }

    async fn list_completed(&self, set_id: &SetId) -> Result<Vec<SessionRecord>, StorageError> {
        let guard = self.lock()?;
        let mut out: Vec<SessionRecord> = guard
            .sessions
            .values()
            .filter(|s| s.set_id() == set_id && s.inactive_percent().is_some())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.completed_at().cmp(&b.completed_at()));
        Ok(out)
    }

    async fn sessions_for_worker(
        &self,
        set_id: &SetId,
        worker_id: &WorkerId,
    ) -> Result<Vec<SessionRecord>, StorageError> {
        let guard = self.lock()?;
        Ok(guard
            .sessions
            .values()
            .filter(|s| s.set_id() == set_id && s.worker_id() == Some(worker_id))
            .cloned()
            .collect())
    }

    async fn summary(&self, set_id: &SetId) -> Result<SessionSummary, StorageError> {
        let guard = self.lock()?;
        Ok(SessionSummary::from_records(
            set_id.clone(),
            guard.sessions.values(),
        ))
    }

    async fn expire_unused(
        &self,
        set_id: &SetId,
        _at: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, StorageError> {
        let mut guard = self.lock()?;
        let doomed: Vec<HitId> = guard
            .sessions
            .values()
            .filter(|s| s.set_id() == set_id && s.is_expirable())
            .map(|s| s.hit_id().clone())
            .collect();
        let mut expired = Vec::with_capacity(doomed.len());
        for hit_id in doomed {
            if let Some(record) = guard.sessions.remove(&hit_id) {
                guard.expired.insert(hit_id);
                expired.push(record);
            }
        }
        Ok(expired)
    }
}

#[async_trait]
impl QuizRepository for InMemoryRepository {
    async fn save_quiz(&self, quiz: &Quiz) -> Result<i64, StorageError> {
        let mut guard = self.lock()?;
        guard.quizzes.push(quiz.clone());
        i64::try_from(guard.quizzes.len())
            .map_err(|_| StorageError::Serialization("quiz id overflow".into()))
    }

    async fn list_quizzes(
        &self,
        set_id: &SetId,
        worker_id: &WorkerId,
    ) -> Result<Vec<Quiz>, StorageError> {
        let guard = self.lock()?;
        Ok(guard
            .quizzes
            .iter()
            .filter(|q| q.set_id() == set_id && q.worker_id() == worker_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ExperimentRepository for InMemoryRepository {
    async fn start_experiment(&self, record: &ExperimentRecord) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        if guard.experiments.contains_key(&record.id) {
            return Err(StorageError::Conflict);
        }
        guard.experiments.insert(record.id, record.clone());
        Ok(())
    }

    async fn end_experiment(
        &self,
        id: ExperimentId,
        at: DateTime<Utc>,
        results: &str,
    ) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        let exp = guard.experiments.get_mut(&id).ok_or(StorageError::NotFound)?;
        exp.ended_at = Some(at);
        exp.results = Some(results.to_owned());
        Ok(())
    }

    async fn start_round(
        &self,
        id: ExperimentId,
        round_num: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        if !guard.experiments.contains_key(&id) {
            return Err(StorageError::NotFound);
        }
        if guard.rounds.contains_key(&(id, round_num)) {
            return Err(StorageError::Conflict);
        }
        guard
            .rounds
            .insert((id, round_num), RoundRecord::started(id, round_num, at));
        Ok(())
    }

    async fn set_round_input(
        &self,
        id: ExperimentId,
        round_num: u32,
        input_data: &str,
    ) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        let round = guard
            .rounds
            .get_mut(&(id, round_num))
            .ok_or(StorageError::NotFound)?;
        round.input_data = Some(input_data.to_owned());
        Ok(())
    }

    async fn end_round(
        &self,
        id: ExperimentId,
        round_num: u32,
        at: DateTime<Utc>,
        results: &str,
    ) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        let round = guard
            .rounds
            .get_mut(&(id, round_num))
            .ok_or(StorageError::NotFound)?;
        round.ended_at = Some(at);
        round.results = Some(results.to_owned());
        Ok(())
    }

    async fn get_experiment(
        &self,
        id: ExperimentId,
    ) -> Result<Option<ExperimentRecord>, StorageError> {
        Ok(self.lock()?.experiments.get(&id).cloned())
    }

    async fn list_rounds(&self, id: ExperimentId) -> Result<Vec<RoundRecord>, StorageError> {
        let guard = self.lock()?;
        let mut rounds: Vec<RoundRecord> = guard
            .rounds
            .values()
            .filter(|r| r.experiment_id == id)
            .cloned()
            .collect();
        rounds.sort_by_key(|r| r.round_num);
        Ok(rounds)
    }

    async fn list_experiments(
        &self,
        set_id: &SetId,
    ) -> Result<Vec<ExperimentRecord>, StorageError> {
        let guard = self.lock()?;
        let mut out: Vec<ExperimentRecord> = guard
            .experiments
            .values()
            .filter(|e| &e.set_id == set_id)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.started_at);
        Ok(out)
    }
}

/// Aggregates the repositories behind trait objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub sessions: Arc<dyn SessionRepository>,
    pub quizzes: Arc<dyn QuizRepository>,
    pub experiments: Arc<dyn ExperimentRepository>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        let repo = InMemoryRepository::new();
        let sessions: Arc<dyn SessionRepository> = Arc::new(repo.clone());
        let quizzes: Arc<dyn QuizRepository> = Arc::new(repo.clone());
        let experiments: Arc<dyn ExperimentRepository> = Arc::new(repo);
        Self {
            sessions,
            quizzes,
            experiments,
        }
    }
}
