//! Wires storage, the lobby and the instance pool into one session server.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use storage::repository::Storage;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use turk_core::Clock;
use turk_core::model::{
    AssignmentId, ConnectionId, ExperimentId, ExperimentRecord, HitId, HitWorker, Quiz, QuizGate,
    RoundRecord, SessionRecord, SessionSummary, WorkerId,
};

use crate::config::ServerConfig;
use crate::dispatch::{DispatchedGroup, GroupDispatcher};
use crate::error::{ConfigError, ServerError, SessionError};
use crate::lobby::{JoinOutcome, LobbyListener, LobbyStatus, LobbyUpdate, ReadyStateLobby, StatusMap};
use crate::pool::{ExperimentFactory, ExperimentInstancePool, HostHandle, PoolStats};
use crate::tracker::SessionTracker;

//
// ─── REPORTS ───────────────────────────────────────────────────────────────────
//

/// A dispatched group whose sessions were all moved to EXPERIMENT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedGroup {
    pub experiment_id: ExperimentId,
    pub hit_ids: Vec<HitId>,
}

/// Outcome of persisting the groups formed since the last flush.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub placed: Vec<PlacedGroup>,
    /// Members of groups that could not be placed as a whole. Their
    /// instance is released, their sessions are ACTIVE and they may re-enter
    /// the lobby.
    pub unassigned: Vec<HitId>,
}

impl DispatchReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.placed.is_empty() && self.unassigned.is_empty()
    }
}

/// A lobby outcome together with the dispatches flushed right after it.
#[derive(Debug)]
pub struct LobbyEvent<T> {
    pub outcome: T,
    pub dispatch: DispatchReport,
}

#[derive(Debug, Default)]
pub struct FinishReport {
    pub completed: Vec<HitId>,
    pub failed: Vec<(HitId, SessionError)>,
}

//
// ─── SERVER ────────────────────────────────────────────────────────────────────
//

pub struct SessionServer<F: ExperimentFactory> {
    config: ServerConfig,
    storage: Storage,
    tracker: SessionTracker,
    pool: Arc<ExperimentInstancePool<F>>,
    dispatcher: Arc<GroupDispatcher<F>>,
    lobby: ReadyStateLobby,
    dispatched: tokio::sync::Mutex<mpsc::UnboundedReceiver<DispatchedGroup>>,
    /// Members of each placed experiment, released from the lobby when it
    /// finishes.
    placed: Mutex<HashMap<ExperimentId, Vec<HitId>>>,
    connections: Mutex<HashMap<ConnectionId, HitWorker>>,
    next_connection: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl<F: ExperimentFactory> SessionServer<F> {
    /// # Errors
    ///
    /// Returns `ServerError::Config` for invalid configuration or when the
    /// factory's experiment size differs from the lobby's group size.
    pub fn new(
        config: ServerConfig,
        storage: Storage,
        factory: F,
        clock: Clock,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        if factory.experiment_size() != config.lobby.group_size {
            return Err(ConfigError::FactorySize {
                factory: factory.experiment_size(),
                lobby: config.lobby.group_size,
            }
            .into());
        }

        let pool = Arc::new(ExperimentInstancePool::new(factory, config.pool.clone()));
        let host = HostHandle::new(config.host.clone(), config.set_id.clone());
        let (dispatcher, dispatched) = GroupDispatcher::new(Arc::clone(&pool), host);
        let dispatcher = Arc::new(dispatcher);
        let listener: Arc<dyn LobbyListener> = dispatcher.clone();
        let lobby = ReadyStateLobby::new(config.lobby.clone(), config.quiz.policy(), listener);
        let tracker = SessionTracker::new(
            config.set_id.clone(),
            clock,
            Arc::clone(&storage.sessions),
            Arc::clone(&storage.quizzes),
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            storage,
            tracker,
            pool,
            dispatcher,
            lobby,
            dispatched: tokio::sync::Mutex::new(dispatched),
            placed: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(0),
            shutdown,
        })
    }

    /// Register the set and start pre-warming experiments in the background.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Storage` if the set cannot be registered.
    pub async fn start(&self) -> Result<JoinHandle<()>, ServerError> {
        self.storage.sessions.ensure_set(&self.config.set_id).await?;
        tracing::info!(
            set_id = %self.config.set_id,
            group_size = self.config.lobby.group_size,
            "session server started"
        );
        Ok(Arc::clone(&self.pool).spawn_prewarm(self.shutdown.subscribe()))
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn lobby(&self) -> &ReadyStateLobby {
        &self.lobby
    }

    #[must_use]
    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    #[must_use]
    pub fn subscribe_status(&self) -> broadcast::Receiver<LobbyStatus> {
        self.dispatcher.subscribe()
    }

    #[must_use]
    pub fn num_users_connected(&self) -> usize {
        self.lobby.num_users_connected()
    }

    fn worker_for(&self, connection: ConnectionId) -> Result<HitWorker, ServerError> {
        self.connections
            .lock()
            .get(&connection)
            .cloned()
            .ok_or(ServerError::UnknownConnection(connection))
    }

    //
    // ─── CONNECTION LIFECYCLE ──────────────────────────────────────────────────
    //

    /// A worker opened a connection for a HIT: create the session if new and
    /// claim it for this worker.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::AlreadyAssigned` when another worker holds the
    /// HIT and `SessionError::Expired` when it was reclaimed.
    pub async fn connect(
        &self,
        hit_id: &HitId,
        assignment_id: &AssignmentId,
        worker_id: &WorkerId,
    ) -> Result<HitWorker, ServerError> {
        self.tracker.open(hit_id).await?;
        self.tracker.claim(hit_id, assignment_id, worker_id).await?;

        let connection = ConnectionId::new(self.next_connection.fetch_add(1, Ordering::Relaxed) + 1);
        let worker = HitWorker::new(hit_id.clone(), worker_id.clone(), connection);
        self.connections.lock().insert(connection, worker.clone());
        self.dispatcher.connection_opened();
        tracing::debug!(hit_id = %hit_id, worker_id = %worker_id, %connection, "worker connected");
        Ok(worker)
    }

    /// Gate the worker through the quiz policy, mark the session ACTIVE and
    /// admit it to the lobby. `username` defaults to the worker id.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the connection is unknown or the session
    /// cannot be moved to ACTIVE; the worker is then not admitted.
    pub async fn enter_lobby(
        &self,
        connection: ConnectionId,
        username: Option<&str>,
    ) -> Result<LobbyEvent<JoinOutcome>, ServerError> {
        let worker = self.worker_for(connection)?;
        let past = self.tracker.past_quizzes(worker.worker_id()).await?;
        let outcome = match self.lobby.quiz_gate(&past) {
            QuizGate::QuizRequired => JoinOutcome::QuizRequired,
            QuizGate::LockedOut => JoinOutcome::LockedOut,
            QuizGate::Admit => {
                let username = username.unwrap_or_else(|| worker.worker_id().as_str());
                self.tracker.login(worker.hit_id(), username).await?;
                self.lobby.user_joined(worker, &past)
            }
        };
        let dispatch = self.flush_dispatched().await;
        Ok(LobbyEvent { outcome, dispatch })
    }

    /// Record a quiz attempt, then retry lobby admission.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Quiz` for an impossible score, or any error of
    /// [`SessionServer::enter_lobby`].
    pub async fn submit_quiz(
        &self,
        connection: ConnectionId,
        num_correct: u32,
        num_total: u32,
    ) -> Result<LobbyEvent<JoinOutcome>, ServerError> {
        let worker = self.worker_for(connection)?;
        let quiz = Quiz::new(
            worker.worker_id().clone(),
            self.config.set_id.clone(),
            Some(worker.hit_id().clone()),
            num_correct,
            num_total,
            self.tracker.now(),
        )?;
        self.tracker.record_quiz(&quiz).await?;
        tracing::debug!(
            hit_id = %worker.hit_id(),
            num_correct,
            num_total,
            "quiz recorded"
        );
        self.enter_lobby(connection, None).await
    }

    /// # Errors
    ///
    /// Returns `ServerError::UnknownConnection` for an unregistered
    /// connection.
    pub async fn update_status(
        &self,
        connection: ConnectionId,
        status: &StatusMap,
    ) -> Result<LobbyEvent<LobbyUpdate>, ServerError> {
        let worker = self.worker_for(connection)?;
        let outcome = self.lobby.update_status(worker.hit_id(), status);
        let dispatch = self.flush_dispatched().await;
        Ok(LobbyEvent { outcome, dispatch })
    }

    /// Drop a connection. Returns whether the worker was still waiting in the
    /// lobby.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::UnknownConnection` for an unregistered
    /// connection.
    pub fn disconnect(&self, connection: ConnectionId) -> Result<bool, ServerError> {
        let worker = self
            .connections
            .lock()
            .remove(&connection)
            .ok_or(ServerError::UnknownConnection(connection))?;
        self.dispatcher.connection_closed();
        let was_waiting = self.lobby.user_quit(worker.hit_id());
        tracing::debug!(hit_id = %worker.hit_id(), was_waiting, "worker disconnected");
        Ok(was_waiting)
    }

    //
    // ─── GROUP DISPATCH ────────────────────────────────────────────────────────
    //

    /// Persist every group the lobby handed to the pool since the last flush.
    pub async fn flush_dispatched(&self) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut rx = self.dispatched.lock().await;
        while let Ok(dispatched) = rx.try_recv() {
            self.persist_group(dispatched, &mut report).await;
        }
        report
    }

    async fn persist_group(&self, dispatched: DispatchedGroup, report: &mut DispatchReport) {
        let DispatchedGroup {
            experiment_id,
            group,
        } = dispatched;
        let hit_ids: Vec<HitId> = group.hit_ids().cloned().collect();
        let participants = u32::try_from(hit_ids.len()).unwrap_or(u32::MAX);
        let record = ExperimentRecord::started(
            experiment_id,
            self.config.set_id.clone(),
            participants,
            self.tracker.now(),
        );
        if let Err(e) = self.storage.experiments.start_experiment(&record).await {
            tracing::error!(
                experiment_id = %experiment_id,
                error = %e,
                "failed to log experiment start; releasing instance"
            );
            self.abandon(experiment_id, &hit_ids, report);
            return;
        }

        let mut placed = Vec::with_capacity(hit_ids.len());
        for hit_id in &hit_ids {
            if let Err(e) = self.tracker.place(hit_id, experiment_id).await {
                tracing::error!(
                    hit_id = %hit_id,
                    experiment_id = %experiment_id,
                    error = %e,
                    placed = placed.len(),
                    "failed to place session; abandoning group"
                );
                for done in &placed {
                    // Already logged by the tracker; the session stays bound.
                    let _ = self.tracker.withdraw(done, experiment_id).await;
                }
                if let Err(e) = self
                    .storage
                    .experiments
                    .end_experiment(experiment_id, self.tracker.now(), "abandoned")
                    .await
                {
                    tracing::warn!(
                        experiment_id = %experiment_id,
                        error = %e,
                        "failed to log abandonment"
                    );
                }
                self.abandon(experiment_id, &hit_ids, report);
                return;
            }
            placed.push(hit_id.clone());
        }

        self.placed.lock().insert(experiment_id, hit_ids.clone());
        report.placed.push(PlacedGroup {
            experiment_id,
            hit_ids,
        });
    }

    fn abandon(
        &self,
        experiment_id: ExperimentId,
        hit_ids: &[HitId],
        report: &mut DispatchReport,
    ) {
        self.pool.finish(experiment_id);
        self.lobby.release_grouped(hit_ids);
        report.unassigned.extend_from_slice(hit_ids);
    }

    //
    // ─── EXPERIMENT LOG ────────────────────────────────────────────────────────
    //

    fn ensure_running(&self, experiment_id: ExperimentId) -> Result<(), ServerError> {
        if self.pool.is_running(experiment_id) {
            Ok(())
        } else {
            Err(ServerError::UnknownExperiment(experiment_id))
        }
    }

    /// # Errors
    ///
    /// Returns `ServerError::UnknownExperiment` if the experiment is not
    /// running, or a storage error.
    pub async fn start_round(
        &self,
        experiment_id: ExperimentId,
        round_num: u32,
    ) -> Result<(), ServerError> {
        self.ensure_running(experiment_id)?;
        self.storage
            .experiments
            .start_round(experiment_id, round_num, self.tracker.now())
            .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `ServerError::UnknownExperiment` if the experiment is not
    /// running, or a storage error.
    pub async fn round_input(
        &self,
        experiment_id: ExperimentId,
        round_num: u32,
        input_data: &str,
    ) -> Result<(), ServerError> {
        self.ensure_running(experiment_id)?;
        self.storage
            .experiments
            .set_round_input(experiment_id, round_num, input_data)
            .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `ServerError::UnknownExperiment` if the experiment is not
    /// running, or a storage error.
    pub async fn end_round(
        &self,
        experiment_id: ExperimentId,
        round_num: u32,
        results: &str,
    ) -> Result<(), ServerError> {
        self.ensure_running(experiment_id)?;
        self.storage
            .experiments
            .end_round(experiment_id, round_num, self.tracker.now(), results)
            .await?;
        Ok(())
    }

    /// Close an experiment: log its results, complete each listed session
    /// with its inactivity percentage and tear the instance down.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::UnknownExperiment` if it is not running, or a
    /// storage error if the end cannot be logged. Per-session failures are
    /// collected in the report.
    pub async fn experiment_finished(
        &self,
        experiment_id: ExperimentId,
        inactivity: &[(HitId, f64)],
        results: &str,
    ) -> Result<FinishReport, ServerError> {
        self.ensure_running(experiment_id)?;
        self.storage
            .experiments
            .end_experiment(experiment_id, self.tracker.now(), results)
            .await?;

        let mut report = FinishReport::default();
        for (hit_id, inactive_percent) in inactivity {
            match self.tracker.complete(hit_id, *inactive_percent).await {
                Ok(_) => report.completed.push(hit_id.clone()),
                Err(e) => {
                    tracing::error!(hit_id = %hit_id, error = %e, "failed to complete session");
                    report.failed.push((hit_id.clone(), e));
                }
            }
        }
        self.pool.finish(experiment_id);
        let members = self.placed.lock().remove(&experiment_id);
        if let Some(members) = members {
            self.lobby.release_grouped(&members);
        }
        tracing::info!(
            experiment_id = %experiment_id,
            completed = report.completed.len(),
            failed = report.failed.len(),
            "experiment finished"
        );
        Ok(report)
    }

    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn experiment(
        &self,
        experiment_id: ExperimentId,
    ) -> Result<Option<(ExperimentRecord, Vec<RoundRecord>)>, ServerError> {
        let Some(record) = self.storage.experiments.get_experiment(experiment_id).await? else {
            return Ok(None);
        };
        let rounds = self.storage.experiments.list_rounds(experiment_id).await?;
        Ok(Some((record, rounds)))
    }

    //
    // ─── SESSION ADMINISTRATION ────────────────────────────────────────────────
    //

    /// # Errors
    ///
    /// Returns `SessionError` if the session is not completed.
    pub async fn submit_comment(&self, hit_id: &HitId, comment: &str) -> Result<bool, ServerError> {
        Ok(self.tracker.submit_comment(hit_id, comment).await?)
    }

    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn expire_unused(&self) -> Result<Vec<HitId>, ServerError> {
        Ok(self.tracker.expire_unused().await?)
    }

    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn summary(&self) -> Result<SessionSummary, ServerError> {
        Ok(self.tracker.summary().await?)
    }

    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn list_completed(&self) -> Result<Vec<SessionRecord>, ServerError> {
        Ok(self.tracker.list_completed().await?)
    }

    /// # Errors
    ///
    /// Returns `SessionError::RefusedDeletion` for sessions in EXPERIMENT or
    /// COMPLETED.
    pub async fn delete_session(&self, hit_id: &HitId) -> Result<(), ServerError> {
        Ok(self.tracker.delete(hit_id).await?)
    }

    /// Release a worker's claim on a session that is not yet in an
    /// experiment. A worker still waiting in the lobby is removed from it.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::RefusedDeletion` for sessions in EXPERIMENT or
    /// COMPLETED.
    pub async fn clear_worker(&self, hit_id: &HitId) -> Result<SessionRecord, ServerError> {
        let record = self.tracker.clear_worker(hit_id).await?;
        self.lobby.user_quit(hit_id);
        Ok(record)
    }

    /// Stop pre-warming, close the lobby and tear every instance down.
    /// Returns the workers that were still waiting.
    pub fn shutdown(&self) -> Vec<HitWorker> {
        self.shutdown.send_replace(true);
        let waiting = self.lobby.shutdown();
        self.pool.shutdown();
        self.dispatcher.reset();
        self.placed.lock().clear();
        self.connections.lock().clear();
        tracing::info!(waiting = waiting.len(), "session server shut down");
        waiting
    }
}
