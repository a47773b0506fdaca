use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use turk_core::model::{HitId, HitWorker, HitWorkerGroup, Quiz, QuizGate, QuizPolicy};

use super::listener::LobbyListener;
use super::status::{
    GroupHandoff, JoinOutcome, LobbyStatus, LobbyUpdate, StatusChange, StatusMap, ready_flag,
};
use crate::config::LobbyConfig;
use crate::error::HandoffError;

struct Entry {
    worker: HitWorker,
    ready: bool,
}

#[derive(Default)]
struct LobbyState {
    members: HashMap<HitId, Entry>,
    /// Ready members in the order they became ready.
    ready: VecDeque<HitId>,
    /// Handed off but not yet released by the owner of the experiment.
    grouped: HashSet<HitId>,
    groups_started: u64,
}

/// Batches ready workers into groups of exactly `group_size`.
///
/// All bookkeeping lives behind one mutex. Every event that can push the
/// ready count to a multiple of the group size forms its groups and hands
/// them to the listener before releasing it, so a worker is never placed in
/// two groups and no batch is formed twice.
pub struct ReadyStateLobby {
    config: LobbyConfig,
    quiz_policy: Option<Arc<dyn QuizPolicy>>,
    listener: Arc<dyn LobbyListener>,
    state: Mutex<LobbyState>,
    joined: AtomicUsize,
    groups_formed: AtomicUsize,
    failed_handoffs: AtomicUsize,
    closed: AtomicBool,
}

impl ReadyStateLobby {
    #[must_use]
    pub fn new(
        config: LobbyConfig,
        quiz_policy: Option<Arc<dyn QuizPolicy>>,
        listener: Arc<dyn LobbyListener>,
    ) -> Self {
        Self {
            config,
            quiz_policy,
            listener,
            state: Mutex::new(LobbyState::default()),
            joined: AtomicUsize::new(0),
            groups_formed: AtomicUsize::new(0),
            failed_handoffs: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn config(&self) -> &LobbyConfig {
        &self.config
    }

    #[must_use]
    pub fn group_size(&self) -> usize {
        self.config.group_size
    }

    /// Pure admission decision for a worker with these past quizzes.
    #[must_use]
    pub fn quiz_gate(&self, past: &[Quiz]) -> QuizGate {
        QuizGate::evaluate(self.quiz_policy.as_deref(), past)
    }

    /// Admit a worker's live connection into the waiting pool.
    ///
    /// Workers who still need the quiz, or who failed it overall, are
    /// turned away without touching lobby state. A worker already in the
    /// lobby keeps its readiness; only its connection is refreshed. A
    /// worker whose group was handed off stays out until
    /// [`ReadyStateLobby::release_grouped`] lets it back in.
    pub fn user_joined(&self, worker: HitWorker, past_quizzes: &[Quiz]) -> JoinOutcome {
        if self.closed.load(Ordering::Acquire) {
            return JoinOutcome::Closed;
        }
        match self.quiz_gate(past_quizzes) {
            QuizGate::Admit => {}
            QuizGate::QuizRequired => {
                tracing::debug!(hit_id = %worker.hit_id(), "quiz required before lobby");
                return JoinOutcome::QuizRequired;
            }
            QuizGate::LockedOut => {
                tracing::info!(
                    hit_id = %worker.hit_id(),
                    worker_id = %worker.worker_id(),
                    "worker locked out by quiz policy"
                );
                return JoinOutcome::LockedOut;
            }
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let hit_id = worker.hit_id().clone();
        if state.grouped.contains(&hit_id) {
            tracing::debug!(hit_id = %hit_id, "already grouped; join ignored");
            return JoinOutcome::AlreadyGrouped;
        }
        let change = if let Some(entry) = state.members.get_mut(&hit_id) {
            entry.worker = worker;
            StatusChange::Unchanged
        } else {
            let ready = self.config.auto_ready;
            state.members.insert(hit_id.clone(), Entry { worker, ready });
            self.joined.fetch_add(1, Ordering::Relaxed);
            if ready {
                state.ready.push_back(hit_id.clone());
                StatusChange::BecameReady
            } else {
                StatusChange::Unchanged
            }
        };
        tracing::debug!(hit_id = %hit_id, in_lobby = state.members.len(), "worker joined lobby");

        let handoffs = self.form_groups(state);
        self.broadcast(state);
        JoinOutcome::Admitted(LobbyUpdate { change, handoffs })
    }

    /// Merge a status update from a worker in the lobby.
    ///
    /// Only the `ready` key is interpreted. Malformed values are logged and
    /// ignored.
    pub fn update_status(&self, hit_id: &HitId, status: &StatusMap) -> LobbyUpdate {
        let ready = match ready_flag(status) {
            Ok(Some(ready)) => ready,
            Ok(None) => return LobbyUpdate::unchanged(StatusChange::Unchanged),
            Err(value) => {
                tracing::warn!(hit_id = %hit_id, %value, "ignoring malformed ready flag");
                return LobbyUpdate::unchanged(StatusChange::Ignored);
            }
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(entry) = state.members.get_mut(hit_id) else {
            return LobbyUpdate::unchanged(StatusChange::NotInLobby);
        };
        let change = match (entry.ready, ready) {
            (false, true) => {
                entry.ready = true;
                state.ready.push_back(hit_id.clone());
                StatusChange::BecameReady
            }
            (true, false) => {
                entry.ready = false;
                state.ready.retain(|id| id != hit_id);
                StatusChange::BecameNotReady
            }
            _ => return LobbyUpdate::unchanged(StatusChange::Unchanged),
        };

        let handoffs = self.form_groups(state);
        self.broadcast(state);
        LobbyUpdate { change, handoffs }
    }

    /// Remove a worker who left before being grouped. Returns `false` if it
    /// was not waiting here.
    pub fn user_quit(&self, hit_id: &HitId) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.members.remove(hit_id) else {
            return false;
        };
        if entry.ready {
            state.ready.retain(|id| id != hit_id);
        }
        tracing::debug!(hit_id = %hit_id, "worker left lobby");
        self.broadcast(&state);
        true
    }

    fn form_groups(&self, state: &mut LobbyState) -> Vec<GroupHandoff> {
        let size = self.config.group_size;
        let mut handoffs = Vec::new();
        while size > 0 && state.ready.len() >= size {
            let ids: Vec<HitId> = state.ready.drain(..size).collect();
            let batch: Vec<(HitId, Entry)> = ids
                .into_iter()
                .filter_map(|id| state.members.remove(&id).map(|entry| (id, entry)))
                .collect();
            state.groups_started += 1;
            let members = batch.iter().map(|(_, e)| e.worker.clone()).collect();

            let group = match HitWorkerGroup::new(state.groups_started, members) {
                Ok(group) => group,
                Err(e) => {
                    tracing::error!(error = %e, "dropping inconsistent batch");
                    Self::requeue_not_ready(state, batch);
                    continue;
                }
            };

            let result = catch_unwind(AssertUnwindSafe(|| {
                self.listener.create_new_experiment(&group)
            }))
            .unwrap_or(Err(HandoffError::ListenerPanicked));

            match &result {
                Ok(()) => {
                    state.grouped.extend(batch.into_iter().map(|(id, _)| id));
                    self.groups_formed.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        sequence = group.sequence(),
                        group_size = group.group_size(),
                        "formed group"
                    );
                }
                Err(e) => {
                    self.failed_handoffs.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        sequence = group.sequence(),
                        error = %e,
                        "group handoff failed; members back to waiting"
                    );
                    Self::requeue_not_ready(state, batch);
                }
            }
            handoffs.push(GroupHandoff { group, result });
        }
        handoffs
    }

    fn requeue_not_ready(state: &mut LobbyState, batch: Vec<(HitId, Entry)>) {
        for (id, mut entry) in batch {
            entry.ready = false;
            state.members.insert(id, entry);
        }
    }

    fn snapshot(&self, state: &LobbyState) -> LobbyStatus {
        LobbyStatus {
            in_lobby: state.members.len(),
            ready: state.ready.len(),
            group_size: self.config.group_size,
            joined: self.joined.load(Ordering::Relaxed),
            experiments_running: self.listener.num_experiments_running(),
        }
    }

    fn broadcast(&self, state: &LobbyState) {
        let status = self.snapshot(state);
        self.listener.broadcast_lobby_message(&status);
    }

    #[must_use]
    pub fn status(&self) -> LobbyStatus {
        let state = self.state.lock();
        self.snapshot(&state)
    }

    #[must_use]
    pub fn num_in_lobby(&self) -> usize {
        self.state.lock().members.len()
    }

    #[must_use]
    pub fn num_ready(&self) -> usize {
        self.state.lock().ready.len()
    }

    #[must_use]
    pub fn contains(&self, hit_id: &HitId) -> bool {
        self.state.lock().members.contains_key(hit_id)
    }

    #[must_use]
    pub fn is_grouped(&self, hit_id: &HitId) -> bool {
        self.state.lock().grouped.contains(hit_id)
    }

    /// Forget handed-off workers once their experiment is persisted as
    /// finished or abandoned, so they may join again.
    pub fn release_grouped<'a>(&self, hit_ids: impl IntoIterator<Item = &'a HitId>) {
        let mut state = self.state.lock();
        for hit_id in hit_ids {
            state.grouped.remove(hit_id);
        }
    }

    #[must_use]
    pub fn groups_formed(&self) -> usize {
        self.groups_formed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed_handoffs(&self) -> usize {
        self.failed_handoffs.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn num_users_connected(&self) -> usize {
        self.listener.num_users_connected()
    }

    #[must_use]
    pub fn num_experiments_running(&self) -> usize {
        self.listener.num_experiments_running()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the lobby, returning the workers still waiting. Counters reset.
    pub fn shutdown(&self) -> Vec<HitWorker> {
        self.closed.store(true, Ordering::Release);
        let mut state = self.state.lock();
        let waiting = state.members.drain().map(|(_, e)| e.worker).collect();
        state.ready.clear();
        state.grouped.clear();
        state.groups_started = 0;
        self.joined.store(0, Ordering::Relaxed);
        self.groups_formed.store(0, Ordering::Relaxed);
        self.failed_handoffs.store(0, Ordering::Relaxed);
        tracing::info!("lobby shut down");
        waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExperimentFactoryError;
    use serde_json::json;
    use turk_core::model::{ConnectionId, DefaultQuizPolicy, SetId, WorkerId};
    use turk_core::time::fixed_now;

    #[derive(Default)]
    struct Recorder {
        groups: Mutex<Vec<HitWorkerGroup>>,
        statuses: Mutex<Vec<LobbyStatus>>,
        fail_sequences: Vec<u64>,
        panic_sequences: Vec<u64>,
    }

    impl LobbyListener for Recorder {
        fn create_new_experiment(&self, group: &HitWorkerGroup) -> Result<(), HandoffError> {
            assert!(!self.panic_sequences.contains(&group.sequence()), "boom");
            if self.fail_sequences.contains(&group.sequence()) {
                return Err(ExperimentFactoryError::Construction("no capacity".into()).into());
            }
            self.groups.lock().push(group.clone());
            Ok(())
        }

        fn broadcast_lobby_message(&self, status: &LobbyStatus) {
            self.statuses.lock().push(status.clone());
        }

        fn num_experiments_running(&self) -> usize {
            self.groups.lock().len()
        }

        fn num_users_connected(&self) -> usize {
            0
        }
    }

    fn worker(n: u64) -> HitWorker {
        HitWorker::new(
            HitId::new(format!("HIT {n}")),
            WorkerId::new(format!("W{n}")),
            ConnectionId::new(n),
        )
    }

    fn ready(value: bool) -> StatusMap {
        serde_json::from_value(json!({ "ready": value })).unwrap()
    }

    fn lobby(group_size: usize, recorder: &Arc<Recorder>) -> ReadyStateLobby {
        let listener: Arc<dyn LobbyListener> = recorder.clone();
        ReadyStateLobby::new(
            LobbyConfig::default().with_group_size(group_size),
            None,
            listener,
        )
    }

    #[test]
    fn forms_group_when_ready_count_reaches_size() {
        let recorder = Arc::new(Recorder::default());
        let lobby = lobby(2, &recorder);
        for n in 1..=3 {
            assert!(lobby.user_joined(worker(n), &[]).is_admitted());
        }
        assert_eq!(lobby.num_in_lobby(), 3);

        let first = lobby.update_status(worker(1).hit_id(), &ready(true));
        assert_eq!(first.change, StatusChange::BecameReady);
        assert!(first.handoffs.is_empty());

        let again = lobby.update_status(worker(1).hit_id(), &ready(true));
        assert_eq!(again.change, StatusChange::Unchanged);

        let second = lobby.update_status(worker(3).hit_id(), &ready(true));
        let formed: Vec<_> = second.formed().collect();
        assert_eq!(formed.len(), 1);
        assert_eq!(
            formed[0].hit_ids().cloned().collect::<Vec<_>>(),
            vec![HitId::new("HIT 1"), HitId::new("HIT 3")]
        );
        assert_eq!(lobby.num_in_lobby(), 1);
        assert_eq!(lobby.groups_formed(), 1);
    }

    #[test]
    fn not_ready_leaves_ready_queue() {
        let recorder = Arc::new(Recorder::default());
        let lobby = lobby(2, &recorder);
        lobby.user_joined(worker(1), &[]);
        lobby.user_joined(worker(2), &[]);
        lobby.update_status(worker(1).hit_id(), &ready(true));
        let update = lobby.update_status(worker(1).hit_id(), &ready(false));
        assert_eq!(update.change, StatusChange::BecameNotReady);
        assert_eq!(lobby.num_ready(), 0);

        lobby.update_status(worker(2).hit_id(), &ready(true));
        assert!(recorder.groups.lock().is_empty());
        lobby.update_status(worker(1).hit_id(), &ready(true));
        assert_eq!(recorder.groups.lock().len(), 1);
    }

    #[test]
    fn burst_of_ready_workers_forms_every_group() {
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn LobbyListener> = recorder.clone();
        let lobby = ReadyStateLobby::new(
            LobbyConfig::default()
                .with_group_size(2)
                .with_auto_ready(true),
            None,
            listener,
        );
        for n in 1..=5 {
            lobby.user_joined(worker(n), &[]);
        }
        let sequences: Vec<u64> = recorder
            .groups
            .lock()
            .iter()
            .map(HitWorkerGroup::sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(lobby.num_ready(), 1);
    }

    #[test]
    fn grouped_worker_cannot_rejoin_until_released() {
        let recorder = Arc::new(Recorder::default());
        let lobby = lobby(2, &recorder);
        lobby.user_joined(worker(1), &[]);
        lobby.user_joined(worker(2), &[]);
        lobby.update_status(worker(1).hit_id(), &ready(true));
        lobby.update_status(worker(2).hit_id(), &ready(true));
        assert!(lobby.is_grouped(worker(1).hit_id()));

        assert!(matches!(
            lobby.user_joined(worker(1), &[]),
            JoinOutcome::AlreadyGrouped
        ));
        assert_eq!(lobby.num_in_lobby(), 0);
        assert_eq!(
            lobby.update_status(worker(1).hit_id(), &ready(true)).change,
            StatusChange::NotInLobby
        );

        lobby.release_grouped([worker(1).hit_id(), worker(2).hit_id()]);
        assert!(!lobby.is_grouped(worker(1).hit_id()));
        assert!(lobby.user_joined(worker(1), &[]).is_admitted());
        assert_eq!(recorder.groups.lock().len(), 1);
    }

    #[test]
    fn malformed_and_unknown_updates_are_ignored() {
        let recorder = Arc::new(Recorder::default());
        let lobby = lobby(2, &recorder);
        lobby.user_joined(worker(1), &[]);
        let bad: StatusMap = serde_json::from_value(json!({ "ready": 1 })).unwrap();
        assert_eq!(
            lobby.update_status(worker(1).hit_id(), &bad).change,
            StatusChange::Ignored
        );
        assert_eq!(
            lobby.update_status(&HitId::new("stranger"), &ready(true)).change,
            StatusChange::NotInLobby
        );
        assert_eq!(lobby.num_ready(), 0);
    }

    #[test]
    fn quitting_ready_worker_does_not_count() {
        let recorder = Arc::new(Recorder::default());
        let lobby = lobby(2, &recorder);
        lobby.user_joined(worker(1), &[]);
        lobby.user_joined(worker(2), &[]);
        lobby.update_status(worker(1).hit_id(), &ready(true));
        assert!(lobby.user_quit(worker(1).hit_id()));
        assert!(!lobby.user_quit(worker(1).hit_id()));

        lobby.update_status(worker(2).hit_id(), &ready(true));
        assert!(recorder.groups.lock().is_empty());
        assert_eq!(lobby.num_ready(), 1);
    }

    #[test]
    fn quiz_policy_routes_before_admission() {
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn LobbyListener> = recorder.clone();
        let lobby = ReadyStateLobby::new(
            LobbyConfig::default(),
            Some(Arc::new(DefaultQuizPolicy)),
            listener,
        );
        let quiz = |correct, total| {
            Quiz::new(
                WorkerId::new("W1"),
                SetId::new("s"),
                None,
                correct,
                total,
                fixed_now(),
            )
            .unwrap()
        };

        assert!(matches!(
            lobby.user_joined(worker(1), &[]),
            JoinOutcome::QuizRequired
        ));
        assert!(matches!(
            lobby.user_joined(worker(1), &[quiz(1, 5), quiz(1, 5)]),
            JoinOutcome::LockedOut
        ));
        assert_eq!(lobby.num_in_lobby(), 0);
        assert!(lobby.user_joined(worker(1), &[quiz(5, 5)]).is_admitted());
    }

    #[test]
    fn failed_handoff_returns_members_to_waiting() {
        let recorder = Arc::new(Recorder {
            fail_sequences: vec![1],
            ..Recorder::default()
        });
        let lobby = lobby(2, &recorder);
        for n in 1..=4 {
            lobby.user_joined(worker(n), &[]);
        }
        lobby.update_status(worker(1).hit_id(), &ready(true));
        let update = lobby.update_status(worker(2).hit_id(), &ready(true));
        assert_eq!(update.unassigned().count(), 2);
        assert_eq!(lobby.num_in_lobby(), 4);
        assert_eq!(lobby.num_ready(), 0);
        assert_eq!(lobby.failed_handoffs(), 1);

        // Next batch still forms.
        lobby.update_status(worker(3).hit_id(), &ready(true));
        let update = lobby.update_status(worker(4).hit_id(), &ready(true));
        assert_eq!(update.formed().count(), 1);
        assert_eq!(recorder.groups.lock()[0].sequence(), 2);
    }

    #[test]
    fn panicking_listener_does_not_wedge_lobby() {
        let recorder = Arc::new(Recorder {
            panic_sequences: vec![1],
            ..Recorder::default()
        });
        let listener: Arc<dyn LobbyListener> = recorder.clone();
        let lobby = ReadyStateLobby::new(
            LobbyConfig::default()
                .with_group_size(1)
                .with_auto_ready(true),
            None,
            listener,
        );
        let JoinOutcome::Admitted(update) = lobby.user_joined(worker(1), &[]) else {
            panic!("expected admission");
        };
        assert!(matches!(
            update.handoffs[0].result,
            Err(HandoffError::ListenerPanicked)
        ));
        assert!(lobby.contains(worker(1).hit_id()));
        assert!(lobby.user_joined(worker(2), &[]).is_admitted());
        assert_eq!(lobby.groups_formed(), 1);
    }

    #[test]
    fn broadcasts_on_every_change_and_resets_on_shutdown() {
        let recorder = Arc::new(Recorder::default());
        let lobby = lobby(3, &recorder);
        lobby.user_joined(worker(1), &[]);
        lobby.update_status(worker(1).hit_id(), &ready(true));
        lobby.user_quit(worker(1).hit_id());
        let statuses = recorder.statuses.lock().clone();
        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses[1].ready, 1);
        assert_eq!(statuses[2].in_lobby, 0);

        lobby.user_joined(worker(2), &[]);
        let waiting = lobby.shutdown();
        assert_eq!(waiting.len(), 1);
        assert_eq!(lobby.status().joined, 0);
        assert!(matches!(
            lobby.user_joined(worker(3), &[]),
            JoinOutcome::Closed
        ));
    }
}
