use serde_json::json;
use services::{
    ExperimentFactory, ExperimentFactoryError, HostHandle, JoinOutcome, LobbyConfig, PoolConfig,
    QuizConfig, ServerConfig, ServerError, SessionError, SessionServer, StatusMap,
};
use storage::repository::Storage;
use turk_core::model::{
    AssignmentId, ExperimentId, HitId, HitWorker, HitWorkerGroup, SessionStatus, SetId, WorkerId,
};
use turk_core::time::fixed_clock;

struct Room {
    host: String,
    members: Vec<HitId>,
}

struct RoomFactory;

impl ExperimentFactory for RoomFactory {
    type Instance = Room;

    fn experiment_size(&self) -> usize {
        3
    }

    fn create(&self) -> Result<Room, ExperimentFactoryError> {
        Ok(Room {
            host: String::new(),
            members: Vec::new(),
        })
    }

    fn bind(
        &self,
        room: &mut Room,
        host: &HostHandle,
        group: &HitWorkerGroup,
        _experiment_id: ExperimentId,
    ) -> Result<(), ExperimentFactoryError> {
        room.host = host.name().to_string();
        room.members = group.hit_ids().cloned().collect();
        Ok(())
    }
}

fn config(quiz: QuizConfig) -> ServerConfig {
    ServerConfig::default()
        .with_set_id(SetId::new("pilot"))
        .with_lobby(LobbyConfig::default().with_group_size(3))
        .with_pool(PoolConfig::uncached())
        .with_quiz(quiz)
}

fn server(quiz: QuizConfig) -> (SessionServer<RoomFactory>, Storage) {
    let storage = Storage::in_memory();
    let server = SessionServer::new(config(quiz), storage.clone(), RoomFactory, fixed_clock())
        .expect("valid config");
    (server, storage)
}

fn ready() -> StatusMap {
    serde_json::from_value(json!({ "ready": true })).unwrap()
}

async fn connect(server: &SessionServer<RoomFactory>, n: u32) -> HitWorker {
    server
        .connect(
            &HitId::new(format!("HIT {n}")),
            &AssignmentId::new(format!("A{n}")),
            &WorkerId::new(format!("W{n}")),
        )
        .await
        .expect("connect")
}

#[tokio::test]
async fn quiz_lobby_experiment_and_completion() {
    let (server, storage) = server(QuizConfig::Default);
    let prewarm = server.start().await.unwrap();

    let mut workers = Vec::new();
    for n in 1..=3 {
        workers.push(connect(&server, n).await);
    }
    assert_eq!(server.num_users_connected(), 3);

    let first = server.enter_lobby(workers[0].connection(), None).await.unwrap();
    assert!(matches!(first.outcome, JoinOutcome::QuizRequired));
    assert_eq!(server.lobby().num_in_lobby(), 0);

    for w in &workers {
        let event = server.submit_quiz(w.connection(), 5, 5).await.unwrap();
        assert!(event.outcome.is_admitted());
    }
    assert_eq!(server.lobby().num_in_lobby(), 3);

    let mut placed = Vec::new();
    for w in &workers {
        let event = server.update_status(w.connection(), &ready()).await.unwrap();
        assert!(event.dispatch.unassigned.is_empty());
        placed.extend(event.dispatch.placed);
    }
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].hit_ids.len(), 3);
    let experiment_id = placed[0].experiment_id;

    for w in &workers {
        let record = storage.sessions.get_session(w.hit_id()).await.unwrap().unwrap();
        assert_eq!(record.status(), SessionStatus::Experiment);
        assert_eq!(record.experiment_id(), Some(experiment_id));
        assert_eq!(record.username(), Some(w.worker_id().as_str()));
    }
    assert_eq!(server.lobby().num_experiments_running(), 1);

    server.start_round(experiment_id, 1).await.unwrap();
    server
        .round_input(experiment_id, 1, "{\"prices\":[1,2,3]}")
        .await
        .unwrap();
    server.end_round(experiment_id, 1, "{\"winner\":\"W2\"}").await.unwrap();

    let inactivity: Vec<(HitId, f64)> = workers
        .iter()
        .zip([0.0, 0.5, 1.0])
        .map(|(w, pct)| (w.hit_id().clone(), pct))
        .collect();
    let report = server
        .experiment_finished(experiment_id, &inactivity, "{\"payoff\":3}")
        .await
        .unwrap();
    assert_eq!(report.completed.len(), 3);
    assert!(report.failed.is_empty());
    assert_eq!(server.pool_stats().running, 0);
    assert!(!server.lobby().is_grouped(workers[0].hit_id()));
    assert!(matches!(
        server.start_round(experiment_id, 2).await,
        Err(ServerError::UnknownExperiment(_))
    ));

    let hit1 = workers[0].hit_id().clone();
    assert!(server.submit_comment(&hit1, "fun game").await.unwrap());
    let summary = server.summary().await.unwrap();
    assert_eq!(
        (summary.created, summary.assigned, summary.completed, summary.submitted),
        (3, 3, 3, 1)
    );
    assert_eq!(server.list_completed().await.unwrap().len(), 3);

    assert!(matches!(
        server.delete_session(&hit1).await,
        Err(ServerError::Session(SessionError::RefusedDeletion { .. }))
    ));

    let (record, rounds) = server.experiment(experiment_id).await.unwrap().unwrap();
    assert!(record.is_finished());
    assert_eq!(record.participants, 3);
    assert_eq!(rounds.len(), 1);

    server.shutdown();
    prewarm.await.unwrap();
}

#[tokio::test]
async fn failing_quiz_locks_worker_out() {
    let (server, _storage) = server(QuizConfig::Default);
    let w = connect(&server, 1).await;

    let almost = server.submit_quiz(w.connection(), 4, 5).await.unwrap();
    assert!(matches!(almost.outcome, JoinOutcome::QuizRequired));

    let failed = server.submit_quiz(w.connection(), 0, 5).await.unwrap();
    assert!(matches!(failed.outcome, JoinOutcome::LockedOut));
    assert!(!server.lobby().contains(w.hit_id()));

    assert!(matches!(
        server.submit_quiz(w.connection(), 6, 5).await,
        Err(ServerError::Quiz(_))
    ));
}

#[tokio::test]
async fn second_worker_cannot_claim_taken_hit() {
    let (server, _storage) = server(QuizConfig::Disabled);
    connect(&server, 1).await;
    let err = server
        .connect(
            &HitId::new("HIT 1"),
            &AssignmentId::new("A9"),
            &WorkerId::new("W9"),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServerError::Session(SessionError::AlreadyAssigned { .. })
    ));
}

#[tokio::test]
async fn expired_hits_cannot_be_claimed() {
    let (server, _storage) = server(QuizConfig::Disabled);
    let stale = HitId::new("HIT stale");
    server.tracker().open(&stale).await.unwrap();
    connect(&server, 1).await;

    assert_eq!(server.expire_unused().await.unwrap(), vec![stale.clone()]);
    let err = server
        .connect(&stale, &AssignmentId::new("A2"), &WorkerId::new("W2"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Session(SessionError::Expired(_))));
}

#[tokio::test]
async fn disconnect_and_clear_remove_waiting_workers() {
    let (server, storage) = server(QuizConfig::Disabled);
    let mut status = server.subscribe_status();
    let a = connect(&server, 1).await;
    let b = connect(&server, 2).await;

    server.enter_lobby(a.connection(), Some("alice")).await.unwrap();
    server.enter_lobby(b.connection(), None).await.unwrap();
    server.update_status(a.connection(), &ready()).await.unwrap();
    assert_eq!(status.recv().await.unwrap().in_lobby, 1);

    assert!(server.disconnect(a.connection()).unwrap());
    assert!(matches!(
        server.disconnect(a.connection()),
        Err(ServerError::UnknownConnection(_))
    ));
    assert_eq!(server.lobby().num_ready(), 0);

    let cleared = server.clear_worker(b.hit_id()).await.unwrap();
    assert_eq!(cleared.status(), SessionStatus::Unused);
    assert!(!server.lobby().contains(b.hit_id()));
    assert_eq!(
        storage
            .sessions
            .get_session(b.hit_id())
            .await
            .unwrap()
            .unwrap()
            .worker_id(),
        None
    );
    // Unused sessions may be deleted.
    server.delete_session(b.hit_id()).await.unwrap();
}

#[test]
fn factory_size_must_match_group_size() {
    let config = config(QuizConfig::Disabled).with_lobby(LobbyConfig::default().with_group_size(2));
    assert!(matches!(
        SessionServer::new(config, Storage::in_memory(), RoomFactory, fixed_clock()),
        Err(ServerError::Config(_))
    ));
}
