use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use services::{
    ExperimentFactory, ExperimentFactoryError, HostHandle, JoinOutcome, LobbyConfig, PoolConfig,
    QuizConfig, ServerConfig, SessionServer, StatusMap,
};
use storage::repository::Storage;
use turk_core::model::{
    AssignmentId, ExperimentId, HitId, HitWorkerGroup, SessionStatus, SetId, WorkerId,
};
use turk_core::time::fixed_clock;

const WORKERS: u32 = 300;
const GROUP_SIZE: usize = 3;

struct Tables;

impl ExperimentFactory for Tables {
    type Instance = Vec<HitId>;

    fn experiment_size(&self) -> usize {
        GROUP_SIZE
    }

    fn create(&self) -> Result<Vec<HitId>, ExperimentFactoryError> {
        Ok(Vec::new())
    }

    fn bind(
        &self,
        seats: &mut Vec<HitId>,
        _host: &HostHandle,
        group: &HitWorkerGroup,
        _experiment_id: ExperimentId,
    ) -> Result<(), ExperimentFactoryError> {
        *seats = group.hit_ids().cloned().collect();
        Ok(())
    }
}

fn ready() -> StatusMap {
    serde_json::from_value(json!({ "ready": true })).unwrap()
}

async fn pause() {
    let millis = rand::rng().random_range(0..4);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

async fn arrive(server: Arc<SessionServer<Tables>>, n: u32) {
    pause().await;
    let hit_id = HitId::new(format!("HIT {n}"));
    let worker = server
        .connect(
            &hit_id,
            &AssignmentId::new(format!("A{n}")),
            &WorkerId::new(format!("W{n}")),
        )
        .await
        .unwrap();
    let connection = worker.connection();
    assert!(
        server
            .enter_lobby(connection, None)
            .await
            .unwrap()
            .outcome
            .is_admitted()
    );

    // A resent join races this worker's own ready and other workers' groups.
    let resent = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            pause().await;
            server.enter_lobby(connection, None).await
        })
    };
    pause().await;
    server.update_status(connection, &ready()).await.unwrap();
    server.update_status(connection, &ready()).await.unwrap();

    // Either still waiting, already grouped, or already in EXPERIMENT.
    if let Ok(event) = resent.await.unwrap() {
        assert!(matches!(
            event.outcome,
            JoinOutcome::Admitted(_) | JoinOutcome::AlreadyGrouped
        ));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_server_arrivals_partition_sessions_exactly() {
    let storage = Storage::in_memory();
    let config = ServerConfig::default()
        .with_set_id(SetId::new("pilot"))
        .with_lobby(LobbyConfig::default().with_group_size(GROUP_SIZE))
        .with_pool(PoolConfig::uncached())
        .with_quiz(QuizConfig::Disabled);
    let server = Arc::new(
        SessionServer::new(config, storage.clone(), Tables, fixed_clock()).expect("valid config"),
    );

    let tasks: Vec<_> = (1..=WORKERS)
        .map(|n| tokio::spawn(arrive(Arc::clone(&server), n)))
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
    assert!(server.flush_dispatched().await.is_empty());

    let mut groups: HashMap<ExperimentId, Vec<HitId>> = HashMap::new();
    for n in 1..=WORKERS {
        let hit_id = HitId::new(format!("HIT {n}"));
        let record = storage.sessions.get_session(&hit_id).await.unwrap().unwrap();
        assert_eq!(record.status(), SessionStatus::Experiment, "{hit_id}");
        let experiment_id = record.experiment_id().unwrap();
        groups.entry(experiment_id).or_default().push(hit_id);
    }

    assert_eq!(groups.len(), WORKERS as usize / GROUP_SIZE);
    let mut seen = HashSet::new();
    for (experiment_id, members) in &groups {
        assert_eq!(members.len(), GROUP_SIZE, "{experiment_id}");
        for hit_id in members {
            assert!(seen.insert(hit_id.clone()), "{hit_id} placed twice");
        }
    }
    assert_eq!(seen.len(), WORKERS as usize);

    assert_eq!(server.lobby().groups_formed(), groups.len());
    assert_eq!(server.lobby().num_in_lobby(), 0);
    assert_eq!(server.pool_stats().running, groups.len());
    assert_eq!(server.lobby().failed_handoffs(), 0);
}
