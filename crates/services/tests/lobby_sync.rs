use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use services::{
    HandoffError, JoinOutcome, LobbyConfig, LobbyListener, LobbyStatus, ReadyStateLobby, StatusMap,
};
use turk_core::model::{ConnectionId, HitId, HitWorker, HitWorkerGroup, WorkerId};

const WORKERS: u64 = 300;
const GROUP_SIZE: usize = 3;

#[derive(Default)]
struct Collector {
    groups: Mutex<Vec<HitWorkerGroup>>,
}

impl LobbyListener for Collector {
    fn create_new_experiment(&self, group: &HitWorkerGroup) -> Result<(), HandoffError> {
        // Simulated instance start-up inside the lobby lock.
        thread::sleep(Duration::from_micros(50));
        self.groups.lock().unwrap().push(group.clone());
        Ok(())
    }

    fn broadcast_lobby_message(&self, _status: &LobbyStatus) {}

    fn num_experiments_running(&self) -> usize {
        self.groups.lock().unwrap().len()
    }

    fn num_users_connected(&self) -> usize {
        0
    }
}

fn worker(n: u64) -> HitWorker {
    HitWorker::new(
        HitId::new(format!("HIT {n}")),
        WorkerId::new(format!("Worker {n}")),
        ConnectionId::new(n),
    )
}

fn ready() -> StatusMap {
    serde_json::from_value(json!({ "ready": true })).unwrap()
}

fn random_pause() {
    let ms = rand::rng().random_range(0..4);
    thread::sleep(Duration::from_millis(ms));
}

/// Runs `workers` concurrent arrivals; each thread joins, pauses, and then
/// calls `after_join`.
fn run_arrivals(
    lobby: &Arc<ReadyStateLobby>,
    workers: u64,
    after_join: impl Fn(&ReadyStateLobby, &HitWorker) + Send + Sync + Copy + 'static,
) {
    let handles: Vec<_> = (1..=workers)
        .map(|n| {
            let lobby = Arc::clone(lobby);
            thread::spawn(move || {
                random_pause();
                let w = worker(n);
                assert!(matches!(
                    lobby.user_joined(w.clone(), &[]),
                    JoinOutcome::Admitted(_)
                ));
                random_pause();
                after_join(&lobby, &w);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

fn assert_exact_partition(groups: &[HitWorkerGroup], covered: usize) {
    let mut seen = HashSet::new();
    for group in groups {
        assert_eq!(group.group_size(), GROUP_SIZE);
        for hit_id in group.hit_ids() {
            assert!(seen.insert(hit_id.clone()), "{hit_id} grouped twice");
        }
    }
    assert_eq!(seen.len(), covered);
    let mut sequences: Vec<u64> = groups.iter().map(HitWorkerGroup::sequence).collect();
    sequences.sort_unstable();
    let expected: Vec<u64> = (1..=groups.len() as u64).collect();
    assert_eq!(sequences, expected);
}

fn new_lobby(auto_ready: bool) -> (Arc<ReadyStateLobby>, Arc<Collector>) {
    let collector = Arc::new(Collector::default());
    let listener: Arc<dyn LobbyListener> = collector.clone();
    let lobby = ReadyStateLobby::new(
        LobbyConfig::default()
            .with_group_size(GROUP_SIZE)
            .with_auto_ready(auto_ready),
        None,
        listener,
    );
    (Arc::new(lobby), collector)
}

#[test]
fn concurrent_ready_workers_partition_exactly() {
    let (lobby, collector) = new_lobby(false);
    run_arrivals(&lobby, WORKERS, |lobby, w| {
        lobby.update_status(w.hit_id(), &ready());
    });

    let groups = collector.groups.lock().unwrap();
    assert_eq!(groups.len(), 100);
    assert_exact_partition(&groups, 300);
    assert_eq!(lobby.num_in_lobby(), 0);
    assert_eq!(lobby.groups_formed(), 100);
}

#[test]
fn repeated_runs_never_duplicate_or_lose_groups() {
    for _ in 0..5 {
        let (lobby, collector) = new_lobby(false);
        run_arrivals(&lobby, WORKERS, |lobby, w| {
            lobby.update_status(w.hit_id(), &ready());
        });
        let groups = collector.groups.lock().unwrap();
        assert_eq!(groups.len(), 100);
        assert_exact_partition(&groups, 300);
    }
}

#[test]
fn auto_ready_with_redundant_updates() {
    let (lobby, collector) = new_lobby(true);
    run_arrivals(&lobby, WORKERS, |lobby, w| {
        if rand::rng().random_bool(0.5) {
            lobby.update_status(w.hit_id(), &ready());
        }
    });

    let groups = collector.groups.lock().unwrap();
    assert_eq!(groups.len(), 100);
    assert_exact_partition(&groups, 300);
}

#[test]
fn remainder_stays_waiting() {
    let (lobby, collector) = new_lobby(false);
    run_arrivals(&lobby, WORKERS + 2, |lobby, w| {
        lobby.update_status(w.hit_id(), &ready());
    });

    let groups = collector.groups.lock().unwrap();
    assert_eq!(groups.len(), 100);
    assert_exact_partition(&groups, 300);
    assert_eq!(lobby.num_in_lobby(), 2);
    assert_eq!(lobby.num_ready(), 2);
}

#[test]
fn disconnects_while_waiting_do_not_skew_counts() {
    let (lobby, collector) = new_lobby(false);
    // Every tenth worker leaves instead of readying: 30 quit, 270 ready.
    run_arrivals(&lobby, WORKERS, |lobby, w| {
        let n: u64 = w.connection().value();
        if n % 10 == 0 {
            assert!(lobby.user_quit(w.hit_id()));
        } else {
            lobby.update_status(w.hit_id(), &ready());
        }
    });

    let groups = collector.groups.lock().unwrap();
    assert_eq!(groups.len(), 90);
    assert_exact_partition(&groups, 270);
    assert!(
        groups
            .iter()
            .flat_map(HitWorkerGroup::members)
            .all(|m| m.connection().value() % 10 != 0)
    );
    assert_eq!(lobby.num_in_lobby(), 0);
}
