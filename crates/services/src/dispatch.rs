//! Lobby listener that hands formed groups to the instance pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{broadcast, mpsc};
use turk_core::model::{ExperimentId, HitWorkerGroup};

use crate::error::HandoffError;
use crate::lobby::{LobbyListener, LobbyStatus};
use crate::pool::{ExperimentFactory, ExperimentInstancePool, HostHandle};

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// A group bound to a running experiment whose sessions still need to be
/// moved to EXPERIMENT in storage.
#[derive(Debug, Clone)]
pub struct DispatchedGroup {
    pub experiment_id: ExperimentId,
    pub group: HitWorkerGroup,
}

/// Binds each formed group inside the lobby lock and queues the durable
/// writes for later, so no storage I/O happens under that lock.
pub struct GroupDispatcher<F: ExperimentFactory> {
    pool: Arc<ExperimentInstancePool<F>>,
    host: HostHandle,
    dispatched: mpsc::UnboundedSender<DispatchedGroup>,
    lobby_status: broadcast::Sender<LobbyStatus>,
    connected: AtomicUsize,
}

impl<F: ExperimentFactory> GroupDispatcher<F> {
    #[must_use]
    pub fn new(
        pool: Arc<ExperimentInstancePool<F>>,
        host: HostHandle,
    ) -> (Self, mpsc::UnboundedReceiver<DispatchedGroup>) {
        let (dispatched, rx) = mpsc::unbounded_channel();
        let (lobby_status, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        (
            Self {
                pool,
                host,
                dispatched,
                lobby_status,
                connected: AtomicUsize::new(0),
            },
            rx,
        )
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ExperimentInstancePool<F>> {
        &self.pool
    }

    /// Receive every lobby status broadcast from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LobbyStatus> {
        self.lobby_status.subscribe()
    }

    pub fn connection_opened(&self) {
        self.connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: a close after `reset` must not wrap.
        let _ = self
            .connected
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn reset(&self) {
        self.connected.store(0, Ordering::Relaxed);
    }
}

impl<F: ExperimentFactory> LobbyListener for GroupDispatcher<F> {
    fn create_new_experiment(&self, group: &HitWorkerGroup) -> Result<(), HandoffError> {
        let bound = self.pool.get_new_experiment(&self.host, group)?;
        let experiment_id = bound.id;
        let queued = self.dispatched.send(DispatchedGroup {
            experiment_id,
            group: bound.group,
        });
        if queued.is_err() {
            self.pool.finish(experiment_id);
            return Err(HandoffError::QueueClosed);
        }
        tracing::info!(
            experiment_id = %experiment_id,
            sequence = group.sequence(),
            group_size = group.group_size(),
            "dispatched group"
        );
        Ok(())
    }

    fn broadcast_lobby_message(&self, status: &LobbyStatus) {
        // No subscribers is fine.
        let _ = self.lobby_status.send(status.clone());
    }

    fn num_experiments_running(&self) -> usize {
        self.pool.running_count()
    }

    fn num_users_connected(&self) -> usize {
        self.connected.load(Ordering::Relaxed)
    }
}
