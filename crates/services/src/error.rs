//! Shared error types for the services crate.

use thiserror::Error;

use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;
use turk_core::model::{
    ConnectionId, ExperimentId, HitId, QuizError, SessionStatus, SessionTransitionError, WorkerId,
};

/// Errors emitted by an `ExperimentFactory` or the instance pool around it.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExperimentFactoryError {
    #[error("experiment construction failed: {0}")]
    Construction(String),
    #[error("group of {actual} does not fit experiments of size {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("invalid experiment configuration: {0}")]
    Configuration(String),
    #[error("experiment pool is shut down")]
    ShutDown,
}

/// Errors reported for a formed group whose handoff did not complete.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandoffError {
    #[error(transparent)]
    Factory(#[from] ExperimentFactoryError),
    #[error("listener panicked while creating the experiment")]
    ListenerPanicked,
    #[error("dispatch queue is closed")]
    QueueClosed,
}

/// Errors emitted by session services.
///
/// Storage errors that carry a domain meaning are lifted into their own
/// variants by the `From` impls below.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("session {hit_id} is already assigned to worker {worker_id}")]
    AlreadyAssigned { hit_id: HitId, worker_id: WorkerId },
    #[error("session {0} has expired")]
    Expired(HitId),
    #[error("refusing to delete or reset session {hit_id} in state {status}")]
    RefusedDeletion { hit_id: HitId, status: SessionStatus },
    #[error("session {0} not found")]
    NotFound(HitId),
    #[error(transparent)]
    Transition(SessionTransitionError),
    #[error(transparent)]
    Storage(StorageError),
}

impl From<SessionTransitionError> for SessionError {
    fn from(e: SessionTransitionError) -> Self {
        match e {
            SessionTransitionError::AlreadyAssigned { hit_id, worker_id } => {
                Self::AlreadyAssigned { hit_id, worker_id }
            }
            SessionTransitionError::Refused { hit_id, status } => {
                Self::RefusedDeletion { hit_id, status }
            }
            other => Self::Transition(other),
        }
    }
}

impl From<StorageError> for SessionError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Expired(hit_id) => Self::Expired(hit_id),
            StorageError::Transition(t) => t.into(),
            other => Self::Storage(other),
        }
    }
}

/// Invalid configuration values.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("group size must be at least 1")]
    GroupSize,
    #[error("pool low watermark {low_watermark} exceeds max cached {max_cached}")]
    Watermark {
        low_watermark: usize,
        max_cached: usize,
    },
    #[error("pre-warm interval must be non-zero")]
    PrewarmInterval,
    #[error("pass rate {0} must be within (0, 1]")]
    PassRate(f64),
    #[error("max fails must be at least 1")]
    MaxFails,
    #[error("host name must not be empty")]
    Host,
    #[error("factory builds experiments of size {factory}, lobby forms groups of {lobby}")]
    FactorySize { factory: usize, lobby: usize },
}

/// Errors emitted by `SessionServer`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Quiz(#[from] QuizError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("experiment {0} is not running")]
    UnknownExperiment(ExperimentId),
    #[error(transparent)]
    Storage(StorageError),
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
}

impl From<StorageError> for ServerError {
    fn from(e: StorageError) -> Self {
        match SessionError::from(e) {
            SessionError::Storage(inner) => Self::Storage(inner),
            lifted => Self::Session(lifted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_lift_into_session_taxonomy() {
        let hit = HitId::new("HIT 1");
        assert!(matches!(
            SessionError::from(StorageError::Expired(hit.clone())),
            SessionError::Expired(_)
        ));
        assert!(matches!(
            SessionError::from(StorageError::Transition(
                SessionTransitionError::AlreadyAssigned {
                    hit_id: hit.clone(),
                    worker_id: WorkerId::new("W1"),
                }
            )),
            SessionError::AlreadyAssigned { .. }
        ));
        assert!(matches!(
            SessionError::from(StorageError::Transition(SessionTransitionError::Refused {
                hit_id: hit,
                status: SessionStatus::Experiment,
            })),
            SessionError::RefusedDeletion { .. }
        ));
        assert!(matches!(
            ServerError::from(StorageError::Conflict),
            ServerError::Storage(StorageError::Conflict)
        ));
    }
}
