#![forbid(unsafe_code)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod lobby;
pub mod pool;
pub mod server;
pub mod tracker;

pub use turk_core::Clock;

pub use config::{LobbyConfig, PoolConfig, QuizConfig, ServerConfig};
pub use dispatch::{DispatchedGroup, GroupDispatcher};
pub use error::{
    ConfigError, ExperimentFactoryError, HandoffError, ServerError, SessionError,
};
pub use lobby::{
    GroupHandoff, JoinOutcome, LobbyListener, LobbyStatus, LobbyUpdate, ReadyStateLobby,
    StatusChange, StatusMap,
};
pub use pool::{BoundExperiment, ExperimentFactory, ExperimentInstancePool, HostHandle, PoolStats};
pub use server::{DispatchReport, FinishReport, LobbyEvent, PlacedGroup, SessionServer};
pub use tracker::SessionTracker;
