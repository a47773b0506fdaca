//! Ready-state lobby: admission, readiness tracking and group formation.

mod listener;
mod ready_state;
mod status;

pub use listener::LobbyListener;
pub use ready_state::ReadyStateLobby;
pub use status::{
    GroupHandoff, JoinOutcome, LobbyStatus, LobbyUpdate, StatusChange, StatusMap, ready_flag,
};
