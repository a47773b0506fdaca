use turk_core::model::HitWorkerGroup;

use super::status::LobbyStatus;
use crate::error::HandoffError;

/// Orchestration side of the lobby.
///
/// The lobby calls `create_new_experiment` while holding its lock, once per
/// formed group, so implementations must not call back into the lobby.
pub trait LobbyListener: Send + Sync {
    /// Hand a freshly formed group to an experiment instance.
    ///
    /// # Errors
    ///
    /// Returns `HandoffError` if no instance could take the group; the lobby
    /// then returns its members to the waiting pool.
    fn create_new_experiment(&self, group: &HitWorkerGroup) -> Result<(), HandoffError>;

    fn broadcast_lobby_message(&self, status: &LobbyStatus);

    fn num_experiments_running(&self) -> usize;

    fn num_users_connected(&self) -> usize;
}
