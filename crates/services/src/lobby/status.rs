use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use turk_core::model::{HitWorker, HitWorkerGroup};

use crate::error::HandoffError;

/// Flat key/value status update sent by a client, e.g. `{"ready": true}`.
pub type StatusMap = HashMap<String, serde_json::Value>;

/// Reads the `ready` key of a status update.
///
/// `Ok(None)` when the key is absent.
///
/// # Errors
///
/// Returns the offending value when `ready` is present but not a boolean.
pub fn ready_flag(status: &StatusMap) -> Result<Option<bool>, &serde_json::Value> {
    match status.get("ready") {
        None => Ok(None),
        Some(serde_json::Value::Bool(ready)) => Ok(Some(*ready)),
        Some(other) => Err(other),
    }
}

/// Occupancy snapshot broadcast on every lobby change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyStatus {
    pub in_lobby: usize,
    pub ready: usize,
    pub group_size: usize,
    /// Admissions since the lobby started.
    pub joined: usize,
    pub experiments_running: usize,
}

/// What a status update did to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    BecameReady,
    BecameNotReady,
    Unchanged,
    /// Malformed update, dropped.
    Ignored,
    NotInLobby,
}

/// One formed group and how its handoff went.
#[derive(Debug)]
pub struct GroupHandoff {
    pub group: HitWorkerGroup,
    pub result: Result<(), HandoffError>,
}

impl GroupHandoff {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Result of a lobby event: the sender's change plus every group the event
/// caused to form.
#[derive(Debug)]
pub struct LobbyUpdate {
    pub change: StatusChange,
    pub handoffs: Vec<GroupHandoff>,
}

impl LobbyUpdate {
    pub(crate) fn unchanged(change: StatusChange) -> Self {
        Self {
            change,
            handoffs: Vec::new(),
        }
    }

    /// Groups that reached an experiment instance.
    pub fn formed(&self) -> impl Iterator<Item = &HitWorkerGroup> {
        self.handoffs
            .iter()
            .filter(|h| h.succeeded())
            .map(|h| &h.group)
    }

    /// Workers whose group failed to hand off; they are waiting again, not
    /// ready.
    pub fn unassigned(&self) -> impl Iterator<Item = &HitWorker> {
        self.handoffs
            .iter()
            .filter(|h| !h.succeeded())
            .flat_map(|h| h.group.members())
    }
}

/// Outcome of `ReadyStateLobby::user_joined`.
#[derive(Debug)]
pub enum JoinOutcome {
    Admitted(LobbyUpdate),
    /// Routed to the quiz flow; not in the lobby.
    QuizRequired,
    /// Failed the quiz too often; never enters the lobby.
    LockedOut,
    /// Already handed off in a group that is still being placed or run.
    AlreadyGrouped,
    /// The lobby was shut down.
    Closed,
}

impl JoinOutcome {
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, JoinOutcome::Admitted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status(value: serde_json::Value) -> StatusMap {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn ready_flag_reads_booleans_only() {
        assert_eq!(ready_flag(&status(json!({"ready": true}))), Ok(Some(true)));
        assert_eq!(ready_flag(&status(json!({"ready": false}))), Ok(Some(false)));
        assert_eq!(ready_flag(&status(json!({"chat": "hi"}))), Ok(None));
        assert!(ready_flag(&status(json!({"ready": "yes"}))).is_err());
    }
}
