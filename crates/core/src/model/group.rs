use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

use crate::model::ids::{ConnectionId, HitId, WorkerId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GroupError {
    #[error("a group needs at least one member")]
    Empty,

    #[error("session {0} appears more than once in the group")]
    DuplicateMember(HitId),
}

/// A worker's live presence: which session it claimed and which connection
/// carries its messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HitWorker {
    hit_id: HitId,
    worker_id: WorkerId,
    connection: ConnectionId,
}

impl HitWorker {
    #[must_use]
    pub fn new(hit_id: HitId, worker_id: WorkerId, connection: ConnectionId) -> Self {
        Self {
            hit_id,
            worker_id,
            connection,
        }
    }

    #[must_use]
    pub fn hit_id(&self) -> &HitId {
        &self.hit_id
    }

    #[must_use]
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Same session, fresh connection (reconnect).
    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionId) -> Self {
        self.connection = connection;
        self
    }
}

/// The workers admitted together into one experiment instance.
///
/// Built once by the lobby; membership never changes afterwards.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitWorkerGroup {
    sequence: u64,
    members: Vec<HitWorker>,
}

impl HitWorkerGroup {
    /// # Errors
    ///
    /// Returns `GroupError::Empty` for no members and
    /// `GroupError::DuplicateMember` if a session appears twice.
    pub fn new(sequence: u64, members: Vec<HitWorker>) -> Result<Self, GroupError> {
        if members.is_empty() {
            return Err(GroupError::Empty);
        }
        let mut seen = HashSet::with_capacity(members.len());
        for member in &members {
            if !seen.insert(member.hit_id()) {
                return Err(GroupError::DuplicateMember(member.hit_id().clone()));
            }
        }
        Ok(Self { sequence, members })
    }

    /// Position of this group among all groups formed by its lobby, from 1.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn group_size(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn members(&self) -> &[HitWorker] {
        &self.members
    }

    pub fn hit_ids(&self) -> impl Iterator<Item = &HitId> {
        self.members.iter().map(HitWorker::hit_id)
    }

    pub fn worker_ids(&self) -> impl Iterator<Item = &WorkerId> {
        self.members.iter().map(HitWorker::worker_id)
    }

    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.members.iter().map(HitWorker::connection)
    }

    #[must_use]
    pub fn contains(&self, hit_id: &HitId) -> bool {
        self.members.iter().any(|m| m.hit_id() == hit_id)
    }
}

impl fmt::Debug for HitWorkerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HitWorkerGroup")
            .field("sequence", &self.sequence)
            .field("hit_ids", &self.hit_ids().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(n: u64) -> HitWorker {
        HitWorker::new(
            HitId::new(format!("HIT {n}")),
            WorkerId::new(format!("Worker {n}")),
            ConnectionId::new(n),
        )
    }

    #[test]
    fn exposes_membership() {
        let group = HitWorkerGroup::new(1, vec![worker(1), worker(2), worker(3)]).unwrap();
        assert_eq!(group.group_size(), 3);
        assert!(group.contains(&HitId::new("HIT 2")));
        assert_eq!(
            group.connections().collect::<Vec<_>>(),
            vec![ConnectionId::new(1), ConnectionId::new(2), ConnectionId::new(3)]
        );
    }

    #[test]
    fn rejects_duplicates_and_empty() {
        assert_eq!(HitWorkerGroup::new(1, Vec::new()), Err(GroupError::Empty));
        let dup = worker(1).with_connection(ConnectionId::new(99));
        assert_eq!(
            HitWorkerGroup::new(1, vec![worker(1), dup]),
            Err(GroupError::DuplicateMember(HitId::new("HIT 1")))
        );
    }
}
