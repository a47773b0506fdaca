use serde::{Deserialize, Serialize};

use crate::model::ids::SetId;
use crate::model::session::{SessionRecord, SessionStatus};

/// Session counts for one set, computed on demand.
///
/// `assigned` counts every claimed session, `completed` those with an
/// inactivity percentage, `submitted` those with a comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub set_id: SetId,
    pub created: u32,
    pub assigned: u32,
    pub completed: u32,
    pub submitted: u32,
}

impl SessionSummary {
    #[must_use]
    pub fn empty(set_id: SetId) -> Self {
        Self {
            set_id,
            created: 0,
            assigned: 0,
            completed: 0,
            submitted: 0,
        }
    }

    /// Tallies the records that belong to `set_id`; others are skipped.
    #[must_use]
    pub fn from_records<'a>(
        set_id: SetId,
        records: impl IntoIterator<Item = &'a SessionRecord>,
    ) -> Self {
        let mut summary = Self::empty(set_id);
        for record in records {
            if record.set_id() != &summary.set_id {
                continue;
            }
            summary.created = summary.created.saturating_add(1);
            if record.worker_id().is_some() {
                summary.assigned = summary.assigned.saturating_add(1);
            }
            if record.status() == SessionStatus::Completed {
                summary.completed = summary.completed.saturating_add(1);
            }
            if record.comment().is_some() {
                summary.submitted = summary.submitted.saturating_add(1);
            }
        }
        summary
    }
}
