use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::{AssignmentId, ExperimentId, HitId, SetId, WorkerId};

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum SessionTransitionError {
    #[error("session {hit_id} is already assigned to worker {worker_id}")]
    AlreadyAssigned { hit_id: HitId, worker_id: WorkerId },

    #[error("session {hit_id} is {status} and cannot be reset or deleted")]
    Refused { hit_id: HitId, status: SessionStatus },

    #[error("session {hit_id} cannot move from {from} to {to}")]
    InvalidTransition {
        hit_id: HitId,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("session {hit_id} is already bound to experiment {experiment_id}")]
    AlreadyPlaced {
        hit_id: HitId,
        experiment_id: ExperimentId,
    },

    #[error("inactivity percentage must be within 0.0..=1.0, got {0}")]
    InvalidPercent(f64),
}

//
// ─── STATUS ────────────────────────────────────────────────────────────────────
//

/// Lifecycle position of a session, derived from which fields are set.
///
/// `Unused → Assigned → Active → Experiment → Completed`, plus `Expired`
/// reachable only from `Unused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionStatus {
    Unused,
    Assigned,
    Active,
    Experiment,
    Completed,
    Expired,
}

impl SessionStatus {
    /// The transition table. Staying in the same state is always allowed so
    /// that repeated calls are safe.
    #[must_use]
    pub fn permits(self, to: SessionStatus) -> bool {
        use SessionStatus::{Active, Assigned, Completed, Expired, Experiment, Unused};

        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (Unused, Assigned)
                | (Assigned, Active)
                | (Active, Experiment)
                | (Experiment, Completed)
                | (Unused, Expired)
                | (Assigned | Active, Unused)
        )
    }

    /// Sessions bound to an experiment or finished are never reset or deleted.
    #[must_use]
    pub fn is_protected(self) -> bool {
        matches!(self, SessionStatus::Experiment | SessionStatus::Completed)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Unused => "unused",
            SessionStatus::Assigned => "assigned",
            SessionStatus::Active => "active",
            SessionStatus::Experiment => "experiment",
            SessionStatus::Completed => "completed",
            SessionStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of applying a transition to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

impl Transition {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

//
// ─── SESSION RECORD ────────────────────────────────────────────────────────────
//

/// One participant's single visit.
///
/// Fields are only mutated through the transition methods below, each of
/// which consults [`SessionStatus::permits`]. Storage adapters call the same
/// methods, so the transition table lives in exactly one place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    hit_id: HitId,
    set_id: SetId,
    assignment_id: Option<AssignmentId>,
    worker_id: Option<WorkerId>,
    username: Option<String>,
    experiment_id: Option<ExperimentId>,
    inactive_percent: Option<f64>,
    comment: Option<String>,
    created_at: DateTime<Utc>,
    assigned_at: Option<DateTime<Utc>>,
    login_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// A fresh, unclaimed session for a newly seen HIT.
    #[must_use]
    pub fn new(hit_id: HitId, set_id: SetId, created_at: DateTime<Utc>) -> Self {
        Self {
            hit_id,
            set_id,
            assignment_id: None,
            worker_id: None,
            username: None,
            experiment_id: None,
            inactive_percent: None,
            comment: None,
            created_at,
            assigned_at: None,
            login_at: None,
            completed_at: None,
        }
    }

    /// Rehydrate a record from storage.
    ///
    /// # Errors
    ///
    /// Returns `SessionTransitionError::InvalidTransition` when only one of
    /// `assignment_id` / `worker_id` is set, which no legal history produces.
    #[allow(clippy::too_many_arguments)]
    pub fn from_persisted(
        hit_id: HitId,
        set_id: SetId,
        assignment_id: Option<AssignmentId>,
        worker_id: Option<WorkerId>,
        username: Option<String>,
        experiment_id: Option<ExperimentId>,
        inactive_percent: Option<f64>,
        comment: Option<String>,
        created_at: DateTime<Utc>,
        assigned_at: Option<DateTime<Utc>>,
        login_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<Self, SessionTransitionError> {
        if assignment_id.is_some() != worker_id.is_some() {
            return Err(SessionTransitionError::InvalidTransition {
                hit_id,
                from: SessionStatus::Unused,
                to: SessionStatus::Assigned,
            });
        }
        Ok(Self {
            hit_id,
            set_id,
            assignment_id,
            worker_id,
            username,
            experiment_id,
            inactive_percent,
            comment,
            created_at,
            assigned_at,
            login_at,
            completed_at,
        })
    }

    /// Derived lifecycle status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        if self.inactive_percent.is_some() {
            SessionStatus::Completed
        } else if self.experiment_id.is_some() {
            SessionStatus::Experiment
        } else if self.worker_id.is_some() && self.username.is_some() {
            SessionStatus::Active
        } else if self.worker_id.is_some() {
            SessionStatus::Assigned
        } else {
            SessionStatus::Unused
        }
    }

    fn guard(&self, to: SessionStatus) -> Result<SessionStatus, SessionTransitionError> {
        let from = self.status();
        if from.permits(to) {
            Ok(from)
        } else {
            Err(SessionTransitionError::InvalidTransition {
                hit_id: self.hit_id.clone(),
                from,
                to,
            })
        }
    }

    /// `UNUSED → ASSIGNED`: the worker claims this session.
    ///
    /// Claiming again with the same assignment and worker is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyAssigned` if a different worker or assignment holds it,
    /// or `InvalidTransition` if the session is otherwise not claimable.
    pub fn assign(
        &mut self,
        assignment_id: AssignmentId,
        worker_id: WorkerId,
        at: DateTime<Utc>,
    ) -> Result<Transition, SessionTransitionError> {
        if let (Some(current_asst), Some(current_worker)) = (&self.assignment_id, &self.worker_id) {
            if *current_asst == assignment_id && *current_worker == worker_id {
                let status = self.status();
                return Ok(Transition {
                    from: status,
                    to: status,
                });
            }
            return Err(SessionTransitionError::AlreadyAssigned {
                hit_id: self.hit_id.clone(),
                worker_id: current_worker.clone(),
            });
        }

        let from = self.guard(SessionStatus::Assigned)?;
        self.assignment_id = Some(assignment_id);
        self.worker_id = Some(worker_id);
        self.assigned_at = Some(at);
        Ok(Transition {
            from,
            to: SessionStatus::Assigned,
        })
    }

    /// `ASSIGNED → ACTIVE`: the worker enters the lobby.
    ///
    /// The username is assigned once; re-entering keeps the first one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the session is assigned or active.
    pub fn lobby_login(
        &mut self,
        username: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<Transition, SessionTransitionError> {
        let from = self.guard(SessionStatus::Active)?;
        if from == SessionStatus::Active {
            return Ok(Transition { from, to: from });
        }
        self.username = Some(username.into());
        self.login_at = Some(at);
        Ok(Transition {
            from,
            to: SessionStatus::Active,
        })
    }

    /// `ACTIVE → EXPERIMENT`: the session joins a formed group's experiment.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyPlaced` when bound to a different experiment, or
    /// `InvalidTransition` when the worker never entered the lobby.
    pub fn place_in_experiment(
        &mut self,
        experiment_id: ExperimentId,
    ) -> Result<Transition, SessionTransitionError> {
        if let Some(current) = self.experiment_id {
            if current == experiment_id {
                let status = self.status();
                return Ok(Transition {
                    from: status,
                    to: status,
                });
            }
            return Err(SessionTransitionError::AlreadyPlaced {
                hit_id: self.hit_id.clone(),
                experiment_id: current,
            });
        }
        let from = self.guard(SessionStatus::Experiment)?;
        self.experiment_id = Some(experiment_id);
        Ok(Transition {
            from,
            to: SessionStatus::Experiment,
        })
    }

    /// Undo [`SessionRecord::place_in_experiment`] for an experiment that was
    /// torn down before it ever ran. Only the binding to `experiment_id` is
    /// removed; the session is ACTIVE again.
    ///
    /// Sits outside the forward transition table; a plain save cannot reach
    /// it.
    ///
    /// # Errors
    ///
    /// Returns `Refused` once the session is completed and `AlreadyPlaced`
    /// when it is bound to a different experiment.
    pub fn withdraw_from_experiment(
        &mut self,
        experiment_id: ExperimentId,
    ) -> Result<Transition, SessionTransitionError> {
        let from = self.status();
        match (from, self.experiment_id) {
            (SessionStatus::Completed, _) => Err(SessionTransitionError::Refused {
                hit_id: self.hit_id.clone(),
                status: from,
            }),
            (_, None) => Ok(Transition { from, to: from }),
            (_, Some(current)) if current != experiment_id => {
                Err(SessionTransitionError::AlreadyPlaced {
                    hit_id: self.hit_id.clone(),
                    experiment_id: current,
                })
            }
            (_, Some(_)) => {
                self.experiment_id = None;
                Ok(Transition {
                    from,
                    to: SessionStatus::Active,
                })
            }
        }
    }

    /// `EXPERIMENT → COMPLETED`: records the inactivity percentage.
    ///
    /// A second completion keeps the first recorded percentage.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPercent` for values outside `0.0..=1.0` and
    /// `InvalidTransition` if the session is not in an experiment.
    pub fn complete(
        &mut self,
        inactive_percent: f64,
        at: DateTime<Utc>,
    ) -> Result<Transition, SessionTransitionError> {
        if !(0.0..=1.0).contains(&inactive_percent) {
            return Err(SessionTransitionError::InvalidPercent(inactive_percent));
        }
        let from = self.guard(SessionStatus::Completed)?;
        if from == SessionStatus::Completed {
            return Ok(Transition { from, to: from });
        }
        self.inactive_percent = Some(inactive_percent);
        self.completed_at = Some(at);
        Ok(Transition {
            from,
            to: SessionStatus::Completed,
        })
    }

    /// Stores the worker's submission comment on a completed session.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless the session is completed.
    pub fn submit(&mut self, comment: impl Into<String>) -> Result<bool, SessionTransitionError> {
        let from = self.status();
        if from != SessionStatus::Completed {
            return Err(SessionTransitionError::InvalidTransition {
                hit_id: self.hit_id.clone(),
                from,
                to: SessionStatus::Completed,
            });
        }
        if self.comment.is_some() {
            return Ok(false);
        }
        self.comment = Some(comment.into());
        Ok(true)
    }

    /// Releases the worker's claim so the HIT can be taken again.
    ///
    /// # Errors
    ///
    /// Returns `Refused` while the session is in an experiment or completed.
    pub fn clear_worker(&mut self) -> Result<Transition, SessionTransitionError> {
        self.check_deletable()?;
        let from = self.status();
        self.assignment_id = None;
        self.worker_id = None;
        self.username = None;
        self.assigned_at = None;
        self.login_at = None;
        Ok(Transition {
            from,
            to: SessionStatus::Unused,
        })
    }

    /// # Errors
    ///
    /// Returns `Refused` while the session is in an experiment or completed.
    pub fn check_deletable(&self) -> Result<(), SessionTransitionError> {
        let status = self.status();
        if status.is_protected() {
            return Err(SessionTransitionError::Refused {
                hit_id: self.hit_id.clone(),
                status,
            });
        }
        Ok(())
    }

    /// Whether the reclamation sweep may delete this session.
    #[must_use]
    pub fn is_expirable(&self) -> bool {
        self.status() == SessionStatus::Unused
    }

    #[must_use]
    pub fn hit_id(&self) -> &HitId {
        &self.hit_id
    }

    #[must_use]
    pub fn set_id(&self) -> &SetId {
        &self.set_id
    }

    #[must_use]
    pub fn assignment_id(&self) -> Option<&AssignmentId> {
        self.assignment_id.as_ref()
    }

    #[must_use]
    pub fn worker_id(&self) -> Option<&WorkerId> {
        self.worker_id.as_ref()
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    #[must_use]
    pub fn experiment_id(&self) -> Option<ExperimentId> {
        self.experiment_id
    }

    #[must_use]
    pub fn inactive_percent(&self) -> Option<f64> {
        self.inactive_percent
    }

    #[must_use]
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn assigned_at(&self) -> Option<DateTime<Utc>> {
        self.assigned_at
    }

    #[must_use]
    pub fn login_at(&self) -> Option<DateTime<Utc>> {
        self.login_at
    }

    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
