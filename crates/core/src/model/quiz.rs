use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::{HitId, SetId, WorkerId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum QuizError {
    #[error("quiz reports {correct} correct answers out of {total}")]
    CorrectExceedsTotal { correct: u32, total: u32 },
}

/// One scored screening attempt by one worker within one set.
///
/// Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quiz {
    worker_id: WorkerId,
    set_id: SetId,
    hit_id: Option<HitId>,
    num_correct: u32,
    num_total: u32,
    taken_at: DateTime<Utc>,
}

impl Quiz {
    /// # Errors
    ///
    /// Returns `QuizError::CorrectExceedsTotal` if `num_correct > num_total`.
    pub fn new(
        worker_id: WorkerId,
        set_id: SetId,
        hit_id: Option<HitId>,
        num_correct: u32,
        num_total: u32,
        taken_at: DateTime<Utc>,
    ) -> Result<Self, QuizError> {
        if num_correct > num_total {
            return Err(QuizError::CorrectExceedsTotal {
                correct: num_correct,
                total: num_total,
            });
        }
        Ok(Self {
            worker_id,
            set_id,
            hit_id,
            num_correct,
            num_total,
            taken_at,
        })
    }

    /// Fraction answered correctly, or `None` for an empty quiz.
    #[must_use]
    pub fn accuracy(&self) -> Option<f64> {
        if self.num_total == 0 {
            None
        } else {
            Some(f64::from(self.num_correct) / f64::from(self.num_total))
        }
    }

    /// Every question answered correctly. An empty quiz is never perfect.
    #[must_use]
    pub fn is_perfect(&self) -> bool {
        self.num_total > 0 && self.num_correct == self.num_total
    }

    #[must_use]
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    #[must_use]
    pub fn set_id(&self) -> &SetId {
        &self.set_id
    }

    #[must_use]
    pub fn hit_id(&self) -> Option<&HitId> {
        self.hit_id.as_ref()
    }

    #[must_use]
    pub fn num_correct(&self) -> u32 {
        self.num_correct
    }

    #[must_use]
    pub fn num_total(&self) -> u32 {
        self.num_total
    }

    #[must_use]
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    #[test]
    fn rejects_more_correct_than_total() {
        let err = Quiz::new(
            WorkerId::new("W"),
            SetId::new("s"),
            None,
            6,
            5,
            fixed_now(),
        )
        .unwrap_err();
        assert_eq!(err, QuizError::CorrectExceedsTotal { correct: 6, total: 5 });
    }

    #[test]
    fn empty_quiz_has_no_accuracy() {
        let quiz = Quiz::new(WorkerId::new("W"), SetId::new("s"), None, 0, 0, fixed_now()).unwrap();
        assert_eq!(quiz.accuracy(), None);
        assert!(!quiz.is_perfect());
    }
}
