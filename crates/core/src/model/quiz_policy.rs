use serde::{Deserialize, Serialize};

use crate::model::quiz::Quiz;

/// Admission predicate evaluated against a worker's past quizzes in a set.
///
/// Implementations are pure: no I/O, no interior state.
pub trait QuizPolicy: Send + Sync {
    /// Whether one quiz attempt passes.
    fn quiz_passes(&self, quiz: &Quiz) -> bool;

    /// Whether the worker still has to take the quiz.
    fn requires_quiz(&self, past: &[Quiz]) -> bool;

    /// Whether the worker should be locked out of this set.
    fn overall_fail(&self, past: &[Quiz]) -> bool;
}

/// Admission decision for a worker trying to enter the lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuizGate {
    Admit,
    QuizRequired,
    LockedOut,
}

impl QuizGate {
    /// Applies `policy` to `past`. No policy admits everyone.
    #[must_use]
    pub fn evaluate(policy: Option<&dyn QuizPolicy>, past: &[Quiz]) -> Self {
        let Some(policy) = policy else {
            return QuizGate::Admit;
        };
        if !policy.requires_quiz(past) {
            return QuizGate::Admit;
        }
        if policy.overall_fail(past) {
            QuizGate::LockedOut
        } else {
            QuizGate::QuizRequired
        }
    }
}

//
// ─── DEFAULT POLICY ────────────────────────────────────────────────────────────
//

/// Requires one perfect quiz; locks out workers who answered more than four
/// questions in total with under 70% accuracy.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultQuizPolicy;

impl DefaultQuizPolicy {
    pub const MIN_QUESTIONS_FOR_LOCKOUT: u64 = 4;
    pub const LOCKOUT_ACCURACY: f64 = 0.70;
}

impl QuizPolicy for DefaultQuizPolicy {
    fn quiz_passes(&self, quiz: &Quiz) -> bool {
        quiz.is_perfect()
    }

    fn requires_quiz(&self, past: &[Quiz]) -> bool {
        !past.iter().any(Quiz::is_perfect)
    }

    fn overall_fail(&self, past: &[Quiz]) -> bool {
        let (correct, total) = past.iter().fold((0_u64, 0_u64), |(c, t), q| {
            (c + u64::from(q.num_correct()), t + u64::from(q.num_total()))
        });
        if total <= Self::MIN_QUESTIONS_FOR_LOCKOUT {
            return false;
        }
        #[allow(clippy::cast_precision_loss)]
        let accuracy = correct as f64 / total as f64;
        accuracy < Self::LOCKOUT_ACCURACY
    }
}

//
// ─── PERCENTAGE POLICY ─────────────────────────────────────────────────────────
//

/// Passes quizzes at or above `pass_rate`; locks out after `max_fails`
/// failing attempts. Empty quizzes count as failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PercentageQuizPolicy {
    pass_rate: f64,
    max_fails: u32,
}

impl PercentageQuizPolicy {
    #[must_use]
    pub fn new(pass_rate: f64, max_fails: u32) -> Self {
        Self {
            pass_rate,
            max_fails,
        }
    }

    #[must_use]
    pub fn pass_rate(&self) -> f64 {
        self.pass_rate
    }

    #[must_use]
    pub fn max_fails(&self) -> u32 {
        self.max_fails
    }
}

impl QuizPolicy for PercentageQuizPolicy {
    fn quiz_passes(&self, quiz: &Quiz) -> bool {
        quiz.accuracy().is_some_and(|a| a >= self.pass_rate)
    }

    fn requires_quiz(&self, past: &[Quiz]) -> bool {
        !past.iter().any(|q| self.quiz_passes(q))
    }

    fn overall_fail(&self, past: &[Quiz]) -> bool {
        let fails = past.iter().filter(|q| !self.quiz_passes(q)).count();
        fails >= self.max_fails as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ids::{SetId, WorkerId};
    use crate::time::fixed_now;

    fn quiz(correct: u32, total: u32) -> Quiz {
        Quiz::new(
            WorkerId::new("W"),
            SetId::new("test"),
            None,
            correct,
            total,
            fixed_now(),
        )
        .unwrap()
    }

    #[test]
    fn default_requires_quiz_until_perfect() {
        let policy = DefaultQuizPolicy;
        assert!(policy.requires_quiz(&[]));
        assert!(policy.requires_quiz(&[quiz(4, 5)]));
        assert!(!policy.requires_quiz(&[quiz(4, 5), quiz(5, 5)]));
        assert!(policy.quiz_passes(&quiz(5, 5)));
        assert!(!policy.quiz_passes(&quiz(0, 0)));
    }

    #[test]
    fn default_overall_fail_needs_more_than_four_questions() {
        let policy = DefaultQuizPolicy;
        assert!(!policy.overall_fail(&[]));
        assert!(!policy.overall_fail(&[quiz(1, 4)]));
        // 5 questions, 20% right: still locked out since 5 > 4.
        assert!(policy.overall_fail(&[quiz(1, 5)]));
        assert!(policy.overall_fail(&[quiz(1, 5), quiz(1, 5)]));
        assert!(!policy.overall_fail(&[quiz(4, 5), quiz(3, 5)]));
    }

    #[test]
    fn percentage_policy_uses_pass_rate() {
        let policy = PercentageQuizPolicy::new(0.8, 2);
        assert!(policy.quiz_passes(&quiz(4, 5)));
        assert!(!policy.quiz_passes(&quiz(3, 5)));
        assert!(!policy.quiz_passes(&quiz(0, 0)));
        assert!(policy.requires_quiz(&[quiz(3, 5)]));
        assert!(!policy.requires_quiz(&[quiz(3, 5), quiz(4, 5)]));
    }

    #[test]
    fn percentage_policy_counts_failures() {
        let policy = PercentageQuizPolicy::new(0.8, 2);
        assert!(!policy.overall_fail(&[quiz(3, 5)]));
        assert!(policy.overall_fail(&[quiz(3, 5), quiz(3, 5)]));
        assert!(policy.overall_fail(&[quiz(0, 0), quiz(1, 5)]));
    }

    #[test]
    fn gate_checks_lockout_before_quiz() {
        let policy = DefaultQuizPolicy;
        assert_eq!(QuizGate::evaluate(None, &[]), QuizGate::Admit);
        assert_eq!(
            QuizGate::evaluate(Some(&policy), &[]),
            QuizGate::QuizRequired
        );
        assert_eq!(
            QuizGate::evaluate(Some(&policy), &[quiz(1, 5), quiz(1, 5)]),
            QuizGate::LockedOut
        );
        assert_eq!(
            QuizGate::evaluate(Some(&policy), &[quiz(1, 5), quiz(5, 5)]),
            QuizGate::Admit
        );
    }
}
