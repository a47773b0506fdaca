mod experiment;
mod group;
mod ids;
mod quiz;
mod quiz_policy;
mod session;
mod summary;

pub use ids::{AssignmentId, ConnectionId, ExperimentId, HitId, ParseIdError, SetId, WorkerId};

pub use experiment::{ExperimentRecord, RoundRecord};
pub use group::{GroupError, HitWorker, HitWorkerGroup};
pub use quiz::{Quiz, QuizError};
pub use quiz_policy::{DefaultQuizPolicy, PercentageQuizPolicy, QuizGate, QuizPolicy};
pub use session::{SessionRecord, SessionStatus, SessionTransitionError, Transition};
pub use summary::SessionSummary;
