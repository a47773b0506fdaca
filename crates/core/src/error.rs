use thiserror::Error;

use crate::model::{GroupError, QuizError, SessionTransitionError};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transition(#[from] SessionTransitionError),
    #[error(transparent)]
    Quiz(#[from] QuizError),
    #[error(transparent)]
    Group(#[from] GroupError),
}
