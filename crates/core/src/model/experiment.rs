use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ids::{ExperimentId, SetId};

/// Durable log of one running experiment instance.
///
/// Owns its rounds; sessions only reference it by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub id: ExperimentId,
    pub set_id: SetId,
    pub participants: u32,
    pub input_data: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub results: Option<String>,
}

impl ExperimentRecord {
    #[must_use]
    pub fn started(
        id: ExperimentId,
        set_id: SetId,
        participants: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            set_id,
            participants,
            input_data: None,
            started_at,
            ended_at: None,
            results: None,
        }
    }

    #[must_use]
    pub fn with_input(mut self, input_data: impl Into<String>) -> Self {
        self.input_data = Some(input_data.into());
        self
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// One numbered phase within an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub experiment_id: ExperimentId,
    pub round_num: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub input_data: Option<String>,
    pub results: Option<String>,
}

impl RoundRecord {
    #[must_use]
    pub fn started(experiment_id: ExperimentId, round_num: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            experiment_id,
            round_num,
            started_at,
            ended_at: None,
            input_data: None,
            results: None,
        }
    }
}
