use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use turk_core::model::{
    AssignmentId, ExperimentId, ExperimentRecord, HitId, Quiz, RoundRecord, SessionRecord, SetId,
    WorkerId,
};

use crate::repository::StorageError;

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

pub(crate) fn db<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Connection(e.to_string())
}

pub(crate) fn u32_from_i64(field: &'static str, v: i64) -> Result<u32, StorageError> {
    u32::try_from(v).map_err(|_| StorageError::Serialization(format!("invalid {field}: {v}")))
}

pub(crate) fn experiment_id_from_str(s: &str) -> Result<ExperimentId, StorageError> {
    ExperimentId::from_str(s).map_err(ser)
}

pub(crate) const SESSION_COLUMNS: &str = "hit_id, set_id, assignment_id, worker_id, username, \
     experiment_id, inactive_percent, comment, created_at, assigned_at, login_at, completed_at";

pub(crate) fn map_session_row(row: &SqliteRow) -> Result<SessionRecord, StorageError> {
    let experiment_id = row
        .try_get::<Option<String>, _>("experiment_id")
        .map_err(ser)?
        .as_deref()
        .map(experiment_id_from_str)
        .transpose()?;

    SessionRecord::from_persisted(
        HitId::new(row.try_get::<String, _>("hit_id").map_err(ser)?),
        SetId::new(row.try_get::<String, _>("set_id").map_err(ser)?),
        row.try_get::<Option<String>, _>("assignment_id")
            .map_err(ser)?
            .map(AssignmentId::new),
        row.try_get::<Option<String>, _>("worker_id")
            .map_err(ser)?
            .map(WorkerId::new),
        row.try_get("username").map_err(ser)?,
        experiment_id,
        row.try_get("inactive_percent").map_err(ser)?,
        row.try_get("comment").map_err(ser)?,
        row.try_get::<DateTime<Utc>, _>("created_at").map_err(ser)?,
        row.try_get("assigned_at").map_err(ser)?,
        row.try_get("login_at").map_err(ser)?,
        row.try_get("completed_at").map_err(ser)?,
    )
    .map_err(ser)
}

pub(crate) fn map_quiz_row(row: &SqliteRow) -> Result<Quiz, StorageError> {
    Quiz::new(
        WorkerId::new(row.try_get::<String, _>("worker_id").map_err(ser)?),
        SetId::new(row.try_get::<String, _>("set_id").map_err(ser)?),
        row.try_get::<Option<String>, _>("hit_id")
            .map_err(ser)?
            .map(HitId::new),
        u32_from_i64("num_correct", row.try_get("num_correct").map_err(ser)?)?,
        u32_from_i64("num_total", row.try_get("num_total").map_err(ser)?)?,
        row.try_get("taken_at").map_err(ser)?,
    )
    .map_err(ser)
}

pub(crate) fn map_experiment_row(row: &SqliteRow) -> Result<ExperimentRecord, StorageError> {
    Ok(ExperimentRecord {
        id: experiment_id_from_str(&row.try_get::<String, _>("id").map_err(ser)?)?,
        set_id: SetId::new(row.try_get::<String, _>("set_id").map_err(ser)?),
        participants: u32_from_i64("participants", row.try_get("participants").map_err(ser)?)?,
        input_data: row.try_get("input_data").map_err(ser)?,
        started_at: row.try_get("started_at").map_err(ser)?,
        ended_at: row.try_get("ended_at").map_err(ser)?,
        results: row.try_get("results").map_err(ser)?,
    })
}

pub(crate) fn map_round_row(row: &SqliteRow) -> Result<RoundRecord, StorageError> {
    Ok(RoundRecord {
        experiment_id: experiment_id_from_str(
            &row.try_get::<String, _>("experiment_id").map_err(ser)?,
        )?,
        round_num: u32_from_i64("round_num", row.try_get("round_num").map_err(ser)?)?,
        started_at: row.try_get("started_at").map_err(ser)?,
        ended_at: row.try_get("ended_at").map_err(ser)?,
        input_data: row.try_get("input_data").map_err(ser)?,
        results: row.try_get("results").map_err(ser)?,
    })
}
