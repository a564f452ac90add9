use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of work leased from a [`crate::JobQueue`].
///
/// `attempts` already includes the attempt currently in progress (a backing
/// store increments it as part of `get_job`), so a handler that wants to
/// know "is this the last try" compares `attempts` against `max_attempts`
/// directly rather than against `attempts + 1`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub task_identifier: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub max_attempts: i32,
    pub queue_name: Option<String>,
    pub created_at: DateTime<Utc>,
}
