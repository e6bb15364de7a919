//! The `ProcessingTask` entity — a unit of asynchronous work on the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RepositoryError, Result};

/// Dequeue priority: 1..5, higher is more urgent. Distinct from the
/// `ChangePriority`/`AlertSeverity` enums used elsewhere (§9 Open Questions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskPriority(u8);

impl TaskPriority {
    pub fn new(value: u8) -> Result<Self> {
        if (1..=5).contains(&value) {
            Ok(Self(value))
        } else {
            Err(RepositoryError::validation(format!(
                "task priority must be 1..=5, got {value}"
            )))
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(RepositoryError::validation(format!(
                "invalid task status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreate {
    pub task_type: String,
    pub priority: TaskPriority,
    pub payload: serde_json::Value,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: u32,
    pub dependencies: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingTask {
    pub id: Uuid,
    pub task_type: String,
    pub priority: TaskPriority,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub scheduled_at: DateTime<Utc>,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub dependencies: Vec<Uuid>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay_seconds: i64,
    pub cap_seconds: i64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_seconds: 60,
            cap_seconds: 3600,
        }
    }
}

impl BackoffPolicy {
    /// `scheduled_at = now + min(base_delay * 2^retry_count, cap)`.
    pub fn delay_seconds(&self, retry_count: u32) -> i64 {
        let scaled = self
            .base_delay_seconds
            .saturating_mul(2i64.saturating_pow(retry_count));
        scaled.min(self.cap_seconds)
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueStatus {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub oldest_pending_created_at: Option<DateTime<Utc>>,
    pub average_completed_duration_seconds: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_range_is_enforced() {
        assert!(TaskPriority::new(1).is_ok());
        assert!(TaskPriority::new(5).is_ok());
        assert!(TaskPriority::new(0).is_err());
        assert!(TaskPriority::new(6).is_err());
    }

    #[test]
    fn backoff_progression_matches_spec_example() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_seconds(0), 60);
        assert_eq!(policy.delay_seconds(1), 120);
        assert_eq!(policy.delay_seconds(2), 240);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_seconds(20), 3600);
    }
}
