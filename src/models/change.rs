//! The `ContentChange` entity — a durable change event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RepositoryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    New,
    Modified,
    Deleted,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(Self::New),
            "modified" => Ok(Self::Modified),
            "deleted" => Ok(Self::Deleted),
            other => Err(RepositoryError::validation(format!(
                "invalid change_type: {other}"
            ))),
        }
    }
}

/// Distinct from `TaskPriority` (§9 Open Questions): this is the
/// low/medium/high/critical scale used on changes and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangePriority {
    Low,
    Medium,
    High,
    Critical,
}

impl ChangePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(RepositoryError::validation(format!(
                "invalid change priority: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentChangeCreate {
    pub page_id: Uuid,
    pub site_id: Uuid,
    pub change_type: ChangeType,
    pub previous_hash: Option<String>,
    pub new_hash: Option<String>,
    pub context: serde_json::Value,
    /// Historical url/title for a `deleted` change, since the page row may
    /// already be purged by the time the deletion is recorded. Ignored for
    /// `new`/`modified`, which resolve these from the live page instead.
    pub url: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentChange {
    pub id: Uuid,
    pub page_id: Uuid,
    pub site_id: Uuid,
    pub change_type: ChangeType,
    pub previous_hash: Option<String>,
    pub new_hash: Option<String>,
    pub url: String,
    pub title: Option<String>,
    pub priority: ChangePriority,
    pub detected_at: DateTime<Utc>,
    pub notification_sent: bool,
    pub notified_at: Option<DateTime<Utc>>,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deterministic priority derivation, §4.G.
pub fn derive_priority(change_type: ChangeType, context: &serde_json::Value) -> ChangePriority {
    match change_type {
        ChangeType::Deleted => ChangePriority::High,
        ChangeType::New => {
            let author_known = context
                .get("author_known")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let philosophical_content = context
                .get("philosophical_content")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if author_known || philosophical_content {
                ChangePriority::High
            } else {
                ChangePriority::Medium
            }
        }
        ChangeType::Modified => {
            let ratio = context
                .get("content_change_ratio")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            if ratio > 0.5 {
                ChangePriority::High
            } else if ratio > 0.1 {
                ChangePriority::Medium
            } else {
                ChangePriority::Low
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTrend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeFrequency {
    pub totals_by_type: std::collections::BTreeMap<String, u64>,
    pub changes_per_day: f64,
    pub most_active_day: Option<String>,
    pub trend: ChangeTrend,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deleted_is_always_high() {
        assert_eq!(derive_priority(ChangeType::Deleted, &json!({})), ChangePriority::High);
    }

    #[test]
    fn new_with_author_known_is_high() {
        assert_eq!(
            derive_priority(ChangeType::New, &json!({"author_known": true})),
            ChangePriority::High
        );
    }

    #[test]
    fn new_with_philosophical_content_is_high() {
        assert_eq!(
            derive_priority(ChangeType::New, &json!({"philosophical_content": true})),
            ChangePriority::High
        );
    }

    #[test]
    fn new_default_is_medium() {
        assert_eq!(derive_priority(ChangeType::New, &json!({})), ChangePriority::Medium);
    }

    #[test]
    fn modified_ratio_thresholds_match_spec_example() {
        assert_eq!(
            derive_priority(ChangeType::Modified, &json!({"content_change_ratio": 0.6})),
            ChangePriority::High
        );
        assert_eq!(
            derive_priority(ChangeType::Modified, &json!({"content_change_ratio": 0.2})),
            ChangePriority::Medium
        );
        assert_eq!(
            derive_priority(ChangeType::Modified, &json!({"content_change_ratio": 0.05})),
            ChangePriority::Low
        );
    }
}
