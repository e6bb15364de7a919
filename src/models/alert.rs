//! The `Alert` entity — an operational notification raised against a site.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{RepositoryError, Result};
use crate::models::change::ChangePriority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    CrawlFailure,
    HealthDegraded,
    ConfigurationError,
    RetentionFailure,
    QueueBacklog,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CrawlFailure => "crawl_failure",
            Self::HealthDegraded => "health_degraded",
            Self::ConfigurationError => "configuration_error",
            Self::RetentionFailure => "retention_failure",
            Self::QueueBacklog => "queue_backlog",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "crawl_failure" => Ok(Self::CrawlFailure),
            "health_degraded" => Ok(Self::HealthDegraded),
            "configuration_error" => Ok(Self::ConfigurationError),
            "retention_failure" => Ok(Self::RetentionFailure),
            "queue_backlog" => Ok(Self::QueueBacklog),
            other => Err(RepositoryError::validation(format!(
                "invalid alert_type: {other}"
            ))),
        }
    }
}

/// Reuses the low/medium/high/critical scale defined for content changes.
pub type AlertSeverity = ChangePriority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Resolved,
    Suppressed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
            Self::Suppressed => "suppressed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "acknowledged" => Ok(Self::Acknowledged),
            "resolved" => Ok(Self::Resolved),
            "suppressed" => Ok(Self::Suppressed),
            other => Err(RepositoryError::validation(format!(
                "invalid alert status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertCreate {
    pub alert_type: AlertType,
    pub site_id: Option<Uuid>,
    pub severity: AlertSeverity,
    pub message: String,
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub site_id: Option<Uuid>,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub message: String,
    pub context: serde_json::Value,
    pub fingerprint: String,
    pub occurrence_count: u64,
    pub first_occurred_at: DateTime<Utc>,
    pub last_occurred_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub escalated: bool,
    pub escalated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSuppression {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub site_id: Option<Uuid>,
    pub reason: String,
    pub suppressed_until: DateTime<Utc>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// SHA-256 over the canonical (sorted-key) JSON encoding of
/// `(alert_type, site_id, context)` — resolved per the Open Questions:
/// a content-addressed fingerprint, not an unsalted fast hash.
pub fn fingerprint(alert_type: AlertType, site_id: Option<Uuid>, context: &serde_json::Value) -> Result<String> {
    let canonical = canonicalize(context);
    let payload = serde_json::json!({
        "alert_type": alert_type.as_str(),
        "site_id": site_id.map(|id| id.to_string()),
        "context": canonical,
    });
    let bytes = serde_json::to_vec(&payload)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Recursively sort object keys so two semantically-equal JSON values always
/// serialize to the same bytes.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_stable_under_key_reordering() {
        let site_id = Uuid::new_v4();
        let a = fingerprint(AlertType::CrawlFailure, Some(site_id), &json!({"a": 1, "b": 2})).unwrap();
        let b = fingerprint(AlertType::CrawlFailure, Some(site_id), &json!({"b": 2, "a": 1})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_on_distinct_context() {
        let site_id = Uuid::new_v4();
        let a = fingerprint(AlertType::CrawlFailure, Some(site_id), &json!({"a": 1})).unwrap();
        let b = fingerprint(AlertType::CrawlFailure, Some(site_id), &json!({"a": 2})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_is_64_hex_chars() {
        let fp = fingerprint(AlertType::QueueBacklog, None, &json!({})).unwrap();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
