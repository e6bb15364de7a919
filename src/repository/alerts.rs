//! Alerts store, §4.H.

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{RepositoryError, Result};
use crate::ids;
use crate::models::alert::fingerprint;
use crate::models::{Alert, AlertCreate, AlertSeverity, AlertStatus, AlertSuppression, AlertType};
use crate::storage::pool::DbPool;
use crate::storage::retry::{with_retry, RetryPolicy};
use crate::storage::sanitize::sanitize_document;

use super::util::{column_datetime, column_datetime_opt, column_json, now, to_json};

#[derive(Clone)]
pub struct AlertsRepository {
    pool: DbPool,
}

fn row_to_alert(row: &Row) -> rusqlite::Result<Alert> {
    let id: String = row.get("id")?;
    let alert_type_raw: String = row.get("alert_type")?;
    let alert_type = AlertType::parse(&alert_type_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
    let site_id: Option<String> = row.get("site_id")?;
    let severity_raw: String = row.get("severity")?;
    let severity = AlertSeverity::parse(&severity_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
    let status_raw: String = row.get("status")?;
    let status = AlertStatus::parse(&status_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
    let escalated: i64 = row.get("escalated")?;

    Ok(Alert {
        id: Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        alert_type,
        site_id: site_id
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        severity,
        status,
        message: row.get("message")?,
        context: column_json(row, "context")?,
        fingerprint: row.get("fingerprint")?,
        occurrence_count: row.get("occurrence_count")?,
        first_occurred_at: column_datetime(row, "first_occurred_at")?,
        last_occurred_at: column_datetime(row, "last_occurred_at")?,
        acknowledged_at: column_datetime_opt(row, "acknowledged_at")?,
        acknowledged_by: row.get("acknowledged_by")?,
        resolved_at: column_datetime_opt(row, "resolved_at")?,
        escalated: escalated != 0,
        escalated_at: column_datetime_opt(row, "escalated_at")?,
        created_at: column_datetime(row, "created_at")?,
        updated_at: column_datetime(row, "updated_at")?,
    })
}

impl AlertsRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Drops silently (returns `None`) if the fingerprint is currently
    /// suppressed; de-duplicates against an already-open alert of the same
    /// fingerprint by incrementing `occurrence_count`; otherwise inserts.
    #[tracing::instrument(skip(self, alert), fields(collection = "alerts", op = "create_alert"))]
    pub async fn create_alert(&self, alert: AlertCreate) -> Result<Option<Uuid>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let mut alert = alert_clone(&alert);
            async move {
                alert.context = sanitize_document(&alert.context)?;
                let fp = fingerprint(alert.alert_type, alert.site_id, &alert.context)?;
                pool.with_conn(move |conn| {
                    let now = now();

                    let suppressed: bool = conn
                        .query_row(
                            "SELECT 1 FROM alert_suppressions
                             WHERE alert_type = ?1 AND (site_id IS ?2) AND suppressed_until > ?3",
                            params![alert.alert_type.as_str(), alert.site_id.map(|id| id.to_string()), now.to_rfc3339()],
                            |_| Ok(()),
                        )
                        .optional()?
                        .is_some();
                    if suppressed {
                        return Ok(None);
                    }

                    let existing: Option<String> = conn
                        .query_row(
                            "SELECT id FROM alerts WHERE fingerprint = ?1 AND status = ?2",
                            params![fp, AlertStatus::Open.as_str()],
                            |row| row.get(0),
                        )
                        .optional()?;

                    if let Some(existing_id) = existing {
                        conn.execute(
                            "UPDATE alerts SET occurrence_count = occurrence_count + 1, last_occurred_at = ?1, updated_at = ?2 WHERE id = ?3",
                            params![now.to_rfc3339(), now.to_rfc3339(), existing_id],
                        )
                        .map_err(RepositoryError::from)?;
                        return Ok(Some(
                            Uuid::parse_str(&existing_id).map_err(|e| RepositoryError::validation(e.to_string()))?,
                        ));
                    }

                    let id = ids::new_id();
                    conn.execute(
                        "INSERT INTO alerts (
                            id, alert_type, site_id, severity, status, message, context, fingerprint,
                            occurrence_count, first_occurred_at, last_occurred_at, acknowledged_at,
                            acknowledged_by, resolved_at, escalated, escalated_at, created_at, updated_at
                        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
                        params![
                            id.to_string(),
                            alert.alert_type.as_str(),
                            alert.site_id.map(|id| id.to_string()),
                            alert.severity.as_str(),
                            AlertStatus::Open.as_str(),
                            alert.message,
                            to_json(&alert.context)?,
                            fp,
                            1,
                            now.to_rfc3339(),
                            now.to_rfc3339(),
                            Option::<String>::None,
                            Option::<String>::None,
                            Option::<String>::None,
                            0,
                            Option::<String>::None,
                            now.to_rfc3339(),
                            now.to_rfc3339(),
                        ],
                    )
                    .map_err(RepositoryError::from)?;
                    Ok(Some(id))
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "alerts", op = "get_active_alerts"))]
    pub async fn get_active_alerts(&self, severity: Option<AlertSeverity>) -> Result<Vec<Alert>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM alerts WHERE status = ?1
                         ORDER BY CASE severity
                            WHEN 'critical' THEN 0 WHEN 'high' THEN 1 WHEN 'medium' THEN 2 ELSE 3 END,
                         created_at DESC",
                    )?;
                    let alerts = stmt
                        .query_map(params![AlertStatus::Open.as_str()], row_to_alert)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(match severity {
                        Some(s) => alerts.into_iter().filter(|a| a.severity == s).collect(),
                        None => alerts,
                    })
                })
                .await
            }
        })
        .await
    }

    /// `true` if an open alert was resolved; `false` if it was already
    /// non-active (idempotent no-op).
    #[tracing::instrument(skip(self, resolution), fields(collection = "alerts", op = "resolve_alert"))]
    pub async fn resolve_alert(&self, id: Uuid, resolution: Option<String>) -> Result<bool> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let resolution = resolution.clone();
            async move {
                let now = now();
                pool.with_conn(move |conn| {
                    let mut context: serde_json::Value = conn.query_row(
                        "SELECT context FROM alerts WHERE id = ?1 AND status = ?2",
                        params![id.to_string(), AlertStatus::Open.as_str()],
                        |row| column_json(row, "context"),
                    )
                    .optional()?
                    .unwrap_or(serde_json::Value::Null);

                    if context.is_null() {
                        return Ok(false);
                    }
                    if let (Some(resolution), Some(obj)) = (&resolution, context.as_object_mut()) {
                        obj.insert("resolution".to_string(), serde_json::Value::String(resolution.clone()));
                    }

                    conn.execute(
                        "UPDATE alerts SET status = ?1, resolved_at = ?2, context = ?3, updated_at = ?4 WHERE id = ?5",
                        params![AlertStatus::Resolved.as_str(), now.to_rfc3339(), to_json(&context)?, now.to_rfc3339(), id.to_string()],
                    )
                    .map_err(RepositoryError::from)?;
                    Ok(true)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "alerts", op = "suppress_alert_type"))]
    pub async fn suppress_alert_type(
        &self,
        alert_type: AlertType,
        site_id: Option<Uuid>,
        hours: i64,
        reason: String,
    ) -> Result<()> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let reason = reason.clone();
            async move {
                let now = now();
                let suppressed_until = now + chrono::Duration::hours(hours);
                pool.with_conn(move |conn| {
                    let existing: Option<String> = conn
                        .query_row(
                            "SELECT id FROM alert_suppressions WHERE alert_type = ?1 AND (site_id IS ?2)",
                            params![alert_type.as_str(), site_id.map(|id| id.to_string())],
                            |row| row.get(0),
                        )
                        .optional()?;

                    match existing {
                        Some(existing_id) => {
                            conn.execute(
                                "UPDATE alert_suppressions SET suppressed_until = ?1, reason = ?2 WHERE id = ?3",
                                params![suppressed_until.to_rfc3339(), reason, existing_id],
                            )
                            .map_err(RepositoryError::from)?;
                        }
                        None => {
                            let id = ids::new_id();
                            conn.execute(
                                "INSERT INTO alert_suppressions (
                                    id, alert_type, site_id, reason, suppressed_until, created_by, created_at
                                ) VALUES (?1,?2,?3,?4,?5,?6,?7)",
                                params![
                                    id.to_string(),
                                    alert_type.as_str(),
                                    site_id.map(|id| id.to_string()),
                                    reason,
                                    suppressed_until.to_rfc3339(),
                                    Option::<String>::None,
                                    now.to_rfc3339(),
                                ],
                            )
                            .map_err(RepositoryError::from)?;
                        }
                    }
                    Ok(())
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "alerts", op = "get_suppressed_alerts"))]
    pub async fn get_suppressed_alerts(&self) -> Result<Vec<AlertSuppression>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                let now = now();
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM alert_suppressions WHERE suppressed_until > ?1 ORDER BY suppressed_until ASC",
                    )?;
                    let rows = stmt
                        .query_map(params![now.to_rfc3339()], |row| {
                            let id: String = row.get("id")?;
                            let alert_type_raw: String = row.get("alert_type")?;
                            let site_id: Option<String> = row.get("site_id")?;
                            Ok((id, alert_type_raw, site_id, row.get::<_, String>("reason")?, row.get::<_, String>("suppressed_until")?, row.get::<_, Option<String>>("created_by")?, row.get::<_, String>("created_at")?))
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;

                    let mut suppressions = Vec::with_capacity(rows.len());
                    for (id, alert_type_raw, site_id, reason, suppressed_until, created_by, created_at) in rows {
                        suppressions.push(AlertSuppression {
                            id: Uuid::parse_str(&id).map_err(|e| RepositoryError::validation(e.to_string()))?,
                            alert_type: AlertType::parse(&alert_type_raw)?,
                            site_id: site_id.map(|s| Uuid::parse_str(&s)).transpose().map_err(|e| RepositoryError::validation(e.to_string()))?,
                            reason,
                            suppressed_until: super::util::parse_datetime(&suppressed_until)?,
                            created_by,
                            created_at: super::util::parse_datetime(&created_at)?,
                        });
                    }
                    Ok(suppressions)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "alerts", op = "cleanup_old_alerts"))]
    pub async fn cleanup_old_alerts(&self, older_than_days: i64) -> Result<u64> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                let cutoff = now() - chrono::Duration::days(older_than_days);
                pool.with_conn(move |conn| {
                    let affected = conn
                        .execute(
                            "DELETE FROM alerts WHERE status = ?1 AND resolved_at < ?2",
                            params![AlertStatus::Resolved.as_str(), cutoff.to_rfc3339()],
                        )
                        .map_err(RepositoryError::from)?;
                    Ok(affected as u64)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "alerts", op = "get_alert_statistics"))]
    pub async fn get_alert_statistics(&self, days: i64) -> Result<AlertStatistics> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                let since = now() - chrono::Duration::days(days);
                pool.with_conn(move |conn| {
                    let mut by_status = std::collections::BTreeMap::new();
                    let mut stmt = conn.prepare(
                        "SELECT status, COUNT(*) FROM alerts WHERE created_at >= ?1 GROUP BY status",
                    )?;
                    for row in stmt.query_map(params![since.to_rfc3339()], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))? {
                        let (status, count) = row?;
                        by_status.insert(status, count as u64);
                    }

                    let mut by_severity = std::collections::BTreeMap::new();
                    let mut stmt = conn.prepare(
                        "SELECT severity, COUNT(*) FROM alerts WHERE created_at >= ?1 GROUP BY severity",
                    )?;
                    for row in stmt.query_map(params![since.to_rfc3339()], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))? {
                        let (severity, count) = row?;
                        by_severity.insert(severity, count as u64);
                    }

                    let escalated_count: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM alerts WHERE created_at >= ?1 AND escalated = 1",
                        params![since.to_rfc3339()],
                        |row| row.get(0),
                    )?;

                    Ok(AlertStatistics {
                        by_status,
                        by_severity,
                        escalated_count: escalated_count as u64,
                    })
                })
                .await
            }
        })
        .await
    }

    /// Marks still-open `critical`/`high` alerts older than `hours` as
    /// escalated (only once per alert) and returns them for downstream
    /// notification.
    #[tracing::instrument(skip(self), fields(collection = "alerts", op = "escalate_unresolved_alerts"))]
    pub async fn escalate_unresolved_alerts(&self, hours: i64) -> Result<Vec<Alert>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                let cutoff = now() - chrono::Duration::hours(hours);
                let now = now();
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM alerts WHERE status = ?1 AND severity IN ('critical','high')
                         AND first_occurred_at < ?2 AND escalated = 0",
                    )?;
                    let to_escalate = stmt
                        .query_map(params![AlertStatus::Open.as_str(), cutoff.to_rfc3339()], row_to_alert)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;

                    for alert in &to_escalate {
                        conn.execute(
                            "UPDATE alerts SET escalated = 1, escalated_at = ?1, updated_at = ?2 WHERE id = ?3",
                            params![now.to_rfc3339(), now.to_rfc3339(), alert.id.to_string()],
                        )
                        .map_err(RepositoryError::from)?;
                    }

                    Ok(to_escalate
                        .into_iter()
                        .map(|mut a| {
                            a.escalated = true;
                            a.escalated_at = Some(now);
                            a
                        })
                        .collect())
                })
                .await
            }
        })
        .await
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlertStatistics {
    pub by_status: std::collections::BTreeMap<String, u64>,
    pub by_severity: std::collections::BTreeMap<String, u64>,
    pub escalated_count: u64,
}

fn alert_clone(alert: &AlertCreate) -> AlertCreate {
    AlertCreate {
        alert_type: alert.alert_type,
        site_id: alert.site_id,
        severity: alert.severity,
        message: alert.message.clone(),
        context: alert.context.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup() -> AlertsRepository {
        let pool = DbPool::open_in_memory().unwrap();
        crate::repository::migrations::migrate(&pool).await.unwrap();
        AlertsRepository::new(pool)
    }

    fn make_alert() -> AlertCreate {
        AlertCreate {
            alert_type: AlertType::CrawlFailure,
            site_id: None,
            severity: AlertSeverity::High,
            message: "crawl failing".into(),
            context: json!({"reason": "timeout"}),
        }
    }

    #[tokio::test]
    async fn duplicate_fingerprint_increments_occurrence_count() {
        let repo = setup().await;
        let id1 = repo.create_alert(make_alert()).await.unwrap().unwrap();
        let id2 = repo.create_alert(make_alert()).await.unwrap().unwrap();
        assert_eq!(id1, id2);

        let alerts = repo.get_active_alerts(None).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].occurrence_count, 2);
    }

    #[tokio::test]
    async fn suppressed_alert_type_is_dropped() {
        let repo = setup().await;
        repo.suppress_alert_type(AlertType::CrawlFailure, None, 1, "maintenance".into())
            .await
            .unwrap();
        let result = repo.create_alert(make_alert()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn resolve_alert_is_idempotent() {
        let repo = setup().await;
        let id = repo.create_alert(make_alert()).await.unwrap().unwrap();
        assert!(repo.resolve_alert(id, Some("fixed".into())).await.unwrap());
        assert!(!repo.resolve_alert(id, None).await.unwrap());
    }

    #[tokio::test]
    async fn operator_prefixed_keys_are_stripped_from_stored_context() {
        let repo = setup().await;
        let mut alert = make_alert();
        alert.context = json!({"reason": "timeout", "$where": "1==1"});
        let id = repo.create_alert(alert).await.unwrap().unwrap();

        let active = repo.get_active_alerts(None).await.unwrap();
        let stored = active.into_iter().find(|a| a.id == id).unwrap();
        assert_eq!(stored.context, json!({"reason": "timeout"}));
    }
}
