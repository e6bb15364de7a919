//! Crawl sessions store, §4.E.

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{RepositoryError, Result};
use crate::ids;
use crate::models::{CrawlSession, SessionConfig, SessionStats, SessionStatus};
use crate::storage::pool::DbPool;
use crate::storage::retry::{with_retry, RetryPolicy};

use super::util::{column_datetime, column_datetime_opt, column_json, now, to_json};

#[derive(Clone)]
pub struct SessionsRepository {
    pool: DbPool,
}

fn row_to_session(row: &Row) -> rusqlite::Result<CrawlSession> {
    let id: String = row.get("id")?;
    let site_id: String = row.get("site_id")?;
    let status_raw: String = row.get("status")?;
    let status = SessionStatus::parse(&status_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(CrawlSession {
        id: Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        site_id: Uuid::parse_str(&site_id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        status,
        config_snapshot: column_json(row, "config_snapshot")?,
        stats: column_json(row, "stats")?,
        worker_id: row.get("worker_id")?,
        abort_reason: row.get("abort_reason")?,
        started_at: column_datetime(row, "started_at")?,
        completed_at: column_datetime_opt(row, "completed_at")?,
        last_update: column_datetime(row, "last_update")?,
        created_at: column_datetime(row, "created_at")?,
        updated_at: column_datetime(row, "updated_at")?,
    })
}

impl SessionsRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Verifies the site exists and that fewer than `cfg.max_concurrent_sessions`
    /// sessions are currently `running` for it before inserting.
    #[tracing::instrument(skip(self, config_snapshot), fields(collection = "crawl_sessions", op = "start_crawl_session"))]
    pub async fn start_crawl_session(
        &self,
        site_id: Uuid,
        worker_id: Option<String>,
        cfg: SessionConfig,
        config_snapshot: serde_json::Value,
    ) -> Result<Uuid> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let worker_id = worker_id.clone();
            let config_snapshot = config_snapshot.clone();
            let cfg = cfg.clone();
            async move {
                let id = ids::new_id();
                pool.with_conn(move |conn| {
                    let site_exists: Option<i64> = conn
                        .query_row("SELECT 1 FROM sites WHERE id = ?1", params![site_id.to_string()], |row| row.get(0))
                        .optional()?;
                    if site_exists.is_none() {
                        return Err(RepositoryError::not_found(format!("sites/{site_id}")));
                    }

                    let running: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM crawl_sessions WHERE site_id = ?1 AND status = 'running'",
                        params![site_id.to_string()],
                        |row| row.get(0),
                    )?;
                    if running as u32 >= cfg.max_concurrent_sessions {
                        return Err(RepositoryError::validation(format!(
                            "site {site_id} already has {running} running session(s), at cap {}",
                            cfg.max_concurrent_sessions
                        )));
                    }

                    let now = now();
                    let mut stats = SessionStats::default();
                    stats.start_time = Some(now);

                    conn.execute(
                        "INSERT INTO crawl_sessions (
                            id, site_id, status, config_snapshot, stats, worker_id,
                            abort_reason, started_at, completed_at, last_update, created_at, updated_at
                        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                        params![
                            id.to_string(),
                            site_id.to_string(),
                            SessionStatus::Running.as_str(),
                            to_json(&config_snapshot)?,
                            to_json(&stats)?,
                            worker_id,
                            Option::<String>::None,
                            now.to_rfc3339(),
                            Option::<String>::None,
                            now.to_rfc3339(),
                            now.to_rfc3339(),
                            now.to_rfc3339(),
                        ],
                    )
                    .map_err(RepositoryError::from)?;
                    Ok(id)
                })
                .await
            }
        })
        .await
    }

    /// Progress is only accepted while the session is `running`; a late
    /// update against a terminal session is silently ignored (`Ok(false)`).
    #[tracing::instrument(skip(self, progress), fields(collection = "crawl_sessions", op = "update_session_progress"))]
    pub async fn update_session_progress(
        &self,
        id: Uuid,
        progress: crate::models::SessionProgress,
    ) -> Result<bool> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let progress = progress.clone();
            async move {
                let now = now();
                pool.with_conn(move |conn| {
                    let status_raw: String = conn.query_row(
                        "SELECT status FROM crawl_sessions WHERE id = ?1",
                        params![id.to_string()],
                        |row| row.get(0),
                    )?;
                    if status_raw != SessionStatus::Running.as_str() {
                        return Ok(false);
                    }

                    let mut stats: SessionStats = conn.query_row(
                        "SELECT stats FROM crawl_sessions WHERE id = ?1",
                        params![id.to_string()],
                        |row| column_json(row, "stats"),
                    )?;
                    stats.pages_discovered = progress.pages_discovered;
                    stats.pages_crawled = progress.pages_crawled;
                    stats.pages_failed = progress.pages_failed;
                    stats.bytes_downloaded = progress.bytes_downloaded;
                    stats.errors_count = progress.errors_count;

                    conn.execute(
                        "UPDATE crawl_sessions SET stats = ?1, last_update = ?2, updated_at = ?3 WHERE id = ?4",
                        params![to_json(&stats)?, now.to_rfc3339(), now.to_rfc3339(), id.to_string()],
                    )
                    .map_err(RepositoryError::from)?;
                    Ok(true)
                })
                .await
            }
        })
        .await
    }

    /// Completes the session and atomically stamps the parent site's
    /// `monitoring.last_crawl_time`, matching the §4.E cross-collection
    /// write invariant. `final_stats` overwrites the counters accumulated via
    /// `update_session_progress`; `duration_seconds` is always derived from
    /// `completed_at - started_at`, never taken from the caller.
    #[tracing::instrument(skip(self, final_stats), fields(collection = "crawl_sessions", op = "complete_crawl_session"))]
    pub async fn complete_crawl_session(
        &self,
        id: Uuid,
        status: SessionStatus,
        final_stats: crate::models::SessionProgress,
    ) -> Result<()> {
        let pool = self.pool.clone();
        pool.atomic(move |tx| {
            let now = now();
            let site_id: String = tx
                .query_row(
                    "SELECT site_id FROM crawl_sessions WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .map_err(RepositoryError::from)?;

            let started_at: String = tx
                .query_row(
                    "SELECT started_at FROM crawl_sessions WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .map_err(RepositoryError::from)?;
            let started_at = crate::repository::util::parse_datetime(&started_at)?;

            let mut stats: SessionStats = tx
                .query_row(
                    "SELECT stats FROM crawl_sessions WHERE id = ?1",
                    params![id.to_string()],
                    |row| column_json(row, "stats"),
                )
                .map_err(RepositoryError::from)?;
            stats.pages_discovered = final_stats.pages_discovered;
            stats.pages_crawled = final_stats.pages_crawled;
            stats.pages_failed = final_stats.pages_failed;
            stats.bytes_downloaded = final_stats.bytes_downloaded;
            stats.errors_count = final_stats.errors_count;
            stats.end_time = Some(now);
            stats.duration_seconds = Some((now - started_at).num_seconds());

            tx.execute(
                "UPDATE crawl_sessions SET status = ?1, stats = ?2, completed_at = ?3, last_update = ?4, updated_at = ?5 WHERE id = ?6",
                params![
                    status.as_str(),
                    to_json(&stats)?,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                    id.to_string(),
                ],
            )
            .map_err(RepositoryError::from)?;

            let mut monitoring: crate::models::MonitoringConfig = tx
                .query_row(
                    "SELECT monitoring FROM sites WHERE id = ?1",
                    params![site_id],
                    |row| column_json(row, "monitoring"),
                )
                .map_err(RepositoryError::from)?;
            monitoring.last_crawl_time = Some(now);

            tx.execute(
                "UPDATE sites SET monitoring = ?1, last_crawl_time = ?2, updated_at = ?3 WHERE id = ?4",
                params![to_json(&monitoring)?, now.to_rfc3339(), now.to_rfc3339(), site_id],
            )
            .map_err(RepositoryError::from)?;

            Ok(())
        })
        .await
    }

    #[tracing::instrument(skip(self, reason), fields(collection = "crawl_sessions", op = "abort_session"))]
    pub async fn abort_session(&self, id: Uuid, reason: String) -> Result<()> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let reason = reason.clone();
            async move {
                let now = now();
                pool.with_conn(move |conn| {
                    conn.execute(
                        "UPDATE crawl_sessions SET status = ?1, abort_reason = ?2, completed_at = ?3, last_update = ?4, updated_at = ?5 WHERE id = ?6",
                        params![
                            SessionStatus::Aborted.as_str(),
                            reason,
                            now.to_rfc3339(),
                            now.to_rfc3339(),
                            now.to_rfc3339(),
                            id.to_string(),
                        ],
                    )
                    .map_err(RepositoryError::from)?;
                    Ok(())
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "crawl_sessions", op = "get_active_sessions"))]
    pub async fn get_active_sessions(&self) -> Result<Vec<CrawlSession>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM crawl_sessions WHERE status = 'running' ORDER BY started_at ASC",
                    )?;
                    let sessions = stmt
                        .query_map([], row_to_session)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(sessions)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "crawl_sessions", op = "get_session_history"))]
    pub async fn get_session_history(&self, site_id: Uuid, limit: u32) -> Result<Vec<CrawlSession>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM crawl_sessions WHERE site_id = ?1 ORDER BY started_at DESC LIMIT ?2",
                    )?;
                    let sessions = stmt
                        .query_map(params![site_id.to_string(), limit], row_to_session)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(sessions)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "crawl_sessions", op = "get_session_statistics"))]
    pub async fn get_session_statistics(&self, site_id: Uuid) -> Result<SessionStats> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT stats FROM crawl_sessions WHERE site_id = ?1 AND status != 'running'",
                    )?;
                    let all: Vec<SessionStats> = stmt
                        .query_map(params![site_id.to_string()], |row| column_json(row, "stats"))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    let mut total = SessionStats::default();
                    for s in &all {
                        total.pages_discovered += s.pages_discovered;
                        total.pages_crawled += s.pages_crawled;
                        total.pages_failed += s.pages_failed;
                        total.bytes_downloaded += s.bytes_downloaded;
                        total.errors_count += s.errors_count;
                    }
                    Ok(total)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "crawl_sessions", op = "cleanup_old_sessions"))]
    pub async fn cleanup_old_sessions(&self, older_than: chrono::DateTime<chrono::Utc>) -> Result<u64> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let affected = conn
                        .execute(
                            "DELETE FROM crawl_sessions WHERE status != 'running' AND started_at < ?1",
                            params![older_than.to_rfc3339()],
                        )
                        .map_err(RepositoryError::from)?;
                    Ok(affected as u64)
                })
                .await
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MonitoringConfig, PolitenessConfig, SiteCreate};
    use crate::repository::migrations::migrate;
    use crate::repository::sites::SitesRepository;
    use std::collections::BTreeSet;

    async fn setup() -> (SessionsRepository, SitesRepository, Uuid) {
        let pool = DbPool::open_in_memory().unwrap();
        migrate(&pool).await.unwrap();
        let sites = SitesRepository::new(pool.clone());
        let site_id = sites
            .create_site(SiteCreate {
                name: "Test Site".into(),
                base_url: "https://example.com".into(),
                allowed_domains: BTreeSet::from(["example.com".to_string()]),
                start_urls: vec![],
                allow_patterns: vec![],
                deny_patterns: vec![],
                politeness: PolitenessConfig::default(),
                monitoring: MonitoringConfig::default(),
                tags: vec![],
            })
            .await
            .unwrap();
        (SessionsRepository::new(pool), sites, site_id)
    }

    #[tokio::test]
    async fn start_and_complete_updates_site_last_crawl_time() {
        let (sessions, sites, site_id) = setup().await;
        let session_id = sessions
            .start_crawl_session(site_id, Some("worker-1".into()), SessionConfig::default(), serde_json::json!({}))
            .await
            .unwrap();
        sessions
            .complete_crawl_session(
                session_id,
                SessionStatus::Completed,
                crate::models::SessionProgress {
                    pages_discovered: 10,
                    pages_crawled: 9,
                    pages_failed: 1,
                    bytes_downloaded: 4096,
                    errors_count: 1,
                },
            )
            .await
            .unwrap();

        let site = sites.get_crawl_configuration(site_id).await.unwrap();
        assert!(site.monitoring.last_crawl_time.is_some());

        let history = sessions.get_session_history(site_id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, SessionStatus::Completed);
        assert_eq!(history[0].stats.pages_crawled, 9);
        assert!(history[0].stats.duration_seconds.is_some());
    }

    #[tokio::test]
    async fn abort_sets_reason_and_leaves_active_list_empty() {
        let (sessions, _sites, site_id) = setup().await;
        let session_id = sessions
            .start_crawl_session(site_id, None, SessionConfig::default(), serde_json::json!({}))
            .await
            .unwrap();
        sessions.abort_session(session_id, "operator cancelled".into()).await.unwrap();
        assert!(sessions.get_active_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn starting_beyond_max_concurrent_sessions_is_rejected() {
        let (sessions, _sites, site_id) = setup().await;
        let cfg = SessionConfig {
            max_concurrent_sessions: 1,
        };
        sessions
            .start_crawl_session(site_id, None, cfg.clone(), serde_json::json!({}))
            .await
            .unwrap();

        let result = sessions.start_crawl_session(site_id, None, cfg, serde_json::json!({})).await;
        assert!(matches!(result, Err(RepositoryError::Validation(_))));
    }

    #[tokio::test]
    async fn starting_against_an_unknown_site_is_rejected() {
        let (sessions, _sites, _site_id) = setup().await;
        let result = sessions
            .start_crawl_session(Uuid::new_v4(), None, SessionConfig::default(), serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn progress_on_a_completed_session_is_silently_ignored() {
        let (sessions, _sites, site_id) = setup().await;
        let session_id = sessions
            .start_crawl_session(site_id, None, SessionConfig::default(), serde_json::json!({}))
            .await
            .unwrap();
        sessions
            .complete_crawl_session(session_id, SessionStatus::Completed, crate::models::SessionProgress {
                pages_discovered: 1,
                pages_crawled: 1,
                pages_failed: 0,
                bytes_downloaded: 0,
                errors_count: 0,
            })
            .await
            .unwrap();

        let accepted = sessions
            .update_session_progress(
                session_id,
                crate::models::SessionProgress {
                    pages_discovered: 99,
                    pages_crawled: 99,
                    pages_failed: 0,
                    bytes_downloaded: 0,
                    errors_count: 0,
                },
            )
            .await
            .unwrap();
        assert!(!accepted);
    }
}
