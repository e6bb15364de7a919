//! Sitemap store, §3 "SiteMap" — purely passive: no invariants beyond URL
//! well-formedness, so this repository is a thin recorder for the crawl
//! frontier rather than a state machine like the processing queue.

use rusqlite::{params, OptionalExtension, Row};
use url::Url;

use crate::error::{RepositoryError, Result};
use crate::ids::new_id;
use crate::models::{LinkStatus, SiteMapEntry};
use crate::storage::pool::DbPool;
use crate::storage::retry::{with_retry, RetryPolicy};

use super::util::{column_datetime, now, to_rfc3339};

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<SiteMapEntry> {
    let status: String = row.get("status")?;
    Ok(SiteMapEntry {
        id: row.get::<_, String>("id")?.parse().unwrap_or_else(|_| new_id()),
        site_id: row.get::<_, String>("site_id")?.parse().unwrap_or_else(|_| new_id()),
        url: row.get("url")?,
        parent_url: row.get("parent_url")?,
        depth: row.get::<_, i64>("depth")? as u32,
        status: match status.as_str() {
            "queued" => LinkStatus::Queued,
            "crawled" => LinkStatus::Crawled,
            "excluded" => LinkStatus::Excluded,
            _ => LinkStatus::Discovered,
        },
        discovered_at: column_datetime(row, "discovered_at")?,
        last_seen_at: column_datetime(row, "last_seen_at")?,
    })
}

#[derive(Clone)]
pub struct SiteMapsRepository {
    pool: DbPool,
}

impl SiteMapsRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Records a discovered URL. Re-discovering an existing `(site_id, url)`
    /// pair just bumps `last_seen_at` — sitemaps accumulate, they don't reject.
    #[tracing::instrument(skip(self), fields(collection = "sitemaps", op = "record_discovered_url"))]
    pub async fn record_discovered_url(
        &self,
        site_id: uuid::Uuid,
        url: String,
        parent_url: Option<String>,
        depth: u32,
    ) -> Result<uuid::Uuid> {
        Url::parse(&url).map_err(|e| RepositoryError::validation(format!("malformed URL: {e}")))?;

        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let url = url.clone();
            let parent_url = parent_url.clone();
            async move {
                let now_str = to_rfc3339(now());
                pool.with_conn(move |conn| {
                    let existing: Option<String> = conn
                        .query_row(
                            "SELECT id FROM sitemaps WHERE site_id = ?1 AND url = ?2",
                            params![site_id.to_string(), url],
                            |row| row.get(0),
                        )
                        .optional()?;

                    if let Some(id) = existing {
                        conn.execute(
                            "UPDATE sitemaps SET last_seen_at = ?1 WHERE id = ?2",
                            params![now_str, id],
                        )?;
                        Ok(id.parse().unwrap_or_else(|_| new_id()))
                    } else {
                        let id = new_id();
                        conn.execute(
                            "INSERT INTO sitemaps (id, site_id, url, parent_url, depth, status, discovered_at, last_seen_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, 'discovered', ?6, ?6)",
                            params![id.to_string(), site_id.to_string(), url, parent_url, depth, now_str],
                        )?;
                        Ok(id)
                    }
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "sitemaps", op = "mark_link_status"))]
    pub async fn mark_link_status(&self, id: uuid::Uuid, status: LinkStatus) -> Result<()> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let affected = conn.execute(
                        "UPDATE sitemaps SET status = ?1, last_seen_at = ?2 WHERE id = ?3",
                        params![status.as_str(), to_rfc3339(now()), id.to_string()],
                    )?;
                    if affected == 0 {
                        return Err(RepositoryError::not_found(format!("sitemaps/{id}")));
                    }
                    Ok(())
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "sitemaps", op = "get_frontier"))]
    pub async fn get_frontier(&self, site_id: uuid::Uuid, status: LinkStatus) -> Result<Vec<SiteMapEntry>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM sitemaps WHERE site_id = ?1 AND status = ?2 ORDER BY depth ASC, discovered_at ASC",
                    )?;
                    let rows = stmt
                        .query_map(params![site_id.to_string(), status.as_str()], row_to_entry)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(rows)
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

    async fn setup() -> (SiteMapsRepository, uuid::Uuid) {
        let pool = DbPool::open_in_memory().unwrap();
        crate::repository::migrations::migrate(&pool).await.unwrap();
        let sites = crate::repository::sites::SitesRepository::new(pool.clone());
        let site_id = sites
            .create_site(crate::models::SiteCreate {
                name: "Test".into(),
                base_url: "https://example.com".into(),
                allowed_domains: std::collections::BTreeSet::from(["example.com".to_string()]),
                start_urls: vec![],
                allow_patterns: vec![],
                deny_patterns: vec![],
                politeness: crate::models::PolitenessConfig::default(),
                monitoring: crate::models::MonitoringConfig::default(),
                tags: vec![],
            })
            .await
            .unwrap();
        (SiteMapsRepository::new(pool), site_id)
    }

    #[tokio::test]
    async fn rediscovering_url_updates_last_seen_instead_of_duplicating() {
        let (repo, site_id) = setup().await;
        let first = repo
            .record_discovered_url(site_id, "https://example.com/a".into(), None, 0)
            .await
            .unwrap();
        let second = repo
            .record_discovered_url(site_id, "https://example.com/a".into(), None, 0)
            .await
            .unwrap();
        assert_eq!(first, second);

        let frontier = repo.get_frontier(site_id, LinkStatus::Discovered).await.unwrap();
        assert_eq!(frontier.len(), 1);
    }

    #[tokio::test]
    async fn malformed_url_rejected() {
        let (repo, site_id) = setup().await;
        let result = repo.record_discovered_url(site_id, "not a url".into(), None, 0).await;
        assert!(matches!(result, Err(RepositoryError::Validation(_))));
    }

    #[tokio::test]
    async fn marking_status_moves_entry_between_frontiers() {
        let (repo, site_id) = setup().await;
        let id = repo
            .record_discovered_url(site_id, "https://example.com/b".into(), None, 1)
            .await
            .unwrap();
        repo.mark_link_status(id, LinkStatus::Queued).await.unwrap();

        assert!(repo.get_frontier(site_id, LinkStatus::Discovered).await.unwrap().is_empty());
        assert_eq!(repo.get_frontier(site_id, LinkStatus::Queued).await.unwrap().len(), 1);
    }
}
