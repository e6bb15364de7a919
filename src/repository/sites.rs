//! Sites store, §4.C. Grounded on the teacher's `SourceRepository`
//! (single-table CRUD with a typed `new_id`/`row_to_*` pair) generalized to
//! the pooled-async storage primitives.

use std::collections::BTreeSet;

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{RepositoryError, Result};
use crate::ids;
use crate::models::site::is_valid_domain;
use crate::models::{CrawlFrequency, HealthStatus, MonitoringConfig, PolitenessConfig, Site, SiteCreate};
use crate::storage::pool::DbPool;
use crate::storage::retry::{with_retry, RetryPolicy};

use super::util::{column_datetime, column_json, now, to_json};

#[derive(Clone)]
pub struct SitesRepository {
    pool: DbPool,
}

fn row_to_site(row: &Row) -> rusqlite::Result<Site> {
    let id: String = row.get("id")?;
    let allowed_domains: BTreeSet<String> = column_json(row, "allowed_domains")?;
    let start_urls: Vec<String> = column_json(row, "start_urls")?;
    let allow_patterns: Vec<String> = column_json(row, "allow_patterns")?;
    let deny_patterns: Vec<String> = column_json(row, "deny_patterns")?;
    let politeness: PolitenessConfig = column_json(row, "politeness")?;
    let monitoring: MonitoringConfig = column_json(row, "monitoring")?;
    let tags: Vec<String> = column_json(row, "tags")?;
    let health_status_raw: String = row.get("health_status")?;
    let health_status = HealthStatus::parse(&health_status_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(Site {
        id: Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        name: row.get("name")?,
        base_url: row.get("base_url")?,
        allowed_domains,
        start_urls,
        allow_patterns,
        deny_patterns,
        politeness,
        monitoring,
        tags,
        health_status,
        created_at: column_datetime(row, "created_at")?,
        updated_at: column_datetime(row, "updated_at")?,
    })
}

impl SitesRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, cfg), fields(collection = "sites", op = "create_site"))]
    pub async fn create_site(&self, cfg: SiteCreate) -> Result<Uuid> {
        cfg.validate()?;
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let cfg = cfg.clone();
            async move {
                let id = ids::new_id();
                let now = now();
                let base_url = cfg.normalized_base_url();
                let monitoring = cfg.monitoring.clone();
                pool.with_conn(move |conn| {
                    let result = conn.execute(
                        "INSERT INTO sites (
                            id, name, base_url, allowed_domains, start_urls, allow_patterns,
                            deny_patterns, politeness, monitoring, tags, health_status, active,
                            frequency, next_scheduled_crawl, last_crawl_time, created_at, updated_at
                        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
                        params![
                            id.to_string(),
                            cfg.name,
                            base_url,
                            to_json(&cfg.allowed_domains)?,
                            to_json(&cfg.start_urls)?,
                            to_json(&cfg.allow_patterns)?,
                            to_json(&cfg.deny_patterns)?,
                            to_json(&cfg.politeness)?,
                            to_json(&monitoring)?,
                            to_json(&cfg.tags)?,
                            HealthStatus::Unknown.as_str(),
                            monitoring.active as i64,
                            monitoring.frequency.as_str(),
                            monitoring.next_scheduled_crawl.map(|t| t.to_rfc3339()),
                            monitoring.last_crawl_time.map(|t| t.to_rfc3339()),
                            now.to_rfc3339(),
                            now.to_rfc3339(),
                        ],
                    );
                    match result {
                        Ok(_) => Ok(id),
                        Err(e) => Err(RepositoryError::from(e)),
                    }
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "sites", op = "get_active_sites"))]
    pub async fn get_active_sites(&self) -> Result<Vec<Site>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(|conn| {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM sites WHERE active = 1
                         ORDER BY next_scheduled_crawl IS NULL, next_scheduled_crawl ASC",
                    )?;
                    let sites = stmt
                        .query_map([], row_to_site)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(sites)
                })
                .await
            }
        })
        .await
    }

    /// Matches `domain` against a site's `base_url` host or its
    /// `allowed_domains` set, both by exact equality — never by substring —
    /// so a host that merely contains the queried domain cannot match.
    #[tracing::instrument(skip(self, domain), fields(collection = "sites", op = "get_site_by_domain"))]
    pub async fn get_site_by_domain(&self, domain: &str) -> Result<Option<Site>> {
        let host = strip_scheme(domain).to_ascii_lowercase();
        if !is_valid_domain(&host) {
            return Err(RepositoryError::validation(format!("invalid domain: {domain}")));
        }
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let host = host.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare("SELECT * FROM sites")?;
                    let sites = stmt
                        .query_map([], row_to_site)?
                        .collect::<rusqlite::Result<Vec<Site>>>()?;
                    Ok(sites.into_iter().find(|site| {
                        let base_host = strip_scheme(&site.base_url).to_ascii_lowercase();
                        base_host == host || site.allowed_domains.iter().any(|d| d.to_ascii_lowercase() == host)
                    }))
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self, delay_ms, max_concurrent, allowed_domains), fields(collection = "sites", op = "update_crawl_settings"))]
    pub async fn update_crawl_settings(
        &self,
        id: Uuid,
        delay_ms: Option<u64>,
        max_concurrent: Option<u32>,
        allowed_domains: Option<BTreeSet<String>>,
    ) -> Result<()> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let allowed_domains = allowed_domains.clone();
            async move {
                let now = now();
                pool.with_conn(move |conn| {
                    let site = conn
                        .query_row("SELECT * FROM sites WHERE id = ?1", params![id.to_string()], row_to_site)
                        .map_err(RepositoryError::from)?;

                    let mut politeness = site.politeness;
                    if let Some(delay) = delay_ms {
                        politeness.min_request_delay_ms = delay;
                    }
                    if let Some(max_concurrent) = max_concurrent {
                        politeness.max_concurrent_requests = max_concurrent;
                    }
                    let domains_json = match &allowed_domains {
                        Some(domains) => to_json(domains)?,
                        None => to_json(&site.allowed_domains)?,
                    };

                    conn.execute(
                        "UPDATE sites SET politeness = ?1, allowed_domains = ?2, updated_at = ?3 WHERE id = ?4",
                        params![to_json(&politeness)?, domains_json, now.to_rfc3339(), id.to_string()],
                    )
                    .map_err(RepositoryError::from)?;
                    Ok(())
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self, reason), fields(collection = "sites", op = "disable_site"))]
    pub async fn disable_site(&self, id: Uuid, reason: String) -> Result<()> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let reason = reason.clone();
            async move {
                let now = now();
                pool.with_conn(move |conn| {
                    let mut site = conn
                        .query_row("SELECT * FROM sites WHERE id = ?1", params![id.to_string()], row_to_site)
                        .map_err(RepositoryError::from)?;
                    site.monitoring.active = false;
                    site.monitoring.next_scheduled_crawl = None;
                    site.monitoring.disabled_reason = Some(reason);

                    conn.execute(
                        "UPDATE sites SET monitoring = ?1, active = 0, next_scheduled_crawl = NULL, updated_at = ?2 WHERE id = ?3",
                        params![to_json(&site.monitoring)?, now.to_rfc3339(), id.to_string()],
                    )
                    .map_err(RepositoryError::from)?;
                    Ok(())
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self, tag), fields(collection = "sites", op = "get_sites_for_crawl_schedule"))]
    pub async fn get_sites_for_crawl_schedule(&self, tag: Option<String>) -> Result<Vec<Site>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let tag = tag.clone();
            async move {
                pool.with_conn(move |conn| {
                    let now = now().to_rfc3339();
                    let mut stmt = conn.prepare(
                        "SELECT * FROM sites
                         WHERE active = 1 AND (next_scheduled_crawl IS NULL OR next_scheduled_crawl <= ?1)
                         ORDER BY last_crawl_time IS NULL DESC, last_crawl_time ASC",
                    )?;
                    let sites = stmt
                        .query_map(params![now], row_to_site)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    let filtered = match tag {
                        Some(tag) => sites.into_iter().filter(|s| s.tags.contains(&tag)).collect(),
                        None => sites,
                    };
                    Ok(filtered)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "sites", op = "update_site_health_status"))]
    pub async fn update_site_health_status(&self, id: Uuid, status: HealthStatus) -> Result<()> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                let now = now();
                pool.with_conn(move |conn| {
                    conn.execute(
                        "UPDATE sites SET health_status = ?1, updated_at = ?2 WHERE id = ?3",
                        params![status.as_str(), now.to_rfc3339(), id.to_string()],
                    )
                    .map_err(RepositoryError::from)?;
                    Ok(())
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "sites", op = "get_crawl_configuration"))]
    pub async fn get_crawl_configuration(&self, id: Uuid) -> Result<Site> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    conn.query_row("SELECT * FROM sites WHERE id = ?1", params![id.to_string()], row_to_site)
                        .map_err(RepositoryError::from)
                })
                .await
            }
        })
        .await
    }
}

fn strip_scheme(input: &str) -> &str {
    input
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::migrations::migrate;

    fn sample_site() -> SiteCreate {
        SiteCreate {
            name: "Stanford Encyclopedia".into(),
            base_url: "https://plato.stanford.edu".into(),
            allowed_domains: BTreeSet::from(["plato.stanford.edu".to_string()]),
            start_urls: vec!["https://plato.stanford.edu/contents.html".into()],
            allow_patterns: vec![],
            deny_patterns: vec![],
            politeness: PolitenessConfig::default(),
            monitoring: MonitoringConfig::default(),
            tags: vec!["philosophy".into()],
        }
    }

    async fn repo() -> SitesRepository {
        let pool = DbPool::open_in_memory().unwrap();
        migrate(&pool).await.unwrap();
        SitesRepository::new(pool)
    }

    #[tokio::test]
    async fn create_and_fetch_active_site() {
        let repo = repo().await;
        let id = repo.create_site(sample_site()).await.unwrap();
        let active = repo.get_active_sites().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, id);
    }

    #[tokio::test]
    async fn duplicate_base_url_is_rejected() {
        let repo = repo().await;
        repo.create_site(sample_site()).await.unwrap();
        let err = repo.create_site(sample_site()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::DuplicateResource(_)));
    }

    #[tokio::test]
    async fn disable_site_clears_schedule() {
        let repo = repo().await;
        let id = repo.create_site(sample_site()).await.unwrap();
        repo.disable_site(id, "manually paused".into()).await.unwrap();
        let active = repo.get_active_sites().await.unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn get_site_by_domain_matches_exact_host() {
        let repo = repo().await;
        let id = repo.create_site(sample_site()).await.unwrap();
        let found = repo.get_site_by_domain("plato.stanford.edu").await.unwrap().unwrap();
        assert_eq!(found.id, id);
    }

    #[tokio::test]
    async fn get_site_by_domain_does_not_match_a_host_that_merely_contains_the_domain() {
        let repo = repo().await;
        repo.create_site(sample_site()).await.unwrap();
        let mut evil = sample_site();
        evil.name = "Impostor".into();
        evil.base_url = "https://evil-stanford.edu.attacker.net".into();
        evil.allowed_domains = BTreeSet::from(["evil-stanford.edu.attacker.net".to_string()]);
        repo.create_site(evil).await.unwrap();

        let found = repo.get_site_by_domain("stanford.edu").await.unwrap();
        assert!(found.is_none(), "a substring host must not match the queried domain");
    }
}
