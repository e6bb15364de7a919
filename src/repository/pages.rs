//! Pages store, §4.D.

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{RepositoryError, Result};
use crate::ids::{self, content_hash};
use crate::models::page::normalize_url;
use crate::models::{Page, PageCreate, PageMetadata, ProcessingStatus, Redirect};
use crate::storage::pool::DbPool;
use crate::storage::retry::{with_retry, RetryPolicy};

use super::util::{column_datetime, column_datetime_opt, column_json, column_json_opt, now, to_json};

#[derive(Clone)]
pub struct PagesRepository {
    pool: DbPool,
}

fn row_to_page(row: &Row) -> rusqlite::Result<Page> {
    let id: String = row.get("id")?;
    let site_id: String = row.get("site_id")?;
    let status_raw: String = row.get("processing_status")?;
    let processing_status = ProcessingStatus::parse(&status_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(Page {
        id: Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        site_id: Uuid::parse_str(&site_id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        url: row.get("url")?,
        title: row.get("title")?,
        content: row.get("content")?,
        content_hash: row.get("content_hash")?,
        author: row.get("author")?,
        published_date: column_datetime_opt(row, "published_date")?,
        processing_status,
        processing_info: column_json_opt(row, "processing_info")?,
        redirect_history: column_json::<Vec<Redirect>>(row, "redirect_history")?,
        metadata: column_json::<PageMetadata>(row, "metadata")?,
        versions: column_json(row, "versions")?,
        created_at: column_datetime(row, "created_at")?,
        updated_at: column_datetime(row, "updated_at")?,
        last_modified: column_datetime_opt(row, "last_modified")?,
        processed_at: column_datetime_opt(row, "processed_at")?,
    })
}

impl PagesRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, page), fields(collection = "pages", op = "create_page"))]
    pub async fn create_page(&self, page: PageCreate) -> Result<Uuid> {
        page.validate()?;
        let normalized_url = normalize_url(&page.url)?;
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let page = page_clone(&page);
            let normalized_url = normalized_url.clone();
            async move {
                let site_exists_id = page.site_id;
                pool.with_conn(move |conn| {
                    let site_exists: bool = conn
                        .query_row(
                            "SELECT 1 FROM sites WHERE id = ?1",
                            params![site_exists_id.to_string()],
                            |_| Ok(()),
                        )
                        .optional()?
                        .is_some();
                    if !site_exists {
                        return Err(RepositoryError::validation(format!(
                            "site {site_exists_id} does not exist"
                        )));
                    }

                    let id = ids::new_id();
                    let now = now();
                    let hash = page.content.as_deref().map(content_hash);

                    let result = conn.execute(
                        "INSERT INTO pages (
                            id, site_id, url, title, content, content_hash, author, published_date,
                            processing_status, processing_info, redirect_history, metadata, versions,
                            last_modified, processed_at, created_at, updated_at
                        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
                        params![
                            id.to_string(),
                            page.site_id.to_string(),
                            normalized_url,
                            page.title,
                            page.content,
                            hash,
                            page.author,
                            page.published_date.map(|t| t.to_rfc3339()),
                            ProcessingStatus::Pending.as_str(),
                            Option::<String>::None,
                            to_json(&Vec::<Redirect>::new())?,
                            to_json(&page.metadata)?,
                            to_json(&Vec::<crate::models::PageVersion>::new())?,
                            Option::<String>::None,
                            Option::<String>::None,
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

    #[tracing::instrument(skip(self, url), fields(collection = "pages", op = "get_page_by_url"))]
    pub async fn get_page_by_url(&self, url: &str) -> Result<Option<Page>> {
        let normalized = normalize_url(url)?;
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let normalized = normalized.clone();
            async move {
                pool.with_conn(move |conn| {
                    conn.query_row("SELECT * FROM pages WHERE url = ?1", params![normalized], row_to_page)
                        .optional()
                        .map_err(RepositoryError::from)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self, content, hash), fields(collection = "pages", op = "update_page_content"))]
    pub async fn update_page_content(&self, id: Uuid, content: String, hash: Option<String>) -> Result<()> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let content = content.clone();
            let hash = hash.clone();
            async move {
                let computed_hash = hash.unwrap_or_else(|| content_hash(&content));
                let now = now();
                pool.with_conn(move |conn| {
                    conn.execute(
                        "UPDATE pages SET content = ?1, content_hash = ?2, last_modified = ?3,
                         processing_status = ?4, updated_at = ?5 WHERE id = ?6",
                        params![
                            content,
                            computed_hash,
                            now.to_rfc3339(),
                            ProcessingStatus::Pending.as_str(),
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

    #[tracing::instrument(skip(self), fields(collection = "pages", op = "get_pages_by_site"))]
    pub async fn get_pages_by_site(&self, site_id: Uuid, limit: u32) -> Result<Vec<Page>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM pages WHERE site_id = ?1 ORDER BY created_at DESC LIMIT ?2",
                    )?;
                    let pages = stmt
                        .query_map(params![site_id.to_string(), limit], row_to_page)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(pages)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "pages", op = "get_pages_modified_since"))]
    pub async fn get_pages_modified_since(
        &self,
        site_id: Uuid,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<Page>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM pages WHERE site_id = ?1 AND last_modified >= ?2 ORDER BY last_modified DESC",
                    )?;
                    let pages = stmt
                        .query_map(params![site_id.to_string(), since.to_rfc3339()], row_to_page)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(pages)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self, info), fields(collection = "pages", op = "mark_page_processed"))]
    pub async fn mark_page_processed(&self, id: Uuid, info: serde_json::Value) -> Result<()> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let info = info.clone();
            async move {
                let now = now();
                pool.with_conn(move |conn| {
                    conn.execute(
                        "UPDATE pages SET processing_status = ?1, processing_info = ?2, processed_at = ?3, updated_at = ?4 WHERE id = ?5",
                        params![
                            ProcessingStatus::Processed.as_str(),
                            to_json(&info)?,
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

    #[tracing::instrument(skip(self), fields(collection = "pages", op = "get_unprocessed_pages"))]
    pub async fn get_unprocessed_pages(&self, site_id: Option<Uuid>, limit: u32) -> Result<Vec<Page>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let pages = match site_id {
                        Some(site_id) => {
                            let mut stmt = conn.prepare(
                                "SELECT * FROM pages WHERE site_id = ?1 AND processing_status IN ('pending','failed')
                                 ORDER BY created_at ASC LIMIT ?2",
                            )?;
                            stmt.query_map(params![site_id.to_string(), limit], row_to_page)?
                                .collect::<rusqlite::Result<Vec<_>>>()?
                        }
                        None => {
                            let mut stmt = conn.prepare(
                                "SELECT * FROM pages WHERE processing_status IN ('pending','failed')
                                 ORDER BY created_at ASC LIMIT ?1",
                            )?;
                            stmt.query_map(params![limit], row_to_page)?
                                .collect::<rusqlite::Result<Vec<_>>>()?
                        }
                    };
                    Ok(pages)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self, hash), fields(collection = "pages", op = "check_content_exists"))]
    pub async fn check_content_exists(&self, hash: &str) -> Result<bool> {
        let hash = hash.to_string();
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let hash = hash.clone();
            async move {
                pool.with_conn(move |conn| {
                    let exists: bool = conn
                        .query_row("SELECT 1 FROM pages WHERE content_hash = ?1 LIMIT 1", params![hash], |_| Ok(()))
                        .optional()
                        .map_err(RepositoryError::from)?
                        .is_some();
                    Ok(exists)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self, name), fields(collection = "pages", op = "get_pages_by_author"))]
    pub async fn get_pages_by_author(&self, name: &str) -> Result<Vec<Page>> {
        let pattern = format!("%{}%", name.to_ascii_lowercase());
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let pattern = pattern.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM pages WHERE LOWER(author) LIKE ?1 ORDER BY created_at DESC",
                    )?;
                    let pages = stmt
                        .query_map(params![pattern], row_to_page)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(pages)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self, ids), fields(collection = "pages", op = "bulk_update_processing_status"))]
    pub async fn bulk_update_processing_status(&self, ids: Vec<Uuid>, status: ProcessingStatus) -> Result<()> {
        let pool = self.pool.clone();
        pool.atomic(move |tx| {
            let now = now().to_rfc3339();
            for id in &ids {
                tx.execute(
                    "UPDATE pages SET processing_status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![status.as_str(), now, id.to_string()],
                )
                .map_err(RepositoryError::from)?;
            }
            Ok(())
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "pages", op = "get_page_statistics"))]
    pub async fn get_page_statistics(&self, site_id: Uuid) -> Result<PageStatistics> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT processing_status, COUNT(*) FROM pages WHERE site_id = ?1 GROUP BY processing_status",
                    )?;
                    let mut counts = std::collections::BTreeMap::new();
                    let rows = stmt.query_map(params![site_id.to_string()], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?;
                    for row in rows {
                        let (status, count) = row?;
                        counts.insert(status, count as u64);
                    }
                    let max_last_modified: Option<String> = conn
                        .query_row(
                            "SELECT MAX(last_modified) FROM pages WHERE site_id = ?1",
                            params![site_id.to_string()],
                            |row| row.get(0),
                        )
                        .optional()?
                        .flatten();
                    Ok(PageStatistics {
                        counts_by_status: counts,
                        max_last_modified: max_last_modified
                            .map(|s| super::util::parse_datetime(&s))
                            .transpose()?,
                    })
                })
                .await
            }
        })
        .await
    }
}

#[derive(Debug, Clone, Default)]
pub struct PageStatistics {
    pub counts_by_status: std::collections::BTreeMap<String, u64>,
    pub max_last_modified: Option<chrono::DateTime<chrono::Utc>>,
}

fn page_clone(page: &PageCreate) -> PageCreate {
    PageCreate {
        site_id: page.site_id,
        url: page.url.clone(),
        title: page.title.clone(),
        content: page.content.clone(),
        author: page.author.clone(),
        published_date: page.published_date,
        metadata: page.metadata.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MonitoringConfig, PolitenessConfig, SiteCreate};
    use crate::repository::migrations::migrate;
    use crate::repository::sites::SitesRepository;
    use std::collections::BTreeSet;

    async fn setup() -> (PagesRepository, Uuid) {
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
        (PagesRepository::new(pool), site_id)
    }

    #[tokio::test]
    async fn create_page_normalizes_url_and_defaults_pending() {
        let (repo, site_id) = setup().await;
        let id = repo
            .create_page(PageCreate {
                site_id,
                url: "HTTPS://Example.com/Path/".into(),
                title: Some("A Page".into()),
                content: None,
                author: None,
                published_date: None,
                metadata: PageMetadata::default(),
            })
            .await
            .unwrap();
        let page = repo.get_page_by_url("https://example.com/Path").await.unwrap().unwrap();
        assert_eq!(page.id, id);
        assert_eq!(page.processing_status, ProcessingStatus::Pending);
    }

    #[tokio::test]
    async fn duplicate_site_url_pair_rejected() {
        let (repo, site_id) = setup().await;
        let make = || PageCreate {
            site_id,
            url: "https://example.com/x".into(),
            title: None,
            content: None,
            author: None,
            published_date: None,
            metadata: PageMetadata::default(),
        };
        repo.create_page(make()).await.unwrap();
        let err = repo.create_page(make()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::DuplicateResource(_)));
    }

    #[tokio::test]
    async fn update_content_computes_hash_and_resets_status() {
        let (repo, site_id) = setup().await;
        let id = repo
            .create_page(PageCreate {
                site_id,
                url: "https://example.com/y".into(),
                title: None,
                content: None,
                author: None,
                published_date: None,
                metadata: PageMetadata::default(),
            })
            .await
            .unwrap();
        repo.mark_page_processed(id, serde_json::json!({"ok": true})).await.unwrap();
        repo.update_page_content(id, "new body".into(), None).await.unwrap();
        let page = repo.get_page_by_url("https://example.com/y").await.unwrap().unwrap();
        assert_eq!(page.processing_status, ProcessingStatus::Pending);
        assert_eq!(page.content_hash.unwrap().len(), 64);
    }
}
