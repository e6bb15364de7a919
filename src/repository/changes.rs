//! Content changes store, §4.G.

use rusqlite::{params, Row};
use uuid::Uuid;

use crate::error::{RepositoryError, Result};
use crate::ids;
use crate::models::change::derive_priority;
use crate::models::{ChangeFrequency, ChangeTrend, ChangeType, ContentChange, ContentChangeCreate};
use crate::storage::pool::DbPool;
use crate::storage::retry::{with_retry, RetryPolicy};
use crate::storage::sanitize::sanitize_document;

use super::util::{column_datetime, column_datetime_opt, column_json, now, to_json};

#[derive(Clone)]
pub struct ChangesRepository {
    pool: DbPool,
}

fn row_to_change(row: &Row) -> rusqlite::Result<ContentChange> {
    let id: String = row.get("id")?;
    let page_id: String = row.get("page_id")?;
    let site_id: String = row.get("site_id")?;
    let change_type_raw: String = row.get("change_type")?;
    let change_type = ChangeType::parse(&change_type_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
    let priority_raw: String = row.get("priority")?;
    let priority = crate::models::ChangePriority::parse(&priority_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
    let notification_sent: i64 = row.get("notification_sent")?;

    Ok(ContentChange {
        id: Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        page_id: Uuid::parse_str(&page_id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        site_id: Uuid::parse_str(&site_id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        change_type,
        previous_hash: row.get("previous_hash")?,
        new_hash: row.get("new_hash")?,
        url: row.get("url")?,
        title: row.get("title")?,
        priority,
        detected_at: column_datetime(row, "detected_at")?,
        notification_sent: notification_sent != 0,
        notified_at: column_datetime_opt(row, "notified_at")?,
        context: column_json(row, "context")?,
        created_at: column_datetime(row, "created_at")?,
        updated_at: column_datetime(row, "updated_at")?,
    })
}

impl ChangesRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, change), fields(collection = "content_changes", op = "record_content_change"))]
    pub async fn record_content_change(&self, change: ContentChangeCreate) -> Result<Uuid> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let mut change = change_clone(&change);
            async move {
                change.context = sanitize_document(&change.context)?;
                let priority = derive_priority(change.change_type, &change.context);
                pool.with_conn(move |conn| {
                    let (url, title): (String, Option<String>) = match change.change_type {
                        ChangeType::Deleted => (
                            change.url.clone().unwrap_or_default(),
                            change.title.clone(),
                        ),
                        ChangeType::New | ChangeType::Modified => conn.query_row(
                            "SELECT url, title FROM pages WHERE id = ?1",
                            params![change.page_id.to_string()],
                            |row| Ok((row.get(0)?, row.get(1)?)),
                        )?,
                    };

                    let id = ids::new_id();
                    let now = now();
                    conn.execute(
                        "INSERT INTO content_changes (
                            id, page_id, site_id, change_type, previous_hash, new_hash, url, title,
                            priority, detected_at, notification_sent, notified_at, context, created_at, updated_at
                        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                        params![
                            id.to_string(),
                            change.page_id.to_string(),
                            change.site_id.to_string(),
                            change.change_type.as_str(),
                            change.previous_hash,
                            change.new_hash,
                            url,
                            title,
                            priority.as_str(),
                            now.to_rfc3339(),
                            0,
                            Option::<String>::None,
                            to_json(&change.context)?,
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

    #[tracing::instrument(skip(self), fields(collection = "content_changes", op = "get_changes_since"))]
    pub async fn get_changes_since(
        &self,
        site_id: Uuid,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<ContentChange>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM content_changes WHERE site_id = ?1 AND detected_at >= ?2 ORDER BY detected_at DESC",
                    )?;
                    let changes = stmt
                        .query_map(params![site_id.to_string(), since.to_rfc3339()], row_to_change)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(changes)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "content_changes", op = "get_new_pages_today"))]
    pub async fn get_new_pages_today(&self, site_id: Uuid) -> Result<Vec<ContentChange>> {
        let since = now() - chrono::Duration::hours(24);
        let changes = self.get_changes_since(site_id, since).await?;
        Ok(changes.into_iter().filter(|c| c.change_type == ChangeType::New).collect())
    }

    #[tracing::instrument(skip(self), fields(collection = "content_changes", op = "get_modified_pages_summary"))]
    pub async fn get_modified_pages_summary(
        &self,
        site_id: Uuid,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<ContentChange>> {
        let changes = self.get_changes_since(site_id, since).await?;
        Ok(changes
            .into_iter()
            .filter(|c| c.change_type == ChangeType::Modified)
            .collect())
    }

    #[tracing::instrument(skip(self), fields(collection = "content_changes", op = "get_unnotified_changes"))]
    pub async fn get_unnotified_changes(&self, min_priority: crate::models::ChangePriority) -> Result<Vec<ContentChange>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM content_changes WHERE notification_sent = 0 ORDER BY detected_at ASC",
                    )?;
                    let changes = stmt
                        .query_map([], row_to_change)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(changes.into_iter().filter(|c| c.priority >= min_priority).collect::<Vec<_>>())
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "content_changes", op = "mark_change_notified"))]
    pub async fn mark_change_notified(&self, id: Uuid) -> Result<()> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                let now = now();
                pool.with_conn(move |conn| {
                    conn.execute(
                        "UPDATE content_changes SET notification_sent = 1, notified_at = ?1, updated_at = ?2 WHERE id = ?3",
                        params![now.to_rfc3339(), now.to_rfc3339(), id.to_string()],
                    )
                    .map_err(RepositoryError::from)?;
                    Ok(())
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "content_changes", op = "get_change_frequency"))]
    pub async fn get_change_frequency(&self, site_id: Uuid, window_days: i64) -> Result<ChangeFrequency> {
        let since_recent = now() - chrono::Duration::days(window_days);
        let since_prior = now() - chrono::Duration::days(window_days * 2);

        let recent = self.get_changes_since(site_id, since_recent).await?;
        let prior_window = self.get_changes_since(site_id, since_prior).await?;
        let prior_count = prior_window
            .iter()
            .filter(|c| c.detected_at < since_recent)
            .count();

        let mut totals_by_type = std::collections::BTreeMap::new();
        let mut per_day: std::collections::BTreeMap<String, u64> = std::collections::BTreeMap::new();
        for change in &recent {
            *totals_by_type.entry(change.change_type.as_str().to_string()).or_insert(0) += 1;
            let day = change.detected_at.format("%Y-%m-%d").to_string();
            *per_day.entry(day).or_insert(0) += 1;
        }

        let changes_per_day = if window_days > 0 {
            recent.len() as f64 / window_days as f64
        } else {
            0.0
        };
        let most_active_day = per_day.into_iter().max_by_key(|(_, count)| *count).map(|(day, _)| day);

        let trend = if recent.len() as f64 > prior_count as f64 * 1.1 {
            ChangeTrend::Increasing
        } else if (recent.len() as f64) < prior_count as f64 * 0.9 {
            ChangeTrend::Decreasing
        } else {
            ChangeTrend::Stable
        };

        Ok(ChangeFrequency {
            totals_by_type,
            changes_per_day,
            most_active_day,
            trend,
        })
    }

    #[tracing::instrument(skip(self), fields(collection = "content_changes", op = "cleanup_old_changes"))]
    pub async fn cleanup_old_changes(&self, older_than: chrono::DateTime<chrono::Utc>) -> Result<u64> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let affected = conn
                        .execute(
                            "DELETE FROM content_changes WHERE detected_at < ?1",
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

fn change_clone(change: &ContentChangeCreate) -> ContentChangeCreate {
    ContentChangeCreate {
        page_id: change.page_id,
        site_id: change.site_id,
        change_type: change.change_type,
        previous_hash: change.previous_hash.clone(),
        new_hash: change.new_hash.clone(),
        context: change.context.clone(),
        url: change.url.clone(),
        title: change.title.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MonitoringConfig, PageCreate, PageMetadata, PolitenessConfig, SiteCreate};
    use crate::repository::migrations::migrate;
    use crate::repository::pages::PagesRepository;
    use crate::repository::sites::SitesRepository;
    use serde_json::json;
    use std::collections::BTreeSet;

    async fn setup() -> (ChangesRepository, Uuid, Uuid) {
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
        let pages = PagesRepository::new(pool.clone());
        let page_id = pages
            .create_page(PageCreate {
                site_id,
                url: "https://example.com/a".into(),
                title: Some("A".into()),
                content: None,
                author: None,
                published_date: None,
                metadata: PageMetadata::default(),
            })
            .await
            .unwrap();
        (ChangesRepository::new(pool), site_id, page_id)
    }

    #[tokio::test]
    async fn record_change_derives_priority_and_defaults_unnotified() {
        let (repo, site_id, page_id) = setup().await;
        repo.record_content_change(ContentChangeCreate {
            page_id,
            site_id,
            change_type: ChangeType::Deleted,
            previous_hash: Some("abc".into()),
            new_hash: None,
            context: json!({}),
            url: Some("https://example.com/gone".into()),
            title: Some("Gone Page".into()),
        })
        .await
        .unwrap();

        let unnotified = repo
            .get_unnotified_changes(crate::models::ChangePriority::Low)
            .await
            .unwrap();
        assert_eq!(unnotified.len(), 1);
        assert_eq!(unnotified[0].priority, crate::models::ChangePriority::High);
    }

    #[tokio::test]
    async fn deleted_change_survives_a_purged_page_using_historical_url_and_title() {
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
        let pages = PagesRepository::new(pool.clone());
        let page_id = pages
            .create_page(PageCreate {
                site_id,
                url: "https://example.com/soon-gone".into(),
                title: Some("Soon Gone".into()),
                content: None,
                author: None,
                published_date: None,
                metadata: PageMetadata::default(),
            })
            .await
            .unwrap();

        // Purge the page row before the deletion is recorded.
        pool.with_conn(move |conn| {
            conn.execute("DELETE FROM pages WHERE id = ?1", rusqlite::params![page_id.to_string()])?;
            Ok(())
        })
        .await
        .unwrap();

        let repo = ChangesRepository::new(pool);
        let id = repo
            .record_content_change(ContentChangeCreate {
                page_id,
                site_id,
                change_type: ChangeType::Deleted,
                previous_hash: Some("abc".into()),
                new_hash: None,
                context: json!({}),
                url: Some("https://example.com/soon-gone".into()),
                title: Some("Soon Gone".into()),
            })
            .await
            .unwrap();

        let changes = repo.get_changes_since(site_id, now() - chrono::Duration::days(1)).await.unwrap();
        let recorded = changes.iter().find(|c| c.id == id).unwrap();
        assert_eq!(recorded.url, "https://example.com/soon-gone");
        assert_eq!(recorded.title.as_deref(), Some("Soon Gone"));
    }

    #[tokio::test]
    async fn mark_notified_removes_from_unnotified_list() {
        let (repo, site_id, page_id) = setup().await;
        let id = repo
            .record_content_change(ContentChangeCreate {
                page_id,
                site_id,
                change_type: ChangeType::New,
                previous_hash: None,
                new_hash: Some("h".into()),
                context: json!({}),
                url: None,
                title: None,
            })
            .await
            .unwrap();
        repo.mark_change_notified(id).await.unwrap();
        assert!(repo
            .get_unnotified_changes(crate::models::ChangePriority::Low)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn operator_prefixed_keys_are_stripped_from_stored_context() {
        let (repo, site_id, page_id) = setup().await;
        let id = repo
            .record_content_change(ContentChangeCreate {
                page_id,
                site_id,
                change_type: ChangeType::New,
                previous_hash: None,
                new_hash: Some("h".into()),
                context: json!({"note": "ok", "$gt": 1}),
                url: None,
                title: None,
            })
            .await
            .unwrap();

        let changes = repo.get_changes_since(site_id, now() - chrono::Duration::days(1)).await.unwrap();
        let recorded = changes.iter().find(|c| c.id == id).unwrap();
        assert_eq!(recorded.context, json!({"note": "ok"}));
    }
}
