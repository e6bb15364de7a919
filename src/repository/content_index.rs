//! Content index store and full-text search, §4.I.
//!
//! Search rides the `content_index_fts` external-content FTS5 table
//! (migration 002), kept in sync by triggers; this repository only ever
//! writes the backing `content_index` table.

use std::collections::BTreeMap;

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{RepositoryError, Result};
use crate::ids::{self, content_hash};
use crate::models::{ContentIndexEntry, SearchHit, SearchQuery};
use crate::storage::pool::DbPool;
use crate::storage::retry::{with_retry, RetryPolicy};

use super::util::{column_datetime, column_json, now, to_json};

#[derive(Clone)]
pub struct ContentIndexRepository {
    pool: DbPool,
}

fn row_to_entry(row: &Row) -> rusqlite::Result<ContentIndexEntry> {
    let id: String = row.get("id")?;
    let page_id: String = row.get("page_id")?;
    let site_id: String = row.get("site_id")?;
    Ok(ContentIndexEntry {
        id: Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        page_id: Uuid::parse_str(&page_id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        site_id: Uuid::parse_str(&site_id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        title: row.get("title")?,
        body: row.get("body")?,
        content_hash: row.get("content_hash")?,
        author: row.get("author")?,
        language: row.get("language")?,
        metadata: column_json(row, "metadata")?,
        indexed_at: column_datetime(row, "indexed_at")?,
    })
}

impl ContentIndexRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, entry), fields(collection = "content_index", op = "create_content_index"))]
    pub async fn create_content_index(&self, entry: ContentIndexEntry) -> Result<Uuid> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let entry = entry_clone(&entry);
            async move {
                pool.with_conn(move |conn| {
                    let id = ids::new_id();
                    let now = now();
                    let hash = content_hash(&entry.body);
                    conn.execute(
                        "INSERT INTO content_index (
                            id, page_id, site_id, title, body, content_hash, author, language, metadata, indexed_at
                        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                        params![
                            id.to_string(),
                            entry.page_id.to_string(),
                            entry.site_id.to_string(),
                            entry.title,
                            entry.body,
                            hash,
                            entry.author,
                            entry.language,
                            to_json(&entry.metadata)?,
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

    /// Updates in place preserving `id` if `page_id` already has an entry;
    /// otherwise creates one.
    #[tracing::instrument(skip(self, entry), fields(collection = "content_index", op = "upsert_content_index"))]
    pub async fn upsert_content_index(&self, entry: ContentIndexEntry) -> Result<Uuid> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let entry = entry_clone(&entry);
            async move {
                pool.with_conn(move |conn| {
                    let existing_id: Option<String> = conn
                        .query_row(
                            "SELECT id FROM content_index WHERE page_id = ?1",
                            params![entry.page_id.to_string()],
                            |row| row.get(0),
                        )
                        .optional()?;
                    let now = now();
                    let hash = content_hash(&entry.body);

                    match existing_id {
                        Some(existing_id) => {
                            conn.execute(
                                "UPDATE content_index SET title = ?1, body = ?2, content_hash = ?3, author = ?4,
                                 language = ?5, metadata = ?6, indexed_at = ?7 WHERE id = ?8",
                                params![
                                    entry.title,
                                    entry.body,
                                    hash,
                                    entry.author,
                                    entry.language,
                                    to_json(&entry.metadata)?,
                                    now.to_rfc3339(),
                                    existing_id,
                                ],
                            )
                            .map_err(RepositoryError::from)?;
                            Uuid::parse_str(&existing_id).map_err(|e| RepositoryError::validation(e.to_string()))
                        }
                        None => {
                            let id = ids::new_id();
                            conn.execute(
                                "INSERT INTO content_index (
                                    id, page_id, site_id, title, body, content_hash, author, language, metadata, indexed_at
                                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                                params![
                                    id.to_string(),
                                    entry.page_id.to_string(),
                                    entry.site_id.to_string(),
                                    entry.title,
                                    entry.body,
                                    hash,
                                    entry.author,
                                    entry.language,
                                    to_json(&entry.metadata)?,
                                    now.to_rfc3339(),
                                ],
                            )
                            .map_err(RepositoryError::from)?;
                            Ok(id)
                        }
                    }
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "content_index", op = "get_by_page_id"))]
    pub async fn get_by_page_id(&self, page_id: Uuid) -> Result<Option<ContentIndexEntry>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    conn.query_row(
                        "SELECT * FROM content_index WHERE page_id = ?1",
                        params![page_id.to_string()],
                        row_to_entry,
                    )
                    .optional()
                    .map_err(RepositoryError::from)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self, content), fields(collection = "content_index", op = "update_search_content"))]
    pub async fn update_search_content(&self, page_id: Uuid, content: String) -> Result<()> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let content = content.clone();
            async move {
                let now = now();
                let hash = content_hash(&content);
                pool.with_conn(move |conn| {
                    conn.execute(
                        "UPDATE content_index SET body = ?1, content_hash = ?2, indexed_at = ?3 WHERE page_id = ?4",
                        params![content, hash, now.to_rfc3339(), page_id.to_string()],
                    )
                    .map_err(RepositoryError::from)?;
                    Ok(())
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "content_index", op = "delete_by_page_id"))]
    pub async fn delete_by_page_id(&self, page_id: Uuid) -> Result<()> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    conn.execute("DELETE FROM content_index WHERE page_id = ?1", params![page_id.to_string()])
                        .map_err(RepositoryError::from)?;
                    Ok(())
                })
                .await
            }
        })
        .await
    }

    /// Full-text search over `body` via FTS5 `bm25()`, AND-combined with
    /// `site_id`/`author`/`language` equality filters. Results are ordered by
    /// relevance (lower `bm25()` is better).
    #[tracing::instrument(skip(self, query), fields(collection = "content_index", op = "search_content"))]
    pub async fn search_content(&self, query: SearchQuery) -> Result<Vec<SearchHit>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let query = query_clone(&query);
            async move {
                pool.with_conn(move |conn| {
                    let limit = query.limit.unwrap_or(20);
                    let offset = query.offset.unwrap_or(0);

                    let mut sql = String::from(
                        "SELECT ci.page_id, ci.site_id, ci.title, snippet(content_index_fts, 1, '', '', '…', 12) AS snippet,
                                bm25(content_index_fts) AS rank
                         FROM content_index_fts
                         JOIN content_index ci ON ci.rowid = content_index_fts.rowid
                         WHERE content_index_fts MATCH ?1",
                    );
                    let mut param_values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(query.text.clone())];

                    if let Some(site_id) = query.site_id {
                        sql.push_str(" AND ci.site_id = ?");
                        param_values.push(Box::new(site_id.to_string()));
                    }
                    if let Some(author) = &query.author {
                        sql.push_str(" AND LOWER(ci.author) = LOWER(?)");
                        param_values.push(Box::new(author.clone()));
                    }
                    if let Some(language) = &query.language {
                        sql.push_str(" AND ci.language = ?");
                        param_values.push(Box::new(language.clone()));
                    }
                    sql.push_str(" ORDER BY rank LIMIT ? OFFSET ?");
                    param_values.push(Box::new(limit));
                    param_values.push(Box::new(offset));

                    let params_ref: Vec<&dyn rusqlite::ToSql> = param_values.iter().map(|v| v.as_ref()).collect();

                    let mut stmt = conn.prepare(&sql)?;
                    let hits = stmt
                        .query_map(params_ref.as_slice(), |row| {
                            let page_id: String = row.get(0)?;
                            let site_id: String = row.get(1)?;
                            Ok(SearchHit {
                                page_id: Uuid::parse_str(&page_id).map_err(|e| {
                                    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
                                })?,
                                site_id: Uuid::parse_str(&site_id).map_err(|e| {
                                    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
                                })?,
                                title: row.get(2)?,
                                snippet: row.get(3)?,
                                rank: row.get(4)?,
                            })
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(hits)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self, name), fields(collection = "content_index", op = "get_by_author"))]
    pub async fn get_by_author(&self, name: &str) -> Result<Vec<ContentIndexEntry>> {
        let name = name.to_string();
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let name = name.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare("SELECT * FROM content_index WHERE LOWER(author) = LOWER(?1)")?;
                    let entries = stmt
                        .query_map(params![name], row_to_entry)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(entries)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "content_index", op = "get_recent_content"))]
    pub async fn get_recent_content(&self, hours: i64, limit: u32) -> Result<Vec<ContentIndexEntry>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                let since = now() - chrono::Duration::hours(hours);
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM content_index WHERE indexed_at >= ?1 ORDER BY indexed_at DESC LIMIT ?2",
                    )?;
                    let entries = stmt
                        .query_map(params![since.to_rfc3339(), limit], row_to_entry)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(entries)
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "content_index", op = "get_metadata_facets"))]
    pub async fn get_metadata_facets(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare("SELECT metadata FROM content_index")?;
                    let all: Vec<BTreeMap<String, String>> =
                        stmt.query_map([], |row| column_json(row, "metadata"))?.collect::<rusqlite::Result<_>>()?;

                    let mut facets: BTreeMap<String, std::collections::BTreeSet<String>> = BTreeMap::new();
                    for metadata in all {
                        for (k, v) in metadata {
                            facets.entry(k).or_default().insert(v);
                        }
                    }
                    Ok(facets
                        .into_iter()
                        .map(|(k, values)| (k, values.into_iter().collect()))
                        .collect())
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(collection = "content_index", op = "get_content_statistics"))]
    pub async fn get_content_statistics(&self) -> Result<ContentStatistics> {
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            async move {
                pool.with_conn(move |conn| {
                    let total_entries: i64 = conn.query_row("SELECT COUNT(*) FROM content_index", [], |r| r.get(0))?;
                    let distinct_authors: i64 = conn.query_row(
                        "SELECT COUNT(DISTINCT author) FROM content_index WHERE author IS NOT NULL",
                        [],
                        |r| r.get(0),
                    )?;
                    let average_body_length: Option<f64> =
                        conn.query_row("SELECT AVG(LENGTH(body)) FROM content_index", [], |r| r.get(0)).optional()?.flatten();
                    Ok(ContentStatistics {
                        total_entries: total_entries as u64,
                        distinct_authors: distinct_authors as u64,
                        average_body_length,
                    })
                })
                .await
            }
        })
        .await
    }

    #[tracing::instrument(skip(self, valid_page_ids), fields(collection = "content_index", op = "cleanup_orphaned_entries"))]
    pub async fn cleanup_orphaned_entries(&self, valid_page_ids: Vec<Uuid>) -> Result<u64> {
        let pool = self.pool.clone();
        pool.atomic(move |tx| {
            let valid: std::collections::HashSet<String> = valid_page_ids.iter().map(Uuid::to_string).collect();
            let mut stmt = tx.prepare("SELECT id, page_id FROM content_index").map_err(RepositoryError::from)?;
            let rows: Vec<(String, String)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(RepositoryError::from)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(RepositoryError::from)?;
            drop(stmt);

            let mut removed = 0u64;
            for (id, page_id) in rows {
                if !valid.contains(&page_id) {
                    tx.execute("DELETE FROM content_index WHERE id = ?1", params![id])
                        .map_err(RepositoryError::from)?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
    }

    #[tracing::instrument(skip(self, content_hash), fields(collection = "content_index", op = "get_duplicate_content"))]
    pub async fn get_duplicate_content(&self, content_hash: &str) -> Result<Vec<ContentIndexEntry>> {
        let content_hash = content_hash.to_string();
        let pool = self.pool.clone();
        with_retry(pool.breaker(), RetryPolicy::default(), move || {
            let pool = pool.clone();
            let content_hash = content_hash.clone();
            async move {
                pool.with_conn(move |conn| {
                    let mut stmt = conn.prepare("SELECT * FROM content_index WHERE content_hash = ?1")?;
                    let entries = stmt
                        .query_map(params![content_hash], row_to_entry)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(entries)
                })
                .await
            }
        })
        .await
    }

    /// Upserts in batches of 100, per §4.I.
    #[tracing::instrument(skip(self, entries), fields(collection = "content_index", op = "bulk_upsert_content_indexes"))]
    pub async fn bulk_upsert_content_indexes(&self, entries: Vec<ContentIndexEntry>) -> Result<u64> {
        let mut total = 0u64;
        for batch in entries.chunks(100) {
            let pool = self.pool.clone();
            let batch = batch.to_vec();
            total += pool
                .atomic(move |tx| {
                    let mut count = 0u64;
                    for entry in batch {
                        let existing_id: Option<String> = tx
                            .query_row(
                                "SELECT id FROM content_index WHERE page_id = ?1",
                                params![entry.page_id.to_string()],
                                |row| row.get(0),
                            )
                            .optional()
                            .map_err(RepositoryError::from)?;
                        let now = now();
                        let hash = content_hash(&entry.body);
                        match existing_id {
                            Some(existing_id) => {
                                tx.execute(
                                    "UPDATE content_index SET title = ?1, body = ?2, content_hash = ?3, author = ?4,
                                     language = ?5, metadata = ?6, indexed_at = ?7 WHERE id = ?8",
                                    params![
                                        entry.title,
                                        entry.body,
                                        hash,
                                        entry.author,
                                        entry.language,
                                        to_json(&entry.metadata)?,
                                        now.to_rfc3339(),
                                        existing_id,
                                    ],
                                )
                                .map_err(RepositoryError::from)?;
                            }
                            None => {
                                let id = ids::new_id();
                                tx.execute(
                                    "INSERT INTO content_index (
                                        id, page_id, site_id, title, body, content_hash, author, language, metadata, indexed_at
                                    ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                                    params![
                                        id.to_string(),
                                        entry.page_id.to_string(),
                                        entry.site_id.to_string(),
                                        entry.title,
                                        entry.body,
                                        hash,
                                        entry.author,
                                        entry.language,
                                        to_json(&entry.metadata)?,
                                        now.to_rfc3339(),
                                    ],
                                )
                                .map_err(RepositoryError::from)?;
                            }
                        }
                        count += 1;
                    }
                    Ok(count)
                })
                .await?;
        }
        Ok(total)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContentStatistics {
    pub total_entries: u64,
    pub distinct_authors: u64,
    pub average_body_length: Option<f64>,
}

fn entry_clone(entry: &ContentIndexEntry) -> ContentIndexEntry {
    ContentIndexEntry {
        id: entry.id,
        page_id: entry.page_id,
        site_id: entry.site_id,
        title: entry.title.clone(),
        body: entry.body.clone(),
        content_hash: entry.content_hash.clone(),
        author: entry.author.clone(),
        language: entry.language.clone(),
        metadata: entry.metadata.clone(),
        indexed_at: entry.indexed_at,
    }
}

fn query_clone(query: &SearchQuery) -> SearchQuery {
    SearchQuery {
        text: query.text.clone(),
        site_id: query.site_id,
        author: query.author.clone(),
        language: query.language.clone(),
        limit: query.limit,
        offset: query.offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MonitoringConfig, PageCreate, PageMetadata, PolitenessConfig, SiteCreate};
    use crate::repository::migrations::migrate;
    use crate::repository::pages::PagesRepository;
    use crate::repository::sites::SitesRepository;
    use std::collections::BTreeSet;

    async fn setup() -> (ContentIndexRepository, Uuid, Uuid) {
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
                url: "https://example.com/phenomenology".into(),
                title: Some("Phenomenology".into()),
                content: None,
                author: None,
                published_date: None,
                metadata: PageMetadata::default(),
            })
            .await
            .unwrap();
        (ContentIndexRepository::new(pool), site_id, page_id)
    }

    fn make_entry(site_id: Uuid, page_id: Uuid, body: &str) -> ContentIndexEntry {
        ContentIndexEntry {
            id: Uuid::nil(),
            page_id,
            site_id,
            title: "Phenomenology of Spirit".into(),
            body: body.into(),
            content_hash: None,
            author: Some("Hegel".into()),
            language: Some("en".into()),
            metadata: BTreeMap::from([("era".to_string(), "19th-century".to_string())]),
            indexed_at: now(),
        }
    }

    #[tokio::test]
    async fn search_finds_indexed_terms_via_fts() {
        let (repo, site_id, page_id) = setup().await;
        repo.create_content_index(make_entry(site_id, page_id, "consciousness and self-consciousness dialectic"))
            .await
            .unwrap();

        let hits = repo
            .search_content(SearchQuery {
                text: "dialectic".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].page_id, page_id);
    }

    #[tokio::test]
    async fn upsert_preserves_id_on_second_write() {
        let (repo, site_id, page_id) = setup().await;
        let id1 = repo
            .upsert_content_index(make_entry(site_id, page_id, "first body"))
            .await
            .unwrap();
        let id2 = repo
            .upsert_content_index(make_entry(site_id, page_id, "second body"))
            .await
            .unwrap();
        assert_eq!(id1, id2);

        let entry = repo.get_by_page_id(page_id).await.unwrap().unwrap();
        assert_eq!(entry.body, "second body");
    }

    #[tokio::test]
    async fn metadata_facets_aggregate_distinct_values() {
        let (repo, site_id, page_id) = setup().await;
        repo.create_content_index(make_entry(site_id, page_id, "body")).await.unwrap();
        let facets = repo.get_metadata_facets().await.unwrap();
        assert_eq!(facets.get("era"), Some(&vec!["19th-century".to_string()]));
    }
}
