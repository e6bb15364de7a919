//! Retention engine, §4.J.
//!
//! SQLite has no native TTL index, so `setup_ttl_indexes` materializes a
//! plain index on each collection's TTL field and `run_maintenance` is the
//! sweep that actually enforces the policy.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::{params, OptionalExtension};

use crate::config::schema::{RetentionConfig, RetentionPolicyConfig};
use crate::error::{RepositoryError, Result};
use crate::storage::pool::DbPool;
use crate::storage::retry::{with_retry, RetryPolicy};

use super::util::now;

/// One collection's retention policy bound to its table/TTL column.
#[derive(Debug, Clone, Copy)]
struct CollectionBinding {
    name: &'static str,
    table: &'static str,
    ttl_field: &'static str,
    id_field: &'static str,
}

const BINDINGS: &[CollectionBinding] = &[
    CollectionBinding {
        name: "content_changes",
        table: "content_changes",
        ttl_field: "detected_at",
        id_field: "id",
    },
    CollectionBinding {
        name: "crawl_sessions",
        table: "crawl_sessions",
        ttl_field: "started_at",
        id_field: "id",
    },
    CollectionBinding {
        name: "alerts",
        table: "alerts",
        ttl_field: "created_at",
        id_field: "id",
    },
    CollectionBinding {
        name: "processing_queue",
        table: "processing_tasks",
        ttl_field: "created_at",
        id_field: "id",
    },
];

fn policy_for<'a>(config: &'a RetentionConfig, name: &str) -> Option<&'a RetentionPolicyConfig> {
    match name {
        "content_changes" => Some(&config.content_changes),
        "crawl_sessions" => Some(&config.crawl_sessions),
        "alerts" => Some(&config.alerts),
        "processing_queue" => Some(&config.processing_queue),
        _ => None,
    }
}

/// Destination for a serialized archive batch. The local-filesystem
/// implementation below is the reference; object-storage sinks implement
/// the same trait outside this crate.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
}

pub struct FsArchiveSink {
    root: PathBuf,
}

impl FsArchiveSink {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ArchiveSink for FsArchiveSink {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.root.join(key);
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RepositoryError::connection(format!("archive dir create failed: {e}")))?;
            }
            std::fs::write(&path, &bytes)
                .map_err(|e| RepositoryError::connection(format!("archive write failed: {e}")))?;
            let _ = root;
            Ok(())
        })
        .await
        .map_err(|e| RepositoryError::connection(format!("archive task panicked: {e}")))??;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RetentionStatusEntry {
    pub collection: String,
    pub total: u64,
    pub nearing_expiry: u64,
    pub ttl_index_exists: bool,
}

pub struct RetentionRepository {
    pool: DbPool,
    config: RetentionConfig,
}

impl RetentionRepository {
    pub fn new(pool: DbPool, config: RetentionConfig) -> Self {
        Self { pool, config }
    }

    /// Ensures an index on each configured collection's TTL field. Idempotent;
    /// an existing equivalent index is left alone.
    #[tracing::instrument(skip(self))]
    pub async fn setup_ttl_indexes(&self, dry_run: bool) -> Result<Vec<String>> {
        let mut created = Vec::new();
        for binding in BINDINGS {
            let index_name = format!("idx_retention_{}_{}", binding.table, binding.ttl_field);
            if dry_run {
                tracing::info!(index = %index_name, "dry run: would ensure retention TTL index");
                continue;
            }
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS {index_name} ON {}({})",
                binding.table, binding.ttl_field
            );
            self.pool
                .with_conn(move |conn| conn.execute_batch(&sql).map_err(RepositoryError::from))
                .await?;
            created.push(index_name);
        }
        Ok(created)
    }

    /// Streams documents older than `archive_after_days` in batches of 1000,
    /// serializes as JSON, optionally gzips, and hands one object per batch
    /// to `sink`. A batch is only deleted once the sink accepts the upload.
    #[tracing::instrument(skip(self, sink))]
    pub async fn archive_old_documents(
        &self,
        collection: &str,
        sink: &(dyn ArchiveSink),
    ) -> Result<u64> {
        let binding = BINDINGS
            .iter()
            .find(|b| b.name == collection)
            .ok_or_else(|| RepositoryError::validation(format!("unknown retention collection: {collection}")))?;
        let policy = policy_for(&self.config, collection)
            .ok_or_else(|| RepositoryError::validation(format!("no policy for collection: {collection}")))?;

        let Some(archive_after_days) = policy.archive_after_days.filter(|_| policy.archive_enabled) else {
            return Ok(0);
        };
        let cutoff = now() - chrono::Duration::days(archive_after_days as i64);

        let mut total_archived = 0u64;
        loop {
            let table = binding.table;
            let ttl_field = binding.ttl_field;
            let id_field = binding.id_field;
            let cutoff_str = cutoff.to_rfc3339();

            let rows: Vec<(String, serde_json::Value)> = self
                .pool
                .with_conn(move |conn| {
                    let sql = format!(
                        "SELECT {id_field}, * FROM {table} WHERE {ttl_field} < ?1 ORDER BY {ttl_field} ASC LIMIT 1000"
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let column_count = stmt.column_count();
                    let column_names: Vec<String> = (0..column_count)
                        .map(|i| stmt.column_name(i).unwrap_or("").to_string())
                        .collect();
                    let rows = stmt
                        .query_map(params![cutoff_str], move |row| {
                            let id: String = row.get(0)?;
                            let mut obj = serde_json::Map::new();
                            for (idx, name) in column_names.iter().enumerate().skip(1) {
                                let value: rusqlite::types::Value = row.get(idx)?;
                                obj.insert(name.clone(), sqlite_value_to_json(value));
                            }
                            Ok((id, serde_json::Value::Object(obj)))
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(rows)
                })
                .await?;

            if rows.is_empty() {
                break;
            }

            let first_id = rows.first().map(|(id, _)| id.clone()).unwrap_or_default();
            let last_id = rows.last().map(|(id, _)| id.clone()).unwrap_or_default();
            let documents: Vec<serde_json::Value> = rows.iter().map(|(_, v)| v.clone()).collect();
            let json_bytes = serde_json::to_vec(&documents).map_err(RepositoryError::from)?;

            let payload = if policy.compression_enabled {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(&json_bytes)
                    .map_err(|e| RepositoryError::connection(format!("gzip failed: {e}")))?;
                encoder
                    .finish()
                    .map_err(|e| RepositoryError::connection(format!("gzip finish failed: {e}")))?
            } else {
                json_bytes
            };

            let ts = now().format("%Y%m%dT%H%M%SZ");
            let key = format!("archives/{collection}/{ts}_{first_id}_{last_id}.json.gz");
            sink.put(&key, payload).await?;

            let ids: Vec<String> = rows.into_iter().map(|(id, _)| id).collect();
            let deleted = self
                .pool
                .with_conn(move |conn| {
                    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                    let sql = format!("DELETE FROM {table} WHERE {id_field} IN ({placeholders})");
                    let params_ref: Vec<&dyn rusqlite::ToSql> =
                        ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
                    let affected = conn.execute(&sql, params_ref.as_slice()).map_err(RepositoryError::from)?;
                    Ok(affected as u64)
                })
                .await?;
            total_archived += deleted;
        }

        Ok(total_archived)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_retention_status(&self) -> Result<Vec<RetentionStatusEntry>> {
        let mut statuses = Vec::new();
        for binding in BINDINGS {
            let policy = policy_for(&self.config, binding.name).expect("every binding has a policy");
            let table = binding.table;
            let ttl_field = binding.ttl_field;
            let index_name = format!("idx_retention_{table}_{ttl_field}");
            let retention_days = policy.retention_days as i64;

            let pool = self.pool.clone();
            let (total, nearing_expiry, ttl_index_exists) = pool
                .with_conn(move |conn| {
                    let total: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;

                    let expiry_cutoff = now() - chrono::Duration::days(retention_days) + chrono::Duration::days(7);
                    let nearing: i64 = conn.query_row(
                        &format!("SELECT COUNT(*) FROM {table} WHERE {ttl_field} < ?1"),
                        params![expiry_cutoff.to_rfc3339()],
                        |r| r.get(0),
                    )?;

                    let index_exists: bool = conn
                        .query_row(
                            "SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1",
                            params![index_name],
                            |_| Ok(()),
                        )
                        .optional()
                        .map_err(RepositoryError::from)?
                        .is_some();

                    Ok((total as u64, nearing as u64, index_exists))
                })
                .await?;

            statuses.push(RetentionStatusEntry {
                collection: binding.name.to_string(),
                total,
                nearing_expiry,
                ttl_index_exists,
            });
        }
        Ok(statuses)
    }

    /// `setup_ttl_indexes`, then archive-enabled collections, then age-based
    /// expiry deletes for every configured collection.
    #[tracing::instrument(skip(self, sink))]
    pub async fn run_maintenance(&self, sink: &(dyn ArchiveSink)) -> Result<MaintenanceReport> {
        self.setup_ttl_indexes(false).await?;

        let mut archived = std::collections::BTreeMap::new();
        for binding in BINDINGS {
            let policy = policy_for(&self.config, binding.name).expect("every binding has a policy");
            if policy.archive_enabled {
                let count = self.archive_old_documents(binding.name, sink).await?;
                archived.insert(binding.name.to_string(), count);
            }
        }

        let mut expired = std::collections::BTreeMap::new();
        for binding in BINDINGS {
            let policy = policy_for(&self.config, binding.name).expect("every binding has a policy");
            let cutoff = now() - chrono::Duration::days(policy.retention_days as i64);
            let table = binding.table;
            let ttl_field = binding.ttl_field;
            let pool = self.pool.clone();
            let deleted = pool
                .with_conn(move |conn| {
                    let affected = conn.execute(
                        &format!("DELETE FROM {table} WHERE {ttl_field} < ?1"),
                        params![cutoff.to_rfc3339()],
                    )?;
                    Ok(affected as u64)
                })
                .await?;
            expired.insert(binding.name.to_string(), deleted);
        }

        Ok(MaintenanceReport { archived, expired })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub archived: std::collections::BTreeMap<String, u64>,
    pub expired: std::collections::BTreeMap<String, u64>,
}

fn sqlite_value_to_json(value: rusqlite::types::Value) -> serde_json::Value {
    match value {
        rusqlite::types::Value::Null => serde_json::Value::Null,
        rusqlite::types::Value::Integer(i) => serde_json::Value::from(i),
        rusqlite::types::Value::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        rusqlite::types::Value::Text(s) => serde_json::Value::String(s),
        rusqlite::types::Value::Blob(b) => serde_json::Value::String(hex::encode(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MemorySink {
        puts: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl ArchiveSink for MemorySink {
        async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
            self.puts.lock().unwrap().push((key.to_string(), bytes.len()));
            Ok(())
        }
    }

    async fn setup_with_old_change() -> (RetentionRepository, DbPool) {
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
        let pages = crate::repository::pages::PagesRepository::new(pool.clone());
        let page_id = pages
            .create_page(crate::models::PageCreate {
                site_id,
                url: "https://example.com/x".into(),
                title: None,
                content: None,
                author: None,
                published_date: None,
                metadata: crate::models::PageMetadata::default(),
            })
            .await
            .unwrap();

        let changes = crate::repository::changes::ChangesRepository::new(pool.clone());
        let id = changes
            .record_content_change(crate::models::ContentChangeCreate {
                page_id,
                site_id,
                change_type: crate::models::ChangeType::New,
                previous_hash: None,
                new_hash: Some("h".into()),
                context: serde_json::json!({}),
                url: None,
                title: None,
            })
            .await
            .unwrap();

        let old_timestamp = (now() - chrono::Duration::days(400)).to_rfc3339();
        pool.with_conn(move |conn| {
            conn.execute(
                "UPDATE content_changes SET detected_at = ?1 WHERE id = ?2",
                params![old_timestamp, id.to_string()],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let mut config = RetentionConfig::default();
        config.content_changes.archive_enabled = true;
        config.content_changes.archive_after_days = Some(100);

        (RetentionRepository::new(pool.clone(), config), pool)
    }

    #[tokio::test]
    async fn setup_ttl_indexes_creates_indexes() {
        let (repo, pool) = setup_with_old_change().await;
        let created = repo.setup_ttl_indexes(false).await.unwrap();
        assert_eq!(created.len(), BINDINGS.len());

        let again = repo.setup_ttl_indexes(false).await.unwrap();
        assert_eq!(again.len(), BINDINGS.len());
        let _ = pool;
    }

    #[tokio::test]
    async fn archive_old_documents_deletes_after_sink_accepts() {
        let (repo, pool) = setup_with_old_change().await;
        let sink = MemorySink { puts: Mutex::new(Vec::new()) };
        let archived = repo.archive_old_documents("content_changes", &sink).await.unwrap();
        assert_eq!(archived, 1);
        assert_eq!(sink.puts.lock().unwrap().len(), 1);

        let remaining: i64 = pool
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM content_changes", [], |r| r.get(0)).map_err(RepositoryError::from))
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn get_retention_status_reports_totals() {
        let (repo, _pool) = setup_with_old_change().await;
        let statuses = repo.get_retention_status().await.unwrap();
        let content_changes = statuses.iter().find(|s| s.collection == "content_changes").unwrap();
        assert_eq!(content_changes.total, 1);
    }
}
