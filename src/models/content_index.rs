//! The `ContentIndex` entity — full-text search metadata for a page.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentIndexEntry {
    pub id: Uuid,
    pub page_id: Uuid,
    pub site_id: Uuid,
    pub title: String,
    pub body: String,
    pub content_hash: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    /// Small string map used for faceting (`get_metadata_facets`).
    pub metadata: std::collections::BTreeMap<String, String>,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub page_id: Uuid,
    pub site_id: Uuid,
    pub title: String,
    pub snippet: String,
    /// Lower is more relevant — the raw `bm25()` score from FTS5.
    pub rank: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    pub site_id: Option<Uuid>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}
