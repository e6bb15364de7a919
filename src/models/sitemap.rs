//! The `SiteMap` entity — the crawl frontier discovered for a site.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Discovered,
    Queued,
    Crawled,
    Excluded,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Queued => "queued",
            Self::Crawled => "crawled",
            Self::Excluded => "excluded",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteMapEntry {
    pub id: Uuid,
    pub site_id: Uuid,
    pub url: String,
    pub parent_url: Option<String>,
    pub depth: u32,
    pub status: LinkStatus,
    pub discovered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}
