//! The `Page` entity — one crawled URL belonging to a site.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{RepositoryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(RepositoryError::validation(format!(
                "invalid processing status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageMetadata {
    pub author: Option<String>,
    pub publication_date: Option<DateTime<Utc>>,
    pub language: Option<String>,
    pub word_count: u64,
    pub reading_time_minutes: u64,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Redirect {
    pub from: String,
    pub to: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageVersion {
    pub content: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageCreate {
    pub site_id: Uuid,
    pub url: String,
    pub title: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub published_date: Option<DateTime<Utc>>,
    pub metadata: PageMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: Uuid,
    pub site_id: Uuid,
    pub url: String,
    pub title: Option<String>,
    pub content: Option<String>,
    pub content_hash: Option<String>,
    pub author: Option<String>,
    pub published_date: Option<DateTime<Utc>>,
    pub processing_status: ProcessingStatus,
    pub processing_info: Option<serde_json::Value>,
    pub redirect_history: Vec<Redirect>,
    pub metadata: PageMetadata,
    pub versions: Vec<PageVersion>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_modified: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Normalize a URL per §4.D: lowercase scheme and host, drop fragment,
/// strip a trailing slash from the path (root `/` is kept), preserve the
/// query string and percent-encoding untouched.
pub fn normalize_url(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw).map_err(|e| RepositoryError::validation(format!("invalid URL {raw:?}: {e}")))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(RepositoryError::validation(
            "page URL must use http or https",
        ));
    }

    url.set_fragment(None);

    let lower_scheme = url.scheme().to_ascii_lowercase();
    url.set_scheme(&lower_scheme)
        .map_err(|_| RepositoryError::validation("failed to normalize scheme"))?;

    if let Some(host) = url.host_str() {
        let lower_host = host.to_ascii_lowercase();
        url.set_host(Some(&lower_host))
            .map_err(|e| RepositoryError::validation(format!("failed to normalize host: {e}")))?;
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/').to_string();
        url.set_path(&trimmed);
    }

    Ok(url.to_string())
}

impl PageCreate {
    pub fn validate(&self) -> Result<()> {
        normalize_url(&self.url)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_scheme_and_host() {
        assert_eq!(
            normalize_url("HTTPS://Example.COM/Path").unwrap(),
            "https://example.com/Path"
        );
    }

    #[test]
    fn drops_fragment_keeps_query() {
        assert_eq!(
            normalize_url("https://example.com/path?q=1#section").unwrap(),
            "https://example.com/path?q=1"
        );
    }

    #[test]
    fn strips_trailing_slash_but_keeps_root() {
        assert_eq!(
            normalize_url("https://example.com/path/").unwrap(),
            "https://example.com/path"
        );
        assert_eq!(normalize_url("https://example.com/").unwrap(), "https://example.com/");
    }

    #[test]
    fn fragment_only_difference_normalizes_identically() {
        let a = normalize_url("https://example.com/path/").unwrap();
        let b = normalize_url("https://example.com/path#frag").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_non_http_scheme() {
        assert!(normalize_url("ftp://example.com/").is_err());
    }
}
