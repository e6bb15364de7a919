//! The `Site` entity — a crawl target.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{RepositoryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlFrequency {
    Daily,
    Weekly,
    Monthly,
}

impl CrawlFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(RepositoryError::validation(format!(
                "invalid crawl frequency: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "unhealthy" => Ok(Self::Unhealthy),
            "unknown" => Ok(Self::Unknown),
            other => Err(RepositoryError::validation(format!(
                "invalid health status: {other}"
            ))),
        }
    }
}

/// Politeness parameters governing how a site is crawled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolitenessConfig {
    pub min_request_delay_ms: u64,
    pub user_agent: String,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub max_concurrent_requests: u32,
}

impl Default for PolitenessConfig {
    fn default() -> Self {
        Self {
            min_request_delay_ms: 1000,
            user_agent: "philocrawl/0.1 (+research)".to_string(),
            retry_count: 3,
            retry_delay_ms: 2000,
            max_concurrent_requests: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub active: bool,
    pub frequency: CrawlFrequency,
    pub last_crawl_time: Option<DateTime<Utc>>,
    pub next_scheduled_crawl: Option<DateTime<Utc>>,
    pub disabled_reason: Option<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            active: true,
            frequency: CrawlFrequency::Weekly,
            last_crawl_time: None,
            next_scheduled_crawl: None,
            disabled_reason: None,
        }
    }
}

/// Input to `create_site`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteCreate {
    pub name: String,
    pub base_url: String,
    pub allowed_domains: BTreeSet<String>,
    pub start_urls: Vec<String>,
    pub allow_patterns: Vec<String>,
    pub deny_patterns: Vec<String>,
    pub politeness: PolitenessConfig,
    pub monitoring: MonitoringConfig,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: Uuid,
    pub name: String,
    pub base_url: String,
    pub allowed_domains: BTreeSet<String>,
    pub start_urls: Vec<String>,
    pub allow_patterns: Vec<String>,
    pub deny_patterns: Vec<String>,
    pub politeness: PolitenessConfig,
    pub monitoring: MonitoringConfig,
    pub tags: Vec<String>,
    pub health_status: HealthStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A strict DNS label grammar: labels are 1-63 chars of `[a-z0-9-]`, no
/// leading/trailing hyphen, at least one dot-separated label pair.
fn dns_label_regex() -> Regex {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,}$").expect("static regex")
}

pub fn is_valid_domain(domain: &str) -> bool {
    dns_label_regex().is_match(&domain.to_ascii_lowercase())
}

impl SiteCreate {
    /// Validate the invariants of §3: base URL has scheme+host, the base
    /// host is among the allowed domains, domains are well-formed, and
    /// every URL pattern compiles as a regex.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RepositoryError::validation("site name must not be empty"));
        }
        if self.allowed_domains.is_empty() {
            return Err(RepositoryError::validation(
                "site must declare at least one allowed domain",
            ));
        }

        let url = Url::parse(&self.base_url)
            .map_err(|e| RepositoryError::validation(format!("invalid base_url: {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(RepositoryError::validation(
                "base_url must use http or https",
            ));
        }
        let host = url
            .host_str()
            .ok_or_else(|| RepositoryError::validation("base_url has no host"))?
            .to_ascii_lowercase();

        for domain in &self.allowed_domains {
            if !is_valid_domain(domain) {
                return Err(RepositoryError::validation(format!(
                    "invalid domain: {domain}"
                )));
            }
        }
        if !self
            .allowed_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(&host))
        {
            return Err(RepositoryError::validation(format!(
                "base host {host} is not in allowed_domains"
            )));
        }

        for pattern in self.allow_patterns.iter().chain(self.deny_patterns.iter()) {
            Regex::new(pattern)
                .map_err(|e| RepositoryError::validation(format!("bad URL pattern {pattern:?}: {e}")))?;
        }

        Ok(())
    }

    /// Normalize the base URL so it ends with `/`, per the §3 invariant.
    pub fn normalized_base_url(&self) -> String {
        if self.base_url.ends_with('/') {
            self.base_url.clone()
        } else {
            format!("{}/", self.base_url)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_site() -> SiteCreate {
        SiteCreate {
            name: "Stanford Encyclopedia".into(),
            base_url: "https://plato.stanford.edu".into(),
            allowed_domains: BTreeSet::from(["plato.stanford.edu".to_string()]),
            start_urls: vec!["https://plato.stanford.edu/contents.html".into()],
            allow_patterns: vec![r"^/entries/.*".into()],
            deny_patterns: vec![],
            politeness: PolitenessConfig::default(),
            monitoring: MonitoringConfig::default(),
            tags: vec![],
        }
    }

    #[test]
    fn valid_site_passes() {
        assert!(valid_site().validate().is_ok());
    }

    #[test]
    fn base_url_must_have_scheme() {
        let mut site = valid_site();
        site.base_url = "plato.stanford.edu".into();
        assert!(site.validate().is_err());
    }

    #[test]
    fn base_host_must_be_allowed() {
        let mut site = valid_site();
        site.allowed_domains = BTreeSet::from(["example.com".to_string()]);
        assert!(site.validate().is_err());
    }

    #[test]
    fn invalid_domain_rejected() {
        let mut site = valid_site();
        site.allowed_domains.insert("not a domain".into());
        assert!(site.validate().is_err());
    }

    #[test]
    fn uncompilable_pattern_rejected() {
        let mut site = valid_site();
        site.allow_patterns.push("(unterminated".into());
        assert!(site.validate().is_err());
    }

    #[test]
    fn normalized_base_url_ends_with_slash() {
        let site = valid_site();
        assert!(site.normalized_base_url().ends_with('/'));
        assert_eq!(
            SiteCreate {
                base_url: "https://example.com/".into(),
                ..site
            }
            .normalized_base_url(),
            "https://example.com/"
        );
    }
}
