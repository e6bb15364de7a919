//! Typed configuration tree, §4.M / §6.
//!
//! Every section is `serde`-deserializable with `#[serde(default)]` so a
//! partially-specified YAML document still parses; validation happens as a
//! separate pass in [`super::loader`] so every failing field is collected
//! rather than stopping at the first.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
    pub max_overflow: u32,
    pub pool_timeout: u32,
    pub pool_recycle: u32,
    pub echo: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://philocrawl.db".to_string(),
            pool_size: 5,
            max_overflow: 10,
            pool_timeout: 30,
            pool_recycle: 3600,
            echo: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub secret_key: String,
    pub api_key: Option<String>,
    pub token_expiry: u32,
    pub rate_limit_per_minute: u32,
    pub allowed_hosts: Vec<String>,
    pub cors_origins: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            api_key: None,
            token_expiry: 3600,
            rate_limit_per_minute: 60,
            allowed_hosts: Vec::new(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: String,
    pub file_path: Option<String>,
    pub max_bytes: u64,
    pub backup_count: u32,
    pub structured: bool,
    pub crawler_level: LogLevel,
    pub config_level: LogLevel,
    pub database_level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: "%(asctime)s %(levelname)s %(name)s %(message)s".to_string(),
            file_path: None,
            max_bytes: 10 * 1024 * 1024,
            backup_count: 5,
            structured: false,
            crawler_level: LogLevel::Info,
            config_level: LogLevel::Warning,
            database_level: LogLevel::Warning,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlingConfig {
    pub default_delay: f64,
    pub max_concurrent_requests: u32,
    pub request_timeout: u32,
    pub max_retries: u32,
    pub retry_delay: f64,
    pub user_agent: String,
    pub respect_robots_txt: bool,
    pub max_page_size: u64,
    pub allowed_content_types: BTreeSet<String>,
    pub min_delay: f64,
    pub burst_delay: f64,
    pub max_pages_per_domain: u64,
}

impl Default for CrawlingConfig {
    fn default() -> Self {
        Self {
            default_delay: 1.0,
            max_concurrent_requests: 5,
            request_timeout: 30,
            max_retries: 3,
            retry_delay: 2.0,
            user_agent: "philocrawl/0.1 (+research)".to_string(),
            respect_robots_txt: true,
            max_page_size: 10 * 1024 * 1024,
            allowed_content_types: BTreeSet::from([
                "text/html".to_string(),
                "application/xhtml+xml".to_string(),
            ]),
            min_delay: 0.5,
            burst_delay: 5.0,
            max_pages_per_domain: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub enabled: bool,
    pub email: Option<String>,
    pub slack: Option<String>,
    pub error_threshold: u32,
    pub failure_rate_threshold: f64,
    pub queue_size_threshold: u32,
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    pub max_alerts_per_hour: u32,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            email: None,
            slack: None,
            error_threshold: 10,
            failure_rate_threshold: 0.1,
            queue_size_threshold: 1000,
            quiet_hours_start: None,
            quiet_hours_end: None,
            max_alerts_per_hour: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub name: String,
    pub base_url: String,
    pub domains: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub priority: u32,
    pub allow_patterns: Vec<String>,
    pub deny_patterns: Vec<String>,
    pub content_selectors: BTreeMap<String, String>,
    pub delay: Option<f64>,
    pub max_concurrent: Option<u32>,
    pub requests_per_minute: Option<u32>,
    pub daily_limit: Option<u64>,
    pub max_depth: u32,
    pub health_check_url: Option<String>,
    pub notification_level: Option<String>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_url: String::new(),
            domains: Vec::new(),
            enabled: true,
            priority: 1,
            allow_patterns: Vec::new(),
            deny_patterns: Vec::new(),
            content_selectors: BTreeMap::new(),
            delay: None,
            max_concurrent: None,
            requests_per_minute: None,
            daily_limit: None,
            max_depth: 5,
            health_check_url: None,
            notification_level: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicyConfig {
    pub retention_days: u32,
    pub archive_enabled: bool,
    pub archive_after_days: Option<u32>,
    pub compression_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub content_changes: RetentionPolicyConfig,
    pub crawl_sessions: RetentionPolicyConfig,
    pub alerts: RetentionPolicyConfig,
    pub processing_queue: RetentionPolicyConfig,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            content_changes: RetentionPolicyConfig {
                retention_days: 365,
                archive_enabled: false,
                archive_after_days: None,
                compression_enabled: true,
            },
            crawl_sessions: RetentionPolicyConfig {
                retention_days: 90,
                archive_enabled: true,
                archive_after_days: Some(60),
                compression_enabled: true,
            },
            alerts: RetentionPolicyConfig {
                retention_days: 180,
                archive_enabled: false,
                archive_after_days: None,
                compression_enabled: true,
            },
            processing_queue: RetentionPolicyConfig {
                retention_days: 30,
                archive_enabled: false,
                archive_after_days: None,
                compression_enabled: true,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub lease_timeout_seconds: u64,
    pub base_retry_delay_seconds: u64,
    pub max_retry_delay_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout_seconds: 300,
            base_retry_delay_seconds: 60,
            max_retry_delay_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn from_env_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Prod,
            "staging" | "stage" => Self::Staging,
            _ => Self::Dev,
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::Dev
    }
}

/// The full configuration tree, §6.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    #[serde(skip)]
    pub environment: Environment,
    #[serde(skip)]
    pub debug: bool,
    #[serde(skip)]
    pub hot_reload: bool,
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
    pub crawling: CrawlingConfig,
    pub notifications: NotificationsConfig,
    pub sites: BTreeMap<String, SiteConfig>,
    pub retention: RetentionConfig,
    pub queue: QueueConfig,
}

impl CrawlerConfig {
    pub fn dev_defaults() -> Self {
        Self {
            debug: true,
            hot_reload: true,
            ..Default::default()
        }
    }
}
