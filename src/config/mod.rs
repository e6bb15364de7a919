//! Hierarchical, hot-swappable configuration, §4.B / §4.M.

pub mod holder;
pub mod loader;
pub mod mask;
pub mod schema;
pub mod validate;

pub use holder::ConfigHolder;
pub use loader::{detect_environment, env_var_overlay, load, LoadSources};
pub use mask::get_masked;
pub use schema::{
    CrawlerConfig, CrawlingConfig, DatabaseConfig, Environment, LogLevel, LoggingConfig,
    NotificationsConfig, QueueConfig, RetentionConfig, RetentionPolicyConfig, SecurityConfig,
    SiteConfig,
};
pub use validate::{validate, FieldFailure, ValidationFailures};
