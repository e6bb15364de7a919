//! Field-level bounds validation, §4.M.
//!
//! Every failing field is collected into one [`ValidationFailures`] rather
//! than stopping at the first, matching the §4.B loader contract.

use std::fmt;

use super::schema::{CrawlerConfig, Environment, LogLevel};

#[derive(Debug, Clone)]
pub struct FieldFailure {
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationFailures(pub Vec<FieldFailure>);

impl ValidationFailures {
    fn push(&mut self, field: &str, reason: impl Into<String>) {
        self.0.push(FieldFailure {
            field: field.to_string(),
            reason: reason.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ValidationFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|failure| format!("{}: {}", failure.field, failure.reason))
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "{joined}")
    }
}

fn in_range<T: PartialOrd + fmt::Display + Copy>(
    failures: &mut ValidationFailures,
    field: &str,
    value: T,
    min: T,
    max: T,
) {
    if value < min || value > max {
        failures.push(field, format!("{value} out of range [{min}, {max}]"));
    }
}

fn at_least<T: PartialOrd + fmt::Display + Copy>(
    failures: &mut ValidationFailures,
    field: &str,
    value: T,
    min: T,
) {
    if value < min {
        failures.push(field, format!("{value} below minimum {min}"));
    }
}

/// Validate the full tree, collecting every failing field. Environment-
/// dependent rules (§4.B) are checked here too.
pub fn validate(config: &CrawlerConfig) -> ValidationFailures {
    let mut failures = ValidationFailures::default();

    in_range(&mut failures, "database.pool_size", config.database.pool_size, 1, 50);
    in_range(&mut failures, "database.max_overflow", config.database.max_overflow, 0, 100);
    in_range(&mut failures, "database.pool_timeout", config.database.pool_timeout, 1, 300);
    at_least(&mut failures, "database.pool_recycle", config.database.pool_recycle, 300);

    if config.security.secret_key.trim().is_empty() {
        failures.push("security.secret_key", "must not be empty");
    }
    in_range(
        &mut failures,
        "security.token_expiry",
        config.security.token_expiry,
        300,
        86400,
    );
    in_range(
        &mut failures,
        "security.rate_limit_per_minute",
        config.security.rate_limit_per_minute,
        1,
        1000,
    );

    at_least(&mut failures, "logging.max_bytes", config.logging.max_bytes, 1024);
    in_range(&mut failures, "logging.backup_count", config.logging.backup_count, 1, 100);

    in_range(&mut failures, "crawling.default_delay", config.crawling.default_delay, 0.1, 60.0);
    at_least(&mut failures, "crawling.default_delay", config.crawling.default_delay, 0.5);
    in_range(
        &mut failures,
        "crawling.max_concurrent_requests",
        config.crawling.max_concurrent_requests,
        1,
        50,
    );
    in_range(&mut failures, "crawling.request_timeout", config.crawling.request_timeout, 5, 300);
    in_range(&mut failures, "crawling.max_retries", config.crawling.max_retries, 0, 10);
    in_range(&mut failures, "crawling.retry_delay", config.crawling.retry_delay, 0.5, 30.0);
    at_least(&mut failures, "crawling.max_page_size", config.crawling.max_page_size, 1024);
    at_least(&mut failures, "crawling.min_delay", config.crawling.min_delay, 0.1);
    at_least(&mut failures, "crawling.burst_delay", config.crawling.burst_delay, 1.0);
    at_least(&mut failures, "crawling.max_pages_per_domain", config.crawling.max_pages_per_domain, 1);

    at_least(&mut failures, "notifications.error_threshold", config.notifications.error_threshold, 1);
    in_range(
        &mut failures,
        "notifications.failure_rate_threshold",
        config.notifications.failure_rate_threshold,
        0.0,
        1.0,
    );
    at_least(
        &mut failures,
        "notifications.queue_size_threshold",
        config.notifications.queue_size_threshold,
        1,
    );
    in_range(
        &mut failures,
        "notifications.max_alerts_per_hour",
        config.notifications.max_alerts_per_hour,
        1,
        100,
    );
    if config.notifications.enabled && config.notifications.email.is_none() && config.notifications.slack.is_none() {
        failures.push(
            "notifications",
            "enabled requires at least one of email or slack",
        );
    }

    for (name, site) in &config.sites {
        in_range(&mut failures, &format!("sites.{name}.priority"), site.priority, 1, 10);
        in_range(&mut failures, &format!("sites.{name}.max_depth"), site.max_depth, 1, 20);
        if let Some(rpm) = site.requests_per_minute {
            in_range(&mut failures, &format!("sites.{name}.requests_per_minute"), rpm, 1, 60);
        }
        if let Some(daily) = site.daily_limit {
            at_least(&mut failures, &format!("sites.{name}.daily_limit"), daily, 1);
        }
    }

    for (name, policy) in [
        ("content_changes", &config.retention.content_changes),
        ("crawl_sessions", &config.retention.crawl_sessions),
        ("alerts", &config.retention.alerts),
        ("processing_queue", &config.retention.processing_queue),
    ] {
        if policy.archive_enabled {
            match policy.archive_after_days {
                Some(after) if after < policy.retention_days => {}
                Some(_) => failures.push(
                    &format!("retention.{name}.archive_after_days"),
                    "must be less than retention_days",
                ),
                None => failures.push(
                    &format!("retention.{name}.archive_after_days"),
                    "required when archive_enabled",
                ),
            }
        }
    }

    at_least(&mut failures, "queue.lease_timeout_seconds", config.queue.lease_timeout_seconds, 1);
    at_least(&mut failures, "queue.base_retry_delay_seconds", config.queue.base_retry_delay_seconds, 1);
    at_least(&mut failures, "queue.max_retry_delay_seconds", config.queue.max_retry_delay_seconds, 1);

    match config.environment {
        Environment::Prod => {
            if config.debug {
                failures.push("debug", "must be false in prod");
            }
            if config.hot_reload {
                failures.push("hot_reload", "must be false in prod");
            }
            if matches!(config.logging.level, LogLevel::Debug) {
                tracing::warn!("DEBUG-level logging is configured in prod");
            }
        }
        Environment::Dev | Environment::Staging => {}
    }

    failures
}
