//! Secret redaction for logging/display, §4.B.

use serde_json::Value;

use super::schema::CrawlerConfig;

const MASK: &str = "***MASKED***";

const SECRET_POINTERS: &[&str] = &[
    "/database/url",
    "/security/secret_key",
    "/security/api_key",
    "/notifications/slack",
];

/// A JSON projection of the configuration with every secret field replaced
/// by the literal token `***MASKED***`. Never round-trips back into a
/// [`CrawlerConfig`] — it exists for logs and diagnostic output only.
pub fn get_masked(config: &CrawlerConfig) -> Value {
    let mut value = serde_json::to_value(config).unwrap_or(Value::Null);
    for pointer in SECRET_POINTERS {
        if let Some(slot) = value.pointer_mut(pointer) {
            if !slot.is_null() {
                *slot = Value::String(MASK.to_string());
            }
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_secret_key() {
        let mut config = CrawlerConfig::default();
        config.security.secret_key = "super-secret".to_string();
        let masked = get_masked(&config);
        assert_eq!(masked["security"]["secret_key"], MASK);
    }

    #[test]
    fn leaves_non_secret_fields_untouched() {
        let mut config = CrawlerConfig::default();
        config.crawling.user_agent = "test-agent".to_string();
        let masked = get_masked(&config);
        assert_eq!(masked["crawling"]["user_agent"], "test-agent");
    }
}
