//! Configuration validation rules.

use super::schema::Config;

/// Validate configuration and return aggregated validation errors.
pub fn validate_config(config: &Config) -> crate::Result<()> {
    let mut errors = Vec::new();

    let base_url = config.api.base_url.trim();
    if base_url.is_empty() {
        errors.push("api.base_url must not be empty".to_string());
    } else if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        errors.push("api.base_url must start with http:// or https://".to_string());
    }
    if !config.api.chat_path.starts_with('/') {
        errors.push("api.chat_path must start with '/'".to_string());
    }
    if config.api.timeout_secs == 0 {
        errors.push("api.timeout_secs must be > 0".to_string());
    }

    let format = config.logging.format.to_lowercase();
    if format != "text" && format != "json" {
        errors.push("logging.format must be one of: text, json".to_string());
    }
    if config.logging.dir.trim().is_empty() {
        errors.push("logging.dir must not be empty".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(crate::Error::Validation(errors.join("; ")))
    }
}
