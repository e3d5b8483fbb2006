//! Configuration loading and management

use super::schema::Config;
use super::validate::validate_config;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable holding the endpoint base URL
pub const API_URL_ENV: &str = "PARTICLE_API_URL";

/// Prefix for path-style overrides, e.g. `PARTICLE__API__TIMEOUT_SECS=10`
const PATH_ENV_PREFIX: &str = "PARTICLE__";

/// Configuration loader
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Create a new config loader with the default config directory
    pub fn new() -> Self {
        let config_dir = dirs::home_dir()
            .map(|h| h.join(".particle"))
            .unwrap_or_else(|| PathBuf::from(".particle"));

        Self { config_dir }
    }

    /// Create a new config loader with a custom config directory
    pub fn with_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            config_dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Load configuration from file and environment
    ///
    /// Precedence, lowest first: built-in defaults, `config.json`, the
    /// `PARTICLE_API_URL` alias, then `PARTICLE__*` path overrides.
    pub fn load(&self) -> crate::Result<Config> {
        let config_path = self.config_path();
        let mut merged = serde_json::to_value(Config::default())?;

        if config_path.exists() {
            debug!("Loading config from {}", config_path.display());
            let content = std::fs::read_to_string(&config_path).map_err(|e| {
                crate::Error::Config(format!("cannot read {}: {}", config_path.display(), e))
            })?;
            let file_value: Value = serde_json::from_str(&content)?;
            merge_values(&mut merged, file_value);
        }

        apply_alias_overrides(&mut merged);
        apply_path_overrides(&mut merged);

        let config: Config = serde_json::from_value(merged)?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, config: &Config) -> crate::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(self.config_path(), content)?;
        Ok(())
    }

    /// Get the config directory path
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Path of the config file inside the config directory
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if let Some(existing) = base_map.get_mut(&key) {
                    merge_values(existing, value);
                } else {
                    base_map.insert(key, value);
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value;
        }
    }
}

fn parse_env_value(raw: &str) -> Value {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return v;
    }
    if raw.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    Value::String(raw.to_string())
}

/// Write `value` at `path` inside an existing section of the merged config.
///
/// Paths through unknown sections or non-object values are dropped.
fn set_path_value(root: &mut Value, path: &[String], value: Value) {
    let Some((field, sections)) = path.split_last() else {
        return;
    };

    let mut target = root;
    for section in sections {
        let Some(next) = target
            .get_mut(section.as_str())
            .filter(|v| v.is_object())
        else {
            debug!("Ignoring override for unknown config path {}", path.join("."));
            return;
        };
        target = next;
    }

    if let Some(map) = target.as_object_mut() {
        map.insert(field.clone(), value);
    }
}

fn apply_alias_overrides(config: &mut Value) {
    let aliases = [(API_URL_ENV, "api.base_url")];

    for (env_key, target_path) in aliases {
        if let Ok(value) = std::env::var(env_key) {
            if value.trim().is_empty() {
                continue;
            }
            let path: Vec<String> = target_path.split('.').map(ToString::to_string).collect();
            set_path_value(config, &path, Value::String(value));
        }
    }
}

fn apply_path_overrides(config: &mut Value) {
    for (key, value) in std::env::vars() {
        let Some(suffix) = key.strip_prefix(PATH_ENV_PREFIX) else {
            continue;
        };
        let segments: Vec<String> = suffix
            .split("__")
            .filter(|s| !s.is_empty())
            .map(|s| s.to_ascii_lowercase())
            .collect();
        if segments.is_empty() {
            continue;
        }
        set_path_value(config, &segments, parse_env_value(&value));
    }
}
