// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Configuration management for the module engine.
//!
//! Values come from, in increasing precedence: built-in defaults, one TOML
//! file (explicit path, `./spacey-modules.toml`, or
//! `<config dir>/spacey/modules.toml`), and `SPACEY_MODULES_*` environment
//! variables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::loader::LoadOptions;
use crate::policy::BreakerConfig;

/// Prefix of environment variable overrides
pub const ENV_PREFIX: &str = "SPACEY_MODULES_";

/// Name of the project-local config file
pub const PROJECT_CONFIG_FILE: &str = "spacey-modules.toml";

/// Specifier resolution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveConfig {
    /// Directory used for relative specifiers that have no referrer
    pub base_dir: String,

    /// Alias entries (exact name, `prefix/`, or `prefix*`) to targets
    pub alias_map: BTreeMap<String, String>,

    /// Candidate suffixes probed in order
    pub extension_order: Vec<String>,

    /// Whether extension and `index` probing is allowed
    pub allow_extensionless: bool,

    /// Extension (with dot) to module type tag
    pub module_types: BTreeMap<String, String>,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        let module_types = [(".json", "json"), (".css", "css"), (".wasm", "wasm")]
            .into_iter()
            .map(|(ext, tag)| (ext.to_string(), tag.to_string()))
            .collect();

        Self {
            base_dir: "/".to_string(),
            alias_map: BTreeMap::new(),
            extension_order: vec![".js".to_string(), ".mjs".to_string(), ".json".to_string()],
            allow_extensionless: true,
            module_types,
        }
    }
}

/// Loader settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Per-attempt timeout in milliseconds
    pub timeout_ms: u64,

    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before each retry in milliseconds (last entry repeats)
    pub retry_backoff_ms: Vec<u64>,

    /// Default priority of load tasks
    pub priority: i32,

    /// Load tasks allowed to fetch at the same time
    pub max_concurrent: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_retries: 3,
            retry_backoff_ms: vec![1000, 2000, 5000],
            priority: 0,
            max_concurrent: 3,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Whether the breaker guards loads at all
    pub enabled: bool,

    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// How long an open circuit rejects calls, in milliseconds
    pub reset_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Resolver settings
    pub resolve: ResolveConfig,

    /// Loader settings
    pub load: LoadConfig,

    /// Circuit breaker settings
    pub breaker: BreakerSettings,
}

impl Config {
    /// Load configuration from default locations.
    ///
    /// An explicit path must exist; the implicit locations are skipped when
    /// missing.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => [Some(PathBuf::from(PROJECT_CONFIG_FILE)), user_config_path()]
                .into_iter()
                .flatten()
                .find(|p| p.exists()),
        };

        let mut config = match path {
            Some(path) => {
                tracing::debug!("Loading module config from {}", path.display());
                Self::from_toml(&std::fs::read_to_string(&path)?)?
            }
            None => Config::default(),
        };

        config.load_from_env()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `SPACEY_MODULES_*` environment variables.
    fn load_from_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply `SPACEY_MODULES_*`-style overrides from any key/value source.
    ///
    /// Unknown keys are skipped with a warning; known keys with values that
    /// do not parse are errors.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(config_key) = key.strip_prefix(ENV_PREFIX) {
                let config_key = config_key.to_lowercase().replace('_', "-");
                if !is_known_key(&config_key) {
                    tracing::warn!("Ignoring unknown setting {}", key);
                    continue;
                }
                self.set(&config_key, &value)?;
            }
        }
        Ok(())
    }

    /// Set a configuration value.
    ///
    /// Keys are the short names (`timeout`, `max-concurrent`, ...) or the
    /// TOML paths (`load.timeout_ms`, ...). `alias.<entry>` and `type.<ext>`
    /// keys add alias and module-type entries; list values are comma
    /// separated.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        };

        let key = short_key(key);
        match key.as_str() {
            "base-dir" => self.resolve.base_dir = value.to_string(),
            "extension-order" => self.resolve.extension_order = split_list(value),
            "allow-extensionless" => {
                self.resolve.allow_extensionless = value.parse().map_err(|_| invalid())?
            }
            "timeout" => self.load.timeout_ms = value.parse().map_err(|_| invalid())?,
            "max-retries" => self.load.max_retries = value.parse().map_err(|_| invalid())?,
            "retry-backoff" => {
                self.load.retry_backoff_ms = split_list(value)
                    .iter()
                    .map(|v| v.parse())
                    .collect::<Result<_, _>>()
                    .map_err(|_| invalid())?
            }
            "priority" => self.load.priority = value.parse().map_err(|_| invalid())?,
            "max-concurrent" => {
                let n: usize = value.parse().map_err(|_| invalid())?;
                if n == 0 {
                    return Err(invalid());
                }
                self.load.max_concurrent = n;
            }
            "breaker" => self.breaker.enabled = value.parse().map_err(|_| invalid())?,
            "failure-threshold" => {
                self.breaker.failure_threshold = value.parse().map_err(|_| invalid())?
            }
            "reset-timeout" => {
                self.breaker.reset_timeout_ms = value.parse().map_err(|_| invalid())?
            }
            _ => {
                if let Some(entry) = key.strip_prefix("alias.") {
                    self.resolve
                        .alias_map
                        .insert(entry.to_string(), value.to_string());
                } else if let Some(ext) = key.strip_prefix("type.") {
                    let ext = if ext.starts_with('.') {
                        ext.to_string()
                    } else {
                        format!(".{}", ext)
                    };
                    self.resolve.module_types.insert(ext, value.to_string());
                } else {
                    return Err(invalid());
                }
            }
        }

        Ok(())
    }

    /// Get a configuration value, by the same keys as [`Config::set`]
    pub fn get(&self, key: &str) -> Option<String> {
        let key = short_key(key);
        match key.as_str() {
            "base-dir" => Some(self.resolve.base_dir.clone()),
            "extension-order" => Some(self.resolve.extension_order.join(",")),
            "allow-extensionless" => Some(self.resolve.allow_extensionless.to_string()),
            "timeout" => Some(self.load.timeout_ms.to_string()),
            "max-retries" => Some(self.load.max_retries.to_string()),
            "retry-backoff" => Some(
                self.load
                    .retry_backoff_ms
                    .iter()
                    .map(|ms| ms.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            "priority" => Some(self.load.priority.to_string()),
            "max-concurrent" => Some(self.load.max_concurrent.to_string()),
            "breaker" => Some(self.breaker.enabled.to_string()),
            "failure-threshold" => Some(self.breaker.failure_threshold.to_string()),
            "reset-timeout" => Some(self.breaker.reset_timeout_ms.to_string()),
            _ => {
                if let Some(entry) = key.strip_prefix("alias.") {
                    self.resolve.alias_map.get(entry).cloned()
                } else if let Some(ext) = key.strip_prefix("type.") {
                    let ext = if ext.starts_with('.') {
                        ext.to_string()
                    } else {
                        format!(".{}", ext)
                    };
                    self.resolve.module_types.get(&ext).cloned()
                } else {
                    None
                }
            }
        }
    }

    /// Default options for load tasks
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            timeout: Duration::from_millis(self.load.timeout_ms),
            max_retries: self.load.max_retries,
            retry_backoff: self
                .load
                .retry_backoff_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
            priority: self.load.priority,
        }
    }

    /// Circuit breaker configuration
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            enabled: self.breaker.enabled,
            failure_threshold: self.breaker.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(self.breaker.reset_timeout_ms),
        }
    }
}

/// Get the user config path.
fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("spacey").join("modules.toml"))
}

const SHORT_KEYS: &[(&str, &str)] = &[
    ("base-dir", "resolve.base_dir"),
    ("extension-order", "resolve.extension_order"),
    ("allow-extensionless", "resolve.allow_extensionless"),
    ("timeout", "load.timeout_ms"),
    ("max-retries", "load.max_retries"),
    ("retry-backoff", "load.retry_backoff_ms"),
    ("priority", "load.priority"),
    ("max-concurrent", "load.max_concurrent"),
    ("breaker", "breaker.enabled"),
    ("failure-threshold", "breaker.failure_threshold"),
    ("reset-timeout", "breaker.reset_timeout_ms"),
];

/// Map a TOML path to its short key; short keys pass through
fn short_key(key: &str) -> String {
    if let Some((short, _)) = SHORT_KEYS.iter().find(|(_, path)| *path == key) {
        return short.to_string();
    }
    if let Some(entry) = key.strip_prefix("resolve.alias_map.") {
        return format!("alias.{}", entry);
    }
    if let Some(ext) = key.strip_prefix("resolve.module_types.") {
        return format!("type.{}", ext);
    }
    key.to_string()
}

fn is_known_key(key: &str) -> bool {
    let key = short_key(key);
    SHORT_KEYS.iter().any(|(short, _)| *short == key)
        || key.starts_with("alias.")
        || key.starts_with("type.")
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.load.retry_backoff_ms, vec![1000, 2000, 5000]);
        assert_eq!(config.load.max_concurrent, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(
            config.resolve.module_types.get(".json").map(String::as_str),
            Some("json")
        );

        let options = config.load_options();
        assert_eq!(options.timeout, Duration::from_secs(10));
        assert_eq!(options.retry_backoff.len(), 3);
    }

    #[test]
    fn test_from_toml_keeps_defaults() {
        let config = Config::from_toml(
            r##"
            [resolve]
            extension_order = [".mod", ".idx.mod"]

            [resolve.alias_map]
            "#utils/*" = "/src/utils/*.mod"

            [load]
            max_retries = 2
            retry_backoff_ms = [100, 200]
            "##,
        )
        .unwrap();

        assert_eq!(config.resolve.extension_order, vec![".mod", ".idx.mod"]);
        assert_eq!(
            config.resolve.alias_map.get("#utils/*").map(String::as_str),
            Some("/src/utils/*.mod")
        );
        assert_eq!(config.load.max_retries, 2);
        assert_eq!(config.load.timeout_ms, 10_000);
        assert!(config.breaker.enabled);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(vec![
                ("SPACEY_MODULES_MAX_CONCURRENT".to_string(), "1".to_string()),
                ("SPACEY_MODULES_RETRY_BACKOFF".to_string(), "10, 20".to_string()),
                ("SPACEY_MODULES_TYPE.TXT".to_string(), "text".to_string()),
                ("PATH".to_string(), "/usr/bin".to_string()),
            ])
            .unwrap();

        assert_eq!(config.load.max_concurrent, 1);
        assert_eq!(config.load.retry_backoff_ms, vec![10, 20]);
        assert_eq!(config.get("type.txt").as_deref(), Some("text"));
    }

    #[test]
    fn test_unknown_env_keys_are_skipped() {
        let mut config = Config::default();
        config
            .apply_overrides(vec![
                ("SPACEY_MODULES_LOG".to_string(), "debug".to_string()),
                ("SPACEY_MODULES_TIMEOUT".to_string(), "250".to_string()),
            ])
            .unwrap();
        assert_eq!(config.load.timeout_ms, 250);

        // A known key with a bad value still fails
        let err = config
            .apply_overrides(vec![("SPACEY_MODULES_TIMEOUT".to_string(), "soon".to_string())])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_toml_paths_as_keys() {
        let mut config = Config::default();
        config.set("load.timeout_ms", "1500").unwrap();
        config.set("resolve.alias_map.vue", "/vendor/vue.js").unwrap();

        assert_eq!(config.get("load.timeout_ms").as_deref(), Some("1500"));
        assert_eq!(config.get("timeout").as_deref(), Some("1500"));
        assert_eq!(config.get("breaker.enabled").as_deref(), Some("true"));
        assert_eq!(config.get("alias.vue").as_deref(), Some("/vendor/vue.js"));
        assert_eq!(
            config.get("resolve.module_types.json").as_deref(),
            Some("json")
        );
        assert_eq!(config.get("load.nothing"), None);
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = Config::default();
        assert!(matches!(
            config.set("timeout", "soon"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(config.set("max-concurrent", "0").is_err());
        assert!(config.set("no-such-key", "1").is_err());
        assert!(config.set("load.max_concurrent", "0").is_err());

        config.set("alias.vue", "/vendor/vue.js").unwrap();
        assert_eq!(config.get("alias.vue").as_deref(), Some("/vendor/vue.js"));
    }
}
