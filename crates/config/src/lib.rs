//! Configuration loading, validation, and management for Canopy.
//!
//! Loads configuration from `canopy.toml` with environment variable
//! overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `canopy.toml`; every field also has an environment
/// override (see [`CanopyConfig::load`]).
#[derive(Clone, Serialize, Deserialize)]
pub struct CanopyConfig {
    /// Fallback provider API key used when a request carries none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_default_key: Option<String>,

    /// SQLite database path.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// HTTP bind host.
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum recursive delegation depth.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Maximum concurrent child executions per run.
    #[serde(default = "default_max_parallel_per_run")]
    pub max_parallel_per_run: usize,

    /// Process-wide cap on in-flight LLM calls.
    #[serde(default = "default_global_llm_concurrency")]
    pub global_llm_concurrency: usize,

    /// Total wall-clock budget for one run, in seconds.
    #[serde(default = "default_run_timeout_seconds")]
    pub run_timeout_seconds: u64,

    /// Wall-clock budget for one agent execution (children included).
    #[serde(default = "default_agent_timeout_seconds")]
    pub agent_timeout_seconds: u64,

    /// Capacity of the producer→consumer event channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Conversation-history entries included in agent prompts.
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Router selection threshold: children scoring strictly above engage.
    #[serde(default)]
    pub selection_threshold: f32,

    /// Legacy model id → current id substitutions.
    #[serde(default)]
    pub legacy_model_map: HashMap<String, String>,
}

fn default_database_path() -> String {
    "canopy.db".into()
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8600
}
fn default_max_depth() -> usize {
    10
}
fn default_max_parallel_per_run() -> usize {
    4
}
fn default_global_llm_concurrency() -> usize {
    32
}
fn default_run_timeout_seconds() -> u64 {
    600
}
fn default_agent_timeout_seconds() -> u64 {
    30
}
fn default_channel_capacity() -> usize {
    256
}
fn default_history_window() -> usize {
    3
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for CanopyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanopyConfig")
            .field("llm_default_key", &redact(&self.llm_default_key))
            .field("database_path", &self.database_path)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("max_depth", &self.max_depth)
            .field("max_parallel_per_run", &self.max_parallel_per_run)
            .field("global_llm_concurrency", &self.global_llm_concurrency)
            .field("run_timeout_seconds", &self.run_timeout_seconds)
            .field("agent_timeout_seconds", &self.agent_timeout_seconds)
            .field("channel_capacity", &self.channel_capacity)
            .field("history_window", &self.history_window)
            .field("selection_threshold", &self.selection_threshold)
            .field("legacy_model_map", &self.legacy_model_map)
            .finish()
    }
}

impl Default for CanopyConfig {
    fn default() -> Self {
        Self {
            llm_default_key: None,
            database_path: default_database_path(),
            host: default_host(),
            port: default_port(),
            max_depth: default_max_depth(),
            max_parallel_per_run: default_max_parallel_per_run(),
            global_llm_concurrency: default_global_llm_concurrency(),
            run_timeout_seconds: default_run_timeout_seconds(),
            agent_timeout_seconds: default_agent_timeout_seconds(),
            channel_capacity: default_channel_capacity(),
            history_window: default_history_window(),
            selection_threshold: 0.0,
            legacy_model_map: default_legacy_model_map(),
        }
    }
}

/// Model ids retired by the provider, mapped to their successors.
fn default_legacy_model_map() -> HashMap<String, String> {
    [
        ("gemini-1.5-pro", "gemini-2.5-pro"),
        ("gemini-1.5-flash", "gemini-2.5-flash"),
        ("gemini-1.0-pro", "gemini-2.5-pro"),
        ("gemini-pro", "gemini-2.5-pro"),
        ("gemini-2.0-flash", "gemini-2.5-flash"),
        ("gemini-2.0-flash-exp", "gemini-2.5-flash"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl CanopyConfig {
    /// Load configuration from `canopy.toml` in the working directory,
    /// then apply environment variable overrides:
    ///
    /// - `LLM_DEFAULT_KEY`
    /// - `DATABASE_PATH`, `HOST`, `PORT`
    /// - `MAX_DEPTH`, `MAX_PARALLEL_PER_RUN`, `GLOBAL_LLM_CONCURRENCY`
    /// - `RUN_TIMEOUT_SECONDS`, `AGENT_TIMEOUT_SECONDS`, `CHANNEL_CAPACITY`
    /// - `LEGACY_MODEL_MAP` (comma-separated `old=new` pairs)
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(Path::new("canopy.toml"))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(config)
    }

    /// Apply environment variable overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("LLM_DEFAULT_KEY") {
            if !key.is_empty() {
                self.llm_default_key = Some(key);
            }
        }
        if let Ok(path) = std::env::var("DATABASE_PATH") {
            self.database_path = path;
        }
        if let Ok(host) = std::env::var("HOST") {
            self.host = host;
        }
        Self::override_parsed(&mut self.port, "PORT");
        Self::override_parsed(&mut self.max_depth, "MAX_DEPTH");
        Self::override_parsed(&mut self.max_parallel_per_run, "MAX_PARALLEL_PER_RUN");
        Self::override_parsed(&mut self.global_llm_concurrency, "GLOBAL_LLM_CONCURRENCY");
        Self::override_parsed(&mut self.run_timeout_seconds, "RUN_TIMEOUT_SECONDS");
        Self::override_parsed(&mut self.agent_timeout_seconds, "AGENT_TIMEOUT_SECONDS");
        Self::override_parsed(&mut self.channel_capacity, "CHANNEL_CAPACITY");
        Self::override_parsed(&mut self.history_window, "HISTORY_WINDOW");
        Self::override_parsed(&mut self.selection_threshold, "SELECTION_THRESHOLD");

        if let Ok(map) = std::env::var("LEGACY_MODEL_MAP") {
            self.legacy_model_map = parse_model_map(&map);
        }
    }

    fn override_parsed<T: std::str::FromStr>(slot: &mut T, var: &str) {
        if let Ok(raw) = std::env::var(var) {
            match raw.parse() {
                Ok(value) => *slot = value,
                Err(_) => tracing::warn!(var, value = %raw, "Ignoring unparseable env override"),
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::ValidationError("max_depth must be > 0".into()));
        }
        if self.max_parallel_per_run == 0 {
            return Err(ConfigError::ValidationError(
                "max_parallel_per_run must be > 0".into(),
            ));
        }
        if self.global_llm_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "global_llm_concurrency must be > 0".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "channel_capacity must be > 0".into(),
            ));
        }
        if self.run_timeout_seconds == 0 || self.agent_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "timeouts must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Parse a comma-separated `old=new` model mapping.
fn parse_model_map(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (old, new) = pair.split_once('=')?;
            let (old, new) = (old.trim(), new.trim());
            if old.is_empty() || new.is_empty() {
                None
            } else {
                Some((old.to_string(), new.to_string()))
            }
        })
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = CanopyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_depth, 10);
        assert_eq!(config.max_parallel_per_run, 4);
        assert_eq!(config.global_llm_concurrency, 32);
        assert_eq!(config.run_timeout_seconds, 600);
        assert_eq!(config.agent_timeout_seconds, 30);
        assert_eq!(config.channel_capacity, 256);
    }

    #[test]
    fn default_legacy_map_covers_retired_models() {
        let config = CanopyConfig::default();
        assert_eq!(
            config.legacy_model_map.get("gemini-1.5-flash").unwrap(),
            "gemini-2.5-flash"
        );
        assert_eq!(
            config.legacy_model_map.get("gemini-pro").unwrap(),
            "gemini-2.5-pro"
        );
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = CanopyConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: CanopyConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.port, config.port);
        assert_eq!(parsed.max_depth, config.max_depth);
    }

    #[test]
    fn zero_depth_rejected() {
        let config = CanopyConfig {
            max_depth: 0,
            ..CanopyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_channel_capacity_rejected() {
        let config = CanopyConfig {
            channel_capacity: 0,
            ..CanopyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = CanopyConfig::load_from(Path::new("/nonexistent/canopy.toml"));
        assert!(result.is_ok());
        assert_eq!(result.unwrap().port, 8600);
    }

    #[test]
    fn model_map_parsing() {
        let map = parse_model_map("a=b, c = d,,bad,=x");
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("a").unwrap(), "b");
        assert_eq!(map.get("c").unwrap(), "d");
    }

    #[test]
    fn debug_redacts_key() {
        let config = CanopyConfig {
            llm_default_key: Some("sk-secret".into()),
            ..CanopyConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
