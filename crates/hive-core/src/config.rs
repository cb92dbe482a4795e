//! Configuration parsing for the hive daemon.
//!
//! key=value format, one setting per line, `#` comments.
//! Precedence: CLI flags > `--config` file > `~/.config/hive/hive.conf` > defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Daemon configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Storage and HTTP
    pub db_path: PathBuf,
    pub port: u16,
    /// Directory holding `{workflow}/workflow.yml` definitions.
    pub workflows_dir: PathBuf,

    // Engine
    /// Running steps untouched for longer than this are reclaimed.
    pub stale_after_sec: u64,

    // External scheduler
    /// Upper bound on every external scheduler call made by the dispatch gate.
    pub dispatch_timeout_ms: u64,
    /// Leading segment of trigger names (`{prefix}/{workflow}/{role}`).
    pub trigger_prefix: String,
    pub poll_every_ms: u64,
    pub polling_model: String,
    pub polling_timeout_sec: u64,
    pub gateway_url: String,
    pub gateway_token: Option<String>,
    pub scheduler_cli_bin: PathBuf,
    pub scheduler_jobs_path: PathBuf,

    // Notifications
    pub notify_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: dirs::data_local_dir().map_or_else(
                || PathBuf::from("~/.local/share/hive/hive.db"),
                |d| d.join("hive/hive.db"),
            ),
            port: 7800,
            workflows_dir: dirs::home_dir().map_or_else(
                || PathBuf::from("~/.hive/workflows"),
                |h| h.join(".hive/workflows"),
            ),
            stale_after_sec: 15 * 60,
            dispatch_timeout_ms: 5_000,
            trigger_prefix: "hive".to_string(),
            poll_every_ms: 300_000,
            polling_model: "default".to_string(),
            polling_timeout_sec: 120,
            gateway_url: "http://127.0.0.1:18789".to_string(),
            gateway_token: None,
            scheduler_cli_bin: PathBuf::from("openclaw"),
            scheduler_jobs_path: dirs::home_dir().map_or_else(
                || PathBuf::from("~/.openclaw/cron/jobs.json"),
                |h| h.join(".openclaw/cron/jobs.json"),
            ),
            notify_timeout_ms: 5_000,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "db_path" => self.db_path = PathBuf::from(value),
            "port" => self.port = Self::parse_int(key, value)?,
            "workflows_dir" => self.workflows_dir = PathBuf::from(value),
            "stale_after_sec" => self.stale_after_sec = Self::parse_int(key, value)?,
            "dispatch_timeout_ms" => self.dispatch_timeout_ms = Self::parse_int(key, value)?,
            "trigger_prefix" => self.trigger_prefix = value.trim_matches('/').to_string(),
            "poll_every_ms" => self.poll_every_ms = Self::parse_int(key, value)?,
            "polling_model" => self.polling_model = value.to_string(),
            "polling_timeout_sec" => self.polling_timeout_sec = Self::parse_int(key, value)?,
            "gateway_url" => self.gateway_url = value.trim_end_matches('/').to_string(),
            "gateway_token" => {
                self.gateway_token = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "scheduler_cli_bin" => self.scheduler_cli_bin = PathBuf::from(value),
            "scheduler_jobs_path" => self.scheduler_jobs_path = PathBuf::from(value),
            "notify_timeout_ms" => self.notify_timeout_ms = Self::parse_int(key, value)?,
            _ => {
                // Unknown keys are tolerated so newer config files still load.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Default location of the user config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("hive/hive.conf"))
    }
}

/// User directory lookup without pulling a dependency into the core crate.
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| home_dir().map(|h| h.join(".local/share")))
    }

    pub fn config_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| home_dir().map(|h| h.join(".config")))
    }

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME").map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.port, 7800);
        assert_eq!(config.stale_after_sec, 900);
        assert_eq!(config.trigger_prefix, "hive");
        assert_eq!(config.poll_every_ms, 300_000);
        assert_eq!(config.polling_model, "default");
        assert_eq!(config.polling_timeout_sec, 120);
        assert!(config.gateway_token.is_none());
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# daemon
port=9000
stale_after_sec=60
gateway_url="http://localhost:18789/"
gateway_token='secret'
trigger_prefix=/swarm/
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.stale_after_sec, 60);
        assert_eq!(config.gateway_url, "http://localhost:18789");
        assert_eq!(config.gateway_token.as_deref(), Some("secret"));
        assert_eq!(config.trigger_prefix, "swarm");
    }

    #[test]
    fn invalid_int_is_rejected() {
        let mut config = Config::default();
        let result = config.parse_content("port=lots");
        assert!(matches!(result, Err(ConfigError::InvalidInt { .. })));
    }

    #[test]
    fn line_without_equals_is_rejected() {
        let mut config = Config::default();
        let result = config.parse_content("port 9000");
        assert!(matches!(result, Err(ConfigError::InvalidLine(_))));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = Config::default();
        config.parse_content("shiny_new_key=1").unwrap();
        assert_eq!(config.port, 7800);
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hive.conf");
        std::fs::write(&path, "polling_model=fast\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.polling_model, "fast");
    }
}
