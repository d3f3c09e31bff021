//! Configuration management for settingsd
//!
//! Handles loading and saving configuration from ~/.config/settingsd/config.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration file name
const CONFIG_FILE: &str = "config.toml";

/// Application name for config and data directories
pub const APP_NAME: &str = "settingsd";

const DEFAULT_SYNC_DELAY_SECS: u64 = 5;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;
const DEFAULT_HIBERNATE_AFTER_SECS: u64 = 60 * 20;
const DEFAULT_LOG_IDLE_CLOSE_SECS: u64 = 30;
const DEFAULT_NOTIFY_TIMEOUT_MS: u64 = 2000;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Application configuration
///
/// Every field is optional; unset fields fall back to built-in defaults when
/// resolved through [`Config::daemon_settings`].
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Source addresses of the default database, searched in order
    #[serde(default)]
    pub sources: Option<Vec<String>>,

    /// Directory holding the saved-state log
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Debounce before writing changed values back to their sources
    #[serde(default)]
    pub sync_delay_secs: Option<u64>,

    /// How often dead peers are swept and idle databases hibernated
    #[serde(default)]
    pub cleanup_interval_secs: Option<u64>,

    /// Idle time after which an unwatched database is closed
    #[serde(default)]
    pub hibernate_after_secs: Option<u64>,

    /// Quiet period after which the saved-state log handle is closed
    #[serde(default)]
    pub log_idle_close_secs: Option<u64>,

    /// Upper bound on a single call-out to a listener
    #[serde(default)]
    pub notify_timeout_ms: Option<u64>,
}

/// Fully resolved daemon settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonSettings {
    pub default_sources: Vec<String>,
    pub state_dir: PathBuf,
    pub sync_delay: Duration,
    pub cleanup_interval: Duration,
    pub hibernate_after: Duration,
    pub log_idle_close: Duration,
    pub notify_timeout: Duration,
}

impl DaemonSettings {
    /// Built-in defaults rooted at `state_dir`.
    pub fn with_state_dir(state_dir: PathBuf) -> Self {
        Self {
            default_sources: vec![default_source_address()],
            state_dir,
            sync_delay: Duration::from_secs(DEFAULT_SYNC_DELAY_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            hibernate_after: Duration::from_secs(DEFAULT_HIBERNATE_AFTER_SECS),
            log_idle_close: Duration::from_secs(DEFAULT_LOG_IDLE_CLOSE_SECS),
            notify_timeout: Duration::from_millis(DEFAULT_NOTIFY_TIMEOUT_MS),
        }
    }
}

/// The per-user data directory, `~/.local/share/settingsd` on Linux
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// The writable JSON tree used when no sources are configured
pub fn default_source_address() -> String {
    format!(
        "json:readwrite:{}",
        default_data_dir().join("user.json").display()
    )
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the config file path
    ///
    /// Returns ~/.config/settingsd/config.toml on Linux
    pub fn config_path() -> ConfigResult<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Get the config directory path
    pub fn config_dir() -> ConfigResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join(APP_NAME))
    }

    /// Load configuration from file
    ///
    /// Returns default config if file doesn't exist
    pub fn load() -> ConfigResult<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// Creates the config directory if it doesn't exist
    pub fn save(&self) -> ConfigResult<()> {
        let path = Self::config_path()?;
        let dir = Self::config_dir()?;

        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(&path, contents)?;
        Ok(())
    }

    /// Check if any configuration is set
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Resolve into daemon settings. `state_dir_override` (from the command
    /// line) wins over the configured directory.
    pub fn daemon_settings(&self, state_dir_override: Option<PathBuf>) -> DaemonSettings {
        let state_dir = state_dir_override
            .or_else(|| self.state_dir.clone())
            .unwrap_or_else(default_data_dir);
        let mut settings = DaemonSettings::with_state_dir(state_dir);

        if let Some(sources) = self.sources.as_ref().filter(|s| !s.is_empty()) {
            settings.default_sources = sources.clone();
        }
        if let Some(secs) = self.sync_delay_secs {
            settings.sync_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = self.cleanup_interval_secs {
            settings.cleanup_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = self.hibernate_after_secs {
            settings.hibernate_after = Duration::from_secs(secs);
        }
        if let Some(secs) = self.log_idle_close_secs {
            settings.log_idle_close = Duration::from_secs(secs);
        }
        if let Some(ms) = self.notify_timeout_ms {
            settings.notify_timeout = Duration::from_millis(ms.max(1));
        }
        settings
    }
}

/// Format the configuration for display
pub fn format_config(config: &Config) -> String {
    let settings = config.daemon_settings(None);
    let mut lines = Vec::new();

    lines.push("Current configuration:".to_string());
    lines.push(String::new());

    match config.sources {
        Some(ref sources) if !sources.is_empty() => {
            lines.push("  sources = [".to_string());
            for source in sources {
                lines.push(format!("    \"{}\",", source));
            }
            lines.push("  ]".to_string());
        }
        _ => lines.push(format!(
            "  sources = (not set, using \"{}\")",
            default_source_address()
        )),
    }

    match config.state_dir {
        Some(ref dir) => lines.push(format!("  state_dir = \"{}\"", dir.display())),
        None => lines.push(format!(
            "  state_dir = (not set, using {})",
            settings.state_dir.display()
        )),
    }

    let timings = [
        ("sync_delay_secs", config.sync_delay_secs, DEFAULT_SYNC_DELAY_SECS),
        (
            "cleanup_interval_secs",
            config.cleanup_interval_secs,
            DEFAULT_CLEANUP_INTERVAL_SECS,
        ),
        (
            "hibernate_after_secs",
            config.hibernate_after_secs,
            DEFAULT_HIBERNATE_AFTER_SECS,
        ),
        (
            "log_idle_close_secs",
            config.log_idle_close_secs,
            DEFAULT_LOG_IDLE_CLOSE_SECS,
        ),
        (
            "notify_timeout_ms",
            config.notify_timeout_ms,
            DEFAULT_NOTIFY_TIMEOUT_MS,
        ),
    ];
    for (name, value, default) in timings {
        match value {
            Some(v) => lines.push(format!("  {} = {}", name, v)),
            None => lines.push(format!("  {} = (not set, using {})", name, default)),
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.sources.is_none());
        assert!(config.state_dir.is_none());
        assert!(config.is_empty());
    }

    #[test]
    fn test_config_serialize_deserialize() {
        let config = Config {
            sources: Some(vec![
                "json:readonly:/etc/settingsd/defaults.json".to_string(),
                "mem:readwrite:scratch".to_string(),
            ]),
            sync_delay_secs: Some(1),
            ..Config::default()
        };

        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config, parsed);
        assert!(!config.is_empty());
    }

    #[test]
    fn test_config_serialize_empty() {
        let config = Config::new();
        let toml_str = toml::to_string(&config).unwrap();

        assert!(!toml_str.contains("sources"));
        assert!(!toml_str.contains("state_dir"));
    }

    #[test]
    fn test_config_deserialize_partial() {
        let toml_str = r#"
            hibernate_after_secs = 60
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.hibernate_after_secs, Some(60));
        assert!(config.sources.is_none());
    }

    #[test]
    fn test_daemon_settings_defaults() {
        let settings = Config::new().daemon_settings(Some(PathBuf::from("/tmp/state")));
        assert_eq!(settings.state_dir, PathBuf::from("/tmp/state"));
        assert_eq!(settings.sync_delay, Duration::from_secs(5));
        assert_eq!(settings.cleanup_interval, Duration::from_secs(60));
        assert_eq!(settings.hibernate_after, Duration::from_secs(1200));
        assert_eq!(settings.log_idle_close, Duration::from_secs(30));
        assert_eq!(settings.notify_timeout, Duration::from_millis(2000));
        assert_eq!(settings.default_sources.len(), 1);
        assert!(settings.default_sources[0].starts_with("json:readwrite:"));
    }

    #[test]
    fn test_daemon_settings_overrides() {
        let config = Config {
            sources: Some(vec!["mem:readwrite:x".to_string()]),
            state_dir: Some(PathBuf::from("/from/config")),
            sync_delay_secs: Some(0),
            notify_timeout_ms: Some(250),
            ..Config::default()
        };

        let settings = config.daemon_settings(None);
        assert_eq!(settings.state_dir, PathBuf::from("/from/config"));
        assert_eq!(settings.default_sources, vec!["mem:readwrite:x"]);
        assert_eq!(settings.sync_delay, Duration::ZERO);
        assert_eq!(settings.notify_timeout, Duration::from_millis(250));

        let overridden = config.daemon_settings(Some(PathBuf::from("/from/cli")));
        assert_eq!(overridden.state_dir, PathBuf::from("/from/cli"));
    }

    #[test]
    fn test_empty_sources_fall_back_to_default() {
        let config = Config {
            sources: Some(Vec::new()),
            ..Config::default()
        };
        let settings = config.daemon_settings(None);
        assert_eq!(settings.default_sources, vec![default_source_address()]);
    }

    #[test]
    fn test_format_config() {
        let config = Config {
            sources: Some(vec!["mem:readwrite:x".to_string()]),
            ..Config::default()
        };
        let output = format_config(&config);
        assert!(output.contains("\"mem:readwrite:x\""));
        assert!(output.contains("sync_delay_secs = (not set, using 5)"));
    }
}
