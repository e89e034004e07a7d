//! Configuration file support
//!
//! Loaded from TOML; every section falls back to its defaults. `FLOWSCOPE_*`
//! environment variables override file values.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection tracking settings
    pub conntrack: ConntrackConfig,

    /// IMAP analyzer settings
    pub imap: ImapConfig,

    /// Expiry timer settings
    pub timers: TimerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let mut config = Self::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Serialize configuration to a TOML string
    #[allow(clippy::inherent_to_string)]
    pub fn to_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_string()?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))
    }

    /// Load from the first existing default location, or use defaults
    pub fn load_or_default() -> Result<Self> {
        for path in Self::search_paths() {
            if path.exists() {
                return Self::from_file(path);
            }
        }

        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn search_paths() -> Vec<PathBuf> {
        vec![
            PathBuf::from("/etc/flowscope/config.toml"),
            PathBuf::from("flowscope.toml"),
        ]
    }

    /// Generate default config file content with comments
    pub fn default_with_comments() -> &'static str {
        DEFAULT_CONFIG
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.conntrack.transport_table_size == 0 {
            return Err(Error::Config("conntrack.transport_table_size must be > 0".into()));
        }
        if let Some((name, _)) = self.conntrack.table_sizes.iter().find(|(_, size)| **size == 0) {
            return Err(Error::Config(format!("conntrack.table_sizes.{} must be > 0", name)));
        }
        if self.imap.max_line_len == 0 {
            return Err(Error::Config("imap.max_line_len must be > 0".into()));
        }
        if self.timers.driver_interval_ms == 0 {
            return Err(Error::Config("timers.driver_interval_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - FLOWSCOPE_LOG_LEVEL
    /// - FLOWSCOPE_TRANSPORT_TABLE_SIZE, FLOWSCOPE_TRANSPORT_TIMEOUT
    /// - FLOWSCOPE_IMAP_MAX_LINE
    /// - FLOWSCOPE_TIMER_INTERVAL_MS
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Same as [`Config::apply_env_overrides`] with a custom variable source
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FLOWSCOPE_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(size) = lookup("FLOWSCOPE_TRANSPORT_TABLE_SIZE").and_then(|v| v.parse().ok()) {
            self.conntrack.transport_table_size = size;
        }
        if let Some(secs) = lookup("FLOWSCOPE_TRANSPORT_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.conntrack.transport_timeout_secs = secs;
        }
        if let Some(len) = lookup("FLOWSCOPE_IMAP_MAX_LINE").and_then(|v| v.parse().ok()) {
            self.imap.max_line_len = len;
        }
        if let Some(ms) = lookup("FLOWSCOPE_TIMER_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.timers.driver_interval_ms = ms;
        }
    }
}

// =============================================================================

/// Connection tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConntrackConfig {
    /// Buckets of the transport (TCP) table
    pub transport_table_size: usize,

    /// Idle time after which a transport flow and everything above it expires
    pub transport_timeout_secs: u64,

    /// Per-protocol bucket count, overriding the protocol's default
    pub table_sizes: HashMap<String, usize>,
}

impl ConntrackConfig {
    pub fn table_size_for(&self, proto: &str) -> Option<usize> {
        self.table_sizes.get(proto).copied()
    }
}

impl Default for ConntrackConfig {
    fn default() -> Self {
        Self {
            transport_table_size: 32768,
            transport_timeout_secs: 600,
            table_sizes: HashMap::new(),
        }
    }
}

/// IMAP analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapConfig {
    /// Undelimited bytes flushed as a line past this length
    pub max_line_len: usize,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            max_line_len: crate::stream::DEFAULT_MAX_LINE,
        }
    }
}

/// Timer driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Tick of the background timer driver
    pub driver_interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            driver_interval_ms: 1000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

const DEFAULT_CONFIG: &str = r#"# flowscope configuration

[conntrack]
# Buckets of the transport (TCP) conntrack table
transport_table_size = 32768
# Seconds of inactivity before a transport flow expires
transport_timeout_secs = 600

# Per-protocol bucket counts
[conntrack.table_sizes]
# imap = 1

[imap]
# Longest line buffered before it is flushed undelimited
max_line_len = 4096

[timers]
# Tick of the background expiry driver
driver_interval_ms = 1000

[logging]
# trace, debug, info, warn, error
level = "info"
"#;
