//! Configuration system for Sentinel.
//!
//! Configuration is loaded from multiple sources with the following precedence:
//! 1. Environment variables (highest priority)
//! 2. `sentinel.toml` file
//! 3. Default values (lowest priority)
//!
//! # Environment Variables
//!
//! - `SENTINEL_AUTHORITY_URL` - Base URL of the license authority
//! - `SENTINEL_AUTHORITY_TIMEOUT_SECS` - Timeout for one authority round trip
//! - `SENTINEL_CLOCK_TOLERANCE_SECS` - Backward clock movement tolerated before tamper is suspected
//! - `SENTINEL_STORAGE_DIR` - Directory for cached verdicts and clock state
//! - `SENTINEL_LOGGING_ENABLED` - Enable the tracing subscriber
//! - `SENTINEL_LOG_LEVEL` - Log level (trace, debug, info, warn, error)

use config::Config;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use crate::errors::{LicenseError, LicenseResult};

/// Global configuration singleton.
static CONFIG: OnceLock<SentinelConfig> = OnceLock::new();

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// License authority used for online validation
    pub authority: AuthorityConfig,
    /// Trust clock tuning
    pub clock: ClockConfig,
    /// Local storage of cached state
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// License authority configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Base URL of the authority
    pub url: String,
    /// Upper bound for one online validation round trip, in seconds
    pub timeout_secs: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            url: "https://license.example.com".to_string(),
            timeout_secs: 10,
        }
    }
}

impl AuthorityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Backward movement (seconds) absorbed without suspecting tamper
    pub rollback_tolerance_secs: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            rollback_tolerance_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage directory; empty means the platform data directory
    pub dir: String,
}

impl StorageConfig {
    /// Resolve the storage directory.
    ///
    /// Returns platform-specific paths when no directory is configured:
    /// - Windows: `%APPDATA%\sentinel\`
    /// - macOS: `~/Library/Application Support/sentinel/`
    /// - Linux: `~/.local/share/sentinel/`
    pub fn resolve_dir(&self) -> Option<PathBuf> {
        if self.dir.is_empty() {
            dirs::data_dir().map(|p| p.join("sentinel"))
        } else {
            Some(PathBuf::from(&self.dir))
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Enable logging
    pub enabled: bool,
    /// Log level: trace, debug, info, warn, error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "info".to_string(),
        }
    }
}

impl SentinelConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. `sentinel.toml` file (optional)
    /// 3. Environment variables
    fn load() -> LicenseResult<Self> {
        let builder = Config::builder()
            // Start with defaults
            .set_default("authority.url", "https://license.example.com")
            .map_err(|e| LicenseError::ConfigError(e.to_string()))?
            .set_default("authority.timeout_secs", 10)
            .map_err(|e| LicenseError::ConfigError(e.to_string()))?
            .set_default("clock.rollback_tolerance_secs", 60)
            .map_err(|e| LicenseError::ConfigError(e.to_string()))?
            .set_default("storage.dir", "")
            .map_err(|e| LicenseError::ConfigError(e.to_string()))?
            .set_default("logging.enabled", false)
            .map_err(|e| LicenseError::ConfigError(e.to_string()))?
            .set_default("logging.level", "info")
            .map_err(|e| LicenseError::ConfigError(e.to_string()))?
            // Load from sentinel.toml (optional)
            .add_source(config::File::with_name("sentinel").required(false))
            // Override with environment variables
            .set_override_option("authority.url", env::var("SENTINEL_AUTHORITY_URL").ok())
            .map_err(|e| LicenseError::ConfigError(e.to_string()))?
            .set_override_option(
                "authority.timeout_secs",
                env::var("SENTINEL_AUTHORITY_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .map_err(|e| LicenseError::ConfigError(e.to_string()))?
            .set_override_option(
                "clock.rollback_tolerance_secs",
                env::var("SENTINEL_CLOCK_TOLERANCE_SECS")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok()),
            )
            .map_err(|e| LicenseError::ConfigError(e.to_string()))?
            .set_override_option("storage.dir", env::var("SENTINEL_STORAGE_DIR").ok())
            .map_err(|e| LicenseError::ConfigError(e.to_string()))?
            .set_override_option(
                "logging.enabled",
                env::var("SENTINEL_LOGGING_ENABLED")
                    .ok()
                    .and_then(|v| v.parse::<bool>().ok()),
            )
            .map_err(|e| LicenseError::ConfigError(e.to_string()))?
            .set_override_option("logging.level", env::var("SENTINEL_LOG_LEVEL").ok())
            .map_err(|e| LicenseError::ConfigError(e.to_string()))?;

        let settings = builder
            .build()
            .map_err(|e| LicenseError::ConfigError(format!("failed to build config: {e}")))?;

        settings
            .try_deserialize()
            .map_err(|e| LicenseError::ConfigError(format!("failed to deserialize config: {e}")))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> LicenseResult<()> {
        let url = self.authority.url.as_str();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(LicenseError::ConfigError(format!(
                "authority.url must be an http(s) URL, got '{url}'"
            )));
        }

        if self.authority.timeout_secs == 0 {
            return Err(LicenseError::ConfigError(
                "authority.timeout_secs must be greater than 0".to_string(),
            ));
        }

        // Validate log level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(LicenseError::ConfigError(format!(
                    "logging.level must be one of: trace, debug, info, warn, error. Got '{other}'"
                )));
            }
        }

        Ok(())
    }
}

/// Get the global configuration.
///
/// This loads the configuration on first access and caches it.
/// Returns an error if configuration loading or validation fails.
pub fn get_config() -> LicenseResult<&'static SentinelConfig> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }

    let config = SentinelConfig::load()?;
    config.validate()?;

    // Another thread may have won the race; either value is equivalent.
    Ok(CONFIG.get_or_init(|| config))
}

/// Initialize configuration explicitly.
///
/// Call this early in your application to catch configuration errors.
pub fn init_config() -> LicenseResult<&'static SentinelConfig> {
    get_config()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SentinelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.authority.timeout(), Duration::from_secs(10));
        assert_eq!(config.clock.rollback_tolerance_secs, 60);
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut config = SentinelConfig::default();
        config.authority.timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(LicenseError::ConfigError(_))
        ));
    }

    #[test]
    fn rejects_non_http_authority() {
        let mut config = SentinelConfig::default();
        config.authority.url = "ftp://license.example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = SentinelConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_storage_dir_wins() {
        let storage = StorageConfig {
            dir: "/tmp/sentinel-test".to_string(),
        };
        assert_eq!(
            storage.resolve_dir(),
            Some(PathBuf::from("/tmp/sentinel-test"))
        );
    }
}
