//! Configuration module for car-lookup-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the lookup server
#[derive(Parser, Debug)]
#[command(name = "car-lookup-server")]
#[command(author = "car-lookup-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-protocol server answering car lookups after a simulated delay", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of concurrent sessions the worker pool can run
    #[arg(short = 'w', long)]
    pub pool_size: Option<usize>,

    /// Per-connection read timeout in seconds
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Seconds to wait for in-flight sessions on shutdown
    #[arg(long)]
    pub shutdown_grace: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Worker pool capacity
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    /// Shutdown grace period in seconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            pool_size: default_pool_size(),
            read_timeout: default_read_timeout(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

/// Registry seed data
#[derive(Debug, Deserialize)]
pub struct RegistryConfig {
    /// Message returned for unknown keys
    #[serde(default = "default_not_found")]
    pub not_found: String,
    /// Key/value pairs loaded at startup
    #[serde(default = "default_entries")]
    pub entries: Vec<RegistryEntry>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            not_found: default_not_found(),
            entries: default_entries(),
        }
    }
}

/// A single registry entry
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RegistryEntry {
    pub key: u64,
    pub value: String,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_pool_size() -> usize {
    10
}

fn default_read_timeout() -> u64 {
    20
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_not_found() -> String {
    "No car registered under this number".to_string()
}

fn default_entries() -> Vec<RegistryEntry> {
    [
        (1000, "BMW"),
        (2000, "Honda"),
        (3000, "Dodge"),
        (4000, "Lada"),
        (5000, "Rover"),
    ]
    .into_iter()
    .map(|(key, value)| RegistryEntry {
        key,
        value: value.to_string(),
    })
    .collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub pool_size: NonZeroUsize,
    pub read_timeout: Duration,
    pub shutdown_grace: Duration,
    pub not_found: String,
    pub entries: Vec<RegistryEntry>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve configuration from already parsed CLI args.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            pool_size: validate_pool_size(cli.pool_size.unwrap_or(toml_config.server.pool_size))?,
            read_timeout: Duration::from_secs(
                cli.read_timeout.unwrap_or(toml_config.server.read_timeout),
            ),
            shutdown_grace: Duration::from_secs(
                cli.shutdown_grace
                    .unwrap_or(toml_config.server.shutdown_grace),
            ),
            not_found: toml_config.registry.not_found,
            entries: toml_config.registry.entries,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.read_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "read_timeout must be positive".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(self.entries.len());
        for entry in &self.entries {
            if !seen.insert(entry.key) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate registry key {}",
                    entry.key
                )));
            }
        }
        Ok(())
    }

    /// Listen address for display; IPv6 literals are bracketed.
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Pool size must be positive and fit in a tokio semaphore.
fn validate_pool_size(pool_size: usize) -> Result<NonZeroUsize, ConfigError> {
    let pool_size = NonZeroUsize::new(pool_size)
        .ok_or_else(|| ConfigError::Invalid("pool_size must be positive".to_string()))?;
    if pool_size.get() > tokio::sync::Semaphore::MAX_PERMITS {
        return Err(ConfigError::Invalid(format!(
            "pool_size must not exceed {}",
            tokio::sync::Semaphore::MAX_PERMITS
        )));
    }
    Ok(pool_size)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["car-lookup-server"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.pool_size, 10);
        assert_eq!(config.server.read_timeout, 20);
        assert_eq!(config.registry.entries.len(), 5);
        assert_eq!(config.registry.entries[0].value, "BMW");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            pool_size = 4
            read_timeout = 5

            [registry]
            not_found = "unknown"

            [[registry.entries]]
            key = 7000
            value = "Volvo"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.pool_size, 4);
        assert_eq!(config.server.read_timeout, 5);
        assert_eq!(config.server.shutdown_grace, 30);
        assert_eq!(config.registry.not_found, "unknown");
        assert_eq!(
            config.registry.entries,
            vec![RegistryEntry {
                key: 7000,
                value: "Volvo".to_string()
            }]
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            pool_size = 4
        "#,
        )
        .unwrap();

        let config = Config::merge(cli(&["-p", "7070", "--read-timeout", "3"]), toml_config).unwrap();
        assert_eq!(config.port, 7070);
        assert_eq!(config.pool_size.get(), 4);
        assert_eq!(config.read_timeout, Duration::from_secs(3));
        assert_eq!(config.listen_addr(), "0.0.0.0:7070");
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let err = Config::merge(cli(&["-w", "0"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_oversized_pool_size_rejected() {
        let huge = usize::MAX.to_string();
        let err = Config::merge(cli(&["-w", &huge]), TomlConfig::default()).unwrap_err();
        assert!(err.to_string().contains("pool_size must not exceed"));

        let limit = tokio::sync::Semaphore::MAX_PERMITS.to_string();
        let config = Config::merge(cli(&["-w", &limit]), TomlConfig::default()).unwrap();
        assert_eq!(config.pool_size.get(), tokio::sync::Semaphore::MAX_PERMITS);
    }

    #[test]
    fn test_ipv6_listen_addr_is_bracketed() {
        let config = Config::merge(cli(&["--host", "::1", "-p", "9000"]), TomlConfig::default()).unwrap();
        assert_eq!(config.listen_addr(), "[::1]:9000");
    }

    #[test]
    fn test_zero_read_timeout_rejected() {
        let err = Config::merge(cli(&["--read-timeout", "0"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_duplicate_registry_key_rejected() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [[registry.entries]]
            key = 1000
            value = "BMW"

            [[registry.entries]]
            key = 1000
            value = "Audi"
        "#,
        )
        .unwrap();

        let err = Config::merge(cli(&[]), toml_config).unwrap_err();
        assert!(err.to_string().contains("duplicate registry key 1000"));
    }

    #[test]
    fn test_missing_config_file() {
        let err = Config::from_args(cli(&["-c", "/nonexistent/car-lookup.toml"])).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(_, _)));
    }
}
