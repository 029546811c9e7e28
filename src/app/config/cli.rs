use super::groups::RetryConfig;
use super::serde_helpers::{
    load_env_flag, load_env_path_opt, load_env_string, load_env_string_opt, load_env_var,
};
use super::{ConfigError, LogFormat, LogLevel};
use crate::channel::{ChannelConfig, DEFAULT_ENDPOINT};
use crate::reliability::StorageConfig;
use crate::sender::{ClientConfig, SenderConfig};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Inline TOML configuration, used as the base layer under CLI flags.
pub const CONFIG_ENV_VAR: &str = "TELEMETRY_CONFIG";

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Ingestion endpoint URL
    #[arg(long, env = "TELEMETRY_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Instrumentation key stamped on items that carry none
    #[arg(long, env = "INSTRUMENTATION_KEY")]
    pub instrumentation_key: Option<String>,

    /// Send every item immediately as its own transmission
    #[arg(long, env = "TELEMETRY_DEVELOPER_MODE")]
    pub developer_mode: bool,

    /// Number of buffered items that triggers a flush
    #[arg(long, env = "TELEMETRY_BUFFER_CAPACITY", default_value = "500")]
    pub buffer_capacity: usize,

    /// Maximum concurrent transmissions
    #[arg(long, env = "TELEMETRY_SENDER_CAPACITY", default_value = "10")]
    pub sender_capacity: usize,

    /// Directory for transmissions awaiting retry
    #[arg(long, env = "TELEMETRY_STORAGE_PATH")]
    pub storage_path: Option<PathBuf>,

    /// Maximum bytes kept in the storage directory
    #[arg(long, env = "TELEMETRY_STORAGE_CAPACITY_BYTES", default_value = "52428800")]
    pub storage_capacity_bytes: u64,

    /// Stored transmissions older than this are discarded (0 keeps them forever)
    #[arg(long, env = "TELEMETRY_STORAGE_MAX_AGE_HOURS", default_value = "48")]
    pub storage_max_age_hours: u64,

    /// Flush interval in seconds
    #[arg(long, env = "TELEMETRY_FLUSH_INTERVAL_SECS", default_value = "30")]
    pub flush_interval_secs: u64,

    /// Interval between storage retry passes in seconds
    #[arg(long, env = "TELEMETRY_PEEK_INTERVAL_SECS", default_value = "5")]
    pub peek_interval_secs: u64,

    /// Per-request timeout in seconds
    #[arg(long, env = "TELEMETRY_REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    /// Upper bound on the final flush at shutdown in seconds
    #[arg(long, env = "TELEMETRY_SHUTDOWN_TIMEOUT_SECS", default_value = "5")]
    pub shutdown_timeout_secs: u64,

    /// Send payloads without gzip
    #[arg(long, env = "TELEMETRY_DISABLE_COMPRESSION")]
    pub disable_compression: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", default_value = "compact")]
    pub log_format: LogFormat,

    /// TOML configuration file
    #[arg(long, env = "TELEMETRY_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Derived fields (not CLI arguments)
    #[serde(skip)]
    #[arg(skip)]
    pub flush_interval: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub peek_interval: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub request_timeout: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub shutdown_timeout: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub storage_max_age: Option<Duration>,

    /// Backoff of the storage peeker (file / TELEMETRY_CONFIG only)
    #[serde(rename = "retry")]
    #[arg(skip)]
    pub retry_config: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            instrumentation_key: None,
            developer_mode: false,
            buffer_capacity: 500,
            sender_capacity: 10,
            storage_path: None,
            storage_capacity_bytes: 50 * 1024 * 1024,
            storage_max_age_hours: 48,
            flush_interval_secs: 30,
            peek_interval_secs: 5,
            request_timeout_secs: 30,
            shutdown_timeout_secs: 5,
            disable_compression: false,
            log_level: LogLevel::Info,
            log_format: LogFormat::Compact,
            config_file: None,
            flush_interval: Duration::from_secs(30),
            peek_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            storage_max_age: Some(Duration::from_secs(48 * 3600)),
            retry_config: RetryConfig::default(),
        }
    }
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::parse_from(args);
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(inline) = std::env::var(CONFIG_ENV_VAR) {
            return Self::from_toml_str(&inline);
        }

        let mut config = Config::default();

        load_env_string("TELEMETRY_ENDPOINT", &mut config.endpoint);
        load_env_string_opt("INSTRUMENTATION_KEY", &mut config.instrumentation_key);
        load_env_flag("TELEMETRY_DEVELOPER_MODE", &mut config.developer_mode)?;
        load_env_var("TELEMETRY_BUFFER_CAPACITY", &mut config.buffer_capacity)?;
        load_env_var("TELEMETRY_SENDER_CAPACITY", &mut config.sender_capacity)?;
        load_env_path_opt("TELEMETRY_STORAGE_PATH", &mut config.storage_path);
        load_env_var(
            "TELEMETRY_STORAGE_CAPACITY_BYTES",
            &mut config.storage_capacity_bytes,
        )?;
        load_env_var(
            "TELEMETRY_STORAGE_MAX_AGE_HOURS",
            &mut config.storage_max_age_hours,
        )?;
        load_env_var("TELEMETRY_FLUSH_INTERVAL_SECS", &mut config.flush_interval_secs)?;
        load_env_var("TELEMETRY_PEEK_INTERVAL_SECS", &mut config.peek_interval_secs)?;
        load_env_var(
            "TELEMETRY_REQUEST_TIMEOUT_SECS",
            &mut config.request_timeout_secs,
        )?;
        load_env_var(
            "TELEMETRY_SHUTDOWN_TIMEOUT_SECS",
            &mut config.shutdown_timeout_secs,
        )?;
        load_env_flag(
            "TELEMETRY_DISABLE_COMPRESSION",
            &mut config.disable_compression,
        )?;
        load_env_var("LOG_LEVEL", &mut config.log_level)?;
        load_env_var("LOG_FORMAT", &mut config.log_format)?;
        load_env_path_opt("TELEMETRY_CONFIG_FILE", &mut config.config_file);

        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    /// CLI flags (and their env fallbacks) over a TOML base taken from
    /// `--config-file` or `TELEMETRY_CONFIG`. A flag left at its default does
    /// not override the base.
    pub fn from_args_and_env<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::parse_from(args);

        let base = if let Some(path) = &config.config_file {
            Some(Self::parse_toml(&std::fs::read_to_string(path)?)?)
        } else if let Ok(inline) = std::env::var(CONFIG_ENV_VAR) {
            Some(Self::parse_toml(&inline)?)
        } else {
            None
        };

        if let Some(base) = base {
            config.inherit(base);
        }

        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::parse_toml(content)?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    fn inherit(&mut self, base: Config) {
        let defaults = Config::default();

        macro_rules! inherit {
            ($($field:ident),+ $(,)?) => {
                $(
                    if self.$field == defaults.$field {
                        self.$field = base.$field;
                    }
                )+
            };
        }

        inherit!(
            endpoint,
            instrumentation_key,
            developer_mode,
            buffer_capacity,
            sender_capacity,
            storage_path,
            storage_capacity_bytes,
            storage_max_age_hours,
            flush_interval_secs,
            peek_interval_secs,
            request_timeout_secs,
            shutdown_timeout_secs,
            disable_compression,
            log_level,
            log_format,
        );
        self.retry_config = base.retry_config;
    }

    pub fn post_process(&mut self) -> Result<(), ConfigError> {
        self.flush_interval = Duration::from_secs(self.flush_interval_secs);
        self.peek_interval = Duration::from_secs(self.peek_interval_secs);
        self.request_timeout = Duration::from_secs(self.request_timeout_secs);
        self.shutdown_timeout = Duration::from_secs(self.shutdown_timeout_secs);
        self.storage_max_age = (self.storage_max_age_hours > 0)
            .then(|| Duration::from_secs(self.storage_max_age_hours.saturating_mul(3600)));

        if let Some(key) = &self.instrumentation_key
            && key.trim().is_empty()
        {
            self.instrumentation_key = None;
        }

        Ok(())
    }

    /// Translates the validated settings into a [`ChannelConfig`].
    pub fn channel_config(&self) -> Result<ChannelConfig, ConfigError> {
        let endpoint = Url::parse(&self.endpoint).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid endpoint URL '{}': {e}", self.endpoint))
        })?;

        let mut storage = StorageConfig {
            capacity_bytes: self.storage_capacity_bytes,
            max_age: self.storage_max_age,
            ..StorageConfig::default()
        };
        if let Some(path) = &self.storage_path {
            storage.storage_path = path.clone();
        }

        Ok(ChannelConfig {
            developer_mode: self.developer_mode,
            buffer_capacity: self.buffer_capacity,
            flush_interval: self.flush_interval,
            compression: !self.disable_compression,
            shutdown_timeout: self.shutdown_timeout,
            peek_interval: self.peek_interval,
            sender: SenderConfig {
                capacity: self.sender_capacity,
                request_timeout: self.request_timeout,
            },
            storage,
            client: ClientConfig {
                timeout: self.request_timeout,
                max_connections: self.sender_capacity,
                ..ClientConfig::default()
            },
            backoff: self.retry_config.policy(),
            ..ChannelConfig::new(endpoint)
        })
    }
}
