use super::{Config, ConfigError};
use url::Url;

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = Url::parse(&self.endpoint).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid endpoint URL '{}': {}", self.endpoint, e))
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(format!(
                "Endpoint must use http or https, got '{}'",
                endpoint.scheme()
            )));
        }

        if self.buffer_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "Buffer capacity must be greater than 0".to_string(),
            ));
        }

        if self.sender_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "Sender capacity must be greater than 0".to_string(),
            ));
        }

        if self.storage_capacity_bytes == 0 {
            return Err(ConfigError::InvalidConfig(
                "Storage capacity must be greater than 0".to_string(),
            ));
        }

        for (name, secs) in [
            ("Flush interval", self.flush_interval_secs),
            ("Peek interval", self.peek_interval_secs),
            ("Request timeout", self.request_timeout_secs),
            ("Shutdown timeout", self.shutdown_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.retry_config.base_delay > self.retry_config.max_delay {
            return Err(ConfigError::InvalidConfig(format!(
                "Retry base delay ({:?}) exceeds max delay ({:?})",
                self.retry_config.base_delay, self.retry_config.max_delay
            )));
        }

        Ok(())
    }
}
