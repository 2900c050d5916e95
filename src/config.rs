use serde::Deserialize;
use std::{fs, path::Path};

pub mod error;

use error::{ConfigError, ConfigResult};

pub const DEFAULT_MIN_SUBSCRIBERS: usize = 1;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_SINK_BATCH_SIZE: u64 = 32;

/// How a `create` source stores emissions that arrive ahead of demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPolicy {
    /// Keep everything until downstream asks for it.
    #[default]
    Unbounded,
    /// Keep at most N items, evicting the oldest buffered item.
    DropOldest(usize),
    /// Keep at most N items, discarding the incoming item.
    DropLatest(usize),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RivuletConfig {
    #[serde(default)]
    pub create: CreateConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateConfig {
    #[serde(default)]
    pub buffer: BufferPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Subscribers required before the first connection to the source.
    #[serde(default = "default_min_subscribers")]
    pub min_subscribers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Demand issued per batch when forwarding into an async sink.
    #[serde(default = "default_sink_batch_size")]
    pub batch_size: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            min_subscribers: DEFAULT_MIN_SUBSCRIBERS,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_SINK_BATCH_SIZE,
        }
    }
}

impl RivuletConfig {
    pub fn from_toml_str(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.hub.min_subscribers == 0 {
            return Err(ConfigError::invalid("hub.min_subscribers must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts must be at least 1"));
        }
        if self.sink.batch_size == 0 {
            return Err(ConfigError::invalid("sink.batch_size must be at least 1"));
        }
        match self.create.buffer {
            BufferPolicy::DropOldest(0) | BufferPolicy::DropLatest(0) => {
                Err(ConfigError::invalid("create.buffer capacity must be at least 1"))
            }
            _ => Ok(()),
        }
    }
}

fn default_min_subscribers() -> usize {
    DEFAULT_MIN_SUBSCRIBERS
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

fn default_sink_batch_size() -> u64 {
    DEFAULT_SINK_BATCH_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RivuletConfig::default();
        assert_eq!(config.create.buffer, BufferPolicy::Unbounded);
        assert_eq!(config.hub.min_subscribers, DEFAULT_MIN_SUBSCRIBERS);
        assert_eq!(config.retry.max_attempts, DEFAULT_RETRY_ATTEMPTS);
        assert_eq!(config.sink.batch_size, DEFAULT_SINK_BATCH_SIZE);
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
[create]
buffer = { drop_oldest = 64 }

[hub]
min_subscribers = 2

[retry]
max_attempts = 5
"#;
        let config = RivuletConfig::from_toml_str(toml_str).expect("Failed to parse config");
        assert_eq!(config.create.buffer, BufferPolicy::DropOldest(64));
        assert_eq!(config.hub.min_subscribers, 2);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.sink.batch_size, DEFAULT_SINK_BATCH_SIZE);
    }

    #[test]
    fn test_unit_buffer_policy_parses() {
        let config = RivuletConfig::from_toml_str("[create]\nbuffer = \"unbounded\"\n")
            .expect("Failed to parse config");
        assert_eq!(config.create.buffer, BufferPolicy::Unbounded);
    }

    #[test]
    fn test_validation_rejects_zero_subscribers() {
        let err = RivuletConfig::from_toml_str("[hub]\nmin_subscribers = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let err = RivuletConfig::from_toml_str("[create]\nbuffer = { drop_latest = 0 }\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let err = RivuletConfig::from_toml_str("[retry]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = RivuletConfig::from_toml_str("[hub\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = RivuletConfig::load_from_file("missing_rivulet_config_12345.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileReadError { .. }));
    }

    #[test]
    fn test_example_config_parses() {
        let toml_str = include_str!("../rivulet.config.example.toml");
        let config =
            RivuletConfig::from_toml_str(toml_str).expect("Failed to parse example config");
        assert!(config.hub.min_subscribers > 0);
    }
}
