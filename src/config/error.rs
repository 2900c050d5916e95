use std::fmt;
use std::io;

/// Why a [`RivuletConfig`](super::RivuletConfig) could not be loaded.
#[derive(Debug)]
pub enum ConfigError {
    /// The file at `path` could not be opened or read
    FileReadError { path: String, source: io::Error },
    /// Not TOML, or a key has the wrong shape (e.g. `buffer = 3`)
    ParseError { source: toml::de::Error },
    /// Parsed, but a value would leave a stream unable to make progress
    ValidationError { reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        ConfigError::ValidationError {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileReadError { path, source } => {
                write!(f, "Cannot read rivulet config '{}': {}", path, source)
            }
            ConfigError::ParseError { source } => {
                write!(f, "Malformed rivulet config: {}", source)
            }
            ConfigError::ValidationError { reason } => {
                write!(f, "Invalid rivulet config: {}", reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::FileReadError { source, .. } => Some(source),
            ConfigError::ParseError { source } => Some(source),
            ConfigError::ValidationError { .. } => None,
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(source: toml::de::Error) -> Self {
        ConfigError::ParseError { source }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
