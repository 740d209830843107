//! Core error types shared across the launcher.

/// Core error type for configuration and identifier handling.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("MISSING value at path: {path}")]
    MissingValue { path: String },

    #[error("environment variable {name} referenced at {path} is not set")]
    UnresolvedEnv { name: String, path: String },

    #[error("invalid identifier '{value}': {reason}")]
    InvalidIdentifier { value: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Create a new configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
