//! Container metadata resolver.
//!
//! Evaluation harnesses ship in OCI images whose `/opt/metadata/framework.yml`
//! declares the tasks they support. Images are tens of gigabytes; this crate
//! fetches that one file without pulling the image. It downloads the image
//! manifest, walks candidate layers in reverse order (newest file wins),
//! streams each small layer's gzipped tar looking for the target path, and
//! caches hits on disk keyed by the manifest digest.

pub mod cache;
pub mod credentials;
pub mod reference;
pub mod registry;
pub mod resolver;

pub use cache::{CacheEntry, CacheStats, MetaCache};
pub use credentials::Credentials;
pub use reference::ImageReference;
pub use registry::{Manifest, RegistryApi, RegistryAuthKind, RegistryHttpClient};
pub use resolver::{
    extract_framework_yml, FoundFile, MetadataResolver, DEFAULT_MAX_LAYER_SIZE,
    FRAMEWORK_FILENAME, FRAMEWORK_PREFIX,
};

/// Errors raised while resolving container metadata.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Credentials were supplied but the registry rejected them.
    #[error("registry authentication failed: {0}")]
    Auth(String),

    /// The manifest is structurally unusable (e.g. no `layers`).
    #[error("manifest error: {0}")]
    Manifest(String),

    /// Registry 5xx or timeout; the caller may retry.
    #[error("transient registry error (status {status}): {message}")]
    Transient { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid image reference '{0}'")]
    InvalidReference(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("matched file is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("home directory could not be determined")]
    NoHome,
}

impl Error {
    /// Whether the caller may usefully retry the failed call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Result type alias for resolver operations.
pub type Result<T> = std::result::Result<T, Error>;
