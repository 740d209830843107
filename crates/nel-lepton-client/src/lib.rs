//! REST client for the Lepton managed platform.
//!
//! Two object types matter to the launcher: endpoints (long-lived model
//! servers) and jobs (one-shot eval runs that call an endpoint). The client
//! is trait-backed so the executor can be tested against the in-tree
//! [`mock::MockLeptonClient`].

pub mod client;
pub mod mock;
pub mod models;

pub use client::LeptonClient;
pub use models::{EndpointSpec, EndpointState, EndpointStatus, JobSpec, JobState, JobStatus};

use async_trait::async_trait;

/// Errors raised by the Lepton client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("platform returned error status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("endpoint {0} not found")]
    EndpointNotFound(String),

    #[error("job {0} not found")]
    JobNotFound(String),
}

/// Result type alias for Lepton operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Capability set the executor needs from the platform.
#[async_trait]
pub trait LeptonApi: Send + Sync {
    async fn create_endpoint(&self, spec: &EndpointSpec) -> Result<EndpointStatus>;
    async fn get_endpoint(&self, name: &str) -> Result<EndpointStatus>;
    async fn delete_endpoint(&self, name: &str) -> Result<()>;

    /// Submit a job; returns the platform-assigned external job id.
    async fn create_job(&self, spec: &JobSpec) -> Result<String>;
    async fn get_job(&self, external_id: &str) -> Result<JobStatus>;
    async fn delete_job(&self, external_id: &str) -> Result<()>;
}
