//! Artifact transfer layer.
//!
//! Shared rules for which files a job must, may, and must not export, plus
//! the machinery that rehydrates remote job outputs into a local,
//! exporter-friendly layout: one multiplexed SSH master per `(user, host)`
//! pair, `tar`-over-SSH streaming with server-side exclusions, `scp` for
//! required-only pulls, and `aws s3` staging for oversized payloads.

pub mod rules;
pub mod s3;
pub mod ssh;
pub mod transfer;

pub use rules::{is_excluded, EXCLUDE_PATTERNS, REQUIRED_ARTIFACTS};
pub use s3::{dir_size, stage_to_s3, DEFAULT_STAGING_THRESHOLD};
pub use ssh::{SshPool, SshSession};
pub use transfer::{fetch_artifacts, FetchOptions, FetchOutcome};

/// Errors raised by the artifact layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ssh is not available on this host")]
    SshUnavailable,

    #[error("ssh command failed: {0}")]
    SshFailed(String),

    #[error("aws cli is not available on this host")]
    AwsUnavailable,

    #[error("s3 staging failed: {0}")]
    S3Failed(String),

    #[error("job {job_id} is missing required artifact {artifact}")]
    MissingRequired { job_id: String, artifact: String },

    #[error("job {0} has no output directory recorded")]
    NoOutputDir(String),

    #[error("job {0} has no remote host recorded")]
    NoRemoteHost(String),

    #[error("artifact export is not supported for {executor} jobs (job {job_id})")]
    UnsupportedSource {
        job_id: String,
        executor: nel_core::ExecutorKind,
    },
}

/// Result type alias for artifact operations.
pub type Result<T> = std::result::Result<T, Error>;
