//! S3 staging for oversized payloads.
//!
//! Exports that exceed the staging threshold are uploaded to an object-store
//! prefix with the `aws` CLI instead of being shipped inline to a sink.

use crate::{Error, Result};
use std::path::Path;
use std::process::Command;
use tracing::info;

/// Payloads at or above this size (bytes) are staged instead of copied.
pub const DEFAULT_STAGING_THRESHOLD: u64 = 512 * 1024 * 1024;

/// Recursive size of a directory tree.
pub fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        let metadata = dirent.metadata()?;
        if metadata.is_dir() {
            total += dir_size(&dirent.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

/// Upload `dir` under `s3://<bucket>/<prefix>/`, returning the object URL.
pub fn stage_to_s3(dir: &Path, bucket: &str, prefix: &str) -> Result<String> {
    let url = format!("s3://{}/{}/", bucket, prefix.trim_matches('/'));
    let output = Command::new("aws")
        .args(["s3", "cp", "--recursive"])
        .arg(dir)
        .arg(&url)
        .output()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::AwsUnavailable
            } else {
                Error::Io(e)
            }
        })?;
    if !output.status.success() {
        return Err(Error::S3Failed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    info!(dir = %dir.display(), url = %url, "staged oversized payload");
    Ok(url)
}
