//! Rehydration of job outputs into a local, exporter-friendly layout.

use crate::rules::{tar_exclude_args, REQUIRED_ARTIFACTS};
use crate::ssh::SshPool;
use crate::{Error, Result};
use nel_core::ExecutorKind;
use nel_db::JobRecord;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Options for one fetch operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Pull only the required artifact files instead of the full output tree.
    pub only_required: bool,
}

/// Result of rehydrating a job set. Failures are per-job, never batch-fatal.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// `job_id` -> local directory holding the job's artifacts.
    pub dirs: HashMap<String, PathBuf>,
    /// Jobs whose artifacts could not be (fully) retrieved.
    pub failed_jobs: Vec<String>,
    /// `job_id` -> failure message, one per entry of `failed_jobs`.
    pub errors: HashMap<String, String>,
}

/// Produce a local directory per job under `export_dir` containing at least
/// the required artifacts. Local jobs pass through unchanged; remote jobs are
/// pulled over one multiplexed SSH connection per `(user, host)` pair.
pub fn fetch_artifacts(
    jobs: &[JobRecord],
    export_dir: &Path,
    options: FetchOptions,
) -> Result<FetchOutcome> {
    let mut outcome = FetchOutcome::default();
    let mut pool = SshPool::new();

    for job in jobs {
        match fetch_one(job, export_dir, options, &mut pool) {
            Ok(dir) => {
                outcome.dirs.insert(job.job_id.clone(), dir);
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "artifact fetch failed");
                outcome.failed_jobs.push(job.job_id.clone());
                outcome.errors.insert(job.job_id.clone(), e.to_string());
            }
        }
    }

    pool.close_all();
    Ok(outcome)
}

fn fetch_one(
    job: &JobRecord,
    export_dir: &Path,
    options: FetchOptions,
    pool: &mut SshPool,
) -> Result<PathBuf> {
    match job.executor {
        ExecutorKind::Local => {
            let output_dir = PathBuf::from(
                job.data_str("output_dir").ok_or_else(|| Error::NoOutputDir(job.job_id.clone()))?,
            );
            verify_required(&job.job_id, &output_dir)?;
            Ok(output_dir)
        }
        // Lepton job output lives in platform-managed storage; there is no
        // SSH path to it and the client exposes no download API yet.
        ExecutorKind::Lepton => Err(Error::UnsupportedSource {
            job_id: job.job_id.clone(),
            executor: job.executor,
        }),
        ExecutorKind::Slurm => {
            let remote_dir = job
                .data_str("remote_output_dir")
                .ok_or_else(|| Error::NoOutputDir(job.job_id.clone()))?
                .to_string();
            let user = job
                .data_str("username")
                .ok_or_else(|| Error::NoRemoteHost(job.job_id.clone()))?
                .to_string();
            let host = job
                .data_str("hostname")
                .ok_or_else(|| Error::NoRemoteHost(job.job_id.clone()))?
                .to_string();
            let session = pool.get_or_open(&user, &host)?;

            let dest = export_dir.join(&job.job_id);
            if options.only_required {
                let artifacts_dir = dest.join("artifacts");
                std::fs::create_dir_all(&artifacts_dir)?;
                for name in REQUIRED_ARTIFACTS {
                    let remote = format!("{}/artifacts/{}", remote_dir.trim_end_matches('/'), name);
                    session.scp_from(&remote, &artifacts_dir.join(name)).map_err(|_| {
                        Error::MissingRequired {
                            job_id: job.job_id.clone(),
                            artifact: name.to_string(),
                        }
                    })?;
                }
            } else {
                session.stream_tar(&remote_dir, &tar_exclude_args(), &dest)?;
                verify_required(&job.job_id, &dest)?;
            }
            info!(job_id = %job.job_id, dest = %dest.display(), "rehydrated artifacts");
            Ok(dest)
        }
    }
}

/// Every required artifact must exist under `<dir>/artifacts/`.
fn verify_required(job_id: &str, dir: &Path) -> Result<()> {
    for name in REQUIRED_ARTIFACTS {
        let path = dir.join("artifacts").join(name);
        if !path.is_file() {
            return Err(Error::MissingRequired {
                job_id: job_id.to_string(),
                artifact: name.to_string(),
            });
        }
    }
    Ok(())
}
