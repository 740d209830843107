//! Exporters.
//!
//! Only the `local` sink is implemented: it rehydrates job artifacts into a
//! directory tree (staging to S3 when the payload is oversized and a bucket
//! is configured). The hosted sinks the configuration schema names are
//! rejected with a clear error until they exist.

use crate::{Error, Result};
use nel_artifacts::{fetch_artifacts, FetchOptions, DEFAULT_STAGING_THRESHOLD};
use nel_db::JobRecord;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

/// Default export root when the options carry no `output_dir`.
const DEFAULT_EXPORT_DIR: &str = "./nel-export";

/// One row of an `export` result.
#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub job_id: String,
    pub dest: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Local directory (or S3 URL) the artifacts landed in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

pub(crate) fn export(
    dest: &str,
    records: &[JobRecord],
    options: &serde_json::Map<String, serde_json::Value>,
) -> Result<Vec<ExportResult>> {
    match dest {
        "local" => export_local(records, options),
        // mlflow, wandb, gsheets: accepted by the schema, not shipped yet.
        _ => Err(Error::UnsupportedExporter(dest.to_string())),
    }
}

fn export_local(
    records: &[JobRecord],
    options: &serde_json::Map<String, serde_json::Value>,
) -> Result<Vec<ExportResult>> {
    let export_dir = options
        .get("output_dir")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_EXPORT_DIR));
    let fetch_options = FetchOptions {
        only_required: options
            .get("only_required")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    };
    std::fs::create_dir_all(&export_dir)
        .map_err(|e| nel_executors::Error::from(nel_artifacts::Error::from(e)))?;

    let outcome = fetch_artifacts(records, &export_dir, fetch_options)
        .map_err(nel_executors::Error::from)?;

    let s3_bucket = options.get("s3_bucket").and_then(|v| v.as_str());
    let mut results = Vec::with_capacity(records.len());
    for record in records {
        match outcome.dirs.get(&record.job_id) {
            Some(dir) => {
                let location = match s3_bucket {
                    Some(bucket) if oversized(dir) => {
                        let prefix = format!(
                            "{}/{}",
                            options
                                .get("s3_prefix")
                                .and_then(|v| v.as_str())
                                .unwrap_or("nel-export"),
                            record.job_id
                        );
                        match nel_artifacts::stage_to_s3(dir, bucket, &prefix) {
                            Ok(url) => url,
                            Err(e) => {
                                results.push(ExportResult {
                                    job_id: record.job_id.clone(),
                                    dest: "local".to_string(),
                                    success: false,
                                    message: Some(e.to_string()),
                                    location: Some(dir.display().to_string()),
                                });
                                continue;
                            }
                        }
                    }
                    _ => dir.display().to_string(),
                };
                results.push(ExportResult {
                    job_id: record.job_id.clone(),
                    dest: "local".to_string(),
                    success: true,
                    message: None,
                    location: Some(location),
                });
            }
            None => {
                let message = outcome
                    .errors
                    .get(&record.job_id)
                    .cloned()
                    .unwrap_or_else(|| "artifact fetch failed".to_string());
                results.push(ExportResult {
                    job_id: record.job_id.clone(),
                    dest: "local".to_string(),
                    success: false,
                    message: Some(message),
                    location: None,
                });
            }
        }
    }
    info!(
        dir = %export_dir.display(),
        exported = results.iter().filter(|r| r.success).count(),
        failed = results.iter().filter(|r| !r.success).count(),
        "local export finished"
    );
    Ok(results)
}

fn oversized(dir: &std::path::Path) -> bool {
    nel_artifacts::dir_size(dir)
        .map(|size| size >= DEFAULT_STAGING_THRESHOLD)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nel_core::{ExecutorKind, InvocationId};
    use nel_artifacts::REQUIRED_ARTIFACTS;
    use serde_json::json;
    use std::path::Path;

    fn local_job(output_dir: &Path) -> JobRecord {
        let inv = InvocationId::generate();
        let mut job = JobRecord::new(&inv.job(0), ExecutorKind::Local, json!({}));
        job.set_data("output_dir", output_dir.display().to_string());
        job
    }

    fn write_required(dir: &Path) {
        let artifacts = dir.join("artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();
        for name in REQUIRED_ARTIFACTS {
            std::fs::write(artifacts.join(name), "{}").unwrap();
        }
    }

    #[test]
    fn test_local_export_reports_per_job() {
        let complete = tempfile::tempdir().unwrap();
        write_required(complete.path());
        let incomplete = tempfile::tempdir().unwrap();

        let good = local_job(complete.path());
        let bad = local_job(incomplete.path());
        let export_dir = tempfile::tempdir().unwrap();
        let mut options = serde_json::Map::new();
        options.insert(
            "output_dir".to_string(),
            export_dir.path().display().to_string().into(),
        );

        let results = export("local", &[good.clone(), bad.clone()], &options).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert_eq!(
            results[0].location.as_deref(),
            Some(complete.path().display().to_string().as_str())
        );
        assert!(!results[1].success);
    }

    #[test]
    fn test_lepton_export_reports_unsupported_per_job() {
        let inv = InvocationId::generate();
        let mut job = JobRecord::new(&inv.job(0), ExecutorKind::Lepton, json!({}));
        job.set_data("lepton_job_id", "lj-1");
        let export_dir = tempfile::tempdir().unwrap();
        let mut options = serde_json::Map::new();
        options.insert(
            "output_dir".to_string(),
            export_dir.path().display().to_string().into(),
        );

        let results = export("local", &[job], &options).unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert!(results[0]
            .message
            .as_deref()
            .unwrap()
            .contains("not supported for lepton"));
    }

    #[test]
    fn test_unknown_sinks_are_rejected() {
        assert!(matches!(
            export("wandb", &[], &serde_json::Map::new()),
            Err(Error::UnsupportedExporter(_))
        ));
        assert!(matches!(
            export("carrier-pigeon", &[], &serde_json::Map::new()),
            Err(Error::UnsupportedExporter(_))
        ));
    }
}
