//! Job record model.

use nel_core::{ExecutorKind, JobId};
use serde::{Deserialize, Serialize};

/// One (task x execution) unit as persisted in the database.
///
/// `invocation_id`, `job_id`, `executor`, and `config` are immutable once
/// written; `data` is the backend-owned mutable mapping (output paths, remote
/// paths, external ids, last-known status).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub invocation_id: String,
    pub job_id: String,
    /// Seconds since epoch, created-at.
    pub timestamp: i64,
    pub executor: ExecutorKind,
    /// The full frozen configuration that produced this job.
    pub config: serde_json::Value,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl JobRecord {
    /// Create a record for the given job at the current time.
    pub fn new(job_id: &JobId, executor: ExecutorKind, config: serde_json::Value) -> Self {
        Self {
            invocation_id: job_id.invocation.to_string(),
            job_id: job_id.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            executor,
            config,
            data: serde_json::Map::new(),
        }
    }

    /// Zero-based task index (the `job_id` suffix).
    pub fn task_index(&self) -> usize {
        self.job_id
            .rsplit_once('.')
            .and_then(|(_, idx)| idx.parse().ok())
            .unwrap_or(0)
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn data_bool(&self, key: &str) -> bool {
        self.data.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn data_i64(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(|v| v.as_i64())
    }

    /// Set one backend-owned data field.
    pub fn set_data(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.data.insert(key.to_string(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nel_core::InvocationId;

    #[test]
    fn test_record_identity_invariants() {
        let inv = InvocationId::parse("00112233445566aa").unwrap();
        let record = JobRecord::new(&inv.job(2), ExecutorKind::Local, serde_json::json!({}));
        assert_eq!(record.invocation_id, "00112233445566aa");
        assert_eq!(record.job_id, "00112233445566aa.2");
        assert_eq!(record.task_index(), 2);
        assert_eq!(record.job_id.split('.').next().unwrap(), record.invocation_id);
    }

    #[test]
    fn test_data_accessors() {
        let inv = InvocationId::generate();
        let mut record = JobRecord::new(&inv.job(0), ExecutorKind::Slurm, serde_json::json!({}));
        record.set_data("killed", true);
        record.set_data("slurm_job_id", "1001");
        record.set_data("pgid", 4242);
        assert!(record.data_bool("killed"));
        assert_eq!(record.data_str("slurm_job_id"), Some("1001"));
        assert_eq!(record.data_i64("pgid"), Some(4242));
        assert!(!record.data_bool("absent"));
    }
}
