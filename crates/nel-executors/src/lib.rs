//! Execution backends.
//!
//! One [`Executor`] implementation per backend: [`local::LocalExecutor`]
//! drives detached docker runs on this machine, [`slurm::SlurmExecutor`]
//! submits sbatch chains over SSH, and [`lepton::LeptonExecutor`] talks to
//! the managed platform. The API facade owns the database; executors only
//! produce and annotate job records.

pub mod lepton;
pub mod local;
pub mod slurm;

pub use lepton::LeptonExecutor;
pub use local::LocalExecutor;
pub use slurm::SlurmExecutor;

use async_trait::async_trait;
use nel_core::{ExecutionState, ExecutorKind, InvocationId, RunConfig};
use nel_db::JobRecord;
use nel_task_registry::TaskDefinition;
use std::collections::BTreeMap;

/// Errors raised by execution backends.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] nel_core::Error),

    #[error(transparent)]
    Ssh(#[from] nel_artifacts::Error),

    #[error(transparent)]
    Lepton(#[from] nel_lepton_client::Error),

    #[error("{field} is required for the {executor} executor")]
    MissingField {
        executor: ExecutorKind,
        field: &'static str,
    },

    #[error("required environment variable {0} is not set")]
    MissingEnv(String),

    #[error("the {executor} executor does not support {operation}")]
    NotSupported {
        executor: ExecutorKind,
        operation: &'static str,
    },

    #[error("job submission failed: {0}")]
    Submit(String),

    #[error("endpoint {endpoint} was not ready after {seconds}s")]
    ReadinessTimeout { endpoint: String, seconds: u64 },

    #[error("kill failed for {job_id}: {message}")]
    Kill { job_id: String, message: String },
}

/// Result type alias for executor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// One task of an invocation with its registry definition attached.
#[derive(Debug, Clone)]
pub struct ResolvedTask {
    /// Task name as written in the configuration.
    pub spec_name: String,
    pub definition: TaskDefinition,
    /// Per-task harness overrides from the configuration, if any.
    pub overrides: Option<serde_json::Value>,
}

/// Everything a backend needs to submit one invocation.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub invocation_id: InvocationId,
    pub config: RunConfig,
    /// The fully resolved raw configuration, frozen into each job record.
    pub frozen: serde_json::Value,
    pub tasks: Vec<ResolvedTask>,
}

impl ExecutionContext {
    /// Environment for one evaluation container: the configuration's
    /// evaluation env-var section, the task's required vars pulled from the
    /// caller's environment, and any telemetry variables present.
    ///
    /// A required var that is neither configured nor set in the caller's
    /// environment is a fatal pre-flight error.
    pub fn job_env(&self, task: &ResolvedTask) -> Result<BTreeMap<String, String>> {
        let mut env: BTreeMap<String, String> = self
            .config
            .evaluation
            .env_vars
            .evaluation
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for name in &task.definition.required_env_vars {
            if env.contains_key(name) {
                continue;
            }
            let value = std::env::var(name).map_err(|_| Error::MissingEnv(name.clone()))?;
            env.insert(name.clone(), value);
        }
        if let Some(key_name) = &self.config.target.api_endpoint.api_key_name {
            if !env.contains_key(key_name) {
                let value =
                    std::env::var(key_name).map_err(|_| Error::MissingEnv(key_name.clone()))?;
                env.insert(key_name.clone(), value);
            }
        }
        for (name, value) in nel_core::telemetry_env() {
            env.insert(name, value);
        }
        Ok(env)
    }

    /// The harness command line run inside the task container. Output lands
    /// under the container-side `/results`, which the backend mounts onto the
    /// task's `artifacts/` directory.
    pub fn eval_command(&self, task: &ResolvedTask, target_url: &str) -> String {
        let endpoint = &self.config.target.api_endpoint;
        let mut command = format!(
            "nemo-evaluator run_eval --eval_type {}.{} --model_id {} --model_type {} \
             --model_url {} --output_dir /results",
            task.definition.harness,
            task.definition.name,
            shell_quote(&endpoint.model_id),
            task.definition.endpoint_type,
            shell_quote(target_url),
        );
        if let Some(key_name) = &endpoint.api_key_name {
            command.push_str(&format!(" --api_key_name {}", shell_quote(key_name)));
        }
        if let Some(overrides) = &task.overrides {
            command.push_str(&format!(
                " --overrides {}",
                shell_quote(&compact_json(overrides))
            ));
        }
        command
    }

    /// The caller-supplied endpoint URL; an error when the configuration
    /// expects a deployment to produce one.
    pub fn target_url(&self) -> Result<&str> {
        self.config
            .target
            .api_endpoint
            .url
            .as_deref()
            .ok_or(Error::MissingField {
                executor: self.config.executor.kind,
                field: "target.api_endpoint.url",
            })
    }
}

fn compact_json(value: &serde_json::Value) -> String {
    value.to_string()
}

/// What a status row reports: a backend execution state, or `ERROR` when the
/// backend could not be queried for this job. The job's persisted state is
/// untouched either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportState {
    Known(ExecutionState),
    Error,
}

impl ReportState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Known(state) if state.is_terminal())
    }
}

impl From<ExecutionState> for ReportState {
    fn from(state: ExecutionState) -> Self {
        Self::Known(state)
    }
}

impl PartialEq<ExecutionState> for ReportState {
    fn eq(&self, other: &ExecutionState) -> bool {
        matches!(self, Self::Known(state) if state == other)
    }
}

impl std::fmt::Display for ReportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known(state) => state.fmt(f),
            Self::Error => f.write_str("ERROR"),
        }
    }
}

impl serde::Serialize for ReportState {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Known(state) => state.serialize(serializer),
            Self::Error => serializer.serialize_str("ERROR"),
        }
    }
}

/// Point-in-time status of one job (or one synthesized endpoint).
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobStatusReport {
    pub invocation_id: String,
    /// Absent for synthesized endpoint rows of a Lepton invocation status.
    pub job_id: Option<String>,
    pub state: ReportState,
    /// Fraction complete in `[0, 1]`, or a raw sample count when the task
    /// declares no limit. Only the local backend reports progress.
    pub progress: Option<f64>,
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl JobStatusReport {
    pub fn for_job(record: &JobRecord, state: ExecutionState) -> Self {
        Self {
            invocation_id: record.invocation_id.clone(),
            job_id: Some(record.job_id.clone()),
            state: state.into(),
            progress: None,
            data: record.data.clone(),
        }
    }

    /// Row standing in for a job whose backend could not be queried.
    pub fn error_for(record: &JobRecord, message: impl Into<String>) -> Self {
        let mut data = serde_json::Map::new();
        data.insert("error".to_string(), message.into().into());
        Self {
            invocation_id: record.invocation_id.clone(),
            job_id: Some(record.job_id.clone()),
            state: ReportState::Error,
            progress: None,
            data,
        }
    }
}

/// The backend contract the API facade dispatches on.
#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    /// Submit every task of the invocation. Returns one record per task,
    /// ordered by task index. Dry runs materialize scripts but return no
    /// records.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Vec<JobRecord>>;

    /// Point-in-time status of one previously submitted job.
    async fn status(&self, record: &JobRecord) -> Result<JobStatusReport>;

    /// Status of a whole invocation. Backends that synthesize extra rows
    /// (Lepton endpoints) override this; the default maps [`Executor::status`]
    /// over the records.
    async fn invocation_status(&self, records: &[JobRecord]) -> Result<Vec<JobStatusReport>> {
        let mut reports = Vec::with_capacity(records.len());
        for record in records {
            reports.push(self.status(record).await?);
        }
        Ok(reports)
    }

    /// Kill one job. `siblings` holds every record of the same invocation so
    /// backends can release resources shared across jobs. Returns the record
    /// with its kill markers set; the caller persists it.
    async fn kill(&self, record: &JobRecord, siblings: &[JobRecord]) -> Result<JobRecord> {
        let _ = (record, siblings);
        Err(Error::NotSupported {
            executor: self.kind(),
            operation: "kill",
        })
    }

    /// Follow a job's log output. Only the local backend implements this.
    fn stream_logs(&self, record: &JobRecord) -> Result<local::LogStream> {
        let _ = record;
        Err(Error::NotSupported {
            executor: self.kind(),
            operation: "log streaming",
        })
    }
}

/// Single-quote a string for embedding into a shell command line.
pub(crate) fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// `<UTC timestamp>-<invocation id>`, the invocation directory name under
/// `execution.output_dir`.
pub(crate) fn invocation_dirname(invocation_id: &InvocationId) -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%d_%H%M%S"),
        invocation_id
    )
}
