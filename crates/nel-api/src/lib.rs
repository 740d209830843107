//! API facade.
//!
//! The single entry point collaborators (the CLI, the wizard) talk to. Five
//! operations: `run`, `status`, `kill`, `stream_logs`, `export`. Each takes an
//! identifier that is either a whole invocation or one `<invocation>.<index>`
//! job; dispatch reads the persisted record's `executor` field and delegates
//! to that backend.

pub mod export;

pub use export::ExportResult;

use nel_core::{Identifier, InvocationId, RunConfig};
use nel_db::{ExecutionDb, JobRecord};
use nel_executors::{
    ExecutionContext, Executor, JobStatusReport, LeptonExecutor, LocalExecutor, ResolvedTask,
    SlurmExecutor,
};
use nel_lepton_client::{LeptonApi, LeptonClient};
use nel_task_registry::TaskRegistry;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Errors raised by the facade.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] nel_core::Error),

    #[error("execution database error: {0}")]
    Db(#[from] nel_db::Error),

    #[error("task registry error: {0}")]
    Registry(#[from] nel_task_registry::Error),

    #[error(transparent)]
    Executor(#[from] nel_executors::Error),

    #[error(transparent)]
    Lepton(#[from] nel_lepton_client::Error),

    #[error("no job found for {0}")]
    JobNotFound(String),

    #[error("exporter '{0}' is not supported")]
    UnsupportedExporter(String),

    #[error(
        "executor.lepton_platform.workspace_url is required for the lepton executor"
    )]
    MissingWorkspaceUrl,
}

/// Result type alias for facade operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Terminal disposition of one kill attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KillStatus {
    Killed,
    Error,
    NotFound,
}

/// One row of a `kill` result.
#[derive(Debug, Clone, Serialize)]
pub struct KillOutcome {
    pub invocation_id: String,
    pub job_id: String,
    pub status: KillStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// The launcher facade. Owns the execution database and the task registry;
/// executors are stateless and constructed per dispatch.
pub struct Launcher {
    db: ExecutionDb,
    registry: TaskRegistry,
    /// Test seam; production builds the HTTP client from the configuration.
    lepton_client: Option<Arc<dyn LeptonApi>>,
}

impl Launcher {
    pub fn new(db: ExecutionDb, registry: TaskRegistry) -> Self {
        Self {
            db,
            registry,
            lepton_client: None,
        }
    }

    pub fn with_lepton_client(mut self, client: Arc<dyn LeptonApi>) -> Self {
        self.lepton_client = Some(client);
        self
    }

    pub fn db(&self) -> &ExecutionDb {
        &self.db
    }

    /// Submit one run configuration. Every job record is persisted, in task
    /// index order, before the invocation id is returned. Dry runs
    /// materialize scripts but persist nothing.
    pub async fn run(&self, yaml: &str) -> Result<InvocationId> {
        let (config, frozen) = RunConfig::from_yaml_str(yaml)?;
        self.run_config(config, frozen).await
    }

    /// Same as [`Launcher::run`], starting from an already parsed
    /// configuration.
    pub async fn run_config(
        &self,
        config: RunConfig,
        frozen: serde_json::Value,
    ) -> Result<InvocationId> {
        let mut tasks = Vec::with_capacity(config.evaluation.tasks.len());
        for spec in &config.evaluation.tasks {
            let definition = self.registry.resolve(&spec.name)?.clone();
            tasks.push(ResolvedTask {
                spec_name: spec.name.clone(),
                definition,
                overrides: spec.nemo_evaluator_config.clone(),
            });
        }

        let invocation_id = InvocationId::generate();
        let executor = self.executor_for(&config)?;
        let ctx = ExecutionContext {
            invocation_id: invocation_id.clone(),
            config,
            frozen,
            tasks,
        };
        let mut records = executor.execute(&ctx).await?;
        records.sort_by_key(|r| r.task_index());
        for record in &records {
            self.db.write_job(record)?;
        }
        info!(%invocation_id, jobs = records.len(), "invocation submitted");
        Ok(invocation_id)
    }

    /// Point-in-time status for an invocation or a single job. Backend
    /// failures become per-job `ERROR` rows, never a failed call; the
    /// persisted records are left untouched.
    pub async fn status(&self, id: &Identifier) -> Result<Vec<JobStatusReport>> {
        let records = self.lookup(id)?;
        let executor = match self.executor_for_record(&records[0]) {
            Ok(executor) => executor,
            Err(e) => return Ok(error_reports(&records, &e)),
        };
        let result = match id {
            Identifier::Invocation(_) => executor.invocation_status(&records).await,
            Identifier::Job(_) => executor.status(&records[0]).await.map(|r| vec![r]),
        };
        Ok(match result {
            Ok(reports) => reports,
            Err(e) => {
                warn!(%id, error = %e, "status query failed");
                error_reports(&records, &e.into())
            }
        })
    }

    /// Kill an invocation (fans out to every job, sequentially) or one job.
    /// Backend failures surface as per-job `error` rows, never as a batch
    /// failure.
    pub async fn kill(&self, id: &Identifier) -> Result<Vec<KillOutcome>> {
        let records = match self.lookup(id) {
            Ok(records) => records,
            Err(Error::JobNotFound(_)) => {
                return Ok(vec![KillOutcome {
                    invocation_id: id.invocation().to_string(),
                    job_id: id.to_string(),
                    status: KillStatus::NotFound,
                    message: None,
                    data: serde_json::Map::new(),
                }])
            }
            Err(e) => return Err(e),
        };

        let siblings = self
            .db
            .list_jobs_by_invocation(id.invocation().as_str())?;
        let mut outcomes = Vec::with_capacity(records.len());
        for record in &records {
            outcomes.push(self.kill_one(record, &siblings).await);
        }
        Ok(outcomes)
    }

    async fn kill_one(&self, record: &JobRecord, siblings: &[JobRecord]) -> KillOutcome {
        let mut outcome = KillOutcome {
            invocation_id: record.invocation_id.clone(),
            job_id: record.job_id.clone(),
            status: KillStatus::Error,
            message: None,
            data: record.data.clone(),
        };

        let executor = match self.executor_for_record(record) {
            Ok(executor) => executor,
            Err(e) => {
                outcome.message = Some(e.to_string());
                return outcome;
            }
        };

        // The pre-kill state decides idempotence: a job that already reached
        // a terminal state reports an error, not a second kill.
        if record.data_bool("killed") {
            outcome.message = Some("job already terminated (KILLED)".to_string());
            return outcome;
        }
        match executor.status(record).await {
            Ok(report) if report.state.is_terminal() => {
                outcome.message = Some(format!("job already terminated ({})", report.state));
                return outcome;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(job_id = %record.job_id, error = %e, "pre-kill status check failed");
            }
        }

        match executor.kill(record, siblings).await {
            Ok(updated) => match self.db.write_job(&updated) {
                Ok(()) => {
                    outcome.status = KillStatus::Killed;
                    outcome.data = updated.data;
                }
                Err(e) => {
                    outcome.message = Some(format!("killed, but persisting failed: {}", e));
                }
            },
            Err(e) => {
                outcome.message = Some(e.to_string());
            }
        }
        outcome
    }

    /// Follow log output. For a whole invocation the first job's log is
    /// streamed.
    pub fn stream_logs(&self, id: &Identifier) -> Result<nel_executors::local::LogStream> {
        let records = self.lookup(id)?;
        let executor = self.executor_for_record(&records[0])?;
        Ok(executor.stream_logs(&records[0])?)
    }

    /// Export artifacts of an invocation or job to a sink.
    pub async fn export(
        &self,
        id: &Identifier,
        dest: &str,
        options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Vec<ExportResult>> {
        let records = self.lookup(id)?;
        export::export(dest, &records, options)
    }

    /// The persisted records the identifier names, in task index order.
    /// Errors with [`Error::JobNotFound`] when nothing matches.
    fn lookup(&self, id: &Identifier) -> Result<Vec<JobRecord>> {
        let records = match id {
            Identifier::Invocation(inv) => self.db.list_jobs_by_invocation(inv.as_str())?,
            Identifier::Job(job) => self
                .db
                .get_job(&job.to_string())?
                .into_iter()
                .collect(),
        };
        if records.is_empty() {
            return Err(Error::JobNotFound(id.to_string()));
        }
        Ok(records)
    }

    fn executor_for(&self, config: &RunConfig) -> Result<Box<dyn Executor>> {
        use nel_core::ExecutorKind::*;
        Ok(match config.executor.kind {
            Local => Box::new(LocalExecutor::new()),
            Slurm => Box::new(SlurmExecutor::new()),
            Lepton => Box::new(LeptonExecutor::new(self.lepton_api(config)?)),
        })
    }

    /// Rebuild the executor from a persisted record's frozen configuration.
    fn executor_for_record(&self, record: &JobRecord) -> Result<Box<dyn Executor>> {
        use nel_core::ExecutorKind::*;
        Ok(match record.executor {
            Local => Box::new(LocalExecutor::new()),
            Slurm => Box::new(SlurmExecutor::new()),
            Lepton => {
                let config: RunConfig = serde_json::from_value(record.config.clone())
                    .map_err(nel_core::Error::from)?;
                Box::new(LeptonExecutor::new(self.lepton_api(&config)?))
            }
        })
    }

    fn lepton_api(&self, config: &RunConfig) -> Result<Arc<dyn LeptonApi>> {
        if let Some(client) = &self.lepton_client {
            return Ok(Arc::clone(client));
        }
        let platform = config
            .executor
            .lepton_platform
            .as_ref()
            .ok_or(Error::MissingWorkspaceUrl)?;
        let workspace_url = platform
            .workspace_url
            .as_deref()
            .ok_or(Error::MissingWorkspaceUrl)?;
        let token = platform
            .token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok());
        Ok(Arc::new(LeptonClient::new(workspace_url, token)?))
    }
}

/// One `ERROR` row per record, all carrying the failure message.
fn error_reports(records: &[JobRecord], error: &Error) -> Vec<JobStatusReport> {
    records
        .iter()
        .map(|record| JobStatusReport::error_for(record, error.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nel_core::ExecutionState;
    use nel_executors::ReportState;
    use nel_lepton_client::mock::MockLeptonClient;
    use nel_task_registry::TaskDefinition;
    use std::path::Path;

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry
            .insert(TaskDefinition {
                harness: "simple-evals".to_string(),
                name: "aime2025".to_string(),
                container: "nvcr.io/eval-factory/simple-evals:1.0".to_string(),
                container_digest: "sha256:abc".to_string(),
                endpoint_type: "chat".to_string(),
                description: String::new(),
                required_env_vars: vec![],
                defaults: serde_json::Value::Null,
            })
            .unwrap();
        registry
    }

    fn launcher(db_dir: &Path) -> Launcher {
        let db = ExecutionDb::open(db_dir.join("exec.db.jsonl")).unwrap();
        Launcher::new(db, registry()).with_lepton_client(Arc::new(MockLeptonClient::new()))
    }

    fn local_yaml(output_dir: &Path) -> String {
        format!(
            r#"
executor:
  type: local
target:
  api_endpoint:
    url: http://localhost:8000/v1
    model_id: meta/llama
evaluation:
  tasks:
    - name: simple-evals.aime2025
execution:
  output_dir: {}
"#,
            output_dir.display()
        )
    }

    fn lepton_yaml(output_dir: &Path) -> String {
        format!(
            r#"
executor:
  type: lepton
  lepton_platform:
    workspace_url: https://ws.lepton.example
deployment:
  type: vllm
  image: nvcr.io/nim/vllm:24.05
target:
  api_endpoint:
    url: http://x/v1
    model_id: meta/llama
evaluation:
  tasks:
    - name: simple-evals.aime2025
execution:
  output_dir: {}
"#,
            output_dir.display()
        )
    }

    #[tokio::test]
    async fn test_run_persists_jobs_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path());
        let invocation_id = launcher.run(&local_yaml(dir.path())).await.unwrap();

        let jobs = launcher
            .db
            .list_jobs_by_invocation(invocation_id.as_str())
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, format!("{}.0", invocation_id));
        assert_eq!(jobs[0].config["target"]["api_endpoint"]["model_id"], "meta/llama");
    }

    #[tokio::test]
    async fn test_unknown_task_fails_before_any_submission() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path());
        let yaml = local_yaml(dir.path()).replace("simple-evals.aime2025", "simple-evals.nope");
        assert!(matches!(
            launcher.run(&yaml).await.unwrap_err(),
            Error::Registry(_)
        ));
        assert!(launcher.db.iter_invocations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_sentinel_rejected_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path());
        let yaml = local_yaml(dir.path()).replace("meta/llama", "MISSING");
        let err = launcher.run(&yaml).await.unwrap_err();
        assert!(err.to_string().contains("target.api_endpoint.model_id"));
        assert!(launcher.db.iter_invocations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_run_reaches_success_with_full_progress() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path());
        let invocation_id = launcher.run(&local_yaml(dir.path())).await.unwrap();

        let jobs = launcher
            .db
            .list_jobs_by_invocation(invocation_id.as_str())
            .unwrap();
        let task_dir = std::path::PathBuf::from(jobs[0].data_str("output_dir").unwrap());

        // Wait for the detached script to finish (docker is absent here, so
        // it exits fast), then stand in for a successful harness run.
        let exit_marker = task_dir.join("logs").join("stage.exit");
        for _ in 0..100 {
            if exit_marker.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        std::fs::write(&exit_marker, "2026-01-01T00:00:00Z 0").unwrap();
        let artifacts = task_dir.join("artifacts");
        std::fs::write(artifacts.join("progress"), "100\n").unwrap();
        std::fs::write(
            artifacts.join("run_config.yml"),
            "config:\n  params:\n    limit_samples: 100\n",
        )
        .unwrap();

        let id: Identifier = jobs[0].job_id.parse().unwrap();
        let reports = launcher.status(&id).await.unwrap();
        assert_eq!(reports[0].state, ExecutionState::Success);
        assert_eq!(reports[0].progress, Some(1.0));
    }

    #[tokio::test]
    async fn test_status_of_unknown_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path());
        let id: Identifier = "0123456789abcdef".parse().unwrap();
        assert!(matches!(
            launcher.status(&id).await.unwrap_err(),
            Error::JobNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_status_reads_local_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path());
        let invocation_id = launcher.run(&local_yaml(dir.path())).await.unwrap();

        let id: Identifier = invocation_id.as_str().parse().unwrap();
        let reports = launcher.status(&id).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].job_id.as_deref(), Some(format!("{}.0", invocation_id).as_str()));
    }

    #[tokio::test]
    async fn test_status_backend_failure_yields_error_rows() {
        let dir = tempfile::tempdir().unwrap();
        let db = ExecutionDb::open(dir.path().join("exec.db.jsonl")).unwrap();
        let launcher = Launcher::new(db, registry())
            .with_lepton_client(Arc::new(MockLeptonClient::new()));
        let invocation_id = launcher.run(&lepton_yaml(dir.path())).await.unwrap();

        // A fresh platform client knows nothing about the persisted jobs, so
        // the backend query fails; the call must still succeed with one
        // ERROR row per job.
        let db = ExecutionDb::open(dir.path().join("exec.db.jsonl")).unwrap();
        let amnesiac = Launcher::new(db, registry())
            .with_lepton_client(Arc::new(MockLeptonClient::new()));
        let id: Identifier = invocation_id.as_str().parse().unwrap();
        let reports = amnesiac.status(&id).await.unwrap();
        assert!(!reports.is_empty());
        for report in &reports {
            assert_eq!(report.state, ReportState::Error);
            assert!(report.data["error"].as_str().is_some());
        }
    }

    #[tokio::test]
    async fn test_kill_of_unknown_id_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path());
        let id: Identifier = "0123456789abcdef.0".parse().unwrap();
        let outcomes = launcher.kill(&id).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, KillStatus::NotFound);
    }

    #[tokio::test]
    async fn test_kill_lepton_job_and_second_kill_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockLeptonClient::new());
        let db = ExecutionDb::open(dir.path().join("exec.db.jsonl")).unwrap();
        let launcher = Launcher::new(db, registry()).with_lepton_client(mock.clone());

        let invocation_id = launcher.run(&lepton_yaml(dir.path())).await.unwrap();
        let id: Identifier = invocation_id.as_str().parse().unwrap();

        let outcomes = launcher.kill(&id).await.unwrap();
        assert_eq!(outcomes[0].status, KillStatus::Killed);
        assert!(outcomes[0].data["killed"].as_bool().unwrap());

        // The killed job is gone from the platform; a second kill is an
        // error row, not a not_found.
        let outcomes = launcher.kill(&id).await.unwrap();
        assert_eq!(outcomes[0].status, KillStatus::Error);
        assert!(outcomes[0].message.is_some());
    }

    #[tokio::test]
    async fn test_kill_skips_already_successful_job() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockLeptonClient::new());
        let db = ExecutionDb::open(dir.path().join("exec.db.jsonl")).unwrap();
        let launcher = Launcher::new(db, registry()).with_lepton_client(mock.clone());

        let invocation_id = launcher.run(&lepton_yaml(dir.path())).await.unwrap();
        let jobs = launcher
            .db
            .list_jobs_by_invocation(invocation_id.as_str())
            .unwrap();
        mock.set_job_state(jobs[0].data_str("lepton_job_id").unwrap(), "Succeeded");

        let id: Identifier = jobs[0].job_id.parse().unwrap();
        let reports = launcher.status(&id).await.unwrap();
        assert_eq!(reports[0].state, ExecutionState::Success);

        let outcomes = launcher.kill(&id).await.unwrap();
        assert_eq!(outcomes[0].status, KillStatus::Error);
        assert!(outcomes[0].message.as_deref().unwrap().contains("already terminated"));
    }

    #[tokio::test]
    async fn test_export_to_unsupported_sink() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path());
        let invocation_id = launcher.run(&local_yaml(dir.path())).await.unwrap();
        let id: Identifier = invocation_id.as_str().parse().unwrap();
        assert!(matches!(
            launcher.export(&id, "mlflow", &serde_json::Map::new()).await,
            Err(Error::UnsupportedExporter(_))
        ));
    }
}
