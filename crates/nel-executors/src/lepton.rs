//! Lepton backend: endpoints and jobs on the managed platform.
//!
//! With a deployment configured, one endpoint is stood up per task (creation
//! bounded-parallel, readiness polled with exponential backoff) before jobs
//! are submitted against it. With `deployment.type: none` the caller-supplied
//! URL is used and no endpoint is ever created or torn down.

use crate::{Error, ExecutionContext, Executor, JobStatusReport, ResolvedTask, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use nel_core::{DeploymentKind, ExecutionState, ExecutorKind};
use nel_db::JobRecord;
use nel_lepton_client::{EndpointSpec, EndpointState, JobSpec, JobState, LeptonApi};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Platform limit on endpoint names.
const MAX_ENDPOINT_NAME_LEN: usize = 36;

/// Concurrent endpoint creations per invocation.
const ENDPOINT_CREATE_PARALLELISM: usize = 16;

/// Readiness deadline when the configuration does not set one.
const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(600);

pub struct LeptonExecutor {
    client: Arc<dyn LeptonApi>,
}

impl LeptonExecutor {
    pub fn new(client: Arc<dyn LeptonApi>) -> Self {
        Self { client }
    }

    fn readiness_timeout(ctx: &ExecutionContext) -> Duration {
        ctx.config
            .executor
            .lepton_platform
            .as_ref()
            .and_then(|p| p.endpoint_readiness_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_READINESS_TIMEOUT)
    }

    fn endpoint_spec(&self, ctx: &ExecutionContext, task: &ResolvedTask) -> Result<EndpointSpec> {
        let image = ctx
            .config
            .deployment
            .image
            .as_deref()
            .ok_or(Error::MissingField {
                executor: ExecutorKind::Lepton,
                field: "deployment.image",
            })?;
        let platform = ctx.config.executor.lepton_platform.as_ref();
        Ok(EndpointSpec {
            name: endpoint_name(&task.definition.name, ctx.invocation_id.as_str()),
            image: image.to_string(),
            env_vars: ctx
                .config
                .evaluation
                .env_vars
                .deployment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            node_group: platform.and_then(|p| p.node_group.clone()),
            resource_shape: platform.and_then(|p| p.resource_shape.clone()),
            replicas: ctx.config.deployment.endpoints.unwrap_or(1),
        })
    }

    /// Poll until the endpoint reports `Ready`, backing off exponentially.
    async fn wait_ready(&self, name: &str, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let mut delay = Duration::from_secs(2);
        loop {
            let status = self.client.get_endpoint(name).await?;
            if status.parsed_state() == EndpointState::Ready {
                return status.external_url.ok_or_else(|| {
                    Error::Submit(format!("endpoint {} is ready but has no external URL", name))
                });
            }
            if Instant::now() + delay > deadline {
                return Err(Error::ReadinessTimeout {
                    endpoint: name.to_string(),
                    seconds: timeout.as_secs(),
                });
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(30));
        }
    }

    /// Best-effort deletion of every endpoint created so far.
    async fn teardown(&self, names: &[String]) {
        for name in names {
            if let Err(e) = self.client.delete_endpoint(name).await {
                warn!(endpoint = %name, error = %e, "endpoint teardown failed");
            }
        }
    }
}

/// `nel-<task>-<invocation prefix>`, sanitized to the platform's `[a-z0-9-]`
/// alphabet and length limit. The invocation suffix keeps names unique across
/// submissions of the same task.
fn endpoint_name(task_name: &str, invocation_id: &str) -> String {
    let suffix = &invocation_id[..8.min(invocation_id.len())];
    let sanitized: String = format!("nel-{}", task_name.to_lowercase())
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' })
        .collect();
    let budget = MAX_ENDPOINT_NAME_LEN - suffix.len() - 1;
    let head: String = sanitized.chars().take(budget).collect();
    format!("{}-{}", head.trim_end_matches('-'), suffix)
}

fn map_job_state(state: JobState) -> ExecutionState {
    match state {
        JobState::Succeeded => ExecutionState::Success,
        JobState::Running | JobState::Pending | JobState::Starting => ExecutionState::Running,
        JobState::Failed | JobState::Cancelled => ExecutionState::Failed,
        JobState::Unknown => ExecutionState::Pending,
    }
}

fn map_endpoint_state(state: EndpointState) -> ExecutionState {
    match state {
        EndpointState::Ready => ExecutionState::Running,
        EndpointState::Starting | EndpointState::Updating => ExecutionState::Pending,
        EndpointState::Stopped => ExecutionState::Killed,
        EndpointState::Unknown => ExecutionState::Pending,
    }
}

#[async_trait]
impl Executor for LeptonExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Lepton
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Vec<JobRecord>> {
        if ctx.config.executor.dry_run {
            info!("dry run, no platform calls made");
            return Ok(Vec::new());
        }
        let platform = ctx.config.executor.lepton_platform.as_ref();
        let has_deployment = ctx.config.deployment.kind != DeploymentKind::None;

        // Stand up one endpoint per task, then wait on all of them. Any
        // failure tears down everything created so far before propagating.
        let mut created: Vec<String> = Vec::new();
        let mut endpoint_urls: Vec<Option<String>> = vec![None; ctx.tasks.len()];
        if has_deployment {
            let mut specs = Vec::with_capacity(ctx.tasks.len());
            for task in &ctx.tasks {
                specs.push(self.endpoint_spec(ctx, task)?);
            }
            let results: Vec<_> = stream::iter(specs)
                .map(|spec| {
                    let client = Arc::clone(&self.client);
                    async move {
                        let name = spec.name.clone();
                        client.create_endpoint(&spec).await.map(|_| name)
                    }
                })
                .buffer_unordered(ENDPOINT_CREATE_PARALLELISM)
                .collect()
                .await;
            let mut first_error = None;
            for result in results {
                match result {
                    Ok(name) => created.push(name),
                    Err(e) => first_error = first_error.or(Some(e)),
                }
            }
            if let Some(e) = first_error {
                self.teardown(&created).await;
                return Err(e.into());
            }

            let timeout = Self::readiness_timeout(ctx);
            for (index, task) in ctx.tasks.iter().enumerate() {
                let name = endpoint_name(&task.definition.name, ctx.invocation_id.as_str());
                match self.wait_ready(&name, timeout).await {
                    Ok(url) => endpoint_urls[index] = Some(url),
                    Err(e) => {
                        self.teardown(&created).await;
                        return Err(e);
                    }
                }
            }
        }

        let mut records = Vec::with_capacity(ctx.tasks.len());
        for (index, task) in ctx.tasks.iter().enumerate() {
            let target_url = match &endpoint_urls[index] {
                Some(url) => url.clone(),
                None => ctx.target_url()?.to_string(),
            };
            let spec = JobSpec {
                name: endpoint_name(
                    &format!("{}-{}", task.definition.name, index),
                    ctx.invocation_id.as_str(),
                ),
                image: task.definition.container.clone(),
                command: ctx.eval_command(task, &target_url),
                env_vars: ctx.job_env(task)?,
                mounts: Vec::new(),
                node_group: platform.and_then(|p| p.node_group.clone()),
                resource_shape: platform.and_then(|p| p.resource_shape.clone()),
                timeout_secs: platform.and_then(|p| p.job_timeout_secs),
            };
            let external_id = match self.client.create_job(&spec).await {
                Ok(id) => id,
                Err(e) => {
                    self.teardown(&created).await;
                    return Err(e.into());
                }
            };
            debug!(task = %task.definition.name, %external_id, "submitted platform job");

            let mut record = JobRecord::new(
                &ctx.invocation_id.job(index),
                ExecutorKind::Lepton,
                ctx.frozen.clone(),
            );
            record.set_data("lepton_job_id", external_id);
            record.set_data("target_url", target_url);
            if has_deployment {
                record.set_data(
                    "endpoint_name",
                    endpoint_name(&task.definition.name, ctx.invocation_id.as_str()),
                );
            }
            records.push(record);
        }
        Ok(records)
    }

    async fn status(&self, record: &JobRecord) -> Result<JobStatusReport> {
        let external_id = record.data_str("lepton_job_id").ok_or(Error::MissingField {
            executor: ExecutorKind::Lepton,
            field: "data.lepton_job_id",
        })?;
        let job = self.client.get_job(external_id).await?;
        Ok(JobStatusReport::for_job(record, map_job_state(job.parsed_state())))
    }

    /// One synthesized row per unique endpoint, then one row per job. Jobs
    /// running against a caller-supplied URL share a single synthetic
    /// `shared` endpoint row.
    async fn invocation_status(&self, records: &[JobRecord]) -> Result<Vec<JobStatusReport>> {
        let invocation_id = match records.first() {
            Some(record) => record.invocation_id.clone(),
            None => return Ok(Vec::new()),
        };

        let mut reports = Vec::new();
        let names: BTreeSet<Option<String>> = records
            .iter()
            .map(|r| r.data_str("endpoint_name").map(str::to_string))
            .collect();
        for name in names {
            let mut data = serde_json::Map::new();
            let state = match &name {
                Some(name) => {
                    data.insert("endpoint_name".to_string(), name.clone().into());
                    match self.client.get_endpoint(name).await {
                        Ok(status) => {
                            let state = map_endpoint_state(status.parsed_state());
                            if let Some(url) = status.external_url {
                                data.insert("endpoint_url".to_string(), url.into());
                            }
                            state
                        }
                        Err(nel_lepton_client::Error::EndpointNotFound(_)) => {
                            ExecutionState::Killed
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                None => {
                    data.insert("endpoint_name".to_string(), "shared".into());
                    ExecutionState::Running
                }
            };
            reports.push(JobStatusReport {
                invocation_id: invocation_id.clone(),
                job_id: None,
                state: state.into(),
                progress: None,
                data,
            });
        }

        for record in records {
            reports.push(self.status(record).await?);
        }
        Ok(reports)
    }

    async fn kill(&self, record: &JobRecord, siblings: &[JobRecord]) -> Result<JobRecord> {
        let external_id = record.data_str("lepton_job_id").ok_or(Error::MissingField {
            executor: ExecutorKind::Lepton,
            field: "data.lepton_job_id",
        })?;
        self.client.delete_job(external_id).await?;
        let mut updated = record.clone();
        updated.set_data("killed", true);

        // Release the endpoint once no other job of the invocation still
        // references it.
        let endpoint = match record.data_str("endpoint_name") {
            Some(name) => name.to_string(),
            None => return Ok(updated),
        };
        for sibling in siblings {
            if sibling.job_id == record.job_id
                || sibling.data_bool("killed")
                || sibling.data_str("endpoint_name") != Some(endpoint.as_str())
            {
                continue;
            }
            let Some(sibling_job) = sibling.data_str("lepton_job_id") else {
                continue;
            };
            let active = match self.client.get_job(sibling_job).await {
                Ok(job) => !map_job_state(job.parsed_state()).is_terminal(),
                Err(nel_lepton_client::Error::JobNotFound(_)) => false,
                Err(e) => return Err(e.into()),
            };
            if active {
                return Ok(updated);
            }
        }
        match self.client.delete_endpoint(&endpoint).await {
            Ok(()) => debug!(%endpoint, "deleted endpoint after last job kill"),
            Err(nel_lepton_client::Error::EndpointNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(updated)
    }
}
