//! SLURM backend: sbatch chains over SSH to a login node.
//!
//! No daemon runs on the cluster. Submission writes sbatch scripts locally,
//! copies them to `<remote_rundir>/<invocation_id>/` and submits them through
//! the shared SSH master; status and kill shell out to `sacct`/`scancel` the
//! same way.

use crate::{
    invocation_dirname, shell_quote, Error, ExecutionContext, Executor, JobStatusReport,
    ResolvedTask, Result,
};
use async_trait::async_trait;
use nel_artifacts::SshSession;
use nel_core::{DeploymentKind, ExecutionState, ExecutorKind};
use nel_db::JobRecord;
use std::time::Duration;
use tracing::{debug, info};

/// Per-call deadline for `sacct` and `scancel`.
const SLURM_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Placeholder the eval command carries until the script reads the deployed
/// endpoint URL off shared storage.
const MODEL_URL_PLACEHOLDER: &str = "__NEL_MODEL_URL__";

#[derive(Debug, Default)]
pub struct SlurmExecutor;

impl SlurmExecutor {
    pub fn new() -> Self {
        Self
    }

    fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str> {
        value.as_deref().ok_or(Error::MissingField {
            executor: ExecutorKind::Slurm,
            field,
        })
    }

    fn open_session(record: &JobRecord) -> Result<SshSession> {
        let user = record.data_str("username").ok_or(Error::MissingField {
            executor: ExecutorKind::Slurm,
            field: "data.username",
        })?;
        let host = record.data_str("hostname").ok_or(Error::MissingField {
            executor: ExecutorKind::Slurm,
            field: "data.hostname",
        })?;
        Ok(SshSession::open(user, host)?)
    }

    fn sbatch_header(ctx: &ExecutionContext, job_name: &str, log_path: &str) -> String {
        let executor = &ctx.config.executor;
        let mut header = String::from("#!/bin/bash\n");
        header.push_str(&format!("#SBATCH --job-name={}\n", job_name));
        header.push_str(&format!("#SBATCH --output={}\n", log_path));
        if let Some(account) = &executor.account {
            header.push_str(&format!("#SBATCH --account={}\n", account));
        }
        if let Some(partition) = &executor.partition {
            header.push_str(&format!("#SBATCH --partition={}\n", partition));
        }
        if let Some(walltime) = &executor.walltime {
            header.push_str(&format!("#SBATCH --time={}\n", walltime));
        }
        header
    }

    /// Sbatch script standing up the inference server and publishing its URL
    /// to `<remote_dir>/endpoint_url` on shared storage.
    fn render_deployment_sbatch(ctx: &ExecutionContext, remote_dir: &str) -> Result<String> {
        let deployment = &ctx.config.deployment;
        let image = deployment.image.as_deref().ok_or(Error::MissingField {
            executor: ExecutorKind::Slurm,
            field: "deployment.image",
        })?;
        let model = deployment
            .checkpoint
            .as_deref()
            .or(deployment.hf_model_handle.as_deref())
            .ok_or(Error::MissingField {
                executor: ExecutorKind::Slurm,
                field: "deployment.checkpoint",
            })?;

        let mut script = Self::sbatch_header(
            ctx,
            &format!("nel-deploy-{}", ctx.invocation_id),
            &format!("{}/deployment.log", remote_dir),
        );
        if let Some(gres) = &ctx.config.executor.gres {
            script.push_str(&format!("#SBATCH --gres={}\n", gres));
        }
        for (name, value) in &ctx.config.evaluation.env_vars.deployment {
            script.push_str(&format!("export {}={}\n", name, shell_quote(value)));
        }
        script.push_str(&format!(
            "echo \"http://$(hostname):8000/v1\" > {}/endpoint_url\n",
            shell_quote(remote_dir)
        ));

        let mut server = format!(
            "python3 -m vllm.entrypoints.openai.api_server --model {} --port 8000",
            shell_quote(model)
        );
        if deployment.kind == DeploymentKind::Sglang {
            server = format!(
                "python3 -m sglang.launch_server --model-path {} --port 8000",
                shell_quote(model)
            );
        }
        if let Some(name) = &deployment.served_model_name {
            server.push_str(&format!(" --served-model-name {}", shell_quote(name)));
        }
        if let Some(tp) = deployment.tensor_parallel {
            server.push_str(&format!(" --tensor-parallel-size {}", tp));
        }
        script.push_str(&format!(
            "srun --ntasks=1 --container-image={} bash -c {}\n",
            shell_quote(image),
            shell_quote(&server)
        ));
        Ok(script)
    }

    /// Sbatch script for one evaluation task. With a deployment in front,
    /// the script waits on `afterok` and reads the published endpoint URL at
    /// start; otherwise the caller-supplied URL is baked in.
    fn render_eval_sbatch(
        ctx: &ExecutionContext,
        task: &ResolvedTask,
        remote_dir: &str,
        task_remote_dir: &str,
        deployment_job: Option<&str>,
    ) -> Result<String> {
        let mut script = Self::sbatch_header(
            ctx,
            &format!("nel-eval-{}-{}", ctx.invocation_id, task.definition.name),
            &format!("{}/logs/slurm.log", task_remote_dir),
        );
        if let Some(dep) = deployment_job {
            script.push_str(&format!("#SBATCH --dependency=afterok:{}\n", dep));
        }
        let env = ctx.job_env(task)?;
        for (name, value) in &env {
            script.push_str(&format!("export {}={}\n", name, shell_quote(value)));
        }
        // Exported names are forwarded into the container by bare `-e NAME`
        // flags; the URL read off shared storage rides along the same way.
        let mut env_flags: Vec<String> = env.keys().map(|name| format!("-e {}", name)).collect();

        let command = if deployment_job.is_some() {
            script.push_str(&format!(
                "export MODEL_URL=\"$(cat {}/endpoint_url)\"\n",
                shell_quote(remote_dir)
            ));
            env_flags.push("-e MODEL_URL".to_string());
            ctx.eval_command(task, MODEL_URL_PLACEHOLDER)
                .replace(MODEL_URL_PLACEHOLDER, "\"$MODEL_URL\"")
        } else {
            ctx.eval_command(task, ctx.target_url()?)
        };

        let mut env_args = env_flags.join(" ");
        if !env_args.is_empty() {
            env_args.push(' ');
        }
        script.push_str(&format!(
            "srun --ntasks=1 docker run --rm --network=host {}-v {}/artifacts:/results {} bash -c {}\n",
            env_args,
            shell_quote(task_remote_dir),
            shell_quote(&task.definition.container),
            shell_quote(&command),
        ));
        Ok(script)
    }

    fn submit(session: &SshSession, remote_script: &str) -> Result<String> {
        let stdout = session.run(&format!("sbatch {}", shell_quote(remote_script)))?;
        parse_sbatch_job_id(&stdout).ok_or_else(|| {
            Error::Submit(format!("could not parse sbatch output: {:?}", stdout))
        })
    }
}

/// Pull the numeric job id out of `Submitted batch job 12345`.
fn parse_sbatch_job_id(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("Submitted batch job "))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
}

/// Map a raw `sacct` state word onto the launcher's state machine.
fn map_sacct_state(raw: &str) -> ExecutionState {
    let word = raw.split_whitespace().next().unwrap_or("");
    if word.starts_with("CANCELLED") {
        return ExecutionState::Killed;
    }
    match word {
        "PENDING" | "CONFIGURING" => ExecutionState::Pending,
        "RUNNING" | "COMPLETING" => ExecutionState::Running,
        "COMPLETED" => ExecutionState::Success,
        "FAILED" | "OUT_OF_MEMORY" | "TIMEOUT" | "NODE_FAIL" => ExecutionState::Failed,
        _ => ExecutionState::Pending,
    }
}

#[async_trait]
impl Executor for SlurmExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Slurm
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Vec<JobRecord>> {
        let executor = &ctx.config.executor;
        let hostname = Self::required(&executor.hostname, "executor.hostname")?;
        let username = Self::required(&executor.username, "executor.username")?;
        let remote_rundir = Self::required(&executor.remote_rundir, "executor.remote_rundir")?;

        let remote_dir = format!(
            "{}/{}",
            remote_rundir.trim_end_matches('/'),
            ctx.invocation_id
        );
        let local_dir = ctx
            .config
            .execution
            .output_dir
            .join(invocation_dirname(&ctx.invocation_id));
        let sbatch_dir = local_dir.join("sbatch");
        std::fs::create_dir_all(&sbatch_dir)?;

        let has_deployment = ctx.config.deployment.kind != DeploymentKind::None;
        let deployment_script = if has_deployment {
            let script = Self::render_deployment_sbatch(ctx, &remote_dir)?;
            let path = sbatch_dir.join("deployment.sbatch");
            std::fs::write(&path, &script)?;
            Some(path)
        } else {
            None
        };

        let mut eval_scripts = Vec::with_capacity(ctx.tasks.len());
        for task in &ctx.tasks {
            let task_remote_dir = format!("{}/{}", remote_dir, task.definition.name);
            // Dependency id is patched in at submit time; render with a
            // placeholder so dry runs still produce complete scripts.
            let script = Self::render_eval_sbatch(
                ctx,
                task,
                &remote_dir,
                &task_remote_dir,
                has_deployment.then_some("DEPLOYMENT_JOB_ID"),
            )?;
            let path = sbatch_dir.join(format!("{}.sbatch", task.definition.name));
            std::fs::write(&path, &script)?;
            eval_scripts.push((task, task_remote_dir, path, script));
        }

        if executor.dry_run {
            info!(dir = %sbatch_dir.display(), "dry run, sbatch scripts written, nothing submitted");
            return Ok(Vec::new());
        }

        let session = SshSession::open(username, hostname)?;
        let mut mkdirs = vec![shell_quote(&remote_dir)];
        for (_, task_remote_dir, _, _) in &eval_scripts {
            mkdirs.push(shell_quote(&format!("{}/logs", task_remote_dir)));
            mkdirs.push(shell_quote(&format!("{}/artifacts", task_remote_dir)));
        }
        session.run(&format!("mkdir -p {}", mkdirs.join(" ")))?;

        let deployment_job = match &deployment_script {
            Some(path) => {
                let remote_script = format!("{}/deployment.sbatch", remote_dir);
                session.scp_to(path, &remote_script)?;
                let job_id = Self::submit(&session, &remote_script)?;
                debug!(%job_id, "submitted deployment job");
                Some(job_id)
            }
            None => None,
        };

        let mut records = Vec::with_capacity(ctx.tasks.len());
        for (index, (task, task_remote_dir, path, script)) in eval_scripts.iter().enumerate() {
            let remote_script = format!("{}/{}.sbatch", remote_dir, task.definition.name);
            match &deployment_job {
                Some(dep) => {
                    let patched = script.replace("DEPLOYMENT_JOB_ID", dep);
                    std::fs::write(path, &patched)?;
                }
                None => {}
            }
            session.scp_to(path, &remote_script)?;
            let slurm_job_id = Self::submit(&session, &remote_script)?;
            debug!(task = %task.definition.name, %slurm_job_id, "submitted eval job");

            let mut record = JobRecord::new(
                &ctx.invocation_id.job(index),
                ExecutorKind::Slurm,
                ctx.frozen.clone(),
            );
            record.set_data("slurm_job_id", slurm_job_id);
            record.set_data("remote_rundir_path", remote_dir.clone());
            record.set_data("hostname", hostname);
            record.set_data("username", username);
            record.set_data("remote_output_dir", task_remote_dir.clone());
            record.set_data(
                "output_dir",
                local_dir.join(&task.definition.name).display().to_string(),
            );
            records.push(record);
        }
        Ok(records)
    }

    async fn status(&self, record: &JobRecord) -> Result<JobStatusReport> {
        let slurm_job_id = record.data_str("slurm_job_id").ok_or(Error::MissingField {
            executor: ExecutorKind::Slurm,
            field: "data.slurm_job_id",
        })?;
        let session = Self::open_session(record)?;
        let stdout = session.run_with_timeout(
            &format!("sacct -j {} -n -o State%20 -X", slurm_job_id),
            SLURM_COMMAND_TIMEOUT,
        )?;
        let state = match stdout.lines().next() {
            Some(line) if !line.trim().is_empty() => map_sacct_state(line.trim()),
            // sacct knows nothing yet right after submit.
            _ => ExecutionState::Pending,
        };
        Ok(JobStatusReport::for_job(record, state))
    }

    async fn kill(&self, record: &JobRecord, _siblings: &[JobRecord]) -> Result<JobRecord> {
        let slurm_job_id = record.data_str("slurm_job_id").ok_or(Error::MissingField {
            executor: ExecutorKind::Slurm,
            field: "data.slurm_job_id",
        })?;
        let session = Self::open_session(record)?;
        session.run_with_timeout(
            &format!("scancel {}", slurm_job_id),
            SLURM_COMMAND_TIMEOUT,
        )?;
        let mut updated = record.clone();
        updated.set_data("killed", true);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nel_core::{InvocationId, RunConfig};
    use nel_task_registry::TaskDefinition;
    use std::path::Path;

    fn context(output_dir: &Path, with_deployment: bool) -> ExecutionContext {
        let deployment = if with_deployment {
            r#"
deployment:
  type: vllm
  image: nvcr.io/nim/vllm:24.05
  checkpoint: /models/llama
  served_model_name: meta/llama
  tensor_parallel: 4
"#
        } else {
            ""
        };
        let yaml = format!(
            r#"
executor:
  type: slurm
  hostname: login-1.cluster
  username: ops
  account: gpu-account
  partition: batch
  walltime: "04:00:00"
  gres: gpu:8
  remote_rundir: /scratch/nel
  dry_run: true
{deployment}
target:
  api_endpoint:
    url: http://existing:8000/v1
    model_id: meta/llama
evaluation:
  env_vars:
    evaluation:
      HF_TOKEN: hf-test-token
  tasks:
    - name: simple-evals.aime2025
execution:
  output_dir: {}
"#,
            output_dir.display()
        );
        let (config, frozen) = RunConfig::from_yaml_str(&yaml).unwrap();
        ExecutionContext {
            invocation_id: InvocationId::parse("feedfacefeedface").unwrap(),
            config,
            frozen,
            tasks: vec![ResolvedTask {
                spec_name: "simple-evals.aime2025".to_string(),
                definition: TaskDefinition {
                    harness: "simple-evals".to_string(),
                    name: "aime2025".to_string(),
                    container: "nvcr.io/eval-factory/simple-evals:1.0".to_string(),
                    container_digest: "sha256:abc".to_string(),
                    endpoint_type: "chat".to_string(),
                    description: String::new(),
                    required_env_vars: vec![],
                    defaults: serde_json::Value::Null,
                },
                overrides: None,
            }],
        }
    }

    #[test]
    fn test_parse_sbatch_job_id() {
        assert_eq!(
            parse_sbatch_job_id("Submitted batch job 123456\n"),
            Some("123456".to_string())
        );
        assert_eq!(
            parse_sbatch_job_id("warning: reservation\nSubmitted batch job 7"),
            Some("7".to_string())
        );
        assert_eq!(parse_sbatch_job_id("sbatch: error: invalid partition"), None);
        assert_eq!(parse_sbatch_job_id("Submitted batch job abc"), None);
    }

    #[test]
    fn test_sacct_state_mapping() {
        assert_eq!(map_sacct_state("PENDING"), ExecutionState::Pending);
        assert_eq!(map_sacct_state("CONFIGURING"), ExecutionState::Pending);
        assert_eq!(map_sacct_state("RUNNING"), ExecutionState::Running);
        assert_eq!(map_sacct_state("COMPLETING"), ExecutionState::Running);
        assert_eq!(map_sacct_state("COMPLETED"), ExecutionState::Success);
        assert_eq!(map_sacct_state("FAILED"), ExecutionState::Failed);
        assert_eq!(map_sacct_state("OUT_OF_MEMORY"), ExecutionState::Failed);
        assert_eq!(map_sacct_state("TIMEOUT"), ExecutionState::Failed);
        assert_eq!(map_sacct_state("NODE_FAIL"), ExecutionState::Failed);
        assert_eq!(map_sacct_state("CANCELLED"), ExecutionState::Killed);
        assert_eq!(map_sacct_state("CANCELLED by 1000"), ExecutionState::Killed);
        assert_eq!(map_sacct_state("REQUEUED"), ExecutionState::Pending);
        assert_eq!(map_sacct_state(""), ExecutionState::Pending);
    }

    #[tokio::test]
    async fn test_dry_run_renders_scripts_with_dependency_chain() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), true);
        let records = SlurmExecutor::new().execute(&ctx).await.unwrap();
        assert!(records.is_empty());

        let invocation_dir = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let sbatch_dir = invocation_dir.join("sbatch");

        let deploy = std::fs::read_to_string(sbatch_dir.join("deployment.sbatch")).unwrap();
        assert!(deploy.contains("#SBATCH --account=gpu-account"));
        assert!(deploy.contains("#SBATCH --gres=gpu:8"));
        assert!(deploy.contains("endpoint_url"));
        assert!(deploy.contains("--tensor-parallel-size 4"));

        let eval = std::fs::read_to_string(sbatch_dir.join("aime2025.sbatch")).unwrap();
        assert!(eval.contains("#SBATCH --dependency=afterok:DEPLOYMENT_JOB_ID"));
        assert!(eval.contains("--network=host"));
        assert!(eval.contains("export MODEL_URL=\"$(cat"));
        assert!(eval.contains("/scratch/nel/feedfacefeedface"));

        // Every exported variable rides into the container; `$MODEL_URL` is
        // expanded by the container shell, not the sbatch shell, so it must
        // be forwarded too.
        assert!(eval.contains("export HF_TOKEN=hf-test-token"));
        let docker_line = eval
            .lines()
            .find(|line| line.contains("docker run"))
            .unwrap();
        assert!(docker_line.contains("-e HF_TOKEN"));
        assert!(docker_line.contains("-e MODEL_URL"));
        assert!(docker_line.contains("--model_url \"$MODEL_URL\""));
    }

    #[tokio::test]
    async fn test_dry_run_without_deployment_bakes_target_url() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), false);
        SlurmExecutor::new().execute(&ctx).await.unwrap();

        let invocation_dir = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let sbatch_dir = invocation_dir.join("sbatch");
        assert!(!sbatch_dir.join("deployment.sbatch").exists());

        let eval = std::fs::read_to_string(sbatch_dir.join("aime2025.sbatch")).unwrap();
        assert!(!eval.contains("--dependency"));
        assert!(eval.contains("http://existing:8000/v1"));
    }
}
