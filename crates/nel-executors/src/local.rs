//! Local backend: detached docker runs on this machine.
//!
//! Submission materializes one `run.sh` per task plus an aggregate
//! `run_all.sequential.sh`, then spawns the aggregate detached in its own
//! process group. There is no daemon; job state is derived on demand from
//! stage marker files the scripts leave behind.

use crate::{
    invocation_dirname, shell_quote, Error, ExecutionContext, Executor, JobStatusReport,
    ResolvedTask, Result,
};
use async_trait::async_trait;
use nel_core::{ExecutionState, ExecutorKind};
use nel_db::JobRecord;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::MetadataExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// SIGTERM-to-SIGKILL grace period.
const KILL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }

    fn render_run_script(
        ctx: &ExecutionContext,
        task: &ResolvedTask,
        task_dir: &Path,
    ) -> Result<String> {
        let env = ctx.job_env(task)?;
        let target_url = ctx.target_url()?;
        // The running marker is written by the container itself, so a job
        // that never gets its container started stays PENDING.
        let command = format!(
            "date -u +%Y-%m-%dT%H:%M:%SZ > /job-logs/stage.running && {}",
            ctx.eval_command(task, target_url)
        );

        let mut script = String::from("#!/usr/bin/env bash\n");
        script.push_str(&format!("TASK_DIR={}\n", shell_quote(&task_dir.display().to_string())));
        script.push_str("LOGS=\"$TASK_DIR/logs\"\n");
        script.push_str("ARTIFACTS=\"$TASK_DIR/artifacts\"\n");
        script.push_str("date -u +%Y-%m-%dT%H:%M:%SZ > \"$LOGS/stage.pre-start\"\n");
        script.push_str("docker run --rm \\\n");
        for (name, value) in &env {
            script.push_str(&format!("  -e {}={} \\\n", name, shell_quote(value)));
        }
        script.push_str("  -v \"$ARTIFACTS\":/results \\\n");
        script.push_str("  -v \"$LOGS\":/job-logs \\\n");
        script.push_str(&format!(
            "  {} bash -c {} > \"$LOGS/client_stdout.log\" 2>&1\n",
            shell_quote(&task.definition.container),
            shell_quote(&command),
        ));
        script.push_str("EXIT_CODE=$?\n");
        script.push_str(
            "echo \"$(date -u +%Y-%m-%dT%H:%M:%SZ) $EXIT_CODE\" > \"$LOGS/stage.exit\"\n",
        );
        script.push_str("exit $EXIT_CODE\n");
        Ok(script)
    }

    fn write_script(path: &Path, contents: &str) -> Result<()> {
        std::fs::write(path, contents)?;
        let mut perms = std::fs::metadata(path)?.permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(path, perms)?;
        Ok(())
    }

    /// Derive the job state from the stage markers, per the filesystem state
    /// machine. A kill marker wins unless the run already reached its exit
    /// stage before the signal landed.
    fn derive_state(record: &JobRecord, task_dir: &Path) -> ExecutionState {
        let logs = task_dir.join("logs");
        let exit_path = logs.join("stage.exit");
        if record.data_bool("killed") && !exit_path.exists() {
            return ExecutionState::Killed;
        }
        if let Ok(body) = std::fs::read_to_string(&exit_path) {
            return match body.split_whitespace().last().and_then(|c| c.parse::<i32>().ok()) {
                Some(0) => ExecutionState::Success,
                _ => ExecutionState::Failed,
            };
        }
        if logs.join("stage.running").exists() {
            return ExecutionState::Running;
        }
        ExecutionState::Pending
    }

    /// Samples completed, normalized to `[0, 1]` when the run configuration
    /// declares a sample limit.
    fn derive_progress(task_dir: &Path) -> Option<f64> {
        let artifacts = task_dir.join("artifacts");
        let processed: u64 = std::fs::read_to_string(artifacts.join("progress"))
            .ok()?
            .trim()
            .parse()
            .ok()?;
        if let Some(limit) = sample_limit(&artifacts.join("run_config.yml")) {
            if limit > 0 {
                return Some((processed as f64 / limit as f64).min(1.0));
            }
        }
        Some(processed as f64)
    }
}

/// Look up `limit_samples` anywhere in the harness run configuration.
fn sample_limit(run_config: &Path) -> Option<u64> {
    let text = std::fs::read_to_string(run_config).ok()?;
    let value: serde_yaml::Value = serde_yaml::from_str(&text).ok()?;
    find_limit(&value)
}

fn find_limit(value: &serde_yaml::Value) -> Option<u64> {
    if let serde_yaml::Value::Mapping(map) = value {
        for (key, child) in map {
            if key.as_str() == Some("limit_samples") {
                if let Some(limit) = child.as_u64() {
                    return Some(limit);
                }
            }
            if let Some(limit) = find_limit(child) {
                return Some(limit);
            }
        }
    }
    None
}

#[async_trait]
impl Executor for LocalExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Local
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Vec<JobRecord>> {
        let invocation_dir = ctx
            .config
            .execution
            .output_dir
            .join(invocation_dirname(&ctx.invocation_id));
        std::fs::create_dir_all(&invocation_dir)?;

        let mut task_dirs = Vec::with_capacity(ctx.tasks.len());
        for task in &ctx.tasks {
            let task_dir = invocation_dir.join(&task.definition.name);
            std::fs::create_dir_all(task_dir.join("artifacts"))?;
            std::fs::create_dir_all(task_dir.join("logs"))?;
            let script = Self::render_run_script(ctx, task, &task_dir)?;
            Self::write_script(&task_dir.join("run.sh"), &script)?;
            task_dirs.push(task_dir);
        }

        let mut aggregate = String::from("#!/usr/bin/env bash\n");
        for task_dir in &task_dirs {
            aggregate.push_str(&format!(
                "bash {}\n",
                shell_quote(&task_dir.join("run.sh").display().to_string())
            ));
        }
        let run_all = invocation_dir.join("run_all.sequential.sh");
        Self::write_script(&run_all, &aggregate)?;

        if ctx.config.executor.dry_run {
            info!(dir = %invocation_dir.display(), "dry run, scripts written, nothing spawned");
            return Ok(Vec::new());
        }

        let spawn_log = File::create(invocation_dir.join("run_all.log"))?;
        let child = Command::new("bash")
            .arg(&run_all)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::from(spawn_log.try_clone()?))
            .stderr(Stdio::from(spawn_log))
            .spawn()?;
        let pgid = child.id() as i64;
        debug!(pgid, dir = %invocation_dir.display(), "spawned detached run");

        let mut records = Vec::with_capacity(ctx.tasks.len());
        for (index, task_dir) in task_dirs.iter().enumerate() {
            let mut record = JobRecord::new(
                &ctx.invocation_id.job(index),
                ExecutorKind::Local,
                ctx.frozen.clone(),
            );
            record.set_data("output_dir", task_dir.display().to_string());
            record.set_data("pgid", pgid);
            records.push(record);
        }
        Ok(records)
    }

    async fn status(&self, record: &JobRecord) -> Result<JobStatusReport> {
        let task_dir = match record.data_str("output_dir") {
            Some(dir) => PathBuf::from(dir),
            None => {
                return Ok(JobStatusReport::for_job(record, ExecutionState::Pending));
            }
        };
        let mut report = JobStatusReport::for_job(record, Self::derive_state(record, &task_dir));
        report.progress = Self::derive_progress(&task_dir);
        Ok(report)
    }

    async fn kill(&self, record: &JobRecord, _siblings: &[JobRecord]) -> Result<JobRecord> {
        let mut updated = record.clone();
        updated.set_data("killed", true);
        let pgid = match record.data_i64("pgid") {
            Some(pgid) => Pid::from_raw(pgid as i32),
            None => return Ok(updated),
        };

        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(updated),
            Err(e) => {
                return Err(Error::Kill {
                    job_id: record.job_id.clone(),
                    message: e.to_string(),
                })
            }
        }

        let deadline = tokio::time::Instant::now() + KILL_GRACE;
        while tokio::time::Instant::now() < deadline {
            if killpg(pgid, None) == Err(Errno::ESRCH) {
                return Ok(updated);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        if let Err(e) = killpg(pgid, Signal::SIGKILL) {
            if e != Errno::ESRCH {
                warn!(%pgid, error = %e, "SIGKILL after grace period failed");
            }
        }
        Ok(updated)
    }

    fn stream_logs(&self, record: &JobRecord) -> Result<LogStream> {
        let task_dir = record.data_str("output_dir").ok_or(Error::NotSupported {
            executor: ExecutorKind::Local,
            operation: "log streaming before the job has an output directory",
        })?;
        Ok(LogStream::new(
            PathBuf::from(task_dir).join("logs").join("client_stdout.log"),
            PathBuf::from(task_dir).join("logs").join("stage.exit"),
        ))
    }
}

/// Rotation-safe blocking tail over the client stdout log.
///
/// Yields lines until the job's exit marker appears and the file is drained,
/// or until the cancellation flag is set.
pub struct LogStream {
    path: PathBuf,
    exit_marker: PathBuf,
    reader: Option<BufReader<File>>,
    inode: u64,
    cancelled: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl LogStream {
    fn new(path: PathBuf, exit_marker: PathBuf) -> Self {
        Self {
            path,
            exit_marker,
            reader: None,
            inode: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Handle the caller can flip (from a signal handler) to end the stream.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Reopen when the file appears or was rotated out from under us.
    fn ensure_open(&mut self) -> bool {
        let current_inode = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.ino(),
            Err(_) => return self.reader.is_some(),
        };
        if self.reader.is_none() || current_inode != self.inode {
            if let Ok(file) = File::open(&self.path) {
                self.reader = Some(BufReader::new(file));
                self.inode = current_inode;
            }
        }
        self.reader.is_some()
    }
}

impl Iterator for LogStream {
    type Item = std::io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cancelled.load(Ordering::Relaxed) {
                return None;
            }
            if self.ensure_open() {
                let mut line = String::new();
                let reader = self.reader.as_mut()?;
                match reader.read_line(&mut line) {
                    Ok(0) => {}
                    Ok(_) => {
                        while line.ends_with('\n') || line.ends_with('\r') {
                            line.pop();
                        }
                        return Some(Ok(line));
                    }
                    Err(e) => return Some(Err(e)),
                }
            }
            // At EOF. A present exit marker means no more output will come.
            if self.exit_marker.exists() {
                return None;
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nel_core::{InvocationId, RunConfig};
    use nel_task_registry::TaskDefinition;

    fn context(output_dir: &Path, dry_run: bool) -> ExecutionContext {
        let yaml = format!(
            r#"
executor:
  type: local
  dry_run: {dry_run}
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
        );
        let (config, frozen) = RunConfig::from_yaml_str(&yaml).unwrap();
        ExecutionContext {
            invocation_id: InvocationId::generate(),
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

    fn record_with_dir(task_dir: &Path) -> JobRecord {
        let inv = InvocationId::generate();
        let mut record = JobRecord::new(&inv.job(0), ExecutorKind::Local, serde_json::json!({}));
        record.set_data("output_dir", task_dir.display().to_string());
        record
    }

    #[tokio::test]
    async fn test_dry_run_writes_scripts_only() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), true);
        let records = LocalExecutor::new().execute(&ctx).await.unwrap();
        assert!(records.is_empty());

        let invocation_dir = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let run_sh =
            std::fs::read_to_string(invocation_dir.join("aime2025").join("run.sh")).unwrap();
        assert!(run_sh.contains("docker run --rm"));
        assert!(run_sh.contains("nvcr.io/eval-factory/simple-evals:1.0"));
        assert!(run_sh.contains("stage.pre-start"));
        assert!(run_sh.contains("stage.exit"));
        assert!(invocation_dir.join("run_all.sequential.sh").exists());

        // The running marker comes from inside the container, so a container
        // that never starts leaves the job PENDING.
        assert!(run_sh.contains("-v \"$LOGS\":/job-logs"));
        assert!(run_sh.contains("/job-logs/stage.running && nemo-evaluator"));
        assert!(!run_sh.contains("\"$LOGS/stage.running\""));
    }

    #[tokio::test]
    async fn test_execute_records_output_dir_and_pgid() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), false);
        let records = LocalExecutor::new().execute(&ctx).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].job_id, format!("{}.0", ctx.invocation_id));
        assert!(records[0].data_i64("pgid").is_some());
        let output_dir = records[0].data_str("output_dir").unwrap();
        assert!(output_dir.ends_with("aime2025"));
    }

    #[test]
    fn test_state_machine_from_markers() {
        let dir = tempfile::tempdir().unwrap();
        let task_dir = dir.path().join("task");
        let logs = task_dir.join("logs");
        let record = record_with_dir(&task_dir);

        // Output dir missing.
        assert_eq!(
            LocalExecutor::derive_state(&record, &task_dir),
            ExecutionState::Pending
        );

        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(logs.join("stage.pre-start"), "2026-01-01T00:00:00Z").unwrap();
        assert_eq!(
            LocalExecutor::derive_state(&record, &task_dir),
            ExecutionState::Pending
        );

        std::fs::write(logs.join("stage.running"), "2026-01-01T00:00:01Z").unwrap();
        assert_eq!(
            LocalExecutor::derive_state(&record, &task_dir),
            ExecutionState::Running
        );

        std::fs::write(logs.join("stage.exit"), "2026-01-01T00:10:00Z 0").unwrap();
        assert_eq!(
            LocalExecutor::derive_state(&record, &task_dir),
            ExecutionState::Success
        );

        std::fs::write(logs.join("stage.exit"), "2026-01-01T00:10:00Z 137").unwrap();
        assert_eq!(
            LocalExecutor::derive_state(&record, &task_dir),
            ExecutionState::Failed
        );

        std::fs::write(logs.join("stage.exit"), "garbage").unwrap();
        assert_eq!(
            LocalExecutor::derive_state(&record, &task_dir),
            ExecutionState::Failed
        );
    }

    #[test]
    fn test_kill_marker_does_not_mask_completed_run() {
        let dir = tempfile::tempdir().unwrap();
        let task_dir = dir.path().join("task");
        let logs = task_dir.join("logs");
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(logs.join("stage.running"), "ts").unwrap();

        let mut record = record_with_dir(&task_dir);
        record.set_data("killed", true);
        assert_eq!(
            LocalExecutor::derive_state(&record, &task_dir),
            ExecutionState::Killed
        );

        // Exit marker landed before the signal: the real outcome wins.
        std::fs::write(logs.join("stage.exit"), "ts 0").unwrap();
        assert_eq!(
            LocalExecutor::derive_state(&record, &task_dir),
            ExecutionState::Success
        );
    }

    #[test]
    fn test_progress_normalized_by_sample_limit() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = dir.path().join("artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();

        std::fs::write(artifacts.join("progress"), "30\n").unwrap();
        // No limit declared: raw count.
        assert_eq!(LocalExecutor::derive_progress(dir.path()), Some(30.0));

        std::fs::write(
            artifacts.join("run_config.yml"),
            "config:\n  params:\n    limit_samples: 120\n",
        )
        .unwrap();
        assert_eq!(LocalExecutor::derive_progress(dir.path()), Some(0.25));
    }

    #[test]
    fn test_non_numeric_progress_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = dir.path().join("artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();
        std::fs::write(artifacts.join("progress"), "almost done\n").unwrap();
        assert_eq!(LocalExecutor::derive_progress(dir.path()), None);
    }

    #[tokio::test]
    async fn test_kill_without_pgid_marks_killed() {
        let dir = tempfile::tempdir().unwrap();
        let record = record_with_dir(dir.path());
        let updated = LocalExecutor::new().kill(&record, &[]).await.unwrap();
        assert!(updated.data_bool("killed"));
    }

    #[test]
    fn test_log_stream_tails_and_stops_at_exit_marker() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("client_stdout.log");
        let exit_marker = dir.path().join("stage.exit");
        std::fs::write(&log, "line one\nline two\n").unwrap();
        std::fs::write(&exit_marker, "ts 0").unwrap();

        let stream = LogStream::new(log, exit_marker);
        let lines: Vec<String> = stream.map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec!["line one", "line two"]);
    }
}
