//! The five launcher operations.

use anyhow::{Context, Result};
use clap::Args;
use nel_api::{KillStatus, Launcher};
use nel_core::Identifier;
use nel_db::ExecutionDb;
use nel_task_registry::TaskRegistry;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

/// Options shared by every operation.
#[derive(Args)]
pub struct CommonArgs {
    /// Execution database file (defaults to ~/.nemo-evaluator/exec.db.jsonl)
    #[arg(long = "db", value_name = "FILE")]
    pub db: Option<PathBuf>,

    /// Harness mapping file (defaults to ~/.nemo-evaluator/mapping.toml)
    #[arg(long = "mapping", value_name = "FILE")]
    pub mapping: Option<PathBuf>,

    /// Generated task-definitions artifact
    /// (defaults to ~/.nemo-evaluator/task-definitions.json)
    #[arg(long = "task-definitions", value_name = "FILE")]
    pub task_definitions: Option<PathBuf>,
}

impl CommonArgs {
    fn open_db(&self) -> Result<ExecutionDb> {
        Ok(match &self.db {
            Some(path) => ExecutionDb::open(path)?,
            None => ExecutionDb::open_default()?,
        })
    }

    pub(crate) fn config_dir() -> Result<PathBuf> {
        Ok(ExecutionDb::default_path()?
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".")))
    }

    pub(crate) fn mapping_path(&self) -> Result<PathBuf> {
        Ok(match &self.mapping {
            Some(path) => path.clone(),
            None => Self::config_dir()?.join("mapping.toml"),
        })
    }

    pub(crate) fn definitions_path(&self) -> Result<PathBuf> {
        Ok(match &self.task_definitions {
            Some(path) => path.clone(),
            None => Self::config_dir()?.join("task-definitions.json"),
        })
    }

    /// Launcher with the task registry loaded; only `run` needs it.
    fn launcher_with_registry(&self) -> Result<Launcher> {
        let mapping = self.mapping_path()?;
        let definitions = self.definitions_path()?;
        let registry = TaskRegistry::load(&mapping, &definitions).with_context(|| {
            format!(
                "loading task registry from {} / {} (run `nel tasks build` first)",
                mapping.display(),
                definitions.display()
            )
        })?;
        Ok(Launcher::new(self.open_db()?, registry))
    }

    /// Launcher without a registry, for operations on persisted jobs.
    fn launcher(&self) -> Result<Launcher> {
        Ok(Launcher::new(self.open_db()?, TaskRegistry::new()))
    }
}

fn parse_id(id: &str) -> Result<Identifier> {
    id.parse::<Identifier>()
        .with_context(|| format!("invalid identifier '{}'", id))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Args)]
pub struct RunArgs {
    /// Run configuration YAML file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl RunArgs {
    pub async fn run(self) -> Result<()> {
        let yaml = std::fs::read_to_string(&self.config)
            .with_context(|| format!("reading {}", self.config.display()))?;
        let launcher = self.common.launcher_with_registry()?;
        let invocation_id = launcher.run(&yaml).await?;
        println!("{}", invocation_id);
        Ok(())
    }
}

#[derive(Args)]
pub struct StatusArgs {
    /// Invocation id or <invocation>.<index> job id
    #[arg(value_name = "ID")]
    pub id: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl StatusArgs {
    pub async fn run(self) -> Result<()> {
        let id = parse_id(&self.id)?;
        let reports = self.common.launcher()?.status(&id).await?;
        print_json(&reports)
    }
}

#[derive(Args)]
pub struct KillArgs {
    /// Invocation id or <invocation>.<index> job id
    #[arg(value_name = "ID")]
    pub id: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl KillArgs {
    pub async fn run(self) -> Result<()> {
        let id = parse_id(&self.id)?;
        let outcomes = self.common.launcher()?.kill(&id).await?;
        print_json(&outcomes)?;
        if !outcomes.is_empty() && outcomes.iter().all(|o| o.status == KillStatus::Error) {
            anyhow::bail!("no job could be killed");
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct LogsArgs {
    /// Invocation id or <invocation>.<index> job id
    #[arg(value_name = "ID")]
    pub id: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl LogsArgs {
    pub async fn run(self) -> Result<()> {
        let id = parse_id(&self.id)?;
        let stream = self.common.launcher()?.stream_logs(&id)?;
        let cancel = stream.cancel_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.store(true, Ordering::Relaxed);
            }
        });
        tokio::task::spawn_blocking(move || -> Result<()> {
            for line in stream {
                println!("{}", line?);
            }
            Ok(())
        })
        .await??;
        Ok(())
    }
}

#[derive(Args)]
pub struct ExportArgs {
    /// Invocation id or <invocation>.<index> job id
    #[arg(value_name = "ID")]
    pub id: String,

    /// Export sink
    #[arg(long = "dest", value_name = "SINK", default_value = "local")]
    pub dest: String,

    /// Sink-specific option, repeatable
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    pub options: Vec<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl ExportArgs {
    pub async fn run(self) -> Result<()> {
        let id = parse_id(&self.id)?;
        let options = parse_options(&self.options)?;
        let results = self
            .common
            .launcher()?
            .export(&id, &self.dest, &options)
            .await?;
        print_json(&results)
    }
}

/// Parse repeated `key=value` flags; values that read as JSON scalars keep
/// their type, everything else stays a string.
fn parse_options(pairs: &[String]) -> Result<serde_json::Map<String, serde_json::Value>> {
    let mut options = serde_json::Map::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("option '{}' is not KEY=VALUE", pair))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        options.insert(key.to_string(), value);
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options_types() {
        let options = parse_options(&[
            "output_dir=/tmp/x".to_string(),
            "only_required=true".to_string(),
            "retries=3".to_string(),
        ])
        .unwrap();
        assert_eq!(options["output_dir"], "/tmp/x");
        assert_eq!(options["only_required"], true);
        assert_eq!(options["retries"], 3);
        assert!(parse_options(&["no-equals".to_string()]).is_err());
    }
}
