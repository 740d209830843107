//! Task registry commands.

use crate::launch::CommonArgs;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use nel_task_registry::{mapping, MappingFile, TaskRegistry};
use std::path::PathBuf;
use tracing::warn;

#[derive(Subcommand)]
pub enum TasksCommands {
    /// List every known task
    Ls(TasksLsArgs),
    /// Regenerate the task-definitions artifact from the harness containers
    Build(TasksBuildArgs),
}

impl TasksCommands {
    pub async fn run(self) -> Result<()> {
        match self {
            TasksCommands::Ls(args) => args.run(),
            TasksCommands::Build(args) => args.run().await,
        }
    }
}

#[derive(Args)]
pub struct TasksLsArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

impl TasksLsArgs {
    pub fn run(self) -> Result<()> {
        let registry = TaskRegistry::load(
            &self.common.mapping_path()?,
            &self.common.definitions_path()?,
        )?;
        for task in registry.iter() {
            println!(
                "{}.{}\t{}\t{}",
                task.harness, task.name, task.endpoint_type, task.description
            );
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct TasksBuildArgs {
    /// Where to write the generated artifact
    /// (defaults to the --task-definitions path)
    #[arg(long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl TasksBuildArgs {
    /// Pull each harness's `framework.yml` straight out of its container
    /// image (partial pull, no docker daemon) and assemble the definitions
    /// artifact, stamped with the mapping file's checksum.
    pub async fn run(self) -> Result<()> {
        let mapping_path = self.common.mapping_path()?;
        let output = match &self.output {
            Some(path) => path.clone(),
            None => self.common.definitions_path()?,
        };

        let mapping_bytes = std::fs::read(&mapping_path)
            .with_context(|| format!("reading {}", mapping_path.display()))?;
        let file = MappingFile::load(&mapping_path)?;

        let mut registry = TaskRegistry::new();
        for (harness, decl) in &file.harness {
            match nel_docker_meta::extract_framework_yml(&decl.container).await {
                Ok(Some((framework_yml, digest))) => {
                    let added = registry.insert_framework(
                        harness,
                        &decl.container,
                        &digest,
                        &framework_yml,
                    )?;
                    println!("{}: {} tasks ({})", harness, added, decl.container);
                }
                Ok(None) => {
                    warn!(harness, container = %decl.container, "no framework.yml in image");
                }
                Err(e) => {
                    warn!(harness, container = %decl.container, error = %e, "metadata pull failed");
                }
            }
        }

        let artifact = serde_json::json!({
            "mapping_checksum": mapping::checksum(&mapping_bytes),
            "tasks": registry.iter().collect::<Vec<_>>(),
        });
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&output, serde_json::to_string_pretty(&artifact)?)?;
        println!(
            "wrote {} task definitions to {}",
            registry.len(),
            output.display()
        );
        Ok(())
    }
}
