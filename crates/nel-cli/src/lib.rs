//! NeMo evaluator launcher CLI library

pub mod launch;
pub mod tasks;

// Re-export CLI types for testing
pub use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nel")]
#[command(about = "NeMo evaluator launcher")]
#[command(version, author, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a run configuration and print the invocation id
    Run(launch::RunArgs),
    /// Print the status of an invocation or job as JSON
    Status(launch::StatusArgs),
    /// Kill an invocation or a single job
    Kill(launch::KillArgs),
    /// Stream a job's log output until EOF or ^C
    Logs(launch::LogsArgs),
    /// Export job artifacts to a sink
    Export(launch::ExportArgs),
    /// Task registry commands
    Tasks {
        #[command(subcommand)]
        subcommand: tasks::TasksCommands,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_all_subcommands() {
        Cli::parse_from(["nel", "run", "config.yaml"]);
        Cli::parse_from(["nel", "status", "0123456789abcdef"]);
        Cli::parse_from(["nel", "kill", "0123456789abcdef.2"]);
        Cli::parse_from(["nel", "logs", "0123456789abcdef.0"]);
        Cli::parse_from(["nel", "export", "0123456789abcdef", "--dest", "local", "-o", "output_dir=/tmp/x"]);
        Cli::parse_from(["nel", "tasks", "ls"]);
        let cli = Cli::parse_from([
            "nel", "tasks", "build", "--mapping", "m.toml", "--output", "defs.json",
        ]);
        match cli.command {
            Commands::Tasks {
                subcommand: tasks::TasksCommands::Build(args),
            } => {
                assert_eq!(
                    args.common.mapping.as_deref(),
                    Some(std::path::Path::new("m.toml"))
                );
                assert_eq!(args.output.as_deref(), Some(std::path::Path::new("defs.json")));
            }
            _ => panic!("expected tasks build"),
        }
    }
}
