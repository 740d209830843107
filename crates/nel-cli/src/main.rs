use anyhow::Result;
use nel_cli::{Cli, Commands, Parser};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => args.run().await,
        Commands::Status(args) => args.run().await,
        Commands::Kill(args) => args.run().await,
        Commands::Logs(args) => args.run().await,
        Commands::Export(args) => args.run().await,
        Commands::Tasks { subcommand } => subcommand.run().await,
    }
}
