mod cli;
mod commands;
mod output;
mod storage;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use output::OutputFormat;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so command output stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("lockbox=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = OutputFormat::from_flag(cli.json);

    match &cli.command {
        Commands::Register(args) => commands::account::register(args, format).await,
        Commands::Login(args) => commands::account::login(args, format).await,
        Commands::Sql(args) => commands::sql::run(args, format).await,
        Commands::Recover(args) => commands::recover::run(args, format).await,
        Commands::Info(args) => commands::info::run(args, format).await,
    }
}
