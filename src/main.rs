use cdcsink::cli::run::RunOptions;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "cdcsink")]
#[command(about = "Windowed CDC ingestion into an analytical table", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Newline-delimited CDC input (default: samples/customers.jsonl)
    #[arg(long, global = true)]
    input: Option<PathBuf>,

    /// Output table: *.duckdb / *.db for DuckDB, anything else for JSON lines (default: output.txt)
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cdcsink=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run) | None => {
            let options = RunOptions {
                config: cli.config,
                input: cli.input,
                output: cli.output,
            };
            cdcsink::cli::run::run(options).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => cdcsink::cli::config::init(stdout)?,
            ConfigAction::Validate => {
                let path = cdcsink::config::resolve_config_path(cli.config.as_deref());
                cdcsink::cli::config::validate(path)?
            }
        },
    }

    Ok(())
}
