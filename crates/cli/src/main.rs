//! askdb CLI, the main entry point.
//!
//! Commands:
//! - `init`    write a default config file
//! - `serve`   run the HTTP gateway
//! - `ask`     answer one question and exit
//! - `schema`  print what the reasoning engine will see of the database
//! - `doctor`  check configuration and connectivity

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "askdb",
    about = "askdb: ask questions about a PostgreSQL database in natural language",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of ~/.askdb/config.toml
    #[arg(short, long, global = true, env = "ASKDB_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Start the HTTP gateway
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Answer a single question
    Ask {
        /// The question
        #[arg(short, long)]
        message: String,

        /// JSON file with prior turns, e.g. [{"user": "...", "bot": "..."}]
        #[arg(long)]
        history: Option<PathBuf>,
    },

    /// Print the schema description and static tables
    Schema,

    /// Diagnose configuration and connectivity
    Doctor,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Init { force } => commands::init::run(config_path, force)?,
        Commands::Serve { port } => commands::serve::run(config_path, port).await?,
        Commands::Ask { message, history } => {
            commands::ask::run(config_path, &message, history.as_deref()).await?
        }
        Commands::Schema => commands::schema::run(config_path).await?,
        Commands::Doctor => commands::doctor::run(config_path).await?,
    }

    Ok(())
}
