//! Canopy CLI — the main entry point.
//!
//! Commands:
//! - `serve`  — Start the HTTP gateway and run orchestrator
//! - `config` — Print the effective configuration (secrets redacted)

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "canopy",
    about = "Canopy — hierarchical LLM agent run orchestrator",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the SQLite database path
        #[arg(long)]
        database: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let mut config = canopy_config::CanopyConfig::load()?;

    match cli.command {
        Commands::Serve { port, database } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(database) = database {
                config.database_path = database;
            }
            canopy_gateway::serve(config).await?;
        }
        Commands::Config => {
            println!("{config:#?}");
        }
    }

    Ok(())
}
