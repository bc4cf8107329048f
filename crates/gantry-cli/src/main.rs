//! Gantry CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod client;
mod commands;

use client::{ApiClient, JobRef};

#[derive(Parser)]
#[command(name = "gantry")]
#[command(about = "Gantry build scheduler CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "GANTRY_API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    /// Bearer token for private resources
    #[arg(long, env = "GANTRY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage builds
    Builds {
        #[command(subcommand)]
        command: BuildCommands,
    },
    /// Pause a job so no new builds start
    Pause {
        /// Job as team/pipeline/job
        job: JobRef,
    },
    /// Resume scheduling a paused job
    Unpause {
        /// Job as team/pipeline/job
        job: JobRef,
    },
    /// Validate a node configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "gantry.kdl")]
        path: String,
    },
}

#[derive(Subcommand)]
enum BuildCommands {
    /// Trigger a new build of a job
    Trigger {
        /// Job as team/pipeline/job
        job: JobRef,
        /// Watch the build's events after triggering
        #[arg(short, long)]
        watch: bool,
    },
    /// List recent builds of a job
    List {
        /// Job as team/pipeline/job
        job: JobRef,
        /// Maximum number of builds to show
        #[arg(long, default_value = "10")]
        limit: u32,
    },
    /// Show build details
    Show {
        /// Build ID
        id: i64,
    },
    /// Stream a build's events until it finishes
    Watch {
        /// Build ID
        id: i64,
        /// Resume after this event id
        #[arg(long)]
        since: Option<u64>,
    },
    /// Abort a build
    Abort {
        /// Build ID
        id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = || ApiClient::new(&cli.api_url, cli.token.clone());

    match cli.command {
        Commands::Builds { command } => match command {
            BuildCommands::Trigger { job, watch } => {
                commands::builds::trigger(&client()?, &job, watch).await?;
            }
            BuildCommands::List { job, limit } => {
                commands::builds::list(&client()?, &job, limit).await?;
            }
            BuildCommands::Show { id } => {
                commands::builds::show(&client()?, id).await?;
            }
            BuildCommands::Watch { id, since } => {
                commands::builds::watch(&client()?, id, since).await?;
            }
            BuildCommands::Abort { id } => {
                commands::builds::abort(&client()?, id).await?;
            }
        },
        Commands::Pause { job } => {
            commands::jobs::set_paused(&client()?, &job, true).await?;
        }
        Commands::Unpause { job } => {
            commands::jobs::set_paused(&client()?, &job, false).await?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}
