use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "triage")]
#[command(version, about = "Support-ticket tracker for chat threads")]
pub struct Cli {
    /// Database path. Overrides TRIAGE_DB.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the tracker database
    Init,
    /// Run the dashboard API server
    Serve {
        /// Port to serve on
        #[arg(short, long, default_value = "8315")]
        port: u16,

        /// Enable dev mode (bind all interfaces, permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Drain pending AI jobs
    Worker {
        /// Drain once and exit instead of polling
        #[arg(long)]
        once: bool,

        /// Seconds to sleep between drains
        #[arg(long, default_value = "10")]
        interval: u64,
    },
    /// Ingest a thread transcript from a JSON file
    Ingest {
        /// Channel id the thread belongs to
        #[arg(long)]
        channel: String,

        /// Root timestamp of the thread
        #[arg(long)]
        thread: String,

        /// User id that triggered the ingestion
        #[arg(long, default_value = "cli")]
        user: String,

        /// Path to the transcript file (JSON array of messages, oldest first)
        file: PathBuf,

        /// Drain the AI job queue immediately after ingesting
        #[arg(long)]
        process: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let db_path = cli.db_path.clone();

    match &cli.command {
        Commands::Init => {
            let path =
                db_path.unwrap_or_else(|| triage::config::TrackerConfig::from_env().db_path);
            cmd::cmd_init(&path)?;
        }
        Commands::Serve { port, dev } => {
            cmd::cmd_serve(*port, db_path, *dev).await?;
        }
        Commands::Worker { once, interval } => {
            cmd::cmd_worker(db_path, *once, *interval).await?;
        }
        Commands::Ingest {
            channel,
            thread,
            user,
            file,
            process,
        } => {
            cmd::cmd_ingest(db_path, channel, thread, user, file, *process).await?;
        }
    }

    Ok(())
}
