//! Thread ingestion command — `triage ingest`.
//!
//! Reads a thread transcript from a JSON file (an array of messages, oldest
//! first) and runs the same flow the chat-platform listener does: register
//! the issue, persist events and participants, enqueue the summarization
//! job. With `--process`, the pending queue is drained immediately.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;

use triage::ai::{AiClient, Summarizer, UnconfiguredSummarizer};
use triage::config::TrackerConfig;
use triage::db::{DbHandle, TrackerDb};
use triage::errors::AiError;
use triage::ingest::{IngestOutcome, ThreadIngestor, ThreadMessage};
use triage::pipeline::JobPipeline;

pub async fn cmd_ingest(
    db_path: Option<PathBuf>,
    channel: &str,
    thread: &str,
    user: &str,
    file: &std::path::Path,
    process: bool,
) -> Result<()> {
    let config = TrackerConfig::from_env();
    let db_path = db_path.unwrap_or(config.db_path.clone());
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read transcript file {}", file.display()))?;
    let messages: Vec<ThreadMessage> =
        serde_json::from_str(&raw).context("Transcript file is not a JSON array of messages")?;

    // Without --process no AI call happens, so a missing key is fine; with
    // it, fail fast before writing anything.
    let summarizer: Arc<dyn Summarizer> = match AiClient::new(&config.ai) {
        Ok(client) => Arc::new(client),
        Err(AiError::MissingApiKey) if !process => Arc::new(UnconfiguredSummarizer),
        Err(e) => return Err(anyhow::Error::from(e).context("--process needs AI_API_KEY")),
    };

    let db = DbHandle::new(TrackerDb::new(&db_path)?);
    let pipeline = JobPipeline::new(db.clone(), summarizer);
    let ingestor = ThreadIngestor::new(db, pipeline.clone());

    let outcome = ingestor
        .ingest_thread(channel, thread, "import", user, &messages)
        .await?;
    match outcome {
        IngestOutcome::Created {
            issue,
            events_saved,
            participants,
            job,
        } => {
            println!("{} Issue created", style("✓").green());
            println!("  Issue ID: {}", issue.id);
            println!("  Status: {}", issue.status);
            println!("  Messages saved: {}", events_saved);
            println!("  Participants: {}", participants);
            if let Some(job) = &job {
                println!("  AI job queued: {}", job.id);
            }
        }
        IngestOutcome::AlreadyTracked(issue) => {
            println!(
                "{} An issue already exists for this thread (ID: {})",
                style("!").yellow(),
                issue.id
            );
            return Ok(());
        }
    }

    if process {
        let processed = pipeline.process_pending().await?;
        println!("Processed {} AI job(s)", processed.len());
    }
    Ok(())
}
