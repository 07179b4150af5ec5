//! AI job worker command — `triage worker`.
//!
//! Drains the pending queue sequentially: each job makes one text-generation
//! call, and completed summaries are folded back into their issues.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;

use triage::ai::AiClient;
use triage::config::TrackerConfig;
use triage::db::{DbHandle, TrackerDb};
use triage::models::JobStatus;
use triage::pipeline::JobPipeline;

pub async fn cmd_worker(db_path: Option<PathBuf>, once: bool, interval_secs: u64) -> Result<()> {
    let config = TrackerConfig::from_env();
    let db_path = db_path.unwrap_or(config.db_path.clone());
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    // Fail fast on the missing-key precondition before touching the queue.
    let client = AiClient::new(&config.ai)
        .context("The worker needs a text-generation key to run jobs")?;
    let db = DbHandle::new(TrackerDb::new(&db_path)?);
    let pipeline = JobPipeline::new(db, Arc::new(client));

    println!("AI job worker started (db: {})", db_path.display());
    loop {
        let processed = pipeline.process_pending().await?;
        if !processed.is_empty() {
            let completed = processed
                .iter()
                .filter(|j| j.status == JobStatus::Completed)
                .count();
            let failed = processed.len() - completed;
            println!(
                "{} {} completed, {} failed",
                style("drained").green(),
                completed,
                failed
            );
        }
        if once {
            break;
        }
        tokio::time::sleep(Duration::from_secs(interval_secs)).await;
    }
    Ok(())
}
