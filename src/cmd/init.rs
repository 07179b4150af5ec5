//! Database initialization command — `triage init`.

use anyhow::{Context, Result};
use std::path::Path;

pub fn cmd_init(db_path: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    triage::db::TrackerDb::new(db_path)?;
    println!("Tracker database initialized at {}", db_path.display());
    Ok(())
}
