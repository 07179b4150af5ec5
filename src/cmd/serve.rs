//! Dashboard API server command — `triage serve`.

use anyhow::Result;
use std::path::PathBuf;

use triage::config::TrackerConfig;
use triage::server::{ServerConfig, start_server};

pub async fn cmd_serve(port: u16, db_path: Option<PathBuf>, dev: bool) -> Result<()> {
    let config = TrackerConfig::from_env();
    start_server(ServerConfig {
        port,
        db_path: db_path.unwrap_or(config.db_path),
        admin_users: config.admin_users,
        dev_mode: dev,
    })
    .await
}
