use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::ai::AiConfig;

/// Default database location, relative to the working directory.
pub const DEFAULT_DB_PATH: &str = ".triage/triage.db";

/// Runtime configuration, sourced from the environment (`.env` is honored
/// when present). CLI flags override the database path and server port.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub ai: AiConfig,
    pub admin_users: HashSet<String>,
    pub db_path: PathBuf,
}

impl TrackerConfig {
    pub fn from_env() -> Self {
        let defaults = AiConfig::default();
        let ai = AiConfig {
            api_url: std::env::var("AI_API_URL").unwrap_or(defaults.api_url),
            api_key: std::env::var("AI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            model: std::env::var("AI_MODEL").unwrap_or(defaults.model),
            timeout: std::env::var("AI_TIMEOUT_SECS")
                .ok()
                .and_then(|raw| raw.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        };
        let admin_users = parse_admin_list(
            &std::env::var("TRIAGE_ADMINS").unwrap_or_default(),
        );
        let db_path = std::env::var("TRIAGE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH));
        Self {
            ai,
            admin_users,
            db_path,
        }
    }
}

/// Parse the comma-separated admin allow-list. Entries are trimmed; empty
/// entries (including the empty variable) are dropped.
pub fn parse_admin_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_admin_list() {
        let admins = parse_admin_list("U1, U2 ,,U3");
        assert_eq!(admins.len(), 3);
        assert!(admins.contains("U1"));
        assert!(admins.contains("U2"));
        assert!(admins.contains("U3"));
    }

    #[test]
    fn test_parse_admin_list_empty() {
        assert!(parse_admin_list("").is_empty());
        assert!(parse_admin_list(" , ,").is_empty());
    }

    #[test]
    fn test_ai_defaults() {
        let defaults = AiConfig::default();
        assert_eq!(defaults.model, "openai/gpt-4");
        assert_eq!(defaults.timeout, Duration::from_secs(60));
        assert!(defaults.api_key.is_none());
    }
}
