use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A tracked support ticket originating from a conversation thread.
///
/// `status` and `priority` are open string domains: the set of valid values
/// and any transition rules belong to the surrounding dashboard, not to this
/// layer. The store records transitions without validating them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,
    pub program_id: Option<i64>,
    pub title: String,
    pub description: String,
    pub status: String,
    pub priority: String,
    pub source: String,
    /// External thread key, `channel:thread` composite form. Legacy rows may
    /// carry a bare thread id.
    pub thread_key: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

/// One message within an issue's conversation history.
///
/// Immutable after creation except for `ai_metadata`, which a completed
/// summarization job sets exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub issue_id: i64,
    pub source: String,
    pub external_id: Option<String>,
    pub author: String,
    pub body: String,
    pub event_type: String,
    pub ai_metadata: Option<serde_json::Value>,
    pub attachments: Vec<String>,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and failed are terminal; no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Kinds of work the AI pipeline knows how to execute. Jobs carry their kind
/// as a free string in the store; execution parses it and rejects kinds it
/// does not recognize.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    FullExtraction,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullExtraction => "full_extraction",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_extraction" => Ok(Self::FullExtraction),
            _ => Err(format!("Unknown job type: {}", s)),
        }
    }
}

/// An asynchronous unit of work anchored to one event: "summarize the issue
/// this event belongs to".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiJob {
    pub id: i64,
    pub event_id: i64,
    pub job_kind: String,
    pub status: JobStatus,
    pub output: Option<serde_json::Value>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// An access-control grouping: owns a set of external user ids and a set of
/// external channel ids. An issue belongs to at most one program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub description: String,
    pub owners: Vec<String>,
    pub channels: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl Program {
    pub fn has_owner(&self, user_id: &str) -> bool {
        self.owners.iter().any(|o| o == user_id)
    }
}

/// A user associated with an issue, recorded during thread ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: i64,
    pub issue_id: i64,
    pub user_id: String,
    pub role: String,
    pub created_at: String,
}

/// Audit-trail row appended whenever the dashboard changes an issue's status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub id: i64,
    pub issue_id: i64,
    pub old_status: String,
    pub new_status: String,
    pub changed_by: String,
    pub created_at: String,
}

// API view types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueDetail {
    #[serde(flatten)]
    pub issue: Issue,
    pub events: Vec<Event>,
    pub total_events: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<Event>,
    pub total_events: i64,
    pub offset: i64,
    pub limit: i64,
    pub returned: usize,
}
