use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::DbHandle;
use crate::models::{AiJob, Event, Issue, JobKind};
use crate::pipeline::JobPipeline;
use crate::registry::{RegisterOutcome, ThreadRegistry};

/// One conversation message as supplied by the chat platform, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub external_id: Option<String>,
    pub author: String,
    pub body: String,
    #[serde(default)]
    pub attachment_urls: Vec<String>,
}

/// Outcome of ingesting a thread.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Created {
        issue: Issue,
        events_saved: usize,
        participants: usize,
        job: Option<AiJob>,
    },
    /// The thread already maps to an issue; nothing was written.
    AlreadyTracked(Issue),
}

/// Derive an issue title from the first message of a thread.
fn title_from_first_message(messages: &[ThreadMessage]) -> String {
    let text = messages.first().map(|m| m.body.as_str()).unwrap_or("");
    if text.is_empty() {
        return "Untitled Issue".to_string();
    }
    let truncated: String = text.chars().take(100).collect();
    if truncated.chars().count() < text.chars().count() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

/// Orchestrates the inbound flow: resolve-or-create the issue for a thread,
/// persist its messages as events, record participants, and enqueue the
/// summarization job.
#[derive(Clone)]
pub struct ThreadIngestor {
    db: DbHandle,
    registry: ThreadRegistry,
    pipeline: JobPipeline,
}

impl ThreadIngestor {
    pub fn new(db: DbHandle, pipeline: JobPipeline) -> Self {
        let registry = ThreadRegistry::new(db.clone());
        Self {
            db,
            registry,
            pipeline,
        }
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    /// Ingest a full thread. Idempotent per thread key: a thread that is
    /// already tracked (including one that lost a concurrent registration
    /// race) comes back as `AlreadyTracked` with no side effects.
    pub async fn ingest_thread(
        &self,
        channel: &str,
        thread: &str,
        source: &str,
        triggered_by: &str,
        messages: &[ThreadMessage],
    ) -> Result<IngestOutcome> {
        if let Some(existing) = self.registry.resolve(channel, thread).await? {
            return Ok(IngestOutcome::AlreadyTracked(existing));
        }

        let title = title_from_first_message(messages);
        let description = format!("Issue created from thread in channel {}", channel);
        let outcome = self
            .registry
            .register(channel, thread, &title, &description, source)
            .await?;
        let issue = match outcome {
            RegisterOutcome::Created(issue) => issue,
            RegisterOutcome::AlreadyExists(issue) => {
                return Ok(IngestOutcome::AlreadyTracked(issue));
            }
        };

        let issue_id = issue.id;
        let source_owned = source.to_string();
        let to_save = messages.to_vec();
        let events: Vec<Event> = self
            .db
            .call(move |db| {
                let mut saved = Vec::with_capacity(to_save.len());
                for msg in &to_save {
                    saved.push(db.insert_event(
                        issue_id,
                        &source_owned,
                        msg.external_id.as_deref(),
                        &msg.author,
                        &msg.body,
                        "message_added",
                        &msg.attachment_urls,
                    )?);
                }
                Ok(saved)
            })
            .await?;

        // Requester first, then every other distinct author as a watcher.
        let requester = triggered_by.to_string();
        let mut watchers: Vec<String> = Vec::new();
        for msg in messages {
            if msg.author != requester && !watchers.contains(&msg.author) {
                watchers.push(msg.author.clone());
            }
        }
        let participant_count = 1 + watchers.len();
        self.db
            .call(move |db| {
                db.insert_participant(issue_id, &requester, "requester")?;
                for watcher in &watchers {
                    db.insert_participant(issue_id, watcher, "watcher")?;
                }
                Ok(())
            })
            .await?;

        let job = match events.first() {
            Some(first) => Some(self.pipeline.enqueue(first.id, JobKind::FullExtraction).await?),
            None => None,
        };

        info!(
            issue_id,
            channel,
            thread,
            events_saved = events.len(),
            "issue created from thread"
        );
        Ok(IngestOutcome::Created {
            issue,
            events_saved: events.len(),
            participants: participant_count,
            job,
        })
    }

    /// Append a follow-up message to an already-tracked thread. Messages for
    /// untracked threads are ignored.
    pub async fn append_message(
        &self,
        channel: &str,
        thread: &str,
        source: &str,
        message: &ThreadMessage,
    ) -> Result<Option<Event>> {
        let Some(issue) = self.registry.resolve(channel, thread).await? else {
            return Ok(None);
        };
        let issue_id = issue.id;
        let source = source.to_string();
        let message = message.clone();
        let event = self
            .db
            .call(move |db| {
                db.insert_event(
                    issue_id,
                    &source,
                    message.external_id.as_deref(),
                    &message.author,
                    &message.body,
                    "message_added",
                    &message.attachment_urls,
                )
            })
            .await?;
        info!(issue_id, event_id = event.id, "message appended to issue");
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::ai::{Summarizer, ThreadSummary};
    use crate::db::TrackerDb;
    use crate::errors::AiError;
    use crate::models::JobStatus;

    struct NullSummarizer;

    #[async_trait::async_trait]
    impl Summarizer for NullSummarizer {
        async fn summarize(&self, _transcript: &str) -> Result<ThreadSummary, AiError> {
            Ok(ThreadSummary::default())
        }
    }

    fn ingestor() -> ThreadIngestor {
        let db = DbHandle::new(TrackerDb::new_in_memory().unwrap());
        let pipeline = JobPipeline::new(db.clone(), Arc::new(NullSummarizer));
        ThreadIngestor::new(db, pipeline)
    }

    fn msg(author: &str, body: &str) -> ThreadMessage {
        ThreadMessage {
            external_id: None,
            author: author.to_string(),
            body: body.to_string(),
            attachment_urls: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_ingest_creates_issue_events_participants_job() {
        let ingestor = ingestor();
        let messages = vec![
            msg("U1", "the printer is on fire"),
            msg("U2", "unplugged it"),
            msg("U1", "thanks"),
        ];
        let outcome = ingestor
            .ingest_thread("C1", "1700.42", "slack", "U1", &messages)
            .await
            .unwrap();

        let IngestOutcome::Created {
            issue,
            events_saved,
            participants,
            job,
        } = outcome
        else {
            panic!("expected Created");
        };
        assert_eq!(issue.title, "the printer is on fire");
        assert_eq!(issue.thread_key.as_deref(), Some("C1:1700.42"));
        assert_eq!(events_saved, 3);
        // U1 as requester, U2 as watcher.
        assert_eq!(participants, 2);
        let job = job.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.job_kind, "full_extraction");

        let issue_id = issue.id;
        let recorded = ingestor
            .db
            .call(move |db| db.list_participants(issue_id))
            .await
            .unwrap();
        assert_eq!(recorded[0].role, "requester");
        assert_eq!(recorded[0].user_id, "U1");
        assert_eq!(recorded[1].role, "watcher");
        assert_eq!(recorded[1].user_id, "U2");
    }

    #[tokio::test]
    async fn test_ingest_twice_is_idempotent() {
        let ingestor = ingestor();
        let messages = vec![msg("U1", "hello")];
        let first = ingestor
            .ingest_thread("C1", "1.0", "slack", "U1", &messages)
            .await
            .unwrap();
        let second = ingestor
            .ingest_thread("C1", "1.0", "slack", "U2", &messages)
            .await
            .unwrap();
        let IngestOutcome::AlreadyTracked(existing) = second else {
            panic!("expected AlreadyTracked");
        };
        let IngestOutcome::Created { issue, .. } = first else {
            panic!("expected Created");
        };
        assert_eq!(existing.id, issue.id);
        // No duplicate events or jobs were written.
        let issue_id = issue.id;
        let count = ingestor
            .db
            .call(move |db| db.count_issue_events(issue_id))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_ingest_empty_thread() {
        let ingestor = ingestor();
        let outcome = ingestor
            .ingest_thread("C1", "1.0", "slack", "U1", &[])
            .await
            .unwrap();
        let IngestOutcome::Created {
            issue,
            events_saved,
            job,
            ..
        } = outcome
        else {
            panic!("expected Created");
        };
        assert_eq!(issue.title, "Untitled Issue");
        assert_eq!(events_saved, 0);
        assert!(job.is_none());
    }

    #[tokio::test]
    async fn test_title_truncated_at_100_chars() {
        let ingestor = ingestor();
        let long_body = "x".repeat(140);
        let outcome = ingestor
            .ingest_thread("C1", "1.0", "slack", "U1", &[msg("U1", &long_body)])
            .await
            .unwrap();
        let IngestOutcome::Created { issue, .. } = outcome else {
            panic!("expected Created");
        };
        assert_eq!(issue.title, format!("{}...", "x".repeat(100)));
    }

    #[tokio::test]
    async fn test_append_message() {
        let ingestor = ingestor();
        ingestor
            .ingest_thread("C1", "1.0", "slack", "U1", &[msg("U1", "hello")])
            .await
            .unwrap();

        let appended = ingestor
            .append_message("C1", "1.0", "slack", &msg("U2", "me too"))
            .await
            .unwrap();
        assert!(appended.is_some());

        // Untracked thread: ignored.
        let ignored = ingestor
            .append_message("C1", "9.9", "slack", &msg("U2", "hello?"))
            .await
            .unwrap();
        assert!(ignored.is_none());
    }
}
