use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use crate::ai::{Summarizer, ThreadSummary};
use crate::db::DbHandle;
use crate::models::{AiJob, Event, Issue, JobKind, JobStatus};

/// Outcome of a conditional job claim.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(AiJob),
    /// The job was not `pending` — another worker claimed it, or it already
    /// reached a terminal state.
    Lost,
}

/// Creates, claims, executes, and records outcomes of summarization jobs.
///
/// Job lifecycle: `pending -> processing -> {completed, failed}`, terminal
/// states final. Execution failures are recorded on the job, never thrown to
/// the caller; a caller that needs the result inspects job state afterwards.
#[derive(Clone)]
pub struct JobPipeline {
    db: DbHandle,
    summarizer: Arc<dyn Summarizer>,
}

impl JobPipeline {
    pub fn new(db: DbHandle, summarizer: Arc<dyn Summarizer>) -> Self {
        Self { db, summarizer }
    }

    /// Insert a pending job anchored to an event. Does not execute it.
    pub async fn enqueue(&self, event_id: i64, kind: JobKind) -> Result<AiJob> {
        self.db
            .call(move |db| db.insert_job(event_id, kind.as_str()))
            .await
    }

    /// The batch worker's work list, insertion order.
    pub async fn list_pending(&self) -> Result<Vec<AiJob>> {
        self.db.call(|db| db.list_pending_jobs()).await
    }

    /// Conditional claim: succeeds only while the job is `pending`.
    pub async fn claim(&self, job_id: i64) -> Result<ClaimOutcome> {
        let claimed = self.db.call(move |db| db.claim_job(job_id)).await?;
        Ok(match claimed {
            Some(job) => ClaimOutcome::Claimed(job),
            None => ClaimOutcome::Lost,
        })
    }

    /// Execute one job and return its final persisted state.
    ///
    /// An unclaimed job (already claimed elsewhere, or terminal) is returned
    /// unchanged — re-running a terminal job is a no-op. Every execution
    /// fault short of a store failure lands in the job's `output` as a
    /// `failed` record.
    pub async fn execute(&self, job: &AiJob) -> Result<AiJob> {
        let job_id = job.id;
        let job = match self.claim(job_id).await? {
            ClaimOutcome::Claimed(job) => job,
            ClaimOutcome::Lost => {
                let current = self.db.call(move |db| db.get_job(job_id)).await?;
                return Ok(current.unwrap_or_else(|| job.clone()));
            }
        };

        let event_id = job.event_id;
        let Some(event) = self.db.call(move |db| db.get_event(event_id)).await? else {
            return self.fail(job.id, "Event not found").await;
        };

        let issue_id = event.issue_id;
        let Some(issue) = self.db.call(move |db| db.get_issue(issue_id)).await? else {
            return self.fail(job.id, "Issue not found").await;
        };

        match job.job_kind.parse::<JobKind>() {
            Ok(JobKind::FullExtraction) => self.run_full_extraction(&job, &event, &issue).await,
            Err(message) => self.fail(job.id, &message).await,
        }
    }

    async fn run_full_extraction(
        &self,
        job: &AiJob,
        anchor: &Event,
        issue: &Issue,
    ) -> Result<AiJob> {
        let issue_id = issue.id;
        let events = self
            .db
            .call(move |db| db.list_issue_events(issue_id))
            .await?;
        if events.is_empty() {
            return self.fail(job.id, "No messages found for this issue").await;
        }

        let transcript = build_transcript(&events);
        let summary = match self.summarizer.summarize(&transcript).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(job_id = job.id, issue_id, error = %e, "summarization call failed");
                return self.fail(job.id, &e.to_string()).await;
            }
        };

        let output = serde_json::to_value(&summary)?;
        let job_id = job.id;
        let anchor_id = anchor.id;
        let completed = self
            .db
            .call(move |db| {
                let completed = db.complete_job(job_id, &output)?;
                db.set_event_ai_metadata(anchor_id, &output)?;
                Ok(completed)
            })
            .await?;
        info!(job_id = completed.id, issue_id, "summarization job completed");
        Ok(completed)
    }

    async fn fail(&self, job_id: i64, message: &str) -> Result<AiJob> {
        let output = json!({"error": message});
        warn!(job_id, error = message, "job failed");
        self.db.call(move |db| db.fail_job(job_id, &output)).await
    }

    /// Fold a completed summary back into the issue record: `main_issue`
    /// becomes the title (first 200 characters), `summary` plus the key-point
    /// and action-item bullet blocks become the description. Returns `None`
    /// when the issue no longer exists.
    pub async fn reconcile_issue(
        &self,
        issue_id: i64,
        summary: &ThreadSummary,
    ) -> Result<Option<Issue>> {
        let title = summary
            .main_issue
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| s.chars().take(200).collect::<String>());

        let description = summary
            .summary
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|text| {
                let mut description = text.to_string();
                if !summary.key_points.is_empty() {
                    description.push_str("\n\nKey Points:");
                    for point in &summary.key_points {
                        description.push_str(&format!("\n• {}", point));
                    }
                }
                if !summary.action_items.is_empty() {
                    description.push_str("\n\nAction Items:");
                    for item in &summary.action_items {
                        description.push_str(&format!("\n• {}", item));
                    }
                }
                description
            });

        self.db
            .call(move |db| db.update_issue_content(issue_id, title.as_deref(), description.as_deref()))
            .await
    }

    /// Sequential drain of the pending queue: execute each job, then fold
    /// completed summaries back into their issues. A job that fails stays
    /// visible as `failed`; a store error on one job does not stop the rest.
    pub async fn process_pending(&self) -> Result<Vec<AiJob>> {
        let pending = self.list_pending().await?;
        let mut processed = Vec::with_capacity(pending.len());
        for job in pending {
            info!(job_id = job.id, job_kind = %job.job_kind, "processing AI job");
            let done = match self.execute(&job).await {
                Ok(done) => done,
                Err(e) => {
                    warn!(job_id = job.id, error = %e, "job execution aborted");
                    continue;
                }
            };
            if done.status == JobStatus::Completed
                && let Some(output) = done.output.clone()
                && let Ok(summary) = serde_json::from_value::<ThreadSummary>(output)
            {
                let event_id = done.event_id;
                let issue_id = self
                    .db
                    .call(move |db| Ok(db.get_event(event_id)?.map(|e| e.issue_id)))
                    .await?;
                if let Some(issue_id) = issue_id {
                    self.reconcile_issue(issue_id, &summary).await?;
                }
            }
            processed.push(done);
        }
        Ok(processed)
    }
}

/// Concatenate a thread's events as `[author]: body` lines, oldest first,
/// skipping events with empty bodies.
fn build_transcript(events: &[Event]) -> String {
    events
        .iter()
        .filter(|e| !e.body.is_empty())
        .map(|e| format!("[{}]: {}", e.author, e.body))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::db::TrackerDb;
    use crate::errors::AiError;

    struct StubSummarizer {
        summary: ThreadSummary,
        error_status: Option<u16>,
        calls: AtomicUsize,
        last_transcript: Mutex<Option<String>>,
    }

    impl StubSummarizer {
        fn returning(summary: ThreadSummary) -> Self {
            Self {
                summary,
                error_status: None,
                calls: AtomicUsize::new(0),
                last_transcript: Mutex::new(None),
            }
        }

        fn failing(status: u16) -> Self {
            Self {
                summary: ThreadSummary::default(),
                error_status: Some(status),
                calls: AtomicUsize::new(0),
                last_transcript: Mutex::new(None),
            }
        }
    }

    #[async_trait::async_trait]
    impl Summarizer for StubSummarizer {
        async fn summarize(&self, transcript: &str) -> Result<ThreadSummary, AiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_transcript.lock().unwrap() = Some(transcript.to_string());
            match self.error_status {
                Some(status) => Err(AiError::UpstreamStatus { status }),
                None => Ok(self.summary.clone()),
            }
        }
    }

    struct Fixture {
        db: DbHandle,
        pipeline: JobPipeline,
        stub: Arc<StubSummarizer>,
        issue: Issue,
        anchor: Event,
    }

    fn fixture(stub: StubSummarizer) -> Fixture {
        let db = DbHandle::new(TrackerDb::new_in_memory().unwrap());
        let stub = Arc::new(stub);
        let pipeline = JobPipeline::new(db.clone(), stub.clone());
        let (issue, anchor) = {
            let guard = db.lock_sync().unwrap();
            let issue = guard
                .insert_issue_if_absent("C1:1.0", "Printer on fire", "", "slack", None)
                .unwrap()
                .unwrap();
            let anchor = guard
                .insert_event(issue.id, "slack", Some("1.0"), "U1", "the printer is on fire", "message_added", &[])
                .unwrap();
            guard
                .insert_event(issue.id, "slack", Some("1.1"), "U2", "", "message_added", &[])
                .unwrap();
            guard
                .insert_event(issue.id, "slack", Some("1.2"), "U2", "unplugged it", "message_added", &[])
                .unwrap();
            (issue, anchor)
        };
        Fixture {
            db,
            pipeline,
            stub,
            issue,
            anchor,
        }
    }

    fn sample_summary() -> ThreadSummary {
        ThreadSummary {
            summary: Some("Printer fire resolved".to_string()),
            main_issue: Some("Office printer overheating".to_string()),
            key_points: vec!["smoke".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_execute_completes_and_attaches_metadata() {
        let f = fixture(StubSummarizer::returning(sample_summary()));
        let job = f.pipeline.enqueue(f.anchor.id, JobKind::FullExtraction).await.unwrap();
        let done = f.pipeline.execute(&job).await.unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_at.is_some());
        let output = done.output.unwrap();
        assert_eq!(output["main_issue"], "Office printer overheating");

        let anchor_id = f.anchor.id;
        let event = f.db.call(move |db| db.get_event(anchor_id)).await.unwrap().unwrap();
        assert_eq!(event.ai_metadata.unwrap(), output);

        // Empty-body events are skipped in the transcript.
        let transcript = f.stub.last_transcript.lock().unwrap().clone().unwrap();
        assert_eq!(
            transcript,
            "[U1]: the printer is on fire\n\n[U2]: unplugged it"
        );
    }

    #[tokio::test]
    async fn test_execute_missing_event_fails_without_error() {
        let f = fixture(StubSummarizer::returning(sample_summary()));
        let job = f.pipeline.enqueue(f.anchor.id, JobKind::FullExtraction).await.unwrap();
        let anchor_id = f.anchor.id;
        f.db.call(move |db| db.soft_delete_event(anchor_id).map(|_| ()))
            .await
            .unwrap();

        let done = f.pipeline.execute(&job).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.output.unwrap()["error"], "Event not found");
        assert_eq!(f.stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_missing_issue_fails() {
        let f = fixture(StubSummarizer::returning(sample_summary()));
        let job = f.pipeline.enqueue(f.anchor.id, JobKind::FullExtraction).await.unwrap();
        let issue_id = f.issue.id;
        f.db.call(move |db| db.soft_delete_issue(issue_id).map(|_| ()))
            .await
            .unwrap();

        let done = f.pipeline.execute(&job).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.output.unwrap()["error"], "Issue not found");
    }

    #[tokio::test]
    async fn test_execute_unknown_kind_fails() {
        let f = fixture(StubSummarizer::returning(sample_summary()));
        let anchor_id = f.anchor.id;
        let job = f
            .db
            .call(move |db| db.insert_job(anchor_id, "sentiment_only"))
            .await
            .unwrap();

        let done = f.pipeline.execute(&job).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(
            done.output.unwrap()["error"],
            "Unknown job type: sentiment_only"
        );
        assert_eq!(f.stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_upstream_failure_recorded_on_job() {
        let f = fixture(StubSummarizer::failing(502));
        let job = f.pipeline.enqueue(f.anchor.id, JobKind::FullExtraction).await.unwrap();
        let done = f.pipeline.execute(&job).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(
            done.output.unwrap()["error"],
            "Text-generation endpoint returned status 502"
        );
        assert!(done.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_execute_terminal_job_is_noop() {
        let f = fixture(StubSummarizer::returning(sample_summary()));
        let job = f.pipeline.enqueue(f.anchor.id, JobKind::FullExtraction).await.unwrap();
        let done = f.pipeline.execute(&job).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(f.stub.calls.load(Ordering::SeqCst), 1);

        let again = f.pipeline.execute(&done).await.unwrap();
        assert_eq!(again.status, JobStatus::Completed);
        assert_eq!(again.output, done.output);
        // The summarizer was not invoked a second time.
        assert_eq!(f.stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let f = fixture(StubSummarizer::returning(sample_summary()));
        let job = f.pipeline.enqueue(f.anchor.id, JobKind::FullExtraction).await.unwrap();
        assert!(matches!(
            f.pipeline.claim(job.id).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        assert!(matches!(
            f.pipeline.claim(job.id).await.unwrap(),
            ClaimOutcome::Lost
        ));
    }

    #[tokio::test]
    async fn test_fallback_output_stored_verbatim() {
        let f = fixture(StubSummarizer::returning(ThreadSummary::parse("not json")));
        let job = f.pipeline.enqueue(f.anchor.id, JobKind::FullExtraction).await.unwrap();
        let done = f.pipeline.execute(&job).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(
            done.output.unwrap(),
            serde_json::json!({"summary": "not json", "raw_response": "not json"})
        );
    }

    #[tokio::test]
    async fn test_reconcile_truncates_title_and_builds_description() {
        let f = fixture(StubSummarizer::returning(sample_summary()));
        let summary = ThreadSummary {
            main_issue: Some("X".repeat(250)),
            summary: Some("S".to_string()),
            key_points: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        };
        let issue = f
            .pipeline
            .reconcile_issue(f.issue.id, &summary)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(issue.title, "X".repeat(200));
        assert_eq!(issue.description, "S\n\nKey Points:\n• a\n• b");
    }

    #[tokio::test]
    async fn test_reconcile_with_action_items() {
        let f = fixture(StubSummarizer::returning(sample_summary()));
        let summary = ThreadSummary {
            summary: Some("S".to_string()),
            action_items: vec!["replace printer".to_string()],
            ..Default::default()
        };
        let issue = f
            .pipeline
            .reconcile_issue(f.issue.id, &summary)
            .await
            .unwrap()
            .unwrap();
        // Title untouched when the summary carries no main_issue.
        assert_eq!(issue.title, "Printer on fire");
        assert_eq!(issue.description, "S\n\nAction Items:\n• replace printer");
    }

    #[tokio::test]
    async fn test_reconcile_missing_issue_returns_none() {
        let f = fixture(StubSummarizer::returning(sample_summary()));
        let issue_id = f.issue.id;
        f.db.call(move |db| db.soft_delete_issue(issue_id).map(|_| ()))
            .await
            .unwrap();
        let reconciled = f
            .pipeline
            .reconcile_issue(issue_id, &sample_summary())
            .await
            .unwrap();
        assert!(reconciled.is_none());
    }

    #[tokio::test]
    async fn test_process_pending_drains_and_reconciles() {
        let f = fixture(StubSummarizer::returning(sample_summary()));
        f.pipeline.enqueue(f.anchor.id, JobKind::FullExtraction).await.unwrap();
        let anchor_id = f.anchor.id;
        f.db.call(move |db| db.insert_job(anchor_id, "sentiment_only"))
            .await
            .unwrap();

        let processed = f.pipeline.process_pending().await.unwrap();
        assert_eq!(processed.len(), 2);
        assert_eq!(processed[0].status, JobStatus::Completed);
        assert_eq!(processed[1].status, JobStatus::Failed);

        // The completed summary was folded back into the issue.
        let issue_id = f.issue.id;
        let issue = f.db.call(move |db| db.get_issue(issue_id)).await.unwrap().unwrap();
        assert_eq!(issue.title, "Office printer overheating");
        assert!(issue.description.starts_with("Printer fire resolved"));

        // Nothing left to drain.
        assert!(f.pipeline.list_pending().await.unwrap().is_empty());
    }
}
