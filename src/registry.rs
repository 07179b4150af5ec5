use anyhow::Result;

use crate::db::DbHandle;
use crate::models::Issue;

/// Compose the canonical thread key: `channel:thread`.
///
/// Early deployments keyed issues by the bare thread timestamp; `resolve`
/// still finds those rows, but every new issue is registered under the
/// composite form.
pub fn thread_key(channel: &str, thread: &str) -> String {
    format!("{}:{}", channel, thread)
}

/// Outcome of a conditional issue registration.
#[derive(Debug, Clone)]
pub enum RegisterOutcome {
    Created(Issue),
    AlreadyExists(Issue),
}

impl RegisterOutcome {
    pub fn issue(&self) -> &Issue {
        match self {
            Self::Created(issue) | Self::AlreadyExists(issue) => issue,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Maps an external conversation key (channel + root timestamp) to at most
/// one non-deleted issue.
#[derive(Clone)]
pub struct ThreadRegistry {
    db: DbHandle,
}

impl ThreadRegistry {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Look up the issue tracking a thread. Composite key first, then the
    /// two legacy fallbacks: a row keyed by the bare thread id, and a
    /// suffix match for callers that only know the thread id. Soft-deleted
    /// issues never match.
    pub async fn resolve(&self, channel: &str, thread: &str) -> Result<Option<Issue>> {
        let channel = channel.to_string();
        let thread = thread.to_string();
        self.db
            .call(move |db| {
                if !channel.is_empty() {
                    let key = thread_key(&channel, &thread);
                    if let Some(issue) = db.find_issue_by_thread_key(&key)? {
                        return Ok(Some(issue));
                    }
                }
                if let Some(issue) = db.find_issue_by_thread_key(&thread)? {
                    return Ok(Some(issue));
                }
                db.find_issue_by_thread_suffix(&thread)
            })
            .await
    }

    /// Register an issue for a thread, keyed by the composite form.
    ///
    /// Creation is a conditional insert under the unique thread-key index,
    /// so concurrent duplicate triggers converge on one issue: the loser
    /// re-resolves and reports `AlreadyExists`. If the originating channel
    /// belongs to a program, the new issue is linked to it at creation.
    pub async fn register(
        &self,
        channel: &str,
        thread: &str,
        title: &str,
        description: &str,
        source: &str,
    ) -> Result<RegisterOutcome> {
        if let Some(existing) = self.resolve(channel, thread).await? {
            return Ok(RegisterOutcome::AlreadyExists(existing));
        }

        let key = thread_key(channel, thread);
        let channel = channel.to_string();
        let title = title.to_string();
        let description = description.to_string();
        let source = source.to_string();
        self.db
            .call(move |db| {
                let program_id = db.find_program_by_channel(&channel)?.map(|p| p.id);
                match db.insert_issue_if_absent(&key, &title, &description, &source, program_id)? {
                    Some(issue) => Ok(RegisterOutcome::Created(issue)),
                    None => {
                        // Lost the race: someone registered the thread between
                        // our resolve and insert.
                        let existing = db
                            .find_issue_by_thread_key(&key)?
                            .ok_or_else(|| anyhow::anyhow!("Thread key vanished after conflict"))?;
                        Ok(RegisterOutcome::AlreadyExists(existing))
                    }
                }
            })
            .await
    }

    /// Set the issue's program reference. Returns `None` when the issue or
    /// the program does not exist; no partial effects.
    pub async fn link_program(&self, issue_id: i64, program_id: i64) -> Result<Option<Issue>> {
        self.db
            .call(move |db| db.link_issue_program(issue_id, program_id))
            .await
    }
}
