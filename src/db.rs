use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::models::*;

/// Async-safe handle to the tracker database.
///
/// Wraps `TrackerDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<TrackerDb>>,
}

impl DbHandle {
    pub fn new(db: TrackerDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TrackerDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used where blocking is
    /// acceptable: startup initialization and tests. Must NOT be called from
    /// a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, TrackerDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct TrackerDb {
    conn: Connection,
}

impl TrackerDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS programs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    slug TEXT NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    owners TEXT NOT NULL DEFAULT '[]',
                    channels TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    deleted_at TEXT
                );

                CREATE TABLE IF NOT EXISTS issues (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    program_id INTEGER REFERENCES programs(id),
                    title TEXT NOT NULL DEFAULT '',
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'unverified',
                    priority TEXT NOT NULL DEFAULT 'low',
                    source TEXT NOT NULL DEFAULT '',
                    thread_key TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    deleted_at TEXT
                );

                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    issue_id INTEGER NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
                    source TEXT NOT NULL DEFAULT '',
                    external_id TEXT,
                    author TEXT NOT NULL DEFAULT '',
                    body TEXT NOT NULL DEFAULT '',
                    event_type TEXT NOT NULL DEFAULT 'message_added',
                    ai_metadata TEXT,
                    attachments TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    deleted_at TEXT
                );

                CREATE TABLE IF NOT EXISTS ai_jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_id INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
                    job_kind TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    output TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS owners (
                    entity_kind TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    PRIMARY KEY (entity_kind, entity_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS participants (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    issue_id INTEGER NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL,
                    role TEXT NOT NULL DEFAULT 'requester',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    deleted_at TEXT
                );

                CREATE TABLE IF NOT EXISTS issue_status_changes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    issue_id INTEGER NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
                    old_status TEXT NOT NULL,
                    new_status TEXT NOT NULL,
                    changed_by TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_issues_program ON issues(program_id);
                CREATE INDEX IF NOT EXISTS idx_events_issue ON events(issue_id);
                CREATE INDEX IF NOT EXISTS idx_ai_jobs_status ON ai_jobs(status);
                CREATE INDEX IF NOT EXISTS idx_participants_issue ON participants(issue_id);
                CREATE INDEX IF NOT EXISTS idx_status_changes_issue ON issue_status_changes(issue_id);
                ",
            )
            .context("Failed to create tables")?;

        // One non-deleted issue per thread key; registration relies on this
        // constraint for its conditional insert.
        self.conn
            .execute_batch(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_issues_thread_key
             ON issues(thread_key)
             WHERE thread_key IS NOT NULL AND deleted_at IS NULL;",
            )
            .context("Failed to create thread_key index")?;

        // One non-deleted program per slug.
        self.conn
            .execute_batch(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_programs_slug
             ON programs(slug)
             WHERE deleted_at IS NULL;",
            )
            .context("Failed to create program slug index")?;

        Ok(())
    }

    // ── Issue CRUD ────────────────────────────────────────────────────

    const ISSUE_COLUMNS: &'static str = "id, program_id, title, description, status, priority, source, thread_key, created_at, updated_at, deleted_at";

    fn map_issue(row: &rusqlite::Row<'_>) -> rusqlite::Result<Issue> {
        Ok(Issue {
            id: row.get(0)?,
            program_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            status: row.get(4)?,
            priority: row.get(5)?,
            source: row.get(6)?,
            thread_key: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            deleted_at: row.get(10)?,
        })
    }

    pub fn get_issue(&self, id: i64) -> Result<Option<Issue>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM issues WHERE id = ?1 AND deleted_at IS NULL",
                Self::ISSUE_COLUMNS
            ))
            .context("Failed to prepare get_issue")?;
        let mut rows = stmt
            .query_map(params![id], Self::map_issue)
            .context("Failed to query issue")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read issue row")?)),
            None => Ok(None),
        }
    }

    pub fn list_issues(&self) -> Result<Vec<Issue>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM issues WHERE deleted_at IS NULL ORDER BY created_at DESC, id DESC",
                Self::ISSUE_COLUMNS
            ))
            .context("Failed to prepare list_issues")?;
        let rows = stmt
            .query_map([], Self::map_issue)
            .context("Failed to query issues")?;
        let mut issues = Vec::new();
        for row in rows {
            issues.push(row.context("Failed to read issue row")?);
        }
        Ok(issues)
    }

    pub fn find_issue_by_thread_key(&self, key: &str) -> Result<Option<Issue>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM issues WHERE thread_key = ?1 AND deleted_at IS NULL",
                Self::ISSUE_COLUMNS
            ))
            .context("Failed to prepare find_issue_by_thread_key")?;
        let mut rows = stmt
            .query_map(params![key], Self::map_issue)
            .context("Failed to query issue by thread key")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read issue row")?)),
            None => Ok(None),
        }
    }

    /// Suffix match for legacy bare-thread keys: finds a composite-keyed row
    /// (`<channel>:<thread>`) when the caller only knows the thread id.
    pub fn find_issue_by_thread_suffix(&self, thread: &str) -> Result<Option<Issue>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM issues WHERE thread_key LIKE '%:' || ?1 AND deleted_at IS NULL",
                Self::ISSUE_COLUMNS
            ))
            .context("Failed to prepare find_issue_by_thread_suffix")?;
        let mut rows = stmt
            .query_map(params![thread], Self::map_issue)
            .context("Failed to query issue by thread suffix")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read issue row")?)),
            None => Ok(None),
        }
    }

    /// Conditional insert under the unique thread-key index. Returns `None`
    /// when another issue already holds the key (the caller re-resolves).
    pub fn insert_issue_if_absent(
        &self,
        thread_key: &str,
        title: &str,
        description: &str,
        source: &str,
        program_id: Option<i64>,
    ) -> Result<Option<Issue>> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO issues (program_id, title, description, source, thread_key)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![program_id, title, description, source, thread_key],
            )
            .context("Failed to insert issue")?;
        if changed == 0 {
            return Ok(None);
        }
        let id = self.conn.last_insert_rowid();
        self.get_issue(id)?
            .context("Issue not found after insert")
            .map(Some)
    }

    pub fn update_issue_status(
        &self,
        id: i64,
        new_status: &str,
        changed_by: &str,
    ) -> Result<Option<(String, Issue)>> {
        let Some(issue) = self.get_issue(id)? else {
            return Ok(None);
        };
        let old_status = issue.status;
        self.conn
            .execute(
                "UPDATE issues SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![new_status, id],
            )
            .context("Failed to update issue status")?;
        self.conn
            .execute(
                "INSERT INTO issue_status_changes (issue_id, old_status, new_status, changed_by)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, old_status, new_status, changed_by],
            )
            .context("Failed to record status change")?;
        let updated = self
            .get_issue(id)?
            .context("Issue not found after status update")?;
        Ok(Some((old_status, updated)))
    }

    pub fn update_issue_priority(&self, id: i64, priority: &str) -> Result<Option<Issue>> {
        let changed = self
            .conn
            .execute(
                "UPDATE issues SET priority = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND deleted_at IS NULL",
                params![priority, id],
            )
            .context("Failed to update issue priority")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_issue(id)
    }

    /// Rewrite title and/or description from a reconciled summary.
    pub fn update_issue_content(
        &self,
        id: i64,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<Issue>> {
        let Some(issue) = self.get_issue(id)? else {
            return Ok(None);
        };
        let title = title.unwrap_or(&issue.title);
        let description = description.unwrap_or(&issue.description);
        self.conn
            .execute(
                "UPDATE issues SET title = ?1, description = ?2, updated_at = datetime('now')
                 WHERE id = ?3",
                params![title, description, id],
            )
            .context("Failed to update issue content")?;
        self.get_issue(id)
    }

    pub fn link_issue_program(&self, issue_id: i64, program_id: i64) -> Result<Option<Issue>> {
        if self.get_program(program_id)?.is_none() {
            return Ok(None);
        }
        let changed = self
            .conn
            .execute(
                "UPDATE issues SET program_id = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND deleted_at IS NULL",
                params![program_id, issue_id],
            )
            .context("Failed to link issue to program")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_issue(issue_id)
    }

    pub fn soft_delete_issue(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE issues SET deleted_at = datetime('now')
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
            )
            .context("Failed to soft-delete issue")?;
        Ok(changed > 0)
    }

    // ── Event CRUD ────────────────────────────────────────────────────

    const EVENT_COLUMNS: &'static str = "id, issue_id, source, external_id, author, body, event_type, ai_metadata, attachments, created_at, deleted_at";

    fn read_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
        Ok(EventRow {
            id: row.get(0)?,
            issue_id: row.get(1)?,
            source: row.get(2)?,
            external_id: row.get(3)?,
            author: row.get(4)?,
            body: row.get(5)?,
            event_type: row.get(6)?,
            ai_metadata: row.get(7)?,
            attachments: row.get(8)?,
            created_at: row.get(9)?,
            deleted_at: row.get(10)?,
        })
    }

    pub fn insert_event(
        &self,
        issue_id: i64,
        source: &str,
        external_id: Option<&str>,
        author: &str,
        body: &str,
        event_type: &str,
        attachments: &[String],
    ) -> Result<Event> {
        let attachments_json =
            serde_json::to_string(attachments).context("Failed to encode attachments")?;
        self.conn
            .execute(
                "INSERT INTO events (issue_id, source, external_id, author, body, event_type, attachments)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![issue_id, source, external_id, author, body, event_type, attachments_json],
            )
            .context("Failed to insert event")?;
        let id = self.conn.last_insert_rowid();
        self.get_event(id)?.context("Event not found after insert")
    }

    pub fn get_event(&self, id: i64) -> Result<Option<Event>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM events WHERE id = ?1 AND deleted_at IS NULL",
                Self::EVENT_COLUMNS
            ))
            .context("Failed to prepare get_event")?;
        let mut rows = stmt
            .query_map(params![id], Self::read_event)
            .context("Failed to query event")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read event row")?.into_event()?)),
            None => Ok(None),
        }
    }

    /// All non-deleted events for an issue, oldest first.
    pub fn list_issue_events(&self, issue_id: i64) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM events WHERE issue_id = ?1 AND deleted_at IS NULL
                 ORDER BY created_at, id",
                Self::EVENT_COLUMNS
            ))
            .context("Failed to prepare list_issue_events")?;
        let rows = stmt
            .query_map(params![issue_id], Self::read_event)
            .context("Failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read event row")?.into_event()?);
        }
        Ok(events)
    }

    pub fn page_issue_events(&self, issue_id: i64, offset: i64, limit: i64) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM events WHERE issue_id = ?1 AND deleted_at IS NULL
                 ORDER BY created_at, id LIMIT ?2 OFFSET ?3",
                Self::EVENT_COLUMNS
            ))
            .context("Failed to prepare page_issue_events")?;
        let rows = stmt
            .query_map(params![issue_id, limit, offset], Self::read_event)
            .context("Failed to query event page")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read event row")?.into_event()?);
        }
        Ok(events)
    }

    pub fn count_issue_events(&self, issue_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM events WHERE issue_id = ?1 AND deleted_at IS NULL",
                params![issue_id],
                |row| row.get(0),
            )
            .context("Failed to count events")
    }

    pub fn soft_delete_event(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE events SET deleted_at = datetime('now')
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
            )
            .context("Failed to soft-delete event")?;
        Ok(changed > 0)
    }

    /// Attach the summarization result to its anchor event.
    pub fn set_event_ai_metadata(&self, id: i64, metadata: &serde_json::Value) -> Result<()> {
        let encoded = serde_json::to_string(metadata).context("Failed to encode ai_metadata")?;
        self.conn
            .execute(
                "UPDATE events SET ai_metadata = ?1 WHERE id = ?2",
                params![encoded, id],
            )
            .context("Failed to set event ai_metadata")?;
        Ok(())
    }

    // ── AI job CRUD ───────────────────────────────────────────────────

    const JOB_COLUMNS: &'static str =
        "id, event_id, job_kind, status, output, created_at, completed_at";

    fn read_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
        Ok(JobRow {
            id: row.get(0)?,
            event_id: row.get(1)?,
            job_kind: row.get(2)?,
            status: row.get(3)?,
            output: row.get(4)?,
            created_at: row.get(5)?,
            completed_at: row.get(6)?,
        })
    }

    pub fn insert_job(&self, event_id: i64, job_kind: &str) -> Result<AiJob> {
        self.conn
            .execute(
                "INSERT INTO ai_jobs (event_id, job_kind) VALUES (?1, ?2)",
                params![event_id, job_kind],
            )
            .context("Failed to insert AI job")?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?.context("AI job not found after insert")
    }

    pub fn get_job(&self, id: i64) -> Result<Option<AiJob>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM ai_jobs WHERE id = ?1",
                Self::JOB_COLUMNS
            ))
            .context("Failed to prepare get_job")?;
        let mut rows = stmt
            .query_map(params![id], Self::read_job)
            .context("Failed to query AI job")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read job row")?.into_job()?)),
            None => Ok(None),
        }
    }

    /// Pending jobs in insertion order; the batch worker's work list.
    pub fn list_pending_jobs(&self) -> Result<Vec<AiJob>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM ai_jobs WHERE status = 'pending' ORDER BY id",
                Self::JOB_COLUMNS
            ))
            .context("Failed to prepare list_pending_jobs")?;
        let rows = stmt
            .query_map([], Self::read_job)
            .context("Failed to query pending jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    /// Conditional claim: `pending -> processing`. Returns `None` when the
    /// job was not in `pending` (claimed elsewhere or already terminal), so
    /// two workers never execute the same job twice.
    pub fn claim_job(&self, id: i64) -> Result<Option<AiJob>> {
        let changed = self
            .conn
            .execute(
                "UPDATE ai_jobs SET status = 'processing' WHERE id = ?1 AND status = 'pending'",
                params![id],
            )
            .context("Failed to claim AI job")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_job(id)
    }

    pub fn complete_job(&self, id: i64, output: &serde_json::Value) -> Result<AiJob> {
        let encoded = serde_json::to_string(output).context("Failed to encode job output")?;
        let completed_at = chrono::Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE ai_jobs SET status = 'completed', output = ?1, completed_at = ?2
                 WHERE id = ?3",
                params![encoded, completed_at, id],
            )
            .context("Failed to complete AI job")?;
        self.get_job(id)?.context("AI job not found after update")
    }

    pub fn fail_job(&self, id: i64, output: &serde_json::Value) -> Result<AiJob> {
        let encoded = serde_json::to_string(output).context("Failed to encode job output")?;
        self.conn
            .execute(
                "UPDATE ai_jobs SET status = 'failed', output = ?1 WHERE id = ?2",
                params![encoded, id],
            )
            .context("Failed to fail AI job")?;
        self.get_job(id)?.context("AI job not found after update")
    }

    // ── Program CRUD ──────────────────────────────────────────────────

    const PROGRAM_COLUMNS: &'static str =
        "id, slug, name, description, owners, channels, created_at, updated_at, deleted_at";

    fn read_program(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProgramRow> {
        Ok(ProgramRow {
            id: row.get(0)?,
            slug: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            owners: row.get(4)?,
            channels: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            deleted_at: row.get(8)?,
        })
    }

    /// Conditional insert under the unique slug index. Returns `None` when
    /// the slug is already taken by a non-deleted program.
    pub fn create_program(
        &self,
        slug: &str,
        name: &str,
        description: &str,
        owners: &[String],
        channels: &[String],
    ) -> Result<Option<Program>> {
        let owners_json = serde_json::to_string(owners).context("Failed to encode owners")?;
        let channels_json = serde_json::to_string(channels).context("Failed to encode channels")?;
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO programs (slug, name, description, owners, channels)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![slug, name, description, owners_json, channels_json],
            )
            .context("Failed to insert program")?;
        if changed == 0 {
            return Ok(None);
        }
        let id = self.conn.last_insert_rowid();
        self.get_program(id)?
            .context("Program not found after insert")
            .map(Some)
    }

    pub fn get_program(&self, id: i64) -> Result<Option<Program>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM programs WHERE id = ?1 AND deleted_at IS NULL",
                Self::PROGRAM_COLUMNS
            ))
            .context("Failed to prepare get_program")?;
        let mut rows = stmt
            .query_map(params![id], Self::read_program)
            .context("Failed to query program")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read program row")?.into_program()?)),
            None => Ok(None),
        }
    }

    pub fn list_programs(&self) -> Result<Vec<Program>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM programs WHERE deleted_at IS NULL ORDER BY created_at DESC, id DESC",
                Self::PROGRAM_COLUMNS
            ))
            .context("Failed to prepare list_programs")?;
        let rows = stmt
            .query_map([], Self::read_program)
            .context("Failed to query programs")?;
        let mut programs = Vec::new();
        for row in rows {
            programs.push(row.context("Failed to read program row")?.into_program()?);
        }
        Ok(programs)
    }

    /// The program whose channel list contains `channel_id`, if any.
    /// Channel lists are small JSON arrays, so this scans in Rust rather
    /// than pushing JSON matching into SQL.
    pub fn find_program_by_channel(&self, channel_id: &str) -> Result<Option<Program>> {
        Ok(self
            .list_programs()?
            .into_iter()
            .find(|p| p.channels.iter().any(|c| c == channel_id)))
    }

    pub fn update_program(
        &self,
        id: i64,
        name: Option<&str>,
        description: Option<&str>,
        owners: Option<&[String]>,
        channels: Option<&[String]>,
    ) -> Result<Option<Program>> {
        let Some(program) = self.get_program(id)? else {
            return Ok(None);
        };
        let name = name.unwrap_or(&program.name);
        let description = description.unwrap_or(&program.description);
        let owners_json = serde_json::to_string(owners.unwrap_or(&program.owners))
            .context("Failed to encode owners")?;
        let channels_json = serde_json::to_string(channels.unwrap_or(&program.channels))
            .context("Failed to encode channels")?;
        self.conn
            .execute(
                "UPDATE programs SET name = ?1, description = ?2, owners = ?3, channels = ?4,
                 updated_at = datetime('now') WHERE id = ?5",
                params![name, description, owners_json, channels_json, id],
            )
            .context("Failed to update program")?;
        self.get_program(id)
    }

    pub fn soft_delete_program(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE programs SET deleted_at = datetime('now')
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
            )
            .context("Failed to soft-delete program")?;
        Ok(changed > 0)
    }

    // ── Owner sets ────────────────────────────────────────────────────

    pub fn is_owner(&self, entity_kind: &str, entity_id: &str, user_id: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM owners
                 WHERE entity_kind = ?1 AND entity_id = ?2 AND user_id = ?3",
                params![entity_kind, entity_id, user_id],
                |row| row.get(0),
            )
            .context("Failed to query owner")?;
        Ok(count > 0)
    }

    pub fn set_owner(&self, entity_kind: &str, entity_id: &str, user_id: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO owners (entity_kind, entity_id, user_id)
                 VALUES (?1, ?2, ?3)",
                params![entity_kind, entity_id, user_id],
            )
            .context("Failed to set owner")?;
        Ok(())
    }

    pub fn remove_owner(&self, entity_kind: &str, entity_id: &str, user_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM owners
                 WHERE entity_kind = ?1 AND entity_id = ?2 AND user_id = ?3",
                params![entity_kind, entity_id, user_id],
            )
            .context("Failed to remove owner")?;
        Ok(changed > 0)
    }

    // ── Participants ──────────────────────────────────────────────────

    pub fn insert_participant(
        &self,
        issue_id: i64,
        user_id: &str,
        role: &str,
    ) -> Result<Participant> {
        self.conn
            .execute(
                "INSERT INTO participants (issue_id, user_id, role) VALUES (?1, ?2, ?3)",
                params![issue_id, user_id, role],
            )
            .context("Failed to insert participant")?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, issue_id, user_id, role, created_at FROM participants WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Participant {
                        id: row.get(0)?,
                        issue_id: row.get(1)?,
                        user_id: row.get(2)?,
                        role: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .context("Participant not found after insert")
    }

    pub fn list_participants(&self, issue_id: i64) -> Result<Vec<Participant>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, issue_id, user_id, role, created_at FROM participants
                 WHERE issue_id = ?1 AND deleted_at IS NULL ORDER BY id",
            )
            .context("Failed to prepare list_participants")?;
        let rows = stmt
            .query_map(params![issue_id], |row| {
                Ok(Participant {
                    id: row.get(0)?,
                    issue_id: row.get(1)?,
                    user_id: row.get(2)?,
                    role: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .context("Failed to query participants")?;
        let mut participants = Vec::new();
        for row in rows {
            participants.push(row.context("Failed to read participant row")?);
        }
        Ok(participants)
    }

    // ── Status-change history ─────────────────────────────────────────

    pub fn list_status_changes(&self, issue_id: i64) -> Result<Vec<StatusChange>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, issue_id, old_status, new_status, changed_by, created_at
                 FROM issue_status_changes WHERE issue_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_status_changes")?;
        let rows = stmt
            .query_map(params![issue_id], |row| {
                Ok(StatusChange {
                    id: row.get(0)?,
                    issue_id: row.get(1)?,
                    old_status: row.get(2)?,
                    new_status: row.get(3)?,
                    changed_by: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .context("Failed to query status changes")?;
        let mut changes = Vec::new();
        for row in rows {
            changes.push(row.context("Failed to read status change row")?);
        }
        Ok(changes)
    }
}

// Raw row carriers: JSON columns come out as TEXT and are decoded outside the
// rusqlite closure so decode errors surface as anyhow errors, not row errors.

struct EventRow {
    id: i64,
    issue_id: i64,
    source: String,
    external_id: Option<String>,
    author: String,
    body: String,
    event_type: String,
    ai_metadata: Option<String>,
    attachments: String,
    created_at: String,
    deleted_at: Option<String>,
}

impl EventRow {
    fn into_event(self) -> Result<Event> {
        let ai_metadata = match self.ai_metadata {
            Some(raw) => {
                Some(serde_json::from_str(&raw).context("Failed to decode event ai_metadata")?)
            }
            None => None,
        };
        let attachments = serde_json::from_str(&self.attachments)
            .context("Failed to decode event attachments")?;
        Ok(Event {
            id: self.id,
            issue_id: self.issue_id,
            source: self.source,
            external_id: self.external_id,
            author: self.author,
            body: self.body,
            event_type: self.event_type,
            ai_metadata,
            attachments,
            created_at: self.created_at,
            deleted_at: self.deleted_at,
        })
    }
}

struct JobRow {
    id: i64,
    event_id: i64,
    job_kind: String,
    status: String,
    output: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<AiJob> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!("Failed to decode job status: {}", e))?;
        let output = match self.output {
            Some(raw) => Some(serde_json::from_str(&raw).context("Failed to decode job output")?),
            None => None,
        };
        Ok(AiJob {
            id: self.id,
            event_id: self.event_id,
            job_kind: self.job_kind,
            status,
            output,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

struct ProgramRow {
    id: i64,
    slug: String,
    name: String,
    description: String,
    owners: String,
    channels: String,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl ProgramRow {
    fn into_program(self) -> Result<Program> {
        let owners =
            serde_json::from_str(&self.owners).context("Failed to decode program owners")?;
        let channels =
            serde_json::from_str(&self.channels).context("Failed to decode program channels")?;
        Ok(Program {
            id: self.id,
            slug: self.slug,
            name: self.name,
            description: self.description,
            owners,
            channels,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> TrackerDb {
        TrackerDb::new_in_memory().unwrap()
    }

    fn seed_issue(db: &TrackerDb, key: &str) -> Issue {
        db.insert_issue_if_absent(key, "Printer on fire", "", "slack", None)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_insert_issue_defaults() {
        let db = test_db();
        let issue = seed_issue(&db, "C1:1700000000.000100");
        assert_eq!(issue.status, "unverified");
        assert_eq!(issue.priority, "low");
        assert_eq!(issue.thread_key.as_deref(), Some("C1:1700000000.000100"));
        assert!(issue.deleted_at.is_none());
    }

    #[test]
    fn test_insert_issue_if_absent_rejects_duplicate_key() {
        let db = test_db();
        let first = seed_issue(&db, "C1:1.0");
        let second = db
            .insert_issue_if_absent("C1:1.0", "Duplicate", "", "slack", None)
            .unwrap();
        assert!(second.is_none());
        assert_eq!(db.list_issues().unwrap().len(), 1);
        assert_eq!(db.find_issue_by_thread_key("C1:1.0").unwrap().unwrap().id, first.id);
    }

    #[test]
    fn test_soft_deleted_issue_frees_thread_key() {
        let db = test_db();
        let first = seed_issue(&db, "C1:1.0");
        assert!(db.soft_delete_issue(first.id).unwrap());
        assert!(db.find_issue_by_thread_key("C1:1.0").unwrap().is_none());
        // The partial unique index only covers live rows.
        let second = db
            .insert_issue_if_absent("C1:1.0", "Reopened", "", "slack", None)
            .unwrap();
        assert!(second.is_some());
    }

    #[test]
    fn test_find_issue_by_thread_suffix() {
        let db = test_db();
        let issue = seed_issue(&db, "C1:1700.42");
        let found = db.find_issue_by_thread_suffix("1700.42").unwrap().unwrap();
        assert_eq!(found.id, issue.id);
        assert!(db.find_issue_by_thread_suffix("9999.99").unwrap().is_none());
    }

    #[test]
    fn test_update_issue_status_records_history() {
        let db = test_db();
        let issue = seed_issue(&db, "C1:1.0");
        let (old, updated) = db
            .update_issue_status(issue.id, "in_progress", "U1")
            .unwrap()
            .unwrap();
        assert_eq!(old, "unverified");
        assert_eq!(updated.status, "in_progress");

        let changes = db.list_status_changes(issue.id).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old_status, "unverified");
        assert_eq!(changes[0].new_status, "in_progress");
        assert_eq!(changes[0].changed_by, "U1");
    }

    #[test]
    fn test_update_missing_issue_returns_none() {
        let db = test_db();
        assert!(db.update_issue_status(99, "done", "U1").unwrap().is_none());
        assert!(db.update_issue_priority(99, "high").unwrap().is_none());
        assert!(db.update_issue_content(99, Some("t"), None).unwrap().is_none());
    }

    #[test]
    fn test_event_roundtrip_with_attachments() {
        let db = test_db();
        let issue = seed_issue(&db, "C1:1.0");
        let event = db
            .insert_event(
                issue.id,
                "slack",
                Some("1700.42"),
                "U1",
                "it broke",
                "message_added",
                &["https://files.example/one.png".to_string()],
            )
            .unwrap();
        assert_eq!(event.attachments.len(), 1);
        assert!(event.ai_metadata.is_none());

        let metadata = serde_json::json!({"summary": "broken"});
        db.set_event_ai_metadata(event.id, &metadata).unwrap();
        let reread = db.get_event(event.id).unwrap().unwrap();
        assert_eq!(reread.ai_metadata.unwrap(), metadata);
    }

    #[test]
    fn test_event_ordering_and_paging() {
        let db = test_db();
        let issue = seed_issue(&db, "C1:1.0");
        for i in 0..5 {
            db.insert_event(issue.id, "slack", None, "U1", &format!("msg {}", i), "message_added", &[])
                .unwrap();
        }
        let all = db.list_issue_events(issue.id).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].body, "msg 0");

        let page = db.page_issue_events(issue.id, 2, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].body, "msg 2");
        assert_eq!(db.count_issue_events(issue.id).unwrap(), 5);
    }

    #[test]
    fn test_job_claim_is_conditional() {
        let db = test_db();
        let issue = seed_issue(&db, "C1:1.0");
        let event = db
            .insert_event(issue.id, "slack", None, "U1", "hi", "message_added", &[])
            .unwrap();
        let job = db.insert_job(event.id, "full_extraction").unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let claimed = db.claim_job(job.id).unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        // Second claim loses.
        assert!(db.claim_job(job.id).unwrap().is_none());
    }

    #[test]
    fn test_job_terminal_updates() {
        let db = test_db();
        let issue = seed_issue(&db, "C1:1.0");
        let event = db
            .insert_event(issue.id, "slack", None, "U1", "hi", "message_added", &[])
            .unwrap();
        let job = db.insert_job(event.id, "full_extraction").unwrap();
        db.claim_job(job.id).unwrap().unwrap();

        let done = db
            .complete_job(job.id, &serde_json::json!({"summary": "s"}))
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.output.unwrap()["summary"], "s");
        // A terminal job is no longer claimable.
        assert!(db.claim_job(job.id).unwrap().is_none());
        assert!(db.list_pending_jobs().unwrap().is_empty());
    }

    #[test]
    fn test_program_slug_unique_and_channel_lookup() {
        let db = test_db();
        let program = db
            .create_program(
                "hardware",
                "Hardware Grants",
                "",
                &["U100".to_string()],
                &["C900".to_string()],
            )
            .unwrap()
            .unwrap();
        assert!(db.create_program("hardware", "Other", "", &[], &[]).unwrap().is_none());

        let by_channel = db.find_program_by_channel("C900").unwrap().unwrap();
        assert_eq!(by_channel.id, program.id);
        assert!(db.find_program_by_channel("C999").unwrap().is_none());

        assert!(db.soft_delete_program(program.id).unwrap());
        assert!(db.find_program_by_channel("C900").unwrap().is_none());
        // Slug is free again once the program is deleted.
        assert!(db.create_program("hardware", "Again", "", &[], &[]).unwrap().is_some());
    }

    #[test]
    fn test_update_program_partial_fields() {
        let db = test_db();
        let program = db
            .create_program("hw", "Hardware", "old", &[], &[])
            .unwrap()
            .unwrap();
        let updated = db
            .update_program(program.id, None, Some("new"), Some(&["U1".to_string()]), None)
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "Hardware");
        assert_eq!(updated.description, "new");
        assert_eq!(updated.owners, vec!["U1".to_string()]);
    }

    #[test]
    fn test_link_issue_program() {
        let db = test_db();
        let issue = seed_issue(&db, "C1:1.0");
        assert!(db.link_issue_program(issue.id, 42).unwrap().is_none());

        let program = db.create_program("hw", "Hardware", "", &[], &[]).unwrap().unwrap();
        let linked = db.link_issue_program(issue.id, program.id).unwrap().unwrap();
        assert_eq!(linked.program_id, Some(program.id));
    }

    #[test]
    fn test_owner_set_roundtrip() {
        let db = test_db();
        assert!(!db.is_owner("channel", "C1", "U1").unwrap());
        db.set_owner("channel", "C1", "U1").unwrap();
        // Idempotent.
        db.set_owner("channel", "C1", "U1").unwrap();
        assert!(db.is_owner("channel", "C1", "U1").unwrap());
        assert!(db.remove_owner("channel", "C1", "U1").unwrap());
        assert!(!db.remove_owner("channel", "C1", "U1").unwrap());
        assert!(!db.is_owner("channel", "C1", "U1").unwrap());
    }

    #[test]
    fn test_participants() {
        let db = test_db();
        let issue = seed_issue(&db, "C1:1.0");
        db.insert_participant(issue.id, "U1", "requester").unwrap();
        db.insert_participant(issue.id, "U2", "watcher").unwrap();
        let participants = db.list_participants(issue.id).unwrap();
        assert_eq!(participants.len(), 2);
        assert_eq!(participants[0].role, "requester");
    }
}
