use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the database.
///
/// Wraps `FactoryDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off the async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FactoryDb>>,
}

impl DbHandle {
    pub fn new(db: FactoryDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FactoryDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, FactoryDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct FactoryDb {
    conn: Connection,
}

const MESSAGE_COLUMNS: &str =
    "m.id, m.project_id, m.content, m.role, m.type, m.created_at, m.updated_at";
const FRAGMENT_COLUMNS: &str =
    "f.id, f.message_id, f.sandbox_url, f.title, f.files, f.created_at, f.updated_at";
const JOB_COLUMNS: &str =
    "id, project_id, prompt, status, output, error, created_at, updated_at, completed_at";

impl FactoryDb {
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
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    content TEXT NOT NULL,
                    role TEXT NOT NULL,
                    type TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS fragments (
                    id TEXT PRIMARY KEY,
                    message_id TEXT NOT NULL UNIQUE REFERENCES messages(id) ON DELETE CASCADE,
                    sandbox_url TEXT NOT NULL,
                    title TEXT NOT NULL,
                    files TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    prompt TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    output TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS job_steps (
                    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    step_name TEXT NOT NULL,
                    output TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (job_id, step_name)
                );

                CREATE INDEX IF NOT EXISTS idx_messages_project ON messages(project_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_projects_updated ON projects(updated_at);
                CREATE INDEX IF NOT EXISTS idx_jobs_project ON jobs(project_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    /// Create a project and its first USER message in one transaction.
    pub fn create_project_with_message(
        &self,
        name: &str,
        content: &str,
    ) -> Result<(Project, Message)> {
        let project_id = new_id();
        let message_id = new_id();
        let now = now_timestamp();

        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO projects (id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![project_id, name, now],
        )
        .context("Failed to insert project")?;
        tx.execute(
            "INSERT INTO messages (id, project_id, content, role, type, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                message_id,
                project_id,
                content,
                MessageRole::User.as_str(),
                MessageType::Result.as_str(),
                now
            ],
        )
        .context("Failed to insert first message")?;
        tx.commit().context("Failed to commit project creation")?;

        let project = self
            .get_project(&project_id)?
            .context("Project not found after insert")?;
        let message = self
            .get_message(&message_id)?
            .context("Message not found after insert")?;
        Ok((project, message))
    }

    /// Most recently updated first.
    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, created_at, updated_at FROM projects
                 ORDER BY updated_at DESC, rowid DESC",
            )
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Project {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?);
        }
        Ok(projects)
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, created_at, updated_at FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query project")
    }

    // ── Messages ──────────────────────────────────────────────────────

    /// Append a message to a project and bump the project's `updated_at`.
    pub fn create_message(
        &self,
        project_id: &str,
        content: &str,
        role: MessageRole,
        message_type: MessageType,
    ) -> Result<Message> {
        let id = new_id();
        let now = now_timestamp();

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        insert_message(&tx, &id, project_id, content, role, message_type, &now)?;
        touch_project(&tx, project_id, &now)?;
        tx.commit().context("Failed to commit message")?;

        self.get_message(&id)?
            .context("Message not found after insert")
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let sql = format!("SELECT {} FROM messages m WHERE m.id = ?1", MESSAGE_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], MessageRow::from_row)
            .optional()
            .context("Failed to query message")?;
        row.map(MessageRow::into_message).transpose()
    }

    /// Messages of a project in chronological order, each with its fragment.
    pub fn list_messages(&self, project_id: &str) -> Result<Vec<MessageWithFragment>> {
        let sql = format!(
            "SELECT {}, {} FROM messages m
             LEFT JOIN fragments f ON f.message_id = m.id
             WHERE m.project_id = ?1
             ORDER BY m.created_at ASC, m.rowid ASC",
            MESSAGE_COLUMNS, FRAGMENT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_messages")?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                let message = MessageRow::from_row(row)?;
                let fragment_id: Option<String> = row.get(7)?;
                let fragment = match fragment_id {
                    Some(id) => Some(FragmentRow {
                        id,
                        message_id: row.get(8)?,
                        sandbox_url: row.get(9)?,
                        title: row.get(10)?,
                        files: row.get(11)?,
                        created_at: row.get(12)?,
                        updated_at: row.get(13)?,
                    }),
                    None => None,
                };
                Ok((message, fragment))
            })
            .context("Failed to query messages")?;

        let mut messages = Vec::new();
        for row in rows {
            let (message, fragment) = row.context("Failed to read message row")?;
            messages.push(MessageWithFragment {
                message: message.into_message()?,
                fragment: fragment.map(FragmentRow::into_fragment).transpose()?,
            });
        }
        Ok(messages)
    }

    // ── Fragments ─────────────────────────────────────────────────────

    pub fn get_fragment(&self, id: &str) -> Result<Option<Fragment>> {
        let sql = format!("SELECT {} FROM fragments f WHERE f.id = ?1", FRAGMENT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], FragmentRow::from_row)
            .optional()
            .context("Failed to query fragment")?;
        row.map(FragmentRow::into_fragment).transpose()
    }

    /// Persist the terminal ASSISTANT message of a job's run. On success the
    /// message and its fragment are written together with the job's
    /// `save-result` step record, in one transaction. Returns `None` and
    /// writes nothing when the job has already recorded its result.
    pub fn save_result(
        &self,
        job_id: &str,
        project_id: &str,
        outcome: &RunOutcome,
        output: &JobOutput,
    ) -> Result<Option<MessageWithFragment>> {
        let message_id = new_id();
        let now = now_timestamp();

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if read_saved_result(&tx, job_id)?.is_some() {
            return Ok(None);
        }
        match outcome {
            RunOutcome::Error => {
                insert_message(
                    &tx,
                    &message_id,
                    project_id,
                    ERROR_MESSAGE_CONTENT,
                    MessageRole::Assistant,
                    MessageType::Error,
                    &now,
                )?;
            }
            RunOutcome::Success { summary, files } => {
                insert_message(
                    &tx,
                    &message_id,
                    project_id,
                    summary,
                    MessageRole::Assistant,
                    MessageType::Result,
                    &now,
                )?;
                let files_json =
                    serde_json::to_string(files).context("Failed to serialize fragment files")?;
                tx.execute(
                    "INSERT INTO fragments (id, message_id, sandbox_url, title, files, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![new_id(), message_id, output.url, FRAGMENT_TITLE, files_json, now],
                )
                .context("Failed to insert fragment")?;
            }
        }
        touch_project(&tx, project_id, &now)?;

        let saved = SavedResult {
            message_id: message_id.clone(),
            output: output.clone(),
        };
        let saved_json = serde_json::to_string(&saved).context("Failed to serialize saved result")?;
        tx.execute(
            "INSERT INTO job_steps (job_id, step_name, output, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![job_id, STEP_SAVE_RESULT, saved_json, now],
        )
        .context("Failed to record save-result step")?;
        tx.commit().context("Failed to commit result")?;

        self.get_message_with_fragment(&message_id)?
            .context("Result message not found after insert")
            .map(Some)
    }

    /// The terminal write recorded for a job, if any.
    pub fn get_saved_result(&self, job_id: &str) -> Result<Option<SavedResult>> {
        read_saved_result(&self.conn, job_id)
    }

    pub fn get_message_with_fragment(&self, id: &str) -> Result<Option<MessageWithFragment>> {
        let Some(message) = self.get_message(id)? else {
            return Ok(None);
        };
        let sql = format!(
            "SELECT {} FROM fragments f WHERE f.message_id = ?1",
            FRAGMENT_COLUMNS
        );
        let fragment = self
            .conn
            .query_row(&sql, params![id], FragmentRow::from_row)
            .optional()
            .context("Failed to query fragment by message")?
            .map(FragmentRow::into_fragment)
            .transpose()?;
        Ok(Some(MessageWithFragment { message, fragment }))
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn create_job(&self, project_id: &str, prompt: &str) -> Result<Job> {
        let id = new_id();
        let now = now_timestamp();
        self.conn
            .execute(
                "INSERT INTO jobs (id, project_id, prompt, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, project_id, prompt, JobStatus::Queued.as_str(), now],
            )
            .context("Failed to insert job")?;
        self.get_job(&id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], JobRow::from_row)
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn list_jobs(&self, project_id: &str) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE project_id = ?1 ORDER BY created_at ASC, rowid ASC",
            JOB_COLUMNS
        );
        self.query_jobs(&sql, params![project_id])
    }

    /// Jobs left queued or running, oldest first.
    pub fn list_unfinished_jobs(&self) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE status IN ('queued', 'running')
             ORDER BY created_at ASC, rowid ASC",
            JOB_COLUMNS
        );
        self.query_jobs(&sql, params![])
    }

    fn query_jobs<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare job query")?;
        let rows = stmt
            .query_map(params, JobRow::from_row)
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    /// Update a job's status. Terminal statuses also stamp `completed_at`.
    pub fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        output: Option<&JobOutput>,
        error: Option<&str>,
    ) -> Result<Job> {
        let now = now_timestamp();
        let output_json = output
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize job output")?;
        let completed_at = status.is_terminal().then(|| now.clone());
        self.conn
            .execute(
                "UPDATE jobs SET status = ?1,
                    output = COALESCE(?2, output),
                    error = COALESCE(?3, error),
                    updated_at = ?4,
                    completed_at = COALESCE(?5, completed_at)
                 WHERE id = ?6",
                params![status.as_str(), output_json, error, now, completed_at, id],
            )
            .context("Failed to update job status")?;
        self.get_job(id)?.context("Job not found after status update")
    }

    // ── Step memo ─────────────────────────────────────────────────────

    /// Stored output of a completed step, as JSON text.
    pub fn get_step(&self, job_id: &str, step_name: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT output FROM job_steps WHERE job_id = ?1 AND step_name = ?2",
                params![job_id, step_name],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query job step")
    }

    /// Record a step's output. The first recorded output is kept.
    pub fn put_step(&self, job_id: &str, step_name: &str, output: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO job_steps (job_id, step_name, output, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![job_id, step_name, output, now_timestamp()],
            )
            .context("Failed to record job step")?;
        Ok(())
    }
}

// ── Internal helpers ──────────────────────────────────────────────────

fn read_saved_result(conn: &Connection, job_id: &str) -> Result<Option<SavedResult>> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT output FROM job_steps WHERE job_id = ?1 AND step_name = ?2",
            params![job_id, STEP_SAVE_RESULT],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query saved result")?;
    stored
        .map(|json| serde_json::from_str(&json).context("Corrupt save-result record"))
        .transpose()
}

fn insert_message(
    conn: &Connection,
    id: &str,
    project_id: &str,
    content: &str,
    role: MessageRole,
    message_type: MessageType,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (id, project_id, content, role, type, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![id, project_id, content, role.as_str(), message_type.as_str(), now],
    )
    .context("Failed to insert message")?;
    Ok(())
}

fn touch_project(conn: &Connection, project_id: &str, now: &str) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE projects SET updated_at = ?1 WHERE id = ?2",
            params![now, project_id],
        )
        .context("Failed to update project timestamp")?;
    if updated == 0 {
        anyhow::bail!("Project {} not found", project_id);
    }
    Ok(())
}

/// Intermediate row struct for messages before parsing role/type strings.
struct MessageRow {
    id: String,
    project_id: String,
    content: String,
    role: String,
    message_type: String,
    created_at: String,
    updated_at: String,
}

impl MessageRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            content: row.get(2)?,
            role: row.get(3)?,
            message_type: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_message(self) -> Result<Message> {
        let role = MessageRole::from_str(&self.role)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse message role")?;
        let message_type = MessageType::from_str(&self.message_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse message type")?;
        Ok(Message {
            id: self.id,
            project_id: self.project_id,
            content: self.content,
            role,
            message_type,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for fragments; `files` is stored as JSON.
struct FragmentRow {
    id: String,
    message_id: String,
    sandbox_url: String,
    title: String,
    files: String,
    created_at: String,
    updated_at: String,
}

impl FragmentRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            message_id: row.get(1)?,
            sandbox_url: row.get(2)?,
            title: row.get(3)?,
            files: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_fragment(self) -> Result<Fragment> {
        let files: BTreeMap<String, String> =
            serde_json::from_str(&self.files).context("Failed to parse fragment files JSON")?;
        Ok(Fragment {
            id: self.id,
            message_id: self.message_id,
            sandbox_url: self.sandbox_url,
            title: self.title,
            files,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct JobRow {
    id: String,
    project_id: String,
    prompt: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            prompt: row.get(2)?,
            status: row.get(3)?,
            output: row.get(4)?,
            error: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            completed_at: row.get(8)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job status")?;
        let output = self
            .output
            .as_deref()
            .map(serde_json::from_str::<JobOutput>)
            .transpose()
            .context("Failed to parse job output JSON")?;
        Ok(Job {
            id: self.id,
            project_id: self.project_id,
            prompt: self.prompt,
            status,
            output,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn files(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn output(url: &str, outcome: &RunOutcome) -> JobOutput {
        match outcome {
            RunOutcome::Success { summary, files } => JobOutput {
                url: url.to_string(),
                title: FRAGMENT_TITLE.to_string(),
                files: files.clone(),
                summary: Some(summary.clone()),
            },
            RunOutcome::Error => JobOutput {
                url: url.to_string(),
                title: FRAGMENT_TITLE.to_string(),
                files: BTreeMap::new(),
                summary: None,
            },
        }
    }

    fn project_with_job(db: &FactoryDb, prompt: &str) -> Result<(Project, Job)> {
        let (project, _) = db.create_project_with_message("P", prompt)?;
        let job = db.create_job(&project.id, prompt)?;
        Ok((project, job))
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
             AND name IN ('projects', 'messages', 'fragments', 'jobs', 'job_steps')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 5, "Expected 5 tables to exist");
        // Migrations are re-runnable.
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_create_project_with_first_message() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let (project, message) =
            db.create_project_with_message("Brisk Falcon", "Build a todo app")?;

        assert_eq!(project.name, "Brisk Falcon");
        assert_eq!(message.project_id, project.id);
        assert_eq!(message.role, MessageRole::User);
        assert_eq!(message.message_type, MessageType::Result);
        assert_eq!(message.content, "Build a todo app");

        let fetched = db.get_project(&project.id)?.expect("project should exist");
        assert_eq!(fetched, project);
        assert!(db.get_project("missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_list_projects_most_recent_first() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let (first, _) = db.create_project_with_message("One", "a")?;
        let (second, _) = db.create_project_with_message("Two", "b")?;

        let names: Vec<String> = db.list_projects()?.into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["Two", "One"]);

        // A new message on the older project moves it to the top.
        std::thread::sleep(std::time::Duration::from_millis(5));
        db.create_message(&first.id, "more", MessageRole::User, MessageType::Result)?;
        let projects = db.list_projects()?;
        assert_eq!(projects[0].id, first.id);
        assert_eq!(projects[1].id, second.id);
        Ok(())
    }

    #[test]
    fn test_create_message_for_unknown_project_fails() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let result = db.create_message("nope", "hi", MessageRole::User, MessageType::Result);
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_save_success_writes_message_and_fragment() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let (project, job) = project_with_job(&db, "Build a counter button")?;
        let outcome = RunOutcome::Success {
            summary: "<task_summary>Counter</task_summary>".to_string(),
            files: files(&[("app/page.tsx", "export default () => null")]),
        };

        let saved = db
            .save_result(&job.id, &project.id, &outcome, &output("https://host:1234", &outcome))?
            .expect("first save should write");
        assert_eq!(saved.message.role, MessageRole::Assistant);
        assert_eq!(saved.message.message_type, MessageType::Result);
        assert_eq!(saved.message.content, "<task_summary>Counter</task_summary>");
        let fragment = saved.fragment.expect("fragment should exist");
        assert_eq!(fragment.title, FRAGMENT_TITLE);
        assert_eq!(fragment.sandbox_url, "https://host:1234");
        assert_eq!(fragment.files["app/page.tsx"], "export default () => null");

        assert_eq!(db.get_fragment(&fragment.id)?, Some(fragment.clone()));

        let messages = db.list_messages(&project.id)?;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message.role, MessageRole::User);
        assert!(messages[0].fragment.is_none());
        assert_eq!(messages[1].fragment.as_ref(), Some(&fragment));
        Ok(())
    }

    #[test]
    fn test_save_error_writes_message_only() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let (project, job) = project_with_job(&db, "x")?;

        let outcome = RunOutcome::Error;
        let saved = db
            .save_result(&job.id, &project.id, &outcome, &output("https://host:1", &outcome))?
            .expect("first save should write");
        assert_eq!(saved.message.message_type, MessageType::Error);
        assert_eq!(saved.message.content, ERROR_MESSAGE_CONTENT);
        assert!(saved.fragment.is_none());

        let count: i32 = db
            .conn
            .query_row("SELECT COUNT(*) FROM fragments", [], |row| row.get(0))?;
        assert_eq!(count, 0);
        Ok(())
    }

    #[test]
    fn test_save_result_for_unknown_project_writes_nothing() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let outcome = RunOutcome::Success {
            summary: "s".to_string(),
            files: files(&[("a.ts", "x")]),
        };
        let result =
            db.save_result("missing-job", "missing", &outcome, &output("https://h", &outcome));
        assert!(result.is_err());
        let count: i32 = db
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        assert_eq!(count, 0);
        Ok(())
    }

    #[test]
    fn test_save_result_is_recorded_with_the_write() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let (project, job) = project_with_job(&db, "x")?;
        let outcome = RunOutcome::Success {
            summary: "<task_summary>one</task_summary>".to_string(),
            files: files(&[("a.ts", "x")]),
        };
        let first_output = output("https://h:1", &outcome);

        assert!(db.get_saved_result(&job.id)?.is_none());
        let written = db
            .save_result(&job.id, &project.id, &outcome, &first_output)?
            .expect("first save should write");

        let recorded = db.get_saved_result(&job.id)?.expect("step should be recorded");
        assert_eq!(recorded.message_id, written.message.id);
        assert_eq!(recorded.output, first_output);

        // A second save for the same job writes nothing.
        let error = RunOutcome::Error;
        let again = db.save_result(&job.id, &project.id, &error, &output("", &error))?;
        assert!(again.is_none());
        let messages = db.list_messages(&project.id)?;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].message.message_type, MessageType::Result);
        Ok(())
    }

    #[test]
    fn test_failed_save_records_no_step() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let (_, job) = project_with_job(&db, "x")?;
        let outcome = RunOutcome::Error;

        // Unknown project: the message insert fails and the step row rolls back.
        assert!(db.save_result(&job.id, "missing", &outcome, &output("", &outcome)).is_err());
        assert!(db.get_saved_result(&job.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_job_lifecycle() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let (project, _) = db.create_project_with_message("P", "x")?;
        let job = db.create_job(&project.id, "x")?;
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.completed_at.is_none());

        let running = db.update_job_status(&job.id, JobStatus::Running, None, None)?;
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(db.list_unfinished_jobs()?.len(), 1);

        let output = JobOutput {
            url: "https://h".to_string(),
            title: FRAGMENT_TITLE.to_string(),
            files: files(&[("a.ts", "x")]),
            summary: Some("s".to_string()),
        };
        let done = db.update_job_status(&job.id, JobStatus::Completed, Some(&output), None)?;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.output, Some(output));
        assert!(done.completed_at.is_some());
        assert!(db.list_unfinished_jobs()?.is_empty());
        assert_eq!(db.list_jobs(&project.id)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_step_memo_keeps_first_output() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let (project, _) = db.create_project_with_message("P", "x")?;
        let job = db.create_job(&project.id, "x")?;

        assert!(db.get_step(&job.id, "get-sandbox-id")?.is_none());
        db.put_step(&job.id, "get-sandbox-id", "\"sbx-1\"")?;
        db.put_step(&job.id, "get-sandbox-id", "\"sbx-2\"")?;
        assert_eq!(db.get_step(&job.id, "get-sandbox-id")?.as_deref(), Some("\"sbx-1\""));
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_call() -> Result<()> {
        let handle = DbHandle::new(FactoryDb::new_in_memory()?);
        let (project, _) = handle
            .call(|db| db.create_project_with_message("P", "x"))
            .await?;
        let fetched = handle
            .call(move |db| db.get_project(&project.id))
            .await?;
        assert!(fetched.is_some());
        Ok(())
    }
}
