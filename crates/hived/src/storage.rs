//! SQLite storage for the hive daemon.
//!
//! Persists runs, steps, stories and the event audit log. Engine operations
//! go through [`Tx`], one SQLite transaction per operation; read-only
//! status queries go straight to the pool.

use chrono::{DateTime, Utc};
use hive_core::{Event, Id, Run, RunStatus, Step, StepKind, StepStatus, Story, StoryStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Executor, Pool, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Explicit column lists keep row mapping independent of table column order.
const RUN_COLUMNS: &str =
    "id, run_number, workflow_id, task, status, context_json, notify_url, created_at, updated_at";
const STEP_COLUMNS: &str = "id, run_id, step_key, agent_id, step_index, input_template, expects, \
    status, retry_count, max_retries, kind, loop_config_json, current_story_id, output, \
    created_at, updated_at";
const STORY_COLUMNS: &str = "id, run_id, story_index, story_key, title, description, \
    acceptance_criteria_json, status, output, retry_count, max_retries, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("step not found: {0}")]
    StepNotFound(String),
    #[error("story not found: {0}")]
    StoryNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    // Re-running against an existing database is expected.
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Underlying pool, for ad-hoc maintenance queries.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Begin a write transaction.
    pub async fn begin(&self) -> Result<Tx> {
        Ok(Tx {
            inner: self.pool.begin().await?,
        })
    }

    // --- Reads ---

    pub async fn get_run(&self, id: &Id) -> Result<Run> {
        fetch_run(&self.pool, id).await
    }

    /// List runs newest first, optionally filtered by workflow.
    pub async fn list_runs(&self, workflow_id: Option<&str>) -> Result<Vec<Run>> {
        let rows = match workflow_id {
            Some(wf) => {
                let query = format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE workflow_id = ?1 ORDER BY run_number DESC"
                );
                sqlx::query_as::<_, RunRow>(&query)
                    .bind(wf)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!("SELECT {RUN_COLUMNS} FROM runs ORDER BY run_number DESC");
                sqlx::query_as::<_, RunRow>(&query)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }

    /// Count runs of a workflow still in status `running`.
    pub async fn count_running_runs_for_workflow(&self, workflow_id: &str) -> Result<usize> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM runs WHERE workflow_id = ?1 AND status = 'running'",
        )
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 as usize)
    }

    pub async fn get_step(&self, id: &Id) -> Result<Step> {
        fetch_step(&self.pool, id).await
    }

    pub async fn list_steps(&self, run_id: &Id) -> Result<Vec<Step>> {
        fetch_steps(&self.pool, run_id).await
    }

    pub async fn get_story(&self, id: &Id) -> Result<Story> {
        fetch_story(&self.pool, id).await
    }

    pub async fn list_stories(&self, run_id: &Id) -> Result<Vec<Story>> {
        fetch_stories(&self.pool, run_id).await
    }

    /// Whether any claimable step exists for `agent_id`.
    pub async fn has_pending_step(&self, agent_id: &str) -> Result<bool> {
        Ok(fetch_pending_step(&self.pool, agent_id).await?.is_some())
    }

    // --- Events ---

    /// Append an event to the audit log.
    pub async fn append_event(&self, event: &Event) -> Result<()> {
        insert_event(&self.pool, event).await
    }

    /// List events for a run in order.
    pub async fn list_events(&self, run_id: &Id) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, run_id, step_id, story_id, type, detail, ts FROM events \
             WHERE run_id = ?1 ORDER BY ts, rowid",
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }
}

/// One engine transaction. Dropping without [`Tx::commit`] rolls back.
#[allow(missing_debug_implementations)]
pub struct Tx {
    inner: Transaction<'static, Sqlite>,
}

impl Tx {
    pub async fn commit(self) -> Result<()> {
        self.inner.commit().await?;
        Ok(())
    }

    pub async fn get_run(&mut self, id: &Id) -> Result<Run> {
        fetch_run(&mut *self.inner, id).await
    }

    pub async fn get_step(&mut self, id: &Id) -> Result<Step> {
        fetch_step(&mut *self.inner, id).await
    }

    pub async fn get_story(&mut self, id: &Id) -> Result<Story> {
        fetch_story(&mut *self.inner, id).await
    }

    pub async fn list_steps(&mut self, run_id: &Id) -> Result<Vec<Step>> {
        fetch_steps(&mut *self.inner, run_id).await
    }

    pub async fn list_stories(&mut self, run_id: &Id) -> Result<Vec<Story>> {
        fetch_stories(&mut *self.inner, run_id).await
    }

    /// Append to the audit log as part of this transaction.
    pub async fn insert_event(&mut self, event: &Event) -> Result<()> {
        insert_event(&mut *self.inner, event).await
    }

    pub async fn next_run_number(&mut self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(run_number), 0) + 1 FROM runs")
            .fetch_one(&mut *self.inner)
            .await?;
        Ok(row.0)
    }

    pub async fn insert_run(&mut self, run: &Run) -> Result<()> {
        sqlx::query(
            "INSERT INTO runs (id, run_number, workflow_id, task, status, context_json, \
             notify_url, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(run.id.as_ref())
        .bind(run.run_number)
        .bind(&run.workflow_id)
        .bind(&run.task)
        .bind(run.status.as_str())
        .bind(&run.context_json)
        .bind(&run.notify_url)
        .bind(run.created_at.timestamp_millis())
        .bind(run.updated_at.timestamp_millis())
        .execute(&mut *self.inner)
        .await?;
        Ok(())
    }

    pub async fn insert_step(&mut self, step: &Step) -> Result<()> {
        sqlx::query(
            "INSERT INTO steps (id, run_id, step_key, agent_id, step_index, input_template, \
             expects, status, retry_count, max_retries, kind, loop_config_json, current_story_id, \
             output, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )
        .bind(step.id.as_ref())
        .bind(step.run_id.as_ref())
        .bind(&step.step_key)
        .bind(&step.agent_id)
        .bind(step.step_index)
        .bind(&step.input_template)
        .bind(&step.expects)
        .bind(step.status.as_str())
        .bind(step.retry_count)
        .bind(step.max_retries)
        .bind(step.kind.as_str())
        .bind(&step.loop_config_json)
        .bind(step.current_story_id.as_ref().map(|id| id.0.as_str()))
        .bind(&step.output)
        .bind(step.created_at.timestamp_millis())
        .bind(step.updated_at.timestamp_millis())
        .execute(&mut *self.inner)
        .await?;
        Ok(())
    }

    pub async fn insert_story(&mut self, story: &Story) -> Result<()> {
        sqlx::query(
            "INSERT INTO stories (id, run_id, story_index, story_key, title, description, \
             acceptance_criteria_json, status, output, retry_count, max_retries, created_at, \
             updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(story.id.as_ref())
        .bind(story.run_id.as_ref())
        .bind(story.story_index)
        .bind(&story.story_key)
        .bind(&story.title)
        .bind(&story.description)
        .bind(&story.acceptance_criteria_json)
        .bind(story.status.as_str())
        .bind(&story.output)
        .bind(story.retry_count)
        .bind(story.max_retries)
        .bind(story.created_at.timestamp_millis())
        .bind(story.updated_at.timestamp_millis())
        .execute(&mut *self.inner)
        .await?;
        Ok(())
    }

    /// Persist the mutable fields of a run.
    pub async fn save_run(&mut self, run: &Run) -> Result<()> {
        let result = sqlx::query(
            "UPDATE runs SET status = ?1, context_json = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(run.status.as_str())
        .bind(&run.context_json)
        .bind(run.updated_at.timestamp_millis())
        .bind(run.id.as_ref())
        .execute(&mut *self.inner)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(run.id.to_string()));
        }
        Ok(())
    }

    /// Persist the mutable fields of a step.
    pub async fn save_step(&mut self, step: &Step) -> Result<()> {
        let result = sqlx::query(
            "UPDATE steps SET status = ?1, retry_count = ?2, current_story_id = ?3, output = ?4, \
             updated_at = ?5 WHERE id = ?6",
        )
        .bind(step.status.as_str())
        .bind(step.retry_count)
        .bind(step.current_story_id.as_ref().map(|id| id.0.as_str()))
        .bind(&step.output)
        .bind(step.updated_at.timestamp_millis())
        .bind(step.id.as_ref())
        .execute(&mut *self.inner)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::StepNotFound(step.id.to_string()));
        }
        Ok(())
    }

    /// Persist the mutable fields of a story.
    pub async fn save_story(&mut self, story: &Story) -> Result<()> {
        let result = sqlx::query(
            "UPDATE stories SET status = ?1, retry_count = ?2, output = ?3, updated_at = ?4 \
             WHERE id = ?5",
        )
        .bind(story.status.as_str())
        .bind(story.retry_count)
        .bind(&story.output)
        .bind(story.updated_at.timestamp_millis())
        .bind(story.id.as_ref())
        .execute(&mut *self.inner)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::StoryNotFound(story.id.to_string()));
        }
        Ok(())
    }

    /// Move a step from `pending` to `running`. Returns false if another
    /// caller got there first.
    pub async fn claim_step(&mut self, id: &Id, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE steps SET status = 'running', updated_at = ?1 \
             WHERE id = ?2 AND status = 'pending'",
        )
        .bind(now.timestamp_millis())
        .bind(id.as_ref())
        .execute(&mut *self.inner)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Oldest claimable step for `agent_id` on a running run.
    pub async fn next_pending_step(&mut self, agent_id: &str) -> Result<Option<Step>> {
        fetch_pending_step(&mut *self.inner, agent_id).await
    }

    /// Running steps of running runs last touched before `cutoff`.
    pub async fn stale_running_steps(&mut self, cutoff: DateTime<Utc>) -> Result<Vec<Step>> {
        let query = format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE status = 'running' AND updated_at < ?1 \
             AND run_id IN (SELECT id FROM runs WHERE status = 'running') \
             ORDER BY updated_at, step_index"
        );
        let rows = sqlx::query_as::<_, StepRow>(&query)
            .bind(cutoff.timestamp_millis())
            .fetch_all(&mut *self.inner)
            .await?;
        Ok(rows.into_iter().map(StepRow::into_step).collect())
    }

    /// Step of a run by its workflow key.
    pub async fn step_by_key(&mut self, run_id: &Id, step_key: &str) -> Result<Option<Step>> {
        let query = format!("SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 AND step_key = ?2");
        let row = sqlx::query_as::<_, StepRow>(&query)
            .bind(run_id.as_ref())
            .bind(step_key)
            .fetch_optional(&mut *self.inner)
            .await?;
        Ok(row.map(StepRow::into_step))
    }

    /// Lowest-index story of a run with the given status.
    pub async fn first_story_with_status(
        &mut self,
        run_id: &Id,
        status: StoryStatus,
    ) -> Result<Option<Story>> {
        let query = format!(
            "SELECT {STORY_COLUMNS} FROM stories WHERE run_id = ?1 AND status = ?2 \
             ORDER BY story_index LIMIT 1"
        );
        let row = sqlx::query_as::<_, StoryRow>(&query)
            .bind(run_id.as_ref())
            .bind(status.as_str())
            .fetch_optional(&mut *self.inner)
            .await?;
        Ok(row.map(StoryRow::into_story))
    }

    /// Most recently finished story of a run.
    pub async fn last_done_story(&mut self, run_id: &Id) -> Result<Option<Story>> {
        let query = format!(
            "SELECT {STORY_COLUMNS} FROM stories WHERE run_id = ?1 AND status = 'done' \
             ORDER BY updated_at DESC, story_index DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, StoryRow>(&query)
            .bind(run_id.as_ref())
            .fetch_optional(&mut *self.inner)
            .await?;
        Ok(row.map(StoryRow::into_story))
    }

    /// Story counts for a run: (total, done).
    pub async fn story_counts(&mut self, run_id: &Id) -> Result<(i64, i64)> {
        let row: (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = 'done' THEN 1 ELSE 0 END), 0) \
             FROM stories WHERE run_id = ?1",
        )
        .bind(run_id.as_ref())
        .fetch_one(&mut *self.inner)
        .await?;
        Ok(row)
    }
}

// --- Shared queries, usable from the pool or a transaction ---

async fn fetch_run<'e, E>(executor: E, id: &Id) -> Result<Run>
where
    E: Executor<'e, Database = Sqlite>,
{
    let query = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1");
    let row = sqlx::query_as::<_, RunRow>(&query)
        .bind(id.as_ref())
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;
    Ok(row.into_run())
}

async fn fetch_step<'e, E>(executor: E, id: &Id) -> Result<Step>
where
    E: Executor<'e, Database = Sqlite>,
{
    let query = format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1");
    let row = sqlx::query_as::<_, StepRow>(&query)
        .bind(id.as_ref())
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| StorageError::StepNotFound(id.to_string()))?;
    Ok(row.into_step())
}

async fn fetch_steps<'e, E>(executor: E, run_id: &Id) -> Result<Vec<Step>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let query = format!("SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 ORDER BY step_index");
    let rows = sqlx::query_as::<_, StepRow>(&query)
        .bind(run_id.as_ref())
        .fetch_all(executor)
        .await?;
    Ok(rows.into_iter().map(StepRow::into_step).collect())
}

async fn fetch_story<'e, E>(executor: E, id: &Id) -> Result<Story>
where
    E: Executor<'e, Database = Sqlite>,
{
    let query = format!("SELECT {STORY_COLUMNS} FROM stories WHERE id = ?1");
    let row = sqlx::query_as::<_, StoryRow>(&query)
        .bind(id.as_ref())
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| StorageError::StoryNotFound(id.to_string()))?;
    Ok(row.into_story())
}

async fn insert_event<'e, E>(executor: E, event: &Event) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO events (id, run_id, step_id, story_id, type, detail, ts) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(event.id.as_ref())
    .bind(event.run_id.as_ref())
    .bind(event.step_id.as_ref().map(|id| id.0.as_str()))
    .bind(event.story_id.as_ref().map(|id| id.0.as_str()))
    .bind(&event.event_type)
    .bind(&event.detail)
    .bind(event.timestamp.timestamp_millis())
    .execute(executor)
    .await?;
    Ok(())
}

async fn fetch_stories<'e, E>(executor: E, run_id: &Id) -> Result<Vec<Story>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let query =
        format!("SELECT {STORY_COLUMNS} FROM stories WHERE run_id = ?1 ORDER BY story_index");
    let rows = sqlx::query_as::<_, StoryRow>(&query)
        .bind(run_id.as_ref())
        .fetch_all(executor)
        .await?;
    Ok(rows.into_iter().map(StoryRow::into_story).collect())
}

/// Agent identities match exactly or with a `@run:` scope suffix. `LIKE` is
/// avoided because `_` in workflow ids is a wildcard there.
async fn fetch_pending_step<'e, E>(executor: E, agent_id: &str) -> Result<Option<Step>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let query = format!(
        "SELECT {STEP_COLUMNS} FROM steps WHERE status = 'pending' \
         AND (agent_id = ?1 OR substr(agent_id, 1, length(?1) + 5) = ?1 || '@run:') \
         AND run_id IN (SELECT id FROM runs WHERE status = 'running') \
         ORDER BY updated_at, step_index LIMIT 1"
    );
    let row = sqlx::query_as::<_, StepRow>(&query)
        .bind(agent_id)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(StepRow::into_step))
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    run_number: i64,
    workflow_id: String,
    task: String,
    status: String,
    context_json: String,
    notify_url: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RunRow {
    fn into_run(self) -> Run {
        let status = match self.status.as_str() {
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            _ => RunStatus::Failed,
        };

        Run {
            id: Id::from_string(self.id),
            run_number: self.run_number,
            workflow_id: self.workflow_id,
            task: self.task,
            status,
            context_json: self.context_json,
            notify_url: self.notify_url,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: String,
    run_id: String,
    step_key: String,
    agent_id: String,
    step_index: i64,
    input_template: String,
    expects: String,
    status: String,
    retry_count: i64,
    max_retries: i64,
    kind: String,
    loop_config_json: Option<String>,
    current_story_id: Option<String>,
    output: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl StepRow {
    fn into_step(self) -> Step {
        let status = match self.status.as_str() {
            "waiting" => StepStatus::Waiting,
            "pending" => StepStatus::Pending,
            "running" => StepStatus::Running,
            "done" => StepStatus::Done,
            _ => StepStatus::Failed,
        };
        let kind = match self.kind.as_str() {
            "loop" => StepKind::Loop,
            _ => StepKind::Single,
        };

        Step {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            step_key: self.step_key,
            agent_id: self.agent_id,
            step_index: self.step_index,
            input_template: self.input_template,
            expects: self.expects,
            status,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            kind,
            loop_config_json: self.loop_config_json,
            current_story_id: self.current_story_id.map(Id::from_string),
            output: self.output,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct StoryRow {
    id: String,
    run_id: String,
    story_index: i64,
    story_key: String,
    title: String,
    description: String,
    acceptance_criteria_json: String,
    status: String,
    output: Option<String>,
    retry_count: i64,
    max_retries: i64,
    created_at: i64,
    updated_at: i64,
}

impl StoryRow {
    fn into_story(self) -> Story {
        let status = match self.status.as_str() {
            "pending" => StoryStatus::Pending,
            "running" => StoryStatus::Running,
            "done" => StoryStatus::Done,
            _ => StoryStatus::Failed,
        };

        Story {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            story_index: self.story_index,
            story_key: self.story_key,
            title: self.title,
            description: self.description,
            acceptance_criteria_json: self.acceptance_criteria_json,
            status,
            output: self.output,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    run_id: String,
    step_id: Option<String>,
    story_id: Option<String>,
    #[sqlx(rename = "type")]
    event_type: String,
    detail: Option<String>,
    ts: i64,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            step_id: self.step_id.map(Id::from_string),
            story_id: self.story_id.map(Id::from_string),
            event_type: self.event_type,
            detail: self.detail,
            timestamp: from_millis(self.ts),
        }
    }
}
