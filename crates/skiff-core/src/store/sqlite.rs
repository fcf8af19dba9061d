//! SQLite-backed task store (sqlx).

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;

use super::{TaskRecord, TaskState, TaskStore};
use crate::request::DownloadRequest;
use crate::segment::Segment;
use crate::source::SourceResumeState;

/// Handle to the SQLite-backed task database.
///
/// The default database file lives under the XDG state directory:
/// `~/.local/state/skiff/tasks.db`.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: Pool<Sqlite>,
}

impl SqliteTaskStore {
    /// Open (or create) the default task database and run migrations.
    pub async fn open_default() -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("skiff")?;
        let state_dir = xdg_dirs.get_state_home();
        tokio::fs::create_dir_all(&state_dir).await?;
        Self::open_at(&state_dir.join("tasks.db")).await
    }

    /// Open (or create) a task database at an explicit path.
    pub async fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("open task db at {}", path.display()))?;

        let store = SqliteTaskStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database for tests. `sqlite::memory:` gives every pooled
    /// connection its own blank database, so the pool is capped at one.
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = SqliteTaskStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        // One row per task. Request, segment plan, and resume blob are JSON
        // columns; the hot scalar fields get their own columns for queries.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                request TEXT NOT NULL,
                output_path TEXT,
                state TEXT NOT NULL,
                total_bytes INTEGER NOT NULL DEFAULT -1,
                downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                accept_ranges INTEGER NOT NULL DEFAULT 0,
                etag TEXT,
                last_modified TEXT,
                segments TEXT,
                source_type TEXT,
                resume_state TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TaskRecord> {
        let request_json: String = row.get("request");
        let request: DownloadRequest =
            serde_json::from_str(&request_json).context("parse stored request")?;

        let segments_json: Option<String> = row.get("segments");
        let segments: Option<Vec<Segment>> = segments_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("parse stored segments")?;

        let resume_json: Option<String> = row.get("resume_state");
        let source_resume_state: Option<SourceResumeState> = resume_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("parse stored resume state")?;

        let state_str: String = row.get("state");
        let downloaded: i64 = row.get("downloaded_bytes");

        Ok(TaskRecord {
            task_id: row.get("task_id"),
            request,
            output_path: row.get("output_path"),
            state: TaskState::parse(&state_str),
            total_bytes: row.get("total_bytes"),
            downloaded_bytes: downloaded.max(0) as u64,
            error_message: row.get("error_message"),
            accept_ranges: row.get::<i64, _>("accept_ranges") != 0,
            etag: row.get("etag"),
            last_modified: row.get("last_modified"),
            segments,
            source_type: row.get("source_type"),
            source_resume_state,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn save(&self, record: &TaskRecord) -> Result<()> {
        let request = serde_json::to_string(&record.request)?;
        let segments = record
            .segments
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let resume_state = record
            .source_resume_state
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO tasks (
                task_id, request, output_path, state,
                total_bytes, downloaded_bytes, error_message, accept_ranges,
                etag, last_modified, segments, source_type, resume_state,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&record.task_id)
        .bind(request)
        .bind(&record.output_path)
        .bind(record.state.as_str())
        .bind(record.total_bytes)
        .bind(record.downloaded_bytes as i64)
        .bind(&record.error_message)
        .bind(record.accept_ranges as i64)
        .bind(&record.etag)
        .bind(&record.last_modified)
        .bind(segments)
        .bind(&record.source_type)
        .bind(resume_state)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn load_all(&self) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at ASC, task_id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn remove(&self, task_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE task_id = ?1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
