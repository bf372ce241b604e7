//! SQLite-based persistence store

use crate::core::{Execution, Pipeline};
use crate::persistence::{ExecutionSummary, PersistenceBackend};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// SQLite execution store
///
/// Pipelines and executions are kept as JSON documents next to the few
/// columns needed for listing.
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    /// Open (or create) the database at `db_path`; `:memory:` is accepted
    pub async fn new(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path))
            .context("Invalid database path")?
            .create_if_missing(true);
        // one connection so that `:memory:` databases are shared
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("pipeline-engine");
        std::fs::create_dir_all(&db_dir)
            .with_context(|| format!("Failed to create {}", db_dir.display()))?;

        Self::at(&db_dir.join("executions.db")).await
    }

    pub async fn at(path: &Path) -> Result<Self> {
        let path = path
            .to_str()
            .with_context(|| format!("Database path is not UTF-8: {}", path.display()))?;
        Self::new(path).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pipelines (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                pipeline_id TEXT NOT NULL,
                pipeline_name TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pipeline_id ON executions(pipeline_id);
            CREATE INDEX IF NOT EXISTS idx_status ON executions(status);
            CREATE INDEX IF NOT EXISTS idx_created_at ON executions(created_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize schema")?;

        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    fn decode_execution(data: &str) -> Result<Execution> {
        serde_json::from_str(data).context("Corrupt execution record")
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for SqliteExecutionStore {
    async fn save_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let data = serde_json::to_string(pipeline).context("Failed to encode pipeline")?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO pipelines (id, name, version, data, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(pipeline.id())
        .bind(pipeline.name())
        .bind(pipeline.version as i64)
        .bind(data)
        .bind(Self::to_naive(pipeline.updated_at))
        .execute(&self.pool)
        .await
        .context("Failed to save pipeline")?;

        Ok(())
    }

    async fn load_pipeline(&self, pipeline_id: &str) -> Result<Option<Pipeline>> {
        let row = sqlx::query("SELECT data FROM pipelines WHERE id = ?1")
            .bind(pipeline_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load pipeline")?;

        row.map(|row| {
            Pipeline::from_json(&row.get::<String, _>("data")).context("Corrupt pipeline record")
        })
        .transpose()
    }

    async fn save_execution(&self, execution: &Execution) -> Result<()> {
        let data = serde_json::to_string(execution).context("Failed to encode execution")?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO executions
            (id, pipeline_id, pipeline_name, status, created_at, completed_at, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(execution.execution_id.to_string())
        .bind(&execution.pipeline_id)
        .bind(&execution.pipeline_name)
        .bind(execution.status.as_str())
        .bind(Self::to_naive(execution.created_at))
        .bind(execution.completed_at.map(Self::to_naive))
        .bind(data)
        .execute(&self.pool)
        .await
        .context("Failed to save execution")?;

        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<Execution>> {
        let row = sqlx::query("SELECT data FROM executions WHERE id = ?1")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load execution")?;

        row.map(|row| Self::decode_execution(&row.get::<String, _>("data")))
            .transpose()
    }

    async fn list_executions(
        &self,
        pipeline_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT data
            FROM executions
            WHERE ?1 IS NULL OR pipeline_id = ?1
            ORDER BY created_at DESC
            LIMIT ?2
            "#,
        )
        .bind(pipeline_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list executions")?;

        rows.iter()
            .map(|row| {
                let execution = Self::decode_execution(&row.get::<String, _>("data"))?;
                Ok(ExecutionSummary::from(&execution))
            })
            .collect()
    }
}
