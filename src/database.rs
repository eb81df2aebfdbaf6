use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use tracing::debug;
use crate::errors::Result;

const TABLE_RECORDINGS: &str = "recordings";

/// A recording about to be persisted
#[derive(Debug, Clone)]
pub struct NewRecording {
    pub camera_id: String,
    pub file_path: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RecordingRecord {
    pub id: i64,
    pub camera_id: String,
    pub file_path: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingQuery {
    pub camera_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RecordingStore: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    /// Persist one finished recording, returning its id
    async fn save_recording(&self, recording: &NewRecording) -> Result<i64>;

    async fn list_recordings(&self, query: &RecordingQuery) -> Result<Vec<RecordingRecord>>;
}

pub struct SqliteRecordingStore {
    pool: SqlitePool,
}

impl SqliteRecordingStore {
    pub async fn new(database_path: &str) -> Result<Self> {
        // Ensure the directory exists
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", database_path);
        let pool = SqlitePool::connect(&database_url).await?;

        Ok(Self { pool })
    }

    /// Private in-memory database; a single connection keeps every query on the same schema
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl RecordingStore for SqliteRecordingStore {
    async fn initialize(&self) -> Result<()> {
        let create_recordings_query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                camera_id TEXT NOT NULL,
                file_path TEXT NOT NULL,
                start_time TIMESTAMP NOT NULL,
                end_time TIMESTAMP NOT NULL
            )
            "#,
            TABLE_RECORDINGS
        );
        sqlx::query(&create_recordings_query)
            .execute(&self.pool)
            .await?;

        let idx_camera_start_time = format!(
            "CREATE INDEX IF NOT EXISTS idx_recordings_camera_start ON {}(camera_id, start_time)",
            TABLE_RECORDINGS
        );
        sqlx::query(&idx_camera_start_time)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn save_recording(&self, recording: &NewRecording) -> Result<i64> {
        let query = format!(
            "INSERT INTO {} (camera_id, file_path, start_time, end_time) VALUES (?, ?, ?, ?)",
            TABLE_RECORDINGS
        );
        let result = sqlx::query(&query)
            .bind(&recording.camera_id)
            .bind(&recording.file_path)
            .bind(recording.start_time)
            .bind(recording.end_time)
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    async fn list_recordings(&self, query: &RecordingQuery) -> Result<Vec<RecordingRecord>> {
        let mut conditions = Vec::new();
        let mut bind_values: Vec<String> = Vec::new();

        if let Some(ref camera_id) = query.camera_id {
            conditions.push("camera_id = ?");
            bind_values.push(camera_id.clone());
        }

        if let Some(from) = query.from {
            conditions.push("start_time >= ?");
            bind_values.push(from.to_rfc3339());
        }

        if let Some(to) = query.to {
            conditions.push("start_time <= ?");
            bind_values.push(to.to_rfc3339());
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT id, camera_id, file_path, start_time, end_time FROM {}{} ORDER BY start_time DESC",
            TABLE_RECORDINGS, where_clause
        );
        debug!("list_recordings: {} {:?}", sql, bind_values);

        let mut query_builder = sqlx::query_as::<_, RecordingRecord>(&sql);
        for value in &bind_values {
            query_builder = query_builder.bind(value);
        }

        Ok(query_builder.fetch_all(&self.pool).await?)
    }
}
