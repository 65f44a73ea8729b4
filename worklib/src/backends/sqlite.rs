use crate::error::Result;
use crate::record::{JobRecord, JobStatus};
use crate::services::RecordStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::info;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS jobs (
    job_id      TEXT PRIMARY KEY NOT NULL,
    status      TEXT NOT NULL,
    bucket      TEXT,
    received_at TEXT,
    started_at  TEXT,
    finished_at TEXT,
    exit_code   INTEGER,
    error       TEXT
)";

const COLUMNS: &str =
    "job_id, status, bucket, received_at, started_at, finished_at, exit_code, error";

/// Job records in a SQLite `jobs` table, one row per job id.
#[derive(Clone, Debug)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    /// Open (or create) the database file and make sure the table exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        info!("record database opened at {}", path.display());
        Ok(Self { pool })
    }
}

fn from_row(row: &SqliteRow) -> Result<JobRecord> {
    let status: String = row.try_get("status")?;
    Ok(JobRecord {
        job_id: row.try_get("job_id")?,
        status: status.parse::<JobStatus>()?,
        bucket: row.try_get("bucket")?,
        received_at: row.try_get::<Option<DateTime<Utc>>, _>("received_at")?,
        started_at: row.try_get::<Option<DateTime<Utc>>, _>("started_at")?,
        finished_at: row.try_get::<Option<DateTime<Utc>>, _>("finished_at")?,
        exit_code: row.try_get("exit_code")?,
        error: row.try_get("error")?,
    })
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn find_by_id(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE job_id = ?1", COLUMNS))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(from_row).transpose()
    }

    async fn create(&self, record: JobRecord) -> Result<JobRecord> {
        sqlx::query(
            "INSERT INTO jobs
                (job_id, status, bucket, received_at, started_at, finished_at, exit_code, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(job_id) DO NOTHING",
        )
        .bind(&record.job_id)
        .bind(record.status.as_str())
        .bind(&record.bucket)
        .bind(record.received_at)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.exit_code)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        // a concurrent creator may have won, return whatever is stored
        Ok(self.find_by_id(&record.job_id).await?.unwrap_or(record))
    }

    async fn save(&self, record: &JobRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs
                (job_id, status, bucket, received_at, started_at, finished_at, exit_code, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(job_id) DO UPDATE SET
                status = excluded.status,
                bucket = excluded.bucket,
                received_at = excluded.received_at,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                exit_code = excluded.exit_code,
                error = excluded.error",
        )
        .bind(&record.job_id)
        .bind(record.status.as_str())
        .bind(&record.bucket)
        .bind(record.received_at)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.exit_code)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
