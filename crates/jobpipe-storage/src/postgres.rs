//! PostgreSQL-backed raw job and tracking stores.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobpipe_core::{
    raw_job_uuid, JobPosting, JobSource, RawData, RawJobRecord, SalaryInput, TrackingRecord,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{FailureState, MarkOutcome, RawJobStore, StoreError, TrackingStore};

const RAW_COLUMNS: &str = "id, source, job_id, title, company, description, location, url, \
     salary_range, salary, requirements, job_type, experience_level, raw_data, \
     processed, attempts, last_error, poisoned, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Unavailable(format!("connecting to postgres: {err}")))?;
        info!("connected to raw job store");
        Ok(Self { pool })
    }

    /// Create tables, the `(source, url)` uniqueness constraint and the FIFO index.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS raw_jobs (
                id UUID PRIMARY KEY,
                source TEXT NOT NULL,
                job_id TEXT NOT NULL,
                title TEXT NOT NULL,
                company TEXT NOT NULL,
                description TEXT NOT NULL,
                location TEXT NOT NULL,
                url TEXT NOT NULL,
                salary_range TEXT,
                salary JSONB NOT NULL DEFAULT '{}'::jsonb,
                requirements JSONB NOT NULL DEFAULT '[]'::jsonb,
                job_type TEXT,
                experience_level TEXT,
                raw_data JSONB NOT NULL DEFAULT '{}'::jsonb,
                processed BOOLEAN NOT NULL DEFAULT FALSE,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                poisoned BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                CONSTRAINT raw_jobs_source_url_key UNIQUE (source, url)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_raw_jobs_processed_created ON raw_jobs (processed, created_at)",
            r#"
            CREATE TABLE IF NOT EXISTS job_tracking (
                id UUID PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                company TEXT NOT NULL,
                source TEXT NOT NULL,
                source_url TEXT NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|err| map_sqlx("ensuring schema", err))?;
        }
        debug!("raw job schema ensured");
        Ok(())
    }
}

fn map_sqlx(context: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(format!("{context}: {err}")),
        other => StoreError::Query {
            context,
            message: other.to_string(),
        },
    }
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn row_to_raw(row: &PgRow) -> Result<RawJobRecord, StoreError> {
    let corrupt = |err: sqlx::Error| StoreError::Corrupt(err.to_string());
    let source: String = row.try_get("source").map_err(corrupt)?;
    let source = source
        .parse::<JobSource>()
        .map_err(|err| StoreError::Corrupt(err.to_string()))?;
    let salary: Json<SalaryInput> = row.try_get("salary").map_err(corrupt)?;
    let requirements: Json<Vec<String>> = row.try_get("requirements").map_err(corrupt)?;
    let raw_data: Json<RawData> = row.try_get("raw_data").map_err(corrupt)?;
    let attempts: i32 = row.try_get("attempts").map_err(corrupt)?;

    Ok(RawJobRecord {
        id: row.try_get("id").map_err(corrupt)?,
        source,
        job_id: row.try_get("job_id").map_err(corrupt)?,
        title: row.try_get("title").map_err(corrupt)?,
        company: row.try_get("company").map_err(corrupt)?,
        description: row.try_get("description").map_err(corrupt)?,
        location: row.try_get("location").map_err(corrupt)?,
        url: row.try_get("url").map_err(corrupt)?,
        salary_range: row.try_get("salary_range").map_err(corrupt)?,
        salary: salary.0,
        requirements: requirements.0,
        job_type: row.try_get("job_type").map_err(corrupt)?,
        experience_level: row.try_get("experience_level").map_err(corrupt)?,
        raw_data: raw_data.0,
        processed: row.try_get("processed").map_err(corrupt)?,
        attempts: u32::try_from(attempts).unwrap_or(0),
        last_error: row.try_get("last_error").map_err(corrupt)?,
        poisoned: row.try_get("poisoned").map_err(corrupt)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        updated_at: row.try_get("updated_at").map_err(corrupt)?,
    })
}

fn row_to_tracking(row: &PgRow) -> Result<TrackingRecord, StoreError> {
    let corrupt = |err: sqlx::Error| StoreError::Corrupt(err.to_string());
    let source: String = row.try_get("source").map_err(corrupt)?;
    Ok(TrackingRecord {
        id: row.try_get("id").map_err(corrupt)?,
        title: row.try_get("title").map_err(corrupt)?,
        description: row.try_get("description").map_err(corrupt)?,
        company: row.try_get("company").map_err(corrupt)?,
        source: source
            .parse::<JobSource>()
            .map_err(|err| StoreError::Corrupt(err.to_string()))?,
        source_url: row.try_get("source_url").map_err(corrupt)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        updated_at: row.try_get("updated_at").map_err(corrupt)?,
    })
}

#[async_trait]
impl RawJobStore for PostgresStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Unavailable(format!("ping failed: {err}")))?;
        Ok(())
    }

    async fn save(&self, posting: JobPosting) -> Result<Uuid, StoreError> {
        let now: DateTime<Utc> = Utc::now();
        let id = raw_job_uuid(posting.source, &posting.url);
        // Concurrent writers of the same key race on the unique constraint, not in the app.
        let row = sqlx::query(
            r#"
            INSERT INTO raw_jobs (
                id, source, job_id, title, company, description, location, url,
                salary_range, salary, requirements, job_type, experience_level, raw_data,
                processed, attempts, poisoned, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, FALSE, 0, FALSE, $15, $15)
            ON CONFLICT (source, url) DO UPDATE SET
                job_id = EXCLUDED.job_id,
                title = EXCLUDED.title,
                company = EXCLUDED.company,
                description = EXCLUDED.description,
                location = EXCLUDED.location,
                salary_range = EXCLUDED.salary_range,
                salary = EXCLUDED.salary,
                requirements = EXCLUDED.requirements,
                job_type = EXCLUDED.job_type,
                experience_level = EXCLUDED.experience_level,
                raw_data = EXCLUDED.raw_data,
                updated_at = GREATEST(EXCLUDED.updated_at, raw_jobs.updated_at + INTERVAL '1 microsecond')
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(posting.source.as_str())
        .bind(&posting.job_id)
        .bind(&posting.title)
        .bind(&posting.company)
        .bind(&posting.description)
        .bind(&posting.location)
        .bind(&posting.url)
        .bind(&posting.salary_range)
        .bind(Json(&posting.salary))
        .bind(Json(&posting.requirements))
        .bind(&posting.job_type)
        .bind(&posting.experience_level)
        .bind(Json(&posting.raw_data))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| map_sqlx("upserting raw job", err))?;

        row.try_get("id")
            .map_err(|err| StoreError::Corrupt(err.to_string()))
    }

    async fn get_unprocessed(&self, limit: usize) -> Result<Vec<RawJobRecord>, StoreError> {
        let sql = format!(
            "SELECT {RAW_COLUMNS} FROM raw_jobs \
             WHERE processed = FALSE AND poisoned = FALSE \
             ORDER BY created_at ASC, id ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(clamp_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|err| map_sqlx("loading unprocessed raw jobs", err))?;
        rows.iter().map(row_to_raw).collect()
    }

    async fn mark_processed(&self, id: Uuid) -> Result<MarkOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE raw_jobs
               SET processed = TRUE,
                   updated_at = GREATEST(NOW(), updated_at + INTERVAL '1 microsecond')
             WHERE id = $1
               AND processed = FALSE
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| map_sqlx("marking raw job processed", err))?;

        if result.rows_affected() > 0 {
            return Ok(MarkOutcome::Marked);
        }

        let exists = sqlx::query("SELECT processed FROM raw_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| map_sqlx("checking raw job", err))?;
        match exists {
            Some(_) => Ok(MarkOutcome::AlreadyProcessed),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn get_by_source(
        &self,
        source: JobSource,
        processed: Option<bool>,
        limit: usize,
    ) -> Result<Vec<RawJobRecord>, StoreError> {
        let sql = format!(
            "SELECT {RAW_COLUMNS} FROM raw_jobs \
             WHERE source = $1 AND ($2::BOOLEAN IS NULL OR processed = $2) \
             ORDER BY created_at ASC, id ASC LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(source.as_str())
            .bind(processed)
            .bind(clamp_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|err| map_sqlx("loading raw jobs by source", err))?;
        rows.iter().map(row_to_raw).collect()
    }

    async fn record_failure(
        &self,
        id: Uuid,
        reason: &str,
        max_attempts: u32,
    ) -> Result<FailureState, StoreError> {
        let max_attempts = i32::try_from(max_attempts).unwrap_or(i32::MAX);
        let row = sqlx::query(
            r#"
            UPDATE raw_jobs
               SET attempts = attempts + 1,
                   last_error = $2,
                   poisoned = (attempts + 1) >= $3,
                   updated_at = GREATEST(NOW(), updated_at + INTERVAL '1 microsecond')
             WHERE id = $1
               AND processed = FALSE
            RETURNING attempts, poisoned
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| map_sqlx("recording raw job failure", err))?;

        let row = match row {
            Some(row) => row,
            None => sqlx::query("SELECT attempts, poisoned FROM raw_jobs WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|err| map_sqlx("checking raw job", err))?
                .ok_or(StoreError::NotFound(id))?,
        };

        let attempts: i32 = row
            .try_get("attempts")
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        Ok(FailureState {
            attempts: u32::try_from(attempts).unwrap_or(0),
            poisoned: row
                .try_get("poisoned")
                .map_err(|err| StoreError::Corrupt(err.to_string()))?,
        })
    }

    async fn get_poisoned(&self, limit: usize) -> Result<Vec<RawJobRecord>, StoreError> {
        let sql = format!(
            "SELECT {RAW_COLUMNS} FROM raw_jobs \
             WHERE poisoned = TRUE AND processed = FALSE \
             ORDER BY created_at ASC, id ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(clamp_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|err| map_sqlx("loading poisoned raw jobs", err))?;
        rows.iter().map(row_to_raw).collect()
    }

    async fn requeue(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE raw_jobs
               SET attempts = 0,
                   last_error = NULL,
                   poisoned = FALSE,
                   updated_at = GREATEST(NOW(), updated_at + INTERVAL '1 microsecond')
             WHERE id = $1
               AND processed = FALSE
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| map_sqlx("requeueing raw job", err))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT processed FROM raw_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| map_sqlx("checking raw job", err))?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(id)),
        }
    }
}

#[async_trait]
impl TrackingStore for PostgresStore {
    async fn find_by_source_url(
        &self,
        source_url: &str,
    ) -> Result<Option<TrackingRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, title, description, company, source, source_url, created_at, updated_at
              FROM job_tracking
             WHERE source_url = $1
            "#,
        )
        .bind(source_url)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| map_sqlx("loading tracking record", err))?;
        row.as_ref().map(row_to_tracking).transpose()
    }

    async fn upsert(&self, record: &TrackingRecord) -> Result<TrackingRecord, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO job_tracking (
                id, title, description, company, source, source_url, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (source_url) DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                company = EXCLUDED.company,
                source = EXCLUDED.source,
                updated_at = GREATEST(EXCLUDED.updated_at, job_tracking.updated_at + INTERVAL '1 microsecond')
            RETURNING id, title, description, company, source, source_url, created_at, updated_at
            "#,
        )
        .bind(record.id)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.company)
        .bind(record.source.as_str())
        .bind(&record.source_url)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| map_sqlx("upserting tracking record", err))?;
        row_to_tracking(&row)
    }
}
