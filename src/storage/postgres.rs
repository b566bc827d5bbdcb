//! PostgreSQL request store.
//!
//! Compare-and-update runs in a transaction that locks the row with `SELECT ... FOR UPDATE`,
//! validates the update in Rust, and writes the result back. The batch claim is a single
//! `UPDATE` over a `FOR UPDATE SKIP LOCKED` selection, so concurrent claimers never see the
//! same rows. Insertion timestamps come from the database clock; `seq` breaks ties.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use super::{RequestStore, ScanFilter};
use crate::domain::batch::{BatchJobId, BatchJobOutcome, BatchJobRecord};
use crate::domain::request::{
    AttemptRecord, ChatMessage, ContentHash, NewRow, RequestContent, RequestRow, RequestStatus,
    RowId, RowUpdate, Tags,
};
use crate::error::{BarrageError, Result};

const REQUEST_COLUMNS: &str = "r.id, r.content_hash, r.model, r.history, r.query, \
    r.generation_params, r.duplication_index, r.tags, r.cause, r.status, r.failure_count, \
    r.attempts_cap, r.attempts_metadata, r.response, r.current_batch, r.request_timestamp, \
    r.access_timestamps, r.insertion_timestamp, r.allow_failure, r.notes";

/// Row `r` is the newest version of its lineage.
const IS_HEAD: &str = "NOT EXISTS (SELECT 1 FROM barrage_requests n \
    WHERE n.content_hash = r.content_hash AND n.tags = r.tags \
    AND (n.insertion_timestamp, n.seq) > (r.insertion_timestamp, r.seq))";

const JOB_COLUMNS: &str =
    "batch_id, job_id, tag, row_count, region, submitted_at, deadline, closed_at, outcome";

/// PostgreSQL implementation of [`RequestStore`].
///
/// # Example
/// ```ignore
/// let pool = PgPool::connect("postgresql://localhost/barrage").await?;
/// barrage::migrator().run(&pool).await?;
/// let store = Arc::new(PostgresRequestStore::new(pool));
/// ```
#[derive(Clone)]
pub struct PostgresRequestStore {
    pool: PgPool,
}

impl PostgresRequestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_row(tx: &mut Transaction<'_, Postgres>, id: RowId) -> Result<RequestRow> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM barrage_requests r WHERE r.id = $1 FOR UPDATE"
        ))
        .bind(*id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(BarrageError::RequestNotFound(id))?;
        decode_row(&row)
    }

    async fn insert_in(tx: &mut Transaction<'_, Postgres>, row: NewRow) -> Result<RequestRow> {
        let inserted = sqlx::query(&format!(
            r#"
            WITH clock AS (SELECT clock_timestamp() AS now)
            INSERT INTO barrage_requests AS r (
                content_hash, model, history, query, generation_params, duplication_index,
                tags, cause, status, failure_count, attempts_cap, attempts_metadata,
                request_timestamp, access_timestamps, insertion_timestamp, allow_failure, notes
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                   ARRAY[clock.now], clock.now, $14, $15
            FROM clock
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(row.content_hash.as_str())
        .bind(&row.content.model)
        .bind(Json(&row.content.history))
        .bind(&row.content.query)
        .bind(&row.content.generation_params)
        .bind(to_i32(row.content.duplication_index)?)
        .bind(row.tags.to_vec())
        .bind(row.cause.as_str())
        .bind(row.status.as_str())
        .bind(to_i32(row.failure_count)?)
        .bind(to_i32(row.attempts_cap)?)
        .bind(Json(&row.attempts_metadata))
        .bind(row.request_timestamp)
        .bind(row.allow_failure)
        .bind(&row.notes)
        .fetch_one(&mut **tx)
        .await?;
        decode_row(&inserted)
    }
}

fn to_i32(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| {
        BarrageError::ValidationError(format!("{} does not fit in a database integer", value))
    })
}

fn to_u32(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| BarrageError::Other(anyhow!("negative {} in database: {}", column, value)))
}

fn decode_row(row: &PgRow) -> Result<RequestRow> {
    let status: String = row.try_get("status")?;
    let cause: String = row.try_get("cause")?;
    let history: Json<Vec<ChatMessage>> = row.try_get("history")?;
    let attempts: Json<Vec<AttemptRecord>> = row.try_get("attempts_metadata")?;
    let tags: Vec<String> = row.try_get("tags")?;
    let current_batch: Option<Uuid> = row.try_get("current_batch")?;

    Ok(RequestRow {
        id: RowId(row.try_get("id")?),
        content_hash: ContentHash(row.try_get("content_hash")?),
        content: RequestContent {
            model: row.try_get("model")?,
            history: history.0,
            query: row.try_get("query")?,
            generation_params: row.try_get("generation_params")?,
            duplication_index: to_u32(row.try_get("duplication_index")?, "duplication_index")?,
        },
        tags: Tags::new(tags),
        cause: cause.parse().map_err(|e: String| BarrageError::Other(anyhow!(e)))?,
        status: status.parse().map_err(|e: String| BarrageError::Other(anyhow!(e)))?,
        failure_count: to_u32(row.try_get("failure_count")?, "failure_count")?,
        attempts_cap: to_u32(row.try_get("attempts_cap")?, "attempts_cap")?,
        attempts_metadata: attempts.0,
        response: row.try_get("response")?,
        current_batch: current_batch.map(BatchJobId),
        request_timestamp: row.try_get("request_timestamp")?,
        access_timestamps: row.try_get::<Vec<DateTime<Utc>>, _>("access_timestamps")?,
        insertion_timestamp: row.try_get("insertion_timestamp")?,
        allow_failure: row.try_get("allow_failure")?,
        notes: row.try_get("notes")?,
    })
}

fn decode_job(row: &PgRow) -> Result<BatchJobRecord> {
    let outcome: Option<String> = row.try_get("outcome")?;
    let row_count: i32 = row.try_get("row_count")?;
    Ok(BatchJobRecord {
        batch_id: BatchJobId(row.try_get("batch_id")?),
        job_id: row.try_get("job_id")?,
        tag: row.try_get("tag")?,
        row_count: to_u32(row_count, "row_count")? as usize,
        region: row.try_get("region")?,
        submitted_at: row.try_get("submitted_at")?,
        deadline: row.try_get("deadline")?,
        closed_at: row.try_get("closed_at")?,
        outcome: outcome
            .map(|o| o.parse().map_err(|e: String| BarrageError::Other(anyhow!(e))))
            .transpose()?,
    })
}

#[async_trait]
impl RequestStore for PostgresRequestStore {
    async fn insert(&self, row: NewRow) -> Result<RequestRow> {
        row.validate()?;
        let mut tx = self.pool.begin().await?;
        let inserted = Self::insert_in(&mut tx, row).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn insert_version(&self, previous: RowId, row: NewRow) -> Result<Option<RequestRow>> {
        row.validate()?;
        let mut tx = self.pool.begin().await?;

        // Lock first; the head check must run in a later statement so that it sees versions
        // committed by whoever held the lock before us.
        Self::lock_row(&mut tx, previous).await?;
        let is_head: bool = sqlx::query_scalar(&format!(
            "SELECT {IS_HEAD} FROM barrage_requests r WHERE r.id = $1"
        ))
        .bind(*previous)
        .fetch_one(&mut *tx)
        .await?;

        if !is_head {
            return Ok(None);
        }

        let inserted = Self::insert_in(&mut tx, row).await?;
        tx.commit().await?;
        Ok(Some(inserted))
    }

    async fn insert_first_version(&self, row: NewRow) -> Result<Option<RequestRow>> {
        row.validate()?;
        let tags = row.tags.to_vec();
        let mut tx = self.pool.begin().await?;

        // Serialize first insertions per lineage; the lock is released on commit or rollback.
        sqlx::query(
            r#"
            SELECT pg_advisory_xact_lock(
                hashtextextended($1 || '|' || array_to_string($2::text[], ','), 0)
            )
            "#,
        )
        .bind(row.content_hash.as_str())
        .bind(&tags)
        .execute(&mut *tx)
        .await?;
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM barrage_requests WHERE content_hash = $1 AND tags = $2)",
        )
        .bind(row.content_hash.as_str())
        .bind(&tags)
        .fetch_one(&mut *tx)
        .await?;

        if exists {
            return Ok(None);
        }

        let inserted = Self::insert_in(&mut tx, row).await?;
        tx.commit().await?;
        Ok(Some(inserted))
    }

    async fn get(&self, id: RowId) -> Result<RequestRow> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM barrage_requests r WHERE r.id = $1"
        ))
        .bind(*id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(BarrageError::RequestNotFound(id))?;
        decode_row(&row)
    }

    async fn find_latest_by_hash(
        &self,
        hash: &ContentHash,
        tags: Option<&Tags>,
    ) -> Result<Option<RequestRow>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM barrage_requests r
            WHERE r.content_hash = $1 AND ($2::text[] IS NULL OR r.tags = $2)
            ORDER BY r.insertion_timestamp DESC, r.seq DESC
            LIMIT 1
            "#
        ))
        .bind(hash.as_str())
        .bind(tags.map(Tags::to_vec))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<RequestRow>> {
        let statuses: Vec<&str> = filter.statuses.iter().map(RequestStatus::as_str).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM barrage_requests r
            WHERE (cardinality($1::text[]) = 0 OR r.status = ANY($1))
              AND ($2::text IS NULL OR $2 = ANY(r.tags))
              AND ($3::uuid IS NULL OR r.current_batch = $3)
              AND {IS_HEAD}
            ORDER BY r.insertion_timestamp, r.seq
            LIMIT $4
            "#
        ))
        .bind(statuses)
        .bind(filter.tag.as_deref())
        .bind(filter.batch.map(|b| b.0))
        .bind(filter.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn compare_and_update(
        &self,
        id: RowId,
        expected: RequestStatus,
        update: RowUpdate,
    ) -> Result<RequestRow> {
        let mut tx = self.pool.begin().await?;
        let current = Self::lock_row(&mut tx, id).await?;
        if current.status != expected {
            return Err(BarrageError::StoreConflict {
                id,
                expected,
                actual: current.status,
            });
        }

        let next = update.apply(&current, Utc::now())?;
        sqlx::query(
            r#"
            UPDATE barrage_requests
            SET status = $2, failure_count = $3, attempts_metadata = $4, response = $5,
                current_batch = $6, access_timestamps = $7, notes = $8
            WHERE id = $1
            "#,
        )
        .bind(*id)
        .bind(next.status.as_str())
        .bind(to_i32(next.failure_count)?)
        .bind(Json(&next.attempts_metadata))
        .bind(&next.response)
        .bind(next.current_batch.map(|b| b.0))
        .bind(&next.access_timestamps)
        .bind(&next.notes)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(next)
    }

    async fn touch(&self, id: RowId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE barrage_requests SET access_timestamps = array_append(access_timestamps, clock_timestamp()) WHERE id = $1",
        )
        .bind(*id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BarrageError::RequestNotFound(id));
        }
        Ok(())
    }

    async fn claim_waiting(
        &self,
        tag: &str,
        limit: usize,
        batch: BatchJobId,
    ) -> Result<Vec<RequestRow>> {
        let rows = sqlx::query(&format!(
            r#"
            WITH eligible AS (
                SELECT r.id
                FROM barrage_requests r
                WHERE r.status = 'waiting'
                  AND r.current_batch IS NULL
                  AND $1 = ANY(r.tags)
                  AND {IS_HEAD}
                ORDER BY r.insertion_timestamp, r.seq
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE barrage_requests r
            SET status = 'running',
                current_batch = $3,
                access_timestamps = array_append(r.access_timestamps, clock_timestamp())
            FROM eligible
            WHERE r.id = eligible.id
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(tag)
        .bind(limit as i64)
        .bind(*batch)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?;
        claimed.sort_by_key(|row| row.insertion_timestamp);
        Ok(claimed)
    }

    async fn record_batch_job(&self, job: &BatchJobRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO barrage_batch_jobs ({JOB_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(*job.batch_id)
        .bind(&job.job_id)
        .bind(&job.tag)
        .bind(i32::try_from(job.row_count).map_err(|_| {
            BarrageError::ValidationError(format!("batch of {} rows is too large", job.row_count))
        })?)
        .bind(&job.region)
        .bind(job.submitted_at)
        .bind(job.deadline)
        .bind(job.closed_at)
        .bind(job.outcome.map(|o| o.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_batch_job(&self, batch: BatchJobId) -> Result<Option<BatchJobRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM barrage_batch_jobs WHERE batch_id = $1"
        ))
        .bind(*batch)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_job).transpose()
    }

    async fn open_batch_jobs(&self, tag: &str) -> Result<Vec<BatchJobRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM barrage_batch_jobs WHERE tag = $1 AND closed_at IS NULL ORDER BY submitted_at"
        ))
        .bind(tag)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_job).collect()
    }

    async fn close_batch_job(&self, batch: BatchJobId, outcome: BatchJobOutcome) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE barrage_batch_jobs SET closed_at = NOW(), outcome = $2 WHERE batch_id = $1 AND closed_at IS NULL",
        )
        .bind(*batch)
        .bind(outcome.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
