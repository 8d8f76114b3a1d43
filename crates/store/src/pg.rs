//! PostgreSQL row store for the `jobs` table.
//!
//! Rows are decoded into [`Job`] here and nowhere else. Statuses and actions
//! are stored as their snake_case names; the table's CHECK constraints keep
//! them inside the closed sets.

use async_trait::async_trait;
use genq_core::job::{Job, JobAction, JobPatch, JobStatus, NewJobRecord};
use genq_core::types::{JobId, OwnerId, Timestamp};
use sqlx::{FromRow, Postgres, QueryBuilder};

use crate::store::{JobRowStore, StoreError, UpdateOutcome};
use crate::DbPool;

/// Column list for `jobs` queries.
pub const COLUMNS: &str = "\
    id, owner_id, prompt, action, context, status, progress, status_message, \
    result, error_message, attempts, max_attempts, \
    created_at, started_at, completed_at, \
    model_id, tokens_used, duration_ms";

/// Notification channel the `jobs` trigger publishes on.
pub const CHANGE_CHANNEL: &str = "job_changes";

/// A raw row from the `jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: String,
    pub owner_id: String,
    pub prompt: String,
    pub action: String,
    pub context: serde_json::Value,
    pub status: String,
    pub progress: i16,
    pub status_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub model_id: Option<String>,
    pub tokens_used: Option<i64>,
    pub duration_ms: Option<i64>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::Decode(format!("job {}: {e}", row.id)))?;
        let action = row
            .action
            .parse::<JobAction>()
            .map_err(|e| StoreError::Decode(format!("job {}: {e}", row.id)))?;
        let progress = u8::try_from(row.progress)
            .map_err(|_| StoreError::Decode(format!("job {}: progress {}", row.id, row.progress)))?;

        Ok(Job {
            id: JobId::new(row.id),
            owner_id: OwnerId::new(row.owner_id),
            prompt: row.prompt,
            action,
            context: row.context,
            status,
            progress,
            status_message: row.status_message,
            result: row.result,
            error_message: row.error_message,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            model_id: row.model_id,
            tokens_used: row.tokens_used,
            duration_ms: row.duration_ms,
        })
    }
}

/// [`JobRowStore`] backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

/// Append `SET` assignments for every field present in `patch`.
fn push_patch(qb: &mut QueryBuilder<'_, Postgres>, patch: &JobPatch) {
    if let Some(status) = patch.status {
        qb.push(", status = ").push_bind(status.as_str());
    }
    if let Some(progress) = patch.progress {
        qb.push(", progress = ").push_bind(i16::from(progress));
    }
    if let Some(message) = &patch.status_message {
        qb.push(", status_message = ").push_bind(message.clone());
    }
    if let Some(result) = &patch.result {
        qb.push(", result = ").push_bind(result.clone());
    }
    if let Some(error) = &patch.error_message {
        qb.push(", error_message = ").push_bind(error.clone());
    }
    if let Some(attempts) = patch.attempts {
        qb.push(", attempts = ").push_bind(attempts);
    }
    if let Some(at) = patch.started_at {
        qb.push(", started_at = ").push_bind(at);
    }
    if let Some(at) = patch.completed_at {
        qb.push(", completed_at = ").push_bind(at);
    }
    if let Some(model) = &patch.model_id {
        qb.push(", model_id = ").push_bind(model.clone());
    }
    if let Some(tokens) = patch.tokens_used {
        qb.push(", tokens_used = ").push_bind(tokens);
    }
    if let Some(duration) = patch.duration_ms {
        qb.push(", duration_ms = ").push_bind(duration);
    }
}

/// Time-ordered id, so ids sort by creation.
fn new_job_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

#[async_trait]
impl JobRowStore for PgJobStore {
    async fn insert(&self, record: &NewJobRecord) -> Result<JobId, StoreError> {
        let id = new_job_id();
        let inserted: (String,) = sqlx::query_as(
            "INSERT INTO jobs (id, owner_id, prompt, action, context, status, max_attempts) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING id",
        )
        .bind(&id)
        .bind(record.owner_id.as_str())
        .bind(&record.prompt)
        .bind(record.action.as_str())
        .bind(&record.context)
        .bind(JobStatus::Queued.as_str())
        .bind(record.max_attempts)
        .fetch_one(&self.pool)
        .await?;
        Ok(JobId::new(inserted.0))
    }

    async fn get_by_id(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn conditional_update(
        &self,
        id: &JobId,
        patch: &JobPatch,
        expected: JobStatus,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE jobs SET updated_at = NOW()");
        push_patch(&mut qb, patch);
        qb.push(" WHERE id = ")
            .push_bind(id.as_str())
            .push(" AND status = ")
            .push_bind(expected.as_str());

        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() > 0 {
            Ok(UpdateOutcome::Updated)
        } else {
            Ok(UpdateOutcome::NoMatch)
        }
    }

    async fn count_where(&self, owner: &OwnerId, statuses: &[JobStatus]) -> Result<i64, StoreError> {
        let statuses: Vec<&'static str> = statuses.iter().map(|s| s.as_str()).collect();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE owner_id = $1 AND status = ANY($2)",
        )
        .bind(owner.as_str())
        .bind(statuses)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
