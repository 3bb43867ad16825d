use super::{JobFilter, JobPatch, LockCondition, Storage};
use crate::errors::StoreError;
use crate::schema::{JobId, JobRecord, NewJob};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::migrate::MigrateError;
use tracing::instrument;

const SELECT_COLUMNS: &str = "id, handler, priority, run_at, attempts, locked_at, locked_by, \
    completed_at, failed_at, last_error, created_at";

/// Create or upgrade the `delayed_jobs` table using the embedded migrations.
pub async fn setup_database(pool: &PgPool) -> Result<(), MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Postgres-backed storage.
#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(PgPool::connect(url).await?))
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn apply_patch(&self, id: JobId, patch: &JobPatch) -> Result<bool, sqlx::Error> {
        let result = match patch {
            JobPatch::Reschedule { run_at, error } => {
                sqlx::query(
                    r"
                    UPDATE delayed_jobs
                    SET attempts = attempts + 1,
                        run_at = GREATEST(run_at, $2),
                        last_error = $3,
                        locked_at = NULL,
                        locked_by = NULL
                    WHERE id = $1
                    ",
                )
                .bind(id)
                .bind(run_at)
                .bind(error)
                .execute(&self.pool)
                .await?
            }
            JobPatch::Fail { failed_at, error } => {
                sqlx::query(
                    r"
                    UPDATE delayed_jobs
                    SET attempts = attempts + 1,
                        failed_at = $2,
                        last_error = $3,
                        locked_at = NULL,
                        locked_by = NULL
                    WHERE id = $1
                    ",
                )
                .bind(id)
                .bind(failed_at)
                .bind(error)
                .execute(&self.pool)
                .await?
            }
            JobPatch::Complete { completed_at } => {
                sqlx::query(
                    r"
                    UPDATE delayed_jobs
                    SET completed_at = $2, locked_at = NULL, locked_by = NULL
                    WHERE id = $1
                    ",
                )
                .bind(id)
                .bind(completed_at)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }
}

impl Storage for PgStorage {
    #[instrument(name = "delayed_job.pg.insert", skip_all, fields(priority = job.priority))]
    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError> {
        let id = sqlx::query_scalar::<_, JobId>(
            "INSERT INTO delayed_jobs (handler, priority, run_at) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(job.handler)
        .bind(job.priority)
        .bind(job.run_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    #[instrument(name = "delayed_job.pg.find_matching", level = "trace", skip(self, filter))]
    async fn find_matching(
        &self,
        filter: &JobFilter,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let query = format!(
            r"
            SELECT {SELECT_COLUMNS}
            FROM delayed_jobs
            WHERE run_at <= $1
              AND failed_at IS NULL
              AND completed_at IS NULL
              AND ($2::INT4 IS NULL OR priority >= $2)
              AND ($3::INT4 IS NULL OR priority < $3)
              AND (locked_at IS NULL OR locked_at < $4 OR locked_by = $5)
            ORDER BY priority ASC, run_at ASC, id ASC
            LIMIT $6
            "
        );

        let jobs = sqlx::query_as::<_, JobRecord>(&query)
            .bind(filter.ready_at)
            .bind(filter.priorities.min)
            .bind(filter.priorities.max)
            .bind(filter.stale_before)
            .bind(&filter.worker)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        Ok(jobs)
    }

    #[instrument(
        name = "delayed_job.pg.try_lock",
        level = "debug",
        skip(self, condition),
        fields(worker = %condition.worker)
    )]
    async fn try_lock(
        &self,
        id: JobId,
        condition: &LockCondition,
        locked_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE delayed_jobs
            SET locked_at = $2, locked_by = $3
            WHERE id = $1
              AND attempts = $4
              AND failed_at IS NULL
              AND completed_at IS NULL
              AND (locked_at IS NULL OR locked_at < $5 OR locked_by = $3)
            ",
        )
        .bind(id)
        .bind(locked_at)
        .bind(&condition.worker)
        .bind(condition.expected_attempts)
        .bind(condition.stale_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update(&self, id: JobId, patch: &JobPatch) -> Result<bool, StoreError> {
        Ok(self.apply_patch(id, patch).await?)
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM delayed_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(name = "delayed_job.pg.delete_all", skip_all)]
    async fn delete_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM delayed_jobs").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn release_locks(&self, worker: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE delayed_jobs SET locked_at = NULL, locked_by = NULL WHERE locked_by = $1",
        )
        .bind(worker)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let query = format!("SELECT {SELECT_COLUMNS} FROM delayed_jobs WHERE id = $1");
        let job = sqlx::query_as::<_, JobRecord>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM delayed_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}
