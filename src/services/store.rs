use crate::schema::{JobRecord, JobRow, JobStatus, ObjectRef};
use sqlx::PgPool;

/// Outcome of a conditional status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The precondition did not hold; `current` is `None` when no record exists.
    Skipped { current: Option<JobStatus> },
}

/// Fields written together with a status change.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub result: Option<ObjectRef>,
    pub log: Option<ObjectRef>,
    pub complete_time: Option<i64>,
}

impl StatusUpdate {
    pub fn running() -> Self {
        Self {
            status: JobStatus::Running,
            result: None,
            log: None,
            complete_time: None,
        }
    }

    pub fn finished(
        status: JobStatus,
        result: Option<ObjectRef>,
        log: Option<ObjectRef>,
        complete_time: i64,
    ) -> Self {
        Self {
            status,
            result,
            log,
            complete_time: Some(complete_time),
        }
    }
}

#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, job_id: &str) -> anyhow::Result<Option<JobRecord>>;
    async fn put(&self, record: &JobRecord) -> anyhow::Result<()>;
    /// Applies `update` only while the record is still in `expected`.
    async fn transition(
        &self,
        job_id: &str,
        expected: JobStatus,
        update: &StatusUpdate,
    ) -> anyhow::Result<Transition>;
    /// Sets `archived` with its handle. False when the job was already archived
    /// or is not COMPLETED.
    async fn mark_archived(&self, job_id: &str, archive_id: &str) -> anyhow::Result<bool>;
    async fn mark_retrieval(&self, job_id: &str, retrieval_id: &str) -> anyhow::Result<bool>;
    /// Clears `archived`, the archive handle and any retrieval handle.
    async fn clear_archive(&self, job_id: &str) -> anyhow::Result<bool>;
    async fn list_for_user(&self, user_id: &str) -> anyhow::Result<Vec<JobRecord>>;
}

pub async fn claim(store: &dyn JobStore, job_id: &str) -> anyhow::Result<Transition> {
    store
        .transition(job_id, JobStatus::Pending, &StatusUpdate::running())
        .await
}

fn ensure_forward(expected: JobStatus, update: &StatusUpdate) -> anyhow::Result<()> {
    if expected.can_advance_to(update.status) {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "illegal status transition {expected} -> {}",
            update.status
        ))
    }
}

pub(crate) const JOB_COLUMNS: &str = r#"
    job_id, user_id, email, input_file_name, input_bucket, input_key,
    result_bucket, result_key, log_bucket, log_key, status,
    submit_time, complete_time, archived, archive_id, retrieval_id
"#;

pub struct PgJobStore {
    db: PgPool,
}

impl PgJobStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn current_status(&self, job_id: &str) -> anyhow::Result<Option<JobStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE job_id = $1")
                .bind(job_id)
                .fetch_optional(&self.db)
                .await?;
        status.map(|s| s.parse()).transpose()
    }
}

#[async_trait::async_trait]
impl JobStore for PgJobStore {
    async fn get(&self, job_id: &str) -> anyhow::Result<Option<JobRecord>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
                .bind(job_id)
                .fetch_optional(&self.db)
                .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn put(&self, record: &JobRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (job_id, user_id, email, input_file_name, input_bucket, input_key,
                              result_bucket, result_key, log_bucket, log_key, status,
                              submit_time, complete_time, archived, archive_id, retrieval_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (job_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                email = EXCLUDED.email,
                input_file_name = EXCLUDED.input_file_name,
                input_bucket = EXCLUDED.input_bucket,
                input_key = EXCLUDED.input_key,
                result_bucket = EXCLUDED.result_bucket,
                result_key = EXCLUDED.result_key,
                log_bucket = EXCLUDED.log_bucket,
                log_key = EXCLUDED.log_key,
                status = EXCLUDED.status,
                submit_time = EXCLUDED.submit_time,
                complete_time = EXCLUDED.complete_time,
                archived = EXCLUDED.archived,
                archive_id = EXCLUDED.archive_id,
                retrieval_id = EXCLUDED.retrieval_id,
                updated_at = now()
            "#,
        )
        .bind(&record.job_id)
        .bind(&record.user_id)
        .bind(&record.email)
        .bind(&record.input_file_name)
        .bind(&record.input.bucket)
        .bind(&record.input.key)
        .bind(record.result.as_ref().map(|r| r.bucket.as_str()))
        .bind(record.result.as_ref().map(|r| r.key.as_str()))
        .bind(record.log.as_ref().map(|l| l.bucket.as_str()))
        .bind(record.log.as_ref().map(|l| l.key.as_str()))
        .bind(record.status.as_str())
        .bind(record.submit_time)
        .bind(record.complete_time)
        .bind(record.archived)
        .bind(record.archive_id.as_deref())
        .bind(record.retrieval_id.as_deref())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn transition(
        &self,
        job_id: &str,
        expected: JobStatus,
        update: &StatusUpdate,
    ) -> anyhow::Result<Transition> {
        ensure_forward(expected, update)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = $3,
                result_bucket = COALESCE($4, result_bucket),
                result_key = COALESCE($5, result_key),
                log_bucket = COALESCE($6, log_bucket),
                log_key = COALESCE($7, log_key),
                complete_time = COALESCE($8, complete_time),
                updated_at = now()
            WHERE job_id = $1 AND status = $2
            "#,
        )
        .bind(job_id)
        .bind(expected.as_str())
        .bind(update.status.as_str())
        .bind(update.result.as_ref().map(|r| r.bucket.as_str()))
        .bind(update.result.as_ref().map(|r| r.key.as_str()))
        .bind(update.log.as_ref().map(|l| l.bucket.as_str()))
        .bind(update.log.as_ref().map(|l| l.key.as_str()))
        .bind(update.complete_time)
        .execute(&self.db)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(Transition::Applied);
        }
        Ok(Transition::Skipped {
            current: self.current_status(job_id).await?,
        })
    }

    async fn mark_archived(&self, job_id: &str, archive_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET archived = true, archive_id = $2, retrieval_id = NULL, updated_at = now()
            WHERE job_id = $1 AND status = 'COMPLETED' AND archived = false
            "#,
        )
        .bind(job_id)
        .bind(archive_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_retrieval(&self, job_id: &str, retrieval_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET retrieval_id = $2, updated_at = now()
            WHERE job_id = $1 AND archived = true
            "#,
        )
        .bind(job_id)
        .bind(retrieval_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_archive(&self, job_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET archived = false, archive_id = NULL, retrieval_id = NULL, updated_at = now()
            WHERE job_id = $1 AND archived = true
            "#,
        )
        .bind(job_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_for_user(&self, user_id: &str) -> anyhow::Result<Vec<JobRecord>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE user_id = $1 ORDER BY submit_time DESC, job_id"
        ))
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(JobRecord::try_from).collect()
    }
}
