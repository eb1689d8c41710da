use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Whether `next` is the single legal step forward from `self`.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(anyhow::anyhow!("unknown job status `{other}`")),
        }
    }
}

/// A bucket + key pair in the hot object store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub user_id: String,
    pub email: String,
    pub input_file_name: String,
    pub input: ObjectRef,
    pub result: Option<ObjectRef>,
    pub log: Option<ObjectRef>,
    pub status: JobStatus,
    pub submit_time: i64,
    pub complete_time: Option<i64>,
    pub archived: bool,
    pub archive_id: Option<String>,
    // set while a vault retrieval is in flight
    pub retrieval_id: Option<String>,
}

impl JobRecord {
    pub fn pending(
        job_id: impl Into<String>,
        user_id: impl Into<String>,
        email: impl Into<String>,
        input: ObjectRef,
        submit_time: i64,
    ) -> Self {
        let input_file_name = input
            .key
            .rsplit('/')
            .next()
            .and_then(|name| name.split_once('~').map(|(_, file)| file))
            .unwrap_or_default()
            .to_string();
        Self {
            job_id: job_id.into(),
            user_id: user_id.into(),
            email: email.into(),
            input_file_name,
            input,
            result: None,
            log: None,
            status: JobStatus::Pending,
            submit_time,
            complete_time: None,
            archived: false,
            archive_id: None,
            retrieval_id: None,
        }
    }

    pub fn is_restore_pending(&self) -> bool {
        self.archived && self.retrieval_id.is_some()
    }
}

/// Flat row shape of the `jobs` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub job_id: String,
    pub user_id: String,
    pub email: String,
    pub input_file_name: String,
    pub input_bucket: String,
    pub input_key: String,
    pub result_bucket: Option<String>,
    pub result_key: Option<String>,
    pub log_bucket: Option<String>,
    pub log_key: Option<String>,
    pub status: String,
    pub submit_time: i64,
    pub complete_time: Option<i64>,
    pub archived: bool,
    pub archive_id: Option<String>,
    pub retrieval_id: Option<String>,
}

fn object_ref(bucket: Option<String>, key: Option<String>) -> Option<ObjectRef> {
    match (bucket, key) {
        (Some(bucket), Some(key)) => Some(ObjectRef { bucket, key }),
        _ => None,
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            status: row.status.parse()?,
            job_id: row.job_id,
            user_id: row.user_id,
            email: row.email,
            input_file_name: row.input_file_name,
            input: ObjectRef::new(row.input_bucket, row.input_key),
            result: object_ref(row.result_bucket, row.result_key),
            log: object_ref(row.log_bucket, row.log_key),
            submit_time: row.submit_time,
            complete_time: row.complete_time,
            archived: row.archived,
            archive_id: row.archive_id,
            retrieval_id: row.retrieval_id,
        })
    }
}
