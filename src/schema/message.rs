use crate::schema::job::ObjectRef;
use serde::{Deserialize, Serialize};

/// Published by the submission handler once the PENDING record exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: String,
    pub user_id: String,
    pub email: String,
    pub input: ObjectRef,
    pub url: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub job_id: String,
    pub user_id: String,
    pub email: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveAction {
    Archive,
    Restore,
}

impl ArchiveAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveAction::Archive => "archive",
            ArchiveAction::Restore => "restore",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArchiveControl {
    User(UserArchiveControl),
    Job(JobArchiveControl),
}

/// Archive or restore every eligible job a user owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserArchiveControl {
    pub user_id: String,
    pub action: ArchiveAction,
    pub url: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobArchiveControl {
    pub job_id: String,
    pub user_id: String,
    pub result: ObjectRef,
    pub action: ArchiveAction,
    pub complete_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_id: Option<String>,
    #[serde(default)]
    pub initiated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A job-scoped restore whose vault retrieval has been started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub retrieval_id: String,
    #[serde(flatten)]
    pub control: JobArchiveControl,
}
