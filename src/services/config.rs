use crate::services::RetrievalTier;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// What a consumer does with a message it cannot process for reasons other
/// than an already-advanced job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Delete the message and lose the job. Known data-loss path.
    Drop,
    /// Leave the message for redelivery after the visibility timeout.
    Requeue,
}

impl FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(FailurePolicy::Drop),
            "requeue" => Ok(FailurePolicy::Requeue),
            other => Err(anyhow::anyhow!("unknown failure policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub results_bucket: String,
    pub key_prefix: String,
    pub vault: String,
    pub data_dir: String,
    pub object_root: String,
    pub retention_secs: i64,
    pub free_role: String,
    pub receive_batch: usize,
    pub receive_wait_secs: u64,
    pub visibility_timeout_secs: u64,
    pub failure_policy: FailurePolicy,
    pub mail_sender: String,
    pub mail_endpoint: Option<String>,
    pub mail_api_key: Option<String>,
    pub annotator_cmd: String,
    pub retrieval_delay_secs: i64,
    pub retrieval_tier: RetrievalTier,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            results_bucket: "gas-results".to_string(),
            key_prefix: String::new(),
            vault: "gas-vault".to_string(),
            data_dir: "storage/data".to_string(),
            object_root: "storage/objects".to_string(),
            retention_secs: 1800,
            free_role: "free_user".to_string(),
            receive_batch: 10,
            receive_wait_secs: 5,
            visibility_timeout_secs: 30,
            failure_policy: FailurePolicy::Drop,
            mail_sender: "noreply@gas.local".to_string(),
            mail_endpoint: None,
            mail_api_key: None,
            annotator_cmd: "anntools".to_string(),
            retrieval_delay_secs: 300,
            retrieval_tier: RetrievalTier::Expedited,
        }
    }
}

fn env_or(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn env_parse_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let failure_policy = match std::env::var("GAS_FAILURE_POLICY") {
            Ok(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "config: falling back to drop policy");
                FailurePolicy::Drop
            }),
            Err(_) => defaults.failure_policy,
        };
        let retrieval_tier = match std::env::var("GAS_RETRIEVAL_TIER") {
            Ok(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "config: falling back to expedited retrieval");
                RetrievalTier::Expedited
            }),
            Err(_) => defaults.retrieval_tier,
        };

        Self {
            results_bucket: env_or("GAS_RESULTS_BUCKET", defaults.results_bucket),
            key_prefix: env_or("GAS_KEY_PREFIX", defaults.key_prefix),
            vault: env_or("GAS_VAULT", defaults.vault),
            data_dir: env_or("GAS_DATA_DIR", defaults.data_dir),
            object_root: env_or("GAS_OBJECT_ROOT", defaults.object_root),
            retention_secs: env_parse_or("GAS_RETENTION_SECS", defaults.retention_secs),
            free_role: env_or("GAS_FREE_ROLE", defaults.free_role),
            receive_batch: env_parse_or("GAS_RECEIVE_BATCH", defaults.receive_batch).clamp(1, 10),
            receive_wait_secs: env_parse_or("GAS_RECEIVE_WAIT_SECS", defaults.receive_wait_secs)
                .min(20),
            visibility_timeout_secs: env_parse_or(
                "GAS_VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout_secs,
            ),
            failure_policy,
            mail_sender: env_or("GAS_MAIL_SENDER", defaults.mail_sender),
            mail_endpoint: std::env::var("GAS_MAIL_ENDPOINT").ok(),
            mail_api_key: std::env::var("GAS_MAIL_API_KEY").ok(),
            annotator_cmd: env_or("GAS_ANNOTATOR_CMD", defaults.annotator_cmd),
            retrieval_delay_secs: env_parse_or(
                "GAS_RETRIEVAL_DELAY_SECS",
                defaults.retrieval_delay_secs,
            ),
            retrieval_tier,
        }
    }

    pub fn receive_wait(&self) -> Duration {
        Duration::from_secs(self.receive_wait_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Local path an input object is staged to. `attempt` keeps concurrent
    /// deliveries of the same job from sharing files.
    pub fn staged_input_path(&self, job_id: &str, attempt: &str, file_name: &str) -> String {
        format!("{}/{job_id}~{attempt}~{file_name}", self.data_dir)
    }

    /// Hot-store keys for the result and log files of a job.
    pub fn output_keys(&self, user_id: &str, job_id: &str, file_name: &str) -> (String, String) {
        let stem = file_stem(file_name);
        let base = format!("{}{user_id}/{job_id}~{stem}", self.key_prefix);
        (format!("{base}.annot.vcf"), format!("{base}.vcf.count.log"))
    }
}

pub fn file_stem(file_name: &str) -> &str {
    file_name
        .split_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name)
}
