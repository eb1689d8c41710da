//! In-memory collaborators for handler tests.

use crate::schema::{JobRecord, JobStatus, ObjectRef};
use crate::services::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryJobStore {
    records: Mutex<HashMap<String, JobRecord>>,
    history: Mutex<Vec<(String, JobStatus)>>,
    pub unavailable: AtomicBool,
}

impl MemoryJobStore {
    pub fn insert(&self, record: JobRecord) {
        self.history
            .lock()
            .unwrap()
            .push((record.job_id.clone(), record.status));
        self.records
            .lock()
            .unwrap()
            .insert(record.job_id.clone(), record);
    }

    pub fn record(&self, job_id: &str) -> JobRecord {
        self.records.lock().unwrap()[job_id].clone()
    }

    /// Every status each job has been observed in, in write order.
    pub fn statuses(&self, job_id: &str) -> Vec<JobStatus> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, status)| *status)
            .collect()
    }

    fn check_available(&self) -> anyhow::Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("job store unreachable");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, job_id: &str) -> anyhow::Result<Option<JobRecord>> {
        self.check_available()?;
        Ok(self.records.lock().unwrap().get(job_id).cloned())
    }

    async fn put(&self, record: &JobRecord) -> anyhow::Result<()> {
        self.check_available()?;
        self.insert(record.clone());
        Ok(())
    }

    async fn transition(
        &self,
        job_id: &str,
        expected: JobStatus,
        update: &StatusUpdate,
    ) -> anyhow::Result<Transition> {
        self.check_available()?;
        anyhow::ensure!(
            expected.can_advance_to(update.status),
            "illegal status transition {expected} -> {}",
            update.status
        );
        let mut records = self.records.lock().unwrap();
        let Some(record) = records.get_mut(job_id) else {
            return Ok(Transition::Skipped { current: None });
        };
        if record.status != expected {
            return Ok(Transition::Skipped {
                current: Some(record.status),
            });
        }
        record.status = update.status;
        if update.result.is_some() {
            record.result = update.result.clone();
        }
        if update.log.is_some() {
            record.log = update.log.clone();
        }
        if update.complete_time.is_some() {
            record.complete_time = update.complete_time;
        }
        self.history
            .lock()
            .unwrap()
            .push((job_id.to_string(), update.status));
        Ok(Transition::Applied)
    }

    async fn mark_archived(&self, job_id: &str, archive_id: &str) -> anyhow::Result<bool> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap();
        match records.get_mut(job_id) {
            Some(record) if record.status == JobStatus::Completed && !record.archived => {
                record.archived = true;
                record.archive_id = Some(archive_id.to_string());
                record.retrieval_id = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_retrieval(&self, job_id: &str, retrieval_id: &str) -> anyhow::Result<bool> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap();
        match records.get_mut(job_id) {
            Some(record) if record.archived => {
                record.retrieval_id = Some(retrieval_id.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_archive(&self, job_id: &str) -> anyhow::Result<bool> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap();
        match records.get_mut(job_id) {
            Some(record) if record.archived => {
                record.archived = false;
                record.archive_id = None;
                record.retrieval_id = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_for_user(&self, user_id: &str) -> anyhow::Result<Vec<JobRecord>> {
        self.check_available()?;
        let mut records: Vec<JobRecord> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(records)
    }
}

struct StoredMessage {
    id: Uuid,
    queue: Queue,
    body: serde_json::Value,
    receive_count: i32,
    in_flight: bool,
    delay: Duration,
}

/// Queues without a clock: received messages stay hidden until deleted or
/// until `expire_visibility` is called. Delayed messages are never received.
#[derive(Default)]
pub struct MemoryBus {
    messages: Mutex<Vec<StoredMessage>>,
}

impl MemoryBus {
    pub fn push(&self, queue: Queue, body: serde_json::Value) {
        self.messages.lock().unwrap().push(StoredMessage {
            id: Uuid::new_v4(),
            queue,
            body,
            receive_count: 0,
            in_flight: false,
            delay: Duration::ZERO,
        });
    }

    /// Bodies still on `queue`, including in-flight and delayed ones.
    pub fn bodies(&self, queue: Queue) -> Vec<serde_json::Value> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.queue == queue)
            .map(|m| m.body.clone())
            .collect()
    }

    pub fn delays(&self, queue: Queue) -> Vec<Duration> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.queue == queue)
            .map(|m| m.delay)
            .collect()
    }

    pub fn expire_visibility(&self) {
        for message in self.messages.lock().unwrap().iter_mut() {
            message.in_flight = false;
        }
    }
}

#[async_trait::async_trait]
impl MessageBus for MemoryBus {
    async fn publish_delayed(
        &self,
        topic: Topic,
        body: serde_json::Value,
        delay: Duration,
    ) -> anyhow::Result<()> {
        let mut messages = self.messages.lock().unwrap();
        for queue in topic.subscribers() {
            messages.push(StoredMessage {
                id: Uuid::new_v4(),
                queue: *queue,
                body: body.clone(),
                receive_count: 0,
                in_flight: false,
                delay,
            });
        }
        Ok(())
    }

    async fn receive(
        &self,
        queue: Queue,
        max: usize,
        _wait: Duration,
    ) -> anyhow::Result<Vec<Delivery>> {
        let mut messages = self.messages.lock().unwrap();
        Ok(messages
            .iter_mut()
            .filter(|m| m.queue == queue && !m.in_flight && m.delay.is_zero())
            .take(max)
            .map(|m| {
                m.in_flight = true;
                m.receive_count += 1;
                Delivery {
                    id: m.id,
                    queue: m.queue,
                    receive_count: m.receive_count,
                    body: m.body.clone(),
                }
            })
            .collect())
    }

    async fn delete(&self, delivery: &Delivery) -> anyhow::Result<bool> {
        let mut messages = self.messages.lock().unwrap();
        let before = messages.len();
        messages.retain(|m| !(m.id == delivery.id && m.receive_count == delivery.receive_count));
        Ok(messages.len() < before)
    }
}

#[derive(Default)]
pub struct MemoryObjects {
    objects: Mutex<HashMap<ObjectRef, Vec<u8>>>,
    pub failing_deletes: AtomicBool,
}

impl MemoryObjects {
    pub fn insert(&self, object: ObjectRef, body: &[u8]) {
        self.objects.lock().unwrap().insert(object, body.to_vec());
    }

    pub fn contains(&self, object: &ObjectRef) -> bool {
        self.objects.lock().unwrap().contains_key(object)
    }

    pub fn body(&self, object: &ObjectRef) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(object).cloned()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjects {
    async fn get(&self, object: &ObjectRef) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.body(object))
    }

    async fn put(&self, object: &ObjectRef, body: Vec<u8>) -> anyhow::Result<()> {
        self.objects.lock().unwrap().insert(object.clone(), body);
        Ok(())
    }

    async fn delete(&self, object: &ObjectRef) -> anyhow::Result<()> {
        if self.failing_deletes.load(Ordering::SeqCst) {
            anyhow::bail!("object store refused delete of {object}");
        }
        self.objects.lock().unwrap().remove(object);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryVault {
    archives: Mutex<HashMap<String, Vec<u8>>>,
    retrievals: Mutex<HashMap<String, (String, bool)>>,
    pub uploads: AtomicUsize,
    pub initiated: AtomicUsize,
    pub tiers: Mutex<Vec<RetrievalTier>>,
}

impl MemoryVault {
    pub fn archive_body(&self, archive_id: &str) -> Option<Vec<u8>> {
        self.archives.lock().unwrap().get(archive_id).cloned()
    }

    pub fn seed_archive(&self, archive_id: &str, body: &[u8]) {
        self.archives
            .lock()
            .unwrap()
            .insert(archive_id.to_string(), body.to_vec());
    }

    pub fn complete_retrievals(&self) {
        for (_, ready) in self.retrievals.lock().unwrap().values_mut() {
            *ready = true;
        }
    }
}

#[async_trait::async_trait]
impl ColdStore for MemoryVault {
    async fn upload_archive(&self, _vault: &str, body: Vec<u8>) -> anyhow::Result<String> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let archive_id = format!("archive-{}", Uuid::new_v4().as_simple());
        self.archives
            .lock()
            .unwrap()
            .insert(archive_id.clone(), body);
        Ok(archive_id)
    }

    async fn initiate_retrieval(
        &self,
        _vault: &str,
        archive_id: &str,
        tier: RetrievalTier,
    ) -> anyhow::Result<String> {
        anyhow::ensure!(
            self.archives.lock().unwrap().contains_key(archive_id),
            "archive {archive_id} not found"
        );
        self.initiated.fetch_add(1, Ordering::SeqCst);
        self.tiers.lock().unwrap().push(tier);
        let retrieval_id = format!("retrieval-{}", Uuid::new_v4().as_simple());
        self.retrievals
            .lock()
            .unwrap()
            .insert(retrieval_id.clone(), (archive_id.to_string(), false));
        Ok(retrieval_id)
    }

    async fn describe_retrieval(&self, _vault: &str, retrieval_id: &str) -> anyhow::Result<bool> {
        self.retrievals
            .lock()
            .unwrap()
            .get(retrieval_id)
            .map(|(_, ready)| *ready)
            .ok_or_else(|| anyhow::anyhow!("unknown retrieval {retrieval_id}"))
    }

    async fn get_retrieval_output(
        &self,
        _vault: &str,
        retrieval_id: &str,
    ) -> anyhow::Result<Vec<u8>> {
        let archive_id = match self.retrievals.lock().unwrap().get(retrieval_id) {
            Some((archive_id, true)) => archive_id.clone(),
            _ => anyhow::bail!("retrieval {retrieval_id} not ready"),
        };
        self.archive_body(&archive_id)
            .ok_or_else(|| anyhow::anyhow!("archive {archive_id} gone"))
    }

    async fn delete_archive(&self, _vault: &str, archive_id: &str) -> anyhow::Result<()> {
        self.archives.lock().unwrap().remove(archive_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<Email>>,
    pub attempts: AtomicUsize,
    pub failing: AtomicBool,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<Email> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &Email) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("mail API returned 503");
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

/// Writes deterministic outputs next to the input, or fails on demand.
#[derive(Default)]
pub struct FakeEngine {
    pub invocations: AtomicUsize,
    pub failing: AtomicBool,
}

#[async_trait::async_trait]
impl AnalysisEngine for FakeEngine {
    async fn annotate(&self, input_path: &Path) -> anyhow::Result<EngineOutput> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("annotator crashed");
        }
        let input = tokio::fs::read(input_path).await?;
        let output = EngineOutput::expected_for(input_path);
        let mut annotated = input.clone();
        annotated.extend_from_slice(b"#annotated\n");
        tokio::fs::write(&output.result_path, annotated).await?;
        tokio::fs::write(&output.log_path, format!("{} bytes\n", input.len())).await?;
        Ok(output)
    }
}

pub struct Harness {
    pub jobs: Arc<MemoryJobStore>,
    pub bus: Arc<MemoryBus>,
    pub objects: Arc<MemoryObjects>,
    pub vault: Arc<MemoryVault>,
    pub mailer: Arc<RecordingMailer>,
    pub engine: Arc<FakeEngine>,
    pub services: Services,
    pub data_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            data_dir: data_dir.path().to_string_lossy().into_owned(),
            ..config
        };
        let jobs = Arc::new(MemoryJobStore::default());
        let bus = Arc::new(MemoryBus::default());
        let objects = Arc::new(MemoryObjects::default());
        let vault = Arc::new(MemoryVault::default());
        let mailer = Arc::new(RecordingMailer::default());
        let engine = Arc::new(FakeEngine::default());
        let services = Services {
            jobs: jobs.clone(),
            bus: bus.clone(),
            objects: objects.clone(),
            vault: vault.clone(),
            mailer: mailer.clone(),
            engine: engine.clone(),
            config: Arc::new(config),
        };
        Self {
            jobs,
            bus,
            objects,
            vault,
            mailer,
            engine,
            services,
            data_dir,
        }
    }

    pub fn data_files(&self) -> Vec<String> {
        std::fs::read_dir(self.data_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect()
    }
}

/// A COMPLETED record whose result object lives in the results bucket.
pub fn completed_job(job_id: &str, user_id: &str, complete_time: i64) -> JobRecord {
    let mut record = JobRecord::pending(
        job_id,
        user_id,
        format!("{user_id}@example.com"),
        ObjectRef::new("gas-inputs", format!("{user_id}/{job_id}~sample.vcf")),
        complete_time - 60,
    );
    record.status = JobStatus::Completed;
    record.complete_time = Some(complete_time);
    record.result = Some(ObjectRef::new(
        "gas-results",
        format!("{user_id}/{job_id}~sample.annot.vcf"),
    ));
    record.log = Some(ObjectRef::new(
        "gas-results",
        format!("{user_id}/{job_id}~sample.vcf.count.log"),
    ));
    record
}
