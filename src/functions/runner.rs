use crate::schema::{
    ArchiveAction, ArchiveControl, CompletionEvent, JobArchiveControl, JobRequest, JobStatus,
    ObjectRef,
};
use crate::services::{EngineOutput, Services, StatusUpdate, Topic, Transition, publish};
use std::path::{Path, PathBuf};

/// Local working files of one job, removed on every exit path.
struct WorkFiles {
    paths: Vec<PathBuf>,
}

impl WorkFiles {
    fn for_input(input_path: &Path) -> Self {
        let outputs = EngineOutput::expected_for(input_path);
        Self {
            paths: vec![input_path.to_path_buf(), outputs.result_path, outputs.log_path],
        }
    }
}

impl Drop for WorkFiles {
    fn drop(&mut self) {
        for path in &self.paths {
            if let Err(e) = std::fs::remove_file(path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %path.display(), error = %e, "runner: cleanup failed");
            }
        }
    }
}

/// User-facing page for a job, relative to the URL the request came from.
pub fn result_url(base: Option<&str>, job_id: &str) -> String {
    let path = format!("/annotations/{job_id}");
    base.and_then(|b| reqwest::Url::parse(b).ok())
        .and_then(|b| b.join(&path).ok())
        .map(|u| u.to_string())
        .unwrap_or(path)
}

async fn annotate_and_upload(
    services: &Services,
    input_path: &Path,
    result: &ObjectRef,
    log: &ObjectRef,
) -> anyhow::Result<()> {
    let output = services.engine.annotate(input_path).await?;
    let result_body = tokio::fs::read(&output.result_path).await?;
    let log_body = tokio::fs::read(&output.log_path).await?;
    services.objects.put(result, result_body).await?;
    services.objects.put(log, log_body).await?;
    Ok(())
}

async fn announce_completion(
    services: &Services,
    request: &JobRequest,
    result: ObjectRef,
    complete_time: i64,
) -> anyhow::Result<()> {
    let event = CompletionEvent {
        job_id: request.job_id.clone(),
        user_id: request.user_id.clone(),
        email: request.email.clone(),
        url: result_url(Some(&request.url), &request.job_id),
    };
    publish(services.bus.as_ref(), Topic::Completions, &event).await?;

    if request.role == services.config.free_role {
        let control = ArchiveControl::Job(JobArchiveControl {
            job_id: request.job_id.clone(),
            user_id: request.user_id.clone(),
            result,
            action: ArchiveAction::Archive,
            complete_time,
            archive_id: None,
            initiated: false,
            url: Some(request.url.clone()),
            email: Some(request.email.clone()),
        });
        publish(services.bus.as_ref(), Topic::Archive, &control).await?;
        tracing::info!(job_id = %request.job_id, "runner: scheduled free-tier archival");
    }
    Ok(())
}

/// Runs the engine for a claimed job and records the outcome.
pub async fn run_job(
    services: &Services,
    request: &JobRequest,
    input_path: &Path,
    file_name: &str,
) -> anyhow::Result<JobStatus> {
    let _work_files = WorkFiles::for_input(input_path);
    let config = &services.config;
    let (result_key, log_key) = config.output_keys(&request.user_id, &request.job_id, file_name);
    let result = ObjectRef::new(&config.results_bucket, result_key);
    let log = ObjectRef::new(&config.results_bucket, log_key);

    let outcome = annotate_and_upload(services, input_path, &result, &log).await;
    let complete_time = chrono::Utc::now().timestamp();

    let update = match &outcome {
        Ok(()) => StatusUpdate::finished(
            JobStatus::Completed,
            Some(result.clone()),
            Some(log.clone()),
            complete_time,
        ),
        Err(e) => {
            tracing::error!(job_id = %request.job_id, error = %format!("{e:#}"), "runner: job failed");
            StatusUpdate::finished(JobStatus::Failed, None, None, complete_time)
        }
    };
    let status = update.status;

    match services
        .jobs
        .transition(&request.job_id, JobStatus::Running, &update)
        .await?
    {
        Transition::Applied => {}
        Transition::Skipped { current } => {
            tracing::warn!(
                job_id = %request.job_id,
                current = ?current,
                "runner: job no longer running, outcome discarded"
            );
            return Ok(current.unwrap_or(status));
        }
    }

    if status == JobStatus::Completed {
        tracing::info!(job_id = %request.job_id, result = %result, "runner: job completed");
        announce_completion(services, request, result, complete_time).await?;
    }
    Ok(status)
}

/// Runner tasks started by this process. The request daemon drains them before
/// returning so a shutdown does not leave claimed jobs in RUNNING.
#[derive(Default)]
pub struct InFlight {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl InFlight {
    pub fn track(&mut self, handle: tokio::task::JoinHandle<()>) {
        self.handles.retain(|h| !h.is_finished());
        self.handles.push(handle);
    }

    pub fn pending(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    pub async fn drain(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "runner: task aborted before recording outcome");
            }
        }
    }
}

/// Starts the runner for a claimed job without waiting for it.
pub fn spawn_job(
    services: Services,
    request: JobRequest,
    input_path: PathBuf,
    file_name: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match run_job(&services, &request, &input_path, &file_name).await {
            Ok(status) => {
                tracing::debug!(job_id = %request.job_id, status = %status, "runner: finished")
            }
            Err(e) => tracing::error!(
                job_id = %request.job_id,
                error = %format!("{e:#}"),
                "runner: could not record job outcome"
            ),
        }
    })
}
