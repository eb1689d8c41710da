use crate::functions::runner::{self, InFlight};
use crate::functions::{ack, internal, settle_failure};
use crate::schema::{JobRecord, JobRequest, JobStatus};
use crate::services::{Queue, Services, Transition, claim};
use forge::prelude::*;
use std::path::PathBuf;
use uuid::Uuid;

/// How a job request was settled.
#[derive(Debug)]
pub enum Dispatch {
    /// The job was claimed and its analysis is running in the background.
    Started(tokio::task::JoinHandle<()>),
    /// The record had already left PENDING, typically a redelivered request.
    AlreadyClaimed { current: Option<JobStatus> },
}

fn input_file_name(record: &JobRecord, request: &JobRequest) -> String {
    if !record.input_file_name.is_empty() {
        return record.input_file_name.clone();
    }
    request
        .input
        .key
        .rsplit('/')
        .next()
        .map(|name| name.split_once('~').map(|(_, file)| file).unwrap_or(name))
        .unwrap_or_default()
        .to_string()
}

async fn stage_input(
    services: &Services,
    request: &JobRequest,
    file_name: &str,
) -> anyhow::Result<PathBuf> {
    let body = services
        .objects
        .get(&request.input)
        .await?
        .ok_or_else(|| anyhow::anyhow!("input object {} is missing", request.input))?;
    let attempt = Uuid::new_v4().as_simple().to_string();
    let path = PathBuf::from(
        services
            .config
            .staged_input_path(&request.job_id, &attempt, file_name),
    );
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

/// Claims a pending job and hands it to the analysis engine.
///
/// The record is checked before any work and the PENDING->RUNNING claim is
/// taken before the engine starts, so a redelivered request can never start
/// a second analysis.
pub async fn dispatch(services: &Services, request: &JobRequest) -> anyhow::Result<Dispatch> {
    let record = services
        .jobs
        .get(&request.job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job {} has no record", request.job_id))?;
    if record.status != JobStatus::Pending {
        return Ok(Dispatch::AlreadyClaimed {
            current: Some(record.status),
        });
    }

    let file_name = input_file_name(&record, request);
    let staged = stage_input(services, request, &file_name).await?;

    match claim(services.jobs.as_ref(), &request.job_id).await {
        Ok(Transition::Applied) => {}
        Ok(Transition::Skipped { current }) => {
            let _ = tokio::fs::remove_file(&staged).await;
            return Ok(Dispatch::AlreadyClaimed { current });
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e);
        }
    }

    tracing::info!(
        job_id = %request.job_id,
        user_id = %request.user_id,
        role = %request.role,
        input = %staged.display(),
        "request: job claimed, analysis started"
    );
    Ok(Dispatch::Started(runner::spawn_job(
        services.clone(),
        request.clone(),
        staged,
        file_name,
    )))
}

pub async fn request_tick(services: &Services, in_flight: &mut InFlight) -> Result<u32> {
    let batch = services.receive(Queue::Requests).await.map_err(internal)?;
    if batch.is_empty() {
        return Ok(0);
    }

    tracing::debug!(count = batch.len(), "request: processing batch");
    let mut processed = 0u32;

    for delivery in &batch {
        let request: JobRequest = match delivery.decode() {
            Ok(request) => request,
            Err(e) => {
                settle_failure(services, delivery, &e).await?;
                continue;
            }
        };

        match dispatch(services, &request).await {
            Ok(Dispatch::Started(handle)) => {
                in_flight.track(handle);
                ack(services, delivery).await?;
                processed += 1;
            }
            Ok(Dispatch::AlreadyClaimed { current }) => {
                tracing::info!(
                    job_id = %request.job_id,
                    current = ?current,
                    "request: job already claimed, treating as handled"
                );
                ack(services, delivery).await?;
                processed += 1;
            }
            Err(e) => {
                tracing::error!(
                    job_id = %request.job_id,
                    error = %format!("{e:#}"),
                    "request: could not claim job"
                );
                settle_failure(services, delivery, &e).await?;
            }
        }
    }

    Ok(processed)
}

#[forge::daemon]
pub async fn requests(ctx: &DaemonContext) -> Result<()> {
    let services = Services::connect(ctx.db().clone(), crate::services::PipelineConfig::from_env())
        .map_err(internal)?;
    let poll_ms: u64 = ctx.env_parse("GAS_LOOP_POLL_MS_REQUESTS").unwrap_or(100);
    let mut in_flight = InFlight::default();

    loop {
        tokio::select! {
            _ = ctx.shutdown_signal() => break,
            _ = tokio::time::sleep(std::time::Duration::from_millis(poll_ms)) => {
                match request_tick(&services, &mut in_flight).await {
                    Ok(n) if n > 0 => tracing::info!(processed = n, "request tick"),
                    Err(e) => tracing::error!(error = %e, "request tick failed"),
                    _ => {}
                }
            }
        }
    }

    let pending = in_flight.pending();
    if pending > 0 {
        tracing::info!(pending, "request: waiting for running analyses before shutdown");
    }
    in_flight.drain().await;
    Ok(())
}
