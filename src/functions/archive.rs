use crate::functions::{ack, internal, settle_failure};
use crate::schema::{
    ArchiveAction, ArchiveControl, JobArchiveControl, JobStatus, RestoreRequest,
    UserArchiveControl,
};
use crate::services::{Queue, Services, Topic, publish};
use forge::prelude::*;
use std::time::Duration;

/// What handling one archive-control message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// A user-scoped control emitted this many job-scoped controls.
    FannedOut(usize),
    /// The job is still inside its retention window; a copy of the control
    /// was re-published to become visible once the window ends.
    Deferred { delay_secs: i64 },
    Archived { archive_id: String },
    RestoreRequested { retrieval_id: String },
    /// Nothing to do for this job.
    Skipped(&'static str),
}

async fn fan_out(
    services: &Services,
    control: &UserArchiveControl,
) -> anyhow::Result<ControlOutcome> {
    let records = services.jobs.list_for_user(&control.user_id).await?;
    let mut emitted = 0;

    for record in records {
        let eligible = match control.action {
            ArchiveAction::Archive => !record.archived && record.status == JobStatus::Completed,
            ArchiveAction::Restore => record.archived,
        };
        if !eligible {
            continue;
        }
        let (Some(result), Some(complete_time)) = (record.result.clone(), record.complete_time)
        else {
            tracing::warn!(job_id = %record.job_id, "archiver: record has no result, not fanned out");
            continue;
        };

        let job = ArchiveControl::Job(JobArchiveControl {
            job_id: record.job_id.clone(),
            user_id: record.user_id.clone(),
            result,
            action: control.action,
            complete_time,
            archive_id: record.archive_id.clone(),
            initiated: false,
            url: Some(control.url.clone()),
            email: Some(control.email.clone()),
        });
        publish(services.bus.as_ref(), Topic::Archive, &job).await?;
        emitted += 1;
    }

    tracing::info!(
        user_id = %control.user_id,
        action = control.action.as_str(),
        emitted,
        "archiver: user control fanned out"
    );
    Ok(ControlOutcome::FannedOut(emitted))
}

async fn archive_job(
    services: &Services,
    control: &JobArchiveControl,
    now: i64,
) -> anyhow::Result<ControlOutcome> {
    let config = &services.config;
    let eligible_at = control.complete_time + config.retention_secs;
    if now <= eligible_at {
        let delay_secs = (eligible_at - now + 1).max(1);
        let body = serde_json::to_value(ArchiveControl::Job(control.clone()))?;
        services
            .bus
            .publish_delayed(Topic::Archive, body, Duration::from_secs(delay_secs as u64))
            .await?;
        tracing::debug!(
            job_id = %control.job_id,
            delay_secs,
            "archiver: job inside retention window, deferred"
        );
        return Ok(ControlOutcome::Deferred { delay_secs });
    }

    let Some(record) = services.jobs.get(&control.job_id).await? else {
        return Ok(ControlOutcome::Skipped("no job record"));
    };
    let result = record.result.clone().unwrap_or_else(|| control.result.clone());
    if record.archived {
        // A redelivery after mark_archived may still find the hot copy; a
        // restore in flight owns the object, so leave it alone then.
        if !record.is_restore_pending() {
            services.objects.delete(&result).await?;
        }
        return Ok(ControlOutcome::Skipped("already archived"));
    }
    if record.status != JobStatus::Completed {
        return Ok(ControlOutcome::Skipped("job not completed"));
    }

    let Some(body) = services.objects.get(&result).await? else {
        tracing::warn!(job_id = %control.job_id, result = %result, "archiver: result object missing");
        return Ok(ControlOutcome::Skipped("result object missing"));
    };

    let archive_id = services.vault.upload_archive(&config.vault, body).await?;
    let marked = match services.jobs.mark_archived(&control.job_id, &archive_id).await {
        Ok(marked) => marked,
        Err(e) => {
            discard_archive(services, &archive_id).await;
            return Err(e);
        }
    };
    if !marked {
        discard_archive(services, &archive_id).await;
        return Ok(ControlOutcome::Skipped("record changed during archival"));
    }

    services.objects.delete(&result).await.map_err(|e| {
        tracing::warn!(
            job_id = %control.job_id,
            result = %result,
            error = %format!("{e:#}"),
            "archiver: archived but hot copy not deleted, leaving control for redelivery"
        );
        e
    })?;

    tracing::info!(job_id = %control.job_id, archive_id = %archive_id, "archiver: job archived");
    Ok(ControlOutcome::Archived { archive_id })
}

async fn discard_archive(services: &Services, archive_id: &str) {
    if let Err(e) = services
        .vault
        .delete_archive(&services.config.vault, archive_id)
        .await
    {
        tracing::warn!(archive_id, error = %format!("{e:#}"), "archiver: orphaned vault archive");
    }
}

async fn restore_job(
    services: &Services,
    control: &JobArchiveControl,
) -> anyhow::Result<ControlOutcome> {
    let Some(record) = services.jobs.get(&control.job_id).await? else {
        return Ok(ControlOutcome::Skipped("no job record"));
    };
    if !record.archived {
        return Ok(ControlOutcome::Skipped("not archived"));
    }
    let Some(archive_id) = record.archive_id.clone() else {
        return Ok(ControlOutcome::Skipped("archived without a handle"));
    };

    let retrieval_id = match record.retrieval_id.clone() {
        Some(existing) if record.is_restore_pending() => {
            tracing::debug!(
                job_id = %control.job_id,
                retrieval_id = %existing,
                "archiver: retrieval already in flight, reusing it"
            );
            existing
        }
        _ => {
            let retrieval_id = services
                .vault
                .initiate_retrieval(
                    &services.config.vault,
                    &archive_id,
                    services.config.retrieval_tier,
                )
                .await?;
            if !services
                .jobs
                .mark_retrieval(&control.job_id, &retrieval_id)
                .await?
            {
                return Ok(ControlOutcome::Skipped("record changed during restore"));
            }
            retrieval_id
        }
    };

    let request = RestoreRequest {
        retrieval_id: retrieval_id.clone(),
        control: JobArchiveControl {
            result: record.result.clone().unwrap_or_else(|| control.result.clone()),
            complete_time: record.complete_time.unwrap_or(control.complete_time),
            archive_id: Some(archive_id),
            initiated: true,
            ..control.clone()
        },
    };
    publish(services.bus.as_ref(), Topic::Restore, &request).await?;

    tracing::info!(
        job_id = %control.job_id,
        retrieval_id = %retrieval_id,
        "archiver: restore initiated"
    );
    Ok(ControlOutcome::RestoreRequested { retrieval_id })
}

/// Handles one archive-control message at time `now` (unix seconds).
pub async fn handle_control(
    services: &Services,
    control: &ArchiveControl,
    now: i64,
) -> anyhow::Result<ControlOutcome> {
    match control {
        ArchiveControl::User(user) => fan_out(services, user).await,
        ArchiveControl::Job(job) => match job.action {
            ArchiveAction::Archive => archive_job(services, job, now).await,
            ArchiveAction::Restore => restore_job(services, job).await,
        },
    }
}

pub async fn archive_tick(services: &Services) -> Result<u32> {
    let batch = services.receive(Queue::Archive).await.map_err(internal)?;
    if batch.is_empty() {
        return Ok(0);
    }

    let mut processed = 0u32;
    for delivery in &batch {
        let control: ArchiveControl = match delivery.decode() {
            Ok(control) => control,
            Err(e) => {
                settle_failure(services, delivery, &e).await?;
                continue;
            }
        };

        let now = chrono::Utc::now().timestamp();
        match handle_control(services, &control, now).await {
            Ok(outcome) => {
                if let ControlOutcome::Skipped(reason) = outcome {
                    tracing::debug!(message_id = %delivery.id, reason, "archiver: control skipped");
                }
                ack(services, delivery).await?;
                processed += 1;
            }
            Err(e) => {
                // Left undeleted; the visibility timeout redelivers it.
                tracing::error!(
                    message_id = %delivery.id,
                    receive_count = delivery.receive_count,
                    error = %format!("{e:#}"),
                    "archiver: control failed"
                );
            }
        }
    }

    Ok(processed)
}

#[forge::daemon]
pub async fn archiver(ctx: &DaemonContext) -> Result<()> {
    let services = Services::connect(ctx.db().clone(), crate::services::PipelineConfig::from_env())
        .map_err(internal)?;
    let poll_ms: u64 = ctx.env_parse("GAS_LOOP_POLL_MS_ARCHIVER").unwrap_or(100);

    loop {
        tokio::select! {
            _ = ctx.shutdown_signal() => break,
            _ = tokio::time::sleep(std::time::Duration::from_millis(poll_ms)) => {
                match archive_tick(&services).await {
                    Ok(n) if n > 0 => tracing::info!(processed = n, "archive tick"),
                    Err(e) => tracing::error!(error = %e, "archive tick failed"),
                    _ => {}
                }
            }
        }
    }
    Ok(())
}
