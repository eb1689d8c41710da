use crate::functions::runner::result_url;
use crate::functions::{ack, internal, settle_failure};
use crate::schema::{CompletionEvent, RestoreRequest};
use crate::services::{Queue, Services, Topic, publish};
use forge::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The vault retrieval has not finished; the message stays for redelivery.
    Pending,
    Restored,
    /// The job is gone or no longer archived, typically a duplicate request.
    AlreadyRestored,
}

/// Completes one restore once its vault retrieval is ready: the bytes go back
/// to hot storage at the original key, the record is unarchived and the user
/// is notified through the regular completion event.
pub async fn complete_restore(
    services: &Services,
    request: &RestoreRequest,
) -> anyhow::Result<RestoreOutcome> {
    let control = &request.control;
    let Some(record) = services.jobs.get(&control.job_id).await? else {
        return Ok(RestoreOutcome::AlreadyRestored);
    };
    if !record.archived {
        return Ok(RestoreOutcome::AlreadyRestored);
    }

    let vault = &services.config.vault;
    if !services
        .vault
        .describe_retrieval(vault, &request.retrieval_id)
        .await?
    {
        tracing::debug!(
            job_id = %control.job_id,
            retrieval_id = %request.retrieval_id,
            "restorer: retrieval still in progress"
        );
        return Ok(RestoreOutcome::Pending);
    }

    let body = services
        .vault
        .get_retrieval_output(vault, &request.retrieval_id)
        .await?;
    let result = record.result.clone().unwrap_or_else(|| control.result.clone());
    services.objects.put(&result, body).await?;

    if !services.jobs.clear_archive(&control.job_id).await? {
        return Ok(RestoreOutcome::AlreadyRestored);
    }

    if let Some(archive_id) = record.archive_id.as_deref().or(control.archive_id.as_deref())
        && let Err(e) = services.vault.delete_archive(vault, archive_id).await
    {
        tracing::warn!(
            job_id = %control.job_id,
            archive_id,
            error = %format!("{e:#}"),
            "restorer: vault archive left behind"
        );
    }

    let event = CompletionEvent {
        job_id: control.job_id.clone(),
        user_id: control.user_id.clone(),
        email: control.email.clone().unwrap_or_else(|| record.email.clone()),
        url: result_url(control.url.as_deref(), &control.job_id),
    };
    publish(services.bus.as_ref(), Topic::Completions, &event).await?;

    tracing::info!(job_id = %control.job_id, result = %result, "restorer: job restored");
    Ok(RestoreOutcome::Restored)
}

pub async fn restore_tick(services: &Services) -> Result<u32> {
    let batch = services.receive(Queue::Restore).await.map_err(internal)?;
    if batch.is_empty() {
        return Ok(0);
    }

    let mut processed = 0u32;
    for delivery in &batch {
        let request: RestoreRequest = match delivery.decode() {
            Ok(request) => request,
            Err(e) => {
                settle_failure(services, delivery, &e).await?;
                continue;
            }
        };

        match complete_restore(services, &request).await {
            Ok(RestoreOutcome::Pending) => {}
            Ok(RestoreOutcome::Restored) => {
                ack(services, delivery).await?;
                processed += 1;
            }
            Ok(RestoreOutcome::AlreadyRestored) => {
                tracing::info!(
                    job_id = %request.control.job_id,
                    "restorer: job not archived, dropping restore request"
                );
                ack(services, delivery).await?;
                processed += 1;
            }
            Err(e) => tracing::error!(
                job_id = %request.control.job_id,
                retrieval_id = %request.retrieval_id,
                error = %format!("{e:#}"),
                "restorer: restore failed"
            ),
        }
    }

    Ok(processed)
}

#[forge::daemon]
pub async fn restorer(ctx: &DaemonContext) -> Result<()> {
    let services = Services::connect(ctx.db().clone(), crate::services::PipelineConfig::from_env())
        .map_err(internal)?;
    let poll_ms: u64 = ctx.env_parse("GAS_LOOP_POLL_MS_RESTORER").unwrap_or(100);

    loop {
        tokio::select! {
            _ = ctx.shutdown_signal() => break,
            _ = tokio::time::sleep(std::time::Duration::from_millis(poll_ms)) => {
                match restore_tick(&services).await {
                    Ok(n) if n > 0 => tracing::info!(processed = n, "restore tick"),
                    Err(e) => tracing::error!(error = %e, "restore tick failed"),
                    _ => {}
                }
            }
        }
    }
    Ok(())
}
