use crate::functions::{ack, internal};
use crate::schema::CompletionEvent;
use crate::services::{Email, Queue, Services};
use forge::prelude::*;

const SUBJECT: &str = "Annotation result is ready to view.";

fn completion_email(sender: &str, event: &CompletionEvent) -> Email {
    Email {
        from: sender.to_string(),
        to: vec![event.email.clone()],
        subject: SUBJECT.to_string(),
        body: serde_json::json!({ "job_id": event.job_id, "url": event.url }).to_string(),
    }
}

/// Sends one notification per completion event. Every received message is
/// deleted after the send attempt, whatever its outcome.
pub async fn notify_tick(services: &Services) -> Result<u32> {
    let batch = services
        .receive(Queue::Completions)
        .await
        .map_err(internal)?;
    if batch.is_empty() {
        return Ok(0);
    }

    let mut processed = 0u32;
    for delivery in &batch {
        match delivery.decode::<CompletionEvent>() {
            Ok(event) => {
                let email = completion_email(&services.config.mail_sender, &event);
                match services.mailer.send(&email).await {
                    Ok(()) => tracing::info!(
                        job_id = %event.job_id,
                        user_id = %event.user_id,
                        "notifier: completion email sent"
                    ),
                    Err(e) => tracing::warn!(
                        job_id = %event.job_id,
                        error = %format!("{e:#}"),
                        "notifier: send failed, notification dropped"
                    ),
                }
            }
            Err(e) => tracing::warn!(
                message_id = %delivery.id,
                error = %format!("{e:#}"),
                "notifier: undecodable event dropped"
            ),
        }
        ack(services, delivery).await?;
        processed += 1;
    }

    Ok(processed)
}

#[forge::daemon]
pub async fn notifier(ctx: &DaemonContext) -> Result<()> {
    let services = Services::connect(ctx.db().clone(), crate::services::PipelineConfig::from_env())
        .map_err(internal)?;
    let poll_ms: u64 = ctx.env_parse("GAS_LOOP_POLL_MS_NOTIFIER").unwrap_or(100);

    loop {
        tokio::select! {
            _ = ctx.shutdown_signal() => break,
            _ = tokio::time::sleep(std::time::Duration::from_millis(poll_ms)) => {
                match notify_tick(&services).await {
                    Ok(n) if n > 0 => tracing::info!(processed = n, "notify tick"),
                    Err(e) => tracing::error!(error = %e, "notify tick failed"),
                    _ => {}
                }
            }
        }
    }
    Ok(())
}
