pub mod archive;
pub mod jobs;
pub mod notify;
pub mod request;
pub mod restore;
pub mod runner;

pub use archive::*;
pub use jobs::*;
pub use notify::*;
pub use request::*;
pub use restore::*;

use crate::services::{Delivery, FailurePolicy, Services};
use forge::prelude::*;

pub(crate) fn internal(e: anyhow::Error) -> ForgeError {
    ForgeError::Internal(format!("{e:#}"))
}

/// Acknowledges a delivery. A stale receipt means another consumer now owns
/// the message, which is logged and otherwise ignored.
pub(crate) async fn ack(services: &Services, delivery: &Delivery) -> Result<()> {
    let deleted = services.bus.delete(delivery).await.map_err(internal)?;
    if !deleted {
        tracing::warn!(
            queue = %delivery.queue,
            message_id = %delivery.id,
            receive_count = delivery.receive_count,
            "stale receipt, message was redelivered before ack"
        );
    }
    Ok(())
}

/// Settles a message that could not be processed according to the configured
/// failure policy. Returns true when the message was dropped.
pub(crate) async fn settle_failure(
    services: &Services,
    delivery: &Delivery,
    error: &anyhow::Error,
) -> Result<bool> {
    match services.config.failure_policy {
        FailurePolicy::Drop => {
            tracing::warn!(
                queue = %delivery.queue,
                message_id = %delivery.id,
                error = %format!("{error:#}"),
                policy = "drop",
                "dropping unprocessable message"
            );
            ack(services, delivery).await?;
            Ok(true)
        }
        FailurePolicy::Requeue => {
            tracing::warn!(
                queue = %delivery.queue,
                message_id = %delivery.id,
                receive_count = delivery.receive_count,
                error = %format!("{error:#}"),
                policy = "requeue",
                "leaving unprocessable message for redelivery"
            );
            Ok(false)
        }
    }
}
