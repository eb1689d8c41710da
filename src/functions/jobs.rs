use crate::schema::*;
use crate::services::{JOB_COLUMNS, Topic, insert_message};
use forge::prelude::*;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
pub struct GetJobInput {
    pub job_id: String,
}

#[forge::query(public)]
pub async fn get_job(ctx: &QueryContext, input: GetJobInput) -> Result<Option<JobRecord>> {
    let row: Option<JobRow> =
        sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
            .bind(&input.job_id)
            .fetch_optional(ctx.db())
            .await
            .map_err(|e| ForgeError::Database(e.to_string()))?;

    row.map(JobRecord::try_from)
        .transpose()
        .map_err(|e| ForgeError::Internal(format!("{e:#}")))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListUserJobsInput {
    pub user_id: String,
    pub limit: Option<i64>,
}

#[forge::query(public)]
pub async fn list_user_jobs(
    ctx: &QueryContext,
    input: ListUserJobsInput,
) -> Result<Vec<JobRecord>> {
    let limit = input.limit.unwrap_or(50).min(200);

    let rows: Vec<JobRow> = sqlx::query_as(&format!(
        r#"
        SELECT {JOB_COLUMNS} FROM jobs
        WHERE user_id = $1
        ORDER BY submit_time DESC, job_id
        LIMIT $2
        "#
    ))
    .bind(&input.user_id)
    .bind(limit)
    .fetch_all(ctx.db())
    .await
    .map_err(|e| ForgeError::Database(e.to_string()))?;

    rows.into_iter()
        .map(JobRecord::try_from)
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(|e| ForgeError::Internal(format!("{e:#}")))
}

/// Subscription change for one user: a cancellation archives their results,
/// an upgrade restores them.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubscriptionChangeInput {
    pub user_id: String,
    pub url: String,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionChangeOutput {
    pub published: bool,
}

fn user_control(action: ArchiveAction, input: SubscriptionChangeInput) -> Result<ArchiveControl> {
    if input.user_id.trim().is_empty() {
        return Err(ForgeError::Validation("user_id is required".into()));
    }
    Ok(ArchiveControl::User(UserArchiveControl {
        user_id: input.user_id,
        action,
        url: input.url,
        email: input.email,
    }))
}

async fn publish_control(ctx: &MutationContext, control: ArchiveControl) -> Result<bool> {
    let body =
        serde_json::to_value(&control).map_err(|e| ForgeError::Internal(e.to_string()))?;
    let db = ctx.db();

    let mut published = false;
    for queue in Topic::Archive.subscribers() {
        let result = db
            .execute(insert_message(*queue, body.clone(), Duration::ZERO))
            .await?;
        published |= result.rows_affected() > 0;
    }
    Ok(published)
}

#[forge::mutation(public)]
pub async fn request_archive(
    ctx: &MutationContext,
    input: SubscriptionChangeInput,
) -> Result<SubscriptionChangeOutput> {
    let user_id = input.user_id.clone();
    let control = user_control(ArchiveAction::Archive, input)?;
    let published = publish_control(ctx, control).await?;
    tracing::info!(user_id = %user_id, "jobs: archive requested for user");
    Ok(SubscriptionChangeOutput { published })
}

#[forge::mutation(public)]
pub async fn request_restore(
    ctx: &MutationContext,
    input: SubscriptionChangeInput,
) -> Result<SubscriptionChangeOutput> {
    let user_id = input.user_id.clone();
    let control = user_control(ArchiveAction::Restore, input)?;
    let published = publish_control(ctx, control).await?;
    tracing::info!(user_id = %user_id, "jobs: restore requested for user");
    Ok(SubscriptionChangeOutput { published })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(user_id: &str) -> SubscriptionChangeInput {
        SubscriptionChangeInput {
            user_id: user_id.into(),
            url: "https://gas.example.com/subscribe".into(),
            email: "u1@example.com".into(),
        }
    }

    #[test]
    fn subscription_change_builds_user_control() {
        let control = user_control(ArchiveAction::Restore, input("u1")).unwrap();
        let body = serde_json::to_value(&control).unwrap();
        assert_eq!(body["type"], "user");
        assert_eq!(body["action"], "restore");
        assert_eq!(body["user_id"], "u1");
    }

    #[test]
    fn blank_user_is_rejected() {
        assert!(matches!(
            user_control(ArchiveAction::Archive, input("  ")),
            Err(ForgeError::Validation(_))
        ));
    }
}
