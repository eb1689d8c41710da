use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Requests,
    Completions,
    Archive,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    Requests,
    Completions,
    Archive,
    Restore,
}

impl Topic {
    /// Queues subscribed to this topic. Every publish lands once in each.
    pub fn subscribers(self) -> &'static [Queue] {
        match self {
            Topic::Requests => &[Queue::Requests],
            Topic::Completions => &[Queue::Completions],
            Topic::Archive => &[Queue::Archive],
            Topic::Restore => &[Queue::Restore],
        }
    }
}

impl Queue {
    pub fn as_str(self) -> &'static str {
        match self {
            Queue::Requests => "job_requests",
            Queue::Completions => "job_results",
            Queue::Archive => "job_archive",
            Queue::Restore => "job_restore",
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A received message. The receipt is only valid for this delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: Uuid,
    pub queue: Queue,
    pub receive_count: i32,
    pub body: serde_json::Value,
}

impl Delivery {
    pub fn decode<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| anyhow::anyhow!("undecodable message on {}: {e}", self.queue))
    }
}

#[async_trait::async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish_delayed(
        &self,
        topic: Topic,
        body: serde_json::Value,
        delay: Duration,
    ) -> anyhow::Result<()>;
    /// Waits up to `wait` for at least one visible message. An empty batch is
    /// a normal outcome.
    async fn receive(
        &self,
        queue: Queue,
        max: usize,
        wait: Duration,
    ) -> anyhow::Result<Vec<Delivery>>;
    /// False when the receipt is stale (the message was redelivered or already
    /// deleted).
    async fn delete(&self, delivery: &Delivery) -> anyhow::Result<bool>;
}

pub async fn publish<T: Serialize + Sync>(
    bus: &dyn MessageBus,
    topic: Topic,
    message: &T,
) -> anyhow::Result<()> {
    bus.publish_delayed(topic, serde_json::to_value(message)?, Duration::ZERO)
        .await
}

/// Enqueues one copy of `body` on `queue`, hidden for `delay`. Callers that
/// publish inside their own transaction run this on their executor.
pub(crate) fn insert_message(
    queue: Queue,
    body: serde_json::Value,
    delay: Duration,
) -> sqlx::query::Query<'static, sqlx::Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO queue_messages (id, queue, body, visible_at)
        VALUES ($1, $2, $3, now() + make_interval(secs => $4))
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(queue.as_str())
    .bind(body)
    .bind(delay.as_secs_f64())
}

pub struct PgMessageBus {
    db: PgPool,
    visibility_timeout: Duration,
}

impl PgMessageBus {
    pub fn new(db: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            db,
            visibility_timeout,
        }
    }

    async fn claim_visible(&self, queue: Queue, max: usize) -> anyhow::Result<Vec<Delivery>> {
        let rows: Vec<(Uuid, i32, serde_json::Value)> = sqlx::query_as(
            r#"
            UPDATE queue_messages
            SET visible_at = now() + make_interval(secs => $3),
                receive_count = receive_count + 1
            WHERE id IN (
                SELECT id FROM queue_messages
                WHERE queue = $1 AND visible_at <= now()
                ORDER BY created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, receive_count, body
            "#,
        )
        .bind(queue.as_str())
        .bind(max as i64)
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, receive_count, body)| Delivery {
                id,
                queue,
                receive_count,
                body,
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl MessageBus for PgMessageBus {
    async fn publish_delayed(
        &self,
        topic: Topic,
        body: serde_json::Value,
        delay: Duration,
    ) -> anyhow::Result<()> {
        let mut tx = self.db.begin().await?;
        for queue in topic.subscribers() {
            insert_message(*queue, body.clone(), delay)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn receive(
        &self,
        queue: Queue,
        max: usize,
        wait: Duration,
    ) -> anyhow::Result<Vec<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let batch = self.claim_visible(queue, max).await?;
            if !batch.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(RECEIVE_POLL_INTERVAL).await;
        }
    }

    async fn delete(&self, delivery: &Delivery) -> anyhow::Result<bool> {
        let result =
            sqlx::query("DELETE FROM queue_messages WHERE id = $1 AND receive_count = $2")
                .bind(delivery.id)
                .bind(delivery.receive_count)
                .execute(&self.db)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}
