use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::str::FromStr;
use uuid::Uuid;

/// Retrieval speed tier used for restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalTier {
    Expedited,
    Standard,
    Bulk,
}

impl RetrievalTier {
    pub fn as_str(self) -> &'static str {
        match self {
            RetrievalTier::Expedited => "Expedited",
            RetrievalTier::Standard => "Standard",
            RetrievalTier::Bulk => "Bulk",
        }
    }

    /// Seconds until a retrieval in this tier is ready, given the expedited
    /// base latency.
    pub fn delay_secs(self, expedited_secs: i64) -> i64 {
        match self {
            RetrievalTier::Expedited => expedited_secs,
            RetrievalTier::Standard => expedited_secs * 48,
            RetrievalTier::Bulk => expedited_secs * 144,
        }
    }
}

impl FromStr for RetrievalTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "expedited" => Ok(RetrievalTier::Expedited),
            "standard" => Ok(RetrievalTier::Standard),
            "bulk" => Ok(RetrievalTier::Bulk),
            other => Err(anyhow::anyhow!("unknown retrieval tier `{other}`")),
        }
    }
}

/// Cold archive storage with asynchronous retrieval.
#[async_trait::async_trait]
pub trait ColdStore: Send + Sync {
    async fn upload_archive(&self, vault: &str, body: Vec<u8>) -> anyhow::Result<String>;
    async fn initiate_retrieval(
        &self,
        vault: &str,
        archive_id: &str,
        tier: RetrievalTier,
    ) -> anyhow::Result<String>;
    /// Whether the retrieval's output can be fetched yet.
    async fn describe_retrieval(&self, vault: &str, retrieval_id: &str) -> anyhow::Result<bool>;
    async fn get_retrieval_output(&self, vault: &str, retrieval_id: &str)
    -> anyhow::Result<Vec<u8>>;
    async fn delete_archive(&self, vault: &str, archive_id: &str) -> anyhow::Result<()>;
}

pub struct PgVault {
    db: PgPool,
    expedited_delay_secs: i64,
}

impl PgVault {
    pub fn new(db: PgPool, expedited_delay_secs: i64) -> Self {
        Self {
            db,
            expedited_delay_secs,
        }
    }
}

#[async_trait::async_trait]
impl ColdStore for PgVault {
    async fn upload_archive(&self, vault: &str, body: Vec<u8>) -> anyhow::Result<String> {
        let archive_id = Uuid::new_v4().as_simple().to_string();
        sqlx::query("INSERT INTO vault_archives (archive_id, vault, body) VALUES ($1, $2, $3)")
            .bind(&archive_id)
            .bind(vault)
            .bind(body)
            .execute(&self.db)
            .await?;
        Ok(archive_id)
    }

    async fn initiate_retrieval(
        &self,
        vault: &str,
        archive_id: &str,
        tier: RetrievalTier,
    ) -> anyhow::Result<String> {
        let exists: Option<String> = sqlx::query_scalar(
            "SELECT archive_id FROM vault_archives WHERE vault = $1 AND archive_id = $2",
        )
        .bind(vault)
        .bind(archive_id)
        .fetch_optional(&self.db)
        .await?;
        if exists.is_none() {
            anyhow::bail!("archive {archive_id} not found in vault {vault}");
        }

        let retrieval_id = Uuid::new_v4().as_simple().to_string();
        sqlx::query(
            r#"
            INSERT INTO vault_retrievals (retrieval_id, vault, archive_id, tier, ready_at)
            VALUES ($1, $2, $3, $4, now() + make_interval(secs => $5))
            "#,
        )
        .bind(&retrieval_id)
        .bind(vault)
        .bind(archive_id)
        .bind(tier.as_str())
        .bind(tier.delay_secs(self.expedited_delay_secs) as f64)
        .execute(&self.db)
        .await?;
        Ok(retrieval_id)
    }

    async fn describe_retrieval(&self, vault: &str, retrieval_id: &str) -> anyhow::Result<bool> {
        let completed: Option<bool> = sqlx::query_scalar(
            "SELECT ready_at <= now() FROM vault_retrievals WHERE vault = $1 AND retrieval_id = $2",
        )
        .bind(vault)
        .bind(retrieval_id)
        .fetch_optional(&self.db)
        .await?;
        completed.ok_or_else(|| anyhow::anyhow!("unknown retrieval {retrieval_id} in {vault}"))
    }

    async fn get_retrieval_output(
        &self,
        vault: &str,
        retrieval_id: &str,
    ) -> anyhow::Result<Vec<u8>> {
        let body: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT a.body
            FROM vault_retrievals r
            JOIN vault_archives a ON a.vault = r.vault AND a.archive_id = r.archive_id
            WHERE r.vault = $1 AND r.retrieval_id = $2 AND r.ready_at <= now()
            "#,
        )
        .bind(vault)
        .bind(retrieval_id)
        .fetch_optional(&self.db)
        .await?;
        body.ok_or_else(|| anyhow::anyhow!("retrieval {retrieval_id} has no output yet"))
    }

    async fn delete_archive(&self, vault: &str, archive_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM vault_archives WHERE vault = $1 AND archive_id = $2")
            .bind(vault)
            .bind(archive_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge::testing::*;

    #[test]
    fn tier_names_parse_case_insensitively() {
        assert_eq!("Bulk".parse::<RetrievalTier>().unwrap(), RetrievalTier::Bulk);
        assert_eq!(" standard ".parse::<RetrievalTier>().unwrap(), RetrievalTier::Standard);
        assert!("glacial".parse::<RetrievalTier>().is_err());
    }

    #[test]
    fn slower_tiers_wait_longer() {
        assert_eq!(RetrievalTier::Expedited.delay_secs(300), 300);
        assert!(RetrievalTier::Standard.delay_secs(300) > 300);
        assert!(RetrievalTier::Bulk.delay_secs(300) > RetrievalTier::Standard.delay_secs(300));
    }

    #[tokio::test]
    async fn retrieval_is_gated_on_ready_time() {
        let base = TestDatabase::embedded().await.unwrap();
        let db = base.isolated("vault").await.unwrap();
        db.run_sql(include_str!("../../migrations/0001_pipeline.sql"))
            .await
            .unwrap();

        let slow = PgVault::new(db.pool().clone(), 3600);
        let archive_id = slow.upload_archive("v", b"cold".to_vec()).await.unwrap();
        let pending = slow
            .initiate_retrieval("v", &archive_id, RetrievalTier::Expedited)
            .await
            .unwrap();
        assert!(!slow.describe_retrieval("v", &pending).await.unwrap());
        assert!(slow.get_retrieval_output("v", &pending).await.is_err());

        let fast = PgVault::new(db.pool().clone(), 0);
        let ready = fast
            .initiate_retrieval("v", &archive_id, RetrievalTier::Expedited)
            .await
            .unwrap();
        assert!(fast.describe_retrieval("v", &ready).await.unwrap());
        assert_eq!(fast.get_retrieval_output("v", &ready).await.unwrap(), b"cold");
    }
}
