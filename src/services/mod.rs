pub mod bus;
pub mod config;
pub mod engine;
pub mod mailer;
pub mod objects;
pub mod store;
pub mod vault;

pub use bus::*;
pub use config::*;
pub use engine::*;
pub use mailer::*;
pub use objects::*;
pub use store::*;
pub use vault::*;

use sqlx::PgPool;
use std::sync::Arc;

/// Process-scoped collaborators, built once per daemon and handed to every
/// tick.
#[derive(Clone)]
pub struct Services {
    pub jobs: Arc<dyn JobStore>,
    pub bus: Arc<dyn MessageBus>,
    pub objects: Arc<dyn ObjectStore>,
    pub vault: Arc<dyn ColdStore>,
    pub mailer: Arc<dyn Mailer>,
    pub engine: Arc<dyn AnalysisEngine>,
    pub config: Arc<PipelineConfig>,
}

impl Services {
    pub fn connect(db: PgPool, config: PipelineConfig) -> anyhow::Result<Self> {
        let mailer: Arc<dyn Mailer> = match &config.mail_endpoint {
            Some(endpoint) => Arc::new(HttpMailer::new(
                endpoint.clone(),
                config.mail_api_key.clone(),
            )?),
            None => {
                tracing::warn!("no mail endpoint configured, notifications will only be logged");
                Arc::new(LogMailer)
            }
        };

        Ok(Self {
            jobs: Arc::new(PgJobStore::new(db.clone())),
            bus: Arc::new(PgMessageBus::new(db.clone(), config.visibility_timeout())),
            objects: Arc::new(FsObjectStore::new(&config.object_root)),
            vault: Arc::new(PgVault::new(db, config.retrieval_delay_secs)),
            mailer,
            engine: Arc::new(CommandEngine::new(config.annotator_cmd.clone())),
            config: Arc::new(config),
        })
    }

    pub async fn receive(&self, queue: Queue) -> anyhow::Result<Vec<Delivery>> {
        self.bus
            .receive(queue, self.config.receive_batch, self.config.receive_wait())
            .await
    }
}
