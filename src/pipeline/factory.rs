//! Wiring of consumers and admins onto a shared store and lock service.

use std::sync::Arc;

use tracing::info;

use super::admin::PipelineAdmin;
use super::config::{AdminSettings, ConsumerSettings, PipelineConfig};
use super::consumer::PipelineConsumer;
use super::handler::PipelineHandler;
use crate::error::{ConfigError, PipelineResult};
use crate::lock::{DistributedLock, MemoryLock, RedLock};
use crate::store::{MemoryStore, PipelineStore, RedisStore};

/// Creates consumers and admins that share one store and one lock service.
#[derive(Clone)]
pub struct PipelineFactory {
    store: Arc<dyn PipelineStore>,
    lock: Arc<dyn DistributedLock>,
}

impl PipelineFactory {
    pub fn new(store: Arc<dyn PipelineStore>, lock: Arc<dyn DistributedLock>) -> Self {
        Self { store, lock }
    }

    /// Factory backed by process-local store and lock.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryLock::new()))
    }

    /// Connects to Redis. The first URL holds pipeline data; every URL is a
    /// Redlock node.
    ///
    /// # Errors
    ///
    /// Returns an error when `redis_urls` is empty or any node is unreachable.
    pub async fn connect<S: AsRef<str>>(redis_urls: &[S]) -> PipelineResult<Self> {
        let Some(data_url) = redis_urls.first() else {
            return Err(ConfigError::ValidationFailed(
                "at least one Redis URL is required".to_string(),
            )
            .into());
        };

        let store = RedisStore::connect(data_url.as_ref()).await?;
        let lock = RedLock::connect(redis_urls).await?;

        info!(
            data_node = %data_url.as_ref(),
            lock_nodes = lock.node_count(),
            "Connected pipeline factory"
        );

        Ok(Self::new(Arc::new(store), Arc::new(lock)))
    }

    /// Validates `config` and connects to its Redis nodes.
    pub async fn from_config(config: &PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;
        Self::connect(&config.redis_urls).await
    }

    /// Shared store handle.
    pub fn store(&self) -> Arc<dyn PipelineStore> {
        Arc::clone(&self.store)
    }

    /// Creates a consumer running `handler`.
    pub fn create_consumer(
        &self,
        settings: ConsumerSettings,
        handler: Arc<dyn PipelineHandler>,
    ) -> PipelineResult<PipelineConsumer> {
        settings.validate()?;
        Ok(PipelineConsumer::new(
            settings,
            handler,
            Arc::clone(&self.store),
            Arc::clone(&self.lock),
        ))
    }

    /// Creates an admin.
    pub fn create_admin(&self, settings: AdminSettings) -> PipelineResult<PipelineAdmin> {
        settings.validate()?;
        Ok(PipelineAdmin::new(
            settings,
            Arc::clone(&self.store),
            Arc::clone(&self.lock),
        ))
    }
}
