// sitevault/src/site.rs
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{AppConfig, VaultSettings};
use crate::db::{LiveDatabase, PgDatabase};
use crate::errors::{Result, VaultError};
use crate::filestore::{FileStore, LocalFileStore};
use crate::host::{Host, SiteHost};
use crate::operation::{Operation, OperationId, OperationKind, OperationLog, OperationRegistry, PgOperationRegistry};
use crate::remote::{RemoteStore, S3RemoteStore};
use crate::restore::upgrade::UpgradeRegistry;

/// Hands scheduled operations to whatever runs them later.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, kind: OperationKind, id: OperationId) -> Result<()>;
}

/// Queue for a polling worker: the registry already holds everything the
/// worker needs, so enqueueing only announces the operation.
pub struct PollingQueue;

#[async_trait]
impl TaskQueue for PollingQueue {
    async fn enqueue(&self, kind: OperationKind, id: OperationId) -> Result<()> {
        tracing::info!("{} operation {} queued; it starts on the next worker run", kind, id);
        Ok(())
    }
}

/// Everything an operation touches, bundled for the orchestrators.
#[derive(Clone)]
pub struct Site {
    pub settings: VaultSettings,
    pub db: Arc<dyn LiveDatabase>,
    pub files: Arc<dyn FileStore>,
    pub remote: Option<Arc<dyn RemoteStore>>,
    pub registry: Arc<dyn OperationRegistry>,
    pub host: Arc<dyn Host>,
    pub queue: Arc<dyn TaskQueue>,
    /// Hooks run after a restore from an older version.
    pub upgrades: Arc<UpgradeRegistry>,
}

impl Site {
    /// Connects every production collaborator described by `config`.
    pub async fn connect(config: &AppConfig) -> Result<Site> {
        let database = PgDatabase::connect(&config.database_url).await?;
        let pool = database.pool().clone();
        let settings = config.settings.clone();

        let remote: Option<Arc<dyn RemoteStore>> = match &config.storage {
            Some(storage) => Some(Arc::new(S3RemoteStore::connect(storage.clone()).await)),
            None => None,
        };

        Ok(Site {
            files: Arc::new(LocalFileStore::new(
                pool.clone(),
                &settings.filedir,
                &settings.files_table,
            )),
            registry: Arc::new(PgOperationRegistry::new(pool.clone())),
            host: Arc::new(SiteHost::new(pool, &settings.dataroot, &settings.session_table)),
            queue: Arc::new(PollingQueue),
            upgrades: Arc::new(UpgradeRegistry::builtin()),
            db: Arc::new(database),
            remote,
            settings,
        })
    }

    pub fn remote(&self) -> Result<&dyn RemoteStore> {
        self.remote
            .as_deref()
            .ok_or_else(|| VaultError::Config("Remote storage (s3_storage) is not configured".into()))
    }

    pub fn log_for(&self, operation: &Operation) -> OperationLog {
        OperationLog::new(self.registry.clone(), operation)
    }
}
