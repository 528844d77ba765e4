use std::sync::Arc;
use tracing::{info, warn};

use physio_store::{Ingestor, JobQueue, SourceRegistry, Storage, StoreError};

use crate::models::extension_model::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub ingestor: Ingestor,
    pub jobs: Arc<JobQueue>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Opens storage and starts the workers. Needs a running tokio runtime.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let storage = Arc::new(Storage::open(&config.store)?);
        let registry = Arc::new(SourceRegistry::with_builtin());
        let ingestor = Ingestor::new(Arc::clone(&storage), registry);
        let jobs = Arc::new(JobQueue::start(ingestor.clone(), config.store.workers));
        Ok(Self {
            storage,
            ingestor,
            jobs,
            config: Arc::new(config),
        })
    }

    /// Fails ingestions a previous process left running and finishes the
    /// chunk rewrites it left journaled.
    pub fn resume_interrupted(&self) -> Result<usize, StoreError> {
        let failed = self.ingestor.recover_interrupted()?;
        if failed > 0 {
            warn!("{} interrupted ingestions marked failed, reparse to retry", failed);
        }
        let mut resumed = 0;
        for dataset in self.storage.database().list_datasets()? {
            match self.storage.resume_rewrites(dataset.id) {
                Ok(count) => resumed += count,
                Err(e) => warn!("Could not resume rewrites of dataset {}: {}", dataset.id, e),
            }
        }
        if resumed > 0 {
            info!("Resumed {} interrupted rewrites", resumed);
        }
        Ok(resumed)
    }
}
