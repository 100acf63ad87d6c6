use std::sync::Arc;

use tokio_rusqlite::Connection;

use crate::config::AppConfig;
use crate::core::{DriveRegistry, EventHub, JobStore, OutputResolver, PipelineExecutor};
use crate::metadata::{self, MetadataProvider};

/// Shared application state, cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
    pub registry: DriveRegistry,
    pub store: JobStore,
    pub resolver: OutputResolver,
    pub executor: PipelineExecutor,
    pub metadata: Option<Arc<dyn MetadataProvider>>,
}

impl AppContext {
    pub fn new(config: AppConfig, db: Connection) -> Self {
        let config = Arc::new(config);
        let store = JobStore::new(db.clone(), EventHub::new());
        let registry = DriveRegistry::new();
        let resolver = OutputResolver::new(&config);
        let executor = PipelineExecutor::new(
            config.clone(),
            registry.clone(),
            store.clone(),
            resolver.clone(),
        );
        let metadata = metadata::provider_from_key(config.omdb_api_key.as_ref());

        Self {
            config,
            db,
            registry,
            store,
            resolver,
            executor,
            metadata,
        }
    }
}
