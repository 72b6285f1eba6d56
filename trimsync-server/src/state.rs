use std::sync::Arc;

use trimsync_core::engine::CredentialFactory;
use trimsync_core::export::ExportService;
use trimsync_core::monitor::SyncMonitor;
use trimsync_core::scheduler::SyncScheduler;
use trimsync_core::store::EventStore;
use trimsync_core::webhook::WebhookIngestor;
use trimsync_core::SyncEngine;

/// Shared application state wiring the engine and its collaborators.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<EventStore>,
    pub engine: Arc<SyncEngine>,
    pub monitor: Arc<SyncMonitor>,
    pub scheduler: Arc<SyncScheduler>,
    pub ingestor: Arc<WebhookIngestor>,
    pub exports: Arc<ExportService>,
    pub credentials: Arc<CredentialFactory>,
}

impl AppState {
    pub fn new() -> Self {
        let store = Arc::new(EventStore::new());
        let monitor = Arc::new(SyncMonitor::default());
        let credentials = Arc::new(CredentialFactory::new());
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            monitor.clone(),
            credentials.clone(),
        ));
        let scheduler = Arc::new(SyncScheduler::new(store.clone(), engine.clone()));
        let ingestor = Arc::new(WebhookIngestor::new(store.clone(), engine.clone()));
        let exports = Arc::new(ExportService::new(store.clone()));

        AppState {
            store,
            engine,
            monitor,
            scheduler,
            ingestor,
            exports,
            credentials,
        }
    }
}
