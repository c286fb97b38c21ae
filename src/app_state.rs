use std::sync::Arc;
use std::time::Duration;

use crate::models::job::KeyLayout;
use crate::services::{
    admin::JobAdmin, notifier::IngestionNotifier, queue::Queue, state::StateStore,
    storage::ObjectStore,
};

/// Tunables of the HTTP surface.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub layout: KeyLayout,
    pub record_ttl: Option<chrono::Duration>,
    pub upload_grant_ttl: Duration,
    pub download_grant_ttl: Duration,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            layout: KeyLayout::default(),
            record_ttl: Some(chrono::Duration::days(30)),
            upload_grant_ttl: Duration::from_secs(900),
            download_grant_ttl: Duration::from_secs(900),
        }
    }
}

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub state: Arc<dyn StateStore>,
    pub queue: Arc<dyn Queue>,
    pub objects: Arc<dyn ObjectStore>,
    pub notifier: Arc<IngestionNotifier>,
    pub admin: Arc<JobAdmin>,
    pub settings: Arc<ApiSettings>,
}

impl AppState {
    pub fn new(
        state: Arc<dyn StateStore>,
        queue: Arc<dyn Queue>,
        objects: Arc<dyn ObjectStore>,
        settings: ApiSettings,
    ) -> Self {
        let notifier = IngestionNotifier::new(
            state.clone(),
            queue.clone(),
            settings.layout.clone(),
            settings.record_ttl,
        );
        let admin = JobAdmin::new(
            state.clone(),
            queue.clone(),
            settings.layout.clone(),
            settings.record_ttl,
        );
        Self {
            state,
            queue,
            objects,
            notifier: Arc::new(notifier),
            admin: Arc::new(admin),
            settings: Arc::new(settings),
        }
    }
}
