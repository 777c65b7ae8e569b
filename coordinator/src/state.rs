// coordinator/src/state.rs

use std::sync::Arc;

use crate::actor::CoordinatorHandle;
use crate::config::StorageUrls;
use crate::records::TaskRecords;

/// Estado compartido por los handlers HTTP. Todo lo mutable vive en el
/// actor; acá solo hay handles.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: CoordinatorHandle,
    pub records: Arc<dyn TaskRecords>,
    // secreto que deben presentar los workers en `x-secret`
    pub worker_secret: Arc<str>,
    pub urls: Arc<StorageUrls>,
}

impl AppState {
    pub fn new(
        coordinator: CoordinatorHandle,
        records: Arc<dyn TaskRecords>,
        worker_secret: impl Into<Arc<str>>,
        urls: StorageUrls,
    ) -> Self {
        Self {
            coordinator,
            records,
            worker_secret: worker_secret.into(),
            urls: Arc::new(urls),
        }
    }
}
