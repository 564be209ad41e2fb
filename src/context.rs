use crate::config::AppConfig;
use crate::core::DataStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub store: DataStore,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let store = DataStore::new(config.data_dir.clone());
        Self {
            config: Arc::new(config),
            store,
        }
    }
}
