use crate::cache::{CacheStore, GenerationSingleflight};
use crate::config::Config;
use crate::db::Database;
use crate::metrics::Metrics;
use std::sync::Arc;

/// Shared per-process dependencies, constructed once in `main` and handed to
/// every handler. Nothing here is a global; tests build their own.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub cache: CacheStore,
    pub singleflight: GenerationSingleflight,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(config: Config, db: Database, cache: CacheStore, metrics: Arc<Metrics>) -> Self {
        Self {
            config: Arc::new(config),
            db,
            cache,
            singleflight: GenerationSingleflight::new(),
            metrics,
        }
    }
}
