use std::sync::Arc;

use tracing::info;

use crate::{
    cache::{CounterStore, MemoryCounterStore, RedisCounterStore},
    config::Config,
    realtime::Hub,
    store::Database,
    sync::SyncStats,
};

pub struct AppState {
    pub config: Config,
    pub cache: Arc<dyn CounterStore>,
    pub db: Database,
    pub hub: Hub,
    pub sync_stats: Arc<SyncStats>,
}

impl AppState {
    pub async fn new() -> Arc<Self> {
        Self::with_config(Config::load()).await
    }

    pub async fn with_config(config: Config) -> Arc<Self> {
        let cache: Arc<dyn CounterStore> = match &config.redis_url {
            Some(url) => {
                let store = RedisCounterStore::connect(url)
                    .await
                    .expect("Counter store misconfigured!");
                info!("Using shared counter store at {url}");
                Arc::new(store)
            }
            None => {
                info!("REDIS_URL not set, using in-process counters");
                Arc::new(MemoryCounterStore::new())
            }
        };

        let db = Database::connect(&config.database_url)
            .await
            .expect("Database misconfigured!");

        Arc::new(Self {
            config,
            cache,
            db,
            hub: Hub::new(),
            sync_stats: Arc::new(SyncStats::new()),
        })
    }

    /// Rebuilds the state around a replacement counter store, keeping the
    /// database and everything else.
    #[cfg(test)]
    pub fn for_tests(state: Arc<Self>, cache: Arc<dyn CounterStore>) -> Arc<Self> {
        let state = Arc::try_unwrap(state)
            .ok()
            .expect("state must have a single owner");
        Arc::new(Self { cache, ..state })
    }
}
