//! Process-wide registry of schedulers and caches.
//!
//! Call sites share one rate budget and one cache per logical name, so the
//! instances are owned by an explicitly constructed [`Services`] value rather
//! than by globals. Everything is built lazily on first access.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::info;

use crate::cache::TieredCache;
use crate::config::Config;
use crate::gateway::Gateway;
use crate::scheduler::RequestScheduler;
use crate::Result;

/// Lazily constructed shared scheduler and named caches.
#[derive(Debug)]
pub struct Services {
    config: Config,
    scheduler: OnceLock<Arc<RequestScheduler>>,
    caches: Mutex<HashMap<String, Arc<TieredCache>>>,
}

impl Services {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            scheduler: OnceLock::new(),
            caches: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared scheduler. Every successful call returns the same instance.
    pub fn scheduler(&self) -> Result<Arc<RequestScheduler>> {
        if let Some(scheduler) = self.scheduler.get() {
            return Ok(Arc::clone(scheduler));
        }
        let built = Arc::new(RequestScheduler::new(self.config.scheduler.clone())?);
        // a racing caller may have won; keep whichever landed first
        Ok(Arc::clone(self.scheduler.get_or_init(|| built)))
    }

    /// The cache named `name`, backed by files under `<cache dir>/<name>`.
    ///
    /// The first access opens the directory and starts the periodic sweep,
    /// so it must happen inside a tokio runtime.
    pub fn cache(&self, name: &str) -> Result<Arc<TieredCache>> {
        let mut caches = self.caches.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cache) = caches.get(name) {
            return Ok(Arc::clone(cache));
        }

        let cache = Arc::new(TieredCache::open(name, self.config.cache.clone())?);
        cache.spawn_sweeper();
        info!(cache = name, dir = %self.config.cache.dir.display(), "opened cache");
        caches.insert(name.to_string(), Arc::clone(&cache));
        Ok(cache)
    }

    /// A [`Gateway`] over the shared scheduler and the cache named `cache_name`.
    pub fn gateway(&self, cache_name: &str) -> Result<Gateway> {
        Ok(Gateway::new(self.scheduler()?, self.cache(cache_name)?))
    }
}
