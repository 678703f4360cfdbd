//! Engine wrapper that consults the message cache first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::store::{CacheStore, ModelInfo};
use crate::engine::{Attributed, Engine, EngineFactory, GenerationError};

/// Serves repeated `(model, diff)` requests from a [`CacheStore`] and only
/// builds the underlying engine on the first miss.
///
/// The engine is constructed at most once per client; later misses reuse it.
/// Failed generations are never cached. A message is stored under the model
/// that produced it, which for the daemon client may differ from `model`.
pub struct CachingClient {
    store: Option<CacheStore>,
    model: String,
    factory: EngineFactory,
    engine: Mutex<Option<Arc<dyn Engine>>>,
    load_time: Mutex<Option<Duration>>,
    config_snapshot: serde_json::Value,
}

impl CachingClient {
    pub fn new(store: CacheStore, model: impl Into<String>, factory: EngineFactory) -> Self {
        Self {
            store: Some(store),
            model: model.into(),
            factory,
            engine: Mutex::new(None),
            load_time: Mutex::new(None),
            config_snapshot: serde_json::Value::Null,
        }
    }

    /// A client that always goes to the engine.
    pub fn uncached(model: impl Into<String>, factory: EngineFactory) -> Self {
        Self {
            store: None,
            model: model.into(),
            factory,
            engine: Mutex::new(None),
            load_time: Mutex::new(None),
            config_snapshot: serde_json::Value::Null,
        }
    }

    /// Configuration recorded in the model info file when the engine loads.
    pub fn with_config_snapshot(mut self, config: serde_json::Value) -> Self {
        self.config_snapshot = config;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether the engine has been built yet.
    pub fn engine_loaded(&self) -> bool {
        self.engine.lock().is_some()
    }

    /// How long building the engine took, once it has been built.
    pub fn engine_load_time(&self) -> Option<Duration> {
        *self.load_time.lock()
    }

    pub fn generate(&self, diff: &str) -> Result<String, GenerationError> {
        if let Some(store) = &self.store
            && let Some(cached) = store.get(diff, &self.model)
        {
            info!(model = %self.model, "Using cached commit message");
            return Ok(cached);
        }

        let engine = self.engine()?;
        let Attributed { message, model } = engine.generate_attributed(diff)?;

        let source = model.as_deref().unwrap_or(&self.model);
        if source != self.model {
            warn!(
                requested = %self.model,
                served = %source,
                "Message came from a different model; caching it under that model"
            );
        }
        if let Some(store) = &self.store
            && let Err(e) = store.put(diff, source, &message)
        {
            warn!(error = %e, "Failed to cache generated message");
        }
        Ok(message)
    }

    fn engine(&self) -> Result<Arc<dyn Engine>, GenerationError> {
        let mut slot = self.engine.lock();
        if let Some(engine) = slot.as_ref() {
            return Ok(Arc::clone(engine));
        }

        if let Some(store) = &self.store
            && store.get_model_info(&self.model).is_some()
        {
            debug!(model = %self.model, "Model info cached from a previous load");
        }

        let start = Instant::now();
        let engine: Arc<dyn Engine> = Arc::from((self.factory)()?);
        let elapsed = start.elapsed();
        *self.load_time.lock() = Some(elapsed);
        info!(
            model = %self.model,
            engine = engine.id(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Engine loaded"
        );

        if let Some(store) = &self.store
            && let Err(e) =
                store.put_model_info(&self.model, &ModelInfo::now(self.config_snapshot.clone()))
        {
            debug!(error = %e, "Failed to record model info");
        }

        *slot = Some(Arc::clone(&engine));
        Ok(engine)
    }
}
