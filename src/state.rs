//! # Application State
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## Ownership Pattern:
//! Nothing in here is mutated after startup. The configuration is read-only, and
//! the two components with interior state (the engine pool behind the pipeline's
//! arbiter and the metrics registry) synchronize themselves. So the state is a
//! bundle of `Arc`s and clones cheaply for each worker thread; there is no
//! `Arc<RwLock<..>>` around any of it.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::metrics::MetricsRegistry;
use crate::pipeline::ChunkPipeline;

#[derive(Clone)]
pub struct AppState {
    /// Loaded once at startup
    pub config: Arc<AppConfig>,

    /// Validate → transcode → acquire slot → infer, shared by both transports
    pub pipeline: Arc<ChunkPipeline>,

    pub metrics: Arc<MetricsRegistry>,
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: Arc<ChunkPipeline>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            pipeline,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_pipeline, FakeEngine};

    #[test]
    fn test_state_shares_components() {
        let (pipeline, _arbiter, metrics) =
            test_pipeline(vec![Arc::new(FakeEngine::named("fake"))], 1024, None);
        let state = AppState::new(AppConfig::default(), Arc::new(pipeline), metrics.clone());
        let cloned = state.clone();

        assert!(Arc::ptr_eq(&state.metrics, &cloned.metrics));
        assert!(Arc::ptr_eq(&state.pipeline, &cloned.pipeline));
    }
}
