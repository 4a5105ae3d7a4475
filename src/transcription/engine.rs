//! # Inference Engine Handle
//!
//! The capability interface every speech model backend implements, plus the
//! startup routine that builds the fixed pool of instances handed to the
//! [`EngineArbiter`](super::arbiter::EngineArbiter).
//!
//! ## Threading Contract:
//! `transcribe` is synchronous and may take seconds of CPU/GPU time, so callers
//! run it on the blocking thread pool. An instance is never called by more than
//! one caller at a time; the arbiter guarantees that, so backends do not need to
//! be internally concurrent.

use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::audio::PcmBuffer;
use crate::config::AppConfig;
use crate::error::InferenceError;
use crate::models::{SessionConfig, TranscriptSegment};
use crate::transcription::model::WhisperModel;

/// Raw output of one model call, before the pipeline tidies it up.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    /// Language the model reports (detected or forced), if it reports one
    pub language: Option<String>,
    pub segments: Vec<TranscriptSegment>,
}

pub trait InferenceEngine: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Transcribe canonical PCM into time-stamped segments.
    fn transcribe(
        &self,
        pcm: &PcmBuffer,
        config: &SessionConfig,
    ) -> Result<EngineOutput, InferenceError>;
}

/// Load `engine.pool_size` independent model instances.
///
/// Each instance holds its own copy of the weights, so memory grows linearly
/// with the pool size. Weights are downloaded once and then read from the
/// local hub cache for the remaining instances.
pub async fn load_engine_pool(config: &AppConfig) -> anyhow::Result<Vec<Arc<dyn InferenceEngine>>> {
    let pool_size = config.engine.pool_size;
    let start = Instant::now();
    let mut engines: Vec<Arc<dyn InferenceEngine>> = Vec::with_capacity(pool_size);

    for index in 0..pool_size {
        info!(
            "Loading engine {}/{} (model '{}', compute type '{}')",
            index + 1,
            pool_size,
            config.models.whisper_model,
            config.models.compute_type
        );
        let model = WhisperModel::load(&config.models, index).await?;
        engines.push(Arc::new(model));
    }

    info!(
        "Engine pool of {} ready in {:.2}s",
        engines.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(engines)
}
