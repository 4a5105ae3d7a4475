//! Deterministic stand-ins for the converter and the speech model, used by unit
//! tests across the crate.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::{PcmBuffer, Transcoder};
use crate::error::{InferenceError, TranscodeError};
use crate::metrics::MetricsRegistry;
use crate::models::{AudioChunk, SessionConfig, TranscriptSegment};
use crate::pipeline::{ChunkPipeline, PipelineSettings};
use crate::transcription::engine::{EngineOutput, InferenceEngine};
use crate::transcription::EngineArbiter;

/// Encode samples as s16le bytes.
pub fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Reads every chunk as raw s16le PCM. Chunks starting with `BAD` are rejected
/// as undecodable.
#[derive(Default)]
pub struct FakeTranscoder {
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl FakeTranscoder {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Some(delay),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn normalize(&self, chunk: &AudioChunk) -> Result<PcmBuffer, TranscodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if chunk.data.starts_with(b"BAD") {
            return Err(TranscodeError::InvalidInput("not audio".to_string()));
        }
        let pcm = PcmBuffer::from_s16le(&chunk.data);
        if pcm.is_empty() {
            return Err(TranscodeError::InvalidInput("no samples".to_string()));
        }
        Ok(pcm)
    }
}

/// Produces one segment `"chunk <first sample>"` spanning the whole buffer,
/// or nothing for all-zero (silent) input. Tracks calls and overlap.
pub struct FakeEngine {
    name: String,
    delay: Duration,
    fail: bool,
    language: Option<String>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeEngine {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: Duration::ZERO,
            fail: false,
            language: Some("en".to_string()),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::named(name)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn without_language(mut self) -> Self {
        self.language = None;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous `transcribe` calls observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl InferenceEngine for FakeEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn transcribe(
        &self,
        pcm: &PcmBuffer,
        _config: &SessionConfig,
    ) -> Result<EngineOutput, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return Err(InferenceError::Failed("fake engine failure".to_string()));
        }

        let segments = match pcm.samples().iter().find(|s| **s != 0) {
            Some(_) => vec![TranscriptSegment {
                start: 0.0,
                end: pcm.duration_secs(),
                text: format!(" chunk {} ", pcm.samples()[0]),
            }],
            None => Vec::new(),
        };

        Ok(EngineOutput {
            language: self.language.clone(),
            segments,
        })
    }
}

pub fn test_pipeline(
    engines: Vec<Arc<FakeEngine>>,
    max_upload_bytes: usize,
    slot_wait: Option<Duration>,
) -> (ChunkPipeline, Arc<EngineArbiter>, Arc<MetricsRegistry>) {
    test_pipeline_with(
        Arc::new(FakeTranscoder::default()),
        engines,
        max_upload_bytes,
        slot_wait,
    )
}

pub fn test_pipeline_with(
    transcoder: Arc<dyn Transcoder>,
    engines: Vec<Arc<FakeEngine>>,
    max_upload_bytes: usize,
    slot_wait: Option<Duration>,
) -> (ChunkPipeline, Arc<EngineArbiter>, Arc<MetricsRegistry>) {
    let engines: Vec<Arc<dyn InferenceEngine>> = engines
        .into_iter()
        .map(|e| e as Arc<dyn InferenceEngine>)
        .collect();
    let arbiter = Arc::new(EngineArbiter::new(engines));
    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let pipeline = ChunkPipeline::new(
        transcoder,
        arbiter.clone(),
        metrics.clone(),
        PipelineSettings {
            max_upload_bytes,
            slot_wait,
            defaults: SessionConfig::default(),
        },
    );
    (pipeline, arbiter, metrics)
}
