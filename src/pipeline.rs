//! # Chunk Pipeline
//!
//! One invocation turns one [`AudioChunk`] into one [`TranscriptResult`]:
//!
//! 1. **Validate**: empty or oversized input is rejected before anything else
//! 2. **Transcode**: the converter produces canonical PCM
//! 3. **Acquire**: wait (bounded) for an engine slot from the arbiter
//! 4. **Infer**: run the engine on the blocking pool while holding the slot
//! 5. **Release**: the slot goes back when inference ends, whatever the outcome
//! 6. **Assemble**: tidy the segments into the caller-facing result
//! 7. **Record**: one request count, one duration sample, and on failure one
//!    error count, no matter where the invocation stopped
//!
//! Both transports (HTTP uploads and WebSocket frames) go through here, so the
//! metrics and error behaviour are identical for both.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audio::Transcoder;
use crate::error::{InferenceError, PipelineError, ValidationError};
use crate::metrics::MetricsRegistry;
use crate::models::{AudioChunk, SessionConfig, TranscriptResult, Transport};
use crate::transcription::EngineArbiter;

/// Fixed inputs the pipeline reads from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_upload_bytes: usize,
    /// `None` waits for a slot indefinitely
    pub slot_wait: Option<Duration>,
    /// Process-wide fallbacks for unset session fields
    pub defaults: SessionConfig,
}

pub struct ChunkPipeline {
    transcoder: Arc<dyn Transcoder>,
    arbiter: Arc<EngineArbiter>,
    metrics: Arc<MetricsRegistry>,
    settings: PipelineSettings,
}

impl ChunkPipeline {
    pub fn new(
        transcoder: Arc<dyn Transcoder>,
        arbiter: Arc<EngineArbiter>,
        metrics: Arc<MetricsRegistry>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            transcoder,
            arbiter,
            metrics,
            settings,
        }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.settings.max_upload_bytes
    }

    pub fn arbiter(&self) -> &EngineArbiter {
        &self.arbiter
    }

    /// Run one chunk through the pipeline and record its outcome.
    ///
    /// Dropping the returned future (client went away) is safe at any point:
    /// scratch files are removed, a converter process is killed, and a held
    /// engine slot is released as soon as the model call it guards returns.
    pub async fn process(
        &self,
        chunk: AudioChunk,
        config: &SessionConfig,
        transport: Transport,
    ) -> Result<TranscriptResult, PipelineError> {
        self.metrics.record_request(transport);
        let outcome = OutcomeGuard::new(&self.metrics, transport);

        let result = self.run(chunk, config).await;
        match &result {
            Ok(transcript) => {
                info!(
                    "{} chunk transcribed: {:.2}s audio, {} segments, {:.2}s elapsed",
                    transport,
                    transcript.duration,
                    transcript.segments.len(),
                    outcome.elapsed().as_secs_f64()
                );
                outcome.succeed();
            }
            Err(PipelineError::Transcode(cause)) => {
                warn!(
                    "{} chunk failed (transcode/{}): {}",
                    transport,
                    cause.reason(),
                    cause
                );
                outcome.fail("transcode");
            }
            Err(err) => {
                warn!("{} chunk failed ({}): {}", transport, err.kind(), err);
                outcome.fail(err.kind());
            }
        }
        result
    }

    async fn run(
        &self,
        chunk: AudioChunk,
        config: &SessionConfig,
    ) -> Result<TranscriptResult, PipelineError> {
        let size = chunk.size();
        if size == 0 {
            return Err(ValidationError::Empty.into());
        }
        if size > self.settings.max_upload_bytes {
            return Err(ValidationError::TooLarge {
                size,
                max: self.settings.max_upload_bytes,
            }
            .into());
        }

        let pcm = self.transcoder.normalize(&chunk).await?;
        drop(chunk);
        let duration = pcm.duration_secs();
        debug!("Decoded {:.2}s of audio from {} bytes", duration, size);

        let resolved = config.or_defaults(&self.settings.defaults);
        let requested_language = resolved.language.clone();

        let waiting = Instant::now();
        let slot = self.arbiter.acquire(self.settings.slot_wait).await?;
        debug!(
            "Engine {} acquired after {}ms",
            slot.engine().name(),
            waiting.elapsed().as_millis()
        );

        // The slot moves into the blocking task so it is released when the
        // model call returns, even if this future has been dropped by then.
        let output = tokio::task::spawn_blocking(move || {
            let output = slot.engine().transcribe(&pcm, &resolved);
            drop(slot);
            output
        })
        .await
        .map_err(|e| InferenceError::Aborted(e.to_string()))??;

        let language = output
            .language
            .or(requested_language)
            .unwrap_or_else(|| "unknown".to_string());

        Ok(TranscriptResult::assemble(language, duration, output.segments))
    }
}

/// Records the duration sample (always) and the error count (on failure or
/// cancellation) for one invocation when dropped.
struct OutcomeGuard<'a> {
    metrics: &'a MetricsRegistry,
    transport: Transport,
    started: Instant,
    settled: bool,
}

impl<'a> OutcomeGuard<'a> {
    fn new(metrics: &'a MetricsRegistry, transport: Transport) -> Self {
        Self {
            metrics,
            transport,
            started: Instant::now(),
            settled: false,
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn succeed(mut self) {
        self.settled = true;
    }

    fn fail(mut self, kind: &str) {
        self.metrics.record_error(self.transport, kind);
        self.settled = true;
    }
}

impl Drop for OutcomeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.metrics.record_error(self.transport, "cancelled");
        }
        self.metrics.record_duration(self.transport, self.started.elapsed());
    }
}
