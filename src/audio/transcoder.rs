//! # Transcoder Adapter
//!
//! Turns whatever the client uploaded (webm/opus from browsers, ogg, mp3, m4a,
//! wav, raw PCM) into the canonical [`PcmBuffer`] by running an external
//! `ffmpeg` process.
//!
//! ## Resource Lifecycle:
//! Each call gets its own scratch directory holding the input and output files.
//! The directory is a `tempfile::TempDir`, so it is removed when the call
//! returns, fails, times out, or is cancelled by the caller dropping the future.
//! The child process is spawned with `kill_on_drop`, so a timed-out or cancelled
//! conversion never leaves a converter running.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::audio::pcm::{PcmBuffer, SAMPLE_RATE};
use crate::error::TranscodeError;
use crate::models::AudioChunk;

/// Content types browsers and recorders commonly send for audio.
pub const SUPPORTED_RAW_TYPES: [&str; 10] = [
    "audio/wav",
    "audio/x-wav",
    "audio/webm",
    "audio/ogg",
    "audio/mpeg",
    "audio/mp3",
    "audio/mp4",
    "audio/x-m4a",
    "audio/aac",
    "audio/flac",
];

/// Hints meaning "headerless s16le at 16 kHz mono"; nothing to probe.
const RAW_PCM_TYPES: [&str; 3] = ["audio/l16", "audio/pcm", "audio/x-raw"];

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Capability interface for audio normalization.
///
/// The pipeline only talks to this trait, so tests can swap in a deterministic
/// fake instead of spawning real converter processes.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Convert one encoded chunk into canonical PCM.
    ///
    /// The chunk's content-type is advisory; implementations must still try to
    /// decode when it is absent, generic or wrong.
    async fn normalize(&self, chunk: &AudioChunk) -> Result<PcmBuffer, TranscodeError>;
}

/// Lowercase a content type and drop its parameters.
///
/// `audio/webm;codecs=opus` becomes `audio/webm`.
pub fn normalize_content_type(content_type: Option<&str>) -> String {
    content_type
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Lenient check used only for logging: browsers send all sorts of values here.
pub fn content_type_ok(content_type: Option<&str>) -> bool {
    let ct = normalize_content_type(content_type);
    ct.is_empty()
        || ct.starts_with("audio/")
        || ct == "application/octet-stream"
        || SUPPORTED_RAW_TYPES.contains(&ct.as_str())
}

pub fn is_raw_pcm(content_type: Option<&str>) -> bool {
    RAW_PCM_TYPES.contains(&normalize_content_type(content_type).as_str())
}

/// Keep only short alphanumeric extensions; anything else is not worth
/// passing to the converter as a probe hint.
fn input_suffix(extension: Option<&str>) -> String {
    match extension.map(str::trim) {
        Some(ext) if !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            format!(".{}", ext.to_ascii_lowercase())
        }
        _ => String::new(),
    }
}

/// `ffmpeg`-backed [`Transcoder`].
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg_path: String,
    timeout: Duration,
    scratch_root: Option<PathBuf>,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            timeout,
            scratch_root: None,
        }
    }

    /// Create scratch directories under `root` instead of the system temp dir.
    #[cfg(test)]
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    /// Check that the converter binary can actually be executed.
    ///
    /// Called once at startup. An error here means the service must not start.
    pub async fn ensure_available(&self) -> Result<(), TranscodeError> {
        let probe = Command::new(&self.ffmpeg_path)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        let status = tokio::time::timeout(PROBE_TIMEOUT, probe)
            .await
            .map_err(|_| {
                TranscodeError::ConverterUnavailable(format!(
                    "'{} -version' did not finish within {:?}",
                    self.ffmpeg_path, PROBE_TIMEOUT
                ))
            })?
            .map_err(|e| self.spawn_error(e))?;

        if !status.success() {
            return Err(TranscodeError::ConverterUnavailable(format!(
                "'{} -version' exited with {}",
                self.ffmpeg_path, status
            )));
        }

        debug!("Audio converter '{}' is available", self.ffmpeg_path);
        Ok(())
    }

    fn spawn_error(&self, err: std::io::Error) -> TranscodeError {
        if err.kind() == std::io::ErrorKind::NotFound {
            TranscodeError::ConverterUnavailable(format!(
                "'{}' not found. Install ffmpeg and ensure it is on PATH",
                self.ffmpeg_path
            ))
        } else {
            TranscodeError::ConverterUnavailable(format!(
                "failed to run '{}': {}",
                self.ffmpeg_path, err
            ))
        }
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir, TranscodeError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("stt-");
        let dir = match &self.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        };
        dir.map_err(|e| TranscodeError::ConverterUnavailable(format!("cannot create scratch dir: {}", e)))
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn normalize(&self, chunk: &AudioChunk) -> Result<PcmBuffer, TranscodeError> {
        if chunk.data.is_empty() {
            return Err(TranscodeError::InvalidInput("empty input".to_string()));
        }

        let hint = chunk.mime_hint.as_deref();
        if !content_type_ok(hint) {
            warn!(
                "Suspicious content-type '{}'; attempting conversion anyway",
                normalize_content_type(hint)
            );
        }

        let scratch = self.scratch_dir()?;
        let input = scratch
            .path()
            .join(format!("input{}", input_suffix(chunk.extension.as_deref())));
        let output = scratch.path().join("output.pcm");

        tokio::fs::write(&input, &chunk.data)
            .await
            .map_err(|e| TranscodeError::InvalidInput(format!("cannot stage input: {}", e)))?;

        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-nostdin", "-hide_banner", "-loglevel", "error", "-y"]);
        if is_raw_pcm(hint) {
            cmd.args(["-f", "s16le", "-ar", "16000", "-ac", "1"]);
        }
        cmd.arg("-i")
            .arg(&input)
            .args(["-ar", "16000", "-ac", "1", "-f", "s16le", "-c:a", "pcm_s16le"])
            .arg(&output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        let result = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                warn!("Audio conversion exceeded {:?}; converter killed", self.timeout);
                TranscodeError::ConverterTimeout(self.timeout)
            })?
            .map_err(|e| TranscodeError::InvalidInput(format!("converter crashed: {}", e)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let detail = stderr.lines().last().unwrap_or("").trim();
            return Err(TranscodeError::InvalidInput(format!(
                "converter exited with {}: {}",
                result.status, detail
            )));
        }

        let bytes = tokio::fs::read(&output)
            .await
            .map_err(|e| TranscodeError::InvalidInput(format!("no converter output: {}", e)))?;
        let pcm = PcmBuffer::from_s16le(&bytes);

        if pcm.is_empty() {
            return Err(TranscodeError::InvalidInput(
                "no audio samples could be decoded".to_string(),
            ));
        }

        debug!(
            "Transcoded {} bytes into {} samples ({:.2}s at {} Hz)",
            chunk.size(),
            pcm.len(),
            pcm.duration_secs(),
            SAMPLE_RATE
        );

        Ok(pcm)
    }
}
