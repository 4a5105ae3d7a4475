//! # Whisper Model Backend
//!
//! Candle-rs implementation of [`InferenceEngine`]. Weights, config and tokenizer
//! are fetched from the HuggingFace hub (and cached locally) when an instance is
//! constructed, which is slow and memory heavy: build instances once at startup.
//!
//! ## Decoding Process:
//! 1. PCM → log-mel spectrogram (`candle_transformers` audio helpers)
//! 2. Language: forced from the session, or detected from the first window
//! 3. Audio is cut into 30 second windows; each is encoded and greedily decoded
//!    with timestamp tokens
//! 4. Windows the model considers silent are skipped; the rest are split into
//!    phrase segments at the timestamp pairs the decoder emitted

use anyhow::anyhow;
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::{ops::softmax, VarBuilder};
use candle_transformers::models::whisper::{self as m, audio, Config};
use hf_hub::{api::tokio::ApiBuilder, Repo, RepoType};
use std::sync::Mutex;
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::audio::PcmBuffer;
use crate::config::ModelsConfig;
use crate::device::{create_device_from_string, ComputePrecision, DeviceManager};
use crate::error::InferenceError;
use crate::models::{SessionConfig, TranscriptSegment};
use crate::transcription::engine::{EngineOutput, InferenceEngine};

/// Language codes in Whisper's token order. Only codes the loaded tokenizer
/// knows are used.
const LANGUAGES: [&str; 100] = [
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv", "it",
    "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no", "th", "ur",
    "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr", "az", "sl", "kn",
    "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw", "gl", "mr", "pa", "si",
    "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu", "am", "yi", "lo", "uz", "fo",
    "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl", "mg", "as", "tt", "haw", "ln", "ha",
    "ba", "jw", "su", "yue",
];

const N_FFT: usize = 400;

/// Timestamp tokens advance in 20 ms steps from `<|0.00|>`.
const TIMESTAMP_STEP_SECS: f64 = 0.02;

/// The first timestamp of a window may be at most 1 s in.
const MAX_INITIAL_TIMESTAMP_STEPS: usize = 50;

/// Supported Whisper checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WhisperVariant {
    Tiny,
    TinyEn,
    Base,
    BaseEn,
    Small,
    SmallEn,
    Medium,
    MediumEn,
    Large,
    LargeV2,
    LargeV3,
}

impl WhisperVariant {
    /// HuggingFace repository and revision holding safetensors weights.
    pub fn repo_and_revision(&self) -> (&'static str, &'static str) {
        match self {
            WhisperVariant::Tiny => ("openai/whisper-tiny", "main"),
            WhisperVariant::TinyEn => ("openai/whisper-tiny.en", "refs/pr/15"),
            WhisperVariant::Base => ("openai/whisper-base", "refs/pr/22"),
            WhisperVariant::BaseEn => ("openai/whisper-base.en", "refs/pr/13"),
            WhisperVariant::Small => ("openai/whisper-small", "main"),
            WhisperVariant::SmallEn => ("openai/whisper-small.en", "refs/pr/10"),
            WhisperVariant::Medium => ("openai/whisper-medium", "main"),
            WhisperVariant::MediumEn => ("openai/whisper-medium.en", "main"),
            WhisperVariant::Large => ("openai/whisper-large", "refs/pr/36"),
            WhisperVariant::LargeV2 => ("openai/whisper-large-v2", "refs/pr/57"),
            WhisperVariant::LargeV3 => ("openai/whisper-large-v3", "main"),
        }
    }

    pub fn is_multilingual(&self) -> bool {
        !matches!(
            self,
            WhisperVariant::TinyEn
                | WhisperVariant::BaseEn
                | WhisperVariant::SmallEn
                | WhisperVariant::MediumEn
        )
    }
}

impl std::str::FromStr for WhisperVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tiny" => Ok(WhisperVariant::Tiny),
            "tiny.en" => Ok(WhisperVariant::TinyEn),
            "base" => Ok(WhisperVariant::Base),
            "base.en" => Ok(WhisperVariant::BaseEn),
            "small" => Ok(WhisperVariant::Small),
            "small.en" => Ok(WhisperVariant::SmallEn),
            "medium" => Ok(WhisperVariant::Medium),
            "medium.en" => Ok(WhisperVariant::MediumEn),
            "large" => Ok(WhisperVariant::Large),
            "large-v2" => Ok(WhisperVariant::LargeV2),
            "large-v3" => Ok(WhisperVariant::LargeV3),
            _ => Err(anyhow!("Unknown whisper model: {}", s)),
        }
    }
}

impl std::fmt::Display for WhisperVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WhisperVariant::Tiny => "tiny",
            WhisperVariant::TinyEn => "tiny.en",
            WhisperVariant::Base => "base",
            WhisperVariant::BaseEn => "base.en",
            WhisperVariant::Small => "small",
            WhisperVariant::SmallEn => "small.en",
            WhisperVariant::Medium => "medium",
            WhisperVariant::MediumEn => "medium.en",
            WhisperVariant::Large => "large",
            WhisperVariant::LargeV2 => "large-v2",
            WhisperVariant::LargeV3 => "large-v3",
        };
        write!(f, "{}", name)
    }
}

/// Control token ids looked up from the tokenizer.
#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
    sot_prev: Option<u32>,
    no_speech: Option<u32>,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer) -> anyhow::Result<Self> {
        let required = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("tokenizer has no '{}' token", token))
        };

        Ok(Self {
            sot: required(m::SOT_TOKEN)?,
            eot: required(m::EOT_TOKEN)?,
            transcribe: required(m::TRANSCRIBE_TOKEN)?,
            no_timestamps: required(m::NO_TIMESTAMPS_TOKEN)?,
            sot_prev: tokenizer.token_to_id("<|startofprev|>"),
            no_speech: m::NO_SPEECH_TOKENS
                .iter()
                .find_map(|token| tokenizer.token_to_id(token)),
        })
    }
}

impl SpecialTokens {
    /// `<|0.00|>` directly follows `<|notimestamps|>` in every Whisper vocabulary.
    fn timestamp_begin(&self) -> u32 {
        self.no_timestamps + 1
    }

    fn timestamp_rules(&self) -> TimestampRules {
        TimestampRules {
            eot: self.eot,
            no_timestamps: self.no_timestamps,
            timestamp_begin: self.timestamp_begin(),
        }
    }
}

/// Outcome of greedy decoding for one 30 second window.
#[derive(Debug)]
struct WindowDecode {
    /// Generated tokens, text and timestamps interleaved
    tokens: Vec<u32>,
    avg_logprob: f64,
    no_speech_prob: f64,
}

/// Constraints on where timestamp tokens may appear, applied to each decoding
/// step's logits:
/// - the first token is a timestamp no later than 1 s
/// - timestamps come in pairs (end of one phrase, start of the next), except
///   right before the end of text
/// - timestamps never go backwards
/// - when the timestamps together outweigh every single text token, one of them
///   is emitted
#[derive(Debug, Clone, Copy)]
struct TimestampRules {
    eot: u32,
    no_timestamps: u32,
    timestamp_begin: u32,
}

impl TimestampRules {
    fn apply(&self, logits: &mut [f32], generated: &[u32]) {
        let begin = self.timestamp_begin as usize;
        let eot = self.eot as usize;
        if begin >= logits.len() || eot >= begin {
            return;
        }
        let is_timestamp = |token: u32| token >= self.timestamp_begin;

        if let Some(slot) = logits.get_mut(self.no_timestamps as usize) {
            *slot = f32::NEG_INFINITY;
        }

        if generated.is_empty() {
            logits[..begin].fill(f32::NEG_INFINITY);
            let latest = begin + MAX_INITIAL_TIMESTAMP_STEPS + 1;
            if latest < logits.len() {
                logits[latest..].fill(f32::NEG_INFINITY);
            }
            return;
        }

        let last_was_timestamp = generated.last().is_some_and(|&t| is_timestamp(t));
        let penultimate_was_timestamp =
            generated.len() < 2 || is_timestamp(generated[generated.len() - 2]);

        if last_was_timestamp {
            if penultimate_was_timestamp {
                logits[begin..].fill(f32::NEG_INFINITY);
            } else {
                logits[..eot].fill(f32::NEG_INFINITY);
            }
        }

        if let Some(&last) = generated.iter().rev().find(|&&t| is_timestamp(t)) {
            let floor = if last_was_timestamp && !penultimate_was_timestamp {
                last as usize
            } else {
                last as usize + 1
            };
            let len = logits.len();
            logits[begin..floor.min(len)].fill(f32::NEG_INFINITY);
        }

        let Some(log_probs) = log_softmax(logits) else {
            return;
        };
        let timestamp_mass = log_sum_exp(&log_probs[begin..]);
        let best_text = log_probs[..begin]
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        if timestamp_mass > best_text {
            logits[..begin].fill(f32::NEG_INFINITY);
        }
    }
}

fn log_sum_exp(values: &[f32]) -> f32 {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f32>().ln()
}

/// `None` when every entry is `-inf`.
fn log_softmax(logits: &[f32]) -> Option<Vec<f32>> {
    let norm = log_sum_exp(logits);
    if norm == f32::NEG_INFINITY {
        return None;
    }
    Some(logits.iter().map(|v| v - norm).collect())
}

/// One phrase cut out of a window's token stream, times in absolute seconds.
#[derive(Debug, Clone, PartialEq)]
struct TimedTokens {
    start: f64,
    end: f64,
    tokens: Vec<u32>,
}

/// Split decoded tokens into phrases at timestamp tokens.
///
/// `<|a|> text <|b|>` becomes one phrase from `a` to `b`. Text before the first
/// timestamp starts at the window start; text left open at the end runs to
/// `window_end`.
fn split_at_timestamps(
    tokens: &[u32],
    timestamp_begin: u32,
    window_start: f64,
    window_end: f64,
) -> Vec<TimedTokens> {
    let mut phrases = Vec::new();
    let mut start: Option<f64> = None;
    let mut last_end = window_start;
    let mut text = Vec::new();

    for &token in tokens {
        if token < timestamp_begin {
            text.push(token);
            continue;
        }

        let at = window_start + (token - timestamp_begin) as f64 * TIMESTAMP_STEP_SECS;
        let at = at.min(window_end);
        if text.is_empty() {
            start = Some(at);
        } else {
            phrases.push(TimedTokens {
                start: start.unwrap_or(last_end),
                end: at,
                tokens: std::mem::take(&mut text),
            });
            start = None;
            last_end = at;
        }
    }

    if !text.is_empty() {
        phrases.push(TimedTokens {
            start: start.unwrap_or(last_end),
            end: window_end,
            tokens: text,
        });
    }
    phrases
}

/// A loaded Whisper model, one member of the engine pool.
///
/// ## Thread Safety:
/// The candle encoder/decoder keep attention caches and need `&mut` access, so
/// the network sits behind a `Mutex`. The arbiter hands each instance to one
/// caller at a time, so the lock is never contended.
pub struct WhisperModel {
    name: String,
    variant: WhisperVariant,
    model: Mutex<m::model::Whisper>,
    config: Config,
    device: Device,
    dtype: DType,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    mel_filters: Vec<f32>,
    /// Additive logit mask, `-inf` for tokens the decoder must never emit
    suppress: Tensor,
    language_tokens: Vec<(&'static str, u32)>,
}

impl WhisperModel {
    /// Download (or reuse cached) weights and build a ready-to-use instance.
    ///
    /// `index` only distinguishes pool members in logs.
    pub async fn load(settings: &ModelsConfig, index: usize) -> anyhow::Result<Self> {
        let variant: WhisperVariant = settings.whisper_model.parse()?;
        let device = create_device_from_string(&settings.device);
        let dtype = ComputePrecision::from_setting(&settings.compute_type).dtype_for(&device);
        let start_time = Instant::now();

        let mut builder = ApiBuilder::new().with_progress(false);
        if let Ok(token) = std::env::var("HF_TOKEN") {
            builder = builder.with_token(Some(token));
        }
        if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
            builder = builder.with_cache_dir(cache_dir.into());
        } else if let Ok(hf_home) = std::env::var("HF_HOME") {
            builder = builder.with_cache_dir(std::path::PathBuf::from(hf_home).join("hub"));
        }
        let api = builder
            .build()
            .map_err(|e| anyhow!("Failed to initialize HuggingFace API: {}", e))?;

        let (repo_id, revision) = variant.repo_and_revision();
        let repo = api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        let config_path = repo
            .get("config.json")
            .await
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", repo_id, e))?;
        let tokenizer_path = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", repo_id, e))?;
        let weights_path = repo
            .get("model.safetensors")
            .await
            .map_err(|e| anyhow!("Failed to download model weights from {}: {}", repo_id, e))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_path)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let tokens = SpecialTokens::resolve(&tokenizer)?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let mask: Vec<f32> = (0..config.vocab_size as u32)
            .map(|id| {
                if config.suppress_tokens.contains(&id) {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
            .collect();
        let suppress = Tensor::new(mask.as_slice(), &device)?;

        let language_tokens = LANGUAGES
            .iter()
            .filter_map(|code| {
                tokenizer
                    .token_to_id(&format!("<|{}|>", code))
                    .map(|id| (*code, id))
            })
            .collect();

        let whisper = Self {
            name: format!("whisper-{}#{}", variant, index),
            variant,
            model: Mutex::new(model),
            mel_filters: mel_filter_bank(config.num_mel_bins),
            config,
            device,
            dtype,
            tokenizer,
            tokens,
            suppress,
            language_tokens,
        };

        // One second of silence exercises the whole path before serving traffic.
        whisper.transcribe(&PcmBuffer::silence(1.0), &SessionConfig::default())?;

        info!(
            "Whisper {} loaded as {} on {} ({:?}) in {:.2}s",
            variant,
            whisper.name,
            DeviceManager::describe(&whisper.device),
            dtype,
            start_time.elapsed().as_secs_f64()
        );

        Ok(whisper)
    }

    fn resolve_language(
        &self,
        model: &mut m::model::Whisper,
        mel: &Tensor,
        requested: Option<&str>,
    ) -> Result<(String, Option<u32>), InferenceError> {
        if !self.variant.is_multilingual() {
            if let Some(lang) = requested.filter(|lang| !lang.eq_ignore_ascii_case("en")) {
                warn!("Model {} is English-only; ignoring language '{}'", self.variant, lang);
            }
            return Ok(("en".to_string(), None));
        }

        if let Some(lang) = requested {
            let code = lang.to_lowercase();
            if let Some((_, id)) = self.language_tokens.iter().find(|(c, _)| *c == code) {
                return Ok((code, Some(*id)));
            }
            warn!("Unknown language '{}', detecting instead", lang);
        }

        self.detect_language(model, mel)
    }

    fn detect_language(
        &self,
        model: &mut m::model::Whisper,
        mel: &Tensor,
    ) -> Result<(String, Option<u32>), InferenceError> {
        if self.language_tokens.is_empty() {
            return Ok(("en".to_string(), None));
        }

        let (_, _, frames) = mel.dims3()?;
        let mel = mel.narrow(2, 0, usize::min(frames, m::N_FRAMES))?;
        let features = model.encoder.forward(&mel, true)?;

        let sot = Tensor::new(&[[self.tokens.sot]], &self.device)?;
        let ys = model.decoder.forward(&sot, &features, true)?;
        let logits = model
            .decoder
            .final_linear(&ys.i(..1)?)?
            .i(0)?
            .i(0)?
            .to_dtype(DType::F32)?;

        let ids: Vec<u32> = self.language_tokens.iter().map(|(_, id)| *id).collect();
        let ids = Tensor::new(ids.as_slice(), &self.device)?;
        let best = logits
            .index_select(&ids, 0)?
            .argmax(D::Minus1)?
            .to_scalar::<u32>()? as usize;

        let (code, id) = self
            .language_tokens
            .get(best)
            .copied()
            .ok_or_else(|| InferenceError::Failed("language detection out of range".to_string()))?;
        debug!("Detected language '{}'", code);
        Ok((code.to_string(), Some(id)))
    }

    /// Encode the initial prompt as previous-context tokens, keeping the tail
    /// that fits in half of the decoder context.
    fn prompt_tokens(&self, prompt: Option<&str>) -> Result<Vec<u32>, InferenceError> {
        let (Some(text), Some(_)) = (prompt, self.tokens.sot_prev) else {
            return Ok(Vec::new());
        };

        let encoding = self
            .tokenizer
            .encode(format!(" {}", text.trim()), false)
            .map_err(|e| InferenceError::Tokenizer(e.to_string()))?;
        let ids = encoding.get_ids();
        let keep = self.config.max_target_positions / 2 - 1;
        Ok(ids[ids.len().saturating_sub(keep)..].to_vec())
    }

    fn decode_window(
        &self,
        model: &mut m::model::Whisper,
        mel: &Tensor,
        prompt: &[u32],
        language_token: Option<u32>,
    ) -> Result<WindowDecode, InferenceError> {
        let features = model.encoder.forward(mel, true)?;

        let mut tokens: Vec<u32> = Vec::new();
        if let (Some(sot_prev), false) = (self.tokens.sot_prev, prompt.is_empty()) {
            tokens.push(sot_prev);
            tokens.extend_from_slice(prompt);
        }
        let sot_index = tokens.len();
        tokens.push(self.tokens.sot);
        if let Some(language) = language_token {
            tokens.push(language);
        }
        tokens.push(self.tokens.transcribe);
        let sample_begin = tokens.len();
        let rules = self.tokens.timestamp_rules();

        let max_len = self.config.max_target_positions;
        let mut sum_logprob = 0f64;
        let mut no_speech_prob = 0f64;

        for i in 0..max_len / 2 {
            if tokens.len() >= max_len {
                break;
            }

            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = model.decoder.forward(&tokens_t, &features, i == 0)?;

            if i == 0 {
                if let Some(no_speech) = self.tokens.no_speech {
                    let logits = model
                        .decoder
                        .final_linear(&ys.i(..1)?)?
                        .i(0)?
                        .i(sot_index)?
                        .to_dtype(DType::F32)?;
                    no_speech_prob = softmax(&logits, 0)?
                        .i(no_speech as usize)?
                        .to_scalar::<f32>()? as f64;
                }
            }

            let (_, seq_len, _) = ys.dims3()?;
            let mut logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .to_dtype(DType::F32)?
                .broadcast_add(&self.suppress)?
                .to_vec1::<f32>()?;
            rules.apply(&mut logits, &tokens[sample_begin..]);

            let Some(log_probs) = log_softmax(&logits) else {
                break;
            };
            let next = argmax(&log_probs);
            if next == self.tokens.eot {
                break;
            }
            if is_repetitive(&tokens[sample_begin..], next) {
                debug!("Stopping decode on repeated tokens");
                break;
            }

            sum_logprob += log_probs[next as usize] as f64;
            tokens.push(next);
        }

        let generated = tokens.split_off(sample_begin);
        Ok(WindowDecode {
            avg_logprob: sum_logprob / generated.len().max(1) as f64,
            tokens: generated,
            no_speech_prob,
        })
    }

    fn decode_tokens(&self, tokens: &[u32]) -> Result<String, InferenceError> {
        let text = self
            .tokenizer
            .decode(tokens, true)
            .map_err(|e| InferenceError::Tokenizer(e.to_string()))?;
        Ok(text.trim().to_string())
    }
}

impl InferenceEngine for WhisperModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn transcribe(
        &self,
        pcm: &PcmBuffer,
        config: &SessionConfig,
    ) -> Result<EngineOutput, InferenceError> {
        if pcm.is_empty() {
            return Ok(EngineOutput::default());
        }

        let started = Instant::now();
        let audio_secs = pcm.duration_secs();
        let samples = pcm.to_f32();

        let mel = audio::pcm_to_mel(&self.config, &samples, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let mel_len = mel.len();
        let mel = Tensor::from_vec(mel, (1, n_mels, mel_len / n_mels), &self.device)?
            .to_dtype(self.dtype)?;

        let mut model = self
            .model
            .lock()
            .map_err(|_| InferenceError::Failed("model state poisoned by an earlier panic".to_string()))?;

        let (language, language_token) =
            self.resolve_language(&mut model, &mel, config.language.as_deref())?;
        let prompt = self.prompt_tokens(config.initial_prompt.as_deref())?;

        let (_, _, content_frames) = mel.dims3()?;
        let mut segments = Vec::new();
        let mut seek = 0;

        while seek < content_frames {
            let start = (seek * m::HOP_LENGTH) as f64 / m::SAMPLE_RATE as f64;
            if start >= audio_secs {
                break;
            }

            let size = usize::min(content_frames - seek, m::N_FRAMES);
            let window = mel.narrow(2, seek, size)?;
            seek += size;
            let end = (seek * m::HOP_LENGTH) as f64 / m::SAMPLE_RATE as f64;

            let decoded = self.decode_window(&mut model, &window, &prompt, language_token)?;
            if decoded.no_speech_prob > m::NO_SPEECH_THRESHOLD
                && decoded.avg_logprob < m::LOGPROB_THRESHOLD
            {
                debug!(
                    "Skipping window at {:.1}s (no speech p={:.2})",
                    start, decoded.no_speech_prob
                );
                continue;
            }

            let window_end = end.min(audio_secs);
            for phrase in
                split_at_timestamps(&decoded.tokens, self.tokens.timestamp_begin(), start, window_end)
            {
                let text = self.decode_tokens(&phrase.tokens)?;
                if text.is_empty() {
                    continue;
                }
                segments.push(TranscriptSegment {
                    start: phrase.start,
                    end: phrase.end,
                    text,
                });
            }
        }

        debug!(
            "{} transcribed {:.2}s of audio into {} segments in {:.2}s",
            self.name,
            audio_secs,
            segments.len(),
            started.elapsed().as_secs_f64()
        );

        Ok(EngineOutput {
            language: Some(language),
            segments,
        })
    }
}

/// Index of the largest value; the lowest index wins ties.
fn argmax(values: &[f32]) -> u32 {
    let mut best = 0;
    for (index, value) in values.iter().enumerate() {
        if *value > values[best] {
            best = index;
        }
    }
    best as u32
}

/// Detect a decoder stuck in a loop: the same token three times in a row, or
/// the last three tokens repeating the three before them.
fn is_repetitive(tokens: &[u32], new_token: u32) -> bool {
    if tokens.len() < 6 {
        return false;
    }

    if tokens[tokens.len() - 3..] == [new_token, new_token, new_token] {
        return true;
    }

    let last_3 = &tokens[tokens.len() - 3..];
    let prev_3 = &tokens[tokens.len() - 6..tokens.len() - 3];
    last_3 == prev_3
}

fn hz_to_mel(hz: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;

    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / logstep
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;

    if mel >= min_log_mel {
        MIN_LOG_HZ * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * F_SP
    }
}

/// Slaney-normalized triangular mel filter bank for a 400-point FFT at 16 kHz,
/// laid out row-major as `[n_mels][N_FFT / 2 + 1]`.
fn mel_filter_bank(n_mels: usize) -> Vec<f32> {
    let n_bins = N_FFT / 2 + 1;
    let sample_rate = m::SAMPLE_RATE as f64;

    let mel_max = hz_to_mel(sample_rate / 2.0);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f64 / (n_mels + 1) as f64))
        .collect();
    let bin_freqs: Vec<f64> = (0..n_bins)
        .map(|k| k as f64 * sample_rate / N_FFT as f64)
        .collect();

    let mut filters = vec![0f32; n_mels * n_bins];
    for i in 0..n_mels {
        let (left, center, right) = (mel_points[i], mel_points[i + 1], mel_points[i + 2]);
        let norm = 2.0 / (right - left);
        for (k, &freq) in bin_freqs.iter().enumerate() {
            let lower = (freq - left) / (center - left);
            let upper = (right - freq) / (right - center);
            let weight = lower.min(upper).max(0.0);
            filters[i * n_bins + k] = (weight * norm) as f32;
        }
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_parsing() {
        assert_eq!("base.en".parse::<WhisperVariant>().unwrap(), WhisperVariant::BaseEn);
        assert_eq!("LARGE-V3".parse::<WhisperVariant>().unwrap(), WhisperVariant::LargeV3);
        assert!("huge".parse::<WhisperVariant>().is_err());
        assert_eq!(WhisperVariant::SmallEn.to_string(), "small.en");
    }

    #[test]
    fn test_multilingual_flag() {
        assert!(WhisperVariant::Base.is_multilingual());
        assert!(!WhisperVariant::BaseEn.is_multilingual());
        assert_eq!(WhisperVariant::Tiny.repo_and_revision().0, "openai/whisper-tiny");
    }

    #[test]
    fn test_mel_filter_bank_shape() {
        for n_mels in [80, 128] {
            let filters = mel_filter_bank(n_mels);
            assert_eq!(filters.len(), n_mels * (N_FFT / 2 + 1));
            assert!(filters.iter().all(|w| *w >= 0.0 && w.is_finite()));
            for row in filters.chunks(N_FFT / 2 + 1) {
                assert!(row.iter().any(|w| *w > 0.0));
            }
        }
    }

    #[test]
    fn test_mel_scale_round_trip() {
        for hz in [0.0, 440.0, 1000.0, 4000.0, 8000.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
    }

    #[test]
    fn test_split_at_timestamps_into_phrases() {
        // Timestamps start at id 100: <|0.00|> = 100, <|0.40|> = 120, <|1.00|> = 150.
        let tokens = [100, 1, 2, 120, 120, 3, 150];
        let phrases = split_at_timestamps(&tokens, 100, 30.0, 60.0);

        assert_eq!(phrases.len(), 2);
        assert_eq!(phrases[0].tokens, vec![1, 2]);
        assert!((phrases[0].start - 30.0).abs() < 1e-9);
        assert!((phrases[0].end - 30.4).abs() < 1e-9);
        assert_eq!(phrases[1].tokens, vec![3]);
        assert!((phrases[1].start - 30.4).abs() < 1e-9);
        assert!((phrases[1].end - 31.0).abs() < 1e-9);
    }

    #[test]
    fn test_split_at_timestamps_open_ends() {
        // Single timestamp between phrases, trailing text without a closing one.
        let phrases = split_at_timestamps(&[100, 4, 125, 5, 6], 100, 0.0, 12.5);
        assert_eq!(phrases.len(), 2);
        assert!((phrases[0].end - 0.5).abs() < 1e-9);
        assert!((phrases[1].start - 0.5).abs() < 1e-9);
        assert_eq!(phrases[1].end, 12.5);
        assert_eq!(phrases[1].tokens, vec![5, 6]);

        // No timestamps at all: the whole window is one phrase.
        let phrases = split_at_timestamps(&[7, 8], 100, 2.0, 4.0);
        assert_eq!(
            phrases,
            vec![TimedTokens { start: 2.0, end: 4.0, tokens: vec![7, 8] }]
        );

        assert!(split_at_timestamps(&[100, 110], 100, 0.0, 1.0).is_empty());
    }

    fn rules() -> TimestampRules {
        TimestampRules {
            eot: 5,
            no_timestamps: 9,
            timestamp_begin: 10,
        }
    }

    /// Text tokens strongly preferred so the probability-mass rule stays quiet.
    fn text_heavy_logits() -> Vec<f32> {
        let mut logits = vec![0.0f32; 20];
        logits[..10].fill(10.0);
        logits
    }

    #[test]
    fn test_first_token_must_be_early_timestamp() {
        let mut logits = text_heavy_logits();
        rules().apply(&mut logits, &[]);
        assert!(logits[..10].iter().all(|l| *l == f32::NEG_INFINITY));
        assert!(logits[10..].iter().all(|l| l.is_finite()));
    }

    #[test]
    fn test_timestamps_pair_and_never_go_backwards() {
        // After a text token, timestamps must move past the last one.
        let mut logits = text_heavy_logits();
        rules().apply(&mut logits, &[12, 2]);
        assert_eq!(logits[12], f32::NEG_INFINITY);
        assert!(logits[13].is_finite());
        assert_eq!(logits[9], f32::NEG_INFINITY);

        // A closing timestamp forces another timestamp (or end of text).
        let mut logits = text_heavy_logits();
        rules().apply(&mut logits, &[10, 2, 14]);
        assert!(logits[..5].iter().all(|l| *l == f32::NEG_INFINITY));
        assert_eq!(logits[13], f32::NEG_INFINITY);
        assert!(logits[14].is_finite());

        // A completed pair must be followed by text.
        let mut logits = text_heavy_logits();
        rules().apply(&mut logits, &[10, 2, 14, 14]);
        assert!(logits[10..].iter().all(|l| *l == f32::NEG_INFINITY));
        assert!(logits[3].is_finite());
    }

    #[test]
    fn test_timestamp_mass_beats_single_text_token() {
        let mut logits = vec![0.0f32; 20];
        logits[..10].fill(-5.0);
        logits[2] = 1.0;
        logits[10..].fill(0.5);
        rules().apply(&mut logits, &[10, 2]);
        assert!(logits[..10].iter().all(|l| *l == f32::NEG_INFINITY));
        assert_eq!(argmax(&logits), 11);
    }

    #[test]
    fn test_is_repetitive() {
        assert!(!is_repetitive(&[1, 2, 3], 3));
        assert!(is_repetitive(&[1, 2, 3, 7, 7, 7], 7));
        assert!(is_repetitive(&[4, 5, 6, 4, 5, 6], 9));
        assert!(!is_repetitive(&[1, 2, 3, 4, 5, 6], 7));
    }
}
