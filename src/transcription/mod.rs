//! # Transcription Module
//!
//! Speech-to-text inference and the concurrency control around it.
//!
//! ## Key Components:
//! - **engine**: the `InferenceEngine` capability trait and pool construction
//! - **model**: Whisper via Candle-rs, the production engine
//! - **arbiter**: FIFO-fair, bounded access to the engine pool
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest but least accurate
//! - **base**: ~74MB, good balance for development
//! - **small**: ~244MB, better accuracy
//! - **medium**: ~769MB, good technical vocabulary
//! - **large**: ~1550MB, best accuracy but slowest
//!
//! The `.en` variants are English-only and skip language detection.

pub mod arbiter;
pub mod engine;
pub mod model;

pub use arbiter::EngineArbiter;
pub use engine::load_engine_pool;
