//! # Audio Module
//!
//! Everything between "bytes the client sent" and "samples the model reads":
//! - **pcm**: the canonical 16 kHz mono s16 buffer
//! - **transcoder**: the converter-process adapter that produces it

pub mod pcm;
pub mod transcoder;

pub use pcm::PcmBuffer;
pub use transcoder::{FfmpegTranscoder, Transcoder};
