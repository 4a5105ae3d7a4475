//! # Canonical PCM Buffer
//!
//! Every audio chunk is converted into this one representation before inference:
//! 16 kHz, mono, signed 16-bit samples.
//!
//! ## Audio Format:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers on the wire

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

pub const SAMPLE_RATE: u32 = 16_000;

/// Decoded audio owned by exactly one pipeline invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    samples: Vec<i16>,
}

impl PcmBuffer {
    #[cfg(test)]
    pub fn from_samples(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Parse raw s16le bytes, as written by the converter.
    ///
    /// A trailing odd byte (half a sample) is ignored.
    pub fn from_s16le(bytes: &[u8]) -> Self {
        let mut cursor = Cursor::new(bytes);
        let mut samples = Vec::with_capacity(bytes.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }
        Self { samples }
    }

    /// `seconds` of digital silence. Handy for warm-up runs and tests.
    pub fn silence(seconds: f64) -> Self {
        let count = (seconds * SAMPLE_RATE as f64).round() as usize;
        Self {
            samples: vec![0; count],
        }
    }

    #[cfg(test)]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / SAMPLE_RATE as f64
    }

    /// Convert to normalized f32 samples in `[-1.0, 1.0)`, the model's input form.
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples
            .iter()
            .map(|&sample| sample as f32 / 32768.0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_s16le() {
        let bytes = [0x01, 0x00, 0xff, 0x7f, 0x00, 0x80, 0x05];
        let pcm = PcmBuffer::from_s16le(&bytes);
        assert_eq!(pcm.samples(), &[1, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_duration() {
        let pcm = PcmBuffer::silence(3.0);
        assert_eq!(pcm.len(), 48_000);
        assert!((pcm.duration_secs() - 3.0).abs() < 1e-9);
        assert!(PcmBuffer::from_s16le(&[]).is_empty());
    }

    #[test]
    fn test_to_f32_range() {
        let pcm = PcmBuffer::from_samples(vec![0, 16384, -32768, 32767]);
        let floats = pcm.to_f32();
        assert_eq!(floats[0], 0.0);
        assert_eq!(floats[1], 0.5);
        assert_eq!(floats[2], -1.0);
        assert!(floats[3] < 1.0);
    }
}
