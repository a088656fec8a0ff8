//! # Audio Primitives
//!
//! Process-wide audio format constants and the PCM sample buffer type used at
//! the boundary between the session handler, the codec and the wire protocol.
//!
//! Every device on the fleet speaks the same format: 24 kHz mono float32,
//! chunked into 80 ms frames. The constants here are the single source of
//! truth; the values surfaced in `AppConfig::audio` default to them.

pub mod codec;

pub use codec::{CodecFactory, PassthroughCodec, StreamDecoder, StreamEncoder};

/// Canonical sample rate for all device sessions (Hz).
pub const SAMPLE_RATE: u32 = 24_000;

/// Samples per audio frame (80 ms at 24 kHz).
pub const SAMPLES_PER_FRAME: usize = 1_920;

/// A buffer of PCM samples in one of the formats a session handler may emit.
///
/// Handlers are allowed to produce either 16-bit integer or float32 samples;
/// everything past the handler boundary (codec, wire) works in float32, so
/// the conversion happens exactly once, in `into_f32`.
#[derive(Debug, Clone, PartialEq)]
pub enum PcmBuffer {
    /// Signed 16-bit samples, converted by scaling into [-1.0, 1.0]
    I16(Vec<i16>),
    /// Already-canonical float32 samples
    F32(Vec<f32>),
}

impl PcmBuffer {
    /// Number of samples in the buffer regardless of format.
    pub fn len(&self) -> usize {
        match self {
            PcmBuffer::I16(samples) => samples.len(),
            PcmBuffer::F32(samples) => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert to canonical float32 samples.
    ///
    /// i16 samples are scaled by 1/32768 so that i16::MIN maps to -1.0; f32
    /// samples pass through untouched.
    pub fn into_f32(self) -> Vec<f32> {
        match self {
            PcmBuffer::I16(samples) => samples
                .into_iter()
                .map(|s| f32::from(s) / 32_768.0)
                .collect(),
            PcmBuffer::F32(samples) => samples,
        }
    }
}
