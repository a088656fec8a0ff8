//! # Codec Boundary
//!
//! The audio codec (compression between PCM and the wire format) is an
//! external component: this module only defines the capability traits the
//! connection layer programs against, plus a byte-level passthrough
//! implementation used when no real codec is wired in.
//!
//! Both directions are *streaming* and stateful - a decoder may buffer an
//! incomplete frame and return nothing, then return the accumulated samples
//! on a later call. Because of that statefulness, a connection must never
//! reuse codec state across transport sessions: `CodecFactory` hands out a
//! brand-new encoder/decoder pair for every successful connect.

use byteorder::{ByteOrder, LittleEndian};

/// Stateful PCM → compressed-frame encoder for one outbound stream.
pub trait StreamEncoder: Send {
    /// Feed PCM samples; returns zero or more compressed bytes ready to ship.
    ///
    /// An empty return is normal - the encoder may be accumulating a frame.
    fn encode(&mut self, pcm: &[f32]) -> Vec<u8>;
}

/// Stateful compressed-frame → PCM decoder for one inbound stream.
pub trait StreamDecoder: Send {
    /// Feed compressed bytes; returns zero or more decoded PCM samples.
    ///
    /// An empty return is normal - the decoder may need more bytes before it
    /// can produce samples.
    fn decode(&mut self, frame: &[u8]) -> Vec<f32>;
}

/// Produces a fresh encoder/decoder pair per transport session.
pub trait CodecFactory: Send + Sync {
    fn new_encoder(&self) -> Box<dyn StreamEncoder>;
    fn new_decoder(&self) -> Box<dyn StreamDecoder>;
}

/// Uncompressed codec: raw little-endian float32 samples on the wire.
///
/// Stands in for the real compression stack during development and in tests,
/// in the same way the placeholder session handler stands in for the
/// inference engine. Wasteful on bandwidth but bit-exact.
#[derive(Debug, Clone, Default)]
pub struct PassthroughCodec;

struct PassthroughEncoder;
struct PassthroughDecoder {
    /// Carry-over for byte counts that don't fall on a sample boundary
    pending: Vec<u8>,
}

impl StreamEncoder for PassthroughEncoder {
    fn encode(&mut self, pcm: &[f32]) -> Vec<u8> {
        let mut bytes = vec![0u8; pcm.len() * 4];
        LittleEndian::write_f32_into(pcm, &mut bytes);
        bytes
    }
}

impl StreamDecoder for PassthroughDecoder {
    fn decode(&mut self, frame: &[u8]) -> Vec<f32> {
        self.pending.extend_from_slice(frame);

        let whole = self.pending.len() / 4 * 4;
        if whole == 0 {
            return Vec::new();
        }

        let mut samples = vec![0f32; whole / 4];
        LittleEndian::read_f32_into(&self.pending[..whole], &mut samples);
        self.pending.drain(..whole);
        samples
    }
}

impl CodecFactory for PassthroughCodec {
    fn new_encoder(&self) -> Box<dyn StreamEncoder> {
        Box::new(PassthroughEncoder)
    }

    fn new_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(PassthroughDecoder {
            pending: Vec::new(),
        })
    }
}
