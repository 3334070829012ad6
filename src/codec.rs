//! PCM16 frame conversions
//!
//! Capture blocks arrive as `f32` samples in `[-1.0, 1.0]`; the agent speaks
//! signed 16-bit little-endian mono in both directions.

use tracing::warn;

/// Bytes per wire sample.
pub const SAMPLE_WIDTH: usize = 2;

/// Convert one float sample to PCM16. Negative values scale by 32768 and
/// non-negative by 32767 so +1.0 never overflows.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Encode a capture block as little-endian PCM16 bytes.
pub fn encode_block(block: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(block.len() * SAMPLE_WIDTH);
    for &sample in block {
        out.extend_from_slice(&f32_to_i16(sample).to_le_bytes());
    }
    out
}

/// Decode a little-endian PCM16 chunk into float samples.
///
/// A trailing odd byte cannot form a sample and is dropped.
pub fn decode_chunk(bytes: &[u8]) -> Vec<f32> {
    if bytes.len() % SAMPLE_WIDTH != 0 {
        warn!(bytes = bytes.len(), "PCM16 chunk has a dangling byte, dropping it");
    }
    bytes
        .chunks_exact(SAMPLE_WIDTH)
        .map(|pair| i16_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}
