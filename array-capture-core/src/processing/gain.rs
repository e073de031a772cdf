//! In-place gain and peak metering over interleaved PCM bytes.
//!
//! Runs on the capture thread between the engine read and the ring
//! write, so it touches each sample exactly once and never allocates.

const I24_MAX: i32 = (1 << 23) - 1;
const I24_MIN: i32 = -(1 << 23);

/// Apply `gain` to little-endian 24-bit samples in place and return the
/// peak absolute level (0.0..=1.0). Trailing bytes beyond the last
/// whole sample are left untouched.
pub fn apply_gain_s24le(data: &mut [u8], gain: f32) -> f32 {
    let mut peak = 0i32;
    for sample in data.chunks_exact_mut(3) {
        let mut value = decode_s24le(sample);
        if gain != 1.0 {
            let scaled = (value as f64 * gain as f64).round() as i64;
            value = scaled.clamp(I24_MIN as i64, I24_MAX as i64) as i32;
            encode_s24le(sample, value);
        }
        peak = peak.max(value.unsigned_abs() as i32);
    }
    peak as f32 / (I24_MAX + 1) as f32
}

fn decode_s24le(bytes: &[u8]) -> i32 {
    let raw = u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16;
    // Sign-extend from bit 23.
    ((raw << 8) as i32) >> 8
}

fn encode_s24le(bytes: &mut [u8], value: i32) {
    let raw = value as u32;
    bytes[0] = raw as u8;
    bytes[1] = (raw >> 8) as u8;
    bytes[2] = (raw >> 16) as u8;
}
