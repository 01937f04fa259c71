//! Float to network PCM conversion.
//!
//! Two wire formats are produced, both big-endian (network byte order):
//! - L16: scale by 32767, optional TPDF/RPDF dither of 1 LSB
//! - L24: scale by 8388607, packed MSB first (RFC 3190)
//!
//! Non-finite input is treated as silence so NaN/Inf never reach the wire.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{BitDepth, DitherMode, ProcessingConfig};
use crate::error::ConvertError;

const PCM16_SCALE: f32 = 32767.0;
const PCM16_MIN: f32 = -32768.0;
const PCM16_MAX: f32 = 32767.0;

const L24_SCALE: f32 = 8388607.0;
const L24_MIN: f32 = -8388608.0;
const L24_MAX: f32 = 8388607.0;

/// One 16-bit LSB in the float domain
const DITHER_LSB: f32 = 1.0 / 32768.0;

/// Width of the chunked (auto-vectorized) path
const LANES: usize = 8;

/// Converter settings (subset of the processing configuration)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvertConfig {
    pub dither: DitherMode,
    pub clip_protection: bool,
    pub use_acceleration: bool,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            dither: DitherMode::Tpdf,
            clip_protection: true,
            use_acceleration: true,
        }
    }
}

impl From<&ProcessingConfig> for ConvertConfig {
    fn from(p: &ProcessingConfig) -> Self {
        Self {
            dither: p.dither,
            clip_protection: p.clip_protection,
            use_acceleration: p.dsp_acceleration,
        }
    }
}

/// Linear congruential noise source for dithering.
///
/// Deterministic for a given seed so conversions can be reproduced.
#[derive(Debug, Clone)]
pub struct DitherRng {
    state: u32,
}

impl DitherRng {
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    /// Seed from the wall clock
    pub fn from_clock() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::new(now.subsec_micros() ^ now.as_secs() as u32)
    }

    /// Uniform value in [0, 1]
    fn next_unit(&mut self) -> f32 {
        self.state = self.state.wrapping_mul(1664525).wrapping_add(1013904223);
        (self.state >> 16) as f32 / 65535.0
    }

    /// Triangular noise in [-1, 1] LSB
    pub fn tpdf(&mut self) -> f32 {
        let a = self.next_unit();
        let b = self.next_unit();
        (a + b - 1.0) * DITHER_LSB
    }

    /// Rectangular noise in [-0.5, 0.5] LSB
    pub fn rpdf(&mut self) -> f32 {
        (self.next_unit() - 0.5) * DITHER_LSB
    }

    fn noise(&mut self, mode: DitherMode) -> f32 {
        match mode {
            DitherMode::None => 0.0,
            DitherMode::Tpdf => self.tpdf(),
            DitherMode::Rpdf => self.rpdf(),
        }
    }
}

/// Float to PCM converter. Only the dither RNG carries state.
#[derive(Debug, Clone)]
pub struct SampleConverter {
    config: ConvertConfig,
    rng: DitherRng,
}

impl SampleConverter {
    pub fn new(config: ConvertConfig) -> Self {
        Self {
            config,
            rng: DitherRng::from_clock(),
        }
    }

    /// Converter with a fixed dither seed
    pub fn with_seed(config: ConvertConfig, seed: u32) -> Self {
        Self {
            config,
            rng: DitherRng::new(seed),
        }
    }

    pub fn config(&self) -> ConvertConfig {
        self.config
    }

    /// Convert interleaved floats to L16 big-endian.
    ///
    /// Returns the number of bytes written (`samples.len() * 2`).
    pub fn float_to_pcm16(&mut self, samples: &[f32], output: &mut [u8]) -> Result<usize, ConvertError> {
        let needed = samples.len() * 2;
        check_output(needed, output.len())?;

        if self.config.use_acceleration && self.config.dither == DitherMode::None {
            convert_chunked(
                samples,
                &mut output[..needed],
                self.config.clip_protection,
                PCM16_SCALE,
                PCM16_MIN,
                PCM16_MAX,
                write_pcm16,
            );
            return Ok(needed);
        }

        for (sample, out) in samples.iter().zip(output.chunks_exact_mut(2)) {
            let mut value = prepare(*sample, self.config.clip_protection);
            value += self.rng.noise(self.config.dither);
            write_pcm16(quantize(value, PCM16_SCALE, PCM16_MIN, PCM16_MAX), out);
        }
        Ok(needed)
    }

    /// Convert interleaved floats to L24 big-endian.
    ///
    /// Returns the number of bytes written (`samples.len() * 3`).
    pub fn float_to_l24(&mut self, samples: &[f32], output: &mut [u8]) -> Result<usize, ConvertError> {
        let needed = samples.len() * 3;
        check_output(needed, output.len())?;

        if self.config.use_acceleration {
            convert_chunked(
                samples,
                &mut output[..needed],
                self.config.clip_protection,
                L24_SCALE,
                L24_MIN,
                L24_MAX,
                write_l24,
            );
            return Ok(needed);
        }

        for (sample, out) in samples.iter().zip(output.chunks_exact_mut(3)) {
            let value = prepare(*sample, self.config.clip_protection);
            write_l24(quantize(value, L24_SCALE, L24_MIN, L24_MAX), out);
        }
        Ok(needed)
    }

    /// Convert to whichever format `bit_depth` selects
    pub fn convert_block(
        &mut self,
        bit_depth: BitDepth,
        samples: &[f32],
        output: &mut [u8],
    ) -> Result<usize, ConvertError> {
        match bit_depth {
            BitDepth::Pcm16 => self.float_to_pcm16(samples, output),
            BitDepth::Pcm24 => self.float_to_l24(samples, output),
        }
    }
}

fn check_output(needed: usize, available: usize) -> Result<(), ConvertError> {
    if available < needed {
        Err(ConvertError::OutputTooSmall { needed, available })
    } else {
        Ok(())
    }
}

/// Replace non-finite input with silence and apply clip protection
#[inline]
fn prepare(sample: f32, clip: bool) -> f32 {
    if !sample.is_finite() {
        return 0.0;
    }
    if clip {
        sample.clamp(-1.0, 1.0)
    } else {
        sample
    }
}

/// Scale, round and clamp to the integer range. The clamp runs in float so
/// out-of-range input cannot overflow the integer cast.
#[inline]
fn quantize(value: f32, scale: f32, min: f32, max: f32) -> i32 {
    (value * scale).round().clamp(min, max) as i32
}

#[inline]
fn write_pcm16(value: i32, out: &mut [u8]) {
    out.copy_from_slice(&(value as i16).to_be_bytes());
}

#[inline]
fn write_l24(value: i32, out: &mut [u8]) {
    let u24 = (value as u32) & 0x00FF_FFFF;
    out[0] = (u24 >> 16) as u8;
    out[1] = (u24 >> 8) as u8;
    out[2] = u24 as u8;
}

/// Fixed-width chunk conversion. The inner loops have no data-dependent
/// branches, which lets the compiler vectorize the prepare/scale stage.
fn convert_chunked(
    samples: &[f32],
    output: &mut [u8],
    clip: bool,
    scale: f32,
    min: f32,
    max: f32,
    write: fn(i32, &mut [u8]),
) {
    if samples.is_empty() {
        return;
    }
    let width = output.len() / samples.len();
    let mut quantized = [0i32; LANES];

    let mut in_chunks = samples.chunks_exact(LANES);
    let mut out_chunks = output.chunks_exact_mut(LANES * width);
    for (chunk, out) in (&mut in_chunks).zip(&mut out_chunks) {
        for (q, &s) in quantized.iter_mut().zip(chunk) {
            let finite = if s.is_finite() { s } else { 0.0 };
            let v = if clip { finite.clamp(-1.0, 1.0) } else { finite };
            *q = (v * scale).round().clamp(min, max) as i32;
        }
        for (q, o) in quantized.iter().zip(out.chunks_exact_mut(width)) {
            write(*q, o);
        }
    }

    let tail_out = out_chunks.into_remainder();
    for (&s, o) in in_chunks.remainder().iter().zip(tail_out.chunks_exact_mut(width)) {
        write(quantize(prepare(s, clip), scale, min, max), o);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_dither(use_acceleration: bool) -> ConvertConfig {
        ConvertConfig {
            dither: DitherMode::None,
            clip_protection: true,
            use_acceleration,
        }
    }

    fn decode_l24(bytes: &[u8]) -> Vec<i32> {
        bytes
            .chunks_exact(3)
            .map(|b| ((b[0] as i32) << 24 | (b[1] as i32) << 16 | (b[2] as i32) << 8) >> 8)
            .collect()
    }

    fn decode_pcm16(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_l24_packing_msb_first() {
        let mut conv = SampleConverter::with_seed(no_dither(false), 1);
        let input = [0.0f32, 1.0, -1.0, 0.5];
        let mut out = vec![0u8; input.len() * 3];
        assert_eq!(conv.float_to_l24(&input, &mut out).unwrap(), 12);

        assert_eq!(&out[0..3], &[0x00, 0x00, 0x00]);
        assert_eq!(&out[3..6], &[0x7F, 0xFF, 0xFF]);
        assert_eq!(&out[6..9], &[0x80, 0x00, 0x01]);
        assert_eq!(decode_l24(&out)[3], 4194304);
    }

    #[test]
    fn test_out_of_range_clamps() {
        // Without clip protection the integer clamp still bounds the result
        let config = ConvertConfig {
            dither: DitherMode::None,
            clip_protection: false,
            use_acceleration: false,
        };
        let mut conv = SampleConverter::with_seed(config, 1);
        let input = [4.0f32, -4.0, 1e30, -1e30];

        let mut out16 = vec![0u8; 8];
        conv.float_to_pcm16(&input, &mut out16).unwrap();
        assert_eq!(decode_pcm16(&out16), vec![32767, -32768, 32767, -32768]);

        let mut out24 = vec![0u8; 12];
        conv.float_to_l24(&input, &mut out24).unwrap();
        assert_eq!(decode_l24(&out24), vec![8388607, -8388608, 8388607, -8388608]);
    }

    #[test]
    fn test_non_finite_becomes_silence() {
        for accel in [false, true] {
            let mut conv = SampleConverter::with_seed(no_dither(accel), 1);
            let input = [f32::NAN, f32::INFINITY, f32::NEG_INFINITY];
            let mut out16 = vec![0xFFu8; 6];
            conv.float_to_pcm16(&input, &mut out16).unwrap();
            assert_eq!(out16, vec![0; 6]);

            let mut out24 = vec![0xFFu8; 9];
            conv.float_to_l24(&input, &mut out24).unwrap();
            assert_eq!(out24, vec![0; 9]);
        }
    }

    #[test]
    fn test_idempotent_on_quantized_input() {
        let mut conv = SampleConverter::with_seed(no_dither(false), 1);
        let levels16: Vec<i16> = vec![-32767, -12345, -1, 0, 1, 255, 16384, 32767];
        let input: Vec<f32> = levels16.iter().map(|&v| v as f32 / 32767.0).collect();
        let mut out = vec![0u8; input.len() * 2];
        conv.float_to_pcm16(&input, &mut out).unwrap();
        assert_eq!(decode_pcm16(&out), levels16);

        let levels24: Vec<i32> = vec![-8388607, -4000000, -1, 0, 1, 65536, 8388607];
        let input: Vec<f32> = levels24.iter().map(|&v| v as f32 / 8388607.0).collect();
        let mut out = vec![0u8; input.len() * 3];
        conv.float_to_l24(&input, &mut out).unwrap();
        assert_eq!(decode_l24(&out), levels24);
    }

    #[test]
    fn test_accelerated_matches_scalar() {
        let input: Vec<f32> = (0..203)
            .map(|i| ((i as f32) * 0.173).sin() * 1.1)
            .collect();

        let mut scalar = SampleConverter::with_seed(no_dither(false), 1);
        let mut fast = SampleConverter::with_seed(no_dither(true), 1);

        let mut a = vec![0u8; input.len() * 3];
        let mut b = vec![0u8; input.len() * 3];
        scalar.float_to_l24(&input, &mut a).unwrap();
        fast.float_to_l24(&input, &mut b).unwrap();
        for (x, y) in decode_l24(&a).iter().zip(decode_l24(&b)) {
            assert!((x - y).abs() <= 1);
        }

        let mut a = vec![0u8; input.len() * 2];
        let mut b = vec![0u8; input.len() * 2];
        scalar.float_to_pcm16(&input, &mut a).unwrap();
        fast.float_to_pcm16(&input, &mut b).unwrap();
        for (x, y) in decode_pcm16(&a).iter().zip(decode_pcm16(&b)) {
            assert!((*x as i32 - y as i32).abs() <= 1);
        }
    }

    #[test]
    fn test_dither_deterministic_per_seed() {
        let config = ConvertConfig {
            dither: DitherMode::Tpdf,
            clip_protection: true,
            use_acceleration: true,
        };
        let input = vec![0.25f32; 64];

        let mut a = SampleConverter::with_seed(config, 42);
        let mut b = SampleConverter::with_seed(config, 42);
        let mut out_a = vec![0u8; 128];
        let mut out_b = vec![0u8; 128];
        a.float_to_pcm16(&input, &mut out_a).unwrap();
        b.float_to_pcm16(&input, &mut out_b).unwrap();
        assert_eq!(out_a, out_b);

        // Noise stays within one LSB of the undithered value
        let exact = (0.25f32 * 32767.0).round() as i32;
        for v in decode_pcm16(&out_a) {
            assert!((v as i32 - exact).abs() <= 1, "dithered value {} too far from {}", v, exact);
        }
    }

    #[test]
    fn test_rpdf_range() {
        let mut rng = DitherRng::new(7);
        for _ in 0..10_000 {
            let n = rng.rpdf();
            assert!(n.abs() <= 0.5 * DITHER_LSB + f32::EPSILON);
            let t = rng.tpdf();
            assert!(t.abs() <= DITHER_LSB + f32::EPSILON);
        }
    }

    #[test]
    fn test_output_too_small() {
        let mut conv = SampleConverter::with_seed(no_dither(false), 1);
        let mut out = vec![0u8; 5];
        assert_eq!(
            conv.float_to_l24(&[0.0, 0.0], &mut out),
            Err(ConvertError::OutputTooSmall { needed: 6, available: 5 })
        );
    }

    #[test]
    fn test_convert_block_dispatch() {
        let mut conv = SampleConverter::with_seed(no_dither(true), 1);
        let mut out = vec![0u8; 6];
        assert_eq!(conv.convert_block(BitDepth::Pcm16, &[0.5, -0.5], &mut out).unwrap(), 4);
        assert_eq!(conv.convert_block(BitDepth::Pcm24, &[0.5, -0.5], &mut out).unwrap(), 6);
    }
}
