//! Weight quantization codecs
//!
//! Two packed representations besides `f32`/`bf16`:
//!
//! - [`Sfp8`]: an 8-bit switched floating point code (1 sign, 4 exponent,
//!   3 mantissa bits, with subnormals). One byte per element.
//! - [`Nuq4`]: a non-uniform 4-bit stream. Elements are grouped into
//!   [`NUQ_GROUP`]-sized runs; each run stores a 16-entry `bf16` centroid
//!   table followed by packed 4-bit indices.
//!
//! Both codecs are pure and deterministic so a save/load round-trip of
//! quantized weights is bit-exact.

use half::bf16;

/// Elements per NUQ group.
pub const NUQ_GROUP: usize = 128;

/// Centroid table entries per NUQ group.
pub const NUQ_TABLE: usize = 16;

/// Packed bytes per NUQ group: 16 bf16 centroids + 128 4-bit indices.
pub const NUQ_GROUP_BYTES: usize = NUQ_TABLE * 2 + NUQ_GROUP / 2;

/// Largest magnitude representable by [`Sfp8`]: `1.875 * 2^8`.
pub const SFP_MAX: f32 = 480.0;

const SFP_EXP_BIAS: i32 = 7;
const SFP_MIN_NORMAL_EXP: i32 = -6;
// Subnormal step: 2^(min_normal_exp - mantissa_bits) = 2^-9.
const SFP_SUBNORMAL_STEP: f32 = 1.0 / 512.0;

/// One element of the 8-bit switched-floating-point representation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Sfp8(pub u8);

impl Sfp8 {
    /// Encode with round-to-nearest; magnitudes above [`SFP_MAX`] saturate,
    /// zero encodes losslessly.
    #[must_use]
    pub fn encode(x: f32) -> Self {
        let sign = u8::from(x.is_sign_negative()) << 7;
        let a = x.abs();
        if a == 0.0 || a.is_nan() {
            return Self(sign);
        }
        if a >= SFP_MAX {
            // Covers infinity; the exponent math below assumes a finite value.
            return Self(sign | 0x7F);
        }
        if a < 2.0f32.powi(SFP_MIN_NORMAL_EXP) {
            // Subnormal: linear steps of 2^-9. A value rounding up to the
            // ninth step is the smallest normal, not a clamped subnormal.
            let q = (a / SFP_SUBNORMAL_STEP).round() as u8;
            if q == 8 {
                return Self(sign | 0x08);
            }
            return Self(sign | q);
        }
        let mut e = a.log2().floor() as i32;
        let mut m = ((a / 2.0f32.powi(e) - 1.0) * 8.0).round() as i32;
        if m == 8 {
            m = 0;
            e += 1;
        }
        if e + SFP_EXP_BIAS >= 16 {
            return Self(sign | 0x7F);
        }
        let code = (((e + SFP_EXP_BIAS) as u8) << 3) | (m as u8);
        Self(sign | code)
    }

    /// Decode back to `f32`.
    #[must_use]
    pub fn decode(self) -> f32 {
        let sign = if self.0 & 0x80 != 0 { -1.0 } else { 1.0 };
        let exp = i32::from((self.0 >> 3) & 0x0F);
        let man = f32::from(self.0 & 0x07);
        if exp == 0 {
            return sign * man * SFP_SUBNORMAL_STEP;
        }
        sign * (1.0 + man / 8.0) * 2.0f32.powi(exp - SFP_EXP_BIAS)
    }
}

/// One byte of a non-uniform-quantization stream. Only meaningful as part
/// of a whole packed group; see [`nuq_compress`]/[`nuq_decompress`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Nuq4(pub u8);

/// Packed stream length, in bytes, for `num` logical elements.
#[must_use]
pub fn nuq_packed_len(num: usize) -> usize {
    num.div_ceil(NUQ_GROUP) * NUQ_GROUP_BYTES
}

/// Deterministic centroid table for one group: the mean of each of 16
/// equal-rank buckets of the sorted values, stored at bf16 precision.
fn nuq_table(values: &[f32]) -> [f32; NUQ_TABLE] {
    let mut sorted: Vec<f32> = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    let mut table = [0.0f32; NUQ_TABLE];
    let n = sorted.len();
    for (k, slot) in table.iter_mut().enumerate() {
        let lo = (k * n / NUQ_TABLE).min(n - 1);
        let hi = ((k + 1) * n / NUQ_TABLE).max(lo + 1).min(n);
        let bucket = &sorted[lo..hi];
        *slot = bucket.iter().sum::<f32>() / bucket.len() as f32;
    }
    // Round through bf16 now so index assignment sees the stored values.
    for slot in &mut table {
        *slot = bf16::from_f32(*slot).to_f32();
    }
    table
}

/// Compress `values` into `out`, which must hold exactly
/// `nuq_packed_len(values.len())` bytes.
pub fn nuq_compress(values: &[f32], out: &mut [Nuq4]) {
    assert_eq!(out.len(), nuq_packed_len(values.len()));
    for (group, chunk) in values.chunks(NUQ_GROUP).enumerate() {
        let dst = &mut out[group * NUQ_GROUP_BYTES..(group + 1) * NUQ_GROUP_BYTES];
        let table = nuq_table(chunk);
        for (k, centroid) in table.iter().enumerate() {
            let bits = bf16::from_f32(*centroid).to_bits().to_le_bytes();
            dst[2 * k] = Nuq4(bits[0]);
            dst[2 * k + 1] = Nuq4(bits[1]);
        }
        let idx_base = NUQ_TABLE * 2;
        for (i, &v) in chunk.iter().enumerate() {
            let idx = nearest_centroid(&table, v);
            let slot = idx_base + i / 2;
            if i % 2 == 0 {
                dst[slot] = Nuq4(idx);
            } else {
                dst[slot] = Nuq4(dst[slot].0 | (idx << 4));
            }
        }
    }
}

fn nearest_centroid(table: &[f32; NUQ_TABLE], v: f32) -> u8 {
    let mut best = 0u8;
    let mut best_d = f32::INFINITY;
    for (k, &c) in table.iter().enumerate() {
        let d = (v - c).abs();
        if d < best_d {
            best_d = d;
            best = k as u8;
        }
    }
    best
}

/// Decompress `out.len()` elements from the packed stream.
pub fn nuq_decompress(packed: &[Nuq4], out: &mut [f32]) {
    assert_eq!(packed.len(), nuq_packed_len(out.len()));
    for (group, chunk) in out.chunks_mut(NUQ_GROUP).enumerate() {
        let src = &packed[group * NUQ_GROUP_BYTES..(group + 1) * NUQ_GROUP_BYTES];
        let mut table = [0.0f32; NUQ_TABLE];
        for (k, slot) in table.iter_mut().enumerate() {
            let bits = u16::from_le_bytes([src[2 * k].0, src[2 * k + 1].0]);
            *slot = bf16::from_bits(bits).to_f32();
        }
        let idx_base = NUQ_TABLE * 2;
        for (i, v) in chunk.iter_mut().enumerate() {
            let byte = src[idx_base + i / 2].0;
            let idx = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
            *v = table[idx as usize];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sfp8_zero_and_sign() {
        assert_eq!(Sfp8::encode(0.0).decode(), 0.0);
        assert_eq!(Sfp8::encode(-0.0).decode(), 0.0);
        assert!(Sfp8::encode(-1.0).decode() < 0.0);
        assert!(Sfp8::encode(1.0).decode() > 0.0);
    }

    #[test]
    fn test_sfp8_exact_powers_of_two() {
        for e in -6..=8 {
            let x = 2.0f32.powi(e);
            assert_eq!(Sfp8::encode(x).decode(), x, "2^{e}");
        }
    }

    #[test]
    fn test_sfp8_relative_error_bound() {
        // Half-ulp of a 3-bit mantissa is 1/16 relative.
        let mut x = 0.017f32;
        while x < 400.0 {
            let y = Sfp8::encode(x).decode();
            let rel = (y - x).abs() / x;
            assert!(rel <= 1.0 / 16.0 + 1e-6, "x={x} y={y} rel={rel}");
            x *= 1.37;
        }
    }

    #[test]
    fn test_sfp8_saturation_and_subnormals() {
        assert_eq!(Sfp8::encode(1e6).decode(), Sfp8(0x7F).decode());
        assert_eq!(Sfp8::encode(-1e6).0, 0xFF);
        // Below half a subnormal step, rounds to zero.
        assert_eq!(Sfp8::encode(1e-4).decode(), 0.0);
        // One subnormal step survives.
        let step = SFP_SUBNORMAL_STEP;
        assert_eq!(Sfp8::encode(step).decode(), step);
    }

    #[test]
    fn test_sfp8_codec_idempotent() {
        // decode(encode(x)) is a fixed point of the codec.
        for code in 0..=255u8 {
            let v = Sfp8(code).decode();
            if v == 0.0 {
                continue;
            }
            assert_eq!(Sfp8::encode(v).decode(), v, "code {code}");
        }
    }

    #[test]
    fn test_nuq_packed_len() {
        assert_eq!(nuq_packed_len(0), 0);
        assert_eq!(nuq_packed_len(1), NUQ_GROUP_BYTES);
        assert_eq!(nuq_packed_len(NUQ_GROUP), NUQ_GROUP_BYTES);
        assert_eq!(nuq_packed_len(NUQ_GROUP + 1), 2 * NUQ_GROUP_BYTES);
    }

    #[test]
    fn test_nuq_roundtrip_constant_group() {
        let values = vec![0.5f32; NUQ_GROUP];
        let mut packed = vec![Nuq4::default(); nuq_packed_len(values.len())];
        nuq_compress(&values, &mut packed);
        let mut out = vec![0.0f32; values.len()];
        nuq_decompress(&packed, &mut out);
        for v in out {
            assert_eq!(v, 0.5);
        }
    }

    #[test]
    fn test_nuq_roundtrip_error_bounded() {
        // A smooth ramp: every value sits close to its bucket centroid.
        let values: Vec<f32> = (0..NUQ_GROUP).map(|i| i as f32 / 64.0 - 1.0).collect();
        let mut packed = vec![Nuq4::default(); nuq_packed_len(values.len())];
        nuq_compress(&values, &mut packed);
        let mut out = vec![0.0f32; values.len()];
        nuq_decompress(&packed, &mut out);
        let bucket_width = 2.0 / NUQ_TABLE as f32;
        for (a, b) in values.iter().zip(&out) {
            assert!((a - b).abs() <= bucket_width, "{a} vs {b}");
        }
    }

    #[test]
    fn test_nuq_deterministic() {
        let values: Vec<f32> = (0..300).map(|i| ((i * 37) % 100) as f32 * 0.01).collect();
        let mut p1 = vec![Nuq4::default(); nuq_packed_len(values.len())];
        let mut p2 = vec![Nuq4::default(); nuq_packed_len(values.len())];
        nuq_compress(&values, &mut p1);
        nuq_compress(&values, &mut p2);
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_nuq_partial_group() {
        let values: Vec<f32> = (0..50).map(|i| i as f32).collect();
        let mut packed = vec![Nuq4::default(); nuq_packed_len(values.len())];
        nuq_compress(&values, &mut packed);
        let mut out = vec![0.0f32; values.len()];
        nuq_decompress(&packed, &mut out);
        for (a, b) in values.iter().zip(&out) {
            assert!((a - b).abs() <= 4.0, "{a} vs {b}");
        }
    }
}
