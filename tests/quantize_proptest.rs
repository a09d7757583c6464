//! Property tests for the packed weight codecs.

use proptest::prelude::*;

use ponderar::quantize::{nuq_compress, nuq_decompress, nuq_packed_len, Nuq4, Sfp8, SFP_MAX};

proptest! {
    /// Relative error stays inside a half-ulp of the 3-bit mantissa for
    /// normal magnitudes; subnormals see at most half a linear step.
    #[test]
    fn sfp8_error_bounds(x in -SFP_MAX..SFP_MAX) {
        let y = Sfp8::encode(x).decode();
        let a = x.abs();
        if a >= 0.015_625 {
            prop_assert!((y - x).abs() / a <= 1.0 / 16.0 + 1e-6, "x={x} y={y}");
        } else {
            prop_assert!((y - x).abs() <= 1.0 / 1024.0 + 1e-9, "x={x} y={y}");
        }
    }

    /// Encoding is stable: one pass through the codec reaches a fixed point
    /// for every input, non-finite included.
    #[test]
    fn sfp8_encode_is_stable(x in any::<f32>()) {
        let once = Sfp8::encode(x);
        prop_assert_eq!(Sfp8::encode(once.decode()), once);
    }

    /// Compression is a pure function of the input values.
    #[test]
    fn nuq_compress_deterministic(values in prop::collection::vec(-100.0f32..100.0, 1..400)) {
        let mut a = vec![Nuq4::default(); nuq_packed_len(values.len())];
        let mut b = vec![Nuq4::default(); nuq_packed_len(values.len())];
        nuq_compress(&values, &mut a);
        nuq_compress(&values, &mut b);
        prop_assert_eq!(a, b);
    }

    /// Every decompressed value lands inside its group's value range, up to
    /// the bf16 rounding of the centroid table.
    #[test]
    fn nuq_round_trip_stays_in_range(values in prop::collection::vec(-100.0f32..100.0, 1..400)) {
        let mut packed = vec![Nuq4::default(); nuq_packed_len(values.len())];
        nuq_compress(&values, &mut packed);
        let mut out = vec![0.0f32; values.len()];
        nuq_decompress(&packed, &mut out);

        for (chunk, decoded) in values.chunks(128).zip(out.chunks(128)) {
            let min = chunk.iter().copied().fold(f32::INFINITY, f32::min);
            let max = chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let slack = min.abs().max(max.abs()) / 128.0 + 1e-6;
            for &v in decoded {
                prop_assert!(v >= min - slack && v <= max + slack, "{v} outside [{min}, {max}]");
            }
        }
    }
}
