//! Gradient verification harness
//!
//! The ground truth for every gradient in this crate is the complex-step
//! derivative: for an analytic objective `F`, `Imag(F(x + ih)) / h`
//! approaches `dF/dx` with no subtractive cancellation, so `h` can be tiny
//! (1e-30 for f32-sourced parameters, 1e-50 for f64) and the oracle is
//! exact to machine precision.
//!
//! These helpers panic on failure and are meant for tests; they are not
//! part of the library's fallible API.

use num_complex::Complex;
use rand::Rng;

use crate::mat::MatStorageT;
use crate::weights::{sample_normal, ModelWeights, TraversalMode};

/// Complex-step size for f32-sourced parameters.
pub const COMPLEX_STEP_H_F32: f64 = 1e-30;
/// Complex-step size for f64-sourced parameters.
pub const COMPLEX_STEP_H_F64: f64 = 1e-50;

/// Minimum cosine similarity between a checked gradient and the oracle.
pub const MIN_COSINE_SIMILARITY: f64 = 1.0 - 1e-7;

/// Fill a tensor with N(0, stddev) noise.
pub fn rand_init_mat<R: Rng>(mat: &mut MatStorageT<f32>, stddev: f32, rng: &mut R) {
    for v in mat.as_mut_slice() {
        *v = stddev * sample_normal(rng);
    }
}

/// Widen an f32 slice to complex with zero imaginary parts.
#[must_use]
pub fn complexify_slice(src: &[f32]) -> Vec<Complex<f64>> {
    src.iter().map(|&v| Complex::new(f64::from(v), 0.0)).collect()
}

/// Widen a whole model (legacy tensor set; the derived `att_weights` is
/// not part of the differentiated forward pass).
pub fn complexify(src: &ModelWeights<f32>, dst: &mut ModelWeights<Complex<f64>>) {
    let src_tensors = src.tensors(TraversalMode::NoToc);
    for (dst_mat, src_mat) in dst
        .tensors_mut(TraversalMode::NoToc)
        .into_iter()
        .zip(src_tensors)
    {
        for (d, &s) in dst_mat.as_mut_slice().iter_mut().zip(src_mat.as_slice()) {
            *d = Complex::new(f64::from(s), 0.0);
        }
    }
}

/// Per-element closeness: `|a - b| <= abs_tol + rel_tol * max(|a|, |b|)`.
pub fn assert_near(actual: &[f32], expected: &[f32], abs_tol: f32, rel_tol: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        let bound = abs_tol + rel_tol * a.abs().max(e.abs());
        assert!(
            (a - e).abs() <= bound,
            "element {i}: {a} vs {e} (bound {bound})"
        );
    }
}

/// Cosine similarity; 1.0 when either vector is all zeros.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        dot += f64::from(x) * f64::from(y);
        na += f64::from(x) * f64::from(x);
        nb += f64::from(y) * f64::from(y);
    }
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Check `grad` against the complex-step oracle of `func`, which receives
/// the (perturbed) complex parameter vector and returns the objective.
/// Panics if any element misses the abs/rel bound or if the whole gradient
/// drifts in direction from the oracle.
pub fn expect_gradient<F>(
    grad: &[f32],
    c_param: &mut [Complex<f64>],
    func: &mut F,
    max_abs: f32,
    max_rel: f32,
) where
    F: FnMut(&mut [Complex<f64>]) -> Complex<f64>,
{
    assert_eq!(grad.len(), c_param.len());
    let h = COMPLEX_STEP_H_F32;
    let mut oracle = vec![0.0f32; grad.len()];
    for i in 0..grad.len() {
        let orig = c_param[i];
        c_param[i] = orig + Complex::new(0.0, h);
        let loss = func(c_param);
        c_param[i] = orig;
        oracle[i] = (loss.im / h) as f32;
    }
    assert_near(grad, &oracle, max_abs, max_rel);
    let cos = cosine_similarity(grad, &oracle);
    assert!(cos >= MIN_COSINE_SIMILARITY, "cosine similarity {cos}");
}

/// Model-wide gradient check: perturbs every element of every legacy-set
/// tensor of `c_weights` in traversal order and compares against `grad`.
pub fn expect_gradient_model<F>(
    grad: &ModelWeights<f32>,
    c_weights: &mut ModelWeights<Complex<f64>>,
    func: &mut F,
    max_err: f32,
) where
    F: FnMut(&mut ModelWeights<Complex<f64>>) -> Complex<f64>,
{
    let h = COMPLEX_STEP_H_F32;
    let num_tensors = grad.tensors(TraversalMode::NoToc).len();
    for k in 0..num_tensors {
        let (name, len) = {
            let mat = grad.tensors(TraversalMode::NoToc)[k];
            (mat.name().to_string(), mat.num_elements())
        };
        let mut oracle = vec![0.0f32; len];
        for (i, o) in oracle.iter_mut().enumerate() {
            let orig = {
                let mut tensors = c_weights.tensors_mut(TraversalMode::NoToc);
                let s = tensors[k].as_mut_slice();
                let v = s[i];
                s[i] = v + Complex::new(0.0, h);
                v
            };
            let loss = func(c_weights);
            c_weights.tensors_mut(TraversalMode::NoToc)[k].as_mut_slice()[i] = orig;
            *o = (loss.im / h) as f32;
        }
        let g = grad.tensors(TraversalMode::NoToc)[k].as_slice();
        for (i, (&a, &e)) in g.iter().zip(&oracle).enumerate() {
            let bound = max_err + max_err * a.abs().max(e.abs());
            assert!(
                (a - e).abs() <= bound,
                "{name}[{i}]: {a} vs oracle {e} (bound {bound})"
            );
        }
        let cos = cosine_similarity(g, &oracle);
        assert!(
            cos >= MIN_COSINE_SIMILARITY,
            "{name}: cosine similarity {cos}"
        );
    }
}
