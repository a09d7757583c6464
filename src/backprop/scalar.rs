//! Reference forward pass and scalar VJPs
//!
//! Straight-line implementations generic over [`Field`], shared by the f32
//! working path, the f64 path, and the complex-step oracle. The batched
//! implementations in [`super::parallel`] must agree with these to tight
//! tolerances; nothing here is optimized.
//!
//! Conventions: matrices are row-major, `matmul` treats each weight row as
//! one output feature (`out[t][r] = w.row(r) . x[t]`), and each position `t`
//! predicts token `t + 1`. The attention output projection uses the
//! dimension-major `attn_vec_einsum_w` layout, `heads` blocks of
//! `[model_dim, qkv_dim]`.

use crate::config::ModelConfig;
use crate::mat::MatElem;
use crate::weights::ModelWeights;

use super::field::{dot, Field};
use super::prompt::Prompt;

/// Epsilon inside the RMS-norm root.
const RMS_EPS: f64 = 1e-6;

/// RoPE base frequency.
const ROPE_BASE: f64 = 10_000.0;

// ---------------------------------------------------------------------------
// Primitive ops

/// `out[t][r] = w.row(r) . x[t]` for `t < tokens`, `r < rows`.
pub fn matmul<T: Field>(w: &[T], x: &[T], out: &mut [T], rows: usize, cols: usize, tokens: usize) {
    for t in 0..tokens {
        let xt = &x[t * cols..(t + 1) * cols];
        for r in 0..rows {
            out[t * rows + r] = dot(&w[r * cols..(r + 1) * cols], xt);
        }
    }
}

/// Multi-head projection: `heads` weight blocks of `[rows, cols]`, input
/// rows of `heads * cols`, summed into `rows` outputs per token.
pub fn multi_head_matmul<T: Field>(
    w: &[T],
    x: &[T],
    out: &mut [T],
    heads: usize,
    rows: usize,
    cols: usize,
    tokens: usize,
) {
    for t in 0..tokens {
        for r in 0..rows {
            let mut sum = T::zero();
            for h in 0..heads {
                let wrow = &w[(h * rows + r) * cols..(h * rows + r + 1) * cols];
                let xh = &x[t * heads * cols + h * cols..t * heads * cols + (h + 1) * cols];
                sum += dot(wrow, xh);
            }
            out[t * rows + r] = sum;
        }
    }
}

/// RMS normalization of `k` rows of length `n`, with a learned `1 + w`
/// multiplier per column.
pub fn rms_norm<T: Field>(w: &[T], x: &[T], out: &mut [T], n: usize, k: usize) {
    for row in 0..k {
        let xr = &x[row * n..(row + 1) * n];
        let mut ss = T::zero();
        for &v in xr {
            ss += v * v;
        }
        let m = T::one() / (ss / T::from_f64(n as f64) + T::from_f64(RMS_EPS)).sqrt();
        for j in 0..n {
            out[row * n + j] = (T::one() + w[j]) * m * xr[j];
        }
    }
}

/// Logit softcap `cap * tanh(x / cap)`; identity when `cap <= 0`.
pub fn softcap<T: Field>(cap: f32, v: &mut [T]) {
    if cap <= 0.0 {
        return;
    }
    let c = T::from_f32(cap);
    for x in v {
        *x = c * (*x / c).tanh();
    }
}

/// In-place softmax; the max is taken over real parts so the complex
/// instantiation stays analytic (the shift is a constant).
pub fn softmax<T: Field>(v: &mut [T]) {
    let max = v
        .iter()
        .map(|x| x.real())
        .fold(f64::NEG_INFINITY, f64::max);
    let max = T::from_f64(max);
    let mut sum = T::zero();
    for x in v.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    let inv = T::one() / sum;
    for x in v.iter_mut() {
        *x *= inv;
    }
}

/// Tanh-approximated GELU.
pub fn gelu<T: Field>(x: T) -> T {
    // sqrt(2/pi)
    let k = T::from_f64(0.797_884_560_802_865_4);
    let u = k * (x + T::from_f64(0.044715) * x * x * x);
    T::from_f64(0.5) * x * (T::one() + u.tanh())
}

/// Derivative of [`gelu`].
pub fn gelu_derivative<T: Field>(x: T) -> T {
    let k = T::from_f64(0.797_884_560_802_865_4);
    let u = k * (x + T::from_f64(0.044715) * x * x * x);
    let t = u.tanh();
    let du = k * (T::one() + T::from_f64(3.0 * 0.044715) * x * x);
    T::from_f64(0.5) * (T::one() + t) + T::from_f64(0.5) * x * (T::one() - t * t) * du
}

/// Rotary position embedding over a head vector of length `dim` (split
/// halves convention).
pub fn rope<T: Field>(v: &mut [T], dim: usize, pos: usize) {
    let half = dim / 2;
    for i in 0..half {
        let theta = pos as f64 * ROPE_BASE.powf(-(i as f64) / half as f64);
        let (c, s) = (T::from_f64(theta.cos()), T::from_f64(theta.sin()));
        let x0 = v[i];
        let x1 = v[i + half];
        v[i] = x0 * c - x1 * s;
        v[i + half] = x0 * s + x1 * c;
    }
}

/// Pulls a cotangent back through [`rope`] (the inverse rotation).
pub fn rope_backward<T: Field>(v: &mut [T], dim: usize, pos: usize) {
    let half = dim / 2;
    for i in 0..half {
        let theta = pos as f64 * ROPE_BASE.powf(-(i as f64) / half as f64);
        let (c, s) = (T::from_f64(theta.cos()), T::from_f64(theta.sin()));
        let x0 = v[i];
        let x1 = v[i + half];
        v[i] = x0 * c + x1 * s;
        v[i + half] = x1 * c - x0 * s;
    }
}

// ---------------------------------------------------------------------------
// Scalar VJPs

/// VJP of [`matmul`]: accumulates `grad += dy^T x` and overwrites
/// `dx = dy w`.
pub fn matmul_vjp<T: Field>(
    w: &[T],
    x: &[T],
    dy: &[T],
    grad: &mut [T],
    dx: &mut [T],
    rows: usize,
    cols: usize,
    tokens: usize,
) {
    for t in 0..tokens {
        let xt = &x[t * cols..(t + 1) * cols];
        let dxt = &mut dx[t * cols..(t + 1) * cols];
        dxt.fill(T::zero());
        for r in 0..rows {
            let d = dy[t * rows + r];
            let wrow = &w[r * cols..(r + 1) * cols];
            let grow = &mut grad[r * cols..(r + 1) * cols];
            for c in 0..cols {
                grow[c] += d * xt[c];
                dxt[c] += d * wrow[c];
            }
        }
    }
}

/// VJP of [`multi_head_matmul`].
#[allow(clippy::too_many_arguments)]
pub fn multi_head_matmul_vjp<T: Field>(
    w: &[T],
    x: &[T],
    dy: &[T],
    grad: &mut [T],
    dx: &mut [T],
    heads: usize,
    rows: usize,
    cols: usize,
    tokens: usize,
) {
    for t in 0..tokens {
        let dxt = &mut dx[t * heads * cols..(t + 1) * heads * cols];
        dxt.fill(T::zero());
        for r in 0..rows {
            let d = dy[t * rows + r];
            for h in 0..heads {
                let base = (h * rows + r) * cols;
                let xh = &x[t * heads * cols + h * cols..t * heads * cols + (h + 1) * cols];
                for c in 0..cols {
                    grad[base + c] += d * xh[c];
                    dxt[h * cols + c] += d * w[base + c];
                }
            }
        }
    }
}

/// VJP of [`rms_norm`]: accumulates into `grad`, overwrites `dx`.
pub fn rms_norm_vjp<T: Field>(
    w: &[T],
    x: &[T],
    dy: &[T],
    grad: &mut [T],
    dx: &mut [T],
    n: usize,
    k: usize,
) {
    for row in 0..k {
        let xr = &x[row * n..(row + 1) * n];
        let dyr = &dy[row * n..(row + 1) * n];
        let dxr = &mut dx[row * n..(row + 1) * n];
        let mut ss = T::zero();
        for &v in xr {
            ss += v * v;
        }
        let m = T::one() / (ss / T::from_f64(n as f64) + T::from_f64(RMS_EPS)).sqrt();
        // d(m)/d(x_i) = -m^3 x_i / n
        let mut proj = T::zero();
        for j in 0..n {
            proj += dyr[j] * (T::one() + w[j]) * xr[j];
        }
        let m3n = m * m * m / T::from_f64(n as f64);
        for j in 0..n {
            grad[j] += dyr[j] * xr[j] * m;
            dxr[j] = (T::one() + w[j]) * m * dyr[j] - m3n * xr[j] * proj;
        }
    }
}

// ---------------------------------------------------------------------------
// Forward pass

/// Per-layer activations retained for the backward pass. Sized for
/// `seq_len`; only the first `num_positions` rows of each are live.
#[derive(Debug, Clone)]
pub struct LayerActivations<T> {
    /// Residual stream entering the layer, `n x model_dim`
    pub input: Vec<T>,
    pub pre_att_rms_out: Vec<T>,
    /// Post-RoPE, post-query-scale fused projections, `n x (heads + 2) * qkv_dim`
    pub qkv: Vec<T>,
    /// Post-softcap attention logits, `n x heads x seq_len`
    pub att_scores: Vec<T>,
    /// Attention weights after masked softmax
    pub att_probs: Vec<T>,
    /// Per-head context vectors, `n x heads * qkv_dim`
    pub att_out: Vec<T>,
    /// Output projection result, `n x model_dim`
    pub attention_out: Vec<T>,
    /// Residual stream after attention, `n x model_dim`
    pub att_residual: Vec<T>,
    pub pre_ffw_rms_out: Vec<T>,
    /// Raw fused gate/up projections, `n x 2 * ff_hidden_dim`
    pub ffw_hidden: Vec<T>,
    /// `gelu(gate) * up`, `n x ff_hidden_dim`
    pub ffw_hidden_gated: Vec<T>,
    pub ffw_out: Vec<T>,
}

impl<T: Field> LayerActivations<T> {
    fn new(config: &ModelConfig, layer: usize) -> Self {
        let lc = &config.layer_configs[layer];
        let n = config.seq_len;
        let d = config.model_dim;
        Self {
            input: vec![T::zero(); n * d],
            pre_att_rms_out: vec![T::zero(); n * d],
            qkv: vec![T::zero(); n * (lc.heads + 2) * lc.qkv_dim],
            att_scores: vec![T::zero(); n * lc.heads * n],
            att_probs: vec![T::zero(); n * lc.heads * n],
            att_out: vec![T::zero(); n * lc.heads * lc.qkv_dim],
            attention_out: vec![T::zero(); n * d],
            att_residual: vec![T::zero(); n * d],
            pre_ffw_rms_out: vec![T::zero(); n * d],
            ffw_hidden: vec![T::zero(); n * 2 * lc.ff_hidden_dim],
            ffw_hidden_gated: vec![T::zero(); n * lc.ff_hidden_dim],
            ffw_out: vec![T::zero(); n * d],
        }
    }
}

/// All activations of one forward pass. Doubles as the cotangent scratch of
/// the backward pass, with each field holding the derivative of the loss
/// with respect to the same-named activation.
#[derive(Debug, Clone)]
pub struct ForwardPass<T: Field> {
    pub layers: Vec<LayerActivations<T>>,
    pub final_layer_out: Vec<T>,
    pub final_norm_out: Vec<T>,
    /// Post-softcap logits, `n x vocab_size`
    pub logits: Vec<T>,
    pub probs: Vec<T>,
    config: ModelConfig,
}

impl<T: Field> ForwardPass<T> {
    #[must_use]
    pub fn new(config: &ModelConfig) -> Self {
        let n = config.seq_len;
        let d = config.model_dim;
        Self {
            layers: (0..config.num_layers())
                .map(|l| LayerActivations::new(config, l))
                .collect(),
            final_layer_out: vec![T::zero(); n * d],
            final_norm_out: vec![T::zero(); n * d],
            logits: vec![T::zero(); n * config.vocab_size],
            probs: vec![T::zero(); n * config.vocab_size],
            config: config.clone(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Zero every activation; the backward pass accumulates into this.
    pub fn zero_init(&mut self) {
        for layer in &mut self.layers {
            layer.input.fill(T::zero());
            layer.pre_att_rms_out.fill(T::zero());
            layer.qkv.fill(T::zero());
            layer.att_scores.fill(T::zero());
            layer.att_probs.fill(T::zero());
            layer.att_out.fill(T::zero());
            layer.attention_out.fill(T::zero());
            layer.att_residual.fill(T::zero());
            layer.pre_ffw_rms_out.fill(T::zero());
            layer.ffw_hidden.fill(T::zero());
            layer.ffw_hidden_gated.fill(T::zero());
            layer.ffw_out.fill(T::zero());
        }
        self.final_layer_out.fill(T::zero());
        self.final_norm_out.fill(T::zero());
        self.logits.fill(T::zero());
        self.probs.fill(T::zero());
    }
}

/// Scalar forward pass: embeds the prompt, runs every layer, and returns
/// the summed negative log-likelihood of the scored targets.
///
/// Only single-KV-head models are supported by the gradient engine.
pub fn cross_entropy_forward<T: Field + MatElem>(
    prompt: &Prompt,
    weights: &ModelWeights<T>,
    forward: &mut ForwardPass<T>,
) -> T {
    let config = weights.config().clone();
    let n = prompt.num_positions();
    let d = config.model_dim;
    let v = config.vocab_size;
    assert!(n <= config.seq_len);

    // Embed, scaled by sqrt(model_dim).
    let emb_scale = T::from_f64((d as f64).sqrt());
    let emb = weights.embedder_input_embedding.as_slice();
    let mut x = vec![T::zero(); n * d];
    for t in 0..n {
        let tok = prompt.tokens[t];
        for j in 0..d {
            x[t * d + j] = emb[tok * d + j] * emb_scale;
        }
    }

    for l in 0..config.num_layers() {
        let lc = config.layer_configs[l].clone();
        debug_assert_eq!(lc.kv_heads, 1);
        let (heads, q) = (lc.heads, lc.qkv_dim);
        let qkv_rows = (heads + 2) * q;
        let lw = &weights.layers[l];
        let acts = &mut forward.layers[l];
        acts.input[..n * d].copy_from_slice(&x);

        // Attention block.
        rms_norm(
            lw.pre_attention_norm_scale.as_slice(),
            &x,
            &mut acts.pre_att_rms_out[..n * d],
            d,
            n,
        );
        matmul(
            lw.qkv_einsum_w.as_slice(),
            &acts.pre_att_rms_out[..n * d],
            &mut acts.qkv[..n * qkv_rows],
            qkv_rows,
            d,
            n,
        );
        let qscale = T::from_f32(config.query_scale);
        for t in 0..n {
            let row = &mut acts.qkv[t * qkv_rows..(t + 1) * qkv_rows];
            for h in 0..heads {
                rope(&mut row[h * q..(h + 1) * q], q, t);
                for e in &mut row[h * q..(h + 1) * q] {
                    *e *= qscale;
                }
            }
            rope(&mut row[heads * q..(heads + 1) * q], q, t);
        }
        for t in 0..n {
            for h in 0..heads {
                let scores =
                    &mut acts.att_scores[(t * heads + h) * config.seq_len..][..config.seq_len];
                for u in 0..=t {
                    let qv = &acts.qkv[t * qkv_rows + h * q..t * qkv_rows + (h + 1) * q];
                    let kv = &acts.qkv[u * qkv_rows + heads * q..u * qkv_rows + (heads + 1) * q];
                    scores[u] = dot(qv, kv);
                }
                softcap(config.att_cap, &mut scores[..=t]);
                let probs =
                    &mut acts.att_probs[(t * heads + h) * config.seq_len..][..config.seq_len];
                probs[..=t].copy_from_slice(&scores[..=t]);
                softmax(&mut probs[..=t]);
                let mut ctx = vec![T::zero(); q];
                for u in 0..=t {
                    let vv = &acts.qkv
                        [u * qkv_rows + (heads + 1) * q..u * qkv_rows + (heads + 2) * q];
                    for e in 0..q {
                        ctx[e] += probs[u] * vv[e];
                    }
                }
                acts.att_out[t * heads * q + h * q..t * heads * q + (h + 1) * q]
                    .copy_from_slice(&ctx);
            }
        }
        multi_head_matmul(
            lw.attn_vec_einsum_w.as_slice(),
            &acts.att_out[..n * heads * q],
            &mut acts.attention_out[..n * d],
            heads,
            d,
            q,
            n,
        );
        for i in 0..n * d {
            x[i] += acts.attention_out[i];
        }
        acts.att_residual[..n * d].copy_from_slice(&x);

        // FFN block.
        let f = lc.ff_hidden_dim;
        rms_norm(
            lw.pre_ffw_norm_scale.as_slice(),
            &x,
            &mut acts.pre_ffw_rms_out[..n * d],
            d,
            n,
        );
        matmul(
            lw.gating_einsum_w.as_slice(),
            &acts.pre_ffw_rms_out[..n * d],
            &mut acts.ffw_hidden[..n * 2 * f],
            2 * f,
            d,
            n,
        );
        for t in 0..n {
            for j in 0..f {
                let gate = acts.ffw_hidden[t * 2 * f + j];
                let up = acts.ffw_hidden[t * 2 * f + f + j];
                acts.ffw_hidden_gated[t * f + j] = gelu(gate) * up;
            }
        }
        matmul(
            lw.linear_w.as_slice(),
            &acts.ffw_hidden_gated[..n * f],
            &mut acts.ffw_out[..n * d],
            d,
            f,
            n,
        );
        for i in 0..n * d {
            x[i] += acts.ffw_out[i];
        }
    }

    forward.final_layer_out[..n * d].copy_from_slice(&x);
    rms_norm(
        weights.final_norm_scale.as_slice(),
        &x,
        &mut forward.final_norm_out[..n * d],
        d,
        n,
    );
    matmul(
        emb,
        &forward.final_norm_out[..n * d],
        &mut forward.logits[..n * v],
        v,
        d,
        n,
    );
    softcap(config.final_cap, &mut forward.logits[..n * v]);
    forward.probs[..n * v].copy_from_slice(&forward.logits[..n * v]);
    for t in 0..n {
        softmax(&mut forward.probs[t * v..(t + 1) * v]);
    }

    let mut loss = T::zero();
    for t in 0..n {
        if prompt.is_scored(t) {
            loss -= forward.probs[t * v + prompt.tokens[t + 1]].ln();
        }
    }
    loss
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex;

    #[test]
    fn test_matmul_small() {
        // w = [[1,2],[3,4]], x = [[1,1],[2,0]]
        let w = [1.0f32, 2.0, 3.0, 4.0];
        let x = [1.0f32, 1.0, 2.0, 0.0];
        let mut y = [0.0f32; 4];
        matmul(&w, &x, &mut y, 2, 2, 2);
        assert_eq!(y, [3.0, 7.0, 2.0, 6.0]);
    }

    #[test]
    fn test_multi_head_matmul_sums_heads() {
        // heads=2, rows=1, cols=2; w blocks [1,0] and [0,1]
        let w = [1.0f32, 0.0, 0.0, 1.0];
        let x = [3.0f32, 5.0, 7.0, 11.0];
        let mut y = [0.0f32; 1];
        multi_head_matmul(&w, &x, &mut y, 2, 1, 2, 1);
        assert_eq!(y[0], 3.0 + 11.0);
    }

    #[test]
    fn test_rms_norm_unit_weight() {
        let w = vec![0.0f32; 4];
        let x = [2.0f32, -2.0, 2.0, -2.0];
        let mut y = [0.0f32; 4];
        rms_norm(&w, &x, &mut y, 4, 1);
        // rms = 2, so outputs ~ x / 2.
        for (a, b) in y.iter().zip(&x) {
            assert!((a - b / 2.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let mut v = [1.0f32, 2.0, 3.0];
        softmax(&mut v);
        let sum: f32 = v.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(v[2] > v[1] && v[1] > v[0]);
    }

    #[test]
    fn test_softcap_bounds() {
        let mut v = [100.0f32, -100.0, 0.0];
        softcap(30.0, &mut v);
        assert!(v[0] < 30.0 && v[0] > 29.9);
        assert!(v[1] > -30.0 && v[1] < -29.9);
        assert_eq!(v[2], 0.0);
        let mut id = [5.0f32];
        softcap(0.0, &mut id);
        assert_eq!(id[0], 5.0);
    }

    #[test]
    fn test_rope_preserves_norm_and_inverts() {
        let orig: Vec<f32> = (0..16).map(|i| (i as f32 * 0.37).sin()).collect();
        let mut v = orig.clone();
        rope(&mut v, 16, 5);
        let n0: f32 = orig.iter().map(|x| x * x).sum();
        let n1: f32 = v.iter().map(|x| x * x).sum();
        assert!((n0 - n1).abs() < 1e-4);
        rope_backward(&mut v, 16, 5);
        for (a, b) in v.iter().zip(&orig) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rope_position_zero_is_identity() {
        let orig: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let mut v = orig.clone();
        rope(&mut v, 8, 0);
        assert_eq!(v, orig);
    }

    #[test]
    fn test_gelu_values() {
        assert_eq!(gelu(0.0f64), 0.0);
        assert!((gelu(1.0f64) - 0.841192).abs() < 1e-4);
        // Derivative via finite difference.
        let h = 1e-6;
        let fd = (gelu(0.7 + h) - gelu(0.7 - h)) / (2.0 * h);
        assert!((gelu_derivative(0.7f64) - fd).abs() < 1e-6);
    }

    #[test]
    fn test_matmul_vjp_against_complex_step() {
        let rows = 3;
        let cols = 4;
        let tokens = 2;
        let w: Vec<f64> = (0..rows * cols).map(|i| (i as f64 * 0.7).sin()).collect();
        let x: Vec<f64> = (0..tokens * cols).map(|i| (i as f64 * 0.3).cos()).collect();
        let dy: Vec<f64> = (0..tokens * rows).map(|i| (i as f64 * 1.1).sin()).collect();
        let mut grad = vec![0.0f64; rows * cols];
        let mut dx = vec![0.0f64; tokens * cols];
        matmul_vjp(&w, &x, &dy, &mut grad, &mut dx, rows, cols, tokens);

        let h = 1e-50;
        for i in 0..rows * cols {
            let mut cw: Vec<Complex<f64>> = w.iter().map(|&a| Complex::new(a, 0.0)).collect();
            cw[i].im = h;
            let cx: Vec<Complex<f64>> = x.iter().map(|&a| Complex::new(a, 0.0)).collect();
            let mut cy = vec![Complex::new(0.0, 0.0); tokens * rows];
            matmul(&cw, &cx, &mut cy, rows, cols, tokens);
            let mut obj = Complex::new(0.0, 0.0);
            for (d, y) in dy.iter().zip(&cy) {
                obj += Complex::new(*d, 0.0) * y;
            }
            assert!((obj.im / h - grad[i]).abs() < 1e-10, "grad[{i}]");
        }
    }

    #[test]
    fn test_rms_norm_vjp_against_complex_step() {
        let n = 8;
        let k = 2;
        let w: Vec<f64> = (0..n).map(|i| 0.1 * i as f64).collect();
        let x: Vec<f64> = (0..k * n).map(|i| (i as f64 * 0.9).sin() + 0.2).collect();
        let dy: Vec<f64> = (0..k * n).map(|i| (i as f64 * 0.4).cos()).collect();
        let mut grad = vec![0.0f64; n];
        let mut dx = vec![0.0f64; k * n];
        rms_norm_vjp(&w, &x, &dy, &mut grad, &mut dx, n, k);

        let h = 1e-50;
        // Check dx entries.
        for i in 0..k * n {
            let cw: Vec<Complex<f64>> = w.iter().map(|&a| Complex::new(a, 0.0)).collect();
            let mut cx: Vec<Complex<f64>> = x.iter().map(|&a| Complex::new(a, 0.0)).collect();
            cx[i].im = h;
            let mut cy = vec![Complex::new(0.0, 0.0); k * n];
            rms_norm(&cw, &cx, &mut cy, n, k);
            let mut obj = Complex::new(0.0, 0.0);
            for (d, y) in dy.iter().zip(&cy) {
                obj += Complex::new(*d, 0.0) * y;
            }
            assert!((obj.im / h - dx[i]).abs() < 1e-10, "dx[{i}]");
        }
        // Check weight gradient.
        for j in 0..n {
            let mut cw: Vec<Complex<f64>> = w.iter().map(|&a| Complex::new(a, 0.0)).collect();
            cw[j].im = h;
            let cx: Vec<Complex<f64>> = x.iter().map(|&a| Complex::new(a, 0.0)).collect();
            let mut cy = vec![Complex::new(0.0, 0.0); k * n];
            rms_norm(&cw, &cx, &mut cy, n, k);
            let mut obj = Complex::new(0.0, 0.0);
            for (d, y) in dy.iter().zip(&cy) {
                obj += Complex::new(*d, 0.0) * y;
            }
            assert!((obj.im / h - grad[j]).abs() < 1e-10, "grad[{j}]");
        }
    }
}
