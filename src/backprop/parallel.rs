//! Batched f32 forward and backward pass
//!
//! Working-precision counterparts of [`super::scalar`], with the large
//! matrix products and norms partitioned across the worker pool. Each
//! parallel loop writes disjoint rows, so workers never alias.
//!
//! The backward pass consumes the activations retained by the forward pass
//! and accumulates weight gradients into a zero-initialized
//! `ModelWeights<f32>`. A second [`ForwardPass`] serves as the cotangent
//! scratch: each field holds the loss derivative with respect to the
//! same-named activation.

use crate::pool::{SendPtr, WorkerPool};
use crate::weights::ModelWeights;

use super::field::dot;
use super::prompt::Prompt;
use super::scalar::{
    gelu, gelu_derivative, rope, rope_backward, softcap, softmax, ForwardPass,
};

/// Epsilon inside the RMS-norm root; must match the scalar path.
const RMS_EPS: f32 = 1e-6;

// ---------------------------------------------------------------------------
// Batched primitives

pub fn matmul(
    w: &[f32],
    x: &[f32],
    out: &mut [f32],
    rows: usize,
    cols: usize,
    tokens: usize,
    pool: &WorkerPool,
) {
    let out_ptr = SendPtr(out.as_mut_ptr());
    pool.run_range(tokens, |range| {
        for t in range {
            let yt = unsafe { out_ptr.slice_at(t * rows, rows) };
            let xt = &x[t * cols..(t + 1) * cols];
            for (r, y) in yt.iter_mut().enumerate() {
                *y = dot(&w[r * cols..(r + 1) * cols], xt);
            }
        }
    });
}

pub fn multi_head_matmul(
    w: &[f32],
    x: &[f32],
    out: &mut [f32],
    heads: usize,
    rows: usize,
    cols: usize,
    tokens: usize,
    pool: &WorkerPool,
) {
    let out_ptr = SendPtr(out.as_mut_ptr());
    pool.run_range(tokens, |range| {
        for t in range {
            let yt = unsafe { out_ptr.slice_at(t * rows, rows) };
            for (r, y) in yt.iter_mut().enumerate() {
                let mut sum = 0.0f32;
                for h in 0..heads {
                    let wrow = &w[(h * rows + r) * cols..(h * rows + r + 1) * cols];
                    let xh = &x[t * heads * cols + h * cols..t * heads * cols + (h + 1) * cols];
                    sum += dot(wrow, xh);
                }
                *y = sum;
            }
        }
    });
}

pub fn rms_norm(
    w: &[f32],
    x: &[f32],
    out: &mut [f32],
    n: usize,
    k: usize,
    pool: &WorkerPool,
) {
    let out_ptr = SendPtr(out.as_mut_ptr());
    pool.run_range(k, |range| {
        for row in range {
            let xr = &x[row * n..(row + 1) * n];
            let yr = unsafe { out_ptr.slice_at(row * n, n) };
            let ss: f32 = xr.iter().map(|v| v * v).sum();
            let m = 1.0 / (ss / n as f32 + RMS_EPS).sqrt();
            for j in 0..n {
                yr[j] = (1.0 + w[j]) * m * xr[j];
            }
        }
    });
}

/// VJP of [`matmul`]: `grad += dy^T x` (parallel over weight rows),
/// `dx = dy w` (parallel over tokens).
#[allow(clippy::too_many_arguments)]
pub fn matmul_vjp(
    w: &[f32],
    x: &[f32],
    dy: &[f32],
    grad: &mut [f32],
    dx: &mut [f32],
    rows: usize,
    cols: usize,
    tokens: usize,
    pool: &WorkerPool,
) {
    let grad_ptr = SendPtr(grad.as_mut_ptr());
    pool.run_range(rows, |range| {
        for r in range {
            let grow = unsafe { grad_ptr.slice_at(r * cols, cols) };
            for t in 0..tokens {
                let d = dy[t * rows + r];
                let xt = &x[t * cols..(t + 1) * cols];
                for c in 0..cols {
                    grow[c] += d * xt[c];
                }
            }
        }
    });
    let dx_ptr = SendPtr(dx.as_mut_ptr());
    pool.run_range(tokens, |range| {
        for t in range {
            let dxt = unsafe { dx_ptr.slice_at(t * cols, cols) };
            dxt.fill(0.0);
            for r in 0..rows {
                let d = dy[t * rows + r];
                let wrow = &w[r * cols..(r + 1) * cols];
                for c in 0..cols {
                    dxt[c] += d * wrow[c];
                }
            }
        }
    });
}

/// VJP of [`multi_head_matmul`], parallel over `(head, row)` weight blocks
/// and over tokens.
#[allow(clippy::too_many_arguments)]
pub fn multi_head_matmul_vjp(
    w: &[f32],
    x: &[f32],
    dy: &[f32],
    grad: &mut [f32],
    dx: &mut [f32],
    heads: usize,
    rows: usize,
    cols: usize,
    tokens: usize,
    pool: &WorkerPool,
) {
    let grad_ptr = SendPtr(grad.as_mut_ptr());
    pool.run_range(heads * rows, |range| {
        for hr in range {
            let (h, r) = (hr / rows, hr % rows);
            let grow = unsafe { grad_ptr.slice_at(hr * cols, cols) };
            for t in 0..tokens {
                let d = dy[t * rows + r];
                let xh = &x[t * heads * cols + h * cols..t * heads * cols + (h + 1) * cols];
                for c in 0..cols {
                    grow[c] += d * xh[c];
                }
            }
        }
    });
    let dx_ptr = SendPtr(dx.as_mut_ptr());
    pool.run_range(tokens, |range| {
        for t in range {
            let dxt = unsafe { dx_ptr.slice_at(t * heads * cols, heads * cols) };
            dxt.fill(0.0);
            for r in 0..rows {
                let d = dy[t * rows + r];
                for h in 0..heads {
                    let wrow = &w[(h * rows + r) * cols..(h * rows + r + 1) * cols];
                    for c in 0..cols {
                        dxt[h * cols + c] += d * wrow[c];
                    }
                }
            }
        }
    });
}

/// VJP of [`rms_norm`]: `dx` parallel over rows, `grad` parallel over
/// columns (after a cheap serial pass for the per-row norms).
#[allow(clippy::too_many_arguments)]
pub fn rms_norm_vjp(
    w: &[f32],
    x: &[f32],
    dy: &[f32],
    grad: &mut [f32],
    dx: &mut [f32],
    n: usize,
    k: usize,
    pool: &WorkerPool,
) {
    let mut norms = vec![0.0f32; k];
    for (row, m) in norms.iter_mut().enumerate() {
        let ss: f32 = x[row * n..(row + 1) * n].iter().map(|v| v * v).sum();
        *m = 1.0 / (ss / n as f32 + RMS_EPS).sqrt();
    }
    let grad_ptr = SendPtr(grad.as_mut_ptr());
    pool.run_range(n, |range| {
        for j in range {
            let gj = unsafe { &mut grad_ptr.slice_at(j, 1)[0] };
            for row in 0..k {
                *gj += dy[row * n + j] * x[row * n + j] * norms[row];
            }
        }
    });
    let dx_ptr = SendPtr(dx.as_mut_ptr());
    pool.run_range(k, |range| {
        for row in range {
            let xr = &x[row * n..(row + 1) * n];
            let dyr = &dy[row * n..(row + 1) * n];
            let dxr = unsafe { dx_ptr.slice_at(row * n, n) };
            let m = norms[row];
            let mut proj = 0.0f32;
            for j in 0..n {
                proj += dyr[j] * (1.0 + w[j]) * xr[j];
            }
            let m3n = m * m * m / n as f32;
            for j in 0..n {
                dxr[j] = (1.0 + w[j]) * m * dyr[j] - m3n * xr[j] * proj;
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Batched forward

/// Batched forward pass; same math as the scalar reference, with the matrix
/// work spread across the pool. Returns the summed negative log-likelihood.
pub fn cross_entropy_forward_batched(
    prompt: &Prompt,
    weights: &ModelWeights<f32>,
    forward: &mut ForwardPass<f32>,
    pool: &WorkerPool,
) -> f32 {
    let config = weights.config().clone();
    let n = prompt.num_positions();
    let d = config.model_dim;
    let v = config.vocab_size;
    assert!(n <= config.seq_len);

    let emb_scale = (d as f32).sqrt();
    let emb = weights.embedder_input_embedding.as_slice();
    let mut x = vec![0.0f32; n * d];
    for t in 0..n {
        let tok = prompt.tokens[t];
        for j in 0..d {
            x[t * d + j] = emb[tok * d + j] * emb_scale;
        }
    }

    for l in 0..config.num_layers() {
        let lc = config.layer_configs[l].clone();
        debug_assert_eq!(lc.kv_heads, 1);
        let (heads, q, f) = (lc.heads, lc.qkv_dim, lc.ff_hidden_dim);
        let qkv_rows = (heads + 2) * q;
        let lw = &weights.layers[l];
        let acts = &mut forward.layers[l];
        acts.input[..n * d].copy_from_slice(&x);

        rms_norm(
            lw.pre_attention_norm_scale.as_slice(),
            &x,
            &mut acts.pre_att_rms_out[..n * d],
            d,
            n,
            pool,
        );
        matmul(
            lw.qkv_einsum_w.as_slice(),
            &acts.pre_att_rms_out[..n * d],
            &mut acts.qkv[..n * qkv_rows],
            qkv_rows,
            d,
            n,
            pool,
        );
        for t in 0..n {
            let row = &mut acts.qkv[t * qkv_rows..(t + 1) * qkv_rows];
            for h in 0..heads {
                rope(&mut row[h * q..(h + 1) * q], q, t);
                for e in &mut row[h * q..(h + 1) * q] {
                    *e *= config.query_scale;
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
                let out = t * heads * q + h * q;
                acts.att_out[out..out + q].fill(0.0);
                for u in 0..=t {
                    let p = probs[u];
                    let vv = &acts.qkv
                        [u * qkv_rows + (heads + 1) * q..u * qkv_rows + (heads + 2) * q];
                    for e in 0..q {
                        acts.att_out[out + e] += p * vv[e];
                    }
                }
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
            pool,
        );
        for i in 0..n * d {
            x[i] += acts.attention_out[i];
        }
        acts.att_residual[..n * d].copy_from_slice(&x);

        rms_norm(
            lw.pre_ffw_norm_scale.as_slice(),
            &x,
            &mut acts.pre_ffw_rms_out[..n * d],
            d,
            n,
            pool,
        );
        matmul(
            lw.gating_einsum_w.as_slice(),
            &acts.pre_ffw_rms_out[..n * d],
            &mut acts.ffw_hidden[..n * 2 * f],
            2 * f,
            d,
            n,
            pool,
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
            pool,
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
        pool,
    );
    matmul(
        emb,
        &forward.final_norm_out[..n * d],
        &mut forward.logits[..n * v],
        v,
        d,
        n,
        pool,
    );
    softcap(config.final_cap, &mut forward.logits[..n * v]);
    forward.probs[..n * v].copy_from_slice(&forward.logits[..n * v]);
    for t in 0..n {
        softmax(&mut forward.probs[t * v..(t + 1) * v]);
    }

    let mut loss = 0.0f32;
    for t in 0..n {
        if prompt.is_scored(t) {
            loss -= forward.probs[t * v + prompt.tokens[t + 1]].ln();
        }
    }
    loss
}

// ---------------------------------------------------------------------------
// Backward

/// Full backward pass over the activations of
/// [`cross_entropy_forward_batched`]. Accumulates weight gradients into
/// `grad` (which the caller zero-initializes once per batch) and uses
/// `backward` as cotangent scratch.
pub fn cross_entropy_backward(
    prompt: &Prompt,
    weights: &ModelWeights<f32>,
    forward: &ForwardPass<f32>,
    grad: &mut ModelWeights<f32>,
    backward: &mut ForwardPass<f32>,
    pool: &WorkerPool,
) {
    let config = weights.config().clone();
    let n = prompt.num_positions();
    let d = config.model_dim;
    let v = config.vocab_size;
    backward.zero_init();

    // Loss -> post-cap logits: softmax cross-entropy collapses to p - onehot.
    for t in 0..n {
        let row = &mut backward.logits[t * v..(t + 1) * v];
        if !prompt.is_scored(t) {
            continue;
        }
        row.copy_from_slice(&forward.probs[t * v..(t + 1) * v]);
        row[prompt.tokens[t + 1]] -= 1.0;
    }
    softcap_backward(
        config.final_cap,
        &forward.logits[..n * v],
        &mut backward.logits[..n * v],
    );

    let emb = weights.embedder_input_embedding.as_slice();
    matmul_vjp(
        emb,
        &forward.final_norm_out[..n * d],
        &backward.logits[..n * v],
        grad.embedder_input_embedding.as_mut_slice(),
        &mut backward.final_norm_out[..n * d],
        v,
        d,
        n,
        pool,
    );
    rms_norm_vjp(
        weights.final_norm_scale.as_slice(),
        &forward.final_layer_out[..n * d],
        &backward.final_norm_out[..n * d],
        grad.final_norm_scale.as_mut_slice(),
        &mut backward.final_layer_out[..n * d],
        d,
        n,
        pool,
    );

    // Gradient flowing into the residual stream below the final norm.
    let mut dx = backward.final_layer_out[..n * d].to_vec();

    for l in (0..config.num_layers()).rev() {
        let lc = config.layer_configs[l].clone();
        let (heads, q, f) = (lc.heads, lc.qkv_dim, lc.ff_hidden_dim);
        let qkv_rows = (heads + 2) * q;
        let lw = &weights.layers[l];
        let glw = &mut grad.layers[l];
        let acts = &forward.layers[l];
        let bacts = &mut backward.layers[l];

        // FFN block, reversed. `dx` is d(layer output); the residual add
        // passes it through to both branches.
        matmul_vjp(
            lw.linear_w.as_slice(),
            &acts.ffw_hidden_gated[..n * f],
            &dx,
            glw.linear_w.as_mut_slice(),
            &mut bacts.ffw_hidden_gated[..n * f],
            d,
            f,
            n,
            pool,
        );
        for t in 0..n {
            for j in 0..f {
                let gate = acts.ffw_hidden[t * 2 * f + j];
                let up = acts.ffw_hidden[t * 2 * f + f + j];
                let dg = bacts.ffw_hidden_gated[t * f + j];
                bacts.ffw_hidden[t * 2 * f + j] = dg * up * gelu_derivative(gate);
                bacts.ffw_hidden[t * 2 * f + f + j] = dg * gelu(gate);
            }
        }
        matmul_vjp(
            lw.gating_einsum_w.as_slice(),
            &acts.pre_ffw_rms_out[..n * d],
            &bacts.ffw_hidden[..n * 2 * f],
            glw.gating_einsum_w.as_mut_slice(),
            &mut bacts.pre_ffw_rms_out[..n * d],
            2 * f,
            d,
            n,
            pool,
        );
        rms_norm_vjp(
            lw.pre_ffw_norm_scale.as_slice(),
            &acts.att_residual[..n * d],
            &bacts.pre_ffw_rms_out[..n * d],
            glw.pre_ffw_norm_scale.as_mut_slice(),
            &mut bacts.att_residual[..n * d],
            d,
            n,
            pool,
        );
        let mut dx_mid = dx;
        for i in 0..n * d {
            dx_mid[i] += bacts.att_residual[i];
        }

        // Attention block, reversed.
        multi_head_matmul_vjp(
            lw.attn_vec_einsum_w.as_slice(),
            &acts.att_out[..n * heads * q],
            &dx_mid,
            glw.attn_vec_einsum_w.as_mut_slice(),
            &mut bacts.att_out[..n * heads * q],
            heads,
            d,
            q,
            n,
            pool,
        );
        bacts.qkv[..n * qkv_rows].fill(0.0);
        for t in 0..n {
            for h in 0..heads {
                let probs = &acts.att_probs[(t * heads + h) * config.seq_len..][..=t];
                let scores = &acts.att_scores[(t * heads + h) * config.seq_len..][..=t];
                let dout = &bacts.att_out[t * heads * q + h * q..t * heads * q + (h + 1) * q];

                let mut dprobs = vec![0.0f32; t + 1];
                for (u, dp) in dprobs.iter_mut().enumerate() {
                    let vv = &acts.qkv
                        [u * qkv_rows + (heads + 1) * q..u * qkv_rows + (heads + 2) * q];
                    *dp = dot(dout, vv);
                    // d(value): probs[u] routes dout back to v_u.
                    for e in 0..q {
                        bacts.qkv[u * qkv_rows + (heads + 1) * q + e] += probs[u] * dout[e];
                    }
                }
                let mut sum_pd = 0.0f32;
                for u in 0..=t {
                    sum_pd += probs[u] * dprobs[u];
                }
                for u in 0..=t {
                    let mut ds = probs[u] * (dprobs[u] - sum_pd);
                    if config.att_cap > 0.0 {
                        let r = scores[u] / config.att_cap;
                        ds *= 1.0 - r * r;
                    }
                    let qv = &acts.qkv[t * qkv_rows + h * q..t * qkv_rows + (h + 1) * q];
                    let kv = &acts.qkv[u * qkv_rows + heads * q..u * qkv_rows + (heads + 1) * q];
                    for e in 0..q {
                        bacts.qkv[t * qkv_rows + h * q + e] += ds * kv[e];
                        bacts.qkv[u * qkv_rows + heads * q + e] += ds * qv[e];
                    }
                }
            }
        }
        for t in 0..n {
            let row = &mut bacts.qkv[t * qkv_rows..(t + 1) * qkv_rows];
            for h in 0..heads {
                for e in &mut row[h * q..(h + 1) * q] {
                    *e *= config.query_scale;
                }
                rope_backward(&mut row[h * q..(h + 1) * q], q, t);
            }
            rope_backward(&mut row[heads * q..(heads + 1) * q], q, t);
        }
        matmul_vjp(
            lw.qkv_einsum_w.as_slice(),
            &acts.pre_att_rms_out[..n * d],
            &bacts.qkv[..n * qkv_rows],
            glw.qkv_einsum_w.as_mut_slice(),
            &mut bacts.pre_att_rms_out[..n * d],
            qkv_rows,
            d,
            n,
            pool,
        );
        rms_norm_vjp(
            lw.pre_attention_norm_scale.as_slice(),
            &acts.input[..n * d],
            &bacts.pre_att_rms_out[..n * d],
            glw.pre_attention_norm_scale.as_mut_slice(),
            &mut bacts.input[..n * d],
            d,
            n,
            pool,
        );
        dx = dx_mid;
        for i in 0..n * d {
            dx[i] += bacts.input[i];
        }
    }

    // Embedding lookup backward.
    let emb_scale = (d as f32).sqrt();
    let gemb = grad.embedder_input_embedding.as_mut_slice();
    for t in 0..n {
        let tok = prompt.tokens[t];
        for j in 0..d {
            gemb[tok * d + j] += dx[t * d + j] * emb_scale;
        }
    }
}

/// Pulls a cotangent back through [`softcap`] using the stored post-cap
/// values: `d/dx cap*tanh(x/cap) = 1 - (y/cap)^2`.
fn softcap_backward(cap: f32, y: &[f32], dy: &mut [f32]) {
    if cap <= 0.0 {
        return;
    }
    for (d, &yv) in dy.iter_mut().zip(y) {
        let r = yv / cap;
        *d *= 1.0 - r * r;
    }
}
