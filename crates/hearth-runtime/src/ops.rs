//! Dense kernels used by the CPU session.
//!
//! All tensors are flat row-major `f32` slices.

use hearth_engine::{EngineError, Result};

fn check_len(what: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(EngineError::shape(what, expected, got));
    }
    Ok(())
}

/// Root mean square normalization of one vector: `x / rms(x) * weight`.
pub fn rms_norm(x: &[f32], weight: &[f32], eps: f32) -> Result<Vec<f32>> {
    check_len("rms_norm weight", weight.len(), x.len())?;
    if x.is_empty() {
        return Ok(Vec::new());
    }
    let mean_sq = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
    let rms = (mean_sq + eps).sqrt();
    Ok(x.iter().zip(weight).map(|(v, w)| v / rms * w).collect())
}

/// `x @ w` where `w` is `[in_dim, out_dim]`.
pub fn matvec(x: &[f32], w: &[f32], in_dim: usize, out_dim: usize) -> Result<Vec<f32>> {
    check_len("matvec input", x.len(), in_dim)?;
    check_len("matvec weight", w.len(), in_dim * out_dim)?;
    let mut out = vec![0.0f32; out_dim];
    for (j, &xj) in x.iter().enumerate() {
        let row = &w[j * out_dim..(j + 1) * out_dim];
        for (o, &wij) in out.iter_mut().zip(row) {
            *o += xj * wij;
        }
    }
    Ok(out)
}

/// Rotate consecutive pairs of every head in `x` by `position`.
///
/// `x` holds `n_heads` heads of `head_dim` each; `head_dim` must be even.
pub fn apply_rope(x: &mut [f32], position: usize, n_heads: usize, head_dim: usize, base: f32) -> Result<()> {
    check_len("rope input", x.len(), n_heads * head_dim)?;
    if head_dim % 2 != 0 {
        return Err(EngineError::Inference(format!(
            "rope needs an even head dim, got {head_dim}"
        )));
    }
    let pos = position as f32;
    for head in x.chunks_exact_mut(head_dim) {
        for i in 0..head_dim / 2 {
            let inv_freq = 1.0 / base.powf(2.0 * i as f32 / head_dim as f32);
            let (sin, cos) = (pos * inv_freq).sin_cos();
            let a = head[2 * i];
            let b = head[2 * i + 1];
            head[2 * i] = a * cos - b * sin;
            head[2 * i + 1] = a * sin + b * cos;
        }
    }
    Ok(())
}

/// Numerically stable in-place softmax.
pub fn softmax_in_place(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return;
    }
    let mut sum = 0.0;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in x.iter_mut() {
            *v /= sum;
        }
    }
}

/// SwiGLU feed-forward: `down(silu(gate(x)) * up(x))`.
pub fn mlp_swiglu(
    x: &[f32],
    w_gate: &[f32],
    w_up: &[f32],
    w_down: &[f32],
    d_model: usize,
    d_ff: usize,
) -> Result<Vec<f32>> {
    let gate = matvec(x, w_gate, d_model, d_ff)?;
    let up = matvec(x, w_up, d_model, d_ff)?;
    let hidden: Vec<f32> = gate
        .iter()
        .zip(&up)
        .map(|(&g, &u)| g / (1.0 + (-g).exp()) * u)
        .collect();
    matvec(&hidden, w_down, d_ff, d_model)
}

/// Grouped-query attention for one query position.
///
/// `q` is `[n_heads, head_dim]`. `keys` and `values` are cache tensors laid
/// out `[kv_heads, seq, head_dim]`; only the first `visible` positions are
/// attended, further restricted by `mask` (0 = masked out).
#[allow(clippy::too_many_arguments)]
pub fn attention(
    q: &[f32],
    keys: &[f32],
    values: &[f32],
    seq: usize,
    visible: usize,
    mask: &[i64],
    n_heads: usize,
    kv_heads: usize,
    head_dim: usize,
) -> Result<Vec<f32>> {
    check_len("attention query", q.len(), n_heads * head_dim)?;
    check_len("attention keys", keys.len(), kv_heads * seq * head_dim)?;
    check_len("attention values", values.len(), kv_heads * seq * head_dim)?;
    if visible > seq || mask.len() < visible {
        return Err(EngineError::Inference(format!(
            "attention window {visible} exceeds cache length {seq} or mask length {}",
            mask.len()
        )));
    }

    let group = n_heads / kv_heads;
    let scale = 1.0 / (head_dim as f32).sqrt();
    let mut out = vec![0.0f32; n_heads * head_dim];
    let mut scores = vec![0.0f32; visible];

    for h in 0..n_heads {
        let kv = h / group;
        let qh = &q[h * head_dim..(h + 1) * head_dim];
        for (t, score) in scores.iter_mut().enumerate() {
            if mask[t] == 0 {
                *score = f32::NEG_INFINITY;
                continue;
            }
            let base = (kv * seq + t) * head_dim;
            let kt = &keys[base..base + head_dim];
            *score = qh.iter().zip(kt).map(|(a, b)| a * b).sum::<f32>() * scale;
        }
        softmax_in_place(&mut scores);

        let oh = &mut out[h * head_dim..(h + 1) * head_dim];
        for (t, &p) in scores.iter().enumerate() {
            if mask[t] == 0 || p == 0.0 {
                continue;
            }
            let base = (kv * seq + t) * head_dim;
            for (o, &v) in oh.iter_mut().zip(&values[base..base + head_dim]) {
                *o += p * v;
            }
        }
    }
    Ok(out)
}
