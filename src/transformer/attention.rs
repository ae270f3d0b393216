// SPDX-License-Identifier: MIT OR Apache-2.0

//! Multi-head attention with split per-head inputs and per-head results.
//!
//! The residual stream is copied once per head before projection, so the
//! query, key and value inputs of each head are separate hook sites
//! (`hook_q_input`, `hook_k_input`, `hook_v_input`), and each head's output
//! is kept separate in model space (`attn.hook_result`) before summing.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::TransformerConfig;
use crate::error::Result;
use crate::hooks::{HookPoint, HookRun};

/// Attention weights for one block.
pub struct Attention {
    /// Query weights `[n_heads, d_model, d_head]`.
    w_q: Tensor,
    /// Query bias `[n_heads, d_head]`.
    b_q: Tensor,
    /// Key weights `[n_heads, d_model, d_head]`.
    w_k: Tensor,
    /// Key bias `[n_heads, d_head]`.
    b_k: Tensor,
    /// Value weights `[n_heads, d_model, d_head]`.
    w_v: Tensor,
    /// Value bias `[n_heads, d_head]`.
    b_v: Tensor,
    /// Output weights `[n_heads, d_head, d_model]`.
    w_o: Tensor,
    /// Output bias `[d_model]`.
    b_o: Tensor,
    /// Number of heads.
    n_heads: usize,
    /// `1 / sqrt(d_head)`.
    scale: f64,
}

impl Attention {
    /// Load attention weights (`W_Q`, `b_Q`, ..., `W_O`, `b_O`).
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Model`](crate::IiaError::Model) if a weight is
    /// missing or has the wrong shape.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let (h, d, dh) = (config.n_heads, config.d_model, config.d_head);

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let scale = 1.0 / (dh as f64).sqrt();

        Ok(Self {
            w_q: vb.get((h, d, dh), "W_Q")?,
            b_q: vb.get((h, dh), "b_Q")?,
            w_k: vb.get((h, d, dh), "W_K")?,
            b_k: vb.get((h, dh), "b_K")?,
            w_v: vb.get((h, d, dh), "W_V")?,
            b_v: vb.get((h, dh), "b_V")?,
            w_o: vb.get((h, dh, d), "W_O")?,
            b_o: vb.get(d, "b_O")?,
            n_heads: h,
            scale,
        })
    }

    /// Run attention for one block, routing every intermediate through `run`.
    ///
    /// # Shapes
    /// - `x`: `[batch, pos, d_model]` -- residual stream
    /// - `mask`: `[1, 1, pos, pos]` -- causal mask
    /// - returns: `[batch, pos, d_model]` -- summed head outputs plus `b_O`
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Model`](crate::IiaError::Model) on tensor
    /// failures and propagates intervention errors from `run`.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        layer: usize,
        run: &mut HookRun<'_>,
    ) -> Result<Tensor> {
        // [batch, pos, d_model] -> [batch, pos, n_heads, d_model]
        let split = x.unsqueeze(2)?.repeat((1, 1, self.n_heads, 1))?.contiguous()?;
        let q_input = run.apply(HookPoint::QInput(layer), split.clone())?;
        let k_input = run.apply(HookPoint::KInput(layer), split.clone())?;
        let v_input = run.apply(HookPoint::VInput(layer), split)?;

        // [batch, pos, n_heads, d_head]
        let q = run.apply(HookPoint::AttnQ(layer), project(&q_input, &self.w_q, &self.b_q)?)?;
        let k = run.apply(HookPoint::AttnK(layer), project(&k_input, &self.w_k, &self.b_k)?)?;
        let v = run.apply(HookPoint::AttnV(layer), project(&v_input, &self.w_v, &self.b_v)?)?;

        // CONTIGUOUS: transpose produces non-unit strides; matmul requires contiguous layout
        let q = q.transpose(1, 2)?.contiguous()?;
        let k_t = k.transpose(1, 2)?.contiguous()?.transpose(2, 3)?;
        let v = v.transpose(1, 2)?.contiguous()?;

        // [batch, n_heads, pos, pos]
        let scores = (q.matmul(&k_t)? * self.scale)?.broadcast_add(mask)?;
        let scores = run.apply(HookPoint::AttnScores(layer), scores)?;
        let pattern = candle_nn::ops::softmax_last_dim(&scores)?;
        let pattern = run.apply(HookPoint::AttnPattern(layer), pattern)?;

        // [batch, n_heads, pos, d_head] -> [batch, pos, n_heads, d_head]
        let z = pattern.matmul(&v)?.transpose(1, 2)?.contiguous()?;
        let z = run.apply(HookPoint::AttnZ(layer), z)?;

        // [batch, n_heads, pos, d_model] -> [batch, pos, n_heads, d_model]
        let result = per_head_matmul(&z.transpose(1, 2)?.contiguous()?, &self.w_o)?
            .transpose(1, 2)?
            .contiguous()?;
        let result = run.apply(HookPoint::AttnResult(layer), result)?;

        Ok(result.sum(2)?.broadcast_add(&self.b_o)?)
    }
}

/// Per-head projection of split inputs.
///
/// # Shapes
/// - `input`: `[batch, pos, n_heads, d_model]`
/// - `weight`: `[n_heads, d_model, d_head]`
/// - `bias`: `[n_heads, d_head]`
/// - returns: `[batch, pos, n_heads, d_head]`
fn project(input: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor> {
    let projected = per_head_matmul(&input.transpose(1, 2)?.contiguous()?, weight)?
        .broadcast_add(&bias.unsqueeze(1)?)?;
    Ok(projected.transpose(1, 2)?.contiguous()?)
}

/// Batched per-head matrix product.
///
/// The weight is materialised per batch element: candle's matmul cannot
/// take a rank-4 operand whose leading axis has stride 0.
///
/// # Shapes
/// - `x`: `[batch, n_heads, pos, d_in]`
/// - `weight`: `[n_heads, d_in, d_out]`
/// - returns: `[batch, n_heads, pos, d_out]`
fn per_head_matmul(x: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let batch = x.dim(0)?;
    let weight = weight.unsqueeze(0)?.repeat((batch, 1, 1, 1))?.contiguous()?;
    Ok(x.matmul(&weight)?)
}

/// Causal mask: `0` on and below the diagonal, `-inf` above.
///
/// # Shapes
/// - returns: `[1, 1, seq_len, seq_len]`
pub fn causal_mask(seq_len: usize, device: &candle_core::Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    let mask = Tensor::from_vec(mask, (seq_len, seq_len), device)?;
    Ok(mask.unsqueeze(0)?.unsqueeze(0)?)
}
