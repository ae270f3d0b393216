// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plain MLP block: `W_out · act(W_in · x + b_in) + b_out`.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::{Activation, TransformerConfig};
use crate::error::Result;
use crate::hooks::{HookPoint, HookRun};

// ---------------------------------------------------------------------------
// Mlp
// ---------------------------------------------------------------------------

/// MLP (feed-forward) block of one layer.
pub struct Mlp {
    /// Input projection `[d_model, d_mlp]`.
    w_in: Tensor,
    /// Input bias `[d_mlp]`.
    b_in: Tensor,
    /// Output projection `[d_mlp, d_model]`.
    w_out: Tensor,
    /// Output bias `[d_model]`.
    b_out: Tensor,
    /// Activation function.
    activation: Activation,
}

impl Mlp {
    /// Load MLP weights (`W_in`, `b_in`, `W_out`, `b_out`).
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Model`](crate::IiaError::Model) if a weight is
    /// missing or has the wrong shape.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let (d, m) = (config.d_model, config.d_mlp);
        Ok(Self {
            w_in: vb.get((d, m), "W_in")?,
            b_in: vb.get(m, "b_in")?,
            w_out: vb.get((m, d), "W_out")?,
            b_out: vb.get(d, "b_out")?,
            activation: config.act_fn,
        })
    }

    /// Forward pass, firing `hook_pre` and `hook_post` for `layer`.
    ///
    /// # Shapes
    /// - `x`: `[batch, pos, d_model]`
    /// - returns: `[batch, pos, d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Model`](crate::IiaError::Model) on tensor
    /// failures and propagates intervention errors from `run`.
    pub fn forward(&self, x: &Tensor, layer: usize, run: &mut HookRun<'_>) -> Result<Tensor> {
        let pre = x.broadcast_matmul(&self.w_in)?.broadcast_add(&self.b_in)?;
        let pre = run.apply(HookPoint::MlpPre(layer), pre)?;
        let post = match self.activation {
            Activation::Relu => pre.relu()?,
            Activation::Gelu => pre.gelu_erf()?,
        };
        let post = run.apply(HookPoint::MlpPost(layer), post)?;
        Ok(post.broadcast_matmul(&self.w_out)?.broadcast_add(&self.b_out)?)
    }
}
