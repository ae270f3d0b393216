// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hooked decoder-only transformer without layer norms.
//!
//! Matches the `TransformerLens` `HookedTransformer` layout used by
//! tracr-compiled and IIT-trained benchmark models: learned positional
//! embeddings, split per-head attention inputs (`use_split_qkv_input`),
//! per-head results (`use_attn_result`), a plain MLP, and an unembedding.
//! Every intermediate activation is routed through a [`HookRun`], so any
//! of them can be captured or patched.
//!
//! Weights use `TransformerLens` state-dict names:
//!
//! | Name | Shape |
//! |------|-------|
//! | `embed.W_E` | `[d_vocab, d_model]` |
//! | `pos_embed.W_pos` | `[n_ctx, d_model]` |
//! | `blocks.{i}.attn.W_Q` / `W_K` / `W_V` | `[n_heads, d_model, d_head]` |
//! | `blocks.{i}.attn.b_Q` / `b_K` / `b_V` | `[n_heads, d_head]` |
//! | `blocks.{i}.attn.W_O` | `[n_heads, d_head, d_model]` |
//! | `blocks.{i}.attn.b_O` | `[d_model]` |
//! | `blocks.{i}.mlp.W_in` / `b_in` | `[d_model, d_mlp]` / `[d_mlp]` |
//! | `blocks.{i}.mlp.W_out` / `b_out` | `[d_mlp, d_model]` / `[d_model]` |
//! | `unembed.W_U` / `b_U` | `[d_model, d_vocab_out]` / `[d_vocab_out]` |

pub(crate) mod attention;
pub(crate) mod mlp;

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::backend::{HookedModel, OutputKind};
use crate::config::TransformerConfig;
use crate::error::{IiaError, Result};
use crate::hooks::{HookCache, HookPoint, HookRun, HookSpec};

use self::attention::{Attention, causal_mask};
use self::mlp::Mlp;

// ---------------------------------------------------------------------------
// TransformerBlock
// ---------------------------------------------------------------------------

/// A single transformer block.
struct TransformerBlock {
    /// Self-attention.
    attention: Attention,
    /// Feed-forward block.
    mlp: Mlp,
}

impl TransformerBlock {
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    fn load(config: &TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        Ok(Self {
            attention: Attention::load(config, vb.pp("attn"))?,
            mlp: Mlp::load(config, vb.pp("mlp"))?,
        })
    }
}

// ---------------------------------------------------------------------------
// HookedTransformer
// ---------------------------------------------------------------------------

/// Config-driven hooked transformer.
pub struct HookedTransformer {
    /// Token embedding `[d_vocab, d_model]`.
    w_e: Tensor,
    /// Positional embedding `[n_ctx, d_model]`.
    w_pos: Tensor,
    /// Transformer blocks.
    blocks: Vec<TransformerBlock>,
    /// Unembedding `[d_model, d_vocab_out]`.
    w_u: Tensor,
    /// Unembedding bias `[d_vocab_out]`.
    b_u: Tensor,
    /// Model configuration.
    config: TransformerConfig,
}

impl HookedTransformer {
    /// Load a transformer from a [`VarBuilder`].
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`] if the configuration is invalid and
    /// [`IiaError::Model`] if a weight is missing or misshapen.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: TransformerConfig, vb: VarBuilder<'_>) -> Result<Self> {
        config.validate()?;

        let w_e = vb.pp("embed").get((config.d_vocab, config.d_model), "W_E")?;
        let w_pos = vb.pp("pos_embed").get((config.n_ctx, config.d_model), "W_pos")?;

        let mut blocks = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            blocks.push(TransformerBlock::load(&config, vb.pp(format!("blocks.{i}")))?);
        }

        let vb_unembed = vb.pp("unembed");
        let w_u = vb_unembed.get((config.d_model, config.d_vocab_out), "W_U")?;
        let b_u = vb_unembed.get(config.d_vocab_out, "b_U")?;

        debug!(
            n_layers = config.n_layers,
            n_heads = config.n_heads,
            d_model = config.d_model,
            "loaded hooked transformer"
        );

        Ok(Self {
            w_e,
            w_pos,
            blocks,
            w_u,
            b_u,
            config,
        })
    }

    /// Build a transformer from an in-memory state dict.
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub fn from_tensors(
        config: TransformerConfig,
        tensors: HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::load(config, vb)
    }

    /// Load a transformer from a `.safetensors` file.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Io`] if the file cannot be read, otherwise the
    /// same as [`load`](Self::load).
    pub fn from_safetensors(
        config: TransformerConfig,
        path: impl AsRef<Path>,
        device: &Device,
    ) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let vb = VarBuilder::from_buffered_safetensors(data, DType::F32, device)?;
        Self::load(config, vb)
    }

    /// Build a transformer with seeded random weights (`config.seed`).
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub fn random(config: TransformerConfig, device: &Device) -> Result<Self> {
        let tensors = random_weights(&config, device)?;
        Self::from_tensors(config, tensors, device)
    }

    /// Access the model configuration.
    #[must_use]
    pub const fn config(&self) -> &TransformerConfig {
        &self.config
    }

    /// Check an input batch and return `(batch, seq_len)`.
    fn check_input(&self, input_ids: &Tensor) -> Result<(usize, usize)> {
        if input_ids.dtype() != DType::U32 {
            return Err(IiaError::Config(format!(
                "input ids must be u32, got {:?}",
                input_ids.dtype()
            )));
        }
        let (batch, seq_len) = input_ids.dims2().map_err(|_| {
            IiaError::Config(format!(
                "input ids must be [batch, pos], got {:?}",
                input_ids.dims()
            ))
        })?;
        if batch == 0 || seq_len == 0 {
            return Err(IiaError::Config("input batch is empty".into()));
        }
        if seq_len > self.config.n_ctx {
            return Err(IiaError::Config(format!(
                "sequence length {seq_len} exceeds n_ctx {}",
                self.config.n_ctx
            )));
        }
        let max_id = input_ids.flatten_all()?.max(0)?.to_scalar::<u32>()?;
        if usize::try_from(max_id).unwrap_or(usize::MAX) >= self.config.d_vocab {
            return Err(IiaError::Config(format!(
                "token id {max_id} out of range for d_vocab {}",
                self.config.d_vocab
            )));
        }
        Ok((batch, seq_len))
    }
}

// ---------------------------------------------------------------------------
// HookedModel implementation
// ---------------------------------------------------------------------------

impl HookedModel for HookedTransformer {
    fn num_layers(&self) -> usize {
        self.config.n_layers
    }

    fn num_heads(&self) -> usize {
        self.config.n_heads
    }

    fn hidden_size(&self) -> usize {
        self.config.d_model
    }

    fn output_kind(&self) -> OutputKind {
        self.config.output_kind
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let (batch, seq_len) = self.check_input(input_ids)?;
        let device = input_ids.device();
        let d_model = self.config.d_model;
        let mut run = HookRun::new(hooks);

        // --- Embedding ---
        let embed = self
            .w_e
            .index_select(&input_ids.flatten_all()?, 0)?
            .reshape((batch, seq_len, d_model))?;
        let embed = run.apply(HookPoint::Embed, embed)?;
        let pos = self
            .w_pos
            .narrow(0, 0, seq_len)?
            .unsqueeze(0)?
            .repeat((batch, 1, 1))?;
        let pos = run.apply(HookPoint::PosEmbed, pos)?;
        let mut resid = (embed + pos)?;

        let mask = causal_mask(seq_len, device)?;

        // --- Blocks ---
        for (layer, block) in self.blocks.iter().enumerate() {
            resid = run.apply(HookPoint::ResidPre(layer), resid)?;

            let attn_out = block.attention.forward(&resid, &mask, layer, &mut run)?;
            let attn_out = run.apply(HookPoint::AttnOut(layer), attn_out)?;
            let resid_mid = run.apply(HookPoint::ResidMid(layer), (&resid + attn_out)?)?;

            let mlp_in = run.apply(HookPoint::MlpIn(layer), resid_mid.clone())?;
            let mlp_out = block.mlp.forward(&mlp_in, layer, &mut run)?;
            let mlp_out = run.apply(HookPoint::MlpOut(layer), mlp_out)?;

            resid = run.apply(HookPoint::ResidPost(layer), (resid_mid + mlp_out)?)?;
        }

        // --- Unembed ---
        let logits = resid.broadcast_matmul(&self.w_u)?.broadcast_add(&self.b_u)?;
        run.finish(logits)
    }
}

// ---------------------------------------------------------------------------
// Random initialisation
// ---------------------------------------------------------------------------

/// Seeded random state dict for `config`.
///
/// Weight matrices are uniform in `±1/sqrt(fan_in)`; biases are zero.
/// The same `config.seed` always yields the same weights.
///
/// # Errors
///
/// Returns [`IiaError::Model`] if tensor creation fails.
pub fn random_weights(
    config: &TransformerConfig,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut tensors = HashMap::new();

    let (h, d, dh, m) = (config.n_heads, config.d_model, config.d_head, config.d_mlp);

    let mut uniform = |shape: &[usize], fan_in: usize| -> Result<Tensor> {
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        let len: usize = shape.iter().product();
        let data: Vec<f32> = (0..len).map(|_| rng.gen_range(-bound..bound)).collect();
        Ok(Tensor::from_vec(data, shape, device)?)
    };

    tensors.insert("embed.W_E".to_string(), uniform(&[config.d_vocab, d], d)?);
    tensors.insert("pos_embed.W_pos".to_string(), uniform(&[config.n_ctx, d], d)?);

    for i in 0..config.n_layers {
        let attn = format!("blocks.{i}.attn");
        for name in ["W_Q", "W_K", "W_V"] {
            tensors.insert(format!("{attn}.{name}"), uniform(&[h, d, dh], d)?);
        }
        tensors.insert(format!("{attn}.W_O"), uniform(&[h, dh, d], h * dh)?);

        let mlp = format!("blocks.{i}.mlp");
        tensors.insert(format!("{mlp}.W_in"), uniform(&[d, m], d)?);
        tensors.insert(format!("{mlp}.W_out"), uniform(&[m, d], m)?);
    }

    tensors.insert(
        "unembed.W_U".to_string(),
        uniform(&[d, config.d_vocab_out], d)?,
    );

    for i in 0..config.n_layers {
        let attn = format!("blocks.{i}.attn");
        for name in ["b_Q", "b_K", "b_V"] {
            tensors.insert(format!("{attn}.{name}"), Tensor::zeros((h, dh), DType::F32, device)?);
        }
        tensors.insert(format!("{attn}.b_O"), Tensor::zeros(d, DType::F32, device)?);
        tensors.insert(format!("blocks.{i}.mlp.b_in"), Tensor::zeros(m, DType::F32, device)?);
        tensors.insert(format!("blocks.{i}.mlp.b_out"), Tensor::zeros(d, DType::F32, device)?);
    }
    tensors.insert(
        "unembed.b_U".to_string(),
        Tensor::zeros(config.d_vocab_out, DType::F32, device)?,
    );

    Ok(tensors)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::hooks::Intervention;

    fn tiny_config() -> TransformerConfig {
        let json = serde_json::json!({
            "n_layers": 2, "n_heads": 2, "d_model": 8, "d_head": 4,
            "d_mlp": 16, "d_vocab": 5, "d_vocab_out": 3, "n_ctx": 4, "seed": 7
        });
        TransformerConfig::from_json(&json).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        let diff: Vec<f32> = (a - b).unwrap().abs().unwrap().flatten_all().unwrap().to_vec1().unwrap();
        diff.into_iter().fold(0.0, f32::max)
    }

    fn tiny_input(device: &Device) -> Tensor {
        Tensor::new(&[[0_u32, 1, 2, 3], [4, 3, 2, 1]], device).unwrap()
    }

    #[test]
    fn forward_output_shape() {
        let device = Device::Cpu;
        let model = HookedTransformer::random(tiny_config(), &device).unwrap();
        let cache = model.forward(&tiny_input(&device), &HookSpec::new()).unwrap();
        assert_eq!(cache.output().dims(), &[2, 4, 3]);
    }

    #[test]
    fn captures_per_head_shapes() {
        let device = Device::Cpu;
        let model = HookedTransformer::random(tiny_config(), &device).unwrap();
        let mut hooks = HookSpec::new();
        hooks
            .capture(HookPoint::QInput(0))
            .capture(HookPoint::AttnResult(1))
            .capture(HookPoint::MlpOut(0))
            .capture(HookPoint::AttnPattern(0));
        let cache = model.forward(&tiny_input(&device), &hooks).unwrap();

        assert_eq!(cache.require(&HookPoint::QInput(0)).unwrap().dims(), &[2, 4, 2, 8]);
        assert_eq!(cache.require(&HookPoint::AttnResult(1)).unwrap().dims(), &[2, 4, 2, 8]);
        assert_eq!(cache.require(&HookPoint::MlpOut(0)).unwrap().dims(), &[2, 4, 8]);
        assert_eq!(cache.require(&HookPoint::AttnPattern(0)).unwrap().dims(), &[2, 2, 4, 4]);
    }

    #[test]
    fn seeded_weights_are_deterministic() {
        let device = Device::Cpu;
        let a = HookedTransformer::random(tiny_config(), &device).unwrap();
        let b = HookedTransformer::random(tiny_config(), &device).unwrap();
        let input = tiny_input(&device);
        let la: Vec<f32> = a.forward(&input, &HookSpec::new()).unwrap().into_output().flatten_all().unwrap().to_vec1().unwrap();
        let lb: Vec<f32> = b.forward(&input, &HookSpec::new()).unwrap().into_output().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(la, lb);
    }

    #[test]
    fn patching_a_hook_changes_downstream_only() {
        let device = Device::Cpu;
        let model = HookedTransformer::random(tiny_config(), &device).unwrap();
        let input = tiny_input(&device);

        let mut capture = HookSpec::new();
        capture.capture(HookPoint::MlpOut(1));
        let clean = model.forward(&input, &capture).unwrap();
        let mlp_out = clean.require(&HookPoint::MlpOut(1)).unwrap();

        // Re-inserting the clean value leaves the logits untouched.
        let mut same = HookSpec::new();
        same.intervene(HookPoint::MlpOut(1), Intervention::Replace(mlp_out.clone()));
        let patched = model.forward(&input, &same).unwrap();
        let diff = max_abs_diff(clean.output(), patched.output());
        assert!(diff < 1e-6);

        let mut zeroed = HookSpec::new();
        zeroed.intervene(
            HookPoint::MlpOut(1),
            Intervention::Replace(mlp_out.zeros_like().unwrap()),
        );
        let patched = model.forward(&input, &zeroed).unwrap();
        let diff = max_abs_diff(clean.output(), patched.output());
        assert!(diff > 0.0);
    }

    #[test]
    fn rejects_bad_inputs() {
        let device = Device::Cpu;
        let model = HookedTransformer::random(tiny_config(), &device).unwrap();
        let hooks = HookSpec::new();

        let too_long = Tensor::zeros((1, 5), DType::U32, &device).unwrap();
        assert!(matches!(model.forward(&too_long, &hooks), Err(IiaError::Config(_))));

        let out_of_vocab = Tensor::new(&[[9_u32, 0]], &device).unwrap();
        assert!(matches!(model.forward(&out_of_vocab, &hooks), Err(IiaError::Config(_))));

        let floats = Tensor::zeros((1, 2), DType::F32, &device).unwrap();
        assert!(matches!(model.forward(&floats, &hooks), Err(IiaError::Config(_))));
    }

    #[test]
    fn missing_weight_is_a_model_error() {
        let device = Device::Cpu;
        let config = tiny_config();
        let mut tensors = random_weights(&config, &device).unwrap();
        tensors.remove("blocks.1.mlp.W_in");
        let result = HookedTransformer::from_tensors(config, tensors, &device);
        assert!(matches!(result, Err(IiaError::Model(_))));
    }
}
