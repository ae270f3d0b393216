// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation cache for storing the node activations of one forward pass.

use std::collections::BTreeMap;

use candle_core::Tensor;
use tracing::debug;

use crate::backend::HookedModel;
use crate::circuit::Circuit;
use crate::error::{IiaError, Result};
use crate::hooks::{HookPoint, HookSpec};

/// Full-tensor activations at every hook a circuit touches.
///
/// Keys are hook names (head indices are not part of the key; a
/// head-indexed node reads its slice from the whole tensor). Tensors keep
/// their captured shape, `[batch, pos, ...]`.
///
/// # Example
///
/// ```
/// use candle_iia::ActivationCache;
/// use candle_core::{DType, Device, Tensor};
///
/// let mut cache = ActivationCache::new();
/// cache.insert("blocks.0.hook_mlp_out", Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap());
/// assert!(cache.get("blocks.0.hook_mlp_out").is_ok());
/// assert!(cache.get("blocks.0.hook_mlp_in").is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ActivationCache {
    /// Captured activations keyed by hook name.
    activations: BTreeMap<String, Tensor>,
}

impl ActivationCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `model` once on `inputs`, capturing every hook in `circuit`.
    ///
    /// # Shapes
    /// - `inputs`: `[batch, pos]` -- token IDs
    ///
    /// # Errors
    ///
    /// Propagates forward-pass errors, and returns
    /// [`IiaError::MissingActivation`] if the model never fired one of the
    /// circuit's hooks.
    pub fn build(model: &dyn HookedModel, inputs: &Tensor, circuit: &Circuit) -> Result<Self> {
        let names = circuit.hook_names();
        let mut hooks = HookSpec::new();
        for name in &names {
            hooks.capture(*name);
        }

        let (_, mut captures) = model.forward(inputs, &hooks)?.into_parts();

        let mut activations = BTreeMap::new();
        for name in names {
            let tensor = captures
                .remove(&HookPoint::from(name))
                .ok_or_else(|| IiaError::MissingActivation {
                    hook: name.to_string(),
                })?;
            activations.insert(name.to_string(), tensor);
        }

        debug!(
            hooks = activations.len(),
            batch = inputs.dims().first().copied().unwrap_or(0),
            "built activation cache"
        );
        Ok(Self { activations })
    }

    /// Store an activation under a hook name.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.activations.insert(name.into(), tensor);
    }

    /// Look up the activation for a hook name.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::MissingActivation`] if the hook was not cached.
    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.activations
            .get(name)
            .ok_or_else(|| IiaError::MissingActivation {
                hook: name.to_string(),
            })
    }

    /// Whether a hook name is cached.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.activations.contains_key(name)
    }

    /// Cached hook names, sorted.
    pub fn hook_names(&self) -> impl Iterator<Item = &str> {
        self.activations.keys().map(String::as_str)
    }

    /// Number of cached hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.activations.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::circuit::CircuitNode;
    use crate::config::TransformerConfig;
    use crate::transformer::HookedTransformer;
    use candle_core::Device;

    fn tiny_model(device: &Device) -> HookedTransformer {
        let json = serde_json::json!({
            "n_layers": 1, "n_heads": 2, "d_model": 4, "d_vocab": 6, "n_ctx": 3, "seed": 1
        });
        HookedTransformer::random(TransformerConfig::from_json(&json).unwrap(), device).unwrap()
    }

    #[test]
    fn build_caches_every_full_circuit_hook() {
        let device = Device::Cpu;
        let model = tiny_model(&device);
        let circuit = model.full_circuit().unwrap();
        let inputs = Tensor::new(&[[0_u32, 1, 2], [3, 4, 5]], &device).unwrap();

        let cache = ActivationCache::build(&model, &inputs, &circuit).unwrap();
        assert_eq!(cache.len(), circuit.hook_names().len());
        assert_eq!(cache.get("blocks.0.attn.hook_result").unwrap().dims(), &[2, 3, 2, 4]);
        assert_eq!(cache.get("blocks.0.hook_mlp_out").unwrap().dims(), &[2, 3, 4]);
    }

    #[test]
    fn build_fails_for_unknown_hook() {
        let device = Device::Cpu;
        let model = tiny_model(&device);
        let circuit = Circuit::from_nodes([CircuitNode::new("blocks.9.hook_nowhere", None)]);
        let inputs = Tensor::new(&[[0_u32, 1]], &device).unwrap();

        let err = ActivationCache::build(&model, &inputs, &circuit).unwrap_err();
        assert!(matches!(err, IiaError::MissingActivation { .. }));
    }
}
