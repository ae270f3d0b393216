// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single-node interventions.

use candle_core::Tensor;

use crate::backend::HookedModel;
use crate::error::Result;
use crate::hooks::HookSpec;

use super::ablation::ReplacementPlan;

/// Run `model` on `inputs` with the node in `plan` patched.
///
/// Whole-tensor nodes are replaced outright; head-indexed nodes overwrite
/// only their slice on the head axis, leaving the other heads as
/// computed. The intervention lives in a [`HookSpec`] owned by this call,
/// so nothing outlives the pass whether it succeeds or fails.
///
/// # Shapes
/// - `inputs`: `[batch, pos]`
/// - returns: `[batch, pos, d_vocab_out]` -- patched logits
///
/// # Errors
///
/// Returns [`IiaError::NodeNotFound`](crate::IiaError::NodeNotFound) if the
/// node's hook never fires, [`IiaError::Intervention`](crate::IiaError::Intervention)
/// for a shape or head-range mismatch, and any forward-pass error.
pub fn run_with_intervention(
    model: &dyn HookedModel,
    plan: &ReplacementPlan,
    inputs: &Tensor,
) -> Result<Tensor> {
    let mut hooks = HookSpec::new();
    hooks.intervene(plan.node().name(), plan.intervention());
    Ok(model.forward(inputs, &hooks)?.into_output())
}

/// Run `model` on `inputs` with no interventions.
///
/// # Errors
///
/// Propagates forward-pass errors.
pub fn run_clean(model: &dyn HookedModel, inputs: &Tensor) -> Result<Tensor> {
    Ok(model.forward(inputs, &HookSpec::new())?.into_output())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::IiaError;
    use crate::circuit::CircuitNode;
    use crate::config::TransformerConfig;
    use crate::hooks::HookPoint;
    use crate::transformer::HookedTransformer;
    use candle_core::Device;

    fn tiny() -> (HookedTransformer, Tensor) {
        let device = Device::Cpu;
        let json = serde_json::json!({
            "n_layers": 1, "n_heads": 2, "d_model": 4, "d_vocab": 5, "n_ctx": 3, "seed": 3
        });
        let model =
            HookedTransformer::random(TransformerConfig::from_json(&json).unwrap(), &device).unwrap();
        let inputs = Tensor::new(&[[0_u32, 1, 2], [2, 3, 4]], &device).unwrap();
        (model, inputs)
    }

    #[test]
    fn unknown_node_fails_instead_of_returning_clean_logits() {
        let (model, inputs) = tiny();
        let plan = ReplacementPlan::new(
            CircuitNode::new("blocks.7.hook_mlp_out", None),
            Tensor::zeros((2, 3, 4), candle_core::DType::F32, &Device::Cpu).unwrap(),
        );
        let err = run_with_intervention(&model, &plan, &inputs).unwrap_err();
        assert!(matches!(err, IiaError::NodeNotFound { .. }));
    }

    #[test]
    fn head_patch_with_own_activation_is_a_no_op() {
        let (model, inputs) = tiny();
        let mut capture = HookSpec::new();
        capture.capture(HookPoint::AttnResult(0));
        let clean = model.forward(&inputs, &capture).unwrap();
        let result = clean.require(&HookPoint::AttnResult(0)).unwrap().clone();

        let plan = ReplacementPlan::new(CircuitNode::head(&HookPoint::AttnResult(0), 1), result);
        let patched = run_with_intervention(&model, &plan, &inputs).unwrap();
        let a: Vec<f32> = clean.output().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = patched.flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }
}
