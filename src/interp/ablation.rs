// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ablation policies and replacement plans.
//!
//! An [`AblationType`] decides where the replacement value for a node
//! comes from; a [`ReplacementPlan`] is the materialised result for one
//! node on one model. Plans are plain data, handed to
//! [`run_with_intervention`](super::intervention::run_with_intervention).

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::cache::ActivationCache;
use crate::circuit::CircuitNode;
use crate::error::{IiaError, Result};
use crate::hooks::Intervention;

// ---------------------------------------------------------------------------
// AblationType
// ---------------------------------------------------------------------------

/// Source of the replacement activation.
///
/// ```
/// use candle_iia::AblationType;
///
/// let ablation: AblationType = "mean".parse().unwrap();
/// assert_eq!(ablation, AblationType::Mean);
/// assert_eq!(ablation.key(), "iia_mean");
/// assert!("gaussian".parse::<AblationType>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AblationType {
    /// All-zero tensor of the clean activation's shape.
    Zero,
    /// Clean activation averaged over the batch, repeated back to batch size.
    Mean,
    /// The corrupted-input activation, unchanged.
    Resample,
}

impl AblationType {
    /// Every ablation type, in sweep order.
    pub const ALL: [Self; 3] = [Self::Zero, Self::Mean, Self::Resample];

    /// Report field name (`iia_zero`, `iia_mean`, `iia_resample`).
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Zero => "iia_zero",
            Self::Mean => "iia_mean",
            Self::Resample => "iia_resample",
        }
    }
}

impl fmt::Display for AblationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero => write!(f, "zero"),
            Self::Mean => write!(f, "mean"),
            Self::Resample => write!(f, "resample"),
        }
    }
}

impl FromStr for AblationType {
    type Err = IiaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "zero" => Ok(Self::Zero),
            "mean" => Ok(Self::Mean),
            "resample" => Ok(Self::Resample),
            other => Err(IiaError::UnsupportedAblationType(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Replacement selection
// ---------------------------------------------------------------------------

/// Replacement activation for `node` under `ablation`.
///
/// Reads the full tensor at the node's hook; head-indexed nodes take their
/// slice later, at intervention time.
///
/// # Shapes
/// - returns: same shape as the clean activation (or the corrupted one for
///   [`AblationType::Resample`])
///
/// # Errors
///
/// Returns [`IiaError::MissingActivation`] if the cache the policy reads
/// from has no entry for the node's hook. Resample never falls back to
/// the clean cache.
pub fn select_replacement(
    ablation: AblationType,
    node: &CircuitNode,
    clean: &ActivationCache,
    corrupted: &ActivationCache,
) -> Result<Tensor> {
    match ablation {
        AblationType::Resample => Ok(corrupted.get(node.name())?.clone()),
        AblationType::Mean => batch_mean(clean.get(node.name())?),
        AblationType::Zero => Ok(clean.get(node.name())?.zeros_like()?),
    }
}

/// Average over axis 0 and repeat back to the original batch size.
///
/// # Shapes
/// - `activation`: `[batch, ...]`
/// - returns: `[batch, ...]`, every row equal to the batch mean
fn batch_mean(activation: &Tensor) -> Result<Tensor> {
    let dims = activation.dims();
    let Some((&batch, rest)) = dims.split_first() else {
        return Err(IiaError::Intervention(
            "mean ablation needs a batch axis, got a scalar".into(),
        ));
    };
    let reps: Vec<usize> = std::iter::once(batch)
        .chain(std::iter::repeat_n(1, rest.len()))
        .collect();
    Ok(activation.mean_keepdim(0)?.repeat(reps)?)
}

// ---------------------------------------------------------------------------
// ReplacementPlan
// ---------------------------------------------------------------------------

/// Node plus the tensor to patch into it, for one model.
#[derive(Debug, Clone)]
pub struct ReplacementPlan {
    /// Intervention site.
    node: CircuitNode,
    /// Full-shape replacement tensor.
    replacement: Tensor,
}

impl ReplacementPlan {
    /// Pair a node with an explicit replacement.
    #[must_use]
    pub const fn new(node: CircuitNode, replacement: Tensor) -> Self {
        Self { node, replacement }
    }

    /// Build the plan for `node` from one model's caches.
    ///
    /// # Errors
    ///
    /// Same as [`select_replacement`].
    pub fn build(
        ablation: AblationType,
        node: &CircuitNode,
        clean: &ActivationCache,
        corrupted: &ActivationCache,
    ) -> Result<Self> {
        let replacement = select_replacement(ablation, node, clean, corrupted)?;
        Ok(Self::new(node.clone(), replacement))
    }

    /// Intervention site.
    #[must_use]
    pub const fn node(&self) -> &CircuitNode {
        &self.node
    }

    /// Replacement tensor.
    #[must_use]
    pub const fn replacement(&self) -> &Tensor {
        &self.replacement
    }

    /// The hook intervention this plan performs.
    #[must_use]
    pub fn intervention(&self) -> Intervention {
        match self.node.index() {
            Some(head) => Intervention::ReplaceHead {
                head,
                replacement: self.replacement.clone(),
            },
            None => Intervention::Replace(self.replacement.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn caches(shape: &[usize]) -> (ActivationCache, ActivationCache) {
        let device = Device::Cpu;
        let len: usize = shape.iter().product();
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let data: Vec<f32> = (0..len).map(|i| i as f32).collect();
        let mut clean = ActivationCache::new();
        clean.insert("hook", Tensor::from_vec(data, shape, &device).unwrap());
        let mut corrupted = ActivationCache::new();
        corrupted.insert("hook", Tensor::ones(shape, DType::F32, &device).unwrap());
        (clean, corrupted)
    }

    #[test]
    fn parse_round_trip_and_unknown() {
        for ablation in AblationType::ALL {
            assert_eq!(ablation.to_string().parse::<AblationType>().unwrap(), ablation);
        }
        let err = "noise".parse::<AblationType>().unwrap_err();
        assert!(matches!(err, IiaError::UnsupportedAblationType(ref s) if s == "noise"));
    }

    #[test]
    fn mean_keeps_shape_and_rows_match() {
        let (clean, corrupted) = caches(&[2, 3]);
        let node = CircuitNode::new("hook", None);
        let mean = select_replacement(AblationType::Mean, &node, &clean, &corrupted).unwrap();
        assert_eq!(mean.dims(), &[2, 3]);
        let rows: Vec<Vec<f32>> = mean.to_vec2().unwrap();
        assert_eq!(rows[0], vec![1.5, 2.5, 3.5]);
        assert_eq!(rows[0], rows[1]);
    }

    #[test]
    fn zero_and_resample_sources() {
        let (clean, corrupted) = caches(&[2, 2, 2]);
        let node = CircuitNode::new("hook", Some(1));

        let zero = select_replacement(AblationType::Zero, &node, &clean, &corrupted).unwrap();
        let zero_sum: f32 = zero.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(zero.dims(), &[2, 2, 2]);
        assert_eq!(zero_sum, 0.0);

        let resample = select_replacement(AblationType::Resample, &node, &clean, &corrupted).unwrap();
        let resample_sum: f32 = resample.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(resample_sum, 8.0);
    }

    #[test]
    fn plan_intervention_follows_node_index() {
        let (clean, corrupted) = caches(&[1, 1, 2, 1]);
        let whole = ReplacementPlan::build(
            AblationType::Zero,
            &CircuitNode::new("hook", None),
            &clean,
            &corrupted,
        )
        .unwrap();
        assert!(matches!(whole.intervention(), Intervention::Replace(_)));

        let head = ReplacementPlan::build(
            AblationType::Zero,
            &CircuitNode::new("hook", Some(1)),
            &clean,
            &corrupted,
        )
        .unwrap();
        assert!(matches!(head.intervention(), Intervention::ReplaceHead { head: 1, .. }));
    }
}
