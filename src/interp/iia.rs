// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interchange intervention accuracy (IIA) evaluation.
//!
//! For every node of the base model's full circuit, both models are run on
//! the clean batch with that node ablated, and the divergence between
//! their output distributions is the node's score. A low score means the
//! hypothesis model reacts to losing the node the same way the base model
//! does.
//!
//! ```no_run
//! use candle_core::Device;
//! use candle_iia::{
//!     Circuit, HookedTransformer, TokenSampler, TransformerConfig,
//!     evaluate_iia_on_all_ablation_types,
//! };
//!
//! # fn main() -> candle_iia::Result<()> {
//! let device = Device::Cpu;
//! let json = serde_json::json!({
//!     "n_layers": 2, "n_heads": 2, "d_model": 8, "d_vocab": 5, "n_ctx": 4
//! });
//! let config = TransformerConfig::from_json(&json)?;
//! let base = HookedTransformer::random(config.clone(), &device)?;
//! let hypothesis = HookedTransformer::random(TransformerConfig { seed: 1, ..config }, &device)?;
//!
//! let sampler = TokenSampler::new(5, 4);
//! let clean = sampler.sample(64, 42, &device)?;
//! let corrupted = sampler.sample(64, 43, &device)?;
//! let claimed = Circuit::new();
//!
//! let report = evaluate_iia_on_all_ablation_types(&base, &hypothesis, &clean, &corrupted, &claimed)?;
//! println!("{}", report.to_json()?);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use candle_core::Device;
use tracing::{debug, info};

use crate::backend::{HookedModel, ModelRole};
use crate::cache::ActivationCache;
use crate::circuit::{Circuit, CircuitNode};
use crate::config::IiaConfig;
use crate::dataset::{BenchmarkCase, CaseDataset};
use crate::error::{IiaError, Result};
use crate::report::{IiaReport, ReportBuilder};

use super::ablation::{AblationType, ReplacementPlan};
use super::divergence::categorical_kl;
use super::intervention::run_with_intervention;

// ---------------------------------------------------------------------------
// IiaCaches
// ---------------------------------------------------------------------------

/// The four activation caches one IIA sweep reads from.
///
/// Built once per sweep and shared read-only across every node and
/// ablation type.
#[derive(Debug, Clone)]
pub struct IiaCaches {
    /// Base model on clean inputs.
    pub base_clean: ActivationCache,
    /// Base model on corrupted inputs.
    pub base_corrupted: ActivationCache,
    /// Hypothesis model on clean inputs.
    pub hypothesis_clean: ActivationCache,
    /// Hypothesis model on corrupted inputs.
    pub hypothesis_corrupted: ActivationCache,
}

impl IiaCaches {
    /// Run each model once per batch, caching its full circuit.
    ///
    /// # Errors
    ///
    /// Wraps [`ActivationCache::build`] failures in [`IiaError::Cache`],
    /// naming the model and the batch that failed.
    pub fn build(
        base: &dyn HookedModel,
        hypothesis: &dyn HookedModel,
        clean: &CaseDataset,
        corrupted: &CaseDataset,
    ) -> Result<Self> {
        let base_circuit = base.full_circuit()?;
        let hypothesis_circuit = hypothesis.full_circuit()?;
        Ok(Self {
            base_clean: role_cache(base, ModelRole::Base, &base_circuit, clean, "clean")?,
            base_corrupted: role_cache(base, ModelRole::Base, &base_circuit, corrupted, "corrupted")?,
            hypothesis_clean: role_cache(
                hypothesis,
                ModelRole::Hypothesis,
                &hypothesis_circuit,
                clean,
                "clean",
            )?,
            hypothesis_corrupted: role_cache(
                hypothesis,
                ModelRole::Hypothesis,
                &hypothesis_circuit,
                corrupted,
                "corrupted",
            )?,
        })
    }

    /// Clean and corrupted caches of one side.
    #[must_use]
    pub const fn for_role(&self, role: ModelRole) -> (&ActivationCache, &ActivationCache) {
        match role {
            ModelRole::Base => (&self.base_clean, &self.base_corrupted),
            ModelRole::Hypothesis => (&self.hypothesis_clean, &self.hypothesis_corrupted),
        }
    }
}

/// Build one cache, tagging failures with the model and batch.
fn role_cache(
    model: &dyn HookedModel,
    role: ModelRole,
    circuit: &Circuit,
    batch: &CaseDataset,
    dataset: &str,
) -> Result<ActivationCache> {
    ActivationCache::build(model, batch.inputs(), circuit).map_err(|e| IiaError::Cache {
        model: role.to_string(),
        dataset: dataset.to_string(),
        source: Box::new(e),
    })
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Score every node of the base model's full circuit under one ablation.
///
/// Nodes are visited in sorted order. Returns node string key to score.
///
/// # Errors
///
/// Returns [`IiaError::UnsupportedModelKind`] if the base model is not
/// categorical. Any per-node failure aborts the sweep and comes back as
/// [`IiaError::Evaluation`] naming the node, model and ablation type.
pub fn evaluate_iia(
    base: &dyn HookedModel,
    hypothesis: &dyn HookedModel,
    clean: &CaseDataset,
    caches: &IiaCaches,
    ablation: AblationType,
) -> Result<BTreeMap<String, f32>> {
    if !base.is_categorical() {
        return Err(IiaError::UnsupportedModelKind(format!(
            "only categorical models can be scored under {ablation} ablation, base model is {}",
            base.output_kind()
        )));
    }

    let full_circuit = base.full_circuit()?;
    info!(
        ablation = %ablation,
        nodes = full_circuit.len(),
        batch = clean.batch_size(),
        "running IIA evaluation"
    );

    let mut results = BTreeMap::new();
    for node in full_circuit.nodes() {
        let score = evaluate_node(base, hypothesis, clean, caches, ablation, node)?;
        debug!(node = %node, score, "node evaluated");
        results.insert(node.to_string(), score);
    }
    Ok(results)
}

/// Ablate one node in both models and score the output divergence.
///
/// Failures inside one model's patched run carry that model's role. A
/// divergence failure means both runs succeeded but their logits do not
/// line up, so it is labelled `pair`.
fn evaluate_node(
    base: &dyn HookedModel,
    hypothesis: &dyn HookedModel,
    clean: &CaseDataset,
    caches: &IiaCaches,
    ablation: AblationType,
    node: &CircuitNode,
) -> Result<f32> {
    let base_logits = patched_logits(base, ModelRole::Base, clean, caches, ablation, node)?;
    let hypothesis_logits =
        patched_logits(hypothesis, ModelRole::Hypothesis, clean, caches, ablation, node)?;
    categorical_kl(&base_logits, &hypothesis_logits).map_err(|e| at_node(node, PAIR, ablation, e))
}

/// Logits of one model on the clean batch with `node` ablated.
fn patched_logits(
    model: &dyn HookedModel,
    role: ModelRole,
    clean: &CaseDataset,
    caches: &IiaCaches,
    ablation: AblationType,
    node: &CircuitNode,
) -> Result<candle_core::Tensor> {
    let (clean_cache, corrupted_cache) = caches.for_role(role);
    ReplacementPlan::build(ablation, node, clean_cache, corrupted_cache)
        .and_then(|plan| run_with_intervention(model, &plan, clean.inputs()))
        .map_err(|e| at_node(node, role, ablation, e))
}

/// Error label for failures that belong to neither model alone.
const PAIR: &str = "pair";

/// Attach node, model and ablation context to an error.
fn at_node(
    node: &CircuitNode,
    model: impl fmt::Display,
    ablation: AblationType,
    source: IiaError,
) -> IiaError {
    IiaError::Evaluation {
        node: node.to_string(),
        model: model.to_string(),
        ablation: ablation.to_string(),
        source: Box::new(source),
    }
}

/// Run [`evaluate_iia`] for every ablation type and assemble the report.
///
/// # Errors
///
/// Returns [`IiaError::Config`] if `claimed` has a node outside the base
/// model's full circuit; otherwise propagates cache and evaluation
/// failures. The first failure aborts the whole sweep.
pub fn evaluate_iia_on_all_ablation_types(
    base: &dyn HookedModel,
    hypothesis: &dyn HookedModel,
    clean: &CaseDataset,
    corrupted: &CaseDataset,
    claimed: &Circuit,
) -> Result<IiaReport> {
    let full_circuit = base.full_circuit()?;
    if let Some(stray) = claimed.nodes().find(|node| !full_circuit.contains(node)) {
        return Err(IiaError::Config(format!(
            "claimed circuit node `{stray}` is not in the full circuit"
        )));
    }

    let caches = IiaCaches::build(base, hypothesis, clean, corrupted)?;

    let mut report = ReportBuilder::new(&full_circuit, claimed);
    for ablation in AblationType::ALL {
        let scores = evaluate_iia(base, hypothesis, clean, &caches, ablation)?;
        report.record(ablation, scores)?;
    }
    report.finish()
}

/// Sample a case's clean and corrupted batches and run the full sweep.
///
/// # Errors
///
/// Same as [`evaluate_iia_on_all_ablation_types`], plus any dataset or
/// claimed-circuit error from `case`.
pub fn evaluate_case(
    case: &dyn BenchmarkCase,
    base: &dyn HookedModel,
    hypothesis: &dyn HookedModel,
    config: &IiaConfig,
    device: &Device,
) -> Result<IiaReport> {
    info!(case = case.name(), data_size = config.data_size, "evaluating case");
    let clean = case.clean_data(config.data_size, config.clean_seed, device)?;
    let corrupted = case.corrupted_data(config.data_size, config.corrupted_seed, device)?;
    let claimed = case.claimed_circuit()?;
    evaluate_iia_on_all_ablation_types(base, hypothesis, &clean, &corrupted, &claimed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::TransformerConfig;
    use crate::dataset::TokenSampler;
    use crate::transformer::HookedTransformer;

    fn model(seed: u64, n_heads: usize) -> HookedTransformer {
        sized_model(seed, n_heads, 5, 5)
    }

    fn sized_model(seed: u64, n_heads: usize, d_vocab: usize, d_vocab_out: usize) -> HookedTransformer {
        let json = serde_json::json!({
            "n_layers": 1, "n_heads": n_heads, "d_model": 4, "d_head": 2,
            "d_vocab": d_vocab, "d_vocab_out": d_vocab_out, "n_ctx": 3, "seed": seed
        });
        HookedTransformer::random(TransformerConfig::from_json(&json).unwrap(), &Device::Cpu).unwrap()
    }

    #[test]
    fn one_score_per_full_circuit_node() {
        let (base, hypothesis) = (model(0, 2), model(1, 2));
        let sampler = TokenSampler::new(5, 3);
        let clean = sampler.sample(6, 42, &Device::Cpu).unwrap();
        let corrupted = sampler.sample(6, 43, &Device::Cpu).unwrap();
        let caches = IiaCaches::build(&base, &hypothesis, &clean, &corrupted).unwrap();

        let scores = evaluate_iia(&base, &hypothesis, &clean, &caches, AblationType::Mean).unwrap();
        assert_eq!(scores.len(), base.full_circuit().unwrap().len());
        assert!(scores.values().all(|s| s.is_finite() && *s >= -1e-6));
    }

    #[test]
    fn mismatched_hypothesis_reports_node_and_model() {
        // The hypothesis has one head, so head 1 of the base circuit has no slice.
        let (base, hypothesis) = (model(0, 2), model(1, 1));
        let sampler = TokenSampler::new(5, 3);
        let clean = sampler.sample(4, 42, &Device::Cpu).unwrap();
        let corrupted = sampler.sample(4, 43, &Device::Cpu).unwrap();
        let caches = IiaCaches::build(&base, &hypothesis, &clean, &corrupted).unwrap();

        let err = evaluate_iia(&base, &hypothesis, &clean, &caches, AblationType::Zero).unwrap_err();
        match err {
            IiaError::Evaluation { node, model, ablation, .. } => {
                assert!(node.ends_with("[1]"));
                assert_eq!(model, "hypothesis");
                assert_eq!(ablation, "zero");
            }
            other => unreachable!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cache_failure_names_the_rejecting_model() {
        // Token 4 is valid for the base vocabulary but not the hypothesis one.
        let (base, hypothesis) = (sized_model(0, 2, 5, 5), sized_model(1, 2, 3, 5));
        let clean = CaseDataset::from_rows(&[vec![0, 1, 2], vec![2, 1, 0]], &Device::Cpu).unwrap();
        let corrupted = CaseDataset::from_rows(&[vec![4, 3, 1], vec![0, 4, 2]], &Device::Cpu).unwrap();

        let err = evaluate_iia_on_all_ablation_types(&base, &hypothesis, &clean, &corrupted, &Circuit::new())
            .unwrap_err();
        match err {
            IiaError::Cache { model, dataset, source } => {
                assert_eq!(model, "hypothesis");
                assert_eq!(dataset, "corrupted");
                assert!(matches!(*source, IiaError::Config(_)));
            }
            other => unreachable!("unexpected error: {other}"),
        }
    }

    #[test]
    fn numerical_base_error_names_the_ablation() {
        let json = serde_json::json!({
            "n_layers": 1, "n_heads": 2, "d_model": 4, "d_head": 2,
            "d_vocab": 5, "n_ctx": 3, "output_kind": "numerical"
        });
        let base = HookedTransformer::random(TransformerConfig::from_json(&json).unwrap(), &Device::Cpu).unwrap();
        let hypothesis = model(1, 2);
        let sampler = TokenSampler::new(5, 3);
        let clean = sampler.sample(4, 42, &Device::Cpu).unwrap();
        let corrupted = sampler.sample(4, 43, &Device::Cpu).unwrap();
        let caches = IiaCaches::build(&base, &hypothesis, &clean, &corrupted).unwrap();

        let err = evaluate_iia(&base, &hypothesis, &clean, &caches, AblationType::Resample).unwrap_err();
        assert!(matches!(err, IiaError::UnsupportedModelKind(_)));
        assert!(err.to_string().contains("resample"));
    }

    #[test]
    fn incomparable_outputs_are_blamed_on_the_pair() {
        let (base, hypothesis) = (sized_model(0, 2, 5, 3), sized_model(1, 2, 5, 2));
        let sampler = TokenSampler::new(5, 3);
        let clean = sampler.sample(4, 42, &Device::Cpu).unwrap();
        let corrupted = sampler.sample(4, 43, &Device::Cpu).unwrap();
        let caches = IiaCaches::build(&base, &hypothesis, &clean, &corrupted).unwrap();

        let err = evaluate_iia(&base, &hypothesis, &clean, &caches, AblationType::Zero).unwrap_err();
        match err {
            IiaError::Evaluation { model, ablation, .. } => {
                assert_eq!(model, "pair");
                assert_eq!(ablation, "zero");
            }
            other => unreachable!("unexpected error: {other}"),
        }
    }

    #[test]
    fn claimed_nodes_outside_full_circuit_are_rejected() {
        let (base, hypothesis) = (model(0, 2), model(1, 2));
        let sampler = TokenSampler::new(5, 3);
        let clean = sampler.sample(4, 42, &Device::Cpu).unwrap();
        let corrupted = sampler.sample(4, 43, &Device::Cpu).unwrap();
        let claimed = Circuit::from_nodes([CircuitNode::new("blocks.4.hook_mlp_out", None)]);

        let err = evaluate_iia_on_all_ablation_types(&base, &hypothesis, &clean, &corrupted, &claimed)
            .unwrap_err();
        assert!(matches!(err, IiaError::Config(_)));
    }
}
