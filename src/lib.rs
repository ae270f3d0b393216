// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-iia
//!
//! Interchange intervention accuracy (IIA) for transformer circuits in
//! Rust, built on [candle](https://github.com/huggingface/candle).
//!
//! Given a *base* model whose circuit is known and a *hypothesis* model
//! whose circuit is claimed, candle-iia ablates every node of the full
//! ACDC-granularity circuit in both models (zero, mean and resample
//! ablation), compares their output distributions with KL divergence, and
//! reports per-node scores annotated with claimed-circuit membership.
//!
//! ## Pieces
//!
//! - [`HookedModel`] -- forward pass with per-call captures and
//!   interventions ([`HookSpec`]); [`HookedTransformer`] is a norm-free
//!   `TransformerLens`-style implementation with split per-head inputs.
//! - [`Circuit`] / [`CircuitNode`] -- intervention sites and the full
//!   circuit builder.
//! - [`ActivationCache`] -- one forward pass worth of node activations.
//! - [`AblationType`], [`ReplacementPlan`], [`run_with_intervention`] --
//!   replacement selection and single-node patching.
//! - [`evaluate_iia`], [`evaluate_iia_on_all_ablation_types`],
//!   [`evaluate_case`] -- the sweep; [`IiaReport`] -- its result.

#![warn(missing_docs)]

pub mod backend;
pub mod cache;
pub mod circuit;
pub mod config;
pub mod dataset;
pub mod error;
pub mod hooks;
pub mod interp;
pub mod report;
pub mod transformer;

// --- Core re-exports ---
pub use backend::{HookedModel, ModelRole, OutputKind};
pub use error::{IiaError, Result};
pub use hooks::{HEAD_AXIS, HookCache, HookPoint, HookRun, HookSpec, Intervention};

// --- Model ---
pub use config::{
    Activation, IiaConfig, LowLevelOptions, TransformerConfig, compression_ratio_for_case,
    low_level_config,
};
pub use transformer::{HookedTransformer, random_weights};

// --- Circuits, caches, data ---
pub use cache::ActivationCache;
pub use circuit::{Circuit, CircuitNode};
pub use dataset::{BenchmarkCase, CaseDataset, SyntheticCase, TokenSampler};

// --- IIA ---
pub use interp::ablation::{AblationType, ReplacementPlan, select_replacement};
pub use interp::divergence::categorical_kl;
pub use interp::iia::{IiaCaches, evaluate_case, evaluate_iia, evaluate_iia_on_all_ablation_types};
pub use interp::intervention::{run_clean, run_with_intervention};
pub use report::{IiaReport, NodeIiaRecord, ReportBuilder};
