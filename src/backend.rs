// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core model trait for hooked forward passes.
//!
//! [`HookedModel`] is the only capability the IIA machinery needs from a
//! model: a forward pass that captures and patches activations as
//! described by a [`HookSpec`], plus a little metadata.

use std::fmt;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::circuit::Circuit;
use crate::error::Result;
use crate::hooks::{HookCache, HookSpec};

// ---------------------------------------------------------------------------
// OutputKind
// ---------------------------------------------------------------------------

/// What the model's output logits represent.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// A distribution over discrete classes (softmax over the last axis).
    #[default]
    Categorical,
    /// Real-valued outputs (e.g. tracr numerical MLPs).
    Numerical,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Categorical => write!(f, "categorical"),
            Self::Numerical => write!(f, "numerical"),
        }
    }
}

// ---------------------------------------------------------------------------
// ModelRole
// ---------------------------------------------------------------------------

/// Which side of a model pair an operation ran on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelRole {
    /// The reference model whose circuit is known.
    Base,
    /// The model whose circuit is being tested.
    Hypothesis,
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base => write!(f, "base"),
            Self::Hypothesis => write!(f, "hypothesis"),
        }
    }
}

// ---------------------------------------------------------------------------
// HookedModel trait
// ---------------------------------------------------------------------------

/// Interface for models with hook-aware forward passes.
///
/// The caller specifies captures and interventions via [`HookSpec`] and
/// the model returns a [`HookCache`] with the logits and any requested
/// activations. Models hold no hook state between calls, so a shared
/// `&dyn HookedModel` can run concurrent passes as long as the
/// implementation itself is `Sync`.
pub trait HookedModel: Send + Sync {
    /// Number of transformer blocks.
    fn num_layers(&self) -> usize;

    /// Number of attention heads per block.
    fn num_heads(&self) -> usize;

    /// Residual stream width (`d_model`).
    fn hidden_size(&self) -> usize;

    /// Kind of output produced by [`forward`](Self::forward).
    fn output_kind(&self) -> OutputKind;

    /// Whether the output is a categorical distribution.
    fn is_categorical(&self) -> bool {
        self.output_kind() == OutputKind::Categorical
    }

    /// Forward pass with optional captures and interventions.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, pos]` -- token IDs
    /// - returns: [`HookCache`] whose output is `[batch, pos, d_vocab_out]`
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`](crate::IiaError::Config) for an
    /// incompatible input batch, [`IiaError::NodeNotFound`](crate::IiaError::NodeNotFound)
    /// if an intervention target never fires, and
    /// [`IiaError::Model`](crate::IiaError::Model) on tensor failures.
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;

    /// The full ACDC circuit over this model's hook points.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`](crate::IiaError::Config) for a model
    /// without layers or heads.
    fn full_circuit(&self) -> Result<Circuit> {
        Circuit::full_acdc(self.num_layers(), self.num_heads())
    }
}
