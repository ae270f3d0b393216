// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook points, per-call hook specifications and single-pass hook state.
//!
//! - [`HookPoint`] names an activation site (`TransformerLens` naming).
//! - [`HookSpec`] lists what one forward pass should capture and patch.
//! - [`HookRun`] carries that pass's bookkeeping inside the model.
//! - [`HookCache`] is what the pass hands back: logits plus captures.
//!
//! Models never store hooks. A [`HookSpec`] is borrowed for exactly one
//! [`HookedModel::forward`](crate::HookedModel::forward) call, so a patch
//! cannot outlive its pass on any exit path, error returns included.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{IiaError, Result};

/// Axis holding the attention-head sub-unit in per-head activations
/// (`[batch, pos, head, ...]`).
pub const HEAD_AXIS: usize = 2;

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Activation site in a forward pass.
///
/// Displays and parses with `TransformerLens` names, which are also the
/// names ACDC-style circuit nodes use.
///
/// ```
/// use candle_iia::HookPoint;
///
/// let hook = HookPoint::QInput(1);
/// assert_eq!(hook.to_string(), "blocks.1.hook_q_input");
/// assert_eq!("blocks.1.hook_q_input".parse::<HookPoint>().unwrap(), hook);
/// assert!(matches!(HookPoint::from("unembed.hook_x"), HookPoint::Custom(_)));
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookPoint {
    /// Token embedding (`hook_embed`).
    Embed,
    /// Positional embedding (`hook_pos_embed`).
    PosEmbed,
    /// Residual stream entering block `i`.
    ResidPre(usize),
    /// Per-head copy of the residual stream feeding the queries.
    QInput(usize),
    /// Per-head copy of the residual stream feeding the keys.
    KInput(usize),
    /// Per-head copy of the residual stream feeding the values.
    VInput(usize),
    /// Queries, `[batch, pos, head, d_head]`.
    AttnQ(usize),
    /// Keys, `[batch, pos, head, d_head]`.
    AttnK(usize),
    /// Values, `[batch, pos, head, d_head]`.
    AttnV(usize),
    /// Masked, scaled scores, `[batch, head, query, key]`.
    AttnScores(usize),
    /// Softmaxed scores.
    AttnPattern(usize),
    /// Pattern-weighted values, `[batch, pos, head, d_head]`.
    AttnZ(usize),
    /// Each head's output in model space, `[batch, pos, head, d_model]`.
    AttnResult(usize),
    /// Summed attention output.
    AttnOut(usize),
    /// Residual stream between attention and MLP.
    ResidMid(usize),
    /// MLP input.
    MlpIn(usize),
    /// MLP pre-activation.
    MlpPre(usize),
    /// MLP post-activation.
    MlpPost(usize),
    /// MLP output.
    MlpOut(usize),
    /// Residual stream leaving block `i`.
    ResidPost(usize),
    /// Any other name; never fired by [`HookedTransformer`](crate::HookedTransformer).
    Custom(String),
}

/// Per-block hooks: name suffix after `blocks.{i}.` and constructor.
const BLOCK_HOOKS: &[(&str, fn(usize) -> HookPoint)] = &[
    ("hook_resid_pre", HookPoint::ResidPre),
    ("hook_q_input", HookPoint::QInput),
    ("hook_k_input", HookPoint::KInput),
    ("hook_v_input", HookPoint::VInput),
    ("attn.hook_q", HookPoint::AttnQ),
    ("attn.hook_k", HookPoint::AttnK),
    ("attn.hook_v", HookPoint::AttnV),
    ("attn.hook_attn_scores", HookPoint::AttnScores),
    ("attn.hook_pattern", HookPoint::AttnPattern),
    ("attn.hook_z", HookPoint::AttnZ),
    ("attn.hook_result", HookPoint::AttnResult),
    ("hook_attn_out", HookPoint::AttnOut),
    ("hook_resid_mid", HookPoint::ResidMid),
    ("hook_mlp_in", HookPoint::MlpIn),
    ("mlp.hook_pre", HookPoint::MlpPre),
    ("mlp.hook_post", HookPoint::MlpPost),
    ("hook_mlp_out", HookPoint::MlpOut),
    ("hook_resid_post", HookPoint::ResidPost),
];

impl HookPoint {
    /// Block index and name suffix, for per-block hooks only.
    fn block_parts(&self) -> Option<(usize, &'static str)> {
        let parts = match *self {
            Self::ResidPre(i) => (i, "hook_resid_pre"),
            Self::QInput(i) => (i, "hook_q_input"),
            Self::KInput(i) => (i, "hook_k_input"),
            Self::VInput(i) => (i, "hook_v_input"),
            Self::AttnQ(i) => (i, "attn.hook_q"),
            Self::AttnK(i) => (i, "attn.hook_k"),
            Self::AttnV(i) => (i, "attn.hook_v"),
            Self::AttnScores(i) => (i, "attn.hook_attn_scores"),
            Self::AttnPattern(i) => (i, "attn.hook_pattern"),
            Self::AttnZ(i) => (i, "attn.hook_z"),
            Self::AttnResult(i) => (i, "attn.hook_result"),
            Self::AttnOut(i) => (i, "hook_attn_out"),
            Self::ResidMid(i) => (i, "hook_resid_mid"),
            Self::MlpIn(i) => (i, "hook_mlp_in"),
            Self::MlpPre(i) => (i, "mlp.hook_pre"),
            Self::MlpPost(i) => (i, "mlp.hook_post"),
            Self::MlpOut(i) => (i, "hook_mlp_out"),
            Self::ResidPost(i) => (i, "hook_resid_post"),
            Self::Embed | Self::PosEmbed | Self::Custom(_) => return None,
        };
        Some(parts)
    }

    /// Resolve a name; anything unrecognised becomes [`HookPoint::Custom`].
    fn parse_name(name: &str) -> Self {
        match name {
            "hook_embed" => return Self::Embed,
            "hook_pos_embed" => return Self::PosEmbed,
            _ => {}
        }
        name.strip_prefix("blocks.")
            .and_then(|rest| rest.split_once('.'))
            .and_then(|(layer, suffix)| {
                let layer = layer.parse::<usize>().ok()?;
                BLOCK_HOOKS
                    .iter()
                    .find(|(known, _)| *known == suffix)
                    .map(|(_, make)| make(layer))
            })
            .unwrap_or_else(|| Self::Custom(name.to_string()))
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self, self.block_parts()) {
            (_, Some((layer, suffix))) => write!(f, "blocks.{layer}.{suffix}"),
            (Self::Embed, None) => f.write_str("hook_embed"),
            (Self::PosEmbed, None) => f.write_str("hook_pos_embed"),
            (Self::Custom(name), None) => f.write_str(name),
            // block_parts covers every remaining variant
            (_, None) => Ok(()),
        }
    }
}

impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::parse_name(s))
    }
}

impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        Self::parse_name(s)
    }
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

/// Activation patch applied where a hook fires.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Intervention {
    /// Swap in `replacement` for the whole activation.
    Replace(Tensor),

    /// Overwrite one head slice (axis [`HEAD_AXIS`]) with the matching
    /// slice of `replacement`; the other heads keep their computed values.
    ReplaceHead {
        /// Head index along [`HEAD_AXIS`].
        head: usize,
        /// Full-shape tensor the slice is taken from.
        replacement: Tensor,
    },
}

impl Intervention {
    /// Apply the patch to a live activation.
    ///
    /// # Shapes
    /// - `activation`: any shape
    /// - replacement: same shape as `activation`
    /// - returns: same shape as `activation`
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Intervention`] on a shape mismatch or an
    /// out-of-range head, and [`IiaError::Model`] if a tensor op fails.
    pub fn apply(&self, activation: &Tensor) -> Result<Tensor> {
        match self {
            Self::Replace(replacement) => {
                ensure_same_shape(activation, replacement)?;
                Ok(replacement.clone())
            }
            Self::ReplaceHead { head, replacement } => {
                ensure_same_shape(activation, replacement)?;
                let Some(&n_heads) = activation.dims().get(HEAD_AXIS) else {
                    return Err(IiaError::Intervention(format!(
                        "head patch needs an activation with a head axis, got {:?}",
                        activation.dims()
                    )));
                };
                if *head >= n_heads {
                    return Err(IiaError::Intervention(format!(
                        "head {head} out of range for {n_heads} heads"
                    )));
                }
                let slice = replacement.narrow(HEAD_AXIS, *head, 1)?;
                Ok(activation.slice_scatter(&slice, HEAD_AXIS, *head)?)
            }
        }
    }
}

fn ensure_same_shape(activation: &Tensor, replacement: &Tensor) -> Result<()> {
    if activation.dims() == replacement.dims() {
        return Ok(());
    }
    Err(IiaError::Intervention(format!(
        "replacement {:?} does not fit activation {:?}",
        replacement.dims(),
        activation.dims()
    )))
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Captures and patches requested for one forward pass.
///
/// An empty spec costs the forward pass nothing.
///
/// ```
/// use candle_iia::{HookPoint, HookSpec};
///
/// let mut hooks = HookSpec::new();
/// hooks.capture(HookPoint::ResidPre(0)).capture("blocks.0.attn.hook_result");
/// assert_eq!(hooks.num_captures(), 2);
/// assert_eq!(hooks.num_interventions(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Sites whose (post-patch) value is returned.
    captures: BTreeSet<HookPoint>,
    /// Patches per site, applied in insertion order.
    interventions: BTreeMap<HookPoint, Vec<Intervention>>,
}

impl HookSpec {
    /// Empty specification.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for the activation at `hook`.
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Patch the activation at `hook`.
    pub fn intervene<H: Into<HookPoint>>(
        &mut self,
        hook: H,
        intervention: Intervention,
    ) -> &mut Self {
        self.interventions
            .entry(hook.into())
            .or_default()
            .push(intervention);
        self
    }

    /// Whether `hook` is captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// Whether nothing is captured or patched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.interventions.is_empty()
    }

    /// Number of captured sites.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Number of patches across all sites.
    #[must_use]
    pub fn num_interventions(&self) -> usize {
        self.interventions.values().map(Vec::len).sum()
    }

    /// Patches registered at `hook`, in order.
    #[must_use]
    pub fn interventions_at(&self, hook: &HookPoint) -> &[Intervention] {
        self.interventions.get(hook).map_or(&[], Vec::as_slice)
    }

    /// Sites with at least one patch.
    pub fn intervention_targets(&self) -> impl Iterator<Item = &HookPoint> {
        self.interventions.keys()
    }
}

// ---------------------------------------------------------------------------
// HookRun
// ---------------------------------------------------------------------------

/// Hook state for one forward pass.
///
/// A model opens a `HookRun` at the top of `forward`, sends every
/// activation through [`apply`](Self::apply), and closes it with
/// [`finish`](Self::finish). An early error return simply drops it.
#[derive(Debug)]
pub struct HookRun<'a> {
    spec: &'a HookSpec,
    captures: BTreeMap<HookPoint, Tensor>,
    /// Patch targets that have not fired yet.
    pending: BTreeSet<&'a HookPoint>,
}

impl<'a> HookRun<'a> {
    /// Open a pass.
    #[must_use]
    pub fn new(spec: &'a HookSpec) -> Self {
        Self {
            spec,
            captures: BTreeMap::new(),
            pending: spec.intervention_targets().collect(),
        }
    }

    /// Fire `hook` with the activation the model computed.
    ///
    /// Returns the value the rest of the pass should use: the patched one
    /// if `hook` has interventions. That same value is what gets captured.
    ///
    /// # Errors
    ///
    /// Propagates [`Intervention::apply`] failures.
    pub fn apply(&mut self, hook: HookPoint, activation: Tensor) -> Result<Tensor> {
        if self.spec.is_empty() {
            return Ok(activation);
        }
        let patches = self.spec.interventions_at(&hook);
        let mut value = activation;
        for patch in patches {
            value = patch.apply(&value)?;
        }
        if !patches.is_empty() {
            self.pending.remove(&hook);
        }
        if self.spec.is_captured(&hook) {
            self.captures.insert(hook, value.clone());
        }
        Ok(value)
    }

    /// Close the pass.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::NodeNotFound`] for the first patch target that
    /// never fired; a misnamed node must not yield unpatched logits.
    pub fn finish(self, output: Tensor) -> Result<HookCache> {
        if let Some(hook) = self.pending.first() {
            return Err(IiaError::NodeNotFound {
                hook: hook.to_string(),
            });
        }
        Ok(HookCache {
            output,
            captures: self.captures,
        })
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Output of a hooked forward pass.
#[derive(Debug)]
pub struct HookCache {
    /// Logits.
    output: Tensor,
    captures: BTreeMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Logits.
    #[must_use]
    pub const fn output(&self) -> &Tensor {
        &self.output
    }

    /// Take the logits.
    #[must_use]
    pub fn into_output(self) -> Tensor {
        self.output
    }

    /// Captured value at `hook`, if any.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Captured value at `hook`.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Hook`] if `hook` was not captured.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.get(hook)
            .ok_or_else(|| IiaError::Hook(format!("`{hook}` was not captured")))
    }

    /// Split into logits and captures.
    #[must_use]
    pub fn into_parts(self) -> (Tensor, BTreeMap<HookPoint, Tensor>) {
        (self.output, self.captures)
    }

    /// Number of captured sites.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
