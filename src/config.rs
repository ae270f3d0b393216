// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model and evaluation configuration.
//!
//! [`TransformerConfig`] carries the `TransformerLens` configuration axes a
//! small hooked transformer needs (tracr-compiled and trained low-level
//! models alike). It parses from a JSON config via
//! [`from_json`](TransformerConfig::from_json).
//!
//! [`IiaConfig`] carries the knobs of one IIA sweep, and
//! [`low_level_config`] derives a low-level model configuration from a
//! high-level one using per-case compression heuristics.
//!
//! ```
//! use candle_iia::TransformerConfig;
//!
//! let json = serde_json::json!({
//!     "n_layers": 2, "n_heads": 4, "d_model": 32, "d_head": 8,
//!     "d_vocab": 10, "n_ctx": 6
//! });
//! let config = TransformerConfig::from_json(&json).unwrap();
//! assert_eq!(config.d_mlp, 128);
//! assert_eq!(config.d_vocab_out, 10);
//! ```

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::OutputKind;
use crate::error::{IiaError, Result};

// ---------------------------------------------------------------------------
// Activation
// ---------------------------------------------------------------------------

/// Activation function used in the MLP.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Rectified linear unit (tracr-compiled models).
    #[default]
    Relu,
    /// Gaussian Error Linear Unit, exact (erf) variant.
    Gelu,
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relu => write!(f, "relu"),
            Self::Gelu => write!(f, "gelu"),
        }
    }
}

impl Activation {
    /// Parse a `TransformerLens` `act_fn` string.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`] for unknown activation names.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "relu" => Ok(Self::Relu),
            "gelu" | "gelu_new" => Ok(Self::Gelu),
            other => Err(IiaError::Config(format!(
                "unsupported act_fn: '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// TransformerConfig
// ---------------------------------------------------------------------------

/// Configuration of a hooked decoder-only transformer without layer norms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Number of transformer blocks.
    pub n_layers: usize,
    /// Attention heads per block.
    pub n_heads: usize,
    /// Residual stream width.
    pub d_model: usize,
    /// Per-head query/key/value width.
    pub d_head: usize,
    /// MLP hidden width.
    pub d_mlp: usize,
    /// Input vocabulary size.
    pub d_vocab: usize,
    /// Output vocabulary size (number of classes for categorical models).
    pub d_vocab_out: usize,
    /// Maximum sequence length.
    pub n_ctx: usize,
    /// MLP activation.
    pub act_fn: Activation,
    /// Whether logits are a categorical distribution.
    pub output_kind: OutputKind,
    /// Seed for weight initialisation.
    pub seed: u64,
}

impl TransformerConfig {
    /// Parse a configuration from a `TransformerLens`-style JSON object.
    ///
    /// Required: `n_layers`, `n_heads`, `d_model`, `d_vocab`, `n_ctx`.
    /// Defaults: `d_head = d_model / n_heads`, `d_mlp = 4 * d_model`,
    /// `d_vocab_out = d_vocab`, `act_fn = "relu"`,
    /// `output_kind = "categorical"`, `seed = 0`.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`] if a required field is missing or the
    /// result fails [`validate`](Self::validate).
    pub fn from_json(config: &Value) -> Result<Self> {
        let n_heads = get_usize(config, "n_heads")?;
        let d_model = get_usize(config, "d_model")?;
        let d_vocab = get_usize(config, "d_vocab")?;
        let d_head_default = if n_heads == 0 { 0 } else { d_model / n_heads };

        let act_fn = match config.get("act_fn").and_then(Value::as_str) {
            Some(name) => Activation::parse(name)?,
            None => Activation::default(),
        };
        let output_kind = match config.get("output_kind") {
            Some(kind) => serde_json::from_value(kind.clone())
                .map_err(|e| IiaError::Config(format!("invalid output_kind: {e}")))?,
            None => OutputKind::default(),
        };

        let parsed = Self {
            n_layers: get_usize(config, "n_layers")?,
            n_heads,
            d_model,
            d_head: get_usize_or(config, "d_head", d_head_default),
            d_mlp: get_usize_or(config, "d_mlp", 4 * d_model),
            d_vocab,
            d_vocab_out: get_usize_or(config, "d_vocab_out", d_vocab),
            n_ctx: get_usize(config, "n_ctx")?,
            act_fn,
            output_kind,
            seed: get_u64_or(config, "seed", 0),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check that every dimension is positive.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`] naming the first zero dimension.
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("d_model", self.d_model),
            ("d_head", self.d_head),
            ("d_mlp", self.d_mlp),
            ("d_vocab", self.d_vocab),
            ("d_vocab_out", self.d_vocab_out),
            ("n_ctx", self.n_ctx),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, value)| *value == 0) {
            return Err(IiaError::Config(format!("{name} must be positive")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// IiaConfig
// ---------------------------------------------------------------------------

/// Settings for one IIA sweep over a benchmark case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IiaConfig {
    /// Number of clean (and corrupted) examples per batch.
    pub data_size: usize,
    /// Seed for sampling the clean dataset.
    pub clean_seed: u64,
    /// Seed for sampling the corrupted dataset.
    pub corrupted_seed: u64,
}

impl Default for IiaConfig {
    fn default() -> Self {
        Self {
            data_size: 1_000,
            clean_seed: 42,
            corrupted_seed: 43,
        }
    }
}

// ---------------------------------------------------------------------------
// Low-level config heuristics
// ---------------------------------------------------------------------------

/// Residual-width compression ratio used when a case has no override.
pub const DEFAULT_COMPRESSION_RATIO: f64 = 2.0;

/// Upper bound on heads when the architecture is randomised.
pub const MAX_HEADS: usize = 8;

/// Extra `d_head` range when the architecture is randomised.
pub const D_HEAD_RAND_RANGE: usize = 8;

/// Per-case compression ratio overrides, keyed by case index.
const COMPRESSION_RATIOS: &[(&str, f64)] = &[
    ("5", 1.8),
    ("18", 1.6),
    ("21", 1.3),
    ("25", 1.5),
    ("34", 1.5),
    ("35", 3.0),
    ("36", 2.5),
    ("37", 2.2),
    ("9", 2.0),
    ("7", 1.5),
    ("23", 1.5),
    ("24", 1.2),
    ("6", 1.2),
];

/// Cases whose residual stream is compressed instead of their head width.
const CASES_WITH_RESID_COMPRESSION: &[&str] = &[
    "5", "18", "21", "25", "26", "29", "34", "35", "36", "37", "9", "7", "23", "22", "28",
];

/// Compression ratio for a case index.
#[must_use]
pub fn compression_ratio_for_case(case_index: &str) -> f64 {
    COMPRESSION_RATIOS
        .iter()
        .find(|(case, _)| *case == case_index)
        .map_or(DEFAULT_COMPRESSION_RATIO, |(_, ratio)| *ratio)
}

/// Options for [`low_level_config`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LowLevelOptions {
    /// Override for the case's compression ratio.
    pub compression_ratio: Option<f64>,
    /// Keep the high-level layer and head counts.
    pub same_size: bool,
    /// Randomise head count and head width within bounds.
    pub randomize: bool,
    /// Seed for every random choice, including the new model's weight seed.
    pub seed: u64,
}

impl Default for LowLevelOptions {
    fn default() -> Self {
        Self {
            compression_ratio: None,
            same_size: false,
            randomize: false,
            seed: 0,
        }
    }
}

/// Derive the configuration of a trainable low-level model from a
/// high-level (compiled) one.
///
/// Non-`same_size` models get at least 2 layers and 4 heads. The width is
/// shrunk by the compression ratio, either on the residual stream (cases
/// listed for residual compression, or `same_size`) or on the head width.
/// `d_mlp` is always `4 * d_model` and the activation is GELU.
///
/// # Errors
///
/// Returns [`IiaError::Config`] if the ratio is not positive or the
/// derived widths collapse to zero.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::as_conversions
)]
pub fn low_level_config(
    high_level: &TransformerConfig,
    case_index: &str,
    options: LowLevelOptions,
) -> Result<TransformerConfig> {
    let compress_resid = CASES_WITH_RESID_COMPRESSION.contains(&case_index) || options.same_size;
    let ratio = options
        .compression_ratio
        .unwrap_or_else(|| compression_ratio_for_case(case_index));
    if ratio.is_nan() || ratio <= 0.0 {
        return Err(IiaError::Config(format!(
            "compression ratio must be positive, got {ratio}"
        )));
    }

    let mut rng = StdRng::seed_from_u64(options.seed);

    let mut n_heads = if options.same_size {
        high_level.n_heads
    } else {
        high_level.n_heads.max(4)
    };
    // PROMOTE: widths are small integers; f64 division then floor matches integer semantics
    let (mut d_model, mut d_head) = if compress_resid {
        let d_model = (high_level.d_model as f64 / ratio).floor() as usize;
        (d_model, (d_model / n_heads).max(1))
    } else {
        let d_head = ((high_level.d_head as f64 / ratio).floor() as usize).max(1);
        (n_heads * d_head, d_head)
    };

    if options.randomize {
        n_heads = rng.gen_range(n_heads..=n_heads.max(MAX_HEADS));
        d_head = rng.gen_range(d_head..=d_head + D_HEAD_RAND_RANGE);
        d_model = n_heads * d_head;
    }

    if d_model == 0 || d_head == 0 {
        return Err(IiaError::Config(format!(
            "low-level widths collapsed (d_model={d_model}, d_head={d_head})"
        )));
    }

    let n_layers = if options.same_size {
        high_level.n_layers
    } else {
        high_level.n_layers.max(2)
    };

    Ok(TransformerConfig {
        n_layers,
        n_heads,
        d_model,
        d_head,
        d_mlp: d_model * 4,
        act_fn: Activation::Gelu,
        seed: rng.gen_range(0..=(1_u64 << 16)),
        ..high_level.clone()
    })
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

/// Read a required `usize` field.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let value = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| IiaError::Config(format!("missing or invalid '{key}' field")))?;
    usize::try_from(value).map_err(|_| IiaError::Config(format!("'{key}' does not fit in usize")))
}

/// Read an optional `usize` field with a default.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

/// Read an optional `u64` field with a default.
fn get_u64_or(config: &Value, key: &str, default: u64) -> u64 {
    config.get(key).and_then(Value::as_u64).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn tracr_config_json() -> Value {
        serde_json::json!({
            "n_layers": 2,
            "n_heads": 1,
            "d_model": 24,
            "d_head": 12,
            "d_mlp": 40,
            "d_vocab": 6,
            "d_vocab_out": 5,
            "n_ctx": 5,
            "act_fn": "relu",
            "output_kind": "categorical",
            "seed": 7
        })
    }

    #[test]
    fn parse_full_config() {
        let config = TransformerConfig::from_json(&tracr_config_json()).unwrap();
        assert_eq!(config.n_layers, 2);
        assert_eq!(config.n_heads, 1);
        assert_eq!(config.d_head, 12);
        assert_eq!(config.d_mlp, 40);
        assert_eq!(config.d_vocab_out, 5);
        assert_eq!(config.act_fn, Activation::Relu);
        assert_eq!(config.output_kind, OutputKind::Categorical);
        assert_eq!(config.seed, 7);
    }

    #[test]
    fn missing_required_field_is_config_error() {
        let json = serde_json::json!({ "n_layers": 2, "n_heads": 1, "d_model": 8 });
        let err = TransformerConfig::from_json(&json).unwrap_err();
        assert!(matches!(err, IiaError::Config(_)));
    }

    #[test]
    fn unknown_act_fn_rejected() {
        let mut json = tracr_config_json();
        json["act_fn"] = serde_json::json!("swish");
        assert!(TransformerConfig::from_json(&json).is_err());
    }

    #[test]
    fn numerical_output_kind_parses() {
        let mut json = tracr_config_json();
        json["output_kind"] = serde_json::json!("numerical");
        let config = TransformerConfig::from_json(&json).unwrap();
        assert_eq!(config.output_kind, OutputKind::Numerical);
    }

    #[test]
    fn iia_config_defaults_fill_missing_fields() {
        let config: IiaConfig = serde_json::from_str(r#"{"data_size": 16}"#).unwrap();
        assert_eq!(config.data_size, 16);
        assert_eq!(config.clean_seed, 42);
        assert_eq!(config.corrupted_seed, 43);
    }

    #[test]
    fn low_level_compresses_head_width() {
        let hl = TransformerConfig::from_json(&tracr_config_json()).unwrap();
        let ll = low_level_config(&hl, "1", LowLevelOptions::default()).unwrap();
        // case 1 has no override: ratio 2.0, head compression, >= 4 heads
        assert_eq!(ll.n_heads, 4);
        assert_eq!(ll.d_head, 6);
        assert_eq!(ll.d_model, 24);
        assert_eq!(ll.d_mlp, 96);
        assert_eq!(ll.n_layers, 2);
        assert_eq!(ll.act_fn, Activation::Gelu);
        assert_eq!(ll.d_vocab_out, hl.d_vocab_out);
    }

    #[test]
    fn low_level_compresses_residual_for_listed_cases() {
        let hl = TransformerConfig::from_json(&tracr_config_json()).unwrap();
        let ll = low_level_config(&hl, "35", LowLevelOptions::default()).unwrap();
        assert_eq!(compression_ratio_for_case("35"), 3.0);
        assert_eq!(ll.d_model, 8);
        assert_eq!(ll.d_head, 2);
    }

    #[test]
    fn low_level_is_reproducible_from_seed() {
        let hl = TransformerConfig::from_json(&tracr_config_json()).unwrap();
        let options = LowLevelOptions {
            randomize: true,
            seed: 11,
            ..LowLevelOptions::default()
        };
        let a = low_level_config(&hl, "1", options).unwrap();
        let b = low_level_config(&hl, "1", options).unwrap();
        assert_eq!(a, b);
        assert!(a.n_heads >= 4 && a.n_heads <= MAX_HEADS);
        assert_eq!(a.d_model, a.n_heads * a.d_head);
    }

    #[test]
    fn low_level_rejects_bad_ratio() {
        let hl = TransformerConfig::from_json(&tracr_config_json()).unwrap();
        let options = LowLevelOptions {
            compression_ratio: Some(0.0),
            ..LowLevelOptions::default()
        };
        assert!(low_level_config(&hl, "1", options).is_err());
    }
}
