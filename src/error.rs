// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-iia.

/// Errors that can occur while building caches, running interventions,
/// or evaluating interchange intervention accuracy.
#[derive(Debug, thiserror::Error)]
pub enum IiaError {
    /// Forward pass or tensor operation error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Hook capture error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Intervention validation or application error.
    #[error("intervention error: {0}")]
    Intervention(String),

    /// Malformed input batch, model configuration, or circuit/model mismatch.
    #[error("config error: {0}")]
    Config(String),

    /// An activation cache has no entry for the requested hook.
    #[error("activation `{hook}` missing from cache")]
    MissingActivation {
        /// Hook name that was looked up.
        hook: String,
    },

    /// An intervention target never fired during the forward pass.
    #[error("hook point `{hook}` never fired during the forward pass")]
    NodeNotFound {
        /// Hook name of the intervention target.
        hook: String,
    },

    /// The ablation type string does not name a known ablation.
    #[error("unsupported ablation type: `{0}`")]
    UnsupportedAblationType(String),

    /// The model's output space cannot be scored.
    #[error("unsupported model kind: {0}")]
    UnsupportedModelKind(String),

    /// A report row is missing a score for some ablation type.
    #[error("incomplete report: {0}")]
    IncompleteReport(String),

    /// Failure while caching one model's activations on one batch.
    #[error("building the {dataset} activation cache failed ({model} model)")]
    Cache {
        /// Which model of the pair failed (`base` or `hypothesis`).
        model: String,
        /// Which batch was running (`clean` or `corrupted`).
        dataset: String,
        /// Underlying failure.
        #[source]
        source: Box<IiaError>,
    },

    /// Failure while evaluating one node, annotated with where it happened.
    #[error("IIA evaluation failed at node `{node}` ({model} model, {ablation} ablation)")]
    Evaluation {
        /// Node string key.
        node: String,
        /// Which model failed: `base`, `hypothesis`, or `pair` when the
        /// two models ran but their outputs cannot be compared.
        model: String,
        /// Ablation type in effect.
        ablation: String,
        /// Underlying failure.
        #[source]
        source: Box<IiaError>,
    },

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IiaError {
    /// Whether this error (or the error it wraps) is a lookup failure:
    /// a missing cache entry or a hook point that never fired.
    #[must_use]
    pub fn is_lookup(&self) -> bool {
        match self {
            Self::MissingActivation { .. } | Self::NodeNotFound { .. } => true,
            Self::Cache { source, .. } | Self::Evaluation { source, .. } => source.is_lookup(),
            _ => false,
        }
    }
}

/// Result type alias for candle-iia operations.
pub type Result<T> = std::result::Result<T, IiaError>;
