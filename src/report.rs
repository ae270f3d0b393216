// SPDX-License-Identifier: MIT OR Apache-2.0

//! IIA report aggregation and serialisation.
//!
//! [`ReportBuilder`] seeds one row per full-circuit node with its static
//! metadata, folds in the per-ablation score maps, and checks on
//! [`finish`](ReportBuilder::finish) that no node is missing a score.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::circuit::{Circuit, CircuitNode};
use crate::error::{IiaError, Result};
use crate::interp::ablation::AblationType;

// ---------------------------------------------------------------------------
// NodeIiaRecord
// ---------------------------------------------------------------------------

/// One report row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeIiaRecord {
    /// Node string key (`name` or `name[index]`).
    pub node: String,
    /// Hook name of the node.
    pub hook_name: String,
    /// Head index, if the node is head-indexed.
    pub head_index: Option<usize>,
    /// Whether the node belongs to the claimed circuit.
    pub in_circuit: bool,
    /// Score under zero ablation.
    pub iia_zero: f32,
    /// Score under mean ablation.
    pub iia_mean: f32,
    /// Score under resample ablation.
    pub iia_resample: f32,
}

impl NodeIiaRecord {
    /// Score for one ablation type.
    #[must_use]
    pub const fn score(&self, ablation: AblationType) -> f32 {
        match ablation {
            AblationType::Zero => self.iia_zero,
            AblationType::Mean => self.iia_mean,
            AblationType::Resample => self.iia_resample,
        }
    }
}

// ---------------------------------------------------------------------------
// IiaReport
// ---------------------------------------------------------------------------

/// Complete IIA results, keyed by node string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IiaReport {
    /// Rows keyed by node string.
    records: BTreeMap<String, NodeIiaRecord>,
}

impl IiaReport {
    /// Row for a node key.
    #[must_use]
    pub fn get(&self, node: &str) -> Option<&NodeIiaRecord> {
        self.records.get(node)
    }

    /// Rows in node-key order.
    pub fn records(&self) -> impl Iterator<Item = &NodeIiaRecord> {
        self.records.values()
    }

    /// Rows belonging to the claimed circuit.
    pub fn in_circuit(&self) -> impl Iterator<Item = &NodeIiaRecord> {
        self.records.values().filter(|record| record.in_circuit)
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the report has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Pretty-printed JSON object keyed by node.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Json`] if serialisation fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a report produced by [`to_json`](Self::to_json).
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Json`] on malformed input.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ---------------------------------------------------------------------------
// ReportBuilder
// ---------------------------------------------------------------------------

/// Row under construction.
#[derive(Debug, Clone)]
struct PendingRecord {
    /// Intervention site.
    node: CircuitNode,
    /// Claimed-circuit membership.
    in_circuit: bool,
    /// Scores recorded so far.
    scores: BTreeMap<AblationType, f32>,
}

/// Folds per-ablation score maps into an [`IiaReport`].
#[derive(Debug, Clone)]
pub struct ReportBuilder {
    /// Pending rows keyed by node string.
    rows: BTreeMap<String, PendingRecord>,
}

impl ReportBuilder {
    /// One row per node of `full`, annotated against `claimed`.
    #[must_use]
    pub fn new(full: &Circuit, claimed: &Circuit) -> Self {
        let rows = full
            .nodes()
            .map(|node| {
                (
                    node.to_string(),
                    PendingRecord {
                        node: node.clone(),
                        in_circuit: claimed.contains(node),
                        scores: BTreeMap::new(),
                    },
                )
            })
            .collect();
        Self { rows }
    }

    /// Record one ablation type's scores.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`] for a score keyed by a node that is not
    /// in the full circuit.
    pub fn record(&mut self, ablation: AblationType, scores: BTreeMap<String, f32>) -> Result<()> {
        for (node, score) in scores {
            let row = self.rows.get_mut(&node).ok_or_else(|| {
                IiaError::Config(format!("score for `{node}` but node is not in the full circuit"))
            })?;
            row.scores.insert(ablation, score);
        }
        Ok(())
    }

    /// Assemble the report.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::IncompleteReport`] naming the first node that
    /// lacks a score for some ablation type.
    pub fn finish(self) -> Result<IiaReport> {
        let mut records = BTreeMap::new();
        for (key, row) in self.rows {
            let score = |ablation: AblationType| {
                row.scores.get(&ablation).copied().ok_or_else(|| {
                    IiaError::IncompleteReport(format!("node `{key}` has no {} score", ablation.key()))
                })
            };
            let record = NodeIiaRecord {
                node: key.clone(),
                hook_name: row.node.name().to_string(),
                head_index: row.node.index(),
                in_circuit: row.in_circuit,
                iia_zero: score(AblationType::Zero)?,
                iia_mean: score(AblationType::Mean)?,
                iia_resample: score(AblationType::Resample)?,
            };
            records.insert(key, record);
        }
        Ok(IiaReport { records })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::cast_precision_loss,
    clippy::as_conversions
)]
mod tests {
    use super::*;

    fn nodes() -> [CircuitNode; 3] {
        [
            CircuitNode::new("a", None),
            CircuitNode::new("b", Some(0)),
            CircuitNode::new("c", None),
        ]
    }

    fn all_scores(value: f32) -> BTreeMap<String, f32> {
        nodes().iter().map(|n| (n.to_string(), value)).collect()
    }

    #[test]
    fn annotates_membership_and_metadata() {
        let [a, b, c] = nodes();
        let full = Circuit::from_nodes([a.clone(), b.clone(), c]);
        let claimed = Circuit::from_nodes([a, b]);

        let mut builder = ReportBuilder::new(&full, &claimed);
        for (i, ablation) in AblationType::ALL.into_iter().enumerate() {
            builder.record(ablation, all_scores(i as f32)).unwrap();
        }
        let report = builder.finish().unwrap();

        assert_eq!(report.len(), 3);
        assert!(report.get("a").unwrap().in_circuit);
        assert!(report.get("b[0]").unwrap().in_circuit);
        assert!(!report.get("c").unwrap().in_circuit);

        let b = report.get("b[0]").unwrap();
        assert_eq!(b.hook_name, "b");
        assert_eq!(b.head_index, Some(0));
        assert_eq!(b.score(AblationType::Mean), 1.0);
        assert_eq!(report.in_circuit().count(), 2);
    }

    #[test]
    fn missing_ablation_is_incomplete() {
        let full = Circuit::from_nodes(nodes());
        let mut builder = ReportBuilder::new(&full, &Circuit::new());
        builder.record(AblationType::Zero, all_scores(0.0)).unwrap();
        builder.record(AblationType::Mean, all_scores(0.0)).unwrap();
        let err = builder.finish().unwrap_err();
        assert!(matches!(err, IiaError::IncompleteReport(ref msg) if msg.contains("iia_resample")));
    }

    #[test]
    fn unknown_node_score_is_rejected() {
        let full = Circuit::from_nodes(nodes());
        let mut builder = ReportBuilder::new(&full, &Circuit::new());
        let stray = BTreeMap::from([("z".to_string(), 0.0)]);
        assert!(builder.record(AblationType::Zero, stray).is_err());
    }

    #[test]
    fn json_uses_report_field_names() {
        let full = Circuit::from_nodes([CircuitNode::new("blocks.0.hook_mlp_out", None)]);
        let mut builder = ReportBuilder::new(&full, &full);
        for ablation in AblationType::ALL {
            builder
                .record(ablation, BTreeMap::from([("blocks.0.hook_mlp_out".to_string(), 0.25)]))
                .unwrap();
        }
        let report = builder.finish().unwrap();
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        let row = &json["blocks.0.hook_mlp_out"];
        assert_eq!(row["node"], "blocks.0.hook_mlp_out");
        assert_eq!(row["hook_name"], "blocks.0.hook_mlp_out");
        assert!(row["head_index"].is_null());
        assert_eq!(row["in_circuit"], true);
        assert_eq!(row["iia_zero"], 0.25);
        assert_eq!(IiaReport::from_json(&report.to_json().unwrap()).unwrap(), report);
    }
}
