// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interchange intervention machinery.
//!
//! - [`ablation`] -- ablation policies and per-model replacement plans.
//! - [`intervention`] -- single-node patched forward passes.
//! - [`divergence`] -- output-distribution divergence scoring.
//! - [`iia`] -- the IIA sweep over a full circuit.

pub mod ablation;
pub mod divergence;
pub mod iia;
pub mod intervention;
