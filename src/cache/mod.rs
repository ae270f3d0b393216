// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation caches for interchange interventions.
//!
//! - [`ActivationCache`] -- every circuit-node activation of one model on
//!   one input batch, keyed by hook name.

mod activation;

pub use activation::ActivationCache;
