// SPDX-License-Identifier: MIT OR Apache-2.0

//! Divergence between the output distributions of two models.

use candle_core::{D, Tensor};

use crate::error::{IiaError, Result};

/// Batch-averaged KL divergence of the hypothesis distribution from the
/// base distribution, `KL(q || p)` with `p = softmax(base)` and
/// `q = softmax(hypothesis)` along the last (class) axis.
///
/// The sum runs over classes; the mean runs over every other axis
/// (batch and position). Identical logits score exactly zero.
///
/// # Shapes
/// - `base_logits`: `[..., n_classes]`
/// - `hypothesis_logits`: same shape as `base_logits`
///
/// # Errors
///
/// Returns [`IiaError::Config`] on a shape mismatch and
/// [`IiaError::Model`] on tensor failures.
pub fn categorical_kl(base_logits: &Tensor, hypothesis_logits: &Tensor) -> Result<f32> {
    if base_logits.dims() != hypothesis_logits.dims() {
        return Err(IiaError::Config(format!(
            "base logits {:?} and hypothesis logits {:?} differ in shape",
            base_logits.dims(),
            hypothesis_logits.dims()
        )));
    }
    if base_logits.rank() == 0 {
        return Err(IiaError::Config("logits need a class axis".into()));
    }

    let log_p = candle_nn::ops::log_softmax(&base_logits.to_dtype(candle_core::DType::F32)?, D::Minus1)?;
    let log_q =
        candle_nn::ops::log_softmax(&hypothesis_logits.to_dtype(candle_core::DType::F32)?, D::Minus1)?;
    let q = log_q.exp()?;

    let per_example = (q * (log_q - log_p)?)?.sum(D::Minus1)?;
    Ok(per_example.mean_all()?.to_scalar::<f32>()?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn identical_logits_score_zero() {
        let logits = Tensor::new(&[[[1.0_f32, 2.0, 3.0], [0.5, -1.0, 0.0]]], &Device::Cpu).unwrap();
        let kl = categorical_kl(&logits, &logits).unwrap();
        assert!(kl.abs() < 1e-7);
    }

    #[test]
    fn matches_hand_computed_value() {
        // p = [0.5, 0.5], q = softmax([ln 3, 0]) = [0.75, 0.25]
        let base = Tensor::new(&[[0.0_f32, 0.0]], &Device::Cpu).unwrap();
        let hyp = Tensor::new(&[[3.0_f32.ln(), 0.0]], &Device::Cpu).unwrap();
        let expected = 0.75 * (0.75_f32 / 0.5).ln() + 0.25 * (0.25_f32 / 0.5).ln();
        let kl = categorical_kl(&base, &hyp).unwrap();
        assert!((kl - expected).abs() < 1e-5);
        assert!(kl > 0.0);
    }

    #[test]
    fn averages_over_batch() {
        let base = Tensor::new(&[[0.0_f32, 0.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let hyp = Tensor::new(&[[3.0_f32.ln(), 0.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let single = categorical_kl(
            &Tensor::new(&[[0.0_f32, 0.0]], &Device::Cpu).unwrap(),
            &Tensor::new(&[[3.0_f32.ln(), 0.0]], &Device::Cpu).unwrap(),
        )
        .unwrap();
        let kl = categorical_kl(&base, &hyp).unwrap();
        assert!((kl - single / 2.0).abs() < 1e-6);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let a = Tensor::zeros((2, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((2, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(categorical_kl(&a, &b), Err(IiaError::Config(_))));
    }
}
