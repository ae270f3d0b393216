// SPDX-License-Identifier: MIT OR Apache-2.0

//! Input batches and benchmark cases.
//!
//! A [`CaseDataset`] is one validated `[batch, pos]` batch of token IDs.
//! A [`BenchmarkCase`] provides clean and corrupted batches plus the
//! claimed circuit for one task; [`SyntheticCase`] is a ready-made case
//! that samples random token sequences.

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::circuit::Circuit;
use crate::error::{IiaError, Result};

// ---------------------------------------------------------------------------
// CaseDataset
// ---------------------------------------------------------------------------

/// One batch of model inputs.
#[derive(Debug, Clone)]
pub struct CaseDataset {
    /// Token IDs, `[batch, pos]`, `u32`.
    inputs: Tensor,
}

impl CaseDataset {
    /// Wrap an input tensor.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`] unless `inputs` is a non-empty
    /// `[batch, pos]` tensor of `u32` token IDs.
    pub fn new(inputs: Tensor) -> Result<Self> {
        if inputs.dtype() != DType::U32 {
            return Err(IiaError::Config(format!(
                "dataset inputs must be u32, got {:?}",
                inputs.dtype()
            )));
        }
        let (batch, pos) = inputs.dims2().map_err(|_| {
            IiaError::Config(format!(
                "dataset inputs must be [batch, pos], got {:?}",
                inputs.dims()
            ))
        })?;
        if batch == 0 || pos == 0 {
            return Err(IiaError::Config("dataset is empty".into()));
        }
        Ok(Self { inputs })
    }

    /// Build a dataset from equal-length token rows.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`] for ragged or empty rows.
    pub fn from_rows(rows: &[Vec<u32>], device: &Device) -> Result<Self> {
        let seq_len = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|row| row.len() != seq_len) {
            return Err(IiaError::Config("dataset rows must have equal length".into()));
        }
        let flat: Vec<u32> = rows.iter().flatten().copied().collect();
        Self::new(Tensor::from_vec(flat, (rows.len(), seq_len), device)?)
    }

    /// The `[batch, pos]` input tensor.
    #[must_use]
    pub const fn inputs(&self) -> &Tensor {
        &self.inputs
    }

    /// Number of examples.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }

    /// Sequence length.
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.inputs.dims().get(1).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// TokenSampler
// ---------------------------------------------------------------------------

/// Samples uniform random token sequences from an explicit seed.
///
/// ```
/// use candle_iia::TokenSampler;
/// use candle_core::Device;
///
/// let sampler = TokenSampler::new(5, 4).with_bos(0);
/// let data = sampler.sample(8, 42, &Device::Cpu).unwrap();
/// assert_eq!(data.batch_size(), 8);
/// assert_eq!(data.seq_len(), 4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSampler {
    /// Number of distinct tokens.
    pub vocab_size: usize,
    /// Tokens per example, including the BOS token if any.
    pub seq_len: usize,
    /// Token placed at position 0 of every example.
    pub bos_token: Option<u32>,
}

impl TokenSampler {
    /// Sampler without a BOS token.
    #[must_use]
    pub const fn new(vocab_size: usize, seq_len: usize) -> Self {
        Self {
            vocab_size,
            seq_len,
            bos_token: None,
        }
    }

    /// Prefix every example with `bos`.
    #[must_use]
    pub const fn with_bos(mut self, bos: u32) -> Self {
        self.bos_token = Some(bos);
        self
    }

    /// Draw `count` examples.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`] for an empty vocabulary, sequence or
    /// batch.
    pub fn sample(&self, count: usize, seed: u64, device: &Device) -> Result<CaseDataset> {
        if self.vocab_size == 0 || self.seq_len == 0 || count == 0 {
            return Err(IiaError::Config(format!(
                "cannot sample {count} examples of length {} from {} tokens",
                self.seq_len, self.vocab_size
            )));
        }
        let vocab = u32::try_from(self.vocab_size)
            .map_err(|_| IiaError::Config(format!("vocab size {} exceeds u32", self.vocab_size)))?;

        let mut rng = StdRng::seed_from_u64(seed);
        let mut tokens = Vec::with_capacity(count * self.seq_len);
        for _ in 0..count {
            for pos in 0..self.seq_len {
                match self.bos_token {
                    Some(bos) if pos == 0 => tokens.push(bos),
                    _ => tokens.push(rng.gen_range(0..vocab)),
                }
            }
        }
        CaseDataset::new(Tensor::from_vec(tokens, (count, self.seq_len), device)?)
    }
}

// ---------------------------------------------------------------------------
// BenchmarkCase
// ---------------------------------------------------------------------------

/// A task with clean/corrupted inputs and a claimed circuit.
pub trait BenchmarkCase {
    /// Case identifier.
    fn name(&self) -> &str;

    /// Clean inputs, `count` examples drawn from `seed`.
    ///
    /// # Errors
    ///
    /// Implementation-defined; typically [`IiaError::Config`].
    fn clean_data(&self, count: usize, seed: u64, device: &Device) -> Result<CaseDataset>;

    /// Corrupted inputs, `count` examples drawn from `seed`.
    ///
    /// # Errors
    ///
    /// Implementation-defined; typically [`IiaError::Config`].
    fn corrupted_data(&self, count: usize, seed: u64, device: &Device) -> Result<CaseDataset>;

    /// The hypothesised circuit.
    ///
    /// # Errors
    ///
    /// Implementation-defined.
    fn claimed_circuit(&self) -> Result<Circuit>;
}

/// Case backed by a [`TokenSampler`] and a fixed claimed circuit.
///
/// Clean and corrupted batches come from the same distribution and differ
/// only by seed, which is what resample ablation needs.
#[derive(Debug, Clone)]
pub struct SyntheticCase {
    /// Case identifier.
    name: String,
    /// Input distribution.
    sampler: TokenSampler,
    /// Claimed circuit.
    claimed: Circuit,
}

impl SyntheticCase {
    /// Create a case.
    pub fn new(name: impl Into<String>, sampler: TokenSampler, claimed: Circuit) -> Self {
        Self {
            name: name.into(),
            sampler,
            claimed,
        }
    }

    /// The input sampler.
    #[must_use]
    pub const fn sampler(&self) -> &TokenSampler {
        &self.sampler
    }
}

impl BenchmarkCase for SyntheticCase {
    fn name(&self) -> &str {
        &self.name
    }

    fn clean_data(&self, count: usize, seed: u64, device: &Device) -> Result<CaseDataset> {
        self.sampler.sample(count, seed, device)
    }

    fn corrupted_data(&self, count: usize, seed: u64, device: &Device) -> Result<CaseDataset> {
        self.sampler.sample(count, seed, device)
    }

    fn claimed_circuit(&self) -> Result<Circuit> {
        Ok(self.claimed.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_token_inputs() {
        let device = Device::Cpu;
        let floats = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
        assert!(CaseDataset::new(floats).is_err());
        let flat = Tensor::zeros(3, DType::U32, &device).unwrap();
        assert!(CaseDataset::new(flat).is_err());
        assert!(CaseDataset::from_rows(&[vec![1, 2], vec![3]], &device).is_err());
    }

    #[test]
    fn sampling_is_seeded() {
        let device = Device::Cpu;
        let sampler = TokenSampler::new(7, 5).with_bos(0);
        let a: Vec<Vec<u32>> = sampler.sample(4, 42, &device).unwrap().inputs().to_vec2().unwrap();
        let b: Vec<Vec<u32>> = sampler.sample(4, 42, &device).unwrap().inputs().to_vec2().unwrap();
        let c: Vec<Vec<u32>> = sampler.sample(4, 43, &device).unwrap().inputs().to_vec2().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().all(|row| row[0] == 0));
        assert!(a.iter().flatten().all(|&t| t < 7));
    }

    #[test]
    fn synthetic_case_serves_both_batches() {
        let device = Device::Cpu;
        let case = SyntheticCase::new("toy", TokenSampler::new(4, 3), Circuit::new());
        assert_eq!(case.name(), "toy");
        assert_eq!(case.clean_data(6, 1, &device).unwrap().batch_size(), 6);
        assert_eq!(case.corrupted_data(6, 2, &device).unwrap().seq_len(), 3);
        assert!(case.claimed_circuit().unwrap().is_empty());
    }
}
