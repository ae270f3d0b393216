// SPDX-License-Identifier: MIT OR Apache-2.0

//! IIA sweep: compare a hypothesis transformer against a base transformer.
//!
//! ```bash
//! RUST_LOG=candle_iia=info cargo run --release --example iia_sweep
//! ```
//!
//! Builds a base model from a small config, derives a compressed
//! low-level configuration for the hypothesis model, and prints the
//! per-node IIA scores as JSON.

use candle_core::Device;
use candle_iia::{
    Circuit, CircuitNode, HookPoint, HookedModel, HookedTransformer, IiaConfig, LowLevelOptions,
    SyntheticCase, TokenSampler, TransformerConfig, evaluate_case,
};

fn main() -> candle_iia::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let device = Device::Cpu;

    // 1. Base model
    let base_config = TransformerConfig::from_json(&serde_json::json!({
        "n_layers": 2, "n_heads": 2, "d_model": 16, "d_head": 8,
        "d_vocab": 8, "d_vocab_out": 4, "n_ctx": 5, "seed": 0
    }))?;
    let base = HookedTransformer::random(base_config.clone(), &device)?;
    println!(
        "base: {} layers, {} heads, d_model {}",
        base.num_layers(),
        base.num_heads(),
        base.hidden_size()
    );

    // 2. Hypothesis model: same shape, different seed, so its circuit differs
    let hypothesis = HookedTransformer::random(
        TransformerConfig {
            seed: 1,
            ..base_config.clone()
        },
        &device,
    )?;

    // 3. What a compressed low-level model for this case would look like
    let low_level = candle_iia::low_level_config(&base_config, "3", LowLevelOptions::default())?;
    println!(
        "low-level config for case 3: {} heads x d_head {}, d_model {}",
        low_level.n_heads, low_level.d_head, low_level.d_model
    );

    // 4. Case and sweep
    let claimed = Circuit::from_nodes([
        CircuitNode::at(&HookPoint::ResidPre(0)),
        CircuitNode::head(&HookPoint::AttnResult(0), 1),
        CircuitNode::at(&HookPoint::MlpOut(1)),
        CircuitNode::at(&HookPoint::ResidPost(1)),
    ]);
    let case = SyntheticCase::new("toy", TokenSampler::new(8, 5).with_bos(0), claimed);
    let config = IiaConfig {
        data_size: 256,
        ..IiaConfig::default()
    };
    let report = evaluate_case(&case, &base, &hypothesis, &config, &device)?;

    // 5. Summary
    for record in report.in_circuit() {
        println!(
            "{:<36} zero {:>8.5}  mean {:>8.5}  resample {:>8.5}",
            record.node, record.iia_zero, record.iia_mean, record.iia_resample
        );
    }
    println!("{}", report.to_json()?);
    Ok(())
}
