//! # FP8 Einsum Example
//!
//! Demonstrates how to:
//! - Register FP8 state variables alongside a trainable weight
//! - Run the FP8 quantize-dequantize einsum in a small training loop
//! - Watch the amax history and scales evolve

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use layer_quant::{Fp8EinsumConfig, Fp8EinsumOp, VariableStore, WeightHParams, WeightInit};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== FP8 Einsum Training Example ===\n");

    let device = Device::Cpu;
    let mut store = VariableStore::new(&device);
    let op = Fp8EinsumOp::setup(Fp8EinsumConfig::with_history_length(16), &mut store)?;
    store.create_variable(
        "w",
        WeightHParams::new(vec![64, 32]).with_init(WeightInit::Gaussian { scale: 0.05 }),
    )?;
    println!("Non-trainable FP8 state: {:?}\n", store.non_trainable_names());

    let mut opt = AdamW::new(
        store.trainable_vars(),
        ParamsAdamW {
            lr: 1e-3,
            ..Default::default()
        },
    )?;

    let x = Tensor::randn(0f32, 1.0, (16, 64), &device)?;
    let target = Tensor::randn(0f32, 1.0, (16, 32), &device)?;

    for step in 0..5 {
        let w = store.get("w")?;
        let y = op.forward("...D,DH->...H", &x, &w)?;
        let loss = (y - &target)?.sqr()?.mean_all()?;
        opt.backward_step(&loss)?;

        println!(
            "step {step}: loss={:.4} input_scale={:.6} kernel_scale={:.6}",
            loss.to_dtype(DType::F32)?.to_scalar::<f32>()?,
            op.input_state().scale()?,
            op.kernel_state().scale()?,
        );
    }

    let history = op.input_state().amax_history()?;
    println!("\nInput amax history (newest first): {:?}", &history[..5]);
    Ok(())
}
