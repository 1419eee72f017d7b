//! # Post-Training Quantization Example
//!
//! Demonstrates how to:
//! - Quantize a float one-headed attention projection to int8
//! - Load the codes and scales into an inference-mode projection
//! - Compare outputs and memory footprint

use anyhow::Result;
use candle_core::{Device, Tensor};
use layer_quant::{
    OneHeadedAttentionProjection, OneHeadedAttentionProjectionConfig, QuantizationHParams,
    QuantizationMode, QuantizationType,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== PTQ Attention Projection Example ===\n");

    let device = Device::Cpu;
    let (input_dim, output_dim) = (512, 64);

    let float_layer = OneHeadedAttentionProjection::new(
        OneHeadedAttentionProjectionConfig::new(input_dim, output_dim).with_quantization(
            QuantizationHParams::new(QuantizationType::Ptq, QuantizationMode::Materialize),
        ),
        &device,
    )?;
    let weights = float_layer.quantize_weight()?;

    let float_bytes = input_dim * output_dim * 4;
    let quantized_bytes = weights.w.size_bytes() + output_dim * 4;
    println!("Float weight: {float_bytes} bytes");
    println!("Int8 codes + scales: {quantized_bytes} bytes\n");

    let inference_layer = OneHeadedAttentionProjection::new(
        OneHeadedAttentionProjectionConfig::new(input_dim, output_dim)
            .with_quantization(QuantizationHParams::ptq_inference()),
        &device,
    )?;
    inference_layer.load_quantized(&weights)?;

    let x = Tensor::randn(0f32, 1.0, (2, 8, input_dim), &device)?;
    let expected = float_layer.forward(&x)?;
    let actual = inference_layer.forward(&x)?;

    let max_error = (&expected - &actual)?.abs()?.max_all()?.to_scalar::<f32>()?;
    let max_value = expected.abs()?.max_all()?.to_scalar::<f32>()?;
    println!("Output shape: {:?}", actual.shape());
    println!("Max abs error: {max_error:.5} (max |y| = {max_value:.3})");

    let specs = inference_layer.quantized_partitioned_specs()?;
    println!("Partition specs: {specs:?}");
    Ok(())
}
