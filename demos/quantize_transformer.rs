//! # Transformer Config Rewriting Example
//!
//! Demonstrates how to:
//! - Build a float language-model template
//! - Wrap its producer with `for_transformer`
//! - Inspect which sub-templates were swapped for quantized ones
//! - Inject FP8 einsums into a separate copy of the same model

use anyhow::Result;
use layer_quant::{
    for_transformer_with, set_fp8_quantization,
    templates::{transformer_lm, TransformerDims},
    ConfigNode, LayerKind, QuantizationMode, QuantizationType, TaskConfig,
};

fn summarize(label: &str, root: &ConfigNode) {
    println!("{label}:");
    for node in root.descendants() {
        let kind = node.kind();
        if kind.is_quantized() || kind == LayerKind::Fp8EinsumOp {
            match node.quantization() {
                Some(q) => println!("  {kind} ({:?}, {:?})", q.quantization_type, q.mode),
                None => println!("  {kind}"),
            }
        }
    }
    println!();
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== Transformer Quantization Rewrite ===\n");

    let dims = TransformerDims::default().with_combine_qkv(true);
    let make_task = for_transformer_with(
        move || TaskConfig::new("lm_ptq", transformer_lm(&dims, 12, 32000)),
        QuantizationType::Ptq,
        QuantizationMode::Inference,
    );
    let task = make_task()?;
    summarize("PTQ inference rewrite", &task.model);

    let mut fp8_model = transformer_lm(&dims, 12, 32000);
    let rewritten = set_fp8_quantization(&mut fp8_model, LayerKind::Transformer, 1024)?;
    println!("FP8 injection touched {rewritten} transformer template(s)");
    summarize("FP8 rewrite", &fp8_model);

    println!("Rewritten config as JSON:");
    println!("{}", serde_json::to_string_pretty(&task.model)?);
    Ok(())
}
