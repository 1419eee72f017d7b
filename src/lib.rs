//! # layer-quant-rs
//!
//! Quantization rewriting for layer configuration trees, plus the quantized
//! layers those rewrites point at, built on candle.
//!
//! This crate provides:
//! - A typed configuration tree with a subtype-aware locator
//! - Rewrites that swap float transformer sub-templates for quantized ones
//! - An FP8 einsum with rolling amax history and straight-through rounding
//! - Post-training int8 quantization for a one-headed attention projection
//!
//! ## Quick Start
//!
//! ```rust
//! use layer_quant::{for_transformer, templates, HasModel, LayerKind, TaskConfig};
//!
//! let make_task = for_transformer(|| {
//!     let dims = templates::TransformerDims::default();
//!     TaskConfig::new("lm", templates::transformer_lm(&dims, 2, 1024))
//! });
//!
//! let mut task = make_task()?;
//! let linear = task
//!     .model_mut()
//!     .descendants()
//!     .into_iter()
//!     .filter(|n| n.kind() == LayerKind::QuantizedLinear)
//!     .count();
//! assert_eq!(linear, 1);
//! # Ok::<(), layer_quant::QuantError>(())
//! ```
//!
//! ## Architecture
//!
//! Rewrites only touch configuration: they replace templates and attach a
//! [`QuantizationHParams`] directive. Layers built from those templates read
//! the directive to decide between float weights, quantized codes, or
//! simulated FP8 arithmetic.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod attention;
pub mod config;
pub mod einsum;
pub mod error;
pub mod fp8;
pub mod hparams;
pub mod operations;
pub mod rewrite;
pub mod templates;
pub mod variables;

pub use attention::{
    NestedPartitionSpecs, OneHeadedAttentionProjection, OneHeadedAttentionProjectionConfig,
    QuantizedWeights, WeightSplitDimsMapping,
};
pub use config::{ConfigNode, FieldValue, HasModel, LayerKind, TaskConfig, QUANTIZATION_FIELD};
pub use einsum::{einsum, Equation};
pub use error::{QuantError, Result};
pub use fp8::{
    compute_scale, roll_amax_history, round_to_fp8, Fp8EinsumConfig, Fp8EinsumOp, Fp8Format,
    QdqState,
};
pub use hparams::{
    ActQuantizationParams, ComputeDType, QuantizationHParams, QuantizationMode, QuantizationType,
    WeightQuantizationParams,
};
pub use operations::{quantized_einsum, reduce_einsum_weight_precision, Int8Tensor};
pub use rewrite::{
    find_target_tpl, find_target_tpl_mut, for_transformer, for_transformer_with,
    quantize_dot_product_attention_layer_weights, quantize_transformer_feed_forward_layer_weights,
    quantize_transformer_layer_weights, set_fp8_quantization, set_quantization,
    tr_set_fp8_quantization,
};
pub use variables::{
    weight_hparams_to_pspec, DimSharding, PartitionAxis, PartitionSpec, VariableStore,
    WeightCollection, WeightHParams, WeightInit, PARAMS, QUANTIZED_NAME_POSTFIX,
};
