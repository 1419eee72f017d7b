//! Config-tree rewriting for quantized models.
//!
//! These passes retarget an existing model configuration without touching
//! the code that built it:
//!
//! ```rust
//! use layer_quant::config::LayerKind;
//! use layer_quant::hparams::{QuantizationMode, QuantizationType};
//! use layer_quant::rewrite::set_quantization;
//! use layer_quant::templates::{transformer_lm, TransformerDims};
//!
//! let mut model = transformer_lm(&TransformerDims::default(), 4, 1024);
//! let rewritten = set_quantization(
//!     &mut model,
//!     LayerKind::Transformer,
//!     QuantizationType::Ptq,
//!     QuantizationMode::Inference,
//! )?;
//! assert_eq!(rewritten, 1);
//! # Ok::<(), layer_quant::QuantError>(())
//! ```
//!
//! # Matching policy
//!
//! [`find_target_tpl`] stops descending at a match: a node nested inside a
//! matched subtree is never reported on its own, even if its kind also
//! matches.

use std::collections::VecDeque;

use crate::config::{ConfigNode, HasModel, LayerKind, QUANTIZATION_FIELD};
use crate::error::Result;
use crate::hparams::{QuantizationHParams, QuantizationMode, QuantizationType};

/// Find every template whose kind is a subtype of `target`, in BFS order.
#[must_use]
pub fn find_target_tpl(config: &ConfigNode, target: LayerKind) -> Vec<&ConfigNode> {
    let mut to_process = VecDeque::from([config]);
    let mut target_tpl = Vec::new();
    while let Some(param) = to_process.pop_front() {
        if param.kind().is_subtype_of(target) {
            target_tpl.push(param);
        } else {
            to_process.extend(param.children());
        }
    }
    target_tpl
}

/// Mutable variant of [`find_target_tpl`].
///
/// The returned borrows are disjoint: a matched node's children are never
/// visited, and sibling fields never alias.
pub fn find_target_tpl_mut(config: &mut ConfigNode, target: LayerKind) -> Vec<&mut ConfigNode> {
    let mut to_process = VecDeque::from([config]);
    let mut target_tpl = Vec::new();
    while let Some(param) = to_process.pop_front() {
        if param.kind().is_subtype_of(target) {
            target_tpl.push(param);
        } else {
            to_process.extend(param.children_mut());
        }
    }
    target_tpl
}

fn quantized_tpl(
    kind: LayerKind,
    quantization_type: QuantizationType,
    mode: QuantizationMode,
) -> ConfigNode {
    ConfigNode::new(kind).with(
        QUANTIZATION_FIELD,
        QuantizationHParams::new(quantization_type, mode),
    )
}

/// Paths read by [`quantize_transformer_layer_weights`].
fn check_transformer_layer_weights(tr_tpl: &ConfigNode) -> Result<()> {
    tr_tpl.node("tr_atten_tpl")?.flag("combine_qkv")?;
    tr_tpl.node("tr_fflayer_tpl")?.node("fflayer_tpl")?;
    Ok(())
}

/// Rewrite a `Transformer` template for weight-only quantization.
///
/// # Errors
/// Returns a schema violation if `tr_atten_tpl`, `tr_fflayer_tpl` or the
/// nested `fflayer_tpl` is missing or not a template.
pub fn quantize_transformer_layer_weights(
    tr_tpl: &mut ConfigNode,
    quantization_type: QuantizationType,
    mode: QuantizationMode,
) -> Result<()> {
    check_transformer_layer_weights(tr_tpl)?;

    quantize_dot_product_attention_layer_weights(
        tr_tpl.node_mut("tr_atten_tpl")?,
        quantization_type,
        mode,
    )?;
    quantize_transformer_feed_forward_layer_weights(
        tr_tpl.node_mut("tr_fflayer_tpl")?,
        quantization_type,
        mode,
    )
}

/// Rewrite a `DotProductAttention` template for weight-only quantization.
///
/// # Errors
/// Returns a schema violation if `combine_qkv` holds a non-bool value.
pub fn quantize_dot_product_attention_layer_weights(
    attn_tpl: &mut ConfigNode,
    quantization_type: QuantizationType,
    mode: QuantizationMode,
) -> Result<()> {
    let combine_qkv = attn_tpl.flag("combine_qkv")?;

    attn_tpl.set(
        "proj_tpl",
        quantized_tpl(LayerKind::QuantizedAttentionProjection, quantization_type, mode),
    );

    if combine_qkv {
        attn_tpl.set(
            "combined_qkv_proj_tpl",
            quantized_tpl(
                LayerKind::QuantizedCombinedQkvProjection,
                quantization_type,
                mode,
            ),
        );
    }
    Ok(())
}

/// Rewrite a `TransformerFeedForward` template for weight-only quantization.
///
/// # Errors
/// Returns a schema violation if `fflayer_tpl` is missing or not a template.
pub fn quantize_transformer_feed_forward_layer_weights(
    tr_fflayer_tpl: &mut ConfigNode,
    quantization_type: QuantizationType,
    mode: QuantizationMode,
) -> Result<()> {
    tr_fflayer_tpl.node_mut("fflayer_tpl")?.set(
        "linear_tpl",
        quantized_tpl(LayerKind::QuantizedLinear, quantization_type, mode),
    );
    Ok(())
}

/// Quantize every template of type `target` found under `config`.
///
/// Returns the number of rewritten templates. A tree without `target` is
/// left untouched.
///
/// # Errors
/// Returns the first schema violation among the matched templates. Every
/// match is checked before any is rewritten, so on error `config` is
/// unchanged.
pub fn set_quantization(
    config: &mut ConfigNode,
    target: LayerKind,
    quantization_type: QuantizationType,
    mode: QuantizationMode,
) -> Result<usize> {
    for target_tpl in find_target_tpl(config, target) {
        check_transformer_layer_weights(target_tpl)?;
    }
    let target_tpls = find_target_tpl_mut(config, target);
    let count = target_tpls.len();
    if count == 0 {
        tracing::debug!(layer = %target, "no templates matched, config unchanged");
        return Ok(0);
    }

    for target_tpl in target_tpls {
        quantize_transformer_layer_weights(target_tpl, quantization_type, mode)?;
    }
    tracing::info!(
        layer = %target,
        count,
        ?quantization_type,
        ?mode,
        "quantized layer templates"
    );
    Ok(count)
}

/// Wrap a config producer so its model's transformers are quantized.
///
/// Applies fake quantization in training mode. Architectures without a
/// `Transformer` pass through unchanged.
pub fn for_transformer<T, F>(producer: F) -> impl Fn() -> Result<T>
where
    T: HasModel,
    F: Fn() -> T,
{
    for_transformer_with(producer, QuantizationType::Fq, QuantizationMode::Training)
}

/// [`for_transformer`] with an explicit quantization type and mode.
pub fn for_transformer_with<T, F>(
    producer: F,
    quantization_type: QuantizationType,
    mode: QuantizationMode,
) -> impl Fn() -> Result<T>
where
    T: HasModel,
    F: Fn() -> T,
{
    move || {
        let mut task_p = producer();
        let count = set_quantization(
            task_p.model_mut(),
            LayerKind::Transformer,
            quantization_type,
            mode,
        )?;
        tracing::debug!(count, "for_transformer pass done");
        Ok(task_p)
    }
}

fn fp8_einsum_tpl(amax_history_length: usize) -> ConfigNode {
    ConfigNode::new(LayerKind::Fp8EinsumOp).with("amax_history_length", amax_history_length)
}

/// Paths written by [`tr_set_fp8_quantization`].
fn check_fp8_paths(transformer_layer_p: &ConfigNode) -> Result<()> {
    let attn = transformer_layer_p.node("tr_atten_tpl")?;
    attn.node("proj_tpl")?;
    attn.node("combined_qkv_proj_tpl")?;
    transformer_layer_p
        .node("tr_fflayer_tpl")?
        .node("fflayer_tpl")?
        .node("linear_tpl")?;
    Ok(())
}

/// Inject `Fp8EinsumOp` into the projections of one transformer template.
///
/// Targets the attention projection, the fused QKV projection and the
/// feed-forward linear.
///
/// # Errors
/// Returns a schema violation if any projection template on the path is missing.
pub fn tr_set_fp8_quantization(
    transformer_layer_p: &mut ConfigNode,
    amax_history_length: usize,
) -> Result<()> {
    check_fp8_paths(transformer_layer_p)?;

    let attn = transformer_layer_p.node_mut("tr_atten_tpl")?;
    attn.node_mut("proj_tpl")?
        .set("einsum_tpl", fp8_einsum_tpl(amax_history_length));
    attn.node_mut("combined_qkv_proj_tpl")?
        .set("einsum_tpl", fp8_einsum_tpl(amax_history_length));
    transformer_layer_p
        .node_mut("tr_fflayer_tpl")?
        .node_mut("fflayer_tpl")?
        .node_mut("linear_tpl")?
        .set("einsum_tpl", fp8_einsum_tpl(amax_history_length));
    Ok(())
}

/// Inject FP8 einsums into every template of type `target` under `config`.
///
/// # Errors
/// Returns the first schema violation among the matched templates, leaving
/// `config` unchanged.
pub fn set_fp8_quantization(
    config: &mut ConfigNode,
    target: LayerKind,
    amax_history_length: usize,
) -> Result<usize> {
    for target_tpl in find_target_tpl(config, target) {
        check_fp8_paths(target_tpl)?;
    }
    let target_tpls = find_target_tpl_mut(config, target);
    let count = target_tpls.len();
    for target_tpl in target_tpls {
        tr_set_fp8_quantization(target_tpl, amax_history_length)?;
    }
    tracing::info!(layer = %target, count, amax_history_length, "injected fp8 einsum templates");
    Ok(count)
}
