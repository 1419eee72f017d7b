//! Reference layer templates.
//!
//! Builders for the float model configurations that the rewrite passes
//! operate on. Field names follow the layer library's schema:
//! `tr_atten_tpl`, `tr_fflayer_tpl`, `fflayer_tpl`, `linear_tpl`, `proj_tpl`,
//! `combined_qkv_proj_tpl` and `einsum_tpl`.

use serde::{Deserialize, Serialize};

use crate::config::{ConfigNode, LayerKind};

/// Dimensions shared by the transformer templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformerDims {
    /// Model (residual stream) width.
    pub model_dims: usize,
    /// Feed-forward hidden width.
    pub hidden_dims: usize,
    /// Attention heads.
    pub num_heads: usize,
    /// Use the fused QKV projection in attention.
    pub combine_qkv: bool,
}

impl Default for TransformerDims {
    fn default() -> Self {
        Self {
            model_dims: 512,
            hidden_dims: 2048,
            num_heads: 8,
            combine_qkv: false,
        }
    }
}

impl TransformerDims {
    /// Per-head width.
    #[must_use]
    pub fn dim_per_head(&self) -> usize {
        self.model_dims / self.num_heads.max(1)
    }

    /// Enable or disable the fused QKV projection.
    #[must_use]
    pub fn with_combine_qkv(mut self, combine_qkv: bool) -> Self {
        self.combine_qkv = combine_qkv;
        self
    }
}

fn einsum() -> ConfigNode {
    ConfigNode::new(LayerKind::EinsumOp)
}

fn layer_norm(dim: usize) -> ConfigNode {
    ConfigNode::new(LayerKind::LayerNorm)
        .with("dim", dim)
        .with("epsilon", 1e-6)
}

/// Multi-headed dot-product attention with per-head and fused projections.
#[must_use]
pub fn dot_product_attention(dims: &TransformerDims) -> ConfigNode {
    ConfigNode::new(LayerKind::DotProductAttention)
        .with("input_dim", dims.model_dims)
        .with("hidden_dim", dims.model_dims)
        .with("num_heads", dims.num_heads)
        .with("dim_per_head", dims.dim_per_head())
        .with("combine_qkv", dims.combine_qkv)
        .with(
            "proj_tpl",
            ConfigNode::new(LayerKind::AttentionProjection)
                .with("use_bias", true)
                .with("einsum_tpl", einsum()),
        )
        .with(
            "combined_qkv_proj_tpl",
            ConfigNode::new(LayerKind::CombinedQkvProjection)
                .with("use_bias", true)
                .with("einsum_tpl", einsum()),
        )
        .with("atten_dropout_prob", 0.0)
}

/// Feed-forward block: norm, linear + bias + activation, residual dropout.
#[must_use]
pub fn transformer_feed_forward(dims: &TransformerDims) -> ConfigNode {
    ConfigNode::new(LayerKind::TransformerFeedForward)
        .with("input_dims", dims.model_dims)
        .with("hidden_dims", dims.hidden_dims)
        .with("ln_tpl", layer_norm(dims.model_dims))
        .with(
            "fflayer_tpl",
            ConfigNode::new(LayerKind::FeedForward)
                .with("has_bias", true)
                .with(
                    "linear_tpl",
                    ConfigNode::new(LayerKind::Linear).with("einsum_tpl", einsum()),
                )
                .with("bias_tpl", ConfigNode::new(LayerKind::Bias))
                .with(
                    "activation_tpl",
                    ConfigNode::new(LayerKind::Activation).with("name", "relu"),
                ),
        )
        .with(
            "residual_dropout_tpl",
            ConfigNode::new(LayerKind::Dropout).with("keep_prob", 1.0),
        )
}

/// A single transformer block.
#[must_use]
pub fn transformer(dims: &TransformerDims) -> ConfigNode {
    ConfigNode::new(LayerKind::Transformer)
        .with("input_dims", dims.model_dims)
        .with("hidden_dims", dims.hidden_dims)
        .with("num_heads", dims.num_heads)
        .with("ln_tpl", layer_norm(dims.model_dims))
        .with("tr_atten_tpl", dot_product_attention(dims))
        .with("tr_fflayer_tpl", transformer_feed_forward(dims))
}

/// Stack of `num_layers` identical transformer blocks.
#[must_use]
pub fn stacked_transformer(dims: &TransformerDims, num_layers: usize) -> ConfigNode {
    ConfigNode::new(LayerKind::StackedTransformer)
        .with("num_layers", num_layers)
        .with("model_dims", dims.model_dims)
        .with("hidden_dims", dims.hidden_dims)
        .with("num_heads", dims.num_heads)
        .with("transformer_layer_params_tpl", transformer(dims))
}

/// Decoder-only language model wrapped in a task-level model.
#[must_use]
pub fn transformer_lm(dims: &TransformerDims, num_layers: usize, vocab_size: usize) -> ConfigNode {
    let lm = ConfigNode::new(LayerKind::TransformerLm)
        .with("model_dims", dims.model_dims)
        .with("vocab_size", vocab_size)
        .with(
            "position_emb_tpl",
            ConfigNode::new(LayerKind::PositionalEmbedding).with("embedding_dims", dims.model_dims),
        )
        .with("stacked_transformer_tpl", stacked_transformer(dims, num_layers))
        .with(
            "softmax_tpl",
            ConfigNode::new(LayerKind::SharedEmbeddingSoftmax)
                .with("input_dims", dims.model_dims)
                .with("num_classes", vocab_size),
        )
        .with("final_ln_tpl", layer_norm(dims.model_dims));

    ConfigNode::new(LayerKind::LanguageModel)
        .with("model_type", "causal")
        .with("lm_tpl", lm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transformer_schema_fields() {
        let tr = transformer(&TransformerDims::default());
        assert_eq!(tr.kind(), LayerKind::Transformer);

        let attn = tr.node("tr_atten_tpl").unwrap();
        assert_eq!(attn.kind(), LayerKind::DotProductAttention);
        assert!(attn.contains("proj_tpl"));
        assert!(!attn.flag("combine_qkv").unwrap());

        let ff = tr.node("tr_fflayer_tpl").unwrap();
        let linear = ff.node("fflayer_tpl").unwrap().node("linear_tpl").unwrap();
        assert_eq!(linear.kind(), LayerKind::Linear);
        assert_eq!(
            linear.node("einsum_tpl").unwrap().kind(),
            LayerKind::EinsumOp
        );
    }

    #[test]
    fn test_lm_contains_one_transformer_template() {
        let lm = transformer_lm(&TransformerDims::default(), 12, 32000);
        let transformers = lm
            .descendants()
            .into_iter()
            .filter(|n| n.kind() == LayerKind::Transformer)
            .count();
        assert_eq!(transformers, 1);
    }

    #[test]
    fn test_dim_per_head() {
        let dims = TransformerDims {
            model_dims: 256,
            num_heads: 4,
            ..Default::default()
        };
        assert_eq!(dims.dim_per_head(), 64);
    }
}
