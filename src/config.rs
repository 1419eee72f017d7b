//! Hierarchical layer configuration trees.
//!
//! A [`ConfigNode`] describes how to build one layer: a [`LayerKind`] tag plus
//! an ordered list of named fields. Fields that hold other nodes form the tree
//! edges. Children are owned through `Box`, so a tree is finite, acyclic and
//! free of sharing by construction.
//!
//! Type matching is done on the explicit tag: [`LayerKind::is_subtype_of`]
//! walks a fixed single-inheritance hierarchy rooted at
//! [`LayerKind::BaseLayer`].

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{QuantError, Result};
use crate::hparams::QuantizationHParams;

/// Field name under which quantized layers carry their directive.
pub const QUANTIZATION_FIELD: &str = "quantization";

/// Known layer types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    /// Root of the hierarchy; every kind is a subtype of it.
    BaseLayer,
    /// Task-level model wrapper around a language model.
    LanguageModel,
    /// Decoder-only transformer language model.
    TransformerLm,
    /// Stack of transformer blocks.
    StackedTransformer,
    /// A stacked-transformer block repeated via scan.
    StackedTransformerRepeated,
    /// Pipeline-parallel stack of transformer blocks.
    PipelinedTransformer,
    /// A single transformer block (attention + feed-forward).
    Transformer,
    /// Multi-headed dot-product attention.
    DotProductAttention,
    /// Dot-product attention with lazy prefix broadcast.
    DotProductAttentionWithLpb,
    /// Transformer feed-forward block with residual and norm.
    TransformerFeedForward,
    /// Linear + bias + activation.
    FeedForward,
    /// Dense projection.
    Linear,
    /// Bias add.
    Bias,
    /// Activation function.
    Activation,
    /// Layer normalization.
    LayerNorm,
    /// Dropout.
    Dropout,
    /// Per-head attention projection.
    AttentionProjection,
    /// Fused query/key/value projection.
    CombinedQkvProjection,
    /// Projection onto a single shared head (multi-query attention).
    OneHeadedAttentionProjection,
    /// Plain einsum wrapper.
    EinsumOp,
    /// FP8 einsum wrapper with amax-history state.
    Fp8EinsumOp,
    /// Quantized dense projection.
    QuantizedLinear,
    /// Quantized per-head attention projection.
    QuantizedAttentionProjection,
    /// Quantized fused QKV projection.
    QuantizedCombinedQkvProjection,
    /// Quantized single-head projection.
    QuantizedOneHeadedAttentionProjection,
    /// Tied input embedding and output softmax.
    SharedEmbeddingSoftmax,
    /// Sinusoidal or learned position embedding.
    PositionalEmbedding,
}

impl LayerKind {
    /// Immediate supertype, `None` for [`LayerKind::BaseLayer`].
    #[must_use]
    pub fn parent(self) -> Option<Self> {
        match self {
            Self::BaseLayer => None,
            Self::DotProductAttentionWithLpb => Some(Self::DotProductAttention),
            Self::Fp8EinsumOp => Some(Self::EinsumOp),
            Self::QuantizedLinear => Some(Self::Linear),
            Self::QuantizedAttentionProjection => Some(Self::AttentionProjection),
            Self::QuantizedCombinedQkvProjection => Some(Self::CombinedQkvProjection),
            Self::QuantizedOneHeadedAttentionProjection => {
                Some(Self::OneHeadedAttentionProjection)
            }
            _ => Some(Self::BaseLayer),
        }
    }

    /// Whether `self` is `target` or derives from it.
    #[must_use]
    pub fn is_subtype_of(self, target: Self) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == target {
                return true;
            }
            current = kind.parent();
        }
        false
    }

    /// Whether this kind is one of the quantized layer variants.
    #[must_use]
    pub fn is_quantized(self) -> bool {
        matches!(
            self,
            Self::QuantizedLinear
                | Self::QuantizedAttentionProjection
                | Self::QuantizedCombinedQkvProjection
                | Self::QuantizedOneHeadedAttentionProjection
        )
    }

    /// Layer class name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::BaseLayer => "BaseLayer",
            Self::LanguageModel => "LanguageModel",
            Self::TransformerLm => "TransformerLm",
            Self::StackedTransformer => "StackedTransformer",
            Self::StackedTransformerRepeated => "StackedTransformerRepeated",
            Self::PipelinedTransformer => "PipelinedTransformer",
            Self::Transformer => "Transformer",
            Self::DotProductAttention => "DotProductAttention",
            Self::DotProductAttentionWithLpb => "DotProductAttentionWithLPB",
            Self::TransformerFeedForward => "TransformerFeedForward",
            Self::FeedForward => "FeedForward",
            Self::Linear => "Linear",
            Self::Bias => "Bias",
            Self::Activation => "Activation",
            Self::LayerNorm => "LayerNorm",
            Self::Dropout => "Dropout",
            Self::AttentionProjection => "AttentionProjection",
            Self::CombinedQkvProjection => "CombinedQKVProjectionLayer",
            Self::OneHeadedAttentionProjection => "OneHeadedAttentionProjection",
            Self::EinsumOp => "EinsumOp",
            Self::Fp8EinsumOp => "Fp8EinsumOp",
            Self::QuantizedLinear => "quantization.Linear",
            Self::QuantizedAttentionProjection => "quantization.AttentionProjection",
            Self::QuantizedCombinedQkvProjection => "quantization.CombinedQKVProjectionLayer",
            Self::QuantizedOneHeadedAttentionProjection => {
                "quantization.OneHeadedAttentionProjection"
            }
            Self::SharedEmbeddingSoftmax => "SharedEmbeddingSoftmax",
            Self::PositionalEmbedding => "PositionalEmbedding",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value of a configuration field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Sub-layer template.
    Node(Box<ConfigNode>),
    /// Boolean flag.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// String.
    Str(String),
    /// Quantization directive.
    Quantization(QuantizationHParams),
    /// Container of values. Nodes inside lists are not traversal edges.
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Short name of the variant, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Node(_) => "node",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Quantization(_) => "quantization",
            Self::List(_) => "list",
        }
    }

    /// Borrow the node if this is a `Node` value.
    #[must_use]
    pub fn as_node(&self) -> Option<&ConfigNode> {
        match self {
            Self::Node(node) => Some(&**node),
            _ => None,
        }
    }
}

impl From<ConfigNode> for FieldValue {
    fn from(node: ConfigNode) -> Self {
        Self::Node(Box::new(node))
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Values above `i64::MAX` are stored as `i64::MAX`.
impl From<usize> for FieldValue {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<QuantizationHParams> for FieldValue {
    fn from(value: QuantizationHParams) -> Self {
        Self::Quantization(value)
    }
}

impl From<Vec<FieldValue>> for FieldValue {
    fn from(values: Vec<FieldValue>) -> Self {
        Self::List(values)
    }
}

/// Template describing how to construct one layer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigNode {
    kind: LayerKind,
    fields: Vec<(String, FieldValue)>,
}

impl ConfigNode {
    /// Create an empty template for `kind`.
    #[must_use]
    pub fn new(kind: LayerKind) -> Self {
        Self {
            kind,
            fields: Vec::new(),
        }
    }

    /// Declared layer type.
    #[must_use]
    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    /// Builder form of [`ConfigNode::set`].
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Assign a field in place, returning the previous value.
    ///
    /// An existing field keeps its position; a new field is appended.
    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) -> Option<FieldValue> {
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.fields.push((name.to_string(), value));
                None
            }
        }
    }

    /// Look up a field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Whether the field is set.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Borrow a sub-layer template.
    ///
    /// # Errors
    /// Returns a schema violation if the field is absent or not a node.
    pub fn node(&self, name: &str) -> Result<&ConfigNode> {
        match self.get(name) {
            Some(FieldValue::Node(node)) => Ok(&**node),
            Some(other) => Err(QuantError::schema(
                self.kind,
                name,
                format!("expected node, found {}", other.type_name()),
            )),
            None => Err(QuantError::schema(self.kind, name, "field is missing")),
        }
    }

    /// Mutably borrow a sub-layer template.
    ///
    /// # Errors
    /// Returns a schema violation if the field is absent or not a node.
    pub fn node_mut(&mut self, name: &str) -> Result<&mut ConfigNode> {
        let kind = self.kind;
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, FieldValue::Node(node))) => Ok(&mut **node),
            Some((_, other)) => Err(QuantError::schema(
                kind,
                name,
                format!("expected node, found {}", other.type_name()),
            )),
            None => Err(QuantError::schema(kind, name, "field is missing")),
        }
    }

    /// Read a boolean flag; an unset flag reads as `false`.
    ///
    /// # Errors
    /// Returns a schema violation if the field holds a non-bool value.
    pub fn flag(&self, name: &str) -> Result<bool> {
        match self.get(name) {
            Some(FieldValue::Bool(b)) => Ok(*b),
            Some(other) => Err(QuantError::schema(
                self.kind,
                name,
                format!("expected bool, found {}", other.type_name()),
            )),
            None => Ok(false),
        }
    }

    /// Read an integer field.
    ///
    /// # Errors
    /// Returns a schema violation if the field is absent or not an int.
    pub fn int(&self, name: &str) -> Result<i64> {
        match self.get(name) {
            Some(FieldValue::Int(i)) => Ok(*i),
            Some(other) => Err(QuantError::schema(
                self.kind,
                name,
                format!("expected int, found {}", other.type_name()),
            )),
            None => Err(QuantError::schema(self.kind, name, "field is missing")),
        }
    }

    /// Quantization directive attached to this node, if any.
    #[must_use]
    pub fn quantization(&self) -> Option<&QuantizationHParams> {
        match self.get(QUANTIZATION_FIELD) {
            Some(FieldValue::Quantization(hp)) => Some(hp),
            _ => None,
        }
    }

    /// Fields in declared order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Direct node-valued fields in declared order.
    pub fn children(&self) -> impl Iterator<Item = &ConfigNode> {
        self.fields.iter().filter_map(|(_, v)| v.as_node())
    }

    /// Mutable direct node-valued fields in declared order.
    pub fn children_mut(&mut self) -> impl Iterator<Item = &mut ConfigNode> {
        self.fields.iter_mut().filter_map(|(_, v)| match v {
            FieldValue::Node(node) => Some(node.as_mut()),
            _ => None,
        })
    }

    /// Every node reachable through node fields, self first, in BFS order.
    #[must_use]
    pub fn descendants(&self) -> Vec<&ConfigNode> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([self]);
        while let Some(node) = queue.pop_front() {
            out.push(node);
            queue.extend(node.children());
        }
        out
    }
}

/// Produced experiment configuration whose model can be rewritten.
pub trait HasModel {
    /// Root of the model's layer configuration.
    fn model_mut(&mut self) -> &mut ConfigNode;
}

/// Task configuration: a named wrapper around the model template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Experiment name.
    pub name: String,
    /// Model template.
    pub model: ConfigNode,
}

impl TaskConfig {
    /// Create a task configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, model: ConfigNode) -> Self {
        Self {
            name: name.into(),
            model,
        }
    }
}

impl HasModel for TaskConfig {
    fn model_mut(&mut self) -> &mut ConfigNode {
        &mut self.model
    }
}
