//! Quantization hyper-parameters.
//!
//! [`QuantizationHParams`] is the directive attached to rewritten layer
//! templates. It tells the quantized layer which numeric scheme to apply and
//! which phase of the model lifecycle it runs in.

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::{QuantError, Result};

/// Floating-point dtype used for storage or computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ComputeDType {
    /// 32-bit float
    #[default]
    F32,
    /// 16-bit float
    F16,
    /// 16-bit brain float
    BF16,
}

impl ComputeDType {
    /// Corresponding candle dtype.
    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::BF16 => DType::BF16,
        }
    }
}

/// Numeric scheme applied to a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizationType {
    /// Post-training quantization of already-trained weights.
    #[default]
    Ptq,
    /// Fake quantization: quantize-dequantize during training.
    Fq,
    /// Accurate quantized training (integer math in the backward pass).
    Aqt,
}

/// Lifecycle phase the quantized layer runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizationMode {
    /// Full-precision weights, simulated quantization in the forward pass.
    Training,
    /// Converting float weights into their quantized form.
    Materialize,
    /// Quantized weights and scales are loaded and used directly.
    #[default]
    Inference,
}

/// Weight quantization parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightQuantizationParams {
    /// Bit width of the quantized weight.
    pub precision: u32,
    /// Fraction of the per-channel max kept before clipping.
    pub clipping_coeff: f32,
    /// Stop gradients flowing into the scale during training.
    ///
    /// Carried with the directive for the training-side layer that consumes
    /// it; nothing in this crate trains a scale.
    pub stop_scale_gradient: bool,
}

impl Default for WeightQuantizationParams {
    fn default() -> Self {
        Self {
            precision: 8,
            clipping_coeff: 1.0,
            stop_scale_gradient: false,
        }
    }
}

/// Activation quantization parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActQuantizationParams {
    /// Bit width of the quantized activation.
    pub precision: u32,
    /// Use calibrated (static) activation ranges instead of per-call ranges.
    pub static_calibration: bool,
}

impl Default for ActQuantizationParams {
    fn default() -> Self {
        Self {
            precision: 8,
            static_calibration: false,
        }
    }
}

/// Quantization directive carried by a rewritten layer template.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuantizationHParams {
    /// Numeric scheme.
    pub quantization_type: QuantizationType,
    /// Lifecycle phase.
    pub mode: QuantizationMode,
    /// Weight quantization parameters.
    #[serde(default)]
    pub weight_params: WeightQuantizationParams,
    /// Activation quantization parameters (None = weight-only).
    #[serde(default)]
    pub act_params: Option<ActQuantizationParams>,
}

impl QuantizationHParams {
    /// Weight-only directive with default weight parameters.
    #[must_use]
    pub fn new(quantization_type: QuantizationType, mode: QuantizationMode) -> Self {
        Self {
            quantization_type,
            mode,
            ..Default::default()
        }
    }

    /// Fake-quantized training, the defaults applied by `for_transformer`.
    #[must_use]
    pub fn fake_quant_training() -> Self {
        Self::new(QuantizationType::Fq, QuantizationMode::Training)
    }

    /// Post-training quantization served in inference mode.
    #[must_use]
    pub fn ptq_inference() -> Self {
        Self::new(QuantizationType::Ptq, QuantizationMode::Inference)
    }

    /// Set the activation quantization parameters.
    #[must_use]
    pub fn with_act_params(mut self, act_params: ActQuantizationParams) -> Self {
        self.act_params = Some(act_params);
        self
    }

    /// Set the weight bit width.
    #[must_use]
    pub fn with_precision(mut self, precision: u32) -> Self {
        self.weight_params.precision = precision;
        self
    }

    /// Whether activations use calibrated static ranges.
    #[must_use]
    pub fn do_static_activation_quantization(&self) -> bool {
        self.act_params
            .as_ref()
            .is_some_and(|act| act.static_calibration)
    }

    /// Validate bit widths and clipping.
    ///
    /// # Errors
    /// Returns error if precision is outside `2..=8` or clipping is outside `(0, 1]`.
    pub fn validate(&self) -> Result<()> {
        let precision = self.weight_params.precision;
        if !(2..=8).contains(&precision) {
            return Err(QuantError::InvalidConfig(format!(
                "weight precision must be in 2..=8, got {precision}"
            )));
        }
        let clip = self.weight_params.clipping_coeff;
        if !(clip > 0.0 && clip <= 1.0) {
            return Err(QuantError::InvalidConfig(format!(
                "clipping_coeff must be in (0, 1], got {clip}"
            )));
        }
        if let Some(act) = &self.act_params {
            if !(2..=8).contains(&act.precision) {
                return Err(QuantError::InvalidConfig(format!(
                    "activation precision must be in 2..=8, got {}",
                    act.precision
                )));
            }
        }
        Ok(())
    }
}
