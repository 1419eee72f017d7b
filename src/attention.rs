//! Quantized one-headed attention projection.
//!
//! Projects `[..., D]` inputs onto `[..., H]` with an optional bias, the
//! per-head projection used by multi-query attention. Depending on the
//! quantization mode the weight is either a trainable float tensor or a pair
//! of integer codes and per-channel scales.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::einsum::einsum;
use crate::error::{QuantError, Result};
use crate::hparams::{ComputeDType, QuantizationHParams, QuantizationMode, QuantizationType};
use crate::operations::{quantized_einsum, reduce_einsum_weight_precision, Int8Tensor};
use crate::variables::{
    weight_hparams_to_pspec, DimSharding, PartitionSpec, VariableStore, WeightHParams, WeightInit,
    PARAMS, QUANTIZED_NAME_POSTFIX,
};

const PROJECTION_EQN: &str = "...D,DH->...H";
const WEIGHT_EQN: &str = "xy,yz->xz";

/// Sharding annotations for the projection weight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightSplitDimsMapping {
    /// Sharding of `w` as `[input, output]`.
    pub wt: Option<[DimSharding; 2]>,
}

/// Configuration of [`OneHeadedAttentionProjection`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneHeadedAttentionProjectionConfig {
    /// Input width `D`.
    pub input_dim: usize,
    /// Output width `H`.
    pub output_dim: usize,
    /// Add a learned bias.
    pub use_bias: bool,
    /// Quantization directive.
    pub quantization: QuantizationHParams,
    /// Storage dtype of variables.
    pub dtype: ComputeDType,
    /// Dtype of the forward computation.
    pub fprop_dtype: ComputeDType,
    /// Initializer for the float weight.
    pub params_init: WeightInit,
    /// Device mesh shape.
    pub mesh_shape: Option<Vec<usize>>,
    /// Names of the mesh axes.
    pub mesh_axis_names: Option<Vec<String>>,
    /// Weight sharding.
    pub weight_split_dims_mapping: WeightSplitDimsMapping,
}

impl Default for OneHeadedAttentionProjectionConfig {
    fn default() -> Self {
        Self {
            input_dim: 512,
            output_dim: 64,
            use_bias: true,
            quantization: QuantizationHParams::default(),
            dtype: ComputeDType::F32,
            fprop_dtype: ComputeDType::F32,
            params_init: WeightInit::Gaussian { scale: 1.0 },
            mesh_shape: None,
            mesh_axis_names: None,
            weight_split_dims_mapping: WeightSplitDimsMapping::default(),
        }
    }
}

impl OneHeadedAttentionProjectionConfig {
    /// Projection from `input_dim` to `output_dim`.
    #[must_use]
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            ..Default::default()
        }
    }

    /// Set the quantization directive.
    #[must_use]
    pub fn with_quantization(mut self, quantization: QuantizationHParams) -> Self {
        self.quantization = quantization;
        self
    }

    /// Enable or disable the bias.
    #[must_use]
    pub fn with_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Set the float weight initializer.
    #[must_use]
    pub fn with_params_init(mut self, params_init: WeightInit) -> Self {
        self.params_init = params_init;
        self
    }

    /// Lay the weight out on a device mesh.
    #[must_use]
    pub fn with_mesh(
        mut self,
        mesh_shape: Vec<usize>,
        mesh_axis_names: Vec<String>,
        wt: Option<[DimSharding; 2]>,
    ) -> Self {
        self.mesh_shape = Some(mesh_shape);
        self.mesh_axis_names = Some(mesh_axis_names);
        self.weight_split_dims_mapping.wt = wt;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.input_dim == 0 || self.output_dim == 0 {
            return Err(QuantError::InvalidConfig(format!(
                "projection dims must be positive, got {}x{}",
                self.input_dim, self.output_dim
            )));
        }
        if self.mesh_shape.is_some() && self.weight_split_dims_mapping.wt.is_none() {
            return Err(QuantError::InvalidConfig(
                "weight sharding annotations are required when mesh_shape is set".into(),
            ));
        }
        self.quantization.validate()
    }

    fn is_inference(&self) -> bool {
        self.quantization.mode == QuantizationMode::Inference
    }
}

/// Partition specs keyed by collection, then variable name.
pub type NestedPartitionSpecs = BTreeMap<String, BTreeMap<String, PartitionSpec>>;

/// Result of post-training quantization of a projection weight.
#[derive(Debug, Clone)]
pub struct QuantizedWeights {
    /// Integer codes of `w`, shaped `[D, H]`.
    pub w: Int8Tensor,
    /// Per-output-channel scale, shaped `[H]`.
    pub w_quantized_scale: Tensor,
}

impl QuantizedWeights {
    /// Variables keyed the way the layer stores them, under `"params"`.
    ///
    /// # Errors
    /// Returns error if the codes cannot be materialized.
    pub fn to_params(&self, device: &Device) -> Result<BTreeMap<String, BTreeMap<String, Tensor>>> {
        let dtype = self.w_quantized_scale.dtype();
        let params = BTreeMap::from([
            ("w".to_string(), self.w.to_tensor(dtype, device)?),
            (
                format!("w{QUANTIZED_NAME_POSTFIX}"),
                self.w_quantized_scale.clone(),
            ),
        ]);
        Ok(BTreeMap::from([(PARAMS.to_string(), params)]))
    }
}

/// One-headed projection `[..., D] -> [..., H]` with optional quantization.
#[derive(Debug)]
pub struct OneHeadedAttentionProjection {
    config: OneHeadedAttentionProjectionConfig,
    variables: VariableStore,
}

impl OneHeadedAttentionProjection {
    /// Create the layer and its variables.
    ///
    /// In inference mode `w` is created as zeroed codes plus unit scales,
    /// ready for [`Self::load_quantized`].
    ///
    /// # Errors
    /// Returns error if the configuration is invalid.
    pub fn new(config: OneHeadedAttentionProjectionConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let mut variables = VariableStore::new(device);
        let wt = config
            .weight_split_dims_mapping
            .wt
            .as_ref()
            .map(|wt| wt.to_vec());
        let pc = WeightHParams::new(vec![config.input_dim, config.output_dim])
            .with_init(config.params_init)
            .with_dtype(config.dtype.dtype())
            .with_sharding(config.mesh_shape.clone(), wt);

        if config.is_inference() {
            variables.create_quantized_variable("w", pc, vec![config.output_dim])?;
        } else {
            variables.create_variable("w", pc)?;
        }

        if config.use_bias {
            let bias_split = config
                .mesh_shape
                .as_ref()
                .and_then(|_| config.weight_split_dims_mapping.wt.as_ref())
                .map(|[_, out]| vec![out.clone()]);
            let pc_bias = WeightHParams::new(vec![config.output_dim])
                .with_init(WeightInit::Constant(0.0))
                .with_dtype(config.dtype.dtype())
                .with_sharding(config.mesh_shape.clone(), bias_split);
            variables.create_variable("b", pc_bias)?;
        }

        debug!(
            input_dim = config.input_dim,
            output_dim = config.output_dim,
            mode = ?config.quantization.mode,
            "one-headed projection created"
        );
        Ok(Self { config, variables })
    }

    /// Layer configuration.
    #[must_use]
    pub fn config(&self) -> &OneHeadedAttentionProjectionConfig {
        &self.config
    }

    /// Variables owned by the layer.
    #[must_use]
    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    /// Float weight `[D, H]`.
    ///
    /// # Errors
    /// Returns error in inference mode, where only codes are stored.
    pub fn weight(&self) -> Result<Tensor> {
        if self.config.is_inference() {
            return Err(QuantError::InvalidConfig(
                "inference-mode projections store quantized codes, not float weights".into(),
            ));
        }
        self.variables.get("w")
    }

    /// Project `inputs` of shape `[..., D]` to `[..., H]`.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if the last dim is not `input_dim`.
    pub fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        let dims = inputs.dims();
        if dims.last() != Some(&self.config.input_dim) {
            return Err(QuantError::ShapeMismatch {
                expected: vec![self.config.input_dim],
                actual: dims.to_vec(),
            });
        }

        let fprop = self.config.fprop_dtype.dtype();
        let inputs = inputs.to_dtype(fprop)?;
        let w = self.variables.get("w")?;

        let ret = if self.config.is_inference() {
            let scale = self.variables.get(&format!("w{QUANTIZED_NAME_POSTFIX}"))?;
            quantized_einsum(PROJECTION_EQN, &inputs, &w, &scale)?
        } else {
            einsum(PROJECTION_EQN, &inputs, &w.to_dtype(fprop)?)?
        };

        if self.config.use_bias {
            let b = self.variables.get("b")?.to_dtype(ret.dtype())?;
            Ok(ret.broadcast_add(&b)?)
        } else {
            Ok(ret)
        }
    }

    /// Partition specs of the quantized weight and its scale.
    ///
    /// The scale follows the output sharding of `w`; without annotations it
    /// is replicated.
    ///
    /// # Errors
    /// Returns `NotImplemented` for static activation quantization.
    pub fn quantized_partitioned_specs(&self) -> Result<NestedPartitionSpecs> {
        if self.config.quantization.do_static_activation_quantization() {
            return Err(QuantError::NotImplemented(
                "static activation quantization is not supported yet".into(),
            ));
        }

        let axis_names = self.config.mesh_axis_names.as_deref();
        let weight_pspec = weight_hparams_to_pspec(self.variables.weight_hparams("w")?, axis_names)?;

        let scale_split = self
            .config
            .weight_split_dims_mapping
            .wt
            .as_ref()
            .map(|[_, out]| vec![out.clone()]);
        let scale_hparams = WeightHParams::new(vec![self.config.output_dim])
            .with_sharding(self.config.mesh_shape.clone(), scale_split);
        let scale_pspec = weight_hparams_to_pspec(&scale_hparams, axis_names)?;

        let params = BTreeMap::from([
            ("w".to_string(), weight_pspec),
            (format!("w{QUANTIZED_NAME_POSTFIX}"), scale_pspec),
        ]);
        Ok(BTreeMap::from([(PARAMS.to_string(), params)]))
    }

    /// Quantize the float weight to integer codes and per-channel scales.
    ///
    /// # Errors
    /// Returns `NotImplemented` for any scheme other than PTQ and for static
    /// activation quantization, and `InvalidConfig` when the layer already
    /// holds quantized codes.
    pub fn quantize_weight(&self) -> Result<QuantizedWeights> {
        let quantization = &self.config.quantization;
        if quantization.quantization_type != QuantizationType::Ptq {
            return Err(QuantError::NotImplemented(format!(
                "only PTQ is supported by the one-headed projection, got {:?}",
                quantization.quantization_type
            )));
        }
        if quantization.do_static_activation_quantization() {
            return Err(QuantError::NotImplemented(
                "static activation quantization is not supported yet".into(),
            ));
        }

        let w = self.weight()?;
        let (codes, scale) = reduce_einsum_weight_precision(
            WEIGHT_EQN,
            &w,
            self.config.dtype.dtype(),
            quantization.weight_params.precision,
            quantization.weight_params.clipping_coeff,
        )?;

        info!(
            bits = quantization.weight_params.precision,
            shape = ?codes.shape,
            "projection weight quantized"
        );
        Ok(QuantizedWeights {
            w: codes,
            w_quantized_scale: scale,
        })
    }

    /// Load PTQ results into an inference-mode layer.
    ///
    /// # Errors
    /// Returns `InvalidConfig` outside inference mode and `ShapeMismatch` if
    /// the codes do not match `[D, H]`.
    pub fn load_quantized(&self, weights: &QuantizedWeights) -> Result<()> {
        if !self.config.is_inference() {
            return Err(QuantError::InvalidConfig(
                "quantized weights can only be loaded in inference mode".into(),
            ));
        }
        let expected = vec![self.config.input_dim, self.config.output_dim];
        if weights.w.shape != expected {
            return Err(QuantError::ShapeMismatch {
                expected,
                actual: weights.w.shape.clone(),
            });
        }

        let device = self.variables.device();
        let codes = weights.w.to_tensor(self.config.dtype.dtype(), device)?;
        self.variables.assign("w", &codes)?;
        self.variables.assign(
            &format!("w{QUANTIZED_NAME_POSTFIX}"),
            &weights.w_quantized_scale.to_device(device)?,
        )?;
        Ok(())
    }
}
