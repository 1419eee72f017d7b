//! Layer variable storage and sharding annotations.
//!
//! Trainable weights live in a [`candle_nn::VarMap`] so they can be handed
//! straight to an optimizer or saved as safetensors. Everything else
//! (quantized codes, scales, FP8 statistics) is kept in a side table that
//! optimizers never see.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarMap};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{QuantError, Result};

/// Suffix appended to a weight name to form the name of its scale.
pub const QUANTIZED_NAME_POSTFIX: &str = "_quantized_scale";

/// Top-level collection name for layer parameters.
pub const PARAMS: &str = "params";

/// Initializer for a new variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WeightInit {
    /// Every element set to the value.
    Constant(f64),
    /// Zero-mean normal with the given standard deviation.
    Gaussian {
        /// Standard deviation.
        scale: f64,
    },
    /// Uniform over `[-scale, scale]`.
    Uniform {
        /// Half-width of the interval.
        scale: f64,
    },
    /// Glorot uniform over the last two axes, multiplied by `scale`.
    Xavier {
        /// Multiplier on the Glorot bound.
        scale: f64,
    },
}

impl Default for WeightInit {
    fn default() -> Self {
        Self::Xavier { scale: 1.0 }
    }
}

impl WeightInit {
    #[allow(clippy::cast_precision_loss)]
    fn to_candle(self, shape: &[usize]) -> Init {
        match self {
            Self::Constant(value) => Init::Const(value),
            Self::Gaussian { scale } => Init::Randn {
                mean: 0.0,
                stdev: scale,
            },
            Self::Uniform { scale } => Init::Uniform {
                lo: -scale,
                up: scale,
            },
            Self::Xavier { scale } => {
                let (fan_in, fan_out) = match shape {
                    [] => (1, 1),
                    [n] => (*n, *n),
                    [.., a, b] => (*a, *b),
                };
                let bound = scale * (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                }
            }
        }
    }
}

/// Variable collections a weight can be tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WeightCollection {
    /// Excluded from gradient-based updates.
    NonTrainable,
    /// Replaced by the value carried in its gradient each step.
    OverwriteWithGradient,
}

/// Sharding of one tensor dimension over a device mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimSharding {
    /// Not split.
    Replicated,
    /// Split over the named mesh axis.
    Axis(String),
    /// Split over the mesh axis at this index of the axis names.
    AxisIndex(usize),
    /// Split over several mesh axes at once.
    Axes(Vec<String>),
}

impl From<&str> for DimSharding {
    fn from(axis: &str) -> Self {
        Self::Axis(axis.to_string())
    }
}

/// Shape, dtype, initializer and sharding of a layer variable.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightHParams {
    /// Variable shape.
    pub shape: Vec<usize>,
    /// Initializer.
    pub init: WeightInit,
    /// Storage dtype.
    pub dtype: DType,
    /// Collections; empty means an ordinary trainable weight.
    pub collections: Vec<WeightCollection>,
    /// Device mesh the variable is laid out on.
    pub mesh_shape: Option<Vec<usize>>,
    /// Per-dimension sharding, one entry per axis of `shape`.
    pub tensor_split_dims_mapping: Option<Vec<DimSharding>>,
}

impl WeightHParams {
    /// Trainable f32 weight with the default initializer.
    #[must_use]
    pub fn new(shape: Vec<usize>) -> Self {
        Self {
            shape,
            init: WeightInit::default(),
            dtype: DType::F32,
            collections: Vec::new(),
            mesh_shape: None,
            tensor_split_dims_mapping: None,
        }
    }

    /// Set the initializer.
    #[must_use]
    pub fn with_init(mut self, init: WeightInit) -> Self {
        self.init = init;
        self
    }

    /// Set the storage dtype.
    #[must_use]
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Add a collection tag.
    #[must_use]
    pub fn with_collection(mut self, collection: WeightCollection) -> Self {
        if !self.collections.contains(&collection) {
            self.collections.push(collection);
        }
        self
    }

    /// Set the mesh shape and per-dimension sharding.
    #[must_use]
    pub fn with_sharding(
        mut self,
        mesh_shape: Option<Vec<usize>>,
        split_dims: Option<Vec<DimSharding>>,
    ) -> Self {
        self.mesh_shape = mesh_shape;
        self.tensor_split_dims_mapping = split_dims;
        self
    }

    /// Whether the optimizer should update this weight.
    #[must_use]
    pub fn is_trainable(&self) -> bool {
        self.collections.is_empty()
    }

    fn validate(&self, name: &str) -> Result<()> {
        if let Some(mapping) = &self.tensor_split_dims_mapping {
            if mapping.len() != self.shape.len() {
                return Err(QuantError::InvalidConfig(format!(
                    "variable '{name}': {} split dims for rank-{} shape",
                    mapping.len(),
                    self.shape.len()
                )));
            }
        }
        Ok(())
    }
}

/// Per-dimension mesh assignment of a partition spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionAxis {
    /// One mesh axis.
    Single(String),
    /// Several mesh axes, major to minor.
    Multi(Vec<String>),
}

/// Partition spec of a tensor: `None` entries are replicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec(pub Vec<Option<PartitionAxis>>);

impl PartitionSpec {
    /// Fully replicated spec of the given rank.
    #[must_use]
    pub fn replicated(rank: usize) -> Self {
        Self(vec![None; rank])
    }

    /// Number of dimensions covered.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.0.len()
    }
}

/// Translate a weight's sharding annotation into a partition spec.
///
/// Unsharded weights get a fully replicated spec.
///
/// # Errors
/// Returns error if an axis index is out of range or a named axis is not in
/// `mesh_axis_names`.
pub fn weight_hparams_to_pspec(
    hparams: &WeightHParams,
    mesh_axis_names: Option<&[String]>,
) -> Result<PartitionSpec> {
    let Some(mapping) = &hparams.tensor_split_dims_mapping else {
        return Ok(PartitionSpec::replicated(hparams.shape.len()));
    };

    let check = |axis: &str| -> Result<()> {
        match mesh_axis_names {
            Some(names) if !names.iter().any(|n| n == axis) => Err(QuantError::InvalidConfig(
                format!("mesh axis '{axis}' not in {names:?}"),
            )),
            _ => Ok(()),
        }
    };

    let mut spec = Vec::with_capacity(mapping.len());
    for dim in mapping {
        let entry = match dim {
            DimSharding::Replicated => None,
            DimSharding::Axis(axis) => {
                check(axis)?;
                Some(PartitionAxis::Single(axis.clone()))
            }
            DimSharding::AxisIndex(index) => {
                let name = mesh_axis_names
                    .and_then(|names| names.get(*index))
                    .ok_or_else(|| {
                        QuantError::InvalidConfig(format!("mesh axis index {index} is undefined"))
                    })?;
                Some(PartitionAxis::Single(name.clone()))
            }
            DimSharding::Axes(axes) => {
                for axis in axes {
                    check(axis)?;
                }
                Some(PartitionAxis::Multi(axes.clone()))
            }
        };
        spec.push(entry);
    }
    Ok(PartitionSpec(spec))
}

/// Variables owned by one layer.
pub struct VariableStore {
    device: Device,
    varmap: VarMap,
    non_trainable: BTreeMap<String, Var>,
    hparams: BTreeMap<String, WeightHParams>,
}

impl std::fmt::Debug for VariableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableStore")
            .field("device", &self.device)
            .field("variables", &self.hparams.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl VariableStore {
    /// Empty store placing new variables on `device`.
    #[must_use]
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            varmap: VarMap::new(),
            non_trainable: BTreeMap::new(),
            hparams: BTreeMap::new(),
        }
    }

    /// Device new variables are placed on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Create and initialize a variable.
    ///
    /// # Errors
    /// Returns error if the name is taken, the sharding annotation does not
    /// match the shape, or initialization fails.
    pub fn create_variable(&mut self, name: &str, hparams: WeightHParams) -> Result<Tensor> {
        if self.hparams.contains_key(name) {
            return Err(QuantError::InvalidConfig(format!(
                "variable '{name}' already exists"
            )));
        }
        hparams.validate(name)?;

        let init = hparams.init.to_candle(&hparams.shape);
        let tensor = if hparams.is_trainable() {
            self.varmap.get(
                hparams.shape.clone(),
                name,
                init,
                hparams.dtype,
                &self.device,
            )?
        } else {
            let var = init.var(hparams.shape.clone(), hparams.dtype, &self.device)?;
            let tensor = var.as_tensor().clone();
            self.non_trainable.insert(name.to_string(), var);
            tensor
        };

        debug!(
            variable = name,
            shape = ?hparams.shape,
            trainable = hparams.is_trainable(),
            "created variable"
        );
        self.hparams.insert(name.to_string(), hparams);
        Ok(tensor)
    }

    /// Create a non-trainable quantized weight `name` plus its scale
    /// `name + QUANTIZED_NAME_POSTFIX` of shape `scale_shape`.
    ///
    /// Codes are stored in `weight.dtype` and start at zero; the scale
    /// starts at one.
    ///
    /// # Errors
    /// Returns error if either name is taken.
    pub fn create_quantized_variable(
        &mut self,
        name: &str,
        weight: WeightHParams,
        scale_shape: Vec<usize>,
    ) -> Result<()> {
        let codes = WeightHParams {
            init: WeightInit::Constant(0.0),
            ..weight
        }
        .with_collection(WeightCollection::NonTrainable);
        let scale = WeightHParams::new(scale_shape)
            .with_init(WeightInit::Constant(1.0))
            .with_dtype(codes.dtype)
            .with_collection(WeightCollection::NonTrainable);

        self.create_variable(name, codes)?;
        self.create_variable(&format!("{name}{QUANTIZED_NAME_POSTFIX}"), scale)?;
        Ok(())
    }

    /// Current value of a variable.
    ///
    /// # Errors
    /// Returns error if no variable has this name.
    pub fn get(&self, name: &str) -> Result<Tensor> {
        Ok(self.var(name)?.as_tensor().clone())
    }

    /// Handle to a variable for in-place updates.
    ///
    /// # Errors
    /// Returns error if no variable has this name.
    pub fn var(&self, name: &str) -> Result<Var> {
        if let Some(var) = self.non_trainable.get(name) {
            return Ok(var.clone());
        }
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| QuantError::InvalidConfig("variable map lock poisoned".into()))?;
        data.get(name)
            .cloned()
            .ok_or_else(|| QuantError::InvalidConfig(format!("unknown variable '{name}'")))
    }

    /// Overwrite a variable's value, casting to its storage dtype.
    ///
    /// # Errors
    /// Returns error if the variable is unknown or the shapes differ.
    pub fn assign(&self, name: &str, value: &Tensor) -> Result<()> {
        let var = self.var(name)?;
        if var.dims() != value.dims() {
            return Err(QuantError::ShapeMismatch {
                expected: var.dims().to_vec(),
                actual: value.dims().to_vec(),
            });
        }
        var.set(&value.to_dtype(var.dtype())?)?;
        Ok(())
    }

    /// Annotation a variable was created with.
    ///
    /// # Errors
    /// Returns error if no variable has this name.
    pub fn weight_hparams(&self, name: &str) -> Result<&WeightHParams> {
        self.hparams
            .get(name)
            .ok_or_else(|| QuantError::InvalidConfig(format!("unknown variable '{name}'")))
    }

    /// Variables an optimizer may update.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Names of variables excluded from optimization, sorted.
    #[must_use]
    pub fn non_trainable_names(&self) -> Vec<&str> {
        self.non_trainable.keys().map(String::as_str).collect()
    }

    /// Names of all variables, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hparams.keys().map(String::as_str)
    }

    /// Backing map of trainable variables.
    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trainable_and_non_trainable_split() {
        let mut store = VariableStore::new(&Device::Cpu);
        store
            .create_variable("w", WeightHParams::new(vec![4, 8]))
            .unwrap();
        store
            .create_variable(
                "amax",
                WeightHParams::new(vec![16])
                    .with_init(WeightInit::Constant(0.0))
                    .with_collection(WeightCollection::OverwriteWithGradient),
            )
            .unwrap();

        assert_eq!(store.trainable_vars().len(), 1);
        assert_eq!(store.non_trainable_names(), vec!["amax"]);
        assert_eq!(store.names().count(), 2);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut store = VariableStore::new(&Device::Cpu);
        store.create_variable("w", WeightHParams::new(vec![2])).unwrap();
        let err = store
            .create_variable("w", WeightHParams::new(vec![2]))
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_quantized_variable_pair() {
        let mut store = VariableStore::new(&Device::Cpu);
        store
            .create_quantized_variable("w", WeightHParams::new(vec![3, 5]), vec![5])
            .unwrap();

        let codes = store.get("w").unwrap();
        assert_eq!(codes.dims(), &[3, 5]);
        let scale = store.get("w_quantized_scale").unwrap();
        assert_eq!(scale.to_vec1::<f32>().unwrap(), vec![1.0; 5]);
        assert!(store.trainable_vars().is_empty());
    }

    #[test]
    fn test_assign_checks_shape() {
        let mut store = VariableStore::new(&Device::Cpu);
        store
            .create_variable(
                "b",
                WeightHParams::new(vec![3]).with_init(WeightInit::Constant(0.0)),
            )
            .unwrap();

        let value = Tensor::new(&[1.0f64, 2.0, 3.0], &Device::Cpu).unwrap();
        store.assign("b", &value).unwrap();
        let stored = store.get("b").unwrap();
        assert_eq!(stored.dtype(), DType::F32);
        assert_eq!(stored.to_vec1::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);

        let wrong = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            store.assign("b", &wrong),
            Err(QuantError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_xavier_bound() {
        let mut store = VariableStore::new(&Device::Cpu);
        let w = store
            .create_variable("w", WeightHParams::new(vec![16, 8]))
            .unwrap();
        let bound = (6.0f32 / 24.0).sqrt();
        let max = w.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(max <= bound);
    }

    #[test]
    fn test_pspec_from_names_and_indices() {
        let names = vec!["replica".to_string(), "mdl".to_string()];
        let hp = WeightHParams::new(vec![8, 4]).with_sharding(
            Some(vec![1, 2]),
            Some(vec![DimSharding::AxisIndex(0), "mdl".into()]),
        );
        let spec = weight_hparams_to_pspec(&hp, Some(names.as_slice())).unwrap();
        assert_eq!(
            spec,
            PartitionSpec(vec![
                Some(PartitionAxis::Single("replica".into())),
                Some(PartitionAxis::Single("mdl".into())),
            ])
        );
    }

    #[test]
    fn test_pspec_unsharded_is_replicated() {
        let spec = weight_hparams_to_pspec(&WeightHParams::new(vec![2, 3, 4]), None).unwrap();
        assert_eq!(spec, PartitionSpec::replicated(3));
    }

    #[test]
    fn test_pspec_unknown_axis() {
        let names = vec!["data".to_string()];
        let hp = WeightHParams::new(vec![8])
            .with_sharding(Some(vec![2]), Some(vec!["mdl".into()]));
        assert!(weight_hparams_to_pspec(&hp, Some(names.as_slice())).is_err());
    }

    #[test]
    fn test_split_dims_rank_checked() {
        let mut store = VariableStore::new(&Device::Cpu);
        let hp = WeightHParams::new(vec![8, 4])
            .with_sharding(Some(vec![2]), Some(vec![DimSharding::Replicated]));
        assert!(store.create_variable("w", hp).is_err());
    }
}
