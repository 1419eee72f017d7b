//! FP8 (E4M3 / E5M2) quantize-dequantize for einsum training.
//!
//! Inputs and kernels are rounded to E4M3 in the forward pass. The gradient
//! arriving at the einsum output is rounded to E5M2 in the backward pass.
//! Each leg keeps a rolling history of per-step absolute maxima; the scale
//! for a step is derived from the largest value in that history.
//!
//! The rounding itself is simulated: values stay in the compute dtype but
//! are snapped onto the FP8 grid, so the contraction runs on regular
//! kernels.

use candle_core::{CpuStorage, CustomOp1, DType, Layout, Shape, Tensor, Var};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::einsum::einsum;
use crate::error::{QuantError, Result};
use crate::hparams::ComputeDType;
use crate::variables::{VariableStore, WeightCollection, WeightHParams, WeightInit};

/// 8-bit float encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fp8Format {
    /// 4 exponent bits, 3 mantissa bits. Used for activations and kernels.
    E4M3,
    /// 5 exponent bits, 2 mantissa bits. Used for gradients.
    E5M2,
}

impl Fp8Format {
    /// Largest finite magnitude.
    #[must_use]
    pub fn max_value(self) -> f32 {
        match self {
            Self::E4M3 => 448.0,
            Self::E5M2 => 57344.0,
        }
    }

    /// Explicit mantissa bits.
    #[must_use]
    pub fn mantissa_bits(self) -> i32 {
        match self {
            Self::E4M3 => 3,
            Self::E5M2 => 2,
        }
    }

    /// Exponent of the smallest normal value.
    #[must_use]
    pub fn min_normal_exponent(self) -> i32 {
        match self {
            Self::E4M3 => -6,
            Self::E5M2 => -14,
        }
    }
}

/// Round `value` to the nearest representable value of `format`.
///
/// Ties go to even. Out-of-range values saturate at `±max_value`; NaN is
/// passed through.
#[must_use]
pub fn round_to_fp8(value: f32, format: Fp8Format) -> f32 {
    if value.is_nan() {
        return value;
    }
    let max = format.max_value();
    let clamped = value.clamp(-max, max);
    if clamped == 0.0 {
        return clamped;
    }

    // Unbiased exponent from the f32 bits.
    #[allow(clippy::cast_possible_wrap)]
    let exponent = ((clamped.abs().to_bits() >> 23) & 0xff) as i32 - 127;
    let exponent = exponent.max(format.min_normal_exponent());
    let step = 2f32.powi(exponent - format.mantissa_bits());

    ((clamped / step).round_ties_even() * step).clamp(-max, max)
}

/// Scale for the next step: `1 / (fp8_max / amax)`.
///
/// Falls back to `prev_scale` when `amax` is zero, negative or not finite.
#[must_use]
pub fn compute_scale(amax: f32, prev_scale: f32, fp8_max: f32) -> f32 {
    if amax > 0.0 && amax.is_finite() {
        1.0 / (fp8_max / amax)
    } else {
        prev_scale
    }
}

/// Roll the history left by one and record `amax` at index 0.
pub fn roll_amax_history(history: &mut [f32], amax: f32) {
    if history.is_empty() {
        return;
    }
    history.rotate_left(1);
    history[0] = amax;
}

/// Scale and amax history of one FP8 leg.
#[derive(Debug, Clone)]
pub struct QdqState {
    scale: Var,
    amax_history: Var,
}

impl QdqState {
    fn create(store: &mut VariableStore, prefix: &str, history_len: usize) -> Result<Self> {
        let state = |shape: Vec<usize>, value: f64| {
            WeightHParams::new(shape)
                .with_init(WeightInit::Constant(value))
                .with_collection(WeightCollection::OverwriteWithGradient)
        };
        store.create_variable(&format!("{prefix}_amax_history"), state(vec![history_len], 0.0))?;
        store.create_variable(&format!("{prefix}_scale"), state(vec![1], 1.0))?;
        Ok(Self {
            scale: store.var(&format!("{prefix}_scale"))?,
            amax_history: store.var(&format!("{prefix}_amax_history"))?,
        })
    }

    /// Current scale.
    ///
    /// # Errors
    /// Returns error if the variable cannot be read.
    pub fn scale(&self) -> Result<f32> {
        let values = self.scale.as_tensor().to_dtype(DType::F32)?.to_vec1::<f32>()?;
        Ok(values.first().copied().unwrap_or(1.0))
    }

    /// Recorded amax history, newest first.
    ///
    /// # Errors
    /// Returns error if the variable cannot be read.
    pub fn amax_history(&self) -> Result<Vec<f32>> {
        Ok(self
            .amax_history
            .as_tensor()
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?)
    }

    /// Quantize-dequantize `x` and advance the state.
    ///
    /// The returned tensor carries the FP8 values forward while its gradient
    /// with respect to `x` is the identity.
    ///
    /// # Errors
    /// Returns error on tensor failures.
    pub fn qdq(&self, x: &Tensor, format: Fp8Format) -> Result<Tensor> {
        let qdq = self.round(x, format)?;
        let delta = (qdq - x)?.detach();
        Ok((x + delta)?)
    }

    /// Snap `x` onto the scaled FP8 grid, record its amax and refresh the
    /// scale. The result is detached from `x`.
    fn round(&self, x: &Tensor, format: Fp8Format) -> Result<Tensor> {
        let fp8_max = format.max_value();
        let mut history = self.amax_history()?;
        let history_max = history.iter().copied().fold(0.0f32, f32::max);
        let scale = compute_scale(history_max, self.scale()?, fp8_max);

        let values = x.detach().to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let mut amax = 0.0f32;
        let quantized: Vec<f32> = values
            .iter()
            .map(|&v| {
                amax = amax.max(v.abs());
                round_to_fp8((v / scale).clamp(-fp8_max, fp8_max), format) * scale
            })
            .collect();

        roll_amax_history(&mut history, amax);
        let device = self.amax_history.device();
        self.amax_history
            .set(&Tensor::from_vec(history, self.amax_history.dims(), device)?)?;
        self.scale.set(&Tensor::new(&[scale], device)?)?;

        Ok(Tensor::from_vec(quantized, x.dims(), x.device())?.to_dtype(x.dtype())?)
    }
}

/// Identity in the forward pass; rounds the incoming gradient to E5M2.
struct OutputGradQdq {
    state: QdqState,
}

impl CustomOp1 for OutputGradQdq {
    fn name(&self) -> &'static str {
        "fp8-output-grad-qdq"
    }

    fn cpu_fwd(
        &self,
        storage: &CpuStorage,
        layout: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        let (start, end) = layout
            .contiguous_offsets()
            .ok_or_else(|| candle_core::Error::RequiresContiguous { op: self.name() }.bt())?;
        let storage = match storage {
            CpuStorage::F32(v) => CpuStorage::F32(v[start..end].to_vec()),
            CpuStorage::F64(v) => CpuStorage::F64(v[start..end].to_vec()),
            CpuStorage::F16(v) => CpuStorage::F16(v[start..end].to_vec()),
            CpuStorage::BF16(v) => CpuStorage::BF16(v[start..end].to_vec()),
            _ => {
                return Err(candle_core::Error::Msg(format!(
                    "{} expects a float tensor",
                    self.name()
                )))
            }
        };
        Ok((storage, layout.shape().clone()))
    }

    fn bwd(
        &self,
        _arg: &Tensor,
        _res: &Tensor,
        grad_res: &Tensor,
    ) -> candle_core::Result<Option<Tensor>> {
        let grad = self
            .state
            .round(grad_res, Fp8Format::E5M2)
            .map_err(|e| match e {
                QuantError::Candle(e) => e,
                other => candle_core::Error::Msg(other.to_string()),
            })?;
        Ok(Some(grad))
    }
}

/// Hyper-parameters of [`Fp8EinsumOp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fp8EinsumConfig {
    /// Steps of amax kept per leg.
    pub amax_history_length: usize,
    /// Dtype the contraction runs in.
    pub compute_dtype: ComputeDType,
}

impl Default for Fp8EinsumConfig {
    fn default() -> Self {
        Self {
            amax_history_length: 1024,
            compute_dtype: ComputeDType::F32,
        }
    }
}

impl Fp8EinsumConfig {
    /// Config with the given history length.
    #[must_use]
    pub fn with_history_length(amax_history_length: usize) -> Self {
        Self {
            amax_history_length,
            ..Default::default()
        }
    }
}

/// Einsum whose operands pass through FP8 quantize-dequantize.
#[derive(Debug, Clone)]
pub struct Fp8EinsumOp {
    config: Fp8EinsumConfig,
    input: QdqState,
    kernel: QdqState,
    output_grad: QdqState,
}

impl Fp8EinsumOp {
    /// Register the six FP8 state variables in `store`.
    ///
    /// # Errors
    /// Returns error if the history length is zero or a variable name is taken.
    pub fn setup(config: Fp8EinsumConfig, store: &mut VariableStore) -> Result<Self> {
        if config.amax_history_length == 0 {
            return Err(QuantError::InvalidConfig(
                "amax_history_length must be at least 1".into(),
            ));
        }
        if config.compute_dtype == ComputeDType::F16 {
            warn!("FP8 training with F16 compute dtype; gradients may overflow");
        }

        let len = config.amax_history_length;
        let op = Self {
            input: QdqState::create(store, "input", len)?,
            kernel: QdqState::create(store, "kernel", len)?,
            output_grad: QdqState::create(store, "output_grad", len)?,
            config,
        };
        debug!(amax_history_length = len, "fp8 einsum state created");
        Ok(op)
    }

    /// Hyper-parameters.
    #[must_use]
    pub fn config(&self) -> &Fp8EinsumConfig {
        &self.config
    }

    /// Input leg state.
    #[must_use]
    pub fn input_state(&self) -> &QdqState {
        &self.input
    }

    /// Kernel leg state.
    #[must_use]
    pub fn kernel_state(&self) -> &QdqState {
        &self.kernel
    }

    /// Output-gradient leg state.
    #[must_use]
    pub fn output_grad_state(&self) -> &QdqState {
        &self.output_grad
    }

    /// Contract `x` with `k` after rounding both to E4M3.
    ///
    /// The gradient flowing back into the result is rounded to E5M2 against
    /// the output-gradient state before it reaches the einsum.
    ///
    /// # Errors
    /// Returns `DTypeMismatch` if `k` is not in the compute dtype, or any
    /// einsum error.
    pub fn forward(&self, equation: &str, x: &Tensor, k: &Tensor) -> Result<Tensor> {
        let compute = self.config.compute_dtype.dtype();
        if k.dtype() != compute {
            return Err(QuantError::DTypeMismatch {
                expected: compute,
                actual: k.dtype(),
            });
        }
        let x = x.to_dtype(compute)?;

        let x_qdq = self.input.qdq(&x, Fp8Format::E4M3)?;
        let k_qdq = self.kernel.qdq(k, Fp8Format::E4M3)?;
        let y = einsum(equation, &x_qdq, &k_qdq)?.contiguous()?;
        Ok(y.apply_op1(OutputGradQdq {
            state: self.output_grad.clone(),
        })?)
    }

    /// Round an output gradient to E5M2 against the output-gradient state.
    ///
    /// # Errors
    /// Returns error on tensor failures.
    pub fn quantize_output_grad(&self, dy: &Tensor) -> Result<Tensor> {
        self.output_grad.round(dy, Fp8Format::E5M2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn op(len: usize) -> (Fp8EinsumOp, VariableStore) {
        let mut store = VariableStore::new(&Device::Cpu);
        let op = Fp8EinsumOp::setup(Fp8EinsumConfig::with_history_length(len), &mut store).unwrap();
        (op, store)
    }

    #[test]
    fn test_format_limits() {
        assert_eq!(round_to_fp8(1000.0, Fp8Format::E4M3), 448.0);
        assert_eq!(round_to_fp8(-1e6, Fp8Format::E5M2), -57344.0);
        assert_eq!(round_to_fp8(448.0, Fp8Format::E4M3), 448.0);
    }

    #[test]
    fn test_round_to_grid() {
        // Between 1 and 2, E4M3 steps by 1/8 and E5M2 by 1/4.
        assert_eq!(round_to_fp8(1.06, Fp8Format::E4M3), 1.0);
        assert_eq!(round_to_fp8(1.07, Fp8Format::E4M3), 1.125);
        assert_eq!(round_to_fp8(1.1, Fp8Format::E5M2), 1.0);
        assert_eq!(round_to_fp8(1.2, Fp8Format::E5M2), 1.25);
        // Ties to even.
        assert_eq!(round_to_fp8(1.0625, Fp8Format::E4M3), 1.0);
        assert_eq!(round_to_fp8(1.1875, Fp8Format::E4M3), 1.25);
    }

    #[test]
    fn test_subnormals() {
        // Smallest E4M3 subnormal is 2^-9.
        let tiny = 2f32.powi(-9);
        assert_eq!(round_to_fp8(tiny, Fp8Format::E4M3), tiny);
        assert_eq!(round_to_fp8(tiny * 0.4, Fp8Format::E4M3), 0.0);
    }

    #[test]
    fn test_compute_scale_keeps_previous() {
        assert_eq!(compute_scale(0.0, 0.5, 448.0), 0.5);
        assert_eq!(compute_scale(f32::INFINITY, 0.5, 448.0), 0.5);
        assert_eq!(compute_scale(f32::NAN, 0.5, 448.0), 0.5);
        assert!((compute_scale(224.0, 1.0, 448.0) - 0.5).abs() < 1e-7);
    }

    #[test]
    fn test_roll_history() {
        let mut history = vec![3.0, 2.0, 1.0];
        roll_amax_history(&mut history, 9.0);
        assert_eq!(history, vec![9.0, 1.0, 3.0]);
    }

    #[test]
    fn test_setup_registers_non_trainable_state() {
        let (_, store) = op(16);
        assert!(store.trainable_vars().is_empty());
        assert_eq!(
            store.non_trainable_names(),
            vec![
                "input_amax_history",
                "input_scale",
                "kernel_amax_history",
                "kernel_scale",
                "output_grad_amax_history",
                "output_grad_scale",
            ]
        );
        assert_eq!(store.get("kernel_amax_history").unwrap().dims(), &[16]);
    }

    #[test]
    fn test_zero_history_rejected() {
        let mut store = VariableStore::new(&Device::Cpu);
        assert!(Fp8EinsumOp::setup(Fp8EinsumConfig::with_history_length(0), &mut store).is_err());
    }

    #[test]
    fn test_forward_shape() {
        for len in [1, 1024] {
            let (op, _store) = op(len);
            let x = Tensor::randn(0f32, 1.0, (2, 3, 8), &Device::Cpu).unwrap();
            let k = Tensor::randn(0f32, 1.0, (8, 4), &Device::Cpu).unwrap();
            let y = op.forward("...D,DH->...H", &x, &k).unwrap();
            assert_eq!(y.dims(), &[2, 3, 4]);
        }
    }

    #[test]
    fn test_history_and_scale_updates() {
        let (op, _store) = op(4);
        let k = Tensor::new(&[[1.0f32], [2.0]], &Device::Cpu).unwrap();

        let x1 = Tensor::new(&[[0.5f32, -3.0]], &Device::Cpu).unwrap();
        op.forward("xy,yz->xz", &x1, &k).unwrap();
        // Empty history: the scale stays at its initial value.
        assert_eq!(op.input_state().scale().unwrap(), 1.0);
        assert_eq!(op.input_state().amax_history().unwrap(), vec![3.0, 0.0, 0.0, 0.0]);

        let x2 = Tensor::new(&[[1.0f32, 1.5]], &Device::Cpu).unwrap();
        op.forward("xy,yz->xz", &x2, &k).unwrap();
        let expected = 3.0 / 448.0;
        assert!((op.input_state().scale().unwrap() - expected).abs() < 1e-7);
        assert_eq!(op.input_state().amax_history().unwrap(), vec![1.5, 0.0, 0.0, 3.0]);
        assert_eq!(op.kernel_state().amax_history().unwrap()[0], 2.0);
    }

    #[test]
    fn test_kernel_dtype_checked() {
        let (op, _store) = op(1);
        let x = Tensor::ones((1, 2), DType::F32, &Device::Cpu).unwrap();
        let k = Tensor::ones((2, 2), DType::F64, &Device::Cpu).unwrap();
        let err = op.forward("xy,yz->xz", &x, &k).unwrap_err();
        assert!(matches!(err, QuantError::DTypeMismatch { .. }));
    }

    #[test]
    fn test_straight_through_gradient() {
        let (op, _store) = op(8);
        let x = Var::new(&[0.3f32, -1.7, 2.9, 100.0], &Device::Cpu).unwrap();
        let y = op.input_state().qdq(x.as_tensor(), Fp8Format::E4M3).unwrap();
        let grads = y.sum_all().unwrap().backward().unwrap();
        let dx = grads.get(x.as_tensor()).unwrap();
        assert_eq!(dx.to_vec1::<f32>().unwrap(), vec![1.0; 4]);
    }

    #[test]
    fn test_output_grad_uses_e5m2() {
        let (op, _store) = op(2);
        let dy = Tensor::new(&[1.2f32, 60000.0], &Device::Cpu).unwrap();
        let q = op.quantize_output_grad(&dy).unwrap();
        assert_eq!(q.to_vec1::<f32>().unwrap(), vec![1.25, 57344.0]);
        assert_eq!(op.output_grad_state().amax_history().unwrap(), vec![60000.0, 0.0]);
    }

    #[test]
    fn test_backward_rounds_output_grad() {
        let (op, _store) = op(4);
        let x = Var::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap();
        let k = Tensor::ones((2, 1), DType::F32, &Device::Cpu).unwrap();

        let y = op.forward("xy,yz->xz", x.as_tensor(), &k).unwrap();
        assert_eq!(y.to_vec2::<f32>().unwrap(), vec![vec![3.0]]);
        assert_eq!(op.output_grad_state().amax_history().unwrap(), vec![0.0; 4]);

        let loss = (y * 1.1).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        // dy = 1.1 lands on 1.0 in E5M2, then flows through k.
        let dx = grads.get(x.as_tensor()).unwrap();
        assert_eq!(dx.to_vec2::<f32>().unwrap(), vec![vec![1.0, 1.0]]);

        let history = op.output_grad_state().amax_history().unwrap();
        assert!((history[0] - 1.1).abs() < 1e-6);
        assert_eq!(&history[1..], &[0.0, 0.0, 0.0]);
    }
}
