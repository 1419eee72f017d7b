//! Symmetric integer weight quantization for einsum weights.

use candle_core::{DType, Device, Tensor};

use crate::einsum::{einsum, Equation};
use crate::error::{QuantError, Result};

/// Integer codes of a quantized weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Int8Tensor {
    /// Codes in row-major order.
    pub data: Vec<i8>,
    /// Shape of the original weight.
    pub shape: Vec<usize>,
}

impl Int8Tensor {
    /// Get the number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Get the memory size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Codes as a tensor of `dtype`. Values are exact for every float dtype.
    ///
    /// # Errors
    /// Returns error if tensor creation fails.
    pub fn to_tensor(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        let values: Vec<f32> = self.data.iter().map(|&q| f32::from(q)).collect();
        Ok(Tensor::from_vec(values, self.shape.as_slice(), device)?.to_dtype(dtype)?)
    }
}

/// Quantize the rhs weight `w` of `eqn` to `bits`-bit symmetric codes.
///
/// One scale is kept per output channel: `|w|` is max-reduced over the axes
/// the equation contracts, multiplied by `percentile` and divided by
/// `2^(bits-1) - 1`. Channels whose scale comes out zero get scale 1.
///
/// Returns the codes and the scale with the contracted axes removed.
///
/// # Errors
/// Returns error if `bits` is outside `2..=8`, `eqn` is invalid, or `w` does
/// not fit the rhs operand.
///
/// # Example
/// ```rust
/// use candle_core::{DType, Device, Tensor};
/// use layer_quant::reduce_einsum_weight_precision;
///
/// let w = Tensor::new(&[[1.2f32, -0.5], [-2.0, 0.2]], &Device::Cpu)?;
/// let (codes, scale) = reduce_einsum_weight_precision("xy,yz->xz", &w, DType::F32, 8, 1.0)?;
/// assert_eq!(codes.data, vec![76, -127, -127, 51]);
/// assert_eq!(scale.dims(), &[2]);
/// # Ok::<(), layer_quant::QuantError>(())
/// ```
pub fn reduce_einsum_weight_precision(
    eqn: &str,
    w: &Tensor,
    calculation_type: DType,
    bits: u32,
    percentile: f32,
) -> Result<(Int8Tensor, Tensor)> {
    if !(2..=8).contains(&bits) {
        return Err(QuantError::InvalidConfig(format!(
            "int8 codes hold 2..=8 bits, got {bits}"
        )));
    }
    let contract_axes = Equation::parse(eqn)?.rhs_reduced_axes(w.rank())?;
    let max_int = f64::from((1u32 << (bits - 1)) - 1);

    let w = w.to_dtype(calculation_type)?;
    let mut bound = w.abs()?;
    for &axis in &contract_axes {
        bound = bound.max_keepdim(axis)?;
    }
    let scale = bound.affine(f64::from(percentile) / max_int, 0.0)?;

    // Scales must be nonzero for the division below.
    let scale_shape = scale.dims().to_vec();
    let scale_values: Vec<f32> = scale
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?
        .into_iter()
        .map(|s| if s == 0.0 { 1.0 } else { s })
        .collect();
    let scale = Tensor::from_vec(scale_values, scale_shape, w.device())?.to_dtype(calculation_type)?;

    let codes = w
        .broadcast_div(&scale)?
        .round()?
        .clamp(-max_int, max_int)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    #[allow(clippy::cast_possible_truncation)]
    let data = codes.into_iter().map(|q| q as i8).collect();

    let mut squeezed = scale;
    for &axis in contract_axes.iter().rev() {
        squeezed = squeezed.squeeze(axis)?;
    }

    Ok((
        Int8Tensor {
            data,
            shape: w.dims().to_vec(),
        },
        squeezed,
    ))
}

/// Einsum against integer codes, rescaled per output channel.
///
/// Computes `einsum(eqn, x, codes) * scale` with `codes` cast to the dtype
/// of `x`. `scale` broadcasts over the trailing output dims.
///
/// # Errors
/// Returns error on einsum or broadcast failures.
pub fn quantized_einsum(eqn: &str, x: &Tensor, codes: &Tensor, scale: &Tensor) -> Result<Tensor> {
    let w = codes.to_dtype(x.dtype())?;
    let ret = einsum(eqn, x, &w)?;
    Ok(ret.broadcast_mul(&scale.to_dtype(ret.dtype())?)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_channel_scale() {
        let w = Tensor::new(&[[1.2f32, -0.5], [-2.0, 0.2]], &Device::Cpu).unwrap();
        let (codes, scale) =
            reduce_einsum_weight_precision("xy,yz->xz", &w, DType::F32, 8, 1.0).unwrap();

        let scale = scale.to_vec1::<f32>().unwrap();
        assert!((scale[0] - 2.0 / 127.0).abs() < 1e-7);
        assert!((scale[1] - 0.5 / 127.0).abs() < 1e-7);
        assert_eq!(codes.shape, vec![2, 2]);
        assert_eq!(codes.data, vec![76, -127, -127, 51]);
    }

    #[test]
    fn test_zero_channel_scale_is_one() {
        let w = Tensor::new(&[[0.0f32, 1.0], [0.0, -1.0]], &Device::Cpu).unwrap();
        let (codes, scale) =
            reduce_einsum_weight_precision("xy,yz->xz", &w, DType::F32, 8, 1.0).unwrap();
        assert_eq!(scale.to_vec1::<f32>().unwrap()[0], 1.0);
        assert_eq!(codes.data[0], 0);
        assert_eq!(codes.data[2], 0);
    }

    #[test]
    fn test_percentile_clips() {
        let w = Tensor::new(&[[10.0f32], [1.0]], &Device::Cpu).unwrap();
        let (codes, _) =
            reduce_einsum_weight_precision("xy,yz->xz", &w, DType::F32, 4, 0.5).unwrap();
        // 4 bits: codes in [-7, 7]; the outlier saturates.
        assert_eq!(codes.data, vec![7, 1]);
    }

    #[test]
    fn test_batched_weight_reduces_contracted_axis_only() {
        let w = Tensor::randn(0f32, 1.0, (3, 4, 5), &Device::Cpu).unwrap();
        let (codes, scale) =
            reduce_einsum_weight_precision("bxy,byz->bxz", &w, DType::F32, 8, 1.0).unwrap();
        assert_eq!(scale.dims(), &[3, 5]);
        assert_eq!(codes.numel(), 60);
        assert_eq!(codes.size_bytes(), 60);
    }

    #[test]
    fn test_bits_range() {
        let w = Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(reduce_einsum_weight_precision("xy,yz->xz", &w, DType::F32, 9, 1.0).is_err());
        assert!(reduce_einsum_weight_precision("xy,yz->xz", &w, DType::F32, 1, 1.0).is_err());
    }

    #[test]
    fn test_quantized_einsum_matches_float() {
        let x = Tensor::randn(0f32, 1.0, (2, 3, 16), &Device::Cpu).unwrap();
        let w = Tensor::randn(0f32, 0.2, (16, 8), &Device::Cpu).unwrap();
        let (codes, scale) =
            reduce_einsum_weight_precision("xy,yz->xz", &w, DType::F32, 8, 1.0).unwrap();
        let codes = codes.to_tensor(DType::F32, &Device::Cpu).unwrap();

        let expected = einsum("...D,DH->...H", &x, &w).unwrap();
        let actual = quantized_einsum("...D,DH->...H", &x, &codes, &scale).unwrap();
        assert_eq!(actual.dims(), &[2, 3, 8]);

        let diff = (expected - actual)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 0.08, "max abs diff {diff}");
    }
}
