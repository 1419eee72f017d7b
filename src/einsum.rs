//! Two-operand einsum on candle tensors.
//!
//! Supports explicit equations of the form `lhs,rhs->out` where each term is
//! a sequence of ASCII letters with at most one `...`. Labels are classified as
//! batch (in both inputs and the output), contracted (in both inputs only),
//! or free (one input and the output). Labels that appear in a single input
//! but not in the output are summed away first.
//!
//! The contraction lowers to permute, reshape and a batched `matmul`, so it
//! is differentiable through candle's autodiff.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{QuantError, Result};

/// Ellipsis dims get synthetic label ids above the ASCII range.
const ELLIPSIS_BASE: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Term {
    head: Vec<char>,
    ellipsis: bool,
    tail: Vec<char>,
}

impl Term {
    fn parse(text: &str) -> Result<Self> {
        let (head, tail, ellipsis) = match text.find("...") {
            Some(pos) => (&text[..pos], &text[pos + 3..], true),
            None => (text, "", false),
        };
        let head: Vec<char> = head.chars().collect();
        let tail: Vec<char> = tail.chars().collect();

        if let Some(bad) = head
            .iter()
            .chain(tail.iter())
            .find(|c| !c.is_ascii_alphabetic())
        {
            return Err(QuantError::InvalidEquation(format!(
                "unexpected character '{bad}' in term '{text}'"
            )));
        }
        let mut seen = head.clone();
        seen.extend(&tail);
        seen.sort_unstable();
        if seen.windows(2).any(|w| w[0] == w[1]) {
            return Err(QuantError::InvalidEquation(format!(
                "repeated label in term '{text}'"
            )));
        }
        Ok(Self {
            head,
            ellipsis,
            tail,
        })
    }

    fn explicit_len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    fn contains(&self, label: char) -> bool {
        self.head.contains(&label) || self.tail.contains(&label)
    }

    fn ellipsis_width(&self, rank: usize) -> Result<usize> {
        let explicit = self.explicit_len();
        let width = if self.ellipsis {
            rank.checked_sub(explicit)
        } else if rank == explicit {
            Some(0)
        } else {
            None
        };
        width.ok_or_else(|| {
            QuantError::InvalidEquation(format!(
                "operand of rank {rank} does not fit term '{self}'"
            ))
        })
    }

    /// Label ids for an operand whose ellipsis spans `width` of `total` dims.
    fn ids(&self, width: usize, total: usize) -> Vec<usize> {
        let offset = ELLIPSIS_BASE + total - width;
        self.head
            .iter()
            .map(|&c| c as usize)
            .chain((0..width).map(|k| offset + k))
            .chain(self.tail.iter().map(|&c| c as usize))
            .collect()
    }
}

fn label_name(id: usize) -> String {
    match u8::try_from(id) {
        Ok(byte) if id < ELLIPSIS_BASE => char::from(byte).to_string(),
        _ => format!("...[{}]", id - ELLIPSIS_BASE),
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head: String = self.head.iter().collect();
        let tail: String = self.tail.iter().collect();
        if self.ellipsis {
            write!(f, "{head}...{tail}")
        } else {
            write!(f, "{head}{tail}")
        }
    }
}

/// A parsed two-operand einsum equation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Equation {
    lhs: Term,
    rhs: Term,
    out: Term,
}

impl Equation {
    /// Parse `lhs,rhs->out`. Whitespace is ignored.
    ///
    /// # Errors
    /// Returns `InvalidEquation` for implicit-mode equations, operand counts
    /// other than two, non-letter labels, repeated labels in a term, or output
    /// labels missing from both inputs.
    pub fn parse(eqn: &str) -> Result<Self> {
        let compact: String = eqn.chars().filter(|c| !c.is_whitespace()).collect();
        let (inputs, out) = compact.split_once("->").ok_or_else(|| {
            QuantError::InvalidEquation(format!("'{eqn}' has no '->' output term"))
        })?;
        let operands: Vec<&str> = inputs.split(',').collect();
        let [lhs, rhs] = operands.as_slice() else {
            return Err(QuantError::InvalidEquation(format!(
                "'{eqn}' must have exactly two operands, found {}",
                operands.len()
            )));
        };

        let equation = Self {
            lhs: Term::parse(lhs)?,
            rhs: Term::parse(rhs)?,
            out: Term::parse(out)?,
        };

        for &label in equation.out.head.iter().chain(&equation.out.tail) {
            if !equation.lhs.contains(label) && !equation.rhs.contains(label) {
                return Err(QuantError::InvalidEquation(format!(
                    "output label '{label}' does not appear in any input of '{eqn}'"
                )));
            }
        }
        if equation.out.ellipsis && !equation.lhs.ellipsis && !equation.rhs.ellipsis {
            return Err(QuantError::InvalidEquation(format!(
                "output of '{eqn}' has '...' but no input does"
            )));
        }
        Ok(equation)
    }

    /// Axes of a `rhs_rank` operand that do not survive into the output.
    ///
    /// # Errors
    /// Returns `InvalidEquation` if the rank does not fit the rhs term.
    pub fn rhs_reduced_axes(&self, rhs_rank: usize) -> Result<Vec<usize>> {
        let width = self.rhs.ellipsis_width(rhs_rank)?;
        let out_width = if self.out.ellipsis { width } else { 0 };
        let rhs_ids = self.rhs.ids(width, width);
        let out_ids = self.out.ids(out_width, width);
        Ok(rhs_ids
            .iter()
            .enumerate()
            .filter(|(_, id)| !out_ids.contains(id))
            .map(|(axis, _)| axis)
            .collect())
    }

    /// Contract `lhs` with `rhs`.
    ///
    /// # Errors
    /// Returns `InvalidEquation` if an operand rank does not fit its term,
    /// `ShapeMismatch` if a shared label has different sizes, or a candle error.
    pub fn apply(&self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
        let lhs_width = self.lhs.ellipsis_width(lhs.rank())?;
        let rhs_width = self.rhs.ellipsis_width(rhs.rank())?;
        let width = lhs_width.max(rhs_width);
        let out_width = if self.out.ellipsis { width } else { 0 };

        let mut lhs_ids = self.lhs.ids(lhs_width, width);
        let mut rhs_ids = self.rhs.ids(rhs_width, width);
        let out_ids = self.out.ids(out_width, width);

        let mut sizes: HashMap<usize, usize> = HashMap::new();
        for (ids, tensor) in [(&lhs_ids, lhs), (&rhs_ids, rhs)] {
            for (id, &dim) in ids.iter().zip(tensor.dims()) {
                let size = *sizes.entry(*id).or_insert(dim);
                if size != dim {
                    tracing::debug!(
                        label = %label_name(*id),
                        lhs = ?lhs.dims(),
                        rhs = ?rhs.dims(),
                        "einsum label size conflict"
                    );
                    return Err(QuantError::ShapeMismatch {
                        expected: vec![size],
                        actual: vec![dim],
                    });
                }
            }
        }

        let lhs = sum_unused(lhs, &mut lhs_ids, &rhs_ids, &out_ids)?;
        let rhs = sum_unused(rhs, &mut rhs_ids, &lhs_ids, &out_ids)?;

        let batch: Vec<usize> = lhs_ids
            .iter()
            .copied()
            .filter(|id| rhs_ids.contains(id) && out_ids.contains(id))
            .collect();
        let contracted: Vec<usize> = lhs_ids
            .iter()
            .copied()
            .filter(|id| rhs_ids.contains(id) && !out_ids.contains(id))
            .collect();
        let lhs_free: Vec<usize> = lhs_ids
            .iter()
            .copied()
            .filter(|id| !rhs_ids.contains(id))
            .collect();
        let rhs_free: Vec<usize> = rhs_ids
            .iter()
            .copied()
            .filter(|id| !lhs_ids.contains(id))
            .collect();

        let numel = |ids: &[usize]| ids.iter().map(|id| sizes[id]).product::<usize>();
        let (b, m, k, n) = (
            numel(&batch),
            numel(&lhs_free),
            numel(&contracted),
            numel(&rhs_free),
        );

        let lhs_order = [batch.as_slice(), lhs_free.as_slice(), contracted.as_slice()].concat();
        let lhs3 = lhs
            .permute(positions(&lhs_ids, &lhs_order))?
            .contiguous()?
            .reshape((b, m, k))?;
        let rhs_order = [batch.as_slice(), contracted.as_slice(), rhs_free.as_slice()].concat();
        let rhs3 = rhs
            .permute(positions(&rhs_ids, &rhs_order))?
            .contiguous()?
            .reshape((b, k, n))?;

        let current_ids = [batch.as_slice(), lhs_free.as_slice(), rhs_free.as_slice()].concat();
        let current_dims: Vec<usize> = current_ids.iter().map(|id| sizes[id]).collect();
        let product = lhs3.matmul(&rhs3)?.reshape(current_dims)?;

        let perm = positions(&current_ids, &out_ids);
        if perm.iter().enumerate().all(|(i, &p)| i == p) {
            Ok(product)
        } else {
            Ok(product.permute(perm)?.contiguous()?)
        }
    }
}

impl FromStr for Equation {
    type Err = QuantError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Equation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}->{}", self.lhs, self.rhs, self.out)
    }
}

/// Sum out dims whose label is in neither `other` nor `out`.
fn sum_unused(
    tensor: &Tensor,
    ids: &mut Vec<usize>,
    other: &[usize],
    out: &[usize],
) -> Result<Tensor> {
    let mut tensor = tensor.clone();
    for pos in (0..ids.len()).rev() {
        if !other.contains(&ids[pos]) && !out.contains(&ids[pos]) {
            tensor = tensor.sum(pos)?;
            ids.remove(pos);
        }
    }
    Ok(tensor)
}

fn positions(ids: &[usize], order: &[usize]) -> Vec<usize> {
    order
        .iter()
        .map(|id| ids.iter().position(|x| x == id).unwrap_or_default())
        .collect()
}

/// Parse `eqn` and contract `lhs` with `rhs`.
///
/// # Errors
/// See [`Equation::parse`] and [`Equation::apply`].
pub fn einsum(eqn: &str, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    Equation::parse(eqn)?.apply(lhs, rhs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_matches_matmul() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (4, 8), &device).unwrap();
        let w = Tensor::randn(0f32, 1f32, (8, 3), &device).unwrap();

        let ours = einsum("xy,yz->xz", &x, &w).unwrap();
        let reference = x.matmul(&w).unwrap();
        assert!(max_abs_diff(&ours, &reference) < 1e-5);
    }

    #[test]
    fn test_ellipsis_projection() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (2, 5, 8), &device).unwrap();
        let w = Tensor::randn(0f32, 1f32, (8, 6), &device).unwrap();

        let ours = einsum("...D,DH->...H", &x, &w).unwrap();
        assert_eq!(ours.dims(), &[2, 5, 6]);

        let reference = x.broadcast_matmul(&w).unwrap();
        assert!(max_abs_diff(&ours, &reference) < 1e-5);
    }

    #[test]
    fn test_ellipsis_of_width_zero() {
        let device = Device::Cpu;
        let x = Tensor::ones(8, DType::F32, &device).unwrap();
        let w = Tensor::ones((8, 2), DType::F32, &device).unwrap();

        let out = einsum("...D,DH->...H", &x, &w).unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![8.0, 8.0]);
    }

    #[test]
    fn test_batched_and_transposed_output() {
        let device = Device::Cpu;
        let a = Tensor::randn(0f32, 1f32, (3, 4, 5), &device).unwrap();
        let b = Tensor::randn(0f32, 1f32, (3, 5, 2), &device).unwrap();

        let out = einsum("bij,bjk->bki", &a, &b).unwrap();
        assert_eq!(out.dims(), &[3, 2, 4]);

        let reference = a.matmul(&b).unwrap().transpose(1, 2).unwrap();
        assert!(max_abs_diff(&out, &reference) < 1e-5);
    }

    #[test]
    fn test_unused_label_is_summed() {
        let device = Device::Cpu;
        let a = Tensor::new(&[[1f32, 2.], [3., 4.]], &device).unwrap();
        let v = Tensor::new(&[10f32, 100.], &device).unwrap();

        // i is summed away before contracting j.
        let out = einsum("ij,j->", &a, &v).unwrap();
        assert_eq!(out.dims(), &[] as &[usize]);
        assert!((out.to_scalar::<f32>().unwrap() - 640.0).abs() < 1e-4);
    }

    #[test]
    fn test_dimension_mismatch() {
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 8), DType::F32, &device).unwrap();
        let w = Tensor::zeros((7, 3), DType::F32, &device).unwrap();
        let err = einsum("xy,yz->xz", &x, &w).unwrap_err();
        // The conflicting sizes of `y`, not the operand shapes.
        assert!(matches!(
            err,
            QuantError::ShapeMismatch { ref expected, ref actual }
                if expected == &[8] && actual == &[7]
        ));
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["xy,yz", "xy->x", "xy,yz,zw->xw", "x1,1z->xz", "xx,xz->z", "xy,yz->q", "xy,yz->..."] {
            let err = Equation::parse(bad).unwrap_err();
            assert!(
                matches!(err, QuantError::InvalidEquation(_)),
                "expected InvalidEquation for {bad}"
            );
        }
    }

    #[test]
    fn test_rank_must_fit_term() {
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 3, 8), DType::F32, &device).unwrap();
        let w = Tensor::zeros((8, 3), DType::F32, &device).unwrap();
        let err = einsum("xy,yz->xz", &x, &w).unwrap_err();
        assert!(matches!(err, QuantError::InvalidEquation(_)));
    }

    #[test]
    fn test_display_and_reduced_axes() {
        let eqn: Equation = "xy,yz->xz".parse().unwrap();
        assert_eq!(eqn.to_string(), "xy,yz->xz");
        assert_eq!(eqn.rhs_reduced_axes(2).unwrap(), vec![0]);

        let proj = Equation::parse("...D,DH->...H").unwrap();
        assert_eq!(proj.rhs_reduced_axes(2).unwrap(), vec![0]);
    }
}
