// This module is the concrete tensor backend for tracecell. TensorValue wraps
// dynamic-rank ndarray storage for the three supported element types (f64, i64,
// bool) and exposes the narrow contract the trace machinery needs: construction
// from scalars, vectors, ranges, and coordinate grids, shape/dtype inspection,
// scalar truthiness, and
// leading-axis slicing/stacking for bounded loops. Element-wise arithmetic,
// comparisons, and broadcast-aware select live in the ops submodule. DType is
// the element-type tag used in signatures, abstract trace values, and error
// messages. Values serialize via serde so persistence can snapshot named state.

//! Concrete tensor values.
//!
//! A [`TensorValue`] is a dynamic-rank array of one of three element types.
//! Shapes and dtypes are first-class here because the compilation cache keys
//! on them and StateCell writes are checked against them.

pub mod ops;

use ndarray::{ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::error::{TraceError, TraceResult};

/// Element type of a [`TensorValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F64,
    I64,
    Bool,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F64 => write!(f, "f64"),
            DType::I64 => write!(f, "i64"),
            DType::Bool => write!(f, "bool"),
        }
    }
}

/// A concrete, dynamic-rank tensor.
///
/// Scalars are rank-0 arrays. Two values compare equal when their dtype,
/// shape, and every element match, which is what the persistence round-trip
/// guarantees rely on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorValue {
    F64(ArrayD<f64>),
    I64(ArrayD<i64>),
    Bool(ArrayD<bool>),
}

impl TensorValue {
    /// Rank-0 f64 value.
    pub fn scalar_f64(v: f64) -> Self {
        TensorValue::F64(ArrayD::from_elem(IxDyn(&[]), v))
    }

    /// Rank-0 i64 value.
    pub fn scalar_i64(v: i64) -> Self {
        TensorValue::I64(ArrayD::from_elem(IxDyn(&[]), v))
    }

    /// Rank-0 bool value.
    pub fn scalar_bool(v: bool) -> Self {
        TensorValue::Bool(ArrayD::from_elem(IxDyn(&[]), v))
    }

    /// Rank-1 f64 value from a slice.
    pub fn vector_f64(v: &[f64]) -> Self {
        TensorValue::F64(ndarray::Array1::from(v.to_vec()).into_dyn())
    }

    /// Rank-1 i64 value from a slice.
    pub fn vector_i64(v: &[i64]) -> Self {
        TensorValue::I64(ndarray::Array1::from(v.to_vec()).into_dyn())
    }

    /// Rank-1 bool value from a slice.
    pub fn vector_bool(v: &[bool]) -> Self {
        TensorValue::Bool(ndarray::Array1::from(v.to_vec()).into_dyn())
    }

    /// f64 value with an explicit shape; fails with [`TraceError::InvalidValue`]
    /// when the element count does not match the shape.
    pub fn from_shape_f64(shape: &[usize], data: Vec<f64>) -> TraceResult<Self> {
        ArrayD::from_shape_vec(IxDyn(shape), data)
            .map(TensorValue::F64)
            .map_err(|e| TraceError::InvalidValue {
                reason: format!("shape/data mismatch building f64 tensor: {e}"),
            })
    }

    /// Half-open range `[start, stop)` with a signed step.
    pub fn arange_f64(start: f64, stop: f64, step: f64) -> TraceResult<Self> {
        if step == 0.0 || !step.is_finite() {
            return Err(TraceError::InvalidValue {
                reason: format!("arange step must be finite and non-zero, got {step}"),
            });
        }
        let mut data = Vec::new();
        let mut v = start;
        while (step > 0.0 && v < stop) || (step < 0.0 && v > stop) {
            data.push(v);
            // Recompute from the index so error does not accumulate.
            v = start + (data.len() as f64) * step;
        }
        Ok(TensorValue::vector_f64(&data))
    }

    /// Half-open integer range `[start, stop)` with a signed step.
    pub fn arange_i64(start: i64, stop: i64, step: i64) -> TraceResult<Self> {
        if step == 0 {
            return Err(TraceError::InvalidValue {
                reason: "arange step must be non-zero".into(),
            });
        }
        let mut data = Vec::new();
        let mut v = start;
        while (step > 0 && v < stop) || (step < 0 && v > stop) {
            data.push(v);
            v += step;
        }
        Ok(TensorValue::vector_i64(&data))
    }

    /// `n` evenly spaced values over `[start, stop]`, endpoints included.
    pub fn linspace_f64(start: f64, stop: f64, n: usize) -> TraceResult<Self> {
        if n == 0 {
            return Err(TraceError::InvalidValue {
                reason: "linspace needs at least one sample".into(),
            });
        }
        if n == 1 {
            return Ok(TensorValue::vector_f64(&[start]));
        }
        let step = (stop - start) / (n - 1) as f64;
        let data: Vec<f64> = (0..n)
            .map(|i| if i == n - 1 { stop } else { start + i as f64 * step })
            .collect();
        Ok(TensorValue::vector_f64(&data))
    }

    /// Coordinate grids over two axes: `xx[i][j] = xs[i]`, `yy[i][j] = ys[j]`.
    pub fn meshgrid_f64(xs: &[f64], ys: &[f64]) -> (Self, Self) {
        let shape = IxDyn(&[xs.len(), ys.len()]);
        let xx = ArrayD::from_shape_fn(shape.clone(), |ix| xs[ix[0]]);
        let yy = ArrayD::from_shape_fn(shape, |ix| ys[ix[1]]);
        (TensorValue::F64(xx), TensorValue::F64(yy))
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorValue::F64(_) => DType::F64,
            TensorValue::I64(_) => DType::I64,
            TensorValue::Bool(_) => DType::Bool,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            TensorValue::F64(a) => a.shape(),
            TensorValue::I64(a) => a.shape(),
            TensorValue::Bool(a) => a.shape(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn is_scalar(&self) -> bool {
        self.ndim() == 0
    }

    /// Concrete truthiness. Only a rank-0 bool has one.
    pub fn as_bool(&self) -> TraceResult<bool> {
        match self {
            TensorValue::Bool(a) if a.ndim() == 0 => Ok(a.iter().next().copied().unwrap_or(false)),
            other => Err(TraceError::InvalidValue {
                reason: format!(
                    "expected a scalar bool, found {} tensor of shape {:?}",
                    other.dtype(),
                    other.shape()
                ),
            }),
        }
    }

    /// Scalar f64 extraction, for tests and diagnostics.
    pub fn as_f64(&self) -> TraceResult<f64> {
        match self {
            TensorValue::F64(a) if a.ndim() == 0 => Ok(a.iter().next().copied().unwrap_or(0.0)),
            other => Err(TraceError::InvalidValue {
                reason: format!(
                    "expected a scalar f64, found {} tensor of shape {:?}",
                    other.dtype(),
                    other.shape()
                ),
            }),
        }
    }

    /// Scalar i64 extraction.
    pub fn as_i64(&self) -> TraceResult<i64> {
        match self {
            TensorValue::I64(a) if a.ndim() == 0 => Ok(a.iter().next().copied().unwrap_or(0)),
            other => Err(TraceError::InvalidValue {
                reason: format!(
                    "expected a scalar i64, found {} tensor of shape {:?}",
                    other.dtype(),
                    other.shape()
                ),
            }),
        }
    }

    /// The `i`-th slice along the leading axis, as an owned value.
    ///
    /// Bounded loops feed their body one of these per iteration.
    pub fn slice_leading(&self, i: usize) -> TraceResult<TensorValue> {
        if self.ndim() == 0 {
            return Err(TraceError::InvalidValue {
                reason: "cannot slice a rank-0 tensor along its leading axis".into(),
            });
        }
        let n = self.shape()[0];
        if i >= n {
            return Err(TraceError::InvalidValue {
                reason: format!("leading-axis index {i} out of range for length {n}"),
            });
        }
        Ok(match self {
            TensorValue::F64(a) => TensorValue::F64(a.index_axis(Axis(0), i).to_owned()),
            TensorValue::I64(a) => TensorValue::I64(a.index_axis(Axis(0), i).to_owned()),
            TensorValue::Bool(a) => TensorValue::Bool(a.index_axis(Axis(0), i).to_owned()),
        })
    }

    /// Stack values of identical shape and dtype along a new leading axis.
    ///
    /// This is how bounded loops collect their per-iteration history.
    pub fn stack_leading(values: &[TensorValue]) -> TraceResult<TensorValue> {
        let first = values.first().ok_or_else(|| TraceError::InvalidValue {
            reason: "cannot stack zero values".into(),
        })?;
        for v in &values[1..] {
            if v.dtype() != first.dtype() {
                return Err(TraceError::TypeMismatch {
                    context: "stack".into(),
                    expected: first.dtype(),
                    found: v.dtype(),
                });
            }
            if v.shape() != first.shape() {
                return Err(TraceError::ShapeMismatch {
                    context: "stack".into(),
                    expected: first.shape().to_vec(),
                    found: v.shape().to_vec(),
                });
            }
        }
        // ndarray::stack wants homogeneous views.
        Ok(match first {
            TensorValue::F64(_) => {
                let views: Vec<_> = values
                    .iter()
                    .map(|v| match v {
                        TensorValue::F64(a) => a.view(),
                        _ => unreachable!(),
                    })
                    .collect();
                TensorValue::F64(ndarray::stack(Axis(0), &views).map_err(|e| {
                    TraceError::InvalidValue {
                        reason: format!("stack failed: {e}"),
                    }
                })?)
            }
            TensorValue::I64(_) => {
                let views: Vec<_> = values
                    .iter()
                    .map(|v| match v {
                        TensorValue::I64(a) => a.view(),
                        _ => unreachable!(),
                    })
                    .collect();
                TensorValue::I64(ndarray::stack(Axis(0), &views).map_err(|e| {
                    TraceError::InvalidValue {
                        reason: format!("stack failed: {e}"),
                    }
                })?)
            }
            TensorValue::Bool(_) => {
                let views: Vec<_> = values
                    .iter()
                    .map(|v| match v {
                        TensorValue::Bool(a) => a.view(),
                        _ => unreachable!(),
                    })
                    .collect();
                TensorValue::Bool(ndarray::stack(Axis(0), &views).map_err(|e| {
                    TraceError::InvalidValue {
                        reason: format!("stack failed: {e}"),
                    }
                })?)
            }
        })
    }
}
