// This module implements the element-wise operation set the trace machinery
// lowers to: arithmetic and min/max binaries, comparisons producing bool
// tensors, and broadcast-aware select. Broadcasting follows trailing-axis
// alignment (dimensions agree when equal or one of them is 1). Each operation
// exists in two forms: a shape/dtype check used at trace time against abstract
// values, and the concrete evaluation used eagerly and by the executor. Both
// forms report the same errors, so a program that traced cleanly cannot fail a
// shape or dtype check during replay. Integer division by zero is surfaced as
// InvalidValue instead of panicking.

//! Element-wise tensor operations with broadcasting.

use ndarray::{ArrayD, ArrayViewD, IxDyn, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{DType, TensorValue};
use crate::core::error::{TraceError, TraceResult};

/// Element-wise binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Min => "min",
            BinOp::Max => "max",
        };
        write!(f, "{name}")
    }
}

/// Element-wise comparison operators; results are bool tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
        };
        write!(f, "{name}")
    }
}

/// Broadcast two shapes by trailing-axis alignment.
pub fn broadcast_shape(context: &str, a: &[usize], b: &[usize]) -> TraceResult<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0usize; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = if da == db || db == 1 {
            da
        } else if da == 1 {
            db
        } else {
            return Err(TraceError::ShapeMismatch {
                context: context.to_string(),
                expected: a.to_vec(),
                found: b.to_vec(),
            });
        };
    }
    Ok(out)
}

/// Trace-time check for a binary arithmetic op over abstract operands.
pub fn check_binary(
    op: BinOp,
    lhs: (&[usize], DType),
    rhs: (&[usize], DType),
) -> TraceResult<(Vec<usize>, DType)> {
    let context = op.to_string();
    if lhs.1 == DType::Bool || rhs.1 == DType::Bool {
        return Err(TraceError::InvalidValue {
            reason: format!("{context}: arithmetic on bool tensors is not defined"),
        });
    }
    if lhs.1 != rhs.1 {
        return Err(TraceError::TypeMismatch {
            context,
            expected: lhs.1,
            found: rhs.1,
        });
    }
    let shape = broadcast_shape(&context, lhs.0, rhs.0)?;
    Ok((shape, lhs.1))
}

/// Trace-time check for a comparison.
pub fn check_compare(
    op: CmpOp,
    lhs: (&[usize], DType),
    rhs: (&[usize], DType),
) -> TraceResult<(Vec<usize>, DType)> {
    let context = op.to_string();
    if lhs.1 != rhs.1 {
        return Err(TraceError::TypeMismatch {
            context,
            expected: lhs.1,
            found: rhs.1,
        });
    }
    if lhs.1 == DType::Bool && !matches!(op, CmpOp::Eq | CmpOp::Ne) {
        return Err(TraceError::InvalidValue {
            reason: format!("{context}: ordering comparison on bool tensors is not defined"),
        });
    }
    let shape = broadcast_shape(&context, lhs.0, rhs.0)?;
    Ok((shape, DType::Bool))
}

/// Trace-time check for select.
pub fn check_select(
    cond: (&[usize], DType),
    on_true: (&[usize], DType),
    on_false: (&[usize], DType),
) -> TraceResult<(Vec<usize>, DType)> {
    if cond.1 != DType::Bool {
        return Err(TraceError::TypeMismatch {
            context: "select condition".into(),
            expected: DType::Bool,
            found: cond.1,
        });
    }
    if on_true.1 != on_false.1 {
        return Err(TraceError::TypeMismatch {
            context: "select".into(),
            expected: on_true.1,
            found: on_false.1,
        });
    }
    let branches = broadcast_shape("select", on_true.0, on_false.0)?;
    let shape = broadcast_shape("select", cond.0, &branches)?;
    Ok((shape, on_true.1))
}

fn view_as<'a, A>(
    context: &str,
    a: &'a ArrayD<A>,
    shape: &[usize],
) -> TraceResult<ArrayViewD<'a, A>> {
    a.broadcast(IxDyn(shape))
        .ok_or_else(|| TraceError::ShapeMismatch {
            context: context.to_string(),
            expected: shape.to_vec(),
            found: a.shape().to_vec(),
        })
}

fn zip_f64(
    context: &str,
    shape: &[usize],
    a: &ArrayD<f64>,
    b: &ArrayD<f64>,
    f: impl Fn(f64, f64) -> f64,
) -> TraceResult<ArrayD<f64>> {
    let la = view_as(context, a, shape)?;
    let lb = view_as(context, b, shape)?;
    Ok(Zip::from(&la).and(&lb).map_collect(|&x, &y| f(x, y)))
}

fn zip_i64(
    context: &str,
    shape: &[usize],
    a: &ArrayD<i64>,
    b: &ArrayD<i64>,
    f: impl Fn(i64, i64) -> i64,
) -> TraceResult<ArrayD<i64>> {
    let la = view_as(context, a, shape)?;
    let lb = view_as(context, b, shape)?;
    Ok(Zip::from(&la).and(&lb).map_collect(|&x, &y| f(x, y)))
}

/// Evaluate a binary arithmetic op over concrete values.
pub fn binary(op: BinOp, lhs: &TensorValue, rhs: &TensorValue) -> TraceResult<TensorValue> {
    let (shape, _) = check_binary(op, (lhs.shape(), lhs.dtype()), (rhs.shape(), rhs.dtype()))?;
    let context = op.to_string();
    match (lhs, rhs) {
        (TensorValue::F64(a), TensorValue::F64(b)) => {
            let f: fn(f64, f64) -> f64 = match op {
                BinOp::Add => |x, y| x + y,
                BinOp::Sub => |x, y| x - y,
                BinOp::Mul => |x, y| x * y,
                BinOp::Div => |x, y| x / y,
                BinOp::Min => f64::min,
                BinOp::Max => f64::max,
            };
            Ok(TensorValue::F64(zip_f64(&context, &shape, a, b, f)?))
        }
        (TensorValue::I64(a), TensorValue::I64(b)) => {
            if op == BinOp::Div {
                let rb = view_as(&context, b, &shape)?;
                if rb.iter().any(|&y| y == 0) {
                    return Err(TraceError::InvalidValue {
                        reason: "div: integer division by zero".into(),
                    });
                }
            }
            let f: fn(i64, i64) -> i64 = match op {
                BinOp::Add => i64::wrapping_add,
                BinOp::Sub => i64::wrapping_sub,
                BinOp::Mul => i64::wrapping_mul,
                BinOp::Div => |x, y| x / y,
                BinOp::Min => i64::min,
                BinOp::Max => i64::max,
            };
            Ok(TensorValue::I64(zip_i64(&context, &shape, a, b, f)?))
        }
        // check_binary already rejected bool and mixed dtypes
        _ => Err(TraceError::TypeMismatch {
            context,
            expected: lhs.dtype(),
            found: rhs.dtype(),
        }),
    }
}

/// Evaluate a comparison over concrete values.
pub fn compare(op: CmpOp, lhs: &TensorValue, rhs: &TensorValue) -> TraceResult<TensorValue> {
    let (shape, _) = check_compare(op, (lhs.shape(), lhs.dtype()), (rhs.shape(), rhs.dtype()))?;
    let context = op.to_string();
    let out = match (lhs, rhs) {
        (TensorValue::F64(a), TensorValue::F64(b)) => {
            let la = view_as(&context, a, &shape)?;
            let lb = view_as(&context, b, &shape)?;
            let f: fn(f64, f64) -> bool = match op {
                CmpOp::Lt => |x, y| x < y,
                CmpOp::Le => |x, y| x <= y,
                CmpOp::Gt => |x, y| x > y,
                CmpOp::Ge => |x, y| x >= y,
                CmpOp::Eq => |x, y| x == y,
                CmpOp::Ne => |x, y| x != y,
            };
            Zip::from(&la).and(&lb).map_collect(|&x, &y| f(x, y))
        }
        (TensorValue::I64(a), TensorValue::I64(b)) => {
            let la = view_as(&context, a, &shape)?;
            let lb = view_as(&context, b, &shape)?;
            let f: fn(i64, i64) -> bool = match op {
                CmpOp::Lt => |x, y| x < y,
                CmpOp::Le => |x, y| x <= y,
                CmpOp::Gt => |x, y| x > y,
                CmpOp::Ge => |x, y| x >= y,
                CmpOp::Eq => |x, y| x == y,
                CmpOp::Ne => |x, y| x != y,
            };
            Zip::from(&la).and(&lb).map_collect(|&x, &y| f(x, y))
        }
        (TensorValue::Bool(a), TensorValue::Bool(b)) => {
            let la = view_as(&context, a, &shape)?;
            let lb = view_as(&context, b, &shape)?;
            let f: fn(bool, bool) -> bool = match op {
                CmpOp::Eq => |x, y| x == y,
                CmpOp::Ne => |x, y| x != y,
                // rejected by check_compare
                _ => |_, _| false,
            };
            Zip::from(&la).and(&lb).map_collect(|&x, &y| f(x, y))
        }
        _ => {
            return Err(TraceError::TypeMismatch {
                context,
                expected: lhs.dtype(),
                found: rhs.dtype(),
            })
        }
    };
    Ok(TensorValue::Bool(out))
}

/// Element-wise choice: where `cond` is true take `on_true`, else `on_false`.
///
/// All three operands broadcast to a common shape, so this works uniformly
/// for scalars, vectors, and arbitrary-rank arrays.
pub fn select(
    cond: &TensorValue,
    on_true: &TensorValue,
    on_false: &TensorValue,
) -> TraceResult<TensorValue> {
    let (shape, _) = check_select(
        (cond.shape(), cond.dtype()),
        (on_true.shape(), on_true.dtype()),
        (on_false.shape(), on_false.dtype()),
    )?;
    let TensorValue::Bool(c) = cond else {
        return Err(TraceError::TypeMismatch {
            context: "select condition".into(),
            expected: DType::Bool,
            found: cond.dtype(),
        });
    };
    let lc = view_as("select", c, &shape)?;
    match (on_true, on_false) {
        (TensorValue::F64(t), TensorValue::F64(f)) => {
            let lt = view_as("select", t, &shape)?;
            let lf = view_as("select", f, &shape)?;
            Ok(TensorValue::F64(
                Zip::from(&lc)
                    .and(&lt)
                    .and(&lf)
                    .map_collect(|&c, &t, &f| if c { t } else { f }),
            ))
        }
        (TensorValue::I64(t), TensorValue::I64(f)) => {
            let lt = view_as("select", t, &shape)?;
            let lf = view_as("select", f, &shape)?;
            Ok(TensorValue::I64(
                Zip::from(&lc)
                    .and(&lt)
                    .and(&lf)
                    .map_collect(|&c, &t, &f| if c { t } else { f }),
            ))
        }
        (TensorValue::Bool(t), TensorValue::Bool(f)) => {
            let lt = view_as("select", t, &shape)?;
            let lf = view_as("select", f, &shape)?;
            Ok(TensorValue::Bool(
                Zip::from(&lc)
                    .and(&lt)
                    .and(&lf)
                    .map_collect(|&c, &t, &f| if c { t } else { f }),
            ))
        }
        _ => Err(TraceError::TypeMismatch {
            context: "select".into(),
            expected: on_true.dtype(),
            found: on_false.dtype(),
        }),
    }
}
