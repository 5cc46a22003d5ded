// This module implements the trace boundary itself. A TraceContext is the
// handle user bodies receive: in eager mode every value is concrete and ops
// compute immediately; in tracing mode abstract values (shape/dtype + node ref)
// flow through the same ops and record nodes into a Tracer's program instead.
// Ops whose operands are all concrete compute immediately even inside a trace,
// which is the specialization rule that permits native control flow over
// trace-time constants. The Tracer also intercepts StateCell access: traced
// reads observe an abstract placeholder and land in the read set, traced writes
// are layout-checked against the cell and deferred until the call commits.
// Sub-traces (branch and loop bodies) share the parent's cell table through an
// Rc'd registry, so one TraceRecord covers the whole entry point. Abstract
// values are tagged with the id of the trace that created them; using a value
// from another trace scope (a body closure capturing its parent's abstract
// value) is caught and reported rather than silently miscompiled.

//! Trace scope and traced values.
//!
//! [`TraceValue`] is either a concrete tensor or an abstract placeholder
//! observed inside a trace. [`TraceContext`] routes every operation either to
//! immediate evaluation or to program recording; reads of a [`StateCell`]
//! inside a trace observe only the cell's shape and dtype.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;

use super::graph::{NodeId, OpKind, Program, ValueRef, ValueSig};
use crate::core::cell::{CellId, StateCell};
use crate::core::error::{TraceError, TraceResult};
use crate::tensor::ops::{self, BinOp, CmpOp};
use crate::tensor::{DType, TensorValue};

static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(0);

/// An abstract value: shape and dtype only, plus the node that produces it.
#[derive(Debug, Clone)]
pub struct AbstractValue {
    pub(crate) vref: ValueRef,
    pub(crate) trace_id: u64,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

/// A value flowing through a [`TraceContext`].
#[derive(Debug, Clone)]
pub enum TraceValue {
    Concrete(TensorValue),
    Abstract(AbstractValue),
}

impl TraceValue {
    pub fn shape(&self) -> &[usize] {
        match self {
            TraceValue::Concrete(v) => v.shape(),
            TraceValue::Abstract(a) => &a.shape,
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            TraceValue::Concrete(v) => v.dtype(),
            TraceValue::Abstract(a) => a.dtype,
        }
    }

    pub fn sig(&self) -> ValueSig {
        ValueSig {
            shape: self.shape().to_vec(),
            dtype: self.dtype(),
        }
    }

    pub fn is_concrete(&self) -> bool {
        matches!(self, TraceValue::Concrete(_))
    }

    /// The concrete tensor, if this value is not abstract.
    pub fn concrete(&self) -> Option<&TensorValue> {
        match self {
            TraceValue::Concrete(v) => Some(v),
            TraceValue::Abstract(_) => None,
        }
    }

    /// Concrete truthiness. An abstract value has no single truth value, so
    /// native `if`/`while` over traced state fails here.
    pub fn as_bool(&self) -> TraceResult<bool> {
        match self {
            TraceValue::Concrete(v) => v.as_bool(),
            TraceValue::Abstract(a) => Err(TraceError::TraceBoolConversion {
                context: format!("{} tensor of shape {:?}", a.dtype, a.shape),
            }),
        }
    }
}

impl From<TensorValue> for TraceValue {
    fn from(v: TensorValue) -> Self {
        TraceValue::Concrete(v)
    }
}

/// Cells touched by a trace, shared between a root tracer and its sub-traces.
#[derive(Default)]
pub(crate) struct CellTable {
    pub cells: HashMap<CellId, Rc<StateCell>>,
    pub reads: Vec<CellId>,
    pub writes: Vec<CellId>,
}

impl CellTable {
    fn record_read(&mut self, cell: &Rc<StateCell>) {
        self.cells.entry(cell.id()).or_insert_with(|| cell.clone());
        if !self.reads.contains(&cell.id()) {
            self.reads.push(cell.id());
        }
    }

    fn record_write(&mut self, cell: &Rc<StateCell>) {
        self.cells.entry(cell.id()).or_insert_with(|| cell.clone());
        if !self.writes.contains(&cell.id()) {
            self.writes.push(cell.id());
        }
    }
}

/// Builder for one [`Program`]; owns the node list while a body is traced.
pub(crate) struct Tracer {
    pub(crate) id: u64,
    pub(crate) program: Program,
    pub(crate) table: Rc<RefCell<CellTable>>,
}

impl Tracer {
    /// Root tracer for a compiled entry point.
    pub(crate) fn root(input_sigs: Vec<ValueSig>) -> Self {
        Tracer::with_table(input_sigs, Rc::new(RefCell::new(CellTable::default())))
    }

    /// Sub-tracer for a control-op body; shares the parent's cell table.
    pub(crate) fn child(table: Rc<RefCell<CellTable>>, input_sigs: Vec<ValueSig>) -> Self {
        Tracer::with_table(input_sigs, table)
    }

    fn with_table(input_sigs: Vec<ValueSig>, table: Rc<RefCell<CellTable>>) -> Self {
        let mut program = Program::new(input_sigs.clone());
        for (i, sig) in input_sigs.iter().enumerate() {
            program.push(OpKind::Input(i), vec![sig.clone()]);
        }
        Tracer {
            id: NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed),
            program,
            table,
        }
    }

    /// Abstract placeholders for the program inputs, in order.
    pub(crate) fn input_values(&self) -> Vec<TraceValue> {
        self.program
            .input_sigs
            .iter()
            .enumerate()
            .map(|(i, sig)| {
                TraceValue::Abstract(AbstractValue {
                    vref: ValueRef { node: i, output: 0 },
                    trace_id: self.id,
                    shape: sig.shape.clone(),
                    dtype: sig.dtype,
                })
            })
            .collect()
    }

    pub(crate) fn push(&mut self, op: OpKind, outputs: Vec<ValueSig>) -> NodeId {
        self.program.push(op, outputs)
    }

    pub(crate) fn abstract_out(&self, node: NodeId, output: usize, sig: &ValueSig) -> TraceValue {
        TraceValue::Abstract(AbstractValue {
            vref: ValueRef { node, output },
            trace_id: self.id,
            shape: sig.shape.clone(),
            dtype: sig.dtype,
        })
    }

    /// Resolve the returned values into program outputs and close the trace.
    pub(crate) fn finish(mut self, outs: &[TraceValue]) -> TraceResult<(Program, Vec<ValueSig>)> {
        let mut refs = Vec::with_capacity(outs.len());
        for v in outs {
            let r = match v {
                TraceValue::Concrete(c) => {
                    let sig = ValueSig::of(c);
                    let node = self.program.push(OpKind::Constant(c.clone()), vec![sig]);
                    ValueRef { node, output: 0 }
                }
                TraceValue::Abstract(a) => {
                    if a.trace_id != self.id {
                        return Err(TraceError::InvalidValue {
                            reason: "trace output captured from another trace scope".into(),
                        });
                    }
                    a.vref
                }
            };
            refs.push(r);
        }
        self.program.outputs = refs;
        let sigs = self.program.output_sigs();
        Ok((self.program, sigs))
    }
}

/// Boundary handle passed to traced and eager bodies.
///
/// Created eager via [`TraceContext::eager`]; tracing contexts are created
/// internally by [`crate::jit::CompiledFunction`] and by the structured
/// control ops for their sub-traces.
pub struct TraceContext<'t> {
    pub(crate) tracer: Option<&'t mut Tracer>,
}

impl TraceContext<'static> {
    /// Uncompiled execution: all values concrete, native control flow allowed.
    pub fn eager() -> Self {
        TraceContext { tracer: None }
    }
}

impl<'t> TraceContext<'t> {
    pub(crate) fn tracing(tracer: &'t mut Tracer) -> Self {
        TraceContext {
            tracer: Some(tracer),
        }
    }

    pub fn is_tracing(&self) -> bool {
        self.tracer.is_some()
    }

    pub(crate) fn tracer_mut(&mut self, context: &str) -> TraceResult<&mut Tracer> {
        match self.tracer.as_deref_mut() {
            Some(t) => Ok(t),
            None => Err(TraceError::InvalidValue {
                reason: format!("abstract value used outside a trace scope ({context})"),
            }),
        }
    }

    /// Lower an operand to a value ref, interning concrete values as constants.
    pub(crate) fn operand(&mut self, v: &TraceValue, context: &str) -> TraceResult<ValueRef> {
        match v {
            TraceValue::Concrete(c) => {
                let sig = ValueSig::of(c);
                let t = self.tracer_mut(context)?;
                let node = t.push(OpKind::Constant(c.clone()), vec![sig]);
                Ok(ValueRef { node, output: 0 })
            }
            TraceValue::Abstract(a) => {
                let t = self.tracer_mut(context)?;
                if a.trace_id != t.id {
                    return Err(TraceError::InvalidValue {
                        reason: format!(
                            "value from an enclosing trace scope used in {context}; \
                             pass it through operands or a StateCell instead"
                        ),
                    });
                }
                Ok(a.vref)
            }
        }
    }

    /// Wrap a concrete tensor for use alongside traced values.
    pub fn constant(&self, v: TensorValue) -> TraceValue {
        TraceValue::Concrete(v)
    }

    /// Element-wise binary arithmetic; broadcasts operands.
    pub fn binary(&mut self, op: BinOp, a: &TraceValue, b: &TraceValue) -> TraceResult<TraceValue> {
        if let (Some(x), Some(y)) = (a.concrete(), b.concrete()) {
            return Ok(TraceValue::Concrete(ops::binary(op, x, y)?));
        }
        let (shape, dtype) = ops::check_binary(op, (a.shape(), a.dtype()), (b.shape(), b.dtype()))?;
        let context = op.to_string();
        let lhs = self.operand(a, &context)?;
        let rhs = self.operand(b, &context)?;
        let sig = ValueSig { shape, dtype };
        let t = self.tracer_mut(&context)?;
        let node = t.push(OpKind::Binary { op, lhs, rhs }, vec![sig.clone()]);
        Ok(t.abstract_out(node, 0, &sig))
    }

    pub fn add(&mut self, a: &TraceValue, b: &TraceValue) -> TraceResult<TraceValue> {
        self.binary(BinOp::Add, a, b)
    }

    pub fn sub(&mut self, a: &TraceValue, b: &TraceValue) -> TraceResult<TraceValue> {
        self.binary(BinOp::Sub, a, b)
    }

    pub fn mul(&mut self, a: &TraceValue, b: &TraceValue) -> TraceResult<TraceValue> {
        self.binary(BinOp::Mul, a, b)
    }

    pub fn div(&mut self, a: &TraceValue, b: &TraceValue) -> TraceResult<TraceValue> {
        self.binary(BinOp::Div, a, b)
    }

    pub fn min(&mut self, a: &TraceValue, b: &TraceValue) -> TraceResult<TraceValue> {
        self.binary(BinOp::Min, a, b)
    }

    pub fn max(&mut self, a: &TraceValue, b: &TraceValue) -> TraceResult<TraceValue> {
        self.binary(BinOp::Max, a, b)
    }

    /// Element-wise comparison; produces a bool tensor.
    pub fn compare(
        &mut self,
        op: CmpOp,
        a: &TraceValue,
        b: &TraceValue,
    ) -> TraceResult<TraceValue> {
        if let (Some(x), Some(y)) = (a.concrete(), b.concrete()) {
            return Ok(TraceValue::Concrete(ops::compare(op, x, y)?));
        }
        let (shape, dtype) = ops::check_compare(op, (a.shape(), a.dtype()), (b.shape(), b.dtype()))?;
        let context = op.to_string();
        let lhs = self.operand(a, &context)?;
        let rhs = self.operand(b, &context)?;
        let sig = ValueSig { shape, dtype };
        let t = self.tracer_mut(&context)?;
        let node = t.push(OpKind::Compare { op, lhs, rhs }, vec![sig.clone()]);
        Ok(t.abstract_out(node, 0, &sig))
    }

    pub fn lt(&mut self, a: &TraceValue, b: &TraceValue) -> TraceResult<TraceValue> {
        self.compare(CmpOp::Lt, a, b)
    }

    pub fn le(&mut self, a: &TraceValue, b: &TraceValue) -> TraceResult<TraceValue> {
        self.compare(CmpOp::Le, a, b)
    }

    pub fn gt(&mut self, a: &TraceValue, b: &TraceValue) -> TraceResult<TraceValue> {
        self.compare(CmpOp::Gt, a, b)
    }

    pub fn ge(&mut self, a: &TraceValue, b: &TraceValue) -> TraceResult<TraceValue> {
        self.compare(CmpOp::Ge, a, b)
    }

    pub fn eq(&mut self, a: &TraceValue, b: &TraceValue) -> TraceResult<TraceValue> {
        self.compare(CmpOp::Eq, a, b)
    }

    pub fn ne(&mut self, a: &TraceValue, b: &TraceValue) -> TraceResult<TraceValue> {
        self.compare(CmpOp::Ne, a, b)
    }

    /// Element `i` along the leading axis.
    pub fn slice_at(&mut self, v: &TraceValue, index: usize) -> TraceResult<TraceValue> {
        if let Some(c) = v.concrete() {
            return Ok(TraceValue::Concrete(c.slice_leading(index)?));
        }
        let shape = v.shape();
        if shape.is_empty() {
            return Err(TraceError::InvalidValue {
                reason: "cannot slice a rank-0 tensor along its leading axis".into(),
            });
        }
        if index >= shape[0] {
            return Err(TraceError::InvalidValue {
                reason: format!(
                    "leading-axis index {index} out of range for length {}",
                    shape[0]
                ),
            });
        }
        let sig = ValueSig {
            shape: shape[1..].to_vec(),
            dtype: v.dtype(),
        };
        let input = self.operand(v, "slice")?;
        let t = self.tracer_mut("slice")?;
        let node = t.push(OpKind::SliceAt { input, index }, vec![sig.clone()]);
        Ok(t.abstract_out(node, 0, &sig))
    }

    /// Read a cell. Outside a trace this is the concrete current value;
    /// inside, an abstract placeholder recorded in the trace's read set.
    pub fn cell_read(&mut self, cell: &Rc<StateCell>) -> TraceResult<TraceValue> {
        match self.tracer.as_deref_mut() {
            None => Ok(TraceValue::Concrete(cell.value())),
            Some(t) => {
                t.table.borrow_mut().record_read(cell);
                let sig = ValueSig {
                    shape: cell.shape().to_vec(),
                    dtype: cell.dtype(),
                };
                let node = t.push(OpKind::CellRead(cell.id()), vec![sig.clone()]);
                Ok(t.abstract_out(node, 0, &sig))
            }
        }
    }

    /// Write a cell. The value's shape and dtype are checked against the
    /// cell's fixed layout in both modes; outside a trace the write commits
    /// immediately, inside it is deferred until the call succeeds.
    pub fn cell_write(&mut self, cell: &Rc<StateCell>, v: &TraceValue) -> TraceResult<()> {
        cell.check_layout(v.shape(), v.dtype())?;
        if !self.is_tracing() {
            let c = v.concrete().ok_or_else(|| TraceError::InvalidValue {
                reason: format!(
                    "abstract value written to cell '{}' outside a trace scope",
                    cell.name()
                ),
            })?;
            return cell.set_value(c.clone());
        }
        let context = format!("write to cell '{}'", cell.name());
        let value = self.operand(v, &context)?;
        let t = self.tracer_mut(&context)?;
        t.table.borrow_mut().record_write(cell);
        t.push(
            OpKind::CellWrite {
                cell: cell.id(),
                value,
            },
            vec![],
        );
        Ok(())
    }
}
