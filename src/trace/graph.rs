// This module defines the lowered program representation produced by a trace.
// A Program is a flat list of nodes in evaluation order plus the value refs it
// returns; nodes address their operands by (node index, output index), so the
// whole structure is index-linked and owns no references into the tracer that
// built it. Structured control ops (Branch, BoundedLoop, CondLoop) carry
// sub-Programs for their bodies, which is what lets a trace represent
// data-dependent control flow without concrete branching: the executor picks
// or repeats a body at replay time, while the shapes and dtypes of every value
// were fixed when the trace was built. Each node records the signature of each
// output, so replay never needs to re-infer shapes.

//! Replayable program graphs.
//!
//! The cached executable form: a [`Program`] replays against concrete inputs
//! and a cell environment, producing the same values the traced body would.

use std::rc::Rc;

use super::custom::CustomOp;
use crate::core::cell::CellId;
use crate::tensor::ops::{BinOp, CmpOp};
use crate::tensor::{DType, TensorValue};

/// Index of a node within its owning [`Program`].
pub type NodeId = usize;

/// Reference to one output of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueRef {
    pub node: NodeId,
    pub output: usize,
}

/// Shape and dtype of one value; what an abstract trace value observes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueSig {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl ValueSig {
    pub fn of(v: &TensorValue) -> Self {
        ValueSig {
            shape: v.shape().to_vec(),
            dtype: v.dtype(),
        }
    }

    pub fn is_scalar_bool(&self) -> bool {
        self.shape.is_empty() && self.dtype == DType::Bool
    }
}

/// Operation performed by one node.
#[derive(Debug, Clone)]
pub enum OpKind {
    /// The i-th program input.
    Input(usize),
    /// A value captured at trace time.
    Constant(TensorValue),
    /// Read of a StateCell: pending write if one exists, else current value.
    CellRead(CellId),
    /// Deferred write of a StateCell; committed after the call succeeds.
    CellWrite { cell: CellId, value: ValueRef },
    Binary {
        op: BinOp,
        lhs: ValueRef,
        rhs: ValueRef,
    },
    Compare {
        op: CmpOp,
        lhs: ValueRef,
        rhs: ValueRef,
    },
    Select {
        cond: ValueRef,
        on_true: ValueRef,
        on_false: ValueRef,
    },
    /// Element `index` along the leading axis of `input`.
    SliceAt { input: ValueRef, index: usize },
    /// Invocation of a user-registered operator.
    Custom {
        op: Rc<CustomOp>,
        operands: Vec<ValueRef>,
    },
    /// First-true-predicate dispatch; the last body is the default.
    Branch {
        preds: Vec<ValueRef>,
        operands: Vec<ValueRef>,
        bodies: Vec<Program>,
    },
    /// One body execution per leading-axis slice of `xs`; outputs stacked.
    BoundedLoop { xs: ValueRef, body: Program },
    /// Replay `body` on the state tuple while `pred` holds.
    CondLoop {
        init: Vec<ValueRef>,
        pred: Program,
        body: Program,
    },
}

/// One node: an operation plus the signature of each output it produces.
#[derive(Debug, Clone)]
pub struct Node {
    pub op: OpKind,
    pub outputs: Vec<ValueSig>,
}

/// A lowered, replayable program.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub input_sigs: Vec<ValueSig>,
    pub nodes: Vec<Node>,
    pub outputs: Vec<ValueRef>,
}

impl Program {
    pub fn new(input_sigs: Vec<ValueSig>) -> Self {
        Program {
            input_sigs,
            nodes: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Append a node, returning its id.
    pub fn push(&mut self, op: OpKind, outputs: Vec<ValueSig>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node { op, outputs });
        id
    }

    /// Signatures of the program's outputs.
    pub fn output_sigs(&self) -> Vec<ValueSig> {
        self.outputs
            .iter()
            .map(|r| self.nodes[r.node].outputs[r.output].clone())
            .collect()
    }
}
