// This module is the trace boundary: the program representation a trace lowers
// to (graph), the tracing context and traced values (tracer), the structured
// control dispatcher (dispatch), user-registered operators (custom), and the
// replay executor (exec). The flow:
// user code declares StateCells, a compiled invocation wraps the body in a
// tracing TraceContext, control constructs touching traced values route
// through structured ops, the tracer records the cell read/write sets, and the
// resulting Program replays with concrete values on every later call while the
// executor commits updated values back into the cells.

//! Trace boundary.
//!
//! # Key Components
//!
//! ## Program graphs (`graph`)
//! - Index-linked node lists, sub-programs for control ops
//!
//! ## Tracing (`tracer`)
//! - [`TraceContext`]: eager or tracing, same op surface
//! - [`TraceValue`]: concrete tensor or shape/dtype placeholder
//!
//! ## Structured control (`dispatch`)
//! - `select`, `branch`, `bounded_loop`, `conditional_loop`
//! - Concrete-operand specialization rule
//!
//! ## User operators (`custom`)
//! - [`CustomOp`]: named kernels with trace-time signatures
//!
//! ## Replay (`exec`)
//! - Pending-write cell environment, commit on success

pub mod custom;
pub mod dispatch;
pub mod graph;
pub mod tracer;

pub(crate) mod exec;

pub use custom::CustomOp;
pub use dispatch::{BodyFn, PredFn};
pub use graph::{Node, NodeId, OpKind, Program, ValueRef, ValueSig};
pub use tracer::{AbstractValue, TraceContext, TraceValue};

pub(crate) use exec::CellEnv;
pub(crate) use tracer::Tracer;
