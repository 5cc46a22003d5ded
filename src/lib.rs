//! tracecell - Mutable State Across a Trace Boundary.
//!
//! tracecell bridges identity-stable mutable state and trace-based
//! compilation: user code declares [`StateCell`]s, a [`CompiledFunction`]
//! wraps a body in a trace scope that intercepts cell reads and writes,
//! control constructs touching traced values route through structured ops,
//! and the lowered program is cached by argument signature and replayed with
//! updated state on every later call.
//!
//! # Primary Usage
//!
//! ```ignore
//! use tracecell::{CompiledFunction, StateCell, TensorValue};
//!
//! // Declare state once; identity is stable, layout is fixed.
//! let counter = StateCell::new("counter", TensorValue::scalar_f64(0.0));
//!
//! // Compile a body over that state.
//! let cell = counter.clone();
//! let mut step = CompiledFunction::new(move |ctx, args| {
//!     let cur = ctx.cell_read(&cell)?;
//!     let next = ctx.add(&cur, &args[0])?;
//!     ctx.cell_write(&cell, &next)?;
//!     Ok(vec![next])
//! });
//!
//! step.call(&[TensorValue::scalar_f64(1.0)])?; // traces once
//! step.call(&[TensorValue::scalar_f64(2.0)])?; // replays the cached program
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Shared infrastructure (errors, cells, random state)
//! - [`tensor`] - Concrete tensor values and element-wise ops
//! - [`trace`] - Trace scope, structured control, program replay
//! - [`jit`] - Compiled entry points and the signature-keyed cache
//! - [`persist`] - Named-state save/load over dotted keys

pub mod core;
pub mod jit;
pub mod persist;
pub mod tensor;
pub mod trace;

// Re-export common types from organized modules
pub use crate::core::{CellId, SplitRng, StateCell, TraceError, TraceResult};
pub use jit::{CacheStats, CompiledFunction, Signature, TraceRecord};
pub use persist::{apply, load, save, LoadReport, PersistError, StateDict};
pub use tensor::ops::{BinOp, CmpOp};
pub use tensor::{DType, TensorValue};
pub use trace::{BodyFn, CustomOp, PredFn, TraceContext, TraceValue};
