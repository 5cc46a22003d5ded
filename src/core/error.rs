// This module defines error types for tracecell using the thiserror crate for
// idiomatic Rust error handling. TraceError is the main error enum covering the
// failure modes of the trace boundary: converting a traced value to a concrete
// boolean, shape/dtype violations on StateCell writes and structured-loop
// bodies, malformed structured-branch arity, and invalid values (non-concrete
// initializers, non-scalar predicates, degenerate tensor constructions). Each
// variant carries the name of the cell or construct that triggered it plus the
// conflicting shapes/dtypes, so the condition is diagnosable without inspecting
// internals. The module also provides TraceResult<T> as a convenience alias.

//! Error types for the trace boundary.
//!
//! Using thiserror for more idiomatic error handling. All errors raise
//! synchronously at the point of violation and are fatal to the current
//! compilation attempt or call; none are retried.

use thiserror::Error;

use crate::tensor::DType;

/// Main error type for tracing and compiled execution.
#[derive(Error, Debug)]
pub enum TraceError {
    /// A traced (shape/type-only) value was used where a concrete boolean is
    /// required. Not recoverable locally; the caller must rewrite the
    /// construct using structured control ops.
    #[error("traced value has no concrete truth value ({context}); use select/branch/conditional_loop instead of native control flow")]
    TraceBoolConversion { context: String },

    #[error("shape mismatch in {context}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("dtype mismatch in {context}: expected {expected}, found {found}")]
    TypeMismatch {
        context: String,
        expected: DType,
        found: DType,
    },

    /// Structured branch given mismatched predicate/branch counts. Caught at
    /// trace construction, before any body executes.
    #[error("arity mismatch in {context}: expected {expected}, found {found}")]
    ArityMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    #[error("invalid value: {reason}")]
    InvalidValue { reason: String },
}

/// Result type alias for trace operations.
pub type TraceResult<T> = Result<T, TraceError>;
