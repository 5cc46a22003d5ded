// This module serves as the central hub for tracecell's core infrastructure,
// providing the building blocks shared by the trace machinery, the compilation
// cache, and persistence: the error taxonomy (TraceError/TraceResult), the
// identity-stable StateCell container with versioned, layout-checked writes,
// and the explicit split-able random generator that replaces global random
// state. Everything here is independent of how programs are traced or
// executed; the trace and jit modules build on these primitives.

//! Core infrastructure.
//!
//! # Key Components
//!
//! ## Errors (`error`)
//! - `TraceError` taxonomy with per-violation context
//! - Synchronous propagation, no automatic recovery
//!
//! ## State (`cell`)
//! - Identity-stable mutable tensor containers
//! - Fixed shape/dtype layout, version-counted commits
//!
//! ## Random state (`rng`)
//! - Context-passed generator handle with deterministic `split`

pub mod cell;
pub mod error;
pub mod rng;

pub use cell::{CellId, StateCell};
pub use error::{TraceError, TraceResult};
pub use rng::SplitRng;
