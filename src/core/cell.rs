// This module implements StateCell, the identity-stable mutable tensor
// container at the heart of tracecell. A cell is created once with a concrete
// initial value that fixes its shape and dtype for life; every later write is
// checked against that recorded layout and bumps a version counter. Identity
// comes from a process-wide atomic id, so a cell can participate in trace
// records and compilation-cache signatures without reference-identity tricks.
// Cells use interior mutability (RefCell) and are shared via Rc; the execution
// model is single-threaded, and parallel replicas must each own independent
// cells. Inside a trace, reads observe only the recorded shape/dtype; the
// TraceContext in src/trace handles that interception, this type holds truth.

//! Identity-stable mutable state.
//!
//! A [`StateCell`] is a named container for one tensor value. Mutation
//! replaces the stored value without changing the cell's identity, and the
//! new value must match the recorded shape and dtype exactly. The check is a
//! deliberate safety property: compiled executables are specialized to a
//! fixed layout, and a silent shape change would desynchronize cached code
//! from real data.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::error::{TraceError, TraceResult};
use crate::tensor::{DType, TensorValue};

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(0);

/// Unique identity token for a [`StateCell`], stable for the cell's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u64);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

/// A named, identity-stable container holding one tensor value.
pub struct StateCell {
    id: CellId,
    name: String,
    shape: Vec<usize>,
    dtype: DType,
    value: RefCell<TensorValue>,
    version: Cell<u64>,
}

impl StateCell {
    /// Create a cell from a concrete initial value. The value's shape and
    /// dtype become the cell's fixed layout.
    pub fn new(name: impl Into<String>, initial: TensorValue) -> Rc<StateCell> {
        let id = CellId(NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed));
        Rc::new(StateCell {
            id,
            name: name.into(),
            shape: initial.shape().to_vec(),
            dtype: initial.dtype(),
            value: RefCell::new(initial),
            version: Cell::new(0),
        })
    }

    /// Create a cell from a value observed under a trace context. This is
    /// the constructor for code that may run either eagerly or inside a
    /// trace: it fails with [`TraceError::InvalidValue`] when the value is
    /// abstract, because abstract values only exist inside a trace and carry
    /// no data to store.
    pub fn from_trace_value(
        name: impl Into<String>,
        initial: &crate::trace::TraceValue,
    ) -> TraceResult<Rc<StateCell>> {
        let name = name.into();
        match initial.concrete() {
            Some(v) => Ok(StateCell::new(name, v.clone())),
            None => Err(TraceError::InvalidValue {
                reason: format!("cell '{name}' initialized from a non-concrete traced value"),
            }),
        }
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixed shape recorded at creation.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Fixed element type recorded at creation.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of committed writes since creation.
    pub fn version(&self) -> u64 {
        self.version.get()
    }

    /// Current concrete value. Inside a trace, reads go through the
    /// TraceContext and observe an abstract placeholder instead.
    pub fn value(&self) -> TensorValue {
        self.value.borrow().clone()
    }

    /// Replace the stored value. Fails with ShapeMismatch/TypeMismatch when
    /// the new value does not match the recorded layout; on success the
    /// version counter increments.
    pub fn set_value(&self, new_value: TensorValue) -> TraceResult<()> {
        self.check_compatible(&new_value)?;
        *self.value.borrow_mut() = new_value;
        self.version.set(self.version.get() + 1);
        Ok(())
    }

    /// Layout check shared by eager writes, traced writes, and persistence.
    pub fn check_compatible(&self, candidate: &TensorValue) -> TraceResult<()> {
        self.check_layout(candidate.shape(), candidate.dtype())
    }

    /// Shape/dtype-only variant of the layout check, usable against abstract
    /// trace values that carry no data.
    pub fn check_layout(&self, shape: &[usize], dtype: DType) -> TraceResult<()> {
        if dtype != self.dtype {
            return Err(TraceError::TypeMismatch {
                context: format!("write to cell '{}'", self.name),
                expected: self.dtype,
                found: dtype,
            });
        }
        if shape != self.shape.as_slice() {
            return Err(TraceError::ShapeMismatch {
                context: format!("write to cell '{}'", self.name),
                expected: self.shape.clone(),
                found: shape.to_vec(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCell")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("version", &self.version.get())
            .finish()
    }
}
