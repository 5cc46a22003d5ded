// This module implements the named-state persistence contract. A StateDict
// registers cells under dotted hierarchical keys (nesting via extend_scoped),
// snapshot() captures the current key -> tensor mapping, save()/load() move a
// snapshot through a JSON file with buffered I/O, and apply() writes a loaded
// mapping back into the registered cells, reporting which expected keys were
// missing from the mapping and which loaded keys had no cell. Values restore
// through the cells' own layout checks, so a snapshot from a differently
// shaped structure fails loudly instead of silently corrupting state.
// PersistError wraps I/O and serialization failures alongside the core trace
// errors; file paths are carried in the error for diagnosability. Non-finite
// floats are rejected at save time with the offending key, since JSON cannot
// represent them and a null-bearing snapshot would fail to load.

//! Named-state save/load.
//!
//! Keys are dotted hierarchical names. A round trip through `save` and `load`
//! followed by [`apply`] restores every value bit-for-bit and reports empty
//! missing/unexpected key lists when the structure is unchanged.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use thiserror::Error;

use crate::core::cell::StateCell;
use crate::core::error::{TraceError, TraceResult};
use crate::tensor::TensorValue;

/// Error type for persistence operations.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// JSON has no NaN/infinity representation; serde_json would write null
    /// and the snapshot would fail to load.
    #[error("non-finite float under key '{key}'; the snapshot would not round-trip")]
    NonFinite { key: String },

    #[error(transparent)]
    Trace(#[from] TraceError),
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Ordered registry of cells under dotted hierarchical keys.
#[derive(Default)]
pub struct StateDict {
    entries: BTreeMap<String, Rc<StateCell>>,
}

impl StateDict {
    pub fn new() -> Self {
        StateDict::default()
    }

    /// Register a cell under `name`. Duplicate names are rejected.
    pub fn insert(&mut self, name: impl Into<String>, cell: Rc<StateCell>) -> TraceResult<()> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(TraceError::InvalidValue {
                reason: format!("duplicate state key '{name}'"),
            });
        }
        self.entries.insert(name, cell);
        Ok(())
    }

    /// Absorb another dict under `prefix`, producing `prefix.name` keys.
    pub fn extend_scoped(&mut self, prefix: &str, other: &StateDict) -> TraceResult<()> {
        for (name, cell) in &other.entries {
            self.insert(format!("{prefix}.{name}"), cell.clone())?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Rc<StateCell>> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Current key -> value mapping.
    pub fn snapshot(&self) -> BTreeMap<String, TensorValue> {
        self.entries
            .iter()
            .map(|(name, cell)| (name.clone(), cell.value()))
            .collect()
    }
}

/// Keys that did not line up during [`apply`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Registered keys absent from the loaded mapping.
    pub missing: Vec<String>,
    /// Loaded keys with no registered cell.
    pub unexpected: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// Serialize the dict's snapshot to a JSON file.
///
/// Non-finite floats are rejected with [`PersistError::NonFinite`] before the
/// file is created, naming the offending key.
pub fn save(dict: &StateDict, path: &Path) -> PersistResult<()> {
    let snapshot = dict.snapshot();
    for (name, value) in &snapshot {
        if let TensorValue::F64(a) = value {
            if a.iter().any(|x| !x.is_finite()) {
                return Err(PersistError::NonFinite { key: name.clone() });
            }
        }
    }
    let file = File::create(path).map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::to_writer_pretty(BufWriter::new(file), &snapshot)?;
    log::debug!("saved {} state entries to {}", dict.len(), path.display());
    Ok(())
}

/// Deserialize a key -> value mapping from a JSON file.
pub fn load(path: &Path) -> PersistResult<BTreeMap<String, TensorValue>> {
    let file = File::open(path).map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mapping = serde_json::from_reader(BufReader::new(file))?;
    Ok(mapping)
}

/// Write a loaded mapping into the dict's cells.
///
/// Each matching value goes through the cell's layout check; a shape or dtype
/// conflict aborts the apply with the offending cell named in the error.
pub fn apply(
    dict: &StateDict,
    mut mapping: BTreeMap<String, TensorValue>,
) -> PersistResult<LoadReport> {
    let mut missing = Vec::new();
    for (name, cell) in &dict.entries {
        match mapping.remove(name) {
            Some(value) => cell.set_value(value)?,
            None => missing.push(name.clone()),
        }
    }
    let unexpected: Vec<String> = mapping.into_keys().collect();
    let report = LoadReport {
        missing,
        unexpected,
    };
    if !report.is_clean() {
        log::debug!(
            "state apply mismatches: {} missing, {} unexpected",
            report.missing.len(),
            report.unexpected.len()
        );
    }
    Ok(report)
}
