// This module provides the compilation cache and the compiled entry-point
// wrapper. A CompiledFunction owns a body closure and a signature-keyed map of
// lowered programs. Per entry point the state machine is Uncompiled -> Tracing
// -> Cached -> (re-)Tracing on signature miss: the first call with a new
// argument signature traces the body (the expensive path), stores the program
// together with its TraceRecord (which cells were read and written), and then
// executes it; later calls with a matching signature replay the cached program
// directly and commit resulting writes to the real cells. Entries are
// append-only and keyed by an immutable signature; nothing invalidates them
// automatically. Changing the external cell structure between calls without
// calling invalidate() is the documented stale-cache hazard, and the explicit
// invalidate() operation is the supported answer. CacheStats tracks calls,
// traces, and hits so trace-once behavior is observable.

//! Compiled entry points and the signature-keyed cache.
//!
//! ```ignore
//! use tracecell::{CompiledFunction, StateCell, TensorValue};
//!
//! let counter = StateCell::new("counter", TensorValue::scalar_f64(0.0));
//! let cell = counter.clone();
//! let mut step = CompiledFunction::new(move |ctx, args| {
//!     let cur = ctx.cell_read(&cell)?;
//!     let next = ctx.add(&cur, &args[0])?;
//!     ctx.cell_write(&cell, &next)?;
//!     Ok(vec![next])
//! });
//!
//! step.call(&[TensorValue::scalar_f64(2.0)])?; // traces, then executes
//! step.call(&[TensorValue::scalar_f64(3.0)])?; // cache hit, replay only
//! assert_eq!(counter.value(), TensorValue::scalar_f64(5.0));
//! ```

use std::fmt;

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

use crate::core::cell::CellId;
use crate::core::error::TraceResult;
use crate::tensor::TensorValue;
use crate::trace::graph::{Program, ValueSig};
use crate::trace::{CellEnv, TraceContext, TraceValue, Tracer};

/// Argument shapes and dtypes of one invocation; the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(Vec<ValueSig>);

impl Signature {
    pub fn of(args: &[TensorValue]) -> Self {
        Signature(args.iter().map(ValueSig::of).collect())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, sig) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}{:?}", sig.dtype, sig.shape)?;
        }
        write!(f, ")")
    }
}

/// Which cells one trace read and wrote, in first-touch order.
#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub reads: Vec<CellId>,
    pub writes: Vec<CellId>,
}

struct CacheEntry {
    program: Program,
    record: TraceRecord,
    cells: HashMap<CellId, std::rc::Rc<crate::core::cell::StateCell>>,
}

/// Compilation cache statistics.
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// Total invocations.
    pub calls: usize,
    /// Traces performed (cache misses).
    pub traces: usize,
    /// Replays of an already-cached program.
    pub hits: usize,
    /// Live cache entries.
    pub entries: usize,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Cache Statistics:")?;
        writeln!(f, "  Calls: {}", self.calls)?;
        writeln!(f, "  Traces performed: {}", self.traces)?;
        writeln!(f, "  Cache hits: {}", self.hits)?;
        writeln!(f, "  Cached entries: {}", self.entries)?;
        Ok(())
    }
}

/// A compiled entry point: a body closure plus its cache of lowered programs.
pub struct CompiledFunction<F> {
    body: F,
    cache: HashMap<Signature, CacheEntry>,
    stats: CacheStats,
}

impl<F> CompiledFunction<F>
where
    F: Fn(&mut TraceContext<'_>, &[TraceValue]) -> TraceResult<Vec<TraceValue>>,
{
    pub fn new(body: F) -> Self {
        CompiledFunction {
            body,
            cache: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Invoke with concrete arguments.
    ///
    /// Traces on a signature miss, replays on a hit. On success every cell
    /// write the trace recorded is committed; on error no cell changes.
    pub fn call(&mut self, args: &[TensorValue]) -> TraceResult<Vec<TensorValue>> {
        let sig = Signature::of(args);
        self.stats.calls += 1;
        let Self {
            body,
            cache,
            stats,
        } = self;
        let entry = match cache.entry(sig.clone()) {
            Entry::Occupied(e) => {
                stats.hits += 1;
                log::trace!("cache hit for signature {sig}");
                e.into_mut()
            }
            Entry::Vacant(v) => {
                log::debug!("cache miss for signature {sig}; tracing");
                let entry = trace_body(body, args)?;
                stats.traces += 1;
                log::debug!(
                    "trace complete: {} nodes, {} cells read, {} cells written",
                    entry.program.nodes.len(),
                    entry.record.reads.len(),
                    entry.record.writes.len()
                );
                v.insert(entry)
            }
        };

        let mut env = CellEnv::new(&entry.cells);
        let outputs = crate::trace::exec::eval(&entry.program, args, &mut env)?;
        env.commit()?;
        Ok(outputs)
    }

    /// Drop every cached program.
    ///
    /// This is the explicit recovery from the stale-cache hazard: after the
    /// external structure of participating state changes (cells added or
    /// removed between calls), the next call retraces.
    pub fn invalidate(&mut self) {
        log::debug!("invalidating {} cache entries", self.cache.len());
        self.cache.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.cache.len(),
            ..self.stats.clone()
        }
    }

    /// The trace record for a given argument signature, if cached.
    pub fn trace_record(&self, args: &[TensorValue]) -> Option<&TraceRecord> {
        self.cache.get(&Signature::of(args)).map(|e| &e.record)
    }
}

fn trace_body<F>(body: &F, args: &[TensorValue]) -> TraceResult<CacheEntry>
where
    F: Fn(&mut TraceContext<'_>, &[TraceValue]) -> TraceResult<Vec<TraceValue>>,
{
    let input_sigs: Vec<ValueSig> = args.iter().map(ValueSig::of).collect();
    let mut tracer = Tracer::root(input_sigs);
    let trace_args = tracer.input_values();
    let outs = {
        let mut ctx = TraceContext::tracing(&mut tracer);
        body(&mut ctx, &trace_args)?
    };
    let table = tracer.table.clone();
    let (program, _) = tracer.finish(&outs)?;
    let table = table.borrow();
    Ok(CacheEntry {
        program,
        record: TraceRecord {
            reads: table.reads.clone(),
            writes: table.writes.clone(),
        },
        cells: table.cells.clone(),
    })
}
