// This module replays lowered programs against concrete values. Evaluation is
// a single pass over the node list in recorded order; every node's outputs
// land in a value table indexed by node id, and operands are fetched by
// (node, output) ref. StateCell access goes through a CellEnv: reads observe
// the pending write from earlier in this execution if one exists, otherwise
// the cell's true current value, and writes only touch the pending map. The
// pending map is shared down into control-op bodies, which is what makes loop
// iterations observe each other's cell writes exactly as sequential execution
// would. Only after the whole program evaluates successfully are pending
// writes committed to the real cells; an error mid-replay leaves every cell
// untouched.

//! Program replay.

use hashbrown::HashMap;
use std::rc::Rc;

use super::graph::{OpKind, Program, ValueRef};
use crate::core::cell::{CellId, StateCell};
use crate::core::error::{TraceError, TraceResult};
use crate::tensor::ops as tops;
use crate::tensor::TensorValue;

/// Cell state for one execution: true values plus uncommitted writes.
pub(crate) struct CellEnv<'a> {
    cells: &'a HashMap<CellId, Rc<StateCell>>,
    pending: HashMap<CellId, TensorValue>,
}

impl<'a> CellEnv<'a> {
    pub(crate) fn new(cells: &'a HashMap<CellId, Rc<StateCell>>) -> Self {
        CellEnv {
            cells,
            pending: HashMap::new(),
        }
    }

    fn read(&self, id: CellId) -> TraceResult<TensorValue> {
        if let Some(v) = self.pending.get(&id) {
            return Ok(v.clone());
        }
        match self.cells.get(&id) {
            Some(cell) => Ok(cell.value()),
            None => Err(TraceError::InvalidValue {
                reason: format!("{id} is not registered with this executable"),
            }),
        }
    }

    fn write(&mut self, id: CellId, value: TensorValue) {
        self.pending.insert(id, value);
    }

    /// Commit every pending write to its real cell.
    pub(crate) fn commit(self) -> TraceResult<()> {
        for (id, value) in self.pending {
            let cell = self.cells.get(&id).ok_or_else(|| TraceError::InvalidValue {
                reason: format!("{id} is not registered with this executable"),
            })?;
            log::trace!(
                "committing write to cell '{}' (version {} -> {})",
                cell.name(),
                cell.version(),
                cell.version() + 1
            );
            cell.set_value(value)?;
        }
        Ok(())
    }
}

fn fetch<'v>(values: &'v [Vec<TensorValue>], r: &ValueRef) -> TraceResult<&'v TensorValue> {
    values
        .get(r.node)
        .and_then(|outs| outs.get(r.output))
        .ok_or_else(|| TraceError::InvalidValue {
            reason: format!("dangling value ref {}:{}", r.node, r.output),
        })
}

/// Replay `program` with the given inputs, reading and writing cells through
/// `env`. Returns the program's output values.
pub(crate) fn eval(
    program: &Program,
    inputs: &[TensorValue],
    env: &mut CellEnv<'_>,
) -> TraceResult<Vec<TensorValue>> {
    if inputs.len() != program.input_sigs.len() {
        return Err(TraceError::ArityMismatch {
            context: "program inputs".into(),
            expected: program.input_sigs.len(),
            found: inputs.len(),
        });
    }
    let mut values: Vec<Vec<TensorValue>> = Vec::with_capacity(program.nodes.len());
    for node in &program.nodes {
        let outs = match &node.op {
            OpKind::Input(i) => vec![inputs[*i].clone()],
            OpKind::Constant(v) => vec![v.clone()],
            OpKind::CellRead(id) => vec![env.read(*id)?],
            OpKind::CellWrite { cell, value } => {
                let v = fetch(&values, value)?.clone();
                env.write(*cell, v);
                vec![]
            }
            OpKind::Binary { op, lhs, rhs } => {
                vec![tops::binary(*op, fetch(&values, lhs)?, fetch(&values, rhs)?)?]
            }
            OpKind::Compare { op, lhs, rhs } => {
                vec![tops::compare(*op, fetch(&values, lhs)?, fetch(&values, rhs)?)?]
            }
            OpKind::Select {
                cond,
                on_true,
                on_false,
            } => vec![tops::select(
                fetch(&values, cond)?,
                fetch(&values, on_true)?,
                fetch(&values, on_false)?,
            )?],
            OpKind::SliceAt { input, index } => {
                vec![fetch(&values, input)?.slice_leading(*index)?]
            }
            OpKind::Custom { op, operands } => {
                let ins = operands
                    .iter()
                    .map(|r| fetch(&values, r).cloned())
                    .collect::<TraceResult<Vec<_>>>()?;
                op.run(&ins)?
            }
            OpKind::Branch {
                preds,
                operands,
                bodies,
            } => {
                let mut chosen = bodies.len() - 1;
                for (i, p) in preds.iter().enumerate() {
                    if fetch(&values, p)?.as_bool()? {
                        chosen = i;
                        break;
                    }
                }
                let operand_values = operands
                    .iter()
                    .map(|r| fetch(&values, r).cloned())
                    .collect::<TraceResult<Vec<_>>>()?;
                eval(&bodies[chosen], &operand_values, env)?
            }
            OpKind::BoundedLoop { xs, body } => {
                let xsv = fetch(&values, xs)?.clone();
                let n = xsv.shape().first().copied().unwrap_or(0);
                let arity = node.outputs.len();
                let mut history: Vec<Vec<TensorValue>> = Vec::with_capacity(n);
                for i in 0..n {
                    let slice = xsv.slice_leading(i)?;
                    history.push(eval(body, &[slice], env)?);
                }
                if n == 0 {
                    return Err(TraceError::InvalidValue {
                        reason: "bounded_loop over an empty leading axis".into(),
                    });
                }
                let mut stacked = Vec::with_capacity(arity);
                for k in 0..arity {
                    let column: Vec<_> = history.iter().map(|row| row[k].clone()).collect();
                    stacked.push(TensorValue::stack_leading(&column)?);
                }
                stacked
            }
            OpKind::CondLoop { init, pred, body } => {
                let mut state = init
                    .iter()
                    .map(|r| fetch(&values, r).cloned())
                    .collect::<TraceResult<Vec<_>>>()?;
                loop {
                    let p = eval(pred, &state, env)?;
                    let go = p
                        .first()
                        .ok_or_else(|| TraceError::InvalidValue {
                            reason: "conditional_loop predicate produced no value".into(),
                        })?
                        .as_bool()?;
                    if !go {
                        break;
                    }
                    state = eval(body, &state, env)?;
                }
                state
            }
        };
        values.push(outs);
    }
    program
        .outputs
        .iter()
        .map(|r| fetch(&values, r).cloned())
        .collect()
}
