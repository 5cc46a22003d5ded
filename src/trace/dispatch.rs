// This module implements the control dispatcher: the structured control ops a
// trace can represent (select, first-true-predicate branch, bounded loop over
// a leading axis, conditional loop) and the rule deciding when native control
// flow is allowed instead. The rule: a predicate over values that are all
// concrete at trace time may drive native control flow, which simply
// specializes the trace to that branch or iteration count; a predicate over a
// traced value has no concrete truth value, so native `if`/`while` fails with
// TraceBoolConversion and the structured ops here must be used. Branch bodies
// are all traced up front and must agree on output signatures, because the
// structured op commits to one output layout while only one body runs.
// Conditional-loop bodies must map the state tuple to an identically-typed
// state tuple, because the same sub-program replays an unbounded number of
// times. Bodies receive data through their explicit operands and StateCells;
// loop-body cell writes are not threaded structurally but accumulate through
// the shared cell environment, matching sequential execution exactly.

//! Structured control flow.
//!
//! These operations express data-dependent control as single replayable ops,
//! so a trace can represent them without concrete branching.

use super::graph::{OpKind, Program, ValueSig};
use super::tracer::{TraceContext, Tracer, TraceValue};
use crate::core::error::{TraceError, TraceResult};
use crate::tensor::ops as tops;

/// A control-op body: receives its operands, returns its outputs.
pub type BodyFn<'a> =
    dyn Fn(&mut TraceContext<'_>, &[TraceValue]) -> TraceResult<Vec<TraceValue>> + 'a;

/// A loop predicate over the state tuple; must produce a scalar bool.
pub type PredFn<'a> = dyn Fn(&mut TraceContext<'_>, &[TraceValue]) -> TraceResult<TraceValue> + 'a;

pub(crate) fn check_outputs_match(
    context: &str,
    expected: &[ValueSig],
    found: &[ValueSig],
) -> TraceResult<()> {
    if expected.len() != found.len() {
        return Err(TraceError::ArityMismatch {
            context: format!("{context} outputs"),
            expected: expected.len(),
            found: found.len(),
        });
    }
    for (k, (e, f)) in expected.iter().zip(found).enumerate() {
        if e.dtype != f.dtype {
            return Err(TraceError::TypeMismatch {
                context: format!("{context} output {k}"),
                expected: e.dtype,
                found: f.dtype,
            });
        }
        if e.shape != f.shape {
            return Err(TraceError::ShapeMismatch {
                context: format!("{context} output {k}"),
                expected: e.shape.clone(),
                found: f.shape.clone(),
            });
        }
    }
    Ok(())
}

impl<'t> TraceContext<'t> {
    /// Trace a body into a sub-program sharing this trace's cell table.
    fn trace_subprogram(
        &mut self,
        context: &str,
        input_sigs: &[ValueSig],
        run: &BodyFn<'_>,
    ) -> TraceResult<(Program, Vec<ValueSig>)> {
        let table = self.tracer_mut(context)?.table.clone();
        let mut child = Tracer::child(table, input_sigs.to_vec());
        let args = child.input_values();
        let outs = {
            let mut ctx = TraceContext::tracing(&mut child);
            run(&mut ctx, &args)?
        };
        child.finish(&outs)
    }

    /// Element-wise choice over possibly-traced operands.
    pub fn select(
        &mut self,
        cond: &TraceValue,
        on_true: &TraceValue,
        on_false: &TraceValue,
    ) -> TraceResult<TraceValue> {
        if let (Some(c), Some(t), Some(f)) =
            (cond.concrete(), on_true.concrete(), on_false.concrete())
        {
            return Ok(TraceValue::Concrete(tops::select(c, t, f)?));
        }
        let (shape, dtype) = tops::check_select(
            (cond.shape(), cond.dtype()),
            (on_true.shape(), on_true.dtype()),
            (on_false.shape(), on_false.dtype()),
        )?;
        let sig = ValueSig { shape, dtype };
        let c = self.operand(cond, "select")?;
        let t = self.operand(on_true, "select")?;
        let f = self.operand(on_false, "select")?;
        let tracer = self.tracer_mut("select")?;
        let node = tracer.push(
            OpKind::Select {
                cond: c,
                on_true: t,
                on_false: f,
            },
            vec![sig.clone()],
        );
        Ok(tracer.abstract_out(node, 0, &sig))
    }

    /// First-true-predicate dispatch with a mandatory default body.
    ///
    /// `bodies.len()` must equal `preds.len() + 1`; predicates are scalar
    /// bools evaluated in order. When every predicate is concrete at trace
    /// time the chosen body runs inline, specializing the trace; otherwise
    /// every body is traced and they must agree on output signatures.
    pub fn branch(
        &mut self,
        preds: &[TraceValue],
        bodies: &[&BodyFn<'_>],
        operands: &[TraceValue],
    ) -> TraceResult<Vec<TraceValue>> {
        if bodies.len() != preds.len() + 1 {
            return Err(TraceError::ArityMismatch {
                context: format!("branch with {} predicates", preds.len()),
                expected: preds.len() + 1,
                found: bodies.len(),
            });
        }
        for (i, p) in preds.iter().enumerate() {
            let sig = p.sig();
            if !sig.is_scalar_bool() {
                return Err(TraceError::InvalidValue {
                    reason: format!(
                        "branch predicate {i} must be a scalar bool, found {} of shape {:?}",
                        sig.dtype, sig.shape
                    ),
                });
            }
        }

        if preds.iter().all(|p| p.is_concrete()) {
            // Native dispatch: pick the body once, right now.
            let mut chosen = bodies.len() - 1;
            for (i, p) in preds.iter().enumerate() {
                if p.as_bool()? {
                    chosen = i;
                    break;
                }
            }
            return bodies[chosen](self, operands);
        }

        let operand_sigs: Vec<ValueSig> = operands.iter().map(|o| o.sig()).collect();
        let mut programs = Vec::with_capacity(bodies.len());
        let mut out_sigs: Option<Vec<ValueSig>> = None;
        for (i, body) in bodies.iter().enumerate() {
            let (prog, sigs) = self.trace_subprogram("branch", &operand_sigs, body)?;
            match &out_sigs {
                None => out_sigs = Some(sigs),
                Some(expected) => {
                    check_outputs_match(&format!("branch body {i}"), expected, &sigs)?
                }
            }
            programs.push(prog);
        }
        let out_sigs = out_sigs.unwrap_or_default();

        let pred_refs = preds
            .iter()
            .map(|p| self.operand(p, "branch"))
            .collect::<TraceResult<Vec<_>>>()?;
        let operand_refs = operands
            .iter()
            .map(|o| self.operand(o, "branch"))
            .collect::<TraceResult<Vec<_>>>()?;
        let tracer = self.tracer_mut("branch")?;
        let node = tracer.push(
            OpKind::Branch {
                preds: pred_refs,
                operands: operand_refs,
                bodies: programs,
            },
            out_sigs.clone(),
        );
        Ok(out_sigs
            .iter()
            .enumerate()
            .map(|(k, sig)| tracer.abstract_out(node, k, sig))
            .collect())
    }

    /// Execute `body` once per leading-axis slice of `xs`, stacking each
    /// iteration's outputs into a new leading axis.
    ///
    /// The body may freely read and write StateCells; they are not part of
    /// the structural input/output threading, and iteration `i` observes the
    /// writes of iterations `0..i-1`. `xs` must have rank >= 1 and a
    /// non-empty leading axis; both modes reject an empty one.
    pub fn bounded_loop(
        &mut self,
        xs: &TraceValue,
        body: &BodyFn<'_>,
    ) -> TraceResult<Vec<TraceValue>> {
        if xs.shape().is_empty() {
            return Err(TraceError::InvalidValue {
                reason: "bounded_loop input must have a leading axis".into(),
            });
        }
        let n = xs.shape()[0];
        // The eager path cannot determine the output layout without running an
        // iteration, and the two modes must agree.
        if n == 0 {
            return Err(TraceError::InvalidValue {
                reason: "bounded_loop over an empty leading axis".into(),
            });
        }

        if !self.is_tracing() {
            let xsv = xs.concrete().ok_or_else(|| TraceError::InvalidValue {
                reason: "abstract value used outside a trace scope (bounded_loop)".into(),
            })?;
            let mut history: Vec<Vec<crate::tensor::TensorValue>> = Vec::new();
            let mut arity = None;
            for i in 0..n {
                let slice = TraceValue::Concrete(xsv.slice_leading(i)?);
                let outs = body(self, &[slice])?;
                match arity {
                    None => arity = Some(outs.len()),
                    Some(a) if a != outs.len() => {
                        return Err(TraceError::ArityMismatch {
                            context: "bounded_loop body outputs".into(),
                            expected: a,
                            found: outs.len(),
                        })
                    }
                    _ => {}
                }
                let concrete = outs
                    .iter()
                    .map(|o| {
                        o.concrete().cloned().ok_or_else(|| TraceError::InvalidValue {
                            reason: "bounded_loop body produced an abstract value outside a trace"
                                .into(),
                        })
                    })
                    .collect::<TraceResult<Vec<_>>>()?;
                history.push(concrete);
            }
            let arity = arity.unwrap_or(0);
            if arity == 0 {
                return Err(TraceError::InvalidValue {
                    reason: "bounded_loop body must return at least one value".into(),
                });
            }
            let mut stacked = Vec::with_capacity(arity);
            for k in 0..arity {
                let column: Vec<_> = history.iter().map(|row| row[k].clone()).collect();
                stacked.push(TraceValue::Concrete(
                    crate::tensor::TensorValue::stack_leading(&column)?,
                ));
            }
            return Ok(stacked);
        }

        let elem_sig = ValueSig {
            shape: xs.shape()[1..].to_vec(),
            dtype: xs.dtype(),
        };
        let (program, body_sigs) = self.trace_subprogram("bounded_loop", &[elem_sig], body)?;
        if body_sigs.is_empty() {
            return Err(TraceError::InvalidValue {
                reason: "bounded_loop body must return at least one value".into(),
            });
        }
        let out_sigs: Vec<ValueSig> = body_sigs
            .iter()
            .map(|s| {
                let mut shape = Vec::with_capacity(s.shape.len() + 1);
                shape.push(n);
                shape.extend_from_slice(&s.shape);
                ValueSig {
                    shape,
                    dtype: s.dtype,
                }
            })
            .collect();
        let xs_ref = self.operand(xs, "bounded_loop")?;
        let tracer = self.tracer_mut("bounded_loop")?;
        let node = tracer.push(
            OpKind::BoundedLoop {
                xs: xs_ref,
                body: program,
            },
            out_sigs.clone(),
        );
        Ok(out_sigs
            .iter()
            .enumerate()
            .map(|(k, sig)| tracer.abstract_out(node, k, sig))
            .collect())
    }

    /// Repeat `body` on the state tuple while `pred(state)` holds.
    ///
    /// The body's output signature must exactly equal its input signature:
    /// the same sub-program replays an unbounded number of times. A predicate
    /// that never becomes false loops forever; that hazard is the caller's.
    pub fn conditional_loop(
        &mut self,
        init: &[TraceValue],
        pred: &PredFn<'_>,
        body: &BodyFn<'_>,
    ) -> TraceResult<Vec<TraceValue>> {
        let state_sigs: Vec<ValueSig> = init.iter().map(|v| v.sig()).collect();

        if !self.is_tracing() {
            let mut state: Vec<TraceValue> = init.to_vec();
            loop {
                let p = pred(self, &state)?;
                if !p.as_bool()? {
                    break;
                }
                let next = body(self, &state)?;
                let next_sigs: Vec<ValueSig> = next.iter().map(|v| v.sig()).collect();
                check_outputs_match("conditional_loop body", &state_sigs, &next_sigs)?;
                state = next;
            }
            return Ok(state);
        }

        let (pred_prog, pred_sigs) = self.trace_subprogram("conditional_loop", &state_sigs, &|ctx,
             args| {
            pred(ctx, args).map(|v| vec![v])
        })?;
        if pred_sigs.len() != 1 || !pred_sigs[0].is_scalar_bool() {
            return Err(TraceError::InvalidValue {
                reason: format!(
                    "conditional_loop predicate must produce a scalar bool, found {:?}",
                    pred_sigs
                ),
            });
        }
        let (body_prog, body_sigs) = self.trace_subprogram("conditional_loop", &state_sigs, body)?;
        check_outputs_match("conditional_loop body", &state_sigs, &body_sigs)?;

        let init_refs = init
            .iter()
            .map(|v| self.operand(v, "conditional_loop"))
            .collect::<TraceResult<Vec<_>>>()?;
        let tracer = self.tracer_mut("conditional_loop")?;
        let node = tracer.push(
            OpKind::CondLoop {
                init: init_refs,
                pred: pred_prog,
                body: body_prog,
            },
            state_sigs.clone(),
        );
        Ok(state_sigs
            .iter()
            .enumerate()
            .map(|(k, sig)| tracer.abstract_out(node, k, sig))
            .collect())
    }
}
