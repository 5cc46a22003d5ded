// Integration tests for structured control flow: select semantics, the
// first-true-predicate branch table, bounded loops against native sequential
// execution, conditional-loop termination, and the rules rejecting malformed
// constructs.

use tracecell::trace::BodyFn;
use tracecell::{
    CompiledFunction, SplitRng, StateCell, TensorValue, TraceContext, TraceError, TraceValue,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_select_through_a_trace() {
    init_logging();
    let mut f = CompiledFunction::new(|ctx, args| {
        let cond = ctx.gt(&args[0], &TensorValue::scalar_f64(0.0).into())?;
        let out = ctx.select(&cond, &args[1], &args[2])?;
        Ok(vec![out])
    });
    let x = TensorValue::vector_f64(&[1.0, 2.0, 3.0]);
    let y = TensorValue::vector_f64(&[9.0, 8.0, 7.0]);

    let out = f
        .call(&[TensorValue::vector_f64(&[1.0, -1.0, 1.0]), x.clone(), y.clone()])
        .unwrap();
    assert_eq!(out[0], TensorValue::vector_f64(&[1.0, 8.0, 3.0]));

    // Same signature: replayed, not retraced, with the other outcome.
    let out = f
        .call(&[TensorValue::vector_f64(&[-1.0, 1.0, -1.0]), x, y])
        .unwrap();
    assert_eq!(out[0], TensorValue::vector_f64(&[9.0, 2.0, 7.0]));
    assert_eq!(f.stats().traces, 1);
}

#[test]
fn test_branch_picks_first_true_predicate() {
    init_logging();
    let body = |k: f64| {
        move |_ctx: &mut TraceContext<'_>,
              _ops: &[TraceValue]|
              -> Result<Vec<TraceValue>, TraceError> {
            Ok(vec![TensorValue::scalar_f64(k).into()])
        }
    };
    let (b1, b2, b3, b4, b5) = (body(1.0), body(2.0), body(3.0), body(4.0), body(5.0));
    let mut f = CompiledFunction::new(move |ctx, args| {
        let a = &args[0];
        let preds = [
            ctx.gt(a, &TensorValue::scalar_f64(10.0).into())?,
            ctx.gt(a, &TensorValue::scalar_f64(5.0).into())?,
            ctx.gt(a, &TensorValue::scalar_f64(0.0).into())?,
            ctx.gt(a, &TensorValue::scalar_f64(-5.0).into())?,
        ];
        let bodies: [&BodyFn<'_>; 5] = [&b1, &b2, &b3, &b4, &b5];
        ctx.branch(&preds, &bodies, &[])
    });

    for (a, expected) in [
        (11.0, 1.0),
        (6.0, 2.0),
        (1.0, 3.0),
        (-4.0, 4.0),
        (-6.0, 5.0),
    ] {
        let out = f.call(&[TensorValue::scalar_f64(a)]).unwrap();
        assert_eq!(out[0], TensorValue::scalar_f64(expected), "a = {a}");
    }
    // One signature, one trace: dispatch happens at replay time.
    assert_eq!(f.stats().traces, 1);
    assert_eq!(f.stats().hits, 4);
}

#[test]
fn test_branch_arity_mismatch_caught_before_execution() {
    init_logging();
    let b: &BodyFn<'_> = &|_ctx, _ops| Ok(vec![TensorValue::scalar_f64(0.0).into()]);
    let mut f = CompiledFunction::new(move |ctx, args| {
        let p = ctx.gt(&args[0], &TensorValue::scalar_f64(0.0).into())?;
        // Two predicates need three bodies.
        ctx.branch(&[p.clone(), p], &[b, b], &[])
    });
    let err = f.call(&[TensorValue::scalar_f64(1.0)]).unwrap_err();
    assert!(matches!(err, TraceError::ArityMismatch { .. }));
}

#[test]
fn test_branch_bodies_must_agree_on_output_layout() {
    init_logging();
    let scalar: &BodyFn<'_> = &|_ctx, _ops| Ok(vec![TensorValue::scalar_f64(0.0).into()]);
    let vector: &BodyFn<'_> = &|_ctx, _ops| Ok(vec![TensorValue::vector_f64(&[0.0]).into()]);
    let mut f = CompiledFunction::new(move |ctx, args| {
        let p = ctx.gt(&args[0], &TensorValue::scalar_f64(0.0).into())?;
        ctx.branch(&[p], &[scalar, vector], &[])
    });
    let err = f.call(&[TensorValue::scalar_f64(1.0)]).unwrap_err();
    assert!(matches!(err, TraceError::ShapeMismatch { .. }));
}

#[test]
fn test_concrete_predicates_specialize_natively() {
    init_logging();
    // The predicate is a trace-time constant, so the branch resolves during
    // tracing and only the chosen body lands in the program.
    let pick: &BodyFn<'_> = &|ctx, ops| Ok(vec![ctx.add(&ops[0], &ops[0])?]);
    let skip: &BodyFn<'_> = &|_ctx, ops| Ok(vec![ops[0].clone()]);
    let mut f = CompiledFunction::new(move |ctx, args| {
        let flag = TensorValue::scalar_bool(true).into();
        ctx.branch(&[flag], &[pick, skip], &[args[0].clone()])
    });
    let out = f.call(&[TensorValue::scalar_f64(4.0)]).unwrap();
    assert_eq!(out[0], TensorValue::scalar_f64(8.0));
}

#[test]
fn test_bounded_loop_matches_native_execution_bit_for_bit() {
    init_logging();
    let mut rng = SplitRng::new(0xC0FFEE);
    let xs = rng.fill_f64(&[1000]);

    // Structured: running sum through a cell inside a compiled function.
    let structured_sum = StateCell::new("sum", TensorValue::scalar_f64(0.0));
    let cell = structured_sum.clone();
    let mut f = CompiledFunction::new(move |ctx, args| {
        ctx.bounded_loop(&args[0], &|ctx, slice| {
            let cur = ctx.cell_read(&cell)?;
            let next = ctx.add(&cur, &slice[0])?;
            ctx.cell_write(&cell, &next)?;
            Ok(vec![next])
        })
    });
    let out = f.call(&[xs.clone()]).unwrap();

    // Native: the same body, eager, one iteration at a time.
    let native_sum = StateCell::new("sum", TensorValue::scalar_f64(0.0));
    let mut ctx = TraceContext::eager();
    let mut history = Vec::new();
    for i in 0..1000 {
        let slice = TraceValue::from(xs.slice_leading(i).unwrap());
        let cur = ctx.cell_read(&native_sum).unwrap();
        let next = ctx.add(&cur, &slice).unwrap();
        ctx.cell_write(&native_sum, &next).unwrap();
        history.push(next.concrete().unwrap().clone());
    }

    assert_eq!(structured_sum.value(), native_sum.value());
    assert_eq!(out[0], TensorValue::stack_leading(&history).unwrap());
    assert_eq!(out[0].shape(), &[1000]);
}

#[test]
fn test_bounded_loop_rejects_empty_leading_axis() {
    init_logging();
    // Eager and compiled modes must agree on the empty input.
    let mut eager = TraceContext::eager();
    let err = eager
        .bounded_loop(&TensorValue::vector_f64(&[]).into(), &|_ctx, slice| {
            Ok(vec![slice[0].clone()])
        })
        .unwrap_err();
    assert!(matches!(err, TraceError::InvalidValue { .. }));

    let mut f = CompiledFunction::new(|ctx, args| {
        ctx.bounded_loop(&args[0], &|_ctx, slice| Ok(vec![slice[0].clone()]))
    });
    let err = f.call(&[TensorValue::vector_f64(&[])]).unwrap_err();
    assert!(matches!(err, TraceError::InvalidValue { .. }));
}

#[test]
fn test_bounded_loop_iterations_observe_prior_writes() {
    init_logging();
    let acc = StateCell::new("acc", TensorValue::scalar_i64(0));
    let cell = acc.clone();
    let mut f = CompiledFunction::new(move |ctx, args| {
        ctx.bounded_loop(&args[0], &|ctx, slice| {
            let cur = ctx.cell_read(&cell)?;
            let next = ctx.add(&cur, &slice[0])?;
            ctx.cell_write(&cell, &next)?;
            Ok(vec![next])
        })
    });
    let out = f.call(&[TensorValue::vector_i64(&[1, 2, 3, 4])]).unwrap();
    // Prefix sums prove iteration i saw writes from 0..i-1.
    assert_eq!(out[0], TensorValue::vector_i64(&[1, 3, 6, 10]));
    assert_eq!(acc.value(), TensorValue::scalar_i64(10));
}

#[test]
fn test_conditional_loop_terminates_at_bound() {
    init_logging();
    let iterations = StateCell::new("iterations", TensorValue::scalar_i64(0));
    let counter = iterations.clone();
    let mut f = CompiledFunction::new(move |ctx, args| {
        ctx.conditional_loop(
            &[args[0].clone()],
            &|ctx, state| {
                let head = ctx.slice_at(&state[0], 0)?;
                ctx.lt(&head, &TensorValue::scalar_f64(10.0).into())
            },
            &|ctx, state| {
                let n = ctx.cell_read(&counter)?;
                let bumped = ctx.add(&n, &TensorValue::scalar_i64(1).into())?;
                ctx.cell_write(&counter, &bumped)?;
                let next = ctx.add(&state[0], &TensorValue::scalar_f64(1.0).into())?;
                Ok(vec![next])
            },
        )
    });

    let out = f.call(&[TensorValue::vector_f64(&[0.0])]).unwrap();
    assert_eq!(out[0], TensorValue::vector_f64(&[10.0]));
    assert_eq!(iterations.value().as_i64().unwrap(), 10);
}

#[test]
fn test_conditional_loop_body_must_preserve_state_layout() {
    init_logging();
    let mut f = CompiledFunction::new(|ctx, args| {
        ctx.conditional_loop(
            &[args[0].clone()],
            &|ctx, state| ctx.lt(&state[0], &TensorValue::scalar_f64(10.0).into()),
            // Body returns i64 for f64 state.
            &|_ctx, _state| Ok(vec![TensorValue::scalar_i64(0).into()]),
        )
    });
    let err = f.call(&[TensorValue::scalar_f64(0.0)]).unwrap_err();
    assert!(matches!(err, TraceError::TypeMismatch { .. }));
}

#[test]
fn test_eager_and_compiled_conditional_loops_agree() {
    init_logging();
    let mut eager = TraceContext::eager();
    let eager_out = eager
        .conditional_loop(
            &[TensorValue::scalar_f64(0.0).into()],
            &|ctx, state| ctx.lt(&state[0], &TensorValue::scalar_f64(10.0).into()),
            &|ctx, state| Ok(vec![ctx.add(&state[0], &TensorValue::scalar_f64(1.0).into())?]),
        )
        .unwrap();
    assert_eq!(eager_out[0].concrete(), Some(&TensorValue::scalar_f64(10.0)));

    let mut f = CompiledFunction::new(|ctx, args| {
        ctx.conditional_loop(
            &[args[0].clone()],
            &|ctx, state| ctx.lt(&state[0], &TensorValue::scalar_f64(10.0).into()),
            &|ctx, state| Ok(vec![ctx.add(&state[0], &TensorValue::scalar_f64(1.0).into())?]),
        )
    });
    let compiled_out = f.call(&[TensorValue::scalar_f64(0.0)]).unwrap();
    assert_eq!(compiled_out[0], TensorValue::scalar_f64(10.0));
}

#[test]
fn test_body_capturing_enclosing_traced_value_is_rejected() {
    init_logging();
    let mut f = CompiledFunction::new(|ctx, args| {
        let leaked = ctx.add(&args[0], &args[0])?;
        // The body closes over `leaked`, an abstract value belonging to the
        // enclosing trace, instead of taking it through operands.
        ctx.bounded_loop(&args[1], &|ctx, _slice| {
            Ok(vec![ctx.add(&leaked, &TensorValue::scalar_f64(1.0).into())?])
        })
    });
    let err = f
        .call(&[
            TensorValue::scalar_f64(1.0),
            TensorValue::vector_f64(&[1.0, 2.0]),
        ])
        .unwrap_err();
    assert!(matches!(err, TraceError::InvalidValue { .. }));
}
