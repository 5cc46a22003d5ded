// Integration tests for CompiledFunction: the trace-once/replay contract,
// signature-keyed retracing, state commits across calls, explicit
// invalidation, and the traced-truthiness failure mode.

use tracecell::trace::ValueSig;
use tracecell::{CompiledFunction, CustomOp, StateCell, TensorValue, TraceError};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_traces_once_for_identical_signatures() {
    init_logging();
    let mut f = CompiledFunction::new(|ctx, args| {
        let doubled = ctx.add(&args[0], &args[0])?;
        Ok(vec![doubled])
    });

    let out = f.call(&[TensorValue::scalar_f64(2.0)]).unwrap();
    assert_eq!(out[0], TensorValue::scalar_f64(4.0));
    let out = f.call(&[TensorValue::scalar_f64(5.0)]).unwrap();
    assert_eq!(out[0], TensorValue::scalar_f64(10.0));

    let stats = f.stats();
    assert_eq!(stats.calls, 2);
    assert_eq!(stats.traces, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 1);
}

#[test]
fn test_rank_or_dtype_change_retraces() {
    init_logging();
    let mut f = CompiledFunction::new(|ctx, args| Ok(vec![ctx.add(&args[0], &args[0])?]));

    f.call(&[TensorValue::scalar_f64(1.0)]).unwrap();
    f.call(&[TensorValue::scalar_f64(2.0)]).unwrap();
    // New rank: retrace.
    f.call(&[TensorValue::vector_f64(&[1.0, 2.0])]).unwrap();
    // New dtype: retrace.
    f.call(&[TensorValue::scalar_i64(3)]).unwrap();

    let stats = f.stats();
    assert_eq!(stats.traces, 3);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.entries, 3);
}

#[test]
fn test_cell_state_commits_across_calls() {
    init_logging();
    let counter = StateCell::new("counter", TensorValue::scalar_f64(0.0));
    let cell = counter.clone();
    let mut step = CompiledFunction::new(move |ctx, args| {
        let cur = ctx.cell_read(&cell)?;
        let next = ctx.add(&cur, &args[0])?;
        ctx.cell_write(&cell, &next)?;
        Ok(vec![next])
    });

    let out = step.call(&[TensorValue::scalar_f64(2.0)]).unwrap();
    assert_eq!(out[0], TensorValue::scalar_f64(2.0));
    assert_eq!(counter.value(), TensorValue::scalar_f64(2.0));

    // The second call replays the cached program against the committed state.
    let out = step.call(&[TensorValue::scalar_f64(3.0)]).unwrap();
    assert_eq!(out[0], TensorValue::scalar_f64(5.0));
    assert_eq!(counter.value(), TensorValue::scalar_f64(5.0));
    assert_eq!(counter.version(), 2);
    assert_eq!(step.stats().traces, 1);
}

#[test]
fn test_trace_record_captures_read_write_sets() {
    init_logging();
    let read_only = StateCell::new("gain", TensorValue::scalar_f64(3.0));
    let written = StateCell::new("acc", TensorValue::scalar_f64(0.0));
    let (g, a) = (read_only.clone(), written.clone());
    let mut f = CompiledFunction::new(move |ctx, args| {
        let gain = ctx.cell_read(&g)?;
        let scaled = ctx.mul(&gain, &args[0])?;
        let acc = ctx.cell_read(&a)?;
        let next = ctx.add(&acc, &scaled)?;
        ctx.cell_write(&a, &next)?;
        Ok(vec![next])
    });

    let args = [TensorValue::scalar_f64(1.0)];
    f.call(&args).unwrap();
    let record = f.trace_record(&args).expect("entry should be cached");
    assert_eq!(record.reads, vec![read_only.id(), written.id()]);
    assert_eq!(record.writes, vec![written.id()]);
}

#[test]
fn test_custom_op_traces_and_replays() {
    init_logging();
    let norm_sq = CustomOp::new(
        "norm_sq",
        |ins: &[ValueSig]| {
            Ok(vec![ValueSig {
                shape: vec![],
                dtype: ins[0].dtype,
            }])
        },
        |ins: &[TensorValue]| {
            let TensorValue::F64(a) = &ins[0] else {
                return Err(TraceError::InvalidValue {
                    reason: "norm_sq wants an f64 tensor".into(),
                });
            };
            Ok(vec![TensorValue::scalar_f64(a.iter().map(|x| x * x).sum())])
        },
    );
    let mut f = CompiledFunction::new(move |ctx, args| ctx.custom(&norm_sq, args));

    let out = f.call(&[TensorValue::vector_f64(&[3.0, 4.0])]).unwrap();
    assert_eq!(out[0], TensorValue::scalar_f64(25.0));
    // Replay invokes the registered kernel without retracing.
    let out = f.call(&[TensorValue::vector_f64(&[1.0, 2.0])]).unwrap();
    assert_eq!(out[0], TensorValue::scalar_f64(5.0));
    assert_eq!(f.stats().traces, 1);
    assert_eq!(f.stats().hits, 1);
}

#[test]
fn test_invalidate_forces_retrace() {
    init_logging();
    let mut f = CompiledFunction::new(|ctx, args| Ok(vec![ctx.add(&args[0], &args[0])?]));
    f.call(&[TensorValue::scalar_f64(1.0)]).unwrap();
    f.invalidate();
    assert_eq!(f.stats().entries, 0);
    f.call(&[TensorValue::scalar_f64(1.0)]).unwrap();
    assert_eq!(f.stats().traces, 2);
}

#[test]
fn test_native_if_on_traced_value_fails() {
    init_logging();
    let mut f = CompiledFunction::new(|ctx, args| {
        let positive = ctx.gt(&args[0], &TensorValue::scalar_f64(0.0).into())?;
        // Native control flow over a traced value: must fail, the trace has
        // no concrete truth value to branch on.
        if positive.as_bool()? {
            Ok(vec![args[0].clone()])
        } else {
            Ok(vec![TensorValue::scalar_f64(0.0).into()])
        }
    });
    let err = f.call(&[TensorValue::scalar_f64(1.0)]).unwrap_err();
    assert!(matches!(err, TraceError::TraceBoolConversion { .. }));
    // Nothing was cached for the failed attempt.
    assert_eq!(f.stats().entries, 0);
}

#[test]
fn test_failed_call_commits_nothing() {
    init_logging();
    let cell = StateCell::new("acc", TensorValue::scalar_f64(0.0));
    let c = cell.clone();
    let mut f = CompiledFunction::new(move |ctx, args| {
        let next = ctx.add(&args[0], &TensorValue::scalar_f64(1.0).into())?;
        ctx.cell_write(&c, &next)?;
        // Trace error after the write was recorded.
        let flag = ctx.gt(&next, &TensorValue::scalar_f64(0.0).into())?;
        let _ = flag.as_bool()?;
        Ok(vec![next])
    });
    assert!(f.call(&[TensorValue::scalar_f64(5.0)]).is_err());
    assert_eq!(cell.value(), TensorValue::scalar_f64(0.0));
    assert_eq!(cell.version(), 0);
}

#[test]
fn test_traced_write_rejects_shape_change() {
    init_logging();
    let cell = StateCell::new("vec", TensorValue::vector_f64(&[0.0, 0.0]));
    let c = cell.clone();
    let mut f = CompiledFunction::new(move |ctx, args| {
        // args[0] is a scalar; the cell holds a vector.
        ctx.cell_write(&c, &args[0])?;
        Ok(vec![])
    });
    let err = f.call(&[TensorValue::scalar_f64(1.0)]).unwrap_err();
    match err {
        TraceError::ShapeMismatch { context, .. } => assert!(context.contains("'vec'")),
        other => panic!("expected ShapeMismatch, got {other}"),
    }
}
