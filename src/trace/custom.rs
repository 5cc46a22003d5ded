// This module implements user-registered operators: named kernels a traced
// program can invoke without the built-in op set growing a variant per user
// need. A CustomOp couples a signature function (input layouts -> output
// layouts, evaluated at trace time so replay never re-infers shapes) with a
// kernel over concrete tensors. Dispatch matches the built-in ops: all-concrete
// operands run the kernel immediately, any abstract operand records a Custom
// node the executor invokes at replay. Kernel outputs are checked against the
// declared signature in both paths; a kernel that misreports its layout is a
// reported error, not a silent corruption of downstream shapes.

//! User-registered operators.
//!
//! A [`CustomOp`] extends the traceable op set with a named kernel. Register
//! once, then invoke through [`TraceContext::custom`] in eager or traced code.

use std::fmt;
use std::rc::Rc;

use super::dispatch::check_outputs_match;
use super::graph::{OpKind, ValueSig};
use super::tracer::{TraceContext, TraceValue};
use crate::core::error::TraceResult;
use crate::tensor::TensorValue;

/// A named kernel with a trace-time signature function.
pub struct CustomOp {
    name: String,
    signature: Box<dyn Fn(&[ValueSig]) -> TraceResult<Vec<ValueSig>>>,
    kernel: Box<dyn Fn(&[TensorValue]) -> TraceResult<Vec<TensorValue>>>,
}

impl CustomOp {
    /// Register an operator. `signature` maps input layouts to output layouts
    /// and is consulted at trace time; `kernel` computes concrete outputs.
    pub fn new<S, K>(name: impl Into<String>, signature: S, kernel: K) -> Rc<CustomOp>
    where
        S: Fn(&[ValueSig]) -> TraceResult<Vec<ValueSig>> + 'static,
        K: Fn(&[TensorValue]) -> TraceResult<Vec<TensorValue>> + 'static,
    {
        Rc::new(CustomOp {
            name: name.into(),
            signature: Box::new(signature),
            kernel: Box::new(kernel),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn out_sigs(&self, inputs: &[ValueSig]) -> TraceResult<Vec<ValueSig>> {
        (self.signature)(inputs)
    }

    /// Run the kernel and hold it to its declared signature.
    pub(crate) fn run(&self, inputs: &[TensorValue]) -> TraceResult<Vec<TensorValue>> {
        let in_sigs: Vec<ValueSig> = inputs.iter().map(ValueSig::of).collect();
        let expected = self.out_sigs(&in_sigs)?;
        let outputs = (self.kernel)(inputs)?;
        let found: Vec<ValueSig> = outputs.iter().map(ValueSig::of).collect();
        check_outputs_match(&format!("custom op '{}'", self.name), &expected, &found)?;
        Ok(outputs)
    }
}

impl fmt::Debug for CustomOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomOp").field("name", &self.name).finish()
    }
}

impl<'t> TraceContext<'t> {
    /// Invoke a registered operator over possibly-traced operands.
    ///
    /// All-concrete operands run the kernel immediately, even inside a trace;
    /// any abstract operand records the invocation for replay.
    pub fn custom(
        &mut self,
        op: &Rc<CustomOp>,
        operands: &[TraceValue],
    ) -> TraceResult<Vec<TraceValue>> {
        if operands.iter().all(|o| o.is_concrete()) {
            let ins: Vec<TensorValue> = operands
                .iter()
                .filter_map(|o| o.concrete().cloned())
                .collect();
            return Ok(op
                .run(&ins)?
                .into_iter()
                .map(TraceValue::Concrete)
                .collect());
        }
        let context = format!("custom op '{}'", op.name());
        let in_sigs: Vec<ValueSig> = operands.iter().map(|o| o.sig()).collect();
        let out_sigs = op.out_sigs(&in_sigs)?;
        let refs = operands
            .iter()
            .map(|o| self.operand(o, &context))
            .collect::<TraceResult<Vec<_>>>()?;
        let tracer = self.tracer_mut(&context)?;
        let node = tracer.push(
            OpKind::Custom {
                op: op.clone(),
                operands: refs,
            },
            out_sigs.clone(),
        );
        Ok(out_sigs
            .iter()
            .enumerate()
            .map(|(k, sig)| tracer.abstract_out(node, k, sig))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::TraceError;
    use crate::tensor::DType;

    fn sum_sq() -> Rc<CustomOp> {
        CustomOp::new(
            "sum_sq",
            |ins: &[ValueSig]| {
                Ok(vec![ValueSig {
                    shape: vec![],
                    dtype: ins[0].dtype,
                }])
            },
            |ins: &[TensorValue]| {
                let TensorValue::F64(a) = &ins[0] else {
                    return Err(TraceError::InvalidValue {
                        reason: "sum_sq wants an f64 tensor".into(),
                    });
                };
                Ok(vec![TensorValue::scalar_f64(a.iter().map(|x| x * x).sum())])
            },
        )
    }

    #[test]
    fn test_eager_custom_runs_immediately() {
        let mut ctx = TraceContext::eager();
        let out = ctx
            .custom(&sum_sq(), &[TensorValue::vector_f64(&[3.0, 4.0]).into()])
            .unwrap();
        assert_eq!(out[0].concrete(), Some(&TensorValue::scalar_f64(25.0)));
    }

    #[test]
    fn test_kernel_held_to_declared_signature() {
        let misreporting = CustomOp::new(
            "misreporting",
            |_ins: &[ValueSig]| {
                Ok(vec![ValueSig {
                    shape: vec![],
                    dtype: DType::F64,
                }])
            },
            |_ins: &[TensorValue]| Ok(vec![TensorValue::vector_f64(&[1.0])]),
        );
        let mut ctx = TraceContext::eager();
        let err = ctx
            .custom(&misreporting, &[TensorValue::scalar_f64(0.0).into()])
            .unwrap_err();
        assert!(matches!(err, TraceError::ShapeMismatch { .. }));
    }
}
