use tracing::trace;

use crate::env::max_loop_iterations;
use crate::lower::{LowerContext, LowerError};
use crate::operator::{
    ControlFlowOp, EvalContext, InferContext, InputSpec, OpDef, OpError, TypeDomain,
};
use crate::ops::op_inputs;
use crate::types::{DType, ValueType};
use crate::value::Value;

/// Lower an operation's nested functions into blocks attached to a single
/// layer.
fn lower_with_blocks(ctx: &mut LowerContext) -> Result<(), LowerError> {
    let functions = ctx.op().functions().to_vec();
    let blocks = functions
        .into_iter()
        .map(|function| ctx.lower_function(function))
        .collect::<Result<Vec<_>, _>>()?;
    ctx.emit_with_blocks(blocks)
}

/// Run one of two branch functions depending on a predicate.
#[derive(Debug, Default)]
pub struct Cond {}

impl ControlFlowOp for Cond {
    fn function_roles(&self) -> &'static [&'static str] {
        &["true_fn", "false_fn"]
    }
}

impl OpDef for Cond {
    fn name(&self) -> &'static str {
        "cond"
    }

    op_inputs!(InputSpec::boolean("pred"));

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let true_types = ctx.function_output_types(0)?;
        let false_types = ctx.function_output_types(1)?;
        if true_types.len() != false_types.len() {
            return Err(OpError::InvalidType(format!(
                "branches of cond return {} and {} values",
                true_types.len(),
                false_types.len()
            )));
        }
        true_types
            .iter()
            .zip(&false_types)
            .map(|(t, f)| {
                t.merge(f).ok_or_else(|| {
                    OpError::InvalidType(format!(
                        "branches of cond return {} and {}",
                        t, f
                    ))
                })
            })
            .collect()
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let branch = if ctx.bool("pred")? { 0 } else { 1 };
        ctx.run_subgraph(branch, Vec::new())
    }

    fn lower(&self, ctx: &mut LowerContext) -> Result<(), LowerError> {
        lower_with_blocks(ctx)
    }

    fn as_control_flow(&self) -> Option<&dyn ControlFlowOp> {
        Some(self)
    }
}

/// Run a body function while a condition function returns true.
///
/// The loop variables are threaded through both functions. Evaluation stops
/// with an error after [`max_loop_iterations`] iterations.
#[derive(Debug, Default)]
pub struct WhileLoop {}

impl ControlFlowOp for WhileLoop {
    fn function_roles(&self) -> &'static [&'static str] {
        &["cond", "body"]
    }
}

impl OpDef for WhileLoop {
    fn name(&self) -> &'static str {
        "while_loop"
    }

    op_inputs!(InputSpec::new("loop_vars").domain(TypeDomain::Any).many());

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let cond_types = ctx.function_output_types(0)?;
        match cond_types.as_slice() {
            [ValueType::Tensor(ty)] if ty.dtype == DType::Bool && ty.shape.is_scalar() => {}
            _ => {
                return Err(OpError::InvalidType(
                    "while_loop condition should return a bool scalar".to_string(),
                ))
            }
        }

        let loop_vars = ctx.vars("loop_vars")?;
        let body_types = ctx.function_input_types(1)?;
        if loop_vars.len() != body_types.len() {
            return Err(OpError::InvalidValue(format!(
                "while_loop has {} loop variables but the body takes {}",
                loop_vars.len(),
                body_types.len()
            )));
        }
        Ok(body_types)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let mut vars: Vec<Value> = ctx.values("loop_vars")?.into_iter().cloned().collect();
        let max_iterations = max_loop_iterations();
        let mut iterations = 0;
        loop {
            let pred = ctx.run_subgraph(0, vars.clone())?;
            let pred = match pred.as_slice() {
                [pred] => pred.scalar_bool()?,
                _ => {
                    return Err(OpError::InvalidValue(
                        "while_loop condition should return one value".to_string(),
                    ))
                }
            };
            if !pred {
                break;
            }
            if iterations == max_iterations {
                return Err(OpError::InvalidValue(format!(
                    "while_loop did not finish within {} iterations",
                    max_iterations
                )));
            }
            vars = ctx.run_subgraph(1, vars)?;
            iterations += 1;
        }
        trace!(iterations, "while_loop finished");
        Ok(vars)
    }

    fn lower(&self, ctx: &mut LowerContext) -> Result<(), LowerError> {
        lower_with_blocks(ctx)
    }

    fn as_control_flow(&self) -> Option<&dyn ControlFlowOp> {
        Some(self)
    }
}

/// Return the input unchanged.
#[derive(Debug, Default)]
pub struct Identity {}

impl OpDef for Identity {
    fn name(&self) -> &'static str {
        "identity"
    }

    op_inputs!(InputSpec::new("x").domain(TypeDomain::Any));

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        Ok([ctx.ty("x")?.clone()].into())
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        Ok([ctx.value("x")?.clone()].into())
    }
}

/// A value known when the program is built.
///
/// [`Builder::constant`](crate::Builder::constant) adds these with the value
/// stored on the operation. They can also be added like any other operator,
/// with the value passed as `val`.
#[derive(Debug, Default)]
pub struct Const {}

impl OpDef for Const {
    fn name(&self) -> &'static str {
        "const"
    }

    op_inputs!(InputSpec::new("val").domain(TypeDomain::Any).constant());

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        Ok([ctx.ty("val")?.clone()].into())
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        Ok([ctx.value("val")?.clone()].into())
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::Tensor;

    use crate::builder::Builder;
    use crate::graph::{BuildError, Program};
    use crate::operator::ErrorKind;
    use crate::types::{tensor_type, DType, TensorType, ValueType};
    use crate::value::Value;

    #[test]
    fn test_cond_folds_taken_branch() {
        for (pred, expected) in [(true, 2f32), (false, -2f32)] {
            let mut program = Program::new();
            let mut mb = Builder::new(&mut program);
            let mut result = None;
            mb.function("main", Vec::<(&str, ValueType)>::new(), |mb, _| {
                let x = mb.constant(1f32)?;
                let outputs = mb.cond(
                    pred,
                    |mb| Ok(vec![mb.op("add").arg("x", x).arg("y", 1f32).build1()?]),
                    |mb| Ok(vec![mb.op("sub").arg("x", x).arg("y", 3f32).build1()?]),
                )?;
                result = mb.value(outputs[0]).cloned();
                Ok(outputs)
            })
            .unwrap();
            assert_eq!(result, Some(Value::from(expected)));
        }
    }

    #[test]
    fn test_cond_merges_branch_shapes() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut ty = None;
        mb.function(
            "main",
            [
                ("pred", TensorType::scalar(DType::Bool)),
                ("x", tensor_type([2, 3], DType::Fp32)),
            ],
            |mb, inputs| {
                let x = inputs[1];
                let outputs = mb.cond(
                    inputs[0],
                    |mb| Ok(vec![mb.op("relu").arg("x", x).build1()?]),
                    |mb| {
                        Ok(vec![mb
                            .op("reduce_sum")
                            .arg("x", x)
                            .arg("axes", [1])
                            .arg("keep_dims", true)
                            .build1()?])
                    },
                )?;
                ty = Some(mb.ty(outputs[0]).clone());
                Ok(outputs)
            },
        )
        .unwrap();

        let ty = ty.unwrap();
        let shape = &ty.as_tensor().unwrap().shape;
        assert_eq!(shape.dim(0).and_then(|d| d.fixed()), Some(2));
        assert!(shape.dim(1).unwrap().is_symbolic());
    }

    #[test]
    fn test_cond_branch_dtype_mismatch() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let err = mb
            .function("main", [("pred", TensorType::scalar(DType::Bool))], |mb, inputs| {
                mb.cond(
                    inputs[0],
                    |mb| Ok(vec![mb.constant(1f32)?]),
                    |mb| Ok(vec![mb.constant(1)?]),
                )
            })
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::BranchMismatch(_)));
        assert_eq!(err.kind(), ErrorKind::TypeError);
    }

    #[test]
    fn test_while_loop_folds() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut result = Vec::new();
        mb.function("main", Vec::<(&str, ValueType)>::new(), |mb, _| {
            let outputs = mb.while_loop(
                |mb, vars| mb.op("less").arg("x", vars[0]).arg("y", 5).build1(),
                |mb, vars| {
                    let i = mb.op("add").arg("x", vars[0]).arg("y", 1).build1()?;
                    let acc = mb.op("mul").arg("x", vars[1]).arg("y", 2f32).build1()?;
                    Ok(vec![i, acc])
                },
                vec![Value::from(0), Value::from(1f32)],
            )?;
            result = outputs.iter().map(|out| mb.value(*out).cloned()).collect();
            Ok(outputs)
        })
        .unwrap();
        assert_eq!(result, [Some(Value::from(5)), Some(Value::from(32f32))]);
    }

    #[test]
    fn test_while_loop_with_dynamic_input() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut ty = None;
        mb.function("main", [("x", tensor_type([1], DType::Fp32))], |mb, inputs| {
            let outputs = mb.while_loop(
                |mb, vars| {
                    let n = mb.op("shape").arg("x", vars[0]).build1()?;
                    let n = mb.op("reduce_sum").arg("x", n).build1()?;
                    mb.op("less").arg("x", n).arg("y", 8).build1()
                },
                |mb, vars| {
                    let doubled = mb
                        .op("concat")
                        .arg("values", [vars[0], vars[0]])
                        .arg("axis", 0)
                        .build1()?;
                    Ok(vec![doubled])
                },
                inputs[0],
            )?;
            ty = Some(mb.ty(outputs[0]).clone());
            Ok(outputs)
        })
        .unwrap();

        // The loop changes the size of the loop variable, so its type is
        // widened to a symbolic dim.
        let ty = ty.unwrap();
        assert!(ty.as_tensor().unwrap().shape.dim(0).unwrap().is_symbolic());
        assert_eq!(program.func(program.function_id("main").unwrap()).ops().len(), 1);
    }

    #[test]
    fn test_identity_and_const() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut values = Vec::new();
        mb.function("main", Vec::<(&str, ValueType)>::new(), |mb, _| {
            let c = mb.op("const").arg("val", Tensor::from([1, 2])).build1()?;
            let y = mb.op("identity").arg("x", c).build1()?;
            values.push(mb.value(y).cloned());
            Ok(vec![y])
        })
        .unwrap();
        assert_eq!(values, [Some(Value::from(vec![1, 2]))]);
    }
}
