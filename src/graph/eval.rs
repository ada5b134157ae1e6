use rustc_hash::FxHashMap;
use tracing::trace;

use super::{Binding, FunctionId, Program, VarId};
use crate::op_registry::OpRegistry;
use crate::operator::{EvalContext, EvalInput, OpError, SubgraphRunner};
use crate::types::ValueType;
use crate::value::Value;

/// Values of variables computed while running a function.
///
/// Environments are arranged in a hierarchy matching the nesting of
/// functions. Lookups which fail in one environment continue in the parent,
/// and finally fall back to the values recorded on the variables when the
/// program was built.
pub struct ValueEnv<'a> {
    parent: Option<&'a ValueEnv<'a>>,
    values: FxHashMap<VarId, Value>,
}

impl<'a> ValueEnv<'a> {
    pub fn new(parent: Option<&'a ValueEnv<'a>>) -> ValueEnv<'a> {
        ValueEnv {
            parent,
            values: FxHashMap::default(),
        }
    }

    pub fn insert(&mut self, var: VarId, value: Value) {
        self.values.insert(var, value);
    }

    fn get(&self, var: VarId) -> Option<&Value> {
        self.values
            .get(&var)
            .or_else(|| self.parent.and_then(|parent| parent.get(var)))
    }

    /// Look up the value of `var` in this environment or its ancestors, or
    /// in the program.
    pub fn lookup<'p>(&'p self, program: &'p Program, var: VarId) -> Option<&'p Value> {
        self.get(var).or_else(|| program.var(var).value())
    }
}

/// Runs the nested functions of an operation using the values of an
/// enclosing environment for captured variables.
struct FunctionRunner<'a> {
    program: &'a Program,
    registry: &'a OpRegistry,
    functions: &'a [FunctionId],
    env: &'a ValueEnv<'a>,
}

impl SubgraphRunner for FunctionRunner<'_> {
    fn run_subgraph(&self, index: usize, inputs: Vec<Value>) -> Result<Vec<Value>, OpError> {
        let function = self.functions.get(index).copied().ok_or_else(|| {
            OpError::NotEvaluable(format!("operation has no nested function {}", index))
        })?;
        run_function(self.program, self.registry, function, inputs, Some(self.env))
    }
}

/// Resolve the concrete values bound to each parameter, or return `None` if
/// any of them is unknown.
fn resolve_inputs<'a>(
    program: &'a Program,
    env: &'a ValueEnv<'a>,
    inputs: &'a [(String, Binding)],
) -> Option<Vec<(&'a str, EvalInput<'a>)>> {
    inputs
        .iter()
        .map(|(name, binding)| {
            let input = match binding {
                Binding::Var(var) => EvalInput::One(env.lookup(program, *var)?),
                Binding::List(vars) => EvalInput::Many(
                    vars.iter()
                        .map(|var| env.lookup(program, *var))
                        .collect::<Option<Vec<_>>>()?,
                ),
            };
            Some((name.as_str(), input))
        })
        .collect()
}

/// Return true if every variable captured by `functions` has a value.
fn captures_known(program: &Program, env: &ValueEnv, functions: &[FunctionId]) -> bool {
    functions.iter().all(|function| {
        program
            .func(*function)
            .captures()
            .iter()
            .all(|var| env.lookup(program, *var).is_some())
    })
}

/// Try to compute the outputs of an operation from concrete inputs.
///
/// Returns `Ok(None)` if an input or captured variable is unknown, or the
/// operator declines to fold with these inputs.
pub fn fold_operation(
    program: &Program,
    registry: &OpRegistry,
    op_type: &str,
    inputs: &[(String, Binding)],
    functions: &[FunctionId],
    env: &ValueEnv,
) -> Result<Option<Vec<Value>>, OpError> {
    evaluate(program, registry, op_type, inputs, functions, env, true)
}

fn evaluate(
    program: &Program,
    registry: &OpRegistry,
    op_type: &str,
    inputs: &[(String, Binding)],
    functions: &[FunctionId],
    env: &ValueEnv,
    folding: bool,
) -> Result<Option<Vec<Value>>, OpError> {
    let Some(def) = registry.get(op_type) else {
        return Err(OpError::NotEvaluable(format!("unknown operator {}", op_type)));
    };
    let Some(values) = resolve_inputs(program, env, inputs) else {
        return Ok(None);
    };
    if !captures_known(program, env, functions) {
        return Ok(None);
    }

    let runner = FunctionRunner {
        program,
        registry,
        functions,
        env,
    };
    let ctx = EvalContext::new(values, Some(&runner));
    if folding && !def.can_fold(&ctx) {
        return Ok(None);
    }
    if folding {
        trace!(op_type, "folding operation");
    }
    def.eval(&ctx).map(Some)
}

/// Convert evaluated values to the carriers of the declared output types.
pub fn conform_values(values: Vec<Value>, types: &[ValueType]) -> Result<Vec<Value>, OpError> {
    if values.len() != types.len() {
        return Err(OpError::NotEvaluable(format!(
            "expected {} outputs but evaluation produced {}",
            types.len(),
            values.len()
        )));
    }
    values
        .into_iter()
        .zip(types)
        .map(|(value, ty)| match (&value, ty) {
            (Value::List(_), _) | (_, ValueType::List(_)) => Ok(value),
            (_, ValueType::Tensor(tensor)) if value.carrier() == tensor.dtype.carrier() => {
                Ok(value)
            }
            (_, ValueType::Tensor(tensor)) => Ok(value.cast(tensor.dtype)?),
        })
        .collect()
}

/// Run a function with concrete values for its placeholders.
///
/// Variables captured from enclosing functions are resolved from `parent`
/// or from their build-time values.
pub fn run_function(
    program: &Program,
    registry: &OpRegistry,
    function: FunctionId,
    inputs: Vec<Value>,
    parent: Option<&ValueEnv>,
) -> Result<Vec<Value>, OpError> {
    let func = program.func(function);
    if inputs.len() != func.placeholders().len() {
        return Err(OpError::InvalidValue(format!(
            "function {} expects {} inputs but got {}",
            func.name(),
            func.placeholders().len(),
            inputs.len()
        )));
    }

    let mut env = ValueEnv::new(parent);
    for (var, value) in func.placeholders().iter().zip(inputs) {
        env.insert(*var, value);
    }

    for op_id in func.ops() {
        let op = program.op(*op_id);
        if op
            .outputs()
            .iter()
            .all(|var| program.var(*var).value().is_some())
        {
            continue;
        }

        let outputs = evaluate(
            program,
            registry,
            op.op_type(),
            op.inputs(),
            op.functions(),
            &env,
            false,
        )?
        .ok_or_else(|| {
            OpError::NotEvaluable(format!("inputs of {} are not available", op.name()))
        })?;
        let types: Vec<ValueType> = op
            .outputs()
            .iter()
            .map(|var| program.var(*var).ty().clone())
            .collect();
        let outputs = conform_values(outputs, &types)?;
        for (var, value) in op.outputs().iter().zip(outputs) {
            env.insert(*var, value);
        }
    }

    func.outputs()
        .iter()
        .map(|var| {
            env.lookup(program, *var).cloned().ok_or_else(|| {
                OpError::NotEvaluable(format!(
                    "output {} of {} has no value",
                    program.var(*var).name(),
                    func.name()
                ))
            })
        })
        .collect()
}
