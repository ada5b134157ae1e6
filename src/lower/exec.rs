//! Reference executor for lowered programs.
//!
//! Runs the layers of a [`BackendSpec`] using the evaluation kernels of the
//! operator registry. It stands in for a backend runtime in tests.

use std::error::Error;
use std::fmt;

use rustc_hash::FxHashMap;
use tracing::trace;

use super::{BackendSpec, Block, Layer};
use crate::op_registry::OpRegistry;
use crate::operator::{Arity, ErrorKind, EvalContext, EvalInput, OpError, Presence, SubgraphRunner};
use crate::value::Value;

/// Errors that occur when executing a lowered program.
#[derive(Clone, Debug, PartialEq)]
pub enum ExecError {
    /// No function with a given name exists in the spec.
    UnknownFunction(String),

    /// A layer's type does not name a registered operator.
    UnknownLayer(String),

    /// A layer references a value which has not been computed.
    MissingValue(String),

    /// The wrong number of inputs was passed to a function.
    InputCount { expected: usize, actual: usize },

    /// A constant's data does not match its shape.
    InvalidConstant(String),

    /// Evaluating a layer failed.
    Op { layer: String, error: OpError },
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Op { error, .. } => error.kind(),
            Self::InputCount { .. } => ErrorKind::ValueError,
            _ => ErrorKind::InvalidProgram,
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFunction(name) => write!(f, "unknown function \"{}\"", name),
            Self::UnknownLayer(ty) => write!(f, "unknown layer type \"{}\"", ty),
            Self::MissingValue(name) => write!(f, "value \"{}\" is not available", name),
            Self::InputCount { expected, actual } => {
                write!(f, "expected {} inputs but got {}", expected, actual)
            }
            Self::InvalidConstant(name) => write!(f, "constant \"{}\" is invalid", name),
            Self::Op { layer, error } => write!(f, "layer \"{}\" failed: {}", layer, error),
        }
    }
}

impl Error for ExecError {}

/// Named values computed while running a block. Lookups fall back to the
/// enclosing block's environment.
struct Env<'a> {
    parent: Option<&'a Env<'a>>,
    values: FxHashMap<String, Value>,
}

impl Env<'_> {
    fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .get(name)
            .or_else(|| self.parent.and_then(|parent| parent.get(name)))
    }
}

/// Runs the nested blocks of a layer.
struct BlockRunner<'a> {
    registry: &'a OpRegistry,
    blocks: &'a [Block],
    env: &'a Env<'a>,
}

impl SubgraphRunner for BlockRunner<'_> {
    fn run_subgraph(&self, index: usize, inputs: Vec<Value>) -> Result<Vec<Value>, OpError> {
        let block = self.blocks.get(index).ok_or_else(|| {
            OpError::NotEvaluable(format!("layer has no nested block {}", index))
        })?;
        run_block(self.registry, block, inputs, Some(self.env))
            .map_err(|err| OpError::NotEvaluable(err.to_string()))
    }
}

fn run_layer(registry: &OpRegistry, layer: &Layer, env: &Env) -> Result<Vec<Value>, ExecError> {
    let def = registry
        .get(&layer.layer_type)
        .ok_or_else(|| ExecError::UnknownLayer(layer.layer_type.clone()))?;

    // Parameters left out of decomposed layers take their default values.
    let defaults: Vec<(&str, Value)> = def
        .inputs()
        .iter()
        .filter(|spec| !layer.inputs.iter().any(|(param, _)| param == spec.name))
        .filter_map(|spec| match spec.presence {
            Presence::Default(value) => Some((spec.name, value.to_value())),
            _ => None,
        })
        .collect();

    let lookup = |name: &String| {
        env.get(name)
            .ok_or_else(|| ExecError::MissingValue(name.clone()))
    };
    let mut inputs = Vec::with_capacity(layer.inputs.len() + defaults.len());
    for (param, names) in &layer.inputs {
        let arity = def.input_spec(param).map(|spec| spec.arity);
        let input = match (arity, names.as_slice()) {
            (Some(Arity::Many), names) => {
                EvalInput::Many(names.iter().map(lookup).collect::<Result<_, _>>()?)
            }
            (_, [name]) => EvalInput::One(lookup(name)?),
            _ => {
                return Err(ExecError::Op {
                    layer: layer.name.clone(),
                    error: OpError::InvalidType(format!("{} should be a single value", param)),
                })
            }
        };
        inputs.push((param.as_str(), input));
    }
    for (param, value) in &defaults {
        inputs.push((*param, EvalInput::One(value)));
    }

    let runner = BlockRunner {
        registry,
        blocks: &layer.blocks,
        env,
    };
    let ctx = EvalContext::new(inputs, Some(&runner));
    let op_error = |error| ExecError::Op {
        layer: layer.name.clone(),
        error,
    };
    trace!(layer = layer.name.as_str(), "running layer");
    let outputs = def.eval(&ctx).map_err(op_error)?;
    if outputs.len() != layer.outputs.len() {
        return Err(op_error(OpError::NotEvaluable(format!(
            "expected {} outputs but got {}",
            layer.outputs.len(),
            outputs.len()
        ))));
    }

    outputs
        .into_iter()
        .zip(&layer.outputs)
        .map(|(value, spec)| {
            if spec.list || !value.is_tensor() || value.carrier() == spec.dtype.carrier() {
                Ok(value)
            } else {
                value.cast(spec.dtype).map_err(|err| op_error(err.into()))
            }
        })
        .collect()
}

fn run_block(
    registry: &OpRegistry,
    block: &Block,
    inputs: Vec<Value>,
    parent: Option<&Env>,
) -> Result<Vec<Value>, ExecError> {
    if inputs.len() != block.inputs.len() {
        return Err(ExecError::InputCount {
            expected: block.inputs.len(),
            actual: inputs.len(),
        });
    }
    let mut env = Env {
        parent,
        values: block.inputs.iter().cloned().zip(inputs).collect(),
    };

    for layer in &block.layers {
        let outputs = run_layer(registry, layer, &env)?;
        for (spec, value) in layer.outputs.iter().zip(outputs) {
            env.values.insert(spec.name.clone(), value);
        }
    }

    block
        .outputs
        .iter()
        .map(|name| {
            env.get(name)
                .cloned()
                .ok_or_else(|| ExecError::MissingValue(name.clone()))
        })
        .collect()
}

/// Run a function of a lowered program with the given input values.
pub fn execute(
    spec: &BackendSpec,
    function: &str,
    inputs: Vec<Value>,
) -> Result<Vec<Value>, ExecError> {
    let func = spec
        .function(function)
        .ok_or_else(|| ExecError::UnknownFunction(function.to_string()))?;

    let mut constants = FxHashMap::default();
    for (name, data) in &func.constants {
        let value = data
            .to_value()
            .ok_or_else(|| ExecError::InvalidConstant(name.clone()))?;
        constants.insert(name.clone(), value);
    }
    let root = Env {
        parent: None,
        values: constants,
    };
    run_block(OpRegistry::global(), &func.block, inputs, Some(&root))
}

#[cfg(test)]
mod tests {
    use rten_tensor::Tensor;

    use super::{execute, ExecError};
    use crate::builder::Builder;
    use crate::graph::Program;
    use crate::lower::{lower_program, Backend, LowerOptions};
    use crate::types::{tensor_type, DType};
    use crate::value::Value;

    #[test]
    fn test_execute_matches_folding() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        mb.function("main", [("x", tensor_type([4], DType::Fp32))], |mb, x| {
            let y = mb.op("relu6").arg("x", x[0]).build1()?;
            let z = mb.op("exp2").arg("x", y).build1()?;
            Ok(vec![z])
        })
        .unwrap();

        let options = LowerOptions {
            skip_unsupported: false,
        };
        let input = Value::from(Tensor::from([-1., 0.5, 2., 8.]));
        let mut results = Vec::new();
        for backend in [Backend::MilProto, Backend::NnProto] {
            let spec = lower_program(&program, backend, &options).unwrap();
            let outputs = execute(&spec, "main", vec![input.clone()]).unwrap();
            results.push(outputs[0].to_f32_vec().unwrap());
        }

        let expected = [1., 2f32.powf(0.5), 4., 64.];
        for result in results {
            mil_testing::assert_close(&result, &expected, 1e-4, 1e-5);
        }
    }

    #[test]
    fn test_execute_errors() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        mb.function("main", [("x", tensor_type([2], DType::Fp32))], |mb, x| {
            Ok(vec![mb.op("relu").arg("x", x[0]).build1()?])
        })
        .unwrap();
        let spec = lower_program(&program, Backend::MilProto, &LowerOptions::default()).unwrap();

        assert_eq!(
            execute(&spec, "other", vec![]),
            Err(ExecError::UnknownFunction("other".into()))
        );
        assert_eq!(
            execute(&spec, "main", vec![]),
            Err(ExecError::InputCount {
                expected: 1,
                actual: 0
            })
        );
    }
}
