//! Translation of programs into backend-specific layer lists.
//!
//! A closed [`Program`] is lowered to a [`BackendSpec`]: for each top-level
//! function, a table of constants and a block of layers. Operations whose
//! outputs were computed when building become constants. Every other
//! operation is translated by its [`OpDef::lower`] method, except that the
//! `nn_proto` backend first rewrites operations missing from its legacy
//! layer set into sequences of primitive layers.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::env::{env_flag, SKIP_UNSUPPORTED};
use crate::graph::{Binding, FunctionId, Operation, Program};
use crate::op_registry::OpRegistry;
use crate::operator::{ErrorKind, OpDef};
use crate::types::ValueType;
use crate::value::Value;

mod exec;
mod nn;
mod spec;

pub use exec::{execute, ExecError};
pub use spec::{BackendSpec, Block, ConstData, FunctionSpec, IoSpec, Layer, SkippedOp};

/// Target of lowering.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Legacy neural network layer set.
    NnProto,

    /// Program format with one layer per operation.
    MilProto,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::NnProto => "nn_proto",
            Backend::MilProto => "mil_proto",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Backend {
    type Err = LowerError;

    fn from_str(s: &str) -> Result<Backend, LowerError> {
        match s {
            "nn_proto" => Ok(Backend::NnProto),
            "mil_proto" => Ok(Backend::MilProto),
            _ => Err(LowerError::UnknownBackend(s.to_string())),
        }
    }
}

/// Errors that occur when lowering a program.
#[derive(Clone, Debug, PartialEq)]
pub enum LowerError {
    /// The operation is valid but the backend cannot express it.
    UnsupportedOnBackend {
        backend: Backend,
        op_type: String,
        reason: String,
    },

    /// A function has not been closed.
    FunctionOpen(String),

    /// The backend name is not recognized.
    UnknownBackend(String),
}

impl LowerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedOnBackend { .. } => ErrorKind::UnsupportedOnBackend,
            Self::FunctionOpen(_) => ErrorKind::InvalidProgram,
            Self::UnknownBackend(_) => ErrorKind::ValueError,
        }
    }
}

impl fmt::Display for LowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedOnBackend {
                backend,
                op_type,
                reason,
            } => write!(f, "{} is not supported on {}: {}", op_type, backend, reason),
            Self::FunctionOpen(name) => write!(f, "function \"{}\" is still open", name),
            Self::UnknownBackend(name) => write!(f, "unknown backend \"{}\"", name),
        }
    }
}

impl Error for LowerError {}

/// Options that control lowering.
#[derive(Clone, Debug)]
pub struct LowerOptions {
    /// Leave out operations the backend cannot express, recording them in
    /// [`BackendSpec::skipped`], instead of failing. Defaults to the
    /// `MIL_SKIP_UNSUPPORTED` environment variable, or off.
    pub skip_unsupported: bool,
}

impl Default for LowerOptions {
    fn default() -> LowerOptions {
        LowerOptions {
            skip_unsupported: env_flag(SKIP_UNSUPPORTED, false),
        }
    }
}

/// State shared by the lowering of one top-level function and the
/// functions nested inside it.
struct LowerState<'p> {
    program: &'p Program,
    registry: &'p OpRegistry,
    backend: Backend,
    options: &'p LowerOptions,
    function_name: &'p str,
    constants: BTreeMap<String, ConstData>,
    skipped: Vec<SkippedOp>,
    tmp_count: usize,
}

/// Context passed to [`OpDef::lower`] for one operation.
pub struct LowerContext<'a, 'p> {
    state: &'a mut LowerState<'p>,
    op: &'p Operation,
    layers: Vec<Layer>,
}

impl<'p> LowerContext<'_, 'p> {
    pub fn backend(&self) -> Backend {
        self.state.backend
    }

    pub fn program(&self) -> &'p Program {
        self.state.program
    }

    /// The operation being lowered.
    pub fn op(&self) -> &'p Operation {
        self.op
    }

    /// Return the names of the values bound to a parameter.
    pub fn input_names(&self, param: &str) -> Vec<String> {
        self.op
            .input(param)
            .map(|binding| {
                binding
                    .vars()
                    .iter()
                    .map(|var| self.state.program.var(*var).name().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Return the name of the value bound to a single-valued parameter.
    pub fn input_name(&self, param: &str) -> Result<String, LowerError> {
        match self.op.input(param) {
            Some(Binding::Var(var)) => Ok(self.state.program.var(*var).name().to_string()),
            _ => Err(self.unsupported(&format!("parameter {} is not a single value", param))),
        }
    }

    /// Return the type of a single-valued parameter, if it is bound.
    pub fn input_type(&self, param: &str) -> Option<&'p ValueType> {
        match self.op.input(param) {
            Some(Binding::Var(var)) => Some(self.state.program.var(*var).ty()),
            _ => None,
        }
    }

    /// Return the value of a parameter if it was known when building.
    pub fn const_value(&self, param: &str) -> Option<&'p Value> {
        match self.op.input(param) {
            Some(Binding::Var(var)) => self.state.program.var(*var).value(),
            _ => None,
        }
    }

    /// Return the names and types of the operation's outputs.
    pub fn output_specs(&self) -> Vec<IoSpec> {
        self.op
            .outputs()
            .iter()
            .map(|var| {
                let var = self.state.program.var(*var);
                IoSpec::new(var.name(), var.ty())
            })
            .collect()
    }

    fn default_layer(&self) -> Layer {
        Layer {
            layer_type: self.op.op_type().to_string(),
            name: self.op.name().to_string(),
            inputs: self
                .op
                .inputs()
                .iter()
                .map(|(param, _)| (param.clone(), self.input_names(param)))
                .collect(),
            outputs: self.output_specs(),
            attrs: BTreeMap::new(),
            blocks: Vec::new(),
        }
    }

    /// Emit a single layer of the operation's own type with the same
    /// inputs and outputs.
    pub fn emit_default(&mut self) -> Result<(), LowerError> {
        let layer = self.default_layer();
        self.layers.push(layer);
        Ok(())
    }

    /// Emit a single layer with nested blocks, for control flow.
    pub fn emit_with_blocks(&mut self, blocks: Vec<Block>) -> Result<(), LowerError> {
        let mut layer = self.default_layer();
        layer.blocks = blocks;
        self.layers.push(layer);
        Ok(())
    }

    /// Emit a layer of another operator type.
    ///
    /// Layers emitted while decomposing an operation are tagged with the
    /// name of that operation.
    pub fn emit(
        &mut self,
        layer_type: &str,
        inputs: &[(&str, &str)],
        outputs: Vec<IoSpec>,
    ) -> Result<(), LowerError> {
        let name = self.tmp_name(layer_type);
        let mut attrs = BTreeMap::new();
        attrs.insert(
            "decomposed_from".to_string(),
            serde_json::Value::String(self.op.name().to_string()),
        );
        self.layers.push(Layer {
            layer_type: layer_type.to_string(),
            name,
            inputs: inputs
                .iter()
                .map(|(param, value)| (param.to_string(), vec![value.to_string()]))
                .collect(),
            outputs,
            attrs,
            blocks: Vec::new(),
        });
        Ok(())
    }

    /// Add a constant to the function's constant table and return its name.
    pub fn add_const(&mut self, value: Value) -> String {
        let name = self.tmp_name("const");
        let dtype = value.dtype();
        self.state
            .constants
            .insert(name.clone(), ConstData::from_value(&value, dtype));
        name
    }

    /// Generate a unique name for a value or layer created while lowering
    /// the current operation.
    pub fn tmp_name(&mut self, suffix: &str) -> String {
        let name = format!("{}_{}_{}", self.op.name(), suffix, self.state.tmp_count);
        self.state.tmp_count += 1;
        name
    }

    /// Lower a function nested in the current operation into a block.
    pub fn lower_function(&mut self, function: FunctionId) -> Result<Block, LowerError> {
        lower_block(self.state, function)
    }

    /// Create an error reporting that the current operation cannot be
    /// lowered.
    pub fn unsupported(&self, reason: &str) -> LowerError {
        LowerError::UnsupportedOnBackend {
            backend: self.state.backend,
            op_type: self.op.op_type().to_string(),
            reason: reason.to_string(),
        }
    }
}

fn lower_op<'p>(
    state: &mut LowerState<'p>,
    def: &dyn OpDef,
    op: &'p Operation,
) -> Result<Vec<Layer>, LowerError> {
    let backend = state.backend;
    let mut ctx = LowerContext {
        state,
        op,
        layers: Vec::new(),
    };
    match backend {
        Backend::NnProto => nn::lower_op(def, &mut ctx)?,
        Backend::MilProto => def.lower(&mut ctx)?,
    }
    Ok(ctx.layers)
}

fn lower_block<'p>(state: &mut LowerState<'p>, function: FunctionId) -> Result<Block, LowerError> {
    let program = state.program;
    let registry = state.registry;
    let func = program.func(function);
    let mut block = Block {
        inputs: func
            .placeholders()
            .iter()
            .map(|var| program.var(*var).name().to_string())
            .collect(),
        layers: Vec::new(),
        outputs: func
            .outputs()
            .iter()
            .map(|var| program.var(*var).name().to_string())
            .collect(),
    };

    for op_id in func.ops() {
        let op = program.op(*op_id);
        let known: Option<Vec<_>> = op
            .outputs()
            .iter()
            .map(|var| program.var(*var).value().map(|value| (var, value)))
            .collect();
        if let Some(known) = known {
            for (var, value) in known {
                let var = program.var(*var);
                state.constants.insert(
                    var.name().to_string(),
                    ConstData::from_value(value, var.ty().dtype()),
                );
            }
            continue;
        }

        let result = match registry.get(op.op_type()) {
            Some(def) => lower_op(state, def, op),
            None => Err(LowerError::UnsupportedOnBackend {
                backend: state.backend,
                op_type: op.op_type().to_string(),
                reason: "operator is not registered".to_string(),
            }),
        };
        match result {
            Ok(layers) => block.layers.extend(layers),
            Err(LowerError::UnsupportedOnBackend { reason, .. })
                if state.options.skip_unsupported =>
            {
                warn!(
                    backend = %state.backend,
                    op = op.name(),
                    op_type = op.op_type(),
                    reason = reason.as_str(),
                    "skipping unsupported operation"
                );
                state.skipped.push(SkippedOp {
                    function: state.function_name.to_string(),
                    op_name: op.name().to_string(),
                    op_type: op.op_type().to_string(),
                    reason,
                });
            }
            Err(err) => return Err(err),
        }
    }

    Ok(block)
}

fn lower_function(
    program: &Program,
    registry: &OpRegistry,
    backend: Backend,
    options: &LowerOptions,
    name: &str,
    function: FunctionId,
) -> Result<(FunctionSpec, Vec<SkippedOp>), LowerError> {
    let mut state = LowerState {
        program,
        registry,
        backend,
        options,
        function_name: name,
        constants: BTreeMap::new(),
        skipped: Vec::new(),
        tmp_count: 0,
    };
    let block = lower_block(&mut state, function)?;
    let inputs = program
        .func(function)
        .placeholders()
        .iter()
        .map(|var| {
            let var = program.var(*var);
            IoSpec::new(var.name(), var.ty())
        })
        .collect();
    debug!(
        function = name,
        %backend,
        layers = block.layers.len(),
        constants = state.constants.len(),
        "lowered function"
    );
    Ok((
        FunctionSpec {
            name: name.to_string(),
            inputs,
            constants: state.constants,
            block,
        },
        state.skipped,
    ))
}

/// Lower every top-level function of a closed program.
///
/// Functions are lowered in parallel.
pub fn lower_program(
    program: &Program,
    backend: Backend,
    options: &LowerOptions,
) -> Result<BackendSpec, LowerError> {
    if !program.is_closed() {
        let open = program
            .entry_points()
            .find(|(_, id)| !program.func(*id).is_closed())
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| "<nested>".to_string());
        return Err(LowerError::FunctionOpen(open));
    }

    let registry = OpRegistry::global();
    let entry_points: Vec<_> = program.entry_points().collect();
    let lowered = entry_points
        .par_iter()
        .map(|(name, id)| lower_function(program, registry, backend, options, name, *id))
        .collect::<Result<Vec<_>, _>>()?;

    let mut spec = BackendSpec {
        backend: backend.name().to_string(),
        functions: Vec::with_capacity(lowered.len()),
        skipped: Vec::new(),
    };
    for (function, skipped) in lowered {
        spec.functions.push(function);
        spec.skipped.extend(skipped);
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::{lower_program, Backend, LowerError, LowerOptions};
    use crate::builder::Builder;
    use crate::graph::Program;
    use crate::operator::ErrorKind;
    use crate::types::{tensor_type, DType};

    fn relu_program() -> Program {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        mb.function("main", [("x", tensor_type([2, 2], DType::Fp32))], |mb, x| {
            let scale = mb.op("mul").arg("x", 2.).arg("y", 3.).build1()?;
            let y = mb.op("relu6").arg("x", x[0]).build1()?;
            let z = mb.op("mul").arg("x", y).arg("y", scale).build1()?;
            Ok(vec![z])
        })
        .unwrap();
        program
    }

    #[test]
    fn test_parse_backend() {
        assert_eq!("nn_proto".parse::<Backend>(), Ok(Backend::NnProto));
        assert_eq!("mil_proto".parse::<Backend>(), Ok(Backend::MilProto));
        let err = "neural_engine".parse::<Backend>().err().unwrap();
        assert_eq!(err, LowerError::UnknownBackend("neural_engine".into()));
        assert_eq!(err.kind(), ErrorKind::ValueError);
    }

    #[test]
    fn test_lower_mil_proto() {
        let program = relu_program();
        let options = LowerOptions {
            skip_unsupported: false,
        };
        let spec = lower_program(&program, Backend::MilProto, &options).unwrap();
        let main = spec.function("main").unwrap();

        let layer_types: Vec<_> = main
            .block
            .layers
            .iter()
            .map(|l| l.layer_type.as_str())
            .collect();
        assert_eq!(layer_types, ["relu6", "mul"]);

        // Folded values become constants.
        assert!(main.constants.contains_key("mul_0"));
        assert_eq!(main.inputs[0].name, "x");
        assert_eq!(main.inputs[0].shape, Some(vec![Some(2), Some(2)]));
    }

    #[test]
    fn test_lower_nn_proto_decomposes() {
        let program = relu_program();
        let options = LowerOptions {
            skip_unsupported: false,
        };
        let spec = lower_program(&program, Backend::NnProto, &options).unwrap();
        let main = spec.function("main").unwrap();
        let layer_types: Vec<_> = main
            .block
            .layers
            .iter()
            .map(|l| l.layer_type.as_str())
            .collect();
        assert_eq!(
            layer_types,
            ["relu", "linear_activation", "threshold", "linear_activation", "mul"]
        );

        let json = spec.to_json().unwrap();
        assert!(json.contains("\"decomposed_from\": \"relu6_0\""));
    }
}
