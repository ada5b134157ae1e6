//! The [`OpDef`] trait for defining operators, and the contexts passed to
//! its type inference and evaluation methods.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::fmt::Debug;

use mil_shape::{InferShapesError, Shape};
use rten_tensor::{Layout, Storage, Tensor, TensorBase};

use crate::graph::{Binding, FunctionId, Program, Var};
use crate::lower::{LowerContext, LowerError};
use crate::types::{DType, ListType, TensorType, ValueType};
use crate::value::{CastError, Value};

/// General category of an error.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A shape, rank or value is invalid.
    ValueError,

    /// An input has the wrong kind or element type, or is missing.
    TypeError,

    /// An operation is valid but cannot be lowered to the requested backend.
    UnsupportedOnBackend,

    /// The program is malformed, eg. a function is still open.
    InvalidProgram,

    /// A result did not match what was expected.
    Mismatch,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ValueError => "ValueError",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::UnsupportedOnBackend => "UnsupportedOnBackend",
            ErrorKind::InvalidProgram => "InvalidProgram",
            ErrorKind::Mismatch => "Mismatch",
        };
        write!(f, "{}", name)
    }
}

/// Reasons why an operation can fail type inference or evaluation.
#[derive(Clone, Debug, PartialEq)]
pub enum OpError {
    /// An input has an invalid shape or rank.
    InvalidShape(String),

    /// An input has an invalid value.
    InvalidValue(String),

    /// An input has the wrong kind or element type.
    InvalidType(String),

    /// A required input was not provided.
    MissingInput(String),

    /// An input was provided which the operator does not have.
    UnknownInput(String),

    /// The operation cannot be evaluated with the given inputs.
    NotEvaluable(String),

    /// Input shapes cannot be combined.
    IncompatibleShapes(InferShapesError),

    /// Converting an input value failed.
    Cast(CastError),
}

impl OpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidShape(_)
            | Self::InvalidValue(_)
            | Self::NotEvaluable(_)
            | Self::IncompatibleShapes(_) => ErrorKind::ValueError,
            Self::InvalidType(_) | Self::MissingInput(_) | Self::UnknownInput(_) | Self::Cast(_) => {
                ErrorKind::TypeError
            }
        }
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidShape(msg) | Self::InvalidValue(msg) | Self::InvalidType(msg) => {
                write!(f, "{}", msg)
            }
            Self::MissingInput(name) => write!(f, "required input \"{}\" is missing", name),
            Self::UnknownInput(name) => write!(f, "unknown input \"{}\"", name),
            Self::NotEvaluable(msg) => write!(f, "cannot evaluate: {}", msg),
            Self::IncompatibleShapes(err) => write!(f, "{}", err),
            Self::Cast(err) => write!(f, "{}", err),
        }
    }
}

impl Error for OpError {}

impl From<CastError> for OpError {
    fn from(err: CastError) -> OpError {
        OpError::Cast(err)
    }
}

impl From<InferShapesError> for OpError {
    fn from(err: InferShapesError) -> OpError {
        match err {
            InferShapesError::AxisOutOfRange { .. } => OpError::InvalidValue(err.to_string()),
            InferShapesError::IncorrectRank { .. } => OpError::InvalidShape(err.to_string()),
            _ => OpError::IncompatibleShapes(err),
        }
    }
}

/// Whether a parameter binds one variable or a list of variables.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Arity {
    One,
    Many,
}

/// Whether a parameter's value must be known when the program is built.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Constness {
    Const,
    Any,
}

/// Element types and kinds accepted by a parameter.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum TypeDomain {
    /// Any value, including lists.
    Any,
    /// A tensor of any dtype.
    Tensor,
    Float,
    Int,
    Bool,
    Str,
    /// A float or integer tensor.
    Numeric,
    List,
}

impl TypeDomain {
    pub fn admits(self, ty: &ValueType) -> bool {
        let ValueType::Tensor(tensor) = ty else {
            return matches!(self, TypeDomain::Any | TypeDomain::List);
        };
        let dtype = tensor.dtype;
        match self {
            TypeDomain::Any | TypeDomain::Tensor => true,
            TypeDomain::Float => dtype.is_float(),
            TypeDomain::Int => dtype.is_int(),
            TypeDomain::Bool => dtype.is_bool(),
            TypeDomain::Str => dtype == DType::Str,
            TypeDomain::Numeric => dtype.is_numeric(),
            TypeDomain::List => false,
        }
    }

    fn description(self) -> &'static str {
        match self {
            TypeDomain::Any => "any value",
            TypeDomain::Tensor => "a tensor",
            TypeDomain::Float => "a float tensor",
            TypeDomain::Int => "an integer tensor",
            TypeDomain::Bool => "a bool tensor",
            TypeDomain::Str => "a string",
            TypeDomain::Numeric => "a numeric tensor",
            TypeDomain::List => "a list",
        }
    }
}

/// Value of a parameter which is used when it is not provided.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DefaultValue {
    F32(f32),
    I32(i32),
    Bool(bool),
    Str(&'static str),
    I32s(&'static [i32]),
}

impl DefaultValue {
    pub fn to_value(self) -> Value {
        match self {
            DefaultValue::F32(x) => x.into(),
            DefaultValue::I32(x) => x.into(),
            DefaultValue::Bool(x) => x.into(),
            DefaultValue::Str(x) => x.into(),
            DefaultValue::I32s(xs) => xs.to_vec().into(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Presence {
    Required,
    Optional,
    Default(DefaultValue),
}

/// Declaration of an operator parameter.
///
/// Specs are built in `const` context with the builder methods, eg.
/// `InputSpec::new("axis").domain(TypeDomain::Int).constant().default(DefaultValue::I32(0))`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct InputSpec {
    pub name: &'static str,
    pub arity: Arity,
    pub constness: Constness,
    pub domain: TypeDomain,
    pub presence: Presence,
}

impl InputSpec {
    /// Create a spec for a required parameter that accepts a single value
    /// of any type.
    pub const fn new(name: &'static str) -> InputSpec {
        InputSpec {
            name,
            arity: Arity::One,
            constness: Constness::Any,
            domain: TypeDomain::Tensor,
            presence: Presence::Required,
        }
    }

    pub const fn float(name: &'static str) -> InputSpec {
        InputSpec::new(name).domain(TypeDomain::Float)
    }

    pub const fn int(name: &'static str) -> InputSpec {
        InputSpec::new(name).domain(TypeDomain::Int)
    }

    pub const fn boolean(name: &'static str) -> InputSpec {
        InputSpec::new(name).domain(TypeDomain::Bool)
    }

    pub const fn string(name: &'static str) -> InputSpec {
        InputSpec::new(name).domain(TypeDomain::Str).constant()
    }

    /// Mark the parameter as taking a list of variables.
    pub const fn many(self) -> InputSpec {
        InputSpec {
            arity: Arity::Many,
            ..self
        }
    }

    /// Require the parameter's value to be known when the program is built.
    pub const fn constant(self) -> InputSpec {
        InputSpec {
            constness: Constness::Const,
            ..self
        }
    }

    pub const fn domain(self, domain: TypeDomain) -> InputSpec {
        InputSpec { domain, ..self }
    }

    pub const fn optional(self) -> InputSpec {
        InputSpec {
            presence: Presence::Optional,
            ..self
        }
    }

    pub const fn default(self, value: DefaultValue) -> InputSpec {
        InputSpec {
            presence: Presence::Default(value),
            ..self
        }
    }

    pub fn is_const(&self) -> bool {
        self.constness == Constness::Const
    }

    /// Check that a bound variable's type is acceptable for this parameter.
    pub fn check_type(&self, ty: &ValueType) -> Result<(), OpError> {
        if self.domain.admits(ty) {
            Ok(())
        } else {
            Err(OpError::InvalidType(format!(
                "{} should be {} but got {}",
                self.name,
                self.domain.description(),
                ty
            )))
        }
    }
}

/// Operations with nested functions, such as `cond` and `while_loop`.
pub trait ControlFlowOp {
    /// Names of the roles of the nested functions, in the order they are
    /// stored on the operation.
    fn function_roles(&self) -> &'static [&'static str];
}

/// An operator in the registry.
///
/// Operators declare their parameters, infer the types of their outputs
/// from the types of their inputs and compute concrete outputs from concrete
/// inputs.
pub trait OpDef: Any + Debug + Send + Sync {
    /// Name of the operator, as used in `Builder::op`.
    fn name(&self) -> &'static str;

    /// Parameters of this operator, in declaration order.
    fn inputs(&self) -> &'static [InputSpec];

    /// Compute the types of the outputs.
    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError>;

    /// Compute the outputs given concrete values for every bound input.
    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError>;

    /// Return true if the outputs should be computed when every input is
    /// known. Operators producing random values return false unless they
    /// are seeded.
    fn can_fold(&self, _ctx: &EvalContext) -> bool {
        true
    }

    /// Translate the operation for a backend. The default emits one layer
    /// with the operator's name.
    fn lower(&self, ctx: &mut LowerContext) -> Result<(), LowerError> {
        ctx.emit_default()
    }

    fn as_control_flow(&self) -> Option<&dyn ControlFlowOp> {
        None
    }

    fn input_spec(&self, name: &str) -> Option<&'static InputSpec> {
        self.inputs().iter().find(|spec| spec.name == name)
    }
}

/// Context for inferring the output types of an operation.
pub struct InferContext<'a> {
    program: &'a Program,
    inputs: &'a [(String, Binding)],
    functions: &'a [FunctionId],
}

impl<'a> InferContext<'a> {
    pub fn new(
        program: &'a Program,
        inputs: &'a [(String, Binding)],
        functions: &'a [FunctionId],
    ) -> InferContext<'a> {
        InferContext {
            program,
            inputs,
            functions,
        }
    }

    pub fn program(&self) -> &'a Program {
        self.program
    }

    pub fn binding(&self, name: &str) -> Option<&'a Binding> {
        self.inputs
            .iter()
            .find(|(param, _)| param == name)
            .map(|(_, binding)| binding)
    }

    pub fn has(&self, name: &str) -> bool {
        self.binding(name).is_some()
    }

    /// Return the variable bound to a single-valued parameter.
    pub fn var(&self, name: &str) -> Result<&'a Var, OpError> {
        match self.binding(name) {
            Some(Binding::Var(id)) => Ok(self.program.var(*id)),
            Some(Binding::List(_)) => Err(OpError::InvalidType(format!(
                "{} should be a single value",
                name
            ))),
            None => Err(OpError::MissingInput(name.to_string())),
        }
    }

    /// Return the variables bound to a list parameter.
    pub fn vars(&self, name: &str) -> Result<Vec<&'a Var>, OpError> {
        match self.binding(name) {
            Some(Binding::List(ids)) => Ok(ids.iter().map(|id| self.program.var(*id)).collect()),
            Some(Binding::Var(id)) => Ok(vec![self.program.var(*id)]),
            None => Err(OpError::MissingInput(name.to_string())),
        }
    }

    pub fn ty(&self, name: &str) -> Result<&'a ValueType, OpError> {
        self.var(name).map(|var| var.ty())
    }

    /// Return the type of a tensor parameter.
    pub fn tensor(&self, name: &str) -> Result<&'a TensorType, OpError> {
        self.ty(name)?
            .as_tensor()
            .ok_or_else(|| OpError::InvalidType(format!("{} should be a tensor", name)))
    }

    /// Return the type of an optional tensor parameter.
    pub fn opt_tensor(&self, name: &str) -> Result<Option<&'a TensorType>, OpError> {
        if self.has(name) {
            self.tensor(name).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn tensors(&self, name: &str) -> Result<Vec<&'a TensorType>, OpError> {
        self.vars(name)?
            .into_iter()
            .map(|var| {
                var.ty()
                    .as_tensor()
                    .ok_or_else(|| OpError::InvalidType(format!("{} should be tensors", name)))
            })
            .collect()
    }

    pub fn list(&self, name: &str) -> Result<&'a ListType, OpError> {
        self.ty(name)?
            .as_list()
            .ok_or_else(|| OpError::InvalidType(format!("{} should be a list", name)))
    }

    /// Shape of a tensor parameter.
    pub fn shape(&self, name: &str) -> Result<&'a Shape, OpError> {
        self.tensor(name).map(|ty| &ty.shape)
    }

    /// Return the value of a parameter if it is known when building.
    pub fn value(&self, name: &str) -> Option<&'a Value> {
        match self.binding(name) {
            Some(Binding::Var(id)) => self.program.var(*id).value(),
            _ => None,
        }
    }

    fn const_value(&self, name: &str) -> Result<&'a Value, OpError> {
        self.value(name).ok_or_else(|| {
            if self.has(name) {
                OpError::InvalidValue(format!("{} should be a const value", name))
            } else {
                OpError::MissingInput(name.to_string())
            }
        })
    }

    pub fn f32(&self, name: &str) -> Result<f32, OpError> {
        Ok(self.const_value(name)?.scalar_f32()?)
    }

    pub fn i32(&self, name: &str) -> Result<i32, OpError> {
        Ok(self.const_value(name)?.scalar_i32()?)
    }

    pub fn bool(&self, name: &str) -> Result<bool, OpError> {
        Ok(self.const_value(name)?.scalar_bool()?)
    }

    pub fn str(&self, name: &str) -> Result<&'a str, OpError> {
        Ok(self.const_value(name)?.as_str()?)
    }

    pub fn i32s(&self, name: &str) -> Result<Vec<i32>, OpError> {
        Ok(self.const_value(name)?.to_i32_vec()?)
    }

    /// Return the values of an integer vector parameter if it is bound and
    /// known.
    pub fn opt_i32s(&self, name: &str) -> Result<Option<Vec<i32>>, OpError> {
        match self.value(name) {
            Some(value) => Ok(Some(value.to_i32_vec()?)),
            None => Ok(None),
        }
    }

    /// Return the nested function at `index`.
    pub fn function(&self, index: usize) -> Result<FunctionId, OpError> {
        self.functions
            .get(index)
            .copied()
            .ok_or_else(|| OpError::MissingInput(format!("function {}", index)))
    }

    /// Return the output types of the nested function at `index`.
    pub fn function_output_types(&self, index: usize) -> Result<Vec<ValueType>, OpError> {
        let func = self.program.func(self.function(index)?);
        Ok(func
            .outputs()
            .iter()
            .map(|id| self.program.var(*id).ty().clone())
            .collect())
    }

    /// Return the placeholder types of the nested function at `index`.
    pub fn function_input_types(&self, index: usize) -> Result<Vec<ValueType>, OpError> {
        let func = self.program.func(self.function(index)?);
        Ok(func
            .placeholders()
            .iter()
            .map(|id| self.program.var(*id).ty().clone())
            .collect())
    }
}

/// Runs the nested functions of an operation being evaluated.
pub trait SubgraphRunner {
    fn run_subgraph(&self, index: usize, inputs: Vec<Value>) -> Result<Vec<Value>, OpError>;
}

/// Concrete value bound to a parameter.
#[derive(Clone, Debug)]
pub enum EvalInput<'a> {
    One(&'a Value),
    Many(Vec<&'a Value>),
}

/// Context for evaluating an operation.
pub struct EvalContext<'a> {
    inputs: Vec<(&'a str, EvalInput<'a>)>,
    subgraphs: Option<&'a dyn SubgraphRunner>,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        inputs: Vec<(&'a str, EvalInput<'a>)>,
        subgraphs: Option<&'a dyn SubgraphRunner>,
    ) -> EvalContext<'a> {
        EvalContext { inputs, subgraphs }
    }

    fn input(&self, name: &str) -> Option<&EvalInput<'a>> {
        self.inputs
            .iter()
            .find(|(param, _)| *param == name)
            .map(|(_, input)| input)
    }

    pub fn has(&self, name: &str) -> bool {
        self.input(name).is_some()
    }

    /// Return the value of an optional single-valued parameter.
    pub fn opt(&self, name: &str) -> Option<&'a Value> {
        match self.input(name) {
            Some(EvalInput::One(value)) => Some(value),
            _ => None,
        }
    }

    /// Return the value of a single-valued parameter.
    pub fn value(&self, name: &str) -> Result<&'a Value, OpError> {
        match self.input(name) {
            Some(EvalInput::One(value)) => Ok(value),
            Some(EvalInput::Many(_)) => Err(OpError::InvalidType(format!(
                "{} should be a single value",
                name
            ))),
            None => Err(OpError::MissingInput(name.to_string())),
        }
    }

    /// Return the values of a list parameter.
    pub fn values(&self, name: &str) -> Result<Vec<&'a Value>, OpError> {
        match self.input(name) {
            Some(EvalInput::Many(values)) => Ok(values.clone()),
            Some(EvalInput::One(value)) => Ok(vec![*value]),
            None => Err(OpError::MissingInput(name.to_string())),
        }
    }

    /// Return a numeric parameter converted to `f32`.
    pub fn float(&self, name: &str) -> Result<Tensor<f32>, OpError> {
        Ok(self.value(name)?.to_f32()?)
    }

    pub fn opt_float(&self, name: &str) -> Result<Option<Tensor<f32>>, OpError> {
        self.opt(name).map(|v| v.to_f32()).transpose().map_err(OpError::from)
    }

    pub fn int(&self, name: &str) -> Result<Tensor<i32>, OpError> {
        Ok(self.value(name)?.to_i32()?)
    }

    pub fn f32(&self, name: &str) -> Result<f32, OpError> {
        Ok(self.value(name)?.scalar_f32()?)
    }

    pub fn i32(&self, name: &str) -> Result<i32, OpError> {
        Ok(self.value(name)?.scalar_i32()?)
    }

    pub fn bool(&self, name: &str) -> Result<bool, OpError> {
        Ok(self.value(name)?.scalar_bool()?)
    }

    pub fn str(&self, name: &str) -> Result<&'a str, OpError> {
        Ok(self.value(name)?.as_str()?)
    }

    pub fn i32s(&self, name: &str) -> Result<Vec<i32>, OpError> {
        Ok(self.value(name)?.to_i32_vec()?)
    }

    pub fn opt_i32s(&self, name: &str) -> Result<Option<Vec<i32>>, OpError> {
        self.opt(name)
            .map(|v| v.to_i32_vec())
            .transpose()
            .map_err(OpError::from)
    }

    /// Run the nested function at `index` with the given inputs.
    pub fn run_subgraph(&self, index: usize, inputs: Vec<Value>) -> Result<Vec<Value>, OpError> {
        match self.subgraphs {
            Some(runner) => runner.run_subgraph(index, inputs),
            None => Err(OpError::NotEvaluable(
                "nested functions are not available".to_string(),
            )),
        }
    }
}

/// Trait for values that can be converted into the result type used by
/// [`OpDef::eval`].
pub trait IntoOpResult {
    fn into_op_result(self) -> Result<Vec<Value>, OpError>;
}

impl IntoOpResult for Value {
    fn into_op_result(self) -> Result<Vec<Value>, OpError> {
        Ok([self].into())
    }
}

impl IntoOpResult for Result<Value, OpError> {
    fn into_op_result(self) -> Result<Vec<Value>, OpError> {
        self.map(|out| [out].into())
    }
}

impl<S: Storage, L: Layout> IntoOpResult for TensorBase<S, L>
where
    Value: From<TensorBase<S, L>>,
{
    fn into_op_result(self) -> Result<Vec<Value>, OpError> {
        Ok([self.into()].into())
    }
}

impl<S: Storage, L: Layout> IntoOpResult for Result<TensorBase<S, L>, OpError>
where
    Value: From<TensorBase<S, L>>,
{
    fn into_op_result(self) -> Result<Vec<Value>, OpError> {
        self.map(|tensor| [tensor.into()].into())
    }
}

/// Wrap a single tensor type as the result of [`OpDef::infer_types`].
pub fn single_output(shape: Shape, dtype: DType) -> Result<Vec<ValueType>, OpError> {
    Ok([ValueType::Tensor(TensorType::new(shape, dtype))].into())
}

/// Resolve an axis against a rank, producing a value error which names
/// the parameter.
pub fn resolve_axis(rank: usize, axis: i32, param: &str) -> Result<usize, OpError> {
    mil_shape::resolve_axis(rank, axis as i64).map_err(|_| {
        OpError::InvalidValue(format!(
            "{} {} out of bound for rank {}",
            param, axis, rank
        ))
    })
}
