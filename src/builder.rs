//! Fluent API for building programs.
//!
//! ```
//! use mil_ir::{Builder, DType, Program, tensor_type};
//!
//! let mut program = Program::new();
//! let mut mb = Builder::new(&mut program);
//! mb.function("main", [("x", tensor_type([2, 3], DType::Fp32))], |mb, inputs| {
//!     let y = mb.op("relu").arg("x", inputs[0]).build1()?;
//!     let z = mb.op("add").arg("x", y).arg("y", 1.0).build1()?;
//!     Ok(vec![z])
//! })
//! .unwrap();
//! ```

use mil_shape::Dim;
use rten_tensor::Tensor;
use tracing::trace;

use crate::env::{env_flag, EAGER_FOLD};
use crate::graph::{
    conform_values, fold_operation, Binding, BuildError, FunctionId, Operation, Program, ValueEnv,
    VarId,
};
use crate::op_registry::OpRegistry;
use crate::operator::{Arity, InferContext, InputSpec, OpDef, OpError, Presence};
use crate::types::{ListType, TensorType, ValueType};
use crate::value::Value;

/// Options that control program construction.
#[derive(Clone, Debug)]
pub struct BuilderOptions {
    /// Evaluate operations as they are added when all of their inputs are
    /// known. Defaults to the `MIL_EAGER_FOLD` environment variable, or on.
    pub eager_fold: bool,
}

impl Default for BuilderOptions {
    fn default() -> BuilderOptions {
        BuilderOptions {
            eager_fold: env_flag(EAGER_FOLD, true),
        }
    }
}

/// Argument for an operator parameter.
///
/// Host values are added to the program as `const` operations.
#[derive(Clone, Debug)]
pub enum Arg {
    Var(VarId),
    Value(Value),
    List(Vec<Arg>),
}

impl From<VarId> for Arg {
    fn from(var: VarId) -> Arg {
        Arg::Var(var)
    }
}

impl From<&VarId> for Arg {
    fn from(var: &VarId) -> Arg {
        Arg::Var(*var)
    }
}

impl From<Vec<VarId>> for Arg {
    fn from(vars: Vec<VarId>) -> Arg {
        Arg::List(vars.into_iter().map(Arg::Var).collect())
    }
}

impl From<&[VarId]> for Arg {
    fn from(vars: &[VarId]) -> Arg {
        Arg::List(vars.iter().copied().map(Arg::Var).collect())
    }
}

impl<const N: usize> From<[VarId; N]> for Arg {
    fn from(vars: [VarId; N]) -> Arg {
        Arg::List(vars.into_iter().map(Arg::Var).collect())
    }
}

impl From<Vec<Arg>> for Arg {
    fn from(args: Vec<Arg>) -> Arg {
        Arg::List(args)
    }
}

impl From<Vec<Value>> for Arg {
    fn from(values: Vec<Value>) -> Arg {
        Arg::List(values.into_iter().map(Arg::Value).collect())
    }
}

impl<const N: usize> From<[f32; N]> for Arg {
    fn from(values: [f32; N]) -> Arg {
        Arg::Value(values.to_vec().into())
    }
}

impl<const N: usize> From<[i32; N]> for Arg {
    fn from(values: [i32; N]) -> Arg {
        Arg::Value(values.to_vec().into())
    }
}

impl From<&[i32]> for Arg {
    fn from(values: &[i32]) -> Arg {
        Arg::Value(values.to_vec().into())
    }
}

macro_rules! impl_arg_from_value {
    ($($type:ty),*) => {
        $(
            impl From<$type> for Arg {
                fn from(value: $type) -> Arg {
                    Arg::Value(value.into())
                }
            }
        )*
    };
}
impl_arg_from_value!(
    f32,
    i32,
    bool,
    &str,
    String,
    Vec<f32>,
    Vec<i32>,
    Vec<bool>,
    Tensor<f32>,
    Tensor<i32>,
    Tensor<bool>,
    Value
);

/// Builds functions in a [`Program`].
///
/// The builder keeps a stack of open functions. Operations are appended to
/// the innermost one.
pub struct Builder<'p> {
    program: &'p mut Program,
    registry: &'p OpRegistry,
    options: BuilderOptions,
    scopes: Vec<FunctionId>,
}

impl<'p> Builder<'p> {
    /// Create a builder using the operators from [`OpRegistry::global`].
    pub fn new(program: &'p mut Program) -> Builder<'p> {
        Builder::with_options(program, OpRegistry::global(), BuilderOptions::default())
    }

    pub fn with_options(
        program: &'p mut Program,
        registry: &'p OpRegistry,
        options: BuilderOptions,
    ) -> Builder<'p> {
        Builder {
            program,
            registry,
            options,
            scopes: Vec::new(),
        }
    }

    pub fn program(&self) -> &Program {
        self.program
    }

    pub fn registry(&self) -> &'p OpRegistry {
        self.registry
    }

    pub fn options(&self) -> &BuilderOptions {
        &self.options
    }

    /// Return the type of a variable.
    pub fn ty(&self, var: VarId) -> &ValueType {
        self.program.var(var).ty()
    }

    /// Return the build-time value of a variable, if known.
    pub fn value(&self, var: VarId) -> Option<&Value> {
        self.program.var(var).value()
    }

    /// Return the function operations are currently appended to.
    pub fn current_function(&self) -> Result<FunctionId, BuildError> {
        self.scopes.last().copied().ok_or(BuildError::NoOpenFunction)
    }

    /// Build a top-level function.
    ///
    /// `build` is called with the function's placeholders and returns its
    /// outputs. The function is closed afterwards.
    pub fn function<N, T, I, F>(
        &mut self,
        name: &str,
        inputs: I,
        build: F,
    ) -> Result<FunctionId, BuildError>
    where
        N: AsRef<str>,
        T: Into<ValueType>,
        I: IntoIterator<Item = (N, T)>,
        F: FnOnce(&mut Builder, &[VarId]) -> Result<Vec<VarId>, BuildError>,
    {
        let function = self.program.add_function(name, None);
        let placeholders: Vec<VarId> = inputs
            .into_iter()
            .map(|(name, ty)| self.program.add_placeholder(function, name.as_ref(), ty.into()))
            .collect();
        self.build_body(function, &placeholders, build)?;
        Ok(function)
    }

    /// Build a function nested in the current one. Used by control-flow
    /// operations.
    pub(crate) fn nested_function<F>(
        &mut self,
        label: &str,
        input_types: &[ValueType],
        build: F,
    ) -> Result<FunctionId, BuildError>
    where
        F: FnOnce(&mut Builder, &[VarId]) -> Result<Vec<VarId>, BuildError>,
    {
        let parent = self.current_function()?;
        let name = self.program.unique_name(label);
        let function = self.program.add_function(&name, Some(parent));
        let placeholders: Vec<VarId> = input_types
            .iter()
            .enumerate()
            .map(|(i, ty)| {
                self.program
                    .add_placeholder(function, &format!("{}_in{}", name, i), ty.clone())
            })
            .collect();
        self.build_body(function, &placeholders, build)?;
        Ok(function)
    }

    fn build_body<F>(
        &mut self,
        function: FunctionId,
        placeholders: &[VarId],
        build: F,
    ) -> Result<(), BuildError>
    where
        F: FnOnce(&mut Builder, &[VarId]) -> Result<Vec<VarId>, BuildError>,
    {
        self.scopes.push(function);
        let outputs = build(self, placeholders);
        self.scopes.pop();
        let outputs = outputs?;
        if outputs.is_empty() {
            return Err(BuildError::InvalidFunction(format!(
                "function \"{}\" has no outputs",
                self.program.func(function).name()
            )));
        }
        self.program.set_outputs(function, outputs)
    }

    /// Start building an operation.
    pub fn op<'b>(&'b mut self, op_type: &str) -> OpBuilder<'b, 'p> {
        OpBuilder {
            builder: self,
            op_type: op_type.to_string(),
            name: None,
            args: Vec::new(),
            functions: Vec::new(),
        }
    }

    /// Add a `const` operation and return its output.
    pub fn constant(&mut self, value: impl Into<Value>) -> Result<VarId, BuildError> {
        let value = value.into();
        let function = self.current_function()?;
        let name = self.program.unique_name("const");
        let ty = value.value_type();
        let op = Operation::constant(name, value.clone(), function);
        let op_id = self.program.append_op(op, vec![ty], vec![Some(value)])?;
        Ok(self.program.op(op_id).outputs()[0])
    }

    /// Convert an argument to a variable in the current function.
    fn arg_var(&mut self, arg: Arg) -> Result<VarId, BuildError> {
        match arg {
            Arg::Var(var) => {
                let function = self.current_function()?;
                self.program.use_var(function, var)?;
                Ok(var)
            }
            Arg::Value(value) => self.constant(value),
            Arg::List(_) => Err(BuildError::InvalidFunction(
                "expected a single value but got a list".to_string(),
            )),
        }
    }

    /// Convert an argument which should be a single variable, such as a
    /// loop variable or a predicate.
    pub fn var(&mut self, arg: impl Into<Arg>) -> Result<VarId, BuildError> {
        self.arg_var(arg.into())
    }

    fn add_operation(
        &mut self,
        op_type: &str,
        name: Option<String>,
        args: Vec<(String, Arg)>,
        functions: Vec<FunctionId>,
    ) -> Result<Vec<VarId>, BuildError> {
        let function = self.current_function()?;
        let def = self
            .registry
            .get(op_type)
            .ok_or_else(|| BuildError::UnknownOp(op_type.to_string()))?;
        let name = match name {
            Some(name) => name,
            None => self.program.unique_name(op_type),
        };
        let op_error = |error: OpError| BuildError::op_error(&name, op_type, error);

        for (param, _) in &args {
            if def.input_spec(param).is_none() {
                return Err(op_error(OpError::UnknownInput(param.clone())));
            }
        }

        // Check every argument before adding anything to the function, so a
        // failed operation leaves no constants behind.
        let mut args = args;
        let mut resolved: Vec<(&InputSpec, Arg)> = Vec::with_capacity(def.inputs().len());
        for spec in def.inputs() {
            let arg = match args.iter().position(|(param, _)| param == spec.name) {
                Some(pos) => args.remove(pos).1,
                None => match spec.presence {
                    Presence::Required => {
                        return Err(op_error(OpError::MissingInput(spec.name.to_string())))
                    }
                    Presence::Optional => continue,
                    Presence::Default(default) => Arg::Value(default.to_value()),
                },
            };
            match (spec.arity, &arg) {
                (Arity::Many, Arg::List(items)) => {
                    for item in items {
                        self.check_arg(function, spec, item, &op_error)?;
                    }
                }
                (Arity::Many, _) => {
                    return Err(op_error(OpError::InvalidType(format!(
                        "{} should be a list of values",
                        spec.name
                    ))))
                }
                (Arity::One, Arg::List(_)) => {
                    return Err(op_error(OpError::InvalidType(format!(
                        "{} should be a single value",
                        spec.name
                    ))))
                }
                (Arity::One, arg) => self.check_arg(function, spec, arg, &op_error)?,
            }
            resolved.push((spec, arg));
        }

        let n_ops = self.program.func(function).ops().len();
        let result = self.bind_and_infer(function, def, &name, op_type, resolved, functions);
        if result.is_err() {
            self.program.func_mut(function).ops_mut().truncate(n_ops);
        }
        let (op, types, values) = result?;

        let op_id = self.program.append_op(op, types, values)?;
        Ok(self.program.op(op_id).outputs().to_vec())
    }

    /// Check an argument against the spec of the parameter it is bound to.
    fn check_arg(
        &self,
        function: FunctionId,
        spec: &InputSpec,
        arg: &Arg,
        op_error: &impl Fn(OpError) -> BuildError,
    ) -> Result<(), BuildError> {
        match arg {
            Arg::Var(var) => {
                if !self.program.is_visible(function, *var) {
                    return Err(BuildError::NotVisible {
                        var: self.program.var(*var).name().to_string(),
                        function: self.program.func(function).name().to_string(),
                    });
                }
                let var = self.program.var(*var);
                spec.check_type(var.ty()).map_err(op_error)?;
                if spec.is_const() && var.value().is_none() {
                    return Err(op_error(OpError::InvalidValue(format!(
                        "{} should be a const value",
                        spec.name
                    ))));
                }
                Ok(())
            }
            Arg::Value(value) => spec.check_type(&value.value_type()).map_err(op_error),
            Arg::List(_) => Err(op_error(OpError::InvalidType(format!(
                "{} items should be single values",
                spec.name
            )))),
        }
    }

    /// Bind checked arguments to a new operation, then infer its output
    /// types and fold it if possible.
    #[allow(clippy::type_complexity)]
    fn bind_and_infer(
        &mut self,
        function: FunctionId,
        def: &dyn OpDef,
        name: &str,
        op_type: &str,
        resolved: Vec<(&InputSpec, Arg)>,
        functions: Vec<FunctionId>,
    ) -> Result<(Operation, Vec<ValueType>, Vec<Option<Value>>), BuildError> {
        let op_error = |error: OpError| BuildError::op_error(name, op_type, error);

        let mut op = Operation::new(name.to_string(), op_type, function);
        for (spec, arg) in resolved {
            let binding = match arg {
                Arg::List(items) => {
                    let vars = items
                        .into_iter()
                        .map(|item| self.arg_var(item))
                        .collect::<Result<Vec<_>, _>>()?;
                    Binding::List(vars)
                }
                arg => Binding::Var(self.arg_var(arg)?),
            };
            op.push_input(spec.name, binding);
        }
        op.set_functions(&functions);

        let types = def
            .infer_types(&InferContext::new(self.program, op.inputs(), op.functions()))
            .map_err(op_error)?;

        let values = if self.options.eager_fold {
            let env = ValueEnv::new(None);
            let folded = fold_operation(
                self.program,
                self.registry,
                op_type,
                op.inputs(),
                op.functions(),
                &env,
            )
            .map_err(op_error)?;
            match folded {
                Some(values) => Some(conform_values(values, &types).map_err(op_error)?),
                None => None,
            }
        } else {
            None
        };

        let (types, values) = match values {
            Some(values) => {
                trace!(op = %name, "folded operation");
                let types = types
                    .into_iter()
                    .zip(&values)
                    .map(|(ty, value)| refine_type(ty, value))
                    .collect();
                (types, values.into_iter().map(Some).collect())
            }
            None => {
                let n = types.len();
                (types, vec![None; n])
            }
        };
        Ok((op, types, values))
    }

    /// Add an operation whose nested functions have already been built.
    pub(crate) fn add_control_flow(
        &mut self,
        op_type: &str,
        args: Vec<(String, Arg)>,
        functions: Vec<FunctionId>,
    ) -> Result<Vec<VarId>, BuildError> {
        self.add_operation(op_type, None, args, functions)
    }

    /// Add a `cond` operation which runs `true_fn` if `pred` is true and
    /// `false_fn` otherwise.
    ///
    /// The branches take no inputs. They may use any variable visible in the
    /// current function, and must return outputs with the same count and
    /// dtypes.
    pub fn cond<T, F>(
        &mut self,
        pred: impl Into<Arg>,
        true_fn: T,
        false_fn: F,
    ) -> Result<Vec<VarId>, BuildError>
    where
        T: FnOnce(&mut Builder) -> Result<Vec<VarId>, BuildError>,
        F: FnOnce(&mut Builder) -> Result<Vec<VarId>, BuildError>,
    {
        let pred = self.var(pred)?;
        let true_branch = self.nested_function("cond_true", &[], |mb, _| true_fn(mb))?;
        let false_branch = self.nested_function("cond_false", &[], |mb, _| false_fn(mb))?;

        let true_types = self.program.output_types(true_branch);
        let false_types = self.program.output_types(false_branch);
        if true_types.len() != false_types.len() {
            return Err(BuildError::BranchMismatch(format!(
                "true branch has {} outputs but false branch has {}",
                true_types.len(),
                false_types.len()
            )));
        }
        for (i, (t, f)) in true_types.iter().zip(&false_types).enumerate() {
            if t.merge(f).is_none() {
                return Err(BuildError::BranchMismatch(format!(
                    "output {} is {} in the true branch but {} in the false branch",
                    i, t, f
                )));
            }
        }

        self.add_control_flow(
            "cond",
            vec![("pred".to_string(), Arg::Var(pred))],
            vec![true_branch, false_branch],
        )
    }

    /// Add a `while_loop` operation.
    ///
    /// `cond_fn` and `body_fn` are called with placeholders mirroring
    /// `loop_vars`. `cond_fn` returns a bool scalar and `body_fn` returns the
    /// next values of the loop variables. If the body changes the shape of a
    /// loop variable, the differing dimensions are replaced by symbols and
    /// both functions are built again.
    pub fn while_loop<C, B>(
        &mut self,
        cond_fn: C,
        body_fn: B,
        loop_vars: impl Into<Arg>,
    ) -> Result<Vec<VarId>, BuildError>
    where
        C: Fn(&mut Builder, &[VarId]) -> Result<VarId, BuildError>,
        B: Fn(&mut Builder, &[VarId]) -> Result<Vec<VarId>, BuildError>,
    {
        let vars = match loop_vars.into() {
            Arg::List(items) => items
                .into_iter()
                .map(|item| self.arg_var(item))
                .collect::<Result<Vec<_>, _>>()?,
            arg => vec![self.arg_var(arg)?],
        };
        if vars.is_empty() {
            return Err(BuildError::InvalidFunction(
                "while_loop requires at least one loop variable".to_string(),
            ));
        }

        let mut types: Vec<ValueType> = vars.iter().map(|var| loop_type(self.ty(*var))).collect();
        let mut widened = false;
        loop {
            let cond = self.nested_function("while_cond", &types, |mb, inputs| {
                Ok(vec![cond_fn(mb, inputs)?])
            })?;
            let body = self.nested_function("while_body", &types, |mb, inputs| body_fn(mb, inputs))?;

            let body_types = self.program.output_types(body);
            if body_types.len() != types.len() {
                return Err(BuildError::BranchMismatch(format!(
                    "loop body returns {} values but there are {} loop variables",
                    body_types.len(),
                    types.len()
                )));
            }
            let mut merged = Vec::with_capacity(types.len());
            for (i, (var_ty, body_ty)) in types.iter().zip(&body_types).enumerate() {
                if var_ty == *body_ty {
                    merged.push(var_ty.clone());
                    continue;
                }
                let Some(ty) = var_ty.merge(body_ty) else {
                    return Err(BuildError::BranchMismatch(format!(
                        "loop variable {} is {} but the body returns {}",
                        i, var_ty, body_ty
                    )));
                };
                merged.push(ty);
            }

            if merged == types || widened {
                let args = vec![(
                    "loop_vars".to_string(),
                    Arg::List(vars.into_iter().map(Arg::Var).collect()),
                )];
                return self.add_control_flow("while_loop", args, vec![cond, body]);
            }
            types = merged;
            widened = true;
        }
    }
}

/// Type of the placeholder for a loop-carried variable.
fn loop_type(ty: &ValueType) -> ValueType {
    match ty {
        ValueType::List(list) => ValueType::List(ListType {
            elem: list.elem.clone(),
            len: Dim::new_symbol(),
            dynamic_length: list.dynamic_length,
        }),
        ValueType::Tensor(_) => ty.clone(),
    }
}

/// Replace the inferred shape of an output with the exact shape of its
/// folded value.
pub(crate) fn refine_type(ty: ValueType, value: &Value) -> ValueType {
    match (ty, value) {
        (ValueType::Tensor(tensor), value) if value.is_tensor() => ValueType::Tensor(
            TensorType::new(value.shape().as_slice().into(), tensor.dtype),
        ),
        (ValueType::List(list), Value::List(list_value)) => {
            let elem_shape = match &list_value.elem_shape {
                Some(shape) => shape.as_slice().into(),
                None => list.elem.shape,
            };
            ValueType::List(ListType {
                elem: TensorType::new(elem_shape, list.elem.dtype),
                len: list_value.len().into(),
                dynamic_length: list.dynamic_length,
            })
        }
        (ty, _) => ty,
    }
}

/// Builder for a single operation, returned by [`Builder::op`].
pub struct OpBuilder<'b, 'p> {
    builder: &'b mut Builder<'p>,
    op_type: String,
    name: Option<String>,
    args: Vec<(String, Arg)>,
    functions: Vec<FunctionId>,
}

impl OpBuilder<'_, '_> {
    /// Bind a parameter.
    pub fn arg(mut self, param: &str, value: impl Into<Arg>) -> Self {
        self.args.push((param.to_string(), value.into()));
        self
    }

    /// Bind a parameter if `value` is `Some`.
    pub fn opt_arg<T: Into<Arg>>(self, param: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.arg(param, value),
            None => self,
        }
    }

    /// Set the name of the operation. Names default to `{op_type}_{n}`.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Add the operation and return its outputs.
    pub fn build(self) -> Result<Vec<VarId>, BuildError> {
        self.builder
            .add_operation(&self.op_type, self.name, self.args, self.functions)
    }

    /// Add an operation which has a single output and return it.
    pub fn build1(self) -> Result<VarId, BuildError> {
        let op_type = self.op_type.clone();
        let outputs = self.build()?;
        match outputs.as_slice() {
            [output] => Ok(*output),
            _ => Err(BuildError::InvalidFunction(format!(
                "{} has {} outputs",
                op_type,
                outputs.len()
            ))),
        }
    }
}
