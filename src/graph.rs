//! Arena-based program representation.
//!
//! A [`Program`] owns every variable, operation and function created while
//! building it. They reference each other by ID rather than by pointer, so
//! nested functions can refer to variables of their enclosing functions
//! without ownership cycles.

use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::op_registry::OpRegistry;
use crate::types::{TensorType, ValueType};
use crate::value::Value;

mod build_error;
mod dot;
mod eval;
mod ids;


pub use build_error::BuildError;
pub use dot::DotGraph;
pub use eval::{conform_values, fold_operation, run_function, ValueEnv};
pub use ids::{FunctionId, OpId, VarId};

/// Where a variable's value comes from.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Producer {
    /// An input of a function.
    Placeholder(FunctionId),

    /// Output `index` of an operation.
    Op(OpId, usize),
}

/// A typed SSA variable.
#[derive(Clone, Debug)]
pub struct Var {
    name: String,
    ty: ValueType,
    value: Option<Value>,
    producer: Producer,
    function: FunctionId,
}

impl Var {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &ValueType {
        &self.ty
    }

    /// Return the tensor type of this variable, or `None` for a list.
    pub fn tensor_type(&self) -> Option<&TensorType> {
        self.ty.as_tensor()
    }

    /// Return the value of this variable if it is known when building.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn producer(&self) -> Producer {
        self.producer
    }

    /// Return the function in which this variable is defined.
    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub(crate) fn set_value(&mut self, value: Option<Value>) {
        self.value = value;
    }

    pub(crate) fn set_type(&mut self, ty: ValueType) {
        self.ty = ty;
    }

    pub(crate) fn set_producer(&mut self, producer: Producer) {
        self.producer = producer;
    }
}

/// Variables bound to an operation parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum Binding {
    Var(VarId),
    List(Vec<VarId>),
}

impl Binding {
    pub fn vars(&self) -> &[VarId] {
        match self {
            Binding::Var(id) => std::slice::from_ref(id),
            Binding::List(ids) => ids,
        }
    }
}

/// An instance of an operator in a function.
#[derive(Clone, Debug)]
pub struct Operation {
    name: String,
    op_type: String,
    inputs: Vec<(String, Binding)>,
    outputs: SmallVec<[VarId; 2]>,
    functions: SmallVec<[FunctionId; 2]>,
    function: FunctionId,

    /// Value produced by a `const` operation.
    literal: Option<Value>,
}

impl Operation {
    pub(crate) fn new(name: String, op_type: &str, function: FunctionId) -> Operation {
        Operation {
            name,
            op_type: op_type.to_string(),
            inputs: Vec::new(),
            outputs: SmallVec::new(),
            functions: SmallVec::new(),
            function,
            literal: None,
        }
    }

    pub(crate) fn constant(name: String, value: Value, function: FunctionId) -> Operation {
        let mut op = Operation::new(name, "const", function);
        op.literal = Some(value);
        op
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn is_const(&self) -> bool {
        self.literal.is_some()
    }

    pub fn literal(&self) -> Option<&Value> {
        self.literal.as_ref()
    }

    /// Parameter bindings, in the order the operator declares them.
    pub fn inputs(&self) -> &[(String, Binding)] {
        &self.inputs
    }

    pub fn input(&self, name: &str) -> Option<&Binding> {
        self.inputs
            .iter()
            .find(|(param, _)| param == name)
            .map(|(_, binding)| binding)
    }

    /// Iterate over every variable bound to any parameter.
    pub fn input_vars(&self) -> impl Iterator<Item = VarId> + '_ {
        self.inputs
            .iter()
            .flat_map(|(_, binding)| binding.vars().iter().copied())
    }

    pub fn outputs(&self) -> &[VarId] {
        &self.outputs
    }

    /// Nested functions owned by this operation.
    pub fn functions(&self) -> &[FunctionId] {
        &self.functions
    }

    /// The function this operation belongs to.
    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub(crate) fn push_input(&mut self, name: &str, binding: Binding) {
        self.inputs.push((name.to_string(), binding));
    }

    pub(crate) fn set_functions(&mut self, functions: &[FunctionId]) {
        self.functions = functions.into();
    }

    pub(crate) fn set_outputs(&mut self, outputs: &[VarId]) {
        self.outputs = outputs.into();
    }

    /// Replace every occurrence of `old` in the input bindings with `new`.
    /// Returns true if any binding changed.
    pub(crate) fn replace_input(&mut self, old: VarId, new: VarId) -> bool {
        let mut replaced = false;
        for (_, binding) in self.inputs.iter_mut() {
            let vars: &mut [VarId] = match binding {
                Binding::Var(id) => std::slice::from_mut(id),
                Binding::List(ids) => ids,
            };
            for var in vars.iter_mut().filter(|var| **var == old) {
                *var = new;
                replaced = true;
            }
        }
        replaced
    }

    /// Bind a single variable to an existing parameter.
    pub(crate) fn set_input(&mut self, name: &str, var: VarId) {
        if let Some((_, binding)) = self.inputs.iter_mut().find(|(param, _)| param == name) {
            *binding = Binding::Var(var);
        }
    }
}

/// Build state of a function.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FunctionState {
    /// Operations can be appended.
    Open,

    /// Outputs have been set. The function can be lowered but not modified.
    Closed,
}

/// An ordered list of operations over named placeholders.
#[derive(Clone, Debug)]
pub struct Function {
    name: String,
    placeholders: Vec<VarId>,
    ops: Vec<OpId>,
    outputs: Vec<VarId>,
    state: FunctionState,
    parent: Option<FunctionId>,
    captures: Vec<VarId>,
}

impl Function {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn placeholders(&self) -> &[VarId] {
        &self.placeholders
    }

    pub fn ops(&self) -> &[OpId] {
        &self.ops
    }

    pub fn outputs(&self) -> &[VarId] {
        &self.outputs
    }

    pub fn state(&self) -> FunctionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == FunctionState::Closed
    }

    /// The enclosing function, for functions nested in control-flow
    /// operations.
    pub fn parent(&self) -> Option<FunctionId> {
        self.parent
    }

    /// Variables of enclosing functions which are read by this function or
    /// functions nested inside it.
    pub fn captures(&self) -> &[VarId] {
        &self.captures
    }

    pub(crate) fn ops_mut(&mut self) -> &mut Vec<OpId> {
        &mut self.ops
    }

    pub(crate) fn set_captures(&mut self, captures: Vec<VarId>) {
        self.captures = captures;
    }

    pub(crate) fn outputs_mut(&mut self) -> &mut Vec<VarId> {
        &mut self.outputs
    }
}

/// Owner of all variables, operations and functions of a program, plus the
/// map of top-level function names.
#[derive(Clone, Debug, Default)]
pub struct Program {
    vars: Vec<Var>,
    ops: Vec<Operation>,
    functions: Vec<Function>,
    entry_points: Vec<(String, FunctionId)>,
    name_counts: FxHashMap<String, usize>,
}

impl Program {
    pub fn new() -> Program {
        Program::default()
    }

    pub fn var(&self, id: VarId) -> &Var {
        &self.vars[id.as_usize()]
    }

    pub fn op(&self, id: OpId) -> &Operation {
        &self.ops[id.as_usize()]
    }

    pub fn func(&self, id: FunctionId) -> &Function {
        &self.functions[id.as_usize()]
    }

    pub(crate) fn var_mut(&mut self, id: VarId) -> &mut Var {
        &mut self.vars[id.as_usize()]
    }

    pub(crate) fn op_mut(&mut self, id: OpId) -> &mut Operation {
        &mut self.ops[id.as_usize()]
    }

    pub(crate) fn func_mut(&mut self, id: FunctionId) -> &mut Function {
        &mut self.functions[id.as_usize()]
    }

    /// Look up a top-level function by name.
    pub fn function_id(&self, name: &str) -> Option<FunctionId> {
        self.entry_points
            .iter()
            .find(|(fn_name, _)| fn_name == name)
            .map(|(_, id)| *id)
    }

    /// Iterate over top-level functions in the order they were added.
    pub fn entry_points(&self) -> impl Iterator<Item = (&str, FunctionId)> + '_ {
        self.entry_points
            .iter()
            .map(|(name, id)| (name.as_str(), *id))
    }

    /// Return the types of a function's outputs.
    pub fn output_types(&self, id: FunctionId) -> Vec<&ValueType> {
        self.func(id)
            .outputs()
            .iter()
            .map(|var| self.var(*var).ty())
            .collect()
    }

    /// Generate a name of the form `{prefix}_{n}` which is unique within
    /// the program.
    pub(crate) fn unique_name(&mut self, prefix: &str) -> String {
        let count = self.name_counts.entry(prefix.to_string()).or_insert(0);
        let name = format!("{}_{}", prefix, count);
        *count += 1;
        name
    }

    /// Create an open function. Functions without a parent are registered
    /// as top-level functions, replacing any existing function of the same
    /// name.
    pub(crate) fn add_function(&mut self, name: &str, parent: Option<FunctionId>) -> FunctionId {
        let id = FunctionId::from_index(self.functions.len());
        self.functions.push(Function {
            name: name.to_string(),
            placeholders: Vec::new(),
            ops: Vec::new(),
            outputs: Vec::new(),
            state: FunctionState::Open,
            parent,
            captures: Vec::new(),
        });
        if parent.is_none() {
            self.entry_points.retain(|(fn_name, _)| fn_name != name);
            self.entry_points.push((name.to_string(), id));
        }
        id
    }

    pub(crate) fn add_placeholder(
        &mut self,
        function: FunctionId,
        name: &str,
        ty: ValueType,
    ) -> VarId {
        let id = VarId::from_index(self.vars.len());
        self.vars.push(Var {
            name: name.to_string(),
            ty,
            value: None,
            producer: Producer::Placeholder(function),
            function,
        });
        self.func_mut(function).placeholders.push(id);
        id
    }

    /// Iterate over `function` and its enclosing functions, innermost first.
    pub fn ancestors(&self, function: FunctionId) -> impl Iterator<Item = FunctionId> + '_ {
        std::iter::successors(Some(function), |id| self.func(*id).parent())
    }

    /// Return true if `var` can be read by operations in `function`.
    pub fn is_visible(&self, function: FunctionId, var: VarId) -> bool {
        let defined_in = self.var(var).function();
        self.ancestors(function).any(|id| id == defined_in)
    }

    /// Check that `var` can be read from `function` and record it as a
    /// capture of every function between `function` and the one defining
    /// `var`.
    pub(crate) fn use_var(&mut self, function: FunctionId, var: VarId) -> Result<(), BuildError> {
        if !self.is_visible(function, var) {
            return Err(BuildError::NotVisible {
                var: self.var(var).name().to_string(),
                function: self.func(function).name().to_string(),
            });
        }
        let defined_in = self.var(var).function();
        let capturing: Vec<FunctionId> = self
            .ancestors(function)
            .take_while(|id| *id != defined_in)
            .collect();
        for id in capturing {
            let captures = &mut self.func_mut(id).captures;
            if !captures.contains(&var) {
                captures.push(var);
            }
        }
        Ok(())
    }

    /// Add an operation to the end of its function and create its output
    /// variables.
    pub(crate) fn append_op(
        &mut self,
        op: Operation,
        types: Vec<ValueType>,
        values: Vec<Option<Value>>,
    ) -> Result<OpId, BuildError> {
        let function = op.function();
        if self.func(function).is_closed() {
            return Err(BuildError::FunctionClosed(
                self.func(function).name().to_string(),
            ));
        }
        let id = self.add_detached_op(op, types, values);
        self.func_mut(function).ops.push(id);
        Ok(id)
    }

    /// Add an operation to the arena and create its output variables,
    /// without adding it to its function's op list.
    ///
    /// Single outputs take the name of the operation. Multiple outputs are
    /// suffixed with their index.
    pub(crate) fn add_detached_op(
        &mut self,
        mut op: Operation,
        types: Vec<ValueType>,
        values: Vec<Option<Value>>,
    ) -> OpId {
        let function = op.function();
        let id = OpId::from_index(self.ops.len());
        let n_outputs = types.len();
        let mut values = values.into_iter();
        let outputs: SmallVec<[VarId; 2]> = types
            .into_iter()
            .enumerate()
            .map(|(index, ty)| {
                let name = if n_outputs == 1 {
                    op.name().to_string()
                } else {
                    format!("{}_{}", op.name(), index)
                };
                let var = VarId::from_index(self.vars.len());
                self.vars.push(Var {
                    name,
                    ty,
                    value: values.next().flatten(),
                    producer: Producer::Op(id, index),
                    function,
                });
                var
            })
            .collect();
        op.outputs = outputs;
        self.ops.push(op);
        id
    }

    /// Add an operation to the arena without adding it to a function's op
    /// list or creating outputs.
    pub(crate) fn push_detached_op(&mut self, op: Operation) -> OpId {
        let id = OpId::from_index(self.ops.len());
        self.ops.push(op);
        id
    }

    /// Set the outputs of an open function and close it.
    pub(crate) fn set_outputs(
        &mut self,
        function: FunctionId,
        outputs: Vec<VarId>,
    ) -> Result<(), BuildError> {
        if self.func(function).is_closed() {
            return Err(BuildError::FunctionClosed(
                self.func(function).name().to_string(),
            ));
        }
        for &var in &outputs {
            self.use_var(function, var)?;
        }
        let func = self.func_mut(function);
        func.outputs = outputs;
        func.state = FunctionState::Closed;
        Ok(())
    }

    /// Return true if every function reachable from the top-level functions
    /// is closed.
    pub fn is_closed(&self) -> bool {
        self.entry_points
            .iter()
            .all(|(_, id)| self.function_tree_closed(*id))
    }

    fn function_tree_closed(&self, id: FunctionId) -> bool {
        let func = self.func(id);
        func.is_closed()
            && func.ops().iter().all(|op| {
                self.op(*op)
                    .functions()
                    .iter()
                    .all(|nested| self.function_tree_closed(*nested))
            })
    }

    /// Return operations whose name starts with `prefix` and whose type is
    /// `op_type`, searching every function reachable from the top-level
    /// functions. Operations are listed in program order, each before the
    /// operations of its nested functions. With neither filter every
    /// operation is returned.
    pub fn find_ops(&self, prefix: Option<&str>, op_type: Option<&str>) -> Vec<OpId> {
        let mut found = Vec::new();
        for (_, function) in self.entry_points() {
            self.find_ops_in(function, prefix, op_type, &mut found);
        }
        found
    }

    fn find_ops_in(
        &self,
        function: FunctionId,
        prefix: Option<&str>,
        op_type: Option<&str>,
        found: &mut Vec<OpId>,
    ) {
        for &op_id in self.func(function).ops() {
            let op = self.op(op_id);
            let name_match = prefix.map_or(true, |prefix| op.name().starts_with(prefix));
            let type_match = op_type.map_or(true, |op_type| op.op_type() == op_type);
            if name_match && type_match {
                found.push(op_id);
            }
            for &nested in op.functions() {
                self.find_ops_in(nested, prefix, op_type, found);
            }
        }
    }

    /// Return the operations of `function` which `vars` depend on, in
    /// program order.
    ///
    /// An operation with nested functions depends on the variables those
    /// functions capture as well as its own inputs.
    pub fn operations_for_vars(&self, function: FunctionId, vars: &[VarId]) -> Vec<OpId> {
        let mut used: FxHashSet<VarId> = vars.iter().copied().collect();
        let mut ops = Vec::new();
        for &op_id in self.func(function).ops().iter().rev() {
            let op = self.op(op_id);
            if !op.outputs().iter().any(|var| used.contains(var)) {
                continue;
            }
            ops.push(op_id);
            used.extend(op.input_vars());
            for &nested in op.functions() {
                used.extend(self.func(nested).captures().iter().copied());
            }
        }
        ops.reverse();
        ops
    }

    /// Make the operations of `function` after `anchor` read `new` instead of
    /// `old`. This includes operations in their nested functions and the
    /// outputs of `function`. With no anchor every use in the function is
    /// replaced.
    ///
    /// `new` must have the same type as `old` and be visible in `function`.
    /// If it is produced in `function` it must be produced no later than
    /// `anchor`. Returns the number of operations changed.
    pub fn replace_uses_of_var(
        &mut self,
        function: FunctionId,
        anchor: Option<OpId>,
        old: VarId,
        new: VarId,
    ) -> Result<usize, BuildError> {
        let (old_ty, new_ty) = (self.var(old).ty(), self.var(new).ty());
        if old_ty != new_ty {
            return Err(BuildError::TypeMismatch {
                old: old_ty.to_string(),
                new: new_ty.to_string(),
            });
        }
        if !self.is_visible(function, new) {
            return Err(BuildError::NotVisible {
                var: self.var(new).name().to_string(),
                function: self.func(function).name().to_string(),
            });
        }

        let ops = self.func(function).ops();
        let start = match anchor {
            Some(anchor) => match ops.iter().position(|op| *op == anchor) {
                Some(pos) => pos + 1,
                None => {
                    return Err(BuildError::InvalidFunction(format!(
                        "operation \"{}\" is not in function \"{}\"",
                        self.op(anchor).name(),
                        self.func(function).name()
                    )))
                }
            },
            None => 0,
        };
        if let Producer::Op(producer, _) = self.var(new).producer() {
            let defined_at = ops.iter().position(|op| *op == producer);
            if self.op(producer).function() == function
                && defined_at.map_or(true, |pos| pos >= start)
            {
                return Err(BuildError::InvalidFunction(format!(
                    "variable \"{}\" would be used before it is defined",
                    self.var(new).name()
                )));
            }
        }

        Ok(self.replace_var_uses(function, start, old, new))
    }

    /// Replace uses of `old` with `new` in the operations of `function` from
    /// position `start` on, in their nested functions and in the outputs of
    /// `function`. Types and visibility are not checked.
    pub(crate) fn replace_var_uses(
        &mut self,
        function: FunctionId,
        start: usize,
        old: VarId,
        new: VarId,
    ) -> usize {
        let ops = self
            .func(function)
            .ops()
            .get(start..)
            .unwrap_or_default()
            .to_vec();
        let mut changed = 0;
        for op_id in ops {
            if self.op_mut(op_id).replace_input(old, new) {
                changed += 1;
            }
            for nested in self.op(op_id).functions().to_vec() {
                changed += self.replace_var_uses(nested, 0, old, new);
                let captures = &mut self.func_mut(nested).captures;
                if let Some(pos) = captures.iter().position(|var| *var == old) {
                    if captures.contains(&new) {
                        captures.remove(pos);
                    } else {
                        captures[pos] = new;
                    }
                }
            }
        }
        for output in self.func_mut(function).outputs.iter_mut() {
            if *output == old {
                *output = new;
            }
        }
        changed
    }

    fn fmt_function(
        &self,
        f: &mut fmt::Formatter<'_>,
        id: FunctionId,
        label: &str,
        indent: usize,
    ) -> fmt::Result {
        let pad = "  ".repeat(indent);
        let func = self.func(id);

        write!(f, "{}{}(", pad, label)?;
        for (i, var) in func.placeholders().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            let var = self.var(*var);
            write!(f, "%{}: {}", var.name(), var.ty())?;
        }
        writeln!(f, ") {{")?;

        for op_id in func.ops() {
            let op = self.op(*op_id);
            write!(f, "{}  ", pad)?;
            for (i, out) in op.outputs().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                let var = self.var(*out);
                write!(f, "%{}: {}", var.name(), var.ty())?;
            }
            write!(f, " = {}(", op.op_type())?;
            if let Some(value) = op.literal() {
                write!(f, "val={}", value)?;
            }
            for (i, (param, binding)) in op.inputs().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}=", param)?;
                match binding {
                    Binding::Var(var) => write!(f, "%{}", self.var(*var).name())?,
                    Binding::List(vars) => {
                        write!(f, "(")?;
                        for (j, var) in vars.iter().enumerate() {
                            if j > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "%{}", self.var(*var).name())?;
                        }
                        write!(f, ")")?;
                    }
                }
            }
            write!(f, ")")?;

            if op.functions().is_empty() {
                writeln!(f)?;
                continue;
            }

            writeln!(f, " {{")?;
            let roles = OpRegistry::global()
                .get(op.op_type())
                .and_then(|def| def.as_control_flow())
                .map(|cf| cf.function_roles())
                .unwrap_or_default();
            for (index, nested) in op.functions().iter().enumerate() {
                let label = roles
                    .get(index)
                    .map(|role| role.to_string())
                    .unwrap_or_else(|| format!("block{}", index));
                self.fmt_function(f, *nested, &label, indent + 2)?;
            }
            writeln!(f, "{}  }}", pad)?;
        }

        write!(f, "{}}} -> (", pad)?;
        for (i, var) in func.outputs().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "%{}", self.var(*var).name())?;
        }
        writeln!(f, ")")
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, id) in self.entry_points() {
            self.fmt_function(f, id, &format!("function {}", name), 0)?;
        }
        Ok(())
    }
}
