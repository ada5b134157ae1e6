use mil_shape::Shape;
use rten_tensor::prelude::*;
use rten_tensor::Tensor;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use super::{entry_points, Pass, PassError, PassStats};
use crate::graph::{Binding, FunctionId, OpId, Operation, Program, VarId};
use crate::op_registry::OpRegistry;
use crate::operator::OpError;
use crate::types::{TensorType, ValueType};
use crate::value::{map_tensor, Value};

/// Operators that commute with a transpose of `x` when every other input is
/// a scalar.
const UNARY_LIKE_OPS: &[&str] = &[
    "abs",
    "acos",
    "asin",
    "atan",
    "atanh",
    "ceil",
    "clamped_relu",
    "clip",
    "cos",
    "cosh",
    "elu",
    "erf",
    "exp",
    "exp2",
    "floor",
    "gelu",
    "identity",
    "leaky_relu",
    "linear_activation",
    "log",
    "logical_not",
    "relu",
    "relu6",
    "round",
    "rsqrt",
    "scaled_tanh",
    "sigmoid",
    "sigmoid_hard",
    "sign",
    "sin",
    "sinh",
    "softplus",
    "softsign",
    "sqrt",
    "square",
    "tan",
    "tanh",
    "threshold",
    "thresholded_relu",
];

const BINARY_OPS: &[&str] = &["add", "maximum", "minimum", "mul", "real_div", "sub"];

const REDUCE_OPS: &[&str] = &[
    "reduce_l1_norm",
    "reduce_l2_norm",
    "reduce_log_sum",
    "reduce_log_sum_exp",
    "reduce_max",
    "reduce_mean",
    "reduce_min",
    "reduce_prod",
    "reduce_sum",
    "reduce_sum_square",
];

/// A variable whose value is a transpose, by `perm`, of a value the pass
/// could compute instead.
#[derive(Clone, Debug)]
struct Lazy {
    perm: Vec<usize>,
    group: usize,

    /// Type before rewriting.
    ty: ValueType,
}

/// Input change which lets a transpose move past an operation.
#[derive(Clone, Debug)]
enum Rebind {
    /// Bind a new constant to a parameter.
    Param(&'static str, Value),

    /// Replace a constant operand with a new constant.
    Operand(VarId, Value),
}

/// Result of scanning a function for transposes that can be moved or
/// cancelled.
///
/// Each transpose that starts a lazy value forms a group. Groups are merged
/// when an operation combines lazy values. Either every transpose in a group
/// is removed or none is.
#[derive(Debug, Default)]
struct Analysis {
    lazy: FxHashMap<VarId, Lazy>,

    /// Transpose starting each group, indexed by group.
    origins: Vec<OpId>,
    parents: Vec<usize>,

    /// Transposes which undo a lazy value.
    cancels: Vec<(OpId, usize)>,

    /// Operations whose inputs must change if their group is rewritten.
    updates: Vec<(OpId, usize, Vec<Rebind>)>,

    /// Operation inputs which need a real transpose if their group is
    /// rewritten.
    materializations: Vec<(OpId, VarId, usize)>,

    /// Function outputs which need a real transpose if their group is
    /// rewritten.
    outputs: Vec<(VarId, usize)>,
}

fn resolve_axis(axis: i32, rank: usize) -> Option<usize> {
    let resolved = if axis < 0 { axis + rank as i32 } else { axis };
    (0..rank as i32)
        .contains(&resolved)
        .then_some(resolved as usize)
}

/// Return true if transposing by `first` then `second` is the identity.
fn transposes_cancel(first: &[usize], second: &[usize]) -> bool {
    first.len() == second.len() && second.iter().enumerate().all(|(i, &p)| first[p] == i)
}

fn inverse_perm(perm: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inverse[p] = i;
    }
    inverse
}

/// Type of `x` given the type of `transpose(x, perm)`.
fn untransposed_type(ty: &ValueType, perm: &[usize]) -> ValueType {
    let ValueType::Tensor(tensor) = ty else {
        return ty.clone();
    };
    match tensor.shape.dims() {
        Some(dims) if dims.len() == perm.len() => {
            let mut untransposed = dims.to_vec();
            for (i, &p) in perm.iter().enumerate() {
                untransposed[p] = dims[i];
            }
            ValueType::Tensor(TensorType::new(
                Shape::from_dims(untransposed),
                tensor.dtype,
            ))
        }
        _ => ty.clone(),
    }
}

fn permuted(value: &Value, perm: &[usize]) -> Result<Value, OpError> {
    Ok(map_tensor!(value, t => t.permuted(perm).to_tensor()))
}

fn reshaped(value: &Value, shape: &[usize]) -> Result<Value, OpError> {
    Ok(map_tensor!(value, t => Tensor::from_data(shape, t.to_vec())))
}

fn single_var(program: &Program, op: OpId, name: &str) -> Option<VarId> {
    match program.op(op).input(name)? {
        Binding::Var(var) => Some(*var),
        Binding::List(_) => None,
    }
}

fn is_scalar(program: &Program, var: VarId) -> bool {
    program
        .var(var)
        .tensor_type()
        .and_then(|t| t.shape.dims())
        .is_some_and(|dims| dims.is_empty())
}

/// Move the padding for each axis of a transposed value to the matching
/// axis of the value it was transposed from.
fn untransposed_pad(pad: &[i32], perm: &[usize], mode: &str) -> Option<Vec<i32>> {
    let rank = perm.len();
    if pad.len() % 2 != 0 || pad.len() > 2 * rank {
        return None;
    }
    let mut pairs = vec![[0, 0]; rank - pad.len() / 2];
    pairs.extend(pad.chunks(2).map(|pair| [pair[0], pair[1]]));

    let mut moved = vec![[0, 0]; rank];
    for (i, &p) in perm.iter().enumerate() {
        moved[p] = pairs[i];
    }
    if mode != "constant" && moved[..rank.saturating_sub(2)].iter().any(|p| *p != [0, 0]) {
        return None;
    }

    let leading_zeros = moved
        .iter()
        .take(rank - 1)
        .take_while(|pair| **pair == [0, 0])
        .count();
    Some(moved[leading_zeros..].iter().flatten().copied().collect())
}

impl Analysis {
    fn scan(program: &Program, function: FunctionId) -> Analysis {
        let mut analysis = Analysis::default();
        let func = program.func(function);
        let outputs: FxHashSet<VarId> = func.outputs().iter().copied().collect();

        for &op_id in func.ops() {
            let op_type = program.op(op_id).op_type();
            let passed = match op_type {
                "const" => true,
                "transpose" => analysis.visit_transpose(program, op_id, &outputs),
                "concat" => analysis.visit_concat(program, op_id),
                "pad" => analysis.visit_pad(program, op_id),
                _ if UNARY_LIKE_OPS.contains(&op_type) => analysis.visit_unary(program, op_id),
                _ if BINARY_OPS.contains(&op_type) => analysis.visit_binary(program, op_id),
                _ if REDUCE_OPS.contains(&op_type) => analysis.visit_reduce(program, op_id),
                _ => false,
            };
            if !passed {
                analysis.materialize_inputs(program, op_id);
            }
        }

        let mut seen = FxHashSet::default();
        for &var in func.outputs() {
            if let Some(lazy) = analysis.lazy.get(&var) {
                if seen.insert(var) {
                    analysis.outputs.push((var, lazy.group));
                }
            }
        }
        analysis
    }

    fn find(&mut self, group: usize) -> usize {
        let mut root = group;
        while self.parents[root] != root {
            root = self.parents[root];
        }
        let mut node = group;
        while self.parents[node] != root {
            let next = self.parents[node];
            self.parents[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) -> usize {
        let (a, b) = (self.find(a), self.find(b));
        self.parents[b] = a;
        a
    }

    /// Mark the single output of `op` as lazy.
    fn set_lazy_output(&mut self, program: &Program, op: OpId, perm: Vec<usize>, group: usize) {
        let out = program.op(op).outputs()[0];
        let ty = program.var(out).ty().clone();
        self.lazy.insert(out, Lazy { perm, group, ty });
    }

    fn materialize_inputs(&mut self, program: &Program, op: OpId) {
        let mut seen = FxHashSet::default();
        for var in program.op(op).input_vars() {
            if let Some(lazy) = self.lazy.get(&var) {
                if seen.insert(var) {
                    self.materializations.push((op, var, lazy.group));
                }
            }
        }
    }

    fn visit_transpose(
        &mut self,
        program: &Program,
        op: OpId,
        outputs: &FxHashSet<VarId>,
    ) -> bool {
        let (Some(x), Some(perm)) = (single_var(program, op, "x"), single_var(program, op, "perm"))
        else {
            return false;
        };
        let Some(perm) = program.var(perm).value().and_then(|v| v.to_i32_vec().ok()) else {
            return false;
        };
        let Some(perm) = perm
            .iter()
            .map(|&p| resolve_axis(p, perm.len()))
            .collect::<Option<Vec<_>>>()
        else {
            return false;
        };

        if let Some(lazy) = self.lazy.get(&x) {
            if !transposes_cancel(&lazy.perm, &perm) {
                return false;
            }
            self.cancels.push((op, lazy.group));
            return true;
        }

        let x_var = program.var(x);
        let out = program.op(op).outputs()[0];
        let rank = x_var.tensor_type().and_then(|t| t.shape.dims()).map(|d| d.len());
        if perm.len() < 2
            || rank != Some(perm.len())
            || x_var.value().is_some()
            || outputs.contains(&out)
        {
            return false;
        }
        let group = self.origins.len();
        self.origins.push(op);
        self.parents.push(group);
        self.set_lazy_output(program, op, perm, group);
        true
    }

    fn visit_unary(&mut self, program: &Program, op: OpId) -> bool {
        let Some(lazy) = single_var(program, op, "x").and_then(|x| self.lazy.get(&x)) else {
            return false;
        };
        let node = program.op(op);
        let others_scalar = node
            .inputs()
            .iter()
            .filter(|(param, _)| param != "x")
            .flat_map(|(_, binding)| binding.vars())
            .all(|var| is_scalar(program, *var));
        if !others_scalar || node.outputs().len() != 1 {
            return false;
        }
        let (perm, group) = (lazy.perm.clone(), lazy.group);
        self.set_lazy_output(program, op, perm, group);
        true
    }

    fn visit_binary(&mut self, program: &Program, op: OpId) -> bool {
        let (Some(x), Some(y)) = (single_var(program, op, "x"), single_var(program, op, "y"))
        else {
            return false;
        };
        let (lazy_x, lazy_y) = (self.lazy.get(&x).cloned(), self.lazy.get(&y).cloned());
        let (lazy, other) = match (lazy_x, lazy_y) {
            (Some(a), Some(b)) => {
                if a.perm != b.perm {
                    return false;
                }
                let group = self.union(a.group, b.group);
                self.set_lazy_output(program, op, a.perm, group);
                return true;
            }
            (Some(lazy), None) => (lazy, y),
            (None, Some(lazy)) => (lazy, x),
            (None, None) => return false,
        };

        let Some(value) = program.var(other).value() else {
            return false;
        };
        match value.ndim() {
            0 => {}
            1 => {
                let rank = lazy.perm.len();
                let mut shape = vec![1; rank];
                shape[lazy.perm[rank - 1]] = value.len();
                let Ok(value) = reshaped(value, &shape) else {
                    return false;
                };
                self.updates
                    .push((op, lazy.group, vec![Rebind::Operand(other, value)]));
            }
            _ => return false,
        }
        self.set_lazy_output(program, op, lazy.perm, lazy.group);
        true
    }

    fn visit_reduce(&mut self, program: &Program, op: OpId) -> bool {
        let Some(lazy) = single_var(program, op, "x").and_then(|x| self.lazy.get(&x).cloned())
        else {
            return false;
        };
        let keep_dims = single_var(program, op, "keep_dims")
            .and_then(|var| program.var(var).value())
            .and_then(|value| value.scalar_bool().ok());
        if keep_dims != Some(true) {
            return false;
        }

        if let Some(axes) = single_var(program, op, "axes") {
            let Some(axes) = program.var(axes).value().and_then(|v| v.to_i32_vec().ok()) else {
                return false;
            };
            let Some(axes) = axes
                .iter()
                .map(|&axis| resolve_axis(axis, lazy.perm.len()).map(|a| lazy.perm[a] as i32))
                .collect::<Option<Vec<_>>>()
            else {
                return false;
            };
            self.updates.push((
                op,
                lazy.group,
                vec![Rebind::Param("axes", Value::from(axes))],
            ));
        }
        self.set_lazy_output(program, op, lazy.perm, lazy.group);
        true
    }

    fn visit_concat(&mut self, program: &Program, op: OpId) -> bool {
        let Some(Binding::List(values)) = program.op(op).input("values") else {
            return false;
        };
        let Some(lazy) = values.iter().find_map(|var| self.lazy.get(var)).cloned() else {
            return false;
        };
        let rank = lazy.perm.len();
        let Some(axis) = single_var(program, op, "axis")
            .and_then(|var| program.var(var).value())
            .and_then(|value| value.scalar_i32().ok())
            .and_then(|axis| resolve_axis(axis, rank))
        else {
            return false;
        };

        let inverse = inverse_perm(&lazy.perm);
        let mut rebinds = vec![Rebind::Param("axis", Value::from(lazy.perm[axis] as i32))];
        let mut groups = Vec::new();
        for &var in values {
            if let Some(other) = self.lazy.get(&var) {
                if other.perm != lazy.perm {
                    return false;
                }
                groups.push(other.group);
                continue;
            }
            let Some(value) = program.var(var).value() else {
                return false;
            };
            if value.ndim() != rank {
                return false;
            }
            if rebinds
                .iter()
                .any(|r| matches!(r, Rebind::Operand(seen, _) if *seen == var))
            {
                continue;
            }
            let Ok(value) = permuted(value, &inverse) else {
                return false;
            };
            rebinds.push(Rebind::Operand(var, value));
        }

        let mut group = lazy.group;
        for other in groups {
            group = self.union(group, other);
        }
        self.updates.push((op, group, rebinds));
        self.set_lazy_output(program, op, lazy.perm, group);
        true
    }

    fn visit_pad(&mut self, program: &Program, op: OpId) -> bool {
        let Some(lazy) = single_var(program, op, "x").and_then(|x| self.lazy.get(&x)) else {
            return false;
        };
        let node = program.op(op);
        let others_known = node
            .inputs()
            .iter()
            .filter(|(param, _)| param != "x")
            .flat_map(|(_, binding)| binding.vars())
            .all(|var| program.var(*var).value().is_some() && !self.lazy.contains_key(var));
        if !others_known {
            return false;
        }
        let mode = single_var(program, op, "mode")
            .and_then(|var| program.var(var).value())
            .and_then(|value| value.as_str().ok())
            .unwrap_or("constant");
        let Some(pad) = single_var(program, op, "pad")
            .and_then(|var| program.var(var).value())
            .and_then(|value| value.to_i32_vec().ok())
        else {
            return false;
        };
        let Some(pad) = untransposed_pad(&pad, &lazy.perm, mode) else {
            return false;
        };

        let lazy = lazy.clone();
        self.updates.push((
            op,
            lazy.group,
            vec![Rebind::Param("pad", Value::from(pad))],
        ));
        self.set_lazy_output(program, op, lazy.perm, lazy.group);
        true
    }

    /// Return, for each group, whether rewriting it removes more transposes
    /// than it adds.
    fn select_groups(&mut self) -> Vec<bool> {
        let n_groups = self.origins.len();
        let mut removed = vec![0usize; n_groups];
        let mut added = vec![0usize; n_groups];

        let origin_groups: Vec<usize> = (0..n_groups).collect();
        let cancel_groups: Vec<usize> = self.cancels.iter().map(|(_, g)| *g).collect();
        for group in origin_groups.into_iter().chain(cancel_groups) {
            removed[self.find(group)] += 1;
        }

        let materialized: Vec<usize> = self
            .materializations
            .iter()
            .map(|(_, _, g)| *g)
            .chain(self.outputs.iter().map(|(_, g)| *g))
            .collect();
        for group in materialized {
            added[self.find(group)] += 1;
        }

        (0..n_groups)
            .map(|group| {
                let root = self.find(group);
                added[root] < removed[root]
            })
            .collect()
    }
}

fn insert_const(
    program: &mut Program,
    function: FunctionId,
    value: Value,
    ops: &mut Vec<OpId>,
) -> VarId {
    let name = program.unique_name("const");
    let ty = value.value_type();
    let op = Operation::constant(name, value.clone(), function);
    let id = program.add_detached_op(op, vec![ty], vec![Some(value)]);
    ops.push(id);
    program.op(id).outputs()[0]
}

fn insert_transpose(
    program: &mut Program,
    function: FunctionId,
    x: VarId,
    perm: &[usize],
    ty: ValueType,
    ops: &mut Vec<OpId>,
) -> VarId {
    let perm_value = Value::from(perm.iter().map(|&p| p as i32).collect::<Vec<_>>());
    let perm_var = insert_const(program, function, perm_value, ops);
    let mut op = Operation::new(program.unique_name("transpose"), "transpose", function);
    op.push_input("x", Binding::Var(x));
    op.push_input("perm", Binding::Var(perm_var));
    let id = program.add_detached_op(op, vec![ty], vec![None]);
    ops.push(id);
    program.op(id).outputs()[0]
}

/// Remove transposes which cancel out further along a function, moving the
/// operations between them into the untransposed layout.
///
/// A transpose starts a lazy value which flows through elementwise
/// operations and through operations that can be adjusted to the other
/// layout, such as reductions with `keep_dims`, `concat` and `pad`. A
/// transpose that undoes a lazy value cancels it. Any other use of a lazy
/// value, including returning it from the function, needs a transpose to be
/// inserted in front of it. Transposes are only removed where this reduces
/// their number.
///
/// Functions containing control flow are left unchanged.
#[derive(Debug, Default)]
pub struct TransposeReduction {}

impl TransposeReduction {
    fn run_function(&self, program: &mut Program, function: FunctionId) -> usize {
        let func = program.func(function);
        if func
            .ops()
            .iter()
            .any(|op| !program.op(*op).functions().is_empty())
        {
            debug!(function = func.name(), "skipping function with control flow");
            return 0;
        }

        let mut analysis = Analysis::scan(program, function);
        let selected = analysis.select_groups();
        if !selected.iter().any(|s| *s) {
            return 0;
        }
        let is_selected = |analysis: &mut Analysis, group: usize| selected[analysis.find(group)];

        // Removed transposes, and the variable each one's output becomes.
        let mut replacements: FxHashMap<VarId, VarId> = FxHashMap::default();
        let mut removed_ops: FxHashSet<OpId> = FxHashSet::default();
        for group in 0..analysis.origins.len() {
            if is_selected(&mut analysis, group) {
                let op = analysis.origins[group];
                removed_ops.insert(op);
                if let Some(x) = single_var(program, op, "x") {
                    replacements.insert(program.op(op).outputs()[0], x);
                }
            }
        }
        for i in 0..analysis.cancels.len() {
            let (op, group) = analysis.cancels[i];
            if is_selected(&mut analysis, group) {
                removed_ops.insert(op);
                if let Some(x) = single_var(program, op, "x") {
                    replacements.insert(program.op(op).outputs()[0], x);
                }
            }
        }
        let resolve = |mut var: VarId| {
            while let Some(&next) = replacements.get(&var) {
                var = next;
            }
            var
        };

        let mut materialize_at: FxHashMap<OpId, Vec<VarId>> = FxHashMap::default();
        for i in 0..analysis.materializations.len() {
            let (op, var, group) = analysis.materializations[i];
            if is_selected(&mut analysis, group) {
                materialize_at.entry(op).or_default().push(var);
            }
        }
        let mut updates_at: FxHashMap<OpId, Vec<Rebind>> = FxHashMap::default();
        for (op, group, rebinds) in std::mem::take(&mut analysis.updates) {
            if is_selected(&mut analysis, group) {
                updates_at.entry(op).or_default().extend(rebinds);
            }
        }

        let old_ops = program.func(function).ops().to_vec();
        let mut ops = Vec::with_capacity(old_ops.len());
        let mut added = 0;
        for op_id in old_ops {
            if removed_ops.contains(&op_id) {
                continue;
            }
            for var in materialize_at.remove(&op_id).unwrap_or_default() {
                let lazy = &analysis.lazy[&var];
                let (perm, ty) = (lazy.perm.clone(), lazy.ty.clone());
                let transposed = insert_transpose(program, function, resolve(var), &perm, ty, &mut ops);
                program.op_mut(op_id).replace_input(var, transposed);
                added += 1;
            }
            for rebind in updates_at.remove(&op_id).unwrap_or_default() {
                match rebind {
                    Rebind::Param(name, value) => {
                        let var = insert_const(program, function, value, &mut ops);
                        program.op_mut(op_id).set_input(name, var);
                    }
                    Rebind::Operand(old, value) => {
                        let var = insert_const(program, function, value, &mut ops);
                        program.op_mut(op_id).replace_input(old, var);
                    }
                }
            }
            ops.push(op_id);
        }

        let mut output_transposes = FxHashMap::default();
        for i in 0..analysis.outputs.len() {
            let (var, group) = analysis.outputs[i];
            if is_selected(&mut analysis, group) {
                let lazy = &analysis.lazy[&var];
                let (perm, ty) = (lazy.perm.clone(), lazy.ty.clone());
                let transposed = insert_transpose(program, function, resolve(var), &perm, ty, &mut ops);
                output_transposes.insert(var, transposed);
                added += 1;
            }
        }
        *program.func_mut(function).ops_mut() = ops;
        for output in program.func_mut(function).outputs_mut() {
            if let Some(&transposed) = output_transposes.get(output) {
                *output = transposed;
            }
        }

        for &old in replacements.keys() {
            program.replace_var_uses(function, 0, old, resolve(old));
        }

        let lazy_vars: Vec<(VarId, Lazy)> = analysis
            .lazy
            .iter()
            .map(|(var, lazy)| (*var, lazy.clone()))
            .collect();
        for (var, lazy) in lazy_vars {
            if is_selected(&mut analysis, lazy.group) && !replacements.contains_key(&var) {
                program
                    .var_mut(var)
                    .set_type(untransposed_type(&lazy.ty, &lazy.perm));
            }
        }

        debug!(
            function = program.func(function).name(),
            removed = removed_ops.len(),
            added,
            "reduced transposes"
        );
        removed_ops.len()
    }
}

impl Pass for TransposeReduction {
    fn name(&self) -> &'static str {
        "reduce_transposes"
    }

    fn run(&self, program: &mut Program, _registry: &OpRegistry) -> Result<PassStats, PassError> {
        let mut changed = 0;
        for function in entry_points(program) {
            changed += self.run_function(program, function);
        }
        Ok(PassStats { changed })
    }
}

#[cfg(test)]
mod tests {
    use mil_testing::assert_close;
    use rten_tensor::Tensor;

    use super::{untransposed_pad, TransposeReduction};
    use crate::builder::{Arg, Builder};
    use crate::graph::{run_function, BuildError, FunctionId, Program, VarId};
    use crate::op_registry::OpRegistry;
    use crate::passes::Pass;
    use crate::types::{tensor_type, DType, ValueType};
    use crate::value::Value;

    /// Types of the non-constant operations of a function.
    fn op_types(program: &Program, function: FunctionId) -> Vec<&str> {
        program
            .func(function)
            .ops()
            .iter()
            .map(|op| program.op(*op).op_type())
            .filter(|op_type| *op_type != "const")
            .collect()
    }

    fn const_input(program: &Program, op_type: &str, param: &str) -> Value {
        let op = program.find_ops(None, Some(op_type))[0];
        let var = program.op(op).input(param).unwrap().vars()[0];
        program.var(var).value().cloned().unwrap()
    }

    /// Build `main(x)`, run the pass and check that it removes `removed`
    /// transposes without changing the outputs or invalidating their types.
    fn reduce_and_check<F>(shape: &[usize], removed: usize, build: F) -> (Program, FunctionId)
    where
        F: FnOnce(&mut Builder, &[VarId]) -> Result<Vec<VarId>, BuildError>,
    {
        let mut program = Program::new();
        let main = Builder::new(&mut program)
            .function("main", [("x", tensor_type(shape, DType::Fp32))], build)
            .unwrap();
        let len: usize = shape.iter().product();
        let x = Value::from(Tensor::from_data(
            shape,
            (0..len).map(|i| i as f32 - 5.).collect::<Vec<_>>(),
        ));
        let registry = OpRegistry::global();
        let expected = run_function(&program, registry, main, vec![x.clone()], None).unwrap();

        let stats = TransposeReduction::default()
            .run(&mut program, registry)
            .unwrap();
        assert_eq!(stats.changed, removed);

        let actual = run_function(&program, registry, main, vec![x], None).unwrap();
        assert_eq!(actual.len(), expected.len());
        for (actual, expected) in actual.iter().zip(&expected) {
            assert_eq!(actual.shape(), expected.shape());
            assert_close(
                &actual.to_f32_vec().unwrap(),
                &expected.to_f32_vec().unwrap(),
                1e-5,
                1e-5,
            );
        }
        for (ty, value) in program.output_types(main).into_iter().zip(&actual) {
            assert!(value.matches_type(ty), "{} does not match {}", value, ty);
        }
        (program, main)
    }

    #[test]
    fn test_cancel_through_unary_ops() {
        let (program, main) = reduce_and_check(&[2, 3], 2, |mb, x| {
            let t = mb.op("transpose").arg("x", x[0]).arg("perm", [1, 0]).build1()?;
            let y = mb.op("relu").arg("x", t).build1()?;
            let y = mb
                .op("clip")
                .arg("x", y)
                .arg("alpha", 0f32)
                .arg("beta", 4f32)
                .build1()?;
            let out = mb.op("transpose").arg("x", y).arg("perm", [1, 0]).build1()?;
            Ok(vec![out])
        });
        assert_eq!(op_types(&program, main), ["relu", "clip"]);

        let out = program.func(main).outputs()[0];
        let expected: ValueType = tensor_type([2, 3], DType::Fp32).into();
        assert_eq!(program.var(out).ty(), &expected);
    }

    #[test]
    fn test_binary_op_with_vector_constant() {
        let (program, main) = reduce_and_check(&[2, 3, 4], 2, |mb, x| {
            let t = mb
                .op("transpose")
                .arg("x", x[0])
                .arg("perm", [0, 2, 1])
                .build1()?;
            let y = mb.op("add").arg("x", t).arg("y", [1f32, 2., 3.]).build1()?;
            let y = mb.op("mul").arg("x", y).arg("y", 2f32).build1()?;
            let out = mb
                .op("transpose")
                .arg("x", y)
                .arg("perm", [0, 2, 1])
                .build1()?;
            Ok(vec![out])
        });
        assert_eq!(op_types(&program, main), ["add", "mul"]);
        assert_eq!(const_input(&program, "add", "y").shape(), [1, 3, 1]);
        assert_eq!(const_input(&program, "mul", "y").ndim(), 0);
    }

    #[test]
    fn test_lazy_values_combined_by_binary_op() {
        let (program, main) = reduce_and_check(&[2, 3], 3, |mb, x| {
            let a = mb.op("transpose").arg("x", x[0]).arg("perm", [1, 0]).build1()?;
            let s = mb.op("sigmoid").arg("x", x[0]).build1()?;
            let b = mb.op("transpose").arg("x", s).arg("perm", [1, 0]).build1()?;
            let y = mb.op("sub").arg("x", a).arg("y", b).build1()?;
            let out = mb.op("transpose").arg("x", y).arg("perm", [1, 0]).build1()?;
            Ok(vec![out])
        });
        assert_eq!(op_types(&program, main), ["sigmoid", "sub"]);
    }

    #[test]
    fn test_reduce_axes_follow_transpose() {
        let (program, _) = reduce_and_check(&[2, 3, 4], 2, |mb, x| {
            let t = mb
                .op("transpose")
                .arg("x", x[0])
                .arg("perm", [2, 0, 1])
                .build1()?;
            let y = mb
                .op("reduce_sum")
                .arg("x", t)
                .arg("axes", [-1])
                .arg("keep_dims", true)
                .build1()?;
            let out = mb
                .op("transpose")
                .arg("x", y)
                .arg("perm", [1, 2, 0])
                .build1()?;
            Ok(vec![out])
        });
        assert_eq!(
            const_input(&program, "reduce_sum", "axes").to_i32_vec().unwrap(),
            [1]
        );
    }

    #[test]
    fn test_reduce_without_keep_dims_blocks_rewrite() {
        let (program, main) = reduce_and_check(&[2, 3, 4], 0, |mb, x| {
            let t = mb
                .op("transpose")
                .arg("x", x[0])
                .arg("perm", [2, 0, 1])
                .build1()?;
            let y = mb.op("reduce_max").arg("x", t).arg("axes", [0]).build1()?;
            let out = mb.op("transpose").arg("x", y).arg("perm", [1, 0]).build1()?;
            Ok(vec![out])
        });
        assert_eq!(
            op_types(&program, main),
            ["transpose", "reduce_max", "transpose"]
        );
    }

    #[test]
    fn test_concat_with_constant() {
        let (program, _) = reduce_and_check(&[2, 3], 2, |mb, x| {
            let t = mb.op("transpose").arg("x", x[0]).arg("perm", [1, 0]).build1()?;
            let values: Vec<Arg> = vec![t.into(), Tensor::from([[7f32, 8.]]).into()];
            let y = mb.op("concat").arg("values", values).arg("axis", 0).build1()?;
            let out = mb.op("transpose").arg("x", y).arg("perm", [1, 0]).build1()?;
            Ok(vec![out])
        });
        assert_eq!(
            const_input(&program, "concat", "axis").scalar_i32().unwrap(),
            1
        );

        let concat = program.find_ops(None, Some("concat"))[0];
        let Some(crate::graph::Binding::List(values)) = program.op(concat).input("values") else {
            panic!("values should be a list");
        };
        let constant = program.var(values[1]).value().unwrap();
        assert_eq!(constant.shape(), [2, 1]);
        assert_eq!(constant.to_f32_vec().unwrap(), [7., 8.]);
    }

    #[test]
    fn test_pad_moves_to_untransposed_axes() {
        let (program, _) = reduce_and_check(&[1, 2, 3, 4], 2, |mb, x| {
            let t = mb
                .op("transpose")
                .arg("x", x[0])
                .arg("perm", [0, 2, 3, 1])
                .build1()?;
            let y = mb.op("pad").arg("x", t).arg("pad", [1, 1, 2, 2]).build1()?;
            let out = mb
                .op("transpose")
                .arg("x", y)
                .arg("perm", [0, 3, 1, 2])
                .build1()?;
            Ok(vec![out])
        });
        assert_eq!(
            const_input(&program, "pad", "pad").to_i32_vec().unwrap(),
            [2, 2, 0, 0, 1, 1]
        );
    }

    #[test]
    fn test_untransposed_pad() {
        let perm = [0, 2, 3, 1];
        assert_eq!(
            untransposed_pad(&[1, 1, 2, 2], &perm, "constant"),
            Some(vec![2, 2, 0, 0, 1, 1])
        );
        // Non-constant modes may only pad the last two axes.
        assert_eq!(untransposed_pad(&[1, 1, 2, 2], &perm, "reflect"), None);
        assert_eq!(
            untransposed_pad(&[1, 1, 2, 2], &[0, 1, 3, 2], "reflect"),
            Some(vec![2, 2, 1, 1])
        );
        assert_eq!(untransposed_pad(&[1, 1, 1], &perm, "constant"), None);
    }

    #[test]
    fn test_materialized_where_lazy_value_escapes() {
        let (program, main) = reduce_and_check(&[2, 3], 2, |mb, x| {
            let t = mb.op("transpose").arg("x", x[0]).arg("perm", [1, 0]).build1()?;
            let y = mb.op("exp").arg("x", t).build1()?;
            let soft = mb.op("softmax").arg("x", y).build1()?;
            let out = mb.op("transpose").arg("x", y).arg("perm", [1, 0]).build1()?;
            Ok(vec![soft, out])
        });
        assert_eq!(op_types(&program, main), ["exp", "transpose", "softmax"]);
        assert_eq!(program.find_ops(None, Some("transpose")).len(), 1);
    }

    #[test]
    fn test_no_rewrite_when_transposes_would_not_decrease() {
        // One transpose removed, one inserted before the output.
        reduce_and_check(&[2, 3], 0, |mb, x| {
            let t = mb.op("transpose").arg("x", x[0]).arg("perm", [1, 0]).build1()?;
            Ok(vec![mb.op("relu").arg("x", t).build1()?])
        });

        // Two removed, two inserted.
        reduce_and_check(&[2, 3], 0, |mb, x| {
            let t = mb.op("transpose").arg("x", x[0]).arg("perm", [1, 0]).build1()?;
            let y = mb.op("relu").arg("x", t).build1()?;
            let a = mb.op("softmax").arg("x", y).build1()?;
            let b = mb.op("transpose").arg("x", y).arg("perm", [1, 0]).build1()?;
            Ok(vec![a, b, y])
        });
    }

    #[test]
    fn test_function_with_control_flow_is_unchanged() {
        let mut program = Program::new();
        let main = Builder::new(&mut program)
            .function(
                "main",
                [
                    ("x", tensor_type([2, 3], DType::Fp32)),
                    ("p", tensor_type([], DType::Bool)),
                ],
                |mb, inputs| {
                    let t = mb
                        .op("transpose")
                        .arg("x", inputs[0])
                        .arg("perm", [1, 0])
                        .build1()?;
                    let back = mb.op("transpose").arg("x", t).arg("perm", [1, 0]).build1()?;
                    mb.cond(
                        inputs[1],
                        |mb| Ok(vec![mb.op("relu").arg("x", back).build1()?]),
                        |mb| Ok(vec![mb.op("abs").arg("x", back).build1()?]),
                    )
                },
            )
            .unwrap();

        let stats = TransposeReduction::default()
            .run(&mut program, OpRegistry::global())
            .unwrap();
        assert_eq!(stats.changed, 0);
        assert_eq!(op_types(&program, main), ["transpose", "transpose", "cond"]);
    }
}
