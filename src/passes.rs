//! Program-level optimization passes.
//!
//! Passes operate on closed programs. They never change the values a
//! function computes for its outputs.

use std::error::Error;
use std::fmt::{Display, Formatter};

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::builder::refine_type;
use crate::graph::{
    conform_values, fold_operation, FunctionId, OpId, Operation, Producer, Program, ValueEnv,
    VarId,
};
use crate::op_registry::OpRegistry;
use crate::operator::{ErrorKind, OpError};
use crate::types::ValueType;

mod transposes;

pub use transposes::TransposeReduction;

/// Errors that occur while running passes.
#[derive(Clone, Debug, PartialEq)]
pub enum PassError {
    /// A function of the program has not been closed.
    FunctionOpen(String),

    /// Evaluating an operation during constant propagation failed.
    Eval { op: String, error: OpError },
}

impl PassError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FunctionOpen(_) => ErrorKind::InvalidProgram,
            Self::Eval { error, .. } => error.kind(),
        }
    }
}

impl Display for PassError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Self::FunctionOpen(name) => write!(f, "function \"{}\" is still open", name),
            Self::Eval { op, error } => write!(f, "evaluating \"{}\" failed: {}", op, error),
        }
    }
}

impl Error for PassError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Eval { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Summary of the changes made by a pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PassStats {
    /// Number of operations folded, replaced or removed.
    pub changed: usize,
}

/// A transformation of a closed program.
pub trait Pass {
    fn name(&self) -> &'static str;

    fn run(&self, program: &mut Program, registry: &OpRegistry) -> Result<PassStats, PassError>;
}

/// Return the top-level functions of a program.
fn entry_points(program: &Program) -> Vec<FunctionId> {
    program.entry_points().map(|(_, id)| id).collect()
}

/// Count operations in a function and the functions nested in it.
fn count_ops(program: &Program, function: FunctionId) -> usize {
    program
        .func(function)
        .ops()
        .iter()
        .map(|op| {
            1 + program
                .op(*op)
                .functions()
                .iter()
                .map(|nested| count_ops(program, *nested))
                .sum::<usize>()
        })
        .sum()
}

fn has_value(program: &Program, var: VarId) -> bool {
    program.var(var).value().is_some()
}

/// Evaluate operations whose inputs are all known, recording the results
/// on their output variables.
///
/// Nested functions are processed before the operation that owns them, so
/// values available inside a loop body are folded even when the loop itself
/// is not. Running the pass twice makes no further changes.
#[derive(Debug, Default)]
pub struct ConstantPropagation {}

impl ConstantPropagation {
    fn run_function(
        &self,
        program: &mut Program,
        registry: &OpRegistry,
        function: FunctionId,
    ) -> Result<usize, PassError> {
        let mut folded = 0;
        let ops = program.func(function).ops().to_vec();
        for op_id in ops {
            for nested in program.op(op_id).functions().to_vec() {
                folded += self.run_function(program, registry, nested)?;
            }

            let op = program.op(op_id);
            if op.outputs().iter().all(|var| has_value(program, *var)) {
                continue;
            }

            let env = ValueEnv::new(None);
            let eval_error = |error| PassError::Eval {
                op: op.name().to_string(),
                error,
            };
            let Some(values) = fold_operation(
                program,
                registry,
                op.op_type(),
                op.inputs(),
                op.functions(),
                &env,
            )
            .map_err(eval_error)?
            else {
                continue;
            };
            let types: Vec<ValueType> = op
                .outputs()
                .iter()
                .map(|var| program.var(*var).ty().clone())
                .collect();
            let values = conform_values(values, &types).map_err(eval_error)?;

            let outputs = op.outputs().to_vec();
            for ((var, ty), value) in outputs.into_iter().zip(types).zip(values) {
                let var = program.var_mut(var);
                var.set_type(refine_type(ty, &value));
                var.set_value(Some(value));
            }
            folded += 1;
        }
        Ok(folded)
    }
}

impl Pass for ConstantPropagation {
    fn name(&self) -> &'static str {
        "constant_propagation"
    }

    fn run(&self, program: &mut Program, registry: &OpRegistry) -> Result<PassStats, PassError> {
        let mut changed = 0;
        for function in entry_points(program) {
            changed += self.run_function(program, registry, function)?;
        }
        Ok(PassStats { changed })
    }
}

/// Replace operations whose outputs are all known with `const` operations.
///
/// The output variables are kept and re-attached to the new constants, so
/// operations reading them need no rewiring.
#[derive(Debug, Default)]
pub struct ConstElimination {}

impl ConstElimination {
    fn run_function(&self, program: &mut Program, function: FunctionId) -> usize {
        let mut replaced = 0;
        let mut new_ops: Vec<OpId> = Vec::with_capacity(program.func(function).ops().len());

        for op_id in program.func(function).ops().to_vec() {
            let op = program.op(op_id);
            let known = !op.is_const()
                && !op.outputs().is_empty()
                && op.outputs().iter().all(|var| has_value(program, *var));
            if !known {
                for nested in op.functions().to_vec() {
                    replaced += self.run_function(program, nested);
                }
                new_ops.push(op_id);
                continue;
            }

            for var_id in op.outputs().to_vec() {
                let var = program.var(var_id);
                let Some(value) = var.value().cloned() else {
                    continue;
                };
                let mut constant = Operation::constant(var.name().to_string(), value, function);
                constant.set_outputs(&[var_id]);
                let const_id = program.push_detached_op(constant);
                program
                    .var_mut(var_id)
                    .set_producer(Producer::Op(const_id, 0));
                new_ops.push(const_id);
            }
            replaced += 1;
        }

        *program.func_mut(function).ops_mut() = new_ops;
        replaced
    }
}

impl Pass for ConstElimination {
    fn name(&self) -> &'static str {
        "const_elimination"
    }

    fn run(&self, program: &mut Program, _registry: &OpRegistry) -> Result<PassStats, PassError> {
        let mut changed = 0;
        for function in entry_points(program) {
            changed += self.run_function(program, function);
        }
        Ok(PassStats { changed })
    }
}

/// Remove operations whose outputs do not contribute to a function's
/// outputs.
///
/// Liveness flows into nested functions through their captures, and the
/// capture lists are recomputed after removal.
#[derive(Debug, Default)]
pub struct DeadCodeElimination {}

impl DeadCodeElimination {
    fn run_function(&self, program: &mut Program, function: FunctionId) -> usize {
        let mut live: FxHashSet<VarId> = program.func(function).outputs().iter().copied().collect();
        let mut removed = 0;
        let mut kept = Vec::new();

        for op_id in program.func(function).ops().iter().rev().copied().collect::<Vec<_>>() {
            let used = program
                .op(op_id)
                .outputs()
                .iter()
                .any(|var| live.contains(var));
            if !used {
                removed += 1;
                continue;
            }

            for nested in program.op(op_id).functions().to_vec() {
                removed += self.run_function(program, nested);
                live.extend(program.func(nested).captures().iter().copied());
            }
            live.extend(program.op(op_id).input_vars());
            kept.push(op_id);
        }
        kept.reverse();

        // Anything still live but defined elsewhere is captured.
        let captures: Vec<VarId> = program
            .func(function)
            .captures()
            .iter()
            .copied()
            .filter(|var| live.contains(var) && program.var(*var).function() != function)
            .collect();

        let func = program.func_mut(function);
        *func.ops_mut() = kept;
        func.set_captures(captures);
        removed
    }
}

impl Pass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead_code_elimination"
    }

    fn run(&self, program: &mut Program, _registry: &OpRegistry) -> Result<PassStats, PassError> {
        let mut changed = 0;
        for function in entry_points(program) {
            changed += self.run_function(program, function);
        }
        Ok(PassStats { changed })
    }
}

/// Runs a sequence of passes over a program.
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl PassManager {
    pub fn new() -> PassManager {
        PassManager { passes: Vec::new() }
    }

    /// Constant propagation, constant elimination and transpose reduction,
    /// followed by dead code elimination.
    pub fn default_pipeline() -> PassManager {
        let mut manager = PassManager::new();
        manager.add_pass(ConstantPropagation::default());
        manager.add_pass(ConstElimination::default());
        manager.add_pass(TransposeReduction::default());
        manager.add_pass(DeadCodeElimination::default());
        manager
    }

    pub fn add_pass<P: Pass + 'static>(&mut self, pass: P) {
        self.passes.push(Box::new(pass));
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|pass| pass.name()).collect()
    }

    /// Run each pass in turn using operators from [`OpRegistry::global`].
    pub fn run(&self, program: &mut Program) -> Result<Vec<(&'static str, PassStats)>, PassError> {
        self.run_with_registry(program, OpRegistry::global())
    }

    pub fn run_with_registry(
        &self,
        program: &mut Program,
        registry: &OpRegistry,
    ) -> Result<Vec<(&'static str, PassStats)>, PassError> {
        if !program.is_closed() {
            let open = program
                .entry_points()
                .find(|(_, id)| !program.func(*id).is_closed())
                .map(|(name, _)| name.to_string())
                .unwrap_or_else(|| "<nested>".to_string());
            return Err(PassError::FunctionOpen(open));
        }

        let mut stats = Vec::with_capacity(self.passes.len());
        for pass in &self.passes {
            let ops_before: usize = entry_points(program)
                .into_iter()
                .map(|f| count_ops(program, f))
                .sum();
            let pass_stats = pass.run(program, registry)?;
            let ops_after: usize = entry_points(program)
                .into_iter()
                .map(|f| count_ops(program, f))
                .sum();
            debug!(
                pass = pass.name(),
                changed = pass_stats.changed,
                ops_before,
                ops_after,
                "ran pass"
            );
            stats.push((pass.name(), pass_stats));
        }
        Ok(stats)
    }
}

impl Default for PassManager {
    fn default() -> PassManager {
        PassManager::default_pipeline()
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::Tensor;

    use super::{
        ConstElimination, ConstantPropagation, DeadCodeElimination, Pass, PassError, PassManager,
    };
    use crate::builder::{Builder, BuilderOptions};
    use crate::graph::{run_function, FunctionId, Program};
    use crate::op_registry::OpRegistry;
    use crate::operator::ErrorKind;
    use crate::types::{tensor_type, DType};
    use crate::value::Value;

    fn lazy_builder(program: &mut Program) -> Builder<'_> {
        Builder::with_options(
            program,
            OpRegistry::global(),
            BuilderOptions { eager_fold: false },
        )
    }

    /// `main(x) = x + (2 * 3)` plus an unused `relu(x)`, built without
    /// eager folding.
    fn example_program() -> (Program, FunctionId) {
        let mut program = Program::new();
        let mut mb = lazy_builder(&mut program);
        let main = mb
            .function("main", [("x", tensor_type([2], DType::Fp32))], |mb, x| {
                let scale = mb.op("mul").arg("x", 2f32).arg("y", 3f32).build1()?;
                let _unused = mb.op("relu").arg("x", x[0]).build1()?;
                let out = mb.op("add").arg("x", x[0]).arg("y", scale).build1()?;
                Ok(vec![out])
            })
            .unwrap();
        (program, main)
    }

    fn run_main(program: &Program, main: FunctionId) -> Vec<Value> {
        let x = Value::from(Tensor::from([1., -2.]));
        run_function(program, OpRegistry::global(), main, vec![x], None).unwrap()
    }

    #[test]
    fn test_constant_propagation() {
        let (mut program, main) = example_program();
        let registry = OpRegistry::global();
        let mul = program.func(main).ops()[2];
        assert!(program.var(program.op(mul).outputs()[0]).value().is_none());

        let stats = ConstantPropagation::default()
            .run(&mut program, registry)
            .unwrap();
        assert_eq!(stats.changed, 1);
        let folded = program.var(program.op(mul).outputs()[0]).value().cloned();
        assert_eq!(folded, Some(Value::from(6f32)));

        // Folding is idempotent.
        let stats = ConstantPropagation::default()
            .run(&mut program, registry)
            .unwrap();
        assert_eq!(stats.changed, 0);
    }

    #[test]
    fn test_const_elimination_and_dce() {
        let (mut program, main) = example_program();
        let registry = OpRegistry::global();
        ConstantPropagation::default()
            .run(&mut program, registry)
            .unwrap();

        let stats = ConstElimination::default()
            .run(&mut program, registry)
            .unwrap();
        assert_eq!(stats.changed, 1);
        let op_types: Vec<_> = program
            .func(main)
            .ops()
            .iter()
            .map(|op| program.op(*op).op_type())
            .collect();
        assert_eq!(op_types, ["const", "const", "const", "relu", "add"]);

        let stats = DeadCodeElimination::default()
            .run(&mut program, registry)
            .unwrap();
        // The two operands of `mul` and the unused `relu`.
        assert_eq!(stats.changed, 3);
        let op_types: Vec<_> = program
            .func(main)
            .ops()
            .iter()
            .map(|op| program.op(*op).op_type())
            .collect();
        assert_eq!(op_types, ["const", "add"]);
    }

    #[test]
    fn test_default_pipeline_preserves_outputs() {
        let (mut program, main) = example_program();
        let expected = run_main(&program, main);

        let manager = PassManager::default_pipeline();
        assert_eq!(
            manager.pass_names(),
            [
                "constant_propagation",
                "const_elimination",
                "reduce_transposes",
                "dead_code_elimination"
            ]
        );
        let stats = manager.run(&mut program).unwrap();
        assert_eq!(stats.len(), 4);
        assert_eq!(run_main(&program, main), expected);
        assert_eq!(expected[0], Value::from(Tensor::from([7., 4.])));
    }

    #[test]
    fn test_dce_updates_captures() {
        let mut program = Program::new();
        let mut mb = lazy_builder(&mut program);
        let main = mb
            .function(
                "main",
                [
                    ("x", tensor_type([2], DType::Fp32)),
                    ("p", tensor_type([], DType::Bool)),
                ],
                |mb, inputs| {
                    let [x, p] = [inputs[0], inputs[1]];
                    let outs = mb.cond(
                        p,
                        |mb| {
                            let _dead = mb.op("relu").arg("x", x).build1()?;
                            Ok(vec![mb.op("abs").arg("x", x).build1()?])
                        },
                        |mb| Ok(vec![mb.op("square").arg("x", x).build1()?]),
                    )?;
                    Ok(outs)
                },
            )
            .unwrap();

        let cond_op = program.func(main).ops()[0];
        let true_fn = program.op(cond_op).functions()[0];
        assert_eq!(program.func(true_fn).ops().len(), 2);

        let stats = DeadCodeElimination::default()
            .run(&mut program, OpRegistry::global())
            .unwrap();
        assert_eq!(stats.changed, 1);
        assert_eq!(program.func(true_fn).ops().len(), 1);
        assert_eq!(program.func(true_fn).captures().len(), 1);
    }

    #[test]
    fn test_open_program_is_rejected() {
        let mut program = Program::new();
        program.add_function("main", None);
        let err = PassManager::default_pipeline()
            .run(&mut program)
            .err()
            .unwrap();
        assert_eq!(err, PassError::FunctionOpen("main".into()));
        assert_eq!(err.kind(), ErrorKind::InvalidProgram);
    }
}
