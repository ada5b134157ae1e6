use std::fmt;

use super::{FunctionId, Producer, Program, VarId};

/// Graphviz rendering of a function, returned by [`Program::dot`].
///
/// Operations are drawn as boxes and edges are labeled with the variable
/// they carry. Function inputs are filled yellow and outputs goldenrod.
/// `const` operations are omitted. Nested functions are drawn as clusters
/// inside the cluster of their enclosing function.
pub struct DotGraph<'a> {
    program: &'a Program,
    function: FunctionId,
}

fn quote(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

impl DotGraph<'_> {
    /// Return the node an edge carrying `var` starts from, or `None` if the
    /// variable is produced by a constant.
    fn source(&self, var: VarId) -> Option<String> {
        match self.program.var(var).producer() {
            Producer::Placeholder(_) => Some(format!("v{}", var.as_usize())),
            Producer::Op(op, _) if self.program.op(op).is_const() => None,
            Producer::Op(op, _) => Some(format!("op{}", op.as_usize())),
        }
    }

    fn fmt_cluster(
        &self,
        f: &mut fmt::Formatter<'_>,
        function: FunctionId,
        depth: usize,
    ) -> fmt::Result {
        let program = self.program;
        let func = program.func(function);
        let pad = "\t".repeat(depth);

        writeln!(
            f,
            "{}subgraph cluster_{}_{} {{",
            pad,
            func.name().replace(|c: char| !c.is_alphanumeric(), "_"),
            function.as_usize()
        )?;
        writeln!(f, "{}\tlabel=\"{}\";", pad, quote(func.name()))?;

        for &var in func.placeholders() {
            writeln!(
                f,
                "{}\t\"v{}\" [label=\"{}\", style=filled, fillcolor=yellow];",
                pad,
                var.as_usize(),
                quote(program.var(var).name())
            )?;
        }

        for &op_id in func.ops() {
            let op = program.op(op_id);
            if op.is_const() {
                continue;
            }
            writeln!(
                f,
                "{}\t\"op{}\" [label=\"{}\\n{}\", shape=box];",
                pad,
                op_id.as_usize(),
                quote(op.op_type()),
                quote(op.name())
            )?;
            for var in op.input_vars() {
                if let Some(source) = self.source(var) {
                    writeln!(
                        f,
                        "{}\t\"{}\" -> \"op{}\" [label=\"{}\"];",
                        pad,
                        source,
                        op_id.as_usize(),
                        quote(program.var(var).name())
                    )?;
                }
            }
            for &nested in op.functions() {
                self.fmt_cluster(f, nested, depth + 1)?;
            }
        }

        for &var in func.outputs() {
            let name = quote(program.var(var).name());
            writeln!(
                f,
                "{}\t\"out{}_{}\" [label=\"{}\", style=filled, fillcolor=goldenrod2];",
                pad,
                function.as_usize(),
                var.as_usize(),
                name
            )?;
            if let Some(source) = self.source(var) {
                writeln!(
                    f,
                    "{}\t\"{}\" -> \"out{}_{}\" [label=\"{}\"];",
                    pad,
                    source,
                    function.as_usize(),
                    var.as_usize(),
                    name
                )?;
            }
        }

        writeln!(f, "{}}}", pad)
    }
}

impl fmt::Display for DotGraph<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "digraph g {{")?;
        writeln!(f, "\tcompound=true;")?;
        self.fmt_cluster(f, self.function, 1)?;
        write!(f, "}}")
    }
}

impl Program {
    /// Return a Graphviz rendering of `function`.
    ///
    /// ```
    /// use mil_ir::{Builder, DType, Program, tensor_type};
    ///
    /// let mut program = Program::new();
    /// let mut mb = Builder::new(&mut program);
    /// let main = mb
    ///     .function("main", [("x", tensor_type([2], DType::Fp32))], |mb, x| {
    ///         Ok(vec![mb.op("relu").arg("x", x[0]).build1()?])
    ///     })
    ///     .unwrap();
    /// assert!(program.dot(main).to_string().starts_with("digraph g {"));
    /// ```
    pub fn dot(&self, function: FunctionId) -> DotGraph<'_> {
        DotGraph {
            program: self,
            function,
        }
    }

    pub fn to_dot(&self, function: FunctionId) -> String {
        self.dot(function).to_string()
    }
}
