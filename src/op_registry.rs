use std::sync::OnceLock;

use rustc_hash::FxHashMap;

use crate::operator::OpDef;

/// Registry of operators available to the builder, the constant folder and
/// the reference executor.
///
/// New registries have no operators registered by default. To create a
/// registry with all built-in operators pre-registered, use
/// [`OpRegistry::with_all_ops`]. Alternatively create a new registry and
/// selectively register the required operators using
/// [`OpRegistry::register_op`].
///
/// ```
/// use mil_ir::ops::{Add, Relu};
/// use mil_ir::OpRegistry;
///
/// let mut reg = OpRegistry::new();
/// reg.register_op::<Relu>();
/// reg.register_op::<Add>();
/// assert!(reg.get("relu").is_some());
/// assert!(reg.get("conv").is_none());
/// ```
#[derive(Default)]
pub struct OpRegistry {
    ops: FxHashMap<&'static str, Box<dyn OpDef>>,
}

impl OpRegistry {
    /// Create a new empty registry.
    pub fn new() -> OpRegistry {
        OpRegistry {
            ops: FxHashMap::default(),
        }
    }

    /// Register the default implementation of an operator.
    pub fn register_op<Op: OpDef + Default>(&mut self) {
        self.register(Box::new(Op::default()));
    }

    /// Register an operator instance, replacing any existing operator with
    /// the same name.
    pub fn register(&mut self, op: Box<dyn OpDef>) {
        self.ops.insert(op.name(), op);
    }

    /// Look up an operator by name.
    pub fn get(&self, name: &str) -> Option<&dyn OpDef> {
        self.ops.get(name).map(|op| op.as_ref())
    }

    /// Return the names of all registered operators, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.ops.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Return a shared registry with all built-in operators.
    pub fn global() -> &'static OpRegistry {
        static GLOBAL: OnceLock<OpRegistry> = OnceLock::new();
        GLOBAL.get_or_init(OpRegistry::with_all_ops)
    }

    /// Create a new registry with all built-in operators registered.
    pub fn with_all_ops() -> OpRegistry {
        let mut reg = OpRegistry::new();

        macro_rules! register_op {
            ($op:ident) => {
                reg.register_op::<crate::ops::$op>()
            };
        }

        // Activations
        register_op!(ClampedRelu);
        register_op!(Elu);
        register_op!(Gelu);
        register_op!(LeakyRelu);
        register_op!(LinearActivation);
        register_op!(Prelu);
        register_op!(Relu);
        register_op!(Relu6);
        register_op!(ScaledTanh);
        register_op!(Sigmoid);
        register_op!(SigmoidHard);
        register_op!(Softmax);
        register_op!(Softplus);
        register_op!(SoftplusParametric);
        register_op!(Softsign);
        register_op!(ThresholdedRelu);

        // Binary elementwise
        register_op!(Add);
        register_op!(Equal);
        register_op!(FloorDiv);
        register_op!(Greater);
        register_op!(GreaterEqual);
        register_op!(Less);
        register_op!(LessEqual);
        register_op!(LogicalAnd);
        register_op!(LogicalOr);
        register_op!(LogicalXor);
        register_op!(Maximum);
        register_op!(Minimum);
        register_op!(Mod);
        register_op!(Mul);
        register_op!(NotEqual);
        register_op!(Pow);
        register_op!(RealDiv);
        register_op!(Select);
        register_op!(Sub);

        // Unary elementwise
        register_op!(Abs);
        register_op!(Acos);
        register_op!(Asin);
        register_op!(Atan);
        register_op!(Atanh);
        register_op!(Cast);
        register_op!(Ceil);
        register_op!(Clip);
        register_op!(Cos);
        register_op!(Cosh);
        register_op!(Erf);
        register_op!(Exp);
        register_op!(Exp2);
        register_op!(Floor);
        register_op!(Inverse);
        register_op!(IsFinite);
        register_op!(Log);
        register_op!(LogicalNot);
        register_op!(Round);
        register_op!(Rsqrt);
        register_op!(Sign);
        register_op!(Sin);
        register_op!(Sinh);
        register_op!(Sqrt);
        register_op!(Square);
        register_op!(Tan);
        register_op!(Tanh);
        register_op!(Threshold);

        // Reductions and sorting
        register_op!(ArgSort);
        register_op!(CumSum);
        register_op!(NonZero);
        register_op!(ReduceArgMax);
        register_op!(ReduceArgMin);
        register_op!(ReduceL1Norm);
        register_op!(ReduceL2Norm);
        register_op!(ReduceLogSum);
        register_op!(ReduceLogSumExp);
        register_op!(ReduceMax);
        register_op!(ReduceMean);
        register_op!(ReduceMin);
        register_op!(ReduceProd);
        register_op!(ReduceSum);
        register_op!(ReduceSumSquare);
        register_op!(TopK);

        // Control flow and lists
        register_op!(Cond);
        register_op!(Const);
        register_op!(Identity);
        register_op!(WhileLoop);
        register_op!(ListGather);
        register_op!(ListLength);
        register_op!(ListRead);
        register_op!(ListScatter);
        register_op!(ListWrite);
        register_op!(MakeList);

        // Linear algebra and normalization
        register_op!(Linear);
        register_op!(MatMul);
        register_op!(BatchNorm);
        register_op!(InstanceNorm);
        register_op!(L2Norm);
        register_op!(LayerNorm);
        register_op!(LocalResponseNorm);

        // Convolution and pooling
        register_op!(Conv);
        register_op!(ConvTranspose);
        register_op!(AvgPool);
        register_op!(L2Pool);
        register_op!(MaxPool);

        // Recurrent
        register_op!(Gru);
        register_op!(Lstm);
        register_op!(Rnn);

        // Gather and scatter
        register_op!(Gather);
        register_op!(GatherAlongAxis);
        register_op!(GatherNd);
        register_op!(Scatter);
        register_op!(ScatterAlongAxis);
        register_op!(ScatterNd);

        // Shape and structure
        register_op!(BandPart);
        register_op!(Concat);
        register_op!(Crop);
        register_op!(CropResize);
        register_op!(DepthToSpace);
        register_op!(ExpandDims);
        register_op!(Fill);
        register_op!(Flatten);
        register_op!(NonMaximumSuppression);
        register_op!(OneHot);
        register_op!(Pad);
        register_op!(PixelShuffle);
        register_op!(Range1d);
        register_op!(Reshape);
        register_op!(Reverse);
        register_op!(ReverseSequence);
        register_op!(ShapeOp);
        register_op!(SliceByIndex);
        register_op!(SliceBySize);
        register_op!(SlidingWindows);
        register_op!(SpaceToDepth);
        register_op!(Split);
        register_op!(Squeeze);
        register_op!(Stack);
        register_op!(Tile);
        register_op!(Transpose);
        register_op!(UpsampleBilinear);
        register_op!(UpsampleNearestNeighbor);

        #[cfg(feature = "random")]
        {
            register_op!(RandomBernoulli);
            register_op!(RandomCategorical);
            register_op!(RandomNormal);
            register_op!(RandomUniform);
        }

        reg
    }
}

#[cfg(test)]
mod tests {
    use super::OpRegistry;

    #[test]
    fn test_register_op() {
        let mut reg = OpRegistry::new();
        assert!(reg.is_empty());
        reg.register_op::<crate::ops::Relu>();
        reg.register_op::<crate::ops::Relu>();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("relu").map(|op| op.name()), Some("relu"));
    }

    #[test]
    fn test_all_ops_have_unique_names() {
        let reg = OpRegistry::with_all_ops();
        for name in [
            "clamped_relu",
            "real_div",
            "reduce_log_sum_exp",
            "slice_by_index",
            "while_loop",
            "list_scatter",
            "non_maximum_suppression",
            "upsample_bilinear",
            "const",
        ] {
            assert!(reg.get(name).is_some(), "missing {}", name);
        }

        // Names must match the keys under which the ops are registered.
        for name in reg.names() {
            assert_eq!(reg.get(name).map(|op| op.name()), Some(name));
        }
    }
}
