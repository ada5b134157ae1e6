//! The built-in operators.
//!
//! Each operator is a unit struct implementing [`OpDef`](crate::operator::OpDef).
//! Operators are registered under their MIL names by
//! [`OpRegistry::with_all_ops`](crate::OpRegistry::with_all_ops).

use mil_shape::{broadcast_sizes, Dim};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;
use smallvec::SmallVec;

use crate::operator::{InferContext, OpError};
use crate::types::{promote_dtypes, Carrier, DType, TensorType, ValueType};
use crate::value::Value;

mod activations;
mod binary_elementwise;
mod concat;
mod control_flow;
mod conv;
mod conv_transpose;
mod gather;
mod generate;
mod layout;
mod list;
mod matmul;
mod non_max_suppression;
mod norm;
mod pad;
mod pooling;
#[cfg(feature = "random")]
mod random;
mod reduce;
mod resize;
mod rnn;
mod slice;
mod split;
mod trilu;
mod unary_elementwise;

pub use activations::{
    ClampedRelu, Elu, Gelu, LeakyRelu, LinearActivation, Prelu, Relu, Relu6, ScaledTanh, Sigmoid,
    SigmoidHard, Softmax, Softplus, SoftplusParametric, Softsign, ThresholdedRelu,
};
pub use binary_elementwise::{
    Add, Equal, FloorDiv, Greater, GreaterEqual, Less, LessEqual, LogicalAnd, LogicalOr,
    LogicalXor, Maximum, Minimum, Mod, Mul, NotEqual, Pow, RealDiv, Select, Sub,
};
pub use concat::{Concat, Stack, Tile};
pub use control_flow::{Cond, Const, Identity, WhileLoop};
pub use conv::Conv;
pub use conv_transpose::ConvTranspose;
pub use gather::{Gather, GatherAlongAxis, GatherNd, Scatter, ScatterAlongAxis, ScatterNd};
pub use generate::{Fill, OneHot, Range1d};
pub use layout::{
    DepthToSpace, ExpandDims, Flatten, PixelShuffle, Reshape, ShapeOp, SpaceToDepth, Squeeze,
    Transpose,
};
pub use list::{ListGather, ListLength, ListRead, ListScatter, ListWrite, MakeList};
pub use matmul::{Linear, MatMul};
pub use non_max_suppression::NonMaximumSuppression;
pub use norm::{BatchNorm, InstanceNorm, L2Norm, LayerNorm, LocalResponseNorm};
pub use pad::Pad;
pub use pooling::{AvgPool, L2Pool, MaxPool};
#[cfg(feature = "random")]
pub use random::{RandomBernoulli, RandomCategorical, RandomNormal, RandomUniform};
pub use reduce::{
    ArgSort, CumSum, NonZero, ReduceArgMax, ReduceArgMin, ReduceL1Norm, ReduceL2Norm,
    ReduceLogSum, ReduceLogSumExp, ReduceMax, ReduceMean, ReduceMin, ReduceProd, ReduceSum,
    ReduceSumSquare, TopK,
};
pub use resize::{Crop, CropResize, UpsampleBilinear, UpsampleNearestNeighbor};
pub use rnn::{Gru, Lstm, Rnn};
pub use slice::{Reverse, ReverseSequence, SliceByIndex, SliceBySize, SlidingWindows};
pub use split::Split;
pub use trilu::BandPart;
pub use unary_elementwise::{
    Abs, Acos, Asin, Atan, Atanh, Cast, Ceil, Clip, Cos, Cosh, Erf, Exp, Exp2, Floor, Inverse,
    IsFinite, Log, LogicalNot, Round, Rsqrt, Sign, Sin, Sinh, Sqrt, Square, Tan, Tanh, Threshold,
};

/// Define the `inputs` method of an operator from a list of specs.
macro_rules! op_inputs {
    ($($spec:expr),* $(,)?) => {
        fn inputs(&self) -> &'static [$crate::operator::InputSpec] {
            const INPUTS: &[$crate::operator::InputSpec] = &[$($spec),*];
            INPUTS
        }
    };
}

pub(crate) use op_inputs;

/// Define an operator which takes a single float tensor `x` and applies a
/// function to each element.
macro_rules! unary_float_op {
    ($(#[$attr:meta])* $op:ident, $name:literal, $f:expr) => {
        $(#[$attr])*
        #[derive(Debug, Default)]
        pub struct $op {}

        impl $crate::operator::OpDef for $op {
            fn name(&self) -> &'static str {
                $name
            }

            $crate::ops::op_inputs!($crate::operator::InputSpec::float("x"));

            fn infer_types(
                &self,
                ctx: &$crate::operator::InferContext,
            ) -> Result<Vec<$crate::types::ValueType>, $crate::operator::OpError> {
                $crate::ops::same_type(ctx, "x")
            }

            fn eval(
                &self,
                ctx: &$crate::operator::EvalContext,
            ) -> Result<Vec<$crate::value::Value>, $crate::operator::OpError> {
                use $crate::operator::IntoOpResult;
                use rten_tensor::prelude::*;

                let f: fn(f32) -> f32 = $f;
                ctx.float("x")?.map(|&x| f(x)).into_op_result()
            }
        }
    };
}

pub(crate) use unary_float_op;

/// Infer a single output with the same type as the tensor parameter `name`.
pub(crate) fn same_type(ctx: &InferContext, name: &str) -> Result<Vec<ValueType>, OpError> {
    Ok([ValueType::Tensor(ctx.tensor(name)?.clone())].into())
}

/// Infer a single output with the shape of parameter `name` and a given
/// dtype.
pub(crate) fn same_shape(
    ctx: &InferContext,
    name: &str,
    dtype: DType,
) -> Result<Vec<ValueType>, OpError> {
    let shape = ctx.shape(name)?.clone();
    Ok([ValueType::Tensor(TensorType::new(shape, dtype))].into())
}

/// Return an error if the rank of a tensor type is known and less than
/// `min_rank`.
pub(crate) fn check_min_rank(
    ty: &TensorType,
    name: &str,
    min_rank: usize,
) -> Result<(), OpError> {
    match ty.rank() {
        Some(rank) if rank < min_rank => Err(OpError::InvalidShape(format!(
            "{} should be at least rank {}",
            name, min_rank
        ))),
        _ => Ok(()),
    }
}

/// Return an error if the rank of a tensor type is known and differs from
/// `expected`.
pub(crate) fn check_rank(ty: &TensorType, name: &str, expected: usize) -> Result<(), OpError> {
    match ty.rank() {
        Some(rank) if rank != expected => Err(OpError::InvalidShape(format!(
            "{} should be rank {}",
            name, expected
        ))),
        _ => Ok(()),
    }
}

/// Dims of a ranked shape, or an error mentioning the parameter.
pub(crate) fn ranked_dims<'a>(
    shape: &'a mil_shape::Shape,
    name: &str,
) -> Result<&'a [Dim], OpError> {
    shape
        .dims()
        .ok_or_else(|| OpError::InvalidShape(format!("{} should have a known rank", name)))
}

/// Return the dtype that the tensor parameters promote to.
pub(crate) fn promoted_dtype(ctx: &InferContext, names: &[&str]) -> Result<DType, OpError> {
    let dtypes = names
        .iter()
        .map(|name| ctx.tensor(name).map(|ty| ty.dtype))
        .collect::<Result<Vec<_>, _>>()?;
    promote_dtypes(dtypes.iter().copied()).ok_or_else(|| {
        OpError::InvalidType(format!(
            "{} have incompatible dtypes {:?}",
            names.join(" and "),
            dtypes.iter().map(|dtype| dtype.name()).collect::<Vec<_>>()
        ))
    })
}

/// Apply a binary function to two tensors with NumPy-style broadcasting.
pub(crate) fn broadcast_map<T: Copy, U>(
    a: &Tensor<T>,
    b: &Tensor<T>,
    f: impl Fn(T, T) -> U,
) -> Result<Tensor<U>, OpError> {
    let shape = broadcast_sizes(a.shape(), b.shape()).ok_or_else(|| {
        OpError::InvalidShape(format!(
            "cannot broadcast shapes {:?} and {:?}",
            a.shape(),
            b.shape()
        ))
    })?;
    let data: Vec<U> = a
        .broadcast(shape.as_slice())
        .iter()
        .zip(b.broadcast(shape.as_slice()).iter())
        .map(|(&x, &y)| f(x, y))
        .collect();
    Ok(Tensor::from_data(shape.as_slice(), data))
}

/// Broadcast a tensor to a shape, failing if the shapes are incompatible.
pub(crate) fn broadcast_to<T: Clone>(t: &Tensor<T>, shape: &[usize]) -> Result<Tensor<T>, OpError> {
    match broadcast_sizes(t.shape(), shape) {
        Some(sizes) if sizes.as_slice() == shape => Ok(t.broadcast(shape).to_tensor()),
        _ => Err(OpError::InvalidShape(format!(
            "cannot broadcast shape {:?} to {:?}",
            t.shape(),
            shape
        ))),
    }
}

/// Return the row-major strides of a shape.
pub(crate) fn strides(shape: &[usize]) -> SmallVec<[usize; 5]> {
    let mut strides: SmallVec<[usize; 5]> = SmallVec::from_elem(1, shape.len());
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Convert a flat offset into a multi-dimensional index.
pub(crate) fn unravel(mut offset: usize, shape: &[usize]) -> SmallVec<[usize; 5]> {
    let mut index: SmallVec<[usize; 5]> = SmallVec::from_elem(0, shape.len());
    for (i, &size) in shape.iter().enumerate().rev() {
        if size > 0 {
            index[i] = offset % size;
            offset /= size;
        }
    }
    index
}

/// Build a tensor of shape `out_shape` whose elements are read from `t` at
/// the offset `src_offset` returns for each output index.
pub(crate) fn remap<T: Clone>(
    t: &Tensor<T>,
    out_shape: &[usize],
    src_offset: impl Fn(&[usize]) -> usize,
) -> Tensor<T> {
    let data = t.to_vec();
    let len: usize = out_shape.iter().product();
    let out: Vec<T> = (0..len)
        .map(|i| data[src_offset(&unravel(i, out_shape))].clone())
        .collect();
    Tensor::from_data(out_shape, out)
}

/// Apply `f` to each 1D lane of `t` along `axis`. `f` receives a lane and
/// pushes `out_len` elements onto the output.
pub(crate) fn map_lanes<T: Clone, U: Clone>(
    t: &Tensor<T>,
    axis: usize,
    out_len: usize,
    mut f: impl FnMut(&[T], &mut Vec<U>) -> Result<(), OpError>,
) -> Result<Tensor<U>, OpError> {
    let rank = t.ndim();
    let mut perm: Vec<usize> = (0..rank).filter(|&d| d != axis).collect();
    perm.push(axis);
    let data = t.permuted(perm.as_slice()).to_vec();

    let lane_len = t.size(axis);
    let mut out_shape: Vec<usize> = perm[..rank - 1].iter().map(|&d| t.size(d)).collect();
    let n_lanes: usize = out_shape.iter().product();
    out_shape.push(out_len);

    let mut out = Vec::with_capacity(n_lanes * out_len);
    for lane in 0..n_lanes {
        f(&data[lane * lane_len..(lane + 1) * lane_len], &mut out)?;
    }
    if out.len() != n_lanes * out_len {
        return Err(OpError::InvalidValue("lane function produced the wrong length".into()));
    }

    let result = Tensor::from_data(out_shape.as_slice(), out);
    let mut inverse: Vec<usize> = (0..axis).collect();
    inverse.push(rank - 1);
    inverse.extend(axis..rank - 1);
    Ok(result.permuted(inverse.as_slice()).to_tensor())
}

/// Reduce the elements of `t` over `axes` using `f`, which maps the
/// elements of one reduction group to a value.
pub(crate) fn reduce_axes<T: Clone, U>(
    t: &Tensor<T>,
    axes: &[usize],
    keep_dims: bool,
    mut f: impl FnMut(&[T]) -> U,
) -> Tensor<U> {
    let rank = t.ndim();
    let kept: Vec<usize> = (0..rank).filter(|d| !axes.contains(d)).collect();
    let mut perm = kept.clone();
    perm.extend(axes.iter().copied());
    let data = t.permuted(perm.as_slice()).to_vec();

    let group_len: usize = axes.iter().map(|&d| t.size(d)).product();
    let n_groups: usize = kept.iter().map(|&d| t.size(d)).product();
    let out: Vec<U> = (0..n_groups)
        .map(|g| f(&data[g * group_len..(g + 1) * group_len]))
        .collect();

    let out_shape: Vec<usize> = (0..rank)
        .filter_map(|d| {
            if !axes.contains(&d) {
                Some(t.size(d))
            } else if keep_dims {
                Some(1)
            } else {
                None
            }
        })
        .collect();
    Tensor::from_data(out_shape.as_slice(), out)
}

/// Tensors of a single element type, converted from values with mixed
/// carriers.
pub(crate) enum TensorList {
    Float(Vec<Tensor<f32>>),
    Int(Vec<Tensor<i32>>),
    Bool(Vec<Tensor<bool>>),
}

/// Convert values to the common carrier they promote to.
pub(crate) fn tensor_list(values: &[&Value]) -> Result<TensorList, OpError> {
    let carriers: Vec<Carrier> = values.iter().map(|v| v.carrier()).collect();
    if let Some(value) = values.iter().find(|v| !v.is_tensor()) {
        return Err(OpError::InvalidType(format!(
            "expected tensors but got a {}",
            value.kind_name()
        )));
    }
    let list = if carriers.contains(&Carrier::F32) {
        TensorList::Float(values.iter().map(|v| v.to_f32()).collect::<Result<_, _>>()?)
    } else if carriers.contains(&Carrier::I32) {
        TensorList::Int(values.iter().map(|v| v.to_i32()).collect::<Result<_, _>>()?)
    } else {
        TensorList::Bool(values.iter().map(|v| v.to_bool()).collect::<Result<_, _>>()?)
    };
    Ok(list)
}

/// Apply a generic expression to the tensors of a [`TensorList`], producing
/// a value with the same element type.
macro_rules! map_tensor_list {
    ($list:expr, $ts:ident => $body:expr) => {
        match $list {
            $crate::ops::TensorList::Float($ts) => $crate::value::Value::Float($body),
            $crate::ops::TensorList::Int($ts) => $crate::value::Value::Int($body),
            $crate::ops::TensorList::Bool($ts) => $crate::value::Value::Bool($body),
        }
    };
}

pub(crate) use map_tensor_list;

/// Return the known size of a dimension, or a fresh symbol.
pub(crate) fn dim_or_symbol(size: Option<usize>) -> Dim {
    match size {
        Some(size) => Dim::Fixed(size),
        None => Dim::new_symbol(),
    }
}
