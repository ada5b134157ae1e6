use mil_shape::{Dim, InferShapes, ReductionOp, Shape};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    resolve_axis, single_output, DefaultValue, EvalContext, InferContext, InputSpec,
    IntoOpResult, OpDef, OpError, TypeDomain,
};
use crate::ops::{map_lanes, op_inputs, reduce_axes, same_type};
use crate::types::{DType, TensorType, ValueType};
use crate::value::Value;

/// Resolve the `axes` of a reduction against `rank`. `None` reduces over
/// every axis.
fn resolve_reduce_axes(rank: usize, axes: Option<&[i32]>) -> Result<Vec<usize>, OpError> {
    let mut resolved = match axes {
        Some(axes) => axes
            .iter()
            .map(|&axis| resolve_axis(rank, axis, "axis"))
            .collect::<Result<Vec<_>, _>>()?,
        None => (0..rank).collect(),
    };
    resolved.sort_unstable();
    resolved.dedup();
    Ok(resolved)
}

fn infer_reduce(
    ctx: &InferContext,
    axes: Option<&[i32]>,
    dtype: DType,
) -> Result<Vec<ValueType>, OpError> {
    let shape = ctx.shape("x")?;
    let keep_dims = ctx.bool("keep_dims")?;
    let mut shapes = ReductionOp { axes, keep_dims }.infer_shapes(&[shape])?;
    single_output(shapes.remove(0), dtype)
}

/// Define a reduction over an optional list of axes.
///
/// `$float_result` is true if the reduction produces a float result for
/// integer inputs.
macro_rules! reduce_op {
    ($(#[$attr:meta])* $op:ident, $name:literal, float_result: $float_result:expr, $reduce:expr) => {
        $(#[$attr])*
        #[derive(Debug, Default)]
        pub struct $op {}

        impl OpDef for $op {
            fn name(&self) -> &'static str {
                $name
            }

            op_inputs!(
                InputSpec::new("x").domain(TypeDomain::Numeric),
                InputSpec::int("axes").constant().optional(),
                InputSpec::boolean("keep_dims")
                    .constant()
                    .default(DefaultValue::Bool(false)),
            );

            fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
                let dtype = ctx.tensor("x")?.dtype;
                let dtype = if $float_result && !dtype.is_float() {
                    DType::Fp32
                } else {
                    dtype
                };
                let axes = ctx.opt_i32s("axes")?;
                infer_reduce(ctx, axes.as_deref(), dtype)
            }

            fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
                let x = ctx.float("x")?;
                let axes = ctx.opt_i32s("axes")?;
                let axes = resolve_reduce_axes(x.ndim(), axes.as_deref())?;
                let reduce: fn(&[f32]) -> f32 = $reduce;
                reduce_axes(&x, &axes, ctx.bool("keep_dims")?, reduce).into_op_result()
            }
        }
    };
}

reduce_op!(ReduceSum, "reduce_sum", float_result: false, |xs| xs.iter().sum());
reduce_op!(ReduceProd, "reduce_prod", float_result: false, |xs| xs.iter().product());
reduce_op!(ReduceMax, "reduce_max", float_result: false, |xs| {
    xs.iter().copied().fold(f32::NEG_INFINITY, f32::max)
});
reduce_op!(ReduceMin, "reduce_min", float_result: false, |xs| {
    xs.iter().copied().fold(f32::INFINITY, f32::min)
});
reduce_op!(ReduceL1Norm, "reduce_l1_norm", float_result: false, |xs| {
    xs.iter().map(|x| x.abs()).sum()
});
reduce_op!(ReduceSumSquare, "reduce_sum_square", float_result: false, |xs| {
    xs.iter().map(|x| x * x).sum()
});
reduce_op!(ReduceMean, "reduce_mean", float_result: true, |xs| {
    xs.iter().sum::<f32>() / xs.len() as f32
});
reduce_op!(ReduceL2Norm, "reduce_l2_norm", float_result: true, |xs| {
    xs.iter().map(|x| x * x).sum::<f32>().sqrt()
});
reduce_op!(ReduceLogSum, "reduce_log_sum", float_result: true, |xs| {
    xs.iter().sum::<f32>().ln()
});
reduce_op!(
    /// `log(sum(exp(x)))`, computed without overflow for large inputs.
    ReduceLogSumExp,
    "reduce_log_sum_exp",
    float_result: true,
    |xs| {
        let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if max.is_infinite() {
            return max;
        }
        max + xs.iter().map(|x| (x - max).exp()).sum::<f32>().ln()
    }
);

/// Define an operator returning the index of the first maximum or minimum
/// along an axis.
macro_rules! arg_reduce_op {
    ($op:ident, $name:literal, $prefer:expr) => {
        #[derive(Debug, Default)]
        pub struct $op {}

        impl OpDef for $op {
            fn name(&self) -> &'static str {
                $name
            }

            op_inputs!(
                InputSpec::new("x").domain(TypeDomain::Numeric),
                InputSpec::int("axis")
                    .constant()
                    .default(DefaultValue::I32(-1)),
                InputSpec::boolean("keep_dims")
                    .constant()
                    .default(DefaultValue::Bool(false)),
            );

            fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
                let axis = [ctx.i32("axis")?];
                infer_reduce(ctx, Some(&axis), DType::Int32)
            }

            fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
                let x = ctx.float("x")?;
                let axis = resolve_axis(x.ndim(), ctx.i32("axis")?, "axis")?;
                if x.size(axis) == 0 {
                    return Err(OpError::InvalidValue(format!(
                        "cannot reduce empty axis {}",
                        axis
                    )));
                }
                let prefer: fn(f32, f32) -> bool = $prefer;
                reduce_axes(&x, &[axis], ctx.bool("keep_dims")?, |lane| {
                    let mut best = 0;
                    for (i, &v) in lane.iter().enumerate() {
                        if prefer(v, lane[best]) {
                            best = i;
                        }
                    }
                    best as i32
                })
                .into_op_result()
            }
        }
    };
}

arg_reduce_op!(ReduceArgMax, "reduce_argmax", |a, b| a > b);
arg_reduce_op!(ReduceArgMin, "reduce_argmin", |a, b| a < b);

/// Return the indices which sort a lane, stably.
fn sort_indices(lane: &[f32], ascending: bool) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..lane.len()).collect();
    indices.sort_by(|&a, &b| {
        let ord = lane[a].total_cmp(&lane[b]);
        if ascending {
            ord
        } else {
            ord.reverse()
        }
    });
    indices
}

/// Indices which sort `x` along an axis. Sorts in descending order unless
/// `ascending` is set.
#[derive(Debug, Default)]
pub struct ArgSort {}

impl OpDef for ArgSort {
    fn name(&self) -> &'static str {
        "argsort"
    }

    op_inputs!(
        InputSpec::new("x").domain(TypeDomain::Numeric),
        InputSpec::int("axis")
            .constant()
            .default(DefaultValue::I32(-1)),
        InputSpec::boolean("ascending")
            .constant()
            .default(DefaultValue::Bool(false)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        if let Some(rank) = x.rank() {
            resolve_axis(rank, ctx.i32("axis")?, "axis")?;
        }
        single_output(x.shape.clone(), DType::Int32)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.float("x")?;
        let axis = resolve_axis(x.ndim(), ctx.i32("axis")?, "axis")?;
        let ascending = ctx.bool("ascending")?;
        map_lanes(&x, axis, x.size(axis), |lane, out| {
            out.extend(sort_indices(lane, ascending).into_iter().map(|i| i as i32));
            Ok(())
        })
        .into_op_result()
    }
}

/// The `k` largest (or smallest) values along an axis and their indices.
#[derive(Debug, Default)]
pub struct TopK {}

impl OpDef for TopK {
    fn name(&self) -> &'static str {
        "topk"
    }

    op_inputs!(
        InputSpec::new("x").domain(TypeDomain::Numeric),
        InputSpec::int("k").constant().default(DefaultValue::I32(1)),
        InputSpec::int("axis")
            .constant()
            .default(DefaultValue::I32(-1)),
        InputSpec::boolean("ascending")
            .constant()
            .default(DefaultValue::Bool(false)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let k = ctx.i32("k")?;
        if k < 0 {
            return Err(OpError::InvalidValue(format!("k ({}) should be >= 0", k)));
        }
        let shape = match x.shape.dims() {
            Some(dims) => {
                let axis = resolve_axis(dims.len(), ctx.i32("axis")?, "axis")?;
                if let Some(size) = dims[axis].fixed() {
                    if k as usize > size {
                        return Err(OpError::InvalidValue(format!(
                            "k ({}) should not exceed the size of axis {} ({})",
                            k, axis, size
                        )));
                    }
                }
                let mut dims = dims.to_vec();
                dims[axis] = Dim::Fixed(k as usize);
                Shape::from_dims(dims)
            }
            None => x.shape.clone(),
        };
        Ok(vec![
            ValueType::Tensor(TensorType::new(shape.clone(), x.dtype)),
            ValueType::Tensor(TensorType::new(shape, DType::Int32)),
        ])
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.float("x")?;
        let axis = resolve_axis(x.ndim(), ctx.i32("axis")?, "axis")?;
        let k = ctx.i32("k")?.max(0) as usize;
        if k > x.size(axis) {
            return Err(OpError::InvalidValue(format!(
                "k ({}) should not exceed the size of axis {} ({})",
                k,
                axis,
                x.size(axis)
            )));
        }
        let ascending = ctx.bool("ascending")?;
        let indices = map_lanes(&x, axis, k, |lane, out| {
            out.extend(sort_indices(lane, ascending).into_iter().take(k).map(|i| i as i32));
            Ok(())
        })?;
        let values = map_lanes(&x, axis, k, |lane, out| {
            out.extend(
                sort_indices(lane, ascending)
                    .into_iter()
                    .take(k)
                    .map(|i| lane[i]),
            );
            Ok(())
        })?;
        Ok(vec![values.into(), indices.into()])
    }
}

fn cumsum<T: Copy + Default + std::ops::Add<Output = T>>(
    x: &Tensor<T>,
    axis: usize,
    exclusive: bool,
    reverse: bool,
) -> Result<Tensor<T>, OpError> {
    map_lanes(x, axis, x.size(axis), |lane, out| {
        let start = out.len();
        let mut acc = T::default();
        let order: Box<dyn Iterator<Item = usize>> = if reverse {
            Box::new((0..lane.len()).rev())
        } else {
            Box::new(0..lane.len())
        };
        out.resize(start + lane.len(), T::default());
        for i in order {
            if exclusive {
                out[start + i] = acc;
                acc = acc + lane[i];
            } else {
                acc = acc + lane[i];
                out[start + i] = acc;
            }
        }
        Ok(())
    })
}

/// Cumulative sum along an axis.
#[derive(Debug, Default)]
pub struct CumSum {}

impl OpDef for CumSum {
    fn name(&self) -> &'static str {
        "cumsum"
    }

    op_inputs!(
        InputSpec::new("x").domain(TypeDomain::Numeric),
        InputSpec::int("axis").constant().default(DefaultValue::I32(0)),
        InputSpec::boolean("exclusive")
            .constant()
            .default(DefaultValue::Bool(false)),
        InputSpec::boolean("reverse")
            .constant()
            .default(DefaultValue::Bool(false)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        if let Some(rank) = ctx.tensor("x")?.rank() {
            resolve_axis(rank, ctx.i32("axis")?, "axis")?;
        }
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let axis = resolve_axis(x.ndim(), ctx.i32("axis")?, "axis")?;
        let exclusive = ctx.bool("exclusive")?;
        let reverse = ctx.bool("reverse")?;
        match x {
            Value::Int(x) => cumsum(x, axis, exclusive, reverse).into_op_result(),
            _ => cumsum(&x.to_f32()?, axis, exclusive, reverse).into_op_result(),
        }
    }
}

/// Indices of the non-zero elements of `x`, as a `[count, rank]` tensor.
#[derive(Debug, Default)]
pub struct NonZero {}

impl OpDef for NonZero {
    fn name(&self) -> &'static str {
        "non_zero"
    }

    op_inputs!(InputSpec::new("x"));

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let rank = match ctx.tensor("x")?.rank() {
            Some(rank) => Dim::Fixed(rank),
            None => Dim::new_symbol(),
        };
        single_output(Shape::from_dims([Dim::new_symbol(), rank]), DType::Int32)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?.to_bool()?;
        let shape = x.shape().to_vec();
        let mut indices = Vec::new();
        let mut count = 0;
        for (offset, &nonzero) in x.iter().enumerate() {
            if nonzero {
                indices.extend(
                    crate::ops::unravel(offset, &shape)
                        .iter()
                        .map(|&i| i as i32),
                );
                count += 1;
            }
        }
        Tensor::from_data(&[count, shape.len()], indices).into_op_result()
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::prelude::*;
    use rten_tensor::Tensor;

    use crate::builder::{Arg, Builder};
    use crate::graph::{BuildError, Program};
    use crate::types::{DType, TensorType, ValueType};
    use crate::value::Value;

    fn fold(op: &str, args: Vec<(&str, Arg)>) -> Result<Vec<(ValueType, Value)>, BuildError> {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut result = Vec::new();
        mb.function("main", Vec::<(&str, TensorType)>::new(), |mb, _| {
            let mut op_builder = mb.op(op);
            for (name, arg) in args {
                op_builder = op_builder.arg(name, arg);
            }
            let outputs = op_builder.build()?;
            for output in &outputs {
                result.push((mb.ty(*output).clone(), mb.value(*output).cloned().unwrap()));
            }
            Ok(outputs)
        })?;
        Ok(result)
    }

    fn x() -> Tensor<f32> {
        Tensor::from([[1., 5., 3.], [4., 2., 6.]])
    }

    #[test]
    fn test_reductions() {
        let cases: [(&str, Vec<i32>, bool, Vec<f32>, Vec<usize>); 5] = [
            ("reduce_sum", vec![1], false, vec![9., 12.], vec![2]),
            ("reduce_max", vec![0], true, vec![4., 5., 6.], vec![1, 3]),
            ("reduce_mean", vec![-1], false, vec![3., 4.], vec![2]),
            ("reduce_prod", vec![0, 1], false, vec![720.], vec![]),
            ("reduce_min", vec![1], true, vec![1., 2.], vec![2, 1]),
        ];
        for (op, axes, keep_dims, expected, shape) in cases {
            let result = fold(
                op,
                vec![
                    ("x", x().into()),
                    ("axes", axes.into()),
                    ("keep_dims", keep_dims.into()),
                ],
            )
            .unwrap();
            let value = result[0].1.as_float().unwrap();
            assert_eq!(value.shape(), shape.as_slice(), "{}", op);
            assert_eq!(value.to_vec(), expected, "{}", op);
        }

        // All axes are reduced if `axes` is omitted.
        let result = fold("reduce_l2_norm", vec![("x", Tensor::from([3f32, 4.]).into())]).unwrap();
        assert_eq!(result[0].1, Value::from(Tensor::from(5f32)));

        let err = fold(
            "reduce_sum",
            vec![("x", x().into()), ("axes", vec![2].into())],
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("out of bound"));
    }

    #[test]
    fn test_int_reduction_dtypes() {
        let x: Arg = Tensor::from([[1, 2], [3, 4]]).into();
        let sum = fold("reduce_sum", vec![("x", x.clone())]).unwrap();
        assert_eq!(sum[0].0.dtype(), DType::Int32);
        assert_eq!(sum[0].1, Value::from(Tensor::from(10)));

        let mean = fold("reduce_mean", vec![("x", x)]).unwrap();
        assert_eq!(mean[0].0.dtype(), DType::Fp32);
        assert_eq!(mean[0].1, Value::from(Tensor::from(2.5f32)));
    }

    #[test]
    fn test_argmax_argmin() {
        let result = fold("reduce_argmax", vec![("x", x().into())]).unwrap();
        assert_eq!(result[0].0.dtype(), DType::Int32);
        assert_eq!(result[0].1, Value::from(vec![1, 2]));

        let result = fold(
            "reduce_argmin",
            vec![("x", x().into()), ("axis", 0.into()), ("keep_dims", true.into())],
        )
        .unwrap();
        assert_eq!(result[0].1, Value::from(Tensor::from([[0, 1, 0]])));
    }

    #[test]
    fn test_argsort_and_topk() {
        let result = fold("argsort", vec![("x", x().into())]).unwrap();
        assert_eq!(result[0].1, Value::from(Tensor::from([[1, 2, 0], [2, 0, 1]])));

        let result = fold(
            "argsort",
            vec![("x", x().into()), ("ascending", true.into())],
        )
        .unwrap();
        assert_eq!(result[0].1, Value::from(Tensor::from([[0, 2, 1], [1, 0, 2]])));

        let result = fold("topk", vec![("x", x().into()), ("k", 2.into())]).unwrap();
        assert_eq!(result[0].1, Value::from(Tensor::from([[5f32, 3.], [6., 4.]])));
        assert_eq!(result[1].0.dtype(), DType::Int32);
        assert_eq!(result[1].1, Value::from(Tensor::from([[1, 2], [2, 0]])));

        let err = fold("topk", vec![("x", x().into()), ("k", 4.into())])
            .err()
            .unwrap();
        assert!(err.to_string().contains("should not exceed"));
    }

    #[test]
    fn test_cumsum() {
        let x: Arg = vec![1, 2, 3].into();
        let cases = [
            (false, false, vec![1, 3, 6]),
            (true, false, vec![0, 1, 3]),
            (false, true, vec![6, 5, 3]),
            (true, true, vec![5, 3, 0]),
        ];
        for (exclusive, reverse, expected) in cases {
            let result = fold(
                "cumsum",
                vec![
                    ("x", x.clone()),
                    ("exclusive", exclusive.into()),
                    ("reverse", reverse.into()),
                ],
            )
            .unwrap();
            assert_eq!(result[0].1, Value::from(expected));
        }

        let err = fold("cumsum", vec![("x", x), ("axis", (-2).into())])
            .err()
            .unwrap();
        assert!(err.to_string().contains("axis -2 out of bound for rank 1"));
    }

    #[test]
    fn test_non_zero() {
        let x = Tensor::from([[0, 1], [2, 0]]);
        let result = fold("non_zero", vec![("x", x.into())]).unwrap();
        assert_eq!(result[0].1, Value::from(Tensor::from([[0, 1], [1, 0]])));
        let shape = &result[0].0.as_tensor().unwrap().shape;
        assert_eq!(shape.to_fixed(), Some(vec![2, 2]));
    }
}
