use mil_shape::{Dim, Shape};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    resolve_axis, single_output, EvalContext, InferContext, InputSpec, IntoOpResult, OpDef,
    OpError,
};
use crate::ops::{map_tensor_list, op_inputs, remap, strides, tensor_list};
use crate::types::{promote_dtypes, DType, TensorType, ValueType};
use crate::value::{map_tensor, Value};

/// Append the chunks of each input, where a chunk is one iteration over the
/// dims from `axis` onwards, to build the concatenated tensor.
fn concat_tensors<T: Clone>(inputs: &[Tensor<T>], axis: usize) -> Tensor<T> {
    let first_shape = inputs[0].shape();
    let mut out_shape = first_shape.to_vec();
    out_shape[axis] = inputs.iter().map(|t| t.size(axis)).sum();

    let outer: usize = first_shape[..axis].iter().product();
    let chunks: Vec<(Vec<T>, usize)> = inputs
        .iter()
        .map(|t| (t.to_vec(), t.shape()[axis..].iter().product()))
        .collect();

    let mut out_data = Vec::with_capacity(out_shape.iter().product());
    for i in 0..outer {
        for (data, chunk_size) in &chunks {
            out_data.extend_from_slice(&data[i * chunk_size..(i + 1) * chunk_size]);
        }
    }
    Tensor::from_data(out_shape.as_slice(), out_data)
}

/// Stack tensors of equal shape along a new dimension at `axis`.
fn stack_tensors<T: Clone>(inputs: &[Tensor<T>], axis: usize) -> Tensor<T> {
    let expanded: Vec<Tensor<T>> = inputs
        .iter()
        .map(|t| {
            let mut shape = t.shape().to_vec();
            shape.insert(axis, 1);
            Tensor::from_data(shape.as_slice(), t.to_vec())
        })
        .collect();
    concat_tensors(&expanded, axis)
}

fn concat_dtype(types: &[&TensorType], op: &str) -> Result<DType, OpError> {
    promote_dtypes(types.iter().map(|ty| ty.dtype)).ok_or_else(|| {
        OpError::InvalidType(format!(
            "incompatible dtypes in {}: {:?}",
            op,
            types.iter().map(|ty| ty.dtype.name()).collect::<Vec<_>>()
        ))
    })
}

/// Join tensors along an existing axis.
///
/// Rank 0 values are stacked into a vector.
#[derive(Debug, Default)]
pub struct Concat {}

impl OpDef for Concat {
    fn name(&self) -> &'static str {
        "concat"
    }

    op_inputs!(
        InputSpec::new("values").many(),
        InputSpec::int("axis").constant(),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let types = ctx.tensors("values")?;
        if types.is_empty() {
            return Err(OpError::InvalidValue("concat got 0 values".into()));
        }
        let dtype = concat_dtype(&types, "concat")?;

        let ranked: Vec<&[Dim]> = types.iter().filter_map(|ty| ty.shape.dims()).collect();
        let Some(first) = ranked.first() else {
            return single_output(Shape::unranked(), dtype);
        };
        let rank = first.len();
        if ranked.iter().any(|dims| dims.len() != rank) {
            return Err(OpError::InvalidShape(
                "values in concat must have the same rank".into(),
            ));
        }

        let axis = ctx.i32("axis")?;
        if rank == 0 {
            if axis != 0 && axis != -1 {
                return Err(OpError::InvalidValue(format!(
                    "axis out of bound for stacking scalars: {}",
                    axis
                )));
            }
            return single_output(Shape::from_dims([Dim::Fixed(types.len())]), dtype);
        }
        let axis = resolve_axis(rank, axis, "axis")
            .map_err(|_| OpError::InvalidValue(format!("axis out of bound for rank {}", rank)))?;

        for dims in &ranked[1..] {
            for d in 0..rank {
                if d == axis {
                    continue;
                }
                if let (Dim::Fixed(a), Dim::Fixed(b)) = (first[d], dims[d]) {
                    if a != b {
                        return Err(OpError::InvalidShape(format!(
                            "Dimension mismatch in concat: shapes {:?} vs. {:?}",
                            first, dims
                        )));
                    }
                }
            }
        }

        if ranked.len() != types.len() {
            return single_output(Shape::symbolic(rank), dtype);
        }
        let axis_len: Option<usize> = ranked.iter().map(|dims| dims[axis].fixed()).sum();
        let out_dims = (0..rank).map(|d| {
            if d == axis {
                axis_len.map(Dim::Fixed).unwrap_or_else(Dim::new_symbol)
            } else {
                // Prefer a fixed size from any input.
                ranked
                    .iter()
                    .map(|dims| dims[d])
                    .find(|dim| !dim.is_symbolic())
                    .unwrap_or(first[d])
            }
        });
        single_output(Shape::from_dims(out_dims), dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let values = ctx.values("values")?;
        let rank = values[0].ndim();
        let axis = ctx.i32("axis")?;
        let list = tensor_list(&values)?;
        let value = if rank == 0 {
            map_tensor_list!(list, ts => stack_tensors(&ts, 0))
        } else {
            let axis = resolve_axis(rank, axis, "axis")?;
            map_tensor_list!(list, ts => concat_tensors(&ts, axis))
        };
        Ok([value].into())
    }
}

/// Join tensors of equal shape along a new axis.
#[derive(Debug, Default)]
pub struct Stack {}

impl OpDef for Stack {
    fn name(&self) -> &'static str {
        "stack"
    }

    op_inputs!(
        InputSpec::new("values").many(),
        InputSpec::int("axis").constant(),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let types = ctx.tensors("values")?;
        if types.is_empty() {
            return Err(OpError::InvalidValue("cannot stack 0 values".into()));
        }
        let dtype = concat_dtype(&types, "stack")?;

        let ranked: Vec<&[Dim]> = types.iter().filter_map(|ty| ty.shape.dims()).collect();
        let Some(first) = ranked.first() else {
            return single_output(Shape::unranked(), dtype);
        };
        let mut out_dims = first.to_vec();
        for dims in &ranked[1..] {
            let compatible = dims.len() == out_dims.len()
                && dims.iter().zip(&out_dims).all(|(a, b)| match (a, b) {
                    (Dim::Fixed(a), Dim::Fixed(b)) => a == b,
                    _ => true,
                });
            if !compatible {
                return Err(OpError::InvalidShape(format!(
                    "values in stack must have the same shape, got {:?} and {:?}",
                    first, dims
                )));
            }
            for (out, dim) in out_dims.iter_mut().zip(dims.iter()) {
                if out.is_symbolic() {
                    *out = *dim;
                }
            }
        }

        let axis = resolve_axis(out_dims.len() + 1, ctx.i32("axis")?, "axis")?;
        out_dims.insert(axis, Dim::Fixed(types.len()));
        single_output(Shape::from_dims(out_dims), dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let values = ctx.values("values")?;
        let shape = values[0].shape();
        if let Some(other) = values.iter().find(|v| v.shape() != shape) {
            return Err(OpError::InvalidShape(format!(
                "values in stack must have the same shape, got {:?} and {:?}",
                shape,
                other.shape()
            )));
        }
        let axis = resolve_axis(shape.len() + 1, ctx.i32("axis")?, "axis")?;
        let list = tensor_list(&values)?;
        Ok([map_tensor_list!(list, ts => stack_tensors(&ts, axis))].into())
    }
}

/// Validate `reps` against the rank of `x` and left-pad it with ones.
fn resolve_reps(reps: &[i32], rank: usize) -> Result<Vec<usize>, OpError> {
    if reps.is_empty() || reps.len() > rank {
        return Err(OpError::InvalidValue(format!(
            "Length of the reps ({}) must be at least 1, and not greater than the rank of the input x ({})",
            reps.len(),
            rank
        )));
    }
    if reps.iter().any(|&r| r <= 0) {
        return Err(OpError::InvalidValue(
            "All entries of reps parameter must be greater than 0".into(),
        ));
    }
    let mut padded = vec![1; rank - reps.len()];
    padded.extend(reps.iter().map(|&r| r as usize));
    Ok(padded)
}

fn tile<T: Clone>(x: &Tensor<T>, reps: &[usize]) -> Tensor<T> {
    let in_shape = x.shape();
    let out_shape: Vec<usize> = in_shape.iter().zip(reps).map(|(s, r)| s * r).collect();
    let in_strides = strides(in_shape);
    remap(x, &out_shape, |index| {
        index
            .iter()
            .zip(in_shape)
            .zip(in_strides.iter())
            .map(|((idx, size), stride)| (idx % size) * stride)
            .sum()
    })
}

/// Repeat a tensor `reps[i]` times along each dim `i`.
#[derive(Debug, Default)]
pub struct Tile {}

impl OpDef for Tile {
    fn name(&self) -> &'static str {
        "tile"
    }

    op_inputs!(InputSpec::new("x"), InputSpec::int("reps"));

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let Some(dims) = x.shape.dims() else {
            return single_output(Shape::unranked(), x.dtype);
        };
        let Some(reps) = ctx.value("reps") else {
            return single_output(Shape::symbolic(dims.len()), x.dtype);
        };
        let reps = resolve_reps(&reps.to_i32_vec()?, dims.len())?;
        let out_dims = dims.iter().zip(&reps).map(|(dim, &r)| match dim {
            Dim::Fixed(size) => Dim::Fixed(size * r),
            Dim::Symbol(_) if r == 1 => *dim,
            Dim::Symbol(_) => Dim::new_symbol(),
        });
        single_output(Shape::from_dims(out_dims), x.dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let reps = resolve_reps(&ctx.i32s("reps")?, x.ndim())?;
        map_tensor!(x, t => tile(t, &reps)).into_op_result()
    }
}

#[cfg(test)]
mod tests {
    use mil_testing::TestCases;
    use rten_tensor::Tensor;

    use crate::builder::{Arg, Builder};
    use crate::graph::{BuildError, Program};
    use crate::types::{tensor_type, DType, ValueType};
    use crate::value::Value;

    fn fold(op: &str, args: Vec<(&str, Arg)>) -> Result<Value, BuildError> {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut result = None;
        mb.function("main", Vec::<(&str, ValueType)>::new(), |mb, _| {
            let mut builder = mb.op(op);
            for (name, arg) in args {
                builder = builder.arg(name, arg);
            }
            let out = builder.build1()?;
            result = mb.value(out).cloned();
            Ok(vec![out])
        })?;
        Ok(result.unwrap())
    }

    #[test]
    fn test_concat() {
        let a = Tensor::from([[1, 2], [3, 4]]);
        let b = Tensor::from([[5, 6]]);
        let out = fold(
            "concat",
            vec![
                ("values", vec![Value::from(a.clone()), b.into()].into()),
                ("axis", 0.into()),
            ],
        )
        .unwrap();
        assert_eq!(out.shape(), [3, 2]);
        assert_eq!(out.to_i32_vec().unwrap(), [1, 2, 3, 4, 5, 6]);

        let c = Tensor::from([[0.5], [1.5]]);
        let out = fold(
            "concat",
            vec![
                ("values", vec![Value::from(a), c.into()].into()),
                ("axis", (-1).into()),
            ],
        )
        .unwrap();
        assert_eq!(out.dtype(), DType::Fp32);
        assert_eq!(out.to_f32_vec().unwrap(), [1., 2., 0.5, 3., 4., 1.5]);
    }

    #[test]
    fn test_concat_scalars() {
        let out = fold(
            "concat",
            vec![
                ("values", vec![Value::from(1), Value::from(2)].into()),
                ("axis", 0.into()),
            ],
        )
        .unwrap();
        assert_eq!(out.shape(), [2]);
        assert_eq!(out.to_i32_vec().unwrap(), [1, 2]);
    }

    #[test]
    fn test_concat_errors() {
        #[derive(Debug)]
        struct Case {
            values: Vec<Value>,
            axis: i32,
            error: &'static str,
        }

        let cases = [
            Case {
                values: vec![Tensor::from([[1, 2]]).into(), Tensor::from([1, 2]).into()],
                axis: 0,
                error: "values in concat must have the same rank",
            },
            Case {
                values: vec![Tensor::from([1, 2]).into(), Tensor::from([3]).into()],
                axis: 1,
                error: "axis out of bound",
            },
            Case {
                values: vec![
                    Tensor::from([[1, 2]]).into(),
                    Tensor::from([[1, 2, 3]]).into(),
                ],
                axis: 0,
                error: "Dimension mismatch in concat",
            },
        ];

        cases.test_each(|case| {
            let err = fold(
                "concat",
                vec![
                    ("values", case.values.clone().into()),
                    ("axis", case.axis.into()),
                ],
            )
            .unwrap_err();
            assert!(err.to_string().contains(case.error), "{}", err);
        })
    }

    #[test]
    fn test_concat_symbolic_inference() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut ty = None;
        mb.function(
            "main",
            [
                ("a", tensor_type(vec![mil_shape::Dim::new_symbol(), 3.into()], DType::Fp32)),
                ("b", tensor_type([2, 3], DType::Fp32)),
            ],
            |mb, inputs| {
                let out = mb
                    .op("concat")
                    .arg("values", inputs.to_vec())
                    .arg("axis", 1)
                    .build1()?;
                ty = Some(mb.ty(out).clone());
                Ok(vec![out])
            },
        )
        .unwrap();
        assert_eq!(ty, Some(tensor_type([2, 6], DType::Fp32).into()));
    }

    #[test]
    fn test_stack() {
        let out = fold(
            "stack",
            vec![
                (
                    "values",
                    vec![Value::from(Tensor::from([1, 2])), Tensor::from([3, 4]).into()].into(),
                ),
                ("axis", 1.into()),
            ],
        )
        .unwrap();
        assert_eq!(out.shape(), [2, 2]);
        assert_eq!(out.to_i32_vec().unwrap(), [1, 3, 2, 4]);

        let err = fold(
            "stack",
            vec![
                (
                    "values",
                    vec![Value::from(Tensor::from([1, 2])), Tensor::from([3]).into()].into(),
                ),
                ("axis", 0.into()),
            ],
        )
        .unwrap_err();
        assert!(err.to_string().contains("must have the same shape"));
    }

    #[test]
    fn test_tile() {
        let x = Tensor::from([[1, 2], [3, 4]]);
        let out = fold("tile", vec![("x", x.clone().into()), ("reps", [2, 1].into())]).unwrap();
        assert_eq!(out.shape(), [4, 2]);
        assert_eq!(out.to_i32_vec().unwrap(), [1, 2, 3, 4, 1, 2, 3, 4]);

        let out = fold("tile", vec![("x", x.clone().into()), ("reps", [2].into())]).unwrap();
        assert_eq!(out.shape(), [2, 4]);
        assert_eq!(out.to_i32_vec().unwrap(), [1, 2, 1, 2, 3, 4, 3, 4]);

        let err = fold("tile", vec![("x", x.clone().into()), ("reps", [1, 1, 1].into())])
            .unwrap_err();
        assert!(err.to_string().contains("Length of the reps (3)"));

        let err = fold("tile", vec![("x", x.into()), ("reps", [0, 1].into())]).unwrap_err();
        assert!(err.to_string().contains("must be greater than 0"));
    }
}
