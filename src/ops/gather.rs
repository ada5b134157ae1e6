use mil_shape::{Dim, Shape};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    resolve_axis, single_output, DefaultValue, EvalContext, InferContext, InputSpec, OpDef,
    OpError,
};
use crate::ops::{op_inputs, same_type, strides, unravel};
use crate::types::ValueType;
use crate::value::{map_tensor, Value};

/// Resolve a possibly negative index into a dim of size `size`.
fn resolve_index(index: i32, size: usize, axis: usize) -> Result<usize, OpError> {
    let resolved = if index < 0 {
        index as isize + size as isize
    } else {
        index as isize
    };
    if resolved < 0 || resolved as usize >= size {
        return Err(OpError::InvalidValue(format!(
            "index {} is out of bounds for axis {} with size {}",
            index, axis, size
        )));
    }
    Ok(resolved as usize)
}

/// Offsets into `shape` selected by `gather` along `axis`, in output order,
/// together with the output shape.
fn axis_offsets(
    shape: &[usize],
    axis: usize,
    indices: &Tensor<i32>,
) -> Result<(Vec<usize>, Vec<usize>), OpError> {
    let outer: usize = shape[..axis].iter().product();
    let inner: usize = shape[axis + 1..].iter().product();
    let size = shape[axis];
    let resolved = indices
        .iter()
        .map(|&i| resolve_index(i, size, axis))
        .collect::<Result<Vec<_>, _>>()?;

    let mut offsets = Vec::with_capacity(outer * resolved.len() * inner);
    for o in 0..outer {
        for &idx in &resolved {
            let base = (o * size + idx) * inner;
            offsets.extend(base..base + inner);
        }
    }

    let mut out_shape = shape[..axis].to_vec();
    out_shape.extend_from_slice(indices.shape());
    out_shape.extend_from_slice(&shape[axis + 1..]);
    Ok((offsets, out_shape))
}

/// Offsets into `shape` for `gather_along_axis`. The output has the shape
/// of `indices`.
fn along_axis_offsets(
    shape: &[usize],
    axis: usize,
    indices: &Tensor<i32>,
) -> Result<Vec<usize>, OpError> {
    if indices.ndim() != shape.len() {
        return Err(OpError::InvalidShape(format!(
            "indices should have rank {} but has rank {}",
            shape.len(),
            indices.ndim()
        )));
    }
    for (d, (&size, &index_size)) in shape.iter().zip(indices.shape()).enumerate() {
        if d != axis && index_size > size {
            return Err(OpError::InvalidShape(format!(
                "indices dim {} ({}) exceeds dim {} of x ({})",
                d, index_size, d, size
            )));
        }
    }
    let data_strides = strides(shape);
    indices
        .iter()
        .enumerate()
        .map(|(pos, &index)| {
            let index_pos = unravel(pos, indices.shape());
            let mut offset = 0;
            for d in 0..shape.len() {
                let i = if d == axis {
                    resolve_index(index, shape[axis], axis)?
                } else {
                    index_pos[d]
                };
                offset += i * data_strides[d];
            }
            Ok(offset)
        })
        .collect()
}

/// Offsets into `shape` for `gather_nd`, together with the output shape.
fn nd_offsets(shape: &[usize], indices: &Tensor<i32>) -> Result<(Vec<usize>, Vec<usize>), OpError> {
    let Some(&k) = indices.shape().last() else {
        return Err(OpError::InvalidShape(
            "indices should be at least rank 1".to_string(),
        ));
    };
    if k > shape.len() {
        return Err(OpError::InvalidShape(format!(
            "indices last dim ({}) exceeds the rank of x ({})",
            k,
            shape.len()
        )));
    }
    let data_strides = strides(shape);
    let inner: usize = shape[k..].iter().product();
    let index_data = indices.to_vec();

    let n_tuples: usize = indices.shape()[..indices.ndim() - 1].iter().product();
    let mut offsets = Vec::with_capacity(n_tuples * inner);
    for t in 0..n_tuples {
        let mut base = 0;
        for (d, &i) in index_data[t * k..(t + 1) * k].iter().enumerate() {
            base += resolve_index(i, shape[d], d)? * data_strides[d];
        }
        offsets.extend(base..base + inner);
    }

    let mut out_shape = indices.shape()[..indices.ndim() - 1].to_vec();
    out_shape.extend_from_slice(&shape[k..]);
    Ok((offsets, out_shape))
}

fn take<T: Clone>(data: &Tensor<T>, offsets: &[usize], shape: &[usize]) -> Tensor<T> {
    let data = data.to_vec();
    Tensor::from_data(shape, offsets.iter().map(|&o| data[o].clone()).collect::<Vec<_>>())
}

/// How `scatter` ops combine updates with existing values.
#[derive(Copy, Clone, Debug, PartialEq)]
enum ScatterMode {
    Update,
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

impl ScatterMode {
    fn parse(mode: &str) -> Result<ScatterMode, OpError> {
        match mode {
            "update" => Ok(ScatterMode::Update),
            "add" => Ok(ScatterMode::Add),
            "sub" => Ok(ScatterMode::Sub),
            "mul" => Ok(ScatterMode::Mul),
            "div" => Ok(ScatterMode::Div),
            "max" => Ok(ScatterMode::Max),
            "min" => Ok(ScatterMode::Min),
            _ => Err(OpError::InvalidValue(format!(
                "mode should be one of update, add, sub, mul, div, max or min but got \"{}\"",
                mode
            ))),
        }
    }
}

/// Element types which can be scattered.
trait ScatterElement: Copy {
    fn combine(mode: ScatterMode, current: Self, update: Self) -> Result<Self, OpError>;
}

impl ScatterElement for f32 {
    fn combine(mode: ScatterMode, current: f32, update: f32) -> Result<f32, OpError> {
        Ok(match mode {
            ScatterMode::Update => update,
            ScatterMode::Add => current + update,
            ScatterMode::Sub => current - update,
            ScatterMode::Mul => current * update,
            ScatterMode::Div => current / update,
            ScatterMode::Max => current.max(update),
            ScatterMode::Min => current.min(update),
        })
    }
}

impl ScatterElement for i32 {
    fn combine(mode: ScatterMode, current: i32, update: i32) -> Result<i32, OpError> {
        Ok(match mode {
            ScatterMode::Update => update,
            ScatterMode::Add => current.wrapping_add(update),
            ScatterMode::Sub => current.wrapping_sub(update),
            ScatterMode::Mul => current.wrapping_mul(update),
            ScatterMode::Div => current.checked_div(update).ok_or_else(|| {
                OpError::InvalidValue("integer division by zero in scatter".to_string())
            })?,
            ScatterMode::Max => current.max(update),
            ScatterMode::Min => current.min(update),
        })
    }
}

impl ScatterElement for bool {
    fn combine(mode: ScatterMode, current: bool, update: bool) -> Result<bool, OpError> {
        match mode {
            ScatterMode::Update => Ok(update),
            ScatterMode::Max => Ok(current || update),
            ScatterMode::Min => Ok(current && update),
            _ => Err(OpError::InvalidType(format!(
                "scatter mode {:?} is not supported for bool tensors",
                mode
            ))),
        }
    }
}

/// Apply `updates` to `data` at `offsets`, in order.
fn scatter_into<T: ScatterElement>(
    data: &Tensor<T>,
    offsets: &[usize],
    updates: &Tensor<T>,
    mode: ScatterMode,
) -> Result<Tensor<T>, OpError> {
    if updates.len() != offsets.len() {
        return Err(OpError::InvalidShape(format!(
            "updates has {} elements but {} are expected",
            updates.len(),
            offsets.len()
        )));
    }
    let mut out = data.to_vec();
    for (&offset, &update) in offsets.iter().zip(updates.iter()) {
        out[offset] = T::combine(mode, out[offset], update)?;
    }
    Ok(Tensor::from_data(data.shape(), out))
}

/// Scatter `updates` into `data`, converting updates to the type of `data`.
fn scatter_value(
    data: &Value,
    offsets: &[usize],
    updates: &Value,
    update_shape: Option<&[usize]>,
    mode: ScatterMode,
) -> Result<Value, OpError> {
    if let Some(expected) = update_shape {
        if updates.shape() != expected {
            return Err(OpError::InvalidShape(format!(
                "updates should have shape {:?} but has shape {:?}",
                expected,
                updates.shape()
            )));
        }
    }
    let updates = updates.cast(data.dtype())?;
    let result = match (data, &updates) {
        (Value::Float(data), Value::Float(updates)) => {
            Value::Float(scatter_into(data, offsets, updates, mode)?)
        }
        (Value::Int(data), Value::Int(updates)) => {
            Value::Int(scatter_into(data, offsets, updates, mode)?)
        }
        (Value::Bool(data), Value::Bool(updates)) => {
            Value::Bool(scatter_into(data, offsets, updates, mode)?)
        }
        _ => {
            return Err(OpError::InvalidType(format!(
                "cannot scatter into a {}",
                data.kind_name()
            )))
        }
    };
    Ok(result)
}

/// Gather slices of `x` along `axis`.
#[derive(Debug, Default)]
pub struct Gather {}

impl OpDef for Gather {
    fn name(&self) -> &'static str {
        "gather"
    }

    op_inputs!(
        InputSpec::new("x"),
        InputSpec::int("indices"),
        InputSpec::int("axis").constant().default(DefaultValue::I32(0)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let indices = ctx.tensor("indices")?;
        let (Some(x_dims), Some(index_dims)) = (x.shape.dims(), indices.shape.dims()) else {
            return single_output(Shape::unranked(), x.dtype);
        };
        if x_dims.is_empty() {
            return Err(OpError::InvalidShape(
                "x should be at least rank 1".to_string(),
            ));
        }
        let axis = resolve_axis(x_dims.len(), ctx.i32("axis")?, "axis")?;
        let dims = x_dims[..axis]
            .iter()
            .chain(index_dims)
            .chain(&x_dims[axis + 1..])
            .copied();
        single_output(Shape::from_dims(dims), x.dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let shape = x.shape();
        if shape.is_empty() {
            return Err(OpError::InvalidShape(
                "x should be at least rank 1".to_string(),
            ));
        }
        let axis = resolve_axis(shape.len(), ctx.i32("axis")?, "axis")?;
        let (offsets, out_shape) = axis_offsets(&shape, axis, &ctx.int("indices")?)?;
        Ok(vec![map_tensor!(x, t => take(t, &offsets, &out_shape))])
    }
}

/// Gather elements of `x` along `axis` at positions given by `indices`,
/// which has the same rank as `x`.
#[derive(Debug, Default)]
pub struct GatherAlongAxis {}

impl OpDef for GatherAlongAxis {
    fn name(&self) -> &'static str {
        "gather_along_axis"
    }

    op_inputs!(
        InputSpec::new("x"),
        InputSpec::int("indices"),
        InputSpec::int("axis").constant().default(DefaultValue::I32(0)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let indices = ctx.tensor("indices")?;
        if let (Some(x_rank), Some(index_rank)) = (x.rank(), indices.rank()) {
            if x_rank != index_rank {
                return Err(OpError::InvalidShape(format!(
                    "indices should have rank {} but has rank {}",
                    x_rank, index_rank
                )));
            }
            resolve_axis(x_rank, ctx.i32("axis")?, "axis")?;
        }
        single_output(indices.shape.clone(), x.dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let shape = x.shape();
        let axis = resolve_axis(shape.len(), ctx.i32("axis")?, "axis")?;
        let indices = ctx.int("indices")?;
        let offsets = along_axis_offsets(&shape, axis, &indices)?;
        Ok(vec![map_tensor!(x, t => take(t, &offsets, indices.shape()))])
    }
}

/// Gather slices of `x` addressed by the tuples in the last dim of
/// `indices`.
#[derive(Debug, Default)]
pub struct GatherNd {}

impl OpDef for GatherNd {
    fn name(&self) -> &'static str {
        "gather_nd"
    }

    op_inputs!(InputSpec::new("x"), InputSpec::int("indices"));

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let indices = ctx.tensor("indices")?;
        let (Some(x_dims), Some(index_dims)) = (x.shape.dims(), indices.shape.dims()) else {
            return single_output(Shape::unranked(), x.dtype);
        };
        let Some((last, batch)) = index_dims.split_last() else {
            return Err(OpError::InvalidShape(
                "indices should be at least rank 1".to_string(),
            ));
        };
        let Dim::Fixed(k) = *last else {
            return single_output(Shape::unranked(), x.dtype);
        };
        if k > x_dims.len() {
            return Err(OpError::InvalidShape(format!(
                "indices last dim ({}) exceeds the rank of x ({})",
                k,
                x_dims.len()
            )));
        }
        let dims = batch.iter().chain(&x_dims[k..]).copied();
        single_output(Shape::from_dims(dims), x.dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let (offsets, out_shape) = nd_offsets(&x.shape(), &ctx.int("indices")?)?;
        Ok(vec![map_tensor!(x, t => take(t, &offsets, &out_shape))])
    }
}

/// Combine `updates` with slices of `data` along `axis`.
#[derive(Debug, Default)]
pub struct Scatter {}

impl OpDef for Scatter {
    fn name(&self) -> &'static str {
        "scatter"
    }

    op_inputs!(
        InputSpec::new("data"),
        InputSpec::int("indices"),
        InputSpec::new("updates"),
        InputSpec::int("axis").constant().default(DefaultValue::I32(0)),
        InputSpec::string("mode").default(DefaultValue::Str("add")),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        ScatterMode::parse(ctx.str("mode")?)?;
        if let Some(rank) = ctx.tensor("data")?.rank() {
            resolve_axis(rank, ctx.i32("axis")?, "axis")?;
        }
        same_type(ctx, "data")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let data = ctx.value("data")?;
        let shape = data.shape();
        let axis = resolve_axis(shape.len(), ctx.i32("axis")?, "axis")?;
        let (offsets, update_shape) = axis_offsets(&shape, axis, &ctx.int("indices")?)?;
        let mode = ScatterMode::parse(ctx.str("mode")?)?;
        let out = scatter_value(
            data,
            &offsets,
            ctx.value("updates")?,
            Some(&update_shape),
            mode,
        )?;
        Ok(vec![out])
    }
}

/// Combine `updates` with elements of `data` along `axis`, at positions
/// given by `indices`.
#[derive(Debug, Default)]
pub struct ScatterAlongAxis {}

impl OpDef for ScatterAlongAxis {
    fn name(&self) -> &'static str {
        "scatter_along_axis"
    }

    op_inputs!(
        InputSpec::new("data"),
        InputSpec::int("indices"),
        InputSpec::new("updates"),
        InputSpec::int("axis").constant().default(DefaultValue::I32(0)),
        InputSpec::string("mode").default(DefaultValue::Str("add")),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        ScatterMode::parse(ctx.str("mode")?)?;
        if let Some(rank) = ctx.tensor("data")?.rank() {
            resolve_axis(rank, ctx.i32("axis")?, "axis")?;
        }
        same_type(ctx, "data")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let data = ctx.value("data")?;
        let shape = data.shape();
        let axis = resolve_axis(shape.len(), ctx.i32("axis")?, "axis")?;
        let indices = ctx.int("indices")?;
        let offsets = along_axis_offsets(&shape, axis, &indices)?;
        let mode = ScatterMode::parse(ctx.str("mode")?)?;
        let out = scatter_value(
            data,
            &offsets,
            ctx.value("updates")?,
            Some(indices.shape()),
            mode,
        )?;
        Ok(vec![out])
    }
}

/// Combine `updates` with slices of `data` addressed by the tuples in the
/// last dim of `indices`.
#[derive(Debug, Default)]
pub struct ScatterNd {}

impl OpDef for ScatterNd {
    fn name(&self) -> &'static str {
        "scatter_nd"
    }

    op_inputs!(
        InputSpec::new("data"),
        InputSpec::int("indices"),
        InputSpec::new("updates"),
        InputSpec::string("mode").default(DefaultValue::Str("add")),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        ScatterMode::parse(ctx.str("mode")?)?;
        same_type(ctx, "data")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let data = ctx.value("data")?;
        let (offsets, update_shape) = nd_offsets(&data.shape(), &ctx.int("indices")?)?;
        let mode = ScatterMode::parse(ctx.str("mode")?)?;
        let out = scatter_value(
            data,
            &offsets,
            ctx.value("updates")?,
            Some(&update_shape),
            mode,
        )?;
        Ok(vec![out])
    }
}

#[cfg(test)]
mod tests {
    use mil_testing::TestCases;
    use rten_tensor::Tensor;

    use crate::builder::{Arg, Builder};
    use crate::graph::{BuildError, Program};
    use crate::types::ValueType;
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
    fn test_gather() {
        let x = Tensor::from([[1, 2, 3], [4, 5, 6]]);

        let rows = fold(
            "gather",
            vec![("x", x.clone().into()), ("indices", [1, -2, 1].into())],
        )
        .unwrap();
        assert_eq!(rows, Value::from(Tensor::from([[4, 5, 6], [1, 2, 3], [4, 5, 6]])));

        let cols = fold(
            "gather",
            vec![
                ("x", x.clone().into()),
                ("indices", Tensor::from([[2], [0]]).into()),
                ("axis", 1.into()),
            ],
        )
        .unwrap();
        assert_eq!(cols.shape(), [2, 2, 1]);
        assert_eq!(cols.to_i32_vec().unwrap(), [3, 1, 6, 4]);

        let err = fold("gather", vec![("x", x.into()), ("indices", [2].into())]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "gather \"gather_0\": index 2 is out of bounds for axis 0 with size 2"
        );
    }

    #[test]
    fn test_gather_along_axis_and_nd() {
        let x = Tensor::from([[1f32, 2.], [3., 4.]]);
        let along = fold(
            "gather_along_axis",
            vec![
                ("x", x.clone().into()),
                ("indices", Tensor::from([[1, 0], [0, 0]]).into()),
                ("axis", 1.into()),
            ],
        )
        .unwrap();
        assert_eq!(along, Value::from(Tensor::from([[2f32, 1.], [3., 3.]])));

        let nd = fold(
            "gather_nd",
            vec![
                ("x", x.into()),
                ("indices", Tensor::from([[1, 0], [0, 1]]).into()),
            ],
        )
        .unwrap();
        assert_eq!(nd, Value::from(vec![3f32, 2.]));
    }

    #[test]
    fn test_scatter_modes() {
        #[derive(Debug)]
        struct Case {
            mode: &'static str,
            expected: [f32; 4],
        }

        let cases = [
            Case {
                mode: "update",
                expected: [1., 5., 3., 4.],
            },
            Case {
                mode: "add",
                expected: [1., 13., 3., 4.],
            },
            Case {
                mode: "sub",
                expected: [1., -9., 3., 4.],
            },
            Case {
                mode: "mul",
                expected: [1., 60., 3., 4.],
            },
            Case {
                mode: "max",
                expected: [1., 6., 3., 4.],
            },
            Case {
                mode: "min",
                expected: [1., 2., 3., 4.],
            },
        ];

        // Index 1 is updated twice, with 6 then 5.
        cases.test_each(|case| {
            let out = fold(
                "scatter",
                vec![
                    ("data", vec![1f32, 2., 3., 4.].into()),
                    ("indices", [1, 1].into()),
                    ("updates", vec![6f32, 5.].into()),
                    ("mode", case.mode.into()),
                ],
            )
            .unwrap();
            assert_eq!(out.to_f32_vec().unwrap(), case.expected);
        });
    }

    #[test]
    fn test_scatter_nd_and_along_axis() {
        let out = fold(
            "scatter_nd",
            vec![
                ("data", Tensor::<i32>::zeros(&[2, 2]).into()),
                ("indices", Tensor::from([[0, 1], [1, 0]]).into()),
                ("updates", [7, 8].into()),
                ("mode", "update".into()),
            ],
        )
        .unwrap();
        assert_eq!(out, Value::from(Tensor::from([[0, 7], [8, 0]])));

        let out = fold(
            "scatter_along_axis",
            vec![
                ("data", Tensor::from([[1, 1], [1, 1]]).into()),
                ("indices", Tensor::from([[1], [0]]).into()),
                ("updates", Tensor::from([[5], [6]]).into()),
                ("axis", 1.into()),
            ],
        )
        .unwrap();
        assert_eq!(out, Value::from(Tensor::from([[1, 6], [7, 1]])));
    }
}
