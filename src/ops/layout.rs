//! Operators which query or change the shape of a tensor, or move elements
//! between dimensions.

use mil_shape::{Dim, Shape};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    resolve_axis, single_output, DefaultValue, EvalContext, InferContext, InputSpec, OpDef,
    OpError, TypeDomain,
};
use crate::ops::{check_rank, op_inputs, ranked_dims};
use crate::types::{DType, ValueType};
use crate::value::{map_tensor, Value};

/// Copy the elements of `t` into a new shape with the same length.
fn reshaped<T: Clone>(t: &Tensor<T>, shape: &[usize]) -> Tensor<T> {
    Tensor::from_data(shape, t.to_vec())
}

fn reshape_value(value: &Value, shape: &[usize]) -> Result<Value, OpError> {
    let len: usize = shape.iter().product();
    if len != value.len() {
        return Err(OpError::InvalidShape(format!(
            "cannot reshape tensor of size {} into shape {:?}",
            value.len(),
            shape
        )));
    }
    Ok(map_tensor!(value, t => reshaped(t, shape)))
}

fn permute_value(value: &Value, perm: &[usize]) -> Result<Value, OpError> {
    Ok(map_tensor!(value, t => t.permuted(perm).to_tensor()))
}

/// Resolve the target of `reshape` against the input shape.
///
/// A `-1` entry takes the size needed to preserve the element count and a
/// `0` entry copies the corresponding input dim.
fn resolve_reshape(input: Option<&[Dim]>, target: &[i32]) -> Result<Shape, OpError> {
    if target.iter().filter(|&&s| s == -1).count() > 1 {
        return Err(OpError::InvalidValue(
            "shape can contain at most one -1".to_string(),
        ));
    }
    let mut dims = Vec::with_capacity(target.len());
    for (i, &size) in target.iter().enumerate() {
        let dim = match size {
            -1 => None,
            0 => match input.and_then(|dims| dims.get(i)) {
                Some(dim) => Some(*dim),
                None => Some(Dim::new_symbol()),
            },
            s if s > 0 => Some(Dim::Fixed(s as usize)),
            s => {
                return Err(OpError::InvalidValue(format!(
                    "shape entries should be >= -1 but got {}",
                    s
                )))
            }
        };
        dims.push(dim);
    }

    let input_len: Option<usize> = input.and_then(|dims| dims.iter().map(|d| d.fixed()).product());
    let known_len: Option<usize> = dims
        .iter()
        .flatten()
        .map(|d| d.fixed())
        .product();

    let inferred = match (input_len, known_len) {
        (Some(input_len), Some(known_len)) => {
            let inferred = if known_len == 0 { 0 } else { input_len / known_len };
            let has_unknown = dims.iter().any(|d| d.is_none());
            let total = if has_unknown {
                known_len * inferred
            } else {
                known_len
            };
            if total != input_len || (has_unknown && known_len == 0) {
                return Err(OpError::InvalidShape(format!(
                    "cannot reshape tensor of size {} into shape {:?}",
                    input_len, target
                )));
            }
            Dim::Fixed(inferred)
        }
        _ => Dim::new_symbol(),
    };
    Ok(Shape::from_dims(dims.into_iter().map(|d| d.unwrap_or(inferred))))
}

/// Resolve `reshape` targets against a concrete input shape.
fn resolve_reshape_sizes(input: &[usize], target: &[i32]) -> Result<Vec<usize>, OpError> {
    let dims: Vec<Dim> = input.iter().map(|&s| Dim::Fixed(s)).collect();
    resolve_reshape(Some(&dims), target)?
        .to_fixed()
        .ok_or_else(|| OpError::InvalidShape(format!("cannot resolve shape {:?}", target)))
}

/// Change the shape of a tensor without changing its elements.
#[derive(Debug, Default)]
pub struct Reshape {}

impl OpDef for Reshape {
    fn name(&self) -> &'static str {
        "reshape"
    }

    op_inputs!(InputSpec::new("x"), InputSpec::int("shape"));

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let shape_ty = ctx.tensor("shape")?;
        check_rank(shape_ty, "shape", 1)?;
        let shape = match ctx.value("shape") {
            Some(target) => resolve_reshape(x.shape.dims(), &target.to_i32_vec()?)?,
            None => match shape_ty.shape.dim(0).and_then(|d| d.fixed()) {
                Some(rank) => Shape::symbolic(rank),
                None => Shape::unranked(),
            },
        };
        single_output(shape, x.dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let shape = resolve_reshape_sizes(&x.shape(), &ctx.i32s("shape")?)?;
        Ok(vec![reshape_value(x, &shape)?])
    }
}

/// Resolve and sort the `axes` of `expand_dims` for an output of rank
/// `out_rank`.
fn expand_axes(axes: &[i32], out_rank: usize) -> Result<Vec<usize>, OpError> {
    let mut resolved = axes
        .iter()
        .map(|&axis| resolve_axis(out_rank, axis, "axis"))
        .collect::<Result<Vec<_>, _>>()?;
    resolved.sort();
    if resolved.windows(2).any(|w| w[0] == w[1]) {
        return Err(OpError::InvalidValue(format!(
            "axes {:?} contain duplicates",
            axes
        )));
    }
    Ok(resolved)
}

fn expanded<T: Clone>(dims: &[T], axes: &[usize], one: T) -> Vec<T> {
    let mut out = Vec::with_capacity(dims.len() + axes.len());
    let mut src = dims.iter();
    for i in 0..dims.len() + axes.len() {
        if axes.contains(&i) {
            out.push(one.clone());
        } else if let Some(dim) = src.next() {
            out.push(dim.clone());
        }
    }
    out
}

/// Insert size-1 dims at `axes`, which index into the output shape.
#[derive(Debug, Default)]
pub struct ExpandDims {}

impl OpDef for ExpandDims {
    fn name(&self) -> &'static str {
        "expand_dims"
    }

    op_inputs!(InputSpec::new("x"), InputSpec::int("axes").constant());

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let Some(dims) = x.shape.dims() else {
            return single_output(Shape::unranked(), x.dtype);
        };
        let axes_param = ctx.i32s("axes")?;
        let axes = expand_axes(&axes_param, dims.len() + axes_param.len())?;
        single_output(
            Shape::from_dims(expanded(dims, &axes, Dim::Fixed(1))),
            x.dtype,
        )
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let shape = x.shape();
        let axes_param = ctx.i32s("axes")?;
        let axes = expand_axes(&axes_param, shape.len() + axes_param.len())?;
        Ok(vec![reshape_value(x, &expanded(&shape, &axes, 1))?])
    }
}

/// Resolve the axes removed by `squeeze`. Without `axes`, every dim of size
/// 1 is removed.
fn squeeze_axes(dims: &[Dim], axes: Option<&[i32]>) -> Result<Vec<usize>, OpError> {
    match axes {
        Some(axes) => {
            let mut resolved = Vec::with_capacity(axes.len());
            for &axis in axes {
                let axis = resolve_axis(dims.len(), axis, "axis")?;
                if let Dim::Fixed(size) = dims[axis] {
                    if size != 1 {
                        return Err(OpError::InvalidShape(format!(
                            "cannot squeeze axis {} with size {}",
                            axis, size
                        )));
                    }
                }
                resolved.push(axis);
            }
            Ok(resolved)
        }
        None => Ok(dims
            .iter()
            .enumerate()
            .filter(|(_, dim)| dim.fixed() == Some(1))
            .map(|(i, _)| i)
            .collect()),
    }
}

/// Remove size-1 dims.
#[derive(Debug, Default)]
pub struct Squeeze {}

impl OpDef for Squeeze {
    fn name(&self) -> &'static str {
        "squeeze"
    }

    op_inputs!(
        InputSpec::new("x"),
        InputSpec::int("axes").constant().optional()
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let Some(dims) = x.shape.dims() else {
            return single_output(Shape::unranked(), x.dtype);
        };
        let axes_param = ctx.opt_i32s("axes")?;
        if axes_param.is_none() && dims.iter().any(|d| d.is_symbolic()) {
            // Which dims are removed depends on the runtime shape.
            return single_output(Shape::unranked(), x.dtype);
        }
        let axes = squeeze_axes(dims, axes_param.as_deref())?;
        let out = dims
            .iter()
            .enumerate()
            .filter(|(i, _)| !axes.contains(i))
            .map(|(_, d)| *d);
        single_output(Shape::from_dims(out), x.dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let shape = x.shape();
        let dims: Vec<Dim> = shape.iter().map(|&s| Dim::Fixed(s)).collect();
        let axes = squeeze_axes(&dims, ctx.opt_i32s("axes")?.as_deref())?;
        let out: Vec<usize> = shape
            .iter()
            .enumerate()
            .filter(|(i, _)| !axes.contains(i))
            .map(|(_, s)| *s)
            .collect();
        Ok(vec![reshape_value(x, &out)?])
    }
}

/// Check that `perm` is a permutation of `0..rank`, resolving negative
/// entries.
fn resolve_perm(perm: &[i32], rank: usize) -> Result<Vec<usize>, OpError> {
    if perm.len() != rank {
        return Err(OpError::InvalidValue(format!(
            "perm has {} entries but x has rank {}",
            perm.len(),
            rank
        )));
    }
    let resolved = perm
        .iter()
        .map(|&p| resolve_axis(rank, p, "perm"))
        .collect::<Result<Vec<_>, _>>()?;
    let mut seen = vec![false; rank];
    for &p in &resolved {
        if std::mem::replace(&mut seen[p], true) {
            return Err(OpError::InvalidValue(format!(
                "perm {:?} is not a permutation",
                perm
            )));
        }
    }
    Ok(resolved)
}

/// Permute the dims of a tensor.
#[derive(Debug, Default)]
pub struct Transpose {}

impl OpDef for Transpose {
    fn name(&self) -> &'static str {
        "transpose"
    }

    op_inputs!(InputSpec::new("x"), InputSpec::int("perm").constant());

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let perm = ctx.i32s("perm")?;
        let Some(dims) = x.shape.dims() else {
            return single_output(Shape::symbolic(perm.len()), x.dtype);
        };
        let perm = resolve_perm(&perm, dims.len())?;
        single_output(Shape::from_dims(perm.iter().map(|&p| dims[p])), x.dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let perm = resolve_perm(&ctx.i32s("perm")?, x.ndim())?;
        Ok(vec![permute_value(x, &perm)?])
    }
}

/// Split point of `flatten`. Negative axes count from the end, and `rank`
/// itself is allowed.
fn flatten_axis(axis: i32, rank: usize) -> Result<usize, OpError> {
    let resolved = if axis < 0 { axis + rank as i32 } else { axis };
    if resolved < 0 || resolved as usize > rank {
        return Err(OpError::InvalidValue(format!(
            "axis {} out of bound for rank {}",
            axis, rank
        )));
    }
    Ok(resolved as usize)
}

fn dim_product(dims: &[Dim]) -> Dim {
    dims.iter()
        .map(|d| d.fixed())
        .product::<Option<usize>>()
        .map(Dim::Fixed)
        .unwrap_or_else(Dim::new_symbol)
}

/// Reshape to 2D, combining the dims before and after `axis`.
#[derive(Debug, Default)]
pub struct Flatten {}

impl OpDef for Flatten {
    fn name(&self) -> &'static str {
        "flatten"
    }

    op_inputs!(
        InputSpec::new("x"),
        InputSpec::int("axis").constant().default(DefaultValue::I32(1)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let Some(dims) = x.shape.dims() else {
            return single_output(Shape::symbolic(2), x.dtype);
        };
        let axis = flatten_axis(ctx.i32("axis")?, dims.len())?;
        single_output(
            Shape::from_dims([dim_product(&dims[..axis]), dim_product(&dims[axis..])]),
            x.dtype,
        )
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let shape = x.shape();
        let axis = flatten_axis(ctx.i32("axis")?, shape.len())?;
        let outer: usize = shape[..axis].iter().product();
        let inner: usize = shape[axis..].iter().product();
        Ok(vec![reshape_value(x, &[outer, inner])?])
    }
}

/// Return the shape of a tensor as a 1D int32 tensor.
#[derive(Debug, Default)]
pub struct ShapeOp {}

impl OpDef for ShapeOp {
    fn name(&self) -> &'static str {
        "shape"
    }

    op_inputs!(InputSpec::new("x").domain(TypeDomain::Tensor));

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let rank = match x.rank() {
            Some(rank) => Dim::Fixed(rank),
            None => Dim::new_symbol(),
        };
        single_output(Shape::from_dims([rank]), DType::Int32)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let shape: Vec<i32> = ctx.value("x")?.shape().iter().map(|&s| s as i32).collect();
        Ok(vec![Value::from(shape)])
    }
}

/// Ordering of the channel dim when moving elements between channels and
/// spatial dims.
#[derive(Copy, Clone, Debug, PartialEq)]
enum ChannelOrder {
    /// Depth-column-row, as used by TensorFlow's `depth_to_space`.
    DepthColumnRow,
    /// Column-row-depth, as used by PyTorch's `pixel_shuffle`.
    ColumnRowDepth,
}

fn check_block_size(block: i32, name: &str) -> Result<usize, OpError> {
    if block < 1 {
        return Err(OpError::InvalidValue(format!(
            "{} should be positive but got {}",
            name, block
        )));
    }
    Ok(block as usize)
}

fn depth_to_space(x: &Value, block: usize, order: ChannelOrder) -> Result<Value, OpError> {
    let &[n, c, h, w] = x.shape().as_slice() else {
        return Err(OpError::InvalidShape("x should be rank 4".to_string()));
    };
    if c % (block * block) != 0 {
        return Err(OpError::InvalidShape(format!(
            "channels ({}) should be divisible by the square of the block size ({})",
            c, block
        )));
    }
    let new_c = c / (block * block);
    let (split, perm) = match order {
        ChannelOrder::DepthColumnRow => ([n, block, block, new_c, h, w], [0, 3, 4, 1, 5, 2]),
        ChannelOrder::ColumnRowDepth => ([n, new_c, block, block, h, w], [0, 1, 4, 2, 5, 3]),
    };
    let tmp = reshape_value(x, &split)?;
    let tmp = permute_value(&tmp, &perm)?;
    reshape_value(&tmp, &[n, new_c, h * block, w * block])
}

fn infer_depth_to_space(ctx: &InferContext, block: usize) -> Result<Vec<ValueType>, OpError> {
    let x = ctx.tensor("x")?;
    check_rank(x, "x", 4)?;
    let Some(dims) = x.shape.dims() else {
        return single_output(Shape::symbolic(4), x.dtype);
    };
    let scale = |dim: Dim, f: &dyn Fn(usize) -> Option<usize>| match dim {
        Dim::Fixed(size) => f(size).map(Dim::Fixed).ok_or_else(|| {
            OpError::InvalidShape(format!(
                "channels ({}) should be divisible by the square of the block size ({})",
                size, block
            ))
        }),
        Dim::Symbol(_) => Ok(Dim::new_symbol()),
    };
    let c = scale(dims[1], &|c| {
        (c % (block * block) == 0).then_some(c / (block * block))
    })?;
    let h = scale(dims[2], &|h| Some(h * block))?;
    let w = scale(dims[3], &|w| Some(w * block))?;
    single_output(Shape::from_dims([dims[0], c, h, w]), x.dtype)
}

/// Move blocks of channels into spatial dims, using DCR ordering.
#[derive(Debug, Default)]
pub struct DepthToSpace {}

impl OpDef for DepthToSpace {
    fn name(&self) -> &'static str {
        "depth_to_space"
    }

    op_inputs!(InputSpec::new("x"), InputSpec::int("block_size").constant());

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let block = check_block_size(ctx.i32("block_size")?, "block_size")?;
        infer_depth_to_space(ctx, block)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let block = check_block_size(ctx.i32("block_size")?, "block_size")?;
        Ok(vec![depth_to_space(
            ctx.value("x")?,
            block,
            ChannelOrder::DepthColumnRow,
        )?])
    }
}

/// Rearrange `[N, C * r * r, H, W]` to `[N, C, H * r, W * r]` with CRD
/// ordering.
#[derive(Debug, Default)]
pub struct PixelShuffle {}

impl OpDef for PixelShuffle {
    fn name(&self) -> &'static str {
        "pixel_shuffle"
    }

    op_inputs!(
        InputSpec::new("x"),
        InputSpec::int("upscale_factor").constant()
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let block = check_block_size(ctx.i32("upscale_factor")?, "upscale_factor")?;
        infer_depth_to_space(ctx, block)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let block = check_block_size(ctx.i32("upscale_factor")?, "upscale_factor")?;
        Ok(vec![depth_to_space(
            ctx.value("x")?,
            block,
            ChannelOrder::ColumnRowDepth,
        )?])
    }
}

/// Move spatial blocks into channels. The inverse of `depth_to_space`.
#[derive(Debug, Default)]
pub struct SpaceToDepth {}

impl OpDef for SpaceToDepth {
    fn name(&self) -> &'static str {
        "space_to_depth"
    }

    op_inputs!(InputSpec::new("x"), InputSpec::int("block_size").constant());

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let block = check_block_size(ctx.i32("block_size")?, "block_size")?;
        let x = ctx.tensor("x")?;
        check_rank(x, "x", 4)?;
        let dims = ranked_dims(&x.shape, "x")?;
        let mut out = vec![dims[0]];
        out.push(match dims[1] {
            Dim::Fixed(c) => Dim::Fixed(c * block * block),
            Dim::Symbol(_) => Dim::new_symbol(),
        });
        for dim in &dims[2..] {
            out.push(match *dim {
                Dim::Fixed(size) if size % block == 0 => Dim::Fixed(size / block),
                Dim::Fixed(size) => {
                    return Err(OpError::InvalidShape(format!(
                        "spatial size {} should be divisible by block_size ({})",
                        size, block
                    )))
                }
                Dim::Symbol(_) => Dim::new_symbol(),
            });
        }
        single_output(Shape::from_dims(out), x.dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let block = check_block_size(ctx.i32("block_size")?, "block_size")?;
        let x = ctx.value("x")?;
        let &[n, c, h, w] = x.shape().as_slice() else {
            return Err(OpError::InvalidShape("x should be rank 4".to_string()));
        };
        if h % block != 0 || w % block != 0 {
            return Err(OpError::InvalidShape(format!(
                "spatial dims ({}, {}) should be divisible by block_size ({})",
                h, w, block
            )));
        }
        let (new_h, new_w) = (h / block, w / block);
        let tmp = reshape_value(x, &[n, c, new_h, block, new_w, block])?;
        let tmp = permute_value(&tmp, &[0, 3, 5, 1, 2, 4])?;
        Ok(vec![reshape_value(
            &tmp,
            &[n, c * block * block, new_h, new_w],
        )?])
    }
}

#[cfg(test)]
mod tests {
    use mil_shape::Dim;
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

    fn arange(shape: &[usize]) -> Tensor<i32> {
        let len: usize = shape.iter().product();
        Tensor::from_data(shape, (0..len as i32).collect::<Vec<_>>())
    }

    #[test]
    fn test_reshape() {
        let out = fold(
            "reshape",
            vec![("x", arange(&[2, 3, 4]).into()), ("shape", [0, -1].into())],
        )
        .unwrap();
        assert_eq!(out.shape(), [2, 12]);

        let err = fold(
            "reshape",
            vec![("x", arange(&[2, 3]).into()), ("shape", [4, -1].into())],
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot reshape tensor of size 6"));
    }

    #[test]
    fn test_reshape_symbolic() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut ty = None;
        mb.function(
            "main",
            [("x", tensor_type(vec![Dim::new_symbol(), Dim::Fixed(6)], DType::Fp32))],
            |mb, inputs| {
                let out = mb
                    .op("reshape")
                    .arg("x", inputs[0])
                    .arg("shape", [-1, 3])
                    .build1()?;
                ty = Some(mb.ty(out).clone());
                Ok(vec![out])
            },
        )
        .unwrap();
        let ty = ty.unwrap();
        let shape = &ty.as_tensor().unwrap().shape;
        assert!(shape.dim(0).unwrap().is_symbolic());
        assert_eq!(shape.dim(1), Some(Dim::Fixed(3)));
    }

    #[test]
    fn test_expand_dims_and_squeeze() {
        let x = arange(&[2, 3]);
        let expanded = fold(
            "expand_dims",
            vec![("x", x.clone().into()), ("axes", [0, -1].into())],
        )
        .unwrap();
        assert_eq!(expanded.shape(), [1, 2, 3, 1]);

        let squeezed = fold("squeeze", vec![("x", expanded.clone().into())]).unwrap();
        assert_eq!(squeezed, Value::from(x));

        let partial = fold(
            "squeeze",
            vec![("x", expanded.clone().into()), ("axes", [3].into())],
        )
        .unwrap();
        assert_eq!(partial.shape(), [1, 2, 3]);

        let err = fold("squeeze", vec![("x", expanded.into()), ("axes", [1].into())]).unwrap_err();
        assert!(err.to_string().contains("cannot squeeze axis 1 with size 2"));
    }

    #[test]
    fn test_transpose_and_flatten() {
        let out = fold(
            "transpose",
            vec![("x", arange(&[2, 3]).into()), ("perm", [1, 0].into())],
        )
        .unwrap();
        assert_eq!(out, Value::from(Tensor::from([[0, 3], [1, 4], [2, 5]])));

        assert!(fold(
            "transpose",
            vec![("x", arange(&[2, 3]).into()), ("perm", [0, 0].into())],
        )
        .is_err());

        for (shape, axis, expected) in [
            (vec![3], -1, [1, 3]),
            (vec![3], 1, [3, 1]),
            (vec![2, 3, 2], -1, [6, 2]),
            (vec![5, 5, 2], 1, [5, 10]),
        ] {
            let out = fold(
                "flatten",
                vec![("x", arange(&shape).into()), ("axis", axis.into())],
            )
            .unwrap();
            assert_eq!(out.shape(), expected);
        }
    }

    #[test]
    fn test_shape() {
        let out = fold("shape", vec![("x", arange(&[4, 1, 2]).into())]).unwrap();
        assert_eq!(out, Value::from(vec![4, 1, 2]));
    }

    #[test]
    fn test_depth_to_space_and_back() {
        let x = arange(&[1, 4, 1, 1]);
        let d2s = fold(
            "depth_to_space",
            vec![("x", x.clone().into()), ("block_size", 2.into())],
        )
        .unwrap();
        assert_eq!(d2s.shape(), [1, 1, 2, 2]);
        assert_eq!(d2s.to_i32_vec().unwrap(), [0, 1, 2, 3]);

        let s2d = fold(
            "space_to_depth",
            vec![("x", d2s.into()), ("block_size", 2.into())],
        )
        .unwrap();
        assert_eq!(s2d, Value::from(x));

        // With two output channels the orderings differ.
        let x = arange(&[1, 8, 1, 1]);
        let dcr = fold(
            "depth_to_space",
            vec![("x", x.clone().into()), ("block_size", 2.into())],
        )
        .unwrap();
        assert_eq!(dcr.to_i32_vec().unwrap(), [0, 2, 4, 6, 1, 3, 5, 7]);
        let crd = fold(
            "pixel_shuffle",
            vec![("x", x.into()), ("upscale_factor", 2.into())],
        )
        .unwrap();
        assert_eq!(crd.to_i32_vec().unwrap(), [0, 1, 2, 3, 4, 5, 6, 7]);
    }
}
