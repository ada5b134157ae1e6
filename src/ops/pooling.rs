use mil_shape::Shape;
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    single_output, DefaultValue, EvalContext, InferContext, InputSpec, IntoOpResult, OpDef,
    OpError,
};
use crate::ops::conv::{for_each_window_offset, WindowParams};
use crate::ops::{check_min_rank, op_inputs, unravel};
use crate::types::ValueType;
use crate::value::Value;

#[derive(Copy, Clone, Debug, PartialEq)]
enum PoolKind {
    Average { exclude_padding: bool },
    Max,
    L2,
}

fn read_params(
    kernel_sizes: Vec<i32>,
    strides: Option<Vec<i32>>,
    pad_type: &str,
    pad: Option<Vec<i32>>,
) -> Result<WindowParams, OpError> {
    let kernel = kernel_sizes
        .into_iter()
        .map(|k| {
            if k < 1 {
                Err(OpError::InvalidValue(format!(
                    "kernel_sizes should be positive but got {}",
                    k
                )))
            } else {
                Ok(k as usize)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    WindowParams::from_values(kernel, strides, None, pad_type, pad)
}

fn infer_pool(ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
    let x = ctx.tensor("x")?;
    check_min_rank(x, "x", 3)?;
    let params = read_params(
        ctx.i32s("kernel_sizes")?,
        ctx.opt_i32s("strides")?,
        ctx.str("pad_type")?,
        ctx.opt_i32s("pad")?,
    )?;
    let Some(dims) = x.shape.dims() else {
        return single_output(Shape::unranked(), x.dtype);
    };
    if dims.len() != params.kernel.len() + 2 {
        return Err(OpError::InvalidShape(format!(
            "kernel_sizes has {} values but x has {} spatial dims",
            params.kernel.len(),
            dims.len() - 2
        )));
    }
    let mut out_dims = dims[..2].to_vec();
    for (d, size) in dims[2..].iter().enumerate() {
        out_dims.push(params.output_dim(d, *size)?);
    }
    single_output(Shape::from_dims(out_dims), x.dtype)
}

fn pool(x: &Tensor<f32>, params: &WindowParams, kind: PoolKind) -> Result<Tensor<f32>, OpError> {
    if x.ndim() != params.kernel.len() + 2 {
        return Err(OpError::InvalidShape(format!(
            "kernel_sizes has {} values but x has rank {}",
            params.kernel.len(),
            x.ndim()
        )));
    }
    let [batch, chans] = [x.size(0), x.size(1)];
    let in_spatial = &x.shape()[2..];
    let out_spatial = (0..in_spatial.len())
        .map(|d| params.output_size(d, in_spatial[d]))
        .collect::<Result<Vec<_>, _>>()?;
    let in_len: usize = in_spatial.iter().product();
    let out_len: usize = out_spatial.iter().product();
    let window_len: usize = params.kernel.iter().product();

    let data = x.to_vec();
    let mut out = Vec::with_capacity(batch * chans * out_len);
    for plane in 0..batch * chans {
        let plane_data = &data[plane * in_len..(plane + 1) * in_len];
        for o in 0..out_len {
            let out_index = unravel(o, &out_spatial);
            let mut acc = match kind {
                PoolKind::Max => f32::NEG_INFINITY,
                _ => 0.,
            };
            let mut count = 0;
            for_each_window_offset(params, in_spatial, &out_index, |_, offset| {
                let Some(offset) = offset else {
                    return;
                };
                let val = plane_data[offset];
                count += 1;
                match kind {
                    PoolKind::Average { .. } => acc += val,
                    PoolKind::Max => acc = acc.max(val),
                    PoolKind::L2 => acc += val * val,
                }
            });
            out.push(match kind {
                PoolKind::Average {
                    exclude_padding: true,
                } => acc / count.max(1) as f32,
                PoolKind::Average {
                    exclude_padding: false,
                } => acc / window_len as f32,
                PoolKind::Max => acc,
                PoolKind::L2 => acc.sqrt(),
            });
        }
    }

    let mut shape = vec![batch, chans];
    shape.extend(out_spatial);
    Ok(Tensor::from_data(shape.as_slice(), out))
}

fn eval_pool(ctx: &EvalContext, kind: PoolKind) -> Result<Vec<Value>, OpError> {
    let params = read_params(
        ctx.i32s("kernel_sizes")?,
        ctx.opt_i32s("strides")?,
        ctx.str("pad_type")?,
        ctx.opt_i32s("pad")?,
    )?;
    pool(&ctx.float("x")?, &params, kind).into_op_result()
}

/// Average over each window of the spatial dims.
#[derive(Debug, Default)]
pub struct AvgPool {}

impl OpDef for AvgPool {
    fn name(&self) -> &'static str {
        "avg_pool"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::int("kernel_sizes").constant(),
        InputSpec::int("strides").constant().optional(),
        InputSpec::string("pad_type").default(DefaultValue::Str("valid")),
        InputSpec::int("pad").constant().optional(),
        InputSpec::boolean("exclude_padding_from_average")
            .constant()
            .default(DefaultValue::Bool(false)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        infer_pool(ctx)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let exclude_padding = ctx.bool("exclude_padding_from_average")?;
        eval_pool(ctx, PoolKind::Average { exclude_padding })
    }
}

/// Maximum over each window of the spatial dims. Padding is ignored.
#[derive(Debug, Default)]
pub struct MaxPool {}

impl OpDef for MaxPool {
    fn name(&self) -> &'static str {
        "max_pool"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::int("kernel_sizes").constant(),
        InputSpec::int("strides").constant().optional(),
        InputSpec::string("pad_type").default(DefaultValue::Str("valid")),
        InputSpec::int("pad").constant().optional(),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        infer_pool(ctx)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        eval_pool(ctx, PoolKind::Max)
    }
}

/// Euclidean norm over each window of the spatial dims.
#[derive(Debug, Default)]
pub struct L2Pool {}

impl OpDef for L2Pool {
    fn name(&self) -> &'static str {
        "l2_pool"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::int("kernel_sizes").constant(),
        InputSpec::int("strides").constant().optional(),
        InputSpec::string("pad_type").default(DefaultValue::Str("valid")),
        InputSpec::int("pad").constant().optional(),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        infer_pool(ctx)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        eval_pool(ctx, PoolKind::L2)
    }
}
