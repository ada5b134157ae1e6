use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    resolve_axis, DefaultValue, EvalContext, InferContext, InputSpec, IntoOpResult, OpDef,
    OpError,
};
use crate::ops::{check_min_rank, check_rank, map_lanes, op_inputs, same_type};
use crate::types::ValueType;
use crate::value::Value;

/// Check an optional per-channel parameter of an `[N, C, ...]` input.
fn check_channel_param(ctx: &InferContext, name: &str) -> Result<(), OpError> {
    let Some(param) = ctx.opt_tensor(name)? else {
        return Ok(());
    };
    check_rank(param, name, 1)?;
    let x = ctx.tensor("x")?;
    let channels = x.shape.dim(1).and_then(|d| d.fixed());
    let size = param.shape.dim(0).and_then(|d| d.fixed());
    if let (Some(channels), Some(size)) = (channels, size) {
        if channels != size {
            return Err(OpError::InvalidShape(format!(
                "{} size {} does not match dimension 1 (C) of x ({})",
                name, size, channels
            )));
        }
    }
    Ok(())
}

/// Return a per-channel parameter, or `default` repeated for each channel.
fn channel_values(
    ctx: &EvalContext,
    name: &str,
    channels: usize,
    default: f32,
) -> Result<Vec<f32>, OpError> {
    match ctx.opt_float(name)? {
        Some(values) if values.len() == channels => Ok(values.to_vec()),
        Some(values) => Err(OpError::InvalidShape(format!(
            "{} has {} elements but x has {} channels",
            name,
            values.len(),
            channels
        ))),
        None => Ok(vec![default; channels]),
    }
}

/// Apply `f(channel, chunk)` to each contiguous `[N, C, rest]` chunk of `x`
/// with a given channel index.
fn for_each_channel(
    x: &Tensor<f32>,
    mut f: impl FnMut(usize, &mut [f32]),
) -> Result<Tensor<f32>, OpError> {
    if x.ndim() < 2 {
        return Err(OpError::InvalidShape(
            "x should be at least rank 2".to_string(),
        ));
    }
    let channels = x.size(1);
    let chunk_len: usize = x.shape()[2..].iter().product();
    let mut data = x.to_vec();
    if chunk_len > 0 {
        for (i, chunk) in data.chunks_mut(chunk_len).enumerate() {
            f(i % channels, chunk);
        }
    }
    Ok(Tensor::from_data(x.shape(), data))
}

/// Normalize each channel using the given mean and variance.
#[derive(Debug, Default)]
pub struct BatchNorm {}

impl OpDef for BatchNorm {
    fn name(&self) -> &'static str {
        "batch_norm"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("mean"),
        InputSpec::float("variance"),
        InputSpec::float("gamma").optional(),
        InputSpec::float("beta").optional(),
        InputSpec::float("epsilon")
            .constant()
            .default(DefaultValue::F32(1e-5)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        check_min_rank(ctx.tensor("x")?, "x", 2)?;
        for name in ["mean", "variance", "gamma", "beta"] {
            check_channel_param(ctx, name)?;
        }
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.float("x")?;
        let channels = x.shape().get(1).copied().unwrap_or(0);
        let mean = ctx.float("mean")?.to_vec();
        let var = ctx.float("variance")?.to_vec();
        if mean.len() != channels || var.len() != channels {
            return Err(OpError::InvalidShape(format!(
                "mean and variance should have {} elements",
                channels
            )));
        }
        let gamma = channel_values(ctx, "gamma", channels, 1.)?;
        let beta = channel_values(ctx, "beta", channels, 0.)?;
        let epsilon = ctx.f32("epsilon")?;

        for_each_channel(&x, |c, chunk| {
            let scale = gamma[c] / (var[c] + epsilon).sqrt();
            for el in chunk {
                *el = (*el - mean[c]) * scale + beta[c];
            }
        })
        .into_op_result()
    }
}

/// Normalize each channel of each batch item over its spatial dims.
#[derive(Debug, Default)]
pub struct InstanceNorm {}

impl OpDef for InstanceNorm {
    fn name(&self) -> &'static str {
        "instance_norm"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("gamma").optional(),
        InputSpec::float("beta").optional(),
        InputSpec::float("epsilon")
            .constant()
            .default(DefaultValue::F32(1e-5)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        check_min_rank(ctx.tensor("x")?, "x", 3)?;
        check_channel_param(ctx, "gamma")?;
        check_channel_param(ctx, "beta")?;
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.float("x")?;
        let channels = x.shape().get(1).copied().unwrap_or(0);
        let gamma = channel_values(ctx, "gamma", channels, 1.)?;
        let beta = channel_values(ctx, "beta", channels, 0.)?;
        let epsilon = ctx.f32("epsilon")?;

        for_each_channel(&x, |c, chunk| {
            let n = chunk.len() as f32;
            let mean = chunk.iter().sum::<f32>() / n;
            let var = chunk.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n;
            let scale = gamma[c] / (var + epsilon).sqrt();
            for el in chunk {
                *el = (*el - mean) * scale + beta[c];
            }
        })
        .into_op_result()
    }
}

/// Divide by the L2 norm computed over the last three dims.
#[derive(Debug, Default)]
pub struct L2Norm {}

impl OpDef for L2Norm {
    fn name(&self) -> &'static str {
        "l2_norm"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("epsilon")
            .constant()
            .default(DefaultValue::F32(1e-12)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        check_min_rank(ctx.tensor("x")?, "x", 3)?;
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.float("x")?;
        let rank = x.ndim();
        if rank < 3 {
            return Err(OpError::InvalidShape(
                "x should be at least rank 3".to_string(),
            ));
        }
        let epsilon = ctx.f32("epsilon")?;
        let group_len: usize = x.shape()[rank - 3..].iter().product();
        let mut data = x.to_vec();
        if group_len > 0 {
            for group in data.chunks_mut(group_len) {
                let norm = group.iter().map(|x| x * x).sum::<f32>().sqrt().max(epsilon);
                for el in group {
                    *el /= norm;
                }
            }
        }
        Tensor::from_data(x.shape(), data).into_op_result()
    }
}

/// Normalize over `axes`, then apply an elementwise scale and offset.
#[derive(Debug, Default)]
pub struct LayerNorm {}

impl OpDef for LayerNorm {
    fn name(&self) -> &'static str {
        "layer_norm"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::int("axes").constant().optional(),
        InputSpec::float("gamma").optional(),
        InputSpec::float("beta").optional(),
        InputSpec::float("epsilon")
            .constant()
            .default(DefaultValue::F32(1e-5)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        if let (Some(rank), Some(axes)) = (x.rank(), ctx.opt_i32s("axes")?) {
            for axis in axes {
                resolve_axis(rank, axis, "axis")?;
            }
        }
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.float("x")?;
        let rank = x.ndim();
        let mut axes = match ctx.opt_i32s("axes")? {
            Some(axes) => axes
                .into_iter()
                .map(|axis| resolve_axis(rank, axis, "axis"))
                .collect::<Result<Vec<_>, _>>()?,
            None => (0..rank).collect(),
        };
        axes.sort_unstable();
        axes.dedup();
        let epsilon = ctx.f32("epsilon")?;

        // Move the normalized axes last so each group is contiguous.
        let mut perm: Vec<usize> = (0..rank).filter(|d| !axes.contains(d)).collect();
        perm.extend(axes.iter().copied());
        let permuted = x.permuted(perm.as_slice()).to_tensor();
        let group_len: usize = axes.iter().map(|&d| x.size(d)).product();
        let mut data = permuted.to_vec();
        if group_len > 0 {
            for group in data.chunks_mut(group_len) {
                let n = group.len() as f32;
                let mean = group.iter().sum::<f32>() / n;
                let var = group.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n;
                let inv_std = 1. / (var + epsilon).sqrt();
                for el in group {
                    *el = (*el - mean) * inv_std;
                }
            }
        }
        let normalized = Tensor::from_data(permuted.shape(), data);
        let mut inverse = vec![0; rank];
        for (i, &d) in perm.iter().enumerate() {
            inverse[d] = i;
        }
        let mut out = normalized.permuted(inverse.as_slice()).to_tensor();

        // `gamma` and `beta` have the shape of the normalized dims.
        let norm_shape: Vec<usize> = axes.iter().map(|&d| x.size(d)).collect();
        for (name, is_scale) in [("gamma", true), ("beta", false)] {
            let Some(param) = ctx.opt_float(name)? else {
                continue;
            };
            if param.shape() != norm_shape.as_slice() {
                return Err(OpError::InvalidShape(format!(
                    "{} should have shape {:?} but has shape {:?}",
                    name,
                    norm_shape,
                    param.shape()
                )));
            }
            let mut broadcast_shape = vec![1; rank];
            for &d in &axes {
                broadcast_shape[d] = x.size(d);
            }
            let param = param.into_shape(broadcast_shape.as_slice());
            out = crate::ops::broadcast_map(&out, &param, |a, b| {
                if is_scale {
                    a * b
                } else {
                    a + b
                }
            })?;
        }
        out.into_op_result()
    }
}

/// Normalize each element by the sum of squares over a window of `size`
/// neighbouring channels.
#[derive(Debug, Default)]
pub struct LocalResponseNorm {}

impl OpDef for LocalResponseNorm {
    fn name(&self) -> &'static str {
        "local_response_norm"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::int("size").constant(),
        InputSpec::float("alpha")
            .constant()
            .default(DefaultValue::F32(1e-4)),
        InputSpec::float("beta")
            .constant()
            .default(DefaultValue::F32(0.75)),
        InputSpec::float("k").constant().default(DefaultValue::F32(1.)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        check_min_rank(ctx.tensor("x")?, "x", 3)?;
        let size = ctx.i32("size")?;
        if size < 1 {
            return Err(OpError::InvalidValue(format!(
                "size ({}) should be >= 1",
                size
            )));
        }
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.float("x")?;
        let size = ctx.i32("size")?.max(1) as usize;
        let alpha = ctx.f32("alpha")?;
        let beta = ctx.f32("beta")?;
        let k = ctx.f32("k")?;
        if x.ndim() < 2 {
            return Err(OpError::InvalidShape(
                "x should be at least rank 3".to_string(),
            ));
        }
        let channels = x.size(1);
        let before = (size - 1) / 2;
        let after = size - 1 - before;

        map_lanes(&x, 1, channels, |lane, out| {
            for c in 0..lane.len() {
                let start = c.saturating_sub(before);
                let end = (c + after + 1).min(lane.len());
                let sum_sq: f32 = lane[start..end].iter().map(|x| x * x).sum();
                out.push(lane[c] / (k + alpha / size as f32 * sum_sq).powf(beta));
            }
            Ok(())
        })
        .into_op_result()
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::Tensor;

    use crate::builder::{Arg, Builder};
    use crate::graph::{BuildError, Program};
    use crate::types::ValueType;
    use crate::value::Value;

    fn fold(op: &str, args: Vec<(&str, Arg)>) -> Result<Vec<f32>, BuildError> {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut result = None;
        mb.function("main", Vec::<(&str, ValueType)>::new(), |mb, _| {
            let mut op_builder = mb.op(op);
            for (name, arg) in args {
                op_builder = op_builder.arg(name, arg);
            }
            let out = op_builder.build1()?;
            result = mb.value(out).cloned();
            Ok(vec![out])
        })?;
        Ok(result.and_then(|v: Value| v.to_f32_vec().ok()).unwrap())
    }

    #[test]
    fn test_batch_norm() {
        let x = Tensor::from_data(&[1, 2, 2], vec![1f32, 3., 2., 4.]);
        let result = fold(
            "batch_norm",
            vec![
                ("x", x.into()),
                ("mean", [2f32, 3.].into()),
                ("variance", [1f32, 4.].into()),
                ("beta", [0f32, 1.].into()),
                ("epsilon", 0f32.into()),
            ],
        )
        .unwrap();
        assert_eq!(result, [-1., 1., 0.5, 1.5]);

        let err = fold(
            "batch_norm",
            vec![
                ("x", Tensor::<f32>::zeros(&[1, 2, 2]).into()),
                ("mean", [0f32, 0., 0.].into()),
                ("variance", [1f32, 1.].into()),
            ],
        )
        .err()
        .unwrap();
        assert!(err
            .to_string()
            .contains("mean size 3 does not match dimension 1 (C) of x"));
    }

    #[test]
    fn test_instance_and_layer_norm() {
        let x = Tensor::from_data(&[1, 1, 4], vec![1f32, 2., 3., 4.]);
        let instance = fold("instance_norm", vec![("x", x.clone().into())]).unwrap();
        let layer = fold(
            "layer_norm",
            vec![("x", x.into()), ("axes", [-1].into())],
        )
        .unwrap();
        let expected = [-1.3416, -0.4472, 0.4472, 1.3416];
        mil_testing::assert_close(&instance, &expected, 1e-3, 0.);
        mil_testing::assert_close(&layer, &expected, 1e-3, 0.);
    }

    #[test]
    fn test_l2_norm() {
        let x = Tensor::from_data(&[1, 2, 1, 1], vec![3f32, 4.]);
        let result = fold("l2_norm", vec![("x", x.into())]).unwrap();
        mil_testing::assert_close(&result, &[0.6, 0.8], 1e-6, 0.);
    }

    #[test]
    fn test_local_response_norm() {
        let x = Tensor::from_data(&[1, 3, 1], vec![1f32, 2., 3.]);
        let result = fold(
            "local_response_norm",
            vec![
                ("x", x.into()),
                ("size", 3.into()),
                ("alpha", 3f32.into()),
                ("beta", 1f32.into()),
            ],
        )
        .unwrap();
        // Window sums of squares are 5, 14 and 13.
        mil_testing::assert_close(&result, &[1. / 6., 2. / 15., 3. / 14.], 1e-6, 0.);
    }
}
