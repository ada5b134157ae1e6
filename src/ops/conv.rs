use mil_shape::{Dim, Shape};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    single_output, DefaultValue, EvalContext, InferContext, InputSpec, IntoOpResult, OpDef,
    OpError,
};
use crate::ops::{check_min_rank, check_rank, op_inputs, promoted_dtype, strides, unravel};
use crate::types::ValueType;
use crate::value::Value;

/// How padding for a convolution or pooling window is determined.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum PadType {
    /// No padding.
    Valid,
    /// Pad so that `out = ceil(in / stride)`, with any odd padding after.
    Same,
    /// As `Same`, with any odd padding before.
    SameLower,
    /// Padding given by the `pad` parameter.
    Custom,
}

impl PadType {
    pub(crate) fn parse(pad_type: &str) -> Result<PadType, OpError> {
        match pad_type {
            "valid" => Ok(PadType::Valid),
            "same" => Ok(PadType::Same),
            "same_lower" => Ok(PadType::SameLower),
            "custom" => Ok(PadType::Custom),
            _ => Err(OpError::InvalidValue(format!(
                "pad_type should be one of valid, same, same_lower or custom but got \"{}\"",
                pad_type
            ))),
        }
    }
}

/// Return `values` if present, checking its length, or `default` repeated
/// `n` times.
pub(crate) fn per_dim(
    values: Option<Vec<i32>>,
    name: &str,
    n: usize,
    default: usize,
) -> Result<Vec<usize>, OpError> {
    match values {
        Some(values) if values.len() != n => Err(OpError::InvalidValue(format!(
            "{} should have {} values but has {}",
            name,
            n,
            values.len()
        ))),
        Some(values) => values
            .into_iter()
            .map(|v| {
                if v < 1 {
                    Err(OpError::InvalidValue(format!(
                        "{} should be positive but got {}",
                        name, v
                    )))
                } else {
                    Ok(v as usize)
                }
            })
            .collect(),
        None => Ok(vec![default; n]),
    }
}

/// Parameters of a sliding window over the spatial dims of an input.
#[derive(Clone, Debug)]
pub(crate) struct WindowParams {
    pub pad_type: PadType,
    pub kernel: Vec<usize>,
    pub strides: Vec<usize>,
    pub dilations: Vec<usize>,

    /// `[begin, end]` padding for each spatial dim, used for `Custom`.
    pub pad: Vec<[usize; 2]>,
}

impl WindowParams {
    /// Read `strides`, `dilations`, `pad_type` and `pad` from an operation
    /// with `n` spatial dims and kernel sizes `kernel`.
    pub(crate) fn from_values(
        kernel: Vec<usize>,
        strides: Option<Vec<i32>>,
        dilations: Option<Vec<i32>>,
        pad_type: &str,
        pad: Option<Vec<i32>>,
    ) -> Result<WindowParams, OpError> {
        let n = kernel.len();
        let pad_type = PadType::parse(pad_type)?;
        let pad = match (pad_type, pad) {
            (PadType::Custom, Some(pad)) => {
                if pad.len() != 2 * n {
                    return Err(OpError::InvalidValue(format!(
                        "pad should have {} values but has {}",
                        2 * n,
                        pad.len()
                    )));
                }
                if let Some(p) = pad.iter().find(|&&p| p < 0) {
                    return Err(OpError::InvalidValue(format!(
                        "pad should not be negative but got {}",
                        p
                    )));
                }
                pad.chunks(2)
                    .map(|p| [p[0] as usize, p[1] as usize])
                    .collect()
            }
            (PadType::Custom, None) => {
                return Err(OpError::MissingInput("pad".to_string()));
            }
            _ => vec![[0, 0]; n],
        };
        Ok(WindowParams {
            pad_type,
            strides: per_dim(strides, "strides", n, 1)?,
            dilations: per_dim(dilations, "dilations", n, 1)?,
            kernel,
            pad,
        })
    }

    fn effective_kernel(&self, dim: usize) -> usize {
        self.dilations[dim] * (self.kernel[dim].max(1) - 1) + 1
    }

    /// Return the `[begin, end]` padding of spatial dim `dim` for input
    /// size `size`.
    pub(crate) fn padding(&self, dim: usize, size: usize) -> [usize; 2] {
        match self.pad_type {
            PadType::Valid => [0, 0],
            PadType::Custom => self.pad[dim],
            PadType::Same | PadType::SameLower => {
                let stride = self.strides[dim];
                let out = size.div_ceil(stride);
                let total = ((out.max(1) - 1) * stride + self.effective_kernel(dim))
                    .saturating_sub(size);
                let half = total / 2;
                if self.pad_type == PadType::Same {
                    [half, total - half]
                } else {
                    [total - half, half]
                }
            }
        }
    }

    /// Output size of spatial dim `dim`.
    pub(crate) fn output_size(&self, dim: usize, size: usize) -> Result<usize, OpError> {
        let [begin, end] = self.padding(dim, size);
        let padded = size + begin + end;
        let window = self.effective_kernel(dim);
        if padded < window {
            return Err(OpError::InvalidShape(format!(
                "window of size {} is larger than padded input size {} in spatial dim {}",
                window, padded, dim
            )));
        }
        Ok((padded - window) / self.strides[dim] + 1)
    }

    /// Output size of a symbolic spatial dim.
    pub(crate) fn output_dim(&self, dim: usize, size: Dim) -> Result<Dim, OpError> {
        match size {
            Dim::Fixed(size) => self.output_size(dim, size).map(Dim::Fixed),
            Dim::Symbol(_) => Ok(Dim::new_symbol()),
        }
    }
}

/// Visit each position of a window over an N-d input.
///
/// Calls `f(input_offset)` for every kernel position of output position
/// `out_index` which falls inside the input, and `f(None)` for positions in
/// the padding.
pub(crate) fn for_each_window_offset(
    params: &WindowParams,
    in_spatial: &[usize],
    out_index: &[usize],
    mut f: impl FnMut(usize, Option<usize>),
) {
    let n_kernel: usize = params.kernel.iter().product();
    let in_strides = strides(in_spatial);
    for k in 0..n_kernel {
        let k_index = unravel(k, &params.kernel);
        let mut offset = 0;
        let mut inside = true;
        for d in 0..in_spatial.len() {
            let [pad_begin, _] = params.padding(d, in_spatial[d]);
            let pos = (out_index[d] * params.strides[d] + k_index[d] * params.dilations[d])
                as isize
                - pad_begin as isize;
            if pos < 0 || pos as usize >= in_spatial[d] {
                inside = false;
                break;
            }
            offset += pos as usize * in_strides[d];
        }
        f(k, inside.then_some(offset));
    }
}

/// N-d convolution of `x` (`[N, C_in, ...]`) with `weight`
/// (`[C_out, C_in / groups, ...]`).
fn conv_nd(
    x: &Tensor<f32>,
    weight: &Tensor<f32>,
    bias: Option<&[f32]>,
    params: &WindowParams,
    groups: usize,
) -> Result<Tensor<f32>, OpError> {
    let batch = x.size(0);
    let in_chans = x.size(1);
    let out_chans = weight.size(0);
    let in_spatial = &x.shape()[2..];
    let group_in = weight.size(1);
    if groups == 0 || in_chans != group_in * groups || out_chans % groups != 0 {
        return Err(OpError::InvalidShape(format!(
            "input channels ({}) should equal weight dim 1 ({}) times groups ({})",
            in_chans, group_in, groups
        )));
    }
    let group_out = out_chans / groups;

    let out_spatial = (0..in_spatial.len())
        .map(|d| params.output_size(d, in_spatial[d]))
        .collect::<Result<Vec<_>, _>>()?;
    let in_len: usize = in_spatial.iter().product();
    let out_len: usize = out_spatial.iter().product();
    let k_len: usize = params.kernel.iter().product();

    let x_data = x.to_vec();
    let w_data = weight.to_vec();
    let mut out = vec![0.; batch * out_chans * out_len];

    for n in 0..batch {
        for oc in 0..out_chans {
            let g = oc / group_out;
            let init = bias.map(|b| b[oc]).unwrap_or(0.);
            for o in 0..out_len {
                let out_index = unravel(o, &out_spatial);
                let mut acc = init;
                for ic in 0..group_in {
                    let in_chan = g * group_in + ic;
                    let x_base = (n * in_chans + in_chan) * in_len;
                    let w_base = (oc * group_in + ic) * k_len;
                    for_each_window_offset(params, in_spatial, &out_index, |k, offset| {
                        if let Some(offset) = offset {
                            acc += x_data[x_base + offset] * w_data[w_base + k];
                        }
                    });
                }
                out[(n * out_chans + oc) * out_len + o] = acc;
            }
        }
    }

    let mut shape = vec![batch, out_chans];
    shape.extend(out_spatial);
    Ok(Tensor::from_data(shape.as_slice(), out))
}

/// Kernel sizes from the known shape of a weight, or `None`.
pub(crate) fn kernel_sizes(weight: &Shape) -> Option<Vec<usize>> {
    weight.dims().map(|dims| {
        dims[2.min(dims.len())..]
            .iter()
            .map(|d| d.fixed().unwrap_or(1))
            .collect()
    })
}

/// N-d convolution with optional grouping, dilation and padding.
#[derive(Debug, Default)]
pub struct Conv {}

impl OpDef for Conv {
    fn name(&self) -> &'static str {
        "conv"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("weight"),
        InputSpec::float("bias").optional(),
        InputSpec::int("strides").constant().optional(),
        InputSpec::string("pad_type").default(DefaultValue::Str("valid")),
        InputSpec::int("pad").constant().optional(),
        InputSpec::int("dilations").constant().optional(),
        InputSpec::int("groups").constant().default(DefaultValue::I32(1)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let weight = ctx.tensor("weight")?;
        check_min_rank(x, "x", 3)?;
        check_min_rank(weight, "weight", 3)?;
        if let Some(bias) = ctx.opt_tensor("bias")? {
            check_rank(bias, "bias", 1)?;
        }
        let dtype = promoted_dtype(ctx, &["x", "weight"])?;
        let groups = ctx.i32("groups")?;
        if groups < 1 {
            return Err(OpError::InvalidValue(format!(
                "groups ({}) should be >= 1",
                groups
            )));
        }

        let (Some(x_dims), Some(w_dims), Some(kernel)) = (
            x.shape.dims(),
            weight.shape.dims(),
            kernel_sizes(&weight.shape),
        ) else {
            return single_output(Shape::unranked(), dtype);
        };
        if x_dims.len() != w_dims.len() {
            return Err(OpError::InvalidShape(format!(
                "x has rank {} but weight has rank {}",
                x_dims.len(),
                w_dims.len()
            )));
        }
        if let (Some(in_chans), Some(group_in)) = (x_dims[1].fixed(), w_dims[1].fixed()) {
            if in_chans != group_in * groups as usize {
                return Err(OpError::InvalidShape(format!(
                    "input channels ({}) should equal weight dim 1 ({}) times groups ({})",
                    in_chans, group_in, groups
                )));
            }
        }

        let params = WindowParams::from_values(
            kernel,
            ctx.opt_i32s("strides")?,
            ctx.opt_i32s("dilations")?,
            ctx.str("pad_type")?,
            ctx.opt_i32s("pad")?,
        )?;
        let mut dims = vec![x_dims[0], w_dims[0]];
        for (d, size) in x_dims[2..].iter().enumerate() {
            dims.push(params.output_dim(d, *size)?);
        }
        single_output(Shape::from_dims(dims), dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.float("x")?;
        let weight = ctx.float("weight")?;
        if x.ndim() < 3 || x.ndim() != weight.ndim() {
            return Err(OpError::InvalidShape(
                "x and weight should have the same rank, at least 3".to_string(),
            ));
        }
        let params = WindowParams::from_values(
            weight.shape()[2..].to_vec(),
            ctx.opt_i32s("strides")?,
            ctx.opt_i32s("dilations")?,
            ctx.str("pad_type")?,
            ctx.opt_i32s("pad")?,
        )?;
        let bias = ctx.opt_float("bias")?.map(|b| b.to_vec());
        conv_nd(
            &x,
            &weight,
            bias.as_deref(),
            &params,
            ctx.i32("groups")?.max(0) as usize,
        )
        .into_op_result()
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::Tensor;

    use super::{PadType, WindowParams};
    use crate::builder::{Arg, Builder};
    use crate::graph::{BuildError, Program};
    use crate::types::{tensor_type, DType, ValueType};
    use crate::value::Value;

    fn fold_conv(args: Vec<(&str, Arg)>) -> Result<Value, BuildError> {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut result = None;
        mb.function("main", Vec::<(&str, ValueType)>::new(), |mb, _| {
            let mut op = mb.op("conv");
            for (name, arg) in args {
                op = op.arg(name, arg);
            }
            let out = op.build1()?;
            result = mb.value(out).cloned();
            Ok(vec![out])
        })?;
        Ok(result.unwrap())
    }

    #[test]
    fn test_same_padding() {
        let params =
            WindowParams::from_values(vec![3], Some(vec![2]), None, "same", None).unwrap();
        assert_eq!(params.pad_type, PadType::Same);
        assert_eq!(params.padding(0, 5), [1, 1]);
        assert_eq!(params.output_size(0, 5).unwrap(), 3);
        assert_eq!(params.padding(0, 6), [0, 1]);
        assert_eq!(params.output_size(0, 6).unwrap(), 3);

        let lower =
            WindowParams::from_values(vec![2], None, None, "same_lower", None).unwrap();
        assert_eq!(lower.padding(0, 4), [1, 0]);
    }

    #[test]
    fn test_conv_1d() {
        let x = Tensor::from_data(&[1, 1, 5], vec![1f32, 2., 3., 4., 5.]);
        let weight = Tensor::from_data(&[1, 1, 3], vec![1f32, 0., -1.]);
        let out = fold_conv(vec![("x", x.clone().into()), ("weight", weight.clone().into())])
            .unwrap();
        assert_eq!(out.shape(), [1, 1, 3]);
        assert_eq!(out.to_f32_vec().unwrap(), [-2., -2., -2.]);

        let out = fold_conv(vec![
            ("x", x.into()),
            ("weight", weight.into()),
            ("bias", [10f32].into()),
            ("pad_type", "custom".into()),
            ("pad", [1, 1].into()),
            ("strides", [2].into()),
        ])
        .unwrap();
        assert_eq!(out.to_f32_vec().unwrap(), [8., 8., 14.]);
    }

    #[test]
    fn test_conv_2d_groups_and_dilation() {
        let x = Tensor::from_data(&[1, 2, 3, 3], (0..18).map(|v| v as f32).collect::<Vec<_>>());
        let weight = Tensor::from_data(&[2, 1, 2, 2], vec![1f32; 8]);
        let out = fold_conv(vec![
            ("x", x.into()),
            ("weight", weight.into()),
            ("groups", 2.into()),
            ("dilations", [2, 2].into()),
        ])
        .unwrap();
        // Each output sums the corners of one channel.
        assert_eq!(out.shape(), [1, 2, 1, 1]);
        assert_eq!(out.to_f32_vec().unwrap(), [16., 52.]);
    }

    #[test]
    fn test_conv_shape_inference() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut ty = None;
        mb.function(
            "main",
            [("x", tensor_type([1, 3, 32, 20], DType::Fp32))],
            |mb, inputs| {
                let weight = Tensor::<f32>::zeros(&[8, 3, 3, 3]);
                let out = mb
                    .op("conv")
                    .arg("x", inputs[0])
                    .arg("weight", weight)
                    .arg("strides", [2, 2])
                    .arg("pad_type", "same")
                    .build1()?;
                ty = Some(mb.ty(out).clone());
                Ok(vec![out])
            },
        )
        .unwrap();
        assert_eq!(
            ty.unwrap().as_tensor().unwrap().shape.to_fixed(),
            Some(vec![1, 8, 16, 10])
        );
    }
}
