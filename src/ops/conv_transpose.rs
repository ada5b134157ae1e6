use mil_shape::{Dim, Shape};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    single_output, DefaultValue, EvalContext, InferContext, InputSpec, IntoOpResult, OpDef,
    OpError,
};
use crate::ops::conv::{kernel_sizes, per_dim, PadType};
use crate::ops::{check_min_rank, op_inputs, promoted_dtype, strides, unravel};
use crate::types::ValueType;
use crate::value::Value;

/// Window parameters of a transposed convolution.
struct TransposeParams {
    pad_type: PadType,
    kernel: Vec<usize>,
    strides: Vec<usize>,
    dilations: Vec<usize>,
    pad: Vec<[usize; 2]>,

    /// Spatial output sizes from `output_shape`, if given.
    output_sizes: Option<Vec<usize>>,
}

impl TransposeParams {
    fn new(
        kernel: Vec<usize>,
        strides: Option<Vec<i32>>,
        dilations: Option<Vec<i32>>,
        pad_type: &str,
        pad: Option<Vec<i32>>,
        output_shape: Option<Vec<i32>>,
    ) -> Result<TransposeParams, OpError> {
        let n = kernel.len();
        let pad_type = PadType::parse(pad_type)?;
        let pad = match (pad_type, pad) {
            (PadType::Custom, Some(pad)) if pad.len() == 2 * n && pad.iter().all(|&p| p >= 0) => {
                pad.chunks(2)
                    .map(|p| [p[0] as usize, p[1] as usize])
                    .collect()
            }
            (PadType::Custom, Some(pad)) => {
                return Err(OpError::InvalidValue(format!(
                    "pad should have {} non-negative values but got {:?}",
                    2 * n,
                    pad
                )))
            }
            (PadType::Custom, None) => return Err(OpError::MissingInput("pad".to_string())),
            _ => vec![[0, 0]; n],
        };

        // `output_shape` may be either the full output shape or only its
        // spatial dims.
        let output_sizes = match output_shape {
            Some(shape) => {
                let spatial = if shape.len() == n + 2 {
                    &shape[2..]
                } else if shape.len() == n {
                    &shape[..]
                } else {
                    return Err(OpError::InvalidValue(format!(
                        "output_shape should have {} or {} values but has {}",
                        n,
                        n + 2,
                        shape.len()
                    )));
                };
                Some(spatial.iter().map(|&s| s.max(0) as usize).collect())
            }
            None => None,
        };

        Ok(TransposeParams {
            pad_type,
            strides: per_dim(strides, "strides", n, 1)?,
            dilations: per_dim(dilations, "dilations", n, 1)?,
            kernel,
            pad,
            output_sizes,
        })
    }

    /// Size of the full, unpadded output of spatial dim `dim`.
    fn full_size(&self, dim: usize, size: usize) -> usize {
        (size.max(1) - 1) * self.strides[dim] + self.dilations[dim] * self.kernel[dim].saturating_sub(1) + 1
    }

    /// Amount removed from the start of the full output of dim `dim`.
    fn pad_begin(&self, dim: usize, size: usize) -> usize {
        match self.pad_type {
            PadType::Valid => 0,
            PadType::Custom => self.pad[dim][0],
            PadType::Same | PadType::SameLower => {
                let total = self
                    .full_size(dim, size)
                    .saturating_sub(size * self.strides[dim]);
                if self.pad_type == PadType::Same {
                    total / 2
                } else {
                    total - total / 2
                }
            }
        }
    }

    fn output_size(&self, dim: usize, size: usize) -> Result<usize, OpError> {
        if let Some(sizes) = &self.output_sizes {
            return Ok(sizes[dim]);
        }
        let full = self.full_size(dim, size);
        let pad_total = match self.pad_type {
            PadType::Valid => 0,
            PadType::Custom => self.pad[dim][0] + self.pad[dim][1],
            PadType::Same | PadType::SameLower => full.saturating_sub(size * self.strides[dim]),
        };
        full.checked_sub(pad_total).ok_or_else(|| {
            OpError::InvalidShape(format!(
                "padding ({}) exceeds output size ({}) in spatial dim {}",
                pad_total, full, dim
            ))
        })
    }

    fn output_dim(&self, dim: usize, size: Dim) -> Result<Dim, OpError> {
        if let Some(sizes) = &self.output_sizes {
            return Ok(Dim::Fixed(sizes[dim]));
        }
        match size {
            Dim::Fixed(size) => self.output_size(dim, size).map(Dim::Fixed),
            Dim::Symbol(_) => Ok(Dim::new_symbol()),
        }
    }
}

/// Transposed convolution of `x` (`[N, C_in, ...]`) with `weight`
/// (`[C_in, C_out / groups, ...]`).
fn conv_transpose_nd(
    x: &Tensor<f32>,
    weight: &Tensor<f32>,
    bias: Option<&[f32]>,
    params: &TransposeParams,
    groups: usize,
) -> Result<Tensor<f32>, OpError> {
    let batch = x.size(0);
    let in_chans = x.size(1);
    if groups == 0 || weight.size(0) != in_chans || in_chans % groups != 0 {
        return Err(OpError::InvalidShape(format!(
            "input channels ({}) should equal weight dim 0 ({}) and be divisible by groups ({})",
            in_chans,
            weight.size(0),
            groups
        )));
    }
    let group_in = in_chans / groups;
    let group_out = weight.size(1);
    let out_chans = group_out * groups;
    let in_spatial = &x.shape()[2..];
    let out_spatial = (0..in_spatial.len())
        .map(|d| params.output_size(d, in_spatial[d]))
        .collect::<Result<Vec<_>, _>>()?;
    let pad_begin: Vec<usize> = (0..in_spatial.len())
        .map(|d| params.pad_begin(d, in_spatial[d]))
        .collect();

    let in_len: usize = in_spatial.iter().product();
    let out_len: usize = out_spatial.iter().product();
    let k_len: usize = params.kernel.iter().product();
    let out_strides = strides(&out_spatial);

    let x_data = x.to_vec();
    let w_data = weight.to_vec();
    let mut out = vec![0f32; batch * out_chans * out_len];
    for n in 0..batch {
        for oc in 0..out_chans {
            let base = (n * out_chans + oc) * out_len;
            if let Some(bias) = bias {
                out[base..base + out_len].fill(bias[oc]);
            }
        }
    }

    for n in 0..batch {
        for ic in 0..in_chans {
            let g = ic / group_in;
            for i in 0..in_len {
                let in_index = unravel(i, in_spatial);
                let x_val = x_data[(n * in_chans + ic) * in_len + i];
                for k in 0..k_len {
                    let k_index = unravel(k, &params.kernel);
                    let mut offset = 0;
                    let mut inside = true;
                    for d in 0..in_spatial.len() {
                        let pos = (in_index[d] * params.strides[d]
                            + k_index[d] * params.dilations[d])
                            as isize
                            - pad_begin[d] as isize;
                        if pos < 0 || pos as usize >= out_spatial[d] {
                            inside = false;
                            break;
                        }
                        offset += pos as usize * out_strides[d];
                    }
                    if !inside {
                        continue;
                    }
                    for ocg in 0..group_out {
                        let oc = g * group_out + ocg;
                        let w = w_data[(ic * group_out + ocg) * k_len + k];
                        out[(n * out_chans + oc) * out_len + offset] += x_val * w;
                    }
                }
            }
        }
    }

    let mut shape = vec![batch, out_chans];
    shape.extend(out_spatial);
    Ok(Tensor::from_data(shape.as_slice(), out))
}

/// Transposed (fractionally strided) N-d convolution.
#[derive(Debug, Default)]
pub struct ConvTranspose {}

impl OpDef for ConvTranspose {
    fn name(&self) -> &'static str {
        "conv_transpose"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("weight"),
        InputSpec::float("bias").optional(),
        InputSpec::int("pad").constant().optional(),
        InputSpec::int("output_shape").constant().optional(),
        InputSpec::string("pad_type").default(DefaultValue::Str("valid")),
        InputSpec::int("strides").constant().optional(),
        InputSpec::int("dilations").constant().optional(),
        InputSpec::int("groups").constant().default(DefaultValue::I32(1)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let weight = ctx.tensor("weight")?;
        check_min_rank(x, "x", 3)?;
        check_min_rank(weight, "weight", 3)?;
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
        let params = TransposeParams::new(
            kernel,
            ctx.opt_i32s("strides")?,
            ctx.opt_i32s("dilations")?,
            ctx.str("pad_type")?,
            ctx.opt_i32s("pad")?,
            ctx.opt_i32s("output_shape")?,
        )?;
        let out_chans = match w_dims[1] {
            Dim::Fixed(size) => Dim::Fixed(size * groups as usize),
            Dim::Symbol(_) => Dim::new_symbol(),
        };
        let mut dims = vec![x_dims[0], out_chans];
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
        let params = TransposeParams::new(
            weight.shape()[2..].to_vec(),
            ctx.opt_i32s("strides")?,
            ctx.opt_i32s("dilations")?,
            ctx.str("pad_type")?,
            ctx.opt_i32s("pad")?,
            ctx.opt_i32s("output_shape")?,
        )?;
        let bias = ctx.opt_float("bias")?.map(|b| b.to_vec());
        conv_transpose_nd(
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

    use crate::builder::Builder;
    use crate::graph::Program;
    use crate::types::{tensor_type, DType, ValueType};
    use crate::value::Value;

    #[test]
    fn test_conv_transpose_1d() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut results = Vec::new();
        mb.function("main", Vec::<(&str, ValueType)>::new(), |mb, _| {
            let x = mb.constant(Tensor::from_data(&[1, 1, 3], vec![1f32, 2., 3.]))?;
            let weight = mb.constant(Tensor::from_data(&[1, 1, 2], vec![1f32, 10.]))?;

            let valid = mb
                .op("conv_transpose")
                .arg("x", x)
                .arg("weight", weight)
                .arg("strides", [2])
                .build1()?;
            let padded = mb
                .op("conv_transpose")
                .arg("x", x)
                .arg("weight", weight)
                .arg("pad_type", "custom")
                .arg("pad", [1, 0])
                .arg("bias", [0.5f32])
                .build1()?;
            results.push(mb.value(valid).cloned());
            results.push(mb.value(padded).cloned());
            Ok(vec![valid, padded])
        })
        .unwrap();

        // Stride 2: each input writes two adjacent outputs.
        assert_eq!(
            results[0],
            Some(Value::from(Tensor::from_data(
                &[1, 1, 6],
                vec![1f32, 10., 2., 20., 3., 30.]
            )))
        );
        // Stride 1 full output is [1, 12, 23, 30]; the first element is
        // removed by padding.
        assert_eq!(
            results[1],
            Some(Value::from(Tensor::from_data(
                &[1, 1, 3],
                vec![12.5f32, 23.5, 30.5]
            )))
        );
    }

    #[test]
    fn test_conv_transpose_shape() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut types = Vec::new();
        mb.function(
            "main",
            [("x", tensor_type([1, 4, 5, 7], DType::Fp32))],
            |mb, inputs| {
                let weight = Tensor::<f32>::zeros(&[4, 3, 3, 3]);
                let out = mb
                    .op("conv_transpose")
                    .arg("x", inputs[0])
                    .arg("weight", weight.clone())
                    .arg("strides", [2, 2])
                    .arg("groups", 2)
                    .build1()?;
                let same = mb
                    .op("conv_transpose")
                    .arg("x", inputs[0])
                    .arg("weight", weight.clone())
                    .arg("strides", [2, 2])
                    .arg("pad_type", "same")
                    .build1()?;
                let explicit = mb
                    .op("conv_transpose")
                    .arg("x", inputs[0])
                    .arg("weight", weight)
                    .arg("output_shape", [1, 3, 12, 16])
                    .arg("strides", [2, 2])
                    .build1()?;
                for var in [out, same, explicit] {
                    types.push(mb.ty(var).as_tensor().unwrap().shape.to_fixed());
                }
                Ok(vec![out, same, explicit])
            },
        )
        .unwrap();

        assert_eq!(types[0], Some(vec![1, 6, 11, 15]));
        assert_eq!(types[1], Some(vec![1, 3, 10, 14]));
        assert_eq!(types[2], Some(vec![1, 3, 12, 16]));
    }
}
