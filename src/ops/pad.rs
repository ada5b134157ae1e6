use mil_shape::{Dim, Shape};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    single_output, DefaultValue, EvalContext, InferContext, InputSpec, IntoOpResult, OpDef,
    OpError,
};
use crate::ops::{check_rank, op_inputs, strides, unravel};
use crate::types::ValueType;
use crate::value::Value;

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum PadMode {
    Constant,
    Reflect,
    Replicate,
}

impl PadMode {
    pub(crate) fn parse(mode: &str) -> Result<PadMode, OpError> {
        match mode {
            "constant" => Ok(PadMode::Constant),
            "reflect" => Ok(PadMode::Reflect),
            "replicate" => Ok(PadMode::Replicate),
            _ => Err(OpError::InvalidValue(format!(
                "unsupported pad mode \"{}\"",
                mode
            ))),
        }
    }
}

/// Expand a flat `pad` vector into `[before, after]` pairs for every dim of
/// a tensor of rank `rank`. Pads apply to the trailing dims.
pub(crate) fn pad_pairs(pad: &[i32], rank: usize) -> Result<Vec<[usize; 2]>, OpError> {
    if pad.len() % 2 != 0 || pad.len() > 2 * rank {
        return Err(OpError::InvalidShape(format!(
            "pad should have an even length of at most {} but has length {}",
            2 * rank,
            pad.len()
        )));
    }
    if let Some(p) = pad.iter().find(|&&p| p < 0) {
        return Err(OpError::InvalidValue(format!(
            "pad amounts should be >= 0 but got {}",
            p
        )));
    }
    let mut pairs = vec![[0, 0]; rank - pad.len() / 2];
    pairs.extend(pad.chunks(2).map(|pair| [pair[0] as usize, pair[1] as usize]));
    Ok(pairs)
}

fn check_reflect(pairs: &[[usize; 2]], dims: impl Iterator<Item = Option<usize>>) -> Result<(), OpError> {
    for (d, (pair, size)) in pairs.iter().zip(dims).enumerate() {
        let Some(size) = size else {
            continue;
        };
        if pair[0] >= size || pair[1] >= size {
            return Err(OpError::InvalidValue(format!(
                "reflect pad {:?} for axis {} should be smaller than the dim size {}",
                pair, d, size
            )));
        }
    }
    Ok(())
}

/// Map a padded coordinate back into `0..size`, or `None` if it reads the
/// constant fill.
fn source_index(i: usize, before: usize, size: usize, mode: PadMode) -> Option<usize> {
    let p = i as isize - before as isize;
    let n = size as isize;
    if (0..n).contains(&p) {
        return Some(p as usize);
    }
    match mode {
        PadMode::Constant => None,
        PadMode::Replicate => Some(p.clamp(0, n - 1) as usize),
        PadMode::Reflect if p < 0 => Some((-p) as usize),
        PadMode::Reflect => Some((2 * (n - 1) - p) as usize),
    }
}

fn pad<T: Clone>(x: &Tensor<T>, pairs: &[[usize; 2]], mode: PadMode, fill: T) -> Tensor<T> {
    let in_shape = x.shape();
    let out_shape: Vec<usize> = in_shape
        .iter()
        .zip(pairs)
        .map(|(size, [before, after])| size + before + after)
        .collect();
    let in_strides = strides(in_shape);
    let data = x.to_vec();
    let len: usize = out_shape.iter().product();

    let out: Vec<T> = (0..len)
        .map(|i| {
            let index = unravel(i, &out_shape);
            let mut offset = 0;
            for (d, &idx) in index.iter().enumerate() {
                match source_index(idx, pairs[d][0], in_shape[d], mode) {
                    Some(src) => offset += src * in_strides[d],
                    None => return fill.clone(),
                }
            }
            data[offset].clone()
        })
        .collect();
    Tensor::from_data(out_shape.as_slice(), out)
}

/// Pad the trailing dims of a tensor.
///
/// `pad` holds `[before, after]` amounts for the last `len(pad) / 2` dims.
/// In `reflect` mode values are mirrored without repeating the edge element
/// and in `replicate` mode the edge element is repeated.
#[derive(Debug, Default)]
pub struct Pad {}

impl OpDef for Pad {
    fn name(&self) -> &'static str {
        "pad"
    }

    op_inputs!(
        InputSpec::new("x"),
        InputSpec::int("pad"),
        InputSpec::string("mode").default(DefaultValue::Str("constant")),
        InputSpec::float("constant_val")
            .constant()
            .default(DefaultValue::F32(0.)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let pad_ty = ctx.tensor("pad")?;
        check_rank(pad_ty, "pad", 1).map_err(|_| {
            OpError::InvalidShape("pad should be a 1D tensor".into())
        })?;
        let mode = PadMode::parse(ctx.str("mode")?)?;

        let Some(dims) = x.shape.dims() else {
            return single_output(Shape::unranked(), x.dtype);
        };
        let Some(pad) = ctx.value("pad") else {
            // The padded dims are unknown, but their count may not be.
            let out_dims = match pad_ty.shape.dim(0).and_then(|d| d.fixed()) {
                Some(len) if len % 2 == 0 && len <= 2 * dims.len() => {
                    let n_padded = len / 2;
                    let mut out_dims = dims.to_vec();
                    for dim in &mut out_dims[dims.len() - n_padded..] {
                        *dim = Dim::new_symbol();
                    }
                    out_dims
                }
                Some(len) => {
                    return Err(OpError::InvalidShape(format!(
                        "pad should have an even length of at most {} but has length {}",
                        2 * dims.len(),
                        len
                    )))
                }
                None => dims.iter().map(|_| Dim::new_symbol()).collect(),
            };
            return single_output(Shape::from_dims(out_dims), x.dtype);
        };

        let pairs = pad_pairs(&pad.to_i32_vec()?, dims.len())?;
        if mode == PadMode::Reflect {
            check_reflect(&pairs, dims.iter().map(|d| d.fixed()))?;
        }
        let out_dims = dims.iter().zip(&pairs).map(|(dim, [before, after])| match dim {
            Dim::Fixed(size) => Dim::Fixed(size + before + after),
            Dim::Symbol(_) if before + after == 0 => *dim,
            Dim::Symbol(_) => Dim::new_symbol(),
        });
        single_output(Shape::from_dims(out_dims), x.dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let mode = PadMode::parse(ctx.str("mode")?)?;
        let shape = x.shape();
        let pairs = pad_pairs(&ctx.i32s("pad")?, shape.len())?;
        if mode == PadMode::Reflect {
            check_reflect(&pairs, shape.iter().map(|&size| Some(size)))?;
        }
        if mode == PadMode::Replicate && shape.contains(&0) {
            return Err(OpError::InvalidShape(
                "cannot replicate-pad an empty tensor".into(),
            ));
        }

        let fill = ctx.f32("constant_val")?;
        match x {
            Value::Float(t) => pad(t, &pairs, mode, fill).into_op_result(),
            Value::Int(t) => pad(t, &pairs, mode, fill as i32).into_op_result(),
            Value::Bool(t) => pad(t, &pairs, mode, fill != 0.).into_op_result(),
            other => Err(OpError::InvalidType(format!(
                "expected a tensor but got a {}",
                other.kind_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::prelude::*;
    use rten_tensor::Tensor;

    use super::{pad, pad_pairs, PadMode};

    #[test]
    fn test_reflect_pad() {
        let x = Tensor::from([[1, 2, 3], [4, 5, 6]]);
        let pairs = pad_pairs(&[1, 1, 2, 2], 2).unwrap();
        let out = pad(&x, &pairs, PadMode::Reflect, 0);
        assert_eq!(out.shape(), &[4, 7]);
        assert_eq!(
            out.to_vec(),
            [
                6, 5, 4, 5, 6, 5, 4, //
                3, 2, 1, 2, 3, 2, 1, //
                6, 5, 4, 5, 6, 5, 4, //
                3, 2, 1, 2, 3, 2, 1,
            ]
        );
    }

    #[test]
    fn test_constant_and_replicate_pad() {
        let x = Tensor::from([[1., 2.], [3., 4.]]);
        let pairs = pad_pairs(&[1, 0], 2).unwrap();
        assert_eq!(pairs, [[0, 0], [1, 0]]);

        let out = pad(&x, &pairs, PadMode::Constant, 9.);
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(out.to_vec(), [9., 1., 2., 9., 3., 4.]);

        let pairs = pad_pairs(&[0, 1, 0, 2], 2).unwrap();
        let out = pad(&x, &pairs, PadMode::Replicate, 0.);
        assert_eq!(out.shape(), &[3, 4]);
        assert_eq!(
            out.to_vec(),
            [1., 2., 2., 2., 3., 4., 4., 4., 3., 4., 4., 4.]
        );
    }

    #[test]
    fn test_invalid_pad() {
        assert!(pad_pairs(&[1, 1, 1], 2).is_err());
        assert!(pad_pairs(&[1, 1, 1, 1, 1, 1], 2).is_err());
        assert!(pad_pairs(&[-1, 1], 2).is_err());
        assert!(super::check_reflect(&[[0, 0], [3, 0]], [Some(2), Some(3)].into_iter()).is_err());
    }
}
