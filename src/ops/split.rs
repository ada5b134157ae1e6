use mil_shape::Shape;
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{resolve_axis, EvalContext, InferContext, InputSpec, OpDef, OpError};
use crate::ops::{dim_or_symbol, op_inputs};
use crate::types::{TensorType, ValueType};
use crate::value::Value;

/// Size of each output along the split axis.
#[derive(Clone, Debug, PartialEq)]
enum SplitSizes {
    /// `n` equal parts of a dim whose size may be unknown.
    Even(usize),
    Explicit(Vec<usize>),
}

impl SplitSizes {
    fn from_params(
        num_splits: Option<i32>,
        split_sizes: Option<Vec<i32>>,
    ) -> Result<SplitSizes, OpError> {
        match (num_splits, split_sizes) {
            (None, None) => Err(OpError::MissingInput(
                "At least one of num_splits and split_sizes must be specified".into(),
            )),
            (Some(n), None) if n < 1 => Err(OpError::InvalidValue(format!(
                "num_splits should be positive but got {}",
                n
            ))),
            (Some(n), None) => Ok(SplitSizes::Even(n as usize)),
            (num_splits, Some(sizes)) => {
                if sizes.iter().any(|&size| size < 0) {
                    return Err(OpError::InvalidValue(format!(
                        "split_sizes must be >= 0 but got {:?}",
                        sizes
                    )));
                }
                if let Some(n) = num_splits {
                    if n as usize != sizes.len() {
                        return Err(OpError::InvalidValue(format!(
                            "num_splits {} does not match the length of split_sizes {:?}",
                            n, sizes
                        )));
                    }
                }
                Ok(SplitSizes::Explicit(
                    sizes.into_iter().map(|size| size as usize).collect(),
                ))
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            SplitSizes::Even(n) => *n,
            SplitSizes::Explicit(sizes) => sizes.len(),
        }
    }

    /// Resolve the output sizes for a split dim of size `dim_size`, or
    /// return `None` entries where a size is unknown.
    fn resolve(&self, dim_size: Option<usize>) -> Result<Vec<Option<usize>>, OpError> {
        match (self, dim_size) {
            (SplitSizes::Even(n), Some(size)) if size % n != 0 => Err(OpError::InvalidValue(
                format!("num_split {} does not divide split dim (length = {})", n, size),
            )),
            (SplitSizes::Even(n), size) => Ok(vec![size.map(|size| size / n); *n]),
            (SplitSizes::Explicit(sizes), Some(size)) if sizes.iter().sum::<usize>() != size => {
                Err(OpError::InvalidValue(format!(
                    "split_sizes {:?} do not sum to the size of split dim (length = {})",
                    sizes, size
                )))
            }
            (SplitSizes::Explicit(sizes), _) => Ok(sizes.iter().copied().map(Some).collect()),
        }
    }
}

fn split<T: Clone>(x: &Tensor<T>, axis: usize, sizes: &[usize]) -> Vec<Tensor<T>> {
    let mut start = 0;
    sizes
        .iter()
        .map(|&size| {
            let part = x.slice_axis(axis, start..start + size).to_tensor();
            start += size;
            part
        })
        .collect()
}

/// Split a tensor into parts along an axis.
///
/// Either `num_splits` equal parts or parts with explicit `split_sizes`.
#[derive(Debug, Default)]
pub struct Split {}

impl OpDef for Split {
    fn name(&self) -> &'static str {
        "split"
    }

    op_inputs!(
        InputSpec::new("x"),
        InputSpec::int("num_splits").constant().optional(),
        InputSpec::int("split_sizes").constant().optional(),
        InputSpec::int("axis").constant(),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let num_splits = ctx.value("num_splits").map(|v| v.scalar_i32()).transpose()?;
        let sizes = SplitSizes::from_params(num_splits, ctx.opt_i32s("split_sizes")?)?;

        let Some(dims) = x.shape.dims() else {
            let ty = ValueType::Tensor(TensorType::new(Shape::unranked(), x.dtype));
            return Ok(vec![ty; sizes.len()]);
        };
        let axis = resolve_axis(dims.len(), ctx.i32("axis")?, "axis")?;
        let out_sizes = sizes.resolve(dims[axis].fixed())?;

        Ok(out_sizes
            .into_iter()
            .map(|size| {
                let mut out_dims = dims.to_vec();
                out_dims[axis] = dim_or_symbol(size);
                ValueType::Tensor(TensorType::new(Shape::from_dims(out_dims), x.dtype))
            })
            .collect())
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let num_splits = ctx.opt("num_splits").map(|v| v.scalar_i32()).transpose()?;
        let sizes = SplitSizes::from_params(num_splits, ctx.opt_i32s("split_sizes")?)?;
        let axis = resolve_axis(x.ndim(), ctx.i32("axis")?, "axis")?;

        let out_sizes: Vec<usize> = sizes
            .resolve(Some(x.shape()[axis]))?
            .into_iter()
            .map(|size| size.unwrap_or(0))
            .collect();

        let parts: Vec<Value> = match x {
            Value::Float(t) => split(t, axis, &out_sizes).into_iter().map(Value::from).collect(),
            Value::Int(t) => split(t, axis, &out_sizes).into_iter().map(Value::from).collect(),
            Value::Bool(t) => split(t, axis, &out_sizes).into_iter().map(Value::from).collect(),
            other => {
                return Err(OpError::InvalidType(format!(
                    "expected a tensor but got a {}",
                    other.kind_name()
                )))
            }
        };
        Ok(parts)
    }
}
