use mil_shape::{Dim, Shape};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    resolve_axis, single_output, DefaultValue, EvalContext, InferContext, InputSpec,
    IntoOpResult, OpDef, OpError, TypeDomain,
};
use crate::ops::{dim_or_symbol, op_inputs, unravel};
use crate::types::{Carrier, ValueType};
use crate::value::{map_tensor, Value};

/// Output shape of an op whose shape is given by an int vector parameter.
///
/// A known value gives a fixed shape, a vector of known length gives a
/// symbol per dim and anything else an unranked shape.
pub(crate) fn shape_from_param(ctx: &InferContext, name: &str) -> Result<Shape, OpError> {
    if let Some(value) = ctx.value(name) {
        let sizes = value.to_i32_vec()?;
        if let Some(size) = sizes.iter().find(|&&size| size < 0) {
            return Err(OpError::InvalidValue(format!(
                "{} should be non-negative but contains {}",
                name, size
            )));
        }
        return Ok(Shape::from_dims(
            sizes.into_iter().map(|size| Dim::Fixed(size as usize)),
        ));
    }
    let ty = ctx.tensor(name)?;
    match ty.shape.dims() {
        Some([Dim::Fixed(len)]) => Ok(Shape::symbolic(*len)),
        Some(dims) if dims.len() != 1 => Err(OpError::InvalidShape(format!(
            "{} should be a vector",
            name
        ))),
        _ => Ok(Shape::unranked()),
    }
}

/// Convert a shape parameter into sizes.
pub(crate) fn shape_sizes(sizes: &[i32], name: &str) -> Result<Vec<usize>, OpError> {
    sizes
        .iter()
        .map(|&size| {
            usize::try_from(size).map_err(|_| {
                OpError::InvalidValue(format!(
                    "{} should be non-negative but contains {}",
                    name, size
                ))
            })
        })
        .collect()
}

/// Create a tensor of the given shape filled with a scalar.
#[derive(Debug, Default)]
pub struct Fill {}

impl OpDef for Fill {
    fn name(&self) -> &'static str {
        "fill"
    }

    op_inputs!(
        InputSpec::int("shape"),
        InputSpec::new("value")
            .domain(TypeDomain::Numeric)
            .constant()
            .default(DefaultValue::F32(0.)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let value = ctx.tensor("value")?;
        if value.rank() != Some(0) {
            return Err(OpError::InvalidShape("value should be a scalar".into()));
        }
        single_output(shape_from_param(ctx, "shape")?, value.dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let shape = shape_sizes(&ctx.i32s("shape")?, "shape")?;
        let value = ctx.value("value")?;
        map_tensor!(value, t => {
            let fill = t.item().cloned().ok_or_else(|| {
                OpError::InvalidShape("value should be a scalar".into())
            })?;
            Tensor::full(shape.as_slice(), fill)
        })
        .into_op_result()
    }
}

/// Insert a one-hot vector dim of `one_hot_vector_size` at `axis`.
///
/// Indices outside `[0, one_hot_vector_size)` produce a vector of
/// `off_value`.
#[derive(Debug, Default)]
pub struct OneHot {}

impl OpDef for OneHot {
    fn name(&self) -> &'static str {
        "one_hot"
    }

    op_inputs!(
        InputSpec::int("indices"),
        InputSpec::int("one_hot_vector_size"),
        InputSpec::int("axis").constant().default(DefaultValue::I32(-1)),
        InputSpec::new("on_value")
            .domain(TypeDomain::Numeric)
            .constant()
            .default(DefaultValue::I32(1)),
        InputSpec::new("off_value")
            .domain(TypeDomain::Numeric)
            .constant()
            .default(DefaultValue::I32(0)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let on_type = ctx.tensor("on_value")?.dtype;
        let off_type = ctx.tensor("off_value")?.dtype;
        if on_type != off_type {
            return Err(OpError::InvalidType(
                "Parameters on_value and off_value must have same input types".into(),
            ));
        }

        let indices = ctx.tensor("indices")?;
        let Some(dims) = indices.shape.dims() else {
            return single_output(Shape::unranked(), on_type);
        };
        let axis = resolve_axis(dims.len() + 1, ctx.i32("axis")?, "axis")?;
        let depth = match ctx.value("one_hot_vector_size") {
            Some(size) => {
                let size = size.scalar_i32()?;
                if size < 0 {
                    return Err(OpError::InvalidValue(
                        "Parameter one_hot_vector_size must be non-negative".into(),
                    ));
                }
                Some(size as usize)
            }
            None => None,
        };
        let mut out_dims = dims.to_vec();
        out_dims.insert(axis, dim_or_symbol(depth));
        single_output(Shape::from_dims(out_dims), on_type)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let indices = ctx.int("indices")?;
        let size = ctx.i32("one_hot_vector_size")?;
        if size < 0 {
            return Err(OpError::InvalidValue(
                "Parameter one_hot_vector_size must be non-negative".into(),
            ));
        }
        let size = size as usize;
        let axis = resolve_axis(indices.ndim() + 1, ctx.i32("axis")?, "axis")?;

        let mut out_shape = indices.shape().to_vec();
        out_shape.insert(axis, size);
        let data = indices.to_vec();
        let in_shape = indices.shape();
        let hot: Tensor<bool> = Tensor::from_data(
            out_shape.as_slice(),
            (0..out_shape.iter().product())
                .map(|i| {
                    let index = unravel(i, &out_shape);
                    let mut offset = 0;
                    for (d, &idx) in index.iter().enumerate().filter(|(d, _)| *d != axis) {
                        let src_dim = if d > axis { d - 1 } else { d };
                        offset = offset * in_shape[src_dim] + idx;
                    }
                    data[offset] == index[axis] as i32
                })
                .collect::<Vec<_>>(),
        );

        let on = ctx.value("on_value")?;
        let off = ctx.value("off_value")?;
        let out: Value = if on.carrier() == Carrier::I32 {
            let (on, off) = (on.scalar_i32()?, off.scalar_i32()?);
            hot.map(|&h| if h { on } else { off }).into()
        } else {
            let (on, off) = (on.scalar_f32()?, off.scalar_f32()?);
            hot.map(|&h| if h { on } else { off }).into()
        };
        out.into_op_result()
    }
}

fn check_step<T: Default + PartialEq>(step: T) -> Result<(), OpError> {
    if step == T::default() {
        return Err(OpError::InvalidValue("step must be non-zero".into()));
    }
    Ok(())
}

/// Length of an integer range. Computed in `i64` so that ranges near the
/// limits of `i32` neither overflow nor lose precision.
fn range_len_i32(start: i32, end: i32, step: i32) -> Result<usize, OpError> {
    check_step(step)?;
    let (span, step) = (end as i64 - start as i64, step as i64);
    let len = if (span > 0) == (step > 0) && span != 0 {
        (span + step - step.signum()) / step
    } else {
        0
    };
    Ok(len as usize)
}

fn range_len_f32(start: f32, end: f32, step: f32) -> Result<usize, OpError> {
    check_step(step)?;
    let len = ((end as f64 - start as f64) / step as f64).ceil().max(0.);
    Ok(len as usize)
}

fn range_i32(start: i32, end: i32, step: i32) -> Result<Tensor<i32>, OpError> {
    let len = range_len_i32(start, end, step)?;
    let output = (0..len as i64)
        .map(|i| (start as i64 + i * step as i64) as i32)
        .collect();
    Ok(Tensor::from_vec(output))
}

fn range_f32(start: f32, end: f32, step: f32) -> Result<Tensor<f32>, OpError> {
    check_step(step)?;
    let mut output = Vec::new();
    let mut val = start;
    while (step > 0. && val < end) || (step < 0. && val > end) {
        output.push(val);
        val += step;
    }
    Ok(Tensor::from_vec(output))
}

/// Numbers from `start` up to, but excluding, `end` in increments of `step`.
#[derive(Debug, Default)]
pub struct Range1d {}

impl OpDef for Range1d {
    fn name(&self) -> &'static str {
        "range_1d"
    }

    op_inputs!(
        InputSpec::new("end").domain(TypeDomain::Numeric),
        InputSpec::new("start").domain(TypeDomain::Numeric),
        InputSpec::new("step").domain(TypeDomain::Numeric),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let dtype = ctx.tensor("start")?.dtype;
        if ctx.tensor("end")?.dtype != dtype || ctx.tensor("step")?.dtype != dtype {
            return Err(OpError::InvalidType(
                "All inputs to the range operation must have same input types".into(),
            ));
        }
        let len = match (ctx.value("start"), ctx.value("end"), ctx.value("step")) {
            (Some(start), Some(end), Some(step)) if start.carrier() == Carrier::I32 => Some(
                range_len_i32(start.scalar_i32()?, end.scalar_i32()?, step.scalar_i32()?)?,
            ),
            (Some(start), Some(end), Some(step)) => Some(range_len_f32(
                start.scalar_f32()?,
                end.scalar_f32()?,
                step.scalar_f32()?,
            )?),
            _ => None,
        };
        single_output(Shape::from_dims([dim_or_symbol(len)]), dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let start = ctx.value("start")?;
        if start.carrier() == Carrier::I32 {
            range_i32(ctx.i32("start")?, ctx.i32("end")?, ctx.i32("step")?).into_op_result()
        } else {
            range_f32(ctx.f32("start")?, ctx.f32("end")?, ctx.f32("step")?).into_op_result()
        }
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::Tensor;

    use crate::builder::{Arg, Builder};
    use crate::graph::{BuildError, Program};
    use crate::operator::ErrorKind;
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

    fn infer(op: &str, input: ValueType, param: &str, args: Vec<(&str, Arg)>) -> ValueType {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut ty = None;
        mb.function("main", [("input", input)], |mb, inputs| {
            let mut builder = mb.op(op).arg(param, inputs[0]);
            for (name, arg) in args {
                builder = builder.arg(name, arg);
            }
            let out = builder.build1()?;
            ty = Some(mb.ty(out).clone());
            Ok(vec![out])
        })
        .unwrap();
        ty.unwrap()
    }

    #[test]
    fn test_fill() {
        let out = fold("fill", vec![("shape", [2, 3].into()), ("value", 1.5.into())]).unwrap();
        assert_eq!(out.shape(), [2, 3]);
        assert_eq!(out.to_f32_vec().unwrap(), [1.5; 6]);

        let out = fold("fill", vec![("shape", [2].into()), ("value", 7.into())]).unwrap();
        assert_eq!(out.dtype(), DType::Int32);

        // Dynamic shape of known length.
        let ty = infer("fill", tensor_type([3], DType::Int32).into(), "shape", vec![]);
        let shape = &ty.as_tensor().unwrap().shape;
        assert_eq!(shape.rank(), Some(3));
        assert!(shape.is_symbolic());

        // Dynamic shape of unknown length.
        let ty = infer(
            "fill",
            tensor_type(vec![mil_shape::Dim::new_symbol()], DType::Int32).into(),
            "shape",
            vec![],
        );
        assert_eq!(ty.as_tensor().unwrap().rank(), None);
    }

    #[test]
    fn test_one_hot() {
        let out = fold(
            "one_hot",
            vec![
                ("indices", Tensor::from([0, 2, 5]).into()),
                ("one_hot_vector_size", 3.into()),
            ],
        )
        .unwrap();
        assert_eq!(out.shape(), [3, 3]);
        assert_eq!(out.to_i32_vec().unwrap(), [1, 0, 0, 0, 0, 1, 0, 0, 0]);

        let out = fold(
            "one_hot",
            vec![
                ("indices", Tensor::from([1, 0]).into()),
                ("one_hot_vector_size", 2.into()),
                ("axis", 0.into()),
                ("on_value", 5.0.into()),
                ("off_value", (-1.0).into()),
            ],
        )
        .unwrap();
        assert_eq!(out.dtype(), DType::Fp32);
        // [size, n]
        assert_eq!(out.to_f32_vec().unwrap(), [-1., 5., 5., -1.]);
    }

    #[test]
    fn test_one_hot_errors() {
        let err = fold(
            "one_hot",
            vec![
                ("indices", Tensor::from([0]).into()),
                ("one_hot_vector_size", 2.into()),
                ("on_value", 1.0.into()),
                ("off_value", 0.into()),
            ],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeError);

        let err = fold(
            "one_hot",
            vec![
                ("indices", Tensor::from([0]).into()),
                ("one_hot_vector_size", (-1).into()),
            ],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueError);

        let err = fold(
            "one_hot",
            vec![
                ("indices", Tensor::from([0]).into()),
                ("one_hot_vector_size", 2.into()),
                ("axis", 2.into()),
            ],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueError);
    }

    #[test]
    fn test_range_1d() {
        let out = fold(
            "range_1d",
            vec![("end", 10.into()), ("start", 1.into()), ("step", 3.into())],
        )
        .unwrap();
        assert_eq!(out.to_i32_vec().unwrap(), [1, 4, 7]);

        let out = fold(
            "range_1d",
            vec![("end", 0.0.into()), ("start", 1.0.into()), ("step", (-0.5).into())],
        )
        .unwrap();
        assert_eq!(out.to_f32_vec().unwrap(), [1.0, 0.5]);

        let err = fold(
            "range_1d",
            vec![("end", 10.0.into()), ("start", 1.into()), ("step", 3.into())],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeError);

        let ty = infer(
            "range_1d",
            tensor_type([], DType::Int32).into(),
            "end",
            vec![("start", 0.into()), ("step", 1.into())],
        );
        let shape = &ty.as_tensor().unwrap().shape;
        assert_eq!(shape.rank(), Some(1));
        assert!(shape.is_symbolic());
    }

    #[test]
    fn test_range_1d_near_int_limits() {
        let out = fold(
            "range_1d",
            vec![
                ("end", i32::MAX.into()),
                ("start", (i32::MAX - 7).into()),
                ("step", 5.into()),
            ],
        )
        .unwrap();
        assert_eq!(out.to_i32_vec().unwrap(), [i32::MAX - 7, i32::MAX - 2]);

        let out = fold(
            "range_1d",
            vec![
                ("end", i32::MIN.into()),
                ("start", (i32::MIN + 3).into()),
                ("step", (-2).into()),
            ],
        )
        .unwrap();
        assert_eq!(out.to_i32_vec().unwrap(), [i32::MIN + 3, i32::MIN + 1]);

        // Lengths beyond the precision of f32 are exact.
        assert_eq!(super::range_len_i32(0, (1 << 24) + 1, 1).unwrap(), (1 << 24) + 1);
        assert_eq!(super::range_len_i32(i32::MIN, i32::MAX, i32::MAX).unwrap(), 3);
        assert_eq!(super::range_len_i32(5, 5, 1).unwrap(), 0);
        assert_eq!(super::range_len_i32(0, 10, -1).unwrap(), 0);
    }
}
