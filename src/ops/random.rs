use fastrand::Rng;
use fastrand_contrib::RngExt;
use mil_shape::Shape;
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    single_output, DefaultValue, EvalContext, InferContext, InputSpec, IntoOpResult, OpDef,
    OpError,
};
use crate::ops::generate::{shape_from_param, shape_sizes};
use crate::ops::op_inputs;
use crate::types::{DType, ValueType};
use crate::value::Value;

/// Create a generator from a `seed` parameter. Negative seeds mean
/// "unseeded".
fn make_rng(seed: i32) -> Rng {
    if seed >= 0 {
        Rng::with_seed(seed as u64)
    } else {
        Rng::new()
    }
}

fn seeded(ctx: &EvalContext) -> bool {
    ctx.i32("seed").is_ok_and(|seed| seed >= 0)
}

/// Sample 0 or 1 with probability `prob` of 1.
#[derive(Debug, Default)]
pub struct RandomBernoulli {}

impl OpDef for RandomBernoulli {
    fn name(&self) -> &'static str {
        "random_bernoulli"
    }

    op_inputs!(
        InputSpec::int("shape"),
        InputSpec::float("prob").constant().default(DefaultValue::F32(0.5)),
        InputSpec::int("seed").constant().default(DefaultValue::I32(-1)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let prob = ctx.f32("prob")?;
        if !(0. ..=1.).contains(&prob) {
            return Err(OpError::InvalidValue(format!(
                "prob should be in [0, 1] but got {}",
                prob
            )));
        }
        single_output(shape_from_param(ctx, "shape")?, DType::Fp32)
    }

    fn can_fold(&self, ctx: &EvalContext) -> bool {
        seeded(ctx) || ctx.f32("prob").is_ok_and(|p| p == 0. || p == 1.)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let shape = shape_sizes(&ctx.i32s("shape")?, "shape")?;
        let prob = ctx.f32("prob")?;
        let mut rng = make_rng(ctx.i32("seed")?);
        let len = shape.iter().product();
        let data: Vec<f32> = (0..len)
            .map(|_| if rng.f32() < prob { 1. } else { 0. })
            .collect();
        Tensor::from_data(shape.as_slice(), data).into_op_result()
    }
}

/// Sample indices from categorical distributions over the last dim of `x`.
///
/// `x` holds logits (`mode="logits"`) or probabilities (`mode="probs"`).
/// The last dim of the output holds `size` sampled indices.
#[derive(Debug, Default)]
pub struct RandomCategorical {}

impl OpDef for RandomCategorical {
    fn name(&self) -> &'static str {
        "random_categorical"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::string("mode").default(DefaultValue::Str("logits")),
        InputSpec::int("size").constant().default(DefaultValue::I32(1)),
        InputSpec::int("seed").constant().default(DefaultValue::I32(-1)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let mode = ctx.str("mode")?;
        if mode != "logits" && mode != "probs" {
            return Err(OpError::InvalidValue(format!(
                "mode should be \"logits\" or \"probs\" but got \"{}\"",
                mode
            )));
        }
        let size = ctx.i32("size")?;
        if size < 1 {
            return Err(OpError::InvalidValue(format!(
                "size should be positive but got {}",
                size
            )));
        }
        let shape = match x.shape.dims() {
            Some([]) => {
                return Err(OpError::InvalidShape(
                    "x should be at least rank 1".to_string(),
                ))
            }
            Some(dims) => {
                let mut dims = dims.to_vec();
                if let Some(last) = dims.last_mut() {
                    *last = mil_shape::Dim::Fixed(size as usize);
                }
                Shape::from_dims(dims)
            }
            None => Shape::unranked(),
        };
        single_output(shape, x.dtype)
    }

    fn can_fold(&self, ctx: &EvalContext) -> bool {
        seeded(ctx)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.float("x")?;
        if x.ndim() == 0 {
            return Err(OpError::InvalidShape(
                "x should be at least rank 1".to_string(),
            ));
        }
        let logits = ctx.str("mode")? == "logits";
        let size = ctx.i32("size")?.max(0) as usize;
        let mut rng = make_rng(ctx.i32("seed")?);

        let n_classes = x.size(x.ndim() - 1);
        let data = x.to_vec();
        let mut out = Vec::new();
        for row in data.chunks(n_classes.max(1)) {
            let weights: Vec<f32> = if logits {
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                row.iter().map(|&v| (v - max).exp()).collect()
            } else {
                row.to_vec()
            };
            let total: f32 = weights.iter().sum();
            for _ in 0..size {
                let mut target = rng.f32() * total;
                let mut choice = n_classes.saturating_sub(1);
                for (i, &w) in weights.iter().enumerate() {
                    if target < w {
                        choice = i;
                        break;
                    }
                    target -= w;
                }
                out.push(choice as f32);
            }
        }

        let mut shape = x.shape().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = size;
        }
        Tensor::from_data(shape.as_slice(), out).into_op_result()
    }
}

/// Sample from a normal distribution.
#[derive(Debug, Default)]
pub struct RandomNormal {}

impl OpDef for RandomNormal {
    fn name(&self) -> &'static str {
        "random_normal"
    }

    op_inputs!(
        InputSpec::int("shape"),
        InputSpec::float("mean").constant().default(DefaultValue::F32(0.)),
        InputSpec::float("stddev").constant().default(DefaultValue::F32(1.)),
        InputSpec::int("seed").constant().default(DefaultValue::I32(-1)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        single_output(shape_from_param(ctx, "shape")?, DType::Fp32)
    }

    fn can_fold(&self, ctx: &EvalContext) -> bool {
        seeded(ctx) || ctx.f32("stddev").is_ok_and(|s| s == 0.)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let shape = shape_sizes(&ctx.i32s("shape")?, "shape")?;
        let (mean, stddev) = (ctx.f32("mean")?, ctx.f32("stddev")?);
        let mut rng = make_rng(ctx.i32("seed")?);
        let len = shape.iter().product();
        let data: Vec<f32> = (0..len)
            .map(|_| {
                if stddev == 0. {
                    mean
                } else {
                    rng.f32_normal(mean, stddev)
                }
            })
            .collect();
        Tensor::from_data(shape.as_slice(), data).into_op_result()
    }
}

/// Sample from a uniform distribution over `[low, high)`.
#[derive(Debug, Default)]
pub struct RandomUniform {}

impl OpDef for RandomUniform {
    fn name(&self) -> &'static str {
        "random_uniform"
    }

    op_inputs!(
        InputSpec::int("shape"),
        InputSpec::float("low").constant().default(DefaultValue::F32(0.)),
        InputSpec::float("high").constant().default(DefaultValue::F32(1.)),
        InputSpec::int("seed").constant().default(DefaultValue::I32(-1)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        single_output(shape_from_param(ctx, "shape")?, DType::Fp32)
    }

    fn can_fold(&self, ctx: &EvalContext) -> bool {
        seeded(ctx)
            || matches!((ctx.f32("low"), ctx.f32("high")), (Ok(low), Ok(high)) if low == high)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let shape = shape_sizes(&ctx.i32s("shape")?, "shape")?;
        let (low, high) = (ctx.f32("low")?, ctx.f32("high")?);
        let mut rng = make_rng(ctx.i32("seed")?);
        let len = shape.iter().product();
        let data: Vec<f32> = (0..len).map(|_| low + rng.f32() * (high - low)).collect();
        Tensor::from_data(shape.as_slice(), data).into_op_result()
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
    fn test_seeded_ops_fold() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut values = Vec::new();
        mb.function("main", Vec::<(&str, ValueType)>::new(), |mb, _| {
            let a = mb
                .op("random_uniform")
                .arg("shape", [2, 3])
                .arg("low", -1f32)
                .arg("high", 1f32)
                .arg("seed", 42)
                .build1()?;
            let b = mb
                .op("random_uniform")
                .arg("shape", [2, 3])
                .arg("low", -1f32)
                .arg("high", 1f32)
                .arg("seed", 42)
                .build1()?;
            let unseeded = mb.op("random_normal").arg("shape", [4]).build1()?;
            values.push(mb.value(a).cloned());
            values.push(mb.value(b).cloned());
            values.push(mb.value(unseeded).cloned());
            Ok(vec![a, b, unseeded])
        })
        .unwrap();

        let a = values[0].clone().unwrap();
        assert_eq!(a.shape(), [2, 3]);
        assert!(a.to_f32_vec().unwrap().iter().all(|v| (-1. ..1.).contains(v)));
        assert_eq!(values[0], values[1]);
        assert_eq!(values[2], None);
    }

    #[test]
    fn test_degenerate_params_fold() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut values = Vec::new();
        mb.function("main", Vec::<(&str, ValueType)>::new(), |mb, _| {
            let ones = mb
                .op("random_bernoulli")
                .arg("shape", [3])
                .arg("prob", 1f32)
                .build1()?;
            let fives = mb
                .op("random_normal")
                .arg("shape", [2])
                .arg("mean", 5f32)
                .arg("stddev", 0f32)
                .build1()?;
            values.push(mb.value(ones).cloned());
            values.push(mb.value(fives).cloned());
            Ok(vec![ones, fives])
        })
        .unwrap();
        assert_eq!(values[0], Some(Value::from(vec![1f32, 1., 1.])));
        assert_eq!(values[1], Some(Value::from(vec![5f32, 5.])));
    }

    #[test]
    fn test_dynamic_shape_is_symbolic() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut ty = None;
        mb.function(
            "main",
            [("shape", tensor_type([3], DType::Int32))],
            |mb, inputs| {
                let out = mb.op("random_uniform").arg("shape", inputs[0]).build1()?;
                ty = Some(mb.ty(out).clone());
                Ok(vec![out])
            },
        )
        .unwrap();
        let ty = ty.unwrap();
        let shape = &ty.as_tensor().unwrap().shape;
        assert_eq!(shape.rank(), Some(3));
        assert!(shape.dims().unwrap().iter().all(|d| d.is_symbolic()));
    }

    #[test]
    fn test_categorical() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut value = None;
        mb.function("main", Vec::<(&str, ValueType)>::new(), |mb, _| {
            let probs = Tensor::from([[0f32, 1., 0.], [0., 0., 1.]]);
            let out = mb
                .op("random_categorical")
                .arg("x", probs)
                .arg("mode", "probs")
                .arg("size", 4)
                .arg("seed", 1)
                .build1()?;
            value = mb.value(out).cloned();
            Ok(vec![out])
        })
        .unwrap();
        let value = value.unwrap();
        assert_eq!(value.shape(), [2, 4]);
        assert_eq!(
            value.to_f32_vec().unwrap(),
            [1., 1., 1., 1., 2., 2., 2., 2.]
        );
    }
}
