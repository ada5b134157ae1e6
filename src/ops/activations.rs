use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    resolve_axis, DefaultValue, EvalContext, InferContext, InputSpec, IntoOpResult, OpDef,
    OpError,
};
use crate::ops::{check_min_rank, check_rank, map_lanes, op_inputs, same_type, unary_float_op};
use crate::types::{TensorType, ValueType};
use crate::value::Value;

unary_float_op!(Relu, "relu", |x| x.max(0.));
unary_float_op!(Relu6, "relu6", |x| x.clamp(0., 6.));
unary_float_op!(Sigmoid, "sigmoid", sigmoid);
unary_float_op!(Softsign, "softsign", |x| x / (1. + x.abs()));

unary_float_op!(
    /// Numerically stable `log(1 + exp(x))`.
    Softplus,
    "softplus",
    |x| (-x.abs()).exp().ln_1p() + x.max(0.)
);

pub(crate) fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

/// `min(max(x, 0), beta) + min(min(x, 0) * alpha, beta)`
#[derive(Debug, Default)]
pub struct ClampedRelu {}

impl OpDef for ClampedRelu {
    fn name(&self) -> &'static str {
        "clamped_relu"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("alpha").constant(),
        InputSpec::float("beta").constant(),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let alpha = ctx.f32("alpha")?;
        let beta = ctx.f32("beta")?;
        ctx.float("x")?
            .map(|&x| x.max(0.).min(beta) + (x.min(0.) * alpha).min(beta))
            .into_op_result()
    }
}

#[derive(Debug, Default)]
pub struct Elu {}

impl OpDef for Elu {
    fn name(&self) -> &'static str {
        "elu"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("alpha")
            .constant()
            .default(DefaultValue::F32(1.)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let alpha = ctx.f32("alpha")?;
        ctx.float("x")?
            .map(|&x| if x > 0. { x } else { alpha * x.exp_m1() })
            .into_op_result()
    }
}

/// Approximation used by `gelu`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum GeluMode {
    Exact,
    Tanh,
    Sigmoid,
}

impl GeluMode {
    pub fn parse(mode: &str) -> Result<GeluMode, OpError> {
        match mode {
            "EXACT" => Ok(GeluMode::Exact),
            "TANH_APPROXIMATION" => Ok(GeluMode::Tanh),
            "SIGMOID_APPROXIMATION" => Ok(GeluMode::Sigmoid),
            _ => Err(OpError::InvalidValue(format!(
                "mode should be one of EXACT, TANH_APPROXIMATION or SIGMOID_APPROXIMATION but got \"{}\"",
                mode
            ))),
        }
    }

    fn apply(self, x: f32) -> f32 {
        match self {
            GeluMode::Exact => 0.5 * x * (1. + libm::erff(x / std::f32::consts::SQRT_2)),
            GeluMode::Tanh => {
                let k = (2. / std::f32::consts::PI).sqrt();
                0.5 * x * (1. + (k * (x + 0.044715 * x.powi(3))).tanh())
            }
            GeluMode::Sigmoid => x * sigmoid(1.702 * x),
        }
    }
}

#[derive(Debug, Default)]
pub struct Gelu {}

impl OpDef for Gelu {
    fn name(&self) -> &'static str {
        "gelu"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::string("mode").default(DefaultValue::Str("EXACT")),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        GeluMode::parse(ctx.str("mode")?)?;
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let mode = GeluMode::parse(ctx.str("mode")?)?;
        ctx.float("x")?.map(|&x| mode.apply(x)).into_op_result()
    }
}

#[derive(Debug, Default)]
pub struct LeakyRelu {}

impl OpDef for LeakyRelu {
    fn name(&self) -> &'static str {
        "leaky_relu"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("alpha")
            .constant()
            .default(DefaultValue::F32(0.01)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let alpha = ctx.f32("alpha")?;
        ctx.float("x")?
            .map(|&x| if x >= 0. { x } else { alpha * x })
            .into_op_result()
    }
}

/// `alpha * x + beta`
#[derive(Debug, Default)]
pub struct LinearActivation {}

impl OpDef for LinearActivation {
    fn name(&self) -> &'static str {
        "linear_activation"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("alpha").constant(),
        InputSpec::float("beta")
            .constant()
            .default(DefaultValue::F32(0.)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let alpha = ctx.f32("alpha")?;
        let beta = ctx.f32("beta")?;
        ctx.float("x")?.map(|&x| alpha * x + beta).into_op_result()
    }
}

/// Check a per-channel parameter of an activation against the channel
/// dimension, which is dimension -3 of `x`.
fn check_channel_param(x: &TensorType, param: &TensorType, name: &str) -> Result<(), OpError> {
    check_rank(param, name, 1)?;
    let (Some(x_dims), Some(param_dims)) = (x.shape.dims(), param.shape.dims()) else {
        return Ok(());
    };
    let channels = x_dims[x_dims.len() - 3];
    match (param_dims[0].fixed(), channels.fixed()) {
        (Some(size), Some(c)) if size != c => Err(OpError::InvalidShape(format!(
            "{} size {} does not match dimension -3 ({}) of x",
            name, size, c
        ))),
        _ => Ok(()),
    }
}

/// Apply `f(value, channel)` to each element of `x`, where the channel is
/// the index along dimension -3.
fn map_channels(
    x: &Tensor<f32>,
    params: &[(&str, &Tensor<f32>)],
    f: impl Fn(f32, usize) -> f32,
) -> Result<Tensor<f32>, OpError> {
    let rank = x.ndim();
    if rank < 3 {
        return Err(OpError::InvalidShape("x should be at least rank 3".into()));
    }
    let channels = x.size(rank - 3);
    for (name, param) in params {
        if param.len() != channels {
            return Err(OpError::InvalidShape(format!(
                "{} size {} does not match dimension -3 ({}) of x",
                name,
                param.len(),
                channels
            )));
        }
    }
    let inner = x.size(rank - 2) * x.size(rank - 1);
    let data: Vec<f32> = x
        .iter()
        .enumerate()
        .map(|(i, &v)| f(v, (i / inner.max(1)) % channels))
        .collect();
    Ok(Tensor::from_data(x.shape(), data))
}

/// Leaky ReLU with a learned slope for each channel.
#[derive(Debug, Default)]
pub struct Prelu {}

impl OpDef for Prelu {
    fn name(&self) -> &'static str {
        "prelu"
    }

    op_inputs!(InputSpec::float("x"), InputSpec::float("alpha").constant());

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        check_min_rank(x, "x", 3)?;
        check_channel_param(x, ctx.tensor("alpha")?, "alpha")?;
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let alpha = ctx.float("alpha")?.to_vec();
        let alpha_tensor = Tensor::from(alpha.clone());
        map_channels(&ctx.float("x")?, &[("alpha", &alpha_tensor)], |x, c| {
            if x >= 0. {
                x
            } else {
                alpha[c] * x
            }
        })
        .into_op_result()
    }
}

/// `alpha * log(exp(beta * x) + 1)` with per-channel `alpha` and `beta`.
#[derive(Debug, Default)]
pub struct SoftplusParametric {}

impl OpDef for SoftplusParametric {
    fn name(&self) -> &'static str {
        "softplus_parametric"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("alpha").constant(),
        InputSpec::float("beta").constant(),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        check_min_rank(x, "x", 3)?;
        check_channel_param(x, ctx.tensor("alpha")?, "alpha")?;
        check_channel_param(x, ctx.tensor("beta")?, "beta")?;
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let alpha = ctx.float("alpha")?;
        let beta = ctx.float("beta")?;
        let (a, b) = (alpha.to_vec(), beta.to_vec());
        map_channels(
            &ctx.float("x")?,
            &[("alpha", &alpha), ("beta", &beta)],
            |x, c| a[c] * (b[c] * x).exp().ln_1p(),
        )
        .into_op_result()
    }
}

/// `alpha * tanh(beta * x)`
#[derive(Debug, Default)]
pub struct ScaledTanh {}

impl OpDef for ScaledTanh {
    fn name(&self) -> &'static str {
        "scaled_tanh"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("alpha")
            .constant()
            .default(DefaultValue::F32(1.)),
        InputSpec::float("beta")
            .constant()
            .default(DefaultValue::F32(1.)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let alpha = ctx.f32("alpha")?;
        let beta = ctx.f32("beta")?;
        ctx.float("x")?
            .map(|&x| alpha * (beta * x).tanh())
            .into_op_result()
    }
}

/// `min(max(alpha * x + beta, 0), 1)`
#[derive(Debug, Default)]
pub struct SigmoidHard {}

impl OpDef for SigmoidHard {
    fn name(&self) -> &'static str {
        "sigmoid_hard"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("alpha")
            .constant()
            .default(DefaultValue::F32(0.2)),
        InputSpec::float("beta")
            .constant()
            .default(DefaultValue::F32(0.5)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let alpha = ctx.f32("alpha")?;
        let beta = ctx.f32("beta")?;
        ctx.float("x")?
            .map(|&x| (alpha * x + beta).clamp(0., 1.))
            .into_op_result()
    }
}

#[derive(Debug, Default)]
pub struct Softmax {}

impl OpDef for Softmax {
    fn name(&self) -> &'static str {
        "softmax"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::int("axis")
            .constant()
            .default(DefaultValue::I32(-1)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        if let Some(rank) = ctx.tensor("x")?.rank() {
            resolve_axis(rank, ctx.i32("axis")?, "axis")?;
        }
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.float("x")?;
        let axis = resolve_axis(x.ndim(), ctx.i32("axis")?, "axis")?;
        let len = x.size(axis);
        map_lanes(&x, axis, len, |lane, out| {
            let max = lane.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let start = out.len();
            out.extend(lane.iter().map(|&v| (v - max).exp()));
            let sum: f32 = out[start..].iter().sum();
            for v in &mut out[start..] {
                *v /= sum;
            }
            Ok(())
        })
        .into_op_result()
    }
}

/// `x` if `x > alpha`, otherwise 0.
#[derive(Debug, Default)]
pub struct ThresholdedRelu {}

impl OpDef for ThresholdedRelu {
    fn name(&self) -> &'static str {
        "thresholded_relu"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("alpha")
            .constant()
            .default(DefaultValue::F32(1.)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let alpha = ctx.f32("alpha")?;
        ctx.float("x")?
            .map(|&x| if x > alpha { x } else { 0. })
            .into_op_result()
    }
}

#[cfg(test)]
mod tests {
    use mil_testing::{assert_close, TestCases};
    use rten_tensor::prelude::*;
    use rten_tensor::Tensor;

    use crate::builder::Builder;
    use crate::graph::Program;
    use crate::value::Value;

    /// Build and fold an activation applied to a constant.
    fn fold(op: &str, x: Tensor<f32>, params: &[(&str, Value)]) -> Result<Vec<f32>, String> {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut result = None;
        mb.function("main", Vec::<(&str, crate::types::TensorType)>::new(), |mb, _| {
            let mut op_builder = mb.op(op).arg("x", x);
            for (name, value) in params {
                op_builder = op_builder.arg(name, value.clone());
            }
            let y = op_builder.build1()?;
            result = mb.value(y).cloned();
            Ok(vec![y])
        })
        .map_err(|err| err.to_string())?;
        Ok(result.unwrap().to_f32_vec().unwrap())
    }

    #[test]
    fn test_activation_formulas() {
        #[derive(Debug)]
        struct Case {
            op: &'static str,
            params: Vec<(&'static str, Value)>,
            expected: Vec<f32>,
        }

        let x = Tensor::from([-2., -0.5, 0., 0.5, 2.]);
        let cases = [
            Case {
                op: "relu",
                params: vec![],
                expected: vec![0., 0., 0., 0.5, 2.],
            },
            Case {
                op: "relu6",
                params: vec![],
                expected: vec![0., 0., 0., 0.5, 2.],
            },
            Case {
                op: "leaky_relu",
                params: vec![("alpha", 0.1f32.into())],
                expected: vec![-0.2, -0.05, 0., 0.5, 2.],
            },
            Case {
                op: "clamped_relu",
                params: vec![("alpha", 2.0f32.into()), ("beta", 1.0f32.into())],
                expected: vec![-4., -1., 0., 0.5, 1.],
            },
            Case {
                op: "elu",
                params: vec![],
                expected: vec![(-2f32).exp_m1(), (-0.5f32).exp_m1(), 0., 0.5, 2.],
            },
            Case {
                op: "linear_activation",
                params: vec![("alpha", 2.0f32.into()), ("beta", 1.0f32.into())],
                expected: vec![-3., 0., 1., 2., 5.],
            },
            Case {
                op: "sigmoid_hard",
                params: vec![],
                expected: vec![0.1, 0.4, 0.5, 0.6, 0.9],
            },
            Case {
                op: "softsign",
                params: vec![],
                expected: vec![-2. / 3., -1. / 3., 0., 1. / 3., 2. / 3.],
            },
            Case {
                op: "thresholded_relu",
                params: vec![("alpha", 0.4f32.into())],
                expected: vec![0., 0., 0., 0.5, 2.],
            },
            Case {
                op: "scaled_tanh",
                params: vec![("alpha", 2.0f32.into()), ("beta", 0.5f32.into())],
                expected: vec![
                    2. * (-1f32).tanh(),
                    2. * (-0.25f32).tanh(),
                    0.,
                    2. * 0.25f32.tanh(),
                    2. * 1f32.tanh(),
                ],
            },
            Case {
                op: "softplus",
                params: vec![],
                expected: [-2f32, -0.5, 0., 0.5, 2.]
                    .iter()
                    .map(|x| x.exp().ln_1p())
                    .collect(),
            },
        ];

        cases.test_each(|case| {
            let result = fold(case.op, x.clone(), &case.params).unwrap();
            assert_close(&result, &case.expected, 1e-5, 1e-5);
        });
    }

    #[test]
    fn test_gelu_modes() {
        let x = Tensor::from([-1., 0., 1.]);
        let exact = fold("gelu", x.clone(), &[]).unwrap();
        assert_close(&exact, &[-0.158655, 0., 0.841345], 1e-4, 1e-4);

        for mode in ["TANH_APPROXIMATION", "SIGMOID_APPROXIMATION"] {
            let approx = fold("gelu", x.clone(), &[("mode", mode.into())]).unwrap();
            assert_close(&approx, &exact, 2e-2, 0.);
        }

        let err = fold("gelu", x, &[("mode", "FAST".into())]).err().unwrap();
        assert!(err.contains("mode should be one of"), "{}", err);
    }

    #[test]
    fn test_softmax() {
        let x = Tensor::from([[1., 2., 3.], [1., 1., 1.]]);
        let result = fold("softmax", x.clone(), &[]).unwrap();
        let e = [1f32.exp(), 2f32.exp(), 3f32.exp()];
        let sum: f32 = e.iter().sum();
        assert_close(
            &result,
            &[e[0] / sum, e[1] / sum, e[2] / sum, 1. / 3., 1. / 3., 1. / 3.],
            1e-5,
            1e-5,
        );

        let columns = fold("softmax", x, &[("axis", 0.into())]).unwrap();
        let expected = [
            0.5,
            2f32.exp() / (2f32.exp() + 1f32.exp()),
            3f32.exp() / (3f32.exp() + 1f32.exp()),
        ];
        assert_close(&columns[..3], &expected, 1e-5, 1e-5);
    }

    #[test]
    fn test_prelu() {
        let x = Tensor::from_data(&[2, 1, 2], vec![-1., 1., -2., 2.]);
        let result = fold("prelu", x, &[("alpha", vec![0.5f32, 0.25].into())]).unwrap();
        assert_eq!(result, &[-0.5, 1., -0.5, 2.]);

        let x = Tensor::from_data(&[2, 1, 1], vec![-1., 1.]);
        let err = fold("prelu", x, &[("alpha", vec![0.5f32, 0.25, 1.].into())])
            .err()
            .unwrap();
        assert!(err.contains("alpha size 3 does not match dimension -3 (2) of x"));
    }

    #[test]
    fn test_softplus_parametric() {
        let x = Tensor::from_data(&[1, 1, 2], vec![0., 1.]);
        let result = fold(
            "softplus_parametric",
            x.clone(),
            &[("alpha", vec![2f32].into()), ("beta", vec![1f32].into())],
        )
        .unwrap();
        assert_close(&result, &[2. * 2f32.ln(), 2. * 1f32.exp().ln_1p()], 1e-5, 1e-5);

        let err = fold(
            "softplus_parametric",
            x.clone(),
            &[("alpha", Tensor::from([[1f32]]).into()), ("beta", vec![1f32].into())],
        )
        .err()
        .unwrap();
        assert!(err.contains("alpha should be rank 1"));

        let x = Tensor::from([[1., 2.]]);
        let err = fold(
            "softplus_parametric",
            x,
            &[("alpha", vec![1f32].into()), ("beta", vec![1f32].into())],
        )
        .err()
        .unwrap();
        assert!(err.contains("x should be at least rank 3"));
    }
}
