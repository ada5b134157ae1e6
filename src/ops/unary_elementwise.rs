use rten_tensor::prelude::*;

use crate::operator::{
    DefaultValue, EvalContext, InferContext, InputSpec, IntoOpResult, OpDef, OpError, TypeDomain,
};
use crate::ops::{op_inputs, same_shape, same_type, unary_float_op};
use crate::types::{DType, ValueType};
use crate::value::Value;

unary_float_op!(Acos, "acos", f32::acos);
unary_float_op!(Asin, "asin", f32::asin);
unary_float_op!(Atan, "atan", f32::atan);
unary_float_op!(Atanh, "atanh", f32::atanh);
unary_float_op!(Cos, "cos", f32::cos);
unary_float_op!(Cosh, "cosh", f32::cosh);
unary_float_op!(Erf, "erf", libm::erff);
unary_float_op!(Exp, "exp", f32::exp);
unary_float_op!(Exp2, "exp2", f32::exp2);
unary_float_op!(Sin, "sin", f32::sin);
unary_float_op!(Sinh, "sinh", f32::sinh);
unary_float_op!(Sqrt, "sqrt", f32::sqrt);
unary_float_op!(Tan, "tan", f32::tan);
unary_float_op!(Tanh, "tanh", f32::tanh);

/// Define an operator over float or integer tensors which preserves the
/// input dtype.
macro_rules! numeric_unary_op {
    ($(#[$attr:meta])* $op:ident, $name:literal, float: $float:expr, int: $int:expr) => {
        $(#[$attr])*
        #[derive(Debug, Default)]
        pub struct $op {}

        impl OpDef for $op {
            fn name(&self) -> &'static str {
                $name
            }

            op_inputs!(InputSpec::new("x").domain(TypeDomain::Numeric));

            fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
                same_type(ctx, "x")
            }

            fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
                let float_op: fn(f32) -> f32 = $float;
                let int_op: fn(i32) -> i32 = $int;
                match ctx.value("x")? {
                    Value::Int(x) => x.map(|&x| int_op(x)).into_op_result(),
                    other => other.to_f32()?.map(|&x| float_op(x)).into_op_result(),
                }
            }
        }
    };
}

numeric_unary_op!(Abs, "abs", float: f32::abs, int: i32::wrapping_abs);
numeric_unary_op!(Ceil, "ceil", float: f32::ceil, int: |x| x);
numeric_unary_op!(Floor, "floor", float: f32::floor, int: |x| x);
numeric_unary_op!(Sign, "sign", float: float_sign, int: i32::signum);
numeric_unary_op!(Square, "square", float: |x| x * x, int: |x| x.wrapping_mul(x));

numeric_unary_op!(
    /// Round to the nearest integer, with halfway cases rounded to even.
    Round,
    "round",
    float: f32::round_ties_even,
    int: |x| x
);

fn float_sign(x: f32) -> f32 {
    if x > 0. {
        1.
    } else if x < 0. {
        -1.
    } else {
        0.
    }
}

/// Define an operator which applies `f(x + epsilon)` to a float tensor.
macro_rules! epsilon_op {
    ($(#[$attr:meta])* $op:ident, $name:literal, $epsilon:expr, $f:expr) => {
        $(#[$attr])*
        #[derive(Debug, Default)]
        pub struct $op {}

        impl OpDef for $op {
            fn name(&self) -> &'static str {
                $name
            }

            op_inputs!(
                InputSpec::float("x"),
                InputSpec::float("epsilon")
                    .constant()
                    .default(DefaultValue::F32($epsilon)),
            );

            fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
                same_type(ctx, "x")
            }

            fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
                let epsilon = ctx.f32("epsilon")?;
                let f: fn(f32) -> f32 = $f;
                ctx.float("x")?.map(|&x| f(x + epsilon)).into_op_result()
            }
        }
    };
}

epsilon_op!(
    /// `1 / (x + epsilon)`
    Inverse,
    "inverse",
    1e-4,
    |x| 1. / x
);
epsilon_op!(
    /// `ln(x + epsilon)`
    Log,
    "log",
    1e-45,
    f32::ln
);
epsilon_op!(
    /// `1 / sqrt(x + epsilon)`
    Rsqrt,
    "rsqrt",
    1e-12,
    |x| 1. / x.sqrt()
);

/// Clamp values to `[alpha, beta]`.
#[derive(Debug, Default)]
pub struct Clip {}

impl OpDef for Clip {
    fn name(&self) -> &'static str {
        "clip"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("alpha").constant(),
        InputSpec::float("beta").constant(),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        if let (Ok(alpha), Ok(beta)) = (ctx.f32("alpha"), ctx.f32("beta")) {
            if alpha > beta {
                return Err(OpError::InvalidValue(format!(
                    "alpha ({}) should not be greater than beta ({})",
                    alpha, beta
                )));
            }
        }
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let alpha = ctx.f32("alpha")?;
        let beta = ctx.f32("beta")?;
        ctx.float("x")?
            .map(|&x| x.max(alpha).min(beta))
            .into_op_result()
    }
}

/// `max(x, alpha)`
#[derive(Debug, Default)]
pub struct Threshold {}

impl OpDef for Threshold {
    fn name(&self) -> &'static str {
        "threshold"
    }

    op_inputs!(InputSpec::float("x"), InputSpec::float("alpha").constant());

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let alpha = ctx.f32("alpha")?;
        ctx.float("x")?.map(|&x| x.max(alpha)).into_op_result()
    }
}

/// Convert a tensor to the dtype named by the `dtype` parameter.
#[derive(Debug, Default)]
pub struct Cast {}

impl Cast {
    fn dtype(name: &str) -> Result<DType, OpError> {
        match DType::from_name(name) {
            Some(dtype) if dtype != DType::Str => Ok(dtype),
            _ => Err(OpError::InvalidValue(format!(
                "dtype \"{}\" is not a supported tensor type",
                name
            ))),
        }
    }
}

impl OpDef for Cast {
    fn name(&self) -> &'static str {
        "cast"
    }

    op_inputs!(InputSpec::new("x"), InputSpec::string("dtype"));

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let dtype = Cast::dtype(ctx.str("dtype")?)?;
        same_shape(ctx, "x", dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let dtype = Cast::dtype(ctx.str("dtype")?)?;
        Ok(vec![ctx.value("x")?.cast(dtype)?])
    }
}

#[derive(Debug, Default)]
pub struct IsFinite {}

impl OpDef for IsFinite {
    fn name(&self) -> &'static str {
        "isfinite"
    }

    op_inputs!(InputSpec::float("x"));

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        same_shape(ctx, "x", DType::Bool)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        ctx.float("x")?.map(|x| x.is_finite()).into_op_result()
    }
}

#[derive(Debug, Default)]
pub struct LogicalNot {}

impl OpDef for LogicalNot {
    fn name(&self) -> &'static str {
        "logical_not"
    }

    op_inputs!(InputSpec::boolean("x"));

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        ctx.value("x")?.to_bool()?.map(|x| !x).into_op_result()
    }
}

#[cfg(test)]
mod tests {
    use mil_testing::{assert_close, TestCases};

    use crate::builder::{Arg, Builder};
    use crate::graph::{BuildError, Program};
    use crate::types::{DType, TensorType, ValueType};
    use crate::value::Value;

    fn fold(op: &str, args: Vec<(&str, Arg)>) -> Result<(ValueType, Value), BuildError> {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut result = None;
        mb.function("main", Vec::<(&str, TensorType)>::new(), |mb, _| {
            let mut op_builder = mb.op(op);
            for (name, arg) in args {
                op_builder = op_builder.arg(name, arg);
            }
            let y = op_builder.build1()?;
            result = Some((mb.ty(y).clone(), mb.value(y).cloned().unwrap()));
            Ok(vec![y])
        })?;
        Ok(result.unwrap())
    }

    #[test]
    fn test_float_ops() {
        #[derive(Debug)]
        struct Case {
            op: &'static str,
            x: Vec<f32>,
            expected: Vec<f32>,
        }

        let cases = [
            Case {
                op: "exp2",
                x: vec![0., 1., 3.],
                expected: vec![1., 2., 8.],
            },
            Case {
                op: "rsqrt",
                x: vec![4., 16.],
                expected: vec![0.5, 0.25],
            },
            Case {
                op: "inverse",
                x: vec![2., 4.],
                expected: vec![0.5, 0.25],
            },
            Case {
                op: "log",
                x: vec![1., std::f32::consts::E],
                expected: vec![0., 1.],
            },
            Case {
                op: "round",
                x: vec![0.5, 1.5, -2.5, 2.4],
                expected: vec![0., 2., -2., 2.],
            },
            Case {
                op: "sign",
                x: vec![-3., 0., 2.],
                expected: vec![-1., 0., 1.],
            },
            Case {
                op: "erf",
                x: vec![0., 1.],
                expected: vec![0., 0.842700],
            },
        ];

        cases.test_each(|case| {
            let (_, value) = fold(case.op, vec![("x", case.x.clone().into())]).unwrap();
            assert_close(&value.to_f32_vec().unwrap(), &case.expected, 1e-3, 1e-4);
        });
    }

    #[test]
    fn test_int_ops_preserve_dtype() {
        let (ty, value) = fold("abs", vec![("x", vec![-3, 2].into())]).unwrap();
        assert_eq!(ty.dtype(), DType::Int32);
        assert_eq!(value, Value::from(vec![3, 2]));

        let (_, value) = fold("square", vec![("x", vec![-3, 2].into())]).unwrap();
        assert_eq!(value, Value::from(vec![9, 4]));
    }

    #[test]
    fn test_clip_and_threshold() {
        let x: Arg = vec![-2f32, 0.5, 3.].into();
        let (_, value) = fold(
            "clip",
            vec![("x", x.clone()), ("alpha", 0f32.into()), ("beta", 1f32.into())],
        )
        .unwrap();
        assert_eq!(value, Value::from(vec![0f32, 0.5, 1.]));

        let (_, value) = fold("threshold", vec![("x", x), ("alpha", 1f32.into())]).unwrap();
        assert_eq!(value, Value::from(vec![1f32, 1., 3.]));
    }

    #[test]
    fn test_cast() {
        let (ty, value) = fold(
            "cast",
            vec![("x", vec![1.7f32, -1.7].into()), ("dtype", "int32".into())],
        )
        .unwrap();
        assert_eq!(ty.dtype(), DType::Int32);
        assert_eq!(value, Value::from(vec![1, -1]));

        let (ty, value) = fold(
            "cast",
            vec![("x", vec![0, 2].into()), ("dtype", "bool".into())],
        )
        .unwrap();
        assert_eq!(ty.dtype(), DType::Bool);
        assert_eq!(value, Value::from(vec![false, true]));

        let (_, value) = fold(
            "cast",
            vec![("x", vec![300].into()), ("dtype", "uint8".into())],
        )
        .unwrap();
        assert_eq!(value, Value::from(vec![44]));

        let err = fold("cast", vec![("x", vec![1].into()), ("dtype", "str".into())])
            .err()
            .unwrap();
        assert!(err.to_string().contains("not a supported tensor type"));
    }

    #[test]
    fn test_isfinite_and_logical_not() {
        let (ty, value) = fold(
            "isfinite",
            vec![("x", vec![1f32, f32::INFINITY, f32::NAN].into())],
        )
        .unwrap();
        assert_eq!(ty.dtype(), DType::Bool);
        assert_eq!(value, Value::from(vec![true, false, false]));

        let (_, value) = fold("logical_not", vec![("x", vec![true, false].into())]).unwrap();
        assert_eq!(value, Value::from(vec![false, true]));
    }
}
