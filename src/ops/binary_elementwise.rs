use mil_shape::{broadcast_shapes, broadcast_sizes};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    single_output, EvalContext, InferContext, InputSpec, IntoOpResult, OpDef, OpError, TypeDomain,
};
use crate::ops::{broadcast_map, op_inputs, promoted_dtype, tensor_list, TensorList};
use crate::types::{DType, ValueType};
use crate::value::Value;

/// Infer the type of a binary elementwise operator's output. `dtype` maps
/// the promoted input dtype to the output dtype.
fn infer_binary(
    ctx: &InferContext,
    dtype: impl FnOnce(DType) -> DType,
) -> Result<Vec<ValueType>, OpError> {
    let x = ctx.tensor("x")?;
    let y = ctx.tensor("y")?;
    let shape = broadcast_shapes(&x.shape, &y.shape)?;
    let promoted = promoted_dtype(ctx, &["x", "y"])?;
    single_output(shape, dtype(promoted))
}

/// Operands of a binary operator, converted to the carrier they promote to.
enum Operands {
    Float(Tensor<f32>, Tensor<f32>),
    Int(Tensor<i32>, Tensor<i32>),
    Bool(Tensor<bool>, Tensor<bool>),
}

fn operands(ctx: &EvalContext, x: &str, y: &str) -> Result<Operands, OpError> {
    let values = [ctx.value(x)?, ctx.value(y)?];
    let operands = match tensor_list(&values)? {
        TensorList::Float(ts) => {
            let [a, b]: [Tensor<f32>; 2] = ts.try_into().map_err(|_| operand_count())?;
            Operands::Float(a, b)
        }
        TensorList::Int(ts) => {
            let [a, b]: [Tensor<i32>; 2] = ts.try_into().map_err(|_| operand_count())?;
            Operands::Int(a, b)
        }
        TensorList::Bool(ts) => {
            let [a, b]: [Tensor<bool>; 2] = ts.try_into().map_err(|_| operand_count())?;
            Operands::Bool(a, b)
        }
    };
    Ok(operands)
}

fn operand_count() -> OpError {
    OpError::NotEvaluable("expected two operands".into())
}

/// Evaluate an arithmetic operator. `int_op` returns `None` for undefined
/// results such as division by zero.
fn arith(
    ctx: &EvalContext,
    float_op: fn(f32, f32) -> f32,
    int_op: fn(i32, i32) -> Option<i32>,
) -> Result<Vec<Value>, OpError> {
    match operands(ctx, "x", "y")? {
        Operands::Float(a, b) => broadcast_map(&a, &b, float_op).into_op_result(),
        Operands::Int(a, b) => {
            let out = broadcast_map(&a, &b, int_op)?;
            let data = out
                .iter()
                .copied()
                .collect::<Option<Vec<i32>>>()
                .ok_or_else(|| OpError::InvalidValue("integer division by zero".into()))?;
            Tensor::from_data(out.shape(), data).into_op_result()
        }
        Operands::Bool(..) => Err(OpError::InvalidType(
            "x and y should be numeric tensors".into(),
        )),
    }
}

/// Define an arithmetic operator with separate float and integer kernels.
macro_rules! arith_op {
    ($(#[$attr:meta])* $op:ident, $name:literal, float: $float:expr, int: $int:expr) => {
        $(#[$attr])*
        #[derive(Debug, Default)]
        pub struct $op {}

        impl OpDef for $op {
            fn name(&self) -> &'static str {
                $name
            }

            op_inputs!(
                InputSpec::new("x").domain(TypeDomain::Numeric),
                InputSpec::new("y").domain(TypeDomain::Numeric),
            );

            fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
                infer_binary(ctx, |dtype| dtype)
            }

            fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
                arith(ctx, $float, $int)
            }
        }
    };
}

arith_op!(Add, "add", float: |a, b| a + b, int: |a, b| Some(a.wrapping_add(b)));
arith_op!(Sub, "sub", float: |a, b| a - b, int: |a, b| Some(a.wrapping_sub(b)));
arith_op!(Mul, "mul", float: |a, b| a * b, int: |a, b| Some(a.wrapping_mul(b)));
arith_op!(Maximum, "maximum", float: f32::max, int: |a, b| Some(a.max(b)));
arith_op!(Minimum, "minimum", float: f32::min, int: |a, b| Some(a.min(b)));

arith_op!(
    /// Division rounding towards negative infinity.
    FloorDiv,
    "floor_div",
    float: |a, b| (a / b).floor(),
    int: floor_div
);

arith_op!(
    /// Remainder with the sign of the divisor.
    Mod,
    "mod",
    float: |a, b| a - b * (a / b).floor(),
    int: floor_mod
);

arith_op!(Pow, "pow", float: f32::powf, int: int_pow);

fn floor_div(a: i32, b: i32) -> Option<i32> {
    let q = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

fn floor_mod(a: i32, b: i32) -> Option<i32> {
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(r + b)
    } else {
        Some(r)
    }
}

fn int_pow(a: i32, b: i32) -> Option<i32> {
    if b >= 0 {
        Some(a.wrapping_pow(b as u32))
    } else {
        Some((a as f32).powi(b) as i32)
    }
}

/// Division which always produces a float result.
#[derive(Debug, Default)]
pub struct RealDiv {}

impl OpDef for RealDiv {
    fn name(&self) -> &'static str {
        "real_div"
    }

    op_inputs!(
        InputSpec::new("x").domain(TypeDomain::Numeric),
        InputSpec::new("y").domain(TypeDomain::Numeric),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        infer_binary(ctx, |dtype| {
            if dtype.is_float() {
                dtype
            } else {
                DType::Fp32
            }
        })
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.float("x")?;
        let y = ctx.float("y")?;
        broadcast_map(&x, &y, |a, b| a / b).into_op_result()
    }
}

/// Define a comparison operator, which produces a bool tensor.
macro_rules! compare_op {
    ($op:ident, $name:literal, $cmp:expr) => {
        #[derive(Debug, Default)]
        pub struct $op {}

        impl OpDef for $op {
            fn name(&self) -> &'static str {
                $name
            }

            op_inputs!(InputSpec::new("x"), InputSpec::new("y"));

            fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
                infer_binary(ctx, |_| DType::Bool)
            }

            fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
                match operands(ctx, "x", "y")? {
                    Operands::Float(a, b) => broadcast_map(&a, &b, $cmp),
                    Operands::Int(a, b) => broadcast_map(&a, &b, $cmp),
                    Operands::Bool(a, b) => broadcast_map(&a, &b, $cmp),
                }
                .into_op_result()
            }
        }
    };
}

compare_op!(Equal, "equal", |a, b| a == b);
compare_op!(NotEqual, "not_equal", |a, b| a != b);
compare_op!(Greater, "greater", |a, b| a > b);
compare_op!(GreaterEqual, "greater_equal", |a, b| a >= b);
compare_op!(Less, "less", |a, b| a < b);
compare_op!(LessEqual, "less_equal", |a, b| a <= b);

/// Define a logical operator over bool tensors.
macro_rules! logical_op {
    ($op:ident, $name:literal, $f:expr) => {
        #[derive(Debug, Default)]
        pub struct $op {}

        impl OpDef for $op {
            fn name(&self) -> &'static str {
                $name
            }

            op_inputs!(InputSpec::boolean("x"), InputSpec::boolean("y"));

            fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
                infer_binary(ctx, |_| DType::Bool)
            }

            fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
                let x = ctx.value("x")?.to_bool()?;
                let y = ctx.value("y")?.to_bool()?;
                let f: fn(bool, bool) -> bool = $f;
                broadcast_map(&x, &y, f).into_op_result()
            }
        }
    };
}

logical_op!(LogicalAnd, "logical_and", |a, b| a && b);
logical_op!(LogicalOr, "logical_or", |a, b| a || b);
logical_op!(LogicalXor, "logical_xor", |a, b| a ^ b);

/// Choose elements from `a` where `cond` is true and from `b` elsewhere.
/// All three inputs are broadcast together.
#[derive(Debug, Default)]
pub struct Select {}

impl OpDef for Select {
    fn name(&self) -> &'static str {
        "select"
    }

    op_inputs!(
        InputSpec::boolean("cond"),
        InputSpec::new("a"),
        InputSpec::new("b")
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let cond = ctx.shape("cond")?;
        let a = ctx.shape("a")?;
        let b = ctx.shape("b")?;
        let shape = broadcast_shapes(&broadcast_shapes(cond, a)?, b)?;
        single_output(shape, promoted_dtype(ctx, &["a", "b"])?)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let cond = ctx.value("cond")?.to_bool()?;
        match operands(ctx, "a", "b")? {
            Operands::Float(a, b) => select(&cond, &a, &b).map(Value::Float),
            Operands::Int(a, b) => select(&cond, &a, &b).map(Value::Int),
            Operands::Bool(a, b) => select(&cond, &a, &b).map(Value::Bool),
        }
        .into_op_result()
    }
}

fn select<T: Copy>(
    cond: &Tensor<bool>,
    a: &Tensor<T>,
    b: &Tensor<T>,
) -> Result<Tensor<T>, OpError> {
    let shape = broadcast_sizes(cond.shape(), a.shape())
        .and_then(|shape| broadcast_sizes(&shape, b.shape()))
        .ok_or_else(|| {
            OpError::InvalidShape(format!(
                "cannot broadcast shapes {:?}, {:?} and {:?}",
                cond.shape(),
                a.shape(),
                b.shape()
            ))
        })?;
    let data: Vec<T> = cond
        .broadcast(shape.as_slice())
        .iter()
        .zip(a.broadcast(shape.as_slice()).iter())
        .zip(b.broadcast(shape.as_slice()).iter())
        .map(|((&c, &x), &y)| if c { x } else { y })
        .collect();
    Ok(Tensor::from_data(shape.as_slice(), data))
}
