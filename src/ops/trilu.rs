use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    DefaultValue, EvalContext, InferContext, InputSpec, IntoOpResult, OpDef, OpError,
};
use crate::ops::{check_min_rank, op_inputs, same_type};
use crate::types::ValueType;
use crate::value::{map_tensor, Value};

/// Zero the elements of each innermost matrix outside a band around the
/// diagonal. A negative `lower` or `upper` keeps the whole triangle.
pub fn band_part<T: Clone + Default>(
    input: &Tensor<T>,
    lower: i32,
    upper: i32,
) -> Result<Tensor<T>, OpError> {
    if input.ndim() < 2 {
        return Err(OpError::InvalidShape("x should be at least rank 2".into()));
    }

    let mut output = Tensor::zeros(input.shape());

    for (mut out_mat, in_mat) in output.inner_iter_mut::<2>().zip(input.inner_iter::<2>()) {
        let [rows, cols] = out_mat.shape();

        for y in 0..rows {
            for x in 0..cols {
                let below = y as i32 - x as i32;
                let keep = (lower < 0 || below <= lower) && (upper < 0 || -below <= upper);
                if keep {
                    out_mat[[y, x]] = in_mat[[y, x]].clone();
                }
            }
        }
    }

    Ok(output)
}

/// Keep a band of each innermost matrix. `band_part(x, 0, -1)` is the upper
/// triangle and `band_part(x, -1, 0)` the lower triangle.
#[derive(Debug, Default)]
pub struct BandPart {}

impl OpDef for BandPart {
    fn name(&self) -> &'static str {
        "band_part"
    }

    op_inputs!(
        InputSpec::new("x"),
        InputSpec::int("lower").constant().default(DefaultValue::I32(-1)),
        InputSpec::int("upper").constant().default(DefaultValue::I32(-1)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        check_min_rank(ctx.tensor("x")?, "x", 2)?;
        same_type(ctx, "x")
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let lower = ctx.i32("lower")?;
        let upper = ctx.i32("upper")?;
        map_tensor!(ctx.value("x")?, t => band_part(t, lower, upper)?).into_op_result()
    }
}

#[cfg(test)]
mod tests {
    use mil_testing::TestCases;
    use rten_tensor::prelude::*;
    use rten_tensor::Tensor;

    use super::band_part;

    #[test]
    fn test_band_part() {
        #[derive(Debug)]
        struct Case {
            lower: i32,
            upper: i32,
            expected: Vec<i32>,
        }

        let cases = [
            // Upper triangle
            Case {
                lower: 0,
                upper: -1,
                expected: vec![1, 2, 3, 0, 5, 6, 0, 0, 9],
            },
            // Lower triangle
            Case {
                lower: -1,
                upper: 0,
                expected: vec![1, 0, 0, 4, 5, 0, 7, 8, 9],
            },
            // Diagonal
            Case {
                lower: 0,
                upper: 0,
                expected: vec![1, 0, 0, 0, 5, 0, 0, 0, 9],
            },
            // Tridiagonal
            Case {
                lower: 1,
                upper: 1,
                expected: vec![1, 2, 0, 4, 5, 6, 0, 8, 9],
            },
        ];

        cases.test_each(|case| {
            let x = Tensor::from([[1, 2, 3], [4, 5, 6], [7, 8, 9]]);
            let out = band_part(&x, case.lower, case.upper).unwrap();
            assert_eq!(out.to_vec(), case.expected);
        })
    }

    #[test]
    fn test_band_part_batched() {
        let x = Tensor::from_data(&[2, 2, 2], vec![1., 2., 3., 4., 5., 6., 7., 8.]);
        let out = band_part(&x, 0, -1).unwrap();
        assert_eq!(out.shape(), &[2, 2, 2]);
        assert_eq!(out.to_vec(), [1., 2., 0., 4., 5., 6., 0., 8.]);

        assert!(band_part(&Tensor::from([1, 2]), 0, 0).is_err());
    }
}
