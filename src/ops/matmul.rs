use mil_shape::{broadcast_shapes, broadcast_sizes, Dim, Shape};
use rayon::prelude::*;
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    single_output, DefaultValue, EvalContext, InferContext, InputSpec, IntoOpResult, OpDef,
    OpError, TypeDomain,
};
use crate::ops::{broadcast_to, check_rank, op_inputs, promoted_dtype};
use crate::types::ValueType;
use crate::value::Value;

/// Multiply row-major matrices `a` (`[m, k]`) and `b` (`[k, n]`) into `out`.
fn gemm(out: &mut [f32], a: &[f32], b: &[f32], m: usize, k: usize, n: usize) {
    for i in 0..m {
        let out_row = &mut out[i * n..(i + 1) * n];
        out_row.fill(0.);
        for p in 0..k {
            let a_ip = a[i * k + p];
            let b_row = &b[p * n..(p + 1) * n];
            for (o, &b_pn) in out_row.iter_mut().zip(b_row) {
                *o += a_ip * b_pn;
            }
        }
    }
}

/// Swap the last two dims of a tensor with rank >= 2.
fn transpose_last2(t: &Tensor<f32>) -> Tensor<f32> {
    let rank = t.ndim();
    let mut perm: Vec<usize> = (0..rank).collect();
    perm.swap(rank - 2, rank - 1);
    t.permuted(perm.as_slice()).to_tensor()
}

/// Matrix product of the last two dims of `a` and `b`, broadcasting the
/// leading batch dims.
pub(crate) fn matmul(a: &Tensor<f32>, b: &Tensor<f32>) -> Result<Tensor<f32>, OpError> {
    let (a_rank, b_rank) = (a.ndim(), b.ndim());
    if a_rank < 2 || b_rank < 2 {
        return Err(OpError::InvalidShape(
            "matmul inputs should be at least rank 2".to_string(),
        ));
    }
    let (m, k) = (a.size(a_rank - 2), a.size(a_rank - 1));
    let (b_k, n) = (b.size(b_rank - 2), b.size(b_rank - 1));
    if k != b_k {
        return Err(OpError::InvalidShape(format!(
            "Dimension mismatch in matmul: x has {} columns but y has {} rows",
            k, b_k
        )));
    }

    let batch = broadcast_sizes(&a.shape()[..a_rank - 2], &b.shape()[..b_rank - 2])
        .ok_or_else(|| {
            OpError::InvalidShape(format!(
                "cannot broadcast batch dims of {:?} and {:?}",
                a.shape(),
                b.shape()
            ))
        })?;
    let mut a_shape = batch.to_vec();
    a_shape.extend([m, k]);
    let mut b_shape = batch.to_vec();
    b_shape.extend([k, n]);
    let a = broadcast_to(a, &a_shape)?.to_vec();
    let b = broadcast_to(b, &b_shape)?.to_vec();

    let n_batches: usize = batch.iter().product();
    let mut out = vec![0.; n_batches * m * n];
    if m * n > 0 {
        out.par_chunks_mut(m * n)
            .enumerate()
            .for_each(|(i, out_mat)| {
                let a_mat = &a[i * m * k..(i + 1) * m * k];
                let b_mat = &b[i * k * n..(i + 1) * k * n];
                gemm(out_mat, a_mat, b_mat, m, k, n);
            });
    }

    let mut out_shape = batch.to_vec();
    out_shape.extend([m, n]);
    Ok(Tensor::from_data(out_shape.as_slice(), out))
}

/// Matrix product with NumPy semantics.
///
/// Rank-1 inputs are treated as a row vector (`x`) or column vector (`y`)
/// and the added dimension is removed from the result.
#[derive(Debug, Default)]
pub struct MatMul {}

impl OpDef for MatMul {
    fn name(&self) -> &'static str {
        "matmul"
    }

    op_inputs!(
        InputSpec::new("x").domain(TypeDomain::Numeric),
        InputSpec::new("y").domain(TypeDomain::Numeric),
        InputSpec::boolean("transpose_x")
            .constant()
            .default(DefaultValue::Bool(false)),
        InputSpec::boolean("transpose_y")
            .constant()
            .default(DefaultValue::Bool(false)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let dtype = promoted_dtype(ctx, &["x", "y"])?;
        let (Some(x), Some(y)) = (ctx.shape("x")?.dims(), ctx.shape("y")?.dims()) else {
            return single_output(Shape::unranked(), dtype);
        };
        if x.is_empty() || y.is_empty() {
            return Err(OpError::InvalidShape(
                "matmul inputs should be at least rank 1".to_string(),
            ));
        }

        let mut x = x.to_vec();
        let mut y = y.to_vec();
        if x.len() >= 2 && ctx.bool("transpose_x")? {
            let r = x.len();
            x.swap(r - 2, r - 1);
        }
        if y.len() >= 2 && ctx.bool("transpose_y")? {
            let r = y.len();
            y.swap(r - 2, r - 1);
        }
        let x_vector = x.len() == 1;
        let y_vector = y.len() == 1;
        if x_vector {
            x.insert(0, Dim::Fixed(1));
        }
        if y_vector {
            y.push(Dim::Fixed(1));
        }

        let (xr, yr) = (x.len(), y.len());
        if let (Dim::Fixed(x_k), Dim::Fixed(y_k)) = (x[xr - 1], y[yr - 2]) {
            if x_k != y_k {
                return Err(OpError::InvalidShape(format!(
                    "Dimension mismatch in matmul: x has {} columns but y has {} rows",
                    x_k, y_k
                )));
            }
        }

        let batch = broadcast_shapes(
            &Shape::from_dims(x[..xr - 2].iter().copied()),
            &Shape::from_dims(y[..yr - 2].iter().copied()),
        )?;
        let mut dims = batch.dims().map(|d| d.to_vec()).unwrap_or_default();
        if !x_vector {
            dims.push(x[xr - 2]);
        }
        if !y_vector {
            dims.push(y[yr - 1]);
        }
        single_output(Shape::from_dims(dims), dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let mut x = ctx.float("x")?;
        let mut y = ctx.float("y")?;
        if x.ndim() >= 2 && ctx.bool("transpose_x")? {
            x = transpose_last2(&x);
        }
        if y.ndim() >= 2 && ctx.bool("transpose_y")? {
            y = transpose_last2(&y);
        }

        let x_vector = x.ndim() == 1;
        let y_vector = y.ndim() == 1;
        if x_vector {
            x.insert_axis(0);
        }
        if y_vector {
            y.insert_axis(1);
        }

        let out = matmul(&x, &y)?;
        let mut shape = out.shape().to_vec();
        let rank = shape.len();
        match (x_vector, y_vector) {
            (true, true) => {
                shape.truncate(rank - 2);
            }
            (true, false) => {
                shape.remove(rank - 2);
            }
            (false, true) => {
                shape.pop();
            }
            (false, false) => {}
        }
        out.into_shape(shape.as_slice()).into_op_result()
    }
}

/// Fully connected layer: `x @ weight^T + bias`, where `weight` has shape
/// `[out, in]`.
#[derive(Debug, Default)]
pub struct Linear {}

impl OpDef for Linear {
    fn name(&self) -> &'static str {
        "linear"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("weight"),
        InputSpec::float("bias").optional(),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let weight = ctx.tensor("weight")?;
        check_rank(weight, "weight", 2)?;
        if let Some(bias) = ctx.opt_tensor("bias")? {
            check_rank(bias, "bias", 1)?;
        }
        let dtype = promoted_dtype(ctx, &["x", "weight"])?;

        let (Some(x_dims), Some(w_dims)) = (x.shape.dims(), weight.shape.dims()) else {
            return single_output(Shape::unranked(), dtype);
        };
        let Some((&x_in, batch)) = x_dims.split_last() else {
            return Err(OpError::InvalidShape(
                "x should be at least rank 1".to_string(),
            ));
        };
        if let (Dim::Fixed(x_in), Dim::Fixed(w_in)) = (x_in, w_dims[1]) {
            if x_in != w_in {
                return Err(OpError::InvalidShape(format!(
                    "Dimension mismatch in linear: x has {} features but weight expects {}",
                    x_in, w_in
                )));
            }
        }
        let mut dims = batch.to_vec();
        dims.push(w_dims[0]);
        single_output(Shape::from_dims(dims), dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.float("x")?;
        let weight = ctx.float("weight")?;
        let rank = x.ndim();
        if rank == 0 || weight.ndim() != 2 {
            return Err(OpError::InvalidShape(
                "linear expects x of rank >= 1 and a rank 2 weight".to_string(),
            ));
        }
        let in_features = x.size(rank - 1);
        let batch: usize = x.shape()[..rank - 1].iter().product();
        let x2 = x.to_shape([batch, in_features].as_slice());
        let out = matmul(&x2, &transpose_last2(&weight))?;
        let out_features = out.size(1);

        let mut data = out.into_data();
        if let Some(bias) = ctx.opt_float("bias")? {
            if bias.len() != out_features {
                return Err(OpError::InvalidShape(format!(
                    "bias has {} elements but weight has {} outputs",
                    bias.len(),
                    out_features
                )));
            }
            let bias = bias.to_vec();
            for row in data.chunks_mut(out_features.max(1)) {
                for (o, b) in row.iter_mut().zip(&bias) {
                    *o += b;
                }
            }
        }

        let mut shape = x.shape()[..rank - 1].to_vec();
        shape.push(out_features);
        Tensor::from_data(shape.as_slice(), data).into_op_result()
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::prelude::*;
    use rten_tensor::Tensor;

    use crate::builder::Builder;
    use crate::graph::{BuildError, Program};
    use crate::types::{tensor_type, DType, ValueType};
    use crate::value::Value;

    fn matmul(x: Tensor<f32>, y: Tensor<f32>, transpose_y: bool) -> Result<Value, BuildError> {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut result = None;
        mb.function("main", Vec::<(&str, ValueType)>::new(), |mb, _| {
            let out = mb
                .op("matmul")
                .arg("x", x)
                .arg("y", y)
                .arg("transpose_y", transpose_y)
                .build1()?;
            result = mb.value(out).cloned();
            Ok(vec![out])
        })?;
        Ok(result.unwrap())
    }

    #[test]
    fn test_matmul() {
        let a = Tensor::from([[1f32, 2.], [3., 4.]]);
        let b = Tensor::from([[5f32, 6.], [7., 8.]]);
        let result = matmul(a.clone(), b.clone(), false).unwrap();
        assert_eq!(result, Value::from(Tensor::from([[19f32, 22.], [43., 50.]])));

        let result = matmul(a.clone(), b, true).unwrap();
        assert_eq!(result, Value::from(Tensor::from([[17f32, 23.], [39., 53.]])));

        // Vector-matrix product drops the added dimension.
        let result = matmul(Tensor::from([1f32, 1.]), a.clone(), false).unwrap();
        assert_eq!(result, Value::from(vec![4f32, 6.]));

        // Batch dims broadcast.
        let batch = Tensor::from_data(&[2, 1, 2], vec![1f32, 0., 0., 1.]);
        let result = matmul(batch, a, false).unwrap();
        assert_eq!(result.shape(), [2, 1, 2]);
        assert_eq!(result.to_f32_vec().unwrap(), [1., 2., 3., 4.]);
    }

    #[test]
    fn test_matmul_shape_inference() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut ty = None;
        mb.function(
            "main",
            [
                ("x", tensor_type([5, 1, 3, 4], DType::Fp16)),
                ("y", tensor_type([2, 4, 6], DType::Fp16)),
            ],
            |mb, inputs| {
                let out = mb.op("matmul").arg("x", inputs[0]).arg("y", inputs[1]).build1()?;
                ty = Some(mb.ty(out).clone());
                Ok(vec![out])
            },
        )
        .unwrap();
        let ty = ty.unwrap();
        assert_eq!(ty.dtype(), DType::Fp16);
        assert_eq!(
            ty.as_tensor().unwrap().shape.to_fixed(),
            Some(vec![5, 2, 3, 6])
        );

        let err = matmul(Tensor::zeros(&[2, 3]), Tensor::zeros(&[2, 3]), false)
            .err()
            .unwrap();
        assert!(err.to_string().contains("Dimension mismatch in matmul"));
    }

    #[test]
    fn test_linear() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut result = None;
        mb.function("main", Vec::<(&str, ValueType)>::new(), |mb, _| {
            let out = mb
                .op("linear")
                .arg("x", Tensor::from([[1f32, 2.]]))
                .arg("weight", Tensor::from([[1f32, 0.], [0., 1.], [1., 1.]]))
                .arg("bias", [0.5f32, 0., -1.])
                .build1()?;
            result = mb.value(out).cloned();
            Ok(vec![out])
        })
        .unwrap();
        assert_eq!(
            result,
            Some(Value::from(Tensor::from([[1.5f32, 2., 2.]])))
        );
    }
}
