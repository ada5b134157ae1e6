//! Lowering for the legacy `nn_proto` layer set.
//!
//! Operations which the layer set lacks are rewritten into sequences of
//! primitive layers. Operations which cannot be expressed at all are
//! reported as unsupported.

use super::{IoSpec, LowerContext, LowerError};
use crate::operator::OpDef;
use crate::value::Value;

pub(super) fn lower_op(def: &dyn OpDef, ctx: &mut LowerContext) -> Result<(), LowerError> {
    match ctx.op().op_type() {
        "relu6" => relu6(ctx),
        "clamped_relu" => clamped_relu(ctx),
        "softplus_parametric" => softplus_parametric(ctx),
        "gelu" => gelu(def, ctx),
        "square" => square(ctx),
        "rsqrt" => rsqrt(ctx),
        "exp2" => exp2(ctx),
        "pad" => {
            check_pad(ctx)?;
            def.lower(ctx)
        }
        "conv" | "conv_transpose" => {
            check_conv(ctx)?;
            def.lower(ctx)
        }
        "random_bernoulli" | "random_normal" | "random_uniform" => {
            if ctx.const_value("shape").is_none() {
                return Err(ctx.unsupported("shape must be a const value"));
            }
            def.lower(ctx)
        }
        "list_scatter" => {
            let static_elem = ctx
                .input_type("ls")
                .and_then(|ty| ty.as_list())
                .is_some_and(|list| list.elem.shape.to_fixed().is_some());
            if !static_elem {
                return Err(ctx.unsupported("list element shape must be static"));
            }
            def.lower(ctx)
        }
        _ => def.lower(ctx),
    }
}

/// Return the spec of the operation's single output.
fn output(ctx: &LowerContext) -> Result<IoSpec, LowerError> {
    ctx.output_specs()
        .into_iter()
        .next()
        .ok_or_else(|| ctx.unsupported("operation has no outputs"))
}

/// Create a spec for an intermediate value with the same type as `like`.
fn tmp_like(ctx: &mut LowerContext, like: &IoSpec, suffix: &str) -> IoSpec {
    IoSpec {
        name: ctx.tmp_name(suffix),
        ..like.clone()
    }
}

/// Emit a chain of layers where each layer's `x` input is the previous
/// layer's output, and the last layer writes to `out`.
///
/// Each step is a layer type plus extra `(param, value name)` inputs.
fn emit_chain(
    ctx: &mut LowerContext,
    x: &str,
    out: IoSpec,
    steps: &[(&str, Vec<(&str, String)>)],
) -> Result<(), LowerError> {
    let mut current = x.to_string();
    for (i, (layer_type, extra)) in steps.iter().enumerate() {
        let spec = if i + 1 == steps.len() {
            out.clone()
        } else {
            tmp_like(ctx, &out, layer_type)
        };
        let mut inputs = vec![("x", current.as_str())];
        inputs.extend(extra.iter().map(|(param, name)| (*param, name.as_str())));
        let next = spec.name.clone();
        ctx.emit(layer_type, &inputs, vec![spec])?;
        current = next;
    }
    Ok(())
}

/// `relu6(x) = -max(-relu(x), -6)`.
fn relu6(ctx: &mut LowerContext) -> Result<(), LowerError> {
    let x = ctx.input_name("x")?;
    let out = output(ctx)?;
    let neg_one = ctx.add_const(Value::from(-1.));
    let zero = ctx.add_const(Value::from(0.));
    let neg_six = ctx.add_const(Value::from(-6.));
    let negate = vec![("alpha", neg_one), ("beta", zero)];
    emit_chain(
        ctx,
        &x,
        out,
        &[
            ("relu", vec![]),
            ("linear_activation", negate.clone()),
            ("threshold", vec![("alpha", neg_six)]),
            ("linear_activation", negate),
        ],
    )
}

/// `clamped_relu(x) = min(relu(x), beta) + min(min(x, 0) * alpha, beta)`.
fn clamped_relu(ctx: &mut LowerContext) -> Result<(), LowerError> {
    let x = ctx.input_name("x")?;
    let alpha = ctx.input_name("alpha")?;
    let beta = ctx.input_name("beta")?;
    let out = output(ctx)?;
    let zero = ctx.add_const(Value::from(0.));

    let pos = tmp_like(ctx, &out, "pos");
    emit_chain(
        ctx,
        &x,
        pos.clone(),
        &[("relu", vec![]), ("minimum", vec![("y", beta.clone())])],
    )?;

    let neg = tmp_like(ctx, &out, "neg");
    emit_chain(
        ctx,
        &x,
        neg.clone(),
        &[
            ("minimum", vec![("y", zero)]),
            ("mul", vec![("y", alpha)]),
            ("minimum", vec![("y", beta)]),
        ],
    )?;

    ctx.emit("add", &[("x", pos.name.as_str()), ("y", neg.name.as_str())], vec![out])
}

/// `softplus_parametric(x) = alpha * log(exp(beta * x) + 1)`, with
/// per-channel parameters reshaped to broadcast over the spatial dims.
fn softplus_parametric(ctx: &mut LowerContext) -> Result<(), LowerError> {
    let x = ctx.input_name("x")?;
    let out = output(ctx)?;

    let mut channel_params = Vec::new();
    for param in ["alpha", "beta"] {
        let Some(value) = ctx.const_value(param) else {
            return Err(ctx.unsupported(&format!("{} must be a const value", param)));
        };
        let channels = value.len();
        let Ok(values) = value.to_f32() else {
            return Err(ctx.unsupported(&format!("{} must be a float vector", param)));
        };
        let reshaped = values.into_shape([channels, 1, 1].as_slice());
        channel_params.push(ctx.add_const(Value::Float(reshaped)));
    }
    let [alpha, beta] = [channel_params[0].clone(), channel_params[1].clone()];
    let one = ctx.add_const(Value::from(1.));

    emit_chain(
        ctx,
        &x,
        out,
        &[
            ("mul", vec![("y", beta)]),
            ("exp", vec![]),
            ("add", vec![("y", one)]),
            ("log", vec![]),
            ("mul", vec![("y", alpha)]),
        ],
    )
}

fn gelu(def: &dyn OpDef, ctx: &mut LowerContext) -> Result<(), LowerError> {
    let mode = ctx
        .const_value("mode")
        .and_then(|mode| mode.as_str().ok())
        .unwrap_or("EXACT");
    let x = ctx.input_name("x")?;
    let out = output(ctx)?;

    match mode {
        "TANH_APPROXIMATION" => {
            // 0.5 * x * (1 + tanh(sqrt(2 / pi) * (x + 0.044715 * x^3)))
            let cube = tmp_like(ctx, &out, "cube");
            let x2 = tmp_like(ctx, &out, "x2");
            ctx.emit("mul", &[("x", x.as_str()), ("y", x.as_str())], vec![x2.clone()])?;
            ctx.emit("mul", &[("x", x2.name.as_str()), ("y", x.as_str())], vec![cube.clone()])?;

            let coeff = ctx.add_const(Value::from(0.044715));
            let scale = ctx.add_const(Value::from((2. / std::f32::consts::PI).sqrt()));
            let one = ctx.add_const(Value::from(1.));
            let half = ctx.add_const(Value::from(0.5));
            let inner = tmp_like(ctx, &out, "inner");
            emit_chain(
                ctx,
                &cube.name,
                inner.clone(),
                &[
                    ("mul", vec![("y", coeff)]),
                    ("add", vec![("y", x.clone())]),
                    ("mul", vec![("y", scale)]),
                    ("tanh", vec![]),
                    ("add", vec![("y", one)]),
                ],
            )?;
            emit_chain(
                ctx,
                &inner.name,
                out,
                &[("mul", vec![("y", x)]), ("mul", vec![("y", half)])],
            )
        }
        "SIGMOID_APPROXIMATION" => {
            // x * sigmoid(1.702 * x)
            let coeff = ctx.add_const(Value::from(1.702));
            emit_chain(
                ctx,
                &x,
                out,
                &[
                    ("mul", vec![("y", coeff)]),
                    ("sigmoid", vec![]),
                    ("mul", vec![("y", x.clone())]),
                ],
            )
        }
        _ => def.lower(ctx),
    }
}

fn square(ctx: &mut LowerContext) -> Result<(), LowerError> {
    let x = ctx.input_name("x")?;
    let out = output(ctx)?;
    ctx.emit("mul", &[("x", x.as_str()), ("y", x.as_str())], vec![out])
}

/// `rsqrt(x) = 1 / sqrt(x + epsilon)`.
fn rsqrt(ctx: &mut LowerContext) -> Result<(), LowerError> {
    let x = ctx.input_name("x")?;
    let epsilon = ctx.input_name("epsilon")?;
    let out = output(ctx)?;
    let zero = ctx.add_const(Value::from(0.));
    emit_chain(
        ctx,
        &x,
        out,
        &[
            ("add", vec![("y", epsilon)]),
            ("sqrt", vec![]),
            ("inverse", vec![("epsilon", zero)]),
        ],
    )
}

/// `exp2(x) = exp(x * ln 2)`.
fn exp2(ctx: &mut LowerContext) -> Result<(), LowerError> {
    let x = ctx.input_name("x")?;
    let out = output(ctx)?;
    let ln2 = ctx.add_const(Value::from(std::f32::consts::LN_2));
    emit_chain(ctx, &x, out, &[("mul", vec![("y", ln2)]), ("exp", vec![])])
}

/// Reflect and replicate padding is only available on the last two dims.
fn check_pad(ctx: &LowerContext) -> Result<(), LowerError> {
    let mode = ctx
        .const_value("mode")
        .and_then(|mode| mode.as_str().ok())
        .unwrap_or("constant");
    if mode == "constant" {
        return Ok(());
    }
    let Some(pad) = ctx.const_value("pad").and_then(|pad| pad.to_i32_vec().ok()) else {
        return Err(ctx.unsupported("pad amounts must be const values"));
    };
    let n_dims = pad.len() / 2;
    let outer = n_dims.saturating_sub(2);
    if pad[..outer * 2].iter().any(|&p| p != 0) {
        return Err(ctx.unsupported(&format!(
            "{} padding is only supported on the last two dimensions",
            mode
        )));
    }
    Ok(())
}

fn check_conv(ctx: &LowerContext) -> Result<(), LowerError> {
    let rank = ctx
        .input_type("x")
        .and_then(|ty| ty.as_tensor())
        .and_then(|ty| ty.rank());
    match rank {
        Some(rank) if rank <= 4 => Ok(()),
        Some(_) => Err(ctx.unsupported("only 1D and 2D convolutions are supported")),
        None => Err(ctx.unsupported("input rank must be known")),
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::graph::{BuildError, Program, VarId};
    use crate::lower::{lower_program, Backend, BackendSpec, LowerError, LowerOptions};
    use crate::operator::ErrorKind;
    use crate::types::{tensor_type, DType};

    fn lower_single_op(
        input_shape: &[usize],
        build: impl FnOnce(&mut Builder, VarId) -> Result<VarId, BuildError>,
        options: &LowerOptions,
    ) -> Result<BackendSpec, LowerError> {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        mb.function(
            "main",
            [("x", tensor_type(input_shape, DType::Fp32))],
            |mb, x| Ok(vec![build(mb, x[0])?]),
        )
        .unwrap();
        lower_program(&program, Backend::NnProto, options)
    }

    #[test]
    fn test_reflect_pad_on_outer_dim_is_unsupported() {
        let strict = LowerOptions {
            skip_unsupported: false,
        };
        let lenient = LowerOptions {
            skip_unsupported: true,
        };

        let err = lower_single_op(
            &[3, 4, 5],
            |mb, x| {
                mb.op("pad")
                    .arg("x", x)
                    .arg("pad", [1, 1, 0, 0, 0, 0])
                    .arg("mode", "reflect")
                    .build1()
            },
            &strict,
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOnBackend);

        let spec = lower_single_op(
            &[3, 4, 5],
            |mb, x| {
                mb.op("pad")
                    .arg("x", x)
                    .arg("pad", [1, 1, 0, 0, 0, 0])
                    .arg("mode", "reflect")
                    .build1()
            },
            &lenient,
        )
        .unwrap();
        assert_eq!(spec.skipped.len(), 1);
        assert_eq!(spec.skipped[0].op_type, "pad");

        // Padding only the last two dims is fine.
        let spec = lower_single_op(
            &[3, 4, 5],
            |mb, x| {
                mb.op("pad")
                    .arg("x", x)
                    .arg("pad", [0, 0, 1, 1, 2, 2])
                    .arg("mode", "reflect")
                    .build1()
            },
            &strict,
        );
        assert!(spec.is_ok());
    }

    #[test]
    fn test_rsqrt_decomposition() {
        let options = LowerOptions {
            skip_unsupported: false,
        };
        let spec = lower_single_op(&[4], |mb, x| mb.op("rsqrt").arg("x", x).build1(), &options)
            .unwrap();
        let layer_types: Vec<_> = spec.layers().map(|l| l.layer_type.as_str()).collect();
        assert_eq!(layer_types, ["add", "sqrt", "inverse"]);
    }
}
