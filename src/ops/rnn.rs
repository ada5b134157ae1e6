use std::iter::Rev;
use std::ops::Range;

use mil_shape::{Dim, Shape};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{DefaultValue, EvalContext, InferContext, InputSpec, OpDef, OpError};
use crate::ops::activations::sigmoid;
use crate::ops::{check_rank, op_inputs, promoted_dtype};
use crate::types::{DType, TensorType, ValueType};
use crate::value::Value;

/// Direction that a recurrent operator traverses the input sequence in.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Direction {
    Forward,
    Reverse,
    Bidirectional,
}

impl Direction {
    fn parse(direction: &str) -> Result<Direction, OpError> {
        match direction {
            "forward" => Ok(Direction::Forward),
            "reverse" => Ok(Direction::Reverse),
            "bidirectional" => Ok(Direction::Bidirectional),
            _ => Err(OpError::InvalidValue(format!(
                "direction should be forward, reverse or bidirectional but got \"{}\"",
                direction
            ))),
        }
    }

    /// Number of directions that the sequence is traversed in.
    pub fn num_directions(self) -> usize {
        match self {
            Self::Forward | Self::Reverse => 1,
            Self::Bidirectional => 2,
        }
    }
}

/// Forward or backward iterator over values in a range.
enum Sequence {
    Forward(Range<usize>),
    Backward(Rev<Range<usize>>),
}

impl Iterator for Sequence {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        match self {
            Sequence::Forward(range) => range.next(),
            Sequence::Backward(rev_range) => rev_range.next(),
        }
    }
}

/// Return an iterator over time steps for direction index `dir` (0 or 1).
fn sequence_for_dir(op_dirs: Direction, dir: usize, seq_len: usize) -> Sequence {
    let reversed = matches!(
        (dir, op_dirs),
        (0, Direction::Reverse) | (1, Direction::Bidirectional)
    );
    if reversed {
        Sequence::Backward((0..seq_len).rev())
    } else {
        Sequence::Forward(0..seq_len)
    }
}

type Activation = fn(f32) -> f32;

fn activation(name: &str) -> Result<Activation, OpError> {
    let f: Activation = match name.to_ascii_lowercase().as_str() {
        "sigmoid" => sigmoid,
        "tanh" => f32::tanh,
        "relu" => |x| x.max(0.),
        "linear" => |x| x,
        "sigmoid_hard" => |x| (0.2 * x + 0.5).clamp(0., 1.),
        "softplus" => |x| (-x.abs()).exp().ln_1p() + x.max(0.),
        _ => {
            return Err(OpError::InvalidValue(format!(
                "unsupported activation \"{}\"",
                name
            )))
        }
    };
    Ok(f)
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum CellKind {
    Rnn,
    Gru,
    Lstm,
}

impl CellKind {
    /// Number of gate column blocks in the packed weight.
    fn gates(self) -> usize {
        match self {
            CellKind::Rnn => 1,
            CellKind::Gru => 3,
            CellKind::Lstm => 4,
        }
    }

    fn op_name(self) -> &'static str {
        match self {
            CellKind::Rnn => "rnn",
            CellKind::Gru => "gru",
            CellKind::Lstm => "lstm",
        }
    }
}

/// Infer the outputs of a recurrent op: the output sequence, the final
/// hidden state and, for LSTM, the final cell state.
fn infer_recurrent(ctx: &InferContext, kind: CellKind) -> Result<Vec<ValueType>, OpError> {
    let x = ctx.tensor("x")?;
    let weight = ctx.tensor("weight")?;
    check_rank(x, "x", 3)?;
    check_rank(weight, "weight", 2)?;
    let dtype: DType = promoted_dtype(ctx, &["x", "weight"])?;
    let dirs = Direction::parse(ctx.str("direction")?)?.num_directions();
    let gates = kind.gates();

    let input_size = x.shape.dim(2).and_then(|d| d.fixed());
    let weight_rows = weight.shape.dim(0).and_then(|d| d.fixed());
    let weight_cols = weight.shape.dim(1).and_then(|d| d.fixed());
    let state_size = ctx
        .tensor("initial_h")?
        .shape
        .dims()
        .and_then(|dims| dims.last())
        .and_then(|d| d.fixed());

    let hidden = match (state_size, weight_cols) {
        (Some(size), _) if size % dirs == 0 => Some(size / dirs),
        (Some(size), _) => {
            return Err(OpError::InvalidShape(format!(
                "initial_h size {} is not divisible by the number of directions ({})",
                size, dirs
            )))
        }
        (None, Some(cols)) => Some(cols / (gates * dirs)),
        (None, None) => None,
    };

    if let (Some(hidden), Some(cols)) = (hidden, weight_cols) {
        if cols != gates * dirs * hidden {
            return Err(OpError::InvalidShape(format!(
                "{} weight should have {} columns but has {}",
                kind.op_name(),
                gates * dirs * hidden,
                cols
            )));
        }
    }
    if let (Some(input), Some(hidden), Some(rows)) = (input_size, hidden, weight_rows) {
        if rows != input + hidden {
            return Err(OpError::InvalidShape(format!(
                "{} weight should have {} rows (input size + hidden size) but has {}",
                kind.op_name(),
                input + hidden,
                rows
            )));
        }
    }

    let features = hidden.map(|h| Dim::Fixed(h * dirs)).unwrap_or_else(Dim::new_symbol);
    let (seq, batch) = match x.shape.dims() {
        Some(dims) => (dims[0], dims[1]),
        None => (Dim::new_symbol(), Dim::new_symbol()),
    };
    let seq = if ctx.bool("output_sequence")? {
        seq
    } else {
        Dim::Fixed(1)
    };

    let output = TensorType::new(Shape::from_dims([seq, batch, features]), dtype);
    let state = TensorType::new(Shape::from_dims([batch, features]), dtype);
    let mut types = vec![ValueType::Tensor(output), ValueType::Tensor(state.clone())];
    if kind == CellKind::Lstm {
        types.push(ValueType::Tensor(state));
    }
    Ok(types)
}

struct RecurrentInputs {
    kind: CellKind,
    direction: Direction,
    output_sequence: bool,
    x: Tensor<f32>,
    weight: Vec<f32>,
    bias: Option<Vec<f32>>,
    peephole: Option<Vec<f32>>,
    initial_h: Vec<f32>,
    initial_c: Vec<f32>,
    recurrent_act: Activation,
    cell_act: Activation,
    act: Activation,
    clip: Option<f32>,
}

/// Run a recurrent op over the whole sequence.
///
/// Returns the outputs with shape `[seq or 1, batch, dirs * hidden]`, the
/// final hidden state and the final cell state (all zeros for ops without
/// one).
fn run_recurrent(
    inputs: &RecurrentInputs,
) -> Result<(Tensor<f32>, Tensor<f32>, Tensor<f32>), OpError> {
    let &[seq_len, batch, input_size] = inputs.x.shape() else {
        return Err(OpError::InvalidShape("x should be rank 3".to_string()));
    };
    let dirs = inputs.direction.num_directions();
    let gates = inputs.kind.gates();
    if batch == 0 || inputs.initial_h.len() % (batch * dirs) != 0 {
        return Err(OpError::InvalidShape(format!(
            "initial_h has {} elements, which does not match batch size {}",
            inputs.initial_h.len(),
            batch
        )));
    }
    let hidden = inputs.initial_h.len() / (batch * dirs);
    let cols = gates * dirs * hidden;
    if inputs.weight.len() != (input_size + hidden) * cols {
        return Err(OpError::InvalidShape(format!(
            "{} weight should have shape [{}, {}]",
            inputs.kind.op_name(),
            input_size + hidden,
            cols
        )));
    }
    if let Some(bias) = &inputs.bias {
        if bias.len() != 2 * cols {
            return Err(OpError::InvalidShape(format!(
                "bias should have shape [2, {}]",
                cols
            )));
        }
    }
    if let Some(peephole) = &inputs.peephole {
        if peephole.len() != 3 * hidden * dirs {
            return Err(OpError::InvalidShape(format!(
                "peephole should have {} elements",
                3 * hidden * dirs
            )));
        }
    }

    let x = inputs.x.to_vec();
    let features = dirs * hidden;
    let out_steps = if inputs.output_sequence { seq_len } else { 1 };
    let mut output = vec![0f32; out_steps * batch * features];
    let mut final_h = vec![0f32; batch * features];
    let mut final_c = vec![0f32; batch * features];

    // Pre-activations of the input and recurrent parts, per gate column.
    let mut x_pre = vec![0f32; gates * hidden];
    let mut h_pre = vec![0f32; gates * hidden];

    for dir in 0..dirs {
        let col_base = dir * gates * hidden;
        let column = |gate: usize, unit: usize| col_base + gate * hidden + unit;

        for b in 0..batch {
            let state_range = b * features + dir * hidden..b * features + (dir + 1) * hidden;
            let mut h = inputs.initial_h[state_range.clone()].to_vec();
            let mut c = if inputs.initial_c.is_empty() {
                vec![0.; hidden]
            } else {
                inputs.initial_c[state_range.clone()].to_vec()
            };

            for (step, t) in sequence_for_dir(inputs.direction, dir, seq_len).enumerate() {
                let x_t = &x[(t * batch + b) * input_size..(t * batch + b + 1) * input_size];
                for gate in 0..gates {
                    for unit in 0..hidden {
                        let col = column(gate, unit);
                        let (mut xs, mut hs) = (0., 0.);
                        for (k, &xv) in x_t.iter().enumerate() {
                            xs += xv * inputs.weight[k * cols + col];
                        }
                        for (k, &hv) in h.iter().enumerate() {
                            hs += hv * inputs.weight[(input_size + k) * cols + col];
                        }
                        if let Some(bias) = &inputs.bias {
                            xs += bias[col];
                            hs += bias[cols + col];
                        }
                        x_pre[gate * hidden + unit] = xs;
                        h_pre[gate * hidden + unit] = hs;
                    }
                }

                match inputs.kind {
                    CellKind::Rnn => {
                        for j in 0..hidden {
                            h[j] = (inputs.act)(x_pre[j] + h_pre[j]);
                        }
                    }
                    CellKind::Gru => {
                        // Gates z, r, o. The recurrent part of the output
                        // gate is scaled by the reset gate.
                        for j in 0..hidden {
                            let z = (inputs.recurrent_act)(x_pre[j] + h_pre[j]);
                            let r = (inputs.recurrent_act)(
                                x_pre[hidden + j] + h_pre[hidden + j],
                            );
                            let o = (inputs.act)(x_pre[2 * hidden + j] + r * h_pre[2 * hidden + j]);
                            h[j] = (1. - z) * o + z * h[j];
                        }
                    }
                    CellKind::Lstm => {
                        // Gates i, f, o, g.
                        let peep = |gate: usize, j: usize| {
                            inputs
                                .peephole
                                .as_ref()
                                .map(|p| p[dir * 3 * hidden + gate * hidden + j])
                                .unwrap_or(0.)
                        };
                        for j in 0..hidden {
                            let pre = |gate: usize| x_pre[gate * hidden + j] + h_pre[gate * hidden + j];
                            let i = (inputs.recurrent_act)(pre(0) + peep(0, j) * c[j]);
                            let f = (inputs.recurrent_act)(pre(1) + peep(1, j) * c[j]);
                            let g = (inputs.cell_act)(pre(3));
                            let mut cell = f * c[j] + i * g;
                            if let Some(clip) = inputs.clip {
                                cell = cell.clamp(-clip, clip);
                            }
                            let o = (inputs.recurrent_act)(pre(2) + peep(2, j) * cell);
                            c[j] = cell;
                            h[j] = o * (inputs.act)(cell);
                        }
                    }
                }

                let out_step = if inputs.output_sequence {
                    Some(step)
                } else if step + 1 == seq_len {
                    Some(0)
                } else {
                    None
                };
                if let Some(out_step) = out_step {
                    let base = (out_step * batch + b) * features + dir * hidden;
                    output[base..base + hidden].copy_from_slice(&h);
                }
            }

            final_h[state_range.clone()].copy_from_slice(&h);
            final_c[state_range].copy_from_slice(&c);
        }
    }

    Ok((
        Tensor::from_data(&[out_steps, batch, features], output),
        Tensor::from_data(&[batch, features], final_h),
        Tensor::from_data(&[batch, features], final_c),
    ))
}

fn eval_recurrent(ctx: &EvalContext, kind: CellKind) -> Result<Vec<Value>, OpError> {
    let str_param = |name: &str, default: &'static str| {
        if ctx.has(name) {
            ctx.str(name)
        } else {
            Ok(default)
        }
    };
    let inputs = RecurrentInputs {
        kind,
        direction: Direction::parse(ctx.str("direction")?)?,
        output_sequence: ctx.bool("output_sequence")?,
        x: ctx.float("x")?,
        weight: ctx.float("weight")?.to_vec(),
        bias: ctx.opt_float("bias")?.map(|b| b.to_vec()),
        peephole: ctx.opt_float("peephole")?.map(|p| p.to_vec()),
        initial_h: ctx.float("initial_h")?.to_vec(),
        initial_c: ctx.opt_float("initial_c")?.map(|c| c.to_vec()).unwrap_or_default(),
        recurrent_act: activation(str_param("recurrent_activation", "sigmoid")?)?,
        cell_act: activation(str_param("cell_activation", "tanh")?)?,
        act: activation(ctx.str("activation")?)?,
        clip: if ctx.has("clip") {
            Some(ctx.f32("clip")?)
        } else {
            None
        },
    };
    let (output, h, c) = run_recurrent(&inputs)?;
    let mut outputs = vec![Value::Float(output), Value::Float(h)];
    if kind == CellKind::Lstm {
        outputs.push(Value::Float(c));
    }
    Ok(outputs)
}

/// Simple (Elman) recurrent network: `h = act(x W + h U + b)`.
#[derive(Debug, Default)]
pub struct Rnn {}

impl OpDef for Rnn {
    fn name(&self) -> &'static str {
        "rnn"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("initial_h"),
        InputSpec::float("weight").constant(),
        InputSpec::float("bias").constant().optional(),
        InputSpec::string("direction").default(DefaultValue::Str("forward")),
        InputSpec::boolean("output_sequence")
            .constant()
            .default(DefaultValue::Bool(false)),
        InputSpec::string("activation").default(DefaultValue::Str("tanh")),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        activation(ctx.str("activation")?)?;
        infer_recurrent(ctx, CellKind::Rnn)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        eval_recurrent(ctx, CellKind::Rnn)
    }
}

/// Gated recurrent unit with gates `z, r, o`.
#[derive(Debug, Default)]
pub struct Gru {}

impl OpDef for Gru {
    fn name(&self) -> &'static str {
        "gru"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("initial_h"),
        InputSpec::float("weight").constant(),
        InputSpec::float("bias").constant().optional(),
        InputSpec::string("direction").default(DefaultValue::Str("forward")),
        InputSpec::boolean("output_sequence")
            .constant()
            .default(DefaultValue::Bool(false)),
        InputSpec::string("recurrent_activation").default(DefaultValue::Str("sigmoid")),
        InputSpec::string("activation").default(DefaultValue::Str("tanh")),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        activation(ctx.str("recurrent_activation")?)?;
        activation(ctx.str("activation")?)?;
        infer_recurrent(ctx, CellKind::Gru)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        eval_recurrent(ctx, CellKind::Gru)
    }
}

/// Long short-term memory with gates `i, f, o, g`, optional peepholes and
/// cell clipping.
#[derive(Debug, Default)]
pub struct Lstm {}

impl OpDef for Lstm {
    fn name(&self) -> &'static str {
        "lstm"
    }

    op_inputs!(
        InputSpec::float("x"),
        InputSpec::float("initial_h"),
        InputSpec::float("initial_c"),
        InputSpec::float("weight").constant(),
        InputSpec::float("bias").constant().optional(),
        InputSpec::float("peephole").constant().optional(),
        InputSpec::string("direction").default(DefaultValue::Str("forward")),
        InputSpec::boolean("output_sequence")
            .constant()
            .default(DefaultValue::Bool(false)),
        InputSpec::string("recurrent_activation").default(DefaultValue::Str("sigmoid")),
        InputSpec::string("cell_activation").default(DefaultValue::Str("tanh")),
        InputSpec::string("activation").default(DefaultValue::Str("tanh")),
        InputSpec::float("clip").constant().optional(),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        for param in ["recurrent_activation", "cell_activation", "activation"] {
            activation(ctx.str(param)?)?;
        }
        if let Some(peephole) = ctx.opt_tensor("peephole")? {
            check_rank(peephole, "peephole", 1)?;
        }
        infer_recurrent(ctx, CellKind::Lstm)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        eval_recurrent(ctx, CellKind::Lstm)
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::prelude::*;
    use rten_tensor::Tensor;

    use super::{activation, run_recurrent, CellKind, Direction, RecurrentInputs};
    use crate::builder::Builder;
    use crate::graph::Program;
    use crate::types::{tensor_type, DType};

    fn inputs(kind: CellKind, direction: Direction, weight: Vec<f32>) -> RecurrentInputs {
        let dirs = direction.num_directions();
        RecurrentInputs {
            kind,
            direction,
            output_sequence: true,
            // Sequence of 3 steps, batch 1, input size 1.
            x: Tensor::from_data(&[3, 1, 1], vec![1., 2., 3.]),
            weight,
            bias: None,
            peephole: None,
            initial_h: vec![0.; dirs],
            initial_c: vec![0.; dirs],
            recurrent_act: activation("sigmoid").unwrap(),
            cell_act: activation("tanh").unwrap(),
            act: activation("linear").unwrap(),
            clip: None,
        }
    }

    #[test]
    fn test_rnn_accumulates() {
        // With a linear activation and unit weights, h is a running sum.
        let (output, h, _) =
            run_recurrent(&inputs(CellKind::Rnn, Direction::Forward, vec![1., 1.])).unwrap();
        assert_eq!(output.shape(), &[3, 1, 1]);
        assert_eq!(output.to_vec(), &[1., 3., 6.]);
        assert_eq!(h.to_vec(), &[6.]);

        let (output, h, _) =
            run_recurrent(&inputs(CellKind::Rnn, Direction::Reverse, vec![1., 1.])).unwrap();
        assert_eq!(output.to_vec(), &[3., 5., 6.]);
        assert_eq!(h.to_vec(), &[6.]);
    }

    #[test]
    fn test_rnn_bidirectional() {
        // Columns are the forward then the backward direction.
        let weight = vec![1., 1., 1., 1.];
        let mut inputs = inputs(CellKind::Rnn, Direction::Bidirectional, weight);
        inputs.output_sequence = false;
        let (output, h, _) = run_recurrent(&inputs).unwrap();
        assert_eq!(output.shape(), &[1, 1, 2]);
        assert_eq!(output.to_vec(), &[6., 6.]);
        assert_eq!(h.to_vec(), &[6., 6.]);
    }

    #[test]
    fn test_lstm_clip_and_gru_zero_update() {
        // Large weights saturate the gates so that c grows by 1 per step
        // until clipped.
        let weight = vec![100., 100., 100., 100., 0., 0., 0., 0.];
        let mut lstm = inputs(CellKind::Lstm, Direction::Forward, weight);
        lstm.clip = Some(1.5);
        let (output, h, c) = run_recurrent(&lstm).unwrap();
        assert_eq!(c.to_vec(), &[1.5]);
        assert_eq!(h.to_vec(), output.to_vec()[2..].to_vec());
        assert!((h.to_vec()[0] - 1.5).abs() < 1e-5);

        // With z saturated at 1 the GRU keeps its initial state.
        let weight = vec![100., 0., 0., 0., 0., 0.];
        let (output, _, _) =
            run_recurrent(&inputs(CellKind::Gru, Direction::Forward, weight)).unwrap();
        assert_eq!(output.to_vec(), &[0., 0., 0.]);
    }

    #[test]
    fn test_lstm_shape_inference() {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut shapes = Vec::new();
        mb.function(
            "main",
            [
                ("x", tensor_type([7, 2, 5], DType::Fp32)),
                ("h", tensor_type([2, 8], DType::Fp32)),
                ("c", tensor_type([2, 8], DType::Fp32)),
            ],
            |mb, inputs| {
                let outputs = mb
                    .op("lstm")
                    .arg("x", inputs[0])
                    .arg("initial_h", inputs[1])
                    .arg("initial_c", inputs[2])
                    .arg("weight", Tensor::<f32>::zeros(&[9, 32]))
                    .arg("direction", "bidirectional")
                    .arg("output_sequence", true)
                    .build()?;
                for out in &outputs {
                    shapes.push(mb.ty(*out).as_tensor().unwrap().shape.to_fixed());
                }
                Ok(outputs)
            },
        )
        .unwrap();
        assert_eq!(
            shapes,
            [Some(vec![7, 2, 8]), Some(vec![2, 8]), Some(vec![2, 8])]
        );
    }
}
