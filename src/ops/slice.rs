//! Operators which select a strided or reordered subset of a tensor.

use mil_shape::{Dim, Shape};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    resolve_axis, single_output, DefaultValue, EvalContext, InferContext, InputSpec,
    IntoOpResult, OpDef, OpError,
};
use crate::ops::{op_inputs, ranked_dims, remap, strides};
use crate::types::ValueType;
use crate::value::{map_tensor, Value};

/// Read a boolean vector parameter, if present.
fn opt_bools(value: Option<&Value>) -> Result<Option<Vec<bool>>, OpError> {
    Ok(value.map(|v| v.to_bool_vec()).transpose()?)
}

/// Per-dim parameters of `slice_by_index`.
struct SliceSpec {
    begin: Vec<i32>,
    end: Vec<i32>,
    stride: Vec<i32>,
    begin_mask: Vec<bool>,
    end_mask: Vec<bool>,
    squeeze_mask: Vec<bool>,
}

impl SliceSpec {
    fn new(
        rank: usize,
        begin: Vec<i32>,
        end: Vec<i32>,
        stride: Option<Vec<i32>>,
        begin_mask: Option<Vec<bool>>,
        end_mask: Option<Vec<bool>>,
        squeeze_mask: Option<Vec<bool>>,
    ) -> Result<SliceSpec, OpError> {
        let stride = stride.unwrap_or_else(|| vec![1; rank]);
        let begin_mask = begin_mask.unwrap_or_else(|| vec![false; rank]);
        let end_mask = end_mask.unwrap_or_else(|| vec![false; rank]);
        let squeeze_mask = squeeze_mask.unwrap_or_else(|| vec![false; rank]);

        for (name, len) in [
            ("begin", begin.len()),
            ("end", end.len()),
            ("stride", stride.len()),
            ("begin_mask", begin_mask.len()),
            ("end_mask", end_mask.len()),
            ("squeeze_mask", squeeze_mask.len()),
        ] {
            if len != rank {
                return Err(OpError::InvalidShape(format!(
                    "{} should have length {} but has length {}",
                    name, rank, len
                )));
            }
        }
        if stride.contains(&0) {
            return Err(OpError::InvalidValue("stride must be non-zero".into()));
        }

        Ok(SliceSpec {
            begin,
            end,
            stride,
            begin_mask,
            end_mask,
            squeeze_mask,
        })
    }

    /// Indices selected along dim `d` of size `size`, following Python's
    /// extended slicing rules.
    fn indices(&self, d: usize, size: usize) -> Result<Vec<usize>, OpError> {
        let n = size as i64;
        let step = self.stride[d] as i64;

        if self.squeeze_mask[d] {
            let mut index = self.begin[d] as i64;
            if index < 0 {
                index += n;
            }
            if index < 0 || index >= n {
                return Err(OpError::InvalidValue(format!(
                    "index {} is out of bounds for axis {} with size {}",
                    self.begin[d], d, size
                )));
            }
            return Ok(vec![index as usize]);
        }

        let clamp = |value: i64| {
            let value = if value < 0 { value + n } else { value };
            if step > 0 {
                value.clamp(0, n)
            } else {
                value.clamp(-1, n - 1)
            }
        };
        let start = match (self.begin_mask[d], step > 0) {
            (true, true) => 0,
            (true, false) => n - 1,
            (false, _) => clamp(self.begin[d] as i64),
        };
        let end = match (self.end_mask[d], step > 0) {
            (true, true) => n,
            (true, false) => -1,
            (false, _) => clamp(self.end[d] as i64),
        };

        let mut indices = Vec::new();
        let mut i = start;
        while (step > 0 && i < end) || (step < 0 && i > end) {
            indices.push(i as usize);
            i += step;
        }
        Ok(indices)
    }

    /// Return true if dim `d` is selected whole, in order.
    fn is_full(&self, d: usize) -> bool {
        self.begin_mask[d] && self.end_mask[d] && self.stride[d] == 1 && !self.squeeze_mask[d]
    }
}

/// Select elements using the cartesian product of per-dim index lists.
fn select<T: Clone>(t: &Tensor<T>, indices: &[Vec<usize>]) -> Tensor<T> {
    let out_shape: Vec<usize> = indices.iter().map(|idx| idx.len()).collect();
    let in_strides = strides(t.shape());
    remap(t, &out_shape, |index| {
        index
            .iter()
            .enumerate()
            .map(|(d, &i)| indices[d][i] * in_strides[d])
            .sum()
    })
}

/// NumPy extended slicing, `x[begin:end:stride]` for each dim.
///
/// `begin_mask[i]` and `end_mask[i]` ignore the corresponding bound and use
/// the start or end of the dim. `squeeze_mask[i]` selects the single index
/// `begin[i]` and removes the dim.
#[derive(Debug, Default)]
pub struct SliceByIndex {}

impl OpDef for SliceByIndex {
    fn name(&self) -> &'static str {
        "slice_by_index"
    }

    op_inputs!(
        InputSpec::new("x"),
        InputSpec::int("begin"),
        InputSpec::int("end"),
        InputSpec::int("stride").optional(),
        InputSpec::boolean("begin_mask").constant().optional(),
        InputSpec::boolean("end_mask").constant().optional(),
        InputSpec::boolean("squeeze_mask").constant().optional(),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let dims = ranked_dims(&x.shape, "x")?;
        let rank = dims.len();
        let squeeze_mask =
            opt_bools(ctx.value("squeeze_mask"))?.unwrap_or_else(|| vec![false; rank]);
        if squeeze_mask.len() != rank {
            return Err(OpError::InvalidShape(format!(
                "squeeze_mask should have length {} but has length {}",
                rank,
                squeeze_mask.len()
            )));
        }

        let (Some(begin), Some(end)) = (ctx.value("begin"), ctx.value("end")) else {
            let out_rank = squeeze_mask.iter().filter(|&&s| !s).count();
            return single_output(Shape::symbolic(out_rank), x.dtype);
        };
        let stride = if ctx.has("stride") {
            match ctx.value("stride") {
                Some(stride) => Some(stride.to_i32_vec()?),
                None => {
                    let out_rank = squeeze_mask.iter().filter(|&&s| !s).count();
                    return single_output(Shape::symbolic(out_rank), x.dtype);
                }
            }
        } else {
            None
        };
        let spec = SliceSpec::new(
            rank,
            begin.to_i32_vec()?,
            end.to_i32_vec()?,
            stride,
            opt_bools(ctx.value("begin_mask"))?,
            opt_bools(ctx.value("end_mask"))?,
            Some(squeeze_mask),
        )?;

        let mut out_dims = Vec::with_capacity(rank);
        for (d, &dim) in dims.iter().enumerate() {
            match dim {
                Dim::Fixed(size) => {
                    let len = spec.indices(d, size)?.len();
                    if !spec.squeeze_mask[d] {
                        out_dims.push(Dim::Fixed(len));
                    }
                }
                Dim::Symbol(_) if spec.squeeze_mask[d] => {}
                Dim::Symbol(_) if spec.is_full(d) => out_dims.push(dim),
                Dim::Symbol(_) => out_dims.push(Dim::new_symbol()),
            }
        }
        single_output(Shape::from_dims(out_dims), x.dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let shape = x.shape();
        let spec = SliceSpec::new(
            shape.len(),
            ctx.i32s("begin")?,
            ctx.i32s("end")?,
            ctx.opt_i32s("stride")?,
            opt_bools(ctx.opt("begin_mask"))?,
            opt_bools(ctx.opt("end_mask"))?,
            opt_bools(ctx.opt("squeeze_mask"))?,
        )?;
        let indices = shape
            .iter()
            .enumerate()
            .map(|(d, &size)| spec.indices(d, size))
            .collect::<Result<Vec<_>, _>>()?;
        let out_shape: Vec<usize> = indices
            .iter()
            .zip(&spec.squeeze_mask)
            .filter(|(_, &squeeze)| !squeeze)
            .map(|(idx, _)| idx.len())
            .collect();

        let sliced = map_tensor!(x, t => select(t, &indices));
        let out = map_tensor!(&sliced, t => Tensor::from_data(out_shape.as_slice(), t.to_vec()));
        out.into_op_result()
    }
}

/// Resolve the start and length along each dim for `slice_by_size`.
fn size_ranges(shape: &[usize], begin: &[i32], size: &[i32]) -> Result<Vec<(usize, usize)>, OpError> {
    if begin.len() != shape.len() || size.len() != shape.len() {
        return Err(OpError::InvalidShape(format!(
            "begin and size should have length {}",
            shape.len()
        )));
    }
    shape
        .iter()
        .zip(begin.iter().zip(size))
        .enumerate()
        .map(|(d, (&n, (&b, &s)))| {
            let start = if b < 0 { b + n as i32 } else { b };
            if start < 0 || start as usize > n {
                return Err(OpError::InvalidValue(format!(
                    "begin {} is out of bounds for axis {} with size {}",
                    b, d, n
                )));
            }
            let start = start as usize;
            let len = if s == -1 {
                n - start
            } else if s < 0 || start + s as usize > n {
                return Err(OpError::InvalidValue(format!(
                    "size {} at begin {} exceeds axis {} with size {}",
                    s, start, d, n
                )));
            } else {
                s as usize
            };
            Ok((start, len))
        })
        .collect()
}

/// Slice `size[i]` elements starting at `begin[i]` along each dim. A size
/// of -1 extends to the end of the dim.
#[derive(Debug, Default)]
pub struct SliceBySize {}

impl OpDef for SliceBySize {
    fn name(&self) -> &'static str {
        "slice_by_size"
    }

    op_inputs!(
        InputSpec::new("x"),
        InputSpec::int("begin"),
        InputSpec::int("size"),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let dims = ranked_dims(&x.shape, "x")?;
        let Some(size) = ctx.value("size") else {
            return single_output(Shape::symbolic(dims.len()), x.dtype);
        };
        let size = size.to_i32_vec()?;
        if size.len() != dims.len() {
            return Err(OpError::InvalidShape(format!(
                "size should have length {}",
                dims.len()
            )));
        }
        let begin = ctx.value("begin").map(|v| v.to_i32_vec()).transpose()?;
        let out_dims = dims.iter().enumerate().map(|(d, &dim)| match (size[d], dim) {
            (-1, Dim::Fixed(n)) => match &begin {
                Some(begin) => {
                    let b = begin[d];
                    let start = if b < 0 { b + n as i32 } else { b };
                    Dim::Fixed(n.saturating_sub(start.max(0) as usize))
                }
                None => Dim::new_symbol(),
            },
            (-1, _) => Dim::new_symbol(),
            (s, _) => Dim::Fixed(s.max(0) as usize),
        });
        single_output(Shape::from_dims(out_dims), x.dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let ranges = size_ranges(&x.shape(), &ctx.i32s("begin")?, &ctx.i32s("size")?)?;
        map_tensor!(x, t => {
            let mut view = t.view();
            for (d, &(start, len)) in ranges.iter().enumerate() {
                view = view.slice_axis(d, start..start + len);
            }
            view.to_tensor()
        })
        .into_op_result()
    }
}

/// Reverse the order of elements along the given axes, or all axes.
#[derive(Debug, Default)]
pub struct Reverse {}

impl OpDef for Reverse {
    fn name(&self) -> &'static str {
        "reverse"
    }

    op_inputs!(
        InputSpec::new("x"),
        InputSpec::int("axes").constant().optional(),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        if let (Some(rank), Some(axes)) = (x.rank(), ctx.opt_i32s("axes")?) {
            for axis in axes {
                resolve_axis(rank, axis, "axes")?;
            }
        }
        Ok(vec![ValueType::Tensor(x.clone())])
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let shape = x.shape();
        let axes = match ctx.opt_i32s("axes")? {
            Some(axes) => axes
                .into_iter()
                .map(|axis| resolve_axis(shape.len(), axis, "axes"))
                .collect::<Result<Vec<_>, _>>()?,
            None => (0..shape.len()).collect(),
        };
        let in_strides = strides(&shape);
        map_tensor!(x, t => remap(t, &shape, |index| {
            index
                .iter()
                .enumerate()
                .map(|(d, &i)| {
                    let i = if axes.contains(&d) { shape[d] - 1 - i } else { i };
                    i * in_strides[d]
                })
                .sum()
        }))
        .into_op_result()
    }
}

/// Reverse the first `lengths[b]` entries along `seq_axis` for each batch
/// entry `b` along `batch_axis`.
#[derive(Debug, Default)]
pub struct ReverseSequence {}

impl OpDef for ReverseSequence {
    fn name(&self) -> &'static str {
        "reverse_sequence"
    }

    op_inputs!(
        InputSpec::new("x"),
        InputSpec::int("lengths"),
        InputSpec::int("seq_axis")
            .constant()
            .default(DefaultValue::I32(0)),
        InputSpec::int("batch_axis")
            .constant()
            .default(DefaultValue::I32(0)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        if let Some(rank) = x.rank() {
            resolve_axis(rank, ctx.i32("seq_axis")?, "seq_axis")?;
            resolve_axis(rank, ctx.i32("batch_axis")?, "batch_axis")?;
        }
        Ok(vec![ValueType::Tensor(x.clone())])
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let shape = x.shape();
        let seq_axis = resolve_axis(shape.len(), ctx.i32("seq_axis")?, "seq_axis")?;
        let batch_axis = resolve_axis(shape.len(), ctx.i32("batch_axis")?, "batch_axis")?;
        let lengths = ctx.i32s("lengths")?;
        if lengths.len() != shape[batch_axis] {
            return Err(OpError::InvalidShape(format!(
                "lengths has {} entries but the batch dim has size {}",
                lengths.len(),
                shape[batch_axis]
            )));
        }
        if let Some(len) = lengths
            .iter()
            .find(|&&len| len < 0 || len as usize > shape[seq_axis])
        {
            return Err(OpError::InvalidValue(format!(
                "length {} is out of bounds for the sequence dim with size {}",
                len, shape[seq_axis]
            )));
        }

        let in_strides = strides(&shape);
        map_tensor!(x, t => remap(t, &shape, |index| {
            let len = lengths[index[batch_axis]] as usize;
            index
                .iter()
                .enumerate()
                .map(|(d, &i)| {
                    let i = if d == seq_axis && i < len { len - 1 - i } else { i };
                    i * in_strides[d]
                })
                .sum()
        }))
        .into_op_result()
    }
}

/// Validated parameters of `sliding_windows`.
struct Windows {
    axis: usize,
    size: usize,
    stride: usize,
}

impl Windows {
    fn new(rank: usize, axis: i32, size: i32, stride: i32) -> Result<Windows, OpError> {
        let axis = resolve_axis(rank, axis, "axis")?;
        if size < 1 || stride < 1 {
            return Err(OpError::InvalidValue(format!(
                "size and stride should be positive but got {} and {}",
                size, stride
            )));
        }
        Ok(Windows {
            axis,
            size: size as usize,
            stride: stride as usize,
        })
    }

    fn count(&self, len: usize) -> Result<usize, OpError> {
        if self.size > len {
            return Err(OpError::InvalidShape(format!(
                "window size {} exceeds axis {} with size {}",
                self.size, self.axis, len
            )));
        }
        Ok((len - self.size) / self.stride + 1)
    }
}

/// Extract windows of `size` elements along `axis`, stepping by `stride`.
///
/// The windowed dim is replaced by the number of windows, followed by a new
/// dim of `size`.
#[derive(Debug, Default)]
pub struct SlidingWindows {}

impl OpDef for SlidingWindows {
    fn name(&self) -> &'static str {
        "sliding_windows"
    }

    op_inputs!(
        InputSpec::new("x"),
        InputSpec::int("axis").constant(),
        InputSpec::int("size").constant(),
        InputSpec::int("stride").constant().default(DefaultValue::I32(1)),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let x = ctx.tensor("x")?;
        let dims = ranked_dims(&x.shape, "x")?;
        let windows = Windows::new(
            dims.len(),
            ctx.i32("axis")?,
            ctx.i32("size")?,
            ctx.i32("stride")?,
        )?;
        let mut out_dims = dims.to_vec();
        out_dims[windows.axis] = match dims[windows.axis] {
            Dim::Fixed(len) => Dim::Fixed(windows.count(len)?),
            Dim::Symbol(_) => Dim::new_symbol(),
        };
        out_dims.insert(windows.axis + 1, Dim::Fixed(windows.size));
        single_output(Shape::from_dims(out_dims), x.dtype)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let x = ctx.value("x")?;
        let shape = x.shape();
        let windows = Windows::new(
            shape.len(),
            ctx.i32("axis")?,
            ctx.i32("size")?,
            ctx.i32("stride")?,
        )?;
        let axis = windows.axis;
        let mut out_shape = shape.clone();
        out_shape[axis] = windows.count(shape[axis])?;
        out_shape.insert(axis + 1, windows.size);

        let in_strides = strides(&shape);
        map_tensor!(x, t => remap(t, &out_shape, |index| {
            let mut offset = 0;
            for d in 0..shape.len() {
                let i = match d.cmp(&axis) {
                    std::cmp::Ordering::Less => index[d],
                    std::cmp::Ordering::Equal => index[d] * windows.stride + index[d + 1],
                    std::cmp::Ordering::Greater => index[d + 1],
                };
                offset += i * in_strides[d];
            }
            offset
        }))
        .into_op_result()
    }
}
