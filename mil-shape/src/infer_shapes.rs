//! Traits for shape inference and common implementations.

use std::error::Error;
use std::fmt;
use std::iter::repeat_n;

use smallvec::SmallVec;

use crate::dim::{Dim, Dims, Shape};

#[derive(Clone, Debug, PartialEq)]
pub enum InferShapesError {
    /// Too many or too few inputs were provided for this operator.
    IncorrectInputCount { expected: usize, actual: usize },

    /// The input shapes cannot be broadcast together.
    IncompatibleShapes { lhs: Shape, rhs: Shape },

    /// An input's rank does not match that expected by the operator.
    IncorrectRank { expected: usize, actual: usize },

    /// An axis is outside the range `[-rank, rank - 1]`.
    AxisOutOfRange { axis: i64, rank: usize },
}

impl fmt::Display for InferShapesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncorrectInputCount { expected, actual } => {
                write!(f, "expected {} inputs but got {}", expected, actual)
            }
            Self::IncompatibleShapes { lhs, rhs } => {
                write!(f, "shapes {} and {} cannot be broadcast", lhs, rhs)
            }
            Self::IncorrectRank { expected, actual } => {
                write!(f, "expected input of rank {} but got rank {}", expected, actual)
            }
            Self::AxisOutOfRange { axis, rank } => {
                write!(f, "axis {} out of bound for rank {}", axis, rank)
            }
        }
    }
}

impl Error for InferShapesError {}

/// Resolve an axis given as a value in `[-rank, rank - 1]` to an index in
/// `[0, rank - 1]`.
pub fn resolve_axis(rank: usize, axis: i64) -> Result<usize, InferShapesError> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    if resolved < 0 || resolved >= rank as i64 {
        return Err(InferShapesError::AxisOutOfRange { axis, rank });
    }
    Ok(resolved as usize)
}

/// Resolve a list of possibly negative axes against `rank`.
pub fn resolve_axes<'a, I: Iterator<Item = &'a i32>>(
    rank: usize,
    axes: I,
) -> Result<SmallVec<[usize; 4]>, InferShapesError> {
    axes.map(|&axis| resolve_axis(rank, axis as i64)).collect()
}

/// Broadcast two symbolic shapes following NumPy rules.
///
/// A symbolic dimension paired with a fixed size other than 1 resolves to
/// the fixed size, since execution can only succeed if they are equal. Two
/// different symbols are matched by position and the left-hand symbol is
/// kept.
pub fn broadcast_shapes(a: &Shape, b: &Shape) -> Result<Shape, InferShapesError> {
    let (Some(a_dims), Some(b_dims)) = (a.dims(), b.dims()) else {
        return Ok(match a {
            Shape::Unranked(_) => a.clone(),
            Shape::Ranked(_) => b.clone(),
        });
    };

    let a_pad = b_dims.len().saturating_sub(a_dims.len());
    let b_pad = a_dims.len().saturating_sub(b_dims.len());
    let a_iter = repeat_n(Dim::Fixed(1), a_pad).chain(a_dims.iter().copied());
    let b_iter = repeat_n(Dim::Fixed(1), b_pad).chain(b_dims.iter().copied());

    let mut out_dims = Dims::with_capacity(a_pad + a_dims.len());
    for (a_dim, b_dim) in a_iter.zip(b_iter) {
        let dim = match (a_dim, b_dim) {
            (x, y) if x == y => x,
            (Dim::Fixed(1), y) => y,
            (x, Dim::Fixed(1)) => x,
            (Dim::Fixed(_), Dim::Fixed(_)) => {
                return Err(InferShapesError::IncompatibleShapes {
                    lhs: a.clone(),
                    rhs: b.clone(),
                });
            }
            (Dim::Symbol(_), y @ Dim::Fixed(_)) => y,
            (x @ Dim::Fixed(_), Dim::Symbol(_)) => x,
            (x @ Dim::Symbol(_), Dim::Symbol(_)) => x,
        };
        out_dims.push(dim);
    }

    Ok(Shape::Ranked(out_dims))
}

/// Broadcast two concrete shapes following NumPy rules, or return `None` if
/// they are incompatible.
pub fn broadcast_sizes(a: &[usize], b: &[usize]) -> Option<SmallVec<[usize; 4]>> {
    let a_pad = b.len().saturating_sub(a.len());
    let b_pad = a.len().saturating_sub(b.len());
    let a_iter = repeat_n(1, a_pad).chain(a.iter().copied());
    let b_iter = repeat_n(1, b_pad).chain(b.iter().copied());

    let mut result = SmallVec::with_capacity(a.len().max(b.len()));
    for (a, b) in a_iter.zip(b_iter) {
        if a == b || b == 1 {
            result.push(a);
        } else if a == 1 {
            result.push(b);
        } else {
            return None;
        }
    }
    Some(result)
}

/// Infer the shapes of an operator's outputs given the shapes of its inputs.
pub trait InferShapes {
    fn infer_shapes(&self, inputs: &[&Shape]) -> Result<Vec<Shape>, InferShapesError>;
}

/// Shape inference for operators whose output has the shape of their first
/// input.
pub struct UnaryOp;

impl InferShapes for UnaryOp {
    fn infer_shapes(&self, inputs: &[&Shape]) -> Result<Vec<Shape>, InferShapesError> {
        let Some(data) = inputs.first() else {
            return Err(InferShapesError::IncorrectInputCount {
                expected: 1,
                actual: 0,
            });
        };
        Ok([(*data).clone()].into())
    }
}

/// Shape inference for elementwise operators with two broadcast inputs.
pub struct BinaryOp;

impl InferShapes for BinaryOp {
    fn infer_shapes(&self, inputs: &[&Shape]) -> Result<Vec<Shape>, InferShapesError> {
        let [a, b] = inputs else {
            return Err(InferShapesError::IncorrectInputCount {
                expected: 2,
                actual: inputs.len(),
            });
        };
        Ok([broadcast_shapes(a, b)?].into())
    }
}

/// Shape inference for reduction operators.
#[derive(Clone, Debug, PartialEq)]
pub struct ReductionOp<'a> {
    /// Axes to reduce over, or `None` to reduce over all axes.
    pub axes: Option<&'a [i32]>,

    /// True if reduced dimensions are kept with size 1.
    pub keep_dims: bool,
}

impl InferShapes for ReductionOp<'_> {
    fn infer_shapes(&self, inputs: &[&Shape]) -> Result<Vec<Shape>, InferShapesError> {
        let Some(data) = inputs.first() else {
            return Err(InferShapesError::IncorrectInputCount {
                expected: 1,
                actual: 0,
            });
        };

        let Some(dims) = data.dims() else {
            return Ok([Shape::unranked()].into());
        };

        let rank = dims.len();
        let mut axes: SmallVec<[usize; 4]> = match self.axes {
            Some(axes) => resolve_axes(rank, axes.iter())?,
            None => (0..rank).collect(),
        };
        axes.sort();
        axes.dedup();

        let mut out_dims = Dims::new();
        for (i, dim) in dims.iter().enumerate() {
            if !axes.contains(&i) {
                out_dims.push(*dim);
            } else if self.keep_dims {
                out_dims.push(Dim::Fixed(1));
            }
        }

        Ok([Shape::Ranked(out_dims)].into())
    }
}
