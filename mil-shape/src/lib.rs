//! Symbolic shapes for the MIL operator IR.
//!
//! Values in a program being built may have dimensions whose sizes are only
//! known when the program runs, such as the batch size or sequence length.
//! These are represented by [`Symbol`]s, which are allocated by
//! [`new_symbol`]. A [`Shape`] is either a list of [`Dim`]s, each of which is
//! a fixed size or a symbol, or an unknown-rank shape identified by a
//! [`VariadicSymbol`].
//!
//! The [`InferShapes`] trait and its implementations describe how operators
//! with common shape rules (elementwise, broadcasting, reductions) transform
//! the shapes of their inputs.

mod dim;
mod infer_shapes;
mod sym_gen;

pub use dim::{Dim, Dims, Shape, Symbol, VariadicSymbol};
pub use infer_shapes::{
    broadcast_shapes, broadcast_sizes, resolve_axes, resolve_axis, BinaryOp, InferShapes,
    InferShapesError, ReductionOp, UnaryOp,
};
pub use sym_gen::{new_symbol, new_variadic_symbol};
