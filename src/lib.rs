//! mil-ir is a typed operator IR for machine learning programs.
//!
//! Programs are built from a catalogue of tensor operators with symbolic
//! shapes. Each operation's output types are inferred as it is added, and
//! operations whose inputs are all known are evaluated immediately
//! (constant folding). Finished programs can be optimized with graph passes
//! and lowered to one of two backend layer formats.
//!
//! # Building programs
//!
//! The basic workflow is:
//!
//! 1. Create a [`Program`] and a [`Builder`] for it.
//! 2. Add a function with [`Builder::function`], declaring the types of its
//!    inputs. Symbolic dimensions are created with
//!    [`Dim::new_symbol`](mil_shape::Dim::new_symbol).
//! 3. Add operations with [`Builder::op`] and return the function's outputs
//!    from the callback.
//! 4. Optionally run the [`passes::PassManager`] pipeline.
//! 5. Lower the program with [`lower::lower_program`] and serialize the
//!    resulting [`lower::BackendSpec`].
//!
//! ```
//! use mil_ir::{tensor_type, Builder, DType, Program};
//!
//! let mut program = Program::new();
//! let mut mb = Builder::new(&mut program);
//! mb.function("main", [("x", tensor_type([2, 3], DType::Fp32))], |mb, x| {
//!     let y = mb.op("relu").arg("x", x[0]).build1()?;
//!     let z = mb.op("reduce_sum").arg("x", y).arg("axes", [1]).build1()?;
//!     Ok(vec![z])
//! })
//! .unwrap();
//! println!("{}", program);
//! ```
//!
//! # Operators
//!
//! Operators are looked up by name in an [`OpRegistry`]. The global
//! registry contains the full catalogue. Some operators are only available
//! if certain crate features are enabled:
//!
//! - The `random` feature enables operators that generate random numbers
//!   (eg. `random_uniform`).
//!
//! # Configuration
//!
//! Defaults for [`BuilderOptions`] and [`lower::LowerOptions`] can be set
//! with environment variables. See the [`env`] module.
//!
//! # Logging
//!
//! Passes, lowering and folding emit [tracing](https://docs.rs/tracing)
//! events. Install a subscriber to see them.

pub mod builder;
pub mod env;
pub mod graph;
pub mod harness;
pub mod lower;
mod op_registry;
pub mod operator;
pub mod ops;
pub mod passes;
pub mod types;
pub mod value;

pub use builder::{Arg, Builder, BuilderOptions, OpBuilder};
pub use graph::{BuildError, DotGraph, FunctionId, OpId, Program, VarId};
pub use harness::{run_compare_builder, CompareOptions, ExpectedDim, ExpectedType, HarnessError};
pub use lower::{lower_program, Backend, LowerError, LowerOptions};
pub use op_registry::OpRegistry;
pub use operator::{ErrorKind, OpDef, OpError};
pub use types::{tensor_type, DType, ListType, TensorType, ValueType};
pub use value::{ListValue, Value};

pub use mil_shape::{Dim, Shape};
