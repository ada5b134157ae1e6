//! Build, lower, run and check a program in one call.
//!
//! [`run_compare_builder`] is the entry point for operator tests. It checks
//! the types inferred when building against expectations, then lowers the
//! program for a backend, runs it with the reference executor and compares
//! the results against expected values.

use std::error::Error;
use std::fmt::{Display, Formatter};

use mil_shape::{Dim, Shape};
use rten_tensor::prelude::*;
use tracing::debug;

use crate::builder::Builder;
use crate::graph::{BuildError, Program, VarId};
use crate::lower::{execute, lower_program, Backend, ExecError, LowerError, LowerOptions};
use crate::operator::ErrorKind;
use crate::types::{DType, ValueType};
use crate::value::Value;

/// Expected size of an output dimension.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ExpectedDim {
    Fixed(usize),

    /// Matches any size, including a symbol.
    Any,
}

impl From<usize> for ExpectedDim {
    fn from(size: usize) -> ExpectedDim {
        ExpectedDim::Fixed(size)
    }
}

impl Display for ExpectedDim {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Self::Fixed(size) => write!(f, "{}", size),
            Self::Any => write!(f, "*"),
        }
    }
}

/// Expected type of a function output.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpectedType {
    pub shape: Vec<ExpectedDim>,
    pub dtype: DType,
}

impl ExpectedType {
    pub fn new<D: Into<ExpectedDim>>(shape: impl IntoIterator<Item = D>, dtype: DType) -> Self {
        ExpectedType {
            shape: shape.into_iter().map(|dim| dim.into()).collect(),
            dtype,
        }
    }

    /// Return true if `shape` has the expected rank and every fixed dim has
    /// the expected size. Symbolic dims match any expected size. An unranked
    /// shape only matches if the expected shape is non-scalar and every
    /// expected dim is [`ExpectedDim::Any`].
    fn matches_shape(&self, shape: &Shape) -> bool {
        let Some(dims) = shape.dims() else {
            return !self.shape.is_empty()
                && self.shape.iter().all(|dim| *dim == ExpectedDim::Any);
        };
        dims.len() == self.shape.len()
            && dims.iter().zip(&self.shape).all(|(dim, expected)| match (dim, expected) {
                (_, ExpectedDim::Any) | (Dim::Symbol(_), _) => true,
                (Dim::Fixed(size), ExpectedDim::Fixed(expected)) => size == expected,
            })
    }

    /// Check a tensor type, or the element type of a list.
    pub fn matches(&self, ty: &ValueType) -> bool {
        let tensor = match ty {
            ValueType::Tensor(tensor) => tensor,
            ValueType::List(list) => &list.elem,
        };
        tensor.dtype == self.dtype && self.matches_shape(&tensor.shape)
    }
}

impl Display for ExpectedType {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "tensor<[")?;
        for (i, dim) in self.shape.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", dim)?;
        }
        write!(f, "], {}>", self.dtype)
    }
}

/// Options for [`run_compare_builder`].
#[derive(Clone, Debug)]
pub struct CompareOptions {
    /// Absolute tolerance for float outputs.
    pub atol: f32,

    /// Relative tolerance for float outputs.
    pub rtol: f32,

    pub backend: Backend,

    /// Only check output types. The program is not lowered or run.
    pub frontend_only: bool,
}

impl Default for CompareOptions {
    fn default() -> CompareOptions {
        CompareOptions {
            atol: 1e-4,
            rtol: 1e-5,
            backend: Backend::MilProto,
            frontend_only: false,
        }
    }
}

/// Errors reported by [`run_compare_builder`].
#[derive(Clone, Debug, PartialEq)]
pub enum HarnessError {
    Build(BuildError),
    Lower(LowerError),
    Exec(ExecError),

    /// The function has a different number of outputs than expected.
    OutputCount { expected: usize, actual: usize },

    /// An output's inferred type does not match the expected type.
    TypeMismatch {
        output: usize,
        expected: String,
        actual: String,
    },

    /// An output's value does not match the expected value.
    ValueMismatch { output: usize, reason: String },
}

impl HarnessError {
    /// Return the general category of error. Operations a backend cannot
    /// lower report [`ErrorKind::UnsupportedOnBackend`], so callers can skip
    /// rather than fail.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Build(err) => err.kind(),
            Self::Lower(err) => err.kind(),
            Self::Exec(err) => err.kind(),
            Self::OutputCount { .. } | Self::TypeMismatch { .. } | Self::ValueMismatch { .. } => {
                ErrorKind::Mismatch
            }
        }
    }

    pub fn is_unsupported(&self) -> bool {
        self.kind() == ErrorKind::UnsupportedOnBackend
    }
}

impl Display for HarnessError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Self::Build(err) => write!(f, "build failed: {}", err),
            Self::Lower(err) => write!(f, "lowering failed: {}", err),
            Self::Exec(err) => write!(f, "execution failed: {}", err),
            Self::OutputCount { expected, actual } => {
                write!(f, "expected {} outputs but got {}", expected, actual)
            }
            Self::TypeMismatch {
                output,
                expected,
                actual,
            } => write!(
                f,
                "output {} has type {} but expected {}",
                output, actual, expected
            ),
            Self::ValueMismatch { output, reason } => {
                write!(f, "output {} does not match: {}", output, reason)
            }
        }
    }
}

impl Error for HarnessError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Build(err) => Some(err),
            Self::Lower(err) => Some(err),
            Self::Exec(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BuildError> for HarnessError {
    fn from(err: BuildError) -> HarnessError {
        HarnessError::Build(err)
    }
}

impl From<LowerError> for HarnessError {
    fn from(err: LowerError) -> HarnessError {
        HarnessError::Lower(err)
    }
}

impl From<ExecError> for HarnessError {
    fn from(err: ExecError) -> HarnessError {
        HarnessError::Exec(err)
    }
}

/// Compare an actual output value against an expected one.
///
/// Floats match if `|a - b| <= atol + rtol * |b|`. Ints, bools and strings
/// must be equal.
fn compare_values(
    actual: &Value,
    expected: &Value,
    atol: f32,
    rtol: f32,
) -> Result<(), String> {
    if let (Value::List(actual), Value::List(expected)) = (actual, expected) {
        if actual.len() != expected.len() {
            return Err(format!(
                "list has length {} but expected {}",
                actual.len(),
                expected.len()
            ));
        }
        for (i, (a, e)) in actual.items.iter().zip(&expected.items).enumerate() {
            match (a, e) {
                (Some(a), Some(e)) => compare_values(a, e, atol, rtol)
                    .map_err(|reason| format!("list item {}: {}", i, reason))?,
                (None, None) => {}
                _ => return Err(format!("list item {} is written in only one list", i)),
            }
        }
        return Ok(());
    }

    if actual.shape() != expected.shape() {
        return Err(format!(
            "shape {:?} does not match expected shape {:?}",
            actual.shape(),
            expected.shape()
        ));
    }

    let mismatch = |index: usize, a: &dyn Display, e: &dyn Display| {
        format!("value at index {} is {} but expected {}", index, a, e)
    };
    match expected {
        Value::Float(expected) => {
            let actual = actual.to_f32().map_err(|err| err.to_string())?;
            for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
                let close = (a - e).abs() <= atol + rtol * e.abs() || (a.is_nan() && e.is_nan());
                if !close {
                    return Err(mismatch(i, a, e));
                }
            }
        }
        Value::Int(expected) => {
            let Value::Int(actual) = actual else {
                return Err(format!("expected an int tensor but got a {}", actual.kind_name()));
            };
            if let Some(i) = actual.iter().zip(expected.iter()).position(|(a, e)| a != e) {
                return Err(mismatch(i, &actual.to_vec()[i], &expected.to_vec()[i]));
            }
        }
        Value::Bool(expected) => {
            let Value::Bool(actual) = actual else {
                return Err(format!("expected a bool tensor but got a {}", actual.kind_name()));
            };
            if let Some(i) = actual.iter().zip(expected.iter()).position(|(a, e)| a != e) {
                return Err(mismatch(i, &actual.to_vec()[i], &expected.to_vec()[i]));
            }
        }
        Value::Str(_) | Value::List(_) => {
            if actual != expected {
                return Err(format!("{} does not equal {}", actual, expected));
            }
        }
    }
    Ok(())
}

/// Build a `main` function, check its output types and, unless
/// `options.frontend_only` is set, lower and run it and compare the results.
///
/// Returns the built program so callers can make further checks.
pub fn run_compare_builder<N, T, I, F>(
    build: F,
    input_types: I,
    input_values: Vec<Value>,
    expected_types: &[ExpectedType],
    expected_values: &[Value],
    options: &CompareOptions,
) -> Result<Program, HarnessError>
where
    N: AsRef<str>,
    T: Into<ValueType>,
    I: IntoIterator<Item = (N, T)>,
    F: FnOnce(&mut Builder, &[VarId]) -> Result<Vec<VarId>, BuildError>,
{
    let mut program = Program::new();
    let main = Builder::new(&mut program).function("main", input_types, build)?;

    let output_types = program.output_types(main);
    if output_types.len() != expected_types.len() {
        return Err(HarnessError::OutputCount {
            expected: expected_types.len(),
            actual: output_types.len(),
        });
    }
    for (output, (actual, expected)) in output_types.iter().zip(expected_types).enumerate() {
        if !expected.matches(actual) {
            return Err(HarnessError::TypeMismatch {
                output,
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
    }
    if options.frontend_only {
        return Ok(program);
    }

    let lower_options = LowerOptions {
        skip_unsupported: false,
    };
    let spec = lower_program(&program, options.backend, &lower_options)?;
    let outputs = execute(&spec, "main", input_values)?;
    debug!(
        backend = %options.backend,
        outputs = outputs.len(),
        "executed lowered program"
    );

    if outputs.len() != expected_values.len() {
        return Err(HarnessError::OutputCount {
            expected: expected_values.len(),
            actual: outputs.len(),
        });
    }
    for (output, (actual, expected)) in outputs.iter().zip(expected_values).enumerate() {
        compare_values(actual, expected, options.atol, options.rtol)
            .map_err(|reason| HarnessError::ValueMismatch { output, reason })?;
    }
    Ok(program)
}

#[cfg(test)]
mod tests {
    use rten_tensor::Tensor;

    use super::{
        compare_values, run_compare_builder, CompareOptions, ExpectedDim, ExpectedType,
        HarnessError,
    };
    use crate::lower::Backend;
    use crate::operator::ErrorKind;
    use crate::types::{tensor_type, DType};
    use crate::value::Value;

    fn relu_inputs() -> Vec<Value> {
        vec![Tensor::from([[-1., 2.], [3., -4.]]).into()]
    }

    #[test]
    fn test_compare_relu_on_both_backends() {
        for backend in [Backend::MilProto, Backend::NnProto] {
            let options = CompareOptions {
                backend,
                ..Default::default()
            };
            run_compare_builder(
                |mb, x| Ok(vec![mb.op("relu").arg("x", x[0]).build1()?]),
                [("x", tensor_type([2, 2], DType::Fp32))],
                relu_inputs(),
                &[ExpectedType::new([2, 2], DType::Fp32)],
                &[Tensor::from([[0., 2.], [3., 0.]]).into()],
                &options,
            )
            .unwrap();
        }
    }

    #[test]
    fn test_type_mismatch() {
        let err = run_compare_builder(
            |mb, x| Ok(vec![mb.op("relu").arg("x", x[0]).build1()?]),
            [("x", tensor_type([2, 2], DType::Fp32))],
            relu_inputs(),
            &[ExpectedType::new([ExpectedDim::Any, 3.into()], DType::Fp32)],
            &[],
            &CompareOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, HarnessError::TypeMismatch { output: 0, .. }));
        assert_eq!(err.kind(), ErrorKind::Mismatch);
    }

    #[test]
    fn test_unranked_shape_needs_wildcard_dims() {
        use mil_shape::Shape;

        use crate::types::{TensorType, ValueType};

        let unranked = ValueType::Tensor(TensorType::new(Shape::unranked(), DType::Fp32));
        assert!(!ExpectedType::new([2, 2], DType::Fp32).matches(&unranked));
        assert!(!ExpectedType::new([ExpectedDim::Any, 2.into()], DType::Fp32).matches(&unranked));
        assert!(!ExpectedType::new::<usize>([], DType::Fp32).matches(&unranked));
        assert!(ExpectedType::new([ExpectedDim::Any; 2], DType::Fp32).matches(&unranked));
        assert!(!ExpectedType::new([ExpectedDim::Any; 2], DType::Int32).matches(&unranked));

        let symbolic = ValueType::Tensor(TensorType::new(Shape::symbolic(2), DType::Fp32));
        assert!(ExpectedType::new([2, 3], DType::Fp32).matches(&symbolic));
        assert!(!ExpectedType::new([2], DType::Fp32).matches(&symbolic));
    }

    #[test]
    fn test_value_mismatch() {
        let err = run_compare_builder(
            |mb, x| Ok(vec![mb.op("relu").arg("x", x[0]).build1()?]),
            [("x", tensor_type([2, 2], DType::Fp32))],
            relu_inputs(),
            &[ExpectedType::new([2, 2], DType::Fp32)],
            &[Tensor::from([[0., 2.], [3., 1.]]).into()],
            &CompareOptions::default(),
        )
        .err()
        .unwrap();
        assert_eq!(
            err.to_string(),
            "output 0 does not match: value at index 3 is 0 but expected 1"
        );
    }

    #[test]
    fn test_unsupported_is_distinct() {
        let err = run_compare_builder(
            |mb, x| {
                let y = mb
                    .op("pad")
                    .arg("x", x[0])
                    .arg("pad", [1, 1, 0, 0, 0, 0])
                    .arg("mode", "replicate")
                    .build1()?;
                Ok(vec![y])
            },
            [("x", tensor_type([2, 2, 2], DType::Fp32))],
            vec![Tensor::<f32>::zeros(&[2, 2, 2]).into()],
            &[ExpectedType::new([4, 2, 2], DType::Fp32)],
            &[Tensor::<f32>::zeros(&[4, 2, 2]).into()],
            &CompareOptions {
                backend: Backend::NnProto,
                ..Default::default()
            },
        )
        .err()
        .unwrap();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_compare_values_tolerance() {
        let expected: Value = Tensor::from([1000., 1.]).into();
        let close: Value = Tensor::from([1000.01, 1.00005]).into();
        assert!(compare_values(&close, &expected, 1e-4, 1e-5).is_ok());

        let far: Value = Tensor::from([1000., 1.001]).into();
        assert!(compare_values(&far, &expected, 1e-4, 1e-5).is_err());

        let ints: Value = Tensor::from([1, 2]).into();
        assert!(compare_values(&ints, &Tensor::from([1, 3]).into(), 0., 0.).is_err());
        assert!(compare_values(&ints, &Tensor::from([1, 2]).into(), 0., 0.).is_ok());
    }
}
