use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::operator::{ErrorKind, OpError};

/// Errors that occur when building a program.
#[derive(Clone, Debug, PartialEq)]
pub enum BuildError {
    /// Validating, inferring types for or evaluating an operation failed.
    Op {
        /// Name of the operation.
        name: String,
        /// Registry name of the operator.
        op_type: String,
        error: OpError,
    },

    /// No operator with a given name is registered.
    UnknownOp(String),

    /// An operation was added to, or outputs were set on, a function which
    /// has already been closed.
    FunctionClosed(String),

    /// An operation referenced a variable which is not defined in the
    /// current function or one of its ancestors.
    NotVisible { var: String, function: String },

    /// An operation was added outside of a function scope.
    NoOpenFunction,

    /// The branches of a `cond`, or the body of a `while_loop`, produce
    /// outputs that do not match.
    BranchMismatch(String),

    /// A function was declared with invalid inputs or outputs.
    InvalidFunction(String),

    /// A variable was replaced by one with a different type.
    TypeMismatch { old: String, new: String },
}

impl BuildError {
    pub(crate) fn op_error(name: &str, op_type: &str, error: OpError) -> BuildError {
        BuildError::Op {
            name: name.to_string(),
            op_type: op_type.to_string(),
            error,
        }
    }

    /// Return the general category of error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Op { error, .. } => error.kind(),
            Self::UnknownOp(_) | Self::BranchMismatch(_) | Self::TypeMismatch { .. } => {
                ErrorKind::TypeError
            }
            Self::NotVisible { .. } => ErrorKind::ValueError,
            Self::FunctionClosed(_) | Self::NoOpenFunction | Self::InvalidFunction(_) => {
                ErrorKind::InvalidProgram
            }
        }
    }

    /// Return the operator error, if this error was raised by an operation.
    pub fn op_error_ref(&self) -> Option<&OpError> {
        match self {
            Self::Op { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl Display for BuildError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Op {
                name,
                op_type,
                error,
            } => write!(f, "{} \"{}\": {}", op_type, name, error),
            Self::UnknownOp(name) => write!(f, "no operator named \"{}\"", name),
            Self::FunctionClosed(name) => write!(f, "function \"{}\" is closed", name),
            Self::NotVisible { var, function } => write!(
                f,
                "variable \"{}\" is not visible in function \"{}\"",
                var, function
            ),
            Self::NoOpenFunction => write!(f, "no function is open"),
            Self::BranchMismatch(msg) => write!(f, "{}", msg),
            Self::InvalidFunction(msg) => write!(f, "{}", msg),
            Self::TypeMismatch { old, new } => write!(
                f,
                "cannot replace variable of type {} with one of type {}",
                old, new
            ),
        }
    }
}

impl Error for BuildError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Op { error, .. } => Some(error),
            _ => None,
        }
    }
}
