//! Concrete values of program variables.

use std::error::Error;
use std::fmt;

use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::types::{Carrier, DType, ListType, TensorType, ValueType};

/// Errors when converting a value to a different kind or element type.
#[derive(Clone, Debug, PartialEq)]
pub enum CastError {
    /// The value has a different kind than expected (eg. a list instead of
    /// a tensor).
    WrongKind {
        actual: &'static str,
        expected: &'static str,
    },

    /// A tensor was expected to contain exactly one element.
    NotScalar { len: usize },

    /// There is no conversion between the value's type and the target type.
    Unsupported { from: DType, to: DType },
}

impl fmt::Display for CastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongKind { actual, expected } => {
                write!(f, "expected {} value but got {}", expected, actual)
            }
            Self::NotScalar { len } => write!(f, "expected a single value but got {}", len),
            Self::Unsupported { from, to } => write!(f, "cannot convert {} to {}", from, to),
        }
    }
}

impl Error for CastError {}

/// Concrete value of a mutable list.
#[derive(Clone, Debug, PartialEq)]
pub struct ListValue {
    pub elem_dtype: DType,

    /// Shape of each element, or `None` until the first element is written
    /// to a list whose element shape was not known when it was created.
    pub elem_shape: Option<Vec<usize>>,

    pub dynamic_length: bool,

    /// Slots of the list. Unwritten slots are `None` and read as zeros.
    pub items: Vec<Option<Value>>,
}

impl ListValue {
    pub fn new(
        elem_dtype: DType,
        elem_shape: Option<Vec<usize>>,
        init_length: usize,
        dynamic_length: bool,
    ) -> ListValue {
        ListValue {
            elem_dtype,
            elem_shape,
            dynamic_length,
            items: vec![None; init_length],
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Concrete value of a variable.
///
/// Tensors of any float dtype are held in `f32` buffers and tensors of any
/// integer dtype in `i32` buffers. See [`DType::carrier`].
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Float(Tensor<f32>),
    Int(Tensor<i32>),
    Bool(Tensor<bool>),
    Str(String),
    List(ListValue),
}

/// Apply a generic expression to the tensor inside a value, producing a
/// value of the same element type. Non-tensor values make the enclosing
/// function return an `OpError::InvalidType`.
macro_rules! map_tensor {
    ($value:expr, $t:ident => $body:expr) => {
        match $value {
            $crate::value::Value::Float($t) => $crate::value::Value::Float($body),
            $crate::value::Value::Int($t) => $crate::value::Value::Int($body),
            $crate::value::Value::Bool($t) => $crate::value::Value::Bool($body),
            other => {
                return Err($crate::operator::OpError::InvalidType(format!(
                    "expected a tensor but got a {}",
                    other.kind_name()
                )))
            }
        }
    };
}

pub(crate) use map_tensor;

impl Value {
    /// Short description of the kind of value, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Float(_) => "float tensor",
            Value::Int(_) => "int tensor",
            Value::Bool(_) => "bool tensor",
            Value::Str(_) => "string",
            Value::List(_) => "list",
        }
    }

    /// Return the default dtype for values of this carrier.
    pub fn dtype(&self) -> DType {
        match self {
            Value::Float(_) => DType::Fp32,
            Value::Int(_) => DType::Int32,
            Value::Bool(_) => DType::Bool,
            Value::Str(_) => DType::Str,
            Value::List(list) => list.elem_dtype,
        }
    }

    pub fn carrier(&self) -> Carrier {
        match self {
            Value::Float(_) => Carrier::F32,
            Value::Int(_) => Carrier::I32,
            Value::Bool(_) => Carrier::Bool,
            Value::Str(_) => Carrier::Str,
            Value::List(list) => list.elem_dtype.carrier(),
        }
    }

    /// Return the shape of a tensor value. Strings are scalars and lists
    /// report their length.
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Value::Float(t) => t.shape().to_vec(),
            Value::Int(t) => t.shape().to_vec(),
            Value::Bool(t) => t.shape().to_vec(),
            Value::Str(_) => Vec::new(),
            Value::List(list) => vec![list.len()],
        }
    }

    pub fn ndim(&self) -> usize {
        match self {
            Value::Float(t) => t.ndim(),
            Value::Int(t) => t.ndim(),
            Value::Bool(t) => t.ndim(),
            Value::Str(_) => 0,
            Value::List(_) => 1,
        }
    }

    /// Return the number of elements in a tensor value.
    pub fn len(&self) -> usize {
        match self {
            Value::Float(t) => t.len(),
            Value::Int(t) => t.len(),
            Value::Bool(t) => t.len(),
            Value::Str(_) => 1,
            Value::List(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, Value::Float(_) | Value::Int(_) | Value::Bool(_))
    }

    pub fn as_float(&self) -> Result<&Tensor<f32>, CastError> {
        match self {
            Value::Float(t) => Ok(t),
            _ => Err(self.wrong_kind("float tensor")),
        }
    }

    pub fn as_int(&self) -> Result<&Tensor<i32>, CastError> {
        match self {
            Value::Int(t) => Ok(t),
            _ => Err(self.wrong_kind("int tensor")),
        }
    }

    pub fn as_bool(&self) -> Result<&Tensor<bool>, CastError> {
        match self {
            Value::Bool(t) => Ok(t),
            _ => Err(self.wrong_kind("bool tensor")),
        }
    }

    pub fn as_str(&self) -> Result<&str, CastError> {
        match self {
            Value::Str(s) => Ok(s),
            _ => Err(self.wrong_kind("string")),
        }
    }

    pub fn as_list(&self) -> Result<&ListValue, CastError> {
        match self {
            Value::List(list) => Ok(list),
            _ => Err(self.wrong_kind("list")),
        }
    }

    fn wrong_kind(&self, expected: &'static str) -> CastError {
        CastError::WrongKind {
            actual: self.kind_name(),
            expected,
        }
    }

    /// Convert a numeric or bool tensor to `f32`.
    pub fn to_f32(&self) -> Result<Tensor<f32>, CastError> {
        match self {
            Value::Float(t) => Ok(t.clone()),
            Value::Int(t) => Ok(t.map(|&x| x as f32)),
            Value::Bool(t) => Ok(t.map(|&x| if x { 1. } else { 0. })),
            _ => Err(self.wrong_kind("numeric tensor")),
        }
    }

    /// Convert a numeric or bool tensor to `i32`. Floats are truncated
    /// towards zero.
    pub fn to_i32(&self) -> Result<Tensor<i32>, CastError> {
        match self {
            Value::Float(t) => Ok(t.map(|&x| x as i32)),
            Value::Int(t) => Ok(t.clone()),
            Value::Bool(t) => Ok(t.map(|&x| x as i32)),
            _ => Err(self.wrong_kind("numeric tensor")),
        }
    }

    /// Convert a numeric or bool tensor to bool, mapping non-zero to true.
    pub fn to_bool(&self) -> Result<Tensor<bool>, CastError> {
        match self {
            Value::Float(t) => Ok(t.map(|&x| x != 0.)),
            Value::Int(t) => Ok(t.map(|&x| x != 0)),
            Value::Bool(t) => Ok(t.clone()),
            _ => Err(self.wrong_kind("numeric tensor")),
        }
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>, CastError> {
        self.to_f32().map(|t| t.to_vec())
    }

    pub fn to_i32_vec(&self) -> Result<Vec<i32>, CastError> {
        self.to_i32().map(|t| t.to_vec())
    }

    pub fn to_bool_vec(&self) -> Result<Vec<bool>, CastError> {
        self.to_bool().map(|t| t.to_vec())
    }

    fn check_scalar(&self) -> Result<(), CastError> {
        match self.len() {
            1 => Ok(()),
            len => Err(CastError::NotScalar { len }),
        }
    }

    /// Return the single element of a tensor as `f32`.
    pub fn scalar_f32(&self) -> Result<f32, CastError> {
        self.check_scalar()?;
        Ok(self.to_f32_vec()?[0])
    }

    pub fn scalar_i32(&self) -> Result<i32, CastError> {
        self.check_scalar()?;
        Ok(self.to_i32_vec()?[0])
    }

    pub fn scalar_bool(&self) -> Result<bool, CastError> {
        self.check_scalar()?;
        Ok(self.to_bool_vec()?[0])
    }

    /// Convert the value to the carrier of `dtype`, applying the
    /// narrowing of `dtype` to integer values.
    pub fn cast(&self, dtype: DType) -> Result<Value, CastError> {
        if let Value::List(list) = self {
            if list.elem_dtype.carrier() != dtype.carrier() {
                return Err(CastError::Unsupported {
                    from: list.elem_dtype,
                    to: dtype,
                });
            }
            return Ok(self.clone());
        }

        let unsupported = || CastError::Unsupported {
            from: self.dtype(),
            to: dtype,
        };

        match dtype.carrier() {
            Carrier::F32 => self.to_f32().map(Value::Float).map_err(|_| unsupported()),
            Carrier::I32 => {
                let ints = self.to_i32().map_err(|_| unsupported())?;
                Ok(Value::Int(ints.map(|&x| narrow_int(x, dtype))))
            }
            Carrier::Bool => self.to_bool().map(Value::Bool).map_err(|_| unsupported()),
            Carrier::Str => match self {
                Value::Str(_) => Ok(self.clone()),
                _ => Err(unsupported()),
            },
        }
    }

    /// Return a tensor of zeros with a given shape and dtype.
    pub fn zeros(shape: &[usize], dtype: DType) -> Value {
        Value::full(shape, 0., dtype)
    }

    /// Return a tensor filled with `value`, converted to the carrier of
    /// `dtype`.
    pub fn full(shape: &[usize], value: f32, dtype: DType) -> Value {
        match dtype.carrier() {
            Carrier::F32 => Value::Float(Tensor::full(shape, value)),
            Carrier::I32 => Value::Int(Tensor::full(shape, value as i32)),
            Carrier::Bool => Value::Bool(Tensor::full(shape, value != 0.)),
            Carrier::Str => Value::Str(String::new()),
        }
    }

    /// Return the most specific type describing this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::List(list) => {
                let elem_shape = match &list.elem_shape {
                    Some(shape) => shape.as_slice().into(),
                    None => mil_shape::Shape::unranked(),
                };
                ValueType::List(ListType {
                    elem: TensorType::new(elem_shape, list.elem_dtype),
                    len: list.len().into(),
                    dynamic_length: list.dynamic_length,
                })
            }
            _ => ValueType::Tensor(TensorType::new(
                self.shape().as_slice().into(),
                self.dtype(),
            )),
        }
    }

    /// Return true if this value could be the value of a variable of type
    /// `ty`. The element carrier must match and each fixed dimension must
    /// equal the corresponding size.
    pub fn matches_type(&self, ty: &ValueType) -> bool {
        match (self, ty) {
            (Value::List(list), ValueType::List(list_ty)) => {
                list.elem_dtype.carrier() == list_ty.elem.dtype.carrier()
                    && list_ty.len.admits(list.len())
            }
            (Value::List(_), _) | (_, ValueType::List(_)) => false,
            (_, ValueType::Tensor(tensor_ty)) => {
                self.carrier() == tensor_ty.dtype.carrier()
                    && tensor_ty.shape.matches(&self.shape())
            }
        }
    }
}

/// Wrap an `i32` to the range of a narrower integer type.
fn narrow_int(x: i32, dtype: DType) -> i32 {
    match dtype {
        DType::Int8 => x as i8 as i32,
        DType::Int16 => x as i16 as i32,
        DType::UInt8 => x as u8 as i32,
        DType::UInt16 => x as u16 as i32,
        _ => x,
    }
}

impl From<f32> for Value {
    fn from(x: f32) -> Value {
        Value::Float(Tensor::from(x))
    }
}

impl From<i32> for Value {
    fn from(x: i32) -> Value {
        Value::Int(Tensor::from(x))
    }
}

impl From<bool> for Value {
    fn from(x: bool) -> Value {
        Value::Bool(Tensor::from(x))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Str(s)
    }
}

impl From<Tensor<f32>> for Value {
    fn from(t: Tensor<f32>) -> Value {
        Value::Float(t)
    }
}

impl From<Tensor<i32>> for Value {
    fn from(t: Tensor<i32>) -> Value {
        Value::Int(t)
    }
}

impl From<Tensor<bool>> for Value {
    fn from(t: Tensor<bool>) -> Value {
        Value::Bool(t)
    }
}

impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Value {
        Value::Float(Tensor::from(v))
    }
}

impl From<Vec<i32>> for Value {
    fn from(v: Vec<i32>) -> Value {
        Value::Int(Tensor::from(v))
    }
}

impl From<Vec<bool>> for Value {
    fn from(v: Vec<bool>) -> Value {
        Value::Bool(Tensor::from(v))
    }
}

impl From<ListValue> for Value {
    fn from(list: ListValue) -> Value {
        Value::List(list)
    }
}

fn fmt_elements<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    shape: &[usize],
    mut elems: impl Iterator<Item = T>,
) -> fmt::Result {
    const MAX_SHOWN: usize = 8;

    let len: usize = shape.iter().product();
    if shape.is_empty() {
        if let Some(x) = elems.next() {
            return write!(f, "{}", x);
        }
    }
    write!(f, "[")?;
    for (i, x) in elems.by_ref().take(MAX_SHOWN).enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", x)?;
    }
    if len > MAX_SHOWN {
        write!(f, ", ... {} more", len - MAX_SHOWN)?;
    }
    write!(f, "]")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(t) => fmt_elements(f, t.shape(), t.iter()),
            Value::Int(t) => fmt_elements(f, t.shape(), t.iter()),
            Value::Bool(t) => fmt_elements(f, t.shape(), t.iter()),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::List(list) => write!(
                f,
                "list(len={}, dtype={})",
                list.len(),
                list.elem_dtype
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::prelude::*;
    use rten_tensor::Tensor;

    use super::{CastError, ListValue, Value};
    use crate::types::{tensor_type, DType, ValueType};

    #[test]
    fn test_value_dtype_and_shape() {
        let x = Value::from(Tensor::from([[1., 2.], [3., 4.]]));
        assert_eq!(x.dtype(), DType::Fp32);
        assert_eq!(x.shape(), [2, 2]);
        assert_eq!(Value::from(3).shape(), Vec::<usize>::new());
        assert_eq!(Value::from("same").dtype(), DType::Str);
    }

    #[test]
    fn test_cast() {
        let x = Value::from(vec![1.7f32, -2.5, 0.]);
        assert_eq!(x.cast(DType::Int32).unwrap(), Value::from(vec![1, -2, 0]));
        assert_eq!(
            x.cast(DType::Bool).unwrap(),
            Value::from(vec![true, true, false])
        );

        let big = Value::from(vec![300i32]);
        assert_eq!(big.cast(DType::UInt8).unwrap(), Value::from(vec![44]));

        assert_eq!(
            Value::from("s").cast(DType::Fp32),
            Err(CastError::Unsupported {
                from: DType::Str,
                to: DType::Fp32
            })
        );
    }

    #[test]
    fn test_scalar_access() {
        assert_eq!(Value::from(vec![5i32]).scalar_f32(), Ok(5.));
        assert_eq!(
            Value::from(vec![1., 2.]).scalar_i32(),
            Err(CastError::NotScalar { len: 2 })
        );
        assert!(Value::from(true).scalar_bool().unwrap());
    }

    #[test]
    fn test_matches_type() {
        let x = Value::from(Tensor::<f32>::zeros(&[2, 3]));
        assert!(x.matches_type(&tensor_type([2, 3], DType::Fp32).into()));
        assert!(x.matches_type(&tensor_type([2, 3], DType::Fp16).into()));
        assert!(!x.matches_type(&tensor_type([2, 3], DType::Int32).into()));
        assert!(!x.matches_type(&tensor_type([3, 2], DType::Fp32).into()));

        let list = Value::from(ListValue::new(DType::Fp32, Some(vec![2]), 3, true));
        let ValueType::List(list_ty) = list.value_type() else {
            panic!("expected list type");
        };
        assert_eq!(list_ty.len, 3.into());
        assert!(list.matches_type(&ValueType::List(list_ty)));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::from(2.5).to_string(), "2.5");
        assert_eq!(Value::from(vec![1, 2]).to_string(), "[1, 2]");
        let long = Value::Float(Tensor::zeros(&[10]));
        assert_eq!(
            long.to_string(),
            "[0, 0, 0, 0, 0, 0, 0, 0, ... 2 more]"
        );
        let t = Value::Int(Tensor::from([[1, 2]]));
        assert_eq!(t.ndim(), 2);
    }
}
