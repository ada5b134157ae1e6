//! Primitive data types and the tensor and list types of program values.

use std::fmt;

use mil_shape::{Dim, Shape};
use serde::{Deserialize, Serialize};

/// Primitive element type of a tensor.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Fp16,
    Fp32,
    Fp64,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Bool,
    Str,
}

/// Element type of the buffer used to hold concrete values of a dtype.
///
/// Values of all float dtypes are stored as `f32` and values of all integer
/// dtypes as `i32`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Carrier {
    F32,
    I32,
    Bool,
    Str,
}

impl DType {
    pub const ALL: [DType; 13] = [
        DType::Fp16,
        DType::Fp32,
        DType::Fp64,
        DType::Int8,
        DType::Int16,
        DType::Int32,
        DType::Int64,
        DType::UInt8,
        DType::UInt16,
        DType::UInt32,
        DType::UInt64,
        DType::Bool,
        DType::Str,
    ];

    pub fn is_float(self) -> bool {
        matches!(self, DType::Fp16 | DType::Fp32 | DType::Fp64)
    }

    pub fn is_int(self) -> bool {
        matches!(
            self,
            DType::Int8
                | DType::Int16
                | DType::Int32
                | DType::Int64
                | DType::UInt8
                | DType::UInt16
                | DType::UInt32
                | DType::UInt64
        )
    }

    pub fn is_bool(self) -> bool {
        self == DType::Bool
    }

    /// Return true for float and integer types.
    pub fn is_numeric(self) -> bool {
        self.is_float() || self.is_int()
    }

    /// Size of one element in bits. Strings report 0.
    pub fn bit_width(self) -> u32 {
        match self {
            DType::Bool => 1,
            DType::Int8 | DType::UInt8 => 8,
            DType::Fp16 | DType::Int16 | DType::UInt16 => 16,
            DType::Fp32 | DType::Int32 | DType::UInt32 => 32,
            DType::Fp64 | DType::Int64 | DType::UInt64 => 64,
            DType::Str => 0,
        }
    }

    pub fn carrier(self) -> Carrier {
        if self.is_float() {
            Carrier::F32
        } else if self.is_int() {
            Carrier::I32
        } else if self.is_bool() {
            Carrier::Bool
        } else {
            Carrier::Str
        }
    }

    /// Short name of the type, as used in op parameters such as `cast`'s
    /// `dtype` (eg. "fp32", "int32").
    pub fn name(self) -> &'static str {
        match self {
            DType::Fp16 => "fp16",
            DType::Fp32 => "fp32",
            DType::Fp64 => "fp64",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::UInt8 => "uint8",
            DType::UInt16 => "uint16",
            DType::UInt32 => "uint32",
            DType::UInt64 => "uint64",
            DType::Bool => "bool",
            DType::Str => "str",
        }
    }

    /// Parse a type name produced by [`DType::name`].
    pub fn from_name(name: &str) -> Option<DType> {
        DType::ALL.into_iter().find(|dtype| dtype.name() == name)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Return the dtype that a mix of `dtypes` promotes to.
///
/// Any float input makes the result the widest float. Otherwise all-integer
/// inputs give the widest integer and all-bool inputs give bool. Mixing
/// strings with other types, or bools with numbers, has no promotion and
/// returns `None`, as does an empty input.
pub fn promote_dtypes<I: IntoIterator<Item = DType>>(dtypes: I) -> Option<DType> {
    let mut result: Option<DType> = None;
    for dtype in dtypes {
        result = Some(match result {
            None => dtype,
            Some(prev) if prev == dtype => prev,
            Some(prev) if prev.is_float() && dtype.is_float() => widest(prev, dtype),
            Some(prev) if prev.is_numeric() && dtype.is_numeric() => {
                if prev.is_float() {
                    prev
                } else if dtype.is_float() {
                    dtype
                } else {
                    widest(prev, dtype)
                }
            }
            Some(_) => return None,
        });
    }
    result
}

fn widest(a: DType, b: DType) -> DType {
    if b.bit_width() > a.bit_width() {
        b
    } else {
        a
    }
}

/// Type of a tensor value: its symbolic shape and element type.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TensorType {
    pub shape: Shape,
    pub dtype: DType,
}

impl TensorType {
    pub fn new(shape: Shape, dtype: DType) -> TensorType {
        TensorType { shape, dtype }
    }

    pub fn scalar(dtype: DType) -> TensorType {
        TensorType::new(Shape::scalar(), dtype)
    }

    pub fn rank(&self) -> Option<usize> {
        self.shape.rank()
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<{}, {}>", self.dtype, self.shape)
    }
}

/// Construct a tensor type.
pub fn tensor_type(shape: impl Into<Shape>, dtype: DType) -> TensorType {
    TensorType::new(shape.into(), dtype)
}

/// Type of a mutable list value.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ListType {
    /// Type of each element.
    pub elem: TensorType,

    /// Number of elements.
    pub len: Dim,

    /// True if writing past the end of the list grows it.
    pub dynamic_length: bool,
}

impl fmt::Display for ListType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "list<{}, len={}>", self.elem, self.len)
    }
}

/// Type of a program value.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ValueType {
    Tensor(TensorType),
    List(ListType),
}

impl ValueType {
    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            ValueType::Tensor(ty) => Some(ty),
            ValueType::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListType> {
        match self {
            ValueType::List(ty) => Some(ty),
            ValueType::Tensor(_) => None,
        }
    }

    /// Return the dtype of the tensor or of the list elements.
    pub fn dtype(&self) -> DType {
        match self {
            ValueType::Tensor(ty) => ty.dtype,
            ValueType::List(ty) => ty.elem.dtype,
        }
    }

    /// Return a type with the same structure in which every dimension that
    /// differs between `self` and `other` is replaced by a new symbol.
    ///
    /// Returns `None` if the types have a different kind or dtype.
    pub fn merge(&self, other: &ValueType) -> Option<ValueType> {
        match (self, other) {
            (ValueType::Tensor(a), ValueType::Tensor(b)) if a.dtype == b.dtype => Some(
                ValueType::Tensor(TensorType::new(a.shape.merge(&b.shape), a.dtype)),
            ),
            (ValueType::List(a), ValueType::List(b)) if a.elem.dtype == b.elem.dtype => {
                let len = if a.len == b.len {
                    a.len
                } else {
                    Dim::new_symbol()
                };
                Some(ValueType::List(ListType {
                    elem: TensorType::new(a.elem.shape.merge(&b.elem.shape), a.elem.dtype),
                    len,
                    dynamic_length: a.dynamic_length || b.dynamic_length,
                }))
            }
            _ => None,
        }
    }
}

impl From<TensorType> for ValueType {
    fn from(ty: TensorType) -> ValueType {
        ValueType::Tensor(ty)
    }
}

impl From<ListType> for ValueType {
    fn from(ty: ListType) -> ValueType {
        ValueType::List(ty)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Tensor(ty) => ty.fmt(f),
            ValueType::List(ty) => ty.fmt(f),
        }
    }
}

/// Types and values which have a primitive element type.
pub trait HasPrimitive {
    fn primitive(&self) -> DType;
}

impl HasPrimitive for DType {
    fn primitive(&self) -> DType {
        *self
    }
}

impl HasPrimitive for TensorType {
    fn primitive(&self) -> DType {
        self.dtype
    }
}

impl HasPrimitive for ListType {
    fn primitive(&self) -> DType {
        self.elem.dtype
    }
}

impl HasPrimitive for ValueType {
    fn primitive(&self) -> DType {
        self.dtype()
    }
}

/// Return the primitive element type of a type or value.
pub fn get_primitive<T: HasPrimitive + ?Sized>(x: &T) -> DType {
    x.primitive()
}
