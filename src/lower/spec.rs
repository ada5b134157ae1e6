use std::collections::BTreeMap;

use rten_tensor::prelude::*;
use rten_tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::types::{DType, ValueType};
use crate::value::{ListValue, Value};

/// Name and type of a value in a lowered program.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IoSpec {
    pub name: String,

    /// Element type of the tensor, or of the list's elements.
    pub dtype: DType,

    /// Dimension sizes, with `None` for symbolic dimensions. `None` if the
    /// rank is unknown.
    pub shape: Option<Vec<Option<usize>>>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub list: bool,
}

impl IoSpec {
    pub fn new(name: &str, ty: &ValueType) -> IoSpec {
        let (shape, list) = match ty {
            ValueType::Tensor(tensor) => (&tensor.shape, false),
            ValueType::List(list) => (&list.elem.shape, true),
        };
        IoSpec {
            name: name.to_string(),
            dtype: ty.dtype(),
            shape: shape
                .dims()
                .map(|dims| dims.iter().map(|dim| dim.fixed()).collect()),
            list,
        }
    }
}

/// Concrete value stored in the constant table of a lowered function.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstData {
    Float {
        dtype: DType,
        shape: Vec<usize>,
        data: Vec<f32>,
    },
    Int {
        dtype: DType,
        shape: Vec<usize>,
        data: Vec<i32>,
    },
    Bool {
        shape: Vec<usize>,
        data: Vec<bool>,
    },
    Str {
        value: String,
    },
    List {
        elem_dtype: DType,
        elem_shape: Option<Vec<usize>>,
        dynamic_length: bool,
        items: Vec<Option<ConstData>>,
    },
}

impl ConstData {
    /// Serialize a value whose declared element type is `dtype`.
    pub fn from_value(value: &Value, dtype: DType) -> ConstData {
        match value {
            Value::Float(t) => ConstData::Float {
                dtype,
                shape: t.shape().to_vec(),
                data: t.to_vec(),
            },
            Value::Int(t) => ConstData::Int {
                dtype,
                shape: t.shape().to_vec(),
                data: t.to_vec(),
            },
            Value::Bool(t) => ConstData::Bool {
                shape: t.shape().to_vec(),
                data: t.to_vec(),
            },
            Value::Str(s) => ConstData::Str { value: s.clone() },
            Value::List(list) => ConstData::List {
                elem_dtype: list.elem_dtype,
                elem_shape: list.elem_shape.clone(),
                dynamic_length: list.dynamic_length,
                items: list
                    .items
                    .iter()
                    .map(|item| {
                        item.as_ref()
                            .map(|item| ConstData::from_value(item, list.elem_dtype))
                    })
                    .collect(),
            },
        }
    }

    /// Reconstruct the value. Returns `None` if the data length does not
    /// match the shape.
    pub fn to_value(&self) -> Option<Value> {
        let value = match self {
            ConstData::Float { shape, data, .. } => {
                Value::Float(Tensor::try_from_data(shape.as_slice(), data.clone()).ok()?)
            }
            ConstData::Int { shape, data, .. } => {
                Value::Int(Tensor::try_from_data(shape.as_slice(), data.clone()).ok()?)
            }
            ConstData::Bool { shape, data } => {
                Value::Bool(Tensor::try_from_data(shape.as_slice(), data.clone()).ok()?)
            }
            ConstData::Str { value } => Value::Str(value.clone()),
            ConstData::List {
                elem_dtype,
                elem_shape,
                dynamic_length,
                items,
            } => {
                let items = items
                    .iter()
                    .map(|item| match item {
                        Some(item) => item.to_value().map(Some),
                        None => Some(None),
                    })
                    .collect::<Option<Vec<_>>>()?;
                Value::List(ListValue {
                    elem_dtype: *elem_dtype,
                    elem_shape: elem_shape.clone(),
                    dynamic_length: *dynamic_length,
                    items,
                })
            }
        };
        Some(value)
    }
}

/// One instruction of a lowered program.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// Operator which implements this layer.
    pub layer_type: String,
    pub name: String,

    /// Parameter name and the names of the values bound to it.
    pub inputs: Vec<(String, Vec<String>)>,
    pub outputs: Vec<IoSpec>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, serde_json::Value>,

    /// Bodies of branch and loop layers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Block>,
}

/// Sequence of layers over named inputs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub inputs: Vec<String>,
    pub layers: Vec<Layer>,
    pub outputs: Vec<String>,
}

/// A lowered top-level function.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub inputs: Vec<IoSpec>,

    /// Values of constants referenced by layers in this function, including
    /// its nested blocks.
    pub constants: BTreeMap<String, ConstData>,
    pub block: Block,
}

/// An operation which was left out of a lowered program because the
/// backend does not support it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SkippedOp {
    pub function: String,
    pub op_name: String,
    pub op_type: String,
    pub reason: String,
}

/// Result of lowering a program for a backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendSpec {
    pub backend: String,
    pub functions: Vec<FunctionSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedOp>,
}

impl BackendSpec {
    pub fn function(&self, name: &str) -> Option<&FunctionSpec> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<BackendSpec> {
        serde_json::from_str(json)
    }

    /// Iterate over every layer in every function, including nested blocks.
    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        fn visit<'a>(block: &'a Block, out: &mut Vec<&'a Layer>) {
            for layer in &block.layers {
                out.push(layer);
                for nested in &layer.blocks {
                    visit(nested, out);
                }
            }
        }
        let mut layers = Vec::new();
        for func in &self.functions {
            visit(&func.block, &mut layers);
        }
        layers.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::Tensor;

    use super::ConstData;
    use crate::types::DType;
    use crate::value::{ListValue, Value};

    #[test]
    fn test_const_data_preserves_values() {
        let values = [
            Value::from(Tensor::from([[1., 2.], [3., 4.]])),
            Value::from(vec![1, 2, 3]),
            Value::from(true),
            Value::from("valid"),
        ];
        for value in values {
            let data = ConstData::from_value(&value, value.dtype());
            assert_eq!(data.to_value(), Some(value));
        }

        let mut list = ListValue::new(DType::Fp32, Some(vec![2]), 2, true);
        list.items[1] = Some(Value::from(vec![1., 2.]));
        let data = ConstData::from_value(&Value::List(list.clone()), DType::Fp32);
        assert_eq!(data.to_value(), Some(Value::List(list)));
    }

    #[test]
    fn test_const_data_with_wrong_length() {
        let data = ConstData::Float {
            dtype: DType::Fp32,
            shape: vec![2, 2],
            data: vec![1., 2., 3.],
        };
        assert_eq!(data.to_value(), None);
    }
}
