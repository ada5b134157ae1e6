//! Operators on mutable lists.
//!
//! Lists are values, so "mutating" operators return a new list. Writing
//! past the end of a list with a dynamic length grows it. Reading a slot
//! which has not been written yields zeros of the element shape.

use mil_shape::{Dim, Shape};
use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::operator::{
    DefaultValue, EvalContext, InferContext, InputSpec, IntoOpResult, OpDef, OpError, TypeDomain,
};
use crate::ops::{map_tensor_list, op_inputs, tensor_list};
use crate::types::{DType, ListType, TensorType, ValueType};
use crate::value::{ListValue, Value};

fn list_value<'a>(ctx: &EvalContext<'a>, name: &str) -> Result<&'a ListValue, OpError> {
    Ok(ctx.value(name)?.as_list()?)
}

/// Resolve a list index, which may be negative.
fn list_index(index: i32, len: usize) -> Option<usize> {
    let index = if index < 0 { index + len as i32 } else { index };
    (index >= 0).then_some(index as usize)
}

/// Check that a value written to a list has the list's element shape.
fn check_elem_shape(list: &ListValue, value: &Value) -> Result<(), OpError> {
    match &list.elem_shape {
        Some(shape) if *shape != value.shape() => Err(OpError::InvalidShape(format!(
            "list elements should have shape {:?} but got {:?}",
            shape,
            value.shape()
        ))),
        _ => Ok(()),
    }
}

/// Write `value` to slot `index` of `list`, growing the list if allowed.
fn write_item(list: &mut ListValue, index: i32, value: &Value) -> Result<(), OpError> {
    let index = list_index(index, list.len()).ok_or_else(|| {
        OpError::InvalidValue(format!(
            "index {} out of bound for list of length {}",
            index,
            list.len()
        ))
    })?;
    if index >= list.len() {
        if !list.dynamic_length {
            return Err(OpError::InvalidValue(format!(
                "index {} out of bound for list of fixed length {}",
                index,
                list.len()
            )));
        }
        list.items.resize(index + 1, None);
    }
    check_elem_shape(list, value)?;
    if list.elem_shape.is_none() {
        list.elem_shape = Some(value.shape());
    }
    list.items[index] = Some(value.cast(list.elem_dtype)?);
    Ok(())
}

/// Return the item at `index`, or zeros if it has not been written or lies
/// past the end of the list.
fn read_item(list: &ListValue, index: i32) -> Result<Value, OpError> {
    let pos = list_index(index, list.len()).ok_or_else(|| {
        OpError::InvalidValue(format!(
            "index {} out of bound for list of length {}",
            index,
            list.len()
        ))
    })?;
    match (list.items.get(pos).and_then(|slot| slot.as_ref()), &list.elem_shape) {
        (Some(item), _) => Ok(item.clone()),
        (None, Some(shape)) => Ok(Value::zeros(shape, list.elem_dtype)),
        (None, None) => Err(OpError::NotEvaluable(
            "cannot read an unwritten element of a list whose element shape is unknown"
                .to_string(),
        )),
    }
}

/// Stack tensors with the same shape along a new leading axis.
fn stack_items<T: Clone>(items: Vec<Tensor<T>>, elem_shape: &[usize]) -> Tensor<T> {
    let mut shape = vec![items.len()];
    shape.extend_from_slice(elem_shape);
    let data: Vec<T> = items.iter().flat_map(|item| item.to_vec()).collect();
    Tensor::from_data(shape.as_slice(), data)
}

/// Return row `index` of a tensor value as a value.
fn value_row(value: &Value, index: usize) -> Result<Value, OpError> {
    fn row<T: Clone>(t: &Tensor<T>, index: usize) -> Tensor<T> {
        let row_shape = &t.shape()[1..];
        let row_len: usize = row_shape.iter().product();
        let data = t.to_vec()[index * row_len..(index + 1) * row_len].to_vec();
        Tensor::from_data(row_shape, data)
    }
    let row = match value {
        Value::Float(t) => Value::Float(row(t, index)),
        Value::Int(t) => Value::Int(row(t, index)),
        Value::Bool(t) => Value::Bool(row(t, index)),
        other => {
            return Err(OpError::InvalidType(format!(
                "expected a tensor but got a {}",
                other.kind_name()
            )))
        }
    };
    Ok(row)
}

fn check_elem_dtype(list: &ListType, value: &TensorType) -> Result<(), OpError> {
    if list.elem.dtype != value.dtype {
        return Err(OpError::InvalidType(format!(
            "list elements have dtype {} but the value has dtype {}",
            list.elem.dtype, value.dtype
        )));
    }
    Ok(())
}

/// Create a list of `init_length` unwritten elements.
#[derive(Debug, Default)]
pub struct MakeList {}

impl OpDef for MakeList {
    fn name(&self) -> &'static str {
        "make_list"
    }

    op_inputs!(
        InputSpec::int("init_length")
            .constant()
            .default(DefaultValue::I32(1)),
        InputSpec::boolean("dynamic_length")
            .constant()
            .default(DefaultValue::Bool(true)),
        InputSpec::int("elem_shape"),
        InputSpec::string("dtype").default(DefaultValue::Str("fp32")),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let init_length = ctx.i32("init_length")?;
        if init_length < 0 {
            return Err(OpError::InvalidValue(format!(
                "init_length ({}) should be >= 0",
                init_length
            )));
        }
        let dtype_name = ctx.str("dtype")?;
        let dtype = DType::from_name(dtype_name)
            .filter(|dtype| *dtype != DType::Str)
            .ok_or_else(|| {
                OpError::InvalidType(format!("dtype \"{}\" is not a supported list element type", dtype_name))
            })?;

        let elem_shape = match ctx.opt_i32s("elem_shape")? {
            Some(sizes) => {
                if let Some(size) = sizes.iter().find(|&&size| size < 0) {
                    return Err(OpError::InvalidValue(format!(
                        "elem_shape should not contain negative sizes but got {}",
                        size
                    )));
                }
                Shape::from_dims(sizes.iter().map(|&size| Dim::Fixed(size as usize)))
            }
            None => match ctx.shape("elem_shape")?.dim(0).and_then(|d| d.fixed()) {
                Some(rank) => Shape::symbolic(rank),
                None => Shape::unranked(),
            },
        };

        Ok([ValueType::List(ListType {
            elem: TensorType::new(elem_shape, dtype),
            len: Dim::Fixed(init_length as usize),
            dynamic_length: ctx.bool("dynamic_length")?,
        })]
        .into())
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let dtype_name = ctx.str("dtype")?;
        let dtype = DType::from_name(dtype_name).ok_or_else(|| {
            OpError::InvalidType(format!("unknown dtype \"{}\"", dtype_name))
        })?;
        let elem_shape = ctx
            .i32s("elem_shape")?
            .into_iter()
            .map(|size| size.max(0) as usize)
            .collect();
        let list = ListValue::new(
            dtype,
            Some(elem_shape),
            ctx.i32("init_length")?.max(0) as usize,
            ctx.bool("dynamic_length")?,
        );
        Value::List(list).into_op_result()
    }
}

/// Number of elements in a list, as an int32 scalar.
#[derive(Debug, Default)]
pub struct ListLength {}

impl OpDef for ListLength {
    fn name(&self) -> &'static str {
        "list_length"
    }

    op_inputs!(InputSpec::new("ls").domain(TypeDomain::List));

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        ctx.list("ls")?;
        Ok([ValueType::Tensor(TensorType::scalar(DType::Int32))].into())
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        Value::from(list_value(ctx, "ls")?.len() as i32).into_op_result()
    }
}

#[derive(Debug, Default)]
pub struct ListWrite {}

impl OpDef for ListWrite {
    fn name(&self) -> &'static str {
        "list_write"
    }

    op_inputs!(
        InputSpec::new("ls").domain(TypeDomain::List),
        InputSpec::int("index"),
        InputSpec::new("value"),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let list = ctx.list("ls")?;
        let value = ctx.tensor("value")?;
        check_elem_dtype(list, value)?;

        let elem_shape = match (list.elem.shape.dims(), value.shape.dims()) {
            (Some(elem), Some(val)) if elem.len() != val.len() => {
                return Err(OpError::InvalidShape(format!(
                    "list elements should have rank {} but the value has rank {}",
                    elem.len(),
                    val.len()
                )))
            }
            (None, _) => value.shape.clone(),
            _ => list.elem.shape.merge(&value.shape),
        };

        let len = match (ctx.value("index"), list.len.fixed()) {
            (Some(index), Some(len)) => {
                let index = index.scalar_i32()?;
                match list_index(index, len) {
                    Some(i) if i < len => Dim::Fixed(len),
                    Some(i) if list.dynamic_length => Dim::Fixed(i + 1),
                    _ => {
                        return Err(OpError::InvalidValue(format!(
                            "index {} out of bound for list of fixed length {}",
                            index, len
                        )))
                    }
                }
            }
            _ if list.dynamic_length => Dim::new_symbol(),
            _ => list.len,
        };

        Ok([ValueType::List(ListType {
            elem: TensorType::new(elem_shape, list.elem.dtype),
            len,
            dynamic_length: list.dynamic_length,
        })]
        .into())
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let mut list = list_value(ctx, "ls")?.clone();
        write_item(&mut list, ctx.i32("index")?, ctx.value("value")?)?;
        Value::List(list).into_op_result()
    }
}

#[derive(Debug, Default)]
pub struct ListRead {}

impl OpDef for ListRead {
    fn name(&self) -> &'static str {
        "list_read"
    }

    op_inputs!(
        InputSpec::new("ls").domain(TypeDomain::List),
        InputSpec::int("index"),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        Ok([ValueType::Tensor(ctx.list("ls")?.elem.clone())].into())
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        read_item(list_value(ctx, "ls")?, ctx.i32("index")?).into_op_result()
    }
}

/// Stack the elements at `indices` along a new leading axis.
#[derive(Debug, Default)]
pub struct ListGather {}

impl OpDef for ListGather {
    fn name(&self) -> &'static str {
        "list_gather"
    }

    op_inputs!(
        InputSpec::new("ls").domain(TypeDomain::List),
        InputSpec::int("indices"),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let list = ctx.list("ls")?;
        let count = match ctx.shape("indices")?.dims() {
            Some([count]) => *count,
            Some(_) => {
                return Err(OpError::InvalidShape(
                    "indices should be rank 1".to_string(),
                ))
            }
            None => Dim::new_symbol(),
        };
        let shape = match list.elem.shape.dims() {
            Some(dims) => Shape::from_dims(std::iter::once(count).chain(dims.iter().copied())),
            None => Shape::unranked(),
        };
        Ok([ValueType::Tensor(TensorType::new(shape, list.elem.dtype))].into())
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let list = list_value(ctx, "ls")?;
        let items = ctx
            .i32s("indices")?
            .into_iter()
            .map(|index| read_item(list, index))
            .collect::<Result<Vec<_>, _>>()?;
        let elem_shape = match (&list.elem_shape, items.first()) {
            (Some(shape), _) => shape.clone(),
            (None, Some(item)) => item.shape(),
            (None, None) => Vec::new(),
        };
        if items.is_empty() {
            let mut shape = vec![0];
            shape.extend_from_slice(&elem_shape);
            return Value::zeros(&shape, list.elem_dtype).into_op_result();
        }
        let refs: Vec<&Value> = items.iter().collect();
        let stacked = map_tensor_list!(tensor_list(&refs)?, ts => stack_items(ts, &elem_shape));
        stacked.into_op_result()
    }
}

/// Write the rows of `value` to the slots given by `indices`.
#[derive(Debug, Default)]
pub struct ListScatter {}

impl OpDef for ListScatter {
    fn name(&self) -> &'static str {
        "list_scatter"
    }

    op_inputs!(
        InputSpec::new("ls").domain(TypeDomain::List),
        InputSpec::int("indices"),
        InputSpec::new("value"),
    );

    fn infer_types(&self, ctx: &InferContext) -> Result<Vec<ValueType>, OpError> {
        let list = ctx.list("ls")?;
        let value = ctx.tensor("value")?;
        check_elem_dtype(list, value)?;
        let elem_shape = match value.shape.dims() {
            Some([_, rest @ ..]) => {
                let row = Shape::from_dims(rest.iter().copied());
                if list.elem.shape.rank().is_some() {
                    list.elem.shape.merge(&row)
                } else {
                    row
                }
            }
            Some([]) => {
                return Err(OpError::InvalidShape(
                    "value should be at least rank 1".to_string(),
                ))
            }
            None => list.elem.shape.clone(),
        };
        let len = if list.dynamic_length {
            Dim::new_symbol()
        } else {
            list.len
        };
        Ok([ValueType::List(ListType {
            elem: TensorType::new(elem_shape, list.elem.dtype),
            len,
            dynamic_length: list.dynamic_length,
        })]
        .into())
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Vec<Value>, OpError> {
        let mut list = list_value(ctx, "ls")?.clone();
        let indices = ctx.i32s("indices")?;
        let value = ctx.value("value")?;
        if value.ndim() == 0 || value.shape()[0] != indices.len() {
            return Err(OpError::InvalidShape(format!(
                "value should have {} rows but has shape {:?}",
                indices.len(),
                value.shape()
            )));
        }
        for (row, &index) in indices.iter().enumerate() {
            write_item(&mut list, index, &value_row(value, row)?)?;
        }
        Value::List(list).into_op_result()
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::Tensor;

    use crate::builder::Builder;
    use crate::graph::{BuildError, Program};
    use crate::operator::ErrorKind;
    use crate::types::ValueType;
    use crate::value::Value;

    /// Build a function with no inputs and return the values of its outputs.
    fn fold(
        build: impl FnOnce(&mut Builder) -> Result<Vec<crate::graph::VarId>, BuildError>,
    ) -> Result<Vec<(ValueType, Option<Value>)>, BuildError> {
        let mut program = Program::new();
        let mut mb = Builder::new(&mut program);
        let mut result = Vec::new();
        mb.function("main", Vec::<(&str, ValueType)>::new(), |mb, _| {
            let outputs = build(mb)?;
            for out in &outputs {
                result.push((mb.ty(*out).clone(), mb.value(*out).cloned()));
            }
            Ok(outputs)
        })?;
        Ok(result)
    }

    #[test]
    fn test_write_grows_dynamic_list() {
        let result = fold(|mb| {
            let ls = mb
                .op("make_list")
                .arg("init_length", 2)
                .arg("elem_shape", [2])
                .build1()?;
            let ls = mb
                .op("list_write")
                .arg("ls", ls)
                .arg("index", 4)
                .arg("value", [1f32, 2.])
                .build1()?;
            let len = mb.op("list_length").arg("ls", ls).build1()?;
            let unwritten = mb.op("list_read").arg("ls", ls).arg("index", 3).build1()?;
            Ok(vec![len, unwritten])
        })
        .unwrap();

        assert_eq!(result[0].1, Some(Value::from(5)));
        assert_eq!(result[1].1, Some(Value::from(vec![0f32, 0.])));
    }

    #[test]
    fn test_read_past_end_gives_zeros() {
        let result = fold(|mb| {
            let ls = mb
                .op("make_list")
                .arg("init_length", 2)
                .arg("elem_shape", [2])
                .build1()?;
            let item = mb.op("list_read").arg("ls", ls).arg("index", 5).build1()?;
            let gathered = mb
                .op("list_gather")
                .arg("ls", ls)
                .arg("indices", [0, 7])
                .build1()?;
            Ok(vec![item, gathered])
        })
        .unwrap();

        assert_eq!(result[0].1, Some(Value::from(vec![0f32, 0.])));
        assert_eq!(
            result[1].1,
            Some(Value::from(Tensor::from([[0f32, 0.], [0., 0.]])))
        );

        // A negative index which does not resolve to a slot is still an error.
        let err = fold(|mb| {
            let ls = mb
                .op("make_list")
                .arg("init_length", 2)
                .arg("elem_shape", [2])
                .build1()?;
            Ok(vec![mb.op("list_read").arg("ls", ls).arg("index", -3).build1()?])
        })
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::ValueError);
    }

    #[test]
    fn test_write_beyond_fixed_length() {
        let err = fold(|mb| {
            let ls = mb
                .op("make_list")
                .arg("init_length", 2)
                .arg("dynamic_length", false)
                .arg("elem_shape", [2])
                .build1()?;
            let ls = mb
                .op("list_write")
                .arg("ls", ls)
                .arg("index", 2)
                .arg("value", [1f32, 2.])
                .build1()?;
            Ok(vec![ls])
        })
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::ValueError);
        assert!(err.to_string().contains("out of bound"));
    }

    #[test]
    fn test_write_wrong_dtype() {
        let err = fold(|mb| {
            let ls = mb.op("make_list").arg("elem_shape", [2]).build1()?;
            let ls = mb
                .op("list_write")
                .arg("ls", ls)
                .arg("index", 0)
                .arg("value", [1, 2])
                .build1()?;
            Ok(vec![ls])
        })
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::TypeError);
    }

    #[test]
    fn test_scatter_and_gather() {
        let result = fold(|mb| {
            let ls = mb
                .op("make_list")
                .arg("init_length", 3)
                .arg("elem_shape", [2])
                .arg("dtype", "int32")
                .build1()?;
            let ls = mb
                .op("list_scatter")
                .arg("ls", ls)
                .arg("indices", [2, 0])
                .arg("value", Tensor::from([[1, 2], [3, 4]]))
                .build1()?;
            let gathered = mb
                .op("list_gather")
                .arg("ls", ls)
                .arg("indices", [0, 1, 2])
                .build1()?;
            Ok(vec![gathered])
        })
        .unwrap();

        let (ty, value) = &result[0];
        assert_eq!(
            ty.as_tensor().unwrap().shape.to_fixed(),
            Some(vec![3, 2])
        );
        assert_eq!(
            *value,
            Some(Value::from(Tensor::from([[3, 4], [0, 0], [1, 2]])))
        );
    }
}
