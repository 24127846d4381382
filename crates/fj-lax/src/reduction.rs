#![forbid(unsafe_code)]

use fj_core::{Literal, Primitive, Shape, Value};
use std::collections::BTreeMap;

use crate::EvalError;
use crate::arithmetic::expect_arity;
use crate::tensor_ops::{parse_usize_param, row_major_strides};

/// Sum over the listed axes. Params: `axes`.
pub(crate) fn eval_reduce_sum(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::ReduceSum;
    expect_arity(primitive, inputs, 1)?;
    let operand = &inputs[0];
    let axes = parse_usize_param(primitive, "axes", params)?;
    if let Some(bad) = axes.iter().find(|&&axis| axis >= operand.rank()) {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("axis {bad} out of range for rank {}", operand.rank()),
        });
    }

    let kept: Vec<usize> = (0..operand.rank()).filter(|axis| !axes.contains(axis)).collect();
    let out_dims: Vec<u32> = kept.iter().map(|&axis| operand.shape.dims[axis]).collect();
    let out_strides = row_major_strides(&out_dims);
    let out_count = out_dims.iter().map(|&d| d as usize).product::<usize>();
    let float = operand.dtype.is_floating();
    let mut float_acc = vec![0.0_f64; out_count];
    let mut int_acc = vec![0_i64; out_count];

    let dims = &operand.shape.dims;
    let mut index = vec![0_usize; dims.len()];
    for (flat, literal) in operand.elements.iter().enumerate() {
        let mut rem = flat;
        for axis in (0..dims.len()).rev() {
            let dim = dims[axis] as usize;
            index[axis] = rem % dim;
            rem /= dim;
        }
        let dst: usize = kept
            .iter()
            .zip(&out_strides)
            .map(|(&axis, &stride)| index[axis] * stride)
            .sum();
        if float {
            float_acc[dst] += literal.as_f64().unwrap_or(f64::NAN);
        } else {
            int_acc[dst] = int_acc[dst].wrapping_add(literal.as_i64().unwrap_or(0));
        }
    }

    let elements = if float {
        float_acc.into_iter().map(Literal::from_f64).collect()
    } else {
        int_acc.into_iter().map(Literal::I64).collect()
    };
    Ok(Value::new(operand.dtype, Shape::new(out_dims), elements)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fj_core::DType;

    fn axes(raw: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("axes".to_owned(), raw.to_owned())])
    }

    #[test]
    fn sum_rows_and_all() {
        let m = Value::from_f64s(DType::F64, Shape::new(vec![2, 3]), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .expect("matrix");
        let rows = eval_reduce_sum(&[m.clone()], &axes("1")).expect("rows");
        assert_eq!(rows.to_f64_vec(), Some(vec![6.0, 15.0]));
        let all = eval_reduce_sum(&[m], &axes("0,1")).expect("all");
        assert_eq!(all.as_f64_scalar(), Some(21.0));
    }

    #[test]
    fn sum_of_empty_axis_is_zero() {
        let empty = Value::new(DType::I64, Shape::new(vec![0, 2]), Vec::new()).expect("empty");
        let out = eval_reduce_sum(&[empty], &axes("0")).expect("sum");
        assert_eq!(out.to_i64_vec(), Some(vec![0, 0]));
    }
}
