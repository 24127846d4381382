#![forbid(unsafe_code)]

use fj_core::{AbstractValue, DType, Literal, Primitive, Value};
use std::collections::BTreeMap;

use crate::EvalError;
use crate::shape_rules::elementwise_shape;
use crate::type_promotion::{binary_literal_op, promote_value_dtypes};

/// Apply `op` across operands that share a shape, broadcasting rank-0
/// operands.
pub(crate) fn map_elementwise(
    primitive: Primitive,
    inputs: &[Value],
    dtype: DType,
    op: impl Fn(&[Literal]) -> Literal,
) -> Result<Value, EvalError> {
    let avals: Vec<AbstractValue> = inputs.iter().map(Value::aval).collect();
    let shape = elementwise_shape(primitive, &avals)?;
    let count = shape.element_count().unwrap_or(0) as usize;
    let mut scratch = Vec::with_capacity(inputs.len());
    let mut elements = Vec::with_capacity(count);
    for idx in 0..count {
        scratch.clear();
        scratch.extend(inputs.iter().map(|value| {
            if value.rank() == 0 {
                value.elements[0]
            } else {
                value.elements[idx]
            }
        }));
        elements.push(op(&scratch));
    }
    Ok(Value::new(dtype, shape, elements)?)
}

pub(crate) fn expect_arity(
    primitive: Primitive,
    inputs: &[Value],
    expected: usize,
) -> Result<(), EvalError> {
    if inputs.len() != expected {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected,
            actual: inputs.len(),
        });
    }
    Ok(())
}

/// Binary elementwise operation dispatching on int/float paths.
#[inline]
pub(crate) fn eval_binary_elementwise(
    primitive: Primitive,
    inputs: &[Value],
    int_op: impl Fn(i64, i64) -> i64,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    expect_arity(primitive, inputs, 2)?;
    let dtype = promote_value_dtypes(inputs.iter().map(|v| v.dtype));
    let float_result = dtype.is_floating();
    map_elementwise(primitive, inputs, dtype, |lits| {
        binary_literal_op(lits[0], lits[1], float_result, &int_op, &float_op)
    })
}

/// Unary elementwise operation computed in f64 (exp, log, sin, ...).
#[inline]
pub(crate) fn eval_unary_elementwise(
    primitive: Primitive,
    inputs: &[Value],
    op: impl Fn(f64) -> f64,
) -> Result<Value, EvalError> {
    expect_arity(primitive, inputs, 1)?;
    let dtype = if inputs[0].dtype.is_floating() {
        inputs[0].dtype
    } else {
        DType::F64
    };
    map_elementwise(primitive, inputs, dtype, |lits| {
        Literal::from_f64(op(lits[0].as_f64().unwrap_or(f64::NAN)))
    })
}

/// Unary elementwise that preserves integer types (neg, sign).
#[inline]
pub(crate) fn eval_unary_int_or_float(
    primitive: Primitive,
    inputs: &[Value],
    int_op: impl Fn(i64) -> i64,
    float_op: impl Fn(f64) -> f64,
) -> Result<Value, EvalError> {
    expect_arity(primitive, inputs, 1)?;
    let dtype = inputs[0].dtype;
    map_elementwise(primitive, inputs, dtype, |lits| {
        if dtype.is_floating() {
            Literal::from_f64(float_op(lits[0].as_f64().unwrap_or(f64::NAN)))
        } else {
            Literal::I64(int_op(lits[0].as_i64().unwrap_or(0)))
        }
    })
}

/// `select_n(which, case_0, ..., case_{n-1})`: elementwise pick of the case
/// named by `which` (boolean false/true picks case 0/1).
pub(crate) fn eval_select_n(inputs: &[Value]) -> Result<Value, EvalError> {
    let primitive = Primitive::SelectN;
    if inputs.len() < 2 {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected: 2,
            actual: inputs.len(),
        });
    }
    let dtype = promote_value_dtypes(inputs[1..].iter().map(|v| v.dtype));
    let last = inputs.len() as i64 - 2;
    map_elementwise(primitive, inputs, dtype, |lits| {
        let case = lits[0].as_i64().unwrap_or(0).clamp(0, last) as usize;
        lits[case + 1]
    })
}

/// `clamp(lo, x, hi)`.
pub(crate) fn eval_clamp(inputs: &[Value]) -> Result<Value, EvalError> {
    let primitive = Primitive::Clamp;
    expect_arity(primitive, inputs, 3)?;
    let dtype = inputs[1].dtype;
    map_elementwise(primitive, inputs, dtype, |lits| {
        if dtype.is_floating() {
            let (lo, x, hi) = (
                lits[0].as_f64().unwrap_or(f64::NAN),
                lits[1].as_f64().unwrap_or(f64::NAN),
                lits[2].as_f64().unwrap_or(f64::NAN),
            );
            Literal::from_f64(x.max(lo).min(hi))
        } else {
            let (lo, x, hi) = (
                lits[0].as_i64().unwrap_or(0),
                lits[1].as_i64().unwrap_or(0),
                lits[2].as_i64().unwrap_or(0),
            );
            Literal::I64(x.max(lo).min(hi))
        }
    })
}

pub(crate) fn eval_convert_element_type(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::ConvertElementType;
    expect_arity(primitive, inputs, 1)?;
    let raw = params.get("new_dtype").ok_or_else(|| EvalError::Unsupported {
        primitive,
        detail: "missing required param 'new_dtype'".to_owned(),
    })?;
    let dtype = DType::parse(raw).ok_or_else(|| EvalError::Unsupported {
        primitive,
        detail: format!("unknown dtype '{raw}'"),
    })?;
    Ok(inputs[0].cast(dtype))
}
