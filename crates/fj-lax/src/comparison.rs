#![forbid(unsafe_code)]

use fj_core::{DType, Literal, Primitive, Value};

use crate::EvalError;
use crate::arithmetic::{expect_arity, map_elementwise};
use crate::type_promotion::{compare_literals, promote_value_dtypes};

#[inline]
pub(crate) fn eval_comparison(
    primitive: Primitive,
    inputs: &[Value],
    int_cmp: impl Fn(i64, i64) -> bool,
    float_cmp: impl Fn(f64, f64) -> bool,
) -> Result<Value, EvalError> {
    expect_arity(primitive, inputs, 2)?;
    map_elementwise(primitive, inputs, DType::Bool, |lits| {
        Literal::Bool(compare_literals(lits[0], lits[1], &int_cmp, &float_cmp))
    })
}

/// Logical ops on booleans, bitwise ops on integers.
#[inline]
pub(crate) fn eval_logical_binary(
    primitive: Primitive,
    inputs: &[Value],
    bool_op: impl Fn(bool, bool) -> bool,
    int_op: impl Fn(i64, i64) -> i64,
) -> Result<Value, EvalError> {
    expect_arity(primitive, inputs, 2)?;
    let dtype = promote_value_dtypes(inputs.iter().map(|v| v.dtype));
    if dtype.is_floating() {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: format!("expected boolean or integer operands, got {dtype}"),
        });
    }
    map_elementwise(primitive, inputs, dtype, |lits| {
        if dtype == DType::Bool {
            Literal::Bool(bool_op(lits[0].as_bool(), lits[1].as_bool()))
        } else {
            Literal::I64(int_op(
                lits[0].as_i64().unwrap_or(0),
                lits[1].as_i64().unwrap_or(0),
            ))
        }
    })
}

pub(crate) fn eval_not(inputs: &[Value]) -> Result<Value, EvalError> {
    let primitive = Primitive::Not;
    expect_arity(primitive, inputs, 1)?;
    let dtype = inputs[0].dtype;
    if dtype.is_floating() {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: format!("expected boolean or integer operand, got {dtype}"),
        });
    }
    map_elementwise(primitive, inputs, dtype, |lits| {
        if dtype == DType::Bool {
            Literal::Bool(!lits[0].as_bool())
        } else {
            Literal::I64(!lits[0].as_i64().unwrap_or(0))
        }
    })
}
