#![forbid(unsafe_code)]

use fj_core::{AbstractValue, DType, Literal, Primitive};

use crate::EvalError;

fn kind_rank(dtype: DType) -> u8 {
    match dtype {
        DType::Bool => 0,
        DType::I32 => 1,
        DType::I64 => 2,
        DType::F32 => 3,
        DType::F64 => 4,
    }
}

/// Result dtype and weak flag of an n-ary elementwise operation.
///
/// Weakly typed operands adopt the dtype of the strongly typed ones; strongly
/// typed operands must agree. With only weak operands the widest kind wins
/// and the result stays weak.
pub(crate) fn promote_avals(
    primitive: Primitive,
    inputs: &[AbstractValue],
) -> Result<(DType, bool), EvalError> {
    let mut strong: Option<DType> = None;
    for aval in inputs.iter().filter(|aval| !aval.weak_type) {
        match strong {
            None => strong = Some(aval.dtype),
            Some(dtype) if dtype == aval.dtype => {}
            Some(dtype) => {
                return Err(EvalError::TypeMismatch {
                    primitive,
                    detail: format!(
                        "operands must have matching dtypes, got {dtype} and {}",
                        aval.dtype
                    ),
                });
            }
        }
    }
    if let Some(dtype) = strong {
        return Ok((dtype, false));
    }
    let widest = inputs
        .iter()
        .map(|aval| aval.dtype)
        .max_by_key(|dtype| kind_rank(*dtype))
        .unwrap_or(DType::F64);
    Ok((widest, true))
}

/// Result dtype of a kernel over concrete operands. Values carry no weak
/// flag, so the widest kind wins; the evaluator casts results to the dtype
/// recorded in the graph.
#[inline]
pub(crate) fn promote_value_dtypes(dtypes: impl Iterator<Item = DType>) -> DType {
    dtypes.max_by_key(|dtype| kind_rank(*dtype)).unwrap_or(DType::F64)
}

/// Apply a binary operation to two literals, dispatching on int vs float.
#[inline]
pub(crate) fn binary_literal_op(
    lhs: Literal,
    rhs: Literal,
    float_result: bool,
    int_op: &impl Fn(i64, i64) -> i64,
    float_op: &impl Fn(f64, f64) -> f64,
) -> Literal {
    if !float_result
        && let (Some(left), Some(right)) = (lhs.as_i64(), rhs.as_i64())
    {
        return Literal::I64(int_op(left, right));
    }
    let left = lhs.as_f64().unwrap_or(f64::NAN);
    let right = rhs.as_f64().unwrap_or(f64::NAN);
    Literal::from_f64(float_op(left, right))
}

/// Compare two literals, dispatching on int vs float.
#[inline]
pub(crate) fn compare_literals(
    lhs: Literal,
    rhs: Literal,
    int_cmp: &impl Fn(i64, i64) -> bool,
    float_cmp: &impl Fn(f64, f64) -> bool,
) -> bool {
    match (lhs, rhs) {
        (Literal::I64(a), Literal::I64(b)) => int_cmp(a, b),
        (Literal::Bool(a), Literal::Bool(b)) => int_cmp(i64::from(a), i64::from(b)),
        (left, right) => float_cmp(
            left.as_f64().unwrap_or(f64::NAN),
            right.as_f64().unwrap_or(f64::NAN),
        ),
    }
}
