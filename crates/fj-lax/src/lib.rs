#![forbid(unsafe_code)]

mod arithmetic;
mod comparison;
mod reduction;
mod shape_rules;
mod tensor_ops;
mod type_promotion;

use fj_core::{Primitive, Shape, Value, ValueError};
use std::collections::BTreeMap;

use arithmetic::{
    eval_binary_elementwise, eval_clamp, eval_convert_element_type, eval_select_n,
    eval_unary_elementwise, eval_unary_int_or_float,
};
use comparison::{eval_comparison, eval_logical_binary, eval_not};
use reduction::eval_reduce_sum;
use tensor_ops::{
    eval_broadcast_in_dim, eval_concatenate, eval_dynamic_slice, eval_dynamic_update_slice,
    eval_pad, eval_reshape, eval_rev, eval_slice, eval_transpose,
};

pub use shape_rules::abstract_eval;
pub use tensor_ops::{parse_i64_param, parse_usize_param};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("arity mismatch for {primitive}: expected {expected}, got {actual}")]
    ArityMismatch {
        primitive: Primitive,
        expected: usize,
        actual: usize,
    },
    #[error("type mismatch for {primitive}: {detail}")]
    TypeMismatch { primitive: Primitive, detail: String },
    #[error("shape mismatch for {primitive}: left={left} right={right}")]
    ShapeMismatch {
        primitive: Primitive,
        left: Shape,
        right: Shape,
    },
    #[error("unsupported {primitive} behavior: {detail}")]
    Unsupported { primitive: Primitive, detail: String },
    #[error("invalid tensor: {0}")]
    InvalidTensor(#[from] ValueError),
}

/// Reference kernel for a numeric primitive. Control-flow and state
/// primitives are evaluated by the interpreter, never here.
#[inline]
pub fn eval_primitive(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    match primitive {
        // Binary arithmetic
        Primitive::Add => {
            eval_binary_elementwise(primitive, inputs, i64::wrapping_add, |a, b| a + b)
        }
        Primitive::Sub => {
            eval_binary_elementwise(primitive, inputs, i64::wrapping_sub, |a, b| a - b)
        }
        Primitive::Mul => {
            eval_binary_elementwise(primitive, inputs, i64::wrapping_mul, |a, b| a * b)
        }
        Primitive::Div => eval_binary_elementwise(
            primitive,
            inputs,
            |a, b| a.checked_div(b).unwrap_or(0),
            |a, b| a / b,
        ),
        Primitive::Max => eval_binary_elementwise(primitive, inputs, i64::max, f64::max),
        Primitive::Min => eval_binary_elementwise(primitive, inputs, i64::min, f64::min),
        // Unary
        Primitive::Neg => eval_unary_int_or_float(primitive, inputs, i64::wrapping_neg, |x| -x),
        Primitive::Sign => eval_unary_int_or_float(primitive, inputs, i64::signum, |x| {
            if x == 0.0 || x.is_nan() { x } else { x.signum() }
        }),
        Primitive::Exp => eval_unary_elementwise(primitive, inputs, f64::exp),
        Primitive::Log => eval_unary_elementwise(primitive, inputs, f64::ln),
        Primitive::Sin => eval_unary_elementwise(primitive, inputs, f64::sin),
        Primitive::Cos => eval_unary_elementwise(primitive, inputs, f64::cos),
        Primitive::Sinh => eval_unary_elementwise(primitive, inputs, f64::sinh),
        Primitive::Cosh => eval_unary_elementwise(primitive, inputs, f64::cosh),
        Primitive::Tanh => eval_unary_elementwise(primitive, inputs, f64::tanh),
        // Comparison
        Primitive::Eq => eval_comparison(primitive, inputs, |a, b| a == b, |a, b| a == b),
        Primitive::Ne => eval_comparison(primitive, inputs, |a, b| a != b, |a, b| a != b),
        Primitive::Lt => eval_comparison(primitive, inputs, |a, b| a < b, |a, b| a < b),
        Primitive::Le => eval_comparison(primitive, inputs, |a, b| a <= b, |a, b| a <= b),
        Primitive::Gt => eval_comparison(primitive, inputs, |a, b| a > b, |a, b| a > b),
        Primitive::Ge => eval_comparison(primitive, inputs, |a, b| a >= b, |a, b| a >= b),
        // Logical / bitwise
        Primitive::And => eval_logical_binary(primitive, inputs, |a, b| a && b, |a, b| a & b),
        Primitive::Or => eval_logical_binary(primitive, inputs, |a, b| a || b, |a, b| a | b),
        Primitive::Xor => eval_logical_binary(primitive, inputs, |a, b| a ^ b, |a, b| a ^ b),
        Primitive::Not => eval_not(inputs),
        // Selection / conversion
        Primitive::SelectN => eval_select_n(inputs),
        Primitive::Clamp => eval_clamp(inputs),
        Primitive::ConvertElementType => eval_convert_element_type(inputs, params),
        Primitive::StopGradient => match inputs {
            [x] => Ok(x.clone()),
            _ => Err(EvalError::ArityMismatch {
                primitive,
                expected: 1,
                actual: inputs.len(),
            }),
        },
        // Shape manipulation
        Primitive::BroadcastInDim => eval_broadcast_in_dim(inputs, params),
        Primitive::Reshape => eval_reshape(inputs, params),
        Primitive::Transpose => eval_transpose(inputs, params),
        Primitive::Rev => eval_rev(inputs, params),
        Primitive::Slice => eval_slice(inputs, params),
        Primitive::Pad => eval_pad(inputs, params),
        Primitive::Concatenate => eval_concatenate(inputs, params),
        Primitive::DynamicSlice => eval_dynamic_slice(inputs, params),
        Primitive::DynamicUpdateSlice => eval_dynamic_update_slice(inputs),
        Primitive::ReduceSum => eval_reduce_sum(inputs, params),
        Primitive::Cond
        | Primitive::While
        | Primitive::Scan
        | Primitive::RefGet
        | Primitive::RefSwap
        | Primitive::RefAddUpdate => Err(EvalError::Unsupported {
            primitive,
            detail: "not a numeric kernel; evaluate through the interpreter".to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fj_core::{AbstractValue, DType};
    use proptest::prelude::*;

    #[test]
    fn control_flow_is_not_a_kernel() {
        let err = eval_primitive(Primitive::Scan, &[], &BTreeMap::new()).expect_err("scan");
        assert!(matches!(err, EvalError::Unsupported { .. }));
    }

    #[test]
    fn stop_gradient_passes_its_operand_through() {
        let x = Value::vector_f64(&[1.5, -2.0]).expect("x");
        let out = eval_primitive(Primitive::StopGradient, &[x.clone()], &BTreeMap::new())
            .expect("stop_gradient");
        assert_eq!(out, x);

        let err = eval_primitive(Primitive::StopGradient, &[x.clone(), x], &BTreeMap::new())
            .expect_err("two operands");
        assert_eq!(
            err.to_string(),
            "arity mismatch for stop_gradient: expected 1, got 2"
        );
    }

    #[test]
    fn value_errors_surface_as_invalid_tensors() {
        let err = EvalError::from(ValueError::EmptyAxisStack);
        assert_eq!(err.to_string(), "invalid tensor: cannot stack empty slice list");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn kernel_output_matches_abstract_eval_shape() {
        let params = BTreeMap::from([
            ("shape".to_owned(), "2,3".to_owned()),
            ("broadcast_dimensions".to_owned(), "1".to_owned()),
        ]);
        let v = Value::vector_f64(&[1.0, 2.0, 3.0]).expect("vector");
        let out = eval_primitive(Primitive::BroadcastInDim, &[v.clone()], &params).expect("eval");
        let aval = abstract_eval(Primitive::BroadcastInDim, &[v.aval()], &params).expect("aval");
        assert_eq!(out.aval(), aval);
    }

    #[test]
    fn sign_of_zero_is_zero() {
        let out = eval_primitive(Primitive::Sign, &[Value::scalar_f64(0.0)], &BTreeMap::new())
            .expect("sign");
        assert_eq!(out.as_f64_scalar(), Some(0.0));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(
            fj_test_utils::property_test_case_count()
        ))]

        #[test]
        fn prop_add_commutes(a in -1.0e6_f64..1.0e6, b in -1.0e6_f64..1.0e6) {
            let none = BTreeMap::new();
            let ab = eval_primitive(Primitive::Add, &[Value::scalar_f64(a), Value::scalar_f64(b)], &none)
                .expect("ab");
            let ba = eval_primitive(Primitive::Add, &[Value::scalar_f64(b), Value::scalar_f64(a)], &none)
                .expect("ba");
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn prop_transpose_twice_is_identity(rows in 1_u32..4, cols in 1_u32..4) {
            let count = (rows * cols) as usize;
            let data: Vec<f64> = (0..count).map(|i| i as f64).collect();
            let m = Value::from_f64s(DType::F32, Shape::new(vec![rows, cols]), &data).expect("m");
            let params = BTreeMap::from([("permutation".to_owned(), "1,0".to_owned())]);
            let t = eval_primitive(Primitive::Transpose, &[m.clone()], &params).expect("t");
            prop_assert_eq!(
                t.aval(),
                AbstractValue::new(DType::F32, Shape::new(vec![cols, rows]))
            );
            let tt = eval_primitive(Primitive::Transpose, &[t], &params).expect("tt");
            prop_assert_eq!(tt, m);
        }
    }
}
