use crate::{AbstractValue, DType, Shape};
use proptest::prelude::*;

pub fn arb_dtype() -> impl Strategy<Value = DType> {
    prop_oneof![
        Just(DType::F32),
        Just(DType::F64),
        Just(DType::I32),
        Just(DType::I64),
        Just(DType::Bool),
    ]
}

pub fn arb_shape() -> impl Strategy<Value = Shape> {
    prop::collection::vec(0_u32..5, 0..4).prop_map(Shape::new)
}

pub fn arb_abstract_value() -> impl Strategy<Value = AbstractValue> {
    (arb_dtype(), arb_shape(), any::<bool>()).prop_map(|(dtype, shape, weak_type)| AbstractValue {
        dtype,
        shape,
        weak_type,
    })
}
