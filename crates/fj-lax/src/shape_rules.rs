#![forbid(unsafe_code)]

//! Abstract evaluation: output shape/dtype of each numeric primitive.

use fj_core::{AbstractValue, DType, Primitive, Shape};
use std::collections::BTreeMap;

use crate::EvalError;
use crate::tensor_ops::{parse_i64_param, parse_usize_param};
use crate::type_promotion::promote_avals;

fn expect_arity(
    primitive: Primitive,
    inputs: &[AbstractValue],
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

/// Elementwise operands must share a shape, except rank-0 operands which
/// broadcast against anything.
pub(crate) fn elementwise_shape(
    primitive: Primitive,
    inputs: &[AbstractValue],
) -> Result<Shape, EvalError> {
    let mut out: Option<&Shape> = None;
    for aval in inputs {
        if aval.is_scalar() {
            continue;
        }
        match out {
            None => out = Some(&aval.shape),
            Some(shape) if *shape == aval.shape => {}
            Some(shape) => {
                return Err(EvalError::ShapeMismatch {
                    primitive,
                    left: shape.clone(),
                    right: aval.shape.clone(),
                });
            }
        }
    }
    Ok(out.cloned().unwrap_or_else(Shape::scalar))
}

fn require_numeric(primitive: Primitive, aval: &AbstractValue) -> Result<(), EvalError> {
    if aval.dtype == DType::Bool {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: format!("expected a numeric operand, got {aval}"),
        });
    }
    Ok(())
}

fn require_float(primitive: Primitive, aval: &AbstractValue) -> Result<(), EvalError> {
    if !aval.dtype.is_floating() {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: format!("expected a floating-point operand, got {aval}"),
        });
    }
    Ok(())
}

pub(crate) fn slice_dims(
    primitive: Primitive,
    shape: &Shape,
    starts: &[usize],
    limits: &[usize],
    strides: &[usize],
) -> Result<Vec<u32>, EvalError> {
    let mut dims = Vec::with_capacity(shape.rank());
    for axis in 0..shape.rank() {
        let (start, limit, stride) = (starts[axis], limits[axis], strides[axis]);
        if stride == 0 || start > limit || limit > shape.dims[axis] as usize {
            return Err(EvalError::Unsupported {
                primitive,
                detail: format!(
                    "invalid slice [{start}:{limit}:{stride}] on axis {axis} of shape {shape}"
                ),
            });
        }
        dims.push((limit - start).div_ceil(stride) as u32);
    }
    Ok(dims)
}

pub(crate) fn pad_dims(shape: &Shape, low: &[usize], high: &[usize], interior: &[usize]) -> Vec<u32> {
    shape
        .dims
        .iter()
        .enumerate()
        .map(|(axis, &dim)| {
            let dim = dim as usize;
            let inner = if dim == 0 { 0 } else { dim + (dim - 1) * interior[axis] };
            (low[axis] + inner + high[axis]) as u32
        })
        .collect()
}

pub(crate) fn concatenate_dims(
    primitive: Primitive,
    shapes: &[Shape],
    axis: usize,
) -> Result<Vec<u32>, EvalError> {
    let Some(first) = shapes.first() else {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected: 1,
            actual: 0,
        });
    };
    if axis >= first.rank() {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("dimension {axis} out of range for shape {first}"),
        });
    }
    let mut dims = first.dims.clone();
    dims[axis] = 0;
    for shape in shapes {
        let compatible = shape.rank() == first.rank()
            && shape
                .dims
                .iter()
                .zip(&first.dims)
                .enumerate()
                .all(|(idx, (a, b))| idx == axis || a == b);
        if !compatible {
            return Err(EvalError::ShapeMismatch {
                primitive,
                left: first.clone(),
                right: shape.clone(),
            });
        }
        dims[axis] += shape.dims[axis];
    }
    Ok(dims)
}

fn u32_param(
    primitive: Primitive,
    key: &str,
    params: &BTreeMap<String, String>,
) -> Result<Vec<u32>, EvalError> {
    Ok(parse_usize_param(primitive, key, params)?
        .into_iter()
        .map(|d| d as u32)
        .collect())
}

/// Output abstract value of a numeric primitive.
pub fn abstract_eval(
    primitive: Primitive,
    inputs: &[AbstractValue],
    params: &BTreeMap<String, String>,
) -> Result<AbstractValue, EvalError> {
    match primitive {
        Primitive::Add
        | Primitive::Sub
        | Primitive::Mul
        | Primitive::Div
        | Primitive::Max
        | Primitive::Min => {
            expect_arity(primitive, inputs, 2)?;
            let (dtype, weak_type) = promote_avals(primitive, inputs)?;
            let aval = AbstractValue {
                dtype,
                shape: elementwise_shape(primitive, inputs)?,
                weak_type,
            };
            require_numeric(primitive, &aval)?;
            Ok(aval)
        }
        Primitive::StopGradient => {
            expect_arity(primitive, inputs, 1)?;
            Ok(inputs[0].clone())
        }
        Primitive::Neg | Primitive::Sign => {
            expect_arity(primitive, inputs, 1)?;
            require_numeric(primitive, &inputs[0])?;
            Ok(inputs[0].clone())
        }
        Primitive::Exp
        | Primitive::Log
        | Primitive::Sin
        | Primitive::Cos
        | Primitive::Sinh
        | Primitive::Cosh
        | Primitive::Tanh => {
            expect_arity(primitive, inputs, 1)?;
            require_float(primitive, &inputs[0])?;
            Ok(inputs[0].clone())
        }
        Primitive::Eq
        | Primitive::Ne
        | Primitive::Lt
        | Primitive::Le
        | Primitive::Gt
        | Primitive::Ge => {
            expect_arity(primitive, inputs, 2)?;
            promote_avals(primitive, inputs)?;
            Ok(AbstractValue::new(
                DType::Bool,
                elementwise_shape(primitive, inputs)?,
            ))
        }
        Primitive::And | Primitive::Or | Primitive::Xor => {
            expect_arity(primitive, inputs, 2)?;
            let (dtype, weak_type) = promote_avals(primitive, inputs)?;
            if dtype.is_floating() {
                return Err(EvalError::TypeMismatch {
                    primitive,
                    detail: format!("expected boolean or integer operands, got {dtype}"),
                });
            }
            Ok(AbstractValue {
                dtype,
                shape: elementwise_shape(primitive, inputs)?,
                weak_type,
            })
        }
        Primitive::Not => {
            expect_arity(primitive, inputs, 1)?;
            if inputs[0].dtype.is_floating() {
                return Err(EvalError::TypeMismatch {
                    primitive,
                    detail: format!("expected boolean or integer operand, got {}", inputs[0]),
                });
            }
            Ok(inputs[0].clone())
        }
        Primitive::SelectN => {
            let Some((which, cases)) = inputs.split_first() else {
                return Err(EvalError::ArityMismatch {
                    primitive,
                    expected: 2,
                    actual: 0,
                });
            };
            if cases.is_empty() {
                return Err(EvalError::ArityMismatch {
                    primitive,
                    expected: 2,
                    actual: inputs.len(),
                });
            }
            if which.dtype.is_floating() || (which.dtype == DType::Bool && cases.len() > 2) {
                return Err(EvalError::TypeMismatch {
                    primitive,
                    detail: format!(
                        "selector must be boolean (at most two cases) or integer, got {which}"
                    ),
                });
            }
            let (dtype, weak_type) = promote_avals(primitive, cases)?;
            let shape = elementwise_shape(primitive, cases)?;
            if !which.is_scalar() && which.shape != shape {
                return Err(EvalError::ShapeMismatch {
                    primitive,
                    left: which.shape.clone(),
                    right: shape,
                });
            }
            Ok(AbstractValue {
                dtype,
                shape,
                weak_type,
            })
        }
        Primitive::Clamp => {
            expect_arity(primitive, inputs, 3)?;
            let (dtype, weak_type) = promote_avals(primitive, inputs)?;
            let operand = &inputs[1];
            for bound in [&inputs[0], &inputs[2]] {
                if !bound.is_scalar() && bound.shape != operand.shape {
                    return Err(EvalError::ShapeMismatch {
                        primitive,
                        left: bound.shape.clone(),
                        right: operand.shape.clone(),
                    });
                }
            }
            Ok(AbstractValue {
                dtype,
                shape: operand.shape.clone(),
                weak_type,
            })
        }
        Primitive::ConvertElementType => {
            expect_arity(primitive, inputs, 1)?;
            let raw = params.get("new_dtype").ok_or_else(|| EvalError::Unsupported {
                primitive,
                detail: "missing required param 'new_dtype'".to_owned(),
            })?;
            let dtype = DType::parse(raw).ok_or_else(|| EvalError::Unsupported {
                primitive,
                detail: format!("unknown dtype '{raw}'"),
            })?;
            Ok(AbstractValue::new(dtype, inputs[0].shape.clone()))
        }
        Primitive::BroadcastInDim => {
            expect_arity(primitive, inputs, 1)?;
            let shape = Shape::new(u32_param(primitive, "shape", params)?);
            let bdims = parse_usize_param(primitive, "broadcast_dimensions", params)?;
            let operand = &inputs[0];
            if bdims.len() != operand.rank()
                || bdims.iter().enumerate().any(|(axis, &target)| {
                    target >= shape.rank()
                        || (operand.shape.dims[axis] != 1
                            && operand.shape.dims[axis] != shape.dims[target])
                })
            {
                return Err(EvalError::ShapeMismatch {
                    primitive,
                    left: operand.shape.clone(),
                    right: shape,
                });
            }
            Ok(operand.with_shape(shape))
        }
        Primitive::Reshape => {
            expect_arity(primitive, inputs, 1)?;
            let shape = Shape::new(u32_param(primitive, "new_sizes", params)?);
            if shape.element_count() != inputs[0].shape.element_count() {
                return Err(EvalError::ShapeMismatch {
                    primitive,
                    left: inputs[0].shape.clone(),
                    right: shape,
                });
            }
            Ok(inputs[0].with_shape(shape))
        }
        Primitive::Transpose => {
            expect_arity(primitive, inputs, 1)?;
            let perm = parse_usize_param(primitive, "permutation", params)?;
            let operand = &inputs[0];
            let mut seen = vec![false; operand.rank()];
            if perm.len() != operand.rank()
                || perm
                    .iter()
                    .any(|&axis| axis >= seen.len() || std::mem::replace(&mut seen[axis], true))
            {
                return Err(EvalError::Unsupported {
                    primitive,
                    detail: format!("invalid permutation {perm:?} for shape {}", operand.shape),
                });
            }
            let dims = perm.iter().map(|&axis| operand.shape.dims[axis]).collect();
            Ok(operand.with_shape(Shape::new(dims)))
        }
        Primitive::Rev => {
            expect_arity(primitive, inputs, 1)?;
            let axes = parse_usize_param(primitive, "dimensions", params)?;
            if axes.iter().any(|&axis| axis >= inputs[0].rank()) {
                return Err(EvalError::Unsupported {
                    primitive,
                    detail: format!("dimensions {axes:?} out of range for {}", inputs[0]),
                });
            }
            Ok(inputs[0].clone())
        }
        Primitive::Slice => {
            expect_arity(primitive, inputs, 1)?;
            let operand = &inputs[0];
            let starts = parse_usize_param(primitive, "start_indices", params)?;
            let limits = parse_usize_param(primitive, "limit_indices", params)?;
            let strides = parse_usize_param(primitive, "strides", params)?;
            let rank = operand.rank();
            if starts.len() != rank || limits.len() != rank || strides.len() != rank {
                return Err(EvalError::Unsupported {
                    primitive,
                    detail: format!("slice params must have rank {rank} entries"),
                });
            }
            let dims = slice_dims(primitive, &operand.shape, &starts, &limits, &strides)?;
            Ok(operand.with_shape(Shape::new(dims)))
        }
        Primitive::Pad => {
            expect_arity(primitive, inputs, 2)?;
            let operand = &inputs[0];
            if !inputs[1].is_scalar() {
                return Err(EvalError::TypeMismatch {
                    primitive,
                    detail: format!("padding value must be a scalar, got {}", inputs[1]),
                });
            }
            let low = parse_usize_param(primitive, "padding_low", params)?;
            let high = parse_usize_param(primitive, "padding_high", params)?;
            let interior = parse_usize_param(primitive, "padding_interior", params)?;
            let rank = operand.rank();
            if low.len() != rank || high.len() != rank || interior.len() != rank {
                return Err(EvalError::Unsupported {
                    primitive,
                    detail: format!("padding config must have rank {rank} entries"),
                });
            }
            Ok(operand.with_shape(Shape::new(pad_dims(&operand.shape, &low, &high, &interior))))
        }
        Primitive::Concatenate => {
            let axis = parse_i64_param(primitive, "dimension", params)?
                .first()
                .copied()
                .unwrap_or(0);
            let shapes: Vec<Shape> = inputs.iter().map(|aval| aval.shape.clone()).collect();
            let dims = concatenate_dims(primitive, &shapes, axis.max(0) as usize)?;
            let (dtype, weak_type) = promote_avals(primitive, inputs)?;
            Ok(AbstractValue {
                dtype,
                shape: Shape::new(dims),
                weak_type,
            })
        }
        Primitive::DynamicSlice => {
            let Some((operand, indices)) = inputs.split_first() else {
                return Err(EvalError::ArityMismatch {
                    primitive,
                    expected: 1,
                    actual: 0,
                });
            };
            check_start_indices(primitive, operand, indices)?;
            let sizes = u32_param(primitive, "slice_sizes", params)?;
            if sizes.len() != operand.rank()
                || sizes.iter().zip(&operand.shape.dims).any(|(s, d)| s > d)
            {
                return Err(EvalError::ShapeMismatch {
                    primitive,
                    left: operand.shape.clone(),
                    right: Shape::new(sizes),
                });
            }
            Ok(operand.with_shape(Shape::new(sizes)))
        }
        Primitive::DynamicUpdateSlice => {
            if inputs.len() < 2 {
                return Err(EvalError::ArityMismatch {
                    primitive,
                    expected: 2,
                    actual: inputs.len(),
                });
            }
            let operand = &inputs[0];
            let update = &inputs[1];
            check_start_indices(primitive, operand, &inputs[2..])?;
            if update.rank() != operand.rank()
                || update
                    .shape
                    .dims
                    .iter()
                    .zip(&operand.shape.dims)
                    .any(|(u, d)| u > d)
            {
                return Err(EvalError::ShapeMismatch {
                    primitive,
                    left: operand.shape.clone(),
                    right: update.shape.clone(),
                });
            }
            Ok(operand.clone())
        }
        Primitive::ReduceSum => {
            expect_arity(primitive, inputs, 1)?;
            let axes = parse_usize_param(primitive, "axes", params)?;
            let operand = &inputs[0];
            if axes.iter().any(|&axis| axis >= operand.rank()) {
                return Err(EvalError::Unsupported {
                    primitive,
                    detail: format!("axes {axes:?} out of range for {operand}"),
                });
            }
            require_numeric(primitive, operand)?;
            let dims = operand
                .shape
                .dims
                .iter()
                .enumerate()
                .filter(|(axis, _)| !axes.contains(axis))
                .map(|(_, &dim)| dim)
                .collect();
            Ok(operand.with_shape(Shape::new(dims)))
        }
        Primitive::Cond
        | Primitive::While
        | Primitive::Scan
        | Primitive::RefGet
        | Primitive::RefSwap
        | Primitive::RefAddUpdate => Err(EvalError::Unsupported {
            primitive,
            detail: "abstract evaluation is owned by the construct that builds this equation"
                .to_owned(),
        }),
    }
}

fn check_start_indices(
    primitive: Primitive,
    operand: &AbstractValue,
    indices: &[AbstractValue],
) -> Result<(), EvalError> {
    if indices.len() != operand.rank() {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected: operand.rank() + 1,
            actual: indices.len() + 1,
        });
    }
    if let Some(bad) = indices
        .iter()
        .find(|idx| !idx.is_scalar() || !idx.dtype.is_integral())
    {
        return Err(EvalError::TypeMismatch {
            primitive,
            detail: format!("start indices must be integer scalars, got {bad}"),
        });
    }
    Ok(())
}
