#![forbid(unsafe_code)]

use fj_core::{Literal, Primitive, Shape, Value};
use std::collections::BTreeMap;

use crate::EvalError;

/// Parse a comma-separated list of i64 values from a param string. An empty
/// string is the empty list.
pub fn parse_i64_param(
    primitive: Primitive,
    key: &str,
    params: &BTreeMap<String, String>,
) -> Result<Vec<i64>, EvalError> {
    let raw = params.get(key).ok_or_else(|| EvalError::Unsupported {
        primitive,
        detail: format!("missing required param '{key}'"),
    })?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|s| {
            s.trim().parse::<i64>().map_err(|_| EvalError::Unsupported {
                primitive,
                detail: format!("invalid integer in param '{key}': '{s}'"),
            })
        })
        .collect()
}

/// Parse a comma-separated list of usize values from a param string.
pub fn parse_usize_param(
    primitive: Primitive,
    key: &str,
    params: &BTreeMap<String, String>,
) -> Result<Vec<usize>, EvalError> {
    let raw = params.get(key).ok_or_else(|| EvalError::Unsupported {
        primitive,
        detail: format!("missing required param '{key}'"),
    })?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|_| EvalError::Unsupported {
                    primitive,
                    detail: format!("invalid usize in param '{key}': '{s}'"),
                })
        })
        .collect()
}

pub(crate) fn row_major_strides(dims: &[u32]) -> Vec<usize> {
    let mut strides = vec![1_usize; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1] as usize;
    }
    strides
}

fn unravel(mut flat: usize, dims: &[u32], out: &mut [usize]) {
    for axis in (0..dims.len()).rev() {
        let dim = dims[axis] as usize;
        if dim == 0 {
            out[axis] = 0;
            continue;
        }
        out[axis] = flat % dim;
        flat /= dim;
    }
}

fn expect_arity(primitive: Primitive, inputs: &[Value], expected: usize) -> Result<(), EvalError> {
    if inputs.len() != expected {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected,
            actual: inputs.len(),
        });
    }
    Ok(())
}

fn element_count(shape: &Shape) -> Result<usize, EvalError> {
    shape
        .element_count()
        .map(|count| count as usize)
        .ok_or_else(|| EvalError::InvalidTensor(fj_core::ValueError::ShapeOverflow {
            shape: shape.clone(),
        }))
}

/// Reshape: same elements, new dims. Params: `new_sizes`.
pub(crate) fn eval_reshape(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Reshape;
    expect_arity(primitive, inputs, 1)?;
    let dims: Vec<u32> = parse_usize_param(primitive, "new_sizes", params)?
        .into_iter()
        .map(|d| d as u32)
        .collect();
    let operand = &inputs[0];
    let shape = Shape::new(dims);
    if element_count(&shape)? != operand.len() {
        return Err(EvalError::ShapeMismatch {
            primitive,
            left: operand.shape.clone(),
            right: shape,
        });
    }
    Ok(Value::new(operand.dtype, shape, operand.elements.clone())?)
}

/// Transpose: permute axes. Params: `permutation`.
pub(crate) fn eval_transpose(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Transpose;
    expect_arity(primitive, inputs, 1)?;
    let operand = &inputs[0];
    let perm = parse_usize_param(primitive, "permutation", params)?;
    let rank = operand.rank();
    if perm.len() != rank {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!("permutation {perm:?} does not match rank {rank}"),
        });
    }

    let in_dims = &operand.shape.dims;
    let out_dims: Vec<u32> = perm.iter().map(|&axis| in_dims[axis]).collect();
    let in_strides = row_major_strides(in_dims);
    let count = operand.len();
    let mut elements = Vec::with_capacity(count);
    let mut out_index = vec![0_usize; rank];
    for flat in 0..count {
        unravel(flat, &out_dims, &mut out_index);
        let src: usize = out_index
            .iter()
            .zip(&perm)
            .map(|(&idx, &axis)| idx * in_strides[axis])
            .sum();
        elements.push(operand.elements[src]);
    }
    Ok(Value::new(operand.dtype, Shape::new(out_dims), elements)?)
}

/// Reverse the listed axes. Params: `dimensions`.
pub(crate) fn eval_rev(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Rev;
    expect_arity(primitive, inputs, 1)?;
    let operand = &inputs[0];
    let axes = parse_usize_param(primitive, "dimensions", params)?;
    let dims = &operand.shape.dims;
    let strides = row_major_strides(dims);
    let mut index = vec![0_usize; dims.len()];
    let mut elements = Vec::with_capacity(operand.len());
    for flat in 0..operand.len() {
        unravel(flat, dims, &mut index);
        let src: usize = index
            .iter()
            .enumerate()
            .map(|(axis, &idx)| {
                let idx = if axes.contains(&axis) {
                    dims[axis] as usize - 1 - idx
                } else {
                    idx
                };
                idx * strides[axis]
            })
            .sum();
        elements.push(operand.elements[src]);
    }
    Ok(Value::new(operand.dtype, operand.shape.clone(), elements)?)
}

/// Broadcast an operand into `shape`, mapping operand axis i to output axis
/// `broadcast_dimensions[i]`. Operand dims must be 1 or equal the target.
pub(crate) fn eval_broadcast_in_dim(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::BroadcastInDim;
    expect_arity(primitive, inputs, 1)?;
    let operand = &inputs[0];
    let out_dims: Vec<u32> = parse_usize_param(primitive, "shape", params)?
        .into_iter()
        .map(|d| d as u32)
        .collect();
    let bdims = parse_usize_param(primitive, "broadcast_dimensions", params)?;
    if bdims.len() != operand.rank() {
        return Err(EvalError::Unsupported {
            primitive,
            detail: format!(
                "broadcast_dimensions {bdims:?} does not match operand rank {}",
                operand.rank()
            ),
        });
    }
    for (axis, &target) in bdims.iter().enumerate() {
        let dim = operand.shape.dims[axis];
        if target >= out_dims.len() || (dim != 1 && dim != out_dims[target]) {
            return Err(EvalError::ShapeMismatch {
                primitive,
                left: operand.shape.clone(),
                right: Shape::new(out_dims),
            });
        }
    }

    let out_shape = Shape::new(out_dims);
    let count = element_count(&out_shape)?;
    let in_strides = row_major_strides(&operand.shape.dims);
    let mut out_index = vec![0_usize; out_shape.rank()];
    let mut elements = Vec::with_capacity(count);
    for flat in 0..count {
        unravel(flat, &out_shape.dims, &mut out_index);
        let src: usize = bdims
            .iter()
            .enumerate()
            .map(|(axis, &target)| {
                if operand.shape.dims[axis] == 1 {
                    0
                } else {
                    out_index[target] * in_strides[axis]
                }
            })
            .sum();
        elements.push(operand.elements[src]);
    }
    Ok(Value::new(operand.dtype, out_shape, elements)?)
}

/// Static strided slice. Params: `start_indices`, `limit_indices`, `strides`.
pub(crate) fn eval_slice(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Slice;
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

    let out_dims = crate::shape_rules::slice_dims(primitive, &operand.shape, &starts, &limits, &strides)?;
    let in_strides = row_major_strides(&operand.shape.dims);
    let out_shape = Shape::new(out_dims);
    let count = element_count(&out_shape)?;
    let mut out_index = vec![0_usize; rank];
    let mut elements = Vec::with_capacity(count);
    for flat in 0..count {
        unravel(flat, &out_shape.dims, &mut out_index);
        let src: usize = (0..rank)
            .map(|axis| (starts[axis] + out_index[axis] * strides[axis]) * in_strides[axis])
            .sum();
        elements.push(operand.elements[src]);
    }
    Ok(Value::new(operand.dtype, out_shape, elements)?)
}

/// Pad with low/high/interior padding (all non-negative). Params:
/// `padding_low`, `padding_high`, `padding_interior`.
pub(crate) fn eval_pad(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Pad;
    expect_arity(primitive, inputs, 2)?;
    let operand = &inputs[0];
    let pad_value = inputs[1]
        .as_scalar_literal()
        .ok_or_else(|| EvalError::TypeMismatch {
            primitive,
            detail: "padding value must be a scalar".to_owned(),
        })?;
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

    let out_dims = crate::shape_rules::pad_dims(&operand.shape, &low, &high, &interior);
    let out_shape = Shape::new(out_dims);
    let out_strides = row_major_strides(&out_shape.dims);
    let mut elements = vec![pad_value.cast(operand.dtype); element_count(&out_shape)?];
    let mut in_index = vec![0_usize; rank];
    for flat in 0..operand.len() {
        unravel(flat, &operand.shape.dims, &mut in_index);
        let dst: usize = (0..rank)
            .map(|axis| (low[axis] + in_index[axis] * (interior[axis] + 1)) * out_strides[axis])
            .sum();
        elements[dst] = operand.elements[flat];
    }
    Ok(Value::new(operand.dtype, out_shape, elements)?)
}

/// Concatenate along `dimension`.
pub(crate) fn eval_concatenate(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::Concatenate;
    let Some(first) = inputs.first() else {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected: 1,
            actual: 0,
        });
    };
    let axis = parse_usize_param(primitive, "dimension", params)?
        .first()
        .copied()
        .unwrap_or(0);
    let shapes: Vec<Shape> = inputs.iter().map(|v| v.shape.clone()).collect();
    let out_shape = Shape::new(crate::shape_rules::concatenate_dims(primitive, &shapes, axis)?);

    let outer: usize = first.shape.dims[..axis].iter().map(|&d| d as usize).product();
    let mut elements = Vec::with_capacity(element_count(&out_shape)?);
    for block in 0..outer {
        for value in inputs {
            let inner: usize = value.shape.dims[axis..].iter().map(|&d| d as usize).product();
            let start = block * inner;
            elements.extend(
                value.elements[start..start + inner]
                    .iter()
                    .map(|lit| lit.cast(first.dtype)),
            );
        }
    }
    Ok(Value::new(first.dtype, out_shape, elements)?)
}

fn clamped_starts(
    primitive: Primitive,
    operand_dims: &[u32],
    window: &[u32],
    index_values: &[Value],
) -> Result<Vec<usize>, EvalError> {
    index_values
        .iter()
        .enumerate()
        .map(|(axis, value)| {
            let raw = value
                .as_scalar_literal()
                .and_then(Literal::as_i64)
                .ok_or_else(|| EvalError::TypeMismatch {
                    primitive,
                    detail: "start indices must be integer scalars".to_owned(),
                })?;
            let max_start = i64::from(operand_dims[axis]) - i64::from(window[axis]);
            Ok(raw.clamp(0, max_start.max(0)) as usize)
        })
        .collect()
}

/// Dynamic slice of size `slice_sizes` at runtime start indices, clamped so
/// the window stays in bounds.
pub(crate) fn eval_dynamic_slice(
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Value, EvalError> {
    let primitive = Primitive::DynamicSlice;
    let Some((operand, index_values)) = inputs.split_first() else {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected: 1,
            actual: 0,
        });
    };
    let rank = operand.rank();
    if index_values.len() != rank {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected: rank + 1,
            actual: inputs.len(),
        });
    }
    let sizes: Vec<u32> = parse_usize_param(primitive, "slice_sizes", params)?
        .into_iter()
        .map(|d| d as u32)
        .collect();
    if sizes.len() != rank || sizes.iter().zip(&operand.shape.dims).any(|(s, d)| s > d) {
        return Err(EvalError::ShapeMismatch {
            primitive,
            left: operand.shape.clone(),
            right: Shape::new(sizes),
        });
    }
    let starts = clamped_starts(primitive, &operand.shape.dims, &sizes, index_values)?;
    let in_strides = row_major_strides(&operand.shape.dims);
    let out_shape = Shape::new(sizes);
    let count = element_count(&out_shape)?;
    let mut out_index = vec![0_usize; rank];
    let mut elements = Vec::with_capacity(count);
    for flat in 0..count {
        unravel(flat, &out_shape.dims, &mut out_index);
        let src: usize = (0..rank)
            .map(|axis| (starts[axis] + out_index[axis]) * in_strides[axis])
            .sum();
        elements.push(operand.elements[src]);
    }
    Ok(Value::new(operand.dtype, out_shape, elements)?)
}

/// Write `update` into `operand` at runtime start indices, clamped so the
/// window stays in bounds.
pub(crate) fn eval_dynamic_update_slice(inputs: &[Value]) -> Result<Value, EvalError> {
    let primitive = Primitive::DynamicUpdateSlice;
    if inputs.len() < 2 {
        return Err(EvalError::ArityMismatch {
            primitive,
            expected: 2,
            actual: inputs.len(),
        });
    }
    let operand = &inputs[0];
    let update = &inputs[1];
    let index_values = &inputs[2..];
    let rank = operand.rank();
    if update.rank() != rank
        || index_values.len() != rank
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
    let starts = clamped_starts(primitive, &operand.shape.dims, &update.shape.dims, index_values)?;
    let out_strides = row_major_strides(&operand.shape.dims);
    let mut elements = operand.elements.clone();
    let mut upd_index = vec![0_usize; rank];
    for flat in 0..update.len() {
        unravel(flat, &update.shape.dims, &mut upd_index);
        let dst: usize = (0..rank)
            .map(|axis| (starts[axis] + upd_index[axis]) * out_strides[axis])
            .sum();
        elements[dst] = update.elements[flat].cast(operand.dtype);
    }
    Ok(Value::new(operand.dtype, operand.shape.clone(), elements)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fj_core::DType;

    fn params(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn matrix() -> Value {
        Value::from_f64s(
            DType::F64,
            Shape::new(vec![2, 3]),
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        )
        .expect("matrix")
    }

    #[test]
    fn transpose_swaps_axes() {
        let out = eval_transpose(&[matrix()], &params(&[("permutation", "1,0")])).expect("transpose");
        assert_eq!(out.shape.dims, vec![3, 2]);
        assert_eq!(out.to_f64_vec(), Some(vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]));
    }

    #[test]
    fn broadcast_scalar_to_matrix() {
        let out = eval_broadcast_in_dim(
            &[Value::scalar_f64(7.0)],
            &params(&[("shape", "2,2"), ("broadcast_dimensions", "")]),
        )
        .expect("broadcast");
        assert_eq!(out.to_f64_vec(), Some(vec![7.0; 4]));
    }

    #[test]
    fn broadcast_vector_along_leading_axis() {
        let v = Value::vector_f64(&[1.0, 2.0]).expect("vector");
        let out = eval_broadcast_in_dim(
            &[v],
            &params(&[("shape", "2,3"), ("broadcast_dimensions", "0")]),
        )
        .expect("broadcast");
        assert_eq!(out.to_f64_vec(), Some(vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]));
    }

    #[test]
    fn strided_slice_takes_every_other_element() {
        let v = Value::vector_f64(&[0.0, 1.0, 2.0, 3.0, 4.0]).expect("vector");
        let out = eval_slice(
            &[v],
            &params(&[("start_indices", "1"), ("limit_indices", "5"), ("strides", "2")]),
        )
        .expect("slice");
        assert_eq!(out.to_f64_vec(), Some(vec![1.0, 3.0]));
    }

    #[test]
    fn interior_padding_interleaves_zeros() {
        let v = Value::vector_f64(&[1.0, 2.0, 3.0]).expect("vector");
        let out = eval_pad(
            &[v, Value::scalar_f64(0.0)],
            &params(&[
                ("padding_low", "0"),
                ("padding_high", "1"),
                ("padding_interior", "1"),
            ]),
        )
        .expect("pad");
        assert_eq!(out.to_f64_vec(), Some(vec![1.0, 0.0, 2.0, 0.0, 3.0, 0.0]));
    }

    #[test]
    fn concatenate_along_inner_axis() {
        let out = eval_concatenate(&[matrix(), matrix()], &params(&[("dimension", "1")]))
            .expect("concat");
        assert_eq!(out.shape.dims, vec![2, 6]);
        assert_eq!(
            out.to_f64_vec(),
            Some(vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 4.0, 5.0, 6.0])
        );
    }

    #[test]
    fn dynamic_slice_clamps_start() {
        let out = eval_dynamic_slice(
            &[matrix(), Value::scalar_i64(5), Value::scalar_i64(1)],
            &params(&[("slice_sizes", "1,2")]),
        )
        .expect("dynamic_slice");
        assert_eq!(out.to_f64_vec(), Some(vec![5.0, 6.0]));
    }

    #[test]
    fn dynamic_update_slice_writes_window() {
        let update = Value::from_f64s(DType::F64, Shape::new(vec![1, 2]), &[9.0, 8.0]).expect("update");
        let out = eval_dynamic_update_slice(&[
            matrix(),
            update,
            Value::scalar_i64(0),
            Value::scalar_i64(1),
        ])
        .expect("dus");
        assert_eq!(out.to_f64_vec(), Some(vec![1.0, 9.0, 8.0, 4.0, 5.0, 6.0]));
    }

    #[test]
    fn rev_flips_axis() {
        let out = eval_rev(&[matrix()], &params(&[("dimensions", "1")])).expect("rev");
        assert_eq!(out.to_f64_vec(), Some(vec![3.0, 2.0, 1.0, 6.0, 5.0, 4.0]));
    }
}
