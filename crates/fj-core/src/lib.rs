#![forbid(unsafe_code)]

#[cfg(test)]
pub mod proptest_strategies;

pub mod pretty;
pub mod tree;
pub mod typecheck;

pub use pretty::pretty_print;
pub use tree::{Tree, TreeDef, TreeError};
pub use typecheck::{LeafComparison, TypeConsistencyError, check_tree_types};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    Bool,
}

impl DType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::Bool => "bool",
        }
    }

    #[must_use]
    pub fn is_floating(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    #[must_use]
    pub fn is_integral(self) -> bool {
        matches!(self, Self::I32 | Self::I64)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "f32" => Some(Self::F32),
            "f64" => Some(Self::F64),
            "i32" => Some(Self::I32),
            "i64" => Some(Self::I64),
            "bool" => Some(Self::Bool),
            _ => None,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<u32>,
}

impl Shape {
    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: u32) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn new(dims: Vec<u32>) -> Self {
        Self { dims }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1_u64, |acc, dim| acc.checked_mul(u64::from(*dim)))
    }

    /// Shape with `len` prepended as a new leading axis.
    #[must_use]
    pub fn with_leading(&self, len: u32) -> Self {
        let mut dims = Vec::with_capacity(self.dims.len() + 1);
        dims.push(len);
        dims.extend_from_slice(&self.dims);
        Self { dims }
    }

    /// Shape with the leading axis removed, `None` for scalars.
    #[must_use]
    pub fn without_leading(&self) -> Option<Self> {
        if self.dims.is_empty() {
            return None;
        }
        Some(Self {
            dims: self.dims[1..].to_vec(),
        })
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_char('[')?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_char(',')?;
            }
            write!(f, "{dim}")?;
        }
        f.write_char(']')
    }
}

/// Shape/dtype descriptor of a value. `weak_type` marks values (literals and
/// expressions derived only from literals) that defer to strongly typed
/// operands during dtype promotion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AbstractValue {
    pub dtype: DType,
    pub shape: Shape,
    #[serde(default)]
    pub weak_type: bool,
}

impl AbstractValue {
    #[must_use]
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self {
            dtype,
            shape,
            weak_type: false,
        }
    }

    #[must_use]
    pub fn scalar(dtype: DType) -> Self {
        Self::new(dtype, Shape::scalar())
    }

    #[must_use]
    pub fn vector(dtype: DType, len: u32) -> Self {
        Self::new(dtype, Shape::vector(len))
    }

    #[must_use]
    pub fn weak_scalar(dtype: DType) -> Self {
        Self {
            dtype,
            shape: Shape::scalar(),
            weak_type: true,
        }
    }

    #[must_use]
    pub fn is_scalar(&self) -> bool {
        self.shape.rank() == 0
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Two abstract values are compatible iff shape and dtype agree.
    #[must_use]
    pub fn compatible(&self, other: &Self) -> bool {
        self.dtype == other.dtype && self.shape == other.shape
    }

    #[must_use]
    pub fn strong(&self) -> Self {
        Self {
            weak_type: false,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_dtype(&self, dtype: DType) -> Self {
        Self {
            dtype,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_shape(&self, shape: Shape) -> Self {
        Self {
            shape,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_leading(&self, len: u32) -> Self {
        self.with_shape(self.shape.with_leading(len))
    }

    #[must_use]
    pub fn without_leading(&self) -> Option<Self> {
        self.shape.without_leading().map(|shape| self.with_shape(shape))
    }
}

impl std::fmt::Display for AbstractValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.dtype, self.shape)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    I64(i64),
    Bool(bool),
    F64Bits(u64),
}

impl Literal {
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    #[must_use]
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::I64(value) => Some(value as f64),
            Self::Bool(value) => Some(if value { 1.0 } else { 0.0 }),
            Self::F64Bits(bits) => Some(f64::from_bits(bits)),
        }
    }

    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(value),
            Self::Bool(value) => Some(i64::from(value)),
            Self::F64Bits(bits) => {
                let value = f64::from_bits(bits);
                value.is_finite().then_some(value as i64)
            }
        }
    }

    #[must_use]
    pub fn as_bool(self) -> bool {
        match self {
            Self::I64(value) => value != 0,
            Self::Bool(value) => value,
            Self::F64Bits(bits) => f64::from_bits(bits) != 0.0,
        }
    }

    #[must_use]
    pub fn is_integral(self) -> bool {
        matches!(self, Self::I64(_))
    }

    /// The dtype a bare literal takes in a graph. Literals are always weakly
    /// typed, so this only picks the kind.
    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::I64(_) => DType::I64,
            Self::Bool(_) => DType::Bool,
            Self::F64Bits(_) => DType::F64,
        }
    }

    #[must_use]
    pub fn zero(dtype: DType) -> Self {
        match dtype {
            DType::F32 | DType::F64 => Self::from_f64(0.0),
            DType::I32 | DType::I64 => Self::I64(0),
            DType::Bool => Self::Bool(false),
        }
    }

    #[must_use]
    pub fn one(dtype: DType) -> Self {
        match dtype {
            DType::F32 | DType::F64 => Self::from_f64(1.0),
            DType::I32 | DType::I64 => Self::I64(1),
            DType::Bool => Self::Bool(true),
        }
    }

    /// Re-encode the literal in the representation of `dtype`, rounding to
    /// f32 precision and wrapping to i32 where needed.
    #[must_use]
    pub fn cast(self, dtype: DType) -> Self {
        match dtype {
            DType::F64 => Self::from_f64(self.as_f64().unwrap_or(f64::NAN)),
            DType::F32 => {
                let narrowed = self.as_f64().unwrap_or(f64::NAN) as f32;
                Self::from_f64(f64::from(narrowed))
            }
            DType::I64 => Self::I64(self.as_i64().unwrap_or(0)),
            DType::I32 => Self::I64(i64::from(self.as_i64().unwrap_or(0) as i32)),
            DType::Bool => Self::Bool(self.as_bool()),
        }
    }
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::I64(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::F64Bits(bits) => write!(f, "{:?}", f64::from_bits(*bits)),
        }
    }
}

/// A concrete array. Scalars are rank-0 values with one element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub dtype: DType,
    pub shape: Shape,
    pub elements: Vec<Literal>,
}

impl Value {
    pub fn new(dtype: DType, shape: Shape, elements: Vec<Literal>) -> Result<Self, ValueError> {
        let expected_count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;

        if expected_count != elements.len() as u64 {
            return Err(ValueError::ElementCountMismatch {
                shape,
                expected_count,
                actual_count: elements.len(),
            });
        }

        let elements = elements
            .into_iter()
            .map(|literal| literal.cast(dtype))
            .collect();
        Ok(Self {
            dtype,
            shape,
            elements,
        })
    }

    #[must_use]
    pub fn scalar(dtype: DType, literal: Literal) -> Self {
        Self {
            dtype,
            shape: Shape::scalar(),
            elements: vec![literal.cast(dtype)],
        }
    }

    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self::scalar(DType::F64, Literal::from_f64(value))
    }

    #[must_use]
    pub fn scalar_f32(value: f32) -> Self {
        Self::scalar(DType::F32, Literal::from_f64(f64::from(value)))
    }

    #[must_use]
    pub fn scalar_i64(value: i64) -> Self {
        Self::scalar(DType::I64, Literal::I64(value))
    }

    #[must_use]
    pub fn scalar_i32(value: i32) -> Self {
        Self::scalar(DType::I32, Literal::I64(i64::from(value)))
    }

    #[must_use]
    pub fn scalar_bool(value: bool) -> Self {
        Self::scalar(DType::Bool, Literal::Bool(value))
    }

    pub fn vector_f64(values: &[f64]) -> Result<Self, ValueError> {
        Self::from_f64s(DType::F64, Shape::vector(values.len() as u32), values)
    }

    pub fn vector_i64(values: &[i64]) -> Result<Self, ValueError> {
        Self::new(
            DType::I64,
            Shape::vector(values.len() as u32),
            values.iter().copied().map(Literal::I64).collect(),
        )
    }

    pub fn vector_bool(values: &[bool]) -> Result<Self, ValueError> {
        Self::new(
            DType::Bool,
            Shape::vector(values.len() as u32),
            values.iter().copied().map(Literal::Bool).collect(),
        )
    }

    pub fn from_f64s(dtype: DType, shape: Shape, values: &[f64]) -> Result<Self, ValueError> {
        Self::new(
            dtype,
            shape,
            values.iter().copied().map(Literal::from_f64).collect(),
        )
    }

    pub fn full(aval: &AbstractValue, literal: Literal) -> Result<Self, ValueError> {
        let count = aval.shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: aval.shape.clone(),
        })?;
        Self::new(
            aval.dtype,
            aval.shape.clone(),
            vec![literal; count as usize],
        )
    }

    pub fn zeros(aval: &AbstractValue) -> Result<Self, ValueError> {
        Self::full(aval, Literal::zero(aval.dtype))
    }

    pub fn ones(aval: &AbstractValue) -> Result<Self, ValueError> {
        Self::full(aval, Literal::one(aval.dtype))
    }

    #[must_use]
    pub fn aval(&self) -> AbstractValue {
        AbstractValue::new(self.dtype, self.shape.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    #[must_use]
    pub fn leading_dim(&self) -> Option<u32> {
        self.shape.dims.first().copied()
    }

    #[must_use]
    pub fn as_scalar_literal(&self) -> Option<Literal> {
        (self.rank() == 0).then(|| self.elements[0])
    }

    #[must_use]
    pub fn as_f64_scalar(&self) -> Option<f64> {
        self.as_scalar_literal().and_then(Literal::as_f64)
    }

    #[must_use]
    pub fn as_i64_scalar(&self) -> Option<i64> {
        self.as_scalar_literal().and_then(Literal::as_i64)
    }

    #[must_use]
    pub fn as_bool_scalar(&self) -> Option<bool> {
        self.as_scalar_literal().map(Literal::as_bool)
    }

    #[must_use]
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        self.elements.iter().copied().map(Literal::as_f64).collect()
    }

    #[must_use]
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        self.elements.iter().copied().map(Literal::as_i64).collect()
    }

    #[must_use]
    pub fn to_bool_vec(&self) -> Vec<bool> {
        self.elements.iter().copied().map(Literal::as_bool).collect()
    }

    #[must_use]
    pub fn cast(&self, dtype: DType) -> Self {
        if dtype == self.dtype {
            return self.clone();
        }
        Self {
            dtype,
            shape: self.shape.clone(),
            elements: self.elements.iter().map(|lit| lit.cast(dtype)).collect(),
        }
    }

    /// Number of elements in one leading-axis slice.
    fn slice_len(&self) -> Result<usize, ValueError> {
        self.shape
            .dims
            .iter()
            .skip(1)
            .try_fold(1_usize, |acc, dim| acc.checked_mul(*dim as usize))
            .ok_or(ValueError::ShapeOverflow {
                shape: self.shape.clone(),
            })
    }

    pub fn slice_axis0(&self, index: usize) -> Result<Value, ValueError> {
        let axis_size = self
            .leading_dim()
            .ok_or(ValueError::RankZeroAxisSliceUnsupported)?;
        if index >= axis_size as usize {
            return Err(ValueError::SliceIndexOutOfBounds {
                index,
                axis_size: axis_size as usize,
            });
        }

        let slice_len = self.slice_len()?;
        let start = index * slice_len;
        let elements = self.elements[start..start + slice_len].to_vec();
        Ok(Self {
            dtype: self.dtype,
            shape: Shape {
                dims: self.shape.dims[1..].to_vec(),
            },
            elements,
        })
    }

    /// Stack equally shaped slices along a new leading axis.
    pub fn stack_axis0(slices: &[Value]) -> Result<Self, ValueError> {
        let Some(first) = slices.first() else {
            return Err(ValueError::EmptyAxisStack);
        };

        let mut elements = Vec::with_capacity(first.elements.len() * slices.len());
        for value in slices {
            if value.dtype != first.dtype {
                return Err(ValueError::AxisStackDTypeMismatch {
                    expected: first.dtype,
                    actual: value.dtype,
                });
            }
            if value.shape != first.shape {
                return Err(ValueError::AxisStackShapeMismatch {
                    expected: first.shape.clone(),
                    actual: value.shape.clone(),
                });
            }
            elements.extend_from_slice(&value.elements);
        }

        Ok(Self {
            dtype: first.dtype,
            shape: first.shape.with_leading(slices.len() as u32),
            elements,
        })
    }

    /// Stack `slices` of abstract type `slice_aval`, allowing an empty list.
    pub fn stack_axis0_or_empty(
        slices: &[Value],
        slice_aval: &AbstractValue,
    ) -> Result<Self, ValueError> {
        if slices.is_empty() {
            return Self::new(slice_aval.dtype, slice_aval.shape.with_leading(0), Vec::new());
        }
        Self::stack_axis0(slices)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("shape element count overflowed: {shape}")]
    ShapeOverflow { shape: Shape },
    #[error(
        "element count mismatch for shape {shape}: expected {expected_count}, got {actual_count}"
    )]
    ElementCountMismatch {
        shape: Shape,
        expected_count: u64,
        actual_count: usize,
    },
    #[error("cannot axis-slice a rank-0 value")]
    RankZeroAxisSliceUnsupported,
    #[error("axis-slice index {index} out of bounds for axis size {axis_size}")]
    SliceIndexOutOfBounds { index: usize, axis_size: usize },
    #[error("cannot stack empty slice list")]
    EmptyAxisStack,
    #[error("stack shape mismatch: expected {expected}, got {actual}")]
    AxisStackShapeMismatch { expected: Shape, actual: Shape },
    #[error("stack dtype mismatch: expected {expected}, got {actual}")]
    AxisStackDTypeMismatch { expected: DType, actual: DType },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Primitive {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Sign,
    Max,
    Min,
    // Elementwise transcendental
    Exp,
    Log,
    Sin,
    Cos,
    Sinh,
    Cosh,
    Tanh,
    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // Logical / bitwise
    And,
    Or,
    Not,
    Xor,
    // Selection
    SelectN,
    Clamp,
    // Conversion
    ConvertElementType,
    /// Identity on values; its derivative is zero.
    StopGradient,
    // Shape manipulation
    BroadcastInDim,
    Reshape,
    Transpose,
    Rev,
    Slice,
    Pad,
    Concatenate,
    DynamicSlice,
    DynamicUpdateSlice,
    ReduceSum,
    // Structured control flow
    Cond,
    While,
    Scan,
    // Reference cells (state effect)
    RefGet,
    RefSwap,
    RefAddUpdate,
}

impl Primitive {
    pub const ALL: &'static [Primitive] = &[
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Div,
        Self::Neg,
        Self::Sign,
        Self::Max,
        Self::Min,
        Self::Exp,
        Self::Log,
        Self::Sin,
        Self::Cos,
        Self::Sinh,
        Self::Cosh,
        Self::Tanh,
        Self::Eq,
        Self::Ne,
        Self::Lt,
        Self::Le,
        Self::Gt,
        Self::Ge,
        Self::And,
        Self::Or,
        Self::Not,
        Self::Xor,
        Self::SelectN,
        Self::Clamp,
        Self::ConvertElementType,
        Self::StopGradient,
        Self::BroadcastInDim,
        Self::Reshape,
        Self::Transpose,
        Self::Rev,
        Self::Slice,
        Self::Pad,
        Self::Concatenate,
        Self::DynamicSlice,
        Self::DynamicUpdateSlice,
        Self::ReduceSum,
        Self::Cond,
        Self::While,
        Self::Scan,
        Self::RefGet,
        Self::RefSwap,
        Self::RefAddUpdate,
    ];

    /// Inverse of [`Primitive::as_str`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|prim| prim.as_str() == name)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Neg => "neg",
            Self::Sign => "sign",
            Self::Max => "max",
            Self::Min => "min",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Sinh => "sinh",
            Self::Cosh => "cosh",
            Self::Tanh => "tanh",
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::And => "and",
            Self::Or => "or",
            Self::Not => "not",
            Self::Xor => "xor",
            Self::SelectN => "select_n",
            Self::Clamp => "clamp",
            Self::ConvertElementType => "convert_element_type",
            Self::StopGradient => "stop_gradient",
            Self::BroadcastInDim => "broadcast_in_dim",
            Self::Reshape => "reshape",
            Self::Transpose => "transpose",
            Self::Rev => "rev",
            Self::Slice => "slice",
            Self::Pad => "pad",
            Self::Concatenate => "concatenate",
            Self::DynamicSlice => "dynamic_slice",
            Self::DynamicUpdateSlice => "dynamic_update_slice",
            Self::ReduceSum => "reduce_sum",
            Self::Cond => "cond",
            Self::While => "while",
            Self::Scan => "scan",
            Self::RefGet => "get",
            Self::RefSwap => "swap",
            Self::RefAddUpdate => "addupdate",
        }
    }

    /// Primitives carrying the state effect. They may only appear in graphs
    /// awaiting discharge.
    #[must_use]
    pub fn is_stateful(self) -> bool {
        matches!(self, Self::RefGet | Self::RefSwap | Self::RefAddUpdate)
    }

    #[must_use]
    pub fn is_control_flow(self) -> bool {
        matches!(self, Self::Cond | Self::While | Self::Scan)
    }
}

impl std::fmt::Display for Primitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarId(pub u32);

static NEXT_VAR_ID: AtomicU32 = AtomicU32::new(1);

impl VarId {
    /// Allocate a process-unique variable id.
    #[must_use]
    pub fn fresh() -> Self {
        Self(NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A typed graph variable. `is_ref` marks a mutable reference cell whose
/// contents have type `aval`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Var {
    pub id: VarId,
    pub aval: AbstractValue,
    #[serde(default)]
    pub is_ref: bool,
}

impl Var {
    #[must_use]
    pub fn new(aval: AbstractValue) -> Self {
        Self {
            id: VarId::fresh(),
            aval,
            is_ref: false,
        }
    }

    #[must_use]
    pub fn new_ref(aval: AbstractValue) -> Self {
        Self {
            id: VarId::fresh(),
            aval,
            is_ref: true,
        }
    }

    /// A fresh variable of the same type.
    #[must_use]
    pub fn fresh_like(&self) -> Self {
        Self {
            id: VarId::fresh(),
            aval: self.aval.clone(),
            is_ref: self.is_ref,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Atom {
    Var(Var),
    Lit(Literal),
}

impl Atom {
    /// Literals are weakly typed scalars.
    #[must_use]
    pub fn aval(&self) -> AbstractValue {
        match self {
            Self::Var(var) => var.aval.clone(),
            Self::Lit(lit) => AbstractValue::weak_scalar(lit.dtype()),
        }
    }

    #[must_use]
    pub fn as_var(&self) -> Option<&Var> {
        match self {
            Self::Var(var) => Some(var),
            Self::Lit(_) => None,
        }
    }

    #[must_use]
    pub fn var_id(&self) -> Option<VarId> {
        self.as_var().map(|var| var.id)
    }

    #[must_use]
    pub fn is_ref(&self) -> bool {
        self.as_var().is_some_and(|var| var.is_ref)
    }
}

impl From<Var> for Atom {
    fn from(var: Var) -> Self {
        Self::Var(var)
    }
}

impl From<&Var> for Atom {
    fn from(var: &Var) -> Self {
        Self::Var(var.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equation {
    pub primitive: Primitive,
    pub inputs: SmallVec<[Atom; 4]>,
    pub outputs: SmallVec<[Var; 2]>,
    pub params: BTreeMap<String, String>,
    /// Nested graphs owned by control-flow equations. Cond: one per branch.
    /// While: `[cond, body]`. Scan: `[body]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_jaxprs: Vec<Jaxpr>,
}

impl Equation {
    #[must_use]
    pub fn new(primitive: Primitive, inputs: Vec<Atom>, outputs: Vec<Var>) -> Self {
        Self {
            primitive,
            inputs: SmallVec::from_vec(inputs),
            outputs: SmallVec::from_vec(outputs),
            params: BTreeMap::new(),
            sub_jaxprs: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_sub_jaxprs(mut self, sub_jaxprs: Vec<Jaxpr>) -> Self {
        self.sub_jaxprs = sub_jaxprs;
        self
    }

    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Jaxpr {
    pub invars: Vec<Var>,
    pub constvars: Vec<Var>,
    pub outvars: Vec<Atom>,
    pub equations: Vec<Equation>,
    #[serde(skip)]
    fingerprint_cache: std::sync::OnceLock<String>,
}

impl Clone for Jaxpr {
    fn clone(&self) -> Self {
        Self {
            invars: self.invars.clone(),
            constvars: self.constvars.clone(),
            outvars: self.outvars.clone(),
            equations: self.equations.clone(),
            fingerprint_cache: std::sync::OnceLock::new(),
        }
    }
}

impl PartialEq for Jaxpr {
    fn eq(&self, other: &Self) -> bool {
        self.invars == other.invars
            && self.constvars == other.constvars
            && self.outvars == other.outvars
            && self.equations == other.equations
    }
}

impl Eq for Jaxpr {}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JaxprValidationError {
    #[error("duplicate binding in {section} for var v{}", var.0)]
    DuplicateBinding { section: &'static str, var: VarId },
    #[error("equation {equation_index} references unbound input var v{}", var.0)]
    UnboundInputVar { equation_index: usize, var: VarId },
    #[error("equation {equation_index} output var v{} shadows an existing binding", var.0)]
    OutputShadowsBinding { equation_index: usize, var: VarId },
    #[error("outvar v{} does not have a defining binding", var.0)]
    UnknownOutvar { var: VarId },
    #[error(
        "equation {equation_index} ({primitive}) carries a state effect; discharge the graph first"
    )]
    StateEffect { equation_index: usize, primitive: Primitive },
}

impl Jaxpr {
    #[must_use]
    pub fn new(
        invars: Vec<Var>,
        constvars: Vec<Var>,
        outvars: Vec<Atom>,
        equations: Vec<Equation>,
    ) -> Self {
        Self {
            invars,
            constvars,
            outvars,
            equations,
            fingerprint_cache: std::sync::OnceLock::new(),
        }
    }

    #[must_use]
    pub fn in_avals(&self) -> Vec<AbstractValue> {
        self.invars.iter().map(|var| var.aval.clone()).collect()
    }

    #[must_use]
    pub fn out_avals(&self) -> Vec<AbstractValue> {
        self.outvars.iter().map(Atom::aval).collect()
    }

    /// Whether any equation here or in a nested graph carries the state effect.
    #[must_use]
    pub fn has_state_effects(&self) -> bool {
        self.equations.iter().any(|eqn| {
            eqn.primitive.is_stateful() || eqn.sub_jaxprs.iter().any(Jaxpr::has_state_effects)
        })
    }

    /// Count of equations with `primitive`, nested graphs included.
    #[must_use]
    pub fn count_primitive(&self, primitive: Primitive) -> usize {
        self.equations
            .iter()
            .map(|eqn| {
                usize::from(eqn.primitive == primitive)
                    + eqn
                        .sub_jaxprs
                        .iter()
                        .map(|sub| sub.count_primitive(primitive))
                        .sum::<usize>()
            })
            .sum()
    }

    #[must_use]
    pub fn canonical_fingerprint(&self) -> &str {
        self.fingerprint_cache.get_or_init(|| {
            let mut out = String::new();
            write_var_list(&mut out, "in", &self.invars);
            write_var_list(&mut out, "const", &self.constvars);
            out.push_str("out=[");
            for atom in &self.outvars {
                write_atom(&mut out, atom);
                out.push(',');
            }
            out.push(']');

            for eqn in &self.equations {
                let _ = write!(&mut out, "eqn:{}(", eqn.primitive.as_str());
                for atom in &eqn.inputs {
                    write_atom(&mut out, atom);
                    out.push(',');
                }
                out.push_str(")->");
                for outvar in &eqn.outputs {
                    let _ = write!(&mut out, "v{}:{},", outvar.id.0, outvar.aval);
                }
                out.push('{');
                for (key, value) in &eqn.params {
                    let _ = write!(&mut out, "{key}={value};");
                }
                for sub in &eqn.sub_jaxprs {
                    let _ = write!(&mut out, "sub<{}>;", sub.canonical_fingerprint());
                }
                out.push_str("}|");
            }

            out
        })
    }

    pub fn validate_well_formed(&self) -> Result<(), JaxprValidationError> {
        let mut bindings = BTreeSet::new();

        for var in &self.invars {
            if !bindings.insert(var.id) {
                return Err(JaxprValidationError::DuplicateBinding {
                    section: "invars",
                    var: var.id,
                });
            }
        }
        for var in &self.constvars {
            if !bindings.insert(var.id) {
                return Err(JaxprValidationError::DuplicateBinding {
                    section: "constvars",
                    var: var.id,
                });
            }
        }

        for (equation_index, eqn) in self.equations.iter().enumerate() {
            for atom in &eqn.inputs {
                if let Atom::Var(var) = atom
                    && !bindings.contains(&var.id)
                {
                    return Err(JaxprValidationError::UnboundInputVar {
                        equation_index,
                        var: var.id,
                    });
                }
            }
            for out_var in &eqn.outputs {
                if !bindings.insert(out_var.id) {
                    return Err(JaxprValidationError::OutputShadowsBinding {
                        equation_index,
                        var: out_var.id,
                    });
                }
            }
            for sub in &eqn.sub_jaxprs {
                sub.validate_well_formed()?;
            }
        }

        for outvar in &self.outvars {
            if let Atom::Var(var) = outvar
                && !bindings.contains(&var.id)
            {
                return Err(JaxprValidationError::UnknownOutvar { var: var.id });
            }
        }

        Ok(())
    }

    /// Well-formedness plus the purity requirement: no state-effect
    /// equations anywhere in the graph.
    pub fn check_pure(&self) -> Result<(), JaxprValidationError> {
        self.validate_well_formed()?;
        self.check_no_state_effects()
    }

    fn check_no_state_effects(&self) -> Result<(), JaxprValidationError> {
        for (equation_index, eqn) in self.equations.iter().enumerate() {
            if eqn.primitive.is_stateful() {
                return Err(JaxprValidationError::StateEffect {
                    equation_index,
                    primitive: eqn.primitive,
                });
            }
            for sub in &eqn.sub_jaxprs {
                sub.check_no_state_effects()?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Jaxpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&pretty_print(self))
    }
}

/// A jaxpr paired with concrete values for its constvars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedJaxpr {
    pub jaxpr: Jaxpr,
    pub consts: Vec<Value>,
}

impl ClosedJaxpr {
    #[must_use]
    pub fn new(jaxpr: Jaxpr, consts: Vec<Value>) -> Self {
        Self { jaxpr, consts }
    }

    #[must_use]
    pub fn in_avals(&self) -> Vec<AbstractValue> {
        self.jaxpr.in_avals()
    }

    #[must_use]
    pub fn out_avals(&self) -> Vec<AbstractValue> {
        self.jaxpr.out_avals()
    }

    /// Turn constvars into leading invars, returning the open graph and the
    /// values that must be passed ahead of the original arguments.
    #[must_use]
    pub fn into_open(self) -> (Jaxpr, Vec<Value>) {
        let Jaxpr {
            invars,
            constvars,
            outvars,
            equations,
            ..
        } = self.jaxpr;
        let mut all_invars = constvars;
        all_invars.extend(invars);
        (
            Jaxpr::new(all_invars, Vec::new(), outvars, equations),
            self.consts,
        )
    }
}

fn write_var_list(out: &mut String, label: &str, vars: &[Var]) {
    let _ = write!(out, "{label}=[");
    for var in vars {
        let _ = write!(out, "v{}:{},", var.id.0, var.aval);
    }
    out.push(']');
}

fn write_atom(out: &mut String, atom: &Atom) {
    match atom {
        Atom::Var(var) => {
            let _ = write!(out, "v{}", var.id.0);
        }
        Atom::Lit(lit) => write_literal(out, *lit),
    }
}

fn write_literal(out: &mut String, lit: Literal) {
    match lit {
        Literal::I64(value) => {
            let _ = write!(out, "i64:{value}");
        }
        Literal::Bool(value) => {
            let _ = write!(out, "bool:{value}");
        }
        Literal::F64Bits(value) => {
            let _ = write!(out, "f64bits:{value}");
        }
    }
}

/// Comma-separated list parameter, as stored in `Equation::params`.
#[must_use]
pub fn format_list<T: std::fmt::Display>(items: &[T]) -> String {
    let mut out = String::new();
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        let _ = write!(out, "{item}");
    }
    out
}
