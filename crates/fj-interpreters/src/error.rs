#![forbid(unsafe_code)]

use fj_core::{JaxprValidationError, Primitive, TreeError, TypeConsistencyError, ValueError, VarId};
use fj_lax::EvalError;

/// A control-flow or state equation whose params do not describe its
/// operands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed {primitive} equation: {detail}")]
pub struct ParamError {
    pub primitive: Primitive,
    pub detail: String,
}

/// Failures raised while tracing a construct or transforming a graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceError {
    /// A construct argument that must be invoked is not a function.
    #[error("{construct}: {detail}")]
    CallableType {
        construct: &'static str,
        detail: String,
    },
    #[error(transparent)]
    TypeConsistency(#[from] TypeConsistencyError),
    /// Predicate or branch index of the wrong dtype or rank.
    #[error("{construct}: {detail}")]
    IndexType {
        construct: &'static str,
        detail: String,
    },
    /// Reference-cell index or value shape outside the cell's domain.
    #[error("{construct}: {detail}")]
    IndexDomain {
        construct: &'static str,
        detail: String,
    },
    #[error("{detail}")]
    UnsupportedTransform {
        construct: &'static str,
        detail: String,
    },
    #[error(
        "encountered a value from trace {trace_id} after that trace completed; \
         values created inside a construct cannot escape it"
    )]
    StaleValue { trace_id: u32 },
    #[error("{construct}: {detail}")]
    InvalidArgument {
        construct: &'static str,
        detail: String,
    },
    #[error("{primitive} carries the state effect and is only allowed inside a for_loop body")]
    StateEffect { primitive: Primitive },
    #[error("{primitive} expects a reference cell as its first operand, got {detail}")]
    NotARef { primitive: Primitive, detail: String },
    #[error("a reference cell cannot be captured by a nested trace or returned from one")]
    RefEscape,
    #[error("no active trace")]
    NoActiveTrace,
    #[error(transparent)]
    Primitive(#[from] EvalError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Validation(#[from] JaxprValidationError),
    #[error("malformed {primitive} equation: {detail}")]
    Malformed { primitive: Primitive, detail: String },
    #[error("no {transform} rule for {primitive}")]
    NoRule {
        transform: &'static str,
        primitive: Primitive,
    },
}

impl From<ParamError> for TraceError {
    fn from(err: ParamError) -> Self {
        Self::Malformed {
            primitive: err.primitive,
            detail: err.detail,
        }
    }
}

impl TraceError {
    pub(crate) fn malformed(primitive: Primitive, detail: impl Into<String>) -> Self {
        Self::Malformed {
            primitive,
            detail: detail.into(),
        }
    }

    /// Reverse-mode differentiation of an unbounded loop.
    #[must_use]
    pub fn while_not_reverse_differentiable() -> Self {
        Self::UnsupportedTransform {
            construct: "while_loop",
            detail: "Reverse-mode differentiation does not work for lax.while_loop or \
                     lax.fori_loop with dynamic start/stop values. Try using lax.scan, \
                     or using fori_loop with static start/stop."
                .to_owned(),
        }
    }
}

/// Failures raised while evaluating a graph on concrete values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterpreterError {
    #[error("input arity mismatch: expected {expected}, got {actual}")]
    InputArity { expected: usize, actual: usize },
    #[error("missing variable v{}", .0.0)]
    MissingVariable(VarId),
    #[error("primitive eval failed: {0}")]
    Primitive(#[from] EvalError),
    #[error("{primitive} carries the state effect; discharge the graph before evaluating it")]
    StateOutsideDischarge { primitive: Primitive },
    #[error("while loop exceeded {limit} iterations")]
    MaxIterationsExceeded { limit: usize },
    #[error("malformed {primitive} equation: {detail}")]
    Malformed { primitive: Primitive, detail: String },
    #[error(transparent)]
    Value(#[from] ValueError),
}

impl From<ParamError> for InterpreterError {
    fn from(err: ParamError) -> Self {
        Self::Malformed {
            primitive: err.primitive,
            detail: err.detail,
        }
    }
}
