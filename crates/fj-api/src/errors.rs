#![forbid(unsafe_code)]

use fj_core::{TreeError, ValueError};
use fj_interpreters::{InterpreterError, TraceError};
use fj_lax::EvalError;

/// Failures surfaced by the transform entry points.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Interpreter(#[from] InterpreterError),
    #[error(transparent)]
    Kernel(#[from] EvalError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("grad requires a single real scalar output, got {detail}")]
    GradRequiresScalar { detail: String },
}
