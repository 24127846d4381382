#![forbid(unsafe_code)]

pub mod errors;
pub mod transforms;

pub use errors::ApiError;
pub use transforms::{GradWrapped, JitWrapped, Linearized, ValueAndGradWrapped, VjpFn, VmapWrapped};
pub use transforms::{grad, jit, jvp, linearize, make_jaxpr, value_and_grad, vjp, vmap};
