#![forbid(unsafe_code)]

//! Structured control flow over traced functions.
//!
//! Every construct is called while a [`TraceCtx`] frame is active. It traces
//! its function arguments into sub-graphs, checks their signatures, and
//! appends one control-flow equation (`cond`, `while` or `scan`) to the
//! current frame. Values a function captures from enclosing frames become
//! leading constant operands of that equation.

pub mod associative_scan;
pub mod batching;
pub mod callable;
pub mod cond;
pub mod for_loop;
pub mod scan;
pub mod while_loop;

pub use associative_scan::associative_scan;
pub use batching::vmap;
pub use callable::{Callable, CallableId};
pub use cond::{cond, switch};
pub use for_loop::{ForLoopOptions, for_loop};
pub use scan::{ScanOptions, map, scan};
pub use while_loop::{fori_loop, while_loop};

use fj_core::{AbstractValue, Atom, Tree};
use fj_interpreters::{TraceCtx, TraceError, Tracer};

/// Abstract values of a tracer tree, keeping its structure.
pub(crate) fn tree_avals(tree: &Tree<Tracer>) -> Tree<AbstractValue> {
    tree.clone().map(|tracer| tracer.aval())
}

/// Atoms for tracers passed as plain operands of a control-flow equation.
pub(crate) fn operand_atoms(
    cx: &mut TraceCtx,
    construct: &'static str,
    tracers: &[Tracer],
) -> Result<Vec<Atom>, TraceError> {
    tracers
        .iter()
        .map(|tracer| {
            if tracer.is_ref() {
                return Err(TraceError::InvalidArgument {
                    construct,
                    detail: format!(
                        "reference cell of type {} passed as an operand; read it with ref_get",
                        tracer.aval()
                    ),
                });
            }
            cx.resolve(tracer)
        })
        .collect()
}

/// Carry types after weak-type promotion: a weakly typed carry leaf whose
/// function output has another dtype adopts that dtype. Returns `None` when
/// no leaf changes.
pub(crate) fn promote_weak_carry(
    carry: &[AbstractValue],
    out: &[AbstractValue],
) -> Option<Vec<AbstractValue>> {
    let mut changed = false;
    let promoted = carry
        .iter()
        .zip(out)
        .map(|(input, output)| {
            if input.weak_type && input.shape == output.shape && input.dtype != output.dtype {
                changed = true;
                AbstractValue::new(output.dtype, input.shape.clone())
            } else {
                input.clone()
            }
        })
        .collect();
    changed.then_some(promoted)
}

/// Convert carry tracers to the (possibly promoted) carry types.
pub(crate) fn coerce_carry(
    cx: &mut TraceCtx,
    carry: &[Tracer],
    avals: &[AbstractValue],
) -> Result<Vec<Tracer>, TraceError> {
    carry
        .iter()
        .zip(avals)
        .map(|(tracer, aval)| {
            if tracer.dtype() == aval.dtype && tracer.aval().weak_type == aval.weak_type {
                Ok(tracer.clone())
            } else {
                cx.convert(tracer, aval.dtype)
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use fj_core::{AbstractValue, DType, Tree, Value};
    use fj_interpreters::{TraceCtx, TraceError, Tracer, eval_closed_jaxpr};

    pub fn f64s() -> AbstractValue {
        AbstractValue::scalar(DType::F64)
    }

    /// Trace `f` over flat arguments and evaluate it on `args`.
    pub fn run(
        avals: Vec<AbstractValue>,
        args: &[Value],
        f: impl FnOnce(&mut TraceCtx, Vec<Tracer>) -> Result<Vec<Tracer>, TraceError>,
    ) -> Result<Vec<Value>, TraceError> {
        let mut cx = TraceCtx::new();
        let traced = cx.trace_fn(Tree::from_leaves(avals), |cx, args| {
            let (leaves, _) = args.flatten();
            Ok(Tree::from_leaves(f(cx, leaves)?))
        })?;
        let closed = traced.into_closed()?;
        Ok(eval_closed_jaxpr(&closed, args).expect("evaluation"))
    }

    pub fn scalars(values: &[Value]) -> Vec<f64> {
        values
            .iter()
            .map(|value| value.as_f64_scalar().expect("f64 scalar"))
            .collect()
    }
}
