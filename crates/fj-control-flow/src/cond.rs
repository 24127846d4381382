#![forbid(unsafe_code)]

//! `cond` and `switch`: N-way dispatch to branches sharing one signature.

use fj_core::{AbstractValue, DType, Jaxpr, Literal, Primitive, Tree, Var, check_tree_types};
use fj_interpreters::{ConstOperand, TraceCtx, TraceError, TracedJaxpr, Tracer};
use std::collections::BTreeMap;
use tracing::debug;

use crate::callable::Callable;
use crate::{operand_atoms, tree_avals};

/// `true_fn(operands)` if `pred` is true, else `false_fn(operands)`.
///
/// `pred` is a boolean or integer scalar; a nonzero integer selects
/// `true_fn`.
pub fn cond(
    cx: &mut TraceCtx,
    pred: &Tracer,
    true_fn: &Callable,
    false_fn: &Callable,
    operands: Tree<Tracer>,
) -> Result<Tree<Tracer>, TraceError> {
    let aval = pred.aval();
    if !aval.is_scalar() {
        return Err(TraceError::IndexType {
            construct: "cond",
            detail: format!("Pred must be a scalar, got {aval} of shape {}.", aval.shape),
        });
    }
    let index = match aval.dtype {
        DType::Bool => cx.convert(pred, DType::I32)?,
        dtype if dtype.is_integral() => {
            let nonzero = cx.ne(pred, &Tracer::i64(0))?;
            cx.convert(&nonzero, DType::I32)?
        }
        _ => {
            return Err(TraceError::IndexType {
                construct: "cond",
                detail: format!("Pred type must be either boolean or integer, got {aval}."),
            });
        }
    };

    let branches = [false_fn.clone(), true_fn.clone()];
    let traced = trace_branches(cx, "cond", &branches, &operands)?;
    check_branch_outputs("true_fun and false_fun output", &traced[1], &traced[0])?;
    emit_cond(cx, "cond", &index, traced, operands)
}

/// `branches[clamp(index, 0, len - 1)](operands)`.
pub fn switch(
    cx: &mut TraceCtx,
    index: &Tracer,
    branches: &[Callable],
    operands: Tree<Tracer>,
) -> Result<Tree<Tracer>, TraceError> {
    if branches.is_empty() {
        return Err(TraceError::InvalidArgument {
            construct: "switch",
            detail: "Empty branch sequence".to_owned(),
        });
    }
    let aval = index.aval();
    if !aval.is_scalar() {
        return Err(TraceError::IndexType {
            construct: "switch",
            detail: format!("Branch index must be scalar, got {aval} of shape {}.", aval.shape),
        });
    }
    if !aval.dtype.is_integral() {
        return Err(TraceError::IndexType {
            construct: "switch",
            detail: format!("Index type must be an integer, got {aval}."),
        });
    }
    if let [only] = branches {
        return only.call(cx, operands);
    }

    let index = cx.convert(index, DType::I32)?;
    let last = branches.len() as i64 - 1;
    let index = cx.clamp(&Tracer::literal(Literal::I64(0)), &index, &Tracer::i64(last))?;

    let traced = trace_branches(cx, "switch", branches, &operands)?;
    for (i, branch) in traced.iter().enumerate().skip(1) {
        check_branch_outputs(&format!("branch 0 and {i} outputs"), &traced[0], branch)?;
    }
    emit_cond(cx, "switch", &index, traced, operands)
}

fn trace_branches(
    cx: &mut TraceCtx,
    construct: &'static str,
    branches: &[Callable],
    operands: &Tree<Tracer>,
) -> Result<Vec<TracedJaxpr>, TraceError> {
    let in_avals = tree_avals(operands);
    let extra = [format!("construct={construct}")];
    branches
        .iter()
        .map(|branch| branch.trace(cx, in_avals.clone(), &extra))
        .collect()
}

fn check_branch_outputs(
    what: &str,
    left: &TracedJaxpr,
    right: &TracedJaxpr,
) -> Result<(), TraceError> {
    check_tree_types(
        what,
        &left.out_tree,
        &left.out_avals(),
        &right.out_tree,
        &right.out_avals(),
    )?;
    Ok(())
}

/// Join the captured constants of all branches into one operand list and
/// emit the `cond` equation. Branch `b` binds the constants of every other
/// branch to unused variables.
fn emit_cond(
    cx: &mut TraceCtx,
    construct: &'static str,
    index: &Tracer,
    traced: Vec<TracedJaxpr>,
    operands: Tree<Tracer>,
) -> Result<Tree<Tracer>, TraceError> {
    let out_tree = traced[0].out_tree.clone();
    let out_avals = joined_out_avals(&traced);
    let all_consts: Vec<ConstOperand> = traced
        .iter()
        .flat_map(|branch| branch.consts.iter().cloned())
        .collect();
    let const_avals: Vec<Vec<AbstractValue>> = traced
        .iter()
        .map(|branch| branch.consts.iter().map(ConstOperand::aval).collect())
        .collect();

    let num_branches = traced.len();
    let mut sub_jaxprs = Vec::with_capacity(num_branches);
    for (b, branch) in traced.into_iter().enumerate() {
        let Jaxpr {
            invars: mut args,
            constvars,
            outvars,
            equations,
            ..
        } = branch.jaxpr;
        let own_consts: Vec<Var> = args.drain(..branch.consts.len()).collect();
        let mut invars = Vec::with_capacity(all_consts.len() + args.len());
        for (c, avals) in const_avals.iter().enumerate() {
            if c == b {
                invars.extend(own_consts.iter().cloned());
            } else {
                invars.extend(avals.iter().cloned().map(Var::new));
            }
        }
        invars.extend(args);
        sub_jaxprs.push(Jaxpr::new(invars, constvars, outvars, equations));
    }

    let (operands, _) = operands.flatten();
    let mut inputs = vec![cx.resolve(index)?];
    inputs.extend(cx.operand_atoms(&all_consts)?);
    inputs.extend(operand_atoms(cx, construct, &operands)?);
    debug!(
        construct,
        branches = num_branches,
        consts = all_consts.len(),
        operands = operands.len(),
        "traced conditional"
    );
    let outs = cx.bind_control(Primitive::Cond, inputs, BTreeMap::new(), sub_jaxprs, out_avals)?;
    Ok(out_tree.unflatten(outs)?)
}

/// An output is weakly typed only if it is weak in every branch.
fn joined_out_avals(traced: &[TracedJaxpr]) -> Vec<AbstractValue> {
    let mut avals = traced[0].out_avals();
    for branch in &traced[1..] {
        for (aval, other) in avals.iter_mut().zip(branch.out_avals()) {
            aval.weak_type &= other.weak_type;
        }
    }
    avals
}
