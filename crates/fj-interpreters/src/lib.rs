#![forbid(unsafe_code)]

pub mod batching;
pub mod builder;
pub mod discharge;
pub mod error;
pub mod jvp;
pub mod params;
pub mod partial_eval;
#[cfg(test)]
mod test_graphs;
pub mod trace;
pub mod transpose;

pub use batching::batch_jaxpr;
pub use builder::Emitter;
pub use discharge::discharge_state;
pub use error::{InterpreterError, ParamError, TraceError};
pub use jvp::jvp_jaxpr;
pub use params::{CheckpointPolicy, ScanParams, WhileParams};
pub use partial_eval::{PartialEvalResult, dce_jaxpr, partial_eval_jaxpr};
pub use trace::{ConstOperand, SharedTraceCache, TraceCtx, TraceId, TracedJaxpr, Tracer};
pub use transpose::transpose_jaxpr;

use fj_core::{Atom, ClosedJaxpr, Equation, Jaxpr, Primitive, Value, VarId};
use fj_lax::eval_primitive;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Evaluation limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Abort a `while` equation after this many iterations. `None` lets the
    /// loop run until its predicate turns false.
    pub max_while_iterations: Option<usize>,
}

impl EvalConfig {
    /// Read `FJ_MAX_WHILE_ITERATIONS`; unset or unparsable means no limit.
    #[must_use]
    pub fn from_env() -> Self {
        let max_while_iterations = std::env::var("FJ_MAX_WHILE_ITERATIONS")
            .ok()
            .and_then(|raw| raw.parse::<usize>().ok());
        Self {
            max_while_iterations,
        }
    }
}

/// Evaluate `jaxpr` with `consts` bound to its constvars and `args` to its
/// invars.
pub fn eval_jaxpr(
    jaxpr: &Jaxpr,
    consts: &[Value],
    args: &[Value],
) -> Result<Vec<Value>, InterpreterError> {
    eval_jaxpr_with_config(jaxpr, consts, args, &EvalConfig::default())
}

pub fn eval_closed_jaxpr(
    closed: &ClosedJaxpr,
    args: &[Value],
) -> Result<Vec<Value>, InterpreterError> {
    eval_jaxpr(&closed.jaxpr, &closed.consts, args)
}

pub fn eval_jaxpr_with_config(
    jaxpr: &Jaxpr,
    consts: &[Value],
    args: &[Value],
    config: &EvalConfig,
) -> Result<Vec<Value>, InterpreterError> {
    if consts.len() != jaxpr.constvars.len() {
        return Err(InterpreterError::InputArity {
            expected: jaxpr.constvars.len(),
            actual: consts.len(),
        });
    }
    if args.len() != jaxpr.invars.len() {
        return Err(InterpreterError::InputArity {
            expected: jaxpr.invars.len(),
            actual: args.len(),
        });
    }

    let mut env: FxHashMap<VarId, Value> = FxHashMap::default();
    for (var, value) in jaxpr.constvars.iter().zip(consts) {
        env.insert(var.id, value.cast(var.aval.dtype));
    }
    for (var, value) in jaxpr.invars.iter().zip(args) {
        env.insert(var.id, value.cast(var.aval.dtype));
    }

    for eqn in &jaxpr.equations {
        let resolved = eqn
            .inputs
            .iter()
            .map(|atom| read_atom(&env, atom))
            .collect::<Result<Vec<_>, _>>()?;

        let outputs = match eqn.primitive {
            Primitive::Cond => eval_cond(eqn, &resolved, config)?,
            Primitive::While => eval_while(eqn, &resolved, config)?,
            Primitive::Scan => eval_scan(eqn, &resolved, config)?,
            primitive if primitive.is_stateful() => {
                return Err(InterpreterError::StateOutsideDischarge { primitive });
            }
            primitive => vec![eval_primitive(primitive, &resolved, &eqn.params)?],
        };

        if outputs.len() != eqn.outputs.len() {
            return Err(InterpreterError::Malformed {
                primitive: eqn.primitive,
                detail: format!(
                    "produced {} outputs for {} binders",
                    outputs.len(),
                    eqn.outputs.len()
                ),
            });
        }
        for (var, value) in eqn.outputs.iter().zip(outputs) {
            env.insert(var.id, value.cast(var.aval.dtype));
        }
    }

    jaxpr
        .outvars
        .iter()
        .map(|atom| read_atom(&env, atom))
        .collect()
}

fn read_atom(env: &FxHashMap<VarId, Value>, atom: &Atom) -> Result<Value, InterpreterError> {
    match atom {
        Atom::Var(var) => env
            .get(&var.id)
            .cloned()
            .ok_or(InterpreterError::MissingVariable(var.id)),
        Atom::Lit(lit) => Ok(Value::scalar(lit.dtype(), *lit)),
    }
}

fn eval_cond(
    eqn: &Equation,
    inputs: &[Value],
    config: &EvalConfig,
) -> Result<Vec<Value>, InterpreterError> {
    let Some((index, operands)) = inputs.split_first() else {
        return Err(InterpreterError::Malformed {
            primitive: Primitive::Cond,
            detail: "missing branch index".to_owned(),
        });
    };
    let branches = &eqn.sub_jaxprs;
    let last = branches.len().checked_sub(1).ok_or(InterpreterError::Malformed {
        primitive: Primitive::Cond,
        detail: "no branches".to_owned(),
    })?;
    let raw = index.as_i64_scalar().ok_or(InterpreterError::Malformed {
        primitive: Primitive::Cond,
        detail: format!("branch index must be an integer scalar, got {}", index.aval()),
    })?;
    let selected = raw.clamp(0, last as i64) as usize;
    trace!(branch = selected, "cond dispatch");
    eval_jaxpr_with_config(&branches[selected], &[], operands, config)
}

fn eval_while(
    eqn: &Equation,
    inputs: &[Value],
    config: &EvalConfig,
) -> Result<Vec<Value>, InterpreterError> {
    let params = WhileParams::from_eqn(eqn)?;
    let (cond_consts, rest) = inputs.split_at(params.cond_nconsts);
    let (body_consts, init) = rest.split_at(params.body_nconsts);
    let cond = &eqn.sub_jaxprs[0];
    let body = &eqn.sub_jaxprs[1];

    let mut carry = init.to_vec();
    let mut iterations = 0_usize;
    loop {
        let mut cond_args = cond_consts.to_vec();
        cond_args.extend(carry.iter().cloned());
        let pred = eval_jaxpr_with_config(cond, &[], &cond_args, config)?;
        let keep_going = pred
            .first()
            .and_then(Value::as_bool_scalar)
            .ok_or(InterpreterError::Malformed {
                primitive: Primitive::While,
                detail: "predicate must produce one boolean scalar".to_owned(),
            })?;
        if !keep_going {
            break;
        }
        if let Some(limit) = config.max_while_iterations
            && iterations >= limit
        {
            return Err(InterpreterError::MaxIterationsExceeded { limit });
        }
        let mut body_args = body_consts.to_vec();
        body_args.extend(carry);
        carry = eval_jaxpr_with_config(body, &[], &body_args, config)?;
        iterations += 1;
    }
    debug!(iterations, "while loop finished");
    Ok(carry)
}

fn eval_scan(
    eqn: &Equation,
    inputs: &[Value],
    config: &EvalConfig,
) -> Result<Vec<Value>, InterpreterError> {
    let params = ScanParams::from_eqn(eqn)?;
    let body = &eqn.sub_jaxprs[0];
    let (consts, rest) = inputs.split_at(params.num_consts);
    let (init, xs) = rest.split_at(params.num_carry);
    for x in xs {
        if x.leading_dim() != Some(params.length as u32) {
            return Err(InterpreterError::Malformed {
                primitive: Primitive::Scan,
                detail: format!(
                    "scanned operand {} does not have leading extent {}",
                    x.aval(),
                    params.length
                ),
            });
        }
    }

    let steps: Vec<usize> = if params.reverse {
        (0..params.length).rev().collect()
    } else {
        (0..params.length).collect()
    };
    let num_ys = body.outvars.len().saturating_sub(params.num_carry);
    let mut ys: Vec<Vec<Option<Value>>> = vec![vec![None; params.length]; num_ys];
    let mut carry = init.to_vec();

    for group in steps.chunks(params.unroll) {
        for &t in group {
            let mut step_args = consts.to_vec();
            step_args.extend(carry);
            for x in xs {
                step_args.push(x.slice_axis0(t)?);
            }
            let mut outs = eval_jaxpr_with_config(body, &[], &step_args, config)?;
            let step_ys = outs.split_off(params.num_carry.min(outs.len()));
            carry = outs;
            for (slot, y) in ys.iter_mut().zip(step_ys) {
                slot[t] = Some(y);
            }
        }
    }

    let body_out_avals = body.out_avals();
    let mut results = carry;
    for (idx, slots) in ys.into_iter().enumerate() {
        let slices: Vec<Value> = slots.into_iter().flatten().collect();
        let aval = &body_out_avals[params.num_carry + idx];
        results.push(Value::stack_axis0_or_empty(&slices, aval)?);
    }
    trace!(length = params.length, unroll = params.unroll, "scan finished");
    Ok(results)
}
