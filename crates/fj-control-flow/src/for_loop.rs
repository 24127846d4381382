#![forbid(unsafe_code)]

//! `for_loop`: bounded iteration over mutable reference cells.
//!
//! The body is traced with its state bound as reference cells, discharged
//! into a pure function of the cell contents, and run as a `scan` whose
//! carry is the loop counter followed by those contents.

use fj_core::{AbstractValue, Atom, DType, Jaxpr, Literal, Primitive, Tree, Var};
use fj_interpreters::{
    CheckpointPolicy, Emitter, ScanParams, TraceCtx, TraceError, Tracer, discharge_state,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::callable::Callable;
use crate::{coerce_carry, operand_atoms};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForLoopOptions {
    /// Visit indices `length - 1` down to `0`.
    pub reverse: bool,
    pub unroll: usize,
}

impl Default for ForLoopOptions {
    fn default() -> Self {
        Self {
            reverse: false,
            unroll: 1,
        }
    }
}

/// Run `body(i, cells)` for each `i` in `0..length`. The body reads and
/// writes the cells with the `ref_*` operations and returns nothing; the
/// final cell contents are returned with the structure of `init`.
pub fn for_loop(
    cx: &mut TraceCtx,
    length: usize,
    body: &Callable,
    init: Tree<Tracer>,
    options: &ForLoopOptions,
) -> Result<Tree<Tracer>, TraceError> {
    body.require_function("for_loop", "body")?;
    if options.unroll < 1 {
        return Err(TraceError::InvalidArgument {
            construct: "for_loop",
            detail: format!("`unroll` must be a positive integer, got {}", options.unroll),
        });
    }

    if i32::try_from(length).is_err() {
        return Err(TraceError::InvalidArgument {
            construct: "for_loop",
            detail: format!("for_loop length {length} does not fit the i32 loop index"),
        });
    }

    let state_tree = init.treedef();
    let (state, _) = init.flatten();
    let state_avals: Vec<AbstractValue> = state.iter().map(|tracer| tracer.aval().strong()).collect();
    let index_aval = AbstractValue::scalar(DType::I32);
    let in_avals = Tree::pair(Tree::leaf(index_aval.clone()), state_tree.unflatten(state_avals.clone())?);
    let mut ref_mask = vec![false];
    ref_mask.extend(std::iter::repeat_n(true, state.len()));
    let traced = body.trace_stateful(cx, in_avals, &ref_mask, &["construct=for_loop".to_owned()])?;
    if traced.out_tree.num_leaves() != 0 {
        return Err(TraceError::InvalidArgument {
            construct: "for_loop",
            detail: format!(
                "for_loop body must return no values, got structure {}",
                traced.out_tree
            ),
        });
    }

    let num_consts = traced.num_consts();
    let mut discharge_mask = vec![false; num_consts + 1];
    discharge_mask.extend(std::iter::repeat_n(true, state.len()));
    let pure = discharge_state(&traced.jaxpr, &discharge_mask)?;
    let step = step_graph(&traced.jaxpr.invars[..num_consts], &pure, &state_avals, length, options.reverse)?;

    let start = cx.convert(&Tracer::i64(0), DType::I32)?;
    let state = coerce_carry(cx, &state, &state_avals)?;
    let mut carry = vec![start];
    carry.extend(state);
    let mut inputs = cx.operand_atoms(&traced.consts)?;
    inputs.extend(operand_atoms(cx, "for_loop", &carry)?);
    let params = ScanParams {
        num_consts,
        num_carry: carry.len(),
        length,
        reverse: false,
        unroll: options.unroll,
        linear: vec![false; inputs.len()],
        checkpoint: CheckpointPolicy::default(),
    };
    let mut out_avals = vec![index_aval];
    out_avals.extend(state_avals);
    debug!(
        length,
        reverse = options.reverse,
        cells = carry.len() - 1,
        consts = num_consts,
        "for_loop lowers to scan"
    );
    let mut outs = cx.bind_control(
        Primitive::Scan,
        inputs,
        params.to_params(),
        vec![step],
        out_avals,
    )?;
    let contents = outs.split_off(1);
    Ok(state_tree.unflatten(contents)?)
}

/// Scan body `(consts, i, contents) -> (i + 1, contents')` around the
/// discharged loop body, which sees `length - 1 - i` when reversed.
fn step_graph(
    const_vars: &[Var],
    pure: &Jaxpr,
    state_avals: &[AbstractValue],
    length: usize,
    reverse: bool,
) -> Result<Jaxpr, TraceError> {
    let mut em = Emitter::new();
    let consts: Vec<Var> = const_vars.iter().map(Var::fresh_like).collect();
    let counter = Var::new(AbstractValue::scalar(DType::I32));
    let contents: Vec<Var> = state_avals.iter().cloned().map(Var::new).collect();

    let counter_atom = Atom::from(&counter);
    let index = if reverse {
        let last = i64::try_from(length).unwrap_or(i64::from(i32::MAX)).saturating_sub(1);
        em.sub(&Atom::Lit(Literal::I64(last)), &counter_atom)?
    } else {
        counter_atom.clone()
    };
    let mut args: Vec<Atom> = consts.iter().map(Atom::from).collect();
    args.push(index);
    args.extend(contents.iter().map(Atom::from));
    let updated = em.inline(pure, &[], &args)?;
    let next = em.add(&counter_atom, &Atom::Lit(Literal::I64(1)))?;

    let mut outvars = vec![next];
    outvars.extend(updated);
    let mut invars = consts;
    invars.push(counter);
    invars.extend(contents);
    let step = em.finish(invars, outvars);
    step.validate_well_formed()?;
    Ok(step)
}
