//! Hand-built control-flow graphs shared by the transform tests.

use fj_core::{AbstractValue, Atom, DType, Equation, Jaxpr, Primitive, Tree, Var};
use std::collections::BTreeMap;

use crate::error::TraceError;
use crate::params::{CheckpointPolicy, ScanParams, WhileParams};
use crate::trace::{TraceCtx, Tracer};

pub fn f64s() -> AbstractValue {
    AbstractValue::scalar(DType::F64)
}

pub fn vec_f64(len: u32) -> AbstractValue {
    AbstractValue::vector(DType::F64, len)
}

/// Trace a closed-over-nothing function of flat arguments.
pub fn trace(
    avals: Vec<AbstractValue>,
    f: impl FnOnce(&mut TraceCtx, &[Tracer]) -> Result<Vec<Tracer>, TraceError>,
) -> Jaxpr {
    let mut cx = TraceCtx::new();
    let traced = cx
        .trace_fn(Tree::from_leaves(avals), |cx, args| {
            let leaves = args.flatten().0;
            let outs = f(cx, &leaves)?;
            Ok(Tree::from_leaves(outs))
        })
        .expect("trace");
    assert!(traced.consts.is_empty(), "test graphs capture nothing");
    traced.jaxpr
}

/// Trace a function whose arguments flagged in `refs` are reference cells.
pub fn trace_stateful(
    avals: Vec<AbstractValue>,
    refs: &[bool],
    f: impl FnOnce(&mut TraceCtx, &[Tracer]) -> Result<Vec<Tracer>, TraceError>,
) -> Jaxpr {
    let mut cx = TraceCtx::new();
    cx.trace_stateful_fn(Tree::from_leaves(avals), refs, |cx, args| {
        let leaves = args.flatten().0;
        Ok(Tree::from_leaves(f(cx, &leaves)?))
    })
    .expect("trace")
    .jaxpr
}

fn wrap(invars: Vec<Var>, eqn_of: impl FnOnce(Vec<Atom>) -> Equation) -> Jaxpr {
    let inputs: Vec<Atom> = invars.iter().map(Atom::from).collect();
    let eqn = eqn_of(inputs);
    let outvars = eqn.outputs.iter().map(Atom::from).collect();
    Jaxpr::new(invars, Vec::new(), outvars, vec![eqn])
}

/// A graph holding a single scan over `body`.
pub fn scan_graph(
    body: Jaxpr,
    num_consts: usize,
    num_carry: usize,
    length: usize,
    reverse: bool,
    checkpoint: CheckpointPolicy,
) -> Jaxpr {
    let invars: Vec<Var> = body
        .invars
        .iter()
        .enumerate()
        .map(|(idx, var)| {
            if idx < num_consts + num_carry {
                Var::new(var.aval.clone())
            } else {
                Var::new(var.aval.with_leading(length as u32))
            }
        })
        .collect();
    let out_avals: Vec<AbstractValue> = body
        .out_avals()
        .into_iter()
        .enumerate()
        .map(|(idx, aval)| {
            if idx < num_carry {
                aval.strong()
            } else {
                aval.strong().with_leading(length as u32)
            }
        })
        .collect();
    let params = ScanParams {
        num_consts,
        num_carry,
        length,
        reverse,
        unroll: 1,
        linear: vec![false; invars.len()],
        checkpoint,
    };
    wrap(invars, |inputs| {
        Equation::new(
            Primitive::Scan,
            inputs,
            out_avals.into_iter().map(Var::new).collect(),
        )
        .with_params(params.to_params())
        .with_sub_jaxprs(vec![body])
    })
}

/// A graph holding a single while loop.
pub fn while_graph(cond: Jaxpr, body: Jaxpr, cond_nconsts: usize, body_nconsts: usize) -> Jaxpr {
    let mut invars: Vec<Var> = cond.invars[..cond_nconsts]
        .iter()
        .map(|var| Var::new(var.aval.clone()))
        .collect();
    invars.extend(body.invars.iter().map(|var| Var::new(var.aval.clone())));
    let out_avals: Vec<AbstractValue> = body.out_avals().iter().map(AbstractValue::strong).collect();
    let params = WhileParams {
        cond_nconsts,
        body_nconsts,
    };
    wrap(invars, |inputs| {
        Equation::new(
            Primitive::While,
            inputs,
            out_avals.into_iter().map(Var::new).collect(),
        )
        .with_params(params.to_params())
        .with_sub_jaxprs(vec![cond, body])
    })
}

/// A graph holding a single cond with an i32 index as its first input.
pub fn cond_graph(branches: Vec<Jaxpr>) -> Jaxpr {
    let mut invars = vec![Var::new(AbstractValue::scalar(DType::I32))];
    invars.extend(branches[0].invars.iter().map(|var| Var::new(var.aval.clone())));
    let out_avals: Vec<AbstractValue> = branches[0]
        .out_avals()
        .iter()
        .map(AbstractValue::strong)
        .collect();
    wrap(invars, |inputs| {
        Equation::new(
            Primitive::Cond,
            inputs,
            out_avals.into_iter().map(Var::new).collect(),
        )
        .with_params(BTreeMap::new())
        .with_sub_jaxprs(branches)
    })
}

/// Body `(c, x) -> (c * x + sin(x), c)` of a scan with one carry.
pub fn mul_sin_body() -> Jaxpr {
    trace(vec![f64s(), f64s()], |cx, args| {
        let cx_mul = cx.mul(&args[0], &args[1])?;
        let s = cx.sin(&args[1])?;
        let next = cx.add(&cx_mul, &s)?;
        Ok(vec![next, args[0].clone()])
    })
}

/// `while x < limit: x = x * 1.5 + 0.25` with `limit` a cond constant.
pub fn growth_while() -> Jaxpr {
    let cond = trace(vec![f64s(), f64s()], |cx, args| {
        Ok(vec![cx.lt(&args[1], &args[0])?])
    });
    let body = trace(vec![f64s()], |cx, args| {
        let scaled = cx.mul(&args[0], &Tracer::f64(1.5))?;
        Ok(vec![cx.add(&scaled, &Tracer::f64(0.25))?])
    });
    while_graph(cond, body, 1, 0)
}
