#![forbid(unsafe_code)]

//! `while_loop` and `fori_loop`.

use fj_core::{AbstractValue, DType, Primitive, Tree, TreeDef, check_tree_types};
use fj_interpreters::{TraceCtx, TraceError, TracedJaxpr, Tracer, WhileParams};
use tracing::debug;

use crate::callable::Callable;
use crate::scan::{ScanOptions, scan};
use crate::{coerce_carry, operand_atoms, promote_weak_carry};

/// Apply `body_fn` to the carry while `cond_fn` holds; zero iterations
/// return `init` unchanged.
pub fn while_loop(
    cx: &mut TraceCtx,
    cond_fn: &Callable,
    body_fn: &Callable,
    init: Tree<Tracer>,
) -> Result<Tree<Tracer>, TraceError> {
    cond_fn.require_function("while_loop", "cond_fun")?;
    body_fn.require_function("while_loop", "body_fun")?;

    let in_tree = init.treedef();
    let (mut carry, _) = init.flatten();
    let mut carry_avals: Vec<AbstractValue> = carry.iter().map(Tracer::aval).collect();
    let (cond_traced, body_traced) = loop {
        let avals = in_tree.unflatten(carry_avals.clone())?;
        let cond_traced = cond_fn.trace(cx, avals.clone(), &["construct=while_cond".to_owned()])?;
        check_predicate(&cond_traced)?;
        let body_traced = body_fn.trace(cx, avals, &["construct=while_body".to_owned()])?;
        let out_avals = body_traced.out_avals();
        if body_traced.out_tree != in_tree {
            check_tree_types(
                "body_fun output and input",
                &body_traced.out_tree,
                &out_avals,
                &in_tree,
                &carry_avals,
            )?;
        }
        match promote_weak_carry(&carry_avals, &out_avals) {
            Some(promoted) => {
                debug!("promoting weakly typed while_loop carry; retracing");
                carry_avals = promoted;
            }
            None => {
                check_tree_types(
                    "body_fun output and input",
                    &body_traced.out_tree,
                    &out_avals,
                    &in_tree,
                    &carry_avals,
                )?;
                break (cond_traced, body_traced);
            }
        }
    };
    carry = coerce_carry(cx, &carry, &carry_avals)?;

    let params = WhileParams {
        cond_nconsts: cond_traced.num_consts(),
        body_nconsts: body_traced.num_consts(),
    };
    let mut inputs = cx.operand_atoms(&cond_traced.consts)?;
    inputs.extend(cx.operand_atoms(&body_traced.consts)?);
    inputs.extend(operand_atoms(cx, "while_loop", &carry)?);
    debug!(
        carry = carry.len(),
        cond_consts = params.cond_nconsts,
        body_consts = params.body_nconsts,
        "traced while_loop"
    );
    let outs = cx.bind_control(
        Primitive::While,
        inputs,
        params.to_params(),
        vec![cond_traced.jaxpr, body_traced.jaxpr],
        carry_avals,
    )?;
    Ok(in_tree.unflatten(outs)?)
}

fn check_predicate(traced: &TracedJaxpr) -> Result<(), TraceError> {
    let out_avals = traced.out_avals();
    let ok = traced.out_tree == TreeDef::Leaf
        && matches!(out_avals.as_slice(), [aval] if aval.dtype == DType::Bool && aval.is_scalar());
    if ok {
        return Ok(());
    }
    let types: Vec<String> = out_avals.iter().map(ToString::to_string).collect();
    Err(TraceError::IndexType {
        construct: "while_loop",
        detail: format!(
            "cond_fun must return a boolean scalar, but got output type(s) [{}] with structure {}.",
            types.join(", "),
            traced.out_tree
        ),
    })
}

/// `body(i, carry)` for `i` in `lower..upper`.
///
/// Literal bounds lower to a `scan` of known length, which is reverse-mode
/// differentiable; traced bounds lower to a `while_loop`.
pub fn fori_loop(
    cx: &mut TraceCtx,
    lower: &Tracer,
    upper: &Tracer,
    body: &Callable,
    init: Tree<Tracer>,
) -> Result<Tree<Tracer>, TraceError> {
    body.require_function("fori_loop", "body_fun")?;
    for bound in [lower, upper] {
        let aval = bound.aval();
        if !aval.is_scalar() || !aval.dtype.is_integral() {
            return Err(TraceError::IndexType {
                construct: "fori_loop",
                detail: format!("loop bounds must be integer scalars, got {aval}"),
            });
        }
    }

    if let (Some(lo), Some(hi)) = (
        lower.as_literal().and_then(|lit| lit.as_i64()),
        upper.as_literal().and_then(|lit| lit.as_i64()),
    ) {
        let length = usize::try_from(hi.saturating_sub(lo)).unwrap_or(0);
        let inner = body.clone();
        let step = Callable::wrapping(body, "fori_scan", move |cx, args| {
            let (carry, _) = args.into_pair()?;
            let (i, x) = carry.into_pair()?;
            let i = i.into_leaf()?;
            let x = inner.call(cx, Tree::pair(Tree::leaf(i.clone()), x))?;
            let next = cx.add(&i, &Tracer::i64(1))?;
            Ok(Tree::pair(Tree::pair(Tree::leaf(next), x), Tree::unit()))
        });
        let start = cx.convert(&Tracer::i64(lo), DType::I32)?;
        let options = ScanOptions {
            length: Some(length),
            ..ScanOptions::default()
        };
        debug!(lower = lo, upper = hi, "fori_loop with static bounds lowers to scan");
        let (carry, _) = scan(
            cx,
            &step,
            Tree::pair(Tree::leaf(start), init),
            Tree::unit(),
            &options,
        )?;
        let (_, x) = carry.into_pair()?;
        return Ok(x);
    }

    let dtype = [lower, upper]
        .iter()
        .map(|bound| bound.aval())
        .find(|aval| !aval.weak_type)
        .map_or(DType::I32, |aval| aval.dtype);
    let lower = cx.convert(lower, dtype)?;
    let upper = cx.convert(upper, dtype)?;
    let keep_going = Callable::wrapping(body, "fori_cond", |cx, args| {
        let mut state = args.into_tuple()?.into_iter();
        let (Some(i), Some(upper)) = (state.next(), state.next()) else {
            return Err(TraceError::InvalidArgument {
                construct: "fori_loop",
                detail: "loop state lost its counter".to_owned(),
            });
        };
        Ok(Tree::leaf(cx.lt(&i.into_leaf()?, &upper.into_leaf()?)?))
    });
    let inner = body.clone();
    let step = Callable::wrapping(body, "fori_body", move |cx, args| {
        let mut state = args.into_tuple()?.into_iter();
        let (Some(i), Some(upper), Some(x)) = (state.next(), state.next(), state.next()) else {
            return Err(TraceError::InvalidArgument {
                construct: "fori_loop",
                detail: "loop state lost its counter".to_owned(),
            });
        };
        let i = i.into_leaf()?;
        let x = inner.call(cx, Tree::pair(Tree::leaf(i.clone()), x))?;
        let next = cx.add(&i, &Tracer::i64(1))?;
        Ok(Tree::tuple(vec![Tree::leaf(next), upper, x]))
    });
    debug!("fori_loop with traced bounds lowers to while_loop");
    let state = Tree::tuple(vec![Tree::leaf(lower), Tree::leaf(upper), init]);
    let mut out = while_loop(cx, &keep_going, &step, state)?.into_tuple()?;
    out.pop().ok_or(TraceError::InvalidArgument {
        construct: "fori_loop",
        detail: "loop state lost its carry".to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{f64s, run, scalars};
    use fj_core::{TypeConsistencyError, Value};
    use fj_interpreters::{EvalConfig, eval_jaxpr_with_config};
    use proptest::prelude::*;

    /// `while x < limit: x = 2x + 1`, with `limit` captured from outside.
    /// Terminates for `x > -1`.
    fn doubling(limit: Tracer) -> (Callable, Callable) {
        let below = Callable::new("below", move |cx, x| {
            Ok(Tree::leaf(cx.lt(&x.into_leaf()?, &limit)?))
        });
        let step = Callable::new("step", |cx, x| {
            let doubled = cx.mul(&x.into_leaf()?, &Tracer::f64(2.0))?;
            Ok(Tree::leaf(cx.add(&doubled, &Tracer::f64(1.0))?))
        });
        (below, step)
    }

    fn reference_doubling(mut x: f64, limit: f64) -> f64 {
        while x < limit {
            x = 2.0 * x + 1.0;
        }
        x
    }

    #[test]
    fn while_loop_matches_a_plain_loop() {
        for (x, limit) in [(0.0, 10.0), (3.0, 2.0), (-0.75, 100.0)] {
            let out = run(vec![f64s(), f64s()], &[Value::scalar_f64(x), Value::scalar_f64(limit)], |cx, args| {
                let (below, step) = doubling(args[1].clone());
                let out = while_loop(cx, &below, &step, Tree::leaf(args[0].clone()))?;
                Ok(vec![out.into_leaf()?])
            })
            .expect("while");
            assert_eq!(scalars(&out), vec![reference_doubling(x, limit)]);
        }
    }

    #[test]
    fn empty_carry_loops_run() {
        let mut cx = TraceCtx::new();
        let traced = cx
            .trace_fn(Tree::unit(), |cx, _| {
                let never = Callable::new("never", |_, _| Ok(Tree::leaf(Tracer::bool(false))));
                let nothing = Callable::new("nothing", |_, state| Ok(state));
                while_loop(cx, &never, &nothing, Tree::unit())
            })
            .expect("trace");
        assert_eq!(traced.jaxpr.count_primitive(Primitive::While), 1);
        let out = fj_interpreters::eval_jaxpr(&traced.jaxpr, &[], &[]).expect("eval");
        assert!(out.is_empty());
    }

    #[test]
    fn weak_carry_adopts_the_body_dtype() {
        let mut cx = TraceCtx::new();
        let traced = cx
            .trace_fn(Tree::leaf(AbstractValue::scalar(DType::F32)), |cx, scale| {
                let scale = scale.into_leaf()?;
                let small = Callable::new("small", |cx, x| {
                    Ok(Tree::leaf(cx.lt(&x.into_leaf()?, &Tracer::f64(5.0))?))
                });
                let grow = Callable::new("grow", move |cx, x| {
                    let x = x.into_leaf()?;
                    let scaled = cx.mul(&x, &scale)?;
                    Ok(Tree::leaf(cx.add(&scaled, &Tracer::f64(1.0))?))
                });
                while_loop(cx, &small, &grow, Tree::leaf(Tracer::f64(0.0)))
            })
            .expect("trace");
        let out_aval = traced.jaxpr.out_avals().remove(0);
        assert_eq!(out_aval.dtype, DType::F32);
        assert!(!out_aval.weak_type);
    }

    #[test]
    fn predicate_must_be_a_boolean_scalar() {
        let err = run(vec![f64s()], &[], |cx, args| {
            let wrong = Callable::new("wrong", |_, x| Ok(x));
            let step = Callable::new("step", |_, x| Ok(x));
            while_loop(cx, &wrong, &step, Tree::leaf(args[0].clone()))?;
            Ok(vec![])
        })
        .expect_err("predicate");
        assert!(matches!(err, TraceError::IndexType { construct: "while_loop", .. }));
        assert!(err.to_string().contains("cond_fun must return a boolean scalar"));
        assert!(err.to_string().contains("f64[]"));
    }

    #[test]
    fn body_must_preserve_the_carry_type() {
        let err = run(vec![f64s()], &[], |cx, args| {
            let keep = Callable::new("keep", |_, _| Ok(Tree::leaf(Tracer::bool(true))));
            let narrow = Callable::new("narrow", |cx, x| {
                Ok(Tree::leaf(cx.convert(&x.into_leaf()?, DType::F32)?))
            });
            while_loop(cx, &keep, &narrow, Tree::leaf(args[0].clone()))?;
            Ok(vec![])
        })
        .expect_err("carry type");
        assert!(matches!(
            err,
            TraceError::TypeConsistency(TypeConsistencyError::LeafTypeMismatch { .. })
        ));
        assert!(err.to_string().contains("body_fun output and input"));

        let err = run(vec![f64s()], &[], |cx, args| {
            let keep = Callable::new("keep", |_, _| Ok(Tree::leaf(Tracer::bool(true))));
            let split = Callable::new("split", |_, x| {
                let x = x.into_leaf()?;
                Ok(Tree::pair(Tree::leaf(x.clone()), Tree::leaf(x)))
            });
            while_loop(cx, &keep, &split, Tree::leaf(args[0].clone()))?;
            Ok(vec![])
        })
        .expect_err("carry structure");
        assert!(matches!(
            err,
            TraceError::TypeConsistency(TypeConsistencyError::StructureMismatch { .. })
        ));
    }

    #[test]
    fn constants_are_rejected_before_tracing() {
        let value = Callable::constant(Tree::leaf(Value::scalar_bool(true)));
        let err = run(vec![f64s()], &[], |cx, args| {
            let step = Callable::new("step", |_, x| Ok(x));
            while_loop(cx, &value, &step, Tree::leaf(args[0].clone()))?;
            Ok(vec![])
        })
        .expect_err("not callable");
        assert!(matches!(err, TraceError::CallableType { construct: "while_loop", .. }));
    }

    fn sum_of_indices() -> Callable {
        Callable::new("sum_i", |cx, args| {
            let (i, acc) = args.into_pair()?;
            let i = cx.convert(&i.into_leaf()?, DType::F64)?;
            Ok(Tree::leaf(cx.add(&acc.into_leaf()?, &i)?))
        })
    }

    #[test]
    fn fori_loop_with_static_bounds_is_a_scan() {
        let mut cx = TraceCtx::new();
        let traced = cx
            .trace_fn(Tree::leaf(f64s()), |cx, acc| {
                fori_loop(cx, &Tracer::i64(2), &Tracer::i64(6), &sum_of_indices(), acc)
            })
            .expect("trace");
        assert_eq!(traced.jaxpr.count_primitive(Primitive::Scan), 1);
        assert_eq!(traced.jaxpr.count_primitive(Primitive::While), 0);
        let out = fj_interpreters::eval_jaxpr(&traced.jaxpr, &[], &[Value::scalar_f64(0.5)])
            .expect("eval");
        assert_eq!(scalars(&out), vec![0.5 + 2.0 + 3.0 + 4.0 + 5.0]);
    }

    #[test]
    fn fori_loop_with_traced_bounds_is_a_while() {
        let mut cx = TraceCtx::new();
        let avals = vec![AbstractValue::scalar(DType::I32), f64s()];
        let traced = cx
            .trace_fn(Tree::from_leaves(avals), |cx, args| {
                let args = args.flatten().0;
                fori_loop(
                    cx,
                    &Tracer::i64(1),
                    &args[0],
                    &sum_of_indices(),
                    Tree::leaf(args[1].clone()),
                )
            })
            .expect("trace");
        assert_eq!(traced.jaxpr.count_primitive(Primitive::While), 1);
        let out = eval_jaxpr_with_config(
            &traced.jaxpr,
            &[],
            &[Value::scalar_i32(4), Value::scalar_f64(0.0)],
            &EvalConfig {
                max_while_iterations: Some(100),
            },
        )
        .expect("eval");
        assert_eq!(scalars(&out), vec![1.0 + 2.0 + 3.0]);
    }

    #[test]
    fn fori_loop_with_empty_range_returns_init() {
        let out = run(vec![f64s()], &[Value::scalar_f64(9.0)], |cx, args| {
            let out = fori_loop(
                cx,
                &Tracer::i64(5),
                &Tracer::i64(3),
                &sum_of_indices(),
                Tree::leaf(args[0].clone()),
            )?;
            Ok(vec![out.into_leaf()?])
        })
        .expect("fori");
        assert_eq!(scalars(&out), vec![9.0]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(fj_test_utils::property_test_case_count()))]

        #[test]
        fn prop_while_loop_matches_reference(x in -0.5_f64..50.0, limit in -50.0_f64..200.0) {
            let out = run(vec![f64s(), f64s()], &[Value::scalar_f64(x), Value::scalar_f64(limit)], |cx, args| {
                let (below, step) = doubling(args[1].clone());
                let out = while_loop(cx, &below, &step, Tree::leaf(args[0].clone()))?;
                Ok(vec![out.into_leaf()?])
            })
            .expect("while");
            prop_assert_eq!(scalars(&out), vec![reference_doubling(x, limit)]);
        }
    }
}
