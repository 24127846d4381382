#![forbid(unsafe_code)]

//! `scan` and `map`: a body applied once per leading-axis slice, threading
//! a carry of fixed type.

use fj_core::{AbstractValue, Primitive, Tree, TreeDef, check_tree_types};
use fj_interpreters::{CheckpointPolicy, ScanParams, TraceCtx, TraceError, TracedJaxpr, Tracer};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::callable::Callable;
use crate::{coerce_carry, operand_atoms, promote_weak_carry};

/// Static options of a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Number of steps. Required when there is nothing to scan over;
    /// otherwise it must agree with the leading extent of every input.
    pub length: Option<usize>,
    pub reverse: bool,
    /// Steps evaluated per body invocation group; results do not depend
    /// on it.
    pub unroll: usize,
    pub checkpoint: CheckpointPolicy,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            length: None,
            reverse: false,
            unroll: 1,
            checkpoint: CheckpointPolicy::default(),
        }
    }
}

/// Scan `body: (carry, x) -> (carry', y)` over the leading axis of `xs`.
/// Returns the final carry and the stacked `y`s, in the original time
/// order whatever the direction.
pub fn scan(
    cx: &mut TraceCtx,
    body: &Callable,
    init: Tree<Tracer>,
    xs: Tree<Tracer>,
    options: &ScanOptions,
) -> Result<(Tree<Tracer>, Tree<Tracer>), TraceError> {
    body.require_function("scan", "f")?;
    if options.unroll < 1 {
        return Err(TraceError::InvalidArgument {
            construct: "scan",
            detail: format!("`unroll` must be a positive integer, got {}", options.unroll),
        });
    }

    let (xs, xs_tree) = xs.flatten();
    let xs_avals: Vec<AbstractValue> = xs.iter().map(Tracer::aval).collect();
    let length = scan_length(&xs_avals, options.length)?;
    let extent = u32::try_from(length).map_err(|_| TraceError::InvalidArgument {
        construct: "scan",
        detail: format!("scan `length` of {length} exceeds the largest array extent {}", u32::MAX),
    })?;
    let slice_avals = xs_avals
        .iter()
        .map(|aval| {
            aval.without_leading().ok_or_else(|| TraceError::InvalidArgument {
                construct: "scan",
                detail: format!("scan got value with no leading axis to scan over: {aval}"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let slice_tree = xs_tree.unflatten(slice_avals)?;

    let carry_tree = init.treedef();
    let (carry, _) = init.flatten();
    let mut carry_avals: Vec<AbstractValue> = carry.iter().map(Tracer::aval).collect();
    let (traced, ys_tree) = loop {
        let in_avals = Tree::pair(carry_tree.unflatten(carry_avals.clone())?, slice_tree.clone());
        let traced = body.trace(cx, in_avals, &["construct=scan".to_owned()])?;
        let (carry_out_tree, ys_tree) = split_pair(&traced)?;
        let out_avals = traced.out_avals();
        let carry_out = &out_avals[..carry_out_tree.num_leaves()];
        if carry_out_tree != carry_tree {
            check_tree_types(
                "scan carry output and input",
                &carry_out_tree,
                carry_out,
                &carry_tree,
                &carry_avals,
            )?;
        }
        match promote_weak_carry(&carry_avals, carry_out) {
            Some(promoted) => {
                debug!("promoting weakly typed scan carry; retracing");
                carry_avals = promoted;
            }
            None => {
                check_tree_types(
                    "scan carry output and input",
                    &carry_out_tree,
                    carry_out,
                    &carry_tree,
                    &carry_avals,
                )?;
                break (traced, ys_tree);
            }
        }
    };
    let carry = coerce_carry(cx, &carry, &carry_avals)?;

    let num_consts = traced.num_consts();
    let num_carry = carry.len();
    let mut inputs = cx.operand_atoms(&traced.consts)?;
    inputs.extend(operand_atoms(cx, "scan", &carry)?);
    inputs.extend(operand_atoms(cx, "scan", &xs)?);
    let params = ScanParams {
        num_consts,
        num_carry,
        length,
        reverse: options.reverse,
        unroll: options.unroll,
        linear: vec![false; inputs.len()],
        checkpoint: options.checkpoint.clone(),
    };
    let mut out_avals = carry_avals;
    out_avals.extend(
        traced.out_avals()[num_carry..]
            .iter()
            .map(|aval| aval.strong().with_leading(extent)),
    );
    debug!(
        length,
        reverse = options.reverse,
        unroll = options.unroll,
        consts = num_consts,
        carry = num_carry,
        xs = xs.len(),
        "traced scan"
    );
    let mut outs = cx.bind_control(
        Primitive::Scan,
        inputs,
        params.to_params(),
        vec![traced.jaxpr],
        out_avals,
    )?;
    let ys = outs.split_off(num_carry);
    Ok((carry_tree.unflatten(outs)?, ys_tree.unflatten(ys)?))
}

/// `f` applied to every leading-axis slice of `xs`, stacked.
pub fn map(cx: &mut TraceCtx, f: &Callable, xs: Tree<Tracer>) -> Result<Tree<Tracer>, TraceError> {
    f.require_function("map", "f")?;
    let inner = f.clone();
    let body = Callable::wrapping(f, "map", move |cx, args| {
        let (carry, x) = args.into_pair()?;
        let y = inner.call(cx, x)?;
        Ok(Tree::pair(carry, y))
    });
    let (_, ys) = scan(cx, &body, Tree::unit(), xs, &ScanOptions::default())?;
    Ok(ys)
}

fn scan_length(xs_avals: &[AbstractValue], requested: Option<usize>) -> Result<usize, TraceError> {
    let mut extents = Vec::with_capacity(xs_avals.len());
    for aval in xs_avals {
        match aval.shape.dims.first() {
            Some(&extent) => extents.push(extent as usize),
            None => {
                return Err(TraceError::InvalidArgument {
                    construct: "scan",
                    detail: format!("scan got value with no leading axis to scan over: {aval}"),
                });
            }
        }
    }
    let describe = || {
        xs_avals
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    match requested {
        Some(length) if extents.iter().any(|&extent| extent != length) => {
            Err(TraceError::InvalidArgument {
                construct: "scan",
                detail: format!(
                    "scan got `length` argument of {length} which disagrees with leading axis sizes of [{}].",
                    describe()
                ),
            })
        }
        Some(length) => Ok(length),
        None => match extents.split_first() {
            None => Err(TraceError::InvalidArgument {
                construct: "scan",
                detail: "scan got no values to scan over and `length` not provided.".to_owned(),
            }),
            Some((first, rest)) if rest.iter().any(|extent| extent != first) => {
                Err(TraceError::InvalidArgument {
                    construct: "scan",
                    detail: format!(
                        "scan got values with different leading axis sizes: [{}].",
                        describe()
                    ),
                })
            }
            Some((&first, _)) => Ok(first),
        },
    }
}

fn split_pair(traced: &TracedJaxpr) -> Result<(TreeDef, TreeDef), TraceError> {
    match &traced.out_tree {
        TreeDef::Tuple(parts) if parts.len() == 2 => Ok((parts[0].clone(), parts[1].clone())),
        other => Err(TraceError::InvalidArgument {
            construct: "scan",
            detail: format!("scan body output must be a pair, got {other}."),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{f64s, run, scalars};
    use fj_core::{DType, TypeConsistencyError, Value};
    use proptest::prelude::*;

    /// `(c, x) -> (c + x, c * x)`.
    fn add_mul() -> Callable {
        Callable::new("add_mul", |cx, args| {
            let (c, x) = args.into_pair()?;
            let (c, x) = (c.into_leaf()?, x.into_leaf()?);
            let next = cx.add(&c, &x)?;
            let y = cx.mul(&c, &x)?;
            Ok(Tree::pair(Tree::leaf(next), Tree::leaf(y)))
        })
    }

    fn reference(init: f64, xs: &[f64], reverse: bool) -> (f64, Vec<f64>) {
        let mut c = init;
        let mut ys = vec![0.0; xs.len()];
        let order: Vec<usize> = if reverse {
            (0..xs.len()).rev().collect()
        } else {
            (0..xs.len()).collect()
        };
        for t in order {
            ys[t] = c * xs[t];
            c += xs[t];
        }
        (c, ys)
    }

    fn run_scan(init: f64, xs: &[f64], options: ScanOptions) -> (f64, Vec<f64>) {
        let avals = vec![f64s(), AbstractValue::vector(DType::F64, xs.len() as u32)];
        let args = [Value::scalar_f64(init), Value::vector_f64(xs).expect("xs")];
        let out = run(avals, &args, move |cx, args| {
            let (carry, ys) = scan(
                cx,
                &add_mul(),
                Tree::leaf(args[0].clone()),
                Tree::leaf(args[1].clone()),
                &options,
            )?;
            Ok(vec![carry.into_leaf()?, ys.into_leaf()?])
        })
        .expect("scan");
        (
            out[0].as_f64_scalar().expect("carry"),
            out[1].to_f64_vec().expect("ys"),
        )
    }

    #[test]
    fn scan_matches_a_sequential_fold() {
        let xs = [1.0, -2.0, 0.5, 4.0];
        assert_eq!(run_scan(0.25, &xs, ScanOptions::default()), reference(0.25, &xs, false));
        let reversed = ScanOptions {
            reverse: true,
            ..ScanOptions::default()
        };
        assert_eq!(run_scan(0.25, &xs, reversed), reference(0.25, &xs, true));
    }

    #[test]
    fn zero_length_scan_returns_init() {
        assert_eq!(run_scan(3.0, &[], ScanOptions::default()), (3.0, Vec::new()));
    }

    #[test]
    fn length_without_xs_counts_steps() {
        let out = run(vec![f64s()], &[Value::scalar_f64(1.0)], |cx, args| {
            let double = Callable::new("double", |cx, args| {
                let (c, _) = args.into_pair()?;
                let c = c.into_leaf()?;
                let next = cx.mul(&c, &Tracer::f64(2.0))?;
                Ok(Tree::pair(Tree::leaf(next), Tree::leaf(c)))
            });
            let options = ScanOptions {
                length: Some(3),
                ..ScanOptions::default()
            };
            let (carry, ys) = scan(cx, &double, Tree::leaf(args[0].clone()), Tree::unit(), &options)?;
            Ok(vec![carry.into_leaf()?, ys.into_leaf()?])
        })
        .expect("scan");
        assert_eq!(scalars(&out[..1]), vec![8.0]);
        assert_eq!(out[1].to_f64_vec(), Some(vec![1.0, 2.0, 4.0]));
    }

    #[test]
    fn captured_values_become_scan_consts() {
        let mut cx = TraceCtx::new();
        let avals = vec![f64s(), f64s(), AbstractValue::vector(DType::F64, 3)];
        let traced = cx
            .trace_fn(Tree::from_leaves(avals), |cx, args| {
                let args = args.flatten().0;
                let scale = args[0].clone();
                let body = Callable::new("scaled", move |cx, args| {
                    let (c, x) = args.into_pair()?;
                    let x = cx.mul(&x.into_leaf()?, &scale)?;
                    let next = cx.add(&c.into_leaf()?, &x)?;
                    Ok(Tree::pair(Tree::leaf(next), Tree::unit()))
                });
                let (carry, _) = scan(
                    cx,
                    &body,
                    Tree::leaf(args[1].clone()),
                    Tree::leaf(args[2].clone()),
                    &ScanOptions::default(),
                )?;
                Ok(carry)
            })
            .expect("trace");
        let eqn = &traced.jaxpr.equations[0];
        let params = ScanParams::from_eqn(eqn).expect("params");
        assert_eq!((params.num_consts, params.num_carry, params.length), (1, 1, 3));
        let out = fj_interpreters::eval_jaxpr(
            &traced.jaxpr,
            &[],
            &[
                Value::scalar_f64(10.0),
                Value::scalar_f64(1.0),
                Value::vector_f64(&[1.0, 2.0, 3.0]).expect("xs"),
            ],
        )
        .expect("eval");
        assert_eq!(scalars(&out), vec![61.0]);
    }

    #[test]
    fn map_applies_per_slice() {
        let avals = vec![AbstractValue::vector(DType::F64, 3)];
        let args = [Value::vector_f64(&[1.0, 2.0, 3.0]).expect("xs")];
        let out = run(avals, &args, |cx, args| {
            let square = Callable::new("square", |cx, x| {
                let x = x.into_leaf()?;
                Ok(Tree::leaf(cx.mul(&x, &x)?))
            });
            Ok(vec![map(cx, &square, Tree::leaf(args[0].clone()))?.into_leaf()?])
        })
        .expect("map");
        assert_eq!(out[0].to_f64_vec(), Some(vec![1.0, 4.0, 9.0]));
    }

    #[test]
    fn weak_carry_adopts_the_body_dtype() {
        let mut cx = TraceCtx::new();
        let traced = cx
            .trace_fn(Tree::leaf(AbstractValue::vector(DType::F32, 4)), |cx, xs| {
                let (carry, _) = scan(
                    cx,
                    &add_mul(),
                    Tree::leaf(Tracer::f64(0.0)),
                    xs,
                    &ScanOptions::default(),
                )?;
                Ok(carry)
            })
            .expect("trace");
        let carry = traced.jaxpr.out_avals().remove(0);
        assert_eq!((carry.dtype, carry.weak_type), (DType::F32, false));
    }

    fn scan_error(
        avals: Vec<AbstractValue>,
        body: Callable,
        options: ScanOptions,
    ) -> TraceError {
        run(avals, &[], move |cx, args| {
            let xs = Tree::from_leaves(args[1..].to_vec());
            scan(cx, &body, Tree::leaf(args[0].clone()), xs, &options)?;
            Ok(vec![])
        })
        .expect_err("scan should fail")
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        let vec3 = AbstractValue::vector(DType::F64, 3);
        let vec4 = AbstractValue::vector(DType::F64, 4);

        let err = scan_error(vec![f64s(), vec3.clone(), vec4.clone()], add_mul(), ScanOptions::default());
        assert!(err.to_string().contains("different leading axis sizes"), "{err}");
        assert!(err.to_string().contains("f64[4]"), "{err}");

        let err = scan_error(vec![f64s(), f64s()], add_mul(), ScanOptions::default());
        assert!(err.to_string().contains("no leading axis"), "{err}");

        let err = scan_error(vec![f64s()], add_mul(), ScanOptions::default());
        assert!(err.to_string().contains("`length` not provided"), "{err}");

        let mismatched = ScanOptions {
            length: Some(5),
            ..ScanOptions::default()
        };
        let err = scan_error(vec![f64s(), vec3.clone()], add_mul(), mismatched);
        assert!(err.to_string().contains("disagrees"), "{err}");

        let oversized = ScanOptions {
            length: Some(u32::MAX as usize + 1),
            ..ScanOptions::default()
        };
        let err = scan_error(vec![f64s()], add_mul(), oversized);
        assert!(matches!(err, TraceError::InvalidArgument { construct: "scan", .. }));
        assert!(err.to_string().contains("exceeds"), "{err}");

        let unroll = ScanOptions {
            unroll: 0,
            ..ScanOptions::default()
        };
        let err = scan_error(vec![f64s(), vec3.clone()], add_mul(), unroll);
        assert!(matches!(err, TraceError::InvalidArgument { construct: "scan", .. }));

        let not_pair = Callable::new("not_pair", |_, args| Ok(args.into_pair()?.0));
        let err = scan_error(vec![f64s(), vec3.clone()], not_pair, ScanOptions::default());
        assert!(err.to_string().contains("must be a pair"), "{err}");

        let narrowing = Callable::new("narrowing", |cx, args| {
            let (c, x) = args.into_pair()?;
            let c = cx.convert(&c.into_leaf()?, DType::F32)?;
            Ok(Tree::pair(Tree::leaf(c), x))
        });
        let err = scan_error(vec![f64s(), vec3], narrowing, ScanOptions::default());
        assert!(matches!(
            err,
            TraceError::TypeConsistency(TypeConsistencyError::LeafTypeMismatch { .. })
        ));
        assert!(err.to_string().contains("scan carry output and input"), "{err}");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(fj_test_utils::property_test_case_count()))]

        #[test]
        fn prop_scan_is_a_fold_for_every_unroll(
            init in -10.0_f64..10.0,
            xs in proptest::collection::vec(-10.0_f64..10.0, 0..9),
            reverse in any::<bool>(),
        ) {
            let expected = reference(init, &xs, reverse);
            for unroll in [1, 2, 4] {
                let options = ScanOptions { reverse, unroll, ..ScanOptions::default() };
                let got = run_scan(init, &xs, options);
                prop_assert_eq!(got.0.to_bits(), expected.0.to_bits());
                prop_assert_eq!(&got.1, &expected.1);
            }
        }
    }
}
