#![forbid(unsafe_code)]

//! Trace-level `vmap`: trace a per-example function, batch its graph and
//! splice the result into the current frame.

use fj_core::Tree;
use fj_interpreters::{TraceCtx, TraceError, Tracer, batch_jaxpr};
use tracing::debug;

use crate::callable::Callable;
use crate::operand_atoms;

/// Map `f` over the leading axis of the argument leaves flagged in
/// `in_batched` (every leaf when `None`). Unflagged leaves are shared by
/// all examples. Every output carries the batch axis.
pub fn vmap(
    cx: &mut TraceCtx,
    f: &Callable,
    args: Tree<Tracer>,
    in_batched: Option<&[bool]>,
) -> Result<Tree<Tracer>, TraceError> {
    f.require_function("vmap", "f")?;
    let (leaves, in_tree) = args.flatten();
    let flags = match in_batched {
        Some(flags) if flags.len() != leaves.len() => {
            return Err(TraceError::InvalidArgument {
                construct: "vmap",
                detail: format!(
                    "in_axes has {} entries but the arguments have {} leaves",
                    flags.len(),
                    leaves.len()
                ),
            });
        }
        Some(flags) => flags.to_vec(),
        None => vec![true; leaves.len()],
    };

    let mut axis_size = None;
    let mut example_avals = Vec::with_capacity(leaves.len());
    for (leaf, &batched) in leaves.iter().zip(&flags) {
        let aval = leaf.aval();
        if !batched {
            example_avals.push(aval);
            continue;
        }
        let (Some(&size), Some(example)) = (aval.shape.dims.first(), aval.without_leading()) else {
            return Err(TraceError::InvalidArgument {
                construct: "vmap",
                detail: format!("vmap was asked to map over a leading axis of {aval}, which has none"),
            });
        };
        match axis_size {
            Some(expected) if expected != size => {
                let sizes: Vec<String> = leaves
                    .iter()
                    .zip(&flags)
                    .filter(|(_, batched)| **batched)
                    .map(|(leaf, _)| leaf.aval().to_string())
                    .collect();
                return Err(TraceError::InvalidArgument {
                    construct: "vmap",
                    detail: format!(
                        "vmap got inconsistent sizes for the mapped axis: [{}]",
                        sizes.join(", ")
                    ),
                });
            }
            _ => axis_size = Some(size),
        }
        example_avals.push(example);
    }
    let Some(axis_size) = axis_size else {
        return Err(TraceError::InvalidArgument {
            construct: "vmap",
            detail: "vmap must have at least one argument with a mapped axis".to_owned(),
        });
    };

    let traced = f.trace(cx, in_tree.unflatten(example_avals)?, &["construct=vmap".to_owned()])?;
    let mut mask = vec![false; traced.num_consts()];
    mask.extend(&flags);
    let instantiate = vec![true; traced.jaxpr.outvars.len()];
    let (batched, _) = batch_jaxpr(&traced.jaxpr, axis_size, &mask, &instantiate)?;
    debug!(
        f = f.name(),
        axis_size,
        batched_args = flags.iter().filter(|&&b| b).count(),
        equations = batched.equations.len(),
        "vmapped function"
    );

    let mut atoms = cx.operand_atoms(&traced.consts)?;
    atoms.extend(operand_atoms(cx, "vmap", &leaves)?);
    let outs = cx.emitter()?.inline(&batched, &[], &atoms)?;
    let outs = outs
        .into_iter()
        .map(|atom| cx.tracer(atom))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(traced.out_tree.unflatten(outs)?)
}
