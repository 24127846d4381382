#![forbid(unsafe_code)]

//! Partial evaluation: split a Jaxpr into known and unknown sub-Jaxprs.
//!
//! Given a Jaxpr and a mask of which inputs are unknown, partial evaluation
//! produces:
//! - `jaxpr_known`: known inputs to known outputs followed by residuals
//! - `jaxpr_unknown`: residuals followed by unknown inputs to unknown outputs
//!
//! Invariant: running `jaxpr_known` on the known inputs and feeding its
//! residuals with the unknown inputs to `jaxpr_unknown` reproduces the
//! original outputs.
//!
//! Known equations whose primitive the checkpoint policy does not save are
//! also copied to the unknown side, so that only their inputs cross over
//! as residuals.

use fj_core::{AbstractValue, Atom, Equation, Jaxpr, Primitive, Var, VarId};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::builder::Emitter;
use crate::error::TraceError;
use crate::params::{CheckpointPolicy, ScanParams, WhileParams};

/// Result of partial evaluation on a Jaxpr.
#[derive(Debug, Clone)]
pub struct PartialEvalResult {
    /// Known inputs to known outputs ++ residuals.
    pub jaxpr_known: Jaxpr,
    /// Residuals ++ unknown inputs to unknown outputs.
    pub jaxpr_unknown: Jaxpr,
    /// Which of the original outputs are produced by `jaxpr_unknown`.
    pub out_unknowns: Vec<bool>,
    pub residual_avals: Vec<AbstractValue>,
}

impl PartialEvalResult {
    #[must_use]
    pub fn num_residuals(&self) -> usize {
        self.residual_avals.len()
    }
}

/// Equations one original equation contributes to each side.
struct Split {
    known: Vec<Equation>,
    unknown: Vec<Equation>,
    out_unknowns: Vec<bool>,
}

impl Split {
    fn known(eqn: &Equation) -> Self {
        Self {
            known: vec![eqn.clone()],
            unknown: Vec::new(),
            out_unknowns: vec![false; eqn.outputs.len()],
        }
    }

    fn unknown(eqn: &Equation) -> Self {
        Self {
            known: Vec::new(),
            unknown: vec![eqn.clone()],
            out_unknowns: vec![true; eqn.outputs.len()],
        }
    }
}

/// Partially evaluate `jaxpr` given which inputs are unknown. Outputs
/// flagged in `instantiate` are produced by the unknown side even when
/// they could be computed from known inputs alone.
pub fn partial_eval_jaxpr(
    jaxpr: &Jaxpr,
    unknowns: &[bool],
    instantiate: &[bool],
    policy: &CheckpointPolicy,
) -> Result<PartialEvalResult, TraceError> {
    if unknowns.len() != jaxpr.invars.len() || instantiate.len() != jaxpr.outvars.len() {
        return Err(TraceError::InvalidArgument {
            construct: "partial_eval",
            detail: format!(
                "graph has {} inputs and {} outputs, masks have {} and {} entries",
                jaxpr.invars.len(),
                jaxpr.outvars.len(),
                unknowns.len(),
                instantiate.len()
            ),
        });
    }

    let mut unknown_vars: FxHashSet<VarId> = jaxpr
        .invars
        .iter()
        .zip(unknowns)
        .filter(|(_, uk)| **uk)
        .map(|(var, _)| var.id)
        .collect();

    let mut known_eqns = Vec::new();
    let mut unknown_eqns = Vec::new();
    for eqn in &jaxpr.equations {
        let in_uk: Vec<bool> = eqn
            .inputs
            .iter()
            .map(|atom| atom.var_id().is_some_and(|id| unknown_vars.contains(&id)))
            .collect();
        let split = match eqn.primitive {
            Primitive::Cond => cond_rule(eqn, &in_uk, policy)?,
            Primitive::While => while_rule(eqn, &in_uk, policy)?,
            Primitive::Scan => scan_rule(eqn, &in_uk)?,
            primitive if primitive.is_stateful() => {
                return Err(TraceError::NoRule {
                    transform: "partial_eval",
                    primitive,
                });
            }
            primitive => {
                if in_uk.iter().any(|&uk| uk) {
                    Split::unknown(eqn)
                } else if policy.saveable(primitive) {
                    Split::known(eqn)
                } else {
                    Split {
                        known: vec![eqn.clone()],
                        unknown: vec![eqn.clone()],
                        out_unknowns: vec![false; eqn.outputs.len()],
                    }
                }
            }
        };
        for (var, &uk) in eqn.outputs.iter().zip(&split.out_unknowns) {
            if uk {
                unknown_vars.insert(var.id);
            }
        }
        known_eqns.extend(split.known);
        unknown_eqns.extend(split.unknown);
    }

    let out_unknowns: Vec<bool> = jaxpr
        .outvars
        .iter()
        .zip(instantiate)
        .map(|(atom, &force)| force || atom.var_id().is_some_and(|id| unknown_vars.contains(&id)))
        .collect();
    let unknown_outs: Vec<Atom> = select(&jaxpr.outvars, &out_unknowns, true);
    let unknown_invars: Vec<Var> = select(&jaxpr.invars, unknowns, true);

    let unknown_eqns = dce_equations(unknown_eqns, &unknown_outs);
    let bound: FxHashSet<VarId> = unknown_invars.iter().map(|var| var.id).collect();
    let residuals = free_vars(&unknown_eqns, &unknown_outs, bound);

    let mut known_outs: Vec<Atom> = select(&jaxpr.outvars, &out_unknowns, false);
    known_outs.extend(residuals.iter().map(Atom::from));
    let known_eqns = dce_equations(known_eqns, &known_outs);

    let residual_avals: Vec<AbstractValue> = residuals.iter().map(|var| var.aval.clone()).collect();
    let jaxpr_known = Jaxpr::new(
        select(&jaxpr.invars, unknowns, false),
        jaxpr.constvars.clone(),
        known_outs,
        known_eqns,
    );
    let mut unknown_in = residuals;
    unknown_in.extend(unknown_invars);
    let jaxpr_unknown = Jaxpr::new(unknown_in, Vec::new(), unknown_outs, unknown_eqns);

    debug!(
        known_equations = jaxpr_known.equations.len(),
        unknown_equations = jaxpr_unknown.equations.len(),
        residuals = residual_avals.len(),
        "partial eval split"
    );
    Ok(PartialEvalResult {
        jaxpr_known,
        jaxpr_unknown,
        out_unknowns,
        residual_avals,
    })
}

fn select<T: Clone>(items: &[T], mask: &[bool], keep: bool) -> Vec<T> {
    items
        .iter()
        .zip(mask)
        .filter(|(_, flag)| **flag == keep)
        .map(|(item, _)| item.clone())
        .collect()
}

fn count(mask: &[bool]) -> usize {
    mask.iter().filter(|&&flag| flag).count()
}

/// Keep only equations that contribute to `outs`, preserving order.
fn dce_equations(equations: Vec<Equation>, outs: &[Atom]) -> Vec<Equation> {
    let mut needed: FxHashSet<VarId> = outs.iter().filter_map(Atom::var_id).collect();
    let mut keep = vec![false; equations.len()];
    for (idx, eqn) in equations.iter().enumerate().rev() {
        if eqn.outputs.iter().any(|var| needed.contains(&var.id)) {
            keep[idx] = true;
            needed.extend(eqn.inputs.iter().filter_map(Atom::var_id));
        }
    }
    equations
        .into_iter()
        .zip(keep)
        .filter(|(_, keep)| *keep)
        .map(|(eqn, _)| eqn)
        .collect()
}

/// Variables read by `equations` or `outs` without being defined by them or
/// listed in `bound`, in order of first use.
fn free_vars(equations: &[Equation], outs: &[Atom], mut bound: FxHashSet<VarId>) -> Vec<Var> {
    let mut free = Vec::new();
    let mut seen: FxHashSet<VarId> = FxHashSet::default();
    let mut visit = |atom: &Atom, bound: &FxHashSet<VarId>| {
        if let Atom::Var(var) = atom
            && !bound.contains(&var.id)
            && seen.insert(var.id)
        {
            free.push(var.clone());
        }
    };
    for eqn in equations {
        for atom in &eqn.inputs {
            visit(atom, &bound);
        }
        bound.extend(eqn.outputs.iter().map(|var| var.id));
    }
    for atom in outs {
        visit(atom, &bound);
    }
    free
}

/// Dead code elimination on a Jaxpr.
///
/// Returns a graph with only the outputs flagged in `used_outputs` and the
/// equations they depend on, plus a mask of which inputs are still read.
/// Input variables are kept as they are.
pub fn dce_jaxpr(jaxpr: &Jaxpr, used_outputs: &[bool]) -> (Jaxpr, Vec<bool>) {
    let outvars: Vec<Atom> = select(&jaxpr.outvars, used_outputs, true);
    let equations = dce_equations(jaxpr.equations.clone(), &outvars);
    let mut read: FxHashSet<VarId> = outvars.iter().filter_map(Atom::var_id).collect();
    for eqn in &equations {
        read.extend(eqn.inputs.iter().filter_map(Atom::var_id));
    }
    let used_inputs = jaxpr.invars.iter().map(|var| read.contains(&var.id)).collect();
    (
        Jaxpr::new(
            jaxpr.invars.clone(),
            jaxpr.constvars.clone(),
            outvars,
            equations,
        ),
        used_inputs,
    )
}

/// Known branch index and some unknown operands: every branch is split,
/// and the residuals of all branches are merged into one slot list sized
/// to the largest per-type requirement. Unused slots are filled with zeros.
fn cond_rule(eqn: &Equation, in_uk: &[bool], policy: &CheckpointPolicy) -> Result<Split, TraceError> {
    if in_uk[0] {
        return Ok(Split::unknown(eqn));
    }
    let ops_uk = &in_uk[1..];
    if !ops_uk.iter().any(|&uk| uk) {
        return Ok(Split::known(eqn));
    }
    let n_out = eqn.outputs.len();
    let mut union = vec![false; n_out];
    for branch in &eqn.sub_jaxprs {
        let result = partial_eval_jaxpr(branch, ops_uk, &vec![false; n_out], policy)?;
        for (acc, uk) in union.iter_mut().zip(result.out_unknowns) {
            *acc |= uk;
        }
    }
    let results = eqn
        .sub_jaxprs
        .iter()
        .map(|branch| partial_eval_jaxpr(branch, ops_uk, &union, policy))
        .collect::<Result<Vec<_>, _>>()?;

    let mut slots: Vec<AbstractValue> = Vec::new();
    let mut assignments: Vec<Vec<usize>> = Vec::with_capacity(results.len());
    for result in &results {
        let mut taken: FxHashMap<AbstractValue, usize> = FxHashMap::default();
        let mut assignment = Vec::with_capacity(result.residual_avals.len());
        for aval in &result.residual_avals {
            let key = aval.strong();
            let nth = taken.entry(key.clone()).or_insert(0);
            let slot = slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| **slot == key)
                .map(|(idx, _)| idx)
                .nth(*nth);
            let slot = match slot {
                Some(slot) => slot,
                None => {
                    slots.push(key);
                    slots.len() - 1
                }
            };
            *nth += 1;
            assignment.push(slot);
        }
        assignments.push(assignment);
    }

    let mut known_branches = Vec::with_capacity(results.len());
    let mut unknown_branches = Vec::with_capacity(results.len());
    for (result, assignment) in results.into_iter().zip(&assignments) {
        let nres = result.residual_avals.len();
        let known = result.jaxpr_known;
        let n_known_outs = known.outvars.len() - nres;

        let mut em = Emitter::new();
        for e in known.equations {
            em.push(e);
        }
        let mut slot_atoms: Vec<Option<Atom>> = vec![None; slots.len()];
        for (j, &slot) in assignment.iter().enumerate() {
            slot_atoms[slot] = Some(known.outvars[n_known_outs + j].clone());
        }
        let mut outs = known.outvars[..n_known_outs].to_vec();
        for (slot, atom) in slot_atoms.into_iter().enumerate() {
            outs.push(match atom {
                Some(atom) => atom,
                None => em.zeros(&slots[slot])?,
            });
        }
        known_branches.push(Jaxpr::new(
            known.invars,
            known.constvars,
            outs,
            em.into_equations(),
        ));

        let unknown = result.jaxpr_unknown;
        let mut slot_vars: Vec<Var> = slots.iter().map(|aval| Var::new(aval.clone())).collect();
        for (j, &slot) in assignment.iter().enumerate() {
            slot_vars[slot] = unknown.invars[j].clone();
        }
        slot_vars.extend_from_slice(&unknown.invars[nres..]);
        unknown_branches.push(Jaxpr::new(
            slot_vars,
            Vec::new(),
            unknown.outvars,
            unknown.equations,
        ));
    }

    let residual_vars: Vec<Var> = slots.iter().map(|aval| Var::new(aval.clone())).collect();
    let mut known_inputs = vec![eqn.inputs[0].clone()];
    known_inputs.extend(select(&eqn.inputs[1..], ops_uk, false));
    let mut known_outputs: Vec<Var> = select(&eqn.outputs, &union, false);
    known_outputs.extend(residual_vars.iter().cloned());
    let known = Equation::new(Primitive::Cond, known_inputs, known_outputs)
        .with_params(eqn.params.clone())
        .with_sub_jaxprs(known_branches);

    let mut unknown_inputs = vec![eqn.inputs[0].clone()];
    unknown_inputs.extend(residual_vars.iter().map(Atom::from));
    unknown_inputs.extend(select(&eqn.inputs[1..], ops_uk, true));
    let unknown = Equation::new(Primitive::Cond, unknown_inputs, select(&eqn.outputs, &union, true))
        .with_params(eqn.params.clone())
        .with_sub_jaxprs(unknown_branches);

    debug!(branches = eqn.sub_jaxprs.len(), residual_slots = slots.len(), "cond split");
    Ok(Split {
        known: vec![known],
        unknown: vec![unknown],
        out_unknowns: union,
    })
}

/// Known carries run in a pruned known loop; the unknown side reruns the
/// whole loop. A predicate that depends on unknown carries makes the
/// whole loop unknown.
fn while_rule(eqn: &Equation, in_uk: &[bool], policy: &CheckpointPolicy) -> Result<Split, TraceError> {
    if !in_uk.iter().any(|&uk| uk) {
        return Ok(Split::known(eqn));
    }
    let params = WhileParams::from_eqn(eqn)?;
    let (cn, bn) = (params.cond_nconsts, params.body_nconsts);
    let cconst_uk = &in_uk[..cn];
    let bconst_uk = &in_uk[cn..cn + bn];
    let mut carry_uk = in_uk[cn + bn..].to_vec();
    let cond = &eqn.sub_jaxprs[0];
    let body = &eqn.sub_jaxprs[1];

    let body_split = loop {
        let mut uk = bconst_uk.to_vec();
        uk.extend_from_slice(&carry_uk);
        let result = partial_eval_jaxpr(body, &uk, &carry_uk, policy)?;
        let next: Vec<bool> = carry_uk
            .iter()
            .zip(&result.out_unknowns)
            .map(|(a, b)| *a || *b)
            .collect();
        if next == carry_uk {
            break result;
        }
        carry_uk = next;
    };

    let mut cond_uk = cconst_uk.to_vec();
    cond_uk.extend_from_slice(&carry_uk);
    let cond_split = partial_eval_jaxpr(cond, &cond_uk, &[false], policy)?;
    if cond_split.out_unknowns[0] || carry_uk.iter().all(|&uk| uk) {
        return Ok(Split::unknown(eqn));
    }

    let n_known_carry = carry_uk.len() - count(&carry_uk);
    let mut used = vec![true; n_known_carry];
    used.extend(std::iter::repeat_n(false, body_split.num_residuals()));
    let (known_body, _) = dce_jaxpr(&body_split.jaxpr_known, &used);
    let mut used = vec![true];
    used.extend(std::iter::repeat_n(false, cond_split.num_residuals()));
    let (known_cond, _) = dce_jaxpr(&cond_split.jaxpr_known, &used);

    let carry_in = &eqn.inputs[cn + bn..];
    let mut known_inputs = select(&eqn.inputs[..cn], cconst_uk, false);
    known_inputs.extend(select(&eqn.inputs[cn..cn + bn], bconst_uk, false));
    known_inputs.extend(select(carry_in, &carry_uk, false));
    let known_params = WhileParams {
        cond_nconsts: cn - count(cconst_uk),
        body_nconsts: bn - count(bconst_uk),
    };
    let known = Equation::new(
        Primitive::While,
        known_inputs,
        select(&eqn.outputs, &carry_uk, false),
    )
    .with_params(known_params.to_params())
    .with_sub_jaxprs(vec![known_cond, known_body]);

    let mut unknown = eqn.clone();
    for (out, &uk) in unknown.outputs.iter_mut().zip(&carry_uk) {
        if !uk {
            *out = out.fresh_like();
        }
    }

    debug!(known_carry = n_known_carry, "while split");
    Ok(Split {
        known: vec![known],
        unknown: vec![unknown],
        out_unknowns: carry_uk,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResidualKind {
    /// Computed from constants alone; hoisted out of the loop.
    Invariant,
    /// Equal to the known constant at this position.
    ForwardConst(usize),
    /// Equal to the slice of the known scanned input at this position.
    ForwardXs(usize),
    /// Varies per step; stacked as an extra output of the known scan.
    Extensive,
}

fn scan_rule(eqn: &Equation, in_uk: &[bool]) -> Result<Split, TraceError> {
    if !in_uk.iter().any(|&uk| uk) {
        return Ok(Split::known(eqn));
    }
    let params = ScanParams::from_eqn(eqn)?;
    let (nc, ncar) = (params.num_consts, params.num_carry);
    let body = &eqn.sub_jaxprs[0];
    let n_ys = body.outvars.len() - ncar;
    let const_uk = &in_uk[..nc];
    let xs_uk = &in_uk[nc + ncar..];
    let mut carry_uk = in_uk[nc..nc + ncar].to_vec();

    let split = loop {
        let mut uk = const_uk.to_vec();
        uk.extend_from_slice(&carry_uk);
        uk.extend_from_slice(xs_uk);
        let mut force = carry_uk.clone();
        force.extend(std::iter::repeat_n(false, n_ys));
        let result = partial_eval_jaxpr(body, &uk, &force, &params.checkpoint)?;
        let next: Vec<bool> = carry_uk
            .iter()
            .zip(&result.out_unknowns[..ncar])
            .map(|(a, b)| *a || *b)
            .collect();
        if next == carry_uk {
            break result;
        }
        carry_uk = next;
    };
    let out_unknowns = split.out_unknowns.clone();
    let nres = split.num_residuals();

    let known_body = &split.jaxpr_known;
    let n_kc = nc - count(const_uk);
    let n_kcar = ncar - count(&carry_uk);
    let n_kouts = known_body.outvars.len() - nres;
    let const_in = &eqn.inputs[..nc];
    let carry_in = &eqn.inputs[nc..nc + ncar];
    let xs_in = &eqn.inputs[nc + ncar..];
    let kconst_outer = select(const_in, const_uk, false);
    let kxs_outer = select(xs_in, xs_uk, false);

    let mut invariant: FxHashSet<VarId> =
        known_body.invars[..n_kc].iter().map(|var| var.id).collect();
    for e in &known_body.equations {
        let all_invariant = e
            .inputs
            .iter()
            .all(|atom| atom.var_id().is_none_or(|id| invariant.contains(&id)));
        if all_invariant {
            invariant.extend(e.outputs.iter().map(|var| var.id));
        }
    }
    let invar_pos: FxHashMap<VarId, usize> = known_body
        .invars
        .iter()
        .enumerate()
        .map(|(idx, var)| (var.id, idx))
        .collect();
    let residual_atoms = &known_body.outvars[n_kouts..];
    let kinds: Vec<ResidualKind> = residual_atoms
        .iter()
        .map(|atom| {
            let Some(id) = atom.var_id() else {
                return ResidualKind::Invariant;
            };
            match invar_pos.get(&id) {
                Some(&pos) if pos < n_kc => ResidualKind::ForwardConst(pos),
                Some(&pos) if pos >= n_kc + n_kcar => ResidualKind::ForwardXs(pos - n_kc - n_kcar),
                Some(_) => ResidualKind::Extensive,
                None if invariant.contains(&id) => ResidualKind::Invariant,
                None => ResidualKind::Extensive,
            }
        })
        .collect();

    // Hoist loop-invariant residuals into the enclosing graph.
    let invariant_outs: Vec<Atom> = residual_atoms
        .iter()
        .zip(&kinds)
        .filter(|(_, kind)| **kind == ResidualKind::Invariant)
        .map(|(atom, _)| atom.clone())
        .collect();
    let mut hoist = Emitter::new();
    let hoisted = if invariant_outs.is_empty() {
        Vec::new()
    } else {
        let equations = dce_equations(known_body.equations.clone(), &invariant_outs);
        let hoist_jaxpr = Jaxpr::new(
            known_body.invars[..n_kc].to_vec(),
            Vec::new(),
            invariant_outs,
            equations,
        );
        hoist.inline(&hoist_jaxpr, &[], &kconst_outer)?
    };

    // Known scan: known outputs plus stacked extensive residuals.
    let mut known_body_outs = known_body.outvars[..n_kouts].to_vec();
    let mut extensive_vars = Vec::new();
    for (atom, kind) in residual_atoms.iter().zip(&kinds) {
        if *kind == ResidualKind::Extensive {
            known_body_outs.push(atom.clone());
            extensive_vars.push(Var::new(atom.aval().strong().with_leading(params.length as u32)));
        }
    }
    let known_body_equations = dce_equations(known_body.equations.clone(), &known_body_outs);
    let known_body_jaxpr = Jaxpr::new(
        known_body.invars.clone(),
        Vec::new(),
        known_body_outs,
        known_body_equations,
    );
    let mut known_inputs = kconst_outer.clone();
    known_inputs.extend(select(carry_in, &carry_uk, false));
    known_inputs.extend(kxs_outer.iter().cloned());
    let mut known_linear = select(&params.linear[..nc], const_uk, false);
    known_linear.extend(select(&params.linear[nc..nc + ncar], &carry_uk, false));
    known_linear.extend(select(&params.linear[nc + ncar..], xs_uk, false));
    let known_params = ScanParams {
        num_consts: n_kc,
        num_carry: n_kcar,
        linear: known_linear,
        ..params.clone()
    };
    let mut known_outputs = select(&eqn.outputs, &out_unknowns, false);
    known_outputs.extend(extensive_vars.iter().cloned());
    let known_scan = Equation::new(Primitive::Scan, known_inputs, known_outputs)
        .with_params(known_params.to_params())
        .with_sub_jaxprs(vec![known_body_jaxpr]);

    // Unknown scan: residual invars regrouped by kind.
    let unknown_body = &split.jaxpr_unknown;
    let res_vars = &unknown_body.invars[..nres];
    let uk_rest = &unknown_body.invars[nres..];
    let n_ukc = count(const_uk);
    let n_ukcar = count(&carry_uk);
    let pick = |want: fn(&ResidualKind) -> bool| -> Vec<usize> {
        kinds
            .iter()
            .enumerate()
            .filter(|(_, kind)| want(kind))
            .map(|(idx, _)| idx)
            .collect()
    };
    let inv_idx = pick(|k| *k == ResidualKind::Invariant);
    let fc_idx = pick(|k| matches!(k, ResidualKind::ForwardConst(_)));
    let ext_idx = pick(|k| *k == ResidualKind::Extensive);
    let fx_idx = pick(|k| matches!(k, ResidualKind::ForwardXs(_)));

    let mut body_invars = Vec::with_capacity(unknown_body.invars.len());
    let mut inputs: Vec<Atom> = Vec::with_capacity(unknown_body.invars.len());
    let mut linear = Vec::with_capacity(unknown_body.invars.len());
    for (n, &j) in inv_idx.iter().enumerate() {
        body_invars.push(res_vars[j].clone());
        inputs.push(hoisted[n].clone());
        linear.push(false);
    }
    for &j in &fc_idx {
        if let ResidualKind::ForwardConst(pos) = kinds[j] {
            body_invars.push(res_vars[j].clone());
            inputs.push(kconst_outer[pos].clone());
            linear.push(false);
        }
    }
    body_invars.extend_from_slice(&uk_rest[..n_ukc]);
    inputs.extend(select(const_in, const_uk, true));
    linear.extend(select(&params.linear[..nc], const_uk, true));
    body_invars.extend_from_slice(&uk_rest[n_ukc..n_ukc + n_ukcar]);
    inputs.extend(select(carry_in, &carry_uk, true));
    linear.extend(select(&params.linear[nc..nc + ncar], &carry_uk, true));
    for (n, &j) in ext_idx.iter().enumerate() {
        body_invars.push(res_vars[j].clone());
        inputs.push(Atom::from(&extensive_vars[n]));
        linear.push(false);
    }
    for &j in &fx_idx {
        if let ResidualKind::ForwardXs(pos) = kinds[j] {
            body_invars.push(res_vars[j].clone());
            inputs.push(kxs_outer[pos].clone());
            linear.push(false);
        }
    }
    body_invars.extend_from_slice(&uk_rest[n_ukc + n_ukcar..]);
    inputs.extend(select(xs_in, xs_uk, true));
    linear.extend(select(&params.linear[nc + ncar..], xs_uk, true));

    let unknown_params = ScanParams {
        num_consts: inv_idx.len() + fc_idx.len() + n_ukc,
        num_carry: n_ukcar,
        linear,
        ..params.clone()
    };
    let unknown_body_jaxpr = Jaxpr::new(
        body_invars,
        Vec::new(),
        unknown_body.outvars.clone(),
        unknown_body.equations.clone(),
    );
    let unknown_scan = Equation::new(
        Primitive::Scan,
        inputs,
        select(&eqn.outputs, &out_unknowns, true),
    )
    .with_params(unknown_params.to_params())
    .with_sub_jaxprs(vec![unknown_body_jaxpr]);

    debug!(
        invariant = inv_idx.len(),
        forwarded_consts = fc_idx.len(),
        forwarded_xs = fx_idx.len(),
        extensive = ext_idx.len(),
        "scan residuals classified"
    );
    let mut known = hoist.into_equations();
    known.push(known_scan);
    Ok(Split {
        known,
        unknown: vec![unknown_scan],
        out_unknowns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval_jaxpr;
    use crate::test_graphs::{cond_graph, f64s, scan_graph, trace, vec_f64, while_graph};
    use crate::trace::Tracer;
    use fj_core::{DType, Shape, Value};
    use proptest::prelude::*;

    fn make_add_chain_jaxpr() -> Jaxpr {
        // { a, b -> c = add(a, b); d = mul(c, b) -> d }
        trace(vec![f64s(), f64s()], |cx, args| {
            let c = cx.add(&args[0], &args[1])?;
            Ok(vec![cx.mul(&c, &args[1])?])
        })
    }

    /// Evaluate the known side, then the unknown side on its residuals.
    fn run_split(
        result: &PartialEvalResult,
        args: &[Value],
        unknowns: &[bool],
    ) -> Vec<Value> {
        let known_args: Vec<Value> = select(args, unknowns, false);
        let unknown_args: Vec<Value> = select(args, unknowns, true);
        let known_out = eval_jaxpr(&result.jaxpr_known, &[], &known_args).expect("known");
        let n_known = known_out.len() - result.num_residuals();
        let mut uk_in = known_out[n_known..].to_vec();
        uk_in.extend(unknown_args);
        let unknown_out = eval_jaxpr(&result.jaxpr_unknown, &[], &uk_in).expect("unknown");
        let (mut known_iter, mut unknown_iter) =
            (known_out[..n_known].iter(), unknown_out.iter());
        result
            .out_unknowns
            .iter()
            .map(|&uk| {
                if uk {
                    unknown_iter.next().expect("unknown out").clone()
                } else {
                    known_iter.next().expect("known out").clone()
                }
            })
            .collect()
    }

    #[test]
    fn pe_all_known_folds_everything() {
        let jaxpr = make_add_chain_jaxpr();
        let result =
            partial_eval_jaxpr(&jaxpr, &[false, false], &[false], &CheckpointPolicy::default())
                .expect("pe");
        assert_eq!(result.jaxpr_known.equations.len(), 2);
        assert_eq!(result.jaxpr_unknown.equations.len(), 0);
        assert_eq!(result.out_unknowns, vec![false]);
    }

    #[test]
    fn pe_all_unknown_residualizes_everything() {
        let jaxpr = make_add_chain_jaxpr();
        let result =
            partial_eval_jaxpr(&jaxpr, &[true, true], &[false], &CheckpointPolicy::default())
                .expect("pe");
        assert_eq!(result.jaxpr_known.equations.len(), 0);
        assert_eq!(result.jaxpr_unknown.equations.len(), 2);
        assert_eq!(result.out_unknowns, vec![true]);
        assert_eq!(result.num_residuals(), 0);
    }

    #[test]
    fn pe_input_mask_mismatch() {
        let jaxpr = make_add_chain_jaxpr();
        let err = partial_eval_jaxpr(&jaxpr, &[false], &[false], &CheckpointPolicy::default())
            .expect_err("mask");
        assert!(matches!(err, TraceError::InvalidArgument { .. }));
    }

    #[test]
    fn pe_generates_residuals_for_known_to_unknown_flow() {
        // a known, b unknown: neg(a) is known, mul(c, b) is unknown.
        let jaxpr = trace(vec![f64s(), f64s()], |cx, args| {
            let c = cx.neg(&args[0])?;
            Ok(vec![cx.mul(&c, &args[1])?])
        });
        let result =
            partial_eval_jaxpr(&jaxpr, &[false, true], &[false], &CheckpointPolicy::default())
                .expect("pe");
        assert_eq!(result.jaxpr_known.equations.len(), 1);
        assert_eq!(result.jaxpr_unknown.equations.len(), 1);
        assert_eq!(result.residual_avals, vec![f64s()]);
        let args = [Value::scalar_f64(3.0), Value::scalar_f64(4.0)];
        let split = run_split(&result, &args, &[false, true]);
        assert_eq!(split, eval_jaxpr(&jaxpr, &[], &args).expect("eval"));
    }

    #[test]
    fn save_nothing_recomputes_from_inputs() {
        let jaxpr = trace(vec![f64s(), f64s()], |cx, args| {
            let s = cx.sin(&args[0])?;
            let e = cx.exp(&s)?;
            Ok(vec![cx.mul(&e, &args[1])?])
        });
        let result =
            partial_eval_jaxpr(&jaxpr, &[false, true], &[false], &CheckpointPolicy::SaveNothing)
                .expect("pe");
        assert_eq!(result.residual_avals.len(), 1);
        assert_eq!(result.jaxpr_known.equations.len(), 0);
        assert_eq!(result.jaxpr_unknown.count_primitive(Primitive::Sin), 1);

        let only_sin = CheckpointPolicy::SaveOnly(vec![Primitive::Sin]);
        let result = partial_eval_jaxpr(&jaxpr, &[false, true], &[false], &only_sin).expect("pe");
        assert_eq!(result.jaxpr_unknown.count_primitive(Primitive::Sin), 0);
        assert_eq!(result.jaxpr_unknown.count_primitive(Primitive::Exp), 1);
    }

    #[test]
    fn instantiate_moves_known_output_to_unknown_side() {
        let jaxpr = make_add_chain_jaxpr();
        let result =
            partial_eval_jaxpr(&jaxpr, &[false, false], &[true], &CheckpointPolicy::default())
                .expect("pe");
        assert_eq!(result.out_unknowns, vec![true]);
        assert_eq!(result.num_residuals(), 1);
        let args = [Value::scalar_f64(1.0), Value::scalar_f64(2.0)];
        assert_eq!(
            run_split(&result, &args, &[false, false]),
            eval_jaxpr(&jaxpr, &[], &args).expect("eval")
        );
    }

    #[test]
    fn dce_removes_unused_equations() {
        let jaxpr = trace(vec![f64s()], |cx, args| {
            Ok(vec![cx.neg(&args[0])?, cx.sin(&args[0])?])
        });
        let (pruned, used_inputs) = dce_jaxpr(&jaxpr, &[true, false]);
        assert_eq!(pruned.equations.len(), 1);
        assert_eq!(pruned.equations[0].primitive, Primitive::Neg);
        assert_eq!(pruned.outvars.len(), 1);
        assert_eq!(used_inputs, vec![true]);

        let (pruned, used_inputs) = dce_jaxpr(&jaxpr, &[false, false]);
        assert!(pruned.equations.is_empty());
        assert_eq!(used_inputs, vec![false]);
    }

    /// Body over consts `[w]`, carry `[c]`, xs `[x]`:
    /// `c' = c * w * sin(w) * x + c * cos(x)`.
    fn classified_scan() -> Jaxpr {
        let body = trace(vec![f64s(), f64s(), f64s()], |cx, args| {
            let (w, c, x) = (&args[0], &args[1], &args[2]);
            let sw = cx.sin(w)?;
            let cw = cx.mul(c, w)?;
            let t = cx.mul(&cw, &sw)?;
            let t = cx.mul(&t, x)?;
            let cosx = cx.cos(x)?;
            let u = cx.mul(c, &cosx)?;
            Ok(vec![cx.add(&t, &u)?])
        });
        scan_graph(body, 1, 1, 3, false, CheckpointPolicy::SaveEverything)
    }

    #[test]
    fn scan_residuals_are_forwarded_hoisted_or_stacked() {
        let jaxpr = classified_scan();
        let unknowns = [false, true, false];
        let result = partial_eval_jaxpr(&jaxpr, &unknowns, &[false], &CheckpointPolicy::default())
            .expect("pe");
        assert_eq!(result.out_unknowns, vec![true]);

        let known_scan = result
            .jaxpr_known
            .equations
            .iter()
            .find(|e| e.primitive == Primitive::Scan)
            .expect("known scan");
        assert_eq!(known_scan.outputs.len(), 1, "only cos(x) is stacked");
        let hoisted_sin = result
            .jaxpr_known
            .equations
            .iter()
            .any(|e| e.primitive == Primitive::Sin);
        assert!(hoisted_sin, "sin(w) is computed outside the loop");

        let unknown_scan = &result.jaxpr_unknown.equations[0];
        let params = ScanParams::from_eqn(unknown_scan).expect("params");
        assert_eq!(params.num_consts, 2, "hoisted sin(w) and forwarded w");
        assert_eq!(params.num_carry, 1);
        assert_eq!(params.num_xs(), 2, "stacked cos(x) and forwarded xs");

        let xs = Value::vector_f64(&[0.3, -0.7, 1.1]).expect("xs");
        let args = [Value::scalar_f64(0.9), Value::scalar_f64(1.25), xs];
        assert_eq!(
            run_split(&result, &args, &unknowns),
            eval_jaxpr(&jaxpr, &[], &args).expect("eval")
        );
    }

    #[test]
    fn while_keeps_known_carries_in_known_loop() {
        let cond = trace(vec![AbstractValue::scalar(DType::I32), f64s()], |cx, args| {
            Ok(vec![cx.lt(&args[0], &Tracer::i64(4))?])
        });
        let body = trace(vec![AbstractValue::scalar(DType::I32), f64s()], |cx, args| {
            let i = cx.add(&args[0], &Tracer::i64(1))?;
            let x = cx.mul(&args[1], &Tracer::f64(2.0))?;
            Ok(vec![i, x])
        });
        let jaxpr = while_graph(cond, body, 0, 0);
        let unknowns = [false, true];
        let result = partial_eval_jaxpr(&jaxpr, &unknowns, &[false, false], &CheckpointPolicy::default())
            .expect("pe");
        assert_eq!(result.out_unknowns, vec![false, true]);
        assert_eq!(result.jaxpr_known.count_primitive(Primitive::While), 1);
        assert_eq!(result.jaxpr_unknown.count_primitive(Primitive::While), 1);
        let args = [Value::scalar_i32(0), Value::scalar_f64(1.5)];
        assert_eq!(
            run_split(&result, &args, &unknowns),
            eval_jaxpr(&jaxpr, &[], &args).expect("eval")
        );
    }

    #[test]
    fn cond_residual_slots_are_shared_across_branches() {
        let one = trace(vec![f64s(), f64s()], |cx, args| {
            let s = cx.sin(&args[0])?;
            Ok(vec![cx.mul(&s, &args[1])?])
        });
        let two = trace(vec![f64s(), f64s()], |cx, args| {
            let s = cx.sin(&args[0])?;
            let c = cx.cos(&args[0])?;
            let a = cx.mul(&s, &args[1])?;
            Ok(vec![cx.mul(&a, &c)?])
        });
        let jaxpr = cond_graph(vec![one, two]);
        let unknowns = [false, false, true];
        let result = partial_eval_jaxpr(&jaxpr, &unknowns, &[false], &CheckpointPolicy::default())
            .expect("pe");
        let known_cond = &result.jaxpr_known.equations[0];
        assert_eq!(known_cond.outputs.len(), 2, "max of 1 and 2 f64 residuals");
        for index in [0, 1] {
            let args = [Value::scalar_i32(index), Value::scalar_f64(0.4), Value::scalar_f64(3.0)];
            assert_eq!(
                run_split(&result, &args, &unknowns),
                eval_jaxpr(&jaxpr, &[], &args).expect("eval")
            );
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(
            fj_test_utils::property_test_case_count()
        ))]

        #[test]
        fn prop_split_reproduces_original(
            xs in proptest::collection::vec(-2.0_f64..2.0, 3),
            w in -2.0_f64..2.0,
            c in -2.0_f64..2.0,
            mask in proptest::collection::vec(any::<bool>(), 3),
        ) {
            let jaxpr = classified_scan();
            let args = [
                Value::scalar_f64(w),
                Value::scalar_f64(c),
                Value::from_f64s(DType::F64, Shape::vector(3), &xs).expect("xs"),
            ];
            let result = partial_eval_jaxpr(&jaxpr, &mask, &[false], &CheckpointPolicy::SaveNothing)
                .expect("pe");
            prop_assert_eq!(
                run_split(&result, &args, &mask),
                eval_jaxpr(&jaxpr, &[], &args).expect("eval")
            );
        }

        #[test]
        fn prop_vector_scan_split_with_unknown_xs(scale in -2.0_f64..2.0) {
            let body = trace(vec![vec_f64(2), vec_f64(2)], |cx, args| {
                let s = cx.sin(&args[0])?;
                let y = cx.mul(&s, &args[1])?;
                Ok(vec![cx.add(&args[0], &args[1])?, y])
            });
            let jaxpr = scan_graph(body, 0, 1, 2, true, CheckpointPolicy::SaveEverything);
            let args = [
                Value::vector_f64(&[scale, 1.0]).expect("c"),
                Value::from_f64s(DType::F64, Shape::new(vec![2, 2]), &[1.0, 2.0, 3.0, scale])
                    .expect("xs"),
            ];
            let unknowns = [false, true];
            let result = partial_eval_jaxpr(&jaxpr, &unknowns, &[false, false], &CheckpointPolicy::default())
                .expect("pe");
            prop_assert_eq!(
                run_split(&result, &args, &unknowns),
                eval_jaxpr(&jaxpr, &[], &args).expect("eval")
            );
        }
    }
}
