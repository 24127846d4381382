#![forbid(unsafe_code)]

//! Vectorizing map over graphs.
//!
//! Every batched value carries the batch as its leading axis. Numeric
//! primitives get per-primitive rules; control flow keeps its structure
//! where it can:
//! - `cond` with an unbatched index stays one `cond`; a batched index
//!   evaluates every branch and selects per example,
//! - `while` with a batched predicate runs until no example wants another
//!   iteration, freezing finished examples with a select,
//! - `scan` moves the batch axis of its scanned inputs behind the time axis.

use fj_core::{AbstractValue, Atom, DType, Equation, Jaxpr, Literal, Primitive, Var, VarId};
use fj_lax::parse_usize_param;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use tracing::debug;

use crate::builder::Emitter;
use crate::error::TraceError;
use crate::params::{ScanParams, WhileParams};

/// Batch `jaxpr` over a leading axis of `axis_size` on the inputs flagged
/// in `in_batched`. Returns the batched graph and which outputs carry the
/// batch axis; outputs flagged in `instantiate` always do.
pub fn batch_jaxpr(
    jaxpr: &Jaxpr,
    axis_size: u32,
    in_batched: &[bool],
    instantiate: &[bool],
) -> Result<(Jaxpr, Vec<bool>), TraceError> {
    if in_batched.len() != jaxpr.invars.len() || instantiate.len() != jaxpr.outvars.len() {
        return Err(TraceError::InvalidArgument {
            construct: "vmap",
            detail: format!(
                "graph has {} inputs and {} outputs, masks have {} and {} entries",
                jaxpr.invars.len(),
                jaxpr.outvars.len(),
                in_batched.len(),
                instantiate.len()
            ),
        });
    }
    let mut cx = BatchCtx {
        em: Emitter::new(),
        env: FxHashMap::default(),
        size: axis_size,
    };
    let mut invars = Vec::with_capacity(jaxpr.invars.len());
    for (var, &batched) in jaxpr.invars.iter().zip(in_batched) {
        let new = if batched {
            Var::new(var.aval.with_leading(axis_size))
        } else {
            Var::new(var.aval.clone())
        };
        cx.env.insert(var.id, (Atom::from(&new), batched));
        invars.push(new);
    }
    for var in &jaxpr.constvars {
        cx.env.insert(var.id, (Atom::from(var), false));
    }
    for eqn in &jaxpr.equations {
        cx.equation(eqn)?;
    }

    let mut outvars = Vec::with_capacity(jaxpr.outvars.len());
    let mut out_batched = Vec::with_capacity(jaxpr.outvars.len());
    for (atom, &force) in jaxpr.outvars.iter().zip(instantiate) {
        let (new, batched) = cx.read(atom);
        if force && !batched {
            outvars.push(cx.broadcast_batch(&new)?);
            out_batched.push(true);
        } else {
            outvars.push(new);
            out_batched.push(batched);
        }
    }
    debug!(axis_size, equations = jaxpr.equations.len(), "batched graph");
    Ok((
        Jaxpr::new(invars, jaxpr.constvars.clone(), outvars, cx.em.into_equations()),
        out_batched,
    ))
}

fn is_elementwise(primitive: Primitive) -> bool {
    matches!(
        primitive,
        Primitive::Add
            | Primitive::Sub
            | Primitive::Mul
            | Primitive::Div
            | Primitive::Max
            | Primitive::Min
            | Primitive::Neg
            | Primitive::Sign
            | Primitive::Exp
            | Primitive::Log
            | Primitive::Sin
            | Primitive::Cos
            | Primitive::Sinh
            | Primitive::Cosh
            | Primitive::Tanh
            | Primitive::Eq
            | Primitive::Ne
            | Primitive::Lt
            | Primitive::Le
            | Primitive::Gt
            | Primitive::Ge
            | Primitive::And
            | Primitive::Or
            | Primitive::Not
            | Primitive::Xor
            | Primitive::SelectN
            | Primitive::Clamp
            | Primitive::ConvertElementType
            | Primitive::StopGradient
    )
}

fn shifted(axes: &[usize]) -> Vec<usize> {
    axes.iter().map(|axis| axis + 1).collect()
}

fn with_batch<T: Clone>(lead: T, rest: &[T]) -> Vec<T> {
    let mut out = Vec::with_capacity(rest.len() + 1);
    out.push(lead);
    out.extend_from_slice(rest);
    out
}

struct BatchCtx {
    em: Emitter,
    env: FxHashMap<VarId, (Atom, bool)>,
    size: u32,
}

impl BatchCtx {
    fn read(&self, atom: &Atom) -> (Atom, bool) {
        match atom {
            Atom::Lit(_) => (atom.clone(), false),
            Atom::Var(var) => self
                .env
                .get(&var.id)
                .cloned()
                .unwrap_or_else(|| (atom.clone(), false)),
        }
    }

    fn bind(&mut self, var: &Var, atom: Atom, batched: bool) {
        self.env.insert(var.id, (atom, batched));
    }

    /// Give an unbatched value a leading batch axis.
    fn broadcast_batch(&mut self, x: &Atom) -> Result<Atom, TraceError> {
        let dims = x.aval().shape.dims;
        let target = with_batch(self.size, &dims);
        let bdims: Vec<usize> = (1..=dims.len()).collect();
        self.em.broadcast_in_dim(x, &target, &bdims)
    }

    fn move_to_batched(&mut self, x: &Atom, batched: bool) -> Result<Atom, TraceError> {
        if batched {
            Ok(x.clone())
        } else {
            self.broadcast_batch(x)
        }
    }

    /// Example `b` of a batched value.
    fn index(&mut self, x: &Atom, b: u32) -> Result<Atom, TraceError> {
        let dims = x.aval().shape.dims;
        let mut starts = vec![0; dims.len()];
        starts[0] = b as usize;
        let mut limits: Vec<usize> = dims.iter().map(|&d| d as usize).collect();
        limits[0] = b as usize + 1;
        let sliced = self.em.slice(x, &starts, &limits, &vec![1; dims.len()])?;
        self.em.reshape(&sliced, &dims[1..])
    }

    fn equation(&mut self, eqn: &Equation) -> Result<(), TraceError> {
        let read: Vec<(Atom, bool)> = eqn.inputs.iter().map(|atom| self.read(atom)).collect();
        let ins: Vec<Atom> = read.iter().map(|(atom, _)| atom.clone()).collect();
        let batched: Vec<bool> = read.iter().map(|(_, b)| *b).collect();

        match eqn.primitive {
            Primitive::Cond => return self.cond(eqn, &ins, &batched),
            Primitive::While => return self.while_loop(eqn, &ins, &batched),
            Primitive::Scan => return self.scan(eqn, &ins, &batched),
            primitive if primitive.is_stateful() => {
                return Err(TraceError::NoRule {
                    transform: "vmap",
                    primitive,
                });
            }
            _ => {}
        }

        if !batched.iter().any(|&b| b) {
            let out = self.em.emit(eqn.primitive, ins, eqn.params.clone())?;
            self.bind(&eqn.outputs[0], out, false);
            return Ok(());
        }
        let out = self.numeric(eqn, &ins, &batched)?;
        self.bind(&eqn.outputs[0], out, true);
        Ok(())
    }

    fn numeric(&mut self, eqn: &Equation, ins: &[Atom], batched: &[bool]) -> Result<Atom, TraceError> {
        let primitive = eqn.primitive;
        let p = &eqn.params;
        if is_elementwise(primitive) {
            let shape = eqn.outputs[0].aval.shape.dims.clone();
            let target = with_batch(self.size, &shape);
            let mut moved = Vec::with_capacity(ins.len());
            for (atom, &b) in ins.iter().zip(batched) {
                let rank = atom.aval().rank();
                moved.push(match (b, rank) {
                    (true, 1) if !shape.is_empty() => self.em.broadcast_in_dim(atom, &target, &[0])?,
                    (false, 0) => atom.clone(),
                    (false, _) => self.broadcast_batch(atom)?,
                    (true, _) => atom.clone(),
                });
            }
            return self.em.emit(primitive, moved, p.clone());
        }
        match primitive {
            Primitive::BroadcastInDim => {
                let shape = dims_param(primitive, "shape", p)?;
                let bdims = parse_usize_param(primitive, "broadcast_dimensions", p)?;
                self.em.broadcast_in_dim(
                    &ins[0],
                    &with_batch(self.size, &shape),
                    &with_batch(0, &shifted(&bdims)),
                )
            }
            Primitive::Reshape => {
                let sizes = dims_param(primitive, "new_sizes", p)?;
                self.em.reshape(&ins[0], &with_batch(self.size, &sizes))
            }
            Primitive::Transpose => {
                let perm = parse_usize_param(primitive, "permutation", p)?;
                self.em.transpose(&ins[0], &with_batch(0, &shifted(&perm)))
            }
            Primitive::Rev => {
                let dims = parse_usize_param(primitive, "dimensions", p)?;
                self.em.rev(&ins[0], &shifted(&dims))
            }
            Primitive::ReduceSum => {
                let axes = parse_usize_param(primitive, "axes", p)?;
                self.em.reduce_sum(&ins[0], &shifted(&axes))
            }
            Primitive::Slice => {
                let starts = parse_usize_param(primitive, "start_indices", p)?;
                let limits = parse_usize_param(primitive, "limit_indices", p)?;
                let strides = parse_usize_param(primitive, "strides", p)?;
                self.em.slice(
                    &ins[0],
                    &with_batch(0, &starts),
                    &with_batch(self.size as usize, &limits),
                    &with_batch(1, &strides),
                )
            }
            Primitive::Pad if !batched[1] => {
                let low = parse_usize_param(primitive, "padding_low", p)?;
                let high = parse_usize_param(primitive, "padding_high", p)?;
                let interior = parse_usize_param(primitive, "padding_interior", p)?;
                self.em.pad(
                    &ins[0],
                    &ins[1],
                    &with_batch(0, &low),
                    &with_batch(0, &high),
                    &with_batch(0, &interior),
                )
            }
            Primitive::Concatenate => {
                let dimension = parse_usize_param(primitive, "dimension", p)?
                    .first()
                    .copied()
                    .unwrap_or(0);
                let mut moved = Vec::with_capacity(ins.len());
                for (atom, &b) in ins.iter().zip(batched) {
                    moved.push(self.move_to_batched(atom, b)?);
                }
                self.em.concatenate(&moved, dimension + 1)
            }
            Primitive::DynamicSlice if !batched[1..].iter().any(|&b| b) => {
                let sizes = dims_param(primitive, "slice_sizes", p)?;
                let indices = with_batch(Atom::Lit(Literal::I64(0)), &ins[1..]);
                self.em
                    .dynamic_slice(&ins[0], &indices, &with_batch(self.size, &sizes))
            }
            Primitive::DynamicUpdateSlice if !batched[2..].iter().any(|&b| b) => {
                let operand = self.move_to_batched(&ins[0], batched[0])?;
                let update = self.move_to_batched(&ins[1], batched[1])?;
                let indices = with_batch(Atom::Lit(Literal::I64(0)), &ins[2..]);
                self.em.dynamic_update_slice(&operand, &update, &indices)
            }
            _ => self.loop_and_stack(eqn, ins, batched),
        }
    }

    /// Apply the primitive to each example separately and stack the results.
    fn loop_and_stack(&mut self, eqn: &Equation, ins: &[Atom], batched: &[bool]) -> Result<Atom, TraceError> {
        let mut rows = Vec::with_capacity(self.size as usize);
        for b in 0..self.size {
            let mut example = Vec::with_capacity(ins.len());
            for (atom, &is_batched) in ins.iter().zip(batched) {
                example.push(if is_batched {
                    self.index(atom, b)?
                } else {
                    atom.clone()
                });
            }
            let out = self.em.emit(eqn.primitive, example, eqn.params.clone())?;
            let dims = out.aval().shape.dims;
            let bdims: Vec<usize> = (1..=dims.len()).collect();
            rows.push(self.em.broadcast_in_dim(&out, &with_batch(1, &dims), &bdims)?);
        }
        debug!(primitive = %eqn.primitive, examples = self.size, "vmap fell back to a loop");
        if rows.is_empty() {
            let aval = eqn.outputs[0].aval.strong().with_leading(0);
            return self.em.zeros(&aval);
        }
        self.em.concatenate(&rows, 0)
    }

    fn bind_outputs(&mut self, eqn: &Equation, outs: Vec<Var>, batched: &[bool]) {
        for ((old, new), &b) in eqn.outputs.iter().zip(outs).zip(batched) {
            self.bind(old, Atom::from(new), b);
        }
    }

    fn cond(&mut self, eqn: &Equation, ins: &[Atom], batched: &[bool]) -> Result<(), TraceError> {
        let ops_b = &batched[1..];
        let n_out = eqn.outputs.len();
        if !batched[0] {
            let mut union = vec![false; n_out];
            for branch in &eqn.sub_jaxprs {
                let (_, out_b) = batch_jaxpr(branch, self.size, ops_b, &vec![false; n_out])?;
                for (acc, b) in union.iter_mut().zip(out_b) {
                    *acc |= b;
                }
            }
            let branches = eqn
                .sub_jaxprs
                .iter()
                .map(|branch| batch_jaxpr(branch, self.size, ops_b, &union).map(|(j, _)| j))
                .collect::<Result<Vec<_>, _>>()?;
            let out_avals = branches[0]
                .outvars
                .iter()
                .map(|atom| atom.aval().strong())
                .collect();
            let outs = self.em.emit_typed(
                Primitive::Cond,
                ins.to_vec(),
                eqn.params.clone(),
                branches,
                out_avals,
            );
            self.bind_outputs(eqn, outs, &union);
            return Ok(());
        }

        let last = eqn.sub_jaxprs.len().saturating_sub(1) as i64;
        let index = self.em.convert(&ins[0], DType::I32)?;
        let index = self.em.emit(
            Primitive::Clamp,
            vec![Atom::Lit(Literal::I64(0)), index, Atom::Lit(Literal::I64(last))],
            BTreeMap::new(),
        )?;
        let guarded = eqn.sub_jaxprs.len() > 1;
        let mut per_branch = Vec::with_capacity(eqn.sub_jaxprs.len());
        for (k, branch) in eqn.sub_jaxprs.iter().enumerate() {
            let (operands, operands_b) = if guarded {
                self.guard_operands(&index, k, &ins[1..], ops_b)?
            } else {
                (ins[1..].to_vec(), ops_b.to_vec())
            };
            let (batched_branch, _) = batch_jaxpr(branch, self.size, &operands_b, &vec![true; n_out])?;
            per_branch.push(self.em.inline(&batched_branch, &[], &operands)?);
        }
        for (o, old) in eqn.outputs.iter().enumerate() {
            let cases: Vec<Atom> = per_branch.iter().map(|outs| outs[o].clone()).collect();
            let out = if cases.len() == 1 {
                cases[0].clone()
            } else {
                let dims = cases[0].aval().shape.dims;
                let which = if dims.len() == 1 {
                    index.clone()
                } else {
                    self.em.broadcast_in_dim(&index, &dims, &[0])?
                };
                self.em.select_n(&which, &cases)?
            };
            self.bind(old, out, true);
        }
        debug!(branches = eqn.sub_jaxprs.len(), "batched cond index turned into select");
        Ok(())
    }

    /// Operands for branch `k` of a batched-index cond. Floating operands
    /// pass through unchanged where the example selects `k` and through
    /// `stop_gradient` elsewhere, so an unselected branch contributes no
    /// derivative, not even `0 * inf`.
    fn guard_operands(
        &mut self,
        index: &Atom,
        k: usize,
        operands: &[Atom],
        batched: &[bool],
    ) -> Result<(Vec<Atom>, Vec<bool>), TraceError> {
        let hit = self
            .em
            .binary(Primitive::Eq, index, &Atom::Lit(Literal::I64(k as i64)))?;
        let mut out = Vec::with_capacity(operands.len());
        let mut out_b = Vec::with_capacity(operands.len());
        for (x, &b) in operands.iter().zip(batched) {
            if !x.aval().dtype.is_floating() {
                out.push(x.clone());
                out_b.push(b);
                continue;
            }
            let x = self.move_to_batched(x, b)?;
            let dims = x.aval().shape.dims;
            let which = if dims.len() == 1 {
                hit.clone()
            } else {
                self.em.broadcast_in_dim(&hit, &dims, &[0])?
            };
            let frozen = self.em.unary(Primitive::StopGradient, &x)?;
            out.push(self.em.select_n(&which, &[frozen, x])?);
            out_b.push(true);
        }
        Ok((out, out_b))
    }

    fn while_loop(&mut self, eqn: &Equation, ins: &[Atom], batched: &[bool]) -> Result<(), TraceError> {
        let params = WhileParams::from_eqn(eqn)?;
        let (cn, bn) = (params.cond_nconsts, params.body_nconsts);
        let cond = &eqn.sub_jaxprs[0];
        let body = &eqn.sub_jaxprs[1];
        let cconst_b = &batched[..cn];
        let bconst_b = &batched[cn..cn + bn];
        let mut carry_b = batched[cn + bn..].to_vec();
        loop {
            let (_, out_b) = batch_jaxpr(body, self.size, &[bconst_b, carry_b.as_slice()].concat(), &carry_b)?;
            let next: Vec<bool> = carry_b.iter().zip(&out_b).map(|(a, b)| *a || *b).collect();
            if next == carry_b {
                break;
            }
            carry_b = next;
        }
        let (_, pred_b) = batch_jaxpr(cond, self.size, &[cconst_b, carry_b.as_slice()].concat(), &[false])?;

        if !pred_b[0] {
            let (cond_b, _) =
                batch_jaxpr(cond, self.size, &[cconst_b, carry_b.as_slice()].concat(), &[false])?;
            let (body_b, _) =
                batch_jaxpr(body, self.size, &[bconst_b, carry_b.as_slice()].concat(), &carry_b)?;
            let mut inputs = ins[..cn + bn].to_vec();
            for ((atom, &b), &want) in ins[cn + bn..].iter().zip(&batched[cn + bn..]).zip(&carry_b) {
                inputs.push(if want { self.move_to_batched(atom, b)? } else { atom.clone() });
            }
            let out_avals = body_b.outvars.iter().map(|atom| atom.aval().strong()).collect();
            let outs = self.em.emit_typed(
                Primitive::While,
                inputs,
                eqn.params.clone(),
                vec![cond_b, body_b],
                out_avals,
            );
            self.bind_outputs(eqn, outs, &carry_b);
            return Ok(());
        }

        let all = vec![true; carry_b.len()];
        let (cond_b, _) = batch_jaxpr(cond, self.size, &[cconst_b, all.as_slice()].concat(), &[true])?;
        let (body_b, _) = batch_jaxpr(body, self.size, &[bconst_b, all.as_slice()].concat(), &all)?;
        let fresh = |vars: &[Var]| -> Vec<Var> { vars.iter().map(|v| Var::new(v.aval.clone())).collect() };

        // any(pred) over the batch
        let cc = fresh(&cond_b.invars[..cn]);
        let ccarry = fresh(&cond_b.invars[cn..]);
        let mut cem = Emitter::new();
        let args: Vec<Atom> = cc.iter().chain(&ccarry).map(Atom::from).collect();
        let pred = cem.inline(&cond_b, &[], &args)?;
        let count = cem.convert(&pred[0], DType::I32)?;
        let total = cem.reduce_sum(&count, &[0])?;
        let any = cem.binary(Primitive::Gt, &total, &Atom::Lit(Literal::I64(0)))?;
        let new_cond = cem.finish([cc, ccarry].concat(), vec![any]);

        let bc = fresh(&cond_b.invars[..cn]);
        let bb = fresh(&body_b.invars[..bn]);
        let bcarry = fresh(&body_b.invars[bn..]);
        let mut bem = Emitter::new();
        let cond_args: Vec<Atom> = bc.iter().chain(&bcarry).map(Atom::from).collect();
        let pred = bem.inline(&cond_b, &[], &cond_args)?;
        let body_args: Vec<Atom> = bb.iter().chain(&bcarry).map(Atom::from).collect();
        let stepped = bem.inline(&body_b, &[], &body_args)?;
        let mut outs = Vec::with_capacity(stepped.len());
        for (old, new) in bcarry.iter().zip(stepped) {
            let dims = old.aval.shape.dims.clone();
            let which = if dims.len() == 1 {
                pred[0].clone()
            } else {
                bem.broadcast_in_dim(&pred[0], &dims, &[0])?
            };
            let new = bem.convert(&new, old.aval.dtype)?;
            outs.push(bem.select_n(&which, &[Atom::from(old), new])?);
        }
        let new_body = bem.finish([bc, bb, bcarry].concat(), outs);

        let mut inputs = ins[..cn].to_vec();
        inputs.extend_from_slice(&ins[..cn]);
        inputs.extend_from_slice(&ins[cn..cn + bn]);
        for (atom, &b) in ins[cn + bn..].iter().zip(&batched[cn + bn..]) {
            inputs.push(self.move_to_batched(atom, b)?);
        }
        let out_avals = new_body.outvars.iter().map(|atom| atom.aval().strong()).collect();
        let masked = WhileParams {
            cond_nconsts: cn,
            body_nconsts: cn + bn,
        };
        let outs = self.em.emit_typed(
            Primitive::While,
            inputs,
            masked.to_params(),
            vec![new_cond, new_body],
            out_avals,
        );
        debug!("batched while predicate turned into a masked loop");
        self.bind_outputs(eqn, outs, &all);
        Ok(())
    }

    fn scan(&mut self, eqn: &Equation, ins: &[Atom], batched: &[bool]) -> Result<(), TraceError> {
        let params = ScanParams::from_eqn(eqn)?;
        let (nc, ncar) = (params.num_consts, params.num_carry);
        let body = &eqn.sub_jaxprs[0];
        let ny = body.outvars.len() - ncar;
        let const_b = &batched[..nc];
        let xs_b = &batched[nc + ncar..];
        let mut carry_b = batched[nc..nc + ncar].to_vec();
        let mask = |carry_b: &[bool]| [const_b, carry_b, xs_b].concat();
        let force = |carry_b: &[bool]| [carry_b, vec![false; ny].as_slice()].concat();
        let (body_b, out_b) = loop {
            let (jaxpr, out_b) = batch_jaxpr(body, self.size, &mask(&carry_b), &force(&carry_b))?;
            let next: Vec<bool> = carry_b.iter().zip(&out_b).map(|(a, b)| *a || *b).collect();
            if next == carry_b {
                break (jaxpr, out_b);
            }
            carry_b = next;
        };

        let mut inputs = ins[..nc].to_vec();
        for ((atom, &b), &want) in ins[nc..nc + ncar].iter().zip(&batched[nc..nc + ncar]).zip(&carry_b) {
            inputs.push(if want { self.move_to_batched(atom, b)? } else { atom.clone() });
        }
        for (atom, &b) in ins[nc + ncar..].iter().zip(xs_b) {
            inputs.push(if b {
                let rank = atom.aval().rank();
                let mut perm = vec![1, 0];
                perm.extend(2..rank);
                self.em.transpose(atom, &perm)?
            } else {
                atom.clone()
            });
        }
        let length = params.length as u32;
        let out_avals: Vec<AbstractValue> = body_b
            .outvars
            .iter()
            .enumerate()
            .map(|(idx, atom)| {
                let aval = atom.aval().strong();
                if idx < ncar { aval } else { aval.with_leading(length) }
            })
            .collect();
        let outs = self.em.emit_typed(
            Primitive::Scan,
            inputs,
            eqn.params.clone(),
            vec![body_b],
            out_avals,
        );
        for (idx, ((old, new), &b)) in eqn.outputs.iter().zip(outs).zip(&out_b).enumerate() {
            let atom = Atom::from(new);
            let atom = if idx >= ncar && b {
                let rank = atom.aval().rank();
                let mut perm = vec![1, 0];
                perm.extend(2..rank);
                self.em.transpose(&atom, &perm)?
            } else {
                atom
            };
            self.bind(old, atom, b);
        }
        Ok(())
    }
}

fn dims_param(primitive: Primitive, key: &str, p: &BTreeMap<String, String>) -> Result<Vec<u32>, TraceError> {
    Ok(parse_usize_param(primitive, key, p)?
        .into_iter()
        .map(|d| d as u32)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval_jaxpr;
    use crate::params::CheckpointPolicy;
    use crate::test_graphs::{cond_graph, f64s, growth_while, mul_sin_body, scan_graph, trace, vec_f64};
    use crate::trace::Tracer;
    use fj_core::{Shape, Value};
    use proptest::prelude::*;

    /// Evaluate `jaxpr` once per example and stack the outputs.
    fn per_example(jaxpr: &Jaxpr, args: &[Value], batched: &[bool], size: usize) -> Vec<Value> {
        let mut rows: Vec<Vec<Value>> = Vec::new();
        for b in 0..size {
            let example: Vec<Value> = args
                .iter()
                .zip(batched)
                .map(|(v, &is_b)| if is_b { v.slice_axis0(b).expect("slice") } else { v.clone() })
                .collect();
            rows.push(eval_jaxpr(jaxpr, &[], &example).expect("eval"));
        }
        (0..jaxpr.outvars.len())
            .map(|o| {
                let column: Vec<Value> = rows.iter().map(|row| row[o].clone()).collect();
                Value::stack_axis0(&column).expect("stack")
            })
            .collect()
    }

    fn check_batched(jaxpr: &Jaxpr, args: &[Value], batched: &[bool], size: u32) {
        let (batched_jaxpr, out_b) =
            batch_jaxpr(jaxpr, size, batched, &vec![true; jaxpr.outvars.len()]).expect("batch");
        assert!(out_b.iter().all(|&b| b));
        let got = eval_jaxpr(&batched_jaxpr, &[], args).expect("eval batched");
        assert_eq!(got, per_example(jaxpr, args, batched, size as usize));
    }

    fn matrix(rows: u32, cols: u32, values: &[f64]) -> Value {
        Value::from_f64s(DType::F64, Shape::new(vec![rows, cols]), values).expect("matrix")
    }

    #[test]
    fn elementwise_mixes_batched_and_unbatched() {
        let jaxpr = trace(vec![f64s(), vec_f64(2)], |cx, args| {
            let scaled = cx.mul(&args[0], &args[1])?;
            Ok(vec![cx.sin(&scaled)?])
        });
        let xs = Value::vector_f64(&[0.5, 1.0, -2.0]).expect("xs");
        let v = Value::vector_f64(&[3.0, 4.0]).expect("v");
        check_batched(&jaxpr, &[xs, v], &[true, false], 3);
    }

    #[test]
    fn unbatched_inputs_stay_unbatched() {
        let jaxpr = trace(vec![f64s(), f64s()], |cx, args| {
            Ok(vec![cx.neg(&args[1])?, cx.add(&args[0], &args[1])?])
        });
        let (_, out_b) = batch_jaxpr(&jaxpr, 4, &[true, false], &[false, false]).expect("batch");
        assert_eq!(out_b, vec![false, true]);
    }

    #[test]
    fn shape_ops_move_the_batch_axis() {
        let jaxpr = trace(vec![vec_f64(4)], |cx, args| {
            let two_d = cx.reshape(&args[0], &[2, 2])?;
            let swapped = cx.transpose(&two_d, &[1, 0])?;
            let summed = cx.reduce_sum(&swapped, &[0])?;
            let wide = cx.broadcast_in_dim(&summed, &[2, 3], &[0])?;
            let sliced = cx.slice(&wide, &[0, 1], &[2, 3], &[1, 1])?;
            let padded = cx.pad(&sliced, &Tracer::f64(0.5), &[1, 0], &[0, 1], &[0, 0])?;
            let flipped = cx.rev(&padded, &[1])?;
            let joined = cx.concatenate(&[&flipped, &wide], 0)?;
            let picked = cx.dynamic_slice(&joined, &[&Tracer::i64(1), &Tracer::i64(0)], &[2, 2])?;
            Ok(vec![picked])
        });
        let xs = matrix(2, 4, &[1.0, 2.0, 3.0, 4.0, -1.0, 0.5, 2.5, 8.0]);
        check_batched(&jaxpr, &[xs], &[true], 2);
    }

    #[test]
    fn shared_dynamic_index_gains_a_leading_zero() {
        let avals = vec![vec_f64(4), vec_f64(2), AbstractValue::scalar(DType::I32)];
        let jaxpr = trace(avals, |cx, args| {
            let window = cx.dynamic_slice(&args[0], &[&args[2]], &[2])?;
            let bumped = cx.add(&window, &args[1])?;
            Ok(vec![cx.dynamic_update_slice(&args[0], &bumped, &[&args[2]])?])
        });
        let (batched, _) = batch_jaxpr(&jaxpr, 2, &[true, true, false], &[true]).expect("batch");
        assert_eq!(batched.count_primitive(Primitive::DynamicSlice), 1);
        assert_eq!(batched.count_primitive(Primitive::DynamicUpdateSlice), 1);
        let xs = matrix(2, 4, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let updates = matrix(2, 2, &[10.0, 20.0, 30.0, 40.0]);
        check_batched(&jaxpr, &[xs, updates, Value::scalar_i32(1)], &[true, true, false], 2);
    }

    #[test]
    fn batched_dynamic_index_falls_back_to_a_loop() {
        let jaxpr = trace(vec![vec_f64(3), AbstractValue::scalar(DType::I32)], |cx, args| {
            Ok(vec![cx.dynamic_slice(&args[0], &[&args[1]], &[2])?])
        });
        let x = Value::vector_f64(&[1.0, 2.0, 3.0]).expect("x");
        let idx = Value::new(
            DType::I32,
            Shape::vector(3),
            vec![Literal::I64(0), Literal::I64(1), Literal::I64(5)],
        )
        .expect("idx");
        check_batched(&jaxpr, &[x, idx], &[false, true], 3);
    }

    fn square_or_negate() -> Jaxpr {
        let square = trace(vec![f64s()], |cx, args| Ok(vec![cx.mul(&args[0], &args[0])?]));
        let negate = trace(vec![f64s()], |cx, args| Ok(vec![cx.neg(&args[0])?]));
        cond_graph(vec![square, negate])
    }

    #[test]
    fn cond_with_unbatched_index_stays_a_cond() {
        let jaxpr = square_or_negate();
        let (batched, _) = batch_jaxpr(&jaxpr, 3, &[false, true], &[true]).expect("batch");
        assert_eq!(batched.count_primitive(Primitive::Cond), 1);
        let xs = Value::vector_f64(&[1.0, 2.0, 3.0]).expect("xs");
        check_batched(&jaxpr, &[Value::scalar_i32(1), xs], &[false, true], 3);
    }

    #[test]
    fn cond_with_batched_index_selects_per_example() {
        let jaxpr = square_or_negate();
        let (batched, _) = batch_jaxpr(&jaxpr, 3, &[true, true], &[true]).expect("batch");
        assert_eq!(batched.count_primitive(Primitive::Cond), 0);
        // One guard per branch operand plus the output select.
        assert_eq!(batched.count_primitive(Primitive::SelectN), 3);
        assert_eq!(batched.count_primitive(Primitive::StopGradient), 2);
        let index = Value::new(
            DType::I32,
            Shape::vector(3),
            vec![Literal::I64(0), Literal::I64(1), Literal::I64(7)],
        )
        .expect("index");
        let xs = Value::vector_f64(&[1.5, 2.0, 3.0]).expect("xs");
        check_batched(&jaxpr, &[index, xs], &[true, true], 3);
    }

    #[test]
    fn while_with_batched_predicate_runs_masked() {
        let jaxpr = growth_while();
        let limits = Value::vector_f64(&[2.0, 10.0, 0.5]).expect("limits");
        let x = Value::scalar_f64(1.0);
        check_batched(&jaxpr, &[limits, x], &[true, false], 3);
    }

    #[test]
    fn while_with_unbatched_predicate_keeps_structure() {
        let cond = trace(vec![AbstractValue::scalar(DType::I32), f64s()], |cx, args| {
            Ok(vec![cx.lt(&args[0], &Tracer::i64(3))?])
        });
        let body = trace(vec![AbstractValue::scalar(DType::I32), f64s()], |cx, args| {
            let i = cx.add(&args[0], &Tracer::i64(1))?;
            Ok(vec![i, cx.mul(&args[1], &Tracer::f64(2.0))?])
        });
        let jaxpr = crate::test_graphs::while_graph(cond, body, 0, 0);
        let (batched, out_b) = batch_jaxpr(&jaxpr, 2, &[false, true], &[false, false]).expect("batch");
        assert_eq!(out_b, vec![false, true]);
        assert_eq!(batched.count_primitive(Primitive::SelectN), 0);
        let xs = Value::vector_f64(&[1.0, -0.5]).expect("xs");
        check_batched(&jaxpr, &[Value::scalar_i32(0), xs], &[false, true], 2);
    }

    #[test]
    fn scan_over_batched_xs() {
        let jaxpr = scan_graph(mul_sin_body(), 0, 1, 3, false, CheckpointPolicy::SaveEverything);
        let xs = matrix(2, 3, &[0.1, 0.2, 0.3, -1.0, 0.5, 2.0]);
        check_batched(&jaxpr, &[Value::scalar_f64(1.0), xs.clone()], &[false, true], 2);
        let carry = Value::vector_f64(&[1.0, -2.0]).expect("carry");
        check_batched(&jaxpr, &[carry, xs], &[true, true], 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(
            fj_test_utils::property_test_case_count()
        ))]

        #[test]
        fn prop_batched_scan_matches_per_example(
            values in proptest::collection::vec(-2.0_f64..2.0, 8),
            init in proptest::collection::vec(-2.0_f64..2.0, 2),
            reverse in any::<bool>(),
        ) {
            let jaxpr = scan_graph(mul_sin_body(), 0, 1, 4, reverse, CheckpointPolicy::SaveEverything);
            let xs = matrix(2, 4, &values);
            let carry = Value::vector_f64(&init).expect("carry");
            let (batched, _) = batch_jaxpr(&jaxpr, 2, &[true, true], &[true, true]).expect("batch");
            let got = eval_jaxpr(&batched, &[], &[carry.clone(), xs.clone()]).expect("eval");
            prop_assert_eq!(got, per_example(&jaxpr, &[carry, xs], &[true, true], 2));
        }
    }
}
