#![forbid(unsafe_code)]

//! Transposition of linear graphs, the backward half of reverse mode.
//!
//! `transpose_jaxpr(jaxpr, linear)` takes a graph that is linear in the
//! inputs flagged by `linear` and returns a graph from
//! `nonlinear inputs ++ output cotangents` to the cotangents of the linear
//! inputs. Equations that touch no linear value are replayed forward;
//! the rest are walked in reverse, accumulating cotangents.

use fj_core::{AbstractValue, Atom, Equation, Jaxpr, Primitive, Var, VarId};
use fj_lax::parse_usize_param;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::builder::Emitter;
use crate::error::TraceError;
use crate::params::{CheckpointPolicy, ScanParams};

pub fn transpose_jaxpr(jaxpr: &Jaxpr, linear: &[bool]) -> Result<Jaxpr, TraceError> {
    if linear.len() != jaxpr.invars.len() {
        return Err(TraceError::InvalidArgument {
            construct: "transpose",
            detail: format!(
                "graph has {} inputs, linear mask has {} entries",
                jaxpr.invars.len(),
                linear.len()
            ),
        });
    }
    check_reverse_differentiable(jaxpr, linear)?;

    let mut linear_vars: FxHashSet<VarId> = jaxpr
        .invars
        .iter()
        .zip(linear)
        .filter(|(_, lin)| **lin)
        .map(|(var, _)| var.id)
        .collect();
    let mut forward = Emitter::new();
    let mut linear_eqns = Vec::new();
    for eqn in &jaxpr.equations {
        if eqn
            .inputs
            .iter()
            .any(|atom| atom.var_id().is_some_and(|id| linear_vars.contains(&id)))
        {
            linear_vars.extend(eqn.outputs.iter().map(|var| var.id));
            linear_eqns.push(eqn);
        } else {
            forward.push(eqn.clone());
        }
    }

    let ct_invars: Vec<Var> = jaxpr
        .outvars
        .iter()
        .map(|atom| Var::new(atom.aval().strong()))
        .collect();
    let mut tx = Transposer {
        em: forward,
        cts: FxHashMap::default(),
        linear: linear_vars,
    };
    for (out, ct) in jaxpr.outvars.iter().zip(&ct_invars) {
        tx.accumulate(out, Atom::from(ct))?;
    }
    for eqn in linear_eqns.iter().rev() {
        tx.equation(eqn)?;
    }

    let mut outvars = Vec::new();
    for (var, _) in jaxpr.invars.iter().zip(linear).filter(|(_, lin)| **lin) {
        outvars.push(match tx.cts.remove(&var.id) {
            Some(ct) => ct,
            None => tx.em.zeros(&var.aval.strong())?,
        });
    }
    let mut invars: Vec<Var> = jaxpr
        .invars
        .iter()
        .zip(linear)
        .filter(|(_, lin)| !**lin)
        .map(|(var, _)| var.clone())
        .collect();
    invars.extend(ct_invars);
    let equations = tx.em.into_equations();
    debug!(
        linear_equations = linear_eqns.len(),
        equations = equations.len(),
        "transposed graph"
    );
    Ok(Jaxpr::new(invars, jaxpr.constvars.clone(), outvars, equations))
}

/// Reject unbounded loops that carry linear values anywhere in the graph,
/// before any transposition work.
fn check_reverse_differentiable(jaxpr: &Jaxpr, linear: &[bool]) -> Result<(), TraceError> {
    let mut linear_vars: FxHashSet<VarId> = jaxpr
        .invars
        .iter()
        .zip(linear)
        .filter(|(_, lin)| **lin)
        .map(|(var, _)| var.id)
        .collect();
    for eqn in &jaxpr.equations {
        let in_lin: Vec<bool> = eqn
            .inputs
            .iter()
            .map(|atom| atom.var_id().is_some_and(|id| linear_vars.contains(&id)))
            .collect();
        if !in_lin.iter().any(|&lin| lin) {
            continue;
        }
        match eqn.primitive {
            Primitive::While => return Err(TraceError::while_not_reverse_differentiable()),
            Primitive::Cond => {
                for branch in &eqn.sub_jaxprs {
                    check_reverse_differentiable(branch, &in_lin[1..])?;
                }
            }
            Primitive::Scan => {
                let params = ScanParams::from_eqn(eqn)?;
                let body = &eqn.sub_jaxprs[0];
                let (nc, ncar) = (params.num_consts, params.num_carry);
                let mut mask = in_lin.clone();
                loop {
                    let outs = linear_outputs(body, &mask);
                    let mut changed = false;
                    for (flag, &out) in mask[nc..nc + ncar].iter_mut().zip(&outs[..ncar]) {
                        if out && !*flag {
                            *flag = true;
                            changed = true;
                        }
                    }
                    if !changed {
                        break;
                    }
                }
                check_reverse_differentiable(body, &mask)?;
            }
            _ => {}
        }
        linear_vars.extend(eqn.outputs.iter().map(|var| var.id));
    }
    Ok(())
}

/// Which outputs depend on an input flagged in `mask`.
fn linear_outputs(jaxpr: &Jaxpr, mask: &[bool]) -> Vec<bool> {
    let mut linear_vars: FxHashSet<VarId> = jaxpr
        .invars
        .iter()
        .zip(mask)
        .filter(|(_, lin)| **lin)
        .map(|(var, _)| var.id)
        .collect();
    for eqn in &jaxpr.equations {
        if eqn
            .inputs
            .iter()
            .any(|atom| atom.var_id().is_some_and(|id| linear_vars.contains(&id)))
        {
            linear_vars.extend(eqn.outputs.iter().map(|var| var.id));
        }
    }
    jaxpr
        .outvars
        .iter()
        .map(|atom| atom.var_id().is_some_and(|id| linear_vars.contains(&id)))
        .collect()
}

fn not_linear(primitive: Primitive) -> TraceError {
    TraceError::UnsupportedTransform {
        construct: "transpose",
        detail: format!("{primitive} is not linear in more than one operand"),
    }
}

struct Transposer {
    em: Emitter,
    cts: FxHashMap<VarId, Atom>,
    linear: FxHashSet<VarId>,
}

impl Transposer {
    fn is_linear(&self, atom: &Atom) -> bool {
        atom.var_id().is_some_and(|id| self.linear.contains(&id))
    }

    fn accumulate(&mut self, atom: &Atom, ct: Atom) -> Result<(), TraceError> {
        let Atom::Var(var) = atom else { return Ok(()) };
        if !self.linear.contains(&var.id) {
            return Ok(());
        }
        let acc = self.cts.remove(&var.id);
        let sum = self.em.add_any(acc, ct)?;
        self.cts.insert(var.id, sum);
        Ok(())
    }

    fn ct_or_zeros(&mut self, ct: Option<Atom>, aval: &AbstractValue) -> Result<Atom, TraceError> {
        match ct {
            Some(ct) => Ok(ct),
            None => self.em.zeros(&aval.strong()),
        }
    }

    fn equation(&mut self, eqn: &Equation) -> Result<(), TraceError> {
        let cts_out: Vec<Option<Atom>> = eqn
            .outputs
            .iter()
            .map(|var| self.cts.remove(&var.id))
            .collect();
        if cts_out.iter().all(Option::is_none) {
            return Ok(());
        }
        let lin: Vec<bool> = eqn.inputs.iter().map(|atom| self.is_linear(atom)).collect();
        let in_cts = match eqn.primitive {
            Primitive::Cond => self.cond(eqn, &lin, cts_out)?,
            Primitive::Scan => self.scan(eqn, &lin, cts_out)?,
            Primitive::While => return Err(TraceError::while_not_reverse_differentiable()),
            _ => {
                let ct = self.ct_or_zeros(cts_out[0].clone(), &eqn.outputs[0].aval)?;
                self.numeric(eqn, &lin, &ct)?
            }
        };
        for (atom, ct) in eqn.inputs.iter().zip(in_cts) {
            if let Some(ct) = ct {
                self.accumulate(atom, ct)?;
            }
        }
        Ok(())
    }

    fn numeric(&mut self, eqn: &Equation, lin: &[bool], ct: &Atom) -> Result<Vec<Option<Atom>>, TraceError> {
        let ins = eqn.inputs.as_slice();
        let mut out: Vec<Option<Atom>> = vec![None; ins.len()];
        let em = &mut self.em;
        let primitive = eqn.primitive;
        match primitive {
            Primitive::Add | Primitive::Sub => {
                if lin[0] {
                    out[0] = Some(em.unbroadcast(ct, &ins[0].aval())?);
                }
                if lin[1] {
                    let ct = if primitive == Primitive::Sub {
                        em.neg(ct)?
                    } else {
                        ct.clone()
                    };
                    out[1] = Some(em.unbroadcast(&ct, &ins[1].aval())?);
                }
            }
            Primitive::Neg => out[0] = Some(em.neg(ct)?),
            Primitive::Mul => match (lin[0], lin[1]) {
                (true, true) => return Err(not_linear(primitive)),
                (true, false) => {
                    let scaled = em.mul(ct, &ins[1])?;
                    out[0] = Some(em.unbroadcast(&scaled, &ins[0].aval())?);
                }
                (false, true) => {
                    let scaled = em.mul(&ins[0], ct)?;
                    out[1] = Some(em.unbroadcast(&scaled, &ins[1].aval())?);
                }
                (false, false) => {}
            },
            Primitive::Div => {
                if lin[1] {
                    return Err(not_linear(primitive));
                }
                let scaled = em.div(ct, &ins[1])?;
                out[0] = Some(em.unbroadcast(&scaled, &ins[0].aval())?);
            }
            Primitive::StopGradient => {}
            Primitive::ConvertElementType => {
                let aval = ins[0].aval();
                if aval.dtype.is_floating() {
                    out[0] = Some(em.convert(ct, aval.dtype)?);
                }
            }
            Primitive::ReduceSum => {
                let axes = parse_usize_param(primitive, "axes", &eqn.params)?;
                let dims = ins[0].aval().shape.dims;
                let kept: Vec<usize> = (0..dims.len()).filter(|axis| !axes.contains(axis)).collect();
                out[0] = Some(em.broadcast_in_dim(ct, &dims, &kept)?);
            }
            Primitive::BroadcastInDim => {
                let bdims = parse_usize_param(primitive, "broadcast_dimensions", &eqn.params)?;
                let in_dims = ins[0].aval().shape.dims;
                let out_dims = eqn.outputs[0].aval.shape.dims.clone();
                let summed: Vec<usize> = (0..out_dims.len())
                    .filter(|axis| match bdims.iter().position(|b| b == axis) {
                        None => true,
                        Some(pos) => in_dims[pos] == 1 && out_dims[*axis] != 1,
                    })
                    .collect();
                let reduced = if summed.is_empty() {
                    ct.clone()
                } else {
                    em.reduce_sum(ct, &summed)?
                };
                out[0] = Some(em.reshape(&reduced, &in_dims)?);
            }
            Primitive::Reshape => out[0] = Some(em.reshape(ct, &ins[0].aval().shape.dims)?),
            Primitive::Transpose => {
                let perm = parse_usize_param(primitive, "permutation", &eqn.params)?;
                let mut inverse = vec![0; perm.len()];
                for (axis, &p) in perm.iter().enumerate() {
                    inverse[p] = axis;
                }
                out[0] = Some(em.transpose(ct, &inverse)?);
            }
            Primitive::Rev => {
                let dims = parse_usize_param(primitive, "dimensions", &eqn.params)?;
                out[0] = Some(em.rev(ct, &dims)?);
            }
            Primitive::Slice => {
                let starts = parse_usize_param(primitive, "start_indices", &eqn.params)?;
                let strides = parse_usize_param(primitive, "strides", &eqn.params)?;
                let in_dims = ins[0].aval().shape.dims;
                let out_dims = &eqn.outputs[0].aval.shape.dims;
                let interior: Vec<usize> = strides.iter().map(|s| s - 1).collect();
                let high: Vec<usize> = (0..in_dims.len())
                    .map(|axis| {
                        let n = out_dims[axis] as usize;
                        in_dims[axis] as usize
                            - starts[axis]
                            - n
                            - n.saturating_sub(1) * interior[axis]
                    })
                    .collect();
                let zero = em.zeros(&AbstractValue::scalar(ct.aval().dtype))?;
                out[0] = Some(em.pad(ct, &zero, &starts, &high, &interior)?);
            }
            Primitive::Pad => {
                let low = parse_usize_param(primitive, "padding_low", &eqn.params)?;
                let interior = parse_usize_param(primitive, "padding_interior", &eqn.params)?;
                let x_aval = ins[0].aval();
                let ct_x = if x_aval.shape.element_count() == Some(0) {
                    em.zeros(&x_aval.strong())?
                } else {
                    let limits: Vec<usize> = x_aval
                        .shape
                        .dims
                        .iter()
                        .enumerate()
                        .map(|(axis, &n)| low[axis] + (n as usize - 1) * (interior[axis] + 1) + 1)
                        .collect();
                    let strides: Vec<usize> = interior.iter().map(|i| i + 1).collect();
                    em.slice(ct, &low, &limits, &strides)?
                };
                if lin[1] {
                    let all: Vec<usize> = (0..x_aval.rank()).collect();
                    let total = em.reduce_sum(ct, &all)?;
                    let inner = em.reduce_sum(&ct_x, &all)?;
                    out[1] = Some(em.sub(&total, &inner)?);
                }
                if lin[0] {
                    out[0] = Some(ct_x);
                }
            }
            Primitive::Concatenate => {
                let dimension = parse_usize_param(primitive, "dimension", &eqn.params)?
                    .first()
                    .copied()
                    .unwrap_or(0);
                let out_dims = &eqn.outputs[0].aval.shape.dims;
                let mut offset = 0_usize;
                for (idx, atom) in ins.iter().enumerate() {
                    let dims = atom.aval().shape.dims;
                    let width = dims[dimension] as usize;
                    if lin[idx] {
                        let starts: Vec<usize> = (0..dims.len())
                            .map(|axis| if axis == dimension { offset } else { 0 })
                            .collect();
                        let limits: Vec<usize> = (0..dims.len())
                            .map(|axis| {
                                if axis == dimension {
                                    offset + width
                                } else {
                                    out_dims[axis] as usize
                                }
                            })
                            .collect();
                        out[idx] = Some(em.slice(ct, &starts, &limits, &vec![1; dims.len()])?);
                    }
                    offset += width;
                }
            }
            Primitive::SelectN => {
                if lin[0] {
                    return Err(not_linear(primitive));
                }
                let out_aval = eqn.outputs[0].aval.strong();
                let zeros = em.zeros(&out_aval)?;
                for idx in 1..ins.len() {
                    if !lin[idx] {
                        continue;
                    }
                    let cases: Vec<Atom> = (1..ins.len())
                        .map(|case| if case == idx { ct.clone() } else { zeros.clone() })
                        .collect();
                    let picked = em.select_n(&ins[0], &cases)?;
                    out[idx] = Some(em.unbroadcast(&picked, &ins[idx].aval())?);
                }
            }
            Primitive::DynamicSlice => {
                if lin[1..].iter().any(|&l| l) {
                    return Err(not_linear(primitive));
                }
                let zeros = em.zeros(&ins[0].aval().strong())?;
                out[0] = Some(em.dynamic_update_slice(&zeros, ct, &ins[1..])?);
            }
            Primitive::DynamicUpdateSlice => {
                if lin[2..].iter().any(|&l| l) {
                    return Err(not_linear(primitive));
                }
                let update_aval = ins[1].aval().strong();
                if lin[0] {
                    let zeros = em.zeros(&update_aval)?;
                    out[0] = Some(em.dynamic_update_slice(ct, &zeros, &ins[2..])?);
                }
                if lin[1] {
                    let sliced = em.dynamic_slice(ct, &ins[2..], &update_aval.shape.dims)?;
                    out[1] = Some(em.convert(&sliced, update_aval.dtype)?);
                }
            }
            primitive => {
                return Err(TraceError::NoRule {
                    transform: "transpose",
                    primitive,
                });
            }
        }
        Ok(out)
    }

    /// Each branch is transposed against the same linear operands and the
    /// cotangents are selected by the original index.
    fn cond(&mut self, eqn: &Equation, lin: &[bool], cts_out: Vec<Option<Atom>>) -> Result<Vec<Option<Atom>>, TraceError> {
        if lin[0] {
            return Err(not_linear(Primitive::Cond));
        }
        let ops_lin = &lin[1..];
        let branches = eqn
            .sub_jaxprs
            .iter()
            .map(|branch| transpose_jaxpr(branch, ops_lin))
            .collect::<Result<Vec<_>, _>>()?;
        let mut inputs = vec![eqn.inputs[0].clone()];
        inputs.extend(
            eqn.inputs[1..]
                .iter()
                .zip(ops_lin)
                .filter(|(_, l)| !**l)
                .map(|(atom, _)| atom.clone()),
        );
        for (ct, var) in cts_out.into_iter().zip(&eqn.outputs) {
            inputs.push(self.ct_or_zeros(ct, &var.aval)?);
        }
        let out_avals: Vec<AbstractValue> = eqn.inputs[1..]
            .iter()
            .zip(ops_lin)
            .filter(|(_, l)| **l)
            .map(|(atom, _)| atom.aval().strong())
            .collect();
        let outs = self
            .em
            .emit_typed(Primitive::Cond, inputs, eqn.params.clone(), branches, out_avals);
        let mut outs = outs.into_iter();
        let mut result = vec![None];
        for &l in ops_lin {
            result.push(if l { outs.next().map(Atom::from) } else { None });
        }
        Ok(result)
    }

    /// A scan linear in its carries runs backwards: nonlinear consts stay
    /// consts, cotangents of linear consts accumulate in extra carries,
    /// output cotangents of `ys` are scanned over alongside nonlinear `xs`.
    fn scan(&mut self, eqn: &Equation, lin: &[bool], cts_out: Vec<Option<Atom>>) -> Result<Vec<Option<Atom>>, TraceError> {
        let params = ScanParams::from_eqn(eqn)?;
        let (nc, ncar) = (params.num_consts, params.num_carry);
        let body = &eqn.sub_jaxprs[0];
        let nx = eqn.inputs.len() - nc - ncar;
        let ny = body.outvars.len() - ncar;
        let const_lin = &lin[..nc];
        let xs_lin = &lin[nc + ncar..];

        let mut body_lin = const_lin.to_vec();
        body_lin.extend(std::iter::repeat_n(true, ncar));
        body_lin.extend_from_slice(xs_lin);
        let body_t = transpose_jaxpr(body, &body_lin)?;

        let fresh = |var: &Var| Var::new(var.aval.strong());
        let res_c: Vec<Var> = body.invars[..nc]
            .iter()
            .zip(const_lin)
            .filter(|(_, l)| !**l)
            .map(|(var, _)| fresh(var))
            .collect();
        let acc: Vec<Var> = body.invars[..nc]
            .iter()
            .zip(const_lin)
            .filter(|(_, l)| **l)
            .map(|(var, _)| fresh(var))
            .collect();
        let ct_carry: Vec<Var> = body.invars[nc..nc + ncar].iter().map(fresh).collect();
        let ct_y: Vec<Var> = body.outvars[ncar..]
            .iter()
            .map(|atom| Var::new(atom.aval().strong()))
            .collect();
        let res_x: Vec<Var> = body.invars[nc + ncar..]
            .iter()
            .zip(xs_lin)
            .filter(|(_, l)| !**l)
            .map(|(var, _)| fresh(var))
            .collect();

        let mut bem = Emitter::new();
        let args: Vec<Atom> = res_c
            .iter()
            .chain(&res_x)
            .chain(&ct_carry)
            .chain(&ct_y)
            .map(Atom::from)
            .collect();
        let outs = bem.inline(&body_t, &[], &args)?;
        let (ct_consts, rest) = outs.split_at(acc.len());
        let mut body_outs = Vec::with_capacity(outs.len());
        for (acc_var, ct) in acc.iter().zip(ct_consts) {
            body_outs.push(bem.add(&Atom::from(acc_var), ct)?);
        }
        body_outs.extend_from_slice(rest);
        let n_acc = acc.len();
        let n_res_c = res_c.len();
        let n_res_x = res_x.len();
        let mut body_invars = res_c;
        body_invars.extend(acc.iter().cloned());
        body_invars.extend(ct_carry.iter().cloned());
        body_invars.extend(ct_y.iter().cloned());
        body_invars.extend(res_x);
        let new_body = bem.finish(body_invars, body_outs);

        let mut inputs: Vec<Atom> = eqn.inputs[..nc]
            .iter()
            .zip(const_lin)
            .filter(|(_, l)| !**l)
            .map(|(atom, _)| atom.clone())
            .collect();
        for var in &acc {
            inputs.push(self.em.zeros(&var.aval)?);
        }
        let mut cts_out = cts_out.into_iter();
        for var in &ct_carry {
            let ct = cts_out.next().flatten();
            inputs.push(self.ct_or_zeros(ct, &var.aval)?);
        }
        for var in &ct_y {
            let ct = cts_out.next().flatten();
            inputs.push(self.ct_or_zeros(ct, &var.aval.with_leading(params.length as u32))?);
        }
        inputs.extend(
            eqn.inputs[nc + ncar..]
                .iter()
                .zip(xs_lin)
                .filter(|(_, l)| !**l)
                .map(|(atom, _)| atom.clone()),
        );

        let mut out_avals: Vec<AbstractValue> = acc.iter().map(|var| var.aval.clone()).collect();
        out_avals.extend(ct_carry.iter().map(|var| var.aval.clone()));
        out_avals.extend(
            eqn.inputs[nc + ncar..]
                .iter()
                .zip(xs_lin)
                .filter(|(_, l)| **l)
                .map(|(atom, _)| atom.aval().strong()),
        );
        let mut linear = vec![false; n_res_c];
        linear.extend(std::iter::repeat_n(true, n_acc + ncar + ny));
        linear.extend(std::iter::repeat_n(false, n_res_x));
        let t_params = ScanParams {
            num_consts: n_res_c,
            num_carry: n_acc + ncar,
            length: params.length,
            reverse: !params.reverse,
            unroll: params.unroll,
            linear,
            checkpoint: CheckpointPolicy::SaveEverything,
        };
        let outs = self.em.emit_typed(
            Primitive::Scan,
            inputs,
            t_params.to_params(),
            vec![new_body],
            out_avals,
        );

        let mut outs = outs.into_iter().map(Atom::from);
        let mut result: Vec<Option<Atom>> = Vec::with_capacity(eqn.inputs.len());
        for &l in const_lin {
            result.push(if l { outs.next() } else { None });
        }
        for idx in 0..ncar {
            let ct = outs.next();
            result.push(if lin[nc + idx] { ct } else { None });
        }
        for &l in xs_lin {
            result.push(if l { outs.next() } else { None });
        }
        debug_assert_eq!(result.len(), nc + ncar + nx);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval_jaxpr;
    use crate::test_graphs::{cond_graph, f64s, scan_graph, trace, vec_f64, while_graph};
    use crate::trace::Tracer;
    use fj_core::{DType, Shape, Value};
    use fj_test_utils::{Tolerance, assert_allclose};
    use proptest::prelude::*;

    fn flat(values: &[Value]) -> Vec<f64> {
        values
            .iter()
            .flat_map(|v| v.to_f64_vec().expect("float"))
            .collect()
    }

    fn dot(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    /// `<ct, f(t)> == <f^T(ct), t>` for a graph whose leading `nonlinear`
    /// inputs are fixed and remaining inputs are linear.
    fn check_dot_product(jaxpr: &Jaxpr, nonlinear: &[Value], t: &[Value], ct: &[Value]) {
        let mut mask = vec![false; nonlinear.len()];
        mask.extend(std::iter::repeat_n(true, t.len()));
        let transposed = transpose_jaxpr(jaxpr, &mask).expect("transpose");
        let mut args = nonlinear.to_vec();
        args.extend_from_slice(t);
        let forward = eval_jaxpr(jaxpr, &[], &args).expect("forward");
        let mut t_args = nonlinear.to_vec();
        t_args.extend_from_slice(ct);
        let backward = eval_jaxpr(&transposed, &[], &t_args).expect("backward");
        let lhs = dot(&flat(ct), &flat(&forward));
        let rhs = dot(&flat(&backward), &flat(t));
        assert_allclose(&[lhs], &[rhs], Tolerance::F32);
    }

    #[test]
    fn transpose_of_scaled_sum() {
        // f(t) = 3t + t
        let jaxpr = trace(vec![f64s()], |cx, args| {
            let scaled = cx.mul(&Tracer::f64(3.0), &args[0])?;
            Ok(vec![cx.add(&scaled, &args[0])?])
        });
        let transposed = transpose_jaxpr(&jaxpr, &[true]).expect("transpose");
        let out = eval_jaxpr(&transposed, &[], &[Value::scalar_f64(1.0)]).expect("eval");
        assert_eq!(out[0].as_f64_scalar(), Some(4.0));
    }

    #[test]
    fn residual_operand_scales_cotangent() {
        let jaxpr = trace(vec![f64s(), f64s()], |cx, args| {
            let s = cx.sin(&args[0])?;
            Ok(vec![cx.mul(&s, &args[1])?])
        });
        let transposed = transpose_jaxpr(&jaxpr, &[false, true]).expect("transpose");
        assert_eq!(transposed.invars.len(), 2);
        let out = eval_jaxpr(&transposed, &[], &[Value::scalar_f64(0.5), Value::scalar_f64(2.0)])
            .expect("eval");
        assert_allclose(&[out[0].as_f64_scalar().expect("f64")], &[2.0 * 0.5_f64.sin()], Tolerance::EXACT);
    }

    #[test]
    fn unused_linear_input_gets_zero_cotangent() {
        let jaxpr = trace(vec![f64s(), f64s()], |cx, args| Ok(vec![cx.neg(&args[0])?]));
        let transposed = transpose_jaxpr(&jaxpr, &[true, true]).expect("transpose");
        let out = eval_jaxpr(&transposed, &[], &[Value::scalar_f64(1.5)]).expect("eval");
        assert_eq!(out[0].as_f64_scalar(), Some(-1.5));
        assert_eq!(out[1].as_f64_scalar(), Some(0.0));
    }

    #[test]
    fn product_of_two_linear_values_is_rejected() {
        let jaxpr = trace(vec![f64s(), f64s()], |cx, args| Ok(vec![cx.mul(&args[0], &args[1])?]));
        let err = transpose_jaxpr(&jaxpr, &[true, true]).expect_err("nonlinear");
        assert!(matches!(err, TraceError::UnsupportedTransform { construct: "transpose", .. }));
    }

    #[test]
    fn nonlinear_primitive_has_no_rule() {
        let jaxpr = trace(vec![f64s()], |cx, args| Ok(vec![cx.sin(&args[0])?]));
        let err = transpose_jaxpr(&jaxpr, &[true]).expect_err("sin");
        assert!(matches!(err, TraceError::NoRule { primitive: Primitive::Sin, .. }));
    }

    #[test]
    fn while_with_linear_carry_is_rejected_eagerly() {
        let cond = trace(vec![f64s()], |cx, args| Ok(vec![cx.lt(&args[0], &Tracer::f64(3.0))?]));
        let body = trace(vec![f64s()], |cx, args| Ok(vec![cx.add(&args[0], &Tracer::f64(1.0))?]));
        let looped = while_graph(cond, body, 0, 0);
        let err = transpose_jaxpr(&looped, &[true]).expect_err("while");
        assert_eq!(err, TraceError::while_not_reverse_differentiable());

        let nested = cond_graph(vec![looped.clone(), looped]);
        let err = transpose_jaxpr(&nested, &[false, true]).expect_err("nested while");
        assert_eq!(err, TraceError::while_not_reverse_differentiable());
    }

    #[test]
    fn while_on_nonlinear_values_is_replayed() {
        let cond = trace(vec![f64s()], |cx, args| Ok(vec![cx.lt(&args[0], &Tracer::f64(3.0))?]));
        let body = trace(vec![f64s()], |cx, args| Ok(vec![cx.add(&args[0], &Tracer::f64(1.0))?]));
        let looped = while_graph(cond, body, 0, 0);
        let (x, t) = (Var::new(f64s()), Var::new(f64s()));
        let mut em = Emitter::new();
        let r = em.inline(&looped, &[], &[Atom::from(&x)]).expect("inline");
        let y = em.mul(&r[0], &Atom::from(&t)).expect("mul");
        let outer = em.finish(vec![x, t], vec![y]);
        let transposed = transpose_jaxpr(&outer, &[false, true]).expect("transpose");
        let out = eval_jaxpr(&transposed, &[], &[Value::scalar_f64(0.5), Value::scalar_f64(1.0)])
            .expect("eval");
        assert_eq!(out[0].as_f64_scalar(), Some(3.5));
    }

    #[test]
    fn shape_ops_satisfy_dot_product_identity() {
        let jaxpr = trace(vec![vec_f64(4)], |cx, args| {
            let sliced = cx.slice(&args[0], &[1], &[4], &[2])?;
            let padded = cx.pad(&sliced, &Tracer::f64(0.0), &[1], &[2], &[1])?;
            let rev = cx.rev(&padded, &[0])?;
            let both = cx.concatenate(&[&rev, &args[0]], 0)?;
            let two_d = cx.reshape(&both, &[2, 5])?;
            let swapped = cx.transpose(&two_d, &[1, 0])?;
            let summed = cx.reduce_sum(&swapped, &[1])?;
            let wide = cx.broadcast_in_dim(&summed, &[5, 3], &[0])?;
            let dynamic = cx.dynamic_slice(&wide, &[&Tracer::i64(1), &Tracer::i64(0)], &[3, 2])?;
            let updated = cx.dynamic_update_slice(&wide, &dynamic, &[&Tracer::i64(2), &Tracer::i64(1)])?;
            Ok(vec![updated])
        });
        let t = Value::vector_f64(&[0.5, -1.0, 2.0, 3.5]).expect("t");
        let ct_vals: Vec<f64> = (0..15).map(|i| f64::from(i) * 0.25 - 1.0).collect();
        let ct = Value::from_f64s(DType::F64, Shape::new(vec![5, 3]), &ct_vals).expect("ct");
        check_dot_product(&jaxpr, &[], &[t], &[ct]);
    }

    #[test]
    fn cond_transposes_each_branch() {
        let double = trace(vec![f64s(), f64s()], |cx, args| {
            Ok(vec![cx.mul(&args[1], &Tracer::f64(2.0))?])
        });
        let scaled = trace(vec![f64s(), f64s()], |cx, args| Ok(vec![cx.mul(&args[0], &args[1])?]));
        let jaxpr = cond_graph(vec![double, scaled]);
        let transposed = transpose_jaxpr(&jaxpr, &[false, false, true]).expect("transpose");
        for (index, expected) in [(0, 2.0), (1, 3.0)] {
            let out = eval_jaxpr(
                &transposed,
                &[],
                &[Value::scalar_i32(index), Value::scalar_f64(3.0), Value::scalar_f64(1.0)],
            )
            .expect("eval");
            assert_eq!(out[0].as_f64_scalar(), Some(expected));
        }
    }

    /// Body over consts `[w, t_w]`, carry `[c]`, xs `[x, t_x]`, with
    /// `w` and `x` nonlinear: `c' = c * w + t_x * x + t_w`, `y = c`.
    fn linear_scan(reverse: bool) -> Jaxpr {
        let body = trace(vec![f64s(), f64s(), f64s(), f64s(), f64s()], |cx, args| {
            let (w, tw, c, x, tx) = (&args[0], &args[1], &args[2], &args[3], &args[4]);
            let cw = cx.mul(c, w)?;
            let txx = cx.mul(tx, x)?;
            let sum = cx.add(&cw, &txx)?;
            Ok(vec![cx.add(&sum, tw)?, c.clone()])
        });
        let jaxpr = scan_graph(body, 2, 1, 4, reverse, CheckpointPolicy::SaveEverything);
        // Reorder outer inputs so nonlinear operands come first.
        let inv = &jaxpr.invars;
        let invars = vec![
            inv[0].clone(),
            inv[3].clone(),
            inv[1].clone(),
            inv[2].clone(),
            inv[4].clone(),
        ];
        Jaxpr::new(invars, Vec::new(), jaxpr.outvars, jaxpr.equations)
    }

    #[test]
    fn scan_transpose_runs_in_reverse() {
        let jaxpr = linear_scan(false);
        let transposed =
            transpose_jaxpr(&jaxpr, &[false, false, true, true, true]).expect("transpose");
        let scan = transposed
            .equations
            .iter()
            .find(|e| e.primitive == Primitive::Scan)
            .expect("scan");
        let params = ScanParams::from_eqn(scan).expect("params");
        assert!(params.reverse);
        assert_eq!(params.num_consts, 1);
        assert_eq!(params.num_carry, 2, "t_w accumulator and carry cotangent");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(
            fj_test_utils::property_test_case_count()
        ))]

        #[test]
        fn prop_scan_transpose_dot_product(
            w in -1.5_f64..1.5,
            xs in proptest::collection::vec(-2.0_f64..2.0, 4),
            t in proptest::collection::vec(-2.0_f64..2.0, 6),
            ct in proptest::collection::vec(-2.0_f64..2.0, 5),
            reverse in any::<bool>(),
        ) {
            let jaxpr = linear_scan(reverse);
            let nonlinear = [
                Value::scalar_f64(w),
                Value::from_f64s(DType::F64, Shape::vector(4), &xs).expect("xs"),
            ];
            let t_vals = [
                Value::scalar_f64(t[0]),
                Value::scalar_f64(t[1]),
                Value::from_f64s(DType::F64, Shape::vector(4), &t[2..]).expect("tx"),
            ];
            let ct_vals = [
                Value::scalar_f64(ct[0]),
                Value::from_f64s(DType::F64, Shape::vector(4), &ct[1..]).expect("ct ys"),
            ];
            check_dot_product(&jaxpr, &nonlinear, &t_vals, &ct_vals);
        }
    }
}
