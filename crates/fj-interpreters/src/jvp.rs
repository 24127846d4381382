#![forbid(unsafe_code)]

//! Forward-mode differentiation of a jaxpr.
//!
//! `jvp_jaxpr(jaxpr, nonzeros, instantiate)` produces a graph taking the
//! primal inputs followed by one tangent per input flagged in `nonzeros`,
//! and returning the primal outputs followed by one tangent per output
//! reported nonzero. Zero tangents stay symbolic; `instantiate` forces an
//! output tangent to exist, materialized as zeros when needed. Only
//! floating-point values carry tangents.

use fj_core::{AbstractValue, Atom, Equation, Jaxpr, Literal, Primitive, Var, VarId};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::builder::Emitter;
use crate::error::TraceError;
use crate::params::{ScanParams, WhileParams};

pub fn jvp_jaxpr(
    jaxpr: &Jaxpr,
    nonzeros: &[bool],
    instantiate: &[bool],
) -> Result<(Jaxpr, Vec<bool>), TraceError> {
    if nonzeros.len() != jaxpr.invars.len() || instantiate.len() != jaxpr.outvars.len() {
        return Err(TraceError::InvalidArgument {
            construct: "jvp",
            detail: format!(
                "graph has {} inputs and {} outputs, masks have {} and {} entries",
                jaxpr.invars.len(),
                jaxpr.outvars.len(),
                nonzeros.len(),
                instantiate.len()
            ),
        });
    }

    let mut cx = JvpCtx::default();
    let constvars: Vec<Var> = jaxpr
        .constvars
        .iter()
        .map(|var| cx.rename(var))
        .collect();
    let mut invars: Vec<Var> = jaxpr.invars.iter().map(|var| cx.rename(var)).collect();
    for (var, &nonzero) in jaxpr.invars.iter().zip(nonzeros) {
        if nonzero {
            let tangent = if var.is_ref {
                Var::new_ref(var.aval.strong())
            } else {
                Var::new(var.aval.strong())
            };
            cx.set_tangent(var, Some(Atom::Var(tangent.clone())));
            invars.push(tangent);
        }
    }

    for eqn in &jaxpr.equations {
        cx.equation(eqn)?;
    }

    let mut outvars: Vec<Atom> = jaxpr.outvars.iter().map(|atom| cx.primal(atom)).collect();
    let mut out_nonzeros = Vec::with_capacity(jaxpr.outvars.len());
    for (atom, &force) in jaxpr.outvars.iter().zip(instantiate) {
        match cx.tangent(atom) {
            Some(tangent) => {
                outvars.push(tangent);
                out_nonzeros.push(true);
            }
            None if force => {
                let zeros = cx.em.zeros(&atom.aval().strong())?;
                outvars.push(zeros);
                out_nonzeros.push(true);
            }
            None => out_nonzeros.push(false),
        }
    }

    let out = Jaxpr::new(invars, constvars, outvars, cx.em.into_equations());
    debug!(
        equations = out.equations.len(),
        tangents_in = nonzeros.iter().filter(|&&nz| nz).count(),
        "jvp graph built"
    );
    Ok((out, out_nonzeros))
}

#[derive(Default)]
struct JvpCtx {
    em: Emitter,
    primal: FxHashMap<VarId, Atom>,
    tangent: FxHashMap<VarId, Atom>,
}

impl JvpCtx {
    fn rename(&mut self, var: &Var) -> Var {
        let fresh = var.fresh_like();
        self.primal.insert(var.id, Atom::Var(fresh.clone()));
        fresh
    }

    fn primal(&self, atom: &Atom) -> Atom {
        match atom {
            Atom::Lit(_) => atom.clone(),
            Atom::Var(var) => self
                .primal
                .get(&var.id)
                .cloned()
                .unwrap_or_else(|| atom.clone()),
        }
    }

    fn tangent(&self, atom: &Atom) -> Option<Atom> {
        atom.var_id().and_then(|id| self.tangent.get(&id).cloned())
    }

    fn set_tangent(&mut self, var: &Var, tangent: Option<Atom>) {
        if let Some(tangent) = tangent
            && var.aval.dtype.is_floating()
        {
            self.tangent.insert(var.id, tangent);
        }
    }

    /// Tangent of `atom`, or zeros of its type.
    fn tangent_or_zeros(&mut self, atom: &Atom) -> Result<Atom, TraceError> {
        match self.tangent(atom) {
            Some(tangent) => Ok(tangent),
            None => self.em.zeros(&atom.aval().strong()),
        }
    }

    fn equation(&mut self, eqn: &Equation) -> Result<(), TraceError> {
        match eqn.primitive {
            Primitive::Cond => self.cond(eqn),
            Primitive::While => self.while_loop(eqn),
            Primitive::Scan => self.scan(eqn),
            primitive if primitive.is_stateful() => self.stateful(eqn),
            _ => self.numeric(eqn),
        }
    }

    fn numeric(&mut self, eqn: &Equation) -> Result<(), TraceError> {
        let [out_var] = eqn.outputs.as_slice() else {
            return Err(TraceError::malformed(
                eqn.primitive,
                format!("expected one output, got {}", eqn.outputs.len()),
            ));
        };
        let ins: Vec<Atom> = eqn.inputs.iter().map(|atom| self.primal(atom)).collect();
        let ts: Vec<Option<Atom>> = eqn.inputs.iter().map(|atom| self.tangent(atom)).collect();
        let out = self.em.emit(eqn.primitive, ins.clone(), eqn.params.clone())?;
        self.primal.insert(out_var.id, out.clone());

        let out_aval = out.aval().strong();
        if ts.iter().all(Option::is_none) || !out_aval.dtype.is_floating() {
            return Ok(());
        }
        if let Some(tangent) = self.tangent_rule(eqn, &ins, &ts, &out)? {
            let fitted = self.em.broadcast_to(&tangent, &out_aval)?;
            self.set_tangent(out_var, Some(fitted));
        }
        Ok(())
    }

    fn tangent_rule(
        &mut self,
        eqn: &Equation,
        ins: &[Atom],
        ts: &[Option<Atom>],
        out: &Atom,
    ) -> Result<Option<Atom>, TraceError> {
        let out_aval = out.aval().strong();
        let em = &mut self.em;
        let tangent = match eqn.primitive {
            Primitive::Add => match (&ts[0], &ts[1]) {
                (Some(ta), Some(tb)) => Some(em.add(ta, tb)?),
                (Some(ta), None) => Some(ta.clone()),
                (None, Some(tb)) => Some(tb.clone()),
                (None, None) => None,
            },
            Primitive::Sub => match (&ts[0], &ts[1]) {
                (Some(ta), Some(tb)) => Some(em.sub(ta, tb)?),
                (Some(ta), None) => Some(ta.clone()),
                (None, Some(tb)) => Some(em.neg(tb)?),
                (None, None) => None,
            },
            Primitive::Mul => {
                let mut acc = None;
                if let Some(ta) = &ts[0] {
                    let term = em.mul(ta, &ins[1])?;
                    acc = Some(em.add_any(acc, term)?);
                }
                if let Some(tb) = &ts[1] {
                    let term = em.mul(&ins[0], tb)?;
                    acc = Some(em.add_any(acc, term)?);
                }
                acc
            }
            Primitive::Div => {
                let mut acc = None;
                if let Some(ta) = &ts[0] {
                    let term = em.div(ta, &ins[1])?;
                    acc = Some(em.add_any(acc, term)?);
                }
                if let Some(tb) = &ts[1] {
                    let scaled = em.mul(out, tb)?;
                    let quotient = em.div(&scaled, &ins[1])?;
                    let term = em.neg(&quotient)?;
                    acc = Some(em.add_any(acc, term)?);
                }
                acc
            }
            Primitive::Neg => match &ts[0] {
                Some(t) => Some(em.neg(t)?),
                None => None,
            },
            Primitive::Sign => None,
            Primitive::Max | Primitive::Min => {
                let cmp = if eqn.primitive == Primitive::Max {
                    Primitive::Ge
                } else {
                    Primitive::Le
                };
                let which = em.binary(cmp, &ins[0], &ins[1])?;
                let which = em.broadcast_to(&which, &out_aval.with_dtype(fj_core::DType::Bool))?;
                let ta = match &ts[0] {
                    Some(t) => em.broadcast_to(t, &out_aval)?,
                    None => em.zeros(&out_aval)?,
                };
                let tb = match &ts[1] {
                    Some(t) => em.broadcast_to(t, &out_aval)?,
                    None => em.zeros(&out_aval)?,
                };
                Some(em.select_n(&which, &[tb, ta])?)
            }
            Primitive::Exp => match &ts[0] {
                Some(t) => Some(em.mul(t, out)?),
                None => None,
            },
            Primitive::Log => match &ts[0] {
                Some(t) => Some(em.div(t, &ins[0])?),
                None => None,
            },
            Primitive::Sin | Primitive::Cos | Primitive::Sinh | Primitive::Cosh => {
                let Some(t) = &ts[0] else { return Ok(None) };
                let slope = match eqn.primitive {
                    Primitive::Sin => em.unary(Primitive::Cos, &ins[0])?,
                    Primitive::Cos => {
                        let s = em.unary(Primitive::Sin, &ins[0])?;
                        em.neg(&s)?
                    }
                    Primitive::Sinh => em.unary(Primitive::Cosh, &ins[0])?,
                    _ => em.unary(Primitive::Sinh, &ins[0])?,
                };
                Some(em.mul(t, &slope)?)
            }
            Primitive::Tanh => {
                let Some(t) = &ts[0] else { return Ok(None) };
                let square = em.mul(out, out)?;
                let slope = em.sub(&Atom::Lit(Literal::from_f64(1.0)), &square)?;
                Some(em.mul(t, &slope)?)
            }
            Primitive::SelectN => {
                if ts[1..].iter().all(Option::is_none) {
                    return Ok(None);
                }
                let mut cases = Vec::with_capacity(ins.len() - 1);
                for t in &ts[1..] {
                    cases.push(match t {
                        Some(t) => em.broadcast_to(t, &out_aval)?,
                        None => em.zeros(&out_aval)?,
                    });
                }
                Some(em.select_n(&ins[0], &cases)?)
            }
            Primitive::Clamp => {
                let mut full = Vec::with_capacity(3);
                for t in ts {
                    full.push(match t {
                        Some(t) => em.broadcast_to(t, &out_aval)?,
                        None => em.zeros(&out_aval)?,
                    });
                }
                let below = em.binary(Primitive::Lt, &ins[1], &ins[0])?;
                let above = em.binary(Primitive::Gt, &ins[1], &ins[2])?;
                let mask_aval = out_aval.with_dtype(fj_core::DType::Bool);
                let below = em.broadcast_to(&below, &mask_aval)?;
                let above = em.broadcast_to(&above, &mask_aval)?;
                let upper = em.select_n(&above, &[full[1].clone(), full[2].clone()])?;
                Some(em.select_n(&below, &[upper, full[0].clone()])?)
            }
            Primitive::ConvertElementType => match &ts[0] {
                Some(t) if ins[0].aval().dtype.is_floating() => Some(em.convert(t, out_aval.dtype)?),
                _ => None,
            },
            Primitive::BroadcastInDim
            | Primitive::Reshape
            | Primitive::Transpose
            | Primitive::Rev
            | Primitive::Slice
            | Primitive::ReduceSum => match &ts[0] {
                Some(t) => Some(em.emit(eqn.primitive, vec![t.clone()], eqn.params.clone())?),
                None => None,
            },
            Primitive::DynamicSlice => match &ts[0] {
                Some(t) => {
                    let mut inputs = vec![t.clone()];
                    inputs.extend_from_slice(&ins[1..]);
                    Some(em.emit(eqn.primitive, inputs, eqn.params.clone())?)
                }
                None => None,
            },
            Primitive::Pad => {
                let x_aval = ins[0].aval().strong();
                let tx = match &ts[0] {
                    Some(t) => t.clone(),
                    None => em.zeros(&x_aval)?,
                };
                let pad_aval = AbstractValue::scalar(x_aval.dtype);
                let tv = match &ts[1] {
                    Some(t) => em.convert(t, x_aval.dtype)?,
                    None => em.zeros(&pad_aval)?,
                };
                Some(em.emit(Primitive::Pad, vec![tx, tv], eqn.params.clone())?)
            }
            Primitive::Concatenate => {
                let mut inputs = Vec::with_capacity(ins.len());
                for (atom, t) in ins.iter().zip(ts) {
                    inputs.push(match t {
                        Some(t) => t.clone(),
                        None => em.zeros(&atom.aval().strong())?,
                    });
                }
                Some(em.emit(Primitive::Concatenate, inputs, eqn.params.clone())?)
            }
            Primitive::DynamicUpdateSlice => {
                let tx = match &ts[0] {
                    Some(t) => t.clone(),
                    None => em.zeros(&ins[0].aval().strong())?,
                };
                let tu = match &ts[1] {
                    Some(t) => em.convert(t, out_aval.dtype)?,
                    None => em.zeros(&ins[1].aval().strong().with_dtype(out_aval.dtype))?,
                };
                let mut inputs = vec![tx, tu];
                inputs.extend_from_slice(&ins[2..]);
                Some(em.emit(Primitive::DynamicUpdateSlice, inputs, eqn.params.clone())?)
            }
            Primitive::StopGradient
            | Primitive::Eq
            | Primitive::Ne
            | Primitive::Lt
            | Primitive::Le
            | Primitive::Gt
            | Primitive::Ge
            | Primitive::And
            | Primitive::Or
            | Primitive::Not
            | Primitive::Xor => None,
            primitive @ (Primitive::Cond
            | Primitive::While
            | Primitive::Scan
            | Primitive::RefGet
            | Primitive::RefSwap
            | Primitive::RefAddUpdate) => {
                return Err(TraceError::NoRule {
                    transform: "jvp",
                    primitive,
                });
            }
        };
        Ok(tangent)
    }

    /// A reference with a tangent has a tangent reference alongside it;
    /// each state operation on the primal is mirrored on the tangent.
    fn stateful(&mut self, eqn: &Equation) -> Result<(), TraceError> {
        let ins: Vec<Atom> = eqn.inputs.iter().map(|atom| self.primal(atom)).collect();
        let out_avals: Vec<AbstractValue> = eqn.outputs.iter().map(|var| var.aval.clone()).collect();
        let outs = self.em.emit_typed(
            eqn.primitive,
            ins.clone(),
            eqn.params.clone(),
            Vec::new(),
            out_avals.clone(),
        );
        for (old, new) in eqn.outputs.iter().zip(&outs) {
            self.primal.insert(old.id, Atom::Var(new.clone()));
        }

        let tangent_ref = self.tangent(&eqn.inputs[0]);
        let Some(tangent_ref) = tangent_ref else {
            let writes_tangent = eqn.primitive != Primitive::RefGet
                && eqn.inputs.get(1).is_some_and(|value| self.tangent(value).is_some());
            if writes_tangent {
                return Err(TraceError::InvalidArgument {
                    construct: "jvp",
                    detail: format!(
                        "{} stores a value with a nonzero tangent into a reference without one",
                        eqn.primitive
                    ),
                });
            }
            return Ok(());
        };

        let mut tangent_ins = vec![tangent_ref];
        match eqn.primitive {
            Primitive::RefGet => tangent_ins.extend_from_slice(&ins[1..]),
            Primitive::RefSwap => {
                tangent_ins.push(self.tangent_or_zeros(&eqn.inputs[1])?);
                tangent_ins.extend_from_slice(&ins[2..]);
            }
            _ => match self.tangent(&eqn.inputs[1]) {
                Some(t) => {
                    tangent_ins.push(t);
                    tangent_ins.extend_from_slice(&ins[2..]);
                }
                None => return Ok(()),
            },
        }
        let tangent_avals = out_avals.iter().map(AbstractValue::strong).collect();
        let tangent_outs = self.em.emit_typed(
            eqn.primitive,
            tangent_ins,
            eqn.params.clone(),
            Vec::new(),
            tangent_avals,
        );
        for (old, t) in eqn.outputs.iter().zip(tangent_outs) {
            self.set_tangent(old, Some(Atom::Var(t)));
        }
        Ok(())
    }

    fn cond(&mut self, eqn: &Equation) -> Result<(), TraceError> {
        let index = self.primal(&eqn.inputs[0]);
        let operands = &eqn.inputs[1..];
        let nonzeros: Vec<bool> = operands.iter().map(|a| self.tangent(a).is_some()).collect();
        let n_out = eqn.outputs.len();

        let mut union = vec![false; n_out];
        for branch in &eqn.sub_jaxprs {
            let (_, out_nz) = jvp_jaxpr(branch, &nonzeros, &vec![false; n_out])?;
            for (acc, nz) in union.iter_mut().zip(out_nz) {
                *acc |= nz;
            }
        }
        let branches = eqn
            .sub_jaxprs
            .iter()
            .map(|branch| jvp_jaxpr(branch, &nonzeros, &union).map(|(jaxpr, _)| jaxpr))
            .collect::<Result<Vec<_>, _>>()?;

        let mut inputs = vec![index];
        inputs.extend(operands.iter().map(|a| self.primal(a)));
        inputs.extend(operands.iter().filter_map(|a| self.tangent(a)));
        let mut out_avals: Vec<AbstractValue> =
            eqn.outputs.iter().map(|var| var.aval.clone()).collect();
        out_avals.extend(
            eqn.outputs
                .iter()
                .zip(&union)
                .filter(|(_, nz)| **nz)
                .map(|(var, _)| var.aval.strong()),
        );
        let outs = self
            .em
            .emit_typed(Primitive::Cond, inputs, eqn.params.clone(), branches, out_avals);
        self.bind_outputs(&eqn.outputs, &union, outs);
        Ok(())
    }

    /// Map `outs = primal outputs ++ tangents of the flagged outputs` onto
    /// the original output variables.
    fn bind_outputs(&mut self, originals: &[Var], nonzeros: &[bool], outs: Vec<Var>) {
        let (primals, tangents) = outs.split_at(originals.len());
        for (var, new) in originals.iter().zip(primals) {
            self.primal.insert(var.id, Atom::Var(new.clone()));
        }
        let mut tangents = tangents.iter();
        for (var, &nz) in originals.iter().zip(nonzeros) {
            if nz && let Some(t) = tangents.next() {
                self.set_tangent(var, Some(Atom::Var(t.clone())));
            }
        }
    }

    fn while_loop(&mut self, eqn: &Equation) -> Result<(), TraceError> {
        let params = WhileParams::from_eqn(eqn)?;
        let (cn, bn) = (params.cond_nconsts, params.body_nconsts);
        let nonzeros: Vec<bool> = eqn.inputs.iter().map(|a| self.tangent(a).is_some()).collect();
        let bconst_nz = nonzeros[cn..cn + bn].to_vec();
        let mut carry_nz = nonzeros[cn + bn..].to_vec();
        let cond = &eqn.sub_jaxprs[0];
        let body = &eqn.sub_jaxprs[1];

        let body_jvp = loop {
            let mut body_nz = bconst_nz.clone();
            body_nz.extend_from_slice(&carry_nz);
            let (jaxpr, out_nz) = jvp_jaxpr(body, &body_nz, &carry_nz)?;
            let next: Vec<bool> = carry_nz.iter().zip(&out_nz).map(|(a, b)| *a || *b).collect();
            if next == carry_nz {
                break jaxpr;
            }
            carry_nz = next;
        };
        let num_carry = carry_nz.len();
        let bconst_t = count(&bconst_nz);
        let carry_t = count(&carry_nz);
        let body_jvp = interleave_invars(body_jvp, &[bn, num_carry], &[bconst_t, carry_t]);

        let mut cond_ext = cond.clone();
        for (var, &nz) in body.invars[bn..].iter().zip(&carry_nz) {
            if nz {
                cond_ext.invars.push(Var::new(var.aval.strong()));
            }
        }

        let primal_in: Vec<Atom> = eqn.inputs.iter().map(|a| self.primal(a)).collect();
        let mut inputs = primal_in[..cn + bn].to_vec();
        for (atom, &nz) in eqn.inputs[cn..cn + bn].iter().zip(&bconst_nz) {
            if nz && let Some(t) = self.tangent(atom) {
                inputs.push(t);
            }
        }
        inputs.extend_from_slice(&primal_in[cn + bn..]);
        for (atom, &nz) in eqn.inputs[cn + bn..].iter().zip(&carry_nz) {
            if nz {
                let t = self.tangent_or_zeros(atom)?;
                inputs.push(t);
            }
        }

        let new_params = WhileParams {
            cond_nconsts: cn,
            body_nconsts: bn + bconst_t,
        };
        let mut out_avals: Vec<AbstractValue> =
            eqn.outputs.iter().map(|var| var.aval.clone()).collect();
        out_avals.extend(
            eqn.outputs
                .iter()
                .zip(&carry_nz)
                .filter(|(_, nz)| **nz)
                .map(|(var, _)| var.aval.strong()),
        );
        let outs = self.em.emit_typed(
            Primitive::While,
            inputs,
            new_params.to_params(),
            vec![cond_ext, body_jvp],
            out_avals,
        );
        self.bind_outputs(&eqn.outputs, &carry_nz, outs);
        Ok(())
    }

    fn scan(&mut self, eqn: &Equation) -> Result<(), TraceError> {
        let params = ScanParams::from_eqn(eqn)?;
        let (nc, ncar, nx) = (params.num_consts, params.num_carry, params.num_xs());
        let body = &eqn.sub_jaxprs[0];
        let n_ys = body.outvars.len() - ncar;
        let nonzeros: Vec<bool> = eqn.inputs.iter().map(|a| self.tangent(a).is_some()).collect();
        let const_nz = nonzeros[..nc].to_vec();
        let xs_nz = nonzeros[nc + ncar..].to_vec();
        let mut carry_nz = nonzeros[nc..nc + ncar].to_vec();

        let (body_jvp, out_nz) = loop {
            let mut body_nz = const_nz.clone();
            body_nz.extend_from_slice(&carry_nz);
            body_nz.extend_from_slice(&xs_nz);
            let mut force = carry_nz.clone();
            force.extend(std::iter::repeat_n(false, n_ys));
            let (jaxpr, out_nz) = jvp_jaxpr(body, &body_nz, &force)?;
            let next: Vec<bool> = carry_nz
                .iter()
                .zip(&out_nz[..ncar])
                .map(|(a, b)| *a || *b)
                .collect();
            if next == carry_nz {
                break (jaxpr, out_nz);
            }
            carry_nz = next;
        };
        let ys_nz = out_nz[ncar..].to_vec();
        let (const_t, carry_t, xs_t, ys_t) = (
            count(&const_nz),
            count(&carry_nz),
            count(&xs_nz),
            count(&ys_nz),
        );

        let mut body_jvp = interleave_invars(body_jvp, &[nc, ncar, nx], &[const_t, carry_t, xs_t]);
        let outvars = std::mem::take(&mut body_jvp.outvars);
        body_jvp.outvars = interleave(&outvars, &[ncar, n_ys], &[carry_t, ys_t]);

        let primal_in: Vec<Atom> = eqn.inputs.iter().map(|a| self.primal(a)).collect();
        let mut tangent_in = Vec::new();
        for (idx, atom) in eqn.inputs.iter().enumerate() {
            let is_carry = (nc..nc + ncar).contains(&idx);
            if is_carry && carry_nz[idx - nc] {
                tangent_in.push(self.tangent_or_zeros(atom)?);
            } else if !is_carry && nonzeros[idx] {
                if let Some(t) = self.tangent(atom) {
                    tangent_in.push(t);
                }
            }
        }
        let mut all_in = primal_in;
        all_in.extend(tangent_in);
        let inputs = interleave(&all_in, &[nc, ncar, nx], &[const_t, carry_t, xs_t]);

        let mut linear = params.linear.clone();
        linear.extend(std::iter::repeat_n(true, const_t + carry_t + xs_t));
        let linear = interleave(&linear, &[nc, ncar, nx], &[const_t, carry_t, xs_t]);
        let new_params = ScanParams {
            num_consts: nc + const_t,
            num_carry: ncar + carry_t,
            linear,
            ..params
        };

        let mut out_avals: Vec<AbstractValue> =
            eqn.outputs.iter().map(|var| var.aval.clone()).collect();
        let out_nz: Vec<bool> = carry_nz.iter().chain(&ys_nz).copied().collect();
        out_avals.extend(
            eqn.outputs
                .iter()
                .zip(&out_nz)
                .filter(|(_, nz)| **nz)
                .map(|(var, _)| var.aval.strong()),
        );
        let out_avals = interleave(&out_avals, &[ncar, n_ys], &[carry_t, ys_t]);
        let outs = self.em.emit_typed(
            Primitive::Scan,
            inputs,
            new_params.to_params(),
            vec![body_jvp],
            out_avals,
        );
        let outs = deinterleave(&outs, &[ncar, n_ys], &[carry_t, ys_t]);
        self.bind_outputs(&eqn.outputs, &out_nz, outs);
        Ok(())
    }
}

fn count(flags: &[bool]) -> usize {
    flags.iter().filter(|&&flag| flag).count()
}

/// Reorder `primals(groups) ++ tangents(groups)` into
/// `p0 ++ t0 ++ p1 ++ t1 ++ ...`.
pub(crate) fn interleave<T: Clone>(
    items: &[T],
    primal_sizes: &[usize],
    tangent_sizes: &[usize],
) -> Vec<T> {
    let total_primal: usize = primal_sizes.iter().sum();
    let (primals, tangents) = items.split_at(total_primal);
    let mut out = Vec::with_capacity(items.len());
    let (mut p, mut t) = (0, 0);
    for (&np, &nt) in primal_sizes.iter().zip(tangent_sizes) {
        out.extend_from_slice(&primals[p..p + np]);
        out.extend_from_slice(&tangents[t..t + nt]);
        p += np;
        t += nt;
    }
    out
}

/// Inverse of [`interleave`].
pub(crate) fn deinterleave<T: Clone>(
    items: &[T],
    primal_sizes: &[usize],
    tangent_sizes: &[usize],
) -> Vec<T> {
    let mut primals = Vec::new();
    let mut tangents = Vec::new();
    let mut pos = 0;
    for (&np, &nt) in primal_sizes.iter().zip(tangent_sizes) {
        primals.extend_from_slice(&items[pos..pos + np]);
        pos += np;
        tangents.extend_from_slice(&items[pos..pos + nt]);
        pos += nt;
    }
    primals.extend(tangents);
    primals
}

fn interleave_invars(mut jaxpr: Jaxpr, primal_sizes: &[usize], tangent_sizes: &[usize]) -> Jaxpr {
    jaxpr.invars = interleave(&jaxpr.invars, primal_sizes, tangent_sizes);
    jaxpr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discharge::discharge_state;
    use crate::eval_jaxpr;
    use crate::params::CheckpointPolicy;
    use crate::test_graphs::{
        cond_graph, f64s, growth_while, mul_sin_body, scan_graph, trace, trace_stateful, vec_f64,
    };
    use crate::trace::Tracer;
    use fj_core::Value;
    use fj_test_utils::{Tolerance, assert_allclose, central_difference};
    use proptest::prelude::*;

    #[test]
    fn jvp_of_sin_times_x() {
        let jaxpr = trace(vec![f64s()], |cx, args| {
            let s = cx.sin(&args[0])?;
            Ok(vec![cx.mul(&s, &args[0])?])
        });
        let (jvp, out_nz) = jvp_jaxpr(&jaxpr, &[true], &[false]).expect("jvp");
        assert_eq!(out_nz, vec![true]);
        let x = 0.7_f64;
        let out = eval_jaxpr(&jvp, &[], &[Value::scalar_f64(x), Value::scalar_f64(1.0)])
            .expect("eval");
        assert_eq!(out[0].as_f64_scalar(), Some(x.sin() * x));
        let expected = x.cos() * x + x.sin();
        assert!(Tolerance::F32.close(out[1].as_f64_scalar().expect("t"), expected));
    }

    fn scalar_values(xs: &[f64]) -> Vec<Value> {
        xs.iter().copied().map(Value::scalar_f64).collect()
    }

    fn f64_outputs(out: &[Value]) -> Vec<f64> {
        out.iter().map(|v| v.as_f64_scalar().expect("f64 scalar")).collect()
    }

    #[test]
    fn get_reads_the_tangent_reference() {
        let jaxpr = trace_stateful(vec![f64s()], &[true], |cx, args| {
            let x = cx.ref_get(&args[0], &[])?;
            Ok(vec![cx.cos(&x)?])
        });
        let (jvp, out_nz) = jvp_jaxpr(&jaxpr, &[true], &[false]).expect("jvp");
        assert_eq!(out_nz, vec![true]);
        assert!(jvp.invars.iter().all(|var| var.is_ref));
        assert_eq!(jvp.count_primitive(Primitive::RefGet), 2);

        let pure = discharge_state(&jvp, &[true, true]).expect("discharge");
        let x = 0.4_f64;
        let out = eval_jaxpr(&pure, &[], &scalar_values(&[x, 1.5])).expect("eval");
        let out = f64_outputs(&out);
        assert_eq!(out[0], x.cos());
        assert_allclose(&out[1..2], &[-x.sin() * 1.5], Tolerance::F32);
        assert_eq!(&out[2..], &[x, 1.5]);
    }

    #[test]
    fn swap_threads_the_written_tangent() {
        let jaxpr = trace_stateful(vec![f64s()], &[true], |cx, args| {
            let x = cx.ref_get(&args[0], &[])?;
            let s = cx.sin(&x)?;
            let old = cx.ref_swap(&args[0], &[], &s)?;
            let now = cx.ref_get(&args[0], &[])?;
            Ok(vec![old, now])
        });
        let (jvp, out_nz) = jvp_jaxpr(&jaxpr, &[true], &[false, false]).expect("jvp");
        assert_eq!(out_nz, vec![true, true]);
        assert_eq!(jvp.count_primitive(Primitive::RefSwap), 2);

        let pure = discharge_state(&jvp, &[true, true]).expect("discharge");
        let (x, t) = (0.3_f64, 2.0);
        let out = f64_outputs(&eval_jaxpr(&pure, &[], &scalar_values(&[x, t])).expect("eval"));
        // old, now, t_old, t_now, final cell, final tangent cell
        assert_eq!(out[0], x);
        assert_eq!(out[1], x.sin());
        assert_eq!(out[2], t);
        assert_allclose(&out[3..4], &[x.cos() * t], Tolerance::F32);
        assert_eq!(out[4], x.sin());
        assert_allclose(&out[5..6], &[x.cos() * t], Tolerance::F32);
    }

    #[test]
    fn addupdate_accumulates_the_tangent() {
        let jaxpr = trace_stateful(vec![f64s(), f64s()], &[true, false], |cx, args| {
            let sq = cx.mul(&args[1], &args[1])?;
            cx.ref_add(&args[0], &[], &sq)?;
            Ok(vec![cx.ref_get(&args[0], &[])?])
        });
        let (jvp, _) = jvp_jaxpr(&jaxpr, &[true, true], &[true]).expect("jvp");
        assert_eq!(jvp.count_primitive(Primitive::RefAddUpdate), 2);

        // inputs: cell, x, tangent cell, tangent x
        let pure = discharge_state(&jvp, &[true, false, true, false]).expect("discharge");
        let out = f64_outputs(
            &eval_jaxpr(&pure, &[], &scalar_values(&[1.0, 3.0, 0.5, 2.0])).expect("eval"),
        );
        assert_eq!(out[0], 10.0);
        assert_eq!(out[1], 0.5 + 2.0 * 3.0 * 2.0);
    }

    #[test]
    fn writing_a_tangent_into_a_reference_without_one_fails() {
        let jaxpr = trace_stateful(vec![f64s(), f64s()], &[true, false], |cx, args| {
            cx.ref_set(&args[0], &[], &args[1])?;
            Ok(vec![])
        });
        let err = jvp_jaxpr(&jaxpr, &[false, true], &[]).expect_err("untracked reference");
        assert!(matches!(err, TraceError::InvalidArgument { construct: "jvp", .. }));
    }

    #[test]
    fn zero_tangents_stay_symbolic_unless_instantiated() {
        let jaxpr = trace(vec![f64s(), f64s()], |cx, args| {
            Ok(vec![cx.sin(&args[1])?])
        });
        let (_, out_nz) = jvp_jaxpr(&jaxpr, &[true, false], &[false]).expect("jvp");
        assert_eq!(out_nz, vec![false]);
        let (jvp, out_nz) = jvp_jaxpr(&jaxpr, &[true, false], &[true]).expect("jvp");
        assert_eq!(out_nz, vec![true]);
        let out = eval_jaxpr(
            &jvp,
            &[],
            &[Value::scalar_f64(1.0), Value::scalar_f64(2.0), Value::scalar_f64(1.0)],
        )
        .expect("eval");
        assert_eq!(out[1].as_f64_scalar(), Some(0.0));
    }

    #[test]
    fn scan_jvp_matches_finite_differences() {
        let jaxpr = scan_graph(mul_sin_body(), 0, 1, 4, false, CheckpointPolicy::SaveEverything);
        let xs = Value::vector_f64(&[0.5, -1.0, 1.5, 0.25]).expect("xs");
        let (jvp, out_nz) = jvp_jaxpr(&jaxpr, &[true, false], &[false, false]).expect("jvp");
        assert_eq!(out_nz, vec![true, true]);

        let c0 = 0.8_f64;
        let out = eval_jaxpr(
            &jvp,
            &[],
            &[Value::scalar_f64(c0), xs.clone(), Value::scalar_f64(1.0)],
        )
        .expect("eval");
        let carry_of = |c: f64| {
            eval_jaxpr(&jaxpr, &[], &[Value::scalar_f64(c), xs.clone()]).expect("eval")[0]
                .as_f64_scalar()
                .expect("carry")
        };
        let fd = central_difference(carry_of, c0, 1e-6);
        assert_allclose(
            &[out[2].as_f64_scalar().expect("carry tangent")],
            &[fd],
            Tolerance::FINITE_DIFFERENCE,
        );
        assert_eq!(out[3].shape.dims, vec![4]);
    }

    #[test]
    fn while_jvp_co_iterates_tangent() {
        let jaxpr = growth_while();
        let (jvp, out_nz) = jvp_jaxpr(&jaxpr, &[false, true], &[false]).expect("jvp");
        assert_eq!(out_nz, vec![true]);
        let out = eval_jaxpr(
            &jvp,
            &[],
            &[Value::scalar_f64(10.0), Value::scalar_f64(1.0), Value::scalar_f64(1.0)],
        )
        .expect("eval");
        assert_eq!(out[0].as_f64_scalar(), Some(10.890625));
        assert_eq!(out[1].as_f64_scalar(), Some(1.5_f64.powi(5)));
    }

    #[test]
    fn cond_jvp_instantiates_union_of_branch_tangents() {
        let square = trace(vec![f64s()], |cx, args| Ok(vec![cx.mul(&args[0], &args[0])?]));
        let constant = trace(vec![f64s()], |_, _| Ok(vec![Tracer::f64(3.0)]));
        let jaxpr = cond_graph(vec![square, constant]);
        let (jvp, out_nz) = jvp_jaxpr(&jaxpr, &[false, true], &[false]).expect("jvp");
        assert_eq!(out_nz, vec![true]);
        let run = |index: i32| {
            eval_jaxpr(
                &jvp,
                &[],
                &[Value::scalar_i32(index), Value::scalar_f64(2.5), Value::scalar_f64(1.0)],
            )
            .expect("eval")
        };
        assert_eq!(run(0)[1].as_f64_scalar(), Some(5.0));
        assert_eq!(run(1)[1].as_f64_scalar(), Some(0.0));
        assert_eq!(run(1)[0].as_f64_scalar(), Some(3.0));
    }

    #[test]
    fn interleave_round_trips() {
        let items = [1, 2, 3, 10, 30];
        let mixed = interleave(&items, &[2, 1], &[1, 1]);
        assert_eq!(mixed, vec![1, 2, 10, 3, 30]);
        assert_eq!(deinterleave(&mixed, &[2, 1], &[1, 1]), items.to_vec());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(
            fj_test_utils::property_test_case_count()
        ))]

        #[test]
        fn prop_elementwise_jvp_matches_finite_differences(x in 0.2_f64..2.0) {
            let jaxpr = trace(vec![f64s()], |cx, args| {
                let e = cx.exp(&args[0])?;
                let l = cx.log(&args[0])?;
                let t = cx.tanh(&e)?;
                let c = cx.cosh(&l)?;
                Ok(vec![cx.div(&t, &c)?])
            });
            let (jvp, _) = jvp_jaxpr(&jaxpr, &[true], &[true]).expect("jvp");
            let out = eval_jaxpr(&jvp, &[], &[Value::scalar_f64(x), Value::scalar_f64(1.0)])
                .expect("eval");
            let f = |v: f64| (v.exp().tanh()) / (v.ln().cosh());
            let fd = central_difference(f, x, 1e-6);
            let tangent = out[1].as_f64_scalar().expect("tangent");
            prop_assert!(Tolerance::FINITE_DIFFERENCE.close(tangent, fd), "{tangent} vs {fd}");
        }

        #[test]
        fn prop_vector_scan_jvp_is_linear_in_tangent(scale in -3.0_f64..3.0) {
            let body = trace(vec![vec_f64(2), vec_f64(2)], |cx, args| {
                let prod = cx.mul(&args[0], &args[1])?;
                Ok(vec![prod, args[0].clone()])
            });
            let jaxpr = scan_graph(body, 0, 1, 3, true, CheckpointPolicy::SaveEverything);
            let (jvp, _) = jvp_jaxpr(&jaxpr, &[true, false], &[false, false]).expect("jvp");
            let xs = Value::from_f64s(
                fj_core::DType::F64,
                fj_core::Shape::new(vec![3, 2]),
                &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            )
            .expect("xs");
            let c0 = Value::vector_f64(&[1.0, 1.0]).expect("c0");
            let run = |t: f64| {
                let tangent = Value::vector_f64(&[t, t]).expect("t");
                eval_jaxpr(&jvp, &[], &[c0.clone(), xs.clone(), tangent]).expect("eval")[2]
                    .to_f64_vec()
                    .expect("carry tangent")
            };
            let unit = run(1.0);
            let scaled = run(scale);
            for (u, s) in unit.iter().zip(&scaled) {
                prop_assert!(Tolerance::F32.close(*s, u * scale));
            }
        }
    }
}
