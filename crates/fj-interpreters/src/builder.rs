#![forbid(unsafe_code)]

//! Equation emitter shared by the tracer and the graph transforms.

use fj_core::{AbstractValue, Atom, DType, Equation, Jaxpr, Literal, Primitive, Var, VarId, format_list};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

use crate::error::TraceError;

pub(crate) fn params<const N: usize>(entries: [(&str, String); N]) -> BTreeMap<String, String> {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect()
}

/// Accumulates equations in program order, typing every output through
/// the primitive shape rules.
#[derive(Debug, Default, Clone)]
pub struct Emitter {
    equations: Vec<Equation>,
}

impl Emitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn equations(&self) -> &[Equation] {
        &self.equations
    }

    #[must_use]
    pub fn into_equations(self) -> Vec<Equation> {
        self.equations
    }

    pub fn push(&mut self, eqn: Equation) {
        self.equations.push(eqn);
    }

    #[must_use]
    pub fn finish(self, invars: Vec<Var>, outvars: Vec<Atom>) -> Jaxpr {
        Jaxpr::new(invars, Vec::new(), outvars, self.equations)
    }

    /// Emit a single-output numeric primitive.
    pub fn emit(
        &mut self,
        primitive: Primitive,
        inputs: Vec<Atom>,
        params: BTreeMap<String, String>,
    ) -> Result<Atom, TraceError> {
        let avals: Vec<AbstractValue> = inputs.iter().map(Atom::aval).collect();
        let aval = fj_lax::abstract_eval(primitive, &avals, &params)?;
        let out = Var::new(aval);
        self.equations
            .push(Equation::new(primitive, inputs, vec![out.clone()]).with_params(params));
        Ok(Atom::Var(out))
    }

    /// Emit an equation whose output types the caller already knows
    /// (control flow and state primitives).
    pub fn emit_typed(
        &mut self,
        primitive: Primitive,
        inputs: Vec<Atom>,
        params: BTreeMap<String, String>,
        sub_jaxprs: Vec<Jaxpr>,
        out_avals: Vec<AbstractValue>,
    ) -> Vec<Var> {
        let outs: Vec<Var> = out_avals.into_iter().map(Var::new).collect();
        self.equations.push(
            Equation::new(primitive, inputs, outs.clone())
                .with_params(params)
                .with_sub_jaxprs(sub_jaxprs),
        );
        outs
    }

    pub fn unary(&mut self, primitive: Primitive, x: &Atom) -> Result<Atom, TraceError> {
        self.emit(primitive, vec![x.clone()], BTreeMap::new())
    }

    pub fn binary(&mut self, primitive: Primitive, a: &Atom, b: &Atom) -> Result<Atom, TraceError> {
        self.emit(primitive, vec![a.clone(), b.clone()], BTreeMap::new())
    }

    pub fn add(&mut self, a: &Atom, b: &Atom) -> Result<Atom, TraceError> {
        self.binary(Primitive::Add, a, b)
    }

    pub fn sub(&mut self, a: &Atom, b: &Atom) -> Result<Atom, TraceError> {
        self.binary(Primitive::Sub, a, b)
    }

    pub fn mul(&mut self, a: &Atom, b: &Atom) -> Result<Atom, TraceError> {
        self.binary(Primitive::Mul, a, b)
    }

    pub fn div(&mut self, a: &Atom, b: &Atom) -> Result<Atom, TraceError> {
        self.binary(Primitive::Div, a, b)
    }

    pub fn neg(&mut self, x: &Atom) -> Result<Atom, TraceError> {
        self.unary(Primitive::Neg, x)
    }

    /// `acc + x`, treating a missing accumulator as zero.
    pub fn add_any(&mut self, acc: Option<Atom>, x: Atom) -> Result<Atom, TraceError> {
        match acc {
            None => Ok(x),
            Some(acc) => self.add(&acc, &x),
        }
    }

    /// Convert to a strongly typed `dtype`, skipping no-op conversions.
    pub fn convert(&mut self, x: &Atom, dtype: DType) -> Result<Atom, TraceError> {
        let aval = x.aval();
        if aval.dtype == dtype && !aval.weak_type {
            return Ok(x.clone());
        }
        self.emit(
            Primitive::ConvertElementType,
            vec![x.clone()],
            params([("new_dtype", dtype.as_str().to_owned())]),
        )
    }

    pub fn broadcast_in_dim(
        &mut self,
        x: &Atom,
        shape: &[u32],
        broadcast_dimensions: &[usize],
    ) -> Result<Atom, TraceError> {
        self.emit(
            Primitive::BroadcastInDim,
            vec![x.clone()],
            params([
                ("shape", format_list(shape)),
                ("broadcast_dimensions", format_list(broadcast_dimensions)),
            ]),
        )
    }

    /// Array of type `aval` filled with `literal`.
    pub fn full(&mut self, aval: &AbstractValue, literal: Literal) -> Result<Atom, TraceError> {
        let scalar = self.convert(&Atom::Lit(literal), aval.dtype)?;
        if aval.is_scalar() {
            return Ok(scalar);
        }
        self.broadcast_in_dim(&scalar, &aval.shape.dims, &[])
    }

    pub fn zeros(&mut self, aval: &AbstractValue) -> Result<Atom, TraceError> {
        self.full(aval, Literal::zero(aval.dtype))
    }

    /// Bring `x` to exactly the shape and dtype of `aval`, broadcasting a
    /// scalar if needed.
    pub fn broadcast_to(&mut self, x: &Atom, aval: &AbstractValue) -> Result<Atom, TraceError> {
        let x = self.convert(x, aval.dtype)?;
        let shape = x.aval().shape;
        if shape == aval.shape {
            return Ok(x);
        }
        if shape.rank() == 0 {
            return self.broadcast_in_dim(&x, &aval.shape.dims, &[]);
        }
        Err(TraceError::malformed(
            Primitive::BroadcastInDim,
            format!("cannot broadcast {shape} to {}", aval.shape),
        ))
    }

    /// Sum a cotangent down to the shape of an operand that was broadcast
    /// against it, then match the operand's dtype.
    pub fn unbroadcast(&mut self, ct: &Atom, target: &AbstractValue) -> Result<Atom, TraceError> {
        let shape = ct.aval().shape;
        let summed = if shape == target.shape {
            ct.clone()
        } else if target.is_scalar() {
            let axes: Vec<usize> = (0..shape.rank()).collect();
            self.reduce_sum(ct, &axes)?
        } else {
            return Err(TraceError::malformed(
                Primitive::ReduceSum,
                format!("cannot unbroadcast {shape} to {}", target.shape),
            ));
        };
        self.convert(&summed, target.dtype)
    }

    pub fn reduce_sum(&mut self, x: &Atom, axes: &[usize]) -> Result<Atom, TraceError> {
        self.emit(
            Primitive::ReduceSum,
            vec![x.clone()],
            params([("axes", format_list(axes))]),
        )
    }

    pub fn reshape(&mut self, x: &Atom, dims: &[u32]) -> Result<Atom, TraceError> {
        if x.aval().shape.dims == dims {
            return Ok(x.clone());
        }
        self.emit(
            Primitive::Reshape,
            vec![x.clone()],
            params([("new_sizes", format_list(dims))]),
        )
    }

    pub fn transpose(&mut self, x: &Atom, permutation: &[usize]) -> Result<Atom, TraceError> {
        self.emit(
            Primitive::Transpose,
            vec![x.clone()],
            params([("permutation", format_list(permutation))]),
        )
    }

    pub fn rev(&mut self, x: &Atom, dimensions: &[usize]) -> Result<Atom, TraceError> {
        self.emit(
            Primitive::Rev,
            vec![x.clone()],
            params([("dimensions", format_list(dimensions))]),
        )
    }

    pub fn slice(
        &mut self,
        x: &Atom,
        starts: &[usize],
        limits: &[usize],
        strides: &[usize],
    ) -> Result<Atom, TraceError> {
        self.emit(
            Primitive::Slice,
            vec![x.clone()],
            params([
                ("start_indices", format_list(starts)),
                ("limit_indices", format_list(limits)),
                ("strides", format_list(strides)),
            ]),
        )
    }

    pub fn pad(
        &mut self,
        x: &Atom,
        value: &Atom,
        low: &[usize],
        high: &[usize],
        interior: &[usize],
    ) -> Result<Atom, TraceError> {
        self.emit(
            Primitive::Pad,
            vec![x.clone(), value.clone()],
            params([
                ("padding_low", format_list(low)),
                ("padding_high", format_list(high)),
                ("padding_interior", format_list(interior)),
            ]),
        )
    }

    pub fn concatenate(&mut self, xs: &[Atom], dimension: usize) -> Result<Atom, TraceError> {
        self.emit(
            Primitive::Concatenate,
            xs.to_vec(),
            params([("dimension", dimension.to_string())]),
        )
    }

    pub fn dynamic_slice(
        &mut self,
        x: &Atom,
        indices: &[Atom],
        sizes: &[u32],
    ) -> Result<Atom, TraceError> {
        let mut inputs = vec![x.clone()];
        inputs.extend_from_slice(indices);
        self.emit(
            Primitive::DynamicSlice,
            inputs,
            params([("slice_sizes", format_list(sizes))]),
        )
    }

    pub fn dynamic_update_slice(
        &mut self,
        x: &Atom,
        update: &Atom,
        indices: &[Atom],
    ) -> Result<Atom, TraceError> {
        let mut inputs = vec![x.clone(), update.clone()];
        inputs.extend_from_slice(indices);
        self.emit(Primitive::DynamicUpdateSlice, inputs, BTreeMap::new())
    }

    pub fn select_n(&mut self, which: &Atom, cases: &[Atom]) -> Result<Atom, TraceError> {
        let mut inputs = vec![which.clone()];
        inputs.extend_from_slice(cases);
        self.emit(Primitive::SelectN, inputs, BTreeMap::new())
    }

    /// Splice `jaxpr` into this emitter with its constvars bound to `consts`
    /// and its invars bound to `args`; every equation output is renamed.
    pub fn inline(
        &mut self,
        jaxpr: &Jaxpr,
        consts: &[Atom],
        args: &[Atom],
    ) -> Result<Vec<Atom>, TraceError> {
        if consts.len() != jaxpr.constvars.len() || args.len() != jaxpr.invars.len() {
            return Err(TraceError::InvalidArgument {
                construct: "inline",
                detail: format!(
                    "graph expects {} consts and {} inputs, got {} and {}",
                    jaxpr.constvars.len(),
                    jaxpr.invars.len(),
                    consts.len(),
                    args.len()
                ),
            });
        }
        let mut env: FxHashMap<VarId, Atom> = FxHashMap::default();
        for (var, atom) in jaxpr.constvars.iter().zip(consts) {
            env.insert(var.id, atom.clone());
        }
        for (var, atom) in jaxpr.invars.iter().zip(args) {
            env.insert(var.id, atom.clone());
        }
        let subst = |env: &FxHashMap<VarId, Atom>, atom: &Atom| -> Result<Atom, TraceError> {
            match atom {
                Atom::Lit(_) => Ok(atom.clone()),
                Atom::Var(var) => env.get(&var.id).cloned().ok_or_else(|| {
                    TraceError::InvalidArgument {
                        construct: "inline",
                        detail: format!("unbound variable v{}", var.id.0),
                    }
                }),
            }
        };
        for eqn in &jaxpr.equations {
            let inputs = eqn
                .inputs
                .iter()
                .map(|atom| subst(&env, atom))
                .collect::<Result<Vec<_>, _>>()?;
            let outputs: Vec<Var> = eqn.outputs.iter().map(Var::fresh_like).collect();
            for (old, new) in eqn.outputs.iter().zip(&outputs) {
                env.insert(old.id, Atom::Var(new.clone()));
            }
            self.equations.push(
                Equation::new(eqn.primitive, inputs, outputs)
                    .with_params(eqn.params.clone())
                    .with_sub_jaxprs(eqn.sub_jaxprs.clone()),
            );
        }
        jaxpr.outvars.iter().map(|atom| subst(&env, atom)).collect()
    }
}
