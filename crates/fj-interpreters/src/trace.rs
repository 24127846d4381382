#![forbid(unsafe_code)]

//! Tracing: turn a Rust closure over [`Tracer`]s into a [`Jaxpr`].
//!
//! A `TraceCtx` holds a stack of frames, one per function currently being
//! traced. Operations on tracers append equations to the innermost frame.
//! A tracer that belongs to an enclosing frame is lifted into the inner
//! frame as an implicit constant operand, once per frame. A tracer whose
//! frame has already been popped is stale and cannot be used again.

use fj_cache::{CacheKeyInput, TraceCache, build_cache_key};
use fj_core::{
    AbstractValue, Atom, ClosedJaxpr, DType, Jaxpr, Literal, Primitive, Tree, TreeDef, Value, Var,
    VarId,
};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, trace};

use crate::builder::Emitter;
use crate::error::TraceError;

static NEXT_TRACE_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(pub u32);

impl TraceId {
    fn fresh() -> Self {
        Self(NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A symbolic value inside a trace. Literal tracers belong to no trace and
/// may be used anywhere.
#[derive(Debug, Clone, PartialEq)]
pub struct Tracer {
    trace: Option<TraceId>,
    atom: Atom,
}

impl Tracer {
    #[must_use]
    pub fn literal(lit: Literal) -> Self {
        Self {
            trace: None,
            atom: Atom::Lit(lit),
        }
    }

    #[must_use]
    pub fn f64(value: f64) -> Self {
        Self::literal(Literal::from_f64(value))
    }

    #[must_use]
    pub fn i64(value: i64) -> Self {
        Self::literal(Literal::I64(value))
    }

    #[must_use]
    pub fn bool(value: bool) -> Self {
        Self::literal(Literal::Bool(value))
    }

    #[must_use]
    pub fn aval(&self) -> AbstractValue {
        self.atom.aval()
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.atom.aval().dtype
    }

    #[must_use]
    pub fn atom(&self) -> &Atom {
        &self.atom
    }

    #[must_use]
    pub fn trace_id(&self) -> Option<TraceId> {
        self.trace
    }

    #[must_use]
    pub fn as_literal(&self) -> Option<Literal> {
        match self.atom {
            Atom::Lit(lit) => Some(lit),
            Atom::Var(_) => None,
        }
    }

    #[must_use]
    pub fn is_ref(&self) -> bool {
        self.atom.is_ref()
    }
}

/// A value captured by a traced function from outside its own frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstOperand {
    Value(Value),
    Tracer(Tracer),
}

impl ConstOperand {
    #[must_use]
    pub fn aval(&self) -> AbstractValue {
        match self {
            Self::Value(value) => value.aval(),
            Self::Tracer(tracer) => tracer.aval(),
        }
    }
}

/// Result of tracing one function. `jaxpr.invars` lists one variable per
/// captured constant followed by one per flattened argument leaf.
#[derive(Debug, Clone)]
pub struct TracedJaxpr {
    pub jaxpr: Jaxpr,
    pub consts: Vec<ConstOperand>,
    pub in_tree: TreeDef,
    pub out_tree: TreeDef,
}

impl TracedJaxpr {
    #[must_use]
    pub fn num_consts(&self) -> usize {
        self.consts.len()
    }

    /// Argument avals, constants excluded.
    #[must_use]
    pub fn in_avals(&self) -> Vec<AbstractValue> {
        self.jaxpr.invars[self.consts.len()..]
            .iter()
            .map(|var| var.aval.clone())
            .collect()
    }

    #[must_use]
    pub fn out_avals(&self) -> Vec<AbstractValue> {
        self.jaxpr.out_avals()
    }

    /// Close over the captured constants. Fails if any constant is still a
    /// tracer of an enclosing trace.
    pub fn into_closed(self) -> Result<ClosedJaxpr, TraceError> {
        let num_consts = self.consts.len();
        let mut values = Vec::with_capacity(num_consts);
        for operand in self.consts {
            match operand {
                ConstOperand::Value(value) => values.push(value),
                ConstOperand::Tracer(tracer) => {
                    return Err(TraceError::StaleValue {
                        trace_id: tracer.trace.map_or(0, |id| id.0),
                    });
                }
            }
        }
        let Jaxpr {
            mut invars,
            outvars,
            equations,
            ..
        } = self.jaxpr;
        let args = invars.split_off(num_consts);
        Ok(ClosedJaxpr::new(
            Jaxpr::new(args, invars, outvars, equations),
            values,
        ))
    }

    fn consts_live(&self, frames: &[Frame]) -> bool {
        self.consts.iter().all(|operand| match operand {
            ConstOperand::Value(_) => true,
            ConstOperand::Tracer(tracer) => tracer
                .trace
                .is_none_or(|id| frames.iter().any(|frame| frame.id == id)),
        })
    }
}

pub type SharedTraceCache = Rc<RefCell<TraceCache<TracedJaxpr>>>;

#[derive(Debug)]
struct Frame {
    id: TraceId,
    emitter: Emitter,
    invars: Vec<Var>,
    consts: Vec<(Var, ConstOperand)>,
    lifted: FxHashMap<VarId, Var>,
    allow_effects: bool,
}

impl Frame {
    fn new(allow_effects: bool) -> Self {
        Self {
            id: TraceId::fresh(),
            emitter: Emitter::new(),
            invars: Vec::new(),
            consts: Vec::new(),
            lifted: FxHashMap::default(),
            allow_effects,
        }
    }
}

macro_rules! unary_ops {
    ($($name:ident => $prim:ident),* $(,)?) => {
        $(
            pub fn $name(&mut self, x: &Tracer) -> Result<Tracer, TraceError> {
                self.bind(Primitive::$prim, &[x], BTreeMap::new())
            }
        )*
    };
}

macro_rules! binary_ops {
    ($($name:ident => $prim:ident),* $(,)?) => {
        $(
            pub fn $name(&mut self, a: &Tracer, b: &Tracer) -> Result<Tracer, TraceError> {
                self.bind(Primitive::$prim, &[a, b], BTreeMap::new())
            }
        )*
    };
}

#[derive(Debug, Default)]
pub struct TraceCtx {
    frames: Vec<Frame>,
    cache: Option<SharedTraceCache>,
}

impl TraceCtx {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cache(cache: SharedTraceCache) -> Self {
        Self {
            frames: Vec::new(),
            cache: Some(cache),
        }
    }

    #[must_use]
    pub fn cache(&self) -> Option<&SharedTraceCache> {
        self.cache.as_ref()
    }

    /// Number of functions currently being traced.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn trace_fn<F>(&mut self, in_avals: Tree<AbstractValue>, f: F) -> Result<TracedJaxpr, TraceError>
    where
        F: FnOnce(&mut TraceCtx, Tree<Tracer>) -> Result<Tree<Tracer>, TraceError>,
    {
        self.trace_frame(in_avals, None, f)
    }

    /// Trace a function whose arguments marked in `ref_mask` are reference
    /// cells. State operations are permitted in its frame.
    pub fn trace_stateful_fn<F>(
        &mut self,
        in_avals: Tree<AbstractValue>,
        ref_mask: &[bool],
        f: F,
    ) -> Result<TracedJaxpr, TraceError>
    where
        F: FnOnce(&mut TraceCtx, Tree<Tracer>) -> Result<Tree<Tracer>, TraceError>,
    {
        self.trace_frame(in_avals, Some(ref_mask), f)
    }

    /// Trace through the installed cache. The key combines `callable_id`,
    /// the argument structure and avals, and `extra`. A cached graph whose
    /// captured tracers belong to finished traces is discarded and retraced.
    pub fn trace_cached<F>(
        &mut self,
        callable_id: u64,
        extra: &[String],
        in_avals: Tree<AbstractValue>,
        ref_mask: Option<&[bool]>,
        f: F,
    ) -> Result<TracedJaxpr, TraceError>
    where
        F: FnOnce(&mut TraceCtx, Tree<Tracer>) -> Result<Tree<Tracer>, TraceError>,
    {
        let Some(cache) = self.cache.clone() else {
            return self.trace_frame(in_avals, ref_mask, f);
        };
        let in_tree = in_avals.treedef();
        let flat: Vec<AbstractValue> = in_avals.leaves().into_iter().cloned().collect();
        let mut key_extra = extra.to_vec();
        if let Some(mask) = ref_mask {
            let flags: Vec<&str> = mask.iter().map(|&r| if r { "1" } else { "0" }).collect();
            key_extra.push(format!("refs={}", flags.join(",")));
        }
        let key = build_cache_key(&CacheKeyInput {
            callable_id,
            in_tree: &in_tree,
            in_avals: &flat,
            extra: &key_extra,
        });

        let hit = cache.borrow_mut().get(&key).cloned();
        if let Some(traced) = hit {
            if traced.consts_live(&self.frames) {
                trace!(key = %key, "reusing cached trace");
                return Ok(traced);
            }
            debug!(key = %key, "cached trace captured finished tracers; retracing");
            cache.borrow_mut().remove(&key);
        }
        let traced = self.trace_frame(in_avals, ref_mask, f)?;
        cache.borrow_mut().insert(key, traced.clone());
        Ok(traced)
    }

    fn trace_frame<F>(
        &mut self,
        in_avals: Tree<AbstractValue>,
        ref_mask: Option<&[bool]>,
        f: F,
    ) -> Result<TracedJaxpr, TraceError>
    where
        F: FnOnce(&mut TraceCtx, Tree<Tracer>) -> Result<Tree<Tracer>, TraceError>,
    {
        let (avals, in_tree) = in_avals.flatten();
        if let Some(mask) = ref_mask
            && mask.len() != avals.len()
        {
            return Err(TraceError::InvalidArgument {
                construct: "trace",
                detail: format!(
                    "reference mask has {} entries for {} arguments",
                    mask.len(),
                    avals.len()
                ),
            });
        }
        let mut frame = Frame::new(ref_mask.is_some());
        frame.invars = avals
            .into_iter()
            .enumerate()
            .map(|(idx, aval)| {
                if ref_mask.is_some_and(|mask| mask[idx]) {
                    Var::new_ref(aval)
                } else {
                    Var::new(aval)
                }
            })
            .collect();
        let id = frame.id;
        let args: Vec<Tracer> = frame
            .invars
            .iter()
            .map(|var| Tracer {
                trace: Some(id),
                atom: Atom::Var(var.clone()),
            })
            .collect();
        let args = in_tree.unflatten(args)?;

        let depth = self.frames.len();
        self.frames.push(frame);
        let result = f(self, args).and_then(|out| self.finish_frame(in_tree, out));
        self.frames.truncate(depth);
        result
    }

    fn finish_frame(&mut self, in_tree: TreeDef, out: Tree<Tracer>) -> Result<TracedJaxpr, TraceError> {
        let (leaves, out_tree) = out.flatten();
        let mut outvars = Vec::with_capacity(leaves.len());
        for leaf in &leaves {
            let atom = self.resolve(leaf)?;
            if atom.is_ref() {
                return Err(TraceError::RefEscape);
            }
            outvars.push(atom);
        }
        let frame = self.frames.pop().ok_or(TraceError::NoActiveTrace)?;
        let (const_vars, consts): (Vec<Var>, Vec<ConstOperand>) = frame.consts.into_iter().unzip();
        let mut invars = const_vars;
        invars.extend(frame.invars);
        let jaxpr = frame.emitter.finish(invars, outvars);
        jaxpr.validate_well_formed()?;
        debug!(
            trace_id = frame.id.0,
            depth = self.frames.len(),
            equations = jaxpr.equations.len(),
            consts = consts.len(),
            "traced function"
        );
        Ok(TracedJaxpr {
            jaxpr,
            consts,
            in_tree,
            out_tree,
        })
    }

    fn top(&mut self) -> Result<&mut Frame, TraceError> {
        self.frames.last_mut().ok_or(TraceError::NoActiveTrace)
    }

    /// The atom naming `tracer` in the innermost frame, lifting it in as a
    /// constant operand through every frame between its own and the
    /// innermost one.
    pub fn resolve(&mut self, tracer: &Tracer) -> Result<Atom, TraceError> {
        let Atom::Var(var) = &tracer.atom else {
            return Ok(tracer.atom.clone());
        };
        let Some(owner) = tracer.trace else {
            return Ok(tracer.atom.clone());
        };
        if self.frames.is_empty() {
            return Err(TraceError::NoActiveTrace);
        }
        let Some(position) = self.frames.iter().position(|frame| frame.id == owner) else {
            return Err(TraceError::StaleValue { trace_id: owner.0 });
        };
        let last = self.frames.len() - 1;
        if position == last {
            return Ok(tracer.atom.clone());
        }
        if var.is_ref {
            return Err(TraceError::RefEscape);
        }

        let mut current = var.clone();
        for level in position + 1..=last {
            let outer_id = self.frames[level - 1].id;
            let frame = &mut self.frames[level];
            current = match frame.lifted.get(&current.id) {
                Some(inner) => inner.clone(),
                None => {
                    let inner = Var::new(current.aval.clone());
                    frame.consts.push((
                        inner.clone(),
                        ConstOperand::Tracer(Tracer {
                            trace: Some(outer_id),
                            atom: Atom::Var(current.clone()),
                        }),
                    ));
                    frame.lifted.insert(current.id, inner.clone());
                    inner
                }
            };
        }
        Ok(Atom::Var(current))
    }

    /// Resolve operands that are used as plain values.
    fn resolve_values(&mut self, tracers: &[&Tracer]) -> Result<Vec<Atom>, TraceError> {
        tracers
            .iter()
            .map(|tracer| {
                let atom = self.resolve(tracer)?;
                if atom.is_ref() {
                    return Err(TraceError::InvalidArgument {
                        construct: "trace",
                        detail: format!(
                            "reference cell of type {} used as a value; read it with ref_get",
                            atom.aval()
                        ),
                    });
                }
                Ok(atom)
            })
            .collect()
    }

    /// Wrap an atom of the innermost frame.
    pub fn tracer(&self, atom: Atom) -> Result<Tracer, TraceError> {
        let frame = self.frames.last().ok_or(TraceError::NoActiveTrace)?;
        Ok(Tracer {
            trace: Some(frame.id),
            atom,
        })
    }

    /// Direct access to the innermost frame's equation list.
    pub fn emitter(&mut self) -> Result<&mut Emitter, TraceError> {
        Ok(&mut self.top()?.emitter)
    }

    /// Capture a concrete value as a constant operand of the innermost frame.
    pub fn constant(&mut self, value: Value) -> Result<Tracer, TraceError> {
        let frame = self.top()?;
        let var = Var::new(value.aval());
        frame.consts.push((var.clone(), ConstOperand::Value(value)));
        Ok(Tracer {
            trace: Some(frame.id),
            atom: Atom::Var(var),
        })
    }

    /// Atoms for the captured constants of a nested trace, in order.
    pub fn operand_atoms(&mut self, consts: &[ConstOperand]) -> Result<Vec<Atom>, TraceError> {
        consts
            .iter()
            .map(|operand| match operand {
                ConstOperand::Tracer(tracer) => self.resolve(tracer),
                ConstOperand::Value(value) => {
                    let tracer = self.constant(value.clone())?;
                    Ok(tracer.atom)
                }
            })
            .collect()
    }

    pub fn bind(
        &mut self,
        primitive: Primitive,
        inputs: &[&Tracer],
        params: BTreeMap<String, String>,
    ) -> Result<Tracer, TraceError> {
        let atoms = self.resolve_values(inputs)?;
        let frame = self.top()?;
        let out = frame.emitter.emit(primitive, atoms, params)?;
        Ok(Tracer {
            trace: Some(frame.id),
            atom: out,
        })
    }

    /// Emit a control-flow equation whose operands are already atoms of the
    /// innermost frame.
    pub fn bind_control(
        &mut self,
        primitive: Primitive,
        inputs: Vec<Atom>,
        params: BTreeMap<String, String>,
        sub_jaxprs: Vec<Jaxpr>,
        out_avals: Vec<AbstractValue>,
    ) -> Result<Vec<Tracer>, TraceError> {
        let frame = self.top()?;
        let id = frame.id;
        let outs = frame
            .emitter
            .emit_typed(primitive, inputs, params, sub_jaxprs, out_avals);
        Ok(outs
            .into_iter()
            .map(|var| Tracer {
                trace: Some(id),
                atom: Atom::Var(var),
            })
            .collect())
    }

    fn apply(
        &mut self,
        inputs: &[&Tracer],
        f: impl FnOnce(&mut Emitter, &[Atom]) -> Result<Atom, TraceError>,
    ) -> Result<Tracer, TraceError> {
        let atoms = self.resolve_values(inputs)?;
        let frame = self.top()?;
        let out = f(&mut frame.emitter, &atoms)?;
        Ok(Tracer {
            trace: Some(frame.id),
            atom: out,
        })
    }

    unary_ops! {
        neg => Neg,
        sign => Sign,
        exp => Exp,
        log => Log,
        sin => Sin,
        cos => Cos,
        sinh => Sinh,
        cosh => Cosh,
        tanh => Tanh,
        not => Not,
        stop_gradient => StopGradient,
    }

    binary_ops! {
        add => Add,
        sub => Sub,
        mul => Mul,
        div => Div,
        max => Max,
        min => Min,
        eq => Eq,
        ne => Ne,
        lt => Lt,
        le => Le,
        gt => Gt,
        ge => Ge,
        and => And,
        or => Or,
        xor => Xor,
    }

    pub fn select_n(&mut self, which: &Tracer, cases: &[&Tracer]) -> Result<Tracer, TraceError> {
        let mut inputs = vec![which];
        inputs.extend_from_slice(cases);
        self.bind(Primitive::SelectN, &inputs, BTreeMap::new())
    }

    pub fn clamp(&mut self, lo: &Tracer, x: &Tracer, hi: &Tracer) -> Result<Tracer, TraceError> {
        self.bind(Primitive::Clamp, &[lo, x, hi], BTreeMap::new())
    }

    pub fn convert(&mut self, x: &Tracer, dtype: DType) -> Result<Tracer, TraceError> {
        self.apply(&[x], |em, atoms| em.convert(&atoms[0], dtype))
    }

    pub fn broadcast_in_dim(
        &mut self,
        x: &Tracer,
        shape: &[u32],
        broadcast_dimensions: &[usize],
    ) -> Result<Tracer, TraceError> {
        self.apply(&[x], |em, atoms| {
            em.broadcast_in_dim(&atoms[0], shape, broadcast_dimensions)
        })
    }

    pub fn reshape(&mut self, x: &Tracer, dims: &[u32]) -> Result<Tracer, TraceError> {
        self.apply(&[x], |em, atoms| em.reshape(&atoms[0], dims))
    }

    pub fn transpose(&mut self, x: &Tracer, permutation: &[usize]) -> Result<Tracer, TraceError> {
        self.apply(&[x], |em, atoms| em.transpose(&atoms[0], permutation))
    }

    pub fn rev(&mut self, x: &Tracer, dimensions: &[usize]) -> Result<Tracer, TraceError> {
        self.apply(&[x], |em, atoms| em.rev(&atoms[0], dimensions))
    }

    pub fn slice(
        &mut self,
        x: &Tracer,
        starts: &[usize],
        limits: &[usize],
        strides: &[usize],
    ) -> Result<Tracer, TraceError> {
        self.apply(&[x], |em, atoms| em.slice(&atoms[0], starts, limits, strides))
    }

    pub fn pad(
        &mut self,
        x: &Tracer,
        value: &Tracer,
        low: &[usize],
        high: &[usize],
        interior: &[usize],
    ) -> Result<Tracer, TraceError> {
        self.apply(&[x, value], |em, atoms| {
            em.pad(&atoms[0], &atoms[1], low, high, interior)
        })
    }

    pub fn concatenate(&mut self, xs: &[&Tracer], dimension: usize) -> Result<Tracer, TraceError> {
        self.apply(xs, |em, atoms| em.concatenate(atoms, dimension))
    }

    pub fn dynamic_slice(
        &mut self,
        x: &Tracer,
        indices: &[&Tracer],
        sizes: &[u32],
    ) -> Result<Tracer, TraceError> {
        let mut inputs = vec![x];
        inputs.extend_from_slice(indices);
        self.apply(&inputs, |em, atoms| em.dynamic_slice(&atoms[0], &atoms[1..], sizes))
    }

    pub fn dynamic_update_slice(
        &mut self,
        x: &Tracer,
        update: &Tracer,
        indices: &[&Tracer],
    ) -> Result<Tracer, TraceError> {
        let mut inputs = vec![x, update];
        inputs.extend_from_slice(indices);
        self.apply(&inputs, |em, atoms| {
            em.dynamic_update_slice(&atoms[0], &atoms[1], &atoms[2..])
        })
    }

    pub fn reduce_sum(&mut self, x: &Tracer, axes: &[usize]) -> Result<Tracer, TraceError> {
        self.apply(&[x], |em, atoms| em.reduce_sum(&atoms[0], axes))
    }

    /// `x[i]` along the leading axis for a traced integer `i`.
    pub fn index_axis0(&mut self, x: &Tracer, i: &Tracer) -> Result<Tracer, TraceError> {
        self.apply(&[x, i], |em, atoms| {
            let aval = atoms[0].aval();
            let Some(rest) = aval.shape.without_leading() else {
                return Err(TraceError::InvalidArgument {
                    construct: "index_axis0",
                    detail: format!("cannot index a scalar of type {aval}"),
                });
            };
            let mut sizes = vec![1];
            sizes.extend_from_slice(&rest.dims);
            let zero = Atom::Lit(Literal::I64(0));
            let mut indices = vec![atoms[1].clone()];
            indices.extend(std::iter::repeat_n(zero, rest.rank()));
            let row = em.dynamic_slice(&atoms[0], &indices, &sizes)?;
            em.reshape(&row, &rest.dims)
        })
    }

    /// Operand checks shared by the reference-cell operations. Returns the
    /// ref atom, the index atoms and the type of the addressed slice.
    fn ref_operands(
        &mut self,
        primitive: Primitive,
        cell: &Tracer,
        indices: &[&Tracer],
    ) -> Result<(Atom, Vec<Atom>, AbstractValue), TraceError> {
        let construct = primitive.as_str();
        if !self.top()?.allow_effects {
            return Err(TraceError::StateEffect { primitive });
        }
        if !cell.is_ref() {
            return Err(TraceError::NotARef {
                primitive,
                detail: cell.aval().to_string(),
            });
        }
        let ref_atom = self.resolve(cell)?;
        let aval = ref_atom.aval();
        if indices.len() > aval.rank() {
            return Err(TraceError::IndexDomain {
                construct,
                detail: format!(
                    "too many indices for reference of shape {}: got {}",
                    aval.shape,
                    indices.len()
                ),
            });
        }
        let index_atoms = self.resolve_values(indices)?;
        for (axis, index) in index_atoms.iter().enumerate() {
            let index_aval = index.aval();
            if !index_aval.is_scalar() || !index_aval.dtype.is_integral() {
                return Err(TraceError::IndexDomain {
                    construct,
                    detail: format!("indices must be integer scalars, got {index_aval} for axis {axis}"),
                });
            }
            if let Atom::Lit(lit) = index {
                let size = i64::from(aval.shape.dims[axis]);
                let raw = lit.as_i64().unwrap_or(-1);
                if raw < 0 || raw >= size {
                    return Err(TraceError::IndexDomain {
                        construct,
                        detail: format!(
                            "index {raw} is out of bounds for axis {axis} with size {size}"
                        ),
                    });
                }
            }
        }
        let slice_shape = fj_core::Shape::new(aval.shape.dims[indices.len()..].to_vec());
        let slice_aval = AbstractValue::new(aval.dtype, slice_shape);
        Ok((ref_atom, index_atoms, slice_aval))
    }

    fn ref_value(
        &mut self,
        primitive: Primitive,
        slice_aval: &AbstractValue,
        value: &Tracer,
    ) -> Result<Atom, TraceError> {
        let construct = primitive.as_str();
        let atom = self.resolve_values(&[value])?.remove(0);
        let aval = atom.aval();
        if aval.shape != slice_aval.shape {
            return Err(TraceError::IndexDomain {
                construct,
                detail: format!(
                    "expected value of shape {} for the indexed slice, got {}",
                    slice_aval.shape, aval.shape
                ),
            });
        }
        if aval.dtype == slice_aval.dtype && !aval.weak_type {
            return Ok(atom);
        }
        if !aval.weak_type {
            return Err(TraceError::InvalidArgument {
                construct,
                detail: format!(
                    "value of dtype {} cannot be stored in a reference of dtype {}",
                    aval.dtype, slice_aval.dtype
                ),
            });
        }
        self.top()?.emitter.convert(&atom, slice_aval.dtype)
    }

    /// Read `cell[indices...]`.
    pub fn ref_get(&mut self, cell: &Tracer, indices: &[&Tracer]) -> Result<Tracer, TraceError> {
        let (ref_atom, index_atoms, slice_aval) = self.ref_operands(Primitive::RefGet, cell, indices)?;
        let mut inputs = vec![ref_atom];
        inputs.extend(index_atoms);
        let mut outs = self.bind_control(
            Primitive::RefGet,
            inputs,
            BTreeMap::new(),
            Vec::new(),
            vec![slice_aval],
        )?;
        Ok(outs.remove(0))
    }

    /// Write `value` into `cell[indices...]`, returning the previous slice.
    pub fn ref_swap(
        &mut self,
        cell: &Tracer,
        indices: &[&Tracer],
        value: &Tracer,
    ) -> Result<Tracer, TraceError> {
        let (ref_atom, index_atoms, slice_aval) =
            self.ref_operands(Primitive::RefSwap, cell, indices)?;
        let value = self.ref_value(Primitive::RefSwap, &slice_aval, value)?;
        let mut inputs = vec![ref_atom, value];
        inputs.extend(index_atoms);
        let mut outs = self.bind_control(
            Primitive::RefSwap,
            inputs,
            BTreeMap::new(),
            Vec::new(),
            vec![slice_aval],
        )?;
        Ok(outs.remove(0))
    }

    /// Write `value` into `cell[indices...]`.
    pub fn ref_set(
        &mut self,
        cell: &Tracer,
        indices: &[&Tracer],
        value: &Tracer,
    ) -> Result<(), TraceError> {
        self.ref_swap(cell, indices, value).map(|_| ())
    }

    /// Accumulate `value` into `cell[indices...]`.
    pub fn ref_add(
        &mut self,
        cell: &Tracer,
        indices: &[&Tracer],
        value: &Tracer,
    ) -> Result<(), TraceError> {
        let (ref_atom, index_atoms, slice_aval) =
            self.ref_operands(Primitive::RefAddUpdate, cell, indices)?;
        let value = self.ref_value(Primitive::RefAddUpdate, &slice_aval, value)?;
        let mut inputs = vec![ref_atom, value];
        inputs.extend(index_atoms);
        self.bind_control(
            Primitive::RefAddUpdate,
            inputs,
            BTreeMap::new(),
            Vec::new(),
            Vec::new(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval_closed_jaxpr;
    use fj_core::Shape;

    fn scalar_f64() -> Tree<AbstractValue> {
        Tree::leaf(AbstractValue::scalar(DType::F64))
    }

    #[test]
    fn trace_and_evaluate_simple_function() {
        let mut cx = TraceCtx::new();
        let traced = cx
            .trace_fn(scalar_f64(), |cx, x| {
                let x = x.into_leaf()?;
                let s = cx.sin(&x)?;
                let y = cx.mul(&s, &Tracer::f64(2.0))?;
                Ok(Tree::leaf(y))
            })
            .expect("trace");
        assert_eq!(traced.out_avals(), vec![AbstractValue::scalar(DType::F64)]);
        assert_eq!(cx.depth(), 0);
        let closed = traced.into_closed().expect("closed");
        let out = eval_closed_jaxpr(&closed, &[Value::scalar_f64(0.3)]).expect("eval");
        assert_eq!(out[0].as_f64_scalar(), Some(0.3_f64.sin() * 2.0));
    }

    #[test]
    fn outer_tracers_are_lifted_as_constants() {
        let mut cx = TraceCtx::new();
        let mut inner_consts = Vec::new();
        cx.trace_fn(scalar_f64(), |cx, x| {
            let x = x.into_leaf()?;
            let inner = cx.trace_fn(scalar_f64(), |cx, y| {
                let y = y.into_leaf()?;
                let a = cx.add(&x, &y)?;
                let b = cx.mul(&x, &a)?;
                Ok(Tree::leaf(b))
            })?;
            inner_consts = inner.consts.clone();
            Ok(Tree::leaf(x))
        })
        .expect("trace");
        assert_eq!(inner_consts.len(), 1, "x is captured once");
        assert!(matches!(inner_consts[0], ConstOperand::Tracer(_)));
    }

    #[test]
    fn escaped_tracer_is_stale() {
        let mut cx = TraceCtx::new();
        let mut leaked = None;
        cx.trace_fn(scalar_f64(), |cx, x| {
            let x = x.into_leaf()?;
            let y = cx.sin(&x)?;
            leaked = Some(y.clone());
            Ok(Tree::leaf(y))
        })
        .expect("trace");
        let leaked = leaked.expect("captured");
        let err = cx
            .trace_fn(scalar_f64(), |cx, x| {
                let x = x.into_leaf()?;
                let z = cx.add(&x, &leaked)?;
                Ok(Tree::leaf(z))
            })
            .expect_err("stale");
        assert!(matches!(err, TraceError::StaleValue { .. }));
        assert_eq!(cx.depth(), 0, "frames are popped on error");
    }

    #[test]
    fn ref_ops_require_stateful_frame() {
        let mut cx = TraceCtx::new();
        let err = cx
            .trace_fn(scalar_f64(), |cx, x| {
                let x = x.into_leaf()?;
                let y = cx.ref_get(&x, &[])?;
                Ok(Tree::leaf(y))
            })
            .expect_err("no effects");
        assert_eq!(
            err,
            TraceError::StateEffect {
                primitive: Primitive::RefGet
            }
        );
    }

    #[test]
    fn ref_ops_check_operands() {
        let vec3 = AbstractValue::vector(DType::F64, 3);
        let args = Tree::from_leaves(vec![vec3.clone(), vec3]);
        let mut cx = TraceCtx::new();

        let not_ref = cx
            .trace_stateful_fn(args.clone(), &[true, false], |cx, args| {
                let leaves = args.flatten().0;
                cx.ref_get(&leaves[1], &[])?;
                Ok(Tree::unit())
            })
            .expect_err("not a ref");
        assert!(matches!(not_ref, TraceError::NotARef { .. }));

        let out_of_range = cx
            .trace_stateful_fn(args.clone(), &[true, false], |cx, args| {
                let leaves = args.flatten().0;
                cx.ref_get(&leaves[0], &[&Tracer::i64(3)])?;
                Ok(Tree::unit())
            })
            .expect_err("index out of range");
        assert!(out_of_range.to_string().contains("out of bounds"));

        let bad_shape = cx
            .trace_stateful_fn(args.clone(), &[true, false], |cx, args| {
                let leaves = args.flatten().0;
                cx.ref_set(&leaves[0], &[&Tracer::i64(0)], &leaves[1])?;
                Ok(Tree::unit())
            })
            .expect_err("shape mismatch");
        let TraceError::IndexDomain { detail, .. } = bad_shape else {
            panic!("expected IndexDomain");
        };
        assert!(detail.contains("[]") && detail.contains("[3]"));

        let too_many = cx
            .trace_stateful_fn(args, &[true, false], |cx, args| {
                let leaves = args.flatten().0;
                cx.ref_get(&leaves[0], &[&Tracer::i64(0), &Tracer::i64(0)])?;
                Ok(Tree::unit())
            })
            .expect_err("too many indices");
        assert!(too_many.to_string().contains("too many indices"));
    }

    #[test]
    fn refs_cannot_be_captured_by_nested_traces() {
        let mut cx = TraceCtx::new();
        let err = cx
            .trace_stateful_fn(scalar_f64(), &[true], |cx, r| {
                let r = r.into_leaf()?;
                cx.trace_fn(scalar_f64(), |cx, _| {
                    let v = cx.ref_get(&r, &[])?;
                    Ok(Tree::leaf(v))
                })?;
                Ok(Tree::unit())
            })
            .expect_err("escape");
        assert!(matches!(
            err,
            TraceError::RefEscape | TraceError::StateEffect { .. }
        ));
    }

    #[test]
    fn weak_values_adopt_the_ref_dtype() {
        let mut cx = TraceCtx::new();
        let traced = cx
            .trace_stateful_fn(
                Tree::leaf(AbstractValue::scalar(DType::F32)),
                &[true],
                |cx, r| {
                    let r = r.into_leaf()?;
                    cx.ref_add(&r, &[], &Tracer::f64(1.5))?;
                    Ok(Tree::unit())
                },
            )
            .expect("trace");
        assert_eq!(traced.jaxpr.count_primitive(Primitive::ConvertElementType), 1);
        assert_eq!(traced.jaxpr.count_primitive(Primitive::RefAddUpdate), 1);
    }

    #[test]
    fn cache_reuses_traces_per_signature() {
        let cache: SharedTraceCache = Rc::new(RefCell::new(TraceCache::new()));
        let mut cx = TraceCtx::with_cache(cache.clone());
        let mut calls = 0;
        for _ in 0..3 {
            cx.trace_cached(7, &[], scalar_f64(), None, |cx, x| {
                calls += 1;
                let x = x.into_leaf()?;
                Ok(Tree::leaf(cx.exp(&x)?))
            })
            .expect("trace");
        }
        cx.trace_cached(
            7,
            &[],
            Tree::leaf(AbstractValue::new(DType::F64, Shape::vector(2))),
            None,
            |cx, x| {
                calls += 1;
                let x = x.into_leaf()?;
                Ok(Tree::leaf(cx.exp(&x)?))
            },
        )
        .expect("trace");
        assert_eq!(calls, 2);
        let stats = cache.borrow().stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn index_axis0_reads_a_row() {
        let mut cx = TraceCtx::new();
        let traced = cx
            .trace_fn(
                Tree::from_leaves(vec![
                    AbstractValue::new(DType::F64, Shape::new(vec![3, 2])),
                    AbstractValue::scalar(DType::I32),
                ]),
                |cx, args| {
                    let leaves = args.flatten().0;
                    let row = cx.index_axis0(&leaves[0], &leaves[1])?;
                    Ok(Tree::leaf(row))
                },
            )
            .expect("trace");
        let closed = traced.into_closed().expect("closed");
        let m = Value::from_f64s(DType::F64, Shape::new(vec![3, 2]), &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0])
            .expect("m");
        let out = eval_closed_jaxpr(&closed, &[m, Value::scalar_i32(1)]).expect("eval");
        assert_eq!(out[0].to_f64_vec(), Some(vec![2.0, 3.0]));
    }
}
