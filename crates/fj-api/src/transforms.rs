#![forbid(unsafe_code)]

//! Transform entry points over [`Callable`]s and value trees.
//!
//! Each entry point traces the function at the abstract types of its
//! arguments, transforms the traced graph and evaluates the result.
//! Reverse mode is linearize followed by transpose: the forward graph is
//! differentiated, partially evaluated with the tangents unknown, and the
//! unknown half is transposed.

use std::cell::RefCell;
use std::rc::Rc;

use fj_cache::TraceCache;
use fj_control_flow::Callable;
use fj_core::{AbstractValue, ClosedJaxpr, Jaxpr, Tree, TreeDef, Value, check_tree_types};
use fj_interpreters::{
    CheckpointPolicy, ConstOperand, EvalConfig, PartialEvalResult, SharedTraceCache, TraceCtx,
    TraceError, eval_jaxpr_with_config, jvp_jaxpr, partial_eval_jaxpr, transpose_jaxpr,
};
use tracing::debug;

use crate::errors::ApiError;

/// A function traced at concrete argument types. Its graph takes the
/// captured constants followed by the flattened arguments.
#[derive(Debug, Clone)]
struct Staged {
    jaxpr: Jaxpr,
    consts: Vec<Value>,
    out_tree: TreeDef,
}

impl Staged {
    fn eval(&self, args: Vec<Value>, config: &EvalConfig) -> Result<Vec<Value>, ApiError> {
        let mut inputs = self.consts.clone();
        inputs.extend(args);
        Ok(eval_jaxpr_with_config(&self.jaxpr, &[], &inputs, config)?)
    }

    fn out_avals(&self) -> Vec<AbstractValue> {
        self.jaxpr.out_avals()
    }
}

fn new_cache() -> SharedTraceCache {
    Rc::new(RefCell::new(TraceCache::new()))
}

fn context(cache: Option<&SharedTraceCache>) -> TraceCtx {
    match cache {
        Some(cache) => TraceCtx::with_cache(Rc::clone(cache)),
        None => TraceCtx::new(),
    }
}

fn arg_avals(args: &Tree<Value>) -> Tree<AbstractValue> {
    args.clone().map(|value| value.aval())
}

fn stage(f: &Callable, args: &Tree<Value>, cache: Option<&SharedTraceCache>) -> Result<Staged, ApiError> {
    let mut cx = context(cache);
    let traced = f.trace(&mut cx, arg_avals(args), &[])?;
    let consts = traced
        .consts
        .iter()
        .map(|operand| match operand {
            ConstOperand::Value(value) => Ok(value.clone()),
            ConstOperand::Tracer(tracer) => Err(TraceError::StaleValue {
                trace_id: tracer.trace_id().map_or(0, |id| id.0),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    debug!(
        f = f.name(),
        consts = consts.len(),
        equations = traced.jaxpr.equations.len(),
        "staged function"
    );
    Ok(Staged {
        jaxpr: traced.jaxpr,
        consts,
        out_tree: traced.out_tree,
    })
}

/// Trace `f` at the types of `args` and close over its constants.
pub fn make_jaxpr(f: &Callable, args: &Tree<Value>) -> Result<ClosedJaxpr, ApiError> {
    let mut cx = TraceCtx::new();
    let traced = f.trace(&mut cx, arg_avals(args), &[])?;
    Ok(traced.into_closed()?)
}

/// Forward-mode derivative: the outputs of `f` at `primals` and their
/// directional derivatives along `tangents`.
pub fn jvp(
    f: &Callable,
    primals: &Tree<Value>,
    tangents: &Tree<Value>,
) -> Result<(Tree<Value>, Tree<Value>), ApiError> {
    let (primal_leaves, primal_tree) = primals.clone().flatten();
    let (tangent_leaves, tangent_tree) = tangents.clone().flatten();
    let primal_avals: Vec<AbstractValue> = primal_leaves.iter().map(Value::aval).collect();
    let tangent_avals: Vec<AbstractValue> = tangent_leaves.iter().map(Value::aval).collect();
    check_tree_types(
        "primal and tangent arguments",
        &primal_tree,
        &primal_avals,
        &tangent_tree,
        &tangent_avals,
    )
    .map_err(TraceError::from)?;

    let staged = stage(f, primals, None)?;
    let differentiable = differentiable(&primal_avals);
    let (graph, _) = jvp_graph(&staged, &differentiable)?;
    let mut inputs = staged.consts.clone();
    inputs.extend(primal_leaves);
    inputs.extend(
        tangent_leaves
            .into_iter()
            .zip(&differentiable)
            .filter(|(_, keep)| **keep)
            .map(|(tangent, _)| tangent),
    );
    let mut outs = eval_jaxpr_with_config(&graph, &[], &inputs, &EvalConfig::from_env())?;
    let tangents_out = outs.split_off(staged.out_tree.num_leaves());
    debug!(f = f.name(), "jvp evaluated");
    Ok((
        staged.out_tree.unflatten(outs)?,
        staged.out_tree.unflatten(tangents_out)?,
    ))
}

fn differentiable(avals: &[AbstractValue]) -> Vec<bool> {
    avals.iter().map(|aval| aval.dtype.is_floating()).collect()
}

/// JVP of the staged graph: `consts ++ primals ++ float tangents` to
/// `primal outs ++ tangent outs`.
fn jvp_graph(staged: &Staged, differentiable: &[bool]) -> Result<(Jaxpr, Vec<bool>), ApiError> {
    let mut nonzeros = vec![false; staged.consts.len()];
    nonzeros.extend_from_slice(differentiable);
    let instantiate = vec![true; staged.jaxpr.outvars.len()];
    Ok(jvp_jaxpr(&staged.jaxpr, &nonzeros, &instantiate)?)
}

/// The JVP graph split into a known half (primal outputs and residuals)
/// and an unknown half linear in the tangents.
struct LinearSplit {
    split: PartialEvalResult,
    differentiable: Vec<bool>,
    num_outputs: usize,
}

impl LinearSplit {
    fn new(staged: &Staged, in_avals: &[AbstractValue], policy: &CheckpointPolicy) -> Result<Self, ApiError> {
        let differentiable = differentiable(in_avals);
        let (graph, _) = jvp_graph(staged, &differentiable)?;
        let num_known = staged.consts.len() + in_avals.len();
        let num_tangents = differentiable.iter().filter(|&&d| d).count();
        let num_outputs = staged.jaxpr.outvars.len();
        let mut unknowns = vec![false; num_known];
        unknowns.extend(std::iter::repeat_n(true, num_tangents));
        let mut instantiate = vec![false; num_outputs];
        instantiate.extend(std::iter::repeat_n(true, num_outputs));
        let split = partial_eval_jaxpr(&graph, &unknowns, &instantiate, policy)?;
        let (primal_flags, tangent_flags) = split.out_unknowns.split_at(num_outputs);
        if primal_flags.iter().any(|&uk| uk) || tangent_flags.iter().any(|&uk| !uk) {
            return Err(TraceError::InvalidArgument {
                construct: "linearize",
                detail: "primal outputs must be known and tangent outputs unknown".to_owned(),
            }
            .into());
        }
        debug!(
            residuals = split.num_residuals(),
            known_equations = split.jaxpr_known.equations.len(),
            linear_equations = split.jaxpr_unknown.equations.len(),
            "linearized"
        );
        Ok(Self {
            split,
            differentiable,
            num_outputs,
        })
    }

    /// Run the known half: primal outputs and residual values.
    fn eval_known(
        &self,
        staged: &Staged,
        primals: Vec<Value>,
        config: &EvalConfig,
    ) -> Result<(Vec<Value>, Vec<Value>), ApiError> {
        let mut inputs = staged.consts.clone();
        inputs.extend(primals);
        let mut outs = eval_jaxpr_with_config(&self.split.jaxpr_known, &[], &inputs, config)?;
        let residuals = outs.split_off(self.num_outputs);
        Ok((outs, residuals))
    }
}

/// The linear map `tangents -> output tangents` of a function at a point.
#[derive(Debug, Clone)]
pub struct Linearized {
    jaxpr: Jaxpr,
    residuals: Vec<Value>,
    in_tree: TreeDef,
    in_avals: Vec<AbstractValue>,
    differentiable: Vec<bool>,
    out_tree: TreeDef,
}

impl Linearized {
    /// Graph from `residuals ++ tangents` to output tangents.
    #[must_use]
    pub fn jaxpr(&self) -> &Jaxpr {
        &self.jaxpr
    }

    #[must_use]
    pub fn num_residuals(&self) -> usize {
        self.residuals.len()
    }

    pub fn call(&self, tangents: &Tree<Value>) -> Result<Tree<Value>, ApiError> {
        let (leaves, tree) = tangents.clone().flatten();
        let avals: Vec<AbstractValue> = leaves.iter().map(Value::aval).collect();
        check_tree_types("tangent and primal arguments", &tree, &avals, &self.in_tree, &self.in_avals)
            .map_err(TraceError::from)?;
        let mut inputs = self.residuals.clone();
        inputs.extend(
            leaves
                .into_iter()
                .zip(&self.differentiable)
                .filter(|(_, keep)| **keep)
                .map(|(tangent, _)| tangent),
        );
        let outs = eval_jaxpr_with_config(&self.jaxpr, &[], &inputs, &EvalConfig::from_env())?;
        Ok(self.out_tree.unflatten(outs)?)
    }
}

/// Outputs of `f` at `primals` and its linearization there.
pub fn linearize(f: &Callable, primals: &Tree<Value>) -> Result<(Tree<Value>, Linearized), ApiError> {
    let staged = stage(f, primals, None)?;
    let (leaves, in_tree) = primals.clone().flatten();
    let in_avals: Vec<AbstractValue> = leaves.iter().map(Value::aval).collect();
    let linear = LinearSplit::new(&staged, &in_avals, &CheckpointPolicy::default())?;
    let (outs, residuals) = linear.eval_known(&staged, leaves, &EvalConfig::from_env())?;
    let LinearSplit {
        split,
        differentiable,
        ..
    } = linear;
    Ok((
        staged.out_tree.unflatten(outs)?,
        Linearized {
            jaxpr: split.jaxpr_unknown,
            residuals,
            in_tree,
            in_avals,
            differentiable,
            out_tree: staged.out_tree,
        },
    ))
}

/// The pullback `output cotangents -> input cotangents` of a function at a
/// point.
#[derive(Debug, Clone)]
pub struct VjpFn {
    transposed: Jaxpr,
    residuals: Vec<Value>,
    in_tree: TreeDef,
    in_avals: Vec<AbstractValue>,
    differentiable: Vec<bool>,
    out_tree: TreeDef,
    out_avals: Vec<AbstractValue>,
    config: EvalConfig,
}

impl VjpFn {
    #[must_use]
    pub fn num_residuals(&self) -> usize {
        self.residuals.len()
    }

    pub fn call(&self, cotangents: &Tree<Value>) -> Result<Tree<Value>, ApiError> {
        let (leaves, tree) = cotangents.clone().flatten();
        let avals: Vec<AbstractValue> = leaves.iter().map(Value::aval).collect();
        check_tree_types("cotangent and primal outputs", &tree, &avals, &self.out_tree, &self.out_avals)
            .map_err(TraceError::from)?;
        let mut inputs = self.residuals.clone();
        inputs.extend(leaves);
        let mut cts = eval_jaxpr_with_config(&self.transposed, &[], &inputs, &self.config)?.into_iter();
        let mut out = Vec::with_capacity(self.in_avals.len());
        for (aval, &differentiable) in self.in_avals.iter().zip(&self.differentiable) {
            if !differentiable {
                out.push(Value::zeros(aval)?);
                continue;
            }
            let ct = cts.next().ok_or_else(|| TraceError::InvalidArgument {
                construct: "vjp",
                detail: "transposed graph produced too few cotangents".to_owned(),
            })?;
            out.push(ct);
        }
        Ok(self.in_tree.unflatten(out)?)
    }
}

fn build_vjp(
    staged: &Staged,
    primals: &Tree<Value>,
    policy: &CheckpointPolicy,
    config: &EvalConfig,
) -> Result<(Vec<Value>, VjpFn), ApiError> {
    let (leaves, in_tree) = primals.clone().flatten();
    let in_avals: Vec<AbstractValue> = leaves.iter().map(Value::aval).collect();
    let linear = LinearSplit::new(staged, &in_avals, policy)?;
    // Transpose before any evaluation so unsupported constructs fail eagerly.
    let mut mask = vec![false; linear.split.num_residuals()];
    mask.extend(std::iter::repeat_n(true, linear.split.jaxpr_unknown.invars.len() - mask.len()));
    let transposed = transpose_jaxpr(&linear.split.jaxpr_unknown, &mask)?;
    let (outs, residuals) = linear.eval_known(staged, leaves, config)?;
    Ok((
        outs,
        VjpFn {
            transposed,
            residuals,
            in_tree,
            in_avals,
            differentiable: linear.differentiable,
            out_tree: staged.out_tree.clone(),
            out_avals: staged.out_avals(),
            config: config.clone(),
        },
    ))
}

/// Outputs of `f` at `primals` and its pullback there.
pub fn vjp(f: &Callable, primals: &Tree<Value>) -> Result<(Tree<Value>, VjpFn), ApiError> {
    let staged = stage(f, primals, None)?;
    let (outs, pullback) = build_vjp(&staged, primals, &CheckpointPolicy::default(), &EvalConfig::from_env())?;
    Ok((staged.out_tree.unflatten(outs)?, pullback))
}

#[derive(Debug, Clone)]
pub struct JitWrapped {
    f: Callable,
    cache: SharedTraceCache,
    config: EvalConfig,
}

#[derive(Debug, Clone)]
pub struct GradWrapped {
    f: Callable,
    cache: SharedTraceCache,
    config: EvalConfig,
    checkpoint: CheckpointPolicy,
}

#[derive(Debug, Clone)]
pub struct ValueAndGradWrapped {
    f: Callable,
    cache: SharedTraceCache,
    config: EvalConfig,
    checkpoint: CheckpointPolicy,
}

#[derive(Debug, Clone)]
pub struct VmapWrapped {
    f: Callable,
    cache: SharedTraceCache,
    config: EvalConfig,
    in_batched: Option<Vec<bool>>,
}

#[must_use]
pub fn jit(f: Callable) -> JitWrapped {
    JitWrapped {
        f,
        cache: new_cache(),
        config: EvalConfig::from_env(),
    }
}

#[must_use]
pub fn grad(f: Callable) -> GradWrapped {
    GradWrapped {
        f,
        cache: new_cache(),
        config: EvalConfig::from_env(),
        checkpoint: CheckpointPolicy::default(),
    }
}

#[must_use]
pub fn value_and_grad(f: Callable) -> ValueAndGradWrapped {
    ValueAndGradWrapped {
        f,
        cache: new_cache(),
        config: EvalConfig::from_env(),
        checkpoint: CheckpointPolicy::default(),
    }
}

#[must_use]
pub fn vmap(f: Callable) -> VmapWrapped {
    VmapWrapped {
        f,
        cache: new_cache(),
        config: EvalConfig::from_env(),
        in_batched: None,
    }
}

impl JitWrapped {
    /// Share a trace cache with other wrappers.
    #[must_use]
    pub fn with_cache(mut self, cache: SharedTraceCache) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: EvalConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn cache(&self) -> &SharedTraceCache {
        &self.cache
    }

    pub fn call(&self, args: &Tree<Value>) -> Result<Tree<Value>, ApiError> {
        let staged = stage(&self.f, args, Some(&self.cache))?;
        let outs = staged.eval(args.clone().flatten().0, &self.config)?;
        Ok(staged.out_tree.unflatten(outs)?)
    }
}

/// Value and gradient of a scalar function, shared by the two wrappers.
fn value_and_grad_impl(
    f: &Callable,
    args: &Tree<Value>,
    cache: &SharedTraceCache,
    config: &EvalConfig,
    checkpoint: &CheckpointPolicy,
) -> Result<(Value, Tree<Value>), ApiError> {
    let staged = stage(f, args, Some(cache))?;
    let out_avals = staged.out_avals();
    let scalar = match (&staged.out_tree, out_avals.as_slice()) {
        (TreeDef::Leaf, [aval]) if aval.is_scalar() && aval.dtype.is_floating() => aval.clone(),
        _ => {
            let types: Vec<String> = out_avals.iter().map(ToString::to_string).collect();
            return Err(ApiError::GradRequiresScalar {
                detail: format!("[{}] with structure {}", types.join(", "), staged.out_tree),
            });
        }
    };
    let (mut outs, pullback) = build_vjp(&staged, args, checkpoint, config)?;
    let seed = Value::ones(&scalar)?;
    let gradient = pullback.call(&Tree::leaf(seed))?;
    let value = outs.pop().ok_or(ApiError::GradRequiresScalar {
        detail: "no outputs".to_owned(),
    })?;
    debug!(f = f.name(), residuals = pullback.num_residuals(), "gradient evaluated");
    Ok((value, gradient))
}

impl GradWrapped {
    #[must_use]
    pub fn with_cache(mut self, cache: SharedTraceCache) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: EvalConfig) -> Self {
        self.config = config;
        self
    }

    /// Which forward intermediates are saved for the backward pass.
    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: CheckpointPolicy) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn call(&self, args: &Tree<Value>) -> Result<Tree<Value>, ApiError> {
        value_and_grad_impl(&self.f, args, &self.cache, &self.config, &self.checkpoint)
            .map(|(_, gradient)| gradient)
    }
}

impl ValueAndGradWrapped {
    #[must_use]
    pub fn with_cache(mut self, cache: SharedTraceCache) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: EvalConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: CheckpointPolicy) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn call(&self, args: &Tree<Value>) -> Result<(Value, Tree<Value>), ApiError> {
        value_and_grad_impl(&self.f, args, &self.cache, &self.config, &self.checkpoint)
    }
}

impl VmapWrapped {
    #[must_use]
    pub fn with_cache(mut self, cache: SharedTraceCache) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: EvalConfig) -> Self {
        self.config = config;
        self
    }

    /// Which argument leaves carry the mapped axis; the rest are shared.
    #[must_use]
    pub fn with_in_batched(mut self, in_batched: Vec<bool>) -> Self {
        self.in_batched = Some(in_batched);
        self
    }

    pub fn call(&self, args: &Tree<Value>) -> Result<Tree<Value>, ApiError> {
        let mut cx = context(Some(&self.cache));
        let traced = cx.trace_fn(arg_avals(args), |cx, args| {
            fj_control_flow::vmap(cx, &self.f, args, self.in_batched.as_deref())
        })?;
        let out_tree = traced.out_tree.clone();
        let closed = traced.into_closed()?;
        let outs = eval_jaxpr_with_config(&closed.jaxpr, &closed.consts, &args.clone().flatten().0, &self.config)?;
        Ok(out_tree.unflatten(outs)?)
    }
}
