#![forbid(unsafe_code)]

//! Functions handed to the control-flow constructs.
//!
//! A [`Callable`] is either a traceable Rust closure or a constant value
//! tree. Every closure gets a [`CallableId`] when it is created; clones
//! share it, and the trace cache keys on it. Two separately created
//! closures with identical bodies are different callables.

use fj_core::{AbstractValue, Tree, Value};
use fj_interpreters::{TraceCtx, TraceError, TracedJaxpr, Tracer};
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CALLABLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallableId(pub u64);

impl CallableId {
    fn fresh() -> Self {
        Self(NEXT_CALLABLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub type TraceBody = dyn Fn(&mut TraceCtx, Tree<Tracer>) -> Result<Tree<Tracer>, TraceError>;

#[derive(Clone)]
pub enum Callable {
    Function {
        id: CallableId,
        name: Rc<str>,
        body: Rc<TraceBody>,
    },
    /// A value tree standing where a function is expected. Conditional
    /// branches accept it as a function ignoring its operands; every other
    /// construct rejects it.
    Constant(Tree<Value>),
}

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Function { id, name, .. } => f
                .debug_struct("Function")
                .field("id", id)
                .field("name", name)
                .finish_non_exhaustive(),
            Self::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
        }
    }
}

impl Callable {
    pub fn new(
        name: &str,
        body: impl Fn(&mut TraceCtx, Tree<Tracer>) -> Result<Tree<Tracer>, TraceError> + 'static,
    ) -> Self {
        Self::Function {
            id: CallableId::fresh(),
            name: Rc::from(name),
            body: Rc::new(body),
        }
    }

    #[must_use]
    pub fn constant(value: Tree<Value>) -> Self {
        Self::Constant(value)
    }

    /// A function built around `inner` by a construct. It shares `inner`'s
    /// identity; `tag` keeps its cache entries apart from `inner`'s own.
    pub(crate) fn wrapping(
        inner: &Callable,
        tag: &str,
        body: impl Fn(&mut TraceCtx, Tree<Tracer>) -> Result<Tree<Tracer>, TraceError> + 'static,
    ) -> Self {
        let name = format!("{tag}({})", inner.name());
        match inner.id() {
            Some(id) => Self::Function {
                id,
                name: Rc::from(name.as_str()),
                body: Rc::new(body),
            },
            None => Self::new(&name, body),
        }
    }

    #[must_use]
    pub fn id(&self) -> Option<CallableId> {
        match self {
            Self::Function { id, .. } => Some(*id),
            Self::Constant(_) => None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Function { name, .. } => &**name,
            Self::Constant(_) => "<constant>",
        }
    }

    /// Fail with a callable-type error unless this is a function.
    pub fn require_function(&self, construct: &'static str, role: &str) -> Result<(), TraceError> {
        match self {
            Self::Function { .. } => Ok(()),
            Self::Constant(value) => Err(TraceError::CallableType {
                construct,
                detail: format!(
                    "{role} argument must be callable, got a value of structure {}",
                    value.treedef()
                ),
            }),
        }
    }

    /// Apply the function in the current frame.
    pub fn call(&self, cx: &mut TraceCtx, args: Tree<Tracer>) -> Result<Tree<Tracer>, TraceError> {
        match self {
            Self::Function { body, .. } => body(cx, args),
            Self::Constant(value) => value.clone().try_map(|leaf| cx.constant(leaf)),
        }
    }

    /// Trace the function over `in_avals` in a fresh frame, through the
    /// context's trace cache when one is installed. `extra` holds the
    /// static options that must discriminate cache entries.
    pub fn trace(
        &self,
        cx: &mut TraceCtx,
        in_avals: Tree<AbstractValue>,
        extra: &[String],
    ) -> Result<TracedJaxpr, TraceError> {
        self.trace_frame(cx, in_avals, None, extra)
    }

    /// Like [`Callable::trace`], with the arguments flagged in `ref_mask`
    /// bound as reference cells.
    pub fn trace_stateful(
        &self,
        cx: &mut TraceCtx,
        in_avals: Tree<AbstractValue>,
        ref_mask: &[bool],
        extra: &[String],
    ) -> Result<TracedJaxpr, TraceError> {
        self.trace_frame(cx, in_avals, Some(ref_mask), extra)
    }

    fn trace_frame(
        &self,
        cx: &mut TraceCtx,
        in_avals: Tree<AbstractValue>,
        ref_mask: Option<&[bool]>,
        extra: &[String],
    ) -> Result<TracedJaxpr, TraceError> {
        let Some(id) = self.id() else {
            return match ref_mask {
                Some(mask) => cx.trace_stateful_fn(in_avals, mask, |cx, args| self.call(cx, args)),
                None => cx.trace_fn(in_avals, |cx, args| self.call(cx, args)),
            };
        };
        let mut key_extra = Vec::with_capacity(extra.len() + 1);
        key_extra.push(format!("fn={}", self.name()));
        key_extra.extend_from_slice(extra);
        cx.trace_cached(id.0, &key_extra, in_avals, ref_mask, |cx, args| {
            self.call(cx, args)
        })
    }
}

impl From<Tree<Value>> for Callable {
    fn from(value: Tree<Value>) -> Self {
        Self::Constant(value)
    }
}
