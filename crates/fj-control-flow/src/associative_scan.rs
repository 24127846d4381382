#![forbid(unsafe_code)]

//! Parallel prefix scan by recursive odd/even combination.
//!
//! Each level combines adjacent pairs, scans the half-length result, and
//! fixes up the even positions, so the operator is applied O(n) times at
//! depth O(log n). The operator is called directly on whole slices; it
//! must be associative but need not be commutative.

use fj_core::{DType, Literal, Tree, TreeDef, TypeConsistencyError};
use fj_interpreters::{TraceCtx, TraceError, Tracer};
use tracing::debug;

use crate::callable::Callable;

/// Inclusive prefix reduction of `elems` along `axis` under `op`. With
/// `reverse`, position `i` holds the reduction of elements `i..` instead,
/// still combined in index order.
pub fn associative_scan(
    cx: &mut TraceCtx,
    op: &Callable,
    elems: Tree<Tracer>,
    axis: isize,
    reverse: bool,
) -> Result<Tree<Tracer>, TraceError> {
    op.require_function("associative_scan", "fn")?;
    let (leaves, tree) = elems.flatten();
    let Some(first) = leaves.first() else {
        return Err(TraceError::InvalidArgument {
            construct: "associative_scan",
            detail: "elems must contain at least one array".to_owned(),
        });
    };
    let axis = normalize_axis(axis, first.aval().rank())?;
    let extents = leaves
        .iter()
        .map(|leaf| leaf.aval().shape.dims.get(axis).copied())
        .collect::<Vec<_>>();
    if extents.iter().any(|extent| *extent != extents[0]) {
        let shapes: Vec<String> = leaves.iter().map(|leaf| leaf.aval().to_string()).collect();
        return Err(TraceError::InvalidArgument {
            construct: "associative_scan",
            detail: format!(
                "array inputs to associative_scan must have the same extent along axis {axis}, got [{}]",
                shapes.join(", ")
            ),
        });
    }
    debug!(
        op = op.name(),
        axis,
        reverse,
        leaves = leaves.len(),
        length = extents[0].unwrap_or(0),
        "tracing associative_scan"
    );

    let scanner = PrefixScan {
        op,
        tree,
        axis,
        reverse,
    };
    let leaves = if reverse {
        scanner.rev_all(cx, &leaves)?
    } else {
        leaves
    };
    let mut out = scanner.scan(cx, leaves)?;
    if reverse {
        out = scanner.rev_all(cx, &out)?;
    }
    Ok(scanner.tree.unflatten(out)?)
}

fn normalize_axis(axis: isize, rank: usize) -> Result<usize, TraceError> {
    let rank_i = rank as isize;
    let normalized = if axis < 0 { axis + rank_i } else { axis };
    if (0..rank_i).contains(&normalized) {
        Ok(normalized as usize)
    } else {
        Err(TraceError::InvalidArgument {
            construct: "associative_scan",
            detail: format!("axis {axis} is out of bounds for array of rank {rank}"),
        })
    }
}

struct PrefixScan<'a> {
    op: &'a Callable,
    tree: TreeDef,
    axis: usize,
    reverse: bool,
}

impl PrefixScan<'_> {
    fn scan(&self, cx: &mut TraceCtx, elems: Vec<Tracer>) -> Result<Vec<Tracer>, TraceError> {
        let n = elems[0].aval().shape.dims[self.axis] as usize;
        if n < 2 {
            return Ok(elems);
        }
        let evens = self.slice_all(cx, &elems, 0, n - 1, 2)?;
        let odds = self.slice_all(cx, &elems, 1, n, 2)?;
        let reduced = self.combine(cx, evens, odds)?;
        let odd_out = self.scan(cx, reduced)?;

        let tail = self.slice_all(cx, &elems, 2, n, 2)?;
        let prefix = if n % 2 == 0 {
            let m = odd_out[0].aval().shape.dims[self.axis] as usize;
            self.slice_all(cx, &odd_out, 0, m - 1, 1)?
        } else {
            odd_out.clone()
        };
        let even_rest = self.combine(cx, prefix, tail)?;
        let heads = self.slice_all(cx, &elems, 0, 1, 1)?;
        let even_out = heads
            .iter()
            .zip(&even_rest)
            .map(|(head, rest)| cx.concatenate(&[head, rest], self.axis))
            .collect::<Result<Vec<_>, _>>()?;

        even_out
            .iter()
            .zip(&odd_out)
            .map(|(even, odd)| interleave(cx, even, odd, self.axis))
            .collect()
    }

    fn combine(
        &self,
        cx: &mut TraceCtx,
        a: Vec<Tracer>,
        b: Vec<Tracer>,
    ) -> Result<Vec<Tracer>, TraceError> {
        let (a, b) = if self.reverse { (b, a) } else { (a, b) };
        let args = Tree::pair(self.tree.unflatten(a)?, self.tree.unflatten(b)?);
        let out = self.op.call(cx, args)?;
        let out_tree = out.treedef();
        if out_tree != self.tree {
            return Err(TypeConsistencyError::StructureMismatch {
                what: "associative_scan fn output and elems".to_owned(),
                left: out_tree,
                right: self.tree.clone(),
            }
            .into());
        }
        Ok(out.flatten().0)
    }

    fn slice_all(
        &self,
        cx: &mut TraceCtx,
        xs: &[Tracer],
        start: usize,
        limit: usize,
        stride: usize,
    ) -> Result<Vec<Tracer>, TraceError> {
        xs.iter()
            .map(|x| {
                let dims = x.aval().shape.dims;
                let mut starts = vec![0; dims.len()];
                let mut limits: Vec<usize> = dims.iter().map(|&d| d as usize).collect();
                let mut strides = vec![1; dims.len()];
                starts[self.axis] = start;
                limits[self.axis] = limit;
                strides[self.axis] = stride;
                cx.slice(x, &starts, &limits, &strides)
            })
            .collect()
    }

    fn rev_all(&self, cx: &mut TraceCtx, xs: &[Tracer]) -> Result<Vec<Tracer>, TraceError> {
        xs.iter().map(|x| cx.rev(x, &[self.axis])).collect()
    }
}

/// Merge `a` into the even positions and `b` into the odd positions along
/// `axis`. `a` has the same extent as `b` or one more.
fn interleave(cx: &mut TraceCtx, a: &Tracer, b: &Tracer, axis: usize) -> Result<Tracer, TraceError> {
    let aval = a.aval();
    let rank = aval.rank();
    let same_length = aval.shape.dims[axis] == b.aval().shape.dims[axis];
    let zero = Tracer::literal(Literal::zero(aval.dtype));
    let mut low = vec![0; rank];
    let mut high = vec![0; rank];
    let mut interior = vec![0; rank];
    interior[axis] = 1;
    high[axis] = usize::from(same_length);
    let a = cx.pad(a, &zero, &low, &high, &interior)?;
    low[axis] = 1;
    high[axis] = usize::from(!same_length);
    let b = cx.pad(b, &zero, &low, &high, &interior)?;
    if aval.dtype == DType::Bool {
        cx.or(&a, &b)
    } else {
        cx.add(&a, &b)
    }
}
