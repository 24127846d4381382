//! Type consistency between two typed trees.
//!
//! Two trees are type-identical iff their `TreeDef`s are equal and every
//! pair of corresponding leaves is `compatible`. Failures come in two tiers:
//! a structure mismatch names both tree definitions, a leaf mismatch lists
//! every leaf position as identical or `DIFFERENT a vs. b`.

use crate::{AbstractValue, TreeDef};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafComparison {
    Identical(AbstractValue),
    Different(AbstractValue, AbstractValue),
}

impl std::fmt::Display for LeafComparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Identical(aval) => write!(f, "{aval}"),
            Self::Different(left, right) => write!(f, "DIFFERENT {left} vs. {right}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeConsistencyError {
    #[error("{what} must have same type structure, got {left} and {right}.")]
    StructureMismatch {
        what: String,
        left: TreeDef,
        right: TreeDef,
    },
    #[error("{what} must have identical types, got\n{}.", render_leaves(leaves))]
    LeafTypeMismatch {
        what: String,
        leaves: Vec<LeafComparison>,
    },
}

/// A lone leaf prints bare, several print as a parenthesized list.
fn render_leaves(leaves: &[LeafComparison]) -> String {
    if let [single] = leaves {
        return single.to_string();
    }
    let rendered: Vec<String> = leaves.iter().map(ToString::to_string).collect();
    format!("({})", rendered.join(", "))
}

impl TypeConsistencyError {
    /// Positions of the differing leaves, in flattened order.
    #[must_use]
    pub fn differing_positions(&self) -> Vec<usize> {
        match self {
            Self::StructureMismatch { .. } => Vec::new(),
            Self::LeafTypeMismatch { leaves, .. } => leaves
                .iter()
                .enumerate()
                .filter(|(_, leaf)| matches!(leaf, LeafComparison::Different(..)))
                .map(|(idx, _)| idx)
                .collect(),
        }
    }
}

pub fn check_tree_types(
    what: &str,
    left: &TreeDef,
    left_avals: &[AbstractValue],
    right: &TreeDef,
    right_avals: &[AbstractValue],
) -> Result<(), TypeConsistencyError> {
    if left != right || left_avals.len() != right_avals.len() {
        return Err(TypeConsistencyError::StructureMismatch {
            what: what.to_owned(),
            left: left.clone(),
            right: right.clone(),
        });
    }

    let leaves: Vec<LeafComparison> = left_avals
        .iter()
        .zip(right_avals)
        .map(|(l, r)| {
            if l.compatible(r) {
                LeafComparison::Identical(l.clone())
            } else {
                LeafComparison::Different(l.clone(), r.clone())
            }
        })
        .collect();

    if leaves
        .iter()
        .any(|leaf| matches!(leaf, LeafComparison::Different(..)))
    {
        return Err(TypeConsistencyError::LeafTypeMismatch {
            what: what.to_owned(),
            leaves,
        });
    }
    Ok(())
}
