//! Nested containers of leaves and their structure descriptors.
//!
//! A `Tree<T>` holds leaves in tuples and string-keyed maps; its `TreeDef`
//! records the container shape independent of the leaf values. Flattening
//! visits leaves depth-first, maps in key order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Tree<T> {
    Leaf(T),
    None,
    Tuple(Vec<Tree<T>>),
    Map(BTreeMap<String, Tree<T>>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TreeDef {
    Leaf,
    None,
    Tuple(Vec<TreeDef>),
    Map(Vec<(String, TreeDef)>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("tree structure expects {expected} leaves, got {actual}")]
    LeafCountMismatch { expected: usize, actual: usize },
    #[error("expected a single leaf, got {treedef}")]
    NotALeaf { treedef: TreeDef },
    #[error("expected a pair, got {treedef}")]
    NotAPair { treedef: TreeDef },
    #[error("expected a tuple, got {treedef}")]
    NotATuple { treedef: TreeDef },
}

impl<T> Tree<T> {
    #[must_use]
    pub fn leaf(value: T) -> Self {
        Self::Leaf(value)
    }

    #[must_use]
    pub fn tuple(items: Vec<Tree<T>>) -> Self {
        Self::Tuple(items)
    }

    #[must_use]
    pub fn pair(first: Tree<T>, second: Tree<T>) -> Self {
        Self::Tuple(vec![first, second])
    }

    /// The empty tuple.
    #[must_use]
    pub fn unit() -> Self {
        Self::Tuple(Vec::new())
    }

    /// Tuple of leaves.
    #[must_use]
    pub fn from_leaves(leaves: Vec<T>) -> Self {
        Self::Tuple(leaves.into_iter().map(Tree::Leaf).collect())
    }

    #[must_use]
    pub fn treedef(&self) -> TreeDef {
        match self {
            Self::Leaf(_) => TreeDef::Leaf,
            Self::None => TreeDef::None,
            Self::Tuple(items) => TreeDef::Tuple(items.iter().map(Tree::treedef).collect()),
            Self::Map(entries) => TreeDef::Map(
                entries
                    .iter()
                    .map(|(key, item)| (key.clone(), item.treedef()))
                    .collect(),
            ),
        }
    }

    #[must_use]
    pub fn leaves(&self) -> Vec<&T> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            Self::Leaf(value) => out.push(value),
            Self::None => {}
            Self::Tuple(items) => items.iter().for_each(|item| item.collect_refs(out)),
            Self::Map(entries) => entries.values().for_each(|item| item.collect_refs(out)),
        }
    }

    #[must_use]
    pub fn flatten(self) -> (Vec<T>, TreeDef) {
        let treedef = self.treedef();
        let mut leaves = Vec::new();
        self.collect_owned(&mut leaves);
        (leaves, treedef)
    }

    fn collect_owned(self, out: &mut Vec<T>) {
        match self {
            Self::Leaf(value) => out.push(value),
            Self::None => {}
            Self::Tuple(items) => items.into_iter().for_each(|item| item.collect_owned(out)),
            Self::Map(entries) => entries
                .into_values()
                .for_each(|item| item.collect_owned(out)),
        }
    }

    #[must_use]
    pub fn num_leaves(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::None => 0,
            Self::Tuple(items) => items.iter().map(Tree::num_leaves).sum(),
            Self::Map(entries) => entries.values().map(Tree::num_leaves).sum(),
        }
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Tree<U> {
        self.map_inner(&mut f)
    }

    fn map_inner<U>(self, f: &mut impl FnMut(T) -> U) -> Tree<U> {
        match self {
            Self::Leaf(value) => Tree::Leaf(f(value)),
            Self::None => Tree::None,
            Self::Tuple(items) => Tree::Tuple(items.into_iter().map(|item| item.map_inner(f)).collect()),
            Self::Map(entries) => Tree::Map(
                entries
                    .into_iter()
                    .map(|(key, item)| (key, item.map_inner(f)))
                    .collect(),
            ),
        }
    }

    pub fn try_map<U, E>(self, mut f: impl FnMut(T) -> Result<U, E>) -> Result<Tree<U>, E> {
        let (leaves, treedef) = self.flatten();
        let mapped = leaves.into_iter().map(&mut f).collect::<Result<Vec<_>, E>>()?;
        Ok(treedef.unflatten_unchecked(mapped))
    }

    pub fn into_leaf(self) -> Result<T, TreeError> {
        match self {
            Self::Leaf(value) => Ok(value),
            other => Err(TreeError::NotALeaf {
                treedef: other.treedef(),
            }),
        }
    }

    pub fn into_pair(self) -> Result<(Tree<T>, Tree<T>), TreeError> {
        match self {
            Self::Tuple(items) if items.len() == 2 => {
                let mut iter = items.into_iter();
                match (iter.next(), iter.next()) {
                    (Some(first), Some(second)) => Ok((first, second)),
                    _ => Err(TreeError::NotAPair {
                        treedef: TreeDef::Tuple(Vec::new()),
                    }),
                }
            }
            other => Err(TreeError::NotAPair {
                treedef: other.treedef(),
            }),
        }
    }

    pub fn into_tuple(self) -> Result<Vec<Tree<T>>, TreeError> {
        match self {
            Self::Tuple(items) => Ok(items),
            other => Err(TreeError::NotATuple {
                treedef: other.treedef(),
            }),
        }
    }
}

impl TreeDef {
    #[must_use]
    pub fn num_leaves(&self) -> usize {
        match self {
            Self::Leaf => 1,
            Self::None => 0,
            Self::Tuple(items) => items.iter().map(TreeDef::num_leaves).sum(),
            Self::Map(entries) => entries.iter().map(|(_, item)| item.num_leaves()).sum(),
        }
    }

    /// Tuple of `count` leaves.
    #[must_use]
    pub fn leaves(count: usize) -> Self {
        Self::Tuple(vec![Self::Leaf; count])
    }

    pub fn unflatten<T>(&self, leaves: Vec<T>) -> Result<Tree<T>, TreeError> {
        let expected = self.num_leaves();
        if expected != leaves.len() {
            return Err(TreeError::LeafCountMismatch {
                expected,
                actual: leaves.len(),
            });
        }
        Ok(self.unflatten_unchecked(leaves))
    }

    fn unflatten_unchecked<T>(&self, leaves: Vec<T>) -> Tree<T> {
        let mut iter = leaves.into_iter();
        self.build(&mut iter).unwrap_or(Tree::None)
    }

    fn build<T>(&self, leaves: &mut impl Iterator<Item = T>) -> Option<Tree<T>> {
        Some(match self {
            Self::Leaf => Tree::Leaf(leaves.next()?),
            Self::None => Tree::None,
            Self::Tuple(items) => Tree::Tuple(
                items
                    .iter()
                    .map(|item| item.build(leaves))
                    .collect::<Option<Vec<_>>>()?,
            ),
            Self::Map(entries) => Tree::Map(
                entries
                    .iter()
                    .map(|(key, item)| item.build(leaves).map(|built| (key.clone(), built)))
                    .collect::<Option<BTreeMap<_, _>>>()?,
            ),
        })
    }

    fn write_body(&self, out: &mut String) {
        match self {
            Self::Leaf => out.push('*'),
            Self::None => out.push_str("None"),
            Self::Tuple(items) => {
                out.push('(');
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        out.push_str(", ");
                    }
                    item.write_body(out);
                }
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Self::Map(entries) => {
                out.push('{');
                for (idx, (key, item)) in entries.iter().enumerate() {
                    if idx > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "'{key}': ");
                    item.write_body(out);
                }
                out.push('}');
            }
        }
    }
}

impl std::fmt::Display for TreeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut body = String::new();
        self.write_body(&mut body);
        write!(f, "TreeDef({body})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Tree<i32> {
        let mut map = BTreeMap::new();
        map.insert("b".to_owned(), Tree::leaf(3));
        map.insert("a".to_owned(), Tree::pair(Tree::leaf(1), Tree::leaf(2)));
        Tree::tuple(vec![Tree::leaf(0), Tree::Map(map), Tree::None])
    }

    #[test]
    fn flatten_visits_map_keys_in_order() {
        let (leaves, treedef) = sample().flatten();
        assert_eq!(leaves, vec![0, 1, 2, 3]);
        assert_eq!(treedef.num_leaves(), 4);
        let rebuilt = treedef.unflatten(leaves).expect("unflatten");
        assert_eq!(rebuilt, sample());
    }

    #[test]
    fn unflatten_rejects_wrong_leaf_count() {
        let treedef = sample().treedef();
        let err = treedef.unflatten(vec![1, 2]).expect_err("too few");
        assert_eq!(
            err,
            TreeError::LeafCountMismatch {
                expected: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn treedef_display_matches_container_shape() {
        assert_eq!(
            sample().treedef().to_string(),
            "TreeDef((*, {'a': (*, *), 'b': *}, None))"
        );
        assert_eq!(Tree::tuple(vec![Tree::leaf(1)]).treedef().to_string(), "TreeDef((*,))");
        assert_eq!(Tree::<i32>::unit().treedef().to_string(), "TreeDef(())");
    }

    #[test]
    fn into_pair_requires_two_items() {
        let (first, second) = Tree::pair(Tree::leaf(1), Tree::leaf(2))
            .into_pair()
            .expect("pair");
        assert_eq!(first, Tree::leaf(1));
        assert_eq!(second, Tree::leaf(2));

        let err = Tree::leaf(1).into_pair().expect_err("not a pair");
        assert_eq!(
            err,
            TreeError::NotAPair {
                treedef: TreeDef::Leaf
            }
        );
    }

    #[test]
    fn try_map_preserves_structure() {
        let mapped = sample()
            .try_map(|leaf| Ok::<_, ()>(leaf * 10))
            .expect("map");
        assert_eq!(mapped.treedef(), sample().treedef());
        assert_eq!(mapped.flatten().0, vec![0, 10, 20, 30]);
    }
}
