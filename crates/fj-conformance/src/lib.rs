#![forbid(unsafe_code)]

//! Reference oracles for the control-flow constructs and the fixture
//! bundle the integration tests replay against the traced engine.
//!
//! The oracles are plain sequential Rust loops. Every traced construct is
//! checked against one of them: `scan` against [`reference_scan`],
//! `while_loop` against [`reference_while`], `associative_scan` against
//! [`reference_prefix`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const FIXTURE_SCHEMA_VERSION: &str = "frankenjax.control-flow-fixtures.v1";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
        }
    }

    #[must_use]
    pub fn control_flow_bundle(&self) -> PathBuf {
        self.fixture_root.join("control_flow_cases.v1.json")
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub schema_version: String,
    pub cases: Vec<ControlFlowCase>,
}

/// One recorded input/output pair for a construct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "construct", rename_all = "snake_case")]
pub enum ControlFlowCase {
    /// `associative_scan(add, xs, reverse)`.
    Cumsum {
        case_id: String,
        xs: Vec<f64>,
        reverse: bool,
        expected: Vec<f64>,
    },
    /// `while x < bound: x = 2 * x`.
    DoublingWhile {
        case_id: String,
        init: f64,
        bound: f64,
        expected: f64,
    },
    /// `scan` with `carry' = carry / 2 + x` emitting the incoming carry.
    DecayScan {
        case_id: String,
        init: f64,
        xs: Vec<f64>,
        reverse: bool,
        expected_carry: f64,
        expected_ys: Vec<f64>,
    },
}

impl ControlFlowCase {
    #[must_use]
    pub fn case_id(&self) -> &str {
        match self {
            Self::Cumsum { case_id, .. }
            | Self::DoublingWhile { case_id, .. }
            | Self::DecayScan { case_id, .. } => case_id,
        }
    }

    /// Whether the recorded expectation agrees with the oracle.
    #[must_use]
    pub fn oracle_agrees(&self) -> bool {
        match self {
            Self::Cumsum {
                xs,
                reverse,
                expected,
                ..
            } => {
                let actual = if *reverse { reverse_cumsum(xs) } else { cumsum(xs) };
                actual == *expected
            }
            Self::DoublingWhile {
                init,
                bound,
                expected,
                ..
            } => doubling_while(*init, *bound) == *expected,
            Self::DecayScan {
                init,
                xs,
                reverse,
                expected_carry,
                expected_ys,
                ..
            } => decay_scan(*init, xs, *reverse) == (*expected_carry, expected_ys.clone()),
        }
    }
}

pub fn read_fixture_bundle(path: &Path) -> Result<FixtureBundle, std::io::Error> {
    let raw = fs::read_to_string(path)?;
    let parsed = serde_json::from_str::<FixtureBundle>(&raw).map_err(std::io::Error::other)?;
    if parsed.schema_version != FIXTURE_SCHEMA_VERSION {
        return Err(std::io::Error::other(format!(
            "unsupported fixture schema '{}', expected '{FIXTURE_SCHEMA_VERSION}'",
            parsed.schema_version
        )));
    }
    Ok(parsed)
}

/// Sequential scan: `f` is applied in time order (last to first when
/// `reverse`), and `ys[i]` is always the output for `xs[i]`.
pub fn reference_scan<C, X, Y>(
    mut f: impl FnMut(C, &X) -> (C, Y),
    init: C,
    xs: &[X],
    reverse: bool,
) -> (C, Vec<Y>) {
    let mut carry = init;
    let mut ys = Vec::with_capacity(xs.len());
    if reverse {
        for x in xs.iter().rev() {
            let (next, y) = f(carry, x);
            carry = next;
            ys.push(y);
        }
        ys.reverse();
    } else {
        for x in xs {
            let (next, y) = f(carry, x);
            carry = next;
            ys.push(y);
        }
    }
    (carry, ys)
}

pub fn reference_while<C>(
    mut cond: impl FnMut(&C) -> bool,
    mut body: impl FnMut(C) -> C,
    init: C,
) -> C {
    let mut carry = init;
    while cond(&carry) {
        carry = body(carry);
    }
    carry
}

/// Inclusive prefix reduction folded left to right. With `reverse`, entry
/// `i` is `op(xs[i], op(xs[i + 1], ...))`.
pub fn reference_prefix<T: Clone>(op: impl Fn(&T, &T) -> T, xs: &[T], reverse: bool) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(xs.len());
    if reverse {
        for x in xs.iter().rev() {
            let next = match out.last() {
                Some(acc) => op(x, acc),
                None => x.clone(),
            };
            out.push(next);
        }
        out.reverse();
    } else {
        for x in xs {
            let next = match out.last() {
                Some(acc) => op(acc, x),
                None => x.clone(),
            };
            out.push(next);
        }
    }
    out
}

#[must_use]
pub fn cumsum(xs: &[f64]) -> Vec<f64> {
    reference_prefix(|a: &f64, b: &f64| a + b, xs, false)
}

/// Reversed cumulative sum of the reversed input.
#[must_use]
pub fn reverse_cumsum(xs: &[f64]) -> Vec<f64> {
    let reversed: Vec<f64> = xs.iter().rev().copied().collect();
    let mut out = cumsum(&reversed);
    out.reverse();
    out
}

#[must_use]
pub fn doubling_while(init: f64, bound: f64) -> f64 {
    reference_while(|x: &f64| *x < bound, |x: f64| 2.0 * x, init)
}

#[must_use]
pub fn decay_scan(init: f64, xs: &[f64], reverse: bool) -> (f64, Vec<f64>) {
    reference_scan(|carry: f64, x: &f64| (carry / 2.0 + x, carry), init, xs, reverse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_scan_keeps_outputs_in_input_order() {
        let (carry, ys) = reference_scan(|c: Vec<i64>, x: &i64| (vec![c[0] + x], c[0]), vec![0], &[1, 2, 3], true);
        assert_eq!(carry, vec![6]);
        assert_eq!(ys, vec![5, 3, 0]);
    }

    #[test]
    fn reverse_prefix_applies_the_element_first() {
        let concat = |a: &String, b: &String| format!("{a}{b}");
        let xs: Vec<String> = ["a", "b", "c"].iter().map(|s| (*s).to_owned()).collect();
        assert_eq!(reference_prefix(concat, &xs, false), vec!["a", "ab", "abc"]);
        assert_eq!(reference_prefix(concat, &xs, true), vec!["abc", "bc", "c"]);
    }

    #[test]
    fn reverse_cumsum_matches_reversed_prefix() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(reverse_cumsum(&xs), reference_prefix(|a: &f64, b: &f64| a + b, &xs, true));
        assert_eq!(reverse_cumsum(&[]), Vec::<f64>::new());
    }

    #[test]
    fn while_with_false_condition_returns_init() {
        assert_eq!(doubling_while(20.0, 10.0), 20.0);
        let empty: Vec<f64> = reference_while(|c: &Vec<f64>| !c.is_empty(), |c| c, Vec::new());
        assert!(empty.is_empty());
    }

    #[test]
    fn bundled_fixtures_match_the_oracles() {
        let config = HarnessConfig::default_paths();
        let bundle = read_fixture_bundle(&config.control_flow_bundle()).expect("fixture bundle");
        assert!(!bundle.cases.is_empty());
        for case in &bundle.cases {
            assert!(case.oracle_agrees(), "fixture {} disagrees with its oracle", case.case_id());
        }
    }

    #[test]
    fn unknown_schema_is_rejected() {
        let dir = std::env::temp_dir().join(format!("fj-conformance-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("bundle.json");
        fs::write(&path, r#"{"schema_version": "other.v0", "cases": []}"#).expect("write");
        let err = read_fixture_bundle(&path).expect_err("schema");
        assert!(err.to_string().contains("other.v0"));
        fs::remove_dir_all(&dir).expect("cleanup");
    }
}
