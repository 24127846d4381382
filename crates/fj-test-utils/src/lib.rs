#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Absolute/relative tolerance for numeric comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub atol: f64,
    pub rtol: f64,
}

impl Tolerance {
    pub const EXACT: Self = Self {
        atol: 0.0,
        rtol: 0.0,
    };

    /// Tolerance for comparing float32 results.
    pub const F32: Self = Self {
        atol: 1e-5,
        rtol: 1e-4,
    };

    /// Tolerance for comparing against central finite differences.
    pub const FINITE_DIFFERENCE: Self = Self {
        atol: 1e-4,
        rtol: 1e-3,
    };

    #[must_use]
    pub fn close(&self, actual: f64, expected: f64) -> bool {
        if actual == expected {
            return true;
        }
        if actual.is_nan() || expected.is_nan() {
            return false;
        }
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

/// Panics with the first mismatching position when `actual` and `expected`
/// differ beyond `tol`.
#[track_caller]
pub fn assert_allclose(actual: &[f64], expected: &[f64], tol: Tolerance) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "length mismatch: actual {actual:?} expected {expected:?}"
    );
    for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            tol.close(*a, *e),
            "mismatch at {idx}: actual {a} expected {e} (atol {}, rtol {})\nactual   {actual:?}\nexpected {expected:?}",
            tol.atol,
            tol.rtol
        );
    }
}

/// Central difference of a scalar function.
#[must_use]
pub fn central_difference(f: impl Fn(f64) -> f64, x: f64, eps: f64) -> f64 {
    (f(x + eps) - f(x - eps)) / (2.0 * eps)
}

/// Central difference of a vector function along direction `v`.
#[must_use]
pub fn directional_difference(
    f: impl Fn(&[f64]) -> Vec<f64>,
    x: &[f64],
    v: &[f64],
    eps: f64,
) -> Vec<f64> {
    let shifted = |sign: f64| -> Vec<f64> {
        x.iter()
            .zip(v)
            .map(|(xi, vi)| xi + sign * eps * vi)
            .collect()
    };
    let plus = f(&shifted(1.0));
    let minus = f(&shifted(-1.0));
    plus.iter()
        .zip(&minus)
        .map(|(p, m)| (p - m) / (2.0 * eps))
        .collect()
}

pub fn fixture_id_from_json<T: Serialize>(fixture: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(fixture)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[must_use]
pub fn property_test_case_count() -> u32 {
    if let Ok(raw) = std::env::var("FJ_PROPTEST_CASES")
        && let Ok(parsed) = raw.parse::<u32>()
        && parsed > 0
    {
        return parsed;
    }

    if std::env::var_os("CI").is_some() {
        256
    } else {
        64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_digest_is_deterministic() {
        let fixture = serde_json::json!({
            "construct": "scan",
            "lengths": [0, 1, 5]
        });
        let digest_a = fixture_id_from_json(&fixture).expect("digest should build");
        let digest_b = fixture_id_from_json(&fixture).expect("digest should build");
        assert_eq!(digest_a, digest_b);
        assert_eq!(digest_a.len(), 64);
    }

    #[test]
    fn property_case_count_has_floor() {
        assert!(property_test_case_count() >= 1);
    }

    #[test]
    fn tolerance_handles_nan_and_exact() {
        assert!(Tolerance::EXACT.close(1.5, 1.5));
        assert!(!Tolerance::EXACT.close(1.5, 1.5000001));
        assert!(!Tolerance::F32.close(f64::NAN, 0.0));
        assert!(Tolerance::F32.close(1.0, 1.000_001));
    }

    #[test]
    fn central_difference_of_square() {
        let d = central_difference(|x| x * x, 3.0, 1e-4);
        assert!(Tolerance::FINITE_DIFFERENCE.close(d, 6.0));
    }

    #[test]
    fn directional_difference_of_linear_map() {
        let f = |x: &[f64]| vec![2.0 * x[0] + x[1], x[1]];
        let d = directional_difference(f, &[1.0, 1.0], &[1.0, 0.0], 1e-3);
        assert_allclose(&d, &[2.0, 0.0], Tolerance::FINITE_DIFFERENCE);
    }
}
