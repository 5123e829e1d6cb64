//! Hypothesis testing.
//!
//! Two-sample tests used by the outcome comparator: [`t_test_two_sample`]
//! (Student's or Welch's) and the rank-based [`kruskal_wallis`].

use tessera_core::{Result, Scored, Summarizable, TesseraError};

use crate::descriptive;
use crate::distribution::{ChiSquared, Distribution, StudentT};
use crate::rank::average_ranks;

/// Result of a hypothesis test.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TestResult {
    /// The test statistic (t, H).
    pub statistic: f64,
    /// Two-tailed p-value.
    pub p_value: f64,
    /// Degrees of freedom, if applicable.
    pub degrees_of_freedom: Option<f64>,
    /// Name of the test method.
    pub method: String,
}

impl Scored for TestResult {
    fn score(&self) -> f64 {
        self.p_value
    }
}

impl Summarizable for TestResult {
    fn summary(&self) -> String {
        match self.degrees_of_freedom {
            Some(df) => format!(
                "{}: statistic={:.4}, df={:.1}, p={:.6}",
                self.method, self.statistic, df, self.p_value,
            ),
            None => format!(
                "{}: statistic={:.4}, p={:.6}",
                self.method, self.statistic, self.p_value,
            ),
        }
    }
}

/// Drop NaN observations.
pub fn omit_nan(data: &[f64]) -> Vec<f64> {
    data.iter().copied().filter(|v| !v.is_nan()).collect()
}

// ── Two-sample t-test ──────────────────────────────────────────────────────

/// Two-sample t-test: test whether two populations have the same mean.
///
/// When `equal_var` is `true`, uses pooled variance (Student's t-test).
/// When `false`, uses Welch's t-test with the Welch-Satterthwaite degrees of
/// freedom. NaN observations are omitted.
pub fn t_test_two_sample(x: &[f64], y: &[f64], equal_var: bool) -> Result<TestResult> {
    let x = omit_nan(x);
    let y = omit_nan(y);
    if x.len() < 2 || y.len() < 2 {
        return Err(TesseraError::InvalidInput(
            "t_test_two_sample: each group needs at least 2 observations".into(),
        ));
    }

    let nx = x.len() as f64;
    let ny = y.len() as f64;
    let mean_x = descriptive::mean(&x)?;
    let mean_y = descriptive::mean(&y)?;
    let var_x = descriptive::variance(&x, 1)?;
    let var_y = descriptive::variance(&y, 1)?;

    let (se, df) = if equal_var {
        let sp2 = ((nx - 1.0) * var_x + (ny - 1.0) * var_y) / (nx + ny - 2.0);
        ((sp2 * (1.0 / nx + 1.0 / ny)).sqrt(), nx + ny - 2.0)
    } else {
        let vn_x = var_x / nx;
        let vn_y = var_y / ny;
        let denom = vn_x.powi(2) / (nx - 1.0) + vn_y.powi(2) / (ny - 1.0);
        ((vn_x + vn_y).sqrt(), (vn_x + vn_y).powi(2) / denom)
    };

    if se == 0.0 || !se.is_finite() {
        return Err(TesseraError::NumericInstability(
            "t-test: both groups have zero variance".into(),
        ));
    }

    let t = (mean_x - mean_y) / se;
    let p = StudentT::new(df)?.two_tailed_p(t);

    Ok(TestResult {
        statistic: t,
        p_value: p,
        degrees_of_freedom: Some(df),
        method: if equal_var {
            "Two-sample t-test (pooled)".into()
        } else {
            "Welch's t-test".into()
        },
    })
}

/// Welch's unequal-variance t-test.
pub fn welch_t_test(x: &[f64], y: &[f64]) -> Result<TestResult> {
    t_test_two_sample(x, y, false)
}

// ── Kruskal-Wallis H test ──────────────────────────────────────────────────

/// Kruskal-Wallis H test over two or more groups, with tie correction and a
/// chi-squared approximation on `k - 1` degrees of freedom.
///
/// NaN observations are omitted. Fails with `NumericInstability` when every
/// observation is identical.
pub fn kruskal_wallis(groups: &[&[f64]]) -> Result<TestResult> {
    let groups: Vec<Vec<f64>> = groups.iter().map(|g| omit_nan(g)).collect();
    if groups.len() < 2 {
        return Err(TesseraError::InvalidInput(
            "kruskal_wallis: need at least 2 groups".into(),
        ));
    }
    if groups.iter().any(|g| g.is_empty()) {
        return Err(TesseraError::InvalidInput(
            "kruskal_wallis: every group needs at least 1 observation".into(),
        ));
    }

    let pooled: Vec<f64> = groups.iter().flatten().copied().collect();
    let n = pooled.len() as f64;
    let ranking = average_ranks(&pooled);

    let mut offset = 0;
    let mut h = 0.0;
    for g in &groups {
        let rank_sum: f64 = ranking.ranks[offset..offset + g.len()].iter().sum();
        h += rank_sum * rank_sum / g.len() as f64;
        offset += g.len();
    }
    h = 12.0 / (n * (n + 1.0)) * h - 3.0 * (n + 1.0);

    let correction = ranking.tie_correction();
    if correction <= 0.0 {
        return Err(TesseraError::NumericInstability(
            "kruskal_wallis: all observations are identical".into(),
        ));
    }
    h /= correction;

    let df = (groups.len() - 1) as f64;
    let p = ChiSquared::new(df)?.sf(h);

    Ok(TestResult {
        statistic: h,
        p_value: p,
        degrees_of_freedom: Some(df),
        method: "Kruskal-Wallis".into(),
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────
