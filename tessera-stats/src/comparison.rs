//! Outcome-stratified comparison of per-specimen feature values.
//!
//! For every unordered pair of outcomes and every feature (specifier tuple),
//! a Welch t-test on means and a Kruskal-Wallis test on medians are reported
//! with raw p-values.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};

use crate::descriptive;
use crate::testing::{kruskal_wallis, omit_nan, welch_t_test};

/// One feature value of one specimen, tagged with the specimen's outcome.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OutcomeValue {
    pub outcome: String,
    pub specimen: String,
    pub specifiers: Vec<String>,
    pub value: f64,
}

/// Which test produced a comparison row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TestKind {
    /// Welch's t-test; tested values are group means.
    TTest,
    /// Kruskal-Wallis; tested values are group medians.
    KruskalWallis,
}

impl TestKind {
    /// Name of the summary statistic the test compares.
    pub fn tested_value(&self) -> &'static str {
        match self {
            TestKind::TTest => "mean",
            TestKind::KruskalWallis => "median",
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestKind::TTest => write!(f, "t-test"),
            TestKind::KruskalWallis => write!(f, "Kruskal-Wallis"),
        }
    }
}

/// One row of the comparison result table.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ComparisonRow {
    pub outcome_1: String,
    pub outcome_2: String,
    pub specifiers: Vec<String>,
    pub tested_value_1: f64,
    pub tested_value_2: f64,
    pub test: TestKind,
    pub p_value: f64,
    /// `|tested_value_2 - tested_value_1|`.
    pub absolute_effect: f64,
    /// Sign of `tested_value_2 - tested_value_1`: -1, 0 or 1.
    pub effect_sign: i8,
    /// Whether `p_value` is below the configured significance level.
    pub significant: bool,
}

/// Comparator parameters.
#[derive(Debug, Clone)]
pub struct ComparisonConfig {
    /// Groups smaller than this are skipped.
    pub min_group_size: usize,
    /// Threshold for the `significant` flag.
    pub significance_level: f64,
    /// Outcome labels never compared.
    pub excluded_outcomes: Vec<String>,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            min_group_size: 3,
            significance_level: 0.01,
            excluded_outcomes: vec!["unknown".into()],
        }
    }
}

/// Compare two outcome groups for one feature.
///
/// Returns no rows when either group has fewer than `min_group_size`
/// non-NaN values or zero variance; otherwise a t-test row followed by a
/// Kruskal-Wallis row (a test that cannot be computed is dropped).
pub fn compare_pair(
    outcome_1: &str,
    outcome_2: &str,
    specifiers: &[String],
    values_1: &[f64],
    values_2: &[f64],
    config: &ComparisonConfig,
) -> Vec<ComparisonRow> {
    let v1 = omit_nan(values_1);
    let v2 = omit_nan(values_2);

    if v1.len() < config.min_group_size || v2.len() < config.min_group_size {
        debug!(
            outcome_1,
            outcome_2,
            feature = %specifiers.join(", "),
            n1 = v1.len(),
            n2 = v2.len(),
            "group too small, skipping"
        );
        return Vec::new();
    }
    if descriptive::is_constant(&v1) || descriptive::is_constant(&v2) {
        warn!(
            outcome_1,
            outcome_2,
            feature = %specifiers.join(", "),
            "zero variance in a stratum, test skipped"
        );
        return Vec::new();
    }

    let row = |test: TestKind, t1: f64, t2: f64, p: f64| {
        let diff = t2 - t1;
        ComparisonRow {
            outcome_1: outcome_1.to_string(),
            outcome_2: outcome_2.to_string(),
            specifiers: specifiers.to_vec(),
            tested_value_1: t1,
            tested_value_2: t2,
            test,
            p_value: p,
            absolute_effect: diff.abs(),
            effect_sign: if diff > 0.0 {
                1
            } else if diff < 0.0 {
                -1
            } else {
                0
            },
            significant: p < config.significance_level,
        }
    };

    let mut rows = Vec::with_capacity(2);
    match (welch_t_test(&v1, &v2), descriptive::mean(&v1), descriptive::mean(&v2)) {
        (Ok(t), Ok(m1), Ok(m2)) => rows.push(row(TestKind::TTest, m1, m2, t.p_value)),
        (Err(e), _, _) => warn!(feature = %specifiers.join(", "), "t-test skipped: {}", e),
        _ => {}
    }
    match (
        kruskal_wallis(&[&v1, &v2]),
        descriptive::median(&v1),
        descriptive::median(&v2),
    ) {
        (Ok(h), Ok(m1), Ok(m2)) => rows.push(row(TestKind::KruskalWallis, m1, m2, h.p_value)),
        (Err(e), _, _) => warn!(feature = %specifiers.join(", "), "Kruskal-Wallis skipped: {}", e),
        _ => {}
    }
    rows
}

/// Run [`compare_pair`] for every unordered pair of distinct outcomes and
/// every specifier tuple present in `values`, and sort the result table.
pub fn compare_outcomes(values: &[OutcomeValue], config: &ComparisonConfig) -> Vec<ComparisonRow> {
    let mut by_feature: BTreeMap<&[String], BTreeMap<&str, Vec<f64>>> = BTreeMap::new();
    for v in values {
        if config.excluded_outcomes.iter().any(|o| o == &v.outcome) {
            continue;
        }
        by_feature
            .entry(v.specifiers.as_slice())
            .or_default()
            .entry(v.outcome.as_str())
            .or_default()
            .push(v.value);
    }

    let mut rows = Vec::new();
    for (specifiers, groups) in &by_feature {
        let outcomes: Vec<&str> = groups.keys().copied().collect();
        for (i, &o1) in outcomes.iter().enumerate() {
            for &o2 in &outcomes[i + 1..] {
                rows.extend(compare_pair(
                    o1,
                    o2,
                    specifiers,
                    &groups[o1],
                    &groups[o2],
                    config,
                ));
            }
        }
    }

    sort_rows(&mut rows);
    rows
}

/// Sort by (outcome 1 asc, outcome 2 asc, significant first, absolute effect
/// desc, p-value asc), then by feature and test for a total order.
pub fn sort_rows(rows: &mut [ComparisonRow]) {
    rows.sort_by(|a, b| {
        a.outcome_1
            .cmp(&b.outcome_1)
            .then_with(|| a.outcome_2.cmp(&b.outcome_2))
            .then_with(|| b.significant.cmp(&a.significant))
            .then_with(|| b.absolute_effect.total_cmp(&a.absolute_effect))
            .then_with(|| a.p_value.total_cmp(&b.p_value))
            .then_with(|| a.specifiers.cmp(&b.specifiers))
            .then_with(|| a.test.cmp(&b.test))
            .then(Ordering::Equal)
    });
}

// ── Tests ──────────────────────────────────────────────────────────────────
