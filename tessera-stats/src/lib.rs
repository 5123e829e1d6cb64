//! Statistics for per-specimen spatial features.
//!
//! - **Descriptive statistics** — mean, median, variance, quantiles
//! - **Ranking** — average ranks with tie bookkeeping
//! - **Distributions** — Normal and chi-squared, plus incomplete beta/gamma
//! - **Hypothesis testing** — Welch's t-test, Kruskal-Wallis
//! - **Multiple testing correction** — Bonferroni, Benjamini-Hochberg
//! - **Outcome comparison** — pairwise stratum tests over feature values

pub mod comparison;
pub mod correction;
pub mod descriptive;
pub mod distribution;
pub mod rank;
pub mod testing;

pub use comparison::{compare_outcomes, ComparisonConfig, ComparisonRow, OutcomeValue, TestKind};
pub use descriptive::{describe, DescriptiveStats};
pub use testing::TestResult;
