//! Study-level pipelines over the tessera store.
//!
//! - [`pipeline`] pulls feature matrices, computes proximity, front
//!   proximity or spatial autocorrelation per specimen in parallel, and
//!   uploads the values
//! - [`cohorts`] compares strata over stored feature values

pub mod cohorts;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod testing;

pub use cohorts::{compare_cohorts, write_comparisons, write_comparisons_file, CohortComparison, CohortOptions};
pub use pipeline::{
    compute_specimen, load_matrices, run_analysis, Analysis, IndexKind, PipelineConfig, RunReport, SpecimenResult,
};
