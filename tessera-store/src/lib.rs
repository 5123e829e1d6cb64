//! Relational store behind the tessera engine.
//!
//! An embedded SQLite database holds studies, specimens, cells and their
//! expression calls, and receives computed features:
//!
//! - **Store** — [`Store`] readers that pull channels, phenotypes and
//!   per-specimen [`FeatureMatrix`](tessera_spatial::FeatureMatrix)es
//! - **Import** — bulk writers used by importers and tests
//! - **Upload** — [`FeatureUploader`], idempotent per (method, study) batch
//! - **Strata** — sample stratification by intervention timing and diagnosis
//! - **Export** — TSV matrices plus a `features.json` index

pub mod association;
pub mod credentials;
pub mod export;
pub mod import;
pub mod store;
pub mod strata;
pub mod uploader;

#[cfg(test)]
pub(crate) mod fixtures;

pub use association::{StoredFeatureValue, UNKNOWN_OUTCOME};
pub use credentials::{sanitize_database_name, DbCredentials};
pub use export::{ExportOptions, ExportSummary};
pub use store::{Store, StudyComponents};
pub use strata::{Stratum, StratumAssignment, StratumKey, TemporalPosition};
pub use uploader::{CommitOutcome, FeatureUploader, UploadState};
