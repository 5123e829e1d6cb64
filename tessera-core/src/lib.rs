//! Shared primitives for the tessera spatial analytics engine.
//!
//! `tessera-core` is the foundation the other tessera crates build on:
//!
//! - **Error taxonomy** — [`TesseraError`] and [`Result`], including the
//!   specimen-scoped failures that abort one specimen but not a run
//! - **Traits** — [`ContentAddressable`], [`Scored`], [`Summarizable`]
//! - **Hashing** — SHA-256 for cell manifests and uploaded feature batches

pub mod error;
pub mod hash;
pub mod traits;

pub use error::{Result, TesseraError};
pub use traits::*;
