//! Structured error types for tessera.

use thiserror::Error;

/// Unified error type for all tessera operations.
#[derive(Debug, Error)]
pub enum TesseraError {
    /// I/O error (file not found, permission denied, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error (malformed input data)
    #[error("parse error: {0}")]
    Parse(String),

    /// Invalid input (bad arguments, out-of-range values)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Missing or invalid credentials, unknown study name.
    #[error("configuration error: {0}")]
    Config(String),

    /// Referential integrity violated at read time.
    #[error("store consistency error: {0}")]
    StoreConsistency(String),

    /// A shape blob could not be decoded.
    #[error("malformed shape: {0}")]
    MalformedShape(String),

    /// A phenotype criterion names a channel with no assigned bit.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// An expression row references a channel id with no symbol.
    #[error("missing channel mapping for channel id {0}")]
    MissingChannelMapping(i64),

    /// Centroid and expression pulls disagree on the number of cells.
    #[error(
        "inconsistent cell count for specimen {specimen}: {centroids} with centroids, {expressions} with expression"
    )]
    InconsistentCellCount {
        specimen: String,
        centroids: usize,
        expressions: usize,
    },

    /// Prior feature values exist for the batch and do not match the staged set.
    #[error(
        "inconsistent prior feature values for '{derivation_method}' in '{study}': {existing} stored, {staged} staged"
    )]
    InconsistentPriorFeatureValues {
        derivation_method: String,
        study: String,
        existing: usize,
        staged: usize,
    },

    /// Too few cells for a metric to be defined. Not fatal.
    #[error("degenerate input: {0}")]
    DegenerateInput(String),

    /// A statistic is undefined for the data (zero variance). Not fatal.
    #[error("numeric instability: {0}")]
    NumericInstability(String),

    /// Failure reported by the relational store.
    #[error("database error: {0}")]
    Database(String),

    /// Catch-all for other errors
    #[error("{0}")]
    Other(String),
}

impl TesseraError {
    /// Whether this error aborts only the specimen being processed.
    pub fn is_specimen_scoped(&self) -> bool {
        matches!(
            self,
            TesseraError::StoreConsistency(_)
                | TesseraError::MalformedShape(_)
                | TesseraError::MissingChannelMapping(_)
                | TesseraError::InconsistentCellCount { .. }
        )
    }

    /// Whether this error yields "no value" rather than a failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TesseraError::DegenerateInput(_) | TesseraError::NumericInstability(_)
        )
    }
}

/// Convenience alias used throughout tessera.
pub type Result<T> = std::result::Result<T, TesseraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specimen_scoped_kinds() {
        assert!(TesseraError::MalformedShape("bad".into()).is_specimen_scoped());
        assert!(TesseraError::StoreConsistency("x".into()).is_specimen_scoped());
        assert!(TesseraError::MissingChannelMapping(7).is_specimen_scoped());
        assert!(!TesseraError::Config("x".into()).is_specimen_scoped());
        assert!(!TesseraError::InconsistentPriorFeatureValues {
            derivation_method: "proximity".into(),
            study: "s".into(),
            existing: 1,
            staged: 2,
        }
        .is_specimen_scoped());
    }

    #[test]
    fn recoverable_kinds() {
        assert!(TesseraError::DegenerateInput("2 cells".into()).is_recoverable());
        assert!(TesseraError::NumericInstability("var=0".into()).is_recoverable());
        assert!(!TesseraError::Parse("x".into()).is_recoverable());
    }

    #[test]
    fn messages_carry_identifiers() {
        let e = TesseraError::InconsistentCellCount {
            specimen: "lesion 0_1".into(),
            centroids: 10,
            expressions: 9,
        };
        let msg = e.to_string();
        assert!(msg.contains("lesion 0_1"));
        assert!(msg.contains("10"));
        assert_eq!(
            TesseraError::MissingChannelMapping(42).to_string(),
            "missing channel mapping for channel id 42"
        );
    }
}
