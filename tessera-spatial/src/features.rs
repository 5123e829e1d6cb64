//! Derivation methods and the per-specimen feature batches tasks return.

use std::fmt;
use std::str::FromStr;

use tessera_core::{Result, TesseraError};

/// How a feature was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DerivationMethod {
    /// Specifiers: source phenotype, target phenotype, radius.
    Proximity,
    /// Specifiers: source phenotype, target phenotype, radius.
    BalancedProximity,
    /// Specifiers: phenotype, compartment, other compartment.
    FrontProximity,
    /// Specifier: channel symbol.
    SpatialAutocorrelation,
}

impl DerivationMethod {
    pub const ALL: [DerivationMethod; 4] = [
        DerivationMethod::Proximity,
        DerivationMethod::BalancedProximity,
        DerivationMethod::FrontProximity,
        DerivationMethod::SpatialAutocorrelation,
    ];

    /// Tag stored in `feature_specification.derivation_method`.
    pub fn as_str(&self) -> &'static str {
        match self {
            DerivationMethod::Proximity => "proximity",
            DerivationMethod::BalancedProximity => "balanced proximity",
            DerivationMethod::FrontProximity => "front proximity",
            DerivationMethod::SpatialAutocorrelation => "spatial autocorrelation",
        }
    }

    pub fn specifier_count(&self) -> usize {
        match self {
            DerivationMethod::SpatialAutocorrelation => 1,
            _ => 3,
        }
    }
}

impl fmt::Display for DerivationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DerivationMethod {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        DerivationMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| TesseraError::InvalidInput(format!("unknown derivation method '{}'", s)))
    }
}

/// One computed value awaiting upload.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureValue {
    pub specifiers: Vec<String>,
    pub specimen: String,
    pub value: f64,
}

/// Everything one per-specimen task produced for one derivation method.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureBatch {
    pub derivation_method: DerivationMethod,
    pub specimen: String,
    pub values: Vec<FeatureValue>,
}

impl FeatureBatch {
    pub fn new(derivation_method: DerivationMethod, specimen: &str) -> Self {
        Self {
            derivation_method,
            specimen: specimen.to_string(),
            values: Vec::new(),
        }
    }

    pub fn push(&mut self, specifiers: Vec<String>, value: f64) {
        self.values.push(FeatureValue {
            specifiers,
            specimen: self.specimen.clone(),
            value,
        });
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
