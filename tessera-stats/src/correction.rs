//! Multiple testing correction for comparator result tables.
//!
//! The comparator itself reports raw p-values; callers adjust them here.

use std::str::FromStr;

use tessera_core::{Result, TesseraError};

/// Multiple testing correction method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionMethod {
    /// Bonferroni correction, controls the family-wise error rate.
    Bonferroni,
    /// Benjamini-Hochberg procedure, controls the false discovery rate.
    BenjaminiHochberg,
}

impl FromStr for CorrectionMethod {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bonferroni" => Ok(CorrectionMethod::Bonferroni),
            "bh" | "fdr" | "benjamini-hochberg" => Ok(CorrectionMethod::BenjaminiHochberg),
            other => Err(TesseraError::InvalidInput(format!(
                "unknown correction method '{}'",
                other
            ))),
        }
    }
}

/// Apply a multiple testing correction to `p_values`, preserving order.
pub fn correct(p_values: &[f64], method: CorrectionMethod) -> Result<Vec<f64>> {
    match method {
        CorrectionMethod::Bonferroni => bonferroni(p_values),
        CorrectionMethod::BenjaminiHochberg => benjamini_hochberg(p_values),
    }
}

/// Bonferroni correction: `p_adj = min(p * n, 1.0)`.
pub fn bonferroni(p_values: &[f64]) -> Result<Vec<f64>> {
    validate_p_values(p_values)?;
    let n = p_values.len() as f64;
    Ok(p_values.iter().map(|&p| (p * n).min(1.0)).collect())
}

/// Benjamini-Hochberg step-up adjustment with right-to-left monotonicity.
pub fn benjamini_hochberg(p_values: &[f64]) -> Result<Vec<f64>> {
    validate_p_values(p_values)?;
    let n = p_values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));

    let mut adjusted = vec![0.0; n];
    let mut running = 1.0_f64;
    for (pos, &idx) in order.iter().enumerate().rev() {
        let adj = (p_values[idx] * n as f64 / (pos + 1) as f64).min(running);
        adjusted[idx] = adj;
        running = adj;
    }
    Ok(adjusted)
}

fn validate_p_values(p_values: &[f64]) -> Result<()> {
    match p_values.iter().position(|p| !(0.0..=1.0).contains(p)) {
        Some(i) => Err(TesseraError::InvalidInput(format!(
            "p-value at index {} is out of range [0, 1]: {}",
            i, p_values[i],
        ))),
        None => Ok(()),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-10;

    #[test]
    fn bonferroni_clamps() {
        let adj = bonferroni(&[0.01, 0.3, 0.6]).unwrap();
        assert!((adj[0] - 0.03).abs() < TOL);
        assert!((adj[1] - 0.9).abs() < TOL);
        assert!((adj[2] - 1.0).abs() < TOL);
    }

    #[test]
    fn bh_known() {
        let adj = benjamini_hochberg(&[0.01, 0.04, 0.03, 0.005]).unwrap();
        assert!((adj[3] - 0.02).abs() < TOL);
        assert!((adj[0] - 0.02).abs() < TOL);
        assert!((adj[2] - 0.04).abs() < TOL);
        assert!((adj[1] - 0.04).abs() < TOL);
    }

    #[test]
    fn bh_empty_and_invalid() {
        assert!(benjamini_hochberg(&[]).unwrap().is_empty());
        assert!(bonferroni(&[0.2, 1.5]).is_err());
    }

    #[test]
    fn parse_method() {
        assert_eq!("BH".parse::<CorrectionMethod>().unwrap(), CorrectionMethod::BenjaminiHochberg);
        assert_eq!(
            "bonferroni".parse::<CorrectionMethod>().unwrap(),
            CorrectionMethod::Bonferroni
        );
        assert!("holm".parse::<CorrectionMethod>().is_err());
    }
}
