//! Descriptive statistics for numeric data.
//!
//! Provides individual functions ([`mean`], [`median`], [`variance`], etc.) and
//! the aggregate [`describe`] used to summarize per-cell distances and
//! per-stratum feature values.

use tessera_core::{Result, Summarizable, TesseraError};

/// Aggregate descriptive statistics for a numeric sample.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DescriptiveStats {
    /// Number of observations.
    pub count: usize,
    /// Arithmetic mean.
    pub mean: f64,
    /// Median (50th percentile).
    pub median: f64,
    /// Population variance (ddof=0).
    pub variance: f64,
    /// Sample variance (ddof=1); NaN for a single observation.
    pub sample_variance: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    /// Minimum value.
    pub min: f64,
    /// Maximum value.
    pub max: f64,
    /// First quartile (25th percentile).
    pub q1: f64,
    /// Third quartile (75th percentile).
    pub q3: f64,
}

impl Summarizable for DescriptiveStats {
    fn summary(&self) -> String {
        format!(
            "n={}, mean={:.4}, median={:.4}, var={:.4}, min={:.4}, max={:.4}",
            self.count, self.mean, self.median, self.variance, self.min, self.max,
        )
    }
}

/// Compute all descriptive statistics for `data`.
///
/// Requires at least 1 element.
pub fn describe(data: &[f64]) -> Result<DescriptiveStats> {
    if data.is_empty() {
        return Err(TesseraError::InvalidInput(
            "describe: data must not be empty".into(),
        ));
    }

    let n = data.len();
    let n_f = n as f64;

    let mut sum = 0.0;
    let mut min_val = f64::INFINITY;
    let mut max_val = f64::NEG_INFINITY;
    for &x in data {
        sum += x;
        min_val = min_val.min(x);
        max_val = max_val.max(x);
    }
    let mean_val = sum / n_f;

    let m2: f64 = data.iter().map(|&x| (x - mean_val) * (x - mean_val)).sum();
    let pop_var = m2 / n_f;
    let sample_var = if n > 1 { m2 / (n_f - 1.0) } else { f64::NAN };

    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    Ok(DescriptiveStats {
        count: n,
        mean: mean_val,
        median: compute_quantile_sorted(&sorted, 0.5),
        variance: pop_var,
        sample_variance: sample_var,
        std_dev: pop_var.sqrt(),
        min: min_val,
        max: max_val,
        q1: compute_quantile_sorted(&sorted, 0.25),
        q3: compute_quantile_sorted(&sorted, 0.75),
    })
}

// ── Individual functions ───────────────────────────────────────────────────

/// Arithmetic mean.
pub fn mean(data: &[f64]) -> Result<f64> {
    if data.is_empty() {
        return Err(TesseraError::InvalidInput("mean: data must not be empty".into()));
    }
    Ok(data.iter().sum::<f64>() / data.len() as f64)
}

/// Median (average of the two middle values for even lengths).
pub fn median(data: &[f64]) -> Result<f64> {
    if data.is_empty() {
        return Err(TesseraError::InvalidInput("median: data must not be empty".into()));
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Ok(compute_quantile_sorted(&sorted, 0.5))
}

/// Variance with `ddof` delta degrees of freedom (0 = population, 1 = sample).
pub fn variance(data: &[f64], ddof: usize) -> Result<f64> {
    if data.len() <= ddof {
        return Err(TesseraError::InvalidInput(format!(
            "variance: need more than {} observations, got {}",
            ddof,
            data.len()
        )));
    }
    let m = mean(data)?;
    let ss: f64 = data.iter().map(|&x| (x - m) * (x - m)).sum();
    Ok(ss / (data.len() - ddof) as f64)
}

/// Standard deviation with `ddof` delta degrees of freedom.
pub fn std_dev(data: &[f64], ddof: usize) -> Result<f64> {
    Ok(variance(data, ddof)?.sqrt())
}

/// Quantile by linear interpolation between closest ranks; `q` in [0, 1].
pub fn quantile(data: &[f64], q: f64) -> Result<f64> {
    if data.is_empty() {
        return Err(TesseraError::InvalidInput("quantile: data must not be empty".into()));
    }
    if !(0.0..=1.0).contains(&q) {
        return Err(TesseraError::InvalidInput(format!(
            "quantile: q must be in [0, 1], got {}",
            q
        )));
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Ok(compute_quantile_sorted(&sorted, q))
}

/// Whether every value equals the first, i.e. population variance is zero.
pub fn is_constant(data: &[f64]) -> bool {
    match data.first() {
        Some(first) => data.iter().all(|x| x == first),
        None => true,
    }
}

fn compute_quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = q * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = pos - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
