//! Probability distributions and numerical helpers for p-values.
//!
//! Provides the [`Distribution`] trait with [`Normal`], [`StudentT`] and
//! [`ChiSquared`], plus the special functions ([`erf`], [`ln_gamma`],
//! [`betai`], [`gammainc`]) they are built on.

use core::f64::consts::PI;

use tessera_core::{Result, TesseraError};

// ── Numerical helpers ──────────────────────────────────────────────────────

/// Error function via Abramowitz & Stegun 7.1.26 (max error ~1.5e-7).
pub fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    sign * (1.0 - poly * (-x * x).exp())
}

/// Natural log of the gamma function via the Lanczos approximation (g=7).
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 8] = [
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];

    if x < 0.5 {
        // Γ(x) = π / (sin(πx) · Γ(1-x))
        (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let ag = COEFFS
            .iter()
            .enumerate()
            .fold(0.99999999999980993_f64, |acc, (i, &c)| acc + c / (x + i as f64 + 1.0));
        let t = x + 7.5;
        0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + ag.ln()
    }
}

const TINY: f64 = 1e-30;
const MAX_ITER: usize = 300;

/// Regularized incomplete beta function I_x(a, b) by continued fraction
/// (modified Lentz).
pub fn betai(a: f64, b: f64, x: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&x) {
        return Err(TesseraError::InvalidInput(format!(
            "betai: x must be in [0, 1], got {}",
            x
        )));
    }
    if a <= 0.0 || b <= 0.0 {
        return Err(TesseraError::InvalidInput(
            "betai: a and b must be positive".into(),
        ));
    }
    if x == 0.0 || x == 1.0 {
        return Ok(x);
    }
    if x > (a + 1.0) / (a + b + 2.0) {
        return Ok(1.0 - betai(b, a, 1.0 - x)?);
    }

    let ln_prefactor =
        ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();

    let clamp = |v: f64| if v.abs() < TINY { TINY } else { v };
    let mut c = 1.0_f64;
    let mut d = clamp(1.0 - (a + b) * x / (a + 1.0)).recip();
    let mut h = d;

    for m in 1..=MAX_ITER {
        let m = m as f64;

        let even = m * (b - m) * x / ((a + 2.0 * m - 1.0) * (a + 2.0 * m));
        d = clamp(1.0 + even * d).recip();
        c = clamp(1.0 + even / c);
        h *= d * c;

        let odd = -((a + m) * (a + b + m) * x) / ((a + 2.0 * m) * (a + 2.0 * m + 1.0));
        d = clamp(1.0 + odd * d).recip();
        c = clamp(1.0 + odd / c);
        let delta = d * c;
        h *= delta;

        if (delta - 1.0).abs() < 1e-14 {
            break;
        }
    }

    Ok(ln_prefactor.exp() * h / a)
}

/// Regularized lower incomplete gamma function P(a, x) = γ(a, x) / Γ(a).
pub fn gammainc(a: f64, x: f64) -> Result<f64> {
    Ok(1.0 - gammainc_upper(a, x)?)
}

/// Regularized upper incomplete gamma function Q(a, x) = 1 - P(a, x).
///
/// Uses the series for P when x < a + 1 and the continued fraction for Q
/// otherwise, so small upper tails keep their precision.
pub fn gammainc_upper(a: f64, x: f64) -> Result<f64> {
    if a <= 0.0 {
        return Err(TesseraError::InvalidInput("gammainc: a must be positive".into()));
    }
    if x < 0.0 {
        return Err(TesseraError::InvalidInput("gammainc: x must be non-negative".into()));
    }
    if x == 0.0 {
        return Ok(1.0);
    }

    let ln_prefix = a * x.ln() - x - ln_gamma(a);

    if x < a + 1.0 {
        let mut sum = 1.0 / a;
        let mut term = sum;
        for n in 1..=MAX_ITER {
            term *= x / (a + n as f64);
            sum += term;
            if term.abs() < sum.abs() * 1e-15 {
                break;
            }
        }
        Ok(1.0 - sum * ln_prefix.exp())
    } else {
        let mut b = x + 1.0 - a;
        let mut c = 1.0 / TINY;
        let mut d = 1.0 / b;
        let mut h = d;
        for i in 1..=MAX_ITER {
            let an = -(i as f64) * (i as f64 - a);
            b += 2.0;
            d = an * d + b;
            if d.abs() < TINY {
                d = TINY;
            }
            c = b + an / c;
            if c.abs() < TINY {
                c = TINY;
            }
            d = 1.0 / d;
            let delta = d * c;
            h *= delta;
            if (delta - 1.0).abs() < 1e-15 {
                break;
            }
        }
        Ok(h * ln_prefix.exp())
    }
}

// ── Distribution trait ─────────────────────────────────────────────────────

/// A continuous probability distribution.
pub trait Distribution {
    /// Cumulative distribution function at `x`.
    fn cdf(&self, x: f64) -> f64;

    /// Survival function `1 - cdf(x)`.
    fn sf(&self, x: f64) -> f64 {
        1.0 - self.cdf(x)
    }

    /// Distribution mean.
    fn mean(&self) -> f64;

    /// Distribution variance.
    fn variance(&self) -> f64;
}

// ── Normal distribution ────────────────────────────────────────────────────

/// Normal (Gaussian) distribution with parameters μ and σ.
#[derive(Debug, Clone, Copy)]
pub struct Normal {
    mu: f64,
    sigma: f64,
}

impl Normal {
    /// Create a new Normal distribution. `sigma` must be positive.
    pub fn new(mu: f64, sigma: f64) -> Result<Self> {
        if sigma <= 0.0 {
            return Err(TesseraError::InvalidInput(
                "Normal: sigma must be positive".into(),
            ));
        }
        Ok(Self { mu, sigma })
    }

    /// Standard normal distribution N(0, 1).
    pub fn standard() -> Self {
        Self { mu: 0.0, sigma: 1.0 }
    }

    /// Two-sided p-value of a z-score under N(0, 1).
    pub fn two_sided_p(z: f64) -> f64 {
        let p = 2.0 * Self::standard().sf(z.abs());
        p.clamp(0.0, 1.0)
    }
}

impl Distribution for Normal {
    fn cdf(&self, x: f64) -> f64 {
        let z = (x - self.mu) / self.sigma;
        0.5 * (1.0 + erf(z / core::f64::consts::SQRT_2))
    }

    fn mean(&self) -> f64 {
        self.mu
    }

    fn variance(&self) -> f64 {
        self.sigma * self.sigma
    }
}

// ── Student's t distribution ───────────────────────────────────────────────

/// Student's t distribution with (possibly fractional) `df` degrees of freedom.
#[derive(Debug, Clone, Copy)]
pub struct StudentT {
    df: f64,
}

impl StudentT {
    /// Create a t distribution; `df` must be positive.
    pub fn new(df: f64) -> Result<Self> {
        if !(df > 0.0) {
            return Err(TesseraError::InvalidInput(format!(
                "StudentT: df must be positive, got {}",
                df
            )));
        }
        Ok(Self { df })
    }

    /// Two-tailed p-value `P(|T| >= |t|)`.
    pub fn two_tailed_p(&self, t: f64) -> f64 {
        if t.is_infinite() {
            return 0.0;
        }
        let x = self.df / (self.df + t * t);
        betai(self.df / 2.0, 0.5, x).unwrap_or(1.0)
    }
}

impl Distribution for StudentT {
    fn cdf(&self, x: f64) -> f64 {
        let tail = 0.5 * self.two_tailed_p(x);
        if x >= 0.0 {
            1.0 - tail
        } else {
            tail
        }
    }

    fn mean(&self) -> f64 {
        if self.df > 1.0 {
            0.0
        } else {
            f64::NAN
        }
    }

    fn variance(&self) -> f64 {
        if self.df > 2.0 {
            self.df / (self.df - 2.0)
        } else {
            f64::INFINITY
        }
    }
}

// ── Chi-squared distribution ──────────────────────────────────────────────

/// Chi-squared distribution with k degrees of freedom.
#[derive(Debug, Clone, Copy)]
pub struct ChiSquared {
    k: f64,
}

impl ChiSquared {
    /// Create a chi-squared distribution with `k` degrees of freedom.
    pub fn new(k: f64) -> Result<Self> {
        if k <= 0.0 {
            return Err(TesseraError::InvalidInput(
                "ChiSquared: k must be positive".into(),
            ));
        }
        Ok(Self { k })
    }

    /// Degrees of freedom.
    pub fn df(&self) -> f64 {
        self.k
    }
}

impl Distribution for ChiSquared {
    fn cdf(&self, x: f64) -> f64 {
        if x <= 0.0 {
            return 0.0;
        }
        gammainc(self.k / 2.0, x / 2.0).unwrap_or(0.0)
    }

    fn sf(&self, x: f64) -> f64 {
        if x <= 0.0 {
            return 1.0;
        }
        gammainc_upper(self.k / 2.0, x / 2.0).unwrap_or(1.0)
    }

    fn mean(&self) -> f64 {
        self.k
    }

    fn variance(&self) -> f64 {
        2.0 * self.k
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
