//! Quadratic-form M2 statistic and the indices derived from it.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use statrs::function::gamma::{gamma_lr, ln_gamma};

use crate::convert::{to_dmatrix, to_dvector};
use crate::error::{M2Error, Result};

/// Relative size below which an R diagonal marks a dependent Jacobian column.
pub const RANK_TOLERANCE: f64 = 1e-10;

/// Smallest acceptable reciprocal condition number of the projected weight
/// matrix.
pub const MIN_RECIPROCAL_CONDITION: f64 = 1e-12;

const ROOT_TOLERANCE: f64 = 1e-10;
const MAX_BISECTIONS: usize = 500;

/// Orthonormal basis of the orthogonal complement of the Jacobian's column
/// space, shape `(n_moments, n_moments - n_free)`.
///
/// Taken from the full Q of the QR factorization of `[delta | I]`, whose
/// leading columns span the Jacobian when it has full column rank.
pub fn orthogonal_complement(delta: &Array2<f64>) -> Result<DMatrix<f64>> {
    let (n_moments, n_free) = delta.dim();
    if n_moments <= n_free {
        return Err(M2Error::InsufficientDegreesOfFreedom {
            moments: n_moments,
            parameters: n_free,
        });
    }

    let mut augmented = DMatrix::zeros(n_moments, n_free + n_moments);
    augmented
        .columns_mut(0, n_free)
        .copy_from(&to_dmatrix(delta.view()));
    augmented
        .columns_mut(n_free, n_moments)
        .fill_with_identity();

    let qr = augmented.qr();
    let r = qr.r();
    if n_free > 0 {
        let diag: Vec<f64> = (0..n_free).map(|i| r[(i, i)].abs()).collect();
        let max_diag = diag.iter().cloned().fold(0.0, f64::max);
        if max_diag == 0.0 || diag.iter().any(|&d| d <= RANK_TOLERANCE * max_diag) {
            return Err(M2Error::IllConditioned(
                "Jacobian of the moments does not have full column rank".into(),
            ));
        }
    }

    let q = qr.q();
    Ok(q.columns(n_free, n_moments - n_free).into_owned())
}

/// `N (p - e)' C (p - e)` with `C = dc (dc' Xi2 dc)^{-1} dc'`.
pub fn m2_statistic(
    delta: &Array2<f64>,
    xi2: &Array2<f64>,
    observed: &Array1<f64>,
    expected: &Array1<f64>,
    n: usize,
) -> Result<f64> {
    let n_moments = delta.nrows();
    if xi2.dim() != (n_moments, n_moments)
        || observed.len() != n_moments
        || expected.len() != n_moments
    {
        return Err(M2Error::Dimension(format!(
            "moment vectors ({}, {}) and weight matrix {:?} do not match {} Jacobian rows",
            observed.len(),
            expected.len(),
            xi2.dim(),
            n_moments
        )));
    }

    let deltac = orthogonal_complement(delta)?;
    let xi = to_dmatrix(xi2.view());
    let mut middle = deltac.transpose() * &xi * &deltac;
    middle = (&middle + middle.transpose()) * 0.5;

    let eigen = middle.symmetric_eigen();
    let lambda_max = eigen.eigenvalues.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let lambda_min = eigen.eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);
    if !lambda_min.is_finite()
        || lambda_min <= 0.0
        || lambda_min / lambda_max < MIN_RECIPROCAL_CONDITION
    {
        return Err(M2Error::IllConditioned(format!(
            "projected weight matrix has eigenvalues in [{lambda_min:e}, {lambda_max:e}]"
        )));
    }

    let resid: DVector<f64> = to_dvector(observed.view()) - to_dvector(expected.view());
    let u = deltac.transpose() * resid;
    let v = eigen.eigenvectors.transpose() * u;
    let quad: f64 = v
        .iter()
        .zip(eigen.eigenvalues.iter())
        .map(|(vi, li)| vi * vi / li)
        .sum();

    Ok((n as f64 * quad).max(0.0))
}

/// Upper-tail probability of the central chi-square distribution.
pub fn chi_square_p_value(statistic: f64, df: usize) -> f64 {
    match ChiSquared::new(df as f64) {
        Ok(dist) => dist.sf(statistic),
        Err(_) => f64::NAN,
    }
}

/// CDF of the noncentral chi-square distribution, computed as a Poisson
/// mixture of central chi-square CDFs.
pub fn noncentral_chisq_cdf(x: f64, df: f64, ncp: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if ncp <= 0.0 {
        return gamma_lr(df / 2.0, x / 2.0);
    }

    let half = ncp / 2.0;
    let spread = (10.0 * half.sqrt()).ceil() as usize + 50;
    let mode = half.floor() as usize;
    let j_min = mode.saturating_sub(spread);
    let j_max = mode + spread;

    let mut total = 0.0;
    for j in j_min..=j_max {
        let jf = j as f64;
        let log_w = -half + jf * half.ln() - ln_gamma(jf + 1.0);
        let w = log_w.exp();
        if w == 0.0 {
            continue;
        }
        total += w * gamma_lr(df / 2.0 + jf, x / 2.0);
    }
    total.clamp(0.0, 1.0)
}

/// Noncentrality at which `F(statistic; df, ncp) = target`. The CDF is
/// decreasing in the noncentrality, so bisection on a doubling bracket
/// always converges.
fn solve_noncentrality(statistic: f64, df: f64, target: f64) -> f64 {
    if noncentral_chisq_cdf(statistic, df, 0.0) <= target {
        return 0.0;
    }
    let mut lo = 0.0;
    let mut hi = statistic.max(1.0);
    while noncentral_chisq_cdf(statistic, df, hi) > target {
        lo = hi;
        hi *= 2.0;
        if hi > 1e12 {
            break;
        }
    }
    for _ in 0..MAX_BISECTIONS {
        let mid = 0.5 * (lo + hi);
        if noncentral_chisq_cdf(statistic, df, mid) > target {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < ROOT_TOLERANCE * (1.0 + hi) {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// Root mean square error of approximation, floored at zero.
pub fn rmsea(statistic: f64, df: usize, n: usize) -> f64 {
    if df == 0 || n <= 1 {
        return f64::NAN;
    }
    let denom = df as f64 * (n as f64 - 1.0);
    ((statistic - df as f64) / denom).max(0.0).sqrt()
}

/// Two-sided confidence bounds for RMSEA at `level` (e.g. 0.9).
pub fn rmsea_interval(statistic: f64, df: usize, n: usize, level: f64) -> (f64, f64) {
    if df == 0 || n <= 1 {
        return (f64::NAN, f64::NAN);
    }
    let dff = df as f64;
    let denom = dff * (n as f64 - 1.0);
    let lower = solve_noncentrality(statistic, dff, (1.0 + level) / 2.0);
    let upper = solve_noncentrality(statistic, dff, (1.0 - level) / 2.0);
    ((lower / denom).sqrt(), (upper / denom).sqrt())
}

/// Standardized root mean square residual over the strict lower triangle.
pub fn srmsr(observed_cor: &Array2<f64>, implied_cor: &Array2<f64>) -> f64 {
    let n_items = observed_cor.nrows();
    let mut sum = 0.0;
    let mut count = 0usize;
    for i in 1..n_items {
        for j in 0..i {
            let r = observed_cor[[i, j]] - implied_cor[[i, j]];
            sum += r * r;
            count += 1;
        }
    }
    if count == 0 {
        return f64::NAN;
    }
    (sum / count as f64).sqrt()
}

/// Signed residual correlations in the strict lower triangle; NaN elsewhere.
/// With a threshold below 1, residuals smaller in magnitude are set to NaN.
pub fn residual_matrix(
    observed_cor: &Array2<f64>,
    implied_cor: &Array2<f64>,
    suppress: Option<f64>,
) -> Array2<f64> {
    let n_items = observed_cor.nrows();
    let threshold = suppress.filter(|&t| t < 1.0);
    Array2::from_shape_fn((n_items, n_items), |(i, j)| {
        if i <= j {
            return f64::NAN;
        }
        let r = observed_cor[[i, j]] - implied_cor[[i, j]];
        match threshold {
            Some(t) if r.abs() < t => f64::NAN,
            _ => r,
        }
    })
}
