//! Integration grids and prior weights over the latent trait space.

use nalgebra::DVector;
use ndarray::{Array1, Array2, ArrayView1};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::convert::to_dmatrix;
use crate::error::{M2Error, Result};
use crate::model::LatentDistribution;

/// Rectangular grids span `[-THETA_LIMIT, THETA_LIMIT]` in every dimension.
pub const THETA_LIMIT: f64 = 6.0;

pub const DEFAULT_QMC_POINTS: usize = 5000;

const PRIOR_SUM_TOLERANCE: f64 = 1e-8;

/// Grid points (one row per point) with normalized prior weights.
#[derive(Debug, Clone)]
pub struct LatentGrid {
    pub points: Array2<f64>,
    pub prior: Array1<f64>,
}

impl LatentGrid {
    /// Validate a caller-supplied grid and prior.
    pub fn new(points: Array2<f64>, prior: Array1<f64>) -> Result<Self> {
        if points.nrows() != prior.len() {
            return Err(M2Error::Dimension(format!(
                "grid has {} points but the prior has {} weights",
                points.nrows(),
                prior.len()
            )));
        }
        if points.nrows() == 0 || points.ncols() == 0 {
            return Err(M2Error::Configuration("latent grid is empty".into()));
        }
        if prior.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(M2Error::Configuration(
                "prior weights must be finite and non-negative".into(),
            ));
        }
        let total = prior.sum();
        if (total - 1.0).abs() > PRIOR_SUM_TOLERANCE {
            return Err(M2Error::Configuration(format!(
                "prior weights sum to {total}, expected 1"
            )));
        }
        Ok(Self { points, prior })
    }

    pub fn n_points(&self) -> usize {
        self.points.nrows()
    }

    pub fn n_factors(&self) -> usize {
        self.points.ncols()
    }

    /// Single point at the origin carrying all of the prior mass.
    pub fn point_mass(n_factors: usize) -> Self {
        Self {
            points: Array2::zeros((1, n_factors)),
            prior: Array1::ones(1),
        }
    }
}

/// Default node count: points per dimension for rectangular grids, total
/// points for quasi-Monte Carlo grids.
pub fn default_quadrature_points(n_factors: usize, qmc: bool) -> usize {
    if qmc {
        return DEFAULT_QMC_POINTS;
    }
    match n_factors {
        1 => 61,
        2 => 31,
        3 => 15,
        4 => 9,
        5 => 7,
        _ => 3,
    }
}

/// Equally spaced nodes on `[-THETA_LIMIT, THETA_LIMIT]`.
pub fn rectangular_nodes(n_points: usize) -> Vec<f64> {
    if n_points == 1 {
        return vec![0.0];
    }
    let step = 2.0 * THETA_LIMIT / (n_points - 1) as f64;
    (0..n_points).map(|i| -THETA_LIMIT + i as f64 * step).collect()
}

/// Radical-inverse (van der Corput) value of `index` in `base`.
pub fn halton_point(index: usize, base: usize) -> f64 {
    let mut result = 0.0;
    let mut fraction = 1.0 / base as f64;
    let mut n = index;
    while n > 0 {
        result += fraction * (n % base) as f64;
        n /= base;
        fraction /= base as f64;
    }
    result
}

fn first_primes(count: usize) -> Vec<usize> {
    let mut primes = Vec::with_capacity(count);
    let mut candidate = 2;
    while primes.len() < count {
        if primes.iter().all(|&p| candidate % p != 0) {
            primes.push(candidate);
        }
        candidate += 1;
    }
    primes
}

/// Build the integration grid for a group's latent distribution.
///
/// Discrete distributions are passed through unchanged after validation.
pub fn build_grid(
    latent: &LatentDistribution,
    n_points: Option<usize>,
    qmc: bool,
) -> Result<LatentGrid> {
    let n_factors = latent.n_factors();
    if n_factors == 0 {
        return Err(M2Error::Configuration(
            "number of latent factors must be positive".into(),
        ));
    }
    if n_points == Some(0) {
        return Err(M2Error::Configuration(
            "quadrature point count must be positive".into(),
        ));
    }

    let (mean, cov) = match latent {
        LatentDistribution::Discrete { grid, prior } => {
            return LatentGrid::new(grid.clone(), prior.clone());
        }
        LatentDistribution::Gaussian { mean, cov } => (mean, cov),
    };
    if cov.dim() != (n_factors, n_factors) {
        return Err(M2Error::Dimension(format!(
            "latent covariance is {:?}, expected {n_factors}x{n_factors}",
            cov.dim()
        )));
    }
    let chol = to_dmatrix(cov.view()).cholesky().ok_or_else(|| {
        M2Error::Configuration("latent covariance is not positive definite".into())
    })?;

    let n_points = n_points.unwrap_or_else(|| default_quadrature_points(n_factors, qmc));
    let grid = if qmc {
        qmc_grid(mean.view(), &chol.l(), n_points)?
    } else {
        rectangular_grid(mean.view(), &chol.inverse(), n_factors, n_points)?
    };
    log::debug!(
        "latent grid: {} points in {} dimension(s){}",
        grid.n_points(),
        n_factors,
        if qmc { " (quasi-Monte Carlo)" } else { "" }
    );
    Ok(grid)
}

fn rectangular_grid(
    mean: ArrayView1<f64>,
    cov_inv: &nalgebra::DMatrix<f64>,
    n_factors: usize,
    per_dim: usize,
) -> Result<LatentGrid> {
    let nodes = rectangular_nodes(per_dim);
    let total = (0..n_factors).try_fold(1usize, |acc, _| acc.checked_mul(per_dim));
    let total = total.ok_or_else(|| {
        M2Error::Configuration(format!(
            "{per_dim}^{n_factors} grid points overflow; use quasi-Monte Carlo nodes"
        ))
    })?;

    let mut points = Array2::zeros((total, n_factors));
    let mut prior = Array1::zeros(total);
    let mut counter = vec![0usize; n_factors];
    for q in 0..total {
        let centered = DVector::from_fn(n_factors, |f, _| nodes[counter[f]] - mean[f]);
        for f in 0..n_factors {
            points[[q, f]] = nodes[counter[f]];
        }
        let quad_form = centered.dot(&(cov_inv * &centered));
        prior[q] = (-0.5 * quad_form).exp();

        for f in (0..n_factors).rev() {
            counter[f] += 1;
            if counter[f] < per_dim {
                break;
            }
            counter[f] = 0;
        }
    }

    let sum = prior.sum();
    if !sum.is_finite() || sum <= 0.0 {
        return Err(M2Error::Configuration(
            "prior density vanishes on the quadrature grid".into(),
        ));
    }
    prior /= sum;
    Ok(LatentGrid { points, prior })
}

fn qmc_grid(
    mean: ArrayView1<f64>,
    chol_l: &nalgebra::DMatrix<f64>,
    n_points: usize,
) -> Result<LatentGrid> {
    let n_factors = mean.len();
    let normal = Normal::new(0.0, 1.0).map_err(|e| M2Error::Configuration(e.to_string()))?;
    let bases = first_primes(n_factors);

    let mut points = Array2::zeros((n_points, n_factors));
    for q in 0..n_points {
        let z = DVector::from_fn(n_factors, |f, _| {
            normal.inverse_cdf(halton_point(q + 1, bases[f]))
        });
        let theta = chol_l * z;
        for f in 0..n_factors {
            points[[q, f]] = mean[f] + theta[f];
        }
    }
    let prior = Array1::from_elem(n_points, 1.0 / n_points as f64);
    Ok(LatentGrid { points, prior })
}
