//! Univariate and bivariate response moments.
//!
//! The moment vector holds J univariate means followed by the J(J-1)/2
//! cross-products of item pairs `(i, j)` with `i > j`, enumerated row-major:
//! `(1,0), (2,0), (2,1), (3,0), ...`. [`MomentLayout`] is the single source
//! of that ordering for observed moments, expected moments, Jacobian rows and
//! weight-matrix rows/columns.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;

use crate::error::{M2Error, Result};
use crate::items::Item;
use crate::quadrature::LatentGrid;

/// One entry of the moment vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MomentTerm {
    Univariate(usize),
    /// Item pair with `i > j`
    Bivariate(usize, usize),
}

#[derive(Debug, Clone)]
pub struct MomentLayout {
    n_items: usize,
    pairs: Vec<(usize, usize)>,
}

impl MomentLayout {
    pub fn new(n_items: usize) -> Self {
        let mut pairs = Vec::with_capacity(n_items * n_items.saturating_sub(1) / 2);
        for i in 1..n_items {
            for j in 0..i {
                pairs.push((i, j));
            }
        }
        Self { n_items, pairs }
    }

    pub fn n_items(&self) -> usize {
        self.n_items
    }

    pub fn len(&self) -> usize {
        self.n_items + self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.n_items == 0
    }

    pub fn pairs(&self) -> &[(usize, usize)] {
        &self.pairs
    }

    pub fn term(&self, index: usize) -> MomentTerm {
        if index < self.n_items {
            MomentTerm::Univariate(index)
        } else {
            let (i, j) = self.pairs[index - self.n_items];
            MomentTerm::Bivariate(i, j)
        }
    }

    /// Position of the pair `(i, j)`, in either order, in the moment vector.
    pub fn pair_index(&self, i: usize, j: usize) -> usize {
        let (hi, lo) = if i > j { (i, j) } else { (j, i) };
        self.n_items + hi * (hi - 1) / 2 + lo
    }

    /// Flatten univariate means and a symmetric cross-product matrix.
    pub fn flatten(&self, first: &Array1<f64>, cross: &Array2<f64>) -> Array1<f64> {
        let mut out = Array1::zeros(self.len());
        for i in 0..self.n_items {
            out[i] = first[i];
        }
        for (k, &(i, j)) in self.pairs.iter().enumerate() {
            out[self.n_items + k] = cross[[i, j]];
        }
        out
    }
}

/// Conditional score moments at every grid point.
#[derive(Debug, Clone)]
pub struct GridMoments {
    /// Conditional expected score, shape `(n_points, n_items)`
    pub first: Array2<f64>,
    /// Conditional expected squared score, shape `(n_points, n_items)`
    pub second: Array2<f64>,
}

pub fn evaluate_grid(items: &[Item], grid: &LatentGrid) -> GridMoments {
    let n_points = grid.n_points();
    let n_items = items.len();

    let per_item: Vec<(Vec<f64>, Vec<f64>)> = items
        .par_iter()
        .map(|item| {
            let trace = item.probability_trace(grid.points.view());
            let rule = item.score_rule();
            let first = trace.rows().into_iter().map(|p| rule.expected(p)).collect();
            let second = trace
                .rows()
                .into_iter()
                .map(|p| rule.expected_square(p))
                .collect();
            (first, second)
        })
        .collect();

    let mut first = Array2::zeros((n_points, n_items));
    let mut second = Array2::zeros((n_points, n_items));
    for (i, (m1, m2)) in per_item.into_iter().enumerate() {
        for q in 0..n_points {
            first[[q, i]] = m1[q];
            second[[q, i]] = m2[q];
        }
    }

    GridMoments { first, second }
}

/// Model-implied moments integrated over the prior.
#[derive(Debug, Clone)]
pub struct ExpectedMoments {
    pub e1: Array1<f64>,
    pub e11: Array1<f64>,
    /// Symmetric cross-products with `e11` on the diagonal
    pub e2: Array2<f64>,
}

impl ExpectedMoments {
    pub fn vector(&self, layout: &MomentLayout) -> Array1<f64> {
        layout.flatten(&self.e1, &self.e2)
    }

    /// Model-implied correlations between item scores.
    pub fn correlations(&self) -> Array2<f64> {
        correlations_from(&self.e1, &self.e2)
    }
}

pub fn expected_moments(grid_moments: &GridMoments, grid: &LatentGrid) -> ExpectedMoments {
    let prior = &grid.prior;
    let e1 = grid_moments.first.t().dot(prior);
    let e11 = grid_moments.second.t().dot(prior);

    let weighted = &grid_moments.first * &prior.view().insert_axis(Axis(1));
    let mut e2 = grid_moments.first.t().dot(&weighted);
    let n_items = e1.len();
    for i in 0..n_items {
        for j in 0..i {
            let v = 0.5 * (e2[[i, j]] + e2[[j, i]]);
            e2[[i, j]] = v;
            e2[[j, i]] = v;
        }
        e2[[i, i]] = e11[i];
    }

    ExpectedMoments { e1, e11, e2 }
}

/// Sample moments of the scored responses.
#[derive(Debug, Clone)]
pub struct ObservedMoments {
    pub n: usize,
    pub p1: Array1<f64>,
    /// Mean cross-products; the diagonal holds mean squared scores
    pub p2: Array2<f64>,
}

impl ObservedMoments {
    pub fn vector(&self, layout: &MomentLayout) -> Array1<f64> {
        layout.flatten(&self.p1, &self.p2)
    }

    pub fn correlations(&self) -> Array2<f64> {
        correlations_from(&self.p1, &self.p2)
    }
}

/// Score complete responses with each item's scoring rule and average.
pub fn observed_moments(data: ArrayView2<i32>, items: &[Item]) -> Result<ObservedMoments> {
    let n = data.nrows();
    let n_items = items.len();
    if data.ncols() != n_items {
        return Err(M2Error::Dimension(format!(
            "{} response columns for {} items",
            data.ncols(),
            n_items
        )));
    }
    if n == 0 {
        return Err(M2Error::Configuration("no respondents in group".into()));
    }
    if data.iter().any(|&r| r < 0) {
        return Err(M2Error::MissingInput(
            "observed moments require complete responses".into(),
        ));
    }

    let mut scores = Array2::zeros((n, n_items));
    for ((i, j), &r) in data.indexed_iter() {
        scores[[i, j]] = items[j].score_rule().score(r as usize);
    }
    let p1 = scores.sum_axis(Axis(0)) / n as f64;
    let p2 = scores.t().dot(&scores) / n as f64;

    Ok(ObservedMoments { n, p1, p2 })
}

fn correlations_from(mean: &Array1<f64>, cross: &Array2<f64>) -> Array2<f64> {
    let n_items = mean.len();
    let sd: Vec<f64> = (0..n_items)
        .map(|i| (cross[[i, i]] - mean[i] * mean[i]).max(0.0).sqrt())
        .collect();
    for (i, &s) in sd.iter().enumerate() {
        if s <= 0.0 || !s.is_finite() {
            log::warn!("item {i} has zero score variance; its correlations are undefined (NaN)");
        }
    }
    Array2::from_shape_fn((n_items, n_items), |(i, j)| {
        if i == j {
            1.0
        } else {
            (cross[[i, j]] - mean[i] * mean[j]) / (sd[i] * sd[j])
        }
    })
}
