//! Asymptotic covariance (Xi2) of the univariate and bivariate moments.
//!
//! Under local independence the conditional expectation of a product of
//! item scores factors across distinct items, so every entry is an integral
//! over the grid of products of conditional first and second score moments.

use ndarray::{Array1, Array2};
use rayon::prelude::*;

use crate::moments::{GridMoments, MomentLayout, MomentTerm};

/// Items of a moment term; the second slot is unused for univariate terms.
#[inline]
fn term_items(term: MomentTerm) -> ([usize; 2], usize) {
    match term {
        MomentTerm::Univariate(i) => ([i, 0], 1),
        MomentTerm::Bivariate(i, j) => ([i, j], 2),
    }
}

/// `E[y_a y_b]` integrated over the prior.
fn joint_moment(
    a: MomentTerm,
    b: MomentTerm,
    grid_moments: &GridMoments,
    prior: &Array1<f64>,
) -> f64 {
    let (items_a, na) = term_items(a);
    let (items_b, nb) = term_items(b);

    // (item, power) with each item listed once
    let mut factors: [(usize, u8); 4] = [(0, 0); 4];
    let mut n_factors = 0;
    for &item in items_a[..na].iter().chain(items_b[..nb].iter()) {
        match factors[..n_factors].iter_mut().find(|(it, _)| *it == item) {
            Some(entry) => entry.1 += 1,
            None => {
                factors[n_factors] = (item, 1);
                n_factors += 1;
            }
        }
    }

    let first = &grid_moments.first;
    let second = &grid_moments.second;
    let mut total = 0.0;
    for q in 0..prior.len() {
        let mut prod = prior[q];
        for &(item, power) in &factors[..n_factors] {
            prod *= if power == 1 {
                first[[q, item]]
            } else {
                second[[q, item]]
            };
        }
        total += prod;
    }
    total
}

/// Build Xi2 for the moment vector described by `layout`.
///
/// Only the upper triangle is evaluated and mirrored, so the result is
/// exactly symmetric. It is positive semidefinite up to rounding for any
/// valid set of probability traces.
pub fn build_xi2(
    grid_moments: &GridMoments,
    prior: &Array1<f64>,
    layout: &MomentLayout,
) -> Array2<f64> {
    let n_moments = layout.len();
    let terms: Vec<MomentTerm> = (0..n_moments).map(|a| layout.term(a)).collect();

    let expected: Vec<f64> = terms
        .par_iter()
        .map(|&t| {
            let (items, n) = term_items(t);
            let first = &grid_moments.first;
            (0..prior.len())
                .map(|q| {
                    items[..n]
                        .iter()
                        .fold(prior[q], |acc, &i| acc * first[[q, i]])
                })
                .sum()
        })
        .collect();

    let rows: Vec<Vec<f64>> = (0..n_moments)
        .into_par_iter()
        .map(|a| {
            (a..n_moments)
                .map(|b| {
                    joint_moment(terms[a], terms[b], grid_moments, prior)
                        - expected[a] * expected[b]
                })
                .collect()
        })
        .collect();

    let mut xi2 = Array2::zeros((n_moments, n_moments));
    for (a, row) in rows.iter().enumerate() {
        for (offset, &val) in row.iter().enumerate() {
            let b = a + offset;
            xi2[[a, b]] = val;
            xi2[[b, a]] = val;
        }
    }
    xi2
}
