//! Derivatives of the expected moment vector with respect to free item
//! parameters.

use std::collections::BTreeMap;

use ndarray::{s, Array2};
use rayon::prelude::*;

use crate::error::{M2Error, Result};
use crate::items::Item;
use crate::moments::{GridMoments, MomentLayout};
use crate::quadrature::LatentGrid;

/// Moment-by-parameter derivative matrix.
#[derive(Debug, Clone)]
pub struct Jacobian {
    /// Shape `(n_moments, n_free)`
    pub matrix: Array2<f64>,
    /// Global free-parameter index of each column, ascending
    pub columns: Vec<usize>,
}

impl Jacobian {
    pub fn n_free(&self) -> usize {
        self.columns.len()
    }
}

/// Assemble the Jacobian of the moment vector.
///
/// Columns follow the global free-parameter numbering; parameters shared
/// through equality constraints map to a single column and their
/// contributions add. Fixed parameters never produce a column.
/// `expected_columns` is the number of free item parameters the caller
/// declares for this group; any mismatch is a [`M2Error::Dimension`].
pub fn build_jacobian(
    items: &[Item],
    grid: &LatentGrid,
    grid_moments: &GridMoments,
    layout: &MomentLayout,
    expected_columns: usize,
) -> Result<Jacobian> {
    let n_items = items.len();
    if layout.n_items() != n_items {
        return Err(M2Error::Dimension(format!(
            "moment layout covers {} items, model has {}",
            layout.n_items(),
            n_items
        )));
    }

    let columns: Vec<usize> = items
        .iter()
        .flat_map(|item| item.free_parameters().map(|(_, g)| g))
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    let col_of: BTreeMap<usize, usize> = columns
        .iter()
        .enumerate()
        .map(|(c, &g)| (g, c))
        .collect();

    let prior = &grid.prior;
    let n_points = grid.n_points();
    let first = &grid_moments.first;

    // (column, [(row, value)]) per free parameter of each item
    let contributions: Vec<Vec<(usize, Vec<(usize, f64)>)>> = items
        .par_iter()
        .enumerate()
        .map(|(i, item)| {
            let free: Vec<(usize, usize)> = item.free_parameters().collect();
            if free.is_empty() {
                return Vec::new();
            }
            let deriv = item.derivative(grid.points.view());
            let rule = item.score_rule();
            free.into_iter()
                .map(|(p, g)| {
                    let dm: Vec<f64> = (0..n_points)
                        .map(|q| rule.expected(deriv.slice(s![p, q, ..])))
                        .collect();
                    let mut entries = Vec::with_capacity(n_items);
                    let d_e1: f64 = (0..n_points).map(|q| prior[q] * dm[q]).sum();
                    entries.push((i, d_e1));
                    for j in 0..n_items {
                        if j == i {
                            continue;
                        }
                        let d_e2: f64 = (0..n_points)
                            .map(|q| prior[q] * dm[q] * first[[q, j]])
                            .sum();
                        entries.push((layout.pair_index(i, j), d_e2));
                    }
                    (col_of[&g], entries)
                })
                .collect()
        })
        .collect();

    let mut matrix = Array2::zeros((layout.len(), columns.len()));
    for item_contrib in contributions {
        for (col, entries) in item_contrib {
            for (row, value) in entries {
                matrix[[row, col]] += value;
            }
        }
    }

    if matrix.nrows() != layout.len() || matrix.ncols() != expected_columns {
        return Err(M2Error::Dimension(format!(
            "Jacobian is {}x{}, expected {}x{}",
            matrix.nrows(),
            matrix.ncols(),
            layout.len(),
            expected_columns
        )));
    }

    Ok(Jacobian { matrix, columns })
}
