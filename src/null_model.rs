//! Independence (null) model and the incremental fit indices TLI and CFI.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::error::{M2Error, Result};
use crate::items::{Item, ItemKind};
use crate::m2::group_statistic;
use crate::quadrature::LatentGrid;

/// Statistic and degrees of freedom of a fitted null model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NullStatistic {
    pub statistic: f64,
    pub df: usize,
}

/// Zero-slope items reproducing each item's observed category proportions.
///
/// Intercepts are the closed-form maximum-likelihood values
/// `ln(p_k / p_0)`. Each item keeps one free location parameter (a common
/// shift of its non-reference logits); with zero slopes the moments depend
/// on an item only through its mean score, so further intercepts would not
/// be identified. A category that was never observed has a divergent
/// intercept and is reported as a convergence failure.
pub fn independence_items(items: &[Item], data: ArrayView2<i32>) -> Result<Vec<Item>> {
    let n = data.nrows();
    items
        .iter()
        .enumerate()
        .map(|(j, item)| {
            let k = item.n_categories();
            let mut counts = vec![0usize; k];
            for &r in data.column(j) {
                if r >= 0 && (r as usize) < k {
                    counts[r as usize] += 1;
                }
            }
            if let Some(empty) = counts.iter().position(|&c| c == 0) {
                return Err(M2Error::NullModelConvergence(format!(
                    "category {empty} of item '{}' is never observed in {n} responses",
                    item.name()
                )));
            }

            let mut params = vec![0.0; 1 + 2 * k];
            for c in 0..k {
                params[1 + c] = c as f64;
                params[1 + k + c] = (counts[c] as f64 / counts[0] as f64).ln();
            }
            let mut free = vec![None; params.len()];
            for c in 1..k {
                free[1 + k + c] = Some(j);
            }
            Item::new(format!("{}_null", item.name()), ItemKind::Nominal, 1, k, params)?
                .with_free_index(free)?
                .with_score_rule(item.score_rule().clone())
        })
        .collect()
}

/// Fit the independence model to complete `data` and compute its statistic.
///
/// Every failure of the null fit surfaces as
/// [`M2Error::NullModelConvergence`].
pub fn null_statistic(items: &[Item], data: ArrayView2<i32>) -> Result<NullStatistic> {
    let fit = || -> Result<NullStatistic> {
        let null_items = independence_items(items, data)?;
        let n_free = null_items.len();
        let grid = LatentGrid::point_mass(1);
        let stat = group_statistic(&null_items, &grid, data, n_free)?;
        Ok(NullStatistic {
            statistic: stat.statistic,
            df: stat.n_moments - n_free,
        })
    };
    fit().map_err(|e| match e {
        M2Error::NullModelConvergence(_) => e,
        other => M2Error::NullModelConvergence(other.to_string()),
    })
}

/// Tucker-Lewis and comparative fit indices, clamped to `[0, 1]`.
/// Non-finite values are omitted.
pub fn incremental_indices(
    statistic: f64,
    df: usize,
    null: NullStatistic,
) -> (Option<f64>, Option<f64>) {
    let df = df as f64;
    let null_df = null.df as f64;
    let null_ratio = null.statistic / null_df;

    let tli = (null_ratio - statistic / df) / (null_ratio - 1.0);
    let cfi = 1.0 - (statistic - df) / (null.statistic - null_df);

    let clamp = |v: f64| v.is_finite().then(|| v.clamp(0.0, 1.0));
    (clamp(tli), clamp(cfi))
}
