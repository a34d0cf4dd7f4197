//! Fitted-model handle consumed by the fit statistics.

use std::collections::BTreeSet;

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::error::{M2Error, Result};
use crate::items::Item;
use crate::utils::MISSING;

/// Latent-trait distribution of one group.
#[derive(Debug, Clone)]
pub enum LatentDistribution {
    /// Multivariate normal with the given mean and covariance.
    Gaussian { mean: Array1<f64>, cov: Array2<f64> },
    /// Caller-supplied discrete grid (mixture / latent class style models).
    Discrete { grid: Array2<f64>, prior: Array1<f64> },
}

impl LatentDistribution {
    pub fn standard_normal(n_factors: usize) -> Self {
        LatentDistribution::Gaussian {
            mean: Array1::zeros(n_factors),
            cov: Array2::eye(n_factors),
        }
    }

    pub fn n_factors(&self) -> usize {
        match self {
            LatentDistribution::Gaussian { mean, .. } => mean.len(),
            LatentDistribution::Discrete { grid, .. } => grid.ncols(),
        }
    }
}

/// Items and latent distribution of one group.
#[derive(Debug, Clone)]
pub struct GroupModel {
    pub name: String,
    pub items: Vec<Item>,
    pub latent: LatentDistribution,
    /// Free latent mean/covariance parameters estimated for this group.
    pub structural_free: usize,
}

impl GroupModel {
    pub fn new(name: impl Into<String>, items: Vec<Item>, latent: LatentDistribution) -> Self {
        Self {
            name: name.into(),
            items,
            latent,
            structural_free: 0,
        }
    }

    pub fn with_structural_free(mut self, structural_free: usize) -> Self {
        self.structural_free = structural_free;
        self
    }

    /// Distinct global free indices used by this group's items, ascending.
    pub fn item_free_indices(&self) -> Vec<usize> {
        let set: BTreeSet<usize> = self
            .items
            .iter()
            .flat_map(|item| item.free_parameters().map(|(_, g)| g))
            .collect();
        set.into_iter().collect()
    }

    /// Free parameters attributable to this group alone.
    pub fn n_free(&self) -> usize {
        self.item_free_indices().len() + self.structural_free
    }
}

/// A fitted (single- or multi-group) IRT model and its response data.
#[derive(Debug, Clone)]
pub struct FittedModel {
    responses: Array2<i32>,
    group_of: Vec<usize>,
    groups: Vec<GroupModel>,
    nest: usize,
    mixed_effects: bool,
}

impl FittedModel {
    /// Single-group model. `responses` are 0-indexed categories with
    /// negative codes for missing values.
    pub fn new(
        responses: Array2<i32>,
        items: Vec<Item>,
        latent: LatentDistribution,
        nest: usize,
    ) -> Result<Self> {
        let n = responses.nrows();
        Self::multiple_group(
            responses,
            vec![0; n],
            vec![GroupModel::new("all", items, latent)],
            nest,
        )
    }

    /// Multi-group model; `group_of[row]` selects the group of each respondent.
    pub fn multiple_group(
        responses: Array2<i32>,
        group_of: Vec<usize>,
        groups: Vec<GroupModel>,
        nest: usize,
    ) -> Result<Self> {
        if groups.is_empty() {
            return Err(M2Error::Configuration("model has no groups".into()));
        }
        if group_of.len() != responses.nrows() {
            return Err(M2Error::Dimension(format!(
                "{} group labels for {} response rows",
                group_of.len(),
                responses.nrows()
            )));
        }
        if let Some(&bad) = group_of.iter().find(|&&g| g >= groups.len()) {
            return Err(M2Error::Configuration(format!(
                "group label {bad} out of range for {} groups",
                groups.len()
            )));
        }

        let n_items = responses.ncols();
        let n_factors = groups[0].latent.n_factors();
        for group in &groups {
            if group.items.len() != n_items {
                return Err(M2Error::Dimension(format!(
                    "group '{}' has {} items but the data have {} columns",
                    group.name,
                    group.items.len(),
                    n_items
                )));
            }
            if group.latent.n_factors() != n_factors
                || group.items.iter().any(|it| it.n_factors() != n_factors)
            {
                return Err(M2Error::Dimension(format!(
                    "group '{}' does not match the model's {} latent factors",
                    group.name, n_factors
                )));
            }
        }

        for ((row, col), &resp) in responses.indexed_iter() {
            if resp < 0 {
                continue;
            }
            let n_cat = groups[group_of[row]].items[col].n_categories();
            if resp as usize >= n_cat {
                return Err(M2Error::Configuration(format!(
                    "response {resp} at row {row}, item {col} exceeds {n_cat} categories"
                )));
            }
        }

        Ok(Self {
            responses,
            group_of,
            groups,
            nest,
            mixed_effects: false,
        })
    }

    pub fn with_mixed_effects(mut self, mixed_effects: bool) -> Self {
        self.mixed_effects = mixed_effects;
        self
    }

    pub fn responses(&self) -> ArrayView2<'_, i32> {
        self.responses.view()
    }

    pub fn group_of(&self) -> &[usize] {
        &self.group_of
    }

    pub fn groups(&self) -> &[GroupModel] {
        &self.groups
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn n_items(&self) -> usize {
        self.responses.ncols()
    }

    pub fn n_respondents(&self) -> usize {
        self.responses.nrows()
    }

    pub fn n_factors(&self) -> usize {
        self.groups[0].latent.n_factors()
    }

    /// Total number of free parameters across the full model.
    pub fn nest(&self) -> usize {
        self.nest
    }

    pub fn is_mixed_effects(&self) -> bool {
        self.mixed_effects
    }

    pub fn has_missing(&self) -> bool {
        self.responses.iter().any(|&r| r < 0)
    }

    /// Rows of `data` that belong to group `g`.
    pub fn group_rows(&self, data: ArrayView2<i32>, g: usize) -> Array2<i32> {
        let rows: Vec<usize> = self
            .group_of
            .iter()
            .enumerate()
            .filter(|(_, grp)| **grp == g)
            .map(|(i, _)| i)
            .collect();
        data.select(Axis(0), &rows)
    }

    /// Categories observed at least once for each item.
    pub fn observed_support(&self) -> Vec<Vec<usize>> {
        self.responses
            .columns()
            .into_iter()
            .map(|col| {
                let set: BTreeSet<usize> = col
                    .iter()
                    .filter(|&&r| r >= 0)
                    .map(|&r| r as usize)
                    .collect();
                set.into_iter().collect()
            })
            .collect()
    }
}

/// Shift raw responses so each item's lowest observed category is 0.
/// Entries equal to `missing_code` become [`MISSING`].
pub fn normalize_responses(raw: ArrayView2<i32>, missing_code: i32) -> Array2<i32> {
    let mut out = Array2::from_elem(raw.dim(), MISSING);
    for (j, col) in raw.columns().into_iter().enumerate() {
        let min = col
            .iter()
            .filter(|&&r| r != missing_code)
            .min()
            .copied()
            .unwrap_or(0);
        for (i, &r) in col.iter().enumerate() {
            if r != missing_code {
                out[[i, j]] = r - min;
            }
        }
    }
    out
}
