//! M2 entry point: options, result record and the group aggregator.
//!
//! A call runs quadrature, moments, Jacobian and weights for every group,
//! solves the quadratic form per group and pools groups when there is more
//! than one. Missing data are routed through [`crate::imputation`], which
//! reruns this pipeline on each imputed dataset.

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};

use crate::error::{M2Error, Result};
use crate::imputation::{self, ImputationSpread};
use crate::items::Item;
use crate::jacobian::build_jacobian;
use crate::model::{FittedModel, LatentDistribution};
use crate::moments::{
    evaluate_grid, expected_moments, observed_moments, ExpectedMoments, MomentLayout,
    ObservedMoments,
};
use crate::null_model::{incremental_indices, null_statistic, NullStatistic};
use crate::quadrature::{build_grid, LatentGrid};
use crate::solver::{
    chi_square_p_value, m2_statistic, residual_matrix, rmsea, rmsea_interval, srmsr,
};
use crate::weights::build_xi2;

/// Options for [`compute_m2`].
///
/// Deserializes from partial input; absent fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct M2Options {
    /// Fit the independence model and report TLI/CFI
    pub calc_null: bool,
    /// Points per dimension (rectangular) or total points (quasi-Monte Carlo)
    pub quadrature_points: Option<usize>,
    /// Per-respondent latent-trait estimates, shape `(N, n_factors)`
    pub latent_estimates: Option<Array2<f64>>,
    pub imputations: usize,
    pub confidence_level: f64,
    pub return_residual_matrix: bool,
    pub use_quasi_monte_carlo: bool,
    /// Residuals smaller in magnitude are set to NaN; `None` behaves as 1.0
    pub suppress_threshold: Option<f64>,
    /// Omit TLI/CFI instead of failing when the null model cannot be fitted
    pub best_effort_null: bool,
    /// Precomputed null-model fit used instead of refitting
    pub null_statistic: Option<NullStatistic>,
    pub seed: u64,
}

impl Default for M2Options {
    fn default() -> Self {
        Self {
            calc_null: true,
            quadrature_points: None,
            latent_estimates: None,
            imputations: 0,
            confidence_level: 0.9,
            return_residual_matrix: false,
            use_quasi_monte_carlo: false,
            suppress_threshold: None,
            best_effort_null: false,
            null_statistic: None,
            seed: 0,
        }
    }
}

impl M2Options {
    pub fn validate(&self) -> Result<()> {
        let level = self.confidence_level;
        if !level.is_finite() || level <= 0.0 || level >= 1.0 {
            return Err(M2Error::Configuration(format!(
                "confidence level must lie in (0, 1), got {level}"
            )));
        }
        if self.quadrature_points == Some(0) {
            return Err(M2Error::Configuration(
                "quadrature point count must be positive".into(),
            ));
        }
        if let Some(t) = self.suppress_threshold {
            if !t.is_finite() || !(0.0..=1.0).contains(&t) {
                return Err(M2Error::Configuration(format!(
                    "suppression threshold must be a finite value in [0, 1], got {t}"
                )));
            }
            if t < 1.0 && !self.return_residual_matrix {
                return Err(M2Error::Configuration(
                    "suppression threshold requires residual-matrix mode".into(),
                ));
            }
        }
        if let Some(null) = self.null_statistic {
            if null.df == 0 || !null.statistic.is_finite() || null.statistic < 0.0 {
                return Err(M2Error::Configuration(format!(
                    "invalid null statistic {} on {} df",
                    null.statistic, null.df
                )));
            }
        }
        if let Some(est) = &self.latent_estimates {
            if est.iter().any(|v| !v.is_finite()) {
                return Err(M2Error::Configuration(
                    "latent-trait estimates must be finite".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Fit statistics for a model or one of its groups.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitResult {
    pub statistic: f64,
    pub df: usize,
    pub p_value: f64,
    pub rmsea: f64,
    pub rmsea_lower: f64,
    pub rmsea_upper: f64,
    /// Absent unless every item is dichotomous, graded or GPCM
    pub srmsr: Option<f64>,
    pub tli: Option<f64>,
    pub cfi: Option<f64>,
    pub n_respondents: usize,
    pub per_group: Option<Vec<FitResult>>,
    /// Reason TLI/CFI are missing under best-effort null fitting
    pub null_model_failure: Option<String>,
    pub imputation_spread: Option<ImputationSpread>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum M2Output {
    Fit(FitResult),
    /// One lower-triangular residual correlation matrix per group
    Residuals(Vec<Array2<f64>>),
}

impl M2Output {
    pub fn fit(&self) -> Option<&FitResult> {
        match self {
            M2Output::Fit(fit) => Some(fit),
            M2Output::Residuals(_) => None,
        }
    }

    pub fn residuals(&self) -> Option<&[Array2<f64>]> {
        match self {
            M2Output::Residuals(res) => Some(res),
            M2Output::Fit(_) => None,
        }
    }

    pub fn into_fit(self) -> Option<FitResult> {
        match self {
            M2Output::Fit(fit) => Some(fit),
            M2Output::Residuals(_) => None,
        }
    }
}

/// Compute M2 and its derived indices on rayon's global pool.
pub fn compute_m2(model: &FittedModel, options: &M2Options) -> Result<M2Output> {
    check_request(model, options)?;
    if model.has_missing() {
        imputation::pooled_m2(model, options)
    } else {
        run_pipeline(model, model.responses(), options)
    }
}

/// [`compute_m2`] with all parallel work confined to `pool`.
pub fn compute_m2_in(
    pool: &ThreadPool,
    model: &FittedModel,
    options: &M2Options,
) -> Result<M2Output> {
    pool.install(|| compute_m2(model, options))
}

fn check_request(model: &FittedModel, options: &M2Options) -> Result<()> {
    options.validate()?;
    if model.is_mixed_effects() {
        return Err(M2Error::UnsupportedModel(
            "M2 is not available for mixed-effects models".into(),
        ));
    }
    if options.return_residual_matrix {
        if let Some(item) = model
            .groups()
            .iter()
            .flat_map(|g| g.items.iter())
            .find(|item| !item.kind().supports_srmsr())
        {
            return Err(M2Error::UnsupportedModel(format!(
                "residual correlations require dichotomous, graded or GPCM items; '{}' is {}",
                item.name(),
                item.kind().name()
            )));
        }
    }
    if model.has_missing() {
        if options.imputations == 0 || options.latent_estimates.is_none() {
            return Err(M2Error::MissingInput(
                "responses contain missing values; supply imputations and latent-trait estimates"
                    .into(),
            ));
        }
    } else if options.imputations > 0 {
        log::warn!(
            "{} imputations requested but no responses are missing; computing on observed data",
            options.imputations
        );
    }
    Ok(())
}

/// Everything a single group needs, owned or borrowed per call.
struct GroupContext<'a> {
    group: usize,
    name: &'a str,
    items: &'a [Item],
    latent: &'a LatentDistribution,
    data: Array2<i32>,
    /// Free item parameters entering this group's Jacobian
    jacobian_columns: usize,
    /// Free parameters subtracted from this group's moment count
    df_parameters: usize,
}

fn group_contexts<'a>(model: &'a FittedModel, data: ArrayView2<i32>) -> Result<Vec<GroupContext<'a>>> {
    let single = model.n_groups() == 1;
    model
        .groups()
        .iter()
        .enumerate()
        .map(|(g, group)| {
            let (jacobian_columns, df_parameters) = if single {
                let columns = model
                    .nest()
                    .checked_sub(group.structural_free)
                    .ok_or_else(|| {
                        M2Error::Dimension(format!(
                            "{} structural parameters exceed the model's {} free parameters",
                            group.structural_free,
                            model.nest()
                        ))
                    })?;
                (columns, model.nest())
            } else {
                (group.item_free_indices().len(), group.n_free())
            };
            Ok(GroupContext {
                group: g,
                name: &group.name,
                items: &group.items,
                latent: &group.latent,
                data: model.group_rows(data, g),
                jacobian_columns,
                df_parameters,
            })
        })
        .collect()
}

/// Statistic and moments of one group on a fixed grid.
pub(crate) struct GroupStatistic {
    pub statistic: f64,
    pub n_moments: usize,
    pub n: usize,
    pub observed: ObservedMoments,
    pub expected: ExpectedMoments,
}

pub(crate) fn group_statistic(
    items: &[Item],
    grid: &LatentGrid,
    data: ArrayView2<i32>,
    jacobian_columns: usize,
) -> Result<GroupStatistic> {
    let layout = MomentLayout::new(items.len());
    let observed = observed_moments(data, items)?;
    let grid_moments = evaluate_grid(items, grid);
    let expected = expected_moments(&grid_moments, grid);

    let (jacobian, xi2) = rayon::join(
        || build_jacobian(items, grid, &grid_moments, &layout, jacobian_columns),
        || build_xi2(&grid_moments, &grid.prior, &layout),
    );
    let jacobian = jacobian?;
    let statistic = m2_statistic(
        &jacobian.matrix,
        &xi2,
        &observed.vector(&layout),
        &expected.vector(&layout),
        observed.n,
    )?;

    Ok(GroupStatistic {
        statistic,
        n_moments: layout.len(),
        n: observed.n,
        observed,
        expected,
    })
}

fn summarize(statistic: f64, df: usize, n: usize, level: f64) -> FitResult {
    let (rmsea_lower, rmsea_upper) = rmsea_interval(statistic, df, n, level);
    FitResult {
        statistic,
        df,
        p_value: chi_square_p_value(statistic, df),
        rmsea: rmsea(statistic, df, n),
        rmsea_lower,
        rmsea_upper,
        srmsr: None,
        tli: None,
        cfi: None,
        n_respondents: n,
        per_group: None,
        null_model_failure: None,
        imputation_spread: None,
    }
}

fn srmsr_eligible(items: &[Item]) -> bool {
    items.iter().all(|item| item.kind().supports_srmsr())
}

fn fit_group(ctx: &GroupContext, options: &M2Options) -> Result<(FitResult, usize)> {
    let n_moments = MomentLayout::new(ctx.items.len()).len();
    let df = n_moments
        .checked_sub(ctx.df_parameters)
        .filter(|&df| df > 0)
        .ok_or(M2Error::InsufficientDegreesOfFreedom {
            moments: n_moments,
            parameters: ctx.df_parameters,
        })?;

    let grid = build_grid(
        ctx.latent,
        options.quadrature_points,
        options.use_quasi_monte_carlo,
    )?;
    let stat = group_statistic(ctx.items, &grid, ctx.data.view(), ctx.jacobian_columns)?;
    log::debug!(
        "group {} ('{}'): M2 = {:.4} over {} moments, df = {}",
        ctx.group,
        ctx.name,
        stat.statistic,
        stat.n_moments,
        df
    );

    let mut fit = summarize(stat.statistic, df, stat.n, options.confidence_level);
    if srmsr_eligible(ctx.items) {
        fit.srmsr = Some(srmsr(
            &stat.observed.correlations(),
            &stat.expected.correlations(),
        ));
    }
    Ok((fit, stat.n_moments))
}

fn group_residuals(ctx: &GroupContext, options: &M2Options) -> Result<Array2<f64>> {
    let grid = build_grid(
        ctx.latent,
        options.quadrature_points,
        options.use_quasi_monte_carlo,
    )?;
    let observed = observed_moments(ctx.data.view(), ctx.items)?;
    let expected = expected_moments(&evaluate_grid(ctx.items, &grid), &grid);
    Ok(residual_matrix(
        &observed.correlations(),
        &expected.correlations(),
        options.suppress_threshold,
    ))
}

fn attach_null(
    fit: &mut FitResult,
    options: &M2Options,
    fit_null: impl FnOnce() -> Result<NullStatistic>,
) -> Result<()> {
    let null = match options.null_statistic {
        Some(null) => Ok(null),
        None => fit_null(),
    };
    match null {
        Ok(null) => {
            let (tli, cfi) = incremental_indices(fit.statistic, fit.df, null);
            fit.tli = tli;
            fit.cfi = cfi;
        }
        Err(err) if options.best_effort_null => {
            log::warn!("TLI and CFI omitted: {err}");
            fit.null_model_failure = Some(err.to_string());
        }
        Err(err) => return Err(err),
    }
    Ok(())
}

/// Run the full pipeline on complete `data` laid out like the model's
/// responses.
pub(crate) fn run_pipeline(
    model: &FittedModel,
    data: ArrayView2<i32>,
    options: &M2Options,
) -> Result<M2Output> {
    let contexts = group_contexts(model, data)?;

    if options.return_residual_matrix {
        let residuals = contexts
            .par_iter()
            .map(|ctx| group_residuals(ctx, options))
            .collect::<Result<Vec<_>>>()?;
        return Ok(M2Output::Residuals(residuals));
    }

    if contexts.len() == 1 {
        let ctx = &contexts[0];
        let (mut fit, _) = fit_group(ctx, options)?;
        if options.calc_null {
            attach_null(&mut fit, options, || {
                null_statistic(ctx.items, ctx.data.view())
            })?;
        }
        return Ok(M2Output::Fit(fit));
    }

    let fits = contexts
        .par_iter()
        .map(|ctx| fit_group(ctx, options))
        .collect::<Result<Vec<_>>>()?;

    let statistic: f64 = fits.iter().map(|(fit, _)| fit.statistic).sum();
    let n_moments: usize = fits.iter().map(|(_, m)| m).sum();
    let n: usize = fits.iter().map(|(fit, _)| fit.n_respondents).sum();
    let df = n_moments
        .checked_sub(model.nest())
        .filter(|&df| df > 0)
        .ok_or(M2Error::InsufficientDegreesOfFreedom {
            moments: n_moments,
            parameters: model.nest(),
        })?;
    log::debug!(
        "pooled {} groups: M2 = {statistic:.4}, df = {df}",
        contexts.len()
    );

    let mut pooled = summarize(statistic, df, n, options.confidence_level);
    pooled.per_group = Some(fits.into_iter().map(|(fit, _)| fit).collect());
    if options.calc_null {
        attach_null(&mut pooled, options, || {
            let nulls = contexts
                .par_iter()
                .map(|ctx| null_statistic(ctx.items, ctx.data.view()))
                .collect::<Result<Vec<_>>>()?;
            Ok(NullStatistic {
                statistic: nulls.iter().map(|n| n.statistic).sum(),
                df: nulls.iter().map(|n| n.df).sum(),
            })
        })?;
    }
    Ok(M2Output::Fit(pooled))
}
