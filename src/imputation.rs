//! Imputation of missing responses from the fitted model and pooling of
//! fit results across imputed datasets.

use ndarray::{s, Array2};
use rand::prelude::*;
use rand_pcg::Pcg64;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::Serialize;

use crate::error::{M2Error, Result};
use crate::m2::{run_pipeline, FitResult, M2Options, M2Output};
use crate::model::FittedModel;
use crate::utils::{sample_category, EPSILON};

/// Root-mean-square deviation of each pooled quantity from its mean.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImputationSpread {
    pub draws: usize,
    pub statistic: f64,
    pub p_value: f64,
    pub rmsea: f64,
    pub srmsr: Option<f64>,
    pub tli: Option<f64>,
    pub cfi: Option<f64>,
}

/// Fill every missing response once, drawing from the item's category
/// probabilities at the respondent's latent-trait estimate.
///
/// Draws are restricted to categories observed somewhere in the item.
pub fn impute_missing(
    model: &FittedModel,
    estimates: &Array2<f64>,
    seed: u64,
) -> Result<Array2<i32>> {
    let support = checked_support(model)?;
    check_estimates(model, estimates)?;
    Ok(impute_draw(model, estimates, &support, seed))
}

/// One imputed dataset per estimate matrix.
pub fn impute_missing_many(
    model: &FittedModel,
    estimates: &[Array2<f64>],
    seed: u64,
) -> Result<Vec<Array2<i32>>> {
    let support = checked_support(model)?;
    for est in estimates {
        check_estimates(model, est)?;
    }
    let n = model.n_respondents();
    Ok(estimates
        .par_iter()
        .enumerate()
        .map(|(draw, est)| impute_draw(model, est, &support, draw_seed(seed, draw, n)))
        .collect())
}

pub fn impute_missing_in(
    pool: &ThreadPool,
    model: &FittedModel,
    estimates: &[Array2<f64>],
    seed: u64,
) -> Result<Vec<Array2<i32>>> {
    pool.install(|| impute_missing_many(model, estimates, seed))
}

#[inline]
fn draw_seed(seed: u64, draw: usize, n_respondents: usize) -> u64 {
    seed.wrapping_add((draw * n_respondents) as u64)
}

fn checked_support(model: &FittedModel) -> Result<Vec<Vec<usize>>> {
    let support = model.observed_support();
    if let Some(j) = support.iter().position(|s| s.is_empty()) {
        return Err(M2Error::Configuration(format!(
            "item {j} has no observed responses to impute from"
        )));
    }
    Ok(support)
}

fn check_estimates(model: &FittedModel, estimates: &Array2<f64>) -> Result<()> {
    let expected = (model.n_respondents(), model.n_factors());
    if estimates.dim() != expected {
        return Err(M2Error::Dimension(format!(
            "latent-trait estimates are {:?}, expected {:?}",
            estimates.dim(),
            expected
        )));
    }
    if estimates.iter().any(|v| !v.is_finite()) {
        return Err(M2Error::Configuration(
            "latent-trait estimates must be finite".into(),
        ));
    }
    Ok(())
}

fn impute_draw(
    model: &FittedModel,
    estimates: &Array2<f64>,
    support: &[Vec<usize>],
    base_seed: u64,
) -> Array2<i32> {
    let responses = model.responses();
    let (n_persons, n_items) = responses.dim();

    let rows: Vec<Vec<i32>> = (0..n_persons)
        .into_par_iter()
        .map(|i| {
            let mut row = responses.row(i).to_vec();
            if row.iter().all(|&r| r >= 0) {
                return row;
            }
            let mut rng = Pcg64::seed_from_u64(base_seed.wrapping_add(i as u64));
            let items = &model.groups()[model.group_of()[i]].items;
            let theta = estimates.slice(s![i..i + 1, ..]);

            for j in 0..n_items {
                if row[j] >= 0 {
                    continue;
                }
                let probs = items[j].probability_trace(theta);
                let mut weights = vec![0.0; probs.ncols()];
                for &c in &support[j] {
                    weights[c] = probs[[0, c]];
                }
                // all observed categories underflowed: draw uniformly among them
                if weights.iter().sum::<f64>() <= EPSILON {
                    for &c in &support[j] {
                        weights[c] = 1.0;
                    }
                }
                let u: f64 = rng.random();
                if let Some(c) = sample_category(&weights, u) {
                    row[j] = c as i32;
                }
            }
            row
        })
        .collect();

    Array2::from_shape_fn((n_persons, n_items), |(i, j)| rows[i][j])
}

/// Impute `options.imputations` datasets, rerun the pipeline on each and
/// pool the results.
pub(crate) fn pooled_m2(model: &FittedModel, options: &M2Options) -> Result<M2Output> {
    let estimates = options.latent_estimates.as_ref().ok_or_else(|| {
        M2Error::MissingInput("imputation requires latent-trait estimates".into())
    })?;
    let support = checked_support(model)?;
    check_estimates(model, estimates)?;

    let n = model.n_respondents();
    let draws = options.imputations;
    log::debug!("imputing {draws} dataset(s) for {n} respondents");

    let outputs = (0..draws)
        .into_par_iter()
        .map(|draw| {
            let data = impute_draw(model, estimates, &support, draw_seed(options.seed, draw, n));
            run_pipeline(model, data.view(), options)
        })
        .collect::<Result<Vec<_>>>()?;

    if options.return_residual_matrix {
        return Ok(M2Output::Residuals(pool_residuals(&outputs)));
    }
    let fits: Vec<FitResult> = outputs.into_iter().filter_map(M2Output::into_fit).collect();
    let mut pooled = pool_fits(&fits);
    pooled.imputation_spread = Some(spread(&fits, &pooled));
    Ok(M2Output::Fit(pooled))
}

fn pool_residuals(outputs: &[M2Output]) -> Vec<Array2<f64>> {
    let sets: Vec<&[Array2<f64>]> = outputs.iter().filter_map(M2Output::residuals).collect();
    let Some(first) = sets.first() else {
        return Vec::new();
    };
    let m = sets.len() as f64;
    (0..first.len())
        .map(|g| {
            let mut total = Array2::<f64>::zeros(first[g].dim());
            for set in &sets {
                total += &set[g];
            }
            total / m
        })
        .collect()
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    sum / count as f64
}

/// Mean of an optional field; absent if any draw lacks it.
fn mean_opt(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let values: Option<Vec<f64>> = values.collect();
    values.filter(|v| !v.is_empty()).map(|v| mean(v.into_iter()))
}

fn rms_deviation(values: impl Iterator<Item = f64>, centre: f64) -> f64 {
    mean(values.map(|v| (v - centre).powi(2))).sqrt()
}

fn rms_deviation_opt(
    values: impl Iterator<Item = Option<f64>>,
    centre: Option<f64>,
) -> Option<f64> {
    let centre = centre?;
    let values: Option<Vec<f64>> = values.collect();
    values.map(|v| rms_deviation(v.into_iter(), centre))
}

fn pool_fits(fits: &[FitResult]) -> FitResult {
    let per_group = fits.first().and_then(|f| f.per_group.as_ref()).map(|groups| {
        (0..groups.len())
            .map(|g| {
                let group_fits: Vec<FitResult> = fits
                    .iter()
                    .filter_map(|f| f.per_group.as_ref().and_then(|pg| pg.get(g)).cloned())
                    .collect();
                pool_fits(&group_fits)
            })
            .collect()
    });

    FitResult {
        statistic: mean(fits.iter().map(|f| f.statistic)),
        df: fits.first().map_or(0, |f| f.df),
        p_value: mean(fits.iter().map(|f| f.p_value)),
        rmsea: mean(fits.iter().map(|f| f.rmsea)),
        rmsea_lower: mean(fits.iter().map(|f| f.rmsea_lower)),
        rmsea_upper: mean(fits.iter().map(|f| f.rmsea_upper)),
        srmsr: mean_opt(fits.iter().map(|f| f.srmsr)),
        tli: mean_opt(fits.iter().map(|f| f.tli)),
        cfi: mean_opt(fits.iter().map(|f| f.cfi)),
        n_respondents: fits.first().map_or(0, |f| f.n_respondents),
        per_group,
        null_model_failure: fits.iter().find_map(|f| f.null_model_failure.clone()),
        imputation_spread: None,
    }
}

fn spread(fits: &[FitResult], pooled: &FitResult) -> ImputationSpread {
    ImputationSpread {
        draws: fits.len(),
        statistic: rms_deviation(fits.iter().map(|f| f.statistic), pooled.statistic),
        p_value: rms_deviation(fits.iter().map(|f| f.p_value), pooled.p_value),
        rmsea: rms_deviation(fits.iter().map(|f| f.rmsea), pooled.rmsea),
        srmsr: rms_deviation_opt(fits.iter().map(|f| f.srmsr), pooled.srmsr),
        tli: rms_deviation_opt(fits.iter().map(|f| f.tli), pooled.tli),
        cfi: rms_deviation_opt(fits.iter().map(|f| f.cfi), pooled.cfi),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::{Item, ItemKind};
    use crate::model::LatentDistribution;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn graded_model(data: Array2<i32>) -> FittedModel {
        let items = (0..data.ncols())
            .map(|j| {
                Item::new(
                    format!("g{j}"),
                    ItemKind::Graded,
                    1,
                    4,
                    vec![1.2, 1.5, 0.0, -1.5],
                )
                .unwrap()
            })
            .collect();
        FittedModel::new(data, items, LatentDistribution::standard_normal(1), 0).unwrap()
    }

    #[test]
    fn test_imputation_stays_in_observed_support() {
        // category 2 is never observed for item 0, category 3 never for item 1
        let data = array![
            [0, 1, -1],
            [-1, -1, 2],
            [3, 0, 1],
            [1, -1, 3],
            [-1, 2, 0],
            [3, 1, -1]
        ];
        let model = graded_model(data.clone());
        let estimates = array![[-2.0], [2.5], [0.3], [-0.7], [1.9], [0.0]];
        let draws: Vec<Array2<f64>> = (0..40).map(|_| estimates.clone()).collect();
        let imputed = impute_missing_many(&model, &draws, 11).unwrap();

        let support = model.observed_support();
        for set in &imputed {
            assert!(set.iter().all(|&r| r >= 0));
            for ((i, j), &r) in set.indexed_iter() {
                if data[[i, j]] >= 0 {
                    assert_eq!(r, data[[i, j]]);
                } else {
                    assert!(support[j].contains(&(r as usize)), "item {j} drew {r}");
                }
            }
        }
    }

    #[test]
    fn test_imputation_is_reproducible() {
        let data = array![[0, -1], [1, 2], [-1, 0], [2, 1]];
        let model = graded_model(data);
        let estimates = array![[0.1], [0.2], [-0.4], [1.0]];
        let a = impute_missing(&model, &estimates, 99).unwrap();
        let b = impute_missing(&model, &estimates, 99).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_estimate_shape_and_empty_support() {
        let data = array![[0, -1], [1, 2], [-1, 0]];
        let model = graded_model(data);
        let wrong = array![[0.0], [1.0]];
        assert!(matches!(
            impute_missing(&model, &wrong, 0),
            Err(M2Error::Dimension(_))
        ));

        let empty = graded_model(array![[0, -1], [1, -1]]);
        assert!(matches!(
            impute_missing(&empty, &array![[0.0], [0.0]], 0),
            Err(M2Error::Configuration(_))
        ));
    }

    #[test]
    fn test_pooling_mean_and_spread() {
        let fit = |statistic: f64, tli: Option<f64>| FitResult {
            statistic,
            df: 5,
            p_value: 0.5,
            rmsea: 0.02,
            rmsea_lower: 0.0,
            rmsea_upper: 0.05,
            srmsr: Some(0.03),
            tli,
            cfi: Some(0.98),
            n_respondents: 100,
            per_group: None,
            null_model_failure: None,
            imputation_spread: None,
        };
        let fits = vec![fit(4.0, Some(0.9)), fit(6.0, None), fit(8.0, Some(1.0))];
        let pooled = pool_fits(&fits);
        assert_abs_diff_eq!(pooled.statistic, 6.0);
        assert_eq!(pooled.df, 5);
        assert_eq!(pooled.tli, None);
        assert_abs_diff_eq!(pooled.cfi.unwrap(), 0.98, epsilon = 1e-12);

        let s = spread(&fits, &pooled);
        assert_eq!(s.draws, 3);
        assert_abs_diff_eq!(s.statistic, (8.0f64 / 3.0).sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(s.p_value, 0.0);
        assert_eq!(s.tli, None);
    }
}
