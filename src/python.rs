//! Python bindings for single-group models.

use ndarray::Array2;
use numpy::{PyArray2, PyReadonlyArray2, ToPyArray};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList};

use crate::error::{M2Error, Result};
use crate::imputation;
use crate::items::{Item, ItemKind};
use crate::m2::{self, FitResult, M2Options, M2Output};
use crate::model::{FittedModel, LatentDistribution};

/// Items from flat per-item descriptions. Negative free indices and keys
/// mean "fixed" and "no key".
fn build_items(
    item_types: &[String],
    n_categories: &[usize],
    params: Vec<Vec<f64>>,
    free_index: Option<Vec<Vec<i64>>>,
    keys: Option<Vec<i64>>,
    n_factors: usize,
) -> Result<Vec<Item>> {
    let n_items = item_types.len();
    if n_categories.len() != n_items || params.len() != n_items {
        return Err(M2Error::Dimension(format!(
            "{} item types, {} category counts, {} parameter vectors",
            n_items,
            n_categories.len(),
            params.len()
        )));
    }
    if free_index.as_ref().is_some_and(|f| f.len() != n_items)
        || keys.as_ref().is_some_and(|k| k.len() != n_items)
    {
        return Err(M2Error::Dimension(
            "free indices and keys need one entry per item".into(),
        ));
    }

    params
        .into_iter()
        .enumerate()
        .map(|(j, p)| {
            let key = keys
                .as_ref()
                .and_then(|k| usize::try_from(k[j]).ok());
            let kind = ItemKind::from_tag(&item_types[j], key)?;
            let item = Item::new(format!("Item.{}", j + 1), kind, n_factors, n_categories[j], p)?;
            match &free_index {
                Some(free) => item.with_free_index(
                    free[j].iter().map(|&g| usize::try_from(g).ok()).collect(),
                ),
                None => Ok(item),
            }
        })
        .collect()
}

fn fit_to_dict<'py>(py: Python<'py>, fit: &FitResult) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    dict.set_item("statistic", fit.statistic)?;
    dict.set_item("df", fit.df)?;
    dict.set_item("p_value", fit.p_value)?;
    dict.set_item("rmsea", fit.rmsea)?;
    dict.set_item("rmsea_lower", fit.rmsea_lower)?;
    dict.set_item("rmsea_upper", fit.rmsea_upper)?;
    dict.set_item("srmsr", fit.srmsr)?;
    dict.set_item("tli", fit.tli)?;
    dict.set_item("cfi", fit.cfi)?;
    dict.set_item("n", fit.n_respondents)?;
    dict.set_item("null_model_failure", fit.null_model_failure.clone())?;
    if let Some(spread) = &fit.imputation_spread {
        let sd = PyDict::new(py);
        sd.set_item("draws", spread.draws)?;
        sd.set_item("statistic", spread.statistic)?;
        sd.set_item("p_value", spread.p_value)?;
        sd.set_item("rmsea", spread.rmsea)?;
        sd.set_item("srmsr", spread.srmsr)?;
        sd.set_item("tli", spread.tli)?;
        sd.set_item("cfi", spread.cfi)?;
        dict.set_item("imputation_spread", sd)?;
    }
    Ok(dict)
}

/// Compute M2 for a single-group model
#[pyfunction]
#[pyo3(signature = (responses, item_types, n_categories, params, free_index, nest, n_factors=1, keys=None, latent_estimates=None, calc_null=true, quadrature_points=None, imputations=0, confidence_level=0.9, return_residual_matrix=false, use_quasi_monte_carlo=false, suppress_threshold=None, best_effort_null=false, seed=0))]
#[allow(clippy::too_many_arguments)]
pub fn compute_m2<'py>(
    py: Python<'py>,
    responses: PyReadonlyArray2<i32>,
    item_types: Vec<String>,
    n_categories: Vec<usize>,
    params: Vec<Vec<f64>>,
    free_index: Vec<Vec<i64>>,
    nest: usize,
    n_factors: usize,
    keys: Option<Vec<i64>>,
    latent_estimates: Option<PyReadonlyArray2<f64>>,
    calc_null: bool,
    quadrature_points: Option<usize>,
    imputations: usize,
    confidence_level: f64,
    return_residual_matrix: bool,
    use_quasi_monte_carlo: bool,
    suppress_threshold: Option<f64>,
    best_effort_null: bool,
    seed: u64,
) -> PyResult<Bound<'py, PyDict>> {
    let responses = responses.as_array().to_owned();
    let latent_estimates: Option<Array2<f64>> =
        latent_estimates.map(|e| e.as_array().to_owned());

    let items = build_items(
        &item_types,
        &n_categories,
        params,
        Some(free_index),
        keys,
        n_factors,
    )?;
    let model = FittedModel::new(
        responses,
        items,
        LatentDistribution::standard_normal(n_factors),
        nest,
    )?;
    let options = M2Options {
        calc_null,
        quadrature_points,
        latent_estimates,
        imputations,
        confidence_level,
        return_residual_matrix,
        use_quasi_monte_carlo,
        suppress_threshold,
        best_effort_null,
        null_statistic: None,
        seed,
    };

    let output = py.detach(|| m2::compute_m2(&model, &options))?;

    match output {
        M2Output::Fit(fit) => fit_to_dict(py, &fit),
        M2Output::Residuals(residuals) => {
            let dict = PyDict::new(py);
            let list = PyList::empty(py);
            for res in &residuals {
                list.append(res.to_pyarray(py))?;
            }
            dict.set_item("residuals", list)?;
            Ok(dict)
        }
    }
}

/// Impute missing responses (negative codes) at the given latent-trait estimates
#[pyfunction]
#[pyo3(signature = (responses, item_types, n_categories, params, latent_estimates, keys=None, seed=0))]
pub fn impute_missing<'py>(
    py: Python<'py>,
    responses: PyReadonlyArray2<i32>,
    item_types: Vec<String>,
    n_categories: Vec<usize>,
    params: Vec<Vec<f64>>,
    latent_estimates: PyReadonlyArray2<f64>,
    keys: Option<Vec<i64>>,
    seed: u64,
) -> PyResult<Bound<'py, PyArray2<i32>>> {
    let responses = responses.as_array().to_owned();
    let estimates = latent_estimates.as_array().to_owned();
    let n_factors = estimates.ncols();

    let items = build_items(&item_types, &n_categories, params, None, keys, n_factors)?;
    let model = FittedModel::new(
        responses,
        items,
        LatentDistribution::standard_normal(n_factors),
        0,
    )?;

    let imputed = py.detach(|| imputation::impute_missing(&model, &estimates, seed))?;
    Ok(imputed.to_pyarray(py))
}

pub fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(compute_m2, m)?)?;
    m.add_function(wrap_pyfunction!(impute_missing, m)?)?;
    Ok(())
}
