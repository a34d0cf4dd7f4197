//! Limited-information goodness of fit for multidimensional IRT models.
//!
//! This crate provides:
//! - The M2 statistic on univariate and bivariate response moments
//! - RMSEA with a noncentral chi-square confidence interval, SRMSR and
//!   residual correlation matrices
//! - TLI and CFI against an independence (null) model
//! - Multi-group pooling
//! - Imputation of missing responses with pooling across imputed datasets
//!
//! With the `python` feature the crate builds the `mirt_m2` extension module.

pub mod convert;
pub mod error;
pub mod imputation;
pub mod items;
pub mod jacobian;
pub mod m2;
pub mod model;
pub mod moments;
pub mod null_model;
pub mod quadrature;
pub mod solver;
pub mod utils;
pub mod weights;

#[cfg(feature = "python")]
pub mod python;

pub use error::{M2Error, Result};
pub use imputation::{impute_missing, impute_missing_in, impute_missing_many, ImputationSpread};
pub use items::{Item, ItemKind, ScoreRule};
pub use m2::{compute_m2, compute_m2_in, FitResult, M2Options, M2Output};
pub use model::{normalize_responses, FittedModel, GroupModel, LatentDistribution};
pub use null_model::NullStatistic;

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// Python module for mirt_m2
#[cfg(feature = "python")]
#[pymodule]
fn mirt_m2(m: &Bound<'_, PyModule>) -> PyResult<()> {
    python::register(m)?;
    Ok(())
}
