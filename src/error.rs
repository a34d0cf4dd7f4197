//! Error types for M2 computations.

use thiserror::Error;

/// Errors raised while computing limited-information fit statistics.
///
/// Every variant is raised at the point of detection; no partial result is
/// returned alongside an error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum M2Error {
    /// Invalid option values or option combinations
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Shape mismatch between moments, Jacobian, data or estimates
    #[error("dimension error: {0}")]
    Dimension(String),

    /// Orthogonal complement (or df) would have no columns
    #[error("insufficient degrees of freedom: {moments} moments, {parameters} free parameters")]
    InsufficientDegreesOfFreedom { moments: usize, parameters: usize },

    /// Singular or near-singular linear system
    #[error("ill-conditioned system: {0}")]
    IllConditioned(String),

    /// Missing responses without an imputation plan
    #[error("missing input: {0}")]
    MissingInput(String),

    /// Item types or model structures outside the supported set
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    /// Independence (null) model could not be fitted
    #[error("null model did not converge: {0}")]
    NullModelConvergence(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, M2Error>;

#[cfg(feature = "python")]
impl From<M2Error> for pyo3::PyErr {
    fn from(err: M2Error) -> Self {
        pyo3::exceptions::PyValueError::new_err(err.to_string())
    }
}
