//! Error types shared by the samplers, the evaluator and the controller.

use thiserror::Error;

use crate::log_pdf::EvaluationError;

/// Everything that can go wrong while constructing or running a sampler.
///
/// A non-finite log-pdf for any point other than the initial one is *not* an
/// error: samplers treat it as an automatic rejection.
#[derive(Debug, Error)]
pub enum McmcError {
    /// Invalid arguments: dimension mismatch, non-positive covariance, too few
    /// chains or points, bad hyper-parameters.
    #[error("invalid construction: {0}")]
    Construction(String),

    /// `ask` and `tell` were called out of sequence.
    #[error("ask/tell protocol violated: {0}")]
    Protocol(String),

    /// The log-pdf of the initial point was not finite.
    #[error("initial point must have a finite log-pdf, got {log_pdf}")]
    NonFiniteInitialDensity { log_pdf: f64 },

    /// `run` was called without any halting condition.
    #[error("at least one stopping criterion must be set before running")]
    StoppingCriterionMissing,

    /// The sampler hit a fatal condition earlier and cannot be used again.
    #[error("sampler has failed permanently and cannot continue")]
    SamplerFailed,

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("failed to parse stored value: {0}")]
    Parse(#[from] std::num::ParseFloatError),
}

pub type Result<T> = std::result::Result<T, McmcError>;

impl McmcError {
    pub(crate) fn construction(msg: impl Into<String>) -> Self {
        McmcError::Construction(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        McmcError::Protocol(msg.into())
    }
}
