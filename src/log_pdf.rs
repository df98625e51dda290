/*!
The contract a target density must satisfy to be sampled.

A [`LogPdf`] maps a parameter vector of fixed dimension to a (possibly
unnormalised) log-density. Gradient-aware samplers additionally need
[`LogPdf::evaluate_s1`]. Targets built as prior plus likelihood use
[`LogPosterior`], which lets the controller log the two components
separately.

# Examples

```rust
use asktell_mcmc::log_pdf::{LogPdf, LogPdfFn};

let f = LogPdfFn::new(2, |x: &[f64]| -0.5 * (x[0] * x[0] + x[1] * x[1]));
assert_eq!(f.n_parameters(), 2);
assert_eq!(f.evaluate(&[0.0, 0.0]).unwrap(), 0.0);
```
*/

use thiserror::Error;

use crate::error::{McmcError, Result};

/// Failure of a single log-pdf evaluation.
///
/// Returned per point by the evaluator so one bad point never takes down a
/// whole batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("log-pdf evaluation failed: {0}")]
    Failed(String),

    #[error("log-pdf does not provide sensitivities")]
    SensitivitiesUnavailable,

    #[error("expected a point with {expected} parameters, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// A log-density over `n_parameters()`-dimensional real vectors.
pub trait LogPdf: Send + Sync {
    /// Dimension of the parameter space.
    fn n_parameters(&self) -> usize;

    /// Log-density at `x`. May be `-inf` outside the support.
    fn evaluate(&self, x: &[f64]) -> std::result::Result<f64, EvaluationError>;

    /// Whether [`LogPdf::evaluate_s1`] is implemented.
    fn has_sensitivities(&self) -> bool {
        false
    }

    /// Log-density and its gradient at `x`.
    fn evaluate_s1(&self, _x: &[f64]) -> std::result::Result<(f64, Vec<f64>), EvaluationError> {
        Err(EvaluationError::SensitivitiesUnavailable)
    }

    /// The prior component, for targets that decompose into prior plus
    /// likelihood.
    fn prior(&self) -> Option<&dyn LogPdf> {
        None
    }
}

impl<T: LogPdf + ?Sized> LogPdf for Box<T> {
    fn n_parameters(&self) -> usize {
        (**self).n_parameters()
    }

    fn evaluate(&self, x: &[f64]) -> std::result::Result<f64, EvaluationError> {
        (**self).evaluate(x)
    }

    fn has_sensitivities(&self) -> bool {
        (**self).has_sensitivities()
    }

    fn evaluate_s1(&self, x: &[f64]) -> std::result::Result<(f64, Vec<f64>), EvaluationError> {
        (**self).evaluate_s1(x)
    }

    fn prior(&self) -> Option<&dyn LogPdf> {
        (**self).prior()
    }
}

/// Wraps a plain closure as a [`LogPdf`] without gradients.
pub struct LogPdfFn<F> {
    n_parameters: usize,
    f: F,
}

impl<F> LogPdfFn<F>
where
    F: Fn(&[f64]) -> f64 + Send + Sync,
{
    pub fn new(n_parameters: usize, f: F) -> Self {
        Self { n_parameters, f }
    }
}

impl<F> LogPdf for LogPdfFn<F>
where
    F: Fn(&[f64]) -> f64 + Send + Sync,
{
    fn n_parameters(&self) -> usize {
        self.n_parameters
    }

    fn evaluate(&self, x: &[f64]) -> std::result::Result<f64, EvaluationError> {
        check_dimension(self.n_parameters, x)?;
        Ok((self.f)(x))
    }
}

/// Log-posterior `log p(θ) + log L(θ)`, up to a constant.
///
/// When the prior is not finite the likelihood is never evaluated.
pub struct LogPosterior<P, L> {
    prior: P,
    likelihood: L,
}

impl<P: LogPdf, L: LogPdf> LogPosterior<P, L> {
    pub fn new(prior: P, likelihood: L) -> Result<Self> {
        if prior.n_parameters() != likelihood.n_parameters() {
            return Err(McmcError::construction(format!(
                "prior dimension ({}) must match likelihood dimension ({})",
                prior.n_parameters(),
                likelihood.n_parameters()
            )));
        }
        Ok(Self { prior, likelihood })
    }

    pub fn log_likelihood(&self) -> &L {
        &self.likelihood
    }

    pub fn log_prior(&self) -> &P {
        &self.prior
    }
}

impl<P: LogPdf, L: LogPdf> LogPdf for LogPosterior<P, L> {
    fn n_parameters(&self) -> usize {
        self.prior.n_parameters()
    }

    fn evaluate(&self, x: &[f64]) -> std::result::Result<f64, EvaluationError> {
        let log_prior = self.prior.evaluate(x)?;
        if !log_prior.is_finite() {
            return Ok(log_prior);
        }
        Ok(log_prior + self.likelihood.evaluate(x)?)
    }

    fn has_sensitivities(&self) -> bool {
        self.prior.has_sensitivities() && self.likelihood.has_sensitivities()
    }

    fn evaluate_s1(&self, x: &[f64]) -> std::result::Result<(f64, Vec<f64>), EvaluationError> {
        let (log_prior, d_prior) = self.prior.evaluate_s1(x)?;
        if !log_prior.is_finite() {
            return Ok((log_prior, vec![0.0; x.len()]));
        }
        let (log_likelihood, d_likelihood) = self.likelihood.evaluate_s1(x)?;
        let grad = d_prior
            .iter()
            .zip(d_likelihood.iter())
            .map(|(a, b)| a + b)
            .collect();
        Ok((log_prior + log_likelihood, grad))
    }

    fn prior(&self) -> Option<&dyn LogPdf> {
        Some(&self.prior)
    }
}

pub(crate) fn check_dimension(
    expected: usize,
    x: &[f64],
) -> std::result::Result<(), EvaluationError> {
    if x.len() != expected {
        return Err(EvaluationError::DimensionMismatch {
            expected,
            got: x.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{Gaussian, UniformPrior};

    #[test]
    fn closure_checks_dimension() {
        let f = LogPdfFn::new(2, |x: &[f64]| x[0] + x[1]);
        assert_eq!(f.evaluate(&[1.0, 2.0]), Ok(3.0));
        assert_eq!(
            f.evaluate(&[1.0]),
            Err(EvaluationError::DimensionMismatch {
                expected: 2,
                got: 1
            })
        );
        assert!(!f.has_sensitivities());
        assert_eq!(
            f.evaluate_s1(&[1.0, 2.0]),
            Err(EvaluationError::SensitivitiesUnavailable)
        );
    }

    #[test]
    fn posterior_adds_components() {
        let prior = UniformPrior::new(vec![-10.0, -10.0], vec![10.0, 10.0]).unwrap();
        let likelihood = Gaussian::isotropic(vec![1.0, 2.0], 1.0).unwrap();
        let expected = likelihood.evaluate(&[0.5, 0.5]).unwrap()
            + prior.evaluate(&[0.5, 0.5]).unwrap();
        let posterior = LogPosterior::new(prior, likelihood).unwrap();
        let got = posterior.evaluate(&[0.5, 0.5]).unwrap();
        assert!((got - expected).abs() < 1e-12, "got {got}, expected {expected}");
        assert!(posterior.prior().is_some());
        assert!(posterior.has_sensitivities());
    }

    #[test]
    fn posterior_short_circuits_outside_prior() {
        let prior = UniformPrior::new(vec![0.0], vec![1.0]).unwrap();
        let likelihood = LogPdfFn::new(1, |_: &[f64]| -> f64 { panic!("likelihood must not run") });
        let posterior = LogPosterior::new(prior, likelihood).unwrap();
        assert_eq!(posterior.evaluate(&[2.0]), Ok(f64::NEG_INFINITY));
    }

    #[test]
    fn posterior_rejects_mismatched_dimensions() {
        let prior = UniformPrior::new(vec![0.0], vec![1.0]).unwrap();
        let likelihood = Gaussian::isotropic(vec![0.0, 0.0], 1.0).unwrap();
        assert!(matches!(
            LogPosterior::new(prior, likelihood),
            Err(McmcError::Construction(_))
        ));
    }
}
