/*!
Ready-made target densities: a multivariate Gaussian (with gradients) and a
uniform box prior.

They implement [`LogPdf`] and are mostly useful as test targets and as
building blocks for a [`LogPosterior`](crate::log_pdf::LogPosterior).

# Examples

```rust
use asktell_mcmc::distributions::{Gaussian, UniformPrior};
use asktell_mcmc::log_pdf::{LogPdf, LogPosterior};

let likelihood = Gaussian::diagonal(vec![2.0, 4.0], vec![1.0, 3.0]).unwrap();
let prior = UniformPrior::new(vec![-10.0, -10.0], vec![10.0, 10.0]).unwrap();
let posterior = LogPosterior::new(prior, likelihood).unwrap();

let (lp, grad) = posterior.evaluate_s1(&[2.0, 4.0]).unwrap();
println!("log-posterior at the mode: {lp}, gradient: {grad:?}");
```
*/

use nalgebra::{DMatrix, DVector};
use std::f64::consts::PI;

use crate::error::{McmcError, Result};
use crate::log_pdf::{check_dimension, EvaluationError, LogPdf};

/**
A normalised multivariate Gaussian log-density with mean `μ` and covariance `Σ`.

The precision matrix and the log-normaliser are computed once at construction,
so each evaluation costs one matrix-vector product.

# Examples

```rust
use asktell_mcmc::distributions::Gaussian;
use asktell_mcmc::log_pdf::LogPdf;
use nalgebra::DMatrix;

let cov = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 2.0]);
let gauss = Gaussian::new(vec![0.0, 1.0], cov).unwrap();
let lp = gauss.evaluate(&[0.5, -0.5]).unwrap();
println!("Log probability: {}", lp);
```
*/
#[derive(Debug, Clone)]
pub struct Gaussian {
    mean: DVector<f64>,
    precision: DMatrix<f64>,
    log_normaliser: f64,
}

impl Gaussian {
    /// Creates a Gaussian from a mean and a symmetric positive-definite covariance.
    pub fn new(mean: Vec<f64>, cov: DMatrix<f64>) -> Result<Self> {
        let d = mean.len();
        if d == 0 {
            return Err(McmcError::construction("Gaussian needs at least one dimension"));
        }
        if cov.nrows() != d || cov.ncols() != d {
            return Err(McmcError::construction(format!(
                "covariance must be {d}x{d}, got {}x{}",
                cov.nrows(),
                cov.ncols()
            )));
        }
        let chol = cov
            .clone()
            .cholesky()
            .ok_or_else(|| McmcError::construction("covariance must be positive definite"))?;
        let log_det = 2.0 * chol.l().diagonal().iter().map(|v| v.ln()).sum::<f64>();
        let precision = chol.inverse();
        Ok(Self {
            mean: DVector::from_vec(mean),
            precision,
            log_normaliser: -0.5 * (d as f64 * (2.0 * PI).ln() + log_det),
        })
    }

    /// Independent coordinates with the given variances.
    pub fn diagonal(mean: Vec<f64>, variances: Vec<f64>) -> Result<Self> {
        if variances.len() != mean.len() {
            return Err(McmcError::construction(format!(
                "expected {} variances, got {}",
                mean.len(),
                variances.len()
            )));
        }
        Self::new(mean, DMatrix::from_diagonal(&DVector::from_vec(variances)))
    }

    /// Independent coordinates sharing one standard deviation.
    pub fn isotropic(mean: Vec<f64>, std: f64) -> Result<Self> {
        let d = mean.len();
        Self::diagonal(mean, vec![std * std; d])
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    fn residual(&self, x: &[f64]) -> DVector<f64> {
        DVector::from_column_slice(x) - &self.mean
    }
}

impl LogPdf for Gaussian {
    fn n_parameters(&self) -> usize {
        self.mean.len()
    }

    fn evaluate(&self, x: &[f64]) -> std::result::Result<f64, EvaluationError> {
        check_dimension(self.mean.len(), x)?;
        let r = self.residual(x);
        Ok(self.log_normaliser - 0.5 * r.dot(&(&self.precision * &r)))
    }

    fn has_sensitivities(&self) -> bool {
        true
    }

    fn evaluate_s1(&self, x: &[f64]) -> std::result::Result<(f64, Vec<f64>), EvaluationError> {
        check_dimension(self.mean.len(), x)?;
        let r = self.residual(x);
        let pr = &self.precision * &r;
        let lp = self.log_normaliser - 0.5 * r.dot(&pr);
        Ok((lp, pr.iter().map(|v| -v).collect()))
    }
}

/**
A uniform prior on the box `[lower_i, upper_i)`.

Outside the box the log-density is `-inf` and the gradient is zero.

# Examples

```rust
use asktell_mcmc::distributions::UniformPrior;
use asktell_mcmc::log_pdf::LogPdf;

let prior = UniformPrior::new(vec![0.0, 0.0], vec![1.0, 2.0]).unwrap();
assert_eq!(prior.evaluate(&[0.5, 0.5]).unwrap(), -(2.0f64).ln());
assert_eq!(prior.evaluate(&[1.5, 0.5]).unwrap(), f64::NEG_INFINITY);
```
*/
#[derive(Debug, Clone)]
pub struct UniformPrior {
    lower: Vec<f64>,
    upper: Vec<f64>,
    log_density: f64,
}

impl UniformPrior {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Result<Self> {
        if lower.len() != upper.len() || lower.is_empty() {
            return Err(McmcError::construction(
                "lower and upper bounds must be non-empty and of equal length",
            ));
        }
        if lower.iter().zip(&upper).any(|(l, u)| !(u > l)) {
            return Err(McmcError::construction(
                "upper bounds must be strictly greater than lower bounds",
            ));
        }
        let log_density = -lower
            .iter()
            .zip(&upper)
            .map(|(l, u)| (u - l).ln())
            .sum::<f64>();
        Ok(Self {
            lower,
            upper,
            log_density,
        })
    }

    fn contains(&self, x: &[f64]) -> bool {
        x.iter()
            .zip(self.lower.iter().zip(&self.upper))
            .all(|(v, (l, u))| *v >= *l && *v < *u)
    }
}

impl LogPdf for UniformPrior {
    fn n_parameters(&self) -> usize {
        self.lower.len()
    }

    fn evaluate(&self, x: &[f64]) -> std::result::Result<f64, EvaluationError> {
        check_dimension(self.lower.len(), x)?;
        if self.contains(x) {
            Ok(self.log_density)
        } else {
            Ok(f64::NEG_INFINITY)
        }
    }

    fn has_sensitivities(&self) -> bool {
        true
    }

    fn evaluate_s1(&self, x: &[f64]) -> std::result::Result<(f64, Vec<f64>), EvaluationError> {
        Ok((self.evaluate(x)?, vec![0.0; x.len()]))
    }
}
