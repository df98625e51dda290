/*!
The ask/tell contract every sampler implements, plus the pieces the
controller needs to build samplers by name.

A sampler never evaluates the target itself. `ask` hands out the next point
to evaluate, and `tell` feeds the result back, returning `Some(sample)` when a
new chain row is ready or `None` when the sampler needs more evaluations
before it can emit one (e.g. midway through a slice-sampling sweep).

```rust
use asktell_mcmc::distributions::Gaussian;
use asktell_mcmc::evaluator::Evaluation;
use asktell_mcmc::log_pdf::LogPdf;
use asktell_mcmc::sampler::SingleChainSampler;
use asktell_mcmc::slice_doubling::{SliceDoubling, SliceDoublingSettings};

let target = Gaussian::isotropic(vec![0.0, 0.0], 1.0).unwrap();
let mut sampler = SliceDoubling::new(vec![0.5, 0.5], SliceDoublingSettings::default()).unwrap();
sampler.set_seed(7);

let mut chain = Vec::new();
while chain.len() < 100 {
    let x = sampler.ask().unwrap();
    let fx = target.evaluate(&x).unwrap();
    if let Some(sample) = sampler.tell(Evaluation::new(fx)).unwrap() {
        chain.push(sample);
    }
}
assert_eq!(chain[0], vec![0.5, 0.5]);
```
*/

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::adaptive_covariance::{AdaptiveCovariance, AdaptiveCovarianceSettings};
use crate::differential_evolution::{DifferentialEvolution, DifferentialEvolutionSettings};
use crate::dream::{Dream, DreamSettings};
use crate::error::{McmcError, Result};
use crate::evaluator::Evaluation;
use crate::slice_covariance_matching::{
    SliceCovarianceMatching, SliceCovarianceMatchingSettings,
};
use crate::slice_doubling::{SliceDoubling, SliceDoublingSettings};

/// A sampler driving exactly one chain.
pub trait SingleChainSampler: Send {
    /// Human-readable name of the method.
    fn name(&self) -> &'static str;

    fn n_parameters(&self) -> usize;

    /// Returns the next point to evaluate. The first call returns the
    /// initial point.
    fn ask(&mut self) -> Result<Vec<f64>>;

    /// Feeds back the evaluation of the last point returned by `ask`.
    fn tell(&mut self, reply: Evaluation) -> Result<Option<Vec<f64>>>;

    /// Log-pdf of the current chain position, once the initial point is known.
    fn current_log_pdf(&self) -> Option<f64>;

    /// Running acceptance rate, for methods where it is meaningful.
    fn acceptance_rate(&self) -> Option<f64> {
        None
    }

    /// Whether replies must carry a gradient.
    fn needs_sensitivities(&self) -> bool {
        false
    }

    fn set_seed(&mut self, seed: u64);

    fn as_adaptive(&self) -> Option<&dyn Adaptive> {
        None
    }

    fn as_adaptive_mut(&mut self) -> Option<&mut dyn Adaptive> {
        None
    }
}

/// A sampler that evolves several chains jointly and exchanges one point per
/// chain in every `ask`/`tell`.
pub trait MultiChainSampler: Send {
    fn name(&self) -> &'static str;

    fn n_chains(&self) -> usize;

    fn n_parameters(&self) -> usize;

    fn ask(&mut self) -> Result<Vec<Vec<f64>>>;

    /// `replies` must hold one evaluation per chain, in chain order.
    fn tell(&mut self, replies: &[Evaluation]) -> Result<Option<Vec<Vec<f64>>>>;

    fn current_log_pdfs(&self) -> Option<Vec<f64>>;

    fn acceptance_rates(&self) -> Vec<Option<f64>> {
        vec![None; self.n_chains()]
    }

    fn needs_sensitivities(&self) -> bool {
        false
    }

    fn set_seed(&mut self, seed: u64);

    fn as_adaptive(&self) -> Option<&dyn Adaptive> {
        None
    }

    fn as_adaptive_mut(&mut self) -> Option<&mut dyn Adaptive> {
        None
    }
}

/// Samplers with a distinct initial phase, switched off by the controller
/// after a configured number of iterations.
pub trait Adaptive {
    fn needs_initial_phase(&self) -> bool;

    fn in_initial_phase(&self) -> bool;

    fn set_initial_phase(&mut self, initial_phase: bool);
}

/// Tracks where a sampler is in the ask/tell handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Handshake {
    #[default]
    Idle,
    AwaitingTell,
    Failed,
}

impl Handshake {
    pub(crate) fn begin_ask(&mut self) -> Result<()> {
        match self {
            Handshake::Idle => {
                *self = Handshake::AwaitingTell;
                Ok(())
            }
            Handshake::AwaitingTell => Err(McmcError::protocol(
                "ask() called twice without an intervening tell()",
            )),
            Handshake::Failed => Err(McmcError::SamplerFailed),
        }
    }

    pub(crate) fn begin_tell(&mut self) -> Result<()> {
        match self {
            Handshake::AwaitingTell => {
                *self = Handshake::Idle;
                Ok(())
            }
            Handshake::Idle => Err(McmcError::protocol("tell() called before ask()")),
            Handshake::Failed => Err(McmcError::SamplerFailed),
        }
    }

    /// Rejects a non-finite log-pdf for the initial point and marks the
    /// sampler as permanently failed.
    pub(crate) fn check_initial(&mut self, log_pdf: f64) -> Result<()> {
        if log_pdf.is_finite() {
            Ok(())
        } else {
            *self = Handshake::Failed;
            Err(McmcError::NonFiniteInitialDensity { log_pdf })
        }
    }
}

/// The initial covariance (or width) guess handed to a sampler.
#[derive(Debug, Clone, PartialEq)]
pub enum Sigma0 {
    /// One standard deviation shared by all parameters.
    Scalar(f64),
    /// One standard deviation per parameter.
    StdDevs(Vec<f64>),
    /// A full `d×d` covariance matrix.
    Covariance(DMatrix<f64>),
}

impl Sigma0 {
    /// Converts the guess into a positive-definite `d×d` covariance matrix.
    pub fn covariance(&self, d: usize) -> Result<DMatrix<f64>> {
        let positive = |s: &f64| s.is_finite() && *s > 0.0;
        match self {
            Sigma0::Scalar(s) => {
                if !positive(s) {
                    return Err(McmcError::construction(format!(
                        "sigma0 must be positive, got {s}"
                    )));
                }
                Ok(DMatrix::from_diagonal_element(d, d, s * s))
            }
            Sigma0::StdDevs(stds) => {
                if stds.len() != d {
                    return Err(McmcError::construction(format!(
                        "sigma0 must have {d} entries, got {}",
                        stds.len()
                    )));
                }
                if !stds.iter().all(positive) {
                    return Err(McmcError::construction(
                        "sigma0 standard deviations must be positive",
                    ));
                }
                let variances = DVector::from_iterator(d, stds.iter().map(|s| s * s));
                Ok(DMatrix::from_diagonal(&variances))
            }
            Sigma0::Covariance(cov) => {
                if cov.nrows() != d || cov.ncols() != d {
                    return Err(McmcError::construction(format!(
                        "sigma0 must be a {d}x{d} matrix, got {}x{}",
                        cov.nrows(),
                        cov.ncols()
                    )));
                }
                if (cov - cov.transpose()).amax() > 1e-10 * cov.amax().max(1.0) {
                    return Err(McmcError::construction("sigma0 must be symmetric"));
                }
                if cov.clone().cholesky().is_none() {
                    return Err(McmcError::construction(
                        "sigma0 must be positive definite",
                    ));
                }
                Ok(cov.clone())
            }
        }
    }

    /// Diagonal covariance of `0.01·|x0_i|`, counting zero entries as one.
    pub fn default_covariance(x0: &[f64]) -> DMatrix<f64> {
        let diag = DVector::from_iterator(
            x0.len(),
            x0.iter()
                .map(|v| if *v == 0.0 { 0.01 } else { 0.01 * v.abs() }),
        );
        DMatrix::from_diagonal(&diag)
    }

    pub(crate) fn resolve(sigma0: Option<&Sigma0>, x0: &[f64]) -> Result<DMatrix<f64>> {
        match sigma0 {
            Some(s) => s.covariance(x0.len()),
            None => Ok(Self::default_covariance(x0)),
        }
    }
}

/// Selects the sampling algorithm and carries its settings.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    AdaptiveCovariance(AdaptiveCovarianceSettings),
    SliceDoubling(SliceDoublingSettings),
    SliceCovarianceMatching(SliceCovarianceMatchingSettings),
    DifferentialEvolution(DifferentialEvolutionSettings),
    Dream(DreamSettings),
}

impl Method {
    pub fn is_multi_chain(&self) -> bool {
        matches!(self, Method::DifferentialEvolution(_) | Method::Dream(_))
    }

    pub fn needs_sensitivities(&self) -> bool {
        matches!(self, Method::SliceCovarianceMatching(_))
    }

    /// Minimum number of chains the method can run with.
    pub fn min_chains(&self) -> usize {
        if self.is_multi_chain() {
            3
        } else {
            1
        }
    }

    /// Builds the sampler for one chain. Fails for multi-chain methods.
    pub fn single_chain(
        &self,
        x0: Vec<f64>,
        sigma0: Option<&Sigma0>,
    ) -> Result<Box<dyn SingleChainSampler>> {
        let cov = Sigma0::resolve(sigma0, &x0)?;
        Ok(match self {
            Method::AdaptiveCovariance(settings) => {
                Box::new(AdaptiveCovariance::new(x0, cov, settings.clone())?)
            }
            Method::SliceDoubling(settings) => {
                let mut settings = settings.clone();
                // An explicit sigma0 sets the initial interval width.
                if settings.width.is_none() && sigma0.is_some() {
                    settings.width = Some(cov.diagonal().iter().map(|v| v.sqrt()).collect());
                }
                Box::new(SliceDoubling::new(x0, settings)?)
            }
            Method::SliceCovarianceMatching(settings) => {
                Box::new(SliceCovarianceMatching::new(x0, settings.clone())?)
            }
            Method::DifferentialEvolution(_) | Method::Dream(_) => {
                return Err(McmcError::construction(
                    "multi-chain method cannot drive a single chain",
                ))
            }
        })
    }

    /// Builds one sampler for all chains. Fails for single-chain methods.
    pub fn multi_chain(&self, x0: Vec<Vec<f64>>) -> Result<Box<dyn MultiChainSampler>> {
        Ok(match self {
            Method::DifferentialEvolution(settings) => {
                Box::new(DifferentialEvolution::new(x0, settings.clone())?)
            }
            Method::Dream(settings) => Box::new(Dream::new(x0, settings.clone())?),
            _ => {
                return Err(McmcError::construction(
                    "single-chain method cannot drive a population of chains",
                ))
            }
        })
    }
}

/// Draws a vector of independent standard normal variates.
pub(crate) fn standard_normal<R: Rng>(rng: &mut R, d: usize) -> DVector<f64> {
    DVector::from_iterator(d, (0..d).map(|_| rng.sample::<f64, _>(StandardNormal)))
}

/// Lower Cholesky factor, adding diagonal jitter if the matrix has drifted
/// numerically indefinite.
pub(crate) fn lower_cholesky(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if let Some(chol) = m.clone().cholesky() {
        return Some(chol.l());
    }
    let scale = m.diagonal().amax().max(f64::MIN_POSITIVE);
    let mut jitter = 1e-12 * scale;
    for _ in 0..8 {
        let jittered = m + DMatrix::identity(m.nrows(), m.ncols()) * jitter;
        if let Some(chol) = jittered.cholesky() {
            log::warn!("covariance not positive definite; added jitter {jitter:e}");
            return Some(chol.l());
        }
        jitter *= 100.0;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_enforces_alternation() {
        let mut h = Handshake::default();
        assert!(matches!(h.begin_tell(), Err(McmcError::Protocol(_))));
        h.begin_ask().unwrap();
        assert!(matches!(h.begin_ask(), Err(McmcError::Protocol(_))));
        h.begin_tell().unwrap();
        h.begin_ask().unwrap();
        assert!(matches!(
            h.check_initial(f64::NEG_INFINITY),
            Err(McmcError::NonFiniteInitialDensity { .. })
        ));
        assert!(matches!(h.begin_tell(), Err(McmcError::SamplerFailed)));
        assert!(matches!(h.begin_ask(), Err(McmcError::SamplerFailed)));
    }

    #[test]
    fn sigma0_shapes() {
        let c = Sigma0::Scalar(2.0).covariance(3).unwrap();
        assert_eq!(c, DMatrix::from_diagonal_element(3, 3, 4.0));

        let c = Sigma0::StdDevs(vec![1.0, 3.0]).covariance(2).unwrap();
        assert_eq!(c[(1, 1)], 9.0);
        assert_eq!(c[(0, 1)], 0.0);

        assert!(Sigma0::StdDevs(vec![1.0]).covariance(2).is_err());
        assert!(Sigma0::Scalar(-1.0).covariance(2).is_err());
        assert!(Sigma0::Covariance(DMatrix::identity(3, 3))
            .covariance(2)
            .is_err());
        let indefinite = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(Sigma0::Covariance(indefinite).covariance(2).is_err());
        let asymmetric = DMatrix::from_row_slice(2, 2, &[1.0, 0.1, 0.0, 1.0]);
        assert!(Sigma0::Covariance(asymmetric).covariance(2).is_err());
    }

    #[test]
    fn default_covariance_handles_zero_entries() {
        let c = Sigma0::default_covariance(&[0.0, -200.0]);
        assert_eq!(c[(0, 0)], 0.01);
        assert_eq!(c[(1, 1)], 2.0);
    }

    #[test]
    fn jittered_cholesky_recovers_semidefinite_matrix() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let l = lower_cholesky(&m).unwrap();
        let back = &l * l.transpose();
        assert!((back - m).amax() < 1e-6);
    }

    #[test]
    fn method_capabilities() {
        let dream = Method::Dream(DreamSettings::default());
        assert!(dream.is_multi_chain());
        assert_eq!(dream.min_chains(), 3);
        assert!(dream.single_chain(vec![0.0], None).is_err());

        let scm = Method::SliceCovarianceMatching(SliceCovarianceMatchingSettings::default());
        assert!(scm.needs_sensitivities());
        assert!(scm.multi_chain(vec![vec![0.0]; 3]).is_err());
    }
}
