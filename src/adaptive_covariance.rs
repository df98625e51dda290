/*!
# Adaptive Covariance MCMC

A Gaussian random-walk Metropolis sampler that tunes its own proposal.

The proposal is `x' ~ N(x, exp(loga)·Σ)`. After every step, and only outside
the initial phase, the running mean `μ`, the covariance `Σ` and the log
step-size `loga` are updated with a Robbins-Monro step `γ = t^-0.6`. This
drives the acceptance rate toward the configured target while `Σ` tracks the
covariance of the chain.

The sampler needs an initial phase. While it is in that phase it behaves like
plain random-walk Metropolis with covariance `Σ0`.

# Examples

```rust
use asktell_mcmc::adaptive_covariance::{AdaptiveCovariance, AdaptiveCovarianceSettings};
use asktell_mcmc::distributions::Gaussian;
use asktell_mcmc::evaluator::Evaluation;
use asktell_mcmc::log_pdf::LogPdf;
use asktell_mcmc::sampler::SingleChainSampler;
use nalgebra::DMatrix;

let target = Gaussian::isotropic(vec![0.0, 0.0], 1.0).unwrap();
let settings = AdaptiveCovarianceSettings::new(0.234).unwrap();
let mut mcmc = AdaptiveCovariance::new(vec![1.0, 1.0], DMatrix::identity(2, 2), settings).unwrap();
mcmc.set_seed(42);

for _ in 0..1000 {
    let x = mcmc.ask().unwrap();
    let fx = target.evaluate(&x).unwrap();
    mcmc.tell(Evaluation::new(fx)).unwrap();
}
println!("acceptance rate: {:.3}", mcmc.acceptance_rate().unwrap());
```
*/

use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::{McmcError, Result};
use crate::evaluator::Evaluation;
use crate::sampler::{lower_cholesky, standard_normal, Adaptive, Handshake, SingleChainSampler};

/// Settings of [`AdaptiveCovariance`]. The target acceptance rate has no
/// default and must be chosen explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveCovarianceSettings {
    target_acceptance_rate: f64,
}

impl AdaptiveCovarianceSettings {
    /// `target_acceptance_rate` must lie in `(0, 1]`.
    pub fn new(target_acceptance_rate: f64) -> Result<Self> {
        if !(target_acceptance_rate > 0.0 && target_acceptance_rate <= 1.0) {
            return Err(McmcError::construction(format!(
                "target acceptance rate must be in (0, 1], got {target_acceptance_rate}"
            )));
        }
        Ok(Self {
            target_acceptance_rate,
        })
    }

    pub fn target_acceptance_rate(&self) -> f64 {
        self.target_acceptance_rate
    }
}

pub struct AdaptiveCovariance {
    x0: DVector<f64>,
    target_acceptance_rate: f64,
    current: Option<DVector<f64>>,
    current_log_pdf: f64,
    proposed: DVector<f64>,
    mu: DVector<f64>,
    sigma: DMatrix<f64>,
    log_lambda: f64,
    // Robbins-Monro step counter; gamma = adaptations^-0.6
    adaptations: f64,
    iterations: u64,
    acceptance: f64,
    initial_phase: bool,
    handshake: Handshake,
    rng: SmallRng,
}

impl AdaptiveCovariance {
    /// Creates a sampler starting at `x0` with initial proposal covariance `sigma0`.
    pub fn new(
        x0: Vec<f64>,
        sigma0: DMatrix<f64>,
        settings: AdaptiveCovarianceSettings,
    ) -> Result<Self> {
        let d = x0.len();
        if d == 0 {
            return Err(McmcError::construction("x0 must have at least one parameter"));
        }
        if sigma0.nrows() != d || sigma0.ncols() != d {
            return Err(McmcError::construction(format!(
                "sigma0 must be {d}x{d}, got {}x{}",
                sigma0.nrows(),
                sigma0.ncols()
            )));
        }
        if sigma0.clone().cholesky().is_none() {
            return Err(McmcError::construction("sigma0 must be positive definite"));
        }
        let x0 = DVector::from_vec(x0);
        Ok(Self {
            mu: x0.clone(),
            proposed: x0.clone(),
            x0,
            target_acceptance_rate: settings.target_acceptance_rate,
            current: None,
            current_log_pdf: f64::NAN,
            sigma: sigma0,
            log_lambda: 0.0,
            adaptations: 2.0,
            iterations: 0,
            acceptance: 0.0,
            initial_phase: false,
            handshake: Handshake::default(),
            rng: SmallRng::from_entropy(),
        })
    }

    /// Current proposal covariance `Σ` (before scaling by `exp(loga)`).
    pub fn sigma(&self) -> &DMatrix<f64> {
        &self.sigma
    }

    /// Running estimate of the target mean.
    pub fn mean(&self) -> &DVector<f64> {
        &self.mu
    }

    pub fn log_lambda(&self) -> f64 {
        self.log_lambda
    }

    pub fn target_acceptance_rate(&self) -> f64 {
        self.target_acceptance_rate
    }

    fn propose(&mut self, current: &DVector<f64>) -> Result<DVector<f64>> {
        let l = lower_cholesky(&self.sigma).ok_or_else(|| {
            McmcError::construction("proposal covariance is no longer positive definite")
        })?;
        let z = standard_normal(&mut self.rng, current.len());
        Ok(current + (l * z) * (0.5 * self.log_lambda).exp())
    }

    fn adapt(&mut self, accepted: bool) {
        let gamma = self.adaptations.powf(-0.6);
        self.adaptations += 1.0;

        let Some(current) = self.current.as_ref() else {
            return;
        };
        self.mu = &self.mu * (1.0 - gamma) + current * gamma;
        self.log_lambda += gamma * (f64::from(u8::from(accepted)) - self.target_acceptance_rate);
        let dsigm = current - &self.mu;
        self.sigma = &self.sigma * (1.0 - gamma) + (&dsigm * dsigm.transpose()) * gamma;
    }
}

impl SingleChainSampler for AdaptiveCovariance {
    fn name(&self) -> &'static str {
        "Adaptive covariance MCMC"
    }

    fn n_parameters(&self) -> usize {
        self.x0.len()
    }

    fn ask(&mut self) -> Result<Vec<f64>> {
        self.handshake.begin_ask()?;
        self.proposed = match self.current.clone() {
            None => self.x0.clone(),
            Some(current) => self.propose(&current)?,
        };
        Ok(self.proposed.iter().copied().collect())
    }

    fn tell(&mut self, reply: Evaluation) -> Result<Option<Vec<f64>>> {
        self.handshake.begin_tell()?;
        let fx = reply.log_pdf;

        if self.current.is_none() {
            self.handshake.check_initial(fx)?;
            self.current = Some(self.x0.clone());
            self.current_log_pdf = fx;
            return Ok(Some(self.x0.iter().copied().collect()));
        }

        let accepted = fx.is_finite() && {
            let u: f64 = self.rng.gen();
            u.ln() < fx - self.current_log_pdf
        };
        if accepted {
            self.current = Some(self.proposed.clone());
            self.current_log_pdf = fx;
        }

        self.iterations += 1;
        let n = self.iterations as f64;
        self.acceptance = ((n - 1.0) * self.acceptance + f64::from(u8::from(accepted))) / n;

        if !self.initial_phase {
            self.adapt(accepted);
        }

        Ok(self.current.as_ref().map(|c| c.iter().copied().collect()))
    }

    fn current_log_pdf(&self) -> Option<f64> {
        self.current.as_ref().map(|_| self.current_log_pdf)
    }

    fn acceptance_rate(&self) -> Option<f64> {
        Some(self.acceptance)
    }

    fn set_seed(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
    }

    fn as_adaptive(&self) -> Option<&dyn Adaptive> {
        Some(self)
    }

    fn as_adaptive_mut(&mut self) -> Option<&mut dyn Adaptive> {
        Some(self)
    }
}

impl Adaptive for AdaptiveCovariance {
    fn needs_initial_phase(&self) -> bool {
        true
    }

    fn in_initial_phase(&self) -> bool {
        self.initial_phase
    }

    fn set_initial_phase(&mut self, initial_phase: bool) {
        self.initial_phase = initial_phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Gaussian;
    use crate::log_pdf::LogPdf;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Axis};
    use ndarray_stats::CorrelationExt;

    const SEED: u64 = 42;

    fn sampler(target: f64) -> AdaptiveCovariance {
        let mut s = AdaptiveCovariance::new(
            vec![0.1, -0.1],
            DMatrix::identity(2, 2),
            AdaptiveCovarianceSettings::new(target).unwrap(),
        )
        .unwrap();
        s.set_seed(SEED);
        s
    }

    fn run(s: &mut AdaptiveCovariance, f: &impl LogPdf, n: usize) -> Vec<Vec<f64>> {
        let mut chain = Vec::with_capacity(n);
        while chain.len() < n {
            let x = s.ask().unwrap();
            let fx = f.evaluate(&x).unwrap();
            if let Some(sample) = s.tell(Evaluation::new(fx)).unwrap() {
                chain.push(sample);
            }
        }
        chain
    }

    #[test]
    fn first_sample_is_initial_point() {
        let mut s = sampler(0.25);
        assert_eq!(s.ask().unwrap(), vec![0.1, -0.1]);
        assert_eq!(s.current_log_pdf(), None);
        let sample = s.tell(Evaluation::new(-1.0)).unwrap();
        assert_eq!(sample, Some(vec![0.1, -0.1]));
        assert_eq!(s.current_log_pdf(), Some(-1.0));
    }

    #[test]
    fn protocol_errors() {
        let mut s = sampler(0.25);
        assert!(matches!(
            s.tell(Evaluation::new(0.0)),
            Err(McmcError::Protocol(_))
        ));
        s.ask().unwrap();
        assert!(matches!(s.ask(), Err(McmcError::Protocol(_))));
    }

    #[test]
    fn non_finite_initial_point_is_fatal() {
        let mut s = sampler(0.25);
        s.ask().unwrap();
        assert!(matches!(
            s.tell(Evaluation::new(f64::NEG_INFINITY)),
            Err(McmcError::NonFiniteInitialDensity { .. })
        ));
        assert!(matches!(s.ask(), Err(McmcError::SamplerFailed)));
    }

    #[test]
    fn non_finite_proposal_is_rejected() {
        let mut s = sampler(0.25);
        s.ask().unwrap();
        s.tell(Evaluation::new(-1.0)).unwrap();
        s.ask().unwrap();
        let sample = s.tell(Evaluation::new(f64::NAN)).unwrap();
        assert_eq!(sample, Some(vec![0.1, -0.1]));
        assert_eq!(s.acceptance_rate(), Some(0.0));
    }

    #[test]
    fn initial_phase_freezes_adaptation() {
        let target = Gaussian::isotropic(vec![0.0, 0.0], 1.0).unwrap();
        let mut s = sampler(0.25);
        s.set_initial_phase(true);
        run(&mut s, &target, 200);
        assert_eq!(s.sigma(), &DMatrix::identity(2, 2));
        assert_eq!(s.log_lambda(), 0.0);

        s.set_initial_phase(false);
        run(&mut s, &target, 10);
        assert_ne!(s.sigma(), &DMatrix::identity(2, 2));
    }

    #[test]
    fn seeded_runs_are_identical() {
        let target = Gaussian::isotropic(vec![0.0, 0.0], 1.0).unwrap();
        let a = run(&mut sampler(0.3), &target, 500);
        let b = run(&mut sampler(0.3), &target, 500);
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_invalid_target_rate() {
        assert!(AdaptiveCovarianceSettings::new(0.0).is_err());
        assert!(AdaptiveCovarianceSettings::new(1.5).is_err());
        assert!(AdaptiveCovarianceSettings::new(f64::NAN).is_err());
        assert!(AdaptiveCovarianceSettings::new(1.0).is_ok());
    }

    #[test]
    fn covariance_tracks_target() {
        let cov = DMatrix::from_row_slice(2, 2, &[2.0, 0.8, 0.8, 1.0]);
        let target = Gaussian::new(vec![1.0, -1.0], cov).unwrap();
        let mut s = sampler(0.234);
        let chain = run(&mut s, &target, 40_000);

        let flat: Vec<f64> = chain[5_000..].iter().flatten().copied().collect();
        let samples = Array2::from_shape_vec((flat.len() / 2, 2), flat).unwrap();
        let mean = samples.mean_axis(Axis(0)).unwrap();
        let sample_cov = samples.t().cov(1.0).unwrap();
        assert_abs_diff_eq!(mean[0], 1.0, epsilon = 0.15);
        assert_abs_diff_eq!(mean[1], -1.0, epsilon = 0.15);
        assert_abs_diff_eq!(sample_cov[[0, 0]], 2.0, epsilon = 0.3);
        assert_abs_diff_eq!(sample_cov[[1, 1]], 1.0, epsilon = 0.15);
        assert!(s.sigma()[(0, 1)] > 0.0, "adapted covariance lost the correlation sign");
    }
}
