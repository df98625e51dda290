/*!
# Differential Evolution MCMC

Population MCMC (ter Braak, 2006). All chains are advanced together. Chain
`j` proposes

```text
x' = x_j + γ·(x_r1 − x_r2) + ε
```

where `r1 ≠ r2` are two other chains drawn without replacement, `γ` defaults
to `2.38/√(2d)`, and `ε ~ N(0, b·|μ0|)`. Here `μ0` is the mean of the
initial points. Each proposal is accepted or rejected with its own Metropolis
test, so every chain keeps the target as its stationary distribution.

At least three chains are required.

# Examples

```rust
use asktell_mcmc::differential_evolution::{DifferentialEvolution, DifferentialEvolutionSettings};
use asktell_mcmc::distributions::Gaussian;
use asktell_mcmc::evaluator::Evaluation;
use asktell_mcmc::log_pdf::LogPdf;
use asktell_mcmc::sampler::MultiChainSampler;

let target = Gaussian::isotropic(vec![1.0, 1.0], 1.0).unwrap();
let x0 = vec![vec![0.0, 0.5], vec![1.5, 1.0], vec![2.0, 0.0], vec![0.5, 2.0]];
let mut de = DifferentialEvolution::new(x0, DifferentialEvolutionSettings::default()).unwrap();
de.set_seed(1);

for _ in 0..100 {
    let xs = de.ask().unwrap();
    let fs: Vec<Evaluation> = xs.iter().map(|x| target.evaluate(x).unwrap().into()).collect();
    let samples = de.tell(&fs).unwrap().unwrap();
    assert_eq!(samples.len(), 4);
}
```
*/

use nalgebra::DVector;
use rand::rngs::SmallRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};

use crate::error::{McmcError, Result};
use crate::evaluator::Evaluation;
use crate::sampler::{standard_normal, Handshake, MultiChainSampler};

#[derive(Debug, Clone, PartialEq)]
pub struct DifferentialEvolutionSettings {
    /// Scale of the difference vector. `None` means `2.38/√(2d)`.
    pub gamma: Option<f64>,
    /// Standard deviation `b` of the jitter added to every proposal.
    pub noise_scale: f64,
    /// Whether the jitter is `b·|μ0|` (relative) or `b` (absolute).
    pub relative_noise: bool,
}

impl Default for DifferentialEvolutionSettings {
    fn default() -> Self {
        Self {
            gamma: None,
            noise_scale: 0.01,
            relative_noise: true,
        }
    }
}

pub struct DifferentialEvolution {
    x0: Vec<DVector<f64>>,
    gamma: f64,
    jitter: DVector<f64>,
    current: Option<Vec<DVector<f64>>>,
    current_log_pdfs: Vec<f64>,
    proposed: Vec<DVector<f64>>,
    accepted: Vec<u64>,
    iterations: u64,
    handshake: Handshake,
    rng: SmallRng,
}

/// Checks a population of starting points and converts it to vectors.
pub(crate) fn population(x0: Vec<Vec<f64>>, min_chains: usize) -> Result<Vec<DVector<f64>>> {
    if x0.len() < min_chains {
        return Err(McmcError::construction(format!(
            "at least {min_chains} chains are required, got {}",
            x0.len()
        )));
    }
    let d = x0[0].len();
    if d == 0 {
        return Err(McmcError::construction("x0 must have at least one parameter"));
    }
    if x0.iter().any(|x| x.len() != d) {
        return Err(McmcError::construction(
            "all initial points must have the same dimension",
        ));
    }
    Ok(x0.into_iter().map(DVector::from_vec).collect())
}

/// Per-coordinate scale `b·|μ|`, falling back to `b` where `μ_i = 0`.
pub(crate) fn relative_scale(x0: &[DVector<f64>], b: f64) -> DVector<f64> {
    let n = x0.len() as f64;
    let mu = x0
        .iter()
        .fold(DVector::zeros(x0[0].len()), |acc, x| acc + x)
        / n;
    mu.map(|m| if m == 0.0 { b } else { b * m.abs() })
}

/// Draws two distinct chain indices, both different from `j`.
pub(crate) fn draw_pair<R: Rng>(rng: &mut R, n_chains: usize, j: usize) -> (usize, usize) {
    let picked = index::sample(rng, n_chains - 1, 2);
    let skip = |k: usize| if k < j { k } else { k + 1 };
    (skip(picked.index(0)), skip(picked.index(1)))
}

pub(crate) fn to_rows(xs: &[DVector<f64>]) -> Vec<Vec<f64>> {
    xs.iter().map(|x| x.iter().copied().collect()).collect()
}

impl DifferentialEvolution {
    pub fn new(x0: Vec<Vec<f64>>, settings: DifferentialEvolutionSettings) -> Result<Self> {
        let x0 = population(x0, 3)?;
        let d = x0[0].len();
        let gamma = settings
            .gamma
            .unwrap_or(2.38 / (2.0 * d as f64).sqrt());
        if !(gamma.is_finite() && gamma > 0.0) {
            return Err(McmcError::construction(format!(
                "gamma must be positive, got {gamma}"
            )));
        }
        if !(settings.noise_scale.is_finite() && settings.noise_scale >= 0.0) {
            return Err(McmcError::construction(
                "noise scale must be non-negative",
            ));
        }
        let jitter = if settings.relative_noise {
            relative_scale(&x0, settings.noise_scale)
        } else {
            DVector::from_element(d, settings.noise_scale)
        };
        let n = x0.len();
        Ok(Self {
            proposed: x0.clone(),
            x0,
            gamma,
            jitter,
            current: None,
            current_log_pdfs: vec![f64::NAN; n],
            accepted: vec![0; n],
            iterations: 0,
            handshake: Handshake::default(),
            rng: SmallRng::from_entropy(),
        })
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    fn propose(&mut self, current: &[DVector<f64>]) -> Vec<DVector<f64>> {
        let n = current.len();
        let d = current[0].len();
        (0..n)
            .map(|j| {
                let (r1, r2) = draw_pair(&mut self.rng, n, j);
                let noise = standard_normal(&mut self.rng, d).component_mul(&self.jitter);
                &current[j] + (&current[r1] - &current[r2]) * self.gamma + noise
            })
            .collect()
    }
}

impl MultiChainSampler for DifferentialEvolution {
    fn name(&self) -> &'static str {
        "Differential Evolution MCMC"
    }

    fn n_chains(&self) -> usize {
        self.x0.len()
    }

    fn n_parameters(&self) -> usize {
        self.x0[0].len()
    }

    fn ask(&mut self) -> Result<Vec<Vec<f64>>> {
        self.handshake.begin_ask()?;
        self.proposed = match self.current.clone() {
            None => self.x0.clone(),
            Some(current) => self.propose(&current),
        };
        Ok(to_rows(&self.proposed))
    }

    fn tell(&mut self, replies: &[Evaluation]) -> Result<Option<Vec<Vec<f64>>>> {
        if replies.len() != self.n_chains() {
            return Err(McmcError::protocol(format!(
                "expected {} evaluations, got {}",
                self.n_chains(),
                replies.len()
            )));
        }
        self.handshake.begin_tell()?;

        let Some(current) = self.current.as_mut() else {
            for reply in replies {
                self.handshake.check_initial(reply.log_pdf)?;
            }
            self.current_log_pdfs = replies.iter().map(|r| r.log_pdf).collect();
            self.current = Some(self.x0.clone());
            return Ok(Some(to_rows(&self.x0)));
        };

        for (j, reply) in replies.iter().enumerate() {
            let fx = reply.log_pdf;
            if !fx.is_finite() {
                continue;
            }
            let u: f64 = self.rng.gen();
            if u.ln() < fx - self.current_log_pdfs[j] {
                current[j] = self.proposed[j].clone();
                self.current_log_pdfs[j] = fx;
                self.accepted[j] += 1;
            }
        }
        self.iterations += 1;
        Ok(Some(to_rows(current)))
    }

    fn current_log_pdfs(&self) -> Option<Vec<f64>> {
        self.current.as_ref().map(|_| self.current_log_pdfs.clone())
    }

    fn acceptance_rates(&self) -> Vec<Option<f64>> {
        self.accepted
            .iter()
            .map(|&a| (self.iterations > 0).then(|| a as f64 / self.iterations as f64))
            .collect()
    }

    fn set_seed(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Gaussian;
    use crate::log_pdf::LogPdf;
    use approx::assert_abs_diff_eq;

    fn start(n: usize) -> Vec<Vec<f64>> {
        (0..n)
            .map(|k| {
                let a = k as f64 - (n as f64 - 1.0) / 2.0;
                let b = ((k * 7) % n) as f64 - (n as f64 - 1.0) / 2.0;
                vec![3.0 + 0.4 * a, -2.0 + 0.3 * b]
            })
            .collect()
    }

    fn step(de: &mut DifferentialEvolution, target: &impl LogPdf) -> Vec<Vec<f64>> {
        let xs = de.ask().unwrap();
        let fs: Vec<Evaluation> = xs.iter().map(|x| target.evaluate(x).unwrap().into()).collect();
        de.tell(&fs).unwrap().unwrap()
    }

    #[test]
    fn needs_three_chains() {
        let err = DifferentialEvolution::new(start(2), Default::default());
        assert!(matches!(err, Err(McmcError::Construction(_))));
        let ragged = vec![vec![0.0, 0.0], vec![1.0], vec![2.0, 2.0]];
        assert!(DifferentialEvolution::new(ragged, Default::default()).is_err());
    }

    #[test]
    fn default_gamma() {
        let de = DifferentialEvolution::new(start(4), Default::default()).unwrap();
        assert_abs_diff_eq!(de.gamma(), 2.38 / 2.0);
    }

    #[test]
    fn pairs_exclude_own_chain() {
        let mut rng = SmallRng::seed_from_u64(0);
        for _ in 0..1000 {
            let j = rng.gen_range(0..5);
            let (r1, r2) = draw_pair(&mut rng, 5, j);
            assert!(r1 != r2 && r1 != j && r2 != j);
            assert!(r1 < 5 && r2 < 5);
        }
    }

    #[test]
    fn protocol_and_initial_density() {
        let mut de = DifferentialEvolution::new(start(4), Default::default()).unwrap();
        assert!(matches!(
            de.tell(&vec![Evaluation::new(0.0); 4]),
            Err(McmcError::Protocol(_))
        ));
        assert_eq!(de.ask().unwrap(), start(4));
        assert!(matches!(de.ask(), Err(McmcError::Protocol(_))));
        assert!(matches!(
            de.tell(&vec![Evaluation::new(0.0); 3]),
            Err(McmcError::Protocol(_))
        ));
        let mut replies = vec![Evaluation::new(0.0); 4];
        replies[2] = Evaluation::new(f64::NEG_INFINITY);
        assert!(matches!(
            de.tell(&replies),
            Err(McmcError::NonFiniteInitialDensity { .. })
        ));
        assert!(matches!(de.ask(), Err(McmcError::SamplerFailed)));
    }

    #[test]
    fn non_finite_proposals_are_rejected() {
        let mut de = DifferentialEvolution::new(start(3), Default::default()).unwrap();
        de.set_seed(5);
        de.ask().unwrap();
        de.tell(&vec![Evaluation::new(-1.0); 3]).unwrap();
        de.ask().unwrap();
        let samples = de.tell(&vec![Evaluation::new(f64::NAN); 3]).unwrap().unwrap();
        assert_eq!(samples, start(3));
        assert_eq!(de.acceptance_rates(), vec![Some(0.0); 3]);
    }

    #[test]
    fn recovers_mode() {
        let target = Gaussian::diagonal(vec![3.0, -2.0], vec![1.0, 0.5]).unwrap();
        let mut de = DifferentialEvolution::new(start(10), Default::default()).unwrap();
        de.set_seed(42);

        let mut sums = [0.0; 2];
        let mut count = 0.0;
        for i in 0..6_000 {
            let samples = step(&mut de, &target);
            if i >= 1_000 {
                for s in &samples {
                    sums[0] += s[0];
                    sums[1] += s[1];
                    count += 1.0;
                }
            }
        }
        assert_abs_diff_eq!(sums[0] / count, 3.0, epsilon = 0.15);
        assert_abs_diff_eq!(sums[1] / count, -2.0, epsilon = 0.15);
    }

    #[test]
    fn seeded_runs_are_identical() {
        let target = Gaussian::isotropic(vec![0.0, 0.0], 1.0).unwrap();
        let run = || {
            let mut de = DifferentialEvolution::new(start(5), Default::default()).unwrap();
            de.set_seed(9);
            (0..50).map(|_| step(&mut de, &target)).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
