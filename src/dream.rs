/*!
# DREAM

Differential Evolution Adaptive Metropolis (Vrugt et al., 2009).

DREAM extends [Differential Evolution](crate::differential_evolution) in
three ways:

- **Several chain pairs.** `δ ~ U{1..δmax}` chain pairs are summed into one
  jump, with scale `γ = 2.38/√(2δd)`. With probability `p_g` the scale is
  `γ = 1` instead, which lets chains jump between modes.
- **Randomised jump length.** Each difference is multiplied by `1 + e`, where
  `e ~ U(−b*, b*)·|μ0|`.
- **Crossover.** Only a random subset of coordinates is updated. The
  crossover probability `CR = (m+1)/n_CR` is drawn from a categorical
  distribution over `m`. While the sampler is in its initial phase, those
  category probabilities adapt toward the values that produce the largest
  normalised jumps.

Once the initial phase ends, the crossover distribution is frozen and the
chain is a valid Markov chain.
*/

use nalgebra::DVector;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::differential_evolution::{draw_pair, population, relative_scale, to_rows};
use crate::error::{McmcError, Result};
use crate::evaluator::Evaluation;
use crate::sampler::{standard_normal, Adaptive, Handshake, MultiChainSampler};

#[derive(Debug, Clone, PartialEq)]
pub struct DreamSettings {
    /// Jitter standard deviation, relative to `|μ0|`.
    pub b: f64,
    /// Half-width of the jump-length randomisation, relative to `|μ0|`.
    pub b_star: f64,
    /// Probability of a `γ = 1` jump.
    pub p_g: f64,
    /// Maximum number of chain pairs per jump.
    pub delta_max: usize,
    /// Use the fixed `cr` instead of adaptive crossover.
    pub constant_crossover: bool,
    pub cr: f64,
    /// Number of crossover categories.
    pub n_cr: usize,
}

impl Default for DreamSettings {
    fn default() -> Self {
        Self {
            b: 0.01,
            b_star: 0.01,
            p_g: 0.2,
            delta_max: 3,
            constant_crossover: false,
            cr: 0.5,
            n_cr: 3,
        }
    }
}

impl DreamSettings {
    fn validate(&self) -> Result<()> {
        let non_negative = |v: f64| v.is_finite() && v >= 0.0;
        if !non_negative(self.b) || !non_negative(self.b_star) {
            return Err(McmcError::construction("b and b_star must be non-negative"));
        }
        if !(0.0..=1.0).contains(&self.p_g) {
            return Err(McmcError::construction(format!(
                "p_g must be in [0, 1], got {}",
                self.p_g
            )));
        }
        if self.delta_max < 1 {
            return Err(McmcError::construction("delta_max must be at least 1"));
        }
        if !(self.cr > 0.0 && self.cr <= 1.0) {
            return Err(McmcError::construction(format!(
                "crossover probability must be in (0, 1], got {}",
                self.cr
            )));
        }
        if self.n_cr < 1 {
            return Err(McmcError::construction("n_cr must be at least 1"));
        }
        Ok(())
    }
}

pub struct Dream {
    settings: DreamSettings,
    x0: Vec<DVector<f64>>,
    jitter: DVector<f64>,
    jump_noise: DVector<f64>,

    current: Option<Vec<DVector<f64>>>,
    current_log_pdfs: Vec<f64>,
    proposed: Vec<DVector<f64>>,
    // Crossover category used by each chain's pending proposal.
    categories: Vec<usize>,

    p_cr: Vec<f64>,
    cr_counts: Vec<f64>,
    cr_jumps: Vec<f64>,
    initial_phase: bool,

    accepted: Vec<u64>,
    iterations: u64,
    handshake: Handshake,
    rng: SmallRng,
}

impl Dream {
    pub fn new(x0: Vec<Vec<f64>>, settings: DreamSettings) -> Result<Self> {
        settings.validate()?;
        let x0 = population(x0, 3)?;
        let n = x0.len();
        let n_cr = settings.n_cr;
        Ok(Self {
            jitter: relative_scale(&x0, settings.b),
            jump_noise: relative_scale(&x0, settings.b_star),
            proposed: x0.clone(),
            x0,
            current: None,
            current_log_pdfs: vec![f64::NAN; n],
            categories: vec![0; n],
            p_cr: vec![1.0 / n_cr as f64; n_cr],
            cr_counts: vec![0.0; n_cr],
            cr_jumps: vec![0.0; n_cr],
            initial_phase: !settings.constant_crossover,
            accepted: vec![0; n],
            iterations: 0,
            handshake: Handshake::default(),
            rng: SmallRng::from_entropy(),
            settings,
        })
    }

    /// Current probabilities of the crossover categories.
    pub fn crossover_probabilities(&self) -> &[f64] {
        &self.p_cr
    }

    fn propose_one(
        &mut self,
        current: &[DVector<f64>],
        j: usize,
        crossover: &WeightedIndex<f64>,
    ) -> DVector<f64> {
        let n = current.len();
        let d = current[j].len();

        let delta = self.rng.gen_range(1..=self.settings.delta_max);
        let gamma = if self.rng.gen::<f64>() > self.settings.p_g {
            2.38 / (2.0 * (delta * d) as f64).sqrt()
        } else {
            1.0
        };
        let e = DVector::from_iterator(
            d,
            self.jump_noise
                .iter()
                .map(|s| if *s > 0.0 { self.rng.gen_range(-s..*s) } else { 0.0 }),
        );
        let mut jump = DVector::<f64>::zeros(d);
        for _ in 0..delta {
            let (r1, r2) = draw_pair(&mut self.rng, n, j);
            jump += (&current[r1] - &current[r2]).component_mul(&e.add_scalar(1.0)) * gamma;
        }
        let noise = standard_normal(&mut self.rng, d).component_mul(&self.jitter);
        let full = &current[j] + jump + noise;

        let cr = if self.settings.constant_crossover {
            self.settings.cr
        } else {
            let m = crossover.sample(&mut self.rng);
            self.categories[j] = m;
            (m + 1) as f64 / self.settings.n_cr as f64
        };

        let mut proposal = current[j].clone();
        let mut changed = false;
        for k in 0..d {
            if self.rng.gen::<f64>() >= 1.0 - cr {
                proposal[k] = full[k];
                changed = true;
            }
        }
        if !changed {
            let k = self.rng.gen_range(0..d);
            proposal[k] = full[k];
        }
        proposal
    }

    /// Accumulates the normalised squared jumps of this iteration and
    /// re-weights the crossover categories.
    fn adapt_crossover(&mut self, previous: &[DVector<f64>], current: &[DVector<f64>]) {
        let n = current.len() as f64;
        let d = current[0].len();
        let mean = current.iter().fold(DVector::<f64>::zeros(d), |acc, x| acc + x) / n;
        let var = current
            .iter()
            .fold(DVector::zeros(d), |acc: DVector<f64>, x| {
                let r = x - &mean;
                acc + r.component_mul(&r)
            })
            / n;

        for (j, (old, new)) in previous.iter().zip(current).enumerate() {
            let m = self.categories[j];
            self.cr_counts[m] += 1.0;
            self.cr_jumps[m] += (0..d)
                .filter(|&k| var[k] > 0.0)
                .map(|k| (new[k] - old[k]).powi(2) / var[k])
                .sum::<f64>();
        }

        let weights: Vec<f64> = self
            .cr_jumps
            .iter()
            .zip(&self.cr_counts)
            .map(|(jumps, count)| if *count > 0.0 { jumps / count } else { 0.0 })
            .collect();
        let total: f64 = weights.iter().sum();
        if total > 0.0 && total.is_finite() {
            self.p_cr = weights.iter().map(|w| w / total).collect();
        }
    }
}

impl MultiChainSampler for Dream {
    fn name(&self) -> &'static str {
        "DREAM"
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
            Some(current) => {
                let crossover = WeightedIndex::new(&self.p_cr).map_err(|e| {
                    McmcError::construction(format!("invalid crossover probabilities: {e}"))
                })?;
                (0..current.len())
                    .map(|j| self.propose_one(&current, j, &crossover))
                    .collect()
            }
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

        let Some(mut current) = self.current.take() else {
            for reply in replies {
                self.handshake.check_initial(reply.log_pdf)?;
            }
            self.current_log_pdfs = replies.iter().map(|r| r.log_pdf).collect();
            self.current = Some(self.x0.clone());
            return Ok(Some(to_rows(&self.x0)));
        };

        let previous = current.clone();
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

        if self.initial_phase && !self.settings.constant_crossover {
            self.adapt_crossover(&previous, &current);
        }

        let rows = to_rows(&current);
        self.current = Some(current);
        Ok(Some(rows))
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

    fn as_adaptive(&self) -> Option<&dyn Adaptive> {
        Some(self)
    }

    fn as_adaptive_mut(&mut self) -> Option<&mut dyn Adaptive> {
        Some(self)
    }
}

impl Adaptive for Dream {
    fn needs_initial_phase(&self) -> bool {
        !self.settings.constant_crossover
    }

    fn in_initial_phase(&self) -> bool {
        self.initial_phase
    }

    fn set_initial_phase(&mut self, initial_phase: bool) {
        if !initial_phase && self.initial_phase {
            log::debug!("crossover probabilities frozen at {:?}", self.p_cr);
        }
        self.initial_phase = initial_phase;
    }
}
