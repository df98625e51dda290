/*!
# MCMC controller

[`McmcController`] runs one or more chains to completion. It drives the samplers through
their ask/tell protocol, evaluates the proposed points in batches, and assembles the
emitted samples into chains. Along the way it:

- switches adaptive samplers out of their initial phase after a configured number of
  iterations;
- reports progress (acceptance rates and the running R-hat);
- streams every retained sample, and optionally its log-pdf, to per-chain CSV files;
- discards a warm-up prefix and thins the rest.

# Examples

```rust
use asktell_mcmc::controller::McmcController;
use asktell_mcmc::distributions::Gaussian;
use asktell_mcmc::sampler::{Method, Sigma0};
use asktell_mcmc::slice_doubling::SliceDoublingSettings;

let target = Gaussian::isotropic(vec![0.0, 0.0], 1.0).unwrap();
let x0 = vec![vec![0.1, 0.2], vec![-0.3, 0.4]];
let method = Method::SliceDoubling(SliceDoublingSettings::default());

let mut controller = McmcController::new(target, 2, x0, Some(Sigma0::Scalar(1.0)), method)
    .unwrap()
    .set_max_iterations(Some(500))
    .set_seed(42);
let chains = controller.run().unwrap();
assert_eq!(chains.shape(), &[2, 500, 2]);
```
*/

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::Array3;

use crate::error::{McmcError, Result};
use crate::evaluator::{
    Evaluation, EvaluationResult, Evaluator, ParallelEvaluator, SequentialEvaluator,
};
use crate::io::csv::{chain_file_name, RowWriter};
use crate::log_pdf::LogPdf;
use crate::progress::{BarProgress, LogProgress, ProgressRecord, ProgressSink};
use crate::sampler::{Adaptive, Method, MultiChainSampler, Sigma0, SingleChainSampler};
use crate::stats::RhatMulti;

/// How log-pdf evaluations are spread over threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parallelism {
    /// Evaluate on the calling thread.
    #[default]
    Sequential,
    /// A pool with this many workers, capped at the number of points per batch.
    Workers(usize),
    /// One worker per available CPU, capped at the number of points per batch.
    Auto,
}

/// The leading part of every chain that is left out of the returned samples and files.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WarmUp {
    Iterations(usize),
    /// A fraction in `[0, 1)` of the maximum number of iterations, rounded down.
    Fraction(f64),
}

impl Default for WarmUp {
    fn default() -> Self {
        WarmUp::Iterations(0)
    }
}

impl WarmUp {
    fn iterations(&self, max_iterations: usize) -> Result<usize> {
        match *self {
            WarmUp::Iterations(n) => Ok(n),
            WarmUp::Fraction(f) if (0.0..1.0).contains(&f) => {
                Ok((f * max_iterations as f64).floor() as usize)
            }
            WarmUp::Fraction(f) => Err(McmcError::construction(format!(
                "warm-up fraction must be in [0, 1), got {f}"
            ))),
        }
    }
}

enum Samplers {
    Single(Vec<Box<dyn SingleChainSampler>>),
    Multi(Box<dyn MultiChainSampler>),
}

impl Samplers {
    fn name(&self) -> &'static str {
        match self {
            Samplers::Single(s) => s.first().map_or("MCMC", |s| s.name()),
            Samplers::Multi(s) => s.name(),
        }
    }

    fn needs_sensitivities(&self) -> bool {
        match self {
            Samplers::Single(s) => s.iter().any(|s| s.needs_sensitivities()),
            Samplers::Multi(s) => s.needs_sensitivities(),
        }
    }

    fn adaptive_mut(&mut self) -> Vec<&mut dyn Adaptive> {
        match self {
            Samplers::Single(s) => s.iter_mut().filter_map(|s| s.as_adaptive_mut()).collect(),
            Samplers::Multi(s) => s.as_adaptive_mut().into_iter().collect(),
        }
    }

    fn acceptance_rates(&self) -> Vec<Option<f64>> {
        match self {
            Samplers::Single(s) => s.iter().map(|s| s.acceptance_rate()).collect(),
            Samplers::Multi(s) => s.acceptance_rates(),
        }
    }

    fn set_seed(&mut self, seed: u64) {
        match self {
            Samplers::Single(s) => s
                .iter_mut()
                .enumerate()
                .for_each(|(i, s)| s.set_seed(seed.wrapping_add(i as u64))),
            Samplers::Multi(s) => s.set_seed(seed),
        }
    }
}

/**
Runs MCMC chains on a log-pdf.

Configure with the consuming `set_*` methods, then call [`McmcController::run`].

Defaults:
- at most 10,000 iterations;
- an initial phase of 200 iterations for samplers that need one;
- sequential evaluation;
- a progress record every 20 iterations, sent to the `log` facade;
- no files, no warm-up and no thinning.
*/
pub struct McmcController<F: LogPdf + 'static> {
    log_pdf: Arc<F>,
    samplers: Samplers,
    n_chains: usize,
    n_parameters: usize,

    max_iterations: Option<usize>,
    initial_phase_iterations: usize,
    parallel: Parallelism,
    log_interval: usize,
    log_to_screen: bool,
    progress: Option<Box<dyn ProgressSink>>,
    chain_filename: Option<PathBuf>,
    log_pdf_filename: Option<PathBuf>,
    warm_up: WarmUp,
    thinning: usize,

    evaluations: usize,
    time: Option<Duration>,
}

impl<F: LogPdf + 'static> McmcController<F> {
    /**
    Creates a controller that runs `n_chains` chains of `method`, starting from `x0`.

    `sigma0` is the initial guess of the target's spread. Without one, each parameter gets
    a standard deviation of `0.1·sqrt(|x0_i|)`, i.e. a variance of `0.01·|x0_i|`, where
    zero entries count as one.

    # Errors

    Returns [`McmcError::Construction`] when any of the following holds:
    - `x0` does not hold exactly `n_chains` points of the target's dimension;
    - `sigma0` has the wrong shape or is not positive definite;
    - a multi-chain method gets fewer than three chains;
    - the method needs gradients the target does not provide.
    */
    pub fn new(
        log_pdf: F,
        n_chains: usize,
        x0: Vec<Vec<f64>>,
        sigma0: Option<Sigma0>,
        method: Method,
    ) -> Result<Self> {
        let d = log_pdf.n_parameters();
        if n_chains < 1 {
            return Err(McmcError::construction("number of chains must be at least 1"));
        }
        if x0.len() != n_chains {
            return Err(McmcError::construction(format!(
                "expected {n_chains} initial points, got {}",
                x0.len()
            )));
        }
        if let Some(x) = x0.iter().find(|x| x.len() != d) {
            return Err(McmcError::construction(format!(
                "initial points must have {d} parameters, got {}",
                x.len()
            )));
        }
        if n_chains < method.min_chains() {
            return Err(McmcError::construction(format!(
                "method needs at least {} chains, got {n_chains}",
                method.min_chains()
            )));
        }
        if method.needs_sensitivities() && !log_pdf.has_sensitivities() {
            return Err(McmcError::construction(
                "method needs gradients but the log-pdf does not provide them",
            ));
        }

        let samplers = if method.is_multi_chain() {
            for x in &x0 {
                Sigma0::resolve(sigma0.as_ref(), x)?;
            }
            Samplers::Multi(method.multi_chain(x0)?)
        } else {
            Samplers::Single(
                x0.into_iter()
                    .map(|x| method.single_chain(x, sigma0.as_ref()))
                    .collect::<Result<_>>()?,
            )
        };
        Ok(Self::with_samplers(log_pdf, samplers, n_chains, d))
    }

    /// Runs one user-built sampler per chain.
    pub fn from_single_chain_samplers(
        log_pdf: F,
        samplers: Vec<Box<dyn SingleChainSampler>>,
    ) -> Result<Self> {
        let d = log_pdf.n_parameters();
        if samplers.is_empty() {
            return Err(McmcError::construction("at least one sampler is required"));
        }
        if samplers.iter().any(|s| s.n_parameters() != d) {
            return Err(McmcError::construction(format!(
                "every sampler must have {d} parameters"
            )));
        }
        let n_chains = samplers.len();
        let samplers = Samplers::Single(samplers);
        if samplers.needs_sensitivities() && !log_pdf.has_sensitivities() {
            return Err(McmcError::construction(
                "sampler needs gradients but the log-pdf does not provide them",
            ));
        }
        Ok(Self::with_samplers(log_pdf, samplers, n_chains, d))
    }

    /// Runs a user-built population sampler.
    pub fn from_multi_chain_sampler(
        log_pdf: F,
        sampler: Box<dyn MultiChainSampler>,
    ) -> Result<Self> {
        let d = log_pdf.n_parameters();
        if sampler.n_parameters() != d {
            return Err(McmcError::construction(format!(
                "sampler must have {d} parameters, got {}",
                sampler.n_parameters()
            )));
        }
        if sampler.needs_sensitivities() && !log_pdf.has_sensitivities() {
            return Err(McmcError::construction(
                "sampler needs gradients but the log-pdf does not provide them",
            ));
        }
        let n_chains = sampler.n_chains();
        Ok(Self::with_samplers(log_pdf, Samplers::Multi(sampler), n_chains, d))
    }

    fn with_samplers(log_pdf: F, samplers: Samplers, n_chains: usize, n_parameters: usize) -> Self {
        Self {
            log_pdf: Arc::new(log_pdf),
            samplers,
            n_chains,
            n_parameters,
            max_iterations: Some(10_000),
            initial_phase_iterations: 200,
            parallel: Parallelism::Sequential,
            log_interval: 20,
            log_to_screen: false,
            progress: None,
            chain_filename: None,
            log_pdf_filename: None,
            warm_up: WarmUp::default(),
            thinning: 1,
            evaluations: 0,
            time: None,
        }
    }

    /// Iteration limit per chain. `None` disables it, which leaves no stopping criterion.
    pub fn set_max_iterations(mut self, max_iterations: Option<usize>) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn set_initial_phase_iterations(mut self, iterations: usize) -> Self {
        self.initial_phase_iterations = iterations;
        self
    }

    pub fn set_parallel(mut self, parallel: Parallelism) -> Self {
        self.parallel = parallel;
        self
    }

    /// Seeds the samplers. Chain `i` of a single-chain method gets `seed + i`.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.samplers.set_seed(seed);
        self
    }

    /// Iterations between progress records. Must be positive.
    pub fn set_log_interval(mut self, interval: usize) -> Self {
        self.log_interval = interval;
        self
    }

    /// Draws a progress bar unless a custom sink is set.
    pub fn set_log_to_screen(mut self, enabled: bool) -> Self {
        self.log_to_screen = enabled;
        self
    }

    pub fn set_progress_sink(mut self, sink: Box<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Streams chain `i` to `stem_<i>.ext` next to `path`.
    pub fn set_chain_filename(mut self, path: impl Into<PathBuf>) -> Self {
        self.chain_filename = Some(path.into());
        self
    }

    /// Streams the log-pdf of every retained sample of chain `i` to `stem_<i>.ext`.
    pub fn set_log_pdf_filename(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_pdf_filename = Some(path.into());
        self
    }

    pub fn set_warm_up(mut self, warm_up: WarmUp) -> Self {
        self.warm_up = warm_up;
        self
    }

    /// Keeps every `k`-th sample after the warm-up. Must be at least 1.
    pub fn set_thinning(mut self, k: usize) -> Self {
        self.thinning = k;
        self
    }

    pub fn n_chains(&self) -> usize {
        self.n_chains
    }

    pub fn n_parameters(&self) -> usize {
        self.n_parameters
    }

    pub fn sampler_name(&self) -> &'static str {
        self.samplers.name()
    }

    /// Log-pdf evaluations used by the last run.
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    /// Wall-clock duration of the last run.
    pub fn time(&self) -> Option<Duration> {
        self.time
    }

    fn evaluator(&self, batch: usize, sensitivities: bool) -> Result<Box<dyn Evaluator>> {
        let log_pdf = Arc::clone(&self.log_pdf);
        Ok(match self.parallel {
            Parallelism::Sequential => Box::new(SequentialEvaluator::new(log_pdf, sensitivities)),
            Parallelism::Workers(n) => {
                Box::new(ParallelEvaluator::new(log_pdf, n.min(batch), sensitivities)?)
            }
            Parallelism::Auto => Box::new(ParallelEvaluator::new(
                log_pdf,
                ParallelEvaluator::<F>::cpu_count().min(batch).max(1),
                sensitivities,
            )?),
        })
    }

    /**
    Runs every chain until it holds `max_iterations` samples.

    Returns the retained samples with shape `[chain][iteration][parameter]`. With a warm-up
    of `w` and thinning `k`, each chain keeps `ceil((max_iterations − w)/k)` rows.

    # Errors

    - [`McmcError::StoppingCriterionMissing`] if no iteration limit is set.
    - [`McmcError::Construction`] for a zero log interval, zero thinning, or a warm-up that
      covers the whole run.
    - [`McmcError::NonFiniteInitialDensity`] if an initial point has a non-finite log-pdf.
    - I/O errors from the chain or log-pdf files.
    */
    pub fn run(&mut self) -> Result<Array3<f64>> {
        let max_iterations = self
            .max_iterations
            .ok_or(McmcError::StoppingCriterionMissing)?;
        if self.log_interval == 0 {
            return Err(McmcError::construction("log interval must be positive"));
        }
        if self.thinning == 0 {
            return Err(McmcError::construction("thinning must be at least 1"));
        }
        let warm_up = self.warm_up.iterations(max_iterations)?;
        if warm_up >= max_iterations {
            return Err(McmcError::construction(format!(
                "warm-up of {warm_up} iterations leaves no samples out of {max_iterations}"
            )));
        }

        let sensitivities = self.samplers.needs_sensitivities();
        let evaluator = self.evaluator(self.n_chains, sensitivities)?;
        let mut store = ChainStore::new(
            self.n_chains,
            self.n_parameters,
            warm_up,
            self.thinning,
            self.chain_filename.as_ref(),
            self.log_pdf_filename.as_ref(),
            self.log_pdf.prior().is_some(),
        )?;

        let mut sink: Box<dyn ProgressSink> = match self.progress.take() {
            Some(sink) => sink,
            None if self.log_to_screen => Box::new(BarProgress::new()),
            None => Box::new(LogProgress),
        };

        let mut initial_phase = self.start_initial_phase();

        log::debug!(
            "Running {} with {} chain(s) and {} evaluation worker(s)",
            self.samplers.name(),
            self.n_chains,
            evaluator.n_workers()
        );
        sink.started(self.samplers.name(), Some(max_iterations));

        let start = Instant::now();
        self.evaluations = 0;
        let mut last_reported = None;
        let mut outcome = Ok(());

        while store.min_length() < max_iterations {
            if let Err(e) = self.step(&*evaluator, &mut store, max_iterations, sensitivities) {
                outcome = Err(e);
                break;
            }
            if initial_phase {
                initial_phase = self.end_initial_phase(&store);
            }

            let iteration = store.min_length();
            if last_reported != Some(iteration)
                && (iteration <= 3 || iteration % self.log_interval == 0)
            {
                sink.record(&self.record(iteration, &store, start.elapsed()));
                last_reported = Some(iteration);
            }
        }

        let iteration = store.min_length();
        if last_reported != Some(iteration) {
            sink.record(&self.record(iteration, &store, start.elapsed()));
        }
        sink.finished();
        self.time = Some(start.elapsed());
        outcome?;

        log::info!("Halting: Maximum number of iterations ({max_iterations}) reached.");
        store.into_array()
    }

    fn start_initial_phase(&mut self) -> bool {
        let enable = self.initial_phase_iterations > 0;
        let mut any = false;
        for adaptive in self.samplers.adaptive_mut() {
            if adaptive.needs_initial_phase() {
                adaptive.set_initial_phase(enable);
                any |= enable;
            }
        }
        any
    }

    /// Switches each chain off its initial phase once it is long enough. Returns whether
    /// any chain is still in it.
    fn end_initial_phase(&mut self, store: &ChainStore) -> bool {
        let switch = self.initial_phase_iterations;
        let mut remaining = false;
        match &mut self.samplers {
            Samplers::Single(samplers) => {
                for (i, sampler) in samplers.iter_mut().enumerate() {
                    if let Some(adaptive) = sampler.as_adaptive_mut() {
                        if adaptive.in_initial_phase() {
                            if store.emitted[i] >= switch {
                                adaptive.set_initial_phase(false);
                                log::debug!("Chain {i} left its initial phase");
                            } else {
                                remaining = true;
                            }
                        }
                    }
                }
            }
            Samplers::Multi(sampler) => {
                if let Some(adaptive) = sampler.as_adaptive_mut() {
                    if adaptive.in_initial_phase() {
                        if store.min_length() >= switch {
                            adaptive.set_initial_phase(false);
                        } else {
                            remaining = true;
                        }
                    }
                }
            }
        }
        if !remaining {
            log::info!("Initial phase completed.");
        }
        remaining
    }

    /// One round of ask, evaluate and tell over every chain that still needs samples.
    fn step(
        &mut self,
        evaluator: &dyn Evaluator,
        store: &mut ChainStore,
        max_iterations: usize,
        sensitivities: bool,
    ) -> Result<()> {
        let d = self.n_parameters;
        let prior = self.log_pdf.prior();
        match &mut self.samplers {
            Samplers::Single(samplers) => {
                let active: Vec<usize> = (0..samplers.len())
                    .filter(|&i| store.emitted[i] < max_iterations)
                    .collect();
                let points = active
                    .iter()
                    .map(|&i| samplers[i].ask())
                    .collect::<Result<Vec<_>>>()?;
                let results = evaluator.evaluate(&points);
                self.evaluations += points.len();

                for (&i, result) in active.iter().zip(results) {
                    let reply = to_reply(result, d, sensitivities);
                    if let Some(sample) = samplers[i].tell(reply)? {
                        let fx = samplers[i].current_log_pdf().unwrap_or(f64::NAN);
                        store.push(i, sample, fx, prior)?;
                    }
                }
            }
            Samplers::Multi(sampler) => {
                let points = sampler.ask()?;
                let replies: Vec<Evaluation> = evaluator
                    .evaluate(&points)
                    .into_iter()
                    .map(|r| to_reply(r, d, sensitivities))
                    .collect();
                self.evaluations += points.len();

                if let Some(samples) = sampler.tell(&replies)? {
                    let log_pdfs = sampler
                        .current_log_pdfs()
                        .unwrap_or_else(|| vec![f64::NAN; samples.len()]);
                    for (i, (sample, fx)) in samples.into_iter().zip(log_pdfs).enumerate() {
                        store.push(i, sample, fx, prior)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn record(&self, iteration: usize, store: &ChainStore, elapsed: Duration) -> ProgressRecord {
        ProgressRecord {
            iteration,
            evaluations: self.evaluations,
            acceptance: self.samplers.acceptance_rates(),
            max_rhat: store.max_rhat(),
            elapsed,
        }
    }
}

/// Failed evaluations become rejections, with a zero gradient when one is expected.
fn to_reply(result: EvaluationResult, n_parameters: usize, sensitivities: bool) -> Evaluation {
    result.unwrap_or_else(|e| {
        log::warn!("Log-pdf evaluation failed, treating the point as rejected: {e}");
        if sensitivities {
            Evaluation::with_gradient(f64::NEG_INFINITY, vec![0.0; n_parameters])
        } else {
            Evaluation::rejected()
        }
    })
}

/// Emitted samples: counts, retained rows, files and the running R-hat.
struct ChainStore {
    n_parameters: usize,
    warm_up: usize,
    thinning: usize,
    emitted: Vec<usize>,
    retained: Vec<Vec<f64>>,
    chain_writers: Vec<RowWriter>,
    eval_writers: Vec<RowWriter>,
    decomposed: bool,
    // Samples not yet fed to the R-hat tracker, because some other chain lags behind.
    unpaired: Vec<VecDeque<Vec<f64>>>,
    rhat: Option<RhatMulti>,
}

impl ChainStore {
    fn new(
        n_chains: usize,
        n_parameters: usize,
        warm_up: usize,
        thinning: usize,
        chain_filename: Option<&PathBuf>,
        log_pdf_filename: Option<&PathBuf>,
        decomposed: bool,
    ) -> Result<Self> {
        let chain_writers = match chain_filename {
            Some(path) => (0..n_chains)
                .map(|i| RowWriter::chain(chain_file_name(path, i), n_parameters))
                .collect::<Result<_>>()?,
            None => Vec::new(),
        };
        let eval_writers = match log_pdf_filename {
            Some(path) => (0..n_chains)
                .map(|i| RowWriter::evaluations(chain_file_name(path, i), decomposed))
                .collect::<Result<_>>()?,
            None => Vec::new(),
        };
        Ok(Self {
            n_parameters,
            warm_up,
            thinning,
            emitted: vec![0; n_chains],
            retained: vec![Vec::new(); n_chains],
            chain_writers,
            eval_writers,
            decomposed,
            unpaired: vec![VecDeque::new(); n_chains],
            rhat: (n_chains > 1).then(|| RhatMulti::new(n_chains, n_parameters)),
        })
    }

    fn min_length(&self) -> usize {
        self.emitted.iter().copied().min().unwrap_or(0)
    }

    fn max_rhat(&self) -> Option<f64> {
        self.rhat.as_ref().and_then(|r| r.max())
    }

    fn push(
        &mut self,
        chain: usize,
        sample: Vec<f64>,
        log_pdf: f64,
        prior: Option<&dyn LogPdf>,
    ) -> Result<()> {
        let index = self.emitted[chain];
        self.emitted[chain] += 1;

        if let Some(rhat) = self.rhat.as_mut() {
            self.unpaired[chain].push_back(sample.clone());
            if self.unpaired.iter().all(|q| !q.is_empty()) {
                let row: Vec<f64> = self
                    .unpaired
                    .iter_mut()
                    .filter_map(|q| q.pop_front())
                    .flatten()
                    .collect();
                rhat.step(&row)?;
            }
        }

        if index < self.warm_up || (index - self.warm_up) % self.thinning != 0 {
            return Ok(());
        }
        if let Some(wtr) = self.chain_writers.get_mut(chain) {
            wtr.write_row(&sample)?;
        }
        if let Some(wtr) = self.eval_writers.get_mut(chain) {
            if self.decomposed {
                let log_prior = prior.map_or(f64::NAN, |p| {
                    p.evaluate(&sample).unwrap_or_else(|e| {
                        log::warn!("Log-prior evaluation failed: {e}");
                        f64::NAN
                    })
                });
                wtr.write_row(&[log_pdf, log_pdf - log_prior, log_prior])?;
            } else {
                wtr.write_row(&[log_pdf])?;
            }
        }
        self.retained[chain].extend(sample);
        Ok(())
    }

    fn into_array(self) -> Result<Array3<f64>> {
        let n_chains = self.retained.len();
        let rows = self.retained.first().map_or(0, |c| c.len()) / self.n_parameters.max(1);
        let flat: Vec<f64> = self.retained.into_iter().flatten().collect();
        Array3::from_shape_vec((n_chains, rows, self.n_parameters), flat)
            .map_err(|e| McmcError::construction(format!("chains differ in length: {e}")))
    }
}
