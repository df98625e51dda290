//! Convergence diagnostics: running and batch R-hat, and FFT-based effective sample size.

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::error::{McmcError, Result};

/// Potential scale reduction factor, updated one iteration at a time.
///
/// Keeps running per-chain means and mean squares, so memory stays constant in the number
/// of iterations. Values are `NaN` until every chain has at least two samples.
#[derive(Debug, Clone, PartialEq)]
pub struct RhatMulti {
    n: usize,
    mean: Array2<f64>,    // n_chains x n_params
    mean_sq: Array2<f64>, // n_chains x n_params
    n_chains: usize,
    n_params: usize,
}

impl RhatMulti {
    pub fn new(n_chains: usize, n_params: usize) -> Self {
        Self {
            n: 0,
            mean: Array2::zeros((n_chains, n_params)),
            mean_sq: Array2::zeros((n_chains, n_params)),
            n_chains,
            n_params,
        }
    }

    /// Adds one sample per chain. `x` holds the chains row-major, `n_chains * n_params`
    /// values in total.
    pub fn step(&mut self, x: &[f64]) -> Result<()> {
        let x = ArrayView2::from_shape((self.n_chains, self.n_params), x).map_err(|_| {
            McmcError::construction(format!(
                "expected {} values for R-hat, got {}",
                self.n_chains * self.n_params,
                x.len()
            ))
        })?;
        self.n += 1;
        let n = self.n as f64;
        self.mean = (&self.mean * (n - 1.0) + x) / n;
        self.mean_sq = (&self.mean_sq * (n - 1.0) + x.pow2()) / n;
        Ok(())
    }

    /// Number of samples per chain seen so far.
    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// R-hat for every parameter.
    pub fn all(&self) -> Array1<f64> {
        let n = self.n as f64;
        let sm2 = (&self.mean_sq - &self.mean.pow2()) * n / (n - 1.0);
        gelman_rubin(self.mean.view(), sm2.view(), n)
    }

    /// Largest R-hat over all parameters, or `None` while it is undefined.
    pub fn max(&self) -> Option<f64> {
        if self.n_chains < 2 || self.n < 2 {
            return None;
        }
        self.all().max().ok().copied().filter(|r| r.is_finite())
    }
}

fn gelman_rubin(means: ArrayView2<f64>, sm2: ArrayView2<f64>, n: f64) -> Array1<f64> {
    let n_chains = means.nrows() as f64;
    let grand_mean = means.sum_axis(Axis(0)) / n_chains;
    let between = (&means - &grand_mean.insert_axis(Axis(0)))
        .pow2()
        .sum_axis(Axis(0))
        * (n / (n_chains - 1.0));
    let within = sm2.sum_axis(Axis(0)) / n_chains;
    let var = &within * ((n - 1.0) / n) + between / n;
    (var / within).mapv(f64::sqrt)
}

/// R-hat of finished chains with shape `[chain][iteration][parameter]`.
pub fn rhat(samples: &Array3<f64>) -> Result<Array1<f64>> {
    let (m, n, _) = samples.dim();
    if m < 2 || n < 2 {
        return Err(McmcError::construction(
            "R-hat needs at least two chains of two samples",
        ));
    }
    let means = samples.mean_axis(Axis(1)).ok_or_else(|| {
        McmcError::construction("cannot average an empty chain")
    })?;
    let sm2 = samples.var_axis(Axis(1), 1.0);
    Ok(gelman_rubin(means.view(), sm2.view(), n as f64))
}

/// Autocovariance at every lag, computed with a zero-padded FFT.
fn autocovariance(x: ArrayView1<f64>) -> Vec<f64> {
    let n = x.len();
    let size = (2 * n).next_power_of_two();
    let mean = x.sum() / n as f64;

    let mut buffer: Vec<Complex<f64>> = x
        .iter()
        .map(|v| Complex::new(v - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(size)
        .collect();

    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(size).process(&mut buffer);
    buffer.iter_mut().for_each(|c| *c = Complex::new(c.norm_sqr(), 0.0));
    planner.plan_fft_inverse(size).process(&mut buffer);

    let scale = (n * size) as f64;
    buffer[..n].iter().map(|c| c.re / scale).collect()
}

/**
Effective sample size of each parameter, pooled over chains.

Chains have shape `[chain][iteration][parameter]`. Autocorrelations are combined across
chains and truncated with Geyer's initial monotone sequence, so the estimate stays
conservative for poorly mixing chains.

# Examples

```rust
use asktell_mcmc::stats::ess;
use ndarray::Array3;

let samples = Array3::from_shape_fn((2, 4, 1), |(c, i, _)| (c * 4 + i) as f64 % 3.0);
let n_eff = ess(&samples).unwrap();
assert_eq!(n_eff.len(), 1);
```
*/
pub fn ess(samples: &Array3<f64>) -> Result<Array1<f64>> {
    let (m, n, d) = samples.dim();
    if m < 1 || n < 4 {
        return Err(McmcError::construction(
            "ESS needs at least one chain of four samples",
        ));
    }
    let nf = n as f64;
    let mut out = Array1::zeros(d);

    for k in 0..d {
        let chains = samples.index_axis(Axis(2), k);
        let acov: Vec<Vec<f64>> = chains.outer_iter().map(autocovariance).collect();
        let means: Vec<f64> = chains.outer_iter().map(|c| c.sum() / nf).collect();

        let within = acov.iter().map(|a| a[0]).sum::<f64>() / m as f64 * nf / (nf - 1.0);
        let mut var_plus = within * (nf - 1.0) / nf;
        if m > 1 {
            let grand = means.iter().sum::<f64>() / m as f64;
            var_plus += means.iter().map(|mu| (mu - grand).powi(2)).sum::<f64>() / (m - 1) as f64;
        }
        if var_plus.is_nan() || var_plus <= 0.0 {
            out[k] = f64::NAN;
            continue;
        }

        let rho = |t: usize| {
            let mean_acov = acov.iter().map(|a| a[t]).sum::<f64>() / m as f64;
            1.0 - (within - mean_acov) / var_plus
        };

        let mut sum = 0.0;
        let mut previous = f64::INFINITY;
        let mut t = 0;
        while t + 1 < n {
            let pair = (rho(t) + rho(t + 1)).min(previous);
            if pair <= 0.0 {
                break;
            }
            sum += pair;
            previous = pair;
            t += 2;
        }
        let tau = (2.0 * sum - 1.0).max(1.0 / (m as f64 * nf).log10());
        out[k] = m as f64 * nf / tau;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, StandardNormal};

    const SEED: u64 = 42;

    fn reference_steps() -> (Array2<f64>, Array2<f64>) {
        let step_0 = arr2(&[
            [0.0, 1.0, 0.0, 1.0], // chain 0
            [1.0, 2.0, 0.0, 2.0], // chain 1
            [0.0, 0.0, 0.0, 2.0], // chain 2
        ]);
        let step_1 = arr2(&[
            [1.0, 2.0, 2.0, 0.0], // chain 0
            [1.0, 1.0, 1.0, 1.0], // chain 1
            [0.0, 1.0, 0.0, 0.0], // chain 2
        ]);
        (step_0, step_1)
    }

    #[test]
    fn running_rhat_matches_reference() {
        let (step_0, step_1) = reference_steps();
        let mut psr = RhatMulti::new(3, 4);
        assert_eq!(psr.max(), None);
        psr.step(step_0.as_slice().unwrap()).unwrap();
        psr.step(step_1.as_slice().unwrap()).unwrap();
        let expected = array![std::f64::consts::SQRT_2, 1.08012345, 0.89442719, 0.8660254];
        let diff = *(psr.all() - &expected).mapv(f64::abs).max().unwrap();
        assert!(diff < 1e-7, "Mismatch in Rhat. Got {:?}, expected {:?}", psr.all(), expected);
        assert!((psr.max().unwrap() - std::f64::consts::SQRT_2).abs() < 1e-12);
    }

    #[test]
    fn batch_rhat_agrees_with_running_rhat() {
        let (step_0, step_1) = reference_steps();
        let samples = ndarray::stack(Axis(1), &[step_0.view(), step_1.view()]).unwrap();
        assert_eq!(samples.dim(), (3, 2, 4));

        let mut psr = RhatMulti::new(3, 4);
        psr.step(step_0.as_slice().unwrap()).unwrap();
        psr.step(step_1.as_slice().unwrap()).unwrap();

        let batch = rhat(&samples).unwrap();
        for (a, b) in batch.iter().zip(psr.all().iter()) {
            assert!((a - b).abs() < 1e-12, "batch {a} vs running {b}");
        }
    }

    #[test]
    fn rhat_rejects_wrong_shapes() {
        let mut psr = RhatMulti::new(2, 3);
        assert!(psr.step(&[1.0, 2.0]).is_err());
        assert!(psr.is_empty());
        assert!(rhat(&Array3::zeros((1, 10, 2))).is_err());
    }

    #[test]
    fn autocovariance_matches_direct_sum() {
        let x = array![1.0, 3.0, -2.0, 0.5, 4.0, 1.5];
        let acov = autocovariance(x.view());
        let mean = x.sum() / 6.0;
        for t in 0..6 {
            let direct: f64 = (0..6 - t)
                .map(|i| (x[i] - mean) * (x[i + t] - mean))
                .sum::<f64>()
                / 6.0;
            assert!((acov[t] - direct).abs() < 1e-10, "lag {t}: {} vs {}", acov[t], direct);
        }
    }

    #[test]
    fn ess_of_independent_draws_is_close_to_sample_count() {
        let mut rng = SmallRng::seed_from_u64(SEED);
        let samples =
            Array3::<f64>::from_shape_simple_fn((4, 5_000, 2), || StandardNormal.sample(&mut rng));
        let n_eff = ess(&samples).unwrap();
        for v in n_eff.iter() {
            assert!((*v / 20_000.0 - 1.0).abs() < 0.2, "ESS of iid draws was {v}");
        }
    }

    #[test]
    fn ess_of_autoregressive_chain_matches_theory() {
        // AR(1) with coefficient phi has integrated autocorrelation time (1+phi)/(1-phi).
        let phi: f64 = 0.9;
        let mut rng = SmallRng::seed_from_u64(SEED);
        let mut samples = Array3::zeros((4, 20_000, 1));
        for c in 0..4 {
            let mut x = 0.0;
            for i in 0..20_000 {
                let e: f64 = StandardNormal.sample(&mut rng);
                x = phi * x + (1.0 - phi * phi).sqrt() * e;
                samples[[c, i, 0]] = x;
            }
        }
        let expected = 80_000.0 * (1.0 - phi) / (1.0 + phi);
        let n_eff = ess(&samples).unwrap()[0];
        assert!(
            (n_eff / expected - 1.0).abs() < 0.3,
            "ESS {n_eff}, expected about {expected}"
        );
    }
}
