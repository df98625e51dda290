//! Samples a correlated 2D Gaussian with the adaptive covariance sampler and prints
//! summary statistics and convergence diagnostics.

use asktell_mcmc::adaptive_covariance::AdaptiveCovarianceSettings;
use asktell_mcmc::controller::{McmcController, Parallelism, WarmUp};
use asktell_mcmc::distributions::Gaussian;
use asktell_mcmc::sampler::Method;
use asktell_mcmc::stats::{ess, rhat};
use nalgebra::DMatrix;
use ndarray::Axis;
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    const ITERATIONS: usize = 20_000;
    const N_CHAINS: usize = 4;
    const SEED: u64 = 42;

    let cov = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]);
    let target = Gaussian::new(vec![0.0, 0.0], cov)?;
    let x0 = vec![vec![10.0, 12.0], vec![-8.0, 3.0], vec![4.0, -9.0], vec![-2.0, -6.0]];
    let method = Method::AdaptiveCovariance(AdaptiveCovarianceSettings::new(0.234)?);

    let mut controller = McmcController::new(target, N_CHAINS, x0, None, method)?
        .set_max_iterations(Some(ITERATIONS))
        .set_warm_up(WarmUp::Fraction(0.5))
        .set_parallel(Parallelism::Auto)
        .set_log_to_screen(true)
        .set_seed(SEED);
    let samples = controller.run()?;

    let (n_chains, n, _) = samples.dim();
    println!("Generated {} samples", n_chains * n);
    println!("Evaluations: {}", controller.evaluations());

    let pooled = samples
        .to_shape((n_chains * n, 2))?
        .mean_axis(Axis(0))
        .ok_or("no samples")?;
    println!("Mean after warm-up: ({:.2}, {:.2})", pooled[0], pooled[1]);
    println!("R-hat: {}", rhat(&samples)?);
    println!("ESS:   {}", ess(&samples)?);
    Ok(())
}
