//! Slice sampling with doubling on an axis-aligned 2D Gaussian.
//!
//! Run with `cargo run --release --example gaussian_slice`.

use asktell_mcmc::controller::McmcController;
use asktell_mcmc::distributions::Gaussian;
use asktell_mcmc::sampler::Method;
use asktell_mcmc::slice_doubling::SliceDoublingSettings;
use ndarray::Axis;
use ndarray_stats::CorrelationExt;
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    let target = Gaussian::diagonal(vec![2.0, 4.0], vec![1.0, 3.0])?;
    let method = Method::SliceDoubling(SliceDoublingSettings::default());

    let mut controller = McmcController::new(target, 1, vec![vec![2.0, 4.0]], None, method)?
        .set_max_iterations(Some(20_000))
        .set_log_to_screen(true)
        .set_seed(42);
    let samples = controller.run()?;

    let chain = samples.index_axis(Axis(0), 0);
    let mean = chain.mean_axis(Axis(0)).ok_or("empty chain")?;
    let cov = chain.t().cov(1.0)?;
    println!(
        "{} samples from {} evaluations",
        chain.nrows(),
        controller.evaluations()
    );
    println!("Mean: {mean}");
    println!("Covariance:\n{cov}");
    Ok(())
}
