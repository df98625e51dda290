//! Runs DREAM on a 3D Gaussian posterior and streams the chains and their log-pdfs to CSV.
//! The retained samples are also exported as one long-format table for plotting.
//!
//! Run with `cargo run --release --example dream_to_csv -- <output dir>`.

use asktell_mcmc::controller::{McmcController, Parallelism, WarmUp};
use asktell_mcmc::distributions::{Gaussian, UniformPrior};
use asktell_mcmc::dream::DreamSettings;
use asktell_mcmc::io::csv::{load_samples, save_csv};
use asktell_mcmc::log_pdf::LogPosterior;
use asktell_mcmc::sampler::Method;
use std::error::Error;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn Error>> {
    const N_CHAINS: usize = 6;

    let dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    std::fs::create_dir_all(&dir)?;

    let prior = UniformPrior::new(vec![-10.0; 3], vec![10.0; 3])?;
    let likelihood = Gaussian::diagonal(vec![3.0, -2.0, 1.0], vec![1.0, 0.25, 4.0])?;
    let posterior = LogPosterior::new(prior, likelihood)?;

    let x0: Vec<Vec<f64>> = (0..N_CHAINS)
        .map(|i| {
            let s = i as f64 - 2.5;
            vec![s, -s * 0.5, 0.3 * s]
        })
        .collect();

    let chain_path = dir.join("dream_chain.csv");
    let mut controller = McmcController::new(
        posterior,
        N_CHAINS,
        x0,
        None,
        Method::Dream(DreamSettings::default()),
    )?
    .set_max_iterations(Some(5_000))
    .set_initial_phase_iterations(1_000)
    .set_warm_up(WarmUp::Iterations(1_000))
    .set_thinning(2)
    .set_parallel(Parallelism::Workers(3))
    .set_chain_filename(&chain_path)
    .set_log_pdf_filename(dir.join("dream_log_pdf.csv"))
    .set_log_to_screen(true)
    .set_seed(7);
    let samples = controller.run()?;

    let reloaded = load_samples(&chain_path, N_CHAINS)?;
    assert_eq!(reloaded, samples);
    save_csv(&samples, dir.join("dream_samples.csv"))?;
    println!(
        "Wrote {} chains of {} samples to {}",
        N_CHAINS,
        samples.len_of(ndarray::Axis(1)),
        dir.display()
    );
    Ok(())
}
