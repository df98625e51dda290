//! The adaptive covariance sampler tunes itself to the requested acceptance rate and
//! recovers the moments of a correlated Gaussian.

use std::sync::{Arc, Mutex};

use asktell_mcmc::adaptive_covariance::AdaptiveCovarianceSettings;
use asktell_mcmc::controller::{McmcController, WarmUp};
use asktell_mcmc::distributions::Gaussian;
use asktell_mcmc::progress::{ProgressRecord, ProgressSink};
use asktell_mcmc::sampler::Method;
use nalgebra::DMatrix;
use ndarray::Axis;
use ndarray_stats::CorrelationExt;

const SEED: u64 = 42;

struct LastRecord(Arc<Mutex<Option<ProgressRecord>>>);

impl ProgressSink for LastRecord {
    fn record(&mut self, record: &ProgressRecord) {
        *self.0.lock().unwrap() = Some(record.clone());
    }
}

#[test]
fn acceptance_rate_approaches_target() {
    let target = Gaussian::isotropic(vec![0.0, 0.0], 1.0).unwrap();
    let method = Method::AdaptiveCovariance(AdaptiveCovarianceSettings::new(0.234).unwrap());
    let last = Arc::new(Mutex::new(None));

    let mut controller = McmcController::new(target, 1, vec![vec![0.5, -0.5]], None, method)
        .unwrap()
        .set_max_iterations(Some(20_000))
        .set_progress_sink(Box::new(LastRecord(Arc::clone(&last))))
        .set_seed(SEED);
    controller.run().unwrap();

    let record = last.lock().unwrap().clone().expect("Expected a final progress record");
    assert_eq!(record.iteration, 20_000);
    let rate = record.acceptance[0].expect("Expected an acceptance rate");
    assert!(
        (rate - 0.234).abs() < 0.05,
        "Acceptance rate {rate} is not close to 0.234"
    );
}

#[test]
fn recovers_correlated_gaussian() {
    let cov = DMatrix::from_row_slice(2, 2, &[4.0, 2.0, 2.0, 3.0]);
    let target = Gaussian::new(vec![1.0, -1.0], cov).unwrap();
    let method = Method::AdaptiveCovariance(AdaptiveCovarianceSettings::new(0.234).unwrap());
    let x0 = vec![vec![3.0, 2.0], vec![-2.0, 0.0], vec![0.0, -3.0], vec![2.0, -2.0]];

    let mut controller = McmcController::new(target, 4, x0, None, method)
        .unwrap()
        .set_max_iterations(Some(30_000))
        .set_warm_up(WarmUp::Iterations(10_000))
        .set_seed(SEED);
    let samples = controller.run().unwrap();
    assert_eq!(samples.shape(), &[4, 20_000, 2]);

    let flat = samples.to_shape((80_000, 2)).unwrap().to_owned();
    let mean = flat.mean_axis(Axis(0)).unwrap();
    let emp = flat.t().cov(1.0).unwrap();

    assert!((mean[0] - 1.0).abs() < 0.15, "Mean[0] was {}", mean[0]);
    assert!((mean[1] + 1.0).abs() < 0.15, "Mean[1] was {}", mean[1]);
    for (i, j, expected) in [(0, 0, 4.0), (1, 1, 3.0), (0, 1, 2.0)] {
        assert!(
            (emp[[i, j]] / expected - 1.0).abs() < 0.2,
            "Cov[{i}, {j}] was {}, expected {expected}",
            emp[[i, j]]
        );
    }
}
