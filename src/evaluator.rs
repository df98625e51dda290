/*!
Batch evaluation of a [`LogPdf`] at the proposals gathered in one iteration.

Both evaluators return one `Result` per input point, in input order. A point
whose evaluation fails yields an `Err` in its own slot and the rest of the
batch is unaffected.

# Examples

```rust
use std::sync::Arc;
use asktell_mcmc::distributions::Gaussian;
use asktell_mcmc::evaluator::{Evaluator, ParallelEvaluator};

let target = Arc::new(Gaussian::isotropic(vec![0.0, 0.0], 1.0).unwrap());
let evaluator = ParallelEvaluator::new(target, 2, false).unwrap();
let points = vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![0.0]];
let results = evaluator.evaluate(&points);
assert!(results[0].is_ok() && results[1].is_ok());
assert!(results[2].is_err());
```
*/

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;

use crate::error::{McmcError, Result};
use crate::log_pdf::{EvaluationError, LogPdf};

/// The result of evaluating the target at one point.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub log_pdf: f64,
    /// Present when the evaluator was asked for sensitivities.
    pub gradient: Option<Vec<f64>>,
}

impl Evaluation {
    pub fn new(log_pdf: f64) -> Self {
        Self {
            log_pdf,
            gradient: None,
        }
    }

    pub fn with_gradient(log_pdf: f64, gradient: Vec<f64>) -> Self {
        Self {
            log_pdf,
            gradient: Some(gradient),
        }
    }

    /// What a failed evaluation is turned into once it reaches a sampler.
    pub fn rejected() -> Self {
        Self::new(f64::NEG_INFINITY)
    }
}

impl From<f64> for Evaluation {
    fn from(log_pdf: f64) -> Self {
        Evaluation::new(log_pdf)
    }
}

pub type EvaluationResult = std::result::Result<Evaluation, EvaluationError>;

/// Evaluates a batch of points, preserving order.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, points: &[Vec<f64>]) -> Vec<EvaluationResult>;

    /// Number of points that may be evaluated at once.
    fn n_workers(&self) -> usize {
        1
    }
}

fn evaluate_point<F: LogPdf + ?Sized>(
    log_pdf: &F,
    x: &[f64],
    sensitivities: bool,
) -> EvaluationResult {
    if sensitivities {
        let (f, grad) = log_pdf.evaluate_s1(x)?;
        Ok(Evaluation::with_gradient(f, grad))
    } else {
        Ok(Evaluation::new(log_pdf.evaluate(x)?))
    }
}

/// Evaluates points one after another on the calling thread.
pub struct SequentialEvaluator<F: ?Sized> {
    log_pdf: Arc<F>,
    sensitivities: bool,
}

impl<F: LogPdf + ?Sized> SequentialEvaluator<F> {
    pub fn new(log_pdf: Arc<F>, sensitivities: bool) -> Self {
        Self {
            log_pdf,
            sensitivities,
        }
    }
}

impl<F: LogPdf + ?Sized> Evaluator for SequentialEvaluator<F> {
    fn evaluate(&self, points: &[Vec<f64>]) -> Vec<EvaluationResult> {
        points
            .iter()
            .map(|x| evaluate_point(&*self.log_pdf, x, self.sensitivities))
            .collect()
    }
}

/// Evaluates points concurrently on a dedicated, fixed-size rayon pool.
pub struct ParallelEvaluator<F: ?Sized> {
    log_pdf: Arc<F>,
    sensitivities: bool,
    pool: ThreadPool,
}

impl<F: LogPdf + ?Sized> ParallelEvaluator<F> {
    pub fn new(log_pdf: Arc<F>, n_workers: usize, sensitivities: bool) -> Result<Self> {
        if n_workers == 0 {
            return Err(McmcError::construction(
                "number of workers must be at least 1",
            ));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(n_workers)
            .thread_name(|i| format!("logpdf-worker-{i}"))
            .build()
            .map_err(|e| McmcError::construction(format!("could not start worker pool: {e}")))?;
        Ok(Self {
            log_pdf,
            sensitivities,
            pool,
        })
    }

    /// A sensible worker count for this machine.
    pub fn cpu_count() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl<F: LogPdf + ?Sized> Evaluator for ParallelEvaluator<F> {
    fn evaluate(&self, points: &[Vec<f64>]) -> Vec<EvaluationResult> {
        let log_pdf = &*self.log_pdf;
        let sensitivities = self.sensitivities;
        self.pool.install(|| {
            points
                .par_iter()
                .map(|x| evaluate_point(log_pdf, x, sensitivities))
                .collect()
        })
    }

    fn n_workers(&self) -> usize {
        self.pool.current_num_threads()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_pdf::LogPdfFn;

    fn failing_target() -> Arc<impl LogPdf> {
        Arc::new(LogPdfFn::new(1, |x: &[f64]| {
            if x[0] < 0.0 {
                f64::NAN
            } else {
                -x[0]
            }
        }))
    }

    #[test]
    fn parallel_preserves_input_order() {
        let target = Arc::new(LogPdfFn::new(1, |x: &[f64]| {
            // Make early points slower so completion order differs from input order.
            std::thread::sleep(std::time::Duration::from_millis((20.0 - x[0]) as u64));
            x[0]
        }));
        let evaluator = ParallelEvaluator::new(target, 4, false).unwrap();
        let points: Vec<Vec<f64>> = (0..16).map(|i| vec![i as f64]).collect();
        let results = evaluator.evaluate(&points);
        assert_eq!(results.len(), points.len());
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.as_ref().unwrap().log_pdf, i as f64, "slot {i} out of order");
        }
    }

    #[test]
    fn failures_stay_in_their_slot() {
        let evaluator = SequentialEvaluator::new(failing_target(), false);
        let points = vec![vec![1.0], vec![1.0, 2.0], vec![3.0]];
        let results = evaluator.evaluate(&points);
        assert_eq!(results[0], Ok(Evaluation::new(-1.0)));
        assert!(matches!(
            results[1],
            Err(EvaluationError::DimensionMismatch { expected: 1, got: 2 })
        ));
        assert_eq!(results[2], Ok(Evaluation::new(-3.0)));
    }

    #[test]
    fn sequential_and_parallel_agree() {
        let target = failing_target();
        let seq = SequentialEvaluator::new(target.clone(), false);
        let par = ParallelEvaluator::new(target, 3, false).unwrap();
        let points: Vec<Vec<f64>> = (0..10).map(|i| vec![i as f64 * 0.5]).collect();
        assert_eq!(seq.evaluate(&points), par.evaluate(&points));
        assert_eq!(par.n_workers(), 3);
    }

    #[test]
    fn missing_sensitivities_are_reported() {
        let evaluator = SequentialEvaluator::new(failing_target(), true);
        let results = evaluator.evaluate(&[vec![1.0]]);
        assert_eq!(results[0], Err(EvaluationError::SensitivitiesUnavailable));
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(ParallelEvaluator::new(failing_target(), 0, false).is_err());
    }
}
