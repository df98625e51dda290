/*!
Progress reporting for [`McmcController`](crate::controller::McmcController).

The controller emits a [`ProgressRecord`] at the first three iterations, every
`log_interval` iterations after that, and once more when the run halts. Records go to a
[`ProgressSink`]. Two sinks ship with the crate:

- [`LogProgress`] writes every record through the `log` facade at `info` level.
- [`BarProgress`] draws an `indicatif` progress bar showing the mean acceptance rate and
  the current maximum R-hat.
*/

use std::fmt;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// A snapshot of a running controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    /// Completed iterations, i.e. the minimum chain length so far.
    pub iteration: usize,
    /// Total number of log-pdf evaluations so far.
    pub evaluations: usize,
    /// Per-chain acceptance rate, for samplers that track one.
    pub acceptance: Vec<Option<f64>>,
    /// Largest R-hat over all parameters. Needs at least two chains.
    pub max_rhat: Option<f64>,
    pub elapsed: Duration,
}

impl ProgressRecord {
    /// Mean over the chains that report an acceptance rate.
    pub fn mean_acceptance(&self) -> Option<f64> {
        let rates: Vec<f64> = self.acceptance.iter().flatten().copied().collect();
        (!rates.is_empty()).then(|| rates.iter().sum::<f64>() / rates.len() as f64)
    }
}

impl fmt::Display for ProgressRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iter {:>7} | evals {:>8}", self.iteration, self.evaluations)?;
        if let Some(rate) = self.mean_acceptance() {
            write!(f, " | p(accept)≈{rate:.2}")?;
        }
        if let Some(rhat) = self.max_rhat {
            write!(f, " | max(rhat)≈{rhat:.2}")?;
        }
        write!(f, " | {:.1}s", self.elapsed.as_secs_f64())
    }
}

/// Receives progress updates from a running controller.
pub trait ProgressSink: Send {
    /// Called once before the first iteration. `total` is the iteration limit.
    fn started(&mut self, _sampler: &str, _total: Option<usize>) {}

    fn record(&mut self, record: &ProgressRecord);

    /// Called once after the final record.
    fn finished(&mut self) {}
}

/// Forwards progress records to `log::info!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn started(&mut self, sampler: &str, total: Option<usize>) {
        match total {
            Some(n) => log::info!("Running {sampler} for up to {n} iterations"),
            None => log::info!("Running {sampler}"),
        }
    }

    fn record(&mut self, record: &ProgressRecord) {
        log::info!("{record}");
    }
}

/// An `indicatif` progress bar.
#[derive(Default)]
pub struct BarProgress {
    pb: Option<ProgressBar>,
}

impl BarProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for BarProgress {
    fn started(&mut self, sampler: &str, total: Option<usize>) {
        let pb = match total {
            Some(n) => ProgressBar::new(n as u64),
            None => ProgressBar::new_spinner(),
        };
        let style = ProgressStyle::default_bar()
            .template("{prefix:8} {bar:40.white} ETA {eta:3} | {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        pb.set_style(style);
        pb.set_prefix(sampler.to_string());
        self.pb = Some(pb);
    }

    fn record(&mut self, record: &ProgressRecord) {
        let Some(pb) = &self.pb else { return };
        pb.set_position(record.iteration as u64);
        let accept = record
            .mean_acceptance()
            .map_or_else(|| "-".to_string(), |r| format!("{r:.2}"));
        let rhat = record
            .max_rhat
            .map_or_else(|| "-".to_string(), |r| format!("{r:.2}"));
        pb.set_message(format!("p(accept)≈{accept} max(rhat)≈{rhat}"));
    }

    fn finished(&mut self) {
        if let Some(pb) = self.pb.take() {
            pb.finish_with_message("Done!");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(acceptance: Vec<Option<f64>>, max_rhat: Option<f64>) -> ProgressRecord {
        ProgressRecord {
            iteration: 150,
            evaluations: 600,
            acceptance,
            max_rhat,
            elapsed: Duration::from_millis(2500),
        }
    }

    #[test]
    fn mean_acceptance_ignores_missing_rates() {
        let r = record(vec![Some(0.2), None, Some(0.4)], None);
        assert!((r.mean_acceptance().unwrap() - 0.3).abs() < 1e-12);
        assert_eq!(record(vec![None, None], None).mean_acceptance(), None);
    }

    #[test]
    fn display_includes_optional_columns() {
        let r = record(vec![Some(0.25)], Some(1.034));
        assert_eq!(
            r.to_string(),
            "iter     150 | evals      600 | p(accept)≈0.25 | max(rhat)≈1.03 | 2.5s"
        );
        let r = record(vec![None], None);
        assert_eq!(r.to_string(), "iter     150 | evals      600 | 2.5s");
    }

    #[test]
    fn bar_ignores_records_before_start() {
        let mut bar = BarProgress::new();
        bar.record(&record(vec![Some(0.5)], None));
        bar.started("DREAM", Some(1000));
        bar.record(&record(vec![Some(0.5)], Some(1.2)));
        bar.finished();
        bar.finished();
    }
}
