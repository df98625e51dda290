/*!
Covariance-adaptive slice sampling by covariance matching (Thompson & Neal, 2010).

Each sample starts from a slice `{x : f(x) ≥ y}` with `y = f(x0) − e` and
`e ~ Exp(1)`. The sampler then drops Gaussian "crumbs" around the current
point and draws proposals from the posterior of `x0` given those crumbs.

After a rejected proposal `x`, the gradient at `x` and one extra evaluation a
distance `δ = |x − c|` along it give a local estimate of the curvature `κ`.
Both precision factors are tightened in the gradient direction so the
proposal covariance approaches the covariance of the target restricted to the
slice.

`R` and `F` are kept as upper Cholesky factors of the proposal precision `Λ`
and the crumb precision `W`. Rank-one updates go through [`chud`].

The sampler needs gradients: replies to trial proposals must carry one.
*/

use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Exp1};

use crate::error::{McmcError, Result};
use crate::evaluator::Evaluation;
use crate::sampler::{lower_cholesky, standard_normal, Handshake, SingleChainSampler};

#[derive(Debug, Clone, PartialEq)]
pub struct SliceCovarianceMatchingSettings {
    /// Standard deviation of the first crumb.
    pub sigma_c: f64,
    /// Controls how fast the proposal precision grows after each rejection.
    pub theta: f64,
}

impl Default for SliceCovarianceMatchingSettings {
    fn default() -> Self {
        Self {
            sigma_c: 1.0,
            theta: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    Trial,
    Probe,
}

pub struct SliceCovarianceMatching {
    x0: DVector<f64>,
    sigma_c: f64,
    theta: f64,

    current: Option<DVector<f64>>,
    current_log_pdf: f64,
    log_y: f64,
    // Running upper bound on the log-pdf within the slice.
    m_max: f64,

    r: DMatrix<f64>,
    f: DMatrix<f64>,
    c_bar_star: DVector<f64>,

    crumb: DVector<f64>,
    proposed: DVector<f64>,
    proposed_log_pdf: f64,
    grad_norm: f64,
    direction: DVector<f64>,
    delta: f64,
    probe: DVector<f64>,

    phase: Phase,
    handshake: Handshake,
    rng: SmallRng,
}

/// Upper Cholesky factor of `AᵀA + vvᵀ`.
pub fn chud(a: &DMatrix<f64>, v: &DVector<f64>) -> Option<DMatrix<f64>> {
    let gram = a.transpose() * a + v * v.transpose();
    lower_cholesky(&gram).map(|l| l.transpose())
}

impl SliceCovarianceMatching {
    pub fn new(x0: Vec<f64>, settings: SliceCovarianceMatchingSettings) -> Result<Self> {
        let d = x0.len();
        if d == 0 {
            return Err(McmcError::construction("x0 must have at least one parameter"));
        }
        if !(settings.sigma_c.is_finite() && settings.sigma_c > 0.0) {
            return Err(McmcError::construction(format!(
                "initial crumb standard deviation must be positive, got {}",
                settings.sigma_c
            )));
        }
        if !(settings.theta.is_finite() && settings.theta > 0.0) {
            return Err(McmcError::construction(format!(
                "theta must be positive, got {}",
                settings.theta
            )));
        }
        let x0 = DVector::from_vec(x0);
        let initial = DMatrix::identity(d, d) / settings.sigma_c;
        Ok(Self {
            proposed: x0.clone(),
            crumb: x0.clone(),
            probe: x0.clone(),
            x0,
            sigma_c: settings.sigma_c,
            theta: settings.theta,
            current: None,
            current_log_pdf: f64::NAN,
            log_y: f64::NAN,
            m_max: f64::NAN,
            r: initial.clone(),
            f: initial,
            c_bar_star: DVector::zeros(d),
            proposed_log_pdf: f64::NAN,
            grad_norm: 0.0,
            direction: DVector::zeros(d),
            delta: 0.0,
            phase: Phase::Initial,
            handshake: Handshake::default(),
            rng: SmallRng::from_entropy(),
        })
    }

    pub fn current_slice_height(&self) -> Option<f64> {
        self.current.as_ref().map(|_| self.log_y)
    }

    /// Precision `Λ = RᵀR` of the proposal distribution.
    pub fn proposal_precision(&self) -> DMatrix<f64> {
        self.r.transpose() * &self.r
    }

    /// Precision `W = FᵀF` of the next crumb.
    pub fn crumb_precision(&self) -> DMatrix<f64> {
        self.f.transpose() * &self.f
    }

    pub fn sigma_c(&self) -> f64 {
        self.sigma_c
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    /// Starts a new slice at the current point.
    fn reset(&mut self) {
        let d = self.x0.len();
        self.r = DMatrix::identity(d, d) / self.sigma_c;
        self.f = self.r.clone();
        self.c_bar_star = DVector::zeros(d);
        self.m_max = self.current_log_pdf;
        let e: f64 = Exp1.sample(&mut self.rng);
        self.log_y = self.current_log_pdf - e;
        self.phase = Phase::Trial;
    }

    fn solve_upper(m: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>> {
        m.solve_upper_triangular(b)
            .ok_or_else(|| McmcError::construction("precision factor became singular"))
    }

    /// Drops a crumb and draws a proposal from the crumbs' posterior.
    fn draw_trial(&mut self, current: &DVector<f64>) -> Result<DVector<f64>> {
        let d = current.len();
        let z = standard_normal(&mut self.rng, d);
        self.crumb = current + Self::solve_upper(&self.f, &z)?;
        self.c_bar_star += self.f.transpose() * (&self.f * &self.crumb);

        let half = self
            .r
            .tr_solve_upper_triangular(&self.c_bar_star)
            .ok_or_else(|| McmcError::construction("precision factor became singular"))?;
        let c_bar = Self::solve_upper(&self.r, &half)?;

        let z = standard_normal(&mut self.rng, d);
        Ok(c_bar + Self::solve_upper(&self.r, &z)?)
    }

    /// Rank-one precision update along the last gradient direction.
    fn update_precisions(&mut self, alpha: f64) {
        let v = &self.direction * alpha.sqrt();
        let new_f = chud(&(&self.r * self.theta.sqrt()), &v);
        let new_r = chud(&(&self.r * (1.0 + self.theta).sqrt()), &v);
        match (new_f, new_r) {
            (Some(f), Some(r)) => {
                self.f = f;
                self.r = r;
            }
            _ => log::warn!("precision update failed; keeping previous factors"),
        }
    }

    fn alpha_from_probe(&mut self, probe_log_pdf: f64) -> f64 {
        let kappa = -2.0 / (self.delta * self.delta)
            * (probe_log_pdf - self.proposed_log_pdf - self.delta * self.grad_norm);
        if !(kappa.is_finite() && kappa > 0.0) {
            return 0.0;
        }
        let l_xu = 0.5 * self.grad_norm * self.grad_norm / kappa + self.proposed_log_pdf;
        self.m_max = self.m_max.max(l_xu);
        let sigma_sq = 2.0 / 3.0 * (self.m_max - self.log_y) / kappa;
        let rg = &self.r * &self.direction;
        let alpha = 1.0 / sigma_sq - (1.0 + self.theta) * rg.dot(&rg);
        if alpha.is_finite() {
            alpha.max(0.0)
        } else {
            0.0
        }
    }
}

impl SingleChainSampler for SliceCovarianceMatching {
    fn name(&self) -> &'static str {
        "Slice sampling with covariance matching"
    }

    fn n_parameters(&self) -> usize {
        self.x0.len()
    }

    fn ask(&mut self) -> Result<Vec<f64>> {
        self.handshake.begin_ask()?;
        let point = match (self.phase, self.current.clone()) {
            (Phase::Trial, Some(current)) => {
                self.proposed = self.draw_trial(&current)?;
                &self.proposed
            }
            (Phase::Probe, _) => &self.probe,
            _ => &self.x0,
        };
        Ok(point.iter().copied().collect())
    }

    fn tell(&mut self, reply: Evaluation) -> Result<Option<Vec<f64>>> {
        self.handshake.begin_tell()?;
        let fx = reply.log_pdf;

        match self.phase {
            Phase::Initial => {
                self.handshake.check_initial(fx)?;
                self.current = Some(self.x0.clone());
                self.current_log_pdf = fx;
                self.reset();
                Ok(Some(self.x0.iter().copied().collect()))
            }
            Phase::Trial => {
                let Some(gradient) = reply.gradient else {
                    return Err(McmcError::protocol(
                        "covariance matching needs a gradient with every trial evaluation",
                    ));
                };
                self.proposed_log_pdf = fx;
                if fx >= self.log_y {
                    self.current = Some(self.proposed.clone());
                    self.current_log_pdf = fx;
                    self.reset();
                    return Ok(Some(self.proposed.iter().copied().collect()));
                }

                let gradient = DVector::from_vec(gradient);
                let grad_norm = gradient.norm();
                if fx.is_finite() && grad_norm.is_finite() && grad_norm > 0.0 {
                    self.grad_norm = grad_norm;
                    self.direction = gradient / grad_norm;
                    self.delta = (&self.proposed - &self.crumb).norm();
                    self.probe = &self.proposed + &self.direction * self.delta;
                    self.phase = Phase::Probe;
                } else {
                    self.update_precisions(0.0);
                }
                Ok(None)
            }
            Phase::Probe => {
                let alpha = self.alpha_from_probe(fx);
                self.update_precisions(alpha);
                self.phase = Phase::Trial;
                Ok(None)
            }
        }
    }

    fn current_log_pdf(&self) -> Option<f64> {
        self.current.as_ref().map(|_| self.current_log_pdf)
    }

    fn needs_sensitivities(&self) -> bool {
        true
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
    use ndarray::{Array2, Axis};
    use ndarray_stats::CorrelationExt;

    fn sampler() -> SliceCovarianceMatching {
        let mut s =
            SliceCovarianceMatching::new(vec![0.0, 0.0], SliceCovarianceMatchingSettings::default())
                .unwrap();
        s.set_seed(3);
        s
    }

    #[test]
    fn chud_matches_cholesky_of_updated_gram_matrix() {
        let a = DMatrix::from_row_slice(3, 3, &[2.0, 0.5, -1.0, 0.0, 1.5, 0.3, 0.0, 0.0, 0.7]);
        let v = DVector::from_vec(vec![0.4, -1.2, 0.9]);
        let r = chud(&a, &v).unwrap();

        let expected = a.transpose() * &a + &v * v.transpose();
        let got = r.transpose() * &r;
        assert!((got - &expected).amax() < 1e-12);
        for i in 0..3 {
            assert!(r[(i, i)] > 0.0);
            for j in 0..i {
                assert_eq!(r[(i, j)], 0.0, "factor must be upper triangular");
            }
        }
        let reference = expected.cholesky().unwrap().l().transpose();
        assert!((r - reference).amax() < 1e-12);
    }

    #[test]
    fn chud_with_zero_vector_scales_factor() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.2, 0.0, 3.0]);
        let r = chud(&(&a * 2.0), &DVector::zeros(2)).unwrap();
        assert!((r - &a * 2.0).amax() < 1e-12);
    }

    #[test]
    fn precision_update_after_rejection() {
        let mut s = sampler();
        s.ask().unwrap();
        s.tell(Evaluation::with_gradient(0.0, vec![0.0, 0.0])).unwrap();
        let y = s.current_slice_height().unwrap();

        let x = s.ask().unwrap();
        let fx = y - 1.0;
        assert_eq!(s.tell(Evaluation::with_gradient(fx, vec![2.0, 0.0])).unwrap(), None);

        let u = s.ask().unwrap();
        assert_eq!(u[1], x[1], "probe moves along the gradient only");
        let delta = u[0] - x[0];
        assert!(delta > 0.0);

        let fu = fx - 0.5;
        assert_eq!(s.tell(Evaluation::with_gradient(fu, vec![0.0, 0.0])).unwrap(), None);

        let kappa = -2.0 / (delta * delta) * (fu - fx - 2.0 * delta);
        let l_xu = 0.5 * 4.0 / kappa + fx;
        let m = l_xu.max(0.0);
        let sigma_sq = 2.0 / 3.0 * (m - y) / kappa;
        let alpha = (1.0 / sigma_sq - 2.0).max(0.0);

        let mut expected_lambda = DMatrix::identity(2, 2) * 2.0;
        expected_lambda[(0, 0)] += alpha;
        let mut expected_w = DMatrix::identity(2, 2);
        expected_w[(0, 0)] += alpha;
        assert!((s.proposal_precision() - expected_lambda).amax() < 1e-9);
        assert!((s.crumb_precision() - expected_w).amax() < 1e-9);
    }

    #[test]
    fn zero_gradient_skips_probe() {
        let mut s = sampler();
        s.ask().unwrap();
        s.tell(Evaluation::with_gradient(0.0, vec![0.0, 0.0])).unwrap();
        let y = s.current_slice_height().unwrap();
        s.ask().unwrap();
        s.tell(Evaluation::with_gradient(y - 1.0, vec![0.0, 0.0])).unwrap();
        assert!((s.proposal_precision() - DMatrix::identity(2, 2) * 2.0).amax() < 1e-12);
        assert!((s.crumb_precision() - DMatrix::identity(2, 2)).amax() < 1e-12);
    }

    #[test]
    fn acceptance_resets_precisions() {
        let mut s = sampler();
        s.ask().unwrap();
        s.tell(Evaluation::with_gradient(0.0, vec![0.0, 0.0])).unwrap();
        let y = s.current_slice_height().unwrap();
        s.ask().unwrap();
        s.tell(Evaluation::with_gradient(y - 1.0, vec![0.0, 0.0])).unwrap();
        let x = s.ask().unwrap();
        let sample = s.tell(Evaluation::with_gradient(y + 0.1, vec![1.0, 1.0])).unwrap();
        assert_eq!(sample, Some(x));
        assert_eq!(s.current_log_pdf(), Some(y + 0.1));
        assert!((s.proposal_precision() - DMatrix::identity(2, 2)).amax() < 1e-12);
    }

    #[test]
    fn missing_gradient_is_a_protocol_error() {
        let mut s = sampler();
        s.ask().unwrap();
        s.tell(Evaluation::new(0.0)).unwrap();
        s.ask().unwrap();
        assert!(matches!(
            s.tell(Evaluation::new(-1.0)),
            Err(McmcError::Protocol(_))
        ));
    }

    #[test]
    fn invalid_settings() {
        let bad = SliceCovarianceMatchingSettings {
            sigma_c: -1.0,
            ..Default::default()
        };
        assert!(SliceCovarianceMatching::new(vec![0.0], bad).is_err());
        let bad = SliceCovarianceMatchingSettings {
            theta: 0.0,
            ..Default::default()
        };
        assert!(SliceCovarianceMatching::new(vec![0.0], bad).is_err());
    }

    #[test]
    fn recovers_correlated_gaussian() {
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, 0.6, 0.6, 2.0]);
        let target = Gaussian::new(vec![1.0, -2.0], cov).unwrap();
        let mut s = SliceCovarianceMatching::new(
            vec![1.0, -2.0],
            SliceCovarianceMatchingSettings::default(),
        )
        .unwrap();
        s.set_seed(11);

        let n_samples = 10_000;
        let mut chain = Vec::with_capacity(2 * n_samples);
        let mut drawn = 0;
        while drawn < n_samples {
            let x = s.ask().unwrap();
            let (fx, grad) = target.evaluate_s1(&x).unwrap();
            if let Some(sample) = s.tell(Evaluation::with_gradient(fx, grad)).unwrap() {
                chain.extend(sample);
                drawn += 1;
            }
        }
        let samples = Array2::from_shape_vec((n_samples, 2), chain).unwrap();
        let mean = samples.mean_axis(Axis(0)).unwrap();
        let cov = samples.t().cov(1.0).unwrap();
        assert_abs_diff_eq!(mean[0], 1.0, epsilon = 0.1);
        assert_abs_diff_eq!(mean[1], -2.0, epsilon = 0.15);
        assert_abs_diff_eq!(cov[[0, 0]], 1.0, epsilon = 0.15);
        assert_abs_diff_eq!(cov[[1, 1]], 2.0, epsilon = 0.3);
        assert_abs_diff_eq!(cov[[0, 1]], 0.6, epsilon = 0.15);
    }
}
