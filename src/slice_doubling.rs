/*!
# Slice sampling with doubling

Univariate slice sampling (Neal, 2003) applied to one coordinate at a time in
a round-robin sweep. A sample is emitted only after every coordinate has been
updated once.

For the active coordinate `i`:

1. An interval of width `w_i` is placed at random around `x_i`.
2. The interval is doubled, one randomly chosen side at a time, until both
   edges lie outside the slice `{x : f(x) > log_y}` or `p` doublings have
   been spent. The interval can therefore grow to at most `2^p·w_i`.
3. Points are drawn uniformly from the interval, shrinking it toward `x_i`
   after every point that falls outside the slice.
4. A point inside the slice must also pass the doubling acceptance check.
   The check replays the halving that could have produced the final interval
   from the new point, and rejects it if `x_i` would not have been reachable.

Every log-pdf value the procedure needs is requested through `ask`/`tell`, so
the sampler is an explicit state machine. [`SlicePhase`] records which
evaluation the next `tell` answers.

The slice height `log_y = f(x) - e`, with `e ~ Exp(1)`, is drawn when the
initial point is told and again each time a sample is emitted.
*/

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::Exp1;

use crate::error::{McmcError, Result};
use crate::evaluator::Evaluation;
use crate::sampler::{Handshake, SingleChainSampler};

/// Which end of an interval a pending evaluation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Left,
    Right,
}

/// What the next `tell` is expected to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlicePhase {
    /// The log-pdf of the initial point.
    HeightInit,
    /// The log-pdf at an edge of the freshly placed interval.
    IntervalInit(Edge),
    /// The log-pdf at an edge that was just doubled outward.
    Expanding(Edge),
    /// The log-pdf of a point drawn from the shrinking interval.
    ThresholdCheck,
    /// The log-pdf at the new edge of a halved acceptance-check interval.
    AcceptanceCheck(Edge),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SliceDoublingSettings {
    /// Initial interval width per parameter. Defaults to 1 for every parameter.
    pub width: Option<Vec<f64>>,
    /// Maximum number of doublings `p` per coordinate update.
    pub expansion_steps: u32,
}

impl Default for SliceDoublingSettings {
    fn default() -> Self {
        Self {
            width: None,
            expansion_steps: 10,
        }
    }
}

impl SliceDoublingSettings {
    pub fn with_width(mut self, width: Vec<f64>) -> Self {
        self.width = Some(width);
        self
    }

    pub fn with_expansion_steps(mut self, expansion_steps: u32) -> Self {
        self.expansion_steps = expansion_steps;
        self
    }
}

/// An interval on the active coordinate together with the log-pdf at its edges.
#[derive(Debug, Clone, Copy, Default)]
struct Interval {
    left: f64,
    right: f64,
    f_left: f64,
    f_right: f64,
}

impl Interval {
    fn width(&self) -> f64 {
        self.right - self.left
    }

    fn set_edge_log_pdf(&mut self, edge: Edge, fx: f64) {
        match edge {
            Edge::Left => self.f_left = fx,
            Edge::Right => self.f_right = fx,
        }
    }
}

pub struct SliceDoubling {
    x0: Vec<f64>,
    width: Vec<f64>,
    expansion_steps: u32,

    current: Option<Vec<f64>>,
    current_log_pdf: f64,
    log_y: f64,
    active: usize,
    phase: SlicePhase,
    pending: Vec<f64>,

    // Doubled interval, kept intact for the acceptance check.
    outer: Interval,
    budget: u32,
    // Shrinking interval the proposals are drawn from.
    shrink_left: f64,
    shrink_right: f64,
    proposed: f64,
    proposed_log_pdf: f64,
    // Working interval of the acceptance check.
    check: Interval,
    differs: bool,

    handshake: Handshake,
    rng: SmallRng,
}

impl SliceDoubling {
    pub fn new(x0: Vec<f64>, settings: SliceDoublingSettings) -> Result<Self> {
        let d = x0.len();
        if d == 0 {
            return Err(McmcError::construction("x0 must have at least one parameter"));
        }
        let width = settings.width.unwrap_or_else(|| vec![1.0; d]);
        if width.len() != d {
            return Err(McmcError::construction(format!(
                "expected {d} interval widths, got {}",
                width.len()
            )));
        }
        if !width.iter().all(|w| w.is_finite() && *w > 0.0) {
            return Err(McmcError::construction("interval widths must be positive"));
        }
        if settings.expansion_steps < 1 {
            return Err(McmcError::construction(
                "number of expansion steps must be at least 1",
            ));
        }
        Ok(Self {
            pending: x0.clone(),
            x0,
            width,
            expansion_steps: settings.expansion_steps,
            current: None,
            current_log_pdf: f64::NAN,
            log_y: f64::NAN,
            active: 0,
            phase: SlicePhase::HeightInit,
            outer: Interval::default(),
            budget: 0,
            shrink_left: 0.0,
            shrink_right: 0.0,
            proposed: 0.0,
            proposed_log_pdf: f64::NAN,
            check: Interval::default(),
            differs: false,
            handshake: Handshake::default(),
            rng: SmallRng::from_entropy(),
        })
    }

    /// The slice height used by the sweep in progress.
    pub fn current_slice_height(&self) -> Option<f64> {
        self.current.as_ref().map(|_| self.log_y)
    }

    pub fn phase(&self) -> SlicePhase {
        self.phase
    }

    /// Index of the coordinate currently being updated.
    pub fn active_dimension(&self) -> usize {
        self.active
    }

    pub fn width(&self) -> &[f64] {
        &self.width
    }

    pub fn expansion_steps(&self) -> u32 {
        self.expansion_steps
    }

    fn draw_height(&mut self) {
        let e: f64 = self.rng.sample(Exp1);
        self.log_y = self.current_log_pdf - e;
    }

    fn request(&mut self, value: f64) {
        if let Some(current) = &self.current {
            self.pending.clone_from(current);
        }
        self.pending[self.active] = value;
    }

    fn x_active(&self) -> f64 {
        self.current.as_ref().map_or(0.0, |c| c[self.active])
    }

    /// Places a fresh interval of width `w` randomly around the active coordinate.
    fn start_interval(&mut self) {
        let w = self.width[self.active];
        let u: f64 = self.rng.gen();
        let left = self.x_active() - w * u;
        self.outer = Interval {
            left,
            right: left + w,
            f_left: f64::NAN,
            f_right: f64::NAN,
        };
        self.budget = self.expansion_steps;
        self.phase = SlicePhase::IntervalInit(Edge::Left);
        self.request(left);
    }

    /// Doubles once more if an edge is still inside the slice, otherwise
    /// starts drawing from the final interval.
    fn expand_or_propose(&mut self) {
        let inside = self.log_y < self.outer.f_left || self.log_y < self.outer.f_right;
        if self.budget > 0 && inside {
            self.budget -= 1;
            let width = self.outer.width();
            let v: f64 = self.rng.gen();
            if v < 0.5 {
                self.outer.left -= width;
                self.phase = SlicePhase::Expanding(Edge::Left);
                self.request(self.outer.left);
            } else {
                self.outer.right += width;
                self.phase = SlicePhase::Expanding(Edge::Right);
                self.request(self.outer.right);
            }
        } else {
            self.shrink_left = self.outer.left;
            self.shrink_right = self.outer.right;
            self.propose();
        }
    }

    fn propose(&mut self) {
        let u: f64 = self.rng.gen();
        self.proposed = self.shrink_left + u * (self.shrink_right - self.shrink_left);
        self.phase = SlicePhase::ThresholdCheck;
        self.request(self.proposed);
    }

    fn shrink_and_propose(&mut self) {
        if self.proposed < self.x_active() {
            self.shrink_left = self.proposed;
        } else {
            self.shrink_right = self.proposed;
        }
        self.propose();
    }

    /// Halves the check interval toward the proposal, or accepts once it is
    /// no wider than `1.1·w`.
    fn continue_check(&mut self) -> Option<Vec<f64>> {
        if self.check.width() > 1.1 * self.width[self.active] {
            let mid = 0.5 * (self.check.left + self.check.right);
            let x = self.x_active();
            if (x < mid) != (self.proposed < mid) {
                self.differs = true;
            }
            if self.proposed < mid {
                self.check.right = mid;
                self.phase = SlicePhase::AcceptanceCheck(Edge::Right);
            } else {
                self.check.left = mid;
                self.phase = SlicePhase::AcceptanceCheck(Edge::Left);
            }
            self.request(mid);
            None
        } else {
            self.accept()
        }
    }

    /// Moves the active coordinate to the proposal. Emits a sample once the
    /// sweep over all coordinates is complete.
    fn accept(&mut self) -> Option<Vec<f64>> {
        let i = self.active;
        let d = self.x0.len();
        let current = self.current.as_mut()?;
        current[i] = self.proposed;
        self.current_log_pdf = self.proposed_log_pdf;

        self.active = (i + 1) % d;
        let emitted = if self.active == 0 {
            let sample = current.clone();
            self.draw_height();
            Some(sample)
        } else {
            None
        };
        self.start_interval();
        emitted
    }
}

impl SingleChainSampler for SliceDoubling {
    fn name(&self) -> &'static str {
        "Slice sampling with doubling"
    }

    fn n_parameters(&self) -> usize {
        self.x0.len()
    }

    fn ask(&mut self) -> Result<Vec<f64>> {
        self.handshake.begin_ask()?;
        Ok(self.pending.clone())
    }

    fn tell(&mut self, reply: Evaluation) -> Result<Option<Vec<f64>>> {
        self.handshake.begin_tell()?;

        if self.phase == SlicePhase::HeightInit {
            self.handshake.check_initial(reply.log_pdf)?;
            self.current = Some(self.x0.clone());
            self.current_log_pdf = reply.log_pdf;
            self.draw_height();
            self.start_interval();
            return Ok(Some(self.x0.clone()));
        }

        // A NaN is outside every slice.
        let fx = if reply.log_pdf.is_nan() {
            f64::NEG_INFINITY
        } else {
            reply.log_pdf
        };

        let sample = match self.phase {
            SlicePhase::HeightInit => None,
            SlicePhase::IntervalInit(Edge::Left) => {
                self.outer.f_left = fx;
                self.phase = SlicePhase::IntervalInit(Edge::Right);
                self.request(self.outer.right);
                None
            }
            SlicePhase::IntervalInit(Edge::Right) => {
                self.outer.f_right = fx;
                self.expand_or_propose();
                None
            }
            SlicePhase::Expanding(edge) => {
                self.outer.set_edge_log_pdf(edge, fx);
                self.expand_or_propose();
                None
            }
            SlicePhase::ThresholdCheck => {
                self.proposed_log_pdf = fx;
                if fx >= self.log_y {
                    self.check = self.outer;
                    self.differs = false;
                    self.continue_check()
                } else {
                    self.shrink_and_propose();
                    None
                }
            }
            SlicePhase::AcceptanceCheck(edge) => {
                self.check.set_edge_log_pdf(edge, fx);
                let outside = self.log_y >= self.check.f_left && self.log_y >= self.check.f_right;
                if self.differs && outside {
                    log::debug!(
                        "doubling acceptance check rejected {} on dimension {}",
                        self.proposed,
                        self.active
                    );
                    self.shrink_and_propose();
                    None
                } else {
                    self.continue_check()
                }
            }
        };
        Ok(sample)
    }

    fn current_log_pdf(&self) -> Option<f64> {
        self.current.as_ref().map(|_| self.current_log_pdf)
    }

    fn set_seed(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
    }
}
