//! Ask/tell MCMC samplers and a controller that runs them.
//!
//! Samplers never call the target themselves: they propose points with `ask` and learn
//! the log-pdf with `tell`. The [`controller::McmcController`] evaluates the proposals in
//! batches, in parallel if asked to, and assembles the chains.

pub mod adaptive_covariance;
pub mod controller;
pub mod differential_evolution;
pub mod distributions;
pub mod dream;
pub mod error;
pub mod evaluator;
pub mod io;
pub mod log_pdf;
pub mod progress;
pub mod sampler;
pub mod slice_covariance_matching;
pub mod slice_doubling;
pub mod stats;

pub use error::{McmcError, Result};
