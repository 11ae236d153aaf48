//! Ask-tell samplers for Bayesian inference.
//!
//! A sampler proposes parameter vectors with `ask` and learns how good they
//! were with `tell`. Evaluating the proposals is up to the caller, which makes
//! it easy to batch or parallelise the expensive model calls. Two samplers are
//! provided:
//!
//! - [`RejectionAbc`], rejection approximate Bayesian computation.
//! - [`AdaptiveCovarianceMcmc`], Metropolis-Hastings with a proposal
//!   covariance that is adapted during an initial phase.
//!
//! [`Controller`] runs several independent chains in lock-step and
//! [`McmcResults`] summarises them, including R-hat and the effective sample
//! size.
//!
//! ```no_run
//! use asktell_rs::{toy::GaussianLogPdf, Controller, ControllerSettings};
//!
//! # fn main() -> anyhow::Result<()> {
//! let target = GaussianLogPdf::new(vec![2., -1.], vec![1., 0.5])?;
//! let starts = [[2.2, -1.1], [1.8, -0.9], [2.3, -1.15]];
//!
//! let settings = ControllerSettings {
//!     max_iterations: 1000,
//!     initial_phase_iterations: 200,
//!     ..Default::default()
//! };
//! let mut controller = Controller::adaptive_covariance(target, &starts, 42, settings)?;
//! let trace = controller.run()?;
//!
//! let results = trace.results(Some(vec!["mu".into(), "sigma".into()]))?;
//! println!("{results}");
//! # Ok(())
//! # }
//! ```

pub(crate) mod abc_rejection;
pub(crate) mod adaptive_covariance;
pub(crate) mod ask_tell;
pub(crate) mod controller;
pub(crate) mod diagnostics;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod timer;
pub mod toy;

pub use abc_rejection::RejectionAbc;
pub use adaptive_covariance::AdaptiveCovarianceMcmc;
pub use ask_tell::{Evaluation, ProtocolError, Sampler, SamplerError};
pub use controller::{chain_rng, Chain, Controller, ControllerSettings, SettingsError, Trace};
pub use diagnostics::{DiagnosticsError, McmcResults, Summary, SummaryRow, QUANTILES};
pub use math::validate_position;
pub use model::{Evaluator, FnEvaluator, LogPosterior, LogPrior, LogpError, PosteriorError};
pub use timer::Timer;
