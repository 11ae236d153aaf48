//! Capability traits for the functions samplers and controllers consume.
//!
//! Samplers never see a concrete distribution type. A prior only has to be
//! able to draw points and score them, and whatever the controller calls on a
//! proposal (a log-posterior for MCMC, a simulated-data distance for ABC) only
//! has to implement [`Evaluator`].

use std::convert::Infallible;

use rand::Rng;

use crate::ask_tell::SamplerError;

/// Errors that happen when we evaluate a proposal.
pub trait LogpError: std::error::Error + Send + Sync + 'static {
    /// Unrecoverable errors stop sampling, recoverable errors reject the
    /// proposal that caused them.
    fn is_recoverable(&self) -> bool;
}

impl LogpError for Infallible {
    fn is_recoverable(&self) -> bool {
        match *self {}
    }
}

/// Scores a single parameter vector.
///
/// For MCMC this is an (unnormalised) log-posterior, for ABC a distance between
/// simulated and observed data. Implementations must be `Sync` so that the
/// controller can evaluate the proposals of one round in parallel.
pub trait Evaluator: Sync {
    type Error: LogpError;

    /// The number of parameters a position must have.
    fn dim(&self) -> usize;

    fn evaluate(&self, position: &[f64]) -> Result<f64, Self::Error>;
}

/// A prior distribution that can both be sampled and evaluated.
pub trait LogPrior: Sync {
    type Error: LogpError;

    fn dim(&self) -> usize;

    /// The log-density of the prior at `position`.
    fn logp(&self, position: &[f64]) -> Result<f64, Self::Error>;

    /// Draw `n` independent points from the prior.
    fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<Box<[f64]>>;
}

impl<E: Evaluator + ?Sized> Evaluator for &E {
    type Error = E::Error;

    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn evaluate(&self, position: &[f64]) -> Result<f64, Self::Error> {
        (**self).evaluate(position)
    }
}

/// Adapts a plain closure into an [`Evaluator`] that never fails.
pub struct FnEvaluator<F> {
    dim: usize,
    func: F,
}

impl<F> FnEvaluator<F>
where
    F: Fn(&[f64]) -> f64 + Sync,
{
    pub fn new(dim: usize, func: F) -> Self {
        Self { dim, func }
    }
}

impl<F> Evaluator for FnEvaluator<F>
where
    F: Fn(&[f64]) -> f64 + Sync,
{
    type Error = Infallible;

    fn dim(&self) -> usize {
        self.dim
    }

    fn evaluate(&self, position: &[f64]) -> Result<f64, Infallible> {
        Ok((self.func)(position))
    }
}

/// Errors of a [`LogPosterior`], coming from either of its parts.
#[derive(Debug, thiserror::Error)]
pub enum PosteriorError<L: LogpError, P: LogpError> {
    #[error("log-likelihood evaluation failed")]
    Likelihood(#[source] L),
    #[error("log-prior evaluation failed")]
    Prior(#[source] P),
}

impl<L: LogpError, P: LogpError> LogpError for PosteriorError<L, P> {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Likelihood(err) => err.is_recoverable(),
            Self::Prior(err) => err.is_recoverable(),
        }
    }
}

/// Unnormalised log-posterior: log-likelihood plus log-prior.
///
/// The likelihood is skipped whenever the prior already rules a point out.
pub struct LogPosterior<L, P> {
    log_likelihood: L,
    log_prior: P,
}

impl<L: Evaluator, P: LogPrior> LogPosterior<L, P> {
    /// Fails if the likelihood and the prior disagree on the number of
    /// parameters.
    pub fn new(log_likelihood: L, log_prior: P) -> Result<Self, SamplerError> {
        if log_likelihood.dim() != log_prior.dim() {
            return Err(SamplerError::DimensionMismatch {
                expected: log_prior.dim(),
                got: log_likelihood.dim(),
            });
        }
        Ok(Self {
            log_likelihood,
            log_prior,
        })
    }

    pub fn log_prior(&self) -> &P {
        &self.log_prior
    }

    pub fn log_likelihood(&self) -> &L {
        &self.log_likelihood
    }
}

impl<L: Evaluator, P: LogPrior> Evaluator for LogPosterior<L, P> {
    type Error = PosteriorError<L::Error, P::Error>;

    fn dim(&self) -> usize {
        self.log_prior.dim()
    }

    fn evaluate(&self, position: &[f64]) -> Result<f64, Self::Error> {
        let prior = self
            .log_prior
            .logp(position)
            .map_err(PosteriorError::Prior)?;
        if prior == f64::NEG_INFINITY {
            return Ok(prior);
        }
        let likelihood = self
            .log_likelihood
            .evaluate(position)
            .map_err(PosteriorError::Likelihood)?;
        Ok(prior + likelihood)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::toy::{GaussianLogPdf, UniformLogPrior};

    #[test]
    fn closure_evaluator() {
        let f = FnEvaluator::new(2, |x: &[f64]| x[0] + x[1]);
        assert_eq!(f.dim(), 2);
        assert_eq!(f.evaluate(&[1., 2.]).unwrap(), 3.);
    }

    #[test]
    fn posterior_adds_prior_and_likelihood() {
        let likelihood = GaussianLogPdf::new(vec![0.5, 0.5], vec![1., 1.]).unwrap();
        let prior = UniformLogPrior::new(vec![0., 0.], vec![2., 2.]).unwrap();
        let expected = likelihood.evaluate(&[1., 1.]).unwrap() + prior.logp(&[1., 1.]).unwrap();
        let posterior = LogPosterior::new(likelihood, prior).unwrap();
        assert_eq!(posterior.evaluate(&[1., 1.]).unwrap(), expected);
    }

    #[test]
    fn posterior_skips_likelihood_outside_prior() {
        let calls = AtomicUsize::new(0);
        let likelihood = FnEvaluator::new(1, |_: &[f64]| {
            calls.fetch_add(1, Ordering::Relaxed);
            0.
        });
        let prior = UniformLogPrior::new(vec![0.], vec![1.]).unwrap();
        let posterior = LogPosterior::new(likelihood, prior).unwrap();

        assert_eq!(posterior.evaluate(&[5.]).unwrap(), f64::NEG_INFINITY);
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        posterior.evaluate(&[0.5]).unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn posterior_dimension_mismatch() {
        let likelihood = FnEvaluator::new(3, |_: &[f64]| 0.);
        let prior = UniformLogPrior::new(vec![0.], vec![1.]).unwrap();
        assert!(matches!(
            LogPosterior::new(likelihood, prior),
            Err(SamplerError::DimensionMismatch {
                expected: 1,
                got: 3
            })
        ));
    }
}
