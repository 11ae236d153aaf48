//! Adaptive-covariance Metropolis-Hastings.
//!
//! Proposals are drawn from `N(x, exp(log_lambda) * sigma)`. While the
//! initial phase is active, the running mean, the covariance `sigma` and the
//! global scale `log_lambda` are adapted after every step (Haario-Bardenet
//! style, with decreasing step sizes `gamma = k^-eta`). Outside the initial
//! phase the proposal distribution is fixed.

use faer::{Col, Mat, MatRef};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    ask_tell::{Evaluation, Phase, Result, Sampler, SamplerError},
    math::validate_position,
};

/// Adaptation counter starts here, so the first step size is `2^-eta`.
const INITIAL_ADAPTATIONS: f64 = 2.;

fn mat_all_finite(mat: &MatRef<f64>) -> bool {
    let mut ok = true;
    faer::zip!(mat).for_each(|faer::unzip!(val)| ok &= val.is_finite());
    ok
}

/// Symmetric square root `U sqrt(S) U^T` of a covariance matrix.
///
/// Negative eigenvalues from round-off are clipped to zero.
fn symmetric_sqrt(cov: &Mat<f64>) -> Option<Mat<f64>> {
    let eig = cov.self_adjoint_eigen(faer::Side::Lower).ok()?;
    let u = eig.U();
    let mut vals = eig.S().column_vector().to_owned();
    vals.iter_mut().for_each(|val| *val = val.max(0.).sqrt());
    let sqrt = u * vals.into_diagonal() * u.transpose();
    if !mat_all_finite(&sqrt.as_ref()) {
        return None;
    }
    Some(sqrt)
}

fn propose<R: Rng + ?Sized>(
    rng: &mut R,
    current: &[f64],
    sigma_sqrt: &Mat<f64>,
    scale: f64,
) -> Box<[f64]> {
    let dim = current.len();
    let z: Col<f64> = Col::from_fn(dim, |_| rng.sample(StandardNormal));
    current
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            let step: f64 = (0..dim).map(|j| sigma_sqrt[(i, j)] * z[j]).sum();
            x + scale * step
        })
        .collect()
}

pub struct AdaptiveCovarianceMcmc<R> {
    rng: R,
    x0: Box<[f64]>,
    current: Option<Box<[f64]>>,
    current_logp: f64,
    mu: Box<[f64]>,
    sigma: Mat<f64>,
    sigma_sqrt: Mat<f64>,
    log_lambda: f64,
    eta: f64,
    target_acceptance: f64,
    adaptations: f64,
    in_initial_phase: bool,
    mh_steps: u64,
    accepted: u64,
    phase: Phase<Box<[f64]>>,
}

impl<R: Rng> AdaptiveCovarianceMcmc<R> {
    /// Start a chain at `x0`.
    ///
    /// The initial proposal covariance is `diag(0.01 |x0|)`, using `0.01`
    /// for zero coordinates. The initial phase is active until switched off.
    pub fn new(x0: &[f64], rng: R) -> Result<Self> {
        if x0.is_empty() {
            return Err(SamplerError::ZeroDimension);
        }
        let x0 = validate_position(x0, x0.len())?;
        let dim = x0.len();
        let sigma = Mat::from_fn(dim, dim, |i, j| {
            if i != j {
                0.
            } else if x0[i] == 0. {
                0.01
            } else {
                0.01 * x0[i].abs()
            }
        });
        let sigma_sqrt = symmetric_sqrt(&sigma).ok_or(SamplerError::InvalidCovariance)?;
        Ok(Self {
            rng,
            mu: x0.clone(),
            x0,
            current: None,
            current_logp: f64::NAN,
            sigma,
            sigma_sqrt,
            log_lambda: 0.,
            eta: 0.6,
            target_acceptance: 0.234,
            adaptations: INITIAL_ADAPTATIONS,
            in_initial_phase: true,
            mh_steps: 0,
            accepted: 0,
            phase: Phase::AwaitingAsk,
        })
    }

    /// Use `sigma0` as the initial proposal covariance.
    pub fn with_covariance(mut self, sigma0: Mat<f64>) -> Result<Self> {
        let dim = self.x0.len();
        if sigma0.nrows() != dim || sigma0.ncols() != dim {
            return Err(SamplerError::CovarianceShape {
                dim,
                rows: sigma0.nrows(),
                cols: sigma0.ncols(),
            });
        }
        let symmetric = (0..dim).all(|i| (0..i).all(|j| sigma0[(i, j)] == sigma0[(j, i)]));
        if !symmetric || !mat_all_finite(&sigma0.as_ref()) {
            return Err(SamplerError::InvalidCovariance);
        }
        self.sigma_sqrt = symmetric_sqrt(&sigma0).ok_or(SamplerError::InvalidCovariance)?;
        self.sigma = sigma0;
        Ok(self)
    }

    /// Acceptance rate the global scale adaptation aims for.
    pub fn with_target_acceptance(mut self, target: f64) -> Result<Self> {
        if !(target > 0. && target < 1.) {
            return Err(SamplerError::InvalidOption {
                name: "target acceptance",
                range: "(0, 1)",
                value: target,
            });
        }
        self.target_acceptance = target;
        Ok(self)
    }

    /// Decay rate of the adaptation step size.
    pub fn with_eta(mut self, eta: f64) -> Result<Self> {
        if !(eta > 0. && eta <= 1.) {
            return Err(SamplerError::InvalidOption {
                name: "eta",
                range: "(0, 1]",
                value: eta,
            });
        }
        self.eta = eta;
        Ok(self)
    }

    /// The current position of the chain, once the starting point was evaluated.
    pub fn current_position(&self) -> Option<&[f64]> {
        self.current.as_deref()
    }

    pub fn current_log_pdf(&self) -> Option<f64> {
        self.current.as_ref().map(|_| self.current_logp)
    }

    pub fn covariance(&self) -> &Mat<f64> {
        &self.sigma
    }

    pub fn log_lambda(&self) -> f64 {
        self.log_lambda
    }

    fn adapt(&mut self, current: &[f64], accept_prob: f64) {
        let gamma = self.adaptations.powf(-self.eta);
        self.adaptations += 1.;

        self.mu
            .iter_mut()
            .zip(current.iter())
            .for_each(|(mu, &x)| *mu = (1. - gamma) * *mu + gamma * x);

        let diff: Vec<f64> = current
            .iter()
            .zip(self.mu.iter())
            .map(|(&x, &mu)| x - mu)
            .collect();
        let dim = diff.len();
        let sigma = Mat::from_fn(dim, dim, |i, j| {
            (1. - gamma) * self.sigma[(i, j)] + gamma * diff[i] * diff[j]
        });
        // Keep the previous factorisation if the update went bad
        if let Some(sqrt) = symmetric_sqrt(&sigma) {
            self.sigma = sigma;
            self.sigma_sqrt = sqrt;
        }

        self.log_lambda += gamma * (accept_prob - self.target_acceptance);
    }
}

impl<R: Rng + Send> Sampler for AdaptiveCovarianceMcmc<R> {
    fn name(&self) -> &'static str {
        "Haario-Bardenet adaptive covariance MCMC"
    }

    fn dim(&self) -> usize {
        self.x0.len()
    }

    /// Always proposes a single point. The very first proposal is the
    /// starting point itself, so that its log-density gets evaluated.
    fn ask(&mut self, n: usize) -> Result<Vec<Box<[f64]>>> {
        self.phase.check_ask()?;
        if n == 0 {
            return Err(SamplerError::EmptyAsk);
        }
        let proposal = match &self.current {
            None => self.x0.clone(),
            Some(current) => propose(
                &mut self.rng,
                current,
                &self.sigma_sqrt,
                (0.5 * self.log_lambda).exp(),
            ),
        };
        self.phase.asked(proposal.clone());
        Ok(vec![proposal])
    }

    /// Returns the position of the chain after this step, which is the
    /// previous position if the proposal was rejected.
    fn tell(&mut self, evaluation: Evaluation) -> Result<Option<Vec<Box<[f64]>>>> {
        let proposal = self.phase.take_pending()?;
        let logp = match evaluation {
            Evaluation::Single(logp) => logp,
            Evaluation::Batch(values) => match values.as_ref() {
                [logp] => *logp,
                other => {
                    return Err(SamplerError::EvaluationShape {
                        expected: 1,
                        got: other.len(),
                    })
                }
            },
        };

        let Some(current) = self.current.take() else {
            if !logp.is_finite() {
                return Err(SamplerError::NonFiniteInitialLogp(logp));
            }
            self.current_logp = logp;
            self.current = Some(proposal.clone());
            return Ok(Some(vec![proposal]));
        };

        self.mh_steps += 1;
        let log_ratio = logp - self.current_logp;
        let accept_prob = if logp.is_finite() {
            log_ratio.exp().min(1.)
        } else {
            0.
        };

        let current = if logp.is_finite() && self.rng.random::<f64>().ln() < log_ratio {
            self.accepted += 1;
            self.current_logp = logp;
            proposal
        } else {
            current
        };

        if self.in_initial_phase {
            self.adapt(&current, accept_prob);
        }

        self.current = Some(current.clone());
        Ok(Some(vec![current]))
    }

    fn needs_initial_phase(&self) -> bool {
        true
    }

    fn set_initial_phase(&mut self, in_initial_phase: bool) {
        self.in_initial_phase = in_initial_phase;
    }

    fn in_initial_phase(&self) -> bool {
        self.in_initial_phase
    }

    fn acceptance_rate(&self) -> Option<f64> {
        if self.mh_steps == 0 {
            return Some(0.);
        }
        Some(self.accepted as f64 / self.mh_steps as f64)
    }
}
