//! Small analytic targets for tests, benchmarks and examples.

use std::convert::Infallible;
use std::f64::consts::PI;

use anyhow::{ensure, Result};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::model::{Evaluator, LogPrior};

/// Product of independent normal distributions.
#[derive(Debug, Clone)]
pub struct GaussianLogPdf {
    means: Box<[f64]>,
    stds: Box<[f64]>,
}

impl GaussianLogPdf {
    pub fn new(means: Vec<f64>, stds: Vec<f64>) -> Result<Self> {
        ensure!(!means.is_empty(), "Gaussian needs at least one dimension");
        ensure!(
            means.len() == stds.len(),
            "got {} means but {} standard deviations",
            means.len(),
            stds.len()
        );
        ensure!(
            stds.iter().all(|&s| s > 0. && s.is_finite()),
            "standard deviations must be positive"
        );
        Ok(Self {
            means: means.into(),
            stds: stds.into(),
        })
    }

    pub fn means(&self) -> &[f64] {
        &self.means
    }

    pub fn stds(&self) -> &[f64] {
        &self.stds
    }

    fn logp_inner(&self, position: &[f64]) -> f64 {
        position
            .iter()
            .zip(self.means.iter().zip(self.stds.iter()))
            .map(|(&x, (&mu, &sigma))| {
                let z = (x - mu) / sigma;
                -0.5 * z * z - sigma.ln() - 0.5 * (2. * PI).ln()
            })
            .sum()
    }
}

impl Evaluator for GaussianLogPdf {
    type Error = Infallible;

    fn dim(&self) -> usize {
        self.means.len()
    }

    fn evaluate(&self, position: &[f64]) -> Result<f64, Infallible> {
        Ok(self.logp_inner(position))
    }
}

impl LogPrior for GaussianLogPdf {
    type Error = Infallible;

    fn dim(&self) -> usize {
        self.means.len()
    }

    fn logp(&self, position: &[f64]) -> Result<f64, Infallible> {
        Ok(self.logp_inner(position))
    }

    fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<Box<[f64]>> {
        (0..n)
            .map(|_| {
                self.means
                    .iter()
                    .zip(self.stds.iter())
                    .map(|(&mu, &sigma)| {
                        let z: f64 = rng.sample(StandardNormal);
                        mu + sigma * z
                    })
                    .collect()
            })
            .collect()
    }
}

/// Uniform prior on an axis-aligned box `[lower, upper)`.
#[derive(Debug, Clone)]
pub struct UniformLogPrior {
    lower: Box<[f64]>,
    upper: Box<[f64]>,
    log_density: f64,
}

impl UniformLogPrior {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Result<Self> {
        ensure!(!lower.is_empty(), "uniform prior needs at least one dimension");
        ensure!(
            lower.len() == upper.len(),
            "lower and upper bounds differ in length"
        );
        ensure!(
            lower
                .iter()
                .zip(upper.iter())
                .all(|(a, b)| a.is_finite() && b.is_finite() && a < b),
            "upper bounds must be larger than lower bounds"
        );
        let log_density = -lower
            .iter()
            .zip(upper.iter())
            .map(|(a, b)| (b - a).ln())
            .sum::<f64>();
        Ok(Self {
            lower: lower.into(),
            upper: upper.into(),
            log_density,
        })
    }
}

impl LogPrior for UniformLogPrior {
    type Error = Infallible;

    fn dim(&self) -> usize {
        self.lower.len()
    }

    fn logp(&self, position: &[f64]) -> Result<f64, Infallible> {
        let inside = position
            .iter()
            .zip(self.lower.iter().zip(self.upper.iter()))
            .all(|(x, (a, b))| a <= x && x < b);
        if inside {
            Ok(self.log_density)
        } else {
            Ok(f64::NEG_INFINITY)
        }
    }

    fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<Box<[f64]>> {
        (0..n)
            .map(|_| {
                self.lower
                    .iter()
                    .zip(self.upper.iter())
                    .map(|(&a, &b)| a + (b - a) * rng.random::<f64>())
                    .collect()
            })
            .collect()
    }
}

/// The Rosenbrock function `(a - x)^2 + b (y - x^2)^2`.
#[derive(Debug, Clone, Copy)]
pub struct RosenbrockError {
    a: f64,
    b: f64,
}

impl Default for RosenbrockError {
    fn default() -> Self {
        Self { a: 1., b: 100. }
    }
}

impl RosenbrockError {
    pub fn new(a: f64, b: f64) -> Self {
        Self { a, b }
    }

    /// The global minimum `(a, a^2)`.
    pub fn optimum(&self) -> [f64; 2] {
        [self.a, self.a * self.a]
    }
}

impl Evaluator for RosenbrockError {
    type Error = Infallible;

    fn dim(&self) -> usize {
        2
    }

    fn evaluate(&self, position: &[f64]) -> Result<f64, Infallible> {
        let (x, y) = (position[0], position[1]);
        Ok((self.a - x).powi(2) + self.b * (y - x * x).powi(2))
    }
}

/// Log-density `-ln f` of the Rosenbrock function, infinite at the optimum.
#[derive(Debug, Clone, Copy, Default)]
pub struct RosenbrockLogPdf {
    error: RosenbrockError,
}

impl RosenbrockLogPdf {
    pub fn new(a: f64, b: f64) -> Self {
        Self {
            error: RosenbrockError::new(a, b),
        }
    }

    pub fn optimum(&self) -> [f64; 2] {
        self.error.optimum()
    }
}

impl Evaluator for RosenbrockLogPdf {
    type Error = Infallible;

    fn dim(&self) -> usize {
        2
    }

    fn evaluate(&self, position: &[f64]) -> Result<f64, Infallible> {
        let f = self.error.evaluate(position)?;
        if f == 0. {
            return Ok(f64::INFINITY);
        }
        Ok(-f.ln())
    }
}
