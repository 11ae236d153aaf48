//! Summary statistics and convergence diagnostics for finished chains.
//!
//! All quantities are computed once, when [`McmcResults`] is constructed.
//!
//! R-hat and the effective sample size compare several chains. When only a
//! single chain is available it is split into two halves (dropping the last
//! draw of an odd-length chain) and the halves are treated as two chains.
//! Mean, standard deviation and quantiles always use every draw of every
//! chain.
//!
//! The effective sample size combines the autocovariances of all chains
//! (Gelman et al., BDA3, ch. 11.5) and truncates the autocorrelation sum with
//! Geyer's initial positive sequence, made monotone.

use std::fmt;

use faer::Mat;
use itertools::Itertools;
use thiserror::Error;

use crate::math::{autocovariance, mean, quantile_sorted, sort_values, variance};

/// Probabilities of the reported quantiles.
pub const QUANTILES: [f64; 5] = [0.025, 0.25, 0.5, 0.75, 0.975];

const COLUMNS: [&str; 10] = [
    "param", "mean", "std.", "2.5%", "25%", "50%", "75%", "97.5%", "rhat", "ess",
];
const TIMED_COLUMN: &str = "ess per sec.";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiagnosticsError {
    #[error("at least one chain is required")]
    NoChains,
    #[error("chain {chain} contains no samples")]
    EmptyChain { chain: usize },
    #[error("chain {chain} has {got} samples, expected {expected}")]
    RaggedChains {
        chain: usize,
        expected: usize,
        got: usize,
    },
    #[error("sample {draw} of chain {chain} has {got} parameters, expected {expected}")]
    DimensionMismatch {
        chain: usize,
        draw: usize,
        expected: usize,
        got: usize,
    },
    #[error("samples must have at least one parameter")]
    ZeroDimension,
    #[error("sample {draw} of chain {chain} is not finite")]
    NonFiniteSample { chain: usize, draw: usize },
    #[error("time must be a positive number of seconds, got {0}")]
    InvalidTime(f64),
    #[error("got {got} parameter names for {expected} parameters")]
    ParameterNames { expected: usize, got: usize },
    #[error("{0} samples are too few to compare chains")]
    TooFewSamples(usize),
}

/// Posterior summary and diagnostics of a set of chains.
#[derive(Debug, Clone)]
pub struct McmcResults {
    n_chains: usize,
    n_samples: usize,
    names: Option<Vec<String>>,
    time: Option<f64>,
    mean: Box<[f64]>,
    std: Box<[f64]>,
    quantiles: Mat<f64>,
    rhat: Box<[f64]>,
    ess: Box<[f64]>,
    ess_per_second: Option<Box<[f64]>>,
}

impl McmcResults {
    /// Compute the summary of `chains`.
    ///
    /// All chains must contain the same number of finite samples of equal
    /// dimension. `time` is the wall-clock duration of the run in seconds,
    /// and `parameter_names` must contain one name per parameter.
    pub fn new<C: AsRef<[Box<[f64]>]>>(
        chains: &[C],
        time: Option<f64>,
        parameter_names: Option<Vec<String>>,
    ) -> Result<Self, DiagnosticsError> {
        let (n_samples, dim) = check_chains(chains)?;

        if let Some(time) = time {
            if !(time > 0. && time.is_finite()) {
                return Err(DiagnosticsError::InvalidTime(time));
            }
        }
        if let Some(names) = &parameter_names {
            if names.len() != dim {
                return Err(DiagnosticsError::ParameterNames {
                    expected: dim,
                    got: names.len(),
                });
            }
        }

        let n_chains = chains.len();
        let min_samples = if n_chains == 1 { 4 } else { 2 };
        if n_samples < min_samples {
            return Err(DiagnosticsError::TooFewSamples(n_samples));
        }

        let mut means = Vec::with_capacity(dim);
        let mut stds = Vec::with_capacity(dim);
        let mut rhat = Vec::with_capacity(dim);
        let mut ess = Vec::with_capacity(dim);
        let mut quantiles = Mat::zeros(QUANTILES.len(), dim);

        for param in 0..dim {
            let traces = chains
                .iter()
                .map(|chain| chain.as_ref().iter().map(|draw| draw[param]).collect_vec())
                .collect_vec();

            let mut pooled = traces.concat();
            means.push(mean(&pooled));
            stds.push(variance(&pooled, 0).sqrt());
            sort_values(&mut pooled);
            for (row, &q) in QUANTILES.iter().enumerate() {
                quantiles[(row, param)] = quantile_sorted(&pooled, q);
            }

            let views = comparison_view(traces);
            rhat.push(potential_scale_reduction(&views));
            ess.push(effective_sample_size(&views));
        }

        let ess_per_second =
            time.map(|time| ess.iter().map(|&value| value / time).collect::<Box<[f64]>>());

        Ok(Self {
            n_chains,
            n_samples,
            names: parameter_names,
            time,
            mean: means.into(),
            std: stds.into(),
            quantiles,
            rhat: rhat.into(),
            ess: ess.into(),
            ess_per_second,
        })
    }

    pub fn n_chains(&self) -> usize {
        self.n_chains
    }

    /// The number of samples in each chain.
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn n_parameters(&self) -> usize {
        self.mean.len()
    }

    /// The supplied parameter names, or `param 1`, `param 2`, ...
    pub fn parameter_names(&self) -> Vec<String> {
        match &self.names {
            Some(names) => names.clone(),
            None => (1..=self.n_parameters())
                .map(|i| format!("param {i}"))
                .collect(),
        }
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// Standard deviation of all samples (normalised by the sample count).
    pub fn std(&self) -> &[f64] {
        &self.std
    }

    /// One row per entry of [`QUANTILES`], one column per parameter.
    pub fn quantiles(&self) -> &Mat<f64> {
        &self.quantiles
    }

    pub fn rhat(&self) -> &[f64] {
        &self.rhat
    }

    pub fn ess(&self) -> &[f64] {
        &self.ess
    }

    pub fn ess_per_second(&self) -> Option<&[f64]> {
        self.ess_per_second.as_deref()
    }

    pub fn time(&self) -> Option<f64> {
        self.time
    }

    pub fn summary(&self) -> Summary {
        let rows = self
            .parameter_names()
            .into_iter()
            .enumerate()
            .map(|(i, name)| SummaryRow {
                name,
                mean: self.mean[i],
                std: self.std[i],
                quantiles: std::array::from_fn(|row| self.quantiles[(row, i)]),
                rhat: self.rhat[i],
                ess: self.ess[i],
                ess_per_second: self.ess_per_second.as_ref().map(|values| values[i]),
            })
            .collect();
        Summary {
            rows,
            timed: self.time.is_some(),
        }
    }
}

impl fmt::Display for McmcResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.summary().fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    /// Values at [`QUANTILES`].
    pub quantiles: [f64; 5],
    pub rhat: f64,
    pub ess: f64,
    pub ess_per_second: Option<f64>,
}

impl SummaryRow {
    /// The numeric columns in display order, without the name.
    pub fn values(&self) -> Vec<f64> {
        let mut values = vec![self.mean, self.std];
        values.extend(self.quantiles);
        values.push(self.rhat);
        values.push(self.ess);
        values.extend(self.ess_per_second);
        values
    }
}

/// Table with one row per parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    rows: Vec<SummaryRow>,
    timed: bool,
}

impl Summary {
    pub fn columns(&self) -> Vec<&'static str> {
        let mut columns = COLUMNS.to_vec();
        if self.timed {
            columns.push(TIMED_COLUMN);
        }
        columns
    }

    pub fn rows(&self) -> &[SummaryRow] {
        &self.rows
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let columns = self.columns();
        let cells = self
            .rows
            .iter()
            .map(|row| {
                std::iter::once(row.name.clone())
                    .chain(row.values().into_iter().map(|value| format!("{value:.2}")))
                    .collect_vec()
            })
            .collect_vec();

        let widths = columns
            .iter()
            .enumerate()
            .map(|(col, header)| {
                cells
                    .iter()
                    .map(|row| row[col].len())
                    .chain(std::iter::once(header.len()))
                    .max()
                    .unwrap_or(0)
            })
            .collect_vec();

        write_row(f, &columns, &widths)?;
        let rule = widths.iter().map(|&width| "-".repeat(width)).collect_vec();
        write_row(f, &rule, &widths)?;
        for row in cells.iter() {
            write_row(f, row, &widths)?;
        }
        Ok(())
    }
}

/// Names are left aligned, numbers right aligned.
fn write_row<S: AsRef<str>>(f: &mut fmt::Formatter<'_>, row: &[S], widths: &[usize]) -> fmt::Result {
    let text = row
        .iter()
        .zip(widths.iter())
        .enumerate()
        .map(|(col, (cell, &width))| {
            let cell = cell.as_ref();
            if col == 0 {
                format!("{cell:<width$}")
            } else {
                format!("{cell:>width$}")
            }
        })
        .join("  ");
    writeln!(f, "{}", text.trim_end())
}

/// Validate the chain layout, returning the chain length and dimension.
fn check_chains<C: AsRef<[Box<[f64]>]>>(chains: &[C]) -> Result<(usize, usize), DiagnosticsError> {
    let first = chains.first().ok_or(DiagnosticsError::NoChains)?.as_ref();
    let n_samples = first.len();
    let dim = first.first().map(|draw| draw.len()).unwrap_or(0);

    for (chain, draws) in chains.iter().enumerate() {
        let draws = draws.as_ref();
        if draws.is_empty() {
            return Err(DiagnosticsError::EmptyChain { chain });
        }
        if draws.len() != n_samples {
            return Err(DiagnosticsError::RaggedChains {
                chain,
                expected: n_samples,
                got: draws.len(),
            });
        }
        for (i, draw) in draws.iter().enumerate() {
            if draw.len() != dim {
                return Err(DiagnosticsError::DimensionMismatch {
                    chain,
                    draw: i,
                    expected: dim,
                    got: draw.len(),
                });
            }
            if !draw.iter().all(|x| x.is_finite()) {
                return Err(DiagnosticsError::NonFiniteSample { chain, draw: i });
            }
        }
    }
    if dim == 0 {
        return Err(DiagnosticsError::ZeroDimension);
    }
    Ok((n_samples, dim))
}

/// The chains used for between/within-chain comparisons: the chains
/// themselves, or the two halves of a single chain.
fn comparison_view(mut traces: Vec<Vec<f64>>) -> Vec<Vec<f64>> {
    if traces.len() != 1 {
        return traces;
    }
    let mut first = traces.remove(0);
    let half = first.len() / 2;
    let second = first[half..2 * half].to_vec();
    first.truncate(half);
    vec![first, second]
}

/// Gelman-Rubin potential scale reduction factor.
///
/// Chains without any within-chain variance give `1` if they all sit at the
/// same value and infinity otherwise.
pub(crate) fn potential_scale_reduction(chains: &[Vec<f64>]) -> f64 {
    let m = chains.len() as f64;
    let n = chains[0].len() as f64;

    let chain_means = chains.iter().map(|c| mean(c)).collect_vec();
    let grand_mean = mean(&chain_means);
    let b = n / (m - 1.)
        * chain_means
            .iter()
            .map(|&cm| (cm - grand_mean) * (cm - grand_mean))
            .sum::<f64>();
    let w = chains.iter().map(|c| variance(c, 1)).sum::<f64>() / m;

    if w <= 0. {
        return if b <= 0. { 1. } else { f64::INFINITY };
    }
    ((n - 1.) / n + b / (n * w)).sqrt()
}

/// Multi-chain effective sample size, clamped to `[0, m * n]`.
pub(crate) fn effective_sample_size(chains: &[Vec<f64>]) -> f64 {
    let m = chains.len();
    let n = chains[0].len();
    let total = (m * n) as f64;

    let chain_means = chains.iter().map(|c| mean(c)).collect_vec();
    let mean_acov = |lag: usize| {
        chains
            .iter()
            .zip(chain_means.iter())
            .map(|(chain, &cm)| autocovariance(chain, cm, lag))
            .sum::<f64>()
            / m as f64
    };

    let nf = n as f64;
    let w = mean_acov(0) * nf / (nf - 1.);
    let between = if m > 1 { variance(&chain_means, 1) } else { 0. };
    let var_plus = w * (nf - 1.) / nf + between;
    if var_plus <= 0. {
        // No variation at all: every sample carries the same information.
        return total;
    }
    let rho = |lag: usize| {
        if lag == 0 {
            1.
        } else {
            1. - (w - mean_acov(lag)) / var_plus
        }
    };

    // Geyer: sum pairs of autocorrelations while the pair sums stay
    // positive, and never let a pair sum increase.
    let mut pair_sums = 0.;
    let mut previous = f64::INFINITY;
    let mut lag = 0;
    while lag + 1 < n {
        let pair = rho(lag) + rho(lag + 1);
        if pair <= 0. {
            break;
        }
        let pair = pair.min(previous);
        pair_sums += pair;
        previous = pair;
        lag += 2;
    }

    let tau = (-1. + 2. * pair_sums).max(1. / total.log10().max(f64::MIN_POSITIVE));
    (total / tau).clamp(0., total)
}
