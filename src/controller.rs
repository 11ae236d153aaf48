//! Drive several independent samplers through the ask-tell loop.

use std::time::Duration;

use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, info};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use thiserror::Error;

use crate::{
    abc_rejection::RejectionAbc,
    adaptive_covariance::AdaptiveCovarianceMcmc,
    ask_tell::{Evaluation, Sampler},
    diagnostics::{DiagnosticsError, McmcResults},
    model::{Evaluator, LogPrior, LogpError},
    timer::Timer,
};

/// Accepted samples of one chain, in the order they were accepted.
pub type Chain = Vec<Box<[f64]>>;

/// Iterations up to this bound are logged every 20 iterations.
const EARLY_LOG_ITERATIONS: usize = 200;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("max_iterations must be positive")]
    ZeroIterations,
    #[error("initial phase of {initial} iterations is longer than the {max} iterations of the run")]
    InitialPhaseTooLong { initial: usize, max: usize },
    #[error("proposals_per_ask must be positive")]
    ZeroProposals,
    #[error("log_interval must be positive")]
    ZeroLogInterval,
    #[error("at least one chain is required")]
    NoChains,
    #[error("sampler of chain {chain} has dimension {got}, the evaluator expects {expected}")]
    DimensionMismatch {
        chain: usize,
        expected: usize,
        got: usize,
    },
}

/// Settings of a sampling run
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    /// The number of ask-evaluate-tell rounds of every chain.
    pub max_iterations: usize,
    /// Samplers stay in their initial (adaptation) phase while the
    /// iteration is below this bound.
    pub initial_phase_iterations: usize,
    /// Report progress through the `log` facade.
    pub log_to_screen: bool,
    /// Progress is logged every `log_interval` iterations once the early
    /// iterations are over.
    pub log_interval: usize,
    /// Number of proposals each sampler is asked for per round.
    pub proposals_per_ask: usize,
    /// Evaluate the proposals of a round on the rayon thread pool.
    pub parallel: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10000,
            initial_phase_iterations: 200,
            log_to_screen: true,
            log_interval: 500,
            proposals_per_ask: 1,
            parallel: false,
        }
    }
}

impl ControllerSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_iterations == 0 {
            return Err(SettingsError::ZeroIterations);
        }
        if self.initial_phase_iterations > self.max_iterations {
            return Err(SettingsError::InitialPhaseTooLong {
                initial: self.initial_phase_iterations,
                max: self.max_iterations,
            });
        }
        if self.proposals_per_ask == 0 {
            return Err(SettingsError::ZeroProposals);
        }
        if self.log_interval == 0 {
            return Err(SettingsError::ZeroLogInterval);
        }
        Ok(())
    }

    /// Whether progress is reported after `iteration` completed rounds.
    fn should_log(&self, iteration: usize) -> bool {
        if !self.log_to_screen {
            return false;
        }
        if iteration <= 3 || iteration == self.max_iterations {
            return true;
        }
        let early = self.initial_phase_iterations.max(EARLY_LOG_ITERATIONS);
        if iteration <= early {
            iteration % 20 == 0
        } else {
            iteration % self.log_interval == 0
        }
    }
}

/// Random number generator for `chain`, derived from a common seed.
pub fn chain_rng(seed: u64, chain: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(chain);
    rng
}

/// The outcome of [`Controller::run`].
#[derive(Debug, Clone)]
pub struct Trace {
    pub chains: Vec<Chain>,
    pub elapsed: Duration,
}

impl Trace {
    /// Summary statistics and convergence diagnostics of the chains.
    pub fn results(
        &self,
        parameter_names: Option<Vec<String>>,
    ) -> Result<McmcResults, DiagnosticsError> {
        let time = Some(self.elapsed.as_secs_f64()).filter(|&time| time > 0.);
        McmcResults::new(&self.chains, time, parameter_names)
    }
}

/// Owns one sampler per chain and the function that scores their proposals.
pub struct Controller<E, S> {
    evaluator: E,
    samplers: Vec<S>,
    settings: ControllerSettings,
}

impl<E: Evaluator, S: Sampler> Controller<E, S> {
    pub fn new(
        evaluator: E,
        samplers: Vec<S>,
        settings: ControllerSettings,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;
        if samplers.is_empty() {
            return Err(SettingsError::NoChains);
        }
        let expected = evaluator.dim();
        if let Some((chain, sampler)) = samplers
            .iter()
            .find_position(|sampler| sampler.dim() != expected)
        {
            return Err(SettingsError::DimensionMismatch {
                chain,
                expected,
                got: sampler.dim(),
            });
        }
        Ok(Self {
            evaluator,
            samplers,
            settings,
        })
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn samplers(&self) -> &[S] {
        &self.samplers
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    pub fn n_chains(&self) -> usize {
        self.samplers.len()
    }

    /// Run all chains for `max_iterations` rounds.
    ///
    /// In every round each sampler is asked for proposals, all proposals of
    /// the round are evaluated, and the scores are told back to the sampler
    /// that produced them. Proposals whose evaluation fails with a
    /// recoverable error are scored `NaN`, which no sampler accepts.
    ///
    /// If the round fails part-way, every sampler that is still waiting for
    /// its scores is told `NaN` before the error is returned, so the
    /// controller can be run again.
    pub fn run(&mut self) -> Result<Trace> {
        let Self {
            evaluator,
            samplers,
            settings,
        } = self;
        let timer = Timer::new();
        let n_chains = samplers.len();

        if settings.log_to_screen {
            info!(
                "Running {} chain{} of {} for {} iterations",
                n_chains,
                if n_chains == 1 { "" } else { "s" },
                samplers[0].name(),
                settings.max_iterations,
            );
        }
        let adaptive = samplers.iter().any(|sampler| sampler.needs_initial_phase());
        if adaptive && settings.initial_phase_iterations > 0 {
            debug!(
                "Initial phase for the first {} iterations",
                settings.initial_phase_iterations
            );
        }

        let mut chains: Vec<Chain> = (0..n_chains)
            .map(|_| Vec::with_capacity(settings.max_iterations))
            .collect();
        for chain in 0..n_chains {
            debug!("Starting chain {chain}");
        }

        for iteration in 0..settings.max_iterations {
            let initial_phase = iteration < settings.initial_phase_iterations;
            if adaptive && iteration > 0 && iteration == settings.initial_phase_iterations {
                debug!("Initial phase finished after {iteration} iterations");
            }

            let mut proposals = Vec::with_capacity(n_chains);
            for (chain, sampler) in samplers.iter_mut().enumerate() {
                sampler.set_initial_phase(initial_phase);
                match sampler.ask(settings.proposals_per_ask) {
                    Ok(batch) => proposals.push(batch),
                    Err(err) => {
                        abandon_round(&mut samplers[..chain], &proposals);
                        return Err(err).with_context(|| {
                            format!("Chain {chain} failed to propose in iteration {iteration}")
                        });
                    }
                }
            }

            let scores = match evaluate_round(evaluator, &proposals, settings.parallel) {
                Ok(scores) => scores,
                Err(err) => {
                    abandon_round(samplers, &proposals);
                    return Err(err)
                        .with_context(|| format!("Evaluation failed in iteration {iteration}"));
                }
            };

            let mut scores = scores.into_iter();
            for chain in 0..n_chains {
                let chain_scores = scores.by_ref().take(proposals[chain].len()).collect_vec();
                match samplers[chain].tell(Evaluation::from_scores(chain_scores)) {
                    Ok(Some(accepted)) => chains[chain].extend(accepted),
                    Ok(None) => {}
                    Err(err) => {
                        abandon_round(&mut samplers[chain + 1..], &proposals[chain + 1..]);
                        return Err(err).with_context(|| {
                            format!("Chain {chain} rejected its evaluation in iteration {iteration}")
                        });
                    }
                }
            }

            if settings.should_log(iteration + 1) {
                log_progress(iteration + 1, samplers, &chains, &timer);
            }
        }

        if settings.log_to_screen {
            info!(
                "Halting: maximum number of iterations ({}) reached",
                settings.max_iterations
            );
        }
        for (chain, samples) in chains.iter().enumerate() {
            debug!("Finished chain {chain} with {} samples", samples.len());
        }

        Ok(Trace {
            chains,
            elapsed: timer.elapsed(),
        })
    }
}

impl<E: Evaluator> Controller<E, AdaptiveCovarianceMcmc<ChaCha8Rng>> {
    /// One adaptive covariance chain per starting point, sharing `seed`.
    pub fn adaptive_covariance<X: AsRef<[f64]>>(
        log_pdf: E,
        starting_points: &[X],
        seed: u64,
        settings: ControllerSettings,
    ) -> Result<Self> {
        let samplers = starting_points
            .iter()
            .enumerate()
            .map(|(chain, x0)| {
                AdaptiveCovarianceMcmc::new(x0.as_ref(), chain_rng(seed, chain as u64))
                    .with_context(|| format!("Invalid starting point for chain {chain}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(log_pdf, samplers, settings)?)
    }
}

impl<E: Evaluator, P: LogPrior + Clone + Send> Controller<E, RejectionAbc<P, ChaCha8Rng>> {
    /// `n_chains` rejection ABC samplers drawing from `prior`.
    pub fn rejection_abc(
        distance: E,
        prior: P,
        threshold: f64,
        n_chains: usize,
        seed: u64,
        settings: ControllerSettings,
    ) -> Result<Self> {
        let samplers = (0..n_chains)
            .map(|chain| {
                RejectionAbc::new(prior.clone(), chain_rng(seed, chain as u64))
                    .and_then(|abc| abc.with_threshold(threshold))
                    .context("Could not create rejection ABC sampler")
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(distance, samplers, settings)?)
    }
}

/// Reject the outstanding proposals of samplers that were asked but will not
/// be told in this round, so that they can be asked again.
fn abandon_round<S: Sampler>(samplers: &mut [S], proposals: &[Vec<Box<[f64]>>]) {
    for (sampler, batch) in samplers.iter_mut().zip(proposals.iter()) {
        let rejected = Evaluation::from_scores(vec![f64::NAN; batch.len()]);
        if let Err(err) = sampler.tell(rejected) {
            debug!("Rejecting pending proposals failed: {err}");
        }
    }
}

/// Score every proposal of a round, chain after chain.
fn evaluate_round<E: Evaluator>(
    evaluator: &E,
    proposals: &[Vec<Box<[f64]>>],
    parallel: bool,
) -> Result<Vec<f64>, E::Error> {
    let score = |position: &Box<[f64]>| match evaluator.evaluate(position) {
        Ok(value) => Ok(value),
        Err(err) if err.is_recoverable() => Ok(f64::NAN),
        Err(err) => Err(err),
    };
    let flat = proposals.iter().flatten().collect_vec();
    if parallel {
        flat.into_par_iter().map(score).collect()
    } else {
        flat.into_iter().map(score).collect()
    }
}

fn log_progress<S: Sampler>(iteration: usize, samplers: &[S], chains: &[Chain], timer: &Timer) {
    let samples = chains.iter().map(|chain| chain.len()).join(" ");
    let elapsed = Timer::format((timer.time() * 100.).round() / 100.);
    let rates = samplers
        .iter()
        .filter_map(|sampler| sampler.acceptance_rate())
        .map(|rate| format!("{rate:.3}"))
        .join(" ");
    if rates.is_empty() {
        info!("Iteration {iteration}: samples [{samples}], {elapsed}");
    } else {
        info!("Iteration {iteration}: samples [{samples}], acceptance [{rates}], {elapsed}");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use rand::Rng;

    use super::*;
    use crate::{
        ask_tell::{Phase, Result as SamplerResult},
        model::{FnEvaluator, LogPosterior},
        toy::{GaussianLogPdf, UniformLogPrior},
    };

    #[derive(Debug, Error)]
    enum TestError {
        #[error("try again")]
        Recoverable,
        #[error("broken")]
        Fatal,
    }

    impl LogpError for TestError {
        fn is_recoverable(&self) -> bool {
            matches!(self, TestError::Recoverable)
        }
    }

    /// Fails on every position whose first coordinate exceeds `limit`.
    struct Failing {
        limit: f64,
        error: fn() -> TestError,
    }

    impl Evaluator for Failing {
        type Error = TestError;

        fn dim(&self) -> usize {
            1
        }

        fn evaluate(&self, position: &[f64]) -> std::result::Result<f64, TestError> {
            if position[0] > self.limit {
                Err((self.error)())
            } else {
                Ok(0.)
            }
        }
    }

    /// Records the initial phase flag seen by every `ask`.
    #[derive(Default)]
    struct Recorder {
        initial_phase: bool,
        flags: Vec<bool>,
        phase: Phase<Box<[f64]>>,
    }

    impl Sampler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn dim(&self) -> usize {
            1
        }

        fn ask(&mut self, _n: usize) -> SamplerResult<Vec<Box<[f64]>>> {
            self.phase.check_ask()?;
            self.flags.push(self.initial_phase);
            let point: Box<[f64]> = vec![self.flags.len() as f64].into();
            self.phase.asked(point.clone());
            Ok(vec![point])
        }

        fn tell(&mut self, _evaluation: Evaluation) -> SamplerResult<Option<Vec<Box<[f64]>>>> {
            let point = self.phase.take_pending()?;
            Ok(Some(vec![point]))
        }

        fn needs_initial_phase(&self) -> bool {
            true
        }

        fn set_initial_phase(&mut self, in_initial_phase: bool) {
            self.initial_phase = in_initial_phase;
        }

        fn in_initial_phase(&self) -> bool {
            self.initial_phase
        }
    }

    fn quiet(max_iterations: usize, initial_phase_iterations: usize) -> ControllerSettings {
        ControllerSettings {
            max_iterations,
            initial_phase_iterations,
            log_to_screen: false,
            ..Default::default()
        }
    }

    #[test]
    fn default_settings() {
        let settings = ControllerSettings::default();
        assert_eq!(settings.max_iterations, 10000);
        assert_eq!(settings.initial_phase_iterations, 200);
        assert!(settings.log_to_screen);
        assert_eq!(settings.log_interval, 500);
        assert_eq!(settings.proposals_per_ask, 1);
        assert!(!settings.parallel);
        assert_eq!(settings.validate(), Ok(()));
    }

    #[test]
    fn settings_validation() {
        assert_eq!(quiet(0, 0).validate(), Err(SettingsError::ZeroIterations));
        assert_eq!(
            quiet(10, 11).validate(),
            Err(SettingsError::InitialPhaseTooLong {
                initial: 11,
                max: 10
            })
        );
        let settings = ControllerSettings {
            proposals_per_ask: 0,
            ..quiet(10, 0)
        };
        assert_eq!(settings.validate(), Err(SettingsError::ZeroProposals));
        let settings = ControllerSettings {
            log_interval: 0,
            ..quiet(10, 0)
        };
        assert_eq!(settings.validate(), Err(SettingsError::ZeroLogInterval));
    }

    #[test]
    fn log_schedule() {
        let settings = ControllerSettings {
            max_iterations: 2345,
            initial_phase_iterations: 300,
            ..Default::default()
        };
        let logged = (1..=2345).filter(|&i| settings.should_log(i)).collect_vec();
        assert_eq!(&logged[..4], &[1, 2, 3, 20]);
        assert!(logged.contains(&300));
        assert!(!logged.contains(&320));
        assert!(logged.contains(&500));
        assert!(logged.contains(&2000));
        assert_eq!(logged.last(), Some(&2345));

        let silent = ControllerSettings {
            log_to_screen: false,
            ..settings
        };
        assert!((1..=2345).all(|i| !silent.should_log(i)));
    }

    #[test]
    fn construction_errors() {
        let evaluator = FnEvaluator::new(1, |x: &[f64]| x[0]);
        let err = Controller::new(&evaluator, Vec::<Recorder>::new(), quiet(5, 0));
        assert!(matches!(err, Err(SettingsError::NoChains)));

        let gaussian = GaussianLogPdf::new(vec![0., 0.], vec![1., 1.]).unwrap();
        let samplers = vec![Recorder::default()];
        assert!(matches!(
            Controller::new(&gaussian, samplers, quiet(5, 0)),
            Err(SettingsError::DimensionMismatch {
                chain: 0,
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn initial_phase_switch() {
        let evaluator = FnEvaluator::new(1, |x: &[f64]| x[0]);
        let samplers = vec![Recorder::default(), Recorder::default()];
        let mut controller = Controller::new(evaluator, samplers, quiet(5, 2)).unwrap();
        let trace = controller.run().unwrap();

        for sampler in controller.samplers() {
            assert_eq!(sampler.flags, vec![true, true, false, false, false]);
            assert!(!sampler.in_initial_phase());
        }
        assert_eq!(trace.chains.len(), 2);
        assert!(trace.chains.iter().all(|chain| chain.len() == 5));
    }

    #[test]
    fn round_robin_evaluation() {
        let calls = AtomicUsize::new(0);
        let evaluator = FnEvaluator::new(1, |x: &[f64]| {
            calls.fetch_add(1, Ordering::Relaxed);
            x[0]
        });
        let samplers = (0..3).map(|_| Recorder::default()).collect_vec();
        let settings = ControllerSettings {
            parallel: true,
            ..quiet(7, 0)
        };
        let mut controller = Controller::new(&evaluator, samplers, settings).unwrap();
        controller.run().unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 21);
        assert!(controller.samplers().iter().all(|s| s.flags.len() == 7));
    }

    #[test]
    fn adaptive_chains_are_reproducible() {
        let gaussian = GaussianLogPdf::new(vec![1., -1.], vec![1., 2.]).unwrap();
        let starts = [[0.5, -0.5], [1.5, -2.]];
        let run = |parallel: bool| {
            let settings = ControllerSettings {
                parallel,
                ..quiet(50, 20)
            };
            Controller::adaptive_covariance(&gaussian, &starts, 7, settings)
                .unwrap()
                .run()
                .unwrap()
        };
        let sequential = run(false);
        let parallel = run(true);
        assert_eq!(sequential.chains, parallel.chains);
        assert!(sequential.chains.iter().all(|chain| chain.len() == 50));
        assert_eq!(&*sequential.chains[0][0], &[0.5, -0.5]);

        let results = sequential.results(None).unwrap();
        assert_eq!(results.n_chains(), 2);
        assert_eq!(results.n_parameters(), 2);
    }

    #[test]
    fn chain_rngs_differ() {
        let mut a = chain_rng(1, 0);
        let mut b = chain_rng(1, 1);
        let mut a2 = chain_rng(1, 0);
        let x: u64 = a.random();
        assert_eq!(x, a2.random::<u64>());
        assert_ne!(x, b.random::<u64>());
    }

    #[test]
    fn recoverable_errors_are_rejected() {
        let prior = UniformLogPrior::new(vec![0.], vec![1.]).unwrap();
        let evaluator = Failing {
            limit: 0.5,
            error: || TestError::Recoverable,
        };
        let settings = ControllerSettings {
            proposals_per_ask: 4,
            ..quiet(20, 0)
        };
        let mut controller =
            Controller::rejection_abc(evaluator, prior, 1., 2, 3, settings).unwrap();
        let trace = controller.run().unwrap();
        for chain in trace.chains.iter() {
            assert!(!chain.is_empty());
            assert!(chain.iter().all(|x| x[0] <= 0.5));
        }
    }

    #[test]
    fn fatal_errors_stop_the_run() {
        let prior = UniformLogPrior::new(vec![0.], vec![1.]).unwrap();
        let evaluator = Failing {
            limit: 0.5,
            error: || TestError::Fatal,
        };
        let settings = ControllerSettings {
            proposals_per_ask: 10,
            ..quiet(100, 0)
        };
        let mut controller =
            Controller::rejection_abc(evaluator, prior, 1., 1, 3, settings).unwrap();
        let err = controller.run().unwrap_err();
        assert!(format!("{err:#}").contains("broken"));
        assert!(err.to_string().starts_with("Evaluation failed in iteration"));
    }

    #[test]
    fn failed_evaluation_releases_all_chains() {
        let evaluator = Failing {
            limit: 0.5,
            error: || TestError::Fatal,
        };
        let samplers = vec![Recorder::default(), Recorder::default(), Recorder::default()];
        let mut controller = Controller::new(evaluator, samplers, quiet(5, 0)).unwrap();
        let err = controller.run().unwrap_err();
        assert!(err.to_string().starts_with("Evaluation failed in iteration 0"));
        for sampler in controller.samplers() {
            assert!(!sampler.phase.is_awaiting_tell());
            assert_eq!(sampler.flags.len(), 1);
        }

        let err = controller.run().unwrap_err();
        assert!(err.to_string().starts_with("Evaluation failed in iteration 0"));
        assert!(controller.samplers().iter().all(|s| s.flags.len() == 2));
    }

    #[test]
    fn failed_tell_releases_later_chains() {
        let likelihood = GaussianLogPdf::new(vec![0.], vec![1.]).unwrap();
        let prior = UniformLogPrior::new(vec![-5.], vec![5.]).unwrap();
        let posterior = LogPosterior::new(likelihood, prior).unwrap();
        let starts = [[9.], [0.5]];
        let mut controller =
            Controller::adaptive_covariance(&posterior, &starts, 0, quiet(10, 5)).unwrap();

        for _ in 0..2 {
            let err = controller.run().unwrap_err();
            assert!(
                err.to_string()
                    .starts_with("Chain 0 rejected its evaluation in iteration 0"),
                "{err:#}"
            );
            for sampler in controller.samplers() {
                assert!(sampler.current_position().is_none());
            }
        }
    }

    #[test]
    fn invalid_threshold() {
        let prior = UniformLogPrior::new(vec![0.], vec![1.]).unwrap();
        let evaluator = FnEvaluator::new(1, |x: &[f64]| x[0]);
        assert!(Controller::rejection_abc(evaluator, prior, -1., 1, 0, quiet(5, 0)).is_err());
    }
}
