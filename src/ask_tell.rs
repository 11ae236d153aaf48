use thiserror::Error;

/// `ask` and `tell` were called out of turn.
///
/// This is always a bug in the caller and is never retried.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("ask called before tell")]
    AskBeforeTell,
    #[error("tell called before ask")]
    TellBeforeAsk,
}

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("threshold must be positive, got {0}")]
    InvalidThreshold(f64),
    #[error("at least one proposal must be requested")]
    EmptyAsk,
    #[error("expected {expected} evaluations, got {got}")]
    EvaluationShape { expected: usize, got: usize },
    #[error("expected a vector of dimension {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("position contains non-finite values")]
    NonFinitePosition,
    #[error("initial point for MCMC must have finite log-density, got {0}")]
    NonFiniteInitialLogp(f64),
    #[error("proposal covariance must be {dim} x {dim}, got {rows} x {cols}")]
    CovarianceShape { dim: usize, rows: usize, cols: usize },
    #[error("proposal covariance must be finite and symmetric")]
    InvalidCovariance,
    #[error("sampler dimension must be positive")]
    ZeroDimension,
    #[error("{name} must be in {range}, got {value}")]
    InvalidOption {
        name: &'static str,
        range: &'static str,
        value: f64,
    },
}

pub type Result<T> = std::result::Result<T, SamplerError>;

/// Evaluation result for the proposals of the most recent `ask`.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// One score for the whole batch. Use this for single-proposal samplers.
    Single(f64),
    /// One score per proposal, in the order the proposals were returned.
    Batch(Box<[f64]>),
}

impl Evaluation {
    /// The natural shape for `scores`: a single score for a single
    /// proposal, a batch otherwise.
    pub fn from_scores(scores: Vec<f64>) -> Self {
        match scores.as_slice() {
            &[score] => Evaluation::Single(score),
            _ => Evaluation::Batch(scores.into()),
        }
    }
}

impl From<f64> for Evaluation {
    fn from(value: f64) -> Self {
        Evaluation::Single(value)
    }
}

impl From<Vec<f64>> for Evaluation {
    fn from(value: Vec<f64>) -> Self {
        Evaluation::Batch(value.into())
    }
}

/// A sampling algorithm driven through the ask-tell protocol.
///
/// `ask` hands out proposals, the caller evaluates them however it likes
/// (sequentially, in batches, on other threads) and gives the scores back with
/// `tell`. Calls must alternate, starting with `ask`.
pub trait Sampler: Send {
    /// A stable human-readable name of the algorithm.
    fn name(&self) -> &'static str;

    /// The number of parameters of each proposal.
    fn dim(&self) -> usize;

    /// Propose up to `n` points for evaluation.
    fn ask(&mut self, n: usize) -> Result<Vec<Box<[f64]>>>;

    /// Report the evaluation of the most recent proposals.
    ///
    /// `None` means that nothing was accepted in this round. Accepted batches
    /// are never empty.
    fn tell(&mut self, evaluation: Evaluation) -> Result<Option<Vec<Box<[f64]>>>>;

    /// Whether the algorithm adapts itself during an initial phase.
    fn needs_initial_phase(&self) -> bool {
        false
    }

    /// Switch the initial (adaptation) phase on or off.
    fn set_initial_phase(&mut self, _in_initial_phase: bool) {}

    fn in_initial_phase(&self) -> bool {
        false
    }

    /// Fraction of accepted proposals so far, if the algorithm tracks it.
    fn acceptance_rate(&self) -> Option<f64> {
        None
    }
}

impl<S: Sampler + ?Sized> Sampler for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn ask(&mut self, n: usize) -> Result<Vec<Box<[f64]>>> {
        (**self).ask(n)
    }

    fn tell(&mut self, evaluation: Evaluation) -> Result<Option<Vec<Box<[f64]>>>> {
        (**self).tell(evaluation)
    }

    fn needs_initial_phase(&self) -> bool {
        (**self).needs_initial_phase()
    }

    fn set_initial_phase(&mut self, in_initial_phase: bool) {
        (**self).set_initial_phase(in_initial_phase)
    }

    fn in_initial_phase(&self) -> bool {
        (**self).in_initial_phase()
    }

    fn acceptance_rate(&self) -> Option<f64> {
        (**self).acceptance_rate()
    }
}

/// Protocol state shared by all samplers.
///
/// While waiting for `tell`, the state owns the proposals that were handed
/// out so that the scores can be matched back to them.
#[derive(Debug, Default)]
pub(crate) enum Phase<P> {
    #[default]
    AwaitingAsk,
    AwaitingTell(P),
}

impl<P> Phase<P> {
    /// Fails without touching the state if a `tell` is outstanding.
    pub(crate) fn check_ask(&self) -> std::result::Result<(), ProtocolError> {
        match self {
            Phase::AwaitingAsk => Ok(()),
            Phase::AwaitingTell(_) => Err(ProtocolError::AskBeforeTell),
        }
    }

    pub(crate) fn asked(&mut self, pending: P) {
        debug_assert!(matches!(self, Phase::AwaitingAsk));
        *self = Phase::AwaitingTell(pending);
    }

    /// Return to `AwaitingAsk`, handing back what `ask` stored.
    pub(crate) fn take_pending(&mut self) -> std::result::Result<P, ProtocolError> {
        match std::mem::take(self) {
            Phase::AwaitingTell(pending) => Ok(pending),
            Phase::AwaitingAsk => Err(ProtocolError::TellBeforeAsk),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_awaiting_tell(&self) -> bool {
        matches!(self, Phase::AwaitingTell(_))
    }
}
