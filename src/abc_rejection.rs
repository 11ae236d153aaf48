//! Rejection ABC.
//!
//! Each round draws points from the prior; the caller simulates data for
//! every point and reports the distance to the observed data. Points whose
//! distance is strictly below the threshold are accepted.

use rand::Rng;

use crate::{
    ask_tell::{Evaluation, Phase, Result, Sampler, SamplerError},
    model::LogPrior,
};

pub struct RejectionAbc<P, R> {
    log_prior: P,
    rng: R,
    threshold: f64,
    phase: Phase<Vec<Box<[f64]>>>,
}

impl<P: LogPrior, R: Rng> RejectionAbc<P, R> {
    pub fn new(log_prior: P, rng: R) -> Result<Self> {
        if log_prior.dim() == 0 {
            return Err(SamplerError::ZeroDimension);
        }
        Ok(Self {
            log_prior,
            rng,
            threshold: 1.,
            phase: Phase::AwaitingAsk,
        })
    }

    /// Distances strictly below this value are accepted.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f64) -> Result<()> {
        // NaN fails this check as well
        if !(threshold > 0.) {
            return Err(SamplerError::InvalidThreshold(threshold));
        }
        self.threshold = threshold;
        Ok(())
    }

    pub fn with_threshold(mut self, threshold: f64) -> Result<Self> {
        self.set_threshold(threshold)?;
        Ok(self)
    }

    pub fn log_prior(&self) -> &P {
        &self.log_prior
    }

    fn accepts(&self, distance: f64) -> bool {
        distance < self.threshold
    }
}

impl<P, R> Sampler for RejectionAbc<P, R>
where
    P: LogPrior + Send,
    R: Rng + Send,
{
    fn name(&self) -> &'static str {
        "Rejection ABC"
    }

    fn dim(&self) -> usize {
        self.log_prior.dim()
    }

    fn ask(&mut self, n: usize) -> Result<Vec<Box<[f64]>>> {
        self.phase.check_ask()?;
        if n == 0 {
            return Err(SamplerError::EmptyAsk);
        }
        let proposals = self.log_prior.sample(n, &mut self.rng);
        self.phase.asked(proposals.clone());
        Ok(proposals)
    }

    fn tell(&mut self, evaluation: Evaluation) -> Result<Option<Vec<Box<[f64]>>>> {
        let proposals = self.phase.take_pending()?;
        match evaluation {
            Evaluation::Single(distance) => {
                if self.accepts(distance) {
                    Ok(Some(proposals))
                } else {
                    Ok(None)
                }
            }
            Evaluation::Batch(distances) => {
                if distances.len() != proposals.len() {
                    return Err(SamplerError::EvaluationShape {
                        expected: proposals.len(),
                        got: distances.len(),
                    });
                }
                let accepted: Vec<_> = proposals
                    .into_iter()
                    .zip(distances.iter())
                    .filter(|&(_, &distance)| self.accepts(distance))
                    .map(|(proposal, _)| proposal)
                    .collect();
                if accepted.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(accepted))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rand::{rngs::SmallRng, SeedableRng};

    use super::*;
    use crate::{ask_tell::ProtocolError, toy::UniformLogPrior};

    fn sampler() -> RejectionAbc<UniformLogPrior, SmallRng> {
        let prior = UniformLogPrior::new(vec![0., -1.], vec![1., 1.]).unwrap();
        RejectionAbc::new(prior, SmallRng::seed_from_u64(42)).unwrap()
    }

    #[test]
    fn name_and_defaults() {
        let abc = sampler();
        assert_eq!(abc.name(), "Rejection ABC");
        assert_eq!(abc.threshold(), 1.);
        assert_eq!(abc.dim(), 2);
    }

    #[test]
    fn threshold_validation() {
        let mut abc = sampler();
        abc.set_threshold(0.25).unwrap();
        assert_eq!(abc.threshold(), 0.25);
        for bad in [0., -1., f64::NAN] {
            assert!(matches!(
                abc.set_threshold(bad),
                Err(SamplerError::InvalidThreshold(_))
            ));
            assert_eq!(abc.threshold(), 0.25);
        }
    }

    #[test]
    fn protocol_order() {
        let mut abc = sampler();
        assert!(matches!(
            abc.tell(Evaluation::Single(0.)),
            Err(SamplerError::Protocol(ProtocolError::TellBeforeAsk))
        ));
        abc.ask(3).unwrap();
        assert!(matches!(
            abc.ask(3),
            Err(SamplerError::Protocol(ProtocolError::AskBeforeTell))
        ));
        abc.tell(Evaluation::Single(0.)).unwrap();
        assert!(matches!(
            abc.tell(Evaluation::Single(0.)),
            Err(SamplerError::Protocol(ProtocolError::TellBeforeAsk))
        ));
        assert_eq!(abc.ask(2).unwrap().len(), 2);
    }

    #[test]
    fn single_evaluation_accepts_whole_batch() {
        let mut abc = sampler();
        let proposals = abc.ask(4).unwrap();
        assert_eq!(abc.tell(Evaluation::Single(0.5)).unwrap(), Some(proposals));

        abc.ask(4).unwrap();
        assert_eq!(abc.tell(Evaluation::Single(1.)).unwrap(), None);
    }

    #[test]
    fn batch_evaluation_masks() {
        let mut abc = sampler();
        let proposals = abc.ask(3).unwrap();
        let accepted = abc
            .tell(Evaluation::Batch(vec![0.8, 1.5, 0.3].into()))
            .unwrap()
            .expect("two points are accepted");
        assert_eq!(accepted, vec![proposals[0].clone(), proposals[2].clone()]);

        abc.ask(2).unwrap();
        assert_eq!(abc.tell(vec![1., 2.].into()).unwrap(), None);
    }

    #[test]
    fn batch_shape_mismatch() {
        let mut abc = sampler();
        abc.ask(3).unwrap();
        assert!(matches!(
            abc.tell(vec![0.1, 0.2].into()),
            Err(SamplerError::EvaluationShape {
                expected: 3,
                got: 2
            })
        ));
        // the batch is consumed, the sampler can be asked again
        assert!(abc.ask(1).is_ok());
    }

    #[test]
    fn empty_ask() {
        let mut abc = sampler();
        assert!(matches!(abc.ask(0), Err(SamplerError::EmptyAsk)));
        assert!(abc.ask(1).is_ok());
    }

    proptest! {
        #[test]
        fn single_acceptance_is_strict(threshold in 1e-6f64..1e3, score in -1e3f64..1e3) {
            let mut abc = sampler().with_threshold(threshold).unwrap();
            abc.ask(1).unwrap();
            let accepted = abc.tell(Evaluation::Single(score)).unwrap();
            prop_assert_eq!(accepted.is_some(), score < threshold);

            abc.ask(1).unwrap();
            prop_assert!(abc.tell(Evaluation::Single(threshold)).unwrap().is_none());
        }

        #[test]
        fn batch_acceptance_matches_mask(
            threshold in 0.1f64..2.,
            scores in proptest::collection::vec(0f64..3., 1..20),
        ) {
            let mut abc = sampler().with_threshold(threshold).unwrap();
            let proposals = abc.ask(scores.len()).unwrap();
            let accepted = abc.tell(scores.clone().into()).unwrap();

            let expected: Vec<_> = proposals
                .iter()
                .zip(scores.iter())
                .filter(|(_, &s)| s < threshold)
                .map(|(p, _)| p.clone())
                .collect();
            if expected.is_empty() {
                prop_assert!(accepted.is_none());
            } else {
                prop_assert_eq!(accepted, Some(expected));
            }
        }
    }
}
