use crate::corpus::Corpus;
use crate::input::Input;
use rand_core::RngCore;
use thiserror::Error;

/// Errors that can occur while picking the next input.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The corpus holds no entries, so there is nothing to schedule.
    #[error("Corpus is empty, cannot schedule next input")]
    CorpusEmpty,
    /// Wraps an error raised by the corpus while the scheduler consulted it.
    #[error("Corpus interaction failed within scheduler: {0}")]
    CorpusInteractionError(#[from] crate::corpus::CorpusError),
}

/// Picks the corpus entry the next mutation starts from.
///
/// Implementations may keep per-entry state and use the feedback reported
/// after each run to weigh future picks.
pub trait Scheduler<I: Input>: Send {
    /// Selects the ID of the entry the next mutation starts from.
    ///
    /// # Arguments
    /// * `corpus`: The corpus to pick from.
    /// * `rng`: The engine's seeded generator, so runs stay reproducible.
    ///
    /// # Returns
    /// The index of the selected entry, or `SchedulerError::CorpusEmpty` when
    /// there is nothing to pick.
    fn next(&mut self, corpus: &dyn Corpus<I>, rng: &mut dyn RngCore)
    -> Result<usize, SchedulerError>;

    /// Reports how the mutant derived from a previously selected entry fared.
    ///
    /// # Arguments
    /// * `input_id`: The ID returned by the `next` call the mutant came from.
    /// * `interesting`: Whether feedback kept the mutant in the corpus.
    fn report_feedback(&mut self, input_id: usize, interesting: bool);
}

/// Uniform selection; feedback is only counted.
#[derive(Default, Debug)]
pub struct RandomScheduler {
    productive: u64,
}

impl RandomScheduler {
    /// Creates a scheduler with no productive selections recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many selections produced a kept mutant.
    pub fn productive(&self) -> u64 {
        self.productive
    }
}

impl<I: Input> Scheduler<I> for RandomScheduler {
    fn next(
        &mut self,
        corpus: &dyn Corpus<I>,
        rng: &mut dyn RngCore,
    ) -> Result<usize, SchedulerError> {
        corpus
            .random_select(rng)
            .map(|(id, _)| id)
            .ok_or(SchedulerError::CorpusEmpty)
    }

    fn report_feedback(&mut self, _input_id: usize, interesting: bool) {
        if interesting {
            self.productive += 1;
        }
    }
}
