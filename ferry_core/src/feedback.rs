use crate::corpus::{Corpus, EntryOrigin};
use crate::input::Input;
use std::collections::HashSet;
use thiserror::Error;

/// Errors that can occur while recording an interesting input.
#[derive(Error, Debug)]
pub enum FeedbackError {
    /// Wraps an error the corpus raised while the input was being added.
    #[error("Corpus operation failed within feedback: {0}")]
    CorpusInteractionError(#[from] crate::corpus::CorpusError),
}

/// Decides which executed inputs are worth keeping.
pub trait Feedback<I: Input>: Send {
    /// A short, human-readable name used in logs.
    fn name(&self) -> &'static str;

    /// Seeds the feedback with inputs already in the corpus.
    ///
    /// # Arguments
    /// * `corpus`: The corpus after the seed pass loaded it.
    fn init(&mut self, corpus: &dyn Corpus<I>);

    /// Whether `input`, which just ran without a finding, is worth keeping.
    ///
    /// # Arguments
    /// * `input`: The executed input.
    ///
    /// # Returns
    /// `true` when the input is new to this feedback.
    fn is_interesting(&self, input: &I) -> bool;

    /// Adds `input` to the corpus unless an equal one is already known.
    ///
    /// # Arguments
    /// * `input`: The input judged interesting.
    /// * `run`: The run number it was produced in, kept as its origin.
    /// * `corpus`: The corpus to add it to.
    ///
    /// # Returns
    /// Whether the input was added, or a `FeedbackError` if the corpus failed.
    fn report_interesting(
        &mut self,
        input: I,
        run: u64,
        corpus: &mut dyn Corpus<I>,
    ) -> Result<bool, FeedbackError>;
}

/// Keeps every input whose contents were not seen before, by md5 digest.
#[derive(Default, Debug)]
pub struct UniqueInputFeedback {
    known_hashes: HashSet<[u8; 16]>,
}

impl UniqueInputFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct inputs seen so far.
    pub fn known(&self) -> usize {
        self.known_hashes.len()
    }
}

impl<I: Input> Feedback<I> for UniqueInputFeedback {
    fn name(&self) -> &'static str {
        "UniqueInputFeedback"
    }

    fn init(&mut self, corpus: &dyn Corpus<I>) {
        for id in 0..corpus.len() {
            if let Some(input) = corpus.get(id) {
                self.known_hashes.insert(md5::compute(input.as_bytes()).0);
            }
        }
    }

    fn is_interesting(&self, input: &I) -> bool {
        !self
            .known_hashes
            .contains(&md5::compute(input.as_bytes()).0)
    }

    fn report_interesting(
        &mut self,
        input: I,
        run: u64,
        corpus: &mut dyn Corpus<I>,
    ) -> Result<bool, FeedbackError> {
        let hash = md5::compute(input.as_bytes());
        if !self.known_hashes.insert(hash.0) {
            return Ok(false);
        }
        corpus.add(input, EntryOrigin::Discovered { run })?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::InMemoryCorpus;

    #[test]
    fn unique_input_feedback_works() {
        let mut feedback = UniqueInputFeedback::new();
        let mut corpus: InMemoryCorpus<Vec<u8>> = InMemoryCorpus::new();

        Feedback::<Vec<u8>>::init(&mut feedback, &corpus);

        let input1: Vec<u8> = vec![1, 2, 3];
        assert!(feedback.is_interesting(&input1));
        assert!(
            feedback
                .report_interesting(input1.clone(), 1, &mut corpus)
                .unwrap()
        );
        assert_eq!(corpus.len(), 1);
        assert!(!feedback.is_interesting(&input1));

        let input2: Vec<u8> = vec![4, 5, 6];
        assert!(feedback.is_interesting(&input2));
        feedback
            .report_interesting(input2.clone(), 2, &mut corpus)
            .unwrap();
        assert_eq!(corpus.len(), 2);

        assert!(
            !feedback
                .report_interesting(input1.clone(), 3, &mut corpus)
                .unwrap()
        );
        assert_eq!(corpus.len(), 2);
    }

    #[test]
    fn init_learns_the_seed_corpus() {
        let mut corpus: InMemoryCorpus<Vec<u8>> = InMemoryCorpus::new();
        corpus.add(b"seed".to_vec(), EntryOrigin::Empty).unwrap();
        let mut feedback = UniqueInputFeedback::new();
        Feedback::<Vec<u8>>::init(&mut feedback, &corpus);
        assert_eq!(feedback.known(), 1);
        assert!(!feedback.is_interesting(&b"seed".to_vec()));
    }
}
