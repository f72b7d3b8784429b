use rand::Rng;

/// Transforms a byte buffer in place.
///
/// Mutators work on the engine's scratch buffer directly so a run never
/// allocates a fresh input. `max_len` is a hard upper bound on the result.
pub trait Mutator<R: Rng + ?Sized> {
    fn name(&self) -> &'static str;

    fn mutate(&mut self, input: &mut Vec<u8>, rng: &mut R, max_len: usize)
    -> Result<(), anyhow::Error>;
}

/// Adds a small random value to one byte.
///
/// An empty input first becomes a single zero byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlipSingleByteMutator;

impl<R: Rng + ?Sized> Mutator<R> for FlipSingleByteMutator {
    fn name(&self) -> &'static str {
        "FlipSingleByte"
    }

    fn mutate(
        &mut self,
        input: &mut Vec<u8>,
        rng: &mut R,
        _max_len: usize,
    ) -> Result<(), anyhow::Error> {
        if input.is_empty() {
            input.push(0);
        }
        let random_add_value = rng.random_range(1u8..=15u8);
        let index = rng.random_range(0..input.len());
        input[index] = input[index].wrapping_add(random_add_value);
        Ok(())
    }
}

/// Inserts one random byte; at `max_len` it overwrites one instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct InsertByteMutator;

impl<R: Rng + ?Sized> Mutator<R> for InsertByteMutator {
    fn name(&self) -> &'static str {
        "InsertByte"
    }

    fn mutate(
        &mut self,
        input: &mut Vec<u8>,
        rng: &mut R,
        max_len: usize,
    ) -> Result<(), anyhow::Error> {
        let byte: u8 = rng.random();
        if input.len() >= max_len {
            if input.is_empty() {
                anyhow::bail!("cannot insert into an input capped at {max_len} bytes");
            }
            let index = rng.random_range(0..input.len());
            input[index] = byte;
            return Ok(());
        }
        let index = rng.random_range(0..=input.len());
        input.insert(index, byte);
        Ok(())
    }
}

/// Removes one byte. Inputs of one byte or less are left for other mutators.
#[derive(Debug, Default, Clone, Copy)]
pub struct EraseByteMutator;

impl<R: Rng + ?Sized> Mutator<R> for EraseByteMutator {
    fn name(&self) -> &'static str {
        "EraseByte"
    }

    fn mutate(
        &mut self,
        input: &mut Vec<u8>,
        rng: &mut R,
        _max_len: usize,
    ) -> Result<(), anyhow::Error> {
        if input.len() > 1 {
            let index = rng.random_range(0..input.len());
            input.remove(index);
        }
        Ok(())
    }
}

/// Stacks a random number of randomly chosen mutations.
pub struct HavocMutator<R: Rng + ?Sized> {
    mutators: Vec<Box<dyn Mutator<R> + Send>>,
    max_stack: usize,
}

impl<R: Rng + ?Sized> HavocMutator<R> {
    pub const DEFAULT_MAX_STACK: usize = 4;

    pub fn new(mutators: Vec<Box<dyn Mutator<R> + Send>>, max_stack: usize) -> Self {
        Self {
            mutators,
            max_stack: max_stack.max(1),
        }
    }
}

impl<R: Rng + ?Sized + 'static> Default for HavocMutator<R> {
    /// The byte-level mutators this crate ships.
    fn default() -> Self {
        Self::new(
            vec![
                Box::new(FlipSingleByteMutator),
                Box::new(InsertByteMutator),
                Box::new(EraseByteMutator),
            ],
            Self::DEFAULT_MAX_STACK,
        )
    }
}

impl<R: Rng + ?Sized> Mutator<R> for HavocMutator<R> {
    fn name(&self) -> &'static str {
        "Havoc"
    }

    fn mutate(
        &mut self,
        input: &mut Vec<u8>,
        rng: &mut R,
        max_len: usize,
    ) -> Result<(), anyhow::Error> {
        if self.mutators.is_empty() {
            anyhow::bail!("havoc mutator has no mutators to choose from");
        }
        let rounds = rng.random_range(1..=self.max_stack);
        for _ in 0..rounds {
            let pick = rng.random_range(0..self.mutators.len());
            self.mutators[pick].mutate(input, rng, max_len)?;
        }
        input.truncate(max_len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn flip_single_byte_mutator_mutates_input() {
        let mut mutator = FlipSingleByteMutator;
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);
        let initial: Vec<u8> = vec![10, 20, 30];
        let mut input = initial.clone();

        mutator.mutate(&mut input, &mut rng, 64).unwrap();

        assert_ne!(initial, input, "Mutated input should differ from initial input");
        assert_eq!(input.len(), initial.len());
    }

    #[test]
    fn flip_single_byte_mutator_handles_empty_input() {
        let mut mutator = FlipSingleByteMutator;
        let mut rng = ChaCha8Rng::from_seed([1u8; 32]);
        let mut input = Vec::new();
        mutator.mutate(&mut input, &mut rng, 64).unwrap();
        assert_eq!(input.len(), 1);
        assert_ne!(input[0], 0);
    }

    #[test]
    fn insert_byte_grows_until_the_cap() {
        let mut mutator = InsertByteMutator;
        let mut rng = ChaCha8Rng::from_seed([2u8; 32]);
        let mut input = vec![7u8];
        mutator.mutate(&mut input, &mut rng, 2).unwrap();
        assert_eq!(input.len(), 2);
        mutator.mutate(&mut input, &mut rng, 2).unwrap();
        assert_eq!(input.len(), 2);
    }

    #[test]
    fn insert_byte_with_zero_cap_fails() {
        let mut mutator = InsertByteMutator;
        let mut rng = ChaCha8Rng::from_seed([3u8; 32]);
        let mut input = Vec::new();
        assert!(mutator.mutate(&mut input, &mut rng, 0).is_err());
    }

    #[test]
    fn erase_byte_keeps_at_least_one_byte() {
        let mut mutator = EraseByteMutator;
        let mut rng = ChaCha8Rng::from_seed([4u8; 32]);
        let mut input = vec![1u8, 2, 3];
        mutator.mutate(&mut input, &mut rng, 64).unwrap();
        assert_eq!(input.len(), 2);
        mutator.mutate(&mut input, &mut rng, 64).unwrap();
        mutator.mutate(&mut input, &mut rng, 64).unwrap();
        assert_eq!(input.len(), 1);
    }

    #[test]
    fn havoc_respects_max_len() {
        let mut mutator: HavocMutator<ChaCha8Rng> = HavocMutator::default();
        let mut rng = ChaCha8Rng::from_seed([5u8; 32]);
        let mut input = vec![0xAAu8; 8];
        for _ in 0..200 {
            mutator.mutate(&mut input, &mut rng, 8).unwrap();
            assert!(input.len() <= 8);
        }
    }

    #[test]
    fn havoc_without_mutators_is_an_error() {
        let mut mutator: HavocMutator<ChaCha8Rng> = HavocMutator::new(Vec::new(), 2);
        let mut rng = ChaCha8Rng::from_seed([6u8; 32]);
        assert!(mutator.mutate(&mut Vec::new(), &mut rng, 8).is_err());
    }
}
