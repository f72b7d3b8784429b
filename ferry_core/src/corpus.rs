use crate::input::Input;
use rand_core::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors the built-in engine's corpus can raise.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// No entry exists at the given ID.
    #[error("Input ID {0} not found in corpus")]
    InputNotFound(usize),

    /// An operation needed at least one entry.
    #[error("Corpus is empty, cannot select an input")]
    CorpusIsEmpty,

    /// A corpus directory given on the command line does not exist.
    #[error("The required corpus directory {0:?} does not exist")]
    MissingDirectory(PathBuf),

    /// Reading a seed or writing a discovered entry failed.
    #[error("Corpus I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CorpusError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        CorpusError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Where a corpus entry came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOrigin {
    /// Loaded from a seed file.
    Seed(PathBuf),
    /// The empty input the engine starts from when no seeds exist.
    Empty,
    /// Produced by mutation and kept because feedback found it new.
    Discovered { run: u64 },
}

/// A collection of inputs the engine mutates from.
pub trait Corpus<I: Input>: Send {
    /// Appends an entry.
    ///
    /// # Arguments
    /// * `input`: The input to store.
    /// * `origin`: Where it came from.
    ///
    /// # Returns
    /// The ID of the new entry, or a `CorpusError` if persisting it failed.
    fn add(&mut self, input: I, origin: EntryOrigin) -> Result<usize, CorpusError>;

    /// The input stored at `id`, if any.
    fn get(&self, id: usize) -> Option<&I>;

    /// Where the entry at `id` came from, if it exists.
    fn origin(&self, id: usize) -> Option<&EntryOrigin>;

    /// Uniformly picks an entry.
    ///
    /// # Arguments
    /// * `rng`: The generator to draw the index from.
    ///
    /// # Returns
    /// The chosen ID and input, or `None` when the corpus is empty.
    fn random_select(&self, rng: &mut dyn RngCore) -> Option<(usize, &I)>;

    /// Number of entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads every regular file directly inside each directory (or each
    /// path that is itself a file). Files are taken in name order.
    ///
    /// # Arguments
    /// * `seed_paths`: Directories or files given on the command line.
    ///
    /// # Returns
    /// How many seeds were added, or `CorpusError::MissingDirectory` for a
    /// path that does not exist.
    fn load_initial_seeds(&mut self, seed_paths: &[PathBuf]) -> Result<usize, CorpusError>;
}

/// Keeps entries in memory. Optionally mirrors newly discovered inputs into
/// an output directory, named by their md5 digest.
#[derive(Debug)]
pub struct InMemoryCorpus<I: Input> {
    entries: Vec<(I, EntryOrigin)>,
    output_dir: Option<PathBuf>,
}

impl<I: Input> InMemoryCorpus<I> {
    /// Creates an empty corpus that keeps discoveries in memory only.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            output_dir: None,
        }
    }

    /// Discovered entries are also written to `dir`.
    pub fn with_output_dir(dir: PathBuf) -> Self {
        Self {
            entries: Vec::new(),
            output_dir: Some(dir),
        }
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    fn persist(&self, input: &I) -> Result<(), CorpusError> {
        let Some(dir) = &self.output_dir else {
            return Ok(());
        };
        let path = dir.join(format!("{:x}", md5::compute(input.as_bytes())));
        if path.exists() {
            return Ok(());
        }
        fs::write(&path, input.as_bytes()).map_err(|e| CorpusError::io(&path, e))?;
        debug!("Wrote new corpus entry {:?}", path);
        Ok(())
    }
}

impl<I: Input> Default for InMemoryCorpus<I> {
    fn default() -> Self {
        Self::new()
    }
}

fn files_in(path: &Path) -> Result<Vec<PathBuf>, CorpusError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(CorpusError::MissingDirectory(path.to_path_buf()));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(path).map_err(|e| CorpusError::io(path, e))? {
        let entry = entry.map_err(|e| CorpusError::io(path, e))?;
        let file_path = entry.path();
        if file_path.is_file() {
            files.push(file_path);
        }
    }
    files.sort();
    Ok(files)
}

impl<I: Input + From<Vec<u8>>> Corpus<I> for InMemoryCorpus<I> {
    fn add(&mut self, input: I, origin: EntryOrigin) -> Result<usize, CorpusError> {
        if matches!(origin, EntryOrigin::Discovered { .. }) {
            self.persist(&input)?;
        }
        let id = self.entries.len();
        self.entries.push((input, origin));
        Ok(id)
    }

    fn get(&self, id: usize) -> Option<&I> {
        self.entries.get(id).map(|(input, _)| input)
    }

    fn origin(&self, id: usize) -> Option<&EntryOrigin> {
        self.entries.get(id).map(|(_, origin)| origin)
    }

    fn random_select(&self, rng: &mut dyn RngCore) -> Option<(usize, &I)> {
        if self.is_empty() {
            return None;
        }
        let index = rng.next_u64() as usize % self.entries.len();
        self.entries.get(index).map(|(input, _)| (index, input))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn load_initial_seeds(&mut self, seed_paths: &[PathBuf]) -> Result<usize, CorpusError> {
        let mut loaded_count = 0;
        for seed_path in seed_paths {
            for file_path in files_in(seed_path)? {
                let bytes = match fs::read(&file_path) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Skipping unreadable seed {:?}: {}", file_path, e);
                        continue;
                    }
                };
                self.add(I::from(bytes), EntryOrigin::Seed(file_path))?;
                loaded_count += 1;
            }
        }
        Ok(loaded_count)
    }
}
