//! Built-in driving loops.
//!
//! [`MutationEngine`] is a small libFuzzer-style loop: seed pass, then
//! havoc mutation over an in-memory corpus. [`ReplayEngine`] feeds a fixed
//! list of inputs, for regression runs.

use crate::corpus::{Corpus, EntryOrigin, InMemoryCorpus};
use crate::driver::{
    CrashReporter, DriverError, DriverExit, DrivingLoop, FatalSignalHook, Verdict,
};
use crate::fatal_artifact;
use crate::feedback::{Feedback, UniqueInputFeedback};
use crate::mutator::{HavocMutator, Mutator};
use crate::scheduler::{RandomScheduler, Scheduler};
use parking_lot::Mutex;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DEFAULT_MAX_LEN: usize = 4096;
const HEX_DUMP_LIMIT: usize = 256;

/// Options understood by the built-in engines, in `-flag=value` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Mutation runs after the seed pass; `None` runs until stopped.
    pub runs: Option<u64>,
    /// RNG seed; 0 picks a random one.
    pub seed: u64,
    pub max_len: usize,
    /// Inputs slower than this are reported. `-timeout=0` disables it.
    pub slow_unit: Option<Duration>,
    pub artifact_prefix: Option<String>,
    pub corpus_dirs: Vec<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            runs: None,
            seed: 0,
            max_len: DEFAULT_MAX_LEN,
            slow_unit: None,
            artifact_prefix: None,
            corpus_dirs: Vec::new(),
        }
    }
}

fn invalid(flag: &str, reason: impl Into<String>) -> DriverError {
    DriverError::InvalidOption {
        flag: flag.to_string(),
        reason: reason.into(),
    }
}

fn parse_number<T>(flag: &str, value: &str) -> Result<T, DriverError>
where
    T: FromStr,
    T::Err: Display,
{
    value.parse().map_err(|e: T::Err| invalid(flag, e.to_string()))
}

impl EngineOptions {
    /// Later occurrences of a flag override earlier ones.
    pub fn parse(args: &[String]) -> Result<Self, DriverError> {
        let mut options = Self::default();
        for arg in args {
            let Some(flag) = arg.strip_prefix('-') else {
                options.corpus_dirs.push(PathBuf::from(arg));
                continue;
            };
            let Some((name, value)) = flag.split_once('=') else {
                return Err(invalid(arg, "expected -flag=value"));
            };
            match name {
                "runs" => {
                    let runs: i64 = parse_number(arg, value)?;
                    options.runs = u64::try_from(runs).ok();
                }
                "seed" => options.seed = parse_number(arg, value)?,
                "max_len" => {
                    let max_len: usize = parse_number(arg, value)?;
                    if max_len == 0 {
                        return Err(invalid(arg, "must be positive"));
                    }
                    options.max_len = max_len;
                }
                "timeout" => {
                    let secs: u64 = parse_number(arg, value)?;
                    options.slow_unit = (secs > 0).then(|| Duration::from_secs(secs));
                }
                "artifact_prefix" => options.artifact_prefix = Some(value.to_string()),
                handle if handle.starts_with("handle_") => {
                    debug!("Ignoring {arg}: signals are handled by the bridge");
                }
                _ => warn!("Ignoring unknown fuzzer option {arg}"),
            }
        }
        Ok(options)
    }
}

fn artifact_path(prefix: &str, bytes: &[u8]) -> PathBuf {
    PathBuf::from(format!("{prefix}crash-{:x}", md5::compute(bytes)))
}

fn hex_dump(bytes: &[u8]) -> String {
    let mut out: String = bytes
        .iter()
        .take(HEX_DUMP_LIMIT)
        .map(|b| format!("0x{b:02x},"))
        .collect();
    if bytes.len() > HEX_DUMP_LIMIT {
        out.push_str("...");
    }
    out
}

#[derive(Debug, Default)]
struct LastInput {
    bytes: Vec<u8>,
    /// What `bytes` held before the latest `record`.
    previous: Vec<u8>,
    artifact_prefix: Option<String>,
    /// Also keep a copy the fatal-signal hook can reach.
    mirror_for_fatal: bool,
}

/// Remembers the most recent input so it can be dumped when the process is
/// stopped.
#[derive(Debug, Clone, Default)]
pub struct LastInputReporter {
    inner: Arc<Mutex<LastInput>>,
}

impl LastInputReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, bytes: &[u8]) {
        let mut last = self.inner.lock();
        let last = &mut *last;
        std::mem::swap(&mut last.bytes, &mut last.previous);
        last.bytes.clear();
        last.bytes.extend_from_slice(bytes);
        if last.mirror_for_fatal {
            fatal_artifact::record(&last.bytes);
        }
    }

    /// Undoes the latest `record`, for an input the target never saw.
    pub fn forget_last(&self) {
        let mut last = self.inner.lock();
        let last = &mut *last;
        std::mem::swap(&mut last.bytes, &mut last.previous);
        last.previous.clear();
        if last.mirror_for_fatal {
            fatal_artifact::record(&last.bytes);
        }
    }

    pub fn set_artifact_prefix(&self, prefix: Option<String>) {
        self.inner.lock().artifact_prefix = prefix;
    }

    /// Reserves signal-safe storage so a fatal signal can still write
    /// `<prefix>crash-<md5>`. Returns whether that storage is in place.
    fn arm_fatal_artifact(&self, max_len: usize) -> bool {
        let mut last = self.inner.lock();
        last.mirror_for_fatal = match &last.artifact_prefix {
            Some(prefix) => {
                let armed = fatal_artifact::arm(prefix, max_len);
                if !armed {
                    warn!("Cannot keep a crash artifact for fatal signals with prefix {prefix:?}");
                }
                armed
            }
            None => {
                fatal_artifact::disarm();
                false
            }
        };
        last.mirror_for_fatal
    }

    pub fn last_input(&self) -> Vec<u8> {
        self.inner.lock().bytes.clone()
    }

    /// Writes `<prefix>crash-<md5>`; `Ok(None)` when no prefix is set.
    pub fn write_artifact(&self) -> io::Result<Option<PathBuf>> {
        let last = self.inner.lock();
        let Some(prefix) = &last.artifact_prefix else {
            return Ok(None);
        };
        let path = artifact_path(prefix, &last.bytes);
        fs::write(&path, &last.bytes)?;
        Ok(Some(path))
    }
}

impl CrashReporter for LastInputReporter {
    fn dump_crashing_input(&self) {
        let bytes = self.last_input();
        eprintln!(
            "==ferry== Crashing input ({} bytes): {}",
            bytes.len(),
            hex_dump(&bytes)
        );
        match self.write_artifact() {
            Ok(Some(path)) => eprintln!("==ferry== Test unit written to {}", path.display()),
            Ok(None) => {}
            Err(e) => eprintln!("==ferry== Failed to write crash artifact: {e}"),
        }
    }
}

fn run_one(
    input: &[u8],
    last: &LastInputReporter,
    slow_unit: Option<Duration>,
    target: &mut dyn FnMut(&[u8]) -> Verdict,
) -> Verdict {
    last.record(input);
    let started = Instant::now();
    let verdict = target(input);
    if verdict == Verdict::Declined {
        last.forget_last();
        return verdict;
    }
    let elapsed = started.elapsed();
    if slow_unit.is_some_and(|limit| elapsed > limit) {
        warn!(
            "Slow unit: {} ms for a {}-byte input",
            elapsed.as_millis(),
            input.len()
        );
    }
    verdict
}

/// Mutation-based driving loop over an in-memory corpus.
pub struct MutationEngine {
    options: EngineOptions,
    scheduler: RandomScheduler,
    feedback: UniqueInputFeedback,
    mutator: HavocMutator<ChaCha8Rng>,
    scratch: Vec<u8>,
    reporter: LastInputReporter,
    runs_done: u64,
    fatal_artifact: bool,
}

impl MutationEngine {
    pub fn new() -> Self {
        Self {
            options: EngineOptions::default(),
            scheduler: RandomScheduler::new(),
            feedback: UniqueInputFeedback::new(),
            mutator: HavocMutator::default(),
            scratch: Vec::new(),
            reporter: LastInputReporter::new(),
            runs_done: 0,
            fatal_artifact: false,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Total target calls made by the last `drive`, seeds included.
    pub fn runs_done(&self) -> u64 {
        self.runs_done
    }

    /// Only a target failure leaves a crash artifact behind.
    fn finish(&self, verdict: Verdict) -> DriverExit {
        if verdict == Verdict::Stop {
            match self.reporter.write_artifact() {
                Ok(Some(path)) => info!("Wrote crashing input to {}", path.display()),
                Ok(None) => {}
                Err(e) => warn!("Could not write crash artifact: {e}"),
            }
        } else {
            info!("Stop requested after {} runs", self.runs_done);
        }
        DriverExit::after(verdict)
    }
}

impl Default for MutationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DrivingLoop for MutationEngine {
    fn prepare(&mut self, args: &[String]) -> Result<(), DriverError> {
        self.options = EngineOptions::parse(args)?;
        self.reporter
            .set_artifact_prefix(self.options.artifact_prefix.clone());
        self.fatal_artifact = self.reporter.arm_fatal_artifact(self.options.max_len);
        Ok(())
    }

    fn drive(
        &mut self,
        target: &mut dyn FnMut(&[u8]) -> Verdict,
    ) -> Result<DriverExit, DriverError> {
        let seed = match self.options.seed {
            0 => rand::random::<u64>(),
            seed => seed,
        };
        info!("Running with seed {seed}");
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let max_len = self.options.max_len;
        let slow_unit = self.options.slow_unit;

        let mut corpus: InMemoryCorpus<Vec<u8>> = match self.options.corpus_dirs.first() {
            Some(dir) => InMemoryCorpus::with_output_dir(dir.clone()),
            None => InMemoryCorpus::new(),
        };
        let loaded = corpus.load_initial_seeds(&self.options.corpus_dirs)?;
        if corpus.is_empty() {
            info!("No seed inputs found, starting from an empty input");
            corpus.add(Vec::new(), EntryOrigin::Empty)?;
        } else {
            info!("Loaded {loaded} seed inputs");
        }
        Feedback::<Vec<u8>>::init(&mut self.feedback, &corpus);
        self.runs_done = 0;

        for id in 0..corpus.len() {
            let seed_input = corpus.get(id).ok_or(crate::corpus::CorpusError::InputNotFound(id))?;
            self.scratch.clear();
            self.scratch
                .extend_from_slice(&seed_input[..seed_input.len().min(max_len)]);
            self.runs_done += 1;
            let verdict = run_one(&self.scratch, &self.reporter, slow_unit, target);
            if verdict.ends_loop() {
                return Ok(self.finish(verdict));
            }
        }
        debug!("Seed pass done after {} runs", self.runs_done);

        let mut mutation_runs = 0u64;
        while self.options.runs.is_none_or(|runs| mutation_runs < runs) {
            let id = Scheduler::<Vec<u8>>::next(&mut self.scheduler, &corpus, &mut rng)?;
            let base = corpus.get(id).ok_or(crate::corpus::CorpusError::InputNotFound(id))?;
            self.scratch.clear();
            self.scratch.extend_from_slice(base);
            self.mutator
                .mutate(&mut self.scratch, &mut rng, max_len)
                .map_err(DriverError::Mutation)?;

            mutation_runs += 1;
            self.runs_done += 1;
            let verdict = run_one(&self.scratch, &self.reporter, slow_unit, target);
            if verdict.ends_loop() {
                return Ok(self.finish(verdict));
            }

            let interesting = self.feedback.is_interesting(&self.scratch);
            if interesting {
                self.feedback
                    .report_interesting(self.scratch.clone(), self.runs_done, &mut corpus)?;
            }
            Scheduler::<Vec<u8>>::report_feedback(&mut self.scheduler, id, interesting);
        }

        info!(
            "Done {} runs, corpus holds {} inputs",
            self.runs_done,
            corpus.len()
        );
        Ok(DriverExit::exhausted())
    }

    fn crash_reporter(&self) -> Arc<dyn CrashReporter> {
        Arc::new(self.reporter.clone())
    }

    fn fatal_signal_hook(&self) -> Option<FatalSignalHook> {
        self.fatal_artifact.then(fatal_artifact::hook)
    }
}

/// Feeds a fixed list of inputs, in order, through one reused buffer.
pub struct ReplayEngine {
    inputs: Vec<Vec<u8>>,
    scratch: Vec<u8>,
    reporter: LastInputReporter,
    verdicts: Arc<Mutex<Vec<Verdict>>>,
}

impl ReplayEngine {
    pub fn new<I, B>(inputs: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            scratch: Vec::new(),
            reporter: LastInputReporter::new(),
            verdicts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every verdict the loop has received so far, shared with the caller.
    pub fn verdict_log(&self) -> Arc<Mutex<Vec<Verdict>>> {
        Arc::clone(&self.verdicts)
    }
}

impl DrivingLoop for ReplayEngine {
    fn prepare(&mut self, args: &[String]) -> Result<(), DriverError> {
        let options = EngineOptions::parse(args)?;
        self.reporter.set_artifact_prefix(options.artifact_prefix);
        Ok(())
    }

    fn drive(
        &mut self,
        target: &mut dyn FnMut(&[u8]) -> Verdict,
    ) -> Result<DriverExit, DriverError> {
        for input in &self.inputs {
            self.scratch.clear();
            self.scratch.extend_from_slice(input);
            let verdict = run_one(&self.scratch, &self.reporter, None, target);
            self.verdicts.lock().push(verdict);
            if verdict.ends_loop() {
                return Ok(DriverExit::after(verdict));
            }
        }
        Ok(DriverExit::exhausted())
    }

    fn crash_reporter(&self) -> Arc<dyn CrashReporter> {
        Arc::new(self.reporter.clone())
    }
}
