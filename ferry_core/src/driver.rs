//! Contract with the input-generating driving loop, plus the process exit
//! codes the bridge uses when it has to end the process itself.

use std::io::Write;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

/// Normal termination.
pub const EXIT_OK: i32 = 0;
/// Default code for an explicit stop after a finding.
pub const EXIT_ERROR: i32 = 77;
/// A bridge invariant broke (host gone, queue delivery failed, ...).
pub const EXIT_INTEROP_FAILURE: i32 = 70;
/// A fatal hardware fault was caught inside the fuzz target.
pub const EXIT_FATAL_SIGNAL: i32 = 139;

/// What the driving loop should do after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// The target failed on this input. Unwind the loop and keep the input
    /// as a finding.
    Stop,
    /// A stop was requested after the target ran this input. Unwind the
    /// loop; the input is not a finding.
    Interrupted,
    /// A stop was requested before the input reached the target. Unwind the
    /// loop and forget the input.
    Declined,
}

impl Verdict {
    /// Whether the loop must not call the target again.
    pub fn ends_loop(self) -> bool {
        self != Verdict::Continue
    }
}

/// Why the driving loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Every input the loop wanted to run was run.
    Exhausted,
    /// A [`Verdict::Stop`] ended the loop.
    TargetFailed,
    /// A [`Verdict::Interrupted`] or [`Verdict::Declined`] ended the loop.
    Interrupted,
}

/// How the driving loop finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverExit {
    pub code: i32,
    pub kind: ExitKind,
}

impl DriverExit {
    pub fn exhausted() -> Self {
        Self {
            code: EXIT_OK,
            kind: ExitKind::Exhausted,
        }
    }

    pub fn target_failed() -> Self {
        Self {
            code: EXIT_ERROR,
            kind: ExitKind::TargetFailed,
        }
    }

    pub fn interrupted() -> Self {
        Self {
            code: EXIT_OK,
            kind: ExitKind::Interrupted,
        }
    }

    /// The exit a loop reports after `verdict` ended it.
    pub fn after(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Continue => Self::exhausted(),
            Verdict::Stop => Self::target_failed(),
            Verdict::Interrupted | Verdict::Declined => Self::interrupted(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Invalid fuzzer option '{flag}': {reason}")]
    InvalidOption { flag: String, reason: String },
    #[error("Corpus operation failed in the driving loop: {0}")]
    Corpus(#[from] crate::corpus::CorpusError),
    #[error("Scheduler failed in the driving loop: {0}")]
    Scheduler(#[from] crate::scheduler::SchedulerError),
    #[error("Feedback failed in the driving loop: {0}")]
    Feedback(#[from] crate::feedback::FeedbackError),
    #[error("Mutation failed in the driving loop: {0}")]
    Mutation(#[source] anyhow::Error),
    #[error("I/O error in the driving loop: {0}")]
    Io(#[from] std::io::Error),
    #[error("Driving loop panicked: {0}")]
    Panicked(String),
}

/// Dumps the most recent input before a forced termination.
pub trait CrashReporter: Send + Sync {
    fn dump_crashing_input(&self);
}

/// Reporter for loops that keep no record of their inputs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCrashReporter;

impl CrashReporter for NoCrashReporter {
    fn dump_crashing_input(&self) {}
}

/// Called from inside the fatal-signal handler. Must be async-signal-safe.
pub type FatalSignalHook = extern "C" fn();

/// The external input-generation engine.
///
/// `drive` calls `target` once per generated input and must not call it
/// again once it returned anything but [`Verdict::Continue`]. Only
/// [`Verdict::Stop`] marks the input as a finding.
pub trait DrivingLoop: Send {
    /// Parses the forwarded options. Runs before any iteration, so
    /// malformed options are reported to the caller synchronously.
    fn prepare(&mut self, args: &[String]) -> Result<(), DriverError>;

    fn drive(
        &mut self,
        target: &mut dyn FnMut(&[u8]) -> Verdict,
    ) -> Result<DriverExit, DriverError>;

    fn crash_reporter(&self) -> Arc<dyn CrashReporter>;

    /// Lets the loop persist the failing input when a fatal signal ends the
    /// process.
    fn fatal_signal_hook(&self) -> Option<FatalSignalHook> {
        None
    }
}

/// Ends the process immediately without running exit handlers.
pub fn terminate(code: i32) -> ! {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    exit_now(code)
}

#[cfg(unix)]
fn exit_now(code: i32) -> ! {
    // SAFETY: _exit has no preconditions and never returns.
    unsafe { libc::_exit(code) }
}

#[cfg(not(unix))]
fn exit_now(code: i32) -> ! {
    std::process::exit(code)
}

/// Terminates after a broken bridge invariant. Never surfaced through a
/// completion signal.
pub fn interop_failure(reason: &dyn std::fmt::Display) -> ! {
    error!("Unexpected interop failure: {reason}");
    eprintln!("==ferry== Unexpected error in the fuzzing bridge; this is most likely a bug: {reason}");
    terminate(EXIT_INTEROP_FAILURE)
}
