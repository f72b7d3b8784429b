pub mod async_bridge;
pub mod completion;
pub mod config;
pub mod corpus;
pub mod driver;
pub mod engine;
pub mod envelope;
mod fatal_artifact;
pub mod feedback;
pub mod host;
pub mod input;
pub mod mutator;
pub mod scheduler;
pub mod session;
pub mod signal;
mod sync_bridge;
pub mod target;

pub use async_bridge::{AsyncSession, SessionStopper, StopHandler};
pub use completion::{CompletionSignal, CompletionState, SessionEnd, SessionResult};
pub use config::{ConfigError, FerryConfig, FuzzerSettings, HarnessKind, HarnessSettings};
pub use corpus::{Corpus, CorpusError, EntryOrigin, InMemoryCorpus};
pub use driver::{
    CrashReporter, DriverError, DriverExit, DrivingLoop, EXIT_ERROR, EXIT_FATAL_SIGNAL,
    EXIT_INTEROP_FAILURE, EXIT_OK, ExitKind, FatalSignalHook, Verdict,
};
pub use engine::{EngineOptions, LastInputReporter, MutationEngine, ReplayEngine};
pub use feedback::{Feedback, FeedbackError, UniqueInputFeedback};
pub use host::{Host, InteropError};
pub use input::{FuzzData, FuzzInput, Input};
pub use mutator::{
    EraseByteMutator, FlipSingleByteMutator, HavocMutator, InsertByteMutator, Mutator,
};
pub use scheduler::{RandomScheduler, Scheduler, SchedulerError};
pub use session::{Session, SessionError, SessionOptions, is_session_active};
pub use signal::{Interceptor, SignalState};
pub use target::{
    FuzzTarget, IntoTargetReturn, Mode, TargetError, TargetOutcome, TargetResult, TargetReturn,
};

#[cfg(test)]
pub(crate) mod test_support {
    use parking_lot::{Mutex, MutexGuard, const_mutex};
    use std::process::{Command, Output};

    /// Set in a re-executed test binary to select the scenario it runs.
    pub const CHILD_ENV: &str = "FERRY_TEST_CHILD";

    static SERIAL: Mutex<()> = const_mutex(());

    /// Serializes tests that touch process-wide signal or session state.
    pub fn serial() -> MutexGuard<'static, ()> {
        SERIAL.lock()
    }

    pub fn child_scenario() -> Option<String> {
        std::env::var(CHILD_ENV).ok()
    }

    /// Re-runs a single test of this binary in a child process.
    pub fn run_child(test: &str, scenario: &str) -> Output {
        let exe = std::env::current_exe().unwrap();
        Command::new(exe)
            .args([test, "--exact", "--nocapture", "--test-threads=1"])
            .env(CHILD_ENV, scenario)
            .output()
            .unwrap()
    }
}
