//! The fuzz target side of the bridge: what a callback may return, how its
//! failures are captured, and the per-call logic both bridges share.

use crate::driver::interop_failure;
use crate::input::FuzzData;
use crate::signal;
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// An error raised by the fuzz target: either an `Err` it returned, a
/// rejected deferred result, or a panic.
///
/// The wrapped `anyhow::Error` keeps the original error value, so callers can
/// recover its identity with [`TargetError::downcast_ref`].
pub struct TargetError {
    inner: anyhow::Error,
}

impl TargetError {
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: error.into(),
        }
    }

    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self {
            inner: anyhow::Error::msg(message),
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::msg(format!(
            "fuzz target panicked: {}",
            panic_message(payload.as_ref())
        ))
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.inner.downcast_ref::<E>()
    }
}

impl fmt::Display for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl fmt::Debug for TargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TargetError").field(&self.inner).finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

pub type TargetResult = Result<(), TargetError>;

/// What one call of the fuzz target produced, decided once per call.
pub enum TargetReturn {
    /// The target finished during the call itself.
    Value(TargetResult),
    /// The target handed back work that settles later on the host.
    Deferred(LocalBoxFuture<'static, TargetResult>),
}

impl TargetReturn {
    pub fn ok() -> Self {
        TargetReturn::Value(Ok(()))
    }

    pub fn err(error: impl Into<anyhow::Error>) -> Self {
        TargetReturn::Value(Err(TargetError::new(error)))
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + 'static,
    {
        TargetReturn::Deferred(future.map(|r| r.map_err(TargetError::new)).boxed_local())
    }
}

impl fmt::Debug for TargetReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetReturn::Value(r) => f.debug_tuple("Value").field(r).finish(),
            TargetReturn::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Return types a fuzz target callback may use.
pub trait IntoTargetReturn {
    fn into_target_return(self) -> TargetReturn;
}

impl IntoTargetReturn for () {
    fn into_target_return(self) -> TargetReturn {
        TargetReturn::ok()
    }
}

impl IntoTargetReturn for anyhow::Result<()> {
    fn into_target_return(self) -> TargetReturn {
        TargetReturn::Value(self.map_err(TargetError::new))
    }
}

impl IntoTargetReturn for TargetReturn {
    fn into_target_return(self) -> TargetReturn {
        self
    }
}

/// A callback that may only run on the host thread.
///
/// Implementations need not be `Send`; the asynchronous bridge keeps the
/// target on the host and only ships buffers across threads.
pub trait FuzzTarget {
    fn invoke(&self, data: FuzzData) -> TargetReturn;
}

impl<F, R> FuzzTarget for F
where
    F: Fn(FuzzData) -> R,
    R: IntoTargetReturn,
{
    fn invoke(&self, data: FuzzData) -> TargetReturn {
        (self)(data).into_target_return()
    }
}

/// Per-iteration verdict vocabulary shared by both bridges.
#[derive(Debug)]
pub enum TargetOutcome {
    Continue,
    ThrownError(TargetError),
    Crashed(i32),
    InteropFailure(String),
}

impl From<TargetResult> for TargetOutcome {
    fn from(result: TargetResult) -> Self {
        match result {
            Ok(()) => TargetOutcome::Continue,
            Err(error) => TargetOutcome::ThrownError(error),
        }
    }
}

/// Holds the error a target raised on the host thread until the session
/// resolves. Only the first error is kept; the loop stops right after it.
#[derive(Debug, Default, Clone)]
pub struct TargetErrorStore {
    slot: Rc<RefCell<Option<TargetError>>>,
}

impl TargetErrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, error: TargetError) {
        let mut slot = self.slot.borrow_mut();
        if slot.is_some() {
            warn!("Discarding additional target error after the first: {error}");
            return;
        }
        *slot = Some(error);
    }

    pub fn is_empty(&self) -> bool {
        self.slot.borrow().is_none()
    }

    pub fn take(&self) -> Option<TargetError> {
        self.slot.borrow_mut().take()
    }
}

/// Which bridge a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Sync,
    #[default]
    Async,
}

/// Counts plain versus deferred returns to advise on the bridge choice.
#[derive(Debug, Default)]
pub struct ReturnStats {
    plain: Cell<u64>,
    deferred: Cell<u64>,
}

impl ReturnStats {
    pub fn record(&self, deferred: bool) {
        let counter = if deferred { &self.deferred } else { &self.plain };
        counter.set(counter.get() + 1);
    }

    pub fn plain(&self) -> u64 {
        self.plain.get()
    }

    pub fn deferred(&self) -> u64 {
        self.deferred.get()
    }

    pub fn advice(&self, mode: Mode) -> Option<&'static str> {
        match mode {
            Mode::Async if self.deferred() == 0 && self.plain() > 0 => Some(
                "the fuzz target only returned plain values; running in sync mode is likely faster",
            ),
            Mode::Sync if self.deferred() > 0 => Some(
                "the fuzz target returned deferred results; sync mode blocks on each of them, consider async mode",
            ),
            _ => None,
        }
    }
}

pub type Hook = Box<dyn Fn()>;

/// Thunks run on the host thread around every invocation.
#[derive(Default)]
pub struct IterationHooks {
    before_each: Vec<Hook>,
    after_each: Vec<Hook>,
}

impl IterationHooks {
    pub fn register_before_each(&mut self, hook: Hook) {
        self.before_each.push(hook);
    }

    pub fn register_after_each(&mut self, hook: Hook) {
        self.after_each.push(hook);
    }

    fn run_before_each(&self) {
        for hook in &self.before_each {
            hook();
        }
    }

    fn run_after_each(&self) {
        for hook in &self.after_each {
            hook();
        }
    }
}

/// How a single envelope is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Continue,
    /// Sentinel telling the driving loop to unwind early.
    Stop,
}

/// First half of an invocation: either already settled or pending on the host.
pub(crate) enum Invocation {
    Settled(TargetResult),
    Deferred(LocalBoxFuture<'static, TargetResult>),
}

/// Host-side invocation logic shared by the synchronous and asynchronous
/// bridges.
pub(crate) struct Invoker<T> {
    target: T,
    hooks: IterationHooks,
    errors: TargetErrorStore,
    stats: ReturnStats,
}

impl<T: FuzzTarget> Invoker<T> {
    pub(crate) fn new(target: T, hooks: IterationHooks) -> Self {
        Self {
            target,
            hooks,
            errors: TargetErrorStore::new(),
            stats: ReturnStats::default(),
        }
    }

    pub(crate) fn begin(&self, data: FuzzData) -> Invocation {
        self.hooks.run_before_each();
        match catch_unwind(AssertUnwindSafe(|| self.target.invoke(data))) {
            Ok(TargetReturn::Value(result)) => {
                self.stats.record(false);
                Invocation::Settled(result)
            }
            Ok(TargetReturn::Deferred(future)) => {
                self.stats.record(true);
                let guarded = AssertUnwindSafe(future).catch_unwind().map(|r| match r {
                    Ok(result) => result,
                    Err(payload) => Err(TargetError::from_panic(payload)),
                });
                Invocation::Deferred(guarded.boxed_local())
            }
            Err(payload) => {
                self.stats.record(false);
                Invocation::Settled(Err(TargetError::from_panic(payload)))
            }
        }
    }

    pub(crate) fn finish(&self, result: TargetResult) -> Settlement {
        self.hooks.run_after_each();
        self.settle(TargetOutcome::from(result))
    }

    /// Crashes and interop failures end the process here.
    pub(crate) fn settle(&self, outcome: TargetOutcome) -> Settlement {
        match outcome {
            TargetOutcome::Continue => Settlement::Continue,
            TargetOutcome::ThrownError(error) => {
                debug!("Fuzz target raised an error, stopping the driving loop: {error}");
                self.errors.record(error);
                Settlement::Stop
            }
            TargetOutcome::Crashed(signum) => signal::terminate_fatal(signum),
            TargetOutcome::InteropFailure(reason) => interop_failure(&reason),
        }
    }

    pub(crate) fn errors(&self) -> &TargetErrorStore {
        &self.errors
    }

    pub(crate) fn stats(&self) -> &ReturnStats {
        &self.stats
    }

    pub(crate) fn log_advice(&self, mode: Mode) {
        if let Some(advice) = self.stats.advice(mode) {
            info!("{advice}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[derive(Debug, thiserror::Error)]
    #[error("custom failure {0}")]
    struct CustomFailure(u32);

    fn settle<T: FuzzTarget>(invoker: &Invoker<T>, data: &[u8]) -> Settlement {
        match invoker.begin(FuzzData::from(data.to_vec())) {
            Invocation::Settled(result) => invoker.finish(result),
            Invocation::Deferred(future) => invoker.finish(block_on(future)),
        }
    }

    #[test]
    fn unit_returning_target_continues() {
        let invoker = Invoker::new(|_data: FuzzData| {}, IterationHooks::default());
        assert_eq!(settle(&invoker, b"x"), Settlement::Continue);
        assert!(invoker.errors().is_empty());
        assert_eq!(invoker.stats().plain(), 1);
    }

    #[test]
    fn returned_error_keeps_its_identity() {
        let invoker = Invoker::new(
            |_data: FuzzData| -> anyhow::Result<()> { Err(CustomFailure(7).into()) },
            IterationHooks::default(),
        );
        assert_eq!(settle(&invoker, b"x"), Settlement::Stop);
        let error = invoker.errors().take().expect("error recorded");
        assert_eq!(error.downcast_ref::<CustomFailure>().map(|e| e.0), Some(7));
        assert_eq!(error.to_string(), "custom failure 7");
    }

    #[test]
    fn panicking_target_is_a_thrown_error() {
        let invoker = Invoker::new(
            |data: FuzzData| {
                if data.first() == Some(&0xFF) {
                    panic!("Boom!");
                }
            },
            IterationHooks::default(),
        );
        assert_eq!(settle(&invoker, &[0x00]), Settlement::Continue);
        assert_eq!(settle(&invoker, &[0xFF]), Settlement::Stop);
        let error = invoker.errors().take().expect("panic recorded");
        assert!(error.to_string().contains("Boom!"));
    }

    #[test]
    fn rejected_deferred_result_is_recorded() {
        let invoker = Invoker::new(
            |_data: FuzzData| TargetReturn::deferred(async { Err(anyhow::anyhow!("later")) }),
            IterationHooks::default(),
        );
        assert_eq!(settle(&invoker, b""), Settlement::Stop);
        assert_eq!(invoker.stats().deferred(), 1);
        assert_eq!(invoker.errors().take().unwrap().to_string(), "later");
    }

    #[test]
    fn panic_inside_deferred_result_is_caught() {
        let invoker = Invoker::new(
            |_data: FuzzData| {
                TargetReturn::deferred(async {
                    if true {
                        panic!("deferred boom");
                    }
                    Ok(())
                })
            },
            IterationHooks::default(),
        );
        assert_eq!(settle(&invoker, b""), Settlement::Stop);
        assert!(
            invoker
                .errors()
                .take()
                .unwrap()
                .to_string()
                .contains("deferred boom")
        );
    }

    #[test]
    fn results_map_onto_outcomes() {
        assert!(matches!(TargetOutcome::from(Ok(())), TargetOutcome::Continue));
        match TargetOutcome::from(Err(TargetError::msg("nope"))) {
            TargetOutcome::ThrownError(error) => assert_eq!(error.to_string(), "nope"),
            other => panic!("expected a thrown error, got {other:?}"),
        }
    }

    #[test]
    fn store_keeps_only_the_first_error() {
        let store = TargetErrorStore::new();
        assert!(store.is_empty());
        store.record(TargetError::msg("first"));
        store.record(TargetError::msg("second"));
        assert_eq!(store.take().unwrap().to_string(), "first");
        assert!(store.is_empty());
    }

    #[test]
    fn hooks_run_around_each_invocation() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut hooks = IterationHooks::default();
        let before = Rc::clone(&log);
        hooks.register_before_each(Box::new(move || before.borrow_mut().push("before")));
        let after = Rc::clone(&log);
        hooks.register_after_each(Box::new(move || after.borrow_mut().push("after")));
        let inner = Rc::clone(&log);
        let invoker = Invoker::new(
            move |_data: FuzzData| inner.borrow_mut().push("target"),
            hooks,
        );
        settle(&invoker, b"a");
        assert_eq!(*log.borrow(), vec!["before", "target", "after"]);
    }

    #[test]
    fn return_stats_advice_depends_on_mode() {
        let stats = ReturnStats::default();
        assert_eq!(stats.advice(Mode::Async), None);
        stats.record(false);
        assert!(stats.advice(Mode::Async).unwrap().contains("sync mode"));
        assert_eq!(stats.advice(Mode::Sync), None);
        stats.record(true);
        assert_eq!(stats.advice(Mode::Async), None);
        assert!(stats.advice(Mode::Sync).unwrap().contains("async mode"));
    }
}
