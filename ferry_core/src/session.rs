//! One fuzzing run, from argument checks to its terminal outcome, and the
//! process-wide single-session marker.

use crate::async_bridge::{self, AsyncSession, SessionStopper, StopHandler};
use crate::completion::SessionResult;
use crate::driver::{DrivingLoop, EXIT_OK, interop_failure, terminate};
use crate::host::Host;
use crate::signal::Interceptor;
use crate::sync_bridge;
use crate::target::{FuzzTarget, Invoker, IterationHooks, Mode};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::info;

/// Caller errors, reported before any iteration runs.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a fuzzing session is already running in this process")]
    Busy,
    #[error("malformed fuzzer arguments: {0}")]
    MalformedArguments(String),
    #[error("could not install signal handlers: {0}")]
    SignalSetup(#[source] std::io::Error),
}

static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Holds the single-session marker; released on drop.
#[derive(Debug)]
pub(crate) struct ActiveSession {
    _private: (),
}

impl ActiveSession {
    pub(crate) fn acquire() -> Result<Self, SessionError> {
        SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self { _private: () })
            .map_err(|_| SessionError::Busy)
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        SESSION_ACTIVE.store(false, Ordering::Release);
    }
}

pub fn is_session_active() -> bool {
    SESSION_ACTIVE.load(Ordering::Acquire)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub mode: Mode,
    /// Forwarded to the driving loop verbatim, in order.
    pub fuzzer_args: Vec<String>,
}

/// A configured, not yet started fuzzing session.
pub struct Session {
    options: SessionOptions,
    engine: Box<dyn DrivingLoop>,
    hooks: IterationHooks,
    stop_handler: Option<StopHandler>,
}

impl Session {
    pub fn new(options: SessionOptions, engine: Box<dyn DrivingLoop>) -> Self {
        Self {
            options,
            engine,
            hooks: IterationHooks::default(),
            stop_handler: None,
        }
    }

    /// Called once with 0 for an interrupt or with the signal number for
    /// another stop signal. Without one, a synchronous session ends the
    /// process on such a signal.
    pub fn on_stop(mut self, handler: impl FnMut(i32) + 'static) -> Self {
        self.stop_handler = Some(Box::new(handler));
        self
    }

    pub fn before_each(mut self, hook: impl Fn() + 'static) -> Self {
        self.hooks.register_before_each(Box::new(hook));
        self
    }

    pub fn after_each(mut self, hook: impl Fn() + 'static) -> Self {
        self.hooks.register_after_each(Box::new(hook));
        self
    }

    pub fn mode(&self) -> Mode {
        self.options.mode
    }

    pub fn stopper(&self) -> SessionStopper {
        SessionStopper::new(self.engine.crash_reporter())
    }

    fn begin(&mut self) -> Result<(Interceptor, ActiveSession), SessionError> {
        let active = ActiveSession::acquire()?;
        if let Some(arg) = self.options.fuzzer_args.iter().find(|a| a.contains('\0')) {
            return Err(SessionError::MalformedArguments(format!(
                "argument {arg:?} contains a NUL byte"
            )));
        }
        self.engine
            .prepare(&self.options.fuzzer_args)
            .map_err(|e| SessionError::MalformedArguments(e.to_string()))?;
        let interceptor =
            Interceptor::install(self.engine.fatal_signal_hook()).map_err(SessionError::SignalSetup)?;
        info!(
            "Starting {:?} fuzzing session with {} fuzzer arguments",
            self.options.mode,
            self.options.fuzzer_args.len()
        );
        Ok((interceptor, active))
    }

    /// Runs the whole session on the calling thread.
    pub fn run_sync<T: FuzzTarget>(mut self, target: T) -> Result<SessionResult, SessionError> {
        let guard = self.begin()?;
        let Session {
            mut engine,
            hooks,
            stop_handler,
            ..
        } = self;
        let stopper = SessionStopper::new(engine.crash_reporter());
        let mut stop_handler = stop_handler.unwrap_or_else(|| default_stop_handler(stopper));
        let invoker = Invoker::new(target, hooks);
        let outcome = sync_bridge::run(engine.as_mut(), &invoker, stop_handler.as_mut());
        invoker.log_advice(Mode::Sync);
        drop(guard);
        Ok(outcome)
    }

    /// Starts the driving loop on its own thread; calls run on `host`.
    pub fn start_async<T: FuzzTarget + 'static>(
        mut self,
        host: &Host,
        target: T,
    ) -> Result<AsyncSession, SessionError> {
        let guard = self.begin()?;
        let Session {
            engine,
            hooks,
            stop_handler,
            ..
        } = self;
        let invoker = Invoker::new(target, hooks);
        match async_bridge::start(host, engine, invoker, stop_handler, guard) {
            Ok(session) => Ok(session),
            Err(e) => interop_failure(&e),
        }
    }

    /// Runs the session in its configured mode until it ends.
    pub fn run<T: FuzzTarget + 'static>(
        self,
        host: &mut Host,
        target: T,
    ) -> Result<SessionResult, SessionError> {
        match self.options.mode {
            Mode::Sync => self.run_sync(target),
            Mode::Async => {
                let session = self.start_async(host, target)?;
                Ok(host.run_until(session))
            }
        }
    }
}

fn default_stop_handler(stopper: SessionStopper) -> StopHandler {
    Box::new(move |code: i32| {
        if code == 0 {
            info!("Fuzzing interrupted");
            terminate(EXIT_OK);
        }
        stopper.stop(Some(code));
    })
}
