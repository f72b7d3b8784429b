//! Runs the driving loop on a worker thread and every target call on the
//! host.
//!
//! The worker turns each iteration into a [`CallEnvelope`], hands it to the
//! host through the single-slot queue and blocks until the host settles it.
//! The host side is one pump task that owns the target, the error store and
//! the completer; it resolves the completion signal once the worker reports
//! that the loop has finished.

use crate::completion::{self, CompletionSignal, CompletionState, SessionEnd, SessionResult};
use crate::driver::{CrashReporter, DriverError, DriverExit, DrivingLoop, EXIT_ERROR, Verdict};
use crate::driver::{interop_failure, terminate};
use crate::envelope::CallEnvelope;
use crate::host::{Host, HostMessage, HostReceiver, HostSender, InteropError, queue};
use crate::input::FuzzInput;
use crate::signal::{self, Guarded};
use crate::target::{
    FuzzTarget, Invocation, Invoker, Mode, Settlement, TargetOutcome, panic_message,
};
use futures::StreamExt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

pub(crate) const DRIVER_THREAD_NAME: &str = "ferry-driver";

pub type StopHandler = Box<dyn FnMut(i32)>;

/// Ends the process early, dumping the most recent input first.
#[derive(Clone)]
pub struct SessionStopper {
    reporter: Arc<dyn CrashReporter>,
}

impl SessionStopper {
    pub(crate) fn new(reporter: Arc<dyn CrashReporter>) -> Self {
        Self { reporter }
    }

    /// Never resolves the completion signal. `None` exits with
    /// [`EXIT_ERROR`].
    pub fn stop(&self, code: Option<i32>) -> ! {
        self.reporter.dump_crashing_input();
        terminate(code.unwrap_or(EXIT_ERROR))
    }
}

impl std::fmt::Debug for SessionStopper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionStopper")
    }
}

/// A running asynchronous session. Awaiting it on the host yields the
/// session's outcome.
#[derive(Debug)]
pub struct AsyncSession {
    signal: CompletionSignal,
    stopper: SessionStopper,
}

impl AsyncSession {
    pub fn state(&self) -> CompletionState {
        self.signal.state()
    }

    pub fn stopper(&self) -> SessionStopper {
        self.stopper.clone()
    }

    pub fn stop(&self, code: Option<i32>) -> ! {
        self.stopper.stop(code)
    }

    pub fn into_signal(self) -> CompletionSignal {
        self.signal
    }
}

impl Future for AsyncSession {
    type Output = SessionResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<SessionResult> {
        Pin::new(&mut self.signal).poll(cx)
    }
}

/// One iteration on the worker side.
fn relay(sender: &mut HostSender, bytes: &[u8]) -> Verdict {
    if signal::current().stop_code().is_some() {
        debug!("Stop signal pending, not handing another input to the host");
        return Verdict::Declined;
    }
    let (envelope, pending) = CallEnvelope::new(FuzzInput::new(bytes));
    if let Err(e) = sender.deliver(HostMessage::Call(envelope)) {
        interop_failure(&e);
    }
    match pending.wait() {
        Ok(Settlement::Continue) => Verdict::Continue,
        Ok(Settlement::Stop) => Verdict::Stop,
        Err(e) => interop_failure(&e),
    }
}

fn spawn_worker(
    mut engine: Box<dyn DrivingLoop>,
    mut sender: HostSender,
) -> Result<JoinHandle<()>, InteropError> {
    thread::Builder::new()
        .name(DRIVER_THREAD_NAME.to_string())
        .spawn(move || {
            let driven = catch_unwind(AssertUnwindSafe(|| {
                engine.drive(&mut |bytes: &[u8]| relay(&mut sender, bytes))
            }))
            .unwrap_or_else(|payload| {
                Err(DriverError::Panicked(panic_message(payload.as_ref())))
            });
            if let Err(e) = sender.deliver(HostMessage::Finished(driven)) {
                interop_failure(&e);
            }
        })
        .map_err(InteropError::WorkerSpawn)
}

/// State the host side keeps alive until the session resolves.
struct Pump<T, G> {
    invoker: Invoker<T>,
    stop_handler: Option<StopHandler>,
    worker: JoinHandle<()>,
    session_guard: G,
}

impl<T: FuzzTarget, G> Pump<T, G> {
    async fn call(&self, envelope: CallEnvelope) {
        let (data, handle) = envelope.into_parts();
        let result = match signal::guarded(|| self.invoker.begin(data)) {
            Invocation::Settled(result) => result,
            Invocation::Deferred(future) => Guarded::new(future).await,
        };
        let settlement = self.invoker.finish(result);
        if let Err(e) = handle.settle(settlement) {
            self.invoker.settle(TargetOutcome::InteropFailure(e.to_string()));
        }
    }

    fn finish(self, driven: Result<DriverExit, DriverError>) -> SessionResult {
        let Pump {
            invoker,
            mut stop_handler,
            worker,
            session_guard,
        } = self;
        if worker.join().is_err() {
            interop_failure(&InteropError::DriverVanished);
        }
        let exit = match driven {
            Ok(exit) => exit,
            Err(e) => interop_failure(&InteropError::Driver(e)),
        };
        debug!("Driving loop returned {:?} with code {}", exit.kind, exit.code);

        let outcome = if let Some(error) = invoker.errors().take() {
            Err(error)
        } else if let Some(code) = signal::current().stop_code() {
            info!("Fuzzing stopped by signal, code {code}");
            if let Some(handler) = stop_handler.as_mut() {
                handler(code);
            }
            Ok(SessionEnd::Stopped { code })
        } else {
            Ok(SessionEnd::Completed {
                exit_code: exit.code,
            })
        };
        invoker.log_advice(Mode::Async);
        drop(session_guard);
        outcome
    }
}

async fn pump<T: FuzzTarget, G>(
    state: Pump<T, G>,
    mut receiver: HostReceiver,
    completer: completion::Completer,
) {
    while let Some(message) = receiver.next().await {
        match message {
            HostMessage::Call(envelope) => state.call(envelope).await,
            HostMessage::Finished(driven) => {
                let outcome = state.finish(driven);
                completer.resolve(outcome);
                return;
            }
        }
    }
    interop_failure(&InteropError::DriverVanished)
}

/// Starts the worker and the host pump. `session_guard` is dropped right
/// before the completion signal resolves.
pub(crate) fn start<T, G>(
    host: &Host,
    engine: Box<dyn DrivingLoop>,
    invoker: Invoker<T>,
    stop_handler: Option<StopHandler>,
    session_guard: G,
) -> Result<AsyncSession, InteropError>
where
    T: FuzzTarget + 'static,
    G: 'static,
{
    let stopper = SessionStopper::new(engine.crash_reporter());
    let (sender, receiver) = queue();
    let (completer, signal) = completion::channel();
    let worker = spawn_worker(engine, sender)?;
    let state = Pump {
        invoker,
        stop_handler,
        worker,
        session_guard,
    };
    host.spawn(pump(state, receiver, completer))?;
    Ok(AsyncSession { signal, stopper })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::EXIT_OK;
    use crate::engine::ReplayEngine;
    use crate::input::FuzzData;
    use crate::signal::Interceptor;
    use crate::target::{IterationHooks, TargetReturn};
    use crate::test_support::serial;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn start_replay<T: FuzzTarget + 'static>(
        host: &Host,
        inputs: Vec<Vec<u8>>,
        target: T,
    ) -> AsyncSession {
        start(
            host,
            Box::new(ReplayEngine::new(inputs)),
            Invoker::new(target, IterationHooks::default()),
            None,
            (),
        )
        .unwrap()
    }

    #[test]
    fn calls_run_on_the_host_thread_in_order() {
        let _lock = serial();
        let _signals = Interceptor::install(None).unwrap();
        let mut host = Host::new();
        let host_thread = thread::current().id();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        let session = start_replay(&host, (0u8..8).map(|i| vec![i]).collect(), move |data: FuzzData| {
            assert_eq!(thread::current().id(), host_thread);
            log.borrow_mut().push(data[0]);
        });

        let outcome = host.run_until(session);
        assert_eq!(outcome.unwrap(), SessionEnd::Completed { exit_code: EXIT_OK });
        assert_eq!(*seen.borrow(), (0u8..8).collect::<Vec<_>>());
    }

    #[test]
    fn at_most_one_call_is_in_flight() {
        let _lock = serial();
        let _signals = Interceptor::install(None).unwrap();
        let mut host = Host::new();
        let in_flight = Rc::new(Cell::new(0u32));
        let peak = Rc::new(Cell::new(0u32));
        let (current, max) = (Rc::clone(&in_flight), Rc::clone(&peak));
        let session = start_replay(&host, vec![vec![1]; 6], move |_data: FuzzData| {
            current.set(current.get() + 1);
            max.set(max.get().max(current.get()));
            let current = Rc::clone(&current);
            TargetReturn::deferred(async move {
                futures::future::ready(()).await;
                current.set(current.get() - 1);
                Ok(())
            })
        });

        assert!(host.run_until(session).is_ok());
        assert_eq!(peak.get(), 1);
        assert_eq!(in_flight.get(), 0);
    }

    #[test]
    fn rejected_deferred_result_rejects_the_session() {
        let _lock = serial();
        let _signals = Interceptor::install(None).unwrap();
        let mut host = Host::new();
        let calls = Rc::new(Cell::new(0u32));
        let counter = Rc::clone(&calls);
        let session = start_replay(&host, vec![vec![0]; 10], move |_data: FuzzData| {
            counter.set(counter.get() + 1);
            let fail = counter.get() == 5;
            TargetReturn::deferred(async move {
                if fail {
                    anyhow::bail!("boom");
                }
                Ok(())
            })
        });

        let error = host.run_until(session).unwrap_err();
        assert_eq!(error.to_string(), "boom");
        assert_eq!(calls.get(), 5);
    }

    #[test]
    fn buffers_are_copied_before_the_loop_reuses_them() {
        let _lock = serial();
        let _signals = Interceptor::install(None).unwrap();
        let mut host = Host::new();
        let inputs: Vec<Vec<u8>> = vec![b"first".to_vec(), b"second!".to_vec(), b"3".to_vec()];
        let kept = Rc::new(RefCell::new(Vec::<FuzzData>::new()));
        let store = Rc::clone(&kept);
        let session = start_replay(&host, inputs.clone(), move |data: FuzzData| {
            store.borrow_mut().push(data);
        });

        assert!(host.run_until(session).is_ok());
        let kept: Vec<Vec<u8>> = kept.borrow().iter().map(|d| d.to_vec()).collect();
        assert_eq!(kept, inputs);
    }

    #[test]
    fn other_host_work_interleaves_with_calls() {
        let _lock = serial();
        let _signals = Interceptor::install(None).unwrap();
        let mut host = Host::new();
        let ticks = Rc::new(Cell::new(0u32));
        let ticker = Rc::clone(&ticks);
        host.spawn(async move {
            ticker.set(ticker.get() + 1);
        })
        .unwrap();
        let session = start_replay(&host, vec![vec![1]; 3], |_data: FuzzData| {});
        assert!(host.run_until(session).is_ok());
        assert_eq!(ticks.get(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn interrupt_resolves_the_session_as_stopped() {
        let _lock = serial();
        let _signals = Interceptor::install(None).unwrap();
        let mut host = Host::new();
        let codes = Rc::new(RefCell::new(Vec::new()));
        let recorded = Rc::clone(&codes);
        let calls = Rc::new(Cell::new(0u32));
        let counter = Rc::clone(&calls);
        let engine = ReplayEngine::new(vec![vec![0u8]; 10]);
        let log = engine.verdict_log();
        let session = start(
            &host,
            Box::new(engine),
            Invoker::new(
                move |_data: FuzzData| {
                    counter.set(counter.get() + 1);
                    if counter.get() == 3 {
                        // SAFETY: the interceptor's SIGINT handler is installed.
                        unsafe { libc::raise(libc::SIGINT) };
                    }
                },
                IterationHooks::default(),
            ),
            Some(Box::new(move |code| recorded.borrow_mut().push(code))),
            (),
        )
        .unwrap();

        assert_eq!(host.run_until(session).unwrap(), SessionEnd::Stopped { code: 0 });
        assert_eq!(*codes.borrow(), vec![0]);
        assert_eq!(calls.get(), 3);
        assert_eq!(log.lock().last(), Some(&Verdict::Declined));
    }

    #[test]
    fn session_guard_is_released_before_resolution() {
        let _lock = serial();
        let _signals = Interceptor::install(None).unwrap();
        struct Flag(Rc<Cell<bool>>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }
        let mut host = Host::new();
        let released = Rc::new(Cell::new(false));
        let session = start(
            &host,
            Box::new(ReplayEngine::new(vec![vec![1u8]])),
            Invoker::new(|_data: FuzzData| {}, IterationHooks::default()),
            None,
            Flag(Rc::clone(&released)),
        )
        .unwrap();
        assert!(session.state() == CompletionState::Pending);
        assert!(!released.get());
        let signal = session.into_signal();
        let observed = Rc::clone(&released);
        let outcome = host.run_until(async move {
            let outcome = signal.await;
            (outcome, observed.get())
        });
        assert!(outcome.0.is_ok());
        assert!(outcome.1);
    }
}
