//! Runs the driving loop and the fuzz target on the calling thread.

use crate::completion::{SessionEnd, SessionResult};
use crate::driver::{DriverError, DrivingLoop, Verdict, interop_failure};
use crate::input::FuzzInput;
use crate::signal::{self, SignalState};
use crate::target::{
    FuzzTarget, Invocation, Invoker, Settlement, TargetOutcome, panic_message,
};
use futures::executor::block_on;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::debug;

/// Drives `engine` to completion on this thread.
///
/// Every input is copied before the target sees it. Deferred results are
/// blocked on before the next iteration. After each iteration that did not
/// already stop the loop, a recorded interrupt or stop signal is handed to
/// `stop_handler` once and ends the session.
pub(crate) fn run<T: FuzzTarget>(
    engine: &mut dyn DrivingLoop,
    invoker: &Invoker<T>,
    stop_handler: &mut dyn FnMut(i32),
) -> SessionResult {
    let mut stopped_with = None;
    let mut iteration = |bytes: &[u8]| -> Verdict {
        let data = FuzzInput::new(bytes).to_owned_data();
        let result = signal::guarded(|| match invoker.begin(data) {
            Invocation::Settled(result) => result,
            Invocation::Deferred(future) => block_on(future),
        });
        if invoker.finish(result) == Settlement::Stop {
            return Verdict::Stop;
        }
        let state = signal::current();
        if let SignalState::Fatal(signum) = state {
            invoker.settle(TargetOutcome::Crashed(signum));
        }
        match state.stop_code() {
            Some(code) => {
                debug!("Stop signal observed after an iteration, code {code}");
                stop_handler(code);
                stopped_with = Some(code);
                Verdict::Interrupted
            }
            None => Verdict::Continue,
        }
    };

    let driven = catch_unwind(AssertUnwindSafe(|| engine.drive(&mut iteration)))
        .unwrap_or_else(|payload| Err(DriverError::Panicked(panic_message(payload.as_ref()))));
    let exit = match driven {
        Ok(exit) => exit,
        Err(e) => interop_failure(&e),
    };
    debug!("Driving loop returned {:?} with code {}", exit.kind, exit.code);

    if let Some(error) = invoker.errors().take() {
        return Err(error);
    }
    match stopped_with {
        Some(code) => Ok(SessionEnd::Stopped { code }),
        None => Ok(SessionEnd::Completed {
            exit_code: exit.code,
        }),
    }
}
