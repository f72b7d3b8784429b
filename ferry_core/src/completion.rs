//! One-shot completion channel between a session and its caller.

use crate::target::TargetError;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// How a session ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The driving loop ran to completion; carries its exit code.
    Completed { exit_code: i32 },
    /// An interrupt or stop signal ended the session; `code` is what the
    /// stop handler received (0 for an interrupt).
    Stopped { code: i32 },
}

pub type SessionResult = Result<SessionEnd, TargetError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    Resolved,
    Rejected,
}

#[derive(Debug)]
struct Shared {
    state: CompletionState,
    outcome: Option<SessionResult>,
    waker: Option<Waker>,
}

/// Creates a connected completer/signal pair.
pub fn channel() -> (Completer, CompletionSignal) {
    let shared = Arc::new(Mutex::new(Shared {
        state: CompletionState::Pending,
        outcome: None,
        waker: None,
    }));
    (
        Completer {
            shared: Arc::clone(&shared),
        },
        CompletionSignal { shared },
    )
}

/// The resolving half. Consumed by [`Completer::resolve`], so a session can
/// resolve its signal at most once.
#[derive(Debug)]
pub struct Completer {
    shared: Arc<Mutex<Shared>>,
}

impl Completer {
    pub fn resolve(self, outcome: SessionResult) {
        let waker = {
            let mut shared = self.shared.lock();
            debug_assert_eq!(shared.state, CompletionState::Pending);
            shared.state = match outcome {
                Ok(_) => CompletionState::Resolved,
                Err(_) => CompletionState::Rejected,
            };
            shared.outcome = Some(outcome);
            shared.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// The caller's view of a session's final outcome.
///
/// Resolves exactly once; awaiting it yields the outcome, after which
/// [`CompletionSignal::state`] still reports how it resolved.
#[derive(Debug)]
pub struct CompletionSignal {
    shared: Arc<Mutex<Shared>>,
}

impl CompletionSignal {
    pub fn state(&self) -> CompletionState {
        self.shared.lock().state
    }

    pub fn is_pending(&self) -> bool {
        self.state() == CompletionState::Pending
    }
}

impl Future for CompletionSignal {
    type Output = SessionResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.lock();
        match shared.outcome.take() {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                shared.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}
