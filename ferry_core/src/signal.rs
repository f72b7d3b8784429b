//! Interrupt and fatal-signal interception.
//!
//! Stop signals (SIGINT, SIGTERM) only record themselves in a process-wide
//! flag that the bridges read between iterations. Fatal hardware faults
//! (SIGSEGV, SIGBUS) never return into the faulting frame: the handler
//! writes one fixed line to stderr, gives the driving loop's fatal hook a
//! chance to persist the input and ends the process.
//!
//! Handlers are async-signal-safe: atomics, `write(2)` and `_exit(2)` only.

use crate::driver::FatalSignalHook;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::task::{Context, Poll};

static SIGNAL_STATE: AtomicI32 = AtomicI32::new(0);
static IN_TARGET: AtomicBool = AtomicBool::new(false);
static FATAL_HOOK: AtomicUsize = AtomicUsize::new(0);

/// What the signal handlers have recorded since the last [`Interceptor::install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    None,
    Interrupt,
    /// A non-interrupt, non-fatal signal asked the session to stop.
    Stop(i32),
    Fatal(i32),
}

impl SignalState {
    /// The code handed to a stop handler, if this state ends a session.
    pub fn stop_code(self) -> Option<i32> {
        match self {
            SignalState::Interrupt => Some(0),
            SignalState::Stop(signum) => Some(signum),
            SignalState::None | SignalState::Fatal(_) => None,
        }
    }
}

pub fn current() -> SignalState {
    classify(SIGNAL_STATE.load(Ordering::Acquire))
}

fn classify(signum: i32) -> SignalState {
    match signum {
        0 => SignalState::None,
        s if platform::is_interrupt(s) => SignalState::Interrupt,
        s if platform::is_fatal(s) => SignalState::Fatal(s),
        s => SignalState::Stop(s),
    }
}

/// Ends the process the way the fatal handler does. Used when a fatal state
/// is observed outside the handler itself.
pub fn terminate_fatal(signum: i32) -> ! {
    platform::fatal_exit(signum)
}

/// Installed handlers; dropping restores whatever was there before.
pub struct Interceptor {
    previous: Vec<platform::SavedAction>,
}

impl Interceptor {
    /// Installs the handlers and resets the recorded state.
    pub fn install(fatal_hook: Option<FatalSignalHook>) -> io::Result<Self> {
        SIGNAL_STATE.store(0, Ordering::Release);
        FATAL_HOOK.store(fatal_hook.map_or(0, |hook| hook as usize), Ordering::Release);
        let previous = platform::install_all()?;
        Ok(Self { previous })
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        for saved in self.previous.drain(..) {
            platform::restore(saved);
        }
        FATAL_HOOK.store(0, Ordering::Release);
    }
}

struct RegionGuard {
    was_in_target: bool,
}

impl RegionGuard {
    fn enter() -> Self {
        Self {
            was_in_target: IN_TARGET.swap(true, Ordering::AcqRel),
        }
    }
}

impl Drop for RegionGuard {
    fn drop(&mut self) {
        IN_TARGET.store(self.was_in_target, Ordering::Release);
    }
}

/// Runs `f` as fuzz target code. A fatal fault inside it abandons the call
/// and terminates the process; there is no way back into `f`.
pub fn guarded<R>(f: impl FnOnce() -> R) -> R {
    let _region = RegionGuard::enter();
    f()
}

/// A future whose every poll runs inside a guarded region.
pub struct Guarded<F> {
    inner: F,
}

impl<F> Guarded<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F: Future + Unpin> Future for Guarded<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let _region = RegionGuard::enter();
        Pin::new(&mut self.inner).poll(cx)
    }
}

#[cfg(unix)]
mod platform {
    use super::{FATAL_HOOK, IN_TARGET, SIGNAL_STATE};
    use crate::driver::{EXIT_FATAL_SIGNAL, FatalSignalHook};
    use std::io;
    use std::sync::atomic::Ordering;

    const STOP_SIGNALS: [libc::c_int; 2] = [libc::SIGINT, libc::SIGTERM];
    const FATAL_SIGNALS: [libc::c_int; 2] = [libc::SIGSEGV, libc::SIGBUS];

    pub(super) struct SavedAction {
        signum: libc::c_int,
        action: libc::sigaction,
    }

    pub(super) fn is_interrupt(signum: i32) -> bool {
        signum == libc::SIGINT
    }

    pub(super) fn is_fatal(signum: i32) -> bool {
        FATAL_SIGNALS.contains(&signum)
    }

    extern "C" fn on_stop_signal(signum: libc::c_int) {
        SIGNAL_STATE.store(signum, Ordering::Release);
    }

    extern "C" fn on_fatal_signal(signum: libc::c_int) {
        SIGNAL_STATE.store(signum, Ordering::Release);
        fatal_exit(signum)
    }

    pub(super) fn fatal_exit(signum: i32) -> ! {
        let line: &[u8] = match (IN_TARGET.load(Ordering::Acquire), signum) {
            (true, libc::SIGBUS) => b"Bus error found in fuzz target\n",
            (true, _) => b"Segmentation fault found in fuzz target\n",
            (false, _) => b"Fatal signal outside of the fuzz target\n",
        };
        // SAFETY: write(2) is async-signal-safe and `line` is a valid buffer.
        unsafe {
            libc::write(libc::STDERR_FILENO, line.as_ptr().cast(), line.len());
        }
        let hook = FATAL_HOOK.load(Ordering::Acquire);
        if hook != 0 {
            // SAFETY: only `Interceptor::install` stores non-zero values, and
            // it stores a `FatalSignalHook` cast to usize.
            let hook = unsafe { std::mem::transmute::<usize, FatalSignalHook>(hook) };
            hook();
        }
        // SAFETY: _exit is async-signal-safe and never returns.
        unsafe { libc::_exit(EXIT_FATAL_SIGNAL) }
    }

    fn install(
        signum: libc::c_int,
        handler: extern "C" fn(libc::c_int),
        flags: libc::c_int,
    ) -> io::Result<SavedAction> {
        // SAFETY: both sigaction structs are fully initialised (zeroed, then
        // filled) before the call, and the handler only touches atomics and
        // async-signal-safe libc functions.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as libc::sighandler_t;
            action.sa_flags = flags;
            libc::sigemptyset(&mut action.sa_mask);
            let mut previous: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(signum, &action, &mut previous) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(SavedAction {
                signum,
                action: previous,
            })
        }
    }

    pub(super) fn install_all() -> io::Result<Vec<SavedAction>> {
        let mut saved = Vec::with_capacity(STOP_SIGNALS.len() + FATAL_SIGNALS.len());
        let installs = STOP_SIGNALS
            .iter()
            .map(|&s| (s, on_stop_signal as extern "C" fn(libc::c_int), libc::SA_RESTART))
            .chain(
                FATAL_SIGNALS
                    .iter()
                    .map(|&s| (s, on_fatal_signal as extern "C" fn(libc::c_int), libc::SA_ONSTACK)),
            );
        for (signum, handler, flags) in installs {
            match install(signum, handler, flags) {
                Ok(action) => saved.push(action),
                Err(e) => {
                    for action in saved.drain(..) {
                        restore(action);
                    }
                    return Err(e);
                }
            }
        }
        Ok(saved)
    }

    pub(super) fn restore(saved: SavedAction) {
        // SAFETY: `saved.action` was filled in by a successful sigaction call.
        unsafe {
            libc::sigaction(saved.signum, &saved.action, std::ptr::null_mut());
        }
    }
}

#[cfg(not(unix))]
mod platform {
    use crate::driver::EXIT_FATAL_SIGNAL;
    use std::io;

    pub(super) struct SavedAction;

    pub(super) fn is_interrupt(_signum: i32) -> bool {
        false
    }

    pub(super) fn is_fatal(_signum: i32) -> bool {
        false
    }

    pub(super) fn fatal_exit(_signum: i32) -> ! {
        eprintln!("Segmentation fault found in fuzz target");
        std::process::exit(EXIT_FATAL_SIGNAL)
    }

    pub(super) fn install_all() -> io::Result<Vec<SavedAction>> {
        Ok(Vec::new())
    }

    pub(super) fn restore(_saved: SavedAction) {}
}
