//! A copy of the most recent input that can be written out from inside the
//! fatal-signal handler.
//!
//! The handler may not allocate or take locks, so the prefix and the input
//! live in static storage that is reserved when the slot is armed. Writers
//! and the handler share the slot through a try-lock: whoever finds it busy
//! skips its turn instead of waiting.

use crate::driver::FatalSignalHook;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

/// Longest artifact prefix the slot can hold.
const PREFIX_CAPACITY: usize = 512;
const NAME_PREFIX: &[u8] = b"crash-";
const NAME_LEN: usize = NAME_PREFIX.len() + 32;
const PATH_CAPACITY: usize = PREFIX_CAPACITY + NAME_LEN + 1;
const HEX: &[u8; 16] = b"0123456789abcdef";

struct Slot {
    busy: AtomicBool,
    armed: AtomicBool,
    prefix: UnsafeCell<[u8; PREFIX_CAPACITY]>,
    prefix_len: UnsafeCell<usize>,
    input: UnsafeCell<Vec<u8>>,
}

// SAFETY: the cells are only touched while `busy` is held.
unsafe impl Sync for Slot {}

static SLOT: Slot = Slot {
    busy: AtomicBool::new(false),
    armed: AtomicBool::new(false),
    prefix: UnsafeCell::new([0; PREFIX_CAPACITY]),
    prefix_len: UnsafeCell::new(0),
    input: UnsafeCell::new(Vec::new()),
};

struct Held;

impl Held {
    fn try_acquire() -> Option<Self> {
        SLOT.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Held)
    }
}

impl Drop for Held {
    fn drop(&mut self) {
        SLOT.busy.store(false, Ordering::Release);
    }
}

/// Reserves room for inputs up to `capacity` bytes and remembers `prefix`.
/// Returns `false` when the prefix is too long or the slot is in use.
pub(crate) fn arm(prefix: &str, capacity: usize) -> bool {
    if prefix.len() > PREFIX_CAPACITY {
        return false;
    }
    let Some(_held) = Held::try_acquire() else {
        return false;
    };
    // SAFETY: `busy` is held.
    unsafe {
        (&mut (*SLOT.prefix.get()))[..prefix.len()].copy_from_slice(prefix.as_bytes());
        *SLOT.prefix_len.get() = prefix.len();
        let input = &mut *SLOT.input.get();
        input.clear();
        input.reserve(capacity);
    }
    SLOT.armed.store(true, Ordering::Release);
    true
}

pub(crate) fn disarm() {
    SLOT.armed.store(false, Ordering::Release);
}

/// Copies `bytes` into the slot, truncated to the reserved capacity so the
/// copy never allocates.
pub(crate) fn record(bytes: &[u8]) {
    if !SLOT.armed.load(Ordering::Acquire) {
        return;
    }
    let Some(_held) = Held::try_acquire() else {
        return;
    };
    // SAFETY: `busy` is held.
    let input = unsafe { &mut *SLOT.input.get() };
    let len = bytes.len().min(input.capacity());
    input.clear();
    input.extend_from_slice(&bytes[..len]);
}

/// `<prefix>crash-<md5>` followed by a NUL byte; returns the length without
/// the NUL.
fn artifact_name(prefix: &[u8], input: &[u8], out: &mut [u8; PATH_CAPACITY]) -> usize {
    let mut at = prefix.len();
    out[..at].copy_from_slice(prefix);
    out[at..at + NAME_PREFIX.len()].copy_from_slice(NAME_PREFIX);
    at += NAME_PREFIX.len();
    for byte in md5::compute(input).0 {
        out[at] = HEX[usize::from(byte >> 4)];
        out[at + 1] = HEX[usize::from(byte & 0x0f)];
        at += 2;
    }
    out[at] = 0;
    at
}

extern "C" fn write_on_fatal_signal() {
    if !SLOT.armed.load(Ordering::Acquire) {
        return;
    }
    let Some(_held) = Held::try_acquire() else {
        return;
    };
    // SAFETY: `busy` is held.
    let (prefix, input) = unsafe {
        (
            &(&(*SLOT.prefix.get()))[..*SLOT.prefix_len.get()],
            (*SLOT.input.get()).as_slice(),
        )
    };
    let mut path = [0u8; PATH_CAPACITY];
    let len = artifact_name(prefix, input, &mut path);
    if platform::write_file(&path[..=len], input) {
        platform::write_stderr(b"==ferry== Test unit written to ");
        platform::write_stderr(&path[..len]);
        platform::write_stderr(b"\n");
    }
}

/// The hook to hand to the signal interceptor.
pub(crate) fn hook() -> FatalSignalHook {
    write_on_fatal_signal
}

#[cfg(unix)]
mod platform {
    /// `path` must end with a NUL byte.
    pub(super) fn write_file(path: &[u8], bytes: &[u8]) -> bool {
        // SAFETY: `path` is NUL-terminated; open, write and close are
        // async-signal-safe.
        unsafe {
            let fd = libc::open(
                path.as_ptr().cast(),
                libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
                0o644 as libc::c_uint,
            );
            if fd < 0 {
                return false;
            }
            let mut written = 0;
            while written < bytes.len() {
                let n = libc::write(
                    fd,
                    bytes[written..].as_ptr().cast(),
                    bytes.len() - written,
                );
                if n <= 0 {
                    break;
                }
                written += n as usize;
            }
            libc::close(fd);
            written == bytes.len()
        }
    }

    pub(super) fn write_stderr(bytes: &[u8]) {
        // SAFETY: write is async-signal-safe and `bytes` outlives the call.
        unsafe {
            libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
        }
    }
}

#[cfg(not(unix))]
mod platform {
    pub(super) fn write_file(_path: &[u8], _bytes: &[u8]) -> bool {
        false
    }

    pub(super) fn write_stderr(_bytes: &[u8]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_name_matches_the_md5_of_the_input() {
        let mut out = [0xffu8; PATH_CAPACITY];
        let len = artifact_name(b"out/", b"abc", &mut out);
        let expected = format!("out/crash-{:x}", md5::compute(b"abc"));
        assert_eq!(&out[..len], expected.as_bytes());
        assert_eq!(out[len], 0);
    }

    #[test]
    fn overlong_prefix_is_refused() {
        let prefix = "p".repeat(PREFIX_CAPACITY + 1);
        assert!(!arm(&prefix, 16));
    }
}
