//! The per-iteration handoff unit between the driving loop and the host.

use crate::host::InteropError;
use crate::input::{FuzzData, FuzzInput};
use crate::target::Settlement;
use futures::channel::oneshot;
use futures::executor::block_on;

/// One iteration's input plus the handle that settles it.
#[derive(Debug)]
pub struct CallEnvelope {
    input: FuzzData,
    completion: CompletionHandle,
}

impl CallEnvelope {
    /// Copies `input` out of the driving loop's storage and pairs the
    /// envelope with the waiter the loop blocks on.
    pub fn new(input: FuzzInput<'_>) -> (CallEnvelope, PendingCall) {
        let (tx, rx) = oneshot::channel();
        let envelope = CallEnvelope {
            input: input.to_owned_data(),
            completion: CompletionHandle { tx },
        };
        (envelope, PendingCall { rx })
    }

    pub fn len(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    pub fn into_parts(self) -> (FuzzData, CompletionHandle) {
        (self.input, self.completion)
    }
}

/// Single-use settle handle; dropping it unsettled counts as an abandoned
/// envelope on the waiting side.
#[derive(Debug)]
pub struct CompletionHandle {
    tx: oneshot::Sender<Settlement>,
}

impl CompletionHandle {
    pub fn settle(self, settlement: Settlement) -> Result<(), InteropError> {
        self.tx
            .send(settlement)
            .map_err(|_| InteropError::WaiterGone)
    }
}

/// The driving loop's side of an envelope in flight.
#[derive(Debug)]
pub struct PendingCall {
    rx: oneshot::Receiver<Settlement>,
}

impl PendingCall {
    /// Blocks the calling thread until the host settles the envelope.
    pub fn wait(self) -> Result<Settlement, InteropError> {
        block_on(self.rx).map_err(|_| InteropError::EnvelopeAbandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn settled_on_another_thread() {
        let storage = vec![1u8, 2, 3];
        let (envelope, pending) = CallEnvelope::new(FuzzInput::new(&storage));
        assert_eq!(envelope.len(), 3);
        let host = thread::spawn(move || {
            let (data, handle) = envelope.into_parts();
            assert_eq!(&*data, &[1, 2, 3]);
            handle.settle(Settlement::Stop).unwrap();
        });
        assert_eq!(pending.wait().unwrap(), Settlement::Stop);
        host.join().unwrap();
    }

    #[test]
    fn dropping_the_envelope_is_an_interop_failure() {
        let (envelope, pending) = CallEnvelope::new(FuzzInput::new(b""));
        assert!(envelope.is_empty());
        drop(envelope);
        assert!(matches!(
            pending.wait(),
            Err(InteropError::EnvelopeAbandoned)
        ));
    }

    #[test]
    fn settling_after_the_waiter_left_fails() {
        let (envelope, pending) = CallEnvelope::new(FuzzInput::new(b"x"));
        drop(pending);
        let (_data, handle) = envelope.into_parts();
        assert!(matches!(
            handle.settle(Settlement::Continue),
            Err(InteropError::WaiterGone)
        ));
    }
}
