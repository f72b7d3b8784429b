//! The host thread: a single-threaded executor that owns every fuzz target
//! call, and the single-slot queue the driving loop uses to reach it.

use crate::driver::{DriverError, DriverExit};
use crate::envelope::CallEnvelope;
use futures::SinkExt;
use futures::channel::mpsc;
use futures::executor::{LocalPool, LocalSpawner, block_on};
use futures::task::{LocalSpawnExt, SpawnError};
use std::future::Future;
use thiserror::Error;

/// Broken bridge invariants. None of these reach a completion signal; they
/// end the process through [`crate::driver::interop_failure`].
#[derive(Error, Debug)]
pub enum InteropError {
    #[error("host queue is closed; the host was torn down mid-session")]
    HostClosed,
    #[error("envelope was dropped without being settled")]
    EnvelopeAbandoned,
    #[error("driving loop stopped waiting before its envelope was settled")]
    WaiterGone,
    #[error("driving loop thread exited without reporting")]
    DriverVanished,
    #[error("could not start the driving loop thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),
    #[error("could not schedule work on the host: {0}")]
    Spawn(#[from] SpawnError),
    #[error("driving loop failed: {0}")]
    Driver(#[from] DriverError),
}

/// The designated execution context for fuzz target calls.
///
/// A `Host` is not `Send`: whatever runs on it stays on the thread that
/// created it. Other host work can be scheduled through [`Host::spawner`]
/// and interleaves with callback deliveries.
pub struct Host {
    pool: LocalPool,
}

impl Host {
    pub fn new() -> Self {
        Self {
            pool: LocalPool::new(),
        }
    }

    pub fn spawner(&self) -> LocalSpawner {
        self.pool.spawner()
    }

    pub(crate) fn spawn<F>(&self, future: F) -> Result<(), SpawnError>
    where
        F: Future<Output = ()> + 'static,
    {
        self.pool.spawner().spawn_local(future)
    }

    /// Runs host work until `future` completes.
    pub fn run_until<F: Future>(&mut self, future: F) -> F::Output {
        self.pool.run_until(future)
    }

    /// Runs host work until nothing can make progress without outside input.
    pub fn run_until_stalled(&mut self) {
        self.pool.run_until_stalled();
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub(crate) enum HostMessage {
    Call(CallEnvelope),
    Finished(Result<DriverExit, DriverError>),
}

/// Builds the single-slot queue towards the host.
pub(crate) fn queue() -> (HostSender, HostReceiver) {
    // A bounded futures channel holds `buffer + senders` messages; with one
    // sender and no buffer that is exactly one slot.
    let (tx, rx) = mpsc::channel(0);
    (HostSender { tx }, rx)
}

pub(crate) type HostReceiver = mpsc::Receiver<HostMessage>;

#[derive(Debug)]
pub(crate) struct HostSender {
    tx: mpsc::Sender<HostMessage>,
}

impl HostSender {
    /// Blocks until the message occupies the slot.
    pub(crate) fn deliver(&mut self, message: HostMessage) -> Result<(), InteropError> {
        block_on(self.tx.send(message)).map_err(|_| InteropError::HostClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::FuzzInput;
    use futures::StreamExt;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::thread;

    #[test]
    fn messages_arrive_in_delivery_order() {
        let (mut tx, mut rx) = queue();
        let sender = thread::spawn(move || {
            for i in 0u8..5 {
                let (envelope, _pending) = CallEnvelope::new(FuzzInput::new(&[i]));
                tx.deliver(HostMessage::Call(envelope)).unwrap();
            }
            tx.deliver(HostMessage::Finished(Ok(DriverExit::exhausted())))
                .unwrap();
        });

        let mut host = Host::new();
        let seen = host.run_until(async {
            let mut seen = Vec::new();
            while let Some(message) = rx.next().await {
                match message {
                    HostMessage::Call(envelope) => {
                        let (data, _handle) = envelope.into_parts();
                        seen.push(data[0]);
                    }
                    HostMessage::Finished(_) => break,
                }
            }
            seen
        });
        sender.join().unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn delivery_fails_once_the_host_is_gone() {
        let (mut tx, rx) = queue();
        drop(rx);
        let result = tx.deliver(HostMessage::Finished(Ok(DriverExit::exhausted())));
        assert!(matches!(result, Err(InteropError::HostClosed)));
    }

    #[test]
    fn spawned_host_work_runs_on_the_host() {
        let mut host = Host::new();
        let ran = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&ran);
        host.spawn(async move {
            *flag.borrow_mut() = true;
        })
        .unwrap();
        host.run_until_stalled();
        assert!(*ran.borrow());
    }
}
