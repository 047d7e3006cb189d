//! Cooperative shutdown for the pipeline threads.
//!
//! A [`StopSource`] hands out [`StopToken`]s. Nothing is ever sent on the
//! underlying channel: stopping drops the sender, which disconnects every
//! token at once and wakes anything parked in [`StopToken::sleep`].

use std::{
    sync::{Mutex, PoisonError},
    thread,
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct StopSource {
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

#[derive(Clone, Debug)]
pub struct StopToken {
    receiver: Receiver<()>,
}

impl StopSource {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            receiver: self.receiver.clone(),
        }
    }

    /// Idempotent
    pub fn stop(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Wait for `timeout` or until stopped, whichever is first.
    /// Returns `true` if the wait was cut short by a stop.
    pub fn sleep(&self, timeout: Duration) -> bool {
        matches!(
            self.receiver.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

/// A named pipeline thread that can be joined with a deadline
#[derive(Debug)]
pub struct Worker {
    name: String,
    handle: thread::JoinHandle<()>,
    // Disconnects when the thread body returns (or unwinds)
    done: Receiver<()>,
}

impl Worker {
    pub fn spawn<F>(name: &str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let _done = done_tx;
                body();
            })?;
        Ok(Self {
            name: name.to_owned(),
            handle,
            done,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Join the thread if it finishes within `timeout`, otherwise leave it detached.
    /// Returns whether the thread finished cleanly.
    pub fn join_timeout(self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => match self.handle.join() {
                Ok(()) => {
                    debug!(worker = %self.name, "Worker exited");
                    true
                }
                Err(_) => {
                    warn!(worker = %self.name, "Worker panicked");
                    false
                }
            },
            _ => {
                warn!(worker = %self.name, ?timeout, "Worker did not exit in time, detaching");
                false
            }
        }
    }
}
