//! Single-resolution completion.
//!
//! A [`Completer`] hands exactly one value to a waiting [`oneshot::Receiver`].
//! It is shared by reference with the listener that resolves it, so the
//! resolve-once guard lives here rather than in the listener.

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Outcome of [`Completer::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    /// This call resolved the completer and the receiver got the value.
    Delivered,
    /// This call resolved the completer, but the receiver was already gone.
    Abandoned,
    /// An earlier call already resolved the completer.
    AlreadyComplete,
}

impl Completion {
    pub(crate) fn resolved_now(self) -> bool {
        !matches!(self, Completion::AlreadyComplete)
    }
}

pub(crate) struct Completer<T> {
    sender: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Completer<T> {
    pub(crate) fn new() -> (Self, oneshot::Receiver<T>) {
        let (sender, receiver) = oneshot::channel();
        let completer = Self {
            sender: Mutex::new(Some(sender)),
        };
        (completer, receiver)
    }

    pub(crate) fn complete(&self, value: T) -> Completion {
        let sender = self.sender.lock().take();
        match sender {
            Some(sender) => match sender.send(value) {
                Ok(()) => Completion::Delivered,
                Err(_) => Completion::Abandoned,
            },
            None => Completion::AlreadyComplete,
        }
    }
}
