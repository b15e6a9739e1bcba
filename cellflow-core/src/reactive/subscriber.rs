//! Subscriber identity and subscription guards.
//!
//! Every listener registered on a cell gets a [`SubscriberId`]. The
//! [`Subscription`] returned by `subscribe` removes the listener again, either
//! explicitly through [`Subscription::unsubscribe`] or when the guard is dropped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::value::ValueOrError;

/// Unique identifier for a subscriber.
///
/// Ids are allocated from a global counter, so they are unique across cells and
/// threads. A cell keys its subscriber set by id, which keeps removal independent
/// of callback identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener callback as stored by a cell.
///
/// `None` means the producer reset the cell to "no value".
pub(crate) type Callback<T> = Arc<dyn Fn(Option<&ValueOrError<T>>) + Send + Sync>;

type Release = Box<dyn FnOnce() + Send>;

/// Handle to a registered listener.
///
/// Dropping the handle unsubscribes. Unsubscribing twice is a no-op.
#[must_use = "dropping a Subscription unsubscribes the listener immediately"]
pub struct Subscription {
    release: Mutex<Option<Release>>,
}

impl Subscription {
    pub(crate) fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    /// Remove the listener. If it was the cell's last one, the cell deactivates.
    pub fn unsubscribe(&self) {
        let release = self.release.lock().take();
        if let Some(release) = release {
            release();
        }
    }

    /// Whether the listener is still registered through this handle.
    pub fn is_active(&self) -> bool {
        self.release.lock().is_some()
    }

    /// Keep the listener registered for as long as the cell lives.
    pub fn detach(self) {
        self.release.lock().take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.get_mut().take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
