//! The observer fabric: keyed subscriber lists with fan-out.

use std::sync::Arc;

/// An opaque, caller-chosen equality witness identifying a subscription.
///
/// Keys must be unique per (proxy, subscription kind); that is the caller's
/// contract. Subscribing again under a live key replaces the prior entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberKey(u64);

impl SubscriberKey {
    pub const fn new(raw: u64) -> Self {
        SubscriberKey(raw)
    }
}

impl From<u64> for SubscriberKey {
    fn from(raw: u64) -> Self {
        SubscriberKey(raw)
    }
}

/// A keyed list of observers, kept in subscription order.
pub(crate) struct SubscriberSet<T: ?Sized> {
    entries: Vec<(SubscriberKey, Arc<T>)>,
}

impl<T: ?Sized> Default for SubscriberSet<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T: ?Sized> SubscriberSet<T> {
    /// Insert an observer under the given key, replacing a prior entry with
    /// the same key in place.
    pub(crate) fn insert(&mut self, key: SubscriberKey, observer: Arc<T>) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = observer,
            None => self.entries.push((key, observer)),
        }
    }

    pub(crate) fn remove(&mut self, key: SubscriberKey) {
        self.entries.retain(|(k, _)| *k != key);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy the observer list for fan-out. Notifications may re-enter the
    /// proxy (unsubscribe during dispatch); iterating a snapshot keeps that
    /// sound.
    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries.iter().map(|(_, observer)| observer.clone()).collect()
    }
}
