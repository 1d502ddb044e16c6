//! Multi-listener observer lists.
//!
//! Delivery iterates a snapshot of the current subscribers, so a callback may
//! subscribe or unsubscribe (itself or others) while an event is in flight.
//! No lock is held while a callback runs.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entries<E> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<E>)>,
}

/// An ordered list of callbacks that all receive every emitted event.
pub struct ObserverList<E> {
    inner: Arc<Mutex<Entries<E>>>,
}

impl<E: 'static> ObserverList<E> {
    /// Create an empty observer list.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Entries {
                next_id: 1,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Register a callback. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut entries = lock(&self.inner);
            let id = entries.next_id;
            entries.next_id += 1;
            entries.callbacks.push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<Entries<E>>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner).callbacks.retain(|(entry, _)| *entry != id);
                }
            })),
        }
    }

    /// Deliver an event to every subscriber registered at the time of the call.
    ///
    /// Returns the number of callbacks invoked.
    pub fn emit(&self, event: &E) -> usize {
        let snapshot: Vec<Callback<E>> = lock(&self.inner)
            .callbacks
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in &snapshot {
            callback(event);
        }
        snapshot.len()
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        lock(&self.inner).callbacks.len()
    }

    /// Returns true if no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every callback. Outstanding subscriptions become no-ops.
    pub fn clear(&self) {
        lock(&self.inner).callbacks.clear();
    }
}

impl<E: 'static> Default for ObserverList<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for ObserverList<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> fmt::Debug for ObserverList<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverList")
            .field("len", &lock(&self.inner).callbacks.len())
            .finish()
    }
}

/// Unsubscribe token returned by [`ObserverList::subscribe`].
///
/// Dropping the token removes the callback.
#[must_use = "dropping a Subscription immediately unsubscribes the callback"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Remove the callback now.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn emit_reaches_every_subscriber() {
        let list = ObserverList::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t1 = Arc::clone(&total);
        let _a = list.subscribe(move |v| {
            t1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let t2 = Arc::clone(&total);
        let _b = list.subscribe(move |v| {
            t2.fetch_add(*v as usize * 10, Ordering::SeqCst);
        });

        assert_eq!(list.emit(&2), 2);
        assert_eq!(total.load(Ordering::SeqCst), 22);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let list = ObserverList::<()>::new();
        let sub = list.subscribe(|_| {});
        assert_eq!(list.len(), 1);
        drop(sub);
        assert!(list.is_empty());
    }

    #[test]
    fn explicit_unsubscribe_only_removes_its_callback() {
        let list = ObserverList::<()>::new();
        let first = list.subscribe(|_| {});
        let _second = list.subscribe(|_| {});
        first.unsubscribe();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn subscribe_during_emit_does_not_see_current_event() {
        let list = ObserverList::<()>::new();
        let late_calls = Arc::new(AtomicUsize::new(0));
        let held = Arc::new(Mutex::new(Vec::new()));

        let list_clone = list.clone();
        let late = Arc::clone(&late_calls);
        let held_clone = Arc::clone(&held);
        let _outer = list.subscribe(move |_| {
            let late = Arc::clone(&late);
            let sub = list_clone.subscribe(move |_| {
                late.fetch_add(1, Ordering::SeqCst);
            });
            lock(&held_clone).push(sub);
        });

        assert_eq!(list.emit(&()), 1);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn subscription_outliving_list_is_harmless() {
        let list = ObserverList::<()>::new();
        let sub = list.subscribe(|_| {});
        drop(list);
        sub.unsubscribe();
    }
}
