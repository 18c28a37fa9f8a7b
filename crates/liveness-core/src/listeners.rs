//! Ordered callback registry with copy-before-iterate delivery.

use std::sync::{Arc, Mutex, MutexGuard};

/// Handle returned by [`ListenerRegistry::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

/// Callback invoked with each delivered event.
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

struct Registry<E> {
    next_id: u64,
    entries: Vec<(SubscriptionHandle, Listener<E>)>,
}

/// Insertion-ordered set of listeners.
///
/// [`notify`](Self::notify) snapshots the listener list before calling out, so
/// listeners may subscribe or unsubscribe from inside a callback without
/// disturbing the pass in progress. No internal lock is held while a callback
/// runs.
pub struct ListenerRegistry<E> {
    inner: Mutex<Registry<E>>,
}

impl<E> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Registry {
                next_id: 1,
                entries: Vec::new(),
            }),
        }
    }
}

impl<E> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry<E>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let handle = SubscriptionHandle(registry.next_id);
        registry.next_id += 1;
        registry.entries.push((handle, Arc::new(listener)));
        handle
    }

    /// Remove a listener. Returns `false` when the handle was unknown.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut registry = self.lock();
        let before = registry.entries.len();
        registry.entries.retain(|(existing, _)| *existing != handle);
        registry.entries.len() != before
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current listeners in subscription order.
    pub fn snapshot(&self) -> Vec<Listener<E>> {
        self.lock()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    /// Deliver `event` to every listener registered at call time, in order.
    pub fn notify(&self, event: &E) {
        for listener in self.snapshot() {
            listener(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn delivers_in_subscription_order() {
        let registry = ListenerRegistry::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            registry.subscribe(move |value: &u32| {
                seen.lock().expect("seen lock").push(format!("{tag}{value}"));
            });
        }

        registry.notify(&7);
        assert_eq!(*seen.lock().expect("seen lock"), vec!["a7", "b7", "c7"]);
    }

    #[test]
    fn unsubscribed_listener_is_not_called() {
        let registry = ListenerRegistry::<()>::new();
        let hits = Arc::new(Mutex::new(0));
        let hits_clone = Arc::clone(&hits);
        let handle = registry.subscribe(move |_| *hits_clone.lock().expect("hits lock") += 1);

        registry.notify(&());
        assert!(registry.unsubscribe(handle));
        assert!(!registry.unsubscribe(handle));
        registry.notify(&());

        assert_eq!(*hits.lock().expect("hits lock"), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn mutation_during_notify_does_not_disturb_current_pass() {
        let registry = Arc::new(ListenerRegistry::<()>::new());
        let calls = Arc::new(Mutex::new(Vec::new()));

        let registry_for_first = Arc::clone(&registry);
        let calls_for_first = Arc::clone(&calls);
        let first = registry.subscribe(move |_| {
            calls_for_first.lock().expect("calls lock").push("first");
            let calls_for_late = Arc::clone(&calls_for_first);
            registry_for_first.subscribe(move |_| {
                calls_for_late.lock().expect("calls lock").push("late");
            });
        });
        let calls_for_second = Arc::clone(&calls);
        registry.subscribe(move |_| {
            calls_for_second.lock().expect("calls lock").push("second");
        });

        registry.notify(&());
        assert_eq!(*calls.lock().expect("calls lock"), vec!["first", "second"]);

        registry.unsubscribe(first);
        calls.lock().expect("calls lock").clear();
        registry.notify(&());
        assert_eq!(*calls.lock().expect("calls lock"), vec!["second", "late"]);
    }

    #[test]
    fn clear_drops_everything() {
        let registry = ListenerRegistry::<u8>::new();
        registry.subscribe(|_| {});
        registry.subscribe(|_| {});
        assert_eq!(registry.len(), 2);
        registry.clear();
        assert!(registry.is_empty());
    }
}
