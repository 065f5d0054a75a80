//! Copy-on-write listener lists with disposable registration handles.
//!
//! Notification takes a snapshot of the list, so subscribers may unsubscribe
//! during a notification without invalidating the traversal. Listeners run
//! in registration order; a panicking listener is logged and skipped.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

type Entries<T> = Vec<(u64, Arc<dyn Fn(&T) + Send + Sync>)>;

/// An ordered list of listeners over events of type `T`.
pub struct ListenerList<T> {
    entries: Arc<Mutex<Entries<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for ListenerList<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T: 'static> ListenerList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Dropping (or releasing) the returned handle
    /// removes it.
    pub fn register(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, Arc::new(listener)));
        ListenerHandle {
            remove: Box::new(ListRemover {
                entries: Arc::downgrade(&self.entries),
                id,
            }),
        }
    }

    /// Notify every listener, outside the list lock, in registration order.
    pub fn notify(&self, event: &T) {
        let snapshot: Entries<T> = self.entries.lock().clone();
        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(listener = id, "Listener panicked during notification; skipped");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

trait Remover: Send + Sync {
    fn remove(&self);
}

struct ListRemover<T> {
    entries: Weak<Mutex<Entries<T>>>,
    id: u64,
}

impl<T> Remover for ListRemover<T> {
    fn remove(&self) {
        if let Some(entries) = self.entries.upgrade() {
            entries.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// Handle returned by listener registration. Releasing it (explicitly or by
/// drop) removes the listener.
pub struct ListenerHandle {
    remove: Box<dyn Remover>,
}

impl ListenerHandle {
    /// Remove the listener now.
    pub fn unsubscribe(self) {
        // Removal happens in Drop.
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.remove.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_notify_in_registration_order() {
        let list: ListenerList<u32> = ListenerList::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let order = Arc::clone(&order);
            list.register(move |_| order.lock().push("first"))
        };
        let second = {
            let order = Arc::clone(&order);
            list.register(move |_| order.lock().push("second"))
        };

        list.notify(&1);
        assert_eq!(*order.lock(), vec!["first", "second"]);
        drop(first);
        drop(second);
    }

    #[test]
    fn test_handle_release_removes_listener() {
        let list: ListenerList<u32> = ListenerList::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let handle = {
            let calls = Arc::clone(&calls);
            list.register(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        list.notify(&1);
        handle.unsubscribe();
        list.notify(&2);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn test_panicking_listener_is_skipped() {
        let list: ListenerList<u32> = ListenerList::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let _bad = list.register(|_| panic!("listener failure"));
        let _good = {
            let calls = Arc::clone(&calls);
            list.register(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        list.notify(&1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_during_notification() {
        let list: Arc<ListenerList<u32>> = Arc::new(ListenerList::new());
        let slot: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));

        let handle = {
            let slot = Arc::clone(&slot);
            list.register(move |_| {
                // Listener drops its own handle mid-notification.
                slot.lock().take();
            })
        };
        *slot.lock() = Some(handle);

        list.notify(&1);
        assert!(list.is_empty());
    }
}
