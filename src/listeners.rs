//! Registered event listeners
//!
//! Listeners run synchronously on the dispatcher's task, in registration
//! order. A panicking listener is logged and skipped; the rest still run.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::error;

/// Handle returned on registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub(crate) struct Listeners<E> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Listener<E>)>>,
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((id, Arc::new(listener)));
        }
        id
    }

    /// Returns false when `id` was not registered
    pub fn remove(&self, id: ListenerId) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    /// Deliver `event` to every listener. The list is snapshotted first so a
    /// listener may register or unregister without deadlocking.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = match self.entries.lock() {
            Ok(entries) => entries.iter().map(|(_, listener)| Arc::clone(listener)).collect(),
            Err(_) => return,
        };
        for listener in snapshot {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!("Event listener panicked; continuing with the next one");
            }
        }
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_in_registration_order() {
        let listeners = Listeners::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            listeners.add(move |value: &u32| seen.lock().unwrap().push(format!("{tag}:{value}")));
        }
        listeners.emit(&7);

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:7", "second:7", "third:7"]
        );
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let listeners = Listeners::<&'static str>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        listeners.add(|_: &&str| panic!("listener failure"));
        let sink = Arc::clone(&seen);
        listeners.add(move |event: &&str| sink.lock().unwrap().push(event.to_string()));

        listeners.emit(&"a");
        listeners.emit(&"b");
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_remove_and_clear() {
        let listeners = Listeners::<()>::new();
        let first = listeners.add(|_| {});
        let second = listeners.add(|_| {});
        assert_eq!(listeners.len(), 2);

        assert!(listeners.remove(first));
        assert!(!listeners.remove(first));
        assert_eq!(listeners.len(), 1);

        listeners.clear();
        assert!(!listeners.remove(second));
        assert_eq!(listeners.len(), 0);
    }

    #[test]
    fn test_listener_can_unregister_itself_during_emit() {
        let listeners = Arc::new(Listeners::<()>::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let handle = Arc::clone(&listeners);
        let own_id = Arc::clone(&slot);
        let id = listeners.add(move |_| {
            if let Some(id) = *own_id.lock().unwrap() {
                handle.remove(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        listeners.emit(&());
        assert_eq!(listeners.len(), 0);
    }
}
