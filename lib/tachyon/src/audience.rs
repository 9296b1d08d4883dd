//! Observer audiences. A subject owns one audience per event kind and
//! notifies it when the event occurs; observers are `(target, callback)`
//! pairs where the callback is a plain function receiving the target and
//! the event payload.
//!
//! The audience holds only a weak reference to each target, so dropping an
//! observer object removes it from every audience it joined without any
//! explicit bookkeeping; dead entries are pruned during the next walk.

use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

type ObserverKey = (usize, usize);

struct Observer<E> {
    key: ObserverKey,
    target: Weak<dyn Any + Send + Sync>,
    call: Box<dyn Fn(&E) + Send + Sync>,
}

/// A mutex-protected set of observers, kept sorted by (target pointer,
/// callback pointer). Notifications are delivered in that order, and
/// concurrent notifications on the same audience are serialized by the
/// internal lock.
///
/// Callbacks must not insert into or remove from the audience that is
/// currently notifying them.
pub struct Audience<E: 'static> {
    observers: Mutex<Vec<Observer<E>>>,
}

impl<E: 'static> Audience<E> {
    pub fn new() -> Audience<E> {
        Audience {
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Adds the `(target, callback)` pair. Returns false if the exact pair
    /// is already present, leaving the audience unchanged.
    pub fn insert<T>(&self, target: &Arc<T>, callback: fn(&Arc<T>, &E)) -> bool
    where
        T: Any + Send + Sync,
    {
        let key = Self::key_of(target, callback);
        let mut observers = self.observers.lock().unwrap();
        match observers.binary_search_by_key(&key, |obs| obs.key) {
            Ok(_) => false,
            Err(at) => {
                let weak = Arc::downgrade(target);
                let target: Weak<dyn Any + Send + Sync> = weak.clone();
                observers.insert(
                    at,
                    Observer {
                        key,
                        target,
                        call: Box::new(move |event| {
                            if let Some(target) = weak.upgrade() {
                                callback(&target, event);
                            }
                        }),
                    },
                );
                true
            }
        }
    }

    /// Removes exactly the `(target, callback)` pair. Returns whether it
    /// was present.
    pub fn remove<T>(&self, target: &Arc<T>, callback: fn(&Arc<T>, &E)) -> bool
    where
        T: Any + Send + Sync,
    {
        let key = Self::key_of(target, callback);
        let mut observers = self.observers.lock().unwrap();
        match observers.binary_search_by_key(&key, |obs| obs.key) {
            Ok(at) => {
                observers.remove(at);
                true
            }
            Err(_) => false,
        }
    }

    /// Removes every pair registered for `target`. Returns the number of
    /// pairs removed.
    pub fn remove_target<T>(&self, target: &Arc<T>) -> usize
    where
        T: Any + Send + Sync,
    {
        let ptr = Arc::as_ptr(target) as *const () as usize;
        let mut observers = self.observers.lock().unwrap();
        let before = observers.len();
        observers.retain(|obs| obs.key.0 != ptr);
        before - observers.len()
    }

    /// Delivers `event` to every live observer in key order. Observers
    /// whose target has been dropped are pruned first.
    pub fn notify(&self, event: &E) {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|obs| obs.target.strong_count() > 0);
        for obs in observers.iter() {
            (obs.call)(event);
        }
    }

    /// Number of live observers.
    pub fn len(&self) -> usize {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|obs| obs.target.strong_count() > 0);
        observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn key_of<T>(target: &Arc<T>, callback: fn(&Arc<T>, &E)) -> ObserverKey {
        (Arc::as_ptr(target) as *const () as usize, callback as usize)
    }
}
