// ============================================================================
// Reactive plugin settings
// ============================================================================
//
// One `Settings<T>` per plugin instance. The configuration layer mutates it
// through `update`, plugins subscribe and recompute their derived values in
// the callback. Callbacks run on the thread that performed the update, after
// the value lock has been released.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Key passed to subscribers when every field changed at once
pub const ALL_KEYS: &str = "*";

type Callback<T> = Arc<dyn Fn(&T, &str) + Send + Sync>;

struct Inner<T> {
    value: RwLock<T>,
    defaults: T,
    subscribers: Mutex<Vec<(u64, Callback<T>)>>,
    next_id: AtomicU64,
}

/// Shared, observable settings object
pub struct Settings<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Settings<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Default + Clone + Send + Sync + 'static> Default for Settings<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Default + Clone + Send + Sync + 'static> Settings<T> {
    /// Create a settings object; `reset` restores `T::default()`
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                value: RwLock::new(initial),
                defaults: T::default(),
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Snapshot of the current values
    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Read a field without cloning the whole value
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.read())
    }

    /// Mutate one named field and notify subscribers
    pub fn update(&self, key: &str, f: impl FnOnce(&mut T)) {
        let snapshot = {
            let mut value = self.inner.value.write();
            f(&mut value);
            value.clone()
        };
        self.notify(&snapshot, key);
    }

    /// Replace every field and notify subscribers with [`ALL_KEYS`]
    pub fn replace(&self, new_value: T) {
        *self.inner.value.write() = new_value.clone();
        self.notify(&new_value, ALL_KEYS);
    }

    /// Restore defaults
    pub fn reset(&self) {
        self.replace(self.inner.defaults.clone());
    }

    /// Register a change callback; dropping the returned guard unsubscribes
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T, &str) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .push((id, Arc::new(callback)));

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.subscribers.lock().retain(|(sid, _)| *sid != id);
                }
            })),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    fn notify(&self, value: &T, key: &str) {
        let callbacks: Vec<Callback<T>> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in callbacks {
            cb(value, key);
        }
    }
}

/// Guard returned by [`Settings::subscribe`]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Default, Debug, PartialEq)]
    struct Params {
        gain_db: f32,
        name: String,
    }

    #[test]
    fn test_update_notifies_with_key() {
        let settings = Settings::new(Params::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let _sub = settings.subscribe(move |p: &Params, key| {
            seen_cb.lock().push((key.to_string(), p.gain_db));
        });

        settings.update("gain_db", |p| p.gain_db = -6.0);
        assert_eq!(settings.get().gain_db, -6.0);
        assert_eq!(seen.lock().as_slice(), &[("gain_db".to_string(), -6.0)]);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let settings = Settings::new(Params {
            gain_db: 3.0,
            name: "hall".into(),
        });
        settings.reset();
        assert_eq!(settings.get(), Params::default());
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let settings = Settings::new(Params::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = Arc::clone(&calls);
        let sub = settings.subscribe(move |_, _| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
        });
        settings.update("name", |p| p.name = "a".into());
        drop(sub);
        settings.update("name", |p| p.name = "b".into());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(settings.subscriber_count(), 0);
    }
}
