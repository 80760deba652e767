use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak},
};

/// Handle for an active listener registration
///
/// Dropping the handle or calling [`Subscription::unsubscribe`] removes the
/// listener from its registry, so later dispatches skip it. A dispatch that
/// already took its snapshot of listeners may still call it once; receivers
/// that must not see such a late event have to guard for it themselves.
#[must_use = "dropping a Subscription immediately unsubscribes the listener"]
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap a disposer closure
    pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// Remove the listener now
    pub fn unsubscribe(mut self) {
        self.dispose_now();
    }

    fn dispose_now(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.dispose.is_some())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ListenerTable<F: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Option<String>, Arc<F>)>,
}

/// Multi-subscriber listener registry, optionally keyed by device id
///
/// Listeners registered without a key receive every event; keyed listeners
/// only receive events for their key.
pub struct ListenerSet<F: ?Sized> {
    table: Arc<Mutex<ListenerTable<F>>>,
}

impl<F: ?Sized + Send + Sync + 'static> ListenerSet<F> {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(ListenerTable {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a listener, returning its disposer
    pub fn add(&self, key: Option<&str>, listener: Arc<F>) -> Subscription {
        let id = {
            let mut table = lock(&self.table);
            let id = table.next_id;
            table.next_id += 1;
            table.entries.push((id, key.map(str::to_owned), listener));
            id
        };

        let table: Weak<Mutex<ListenerTable<F>>> = Arc::downgrade(&self.table);
        Subscription::new(move || {
            if let Some(table) = table.upgrade() {
                lock(&table).entries.retain(|(entry_id, _, _)| *entry_id != id);
            }
        })
    }

    /// Listeners interested in `key`
    ///
    /// Returned as a snapshot so callers can invoke them without holding the lock.
    #[must_use]
    pub fn matching(&self, key: &str) -> Vec<Arc<F>> {
        lock(&self.table)
            .entries
            .iter()
            .filter(|(_, entry_key, _)| entry_key.as_deref().is_none_or(|k| k == key))
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect()
    }

    /// Every registered listener
    #[must_use]
    pub fn all(&self) -> Vec<Arc<F>> {
        lock(&self.table)
            .entries
            .iter()
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect()
    }

    /// Number of registered listeners
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.table).entries.len()
    }

    /// True when nobody is listening
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<F: ?Sized + Send + Sync + 'static> Default for ListenerSet<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-slot callback holder; a later `set` replaces the earlier callback
pub struct CallbackSlot<F: ?Sized> {
    slot: RwLock<Option<Arc<F>>>,
}

impl<F: ?Sized> CallbackSlot<F> {
    /// Create an empty slot
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    /// Install a callback, replacing any previous one
    pub fn set(&self, callback: Arc<F>) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Current callback, if any
    #[must_use]
    pub fn get(&self) -> Option<Arc<F>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<F: ?Sized> Default for CallbackSlot<F> {
    fn default() -> Self {
        Self::new()
    }
}
