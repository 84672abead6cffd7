use log::debug;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Fixed-size pool of pre-built items. `acquire` waits for a free item and the
/// guard hands it back on drop, waking one waiter.
pub struct Pool<T> {
    name: &'static str,
    capacity: usize,
    free: Mutex<Vec<T>>,
    notify: Notify,
}

impl<T> Pool<T> {
    pub fn new(name: &'static str, items: Vec<T>) -> Arc<Self> {
        Arc::new(Self {
            name,
            capacity: items.len(),
            free: Mutex::new(items),
            notify: Notify::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    fn try_take(&self) -> Option<T> {
        self.free.lock().ok()?.pop()
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<PoolGuard<T>> {
        self.try_take().map(|item| PoolGuard {
            pool: self.clone(),
            item: Some(item),
        })
    }

    pub async fn acquire(self: &Arc<Self>) -> PoolGuard<T> {
        loop {
            let notified = self.notify.notified();
            if let Some(guard) = self.try_acquire() {
                return guard;
            }
            debug!("Pool[{}]: exhausted, waiting", self.name);
            notified.await;
        }
    }

    fn release(&self, item: T) {
        if let Ok(mut free) = self.free.lock() {
            free.push(item);
        }
        self.notify.notify_one();
    }

    /// Takes every free item out of the pool. Used at shutdown once all
    /// guards are gone.
    pub fn drain(&self) -> Vec<T> {
        self.free
            .lock()
            .map(|mut free| std::mem::take(&mut *free))
            .unwrap_or_default()
    }
}

pub struct PoolGuard<T> {
    pool: Arc<Pool<T>>,
    item: Option<T>,
}

impl<T> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // item is only None after drop
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}
