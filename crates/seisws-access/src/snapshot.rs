use std::sync::{Arc, RwLock};

/// A shared value replaced wholesale on reload.
///
/// Readers clone the inner `Arc` and drop the lock immediately, so a reload
/// never waits on a long-running request and never exposes a half-built
/// value.
#[derive(Debug)]
pub struct Snapshot<T> {
    current: RwLock<Arc<T>>,
}

impl<T> Snapshot<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
        }
    }

    pub fn load(&self) -> Arc<T> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => {
                tracing::error!("snapshot lock poisoned, serving last value");
                Arc::clone(&poisoned.into_inner())
            }
        }
    }

    /// Publishes `value` and returns the snapshot it replaced.
    pub fn store(&self, value: T) -> Arc<T> {
        let next = Arc::new(value);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, next)
    }
}

impl<T: Default> Default for Snapshot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
