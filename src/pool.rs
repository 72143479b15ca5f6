use parking_lot::Mutex;
use std::fmt;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// A concurrent free list of reusable objects.
///
/// `acquire` pops any free instance or builds a new one with the factory;
/// `release` pushes an instance back. There is no fairness and no bound on
/// how many instances are created, only on how many are retained.
pub(crate) struct Pool<T> {
    free: Mutex<Vec<T>>,
    factory: Factory<T>,
    max_idle: usize,
}

impl<T> Pool<T> {
    pub(crate) fn new<F>(max_idle: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            free: Mutex::new(Vec::new()),
            factory: Box::new(factory),
            max_idle,
        }
    }

    /// Takes a free instance, building one only when the pool is empty.
    pub(crate) fn acquire(&self) -> T {
        // The lock is released before the factory runs.
        let reused = self.free.lock().pop();
        reused.unwrap_or_else(|| (self.factory)())
    }

    /// Returns an instance. The caller is responsible for resetting it first.
    pub(crate) fn release(&self, item: T) {
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(item);
        }
    }

    /// Number of idle instances currently retained.
    pub(crate) fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.idle())
            .field("max_idle", &self.max_idle)
            .finish()
    }
}
