//! Admission control for checked-out connections.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

/// Capacity used when the pool is unbounded.
pub const UNBOUNDED: usize = Semaphore::MAX_PERMITS;

/// A resizable counting semaphore gating concurrent connections.
///
/// One permit is held per checked-out connection; a connection in the idle
/// pool holds none. Waiters queue FIFO. Capacity can change while permits are
/// outstanding: growing releases the difference immediately, shrinking
/// swallows releases until the difference is repaid, so outstanding-permit
/// accounting is never corrupted.
pub struct PermitGate {
    semaphore: Semaphore,
    max: AtomicUsize,
    /// Permits still owed after a shrink; repaid by swallowing releases.
    deficit: AtomicUsize,
    resize: Mutex<()>,
}

impl PermitGate {
    /// A `max` of zero means unbounded.
    pub fn new(max: usize) -> Self {
        let capacity = if max == 0 { UNBOUNDED } else { max };
        Self {
            semaphore: Semaphore::new(capacity),
            max: AtomicUsize::new(capacity),
            deficit: AtomicUsize::new(0),
            resize: Mutex::new(()),
        }
    }

    /// Take one permit without waiting.
    pub fn try_acquire(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Wait for a permit. Waiters are served FIFO; dropping the future while
    /// queued gives nothing away.
    pub async fn acquire(&self) {
        // The semaphore is never closed, so this only resolves with a permit.
        if let Ok(permit) = self.semaphore.acquire().await {
            permit.forget();
        }
    }

    /// Hand one permit back.
    pub fn release(&self) {
        let _guard = self.resize.lock();
        let deficit = self.deficit.load(Ordering::Relaxed);
        if deficit > 0 {
            self.deficit.store(deficit - 1, Ordering::Relaxed);
        } else {
            self.semaphore.add_permits(1);
        }
    }

    /// Resize capacity; zero means unbounded. Shrinking removes what is
    /// immediately available and swallows future releases for the rest.
    pub fn set_max(&self, max: usize) {
        let new_capacity = if max == 0 { UNBOUNDED } else { max };
        let _guard = self.resize.lock();
        let old_capacity = self.max.load(Ordering::Relaxed);
        if new_capacity == old_capacity {
            return;
        }
        if new_capacity > old_capacity {
            let mut grow = new_capacity - old_capacity;
            let deficit = self.deficit.load(Ordering::Relaxed);
            let repaid = deficit.min(grow);
            self.deficit.store(deficit - repaid, Ordering::Relaxed);
            grow -= repaid;
            if grow > 0 {
                self.semaphore.add_permits(grow);
            }
        } else {
            let shrink = old_capacity - new_capacity;
            let forgotten = self.semaphore.forget_permits(shrink);
            self.deficit.fetch_add(shrink - forgotten, Ordering::Relaxed);
        }
        self.max.store(new_capacity, Ordering::Relaxed);
    }

    /// Permits currently available to new acquisitions.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Current capacity; [`UNBOUNDED`] when no cap is set.
    pub fn max(&self) -> usize {
        self.max.load(Ordering::Relaxed)
    }
}
