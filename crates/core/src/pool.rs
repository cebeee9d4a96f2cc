//! Idle connections and the recent-close window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use cellar_protocol::Connection;

/// A pooled connection and the moment it went idle.
///
/// The timestamp is fixed when the entry is created; it is not refreshed
/// while the connection sits in the pool.
pub struct IdleEntry {
    pub conn: Arc<Connection>,
    pub idle_since: Instant,
}

/// LIFO pool of idle connections.
///
/// Hot connections stay hot at the head; stale ones collect at the tail,
/// where the reaper finds them in age order.
#[derive(Default)]
pub struct IdlePool {
    entries: Mutex<VecDeque<IdleEntry>>,
}

impl IdlePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a connection onto the hot end.
    pub fn push_front(&self, conn: Arc<Connection>) {
        self.entries.lock().push_front(IdleEntry {
            conn,
            idle_since: Instant::now(),
        });
    }

    /// Take the most recently returned connection.
    pub fn pop_front(&self) -> Option<IdleEntry> {
        self.entries.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Pop entries from the stale end while `take` accepts them.
    ///
    /// Stops at the first declined entry: everything closer to the head is
    /// fresher, so there is no reason to look further.
    pub fn take_stale(&self, mut take: impl FnMut(&IdleEntry) -> bool) -> Vec<IdleEntry> {
        let mut entries = self.entries.lock();
        let mut taken = Vec::new();
        while let Some(entry) = entries.back() {
            if !take(entry) {
                break;
            }
            if let Some(entry) = entries.pop_back() {
                taken.push(entry);
            }
        }
        taken
    }

    /// Empty the pool, hottest first.
    pub fn drain(&self) -> Vec<IdleEntry> {
        self.entries.lock().drain(..).collect()
    }
}

/// Sliding-window record of unexpected disconnects.
///
/// The health monitor reads this as a passive failure signal and purges
/// entries past its window lazily.
#[derive(Default)]
pub struct RecentCloseLog {
    entries: Mutex<VecDeque<(u64, Instant)>>,
}

impl RecentCloseLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, conn_id: u64) {
        self.entries.lock().push_back((conn_id, Instant::now()));
    }

    /// Drop entries older than `window`. Entries are appended in time order,
    /// so purging stops at the first young one.
    pub fn purge(&self, window: Duration) {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        while entries
            .front()
            .is_some_and(|(_, at)| now.duration_since(*at) > window)
        {
            entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
