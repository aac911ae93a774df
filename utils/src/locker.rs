//! Reference-counted per-id locks.
//!
//! Serializes work keyed by an id (the providers lock a file id around
//! node refresh and writeback). Lock entries are created on demand and
//! removed once the last holder releases, so the map never accumulates
//! ids that are no longer in use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

struct LockEntry {
    mutex: Arc<Mutex<()>>,
    holders: usize,
}

#[derive(Default)]
pub struct PathLocker {
    entries: StdMutex<HashMap<String, LockEntry>>,
}

/// Exclusive hold on an id; dropping it releases the lock and removes
/// the map entry when no other holder remains.
pub struct PathGuard<'a> {
    locker: &'a PathLocker,
    id: String,
    _guard: OwnedMutexGuard<()>,
}

impl PathLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `id`.
    pub async fn acquire(&self, id: &str) -> PathGuard<'_> {
        let mutex = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(id.to_string()).or_insert_with(|| LockEntry {
                mutex: Arc::new(Mutex::new(())),
                holders: 0,
            });
            entry.holders += 1;
            entry.mutex.clone()
        };
        let guard = mutex.lock_owned().await;
        PathGuard {
            locker: self,
            id: id.to_string(),
            _guard: guard,
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        let mut entries = self.locker.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&self.id) {
            entry.holders -= 1;
            if entry.holders == 0 {
                entries.remove(&self.id);
            }
        }
    }
}
