// Utility functions and helpers

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::ServiceName;

/// Striped per-service locks: callers working on different services never
/// contend, callers working on the same service are serialized.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<ServiceName, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `name`, waiting for any holder to release it.
    ///
    /// Slots nobody holds or waits on are dropped on the way in, so the table
    /// only grows with the number of names in use at once.
    pub async fn lock(&self, name: &ServiceName) -> OwnedMutexGuard<()> {
        let slot = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // holders and waiters each keep a clone of the slot
            locks.retain(|_, slot| Arc::strong_count(slot) > 1);
            locks
                .entry(name.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Last `max_bytes` of a file as lossy UTF-8, trimmed. Missing files yield an
/// empty string.
pub fn read_tail(path: &Path, max_bytes: usize) -> String {
    let Ok(mut file) = std::fs::File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(max_bytes as u64);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return String::new();
    }

    let mut buf = Vec::with_capacity((len - start) as usize);
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}
