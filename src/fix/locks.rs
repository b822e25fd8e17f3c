use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::util::normalize_path;

/// Per-file exclusive locks shared by the fix protocol and the integrity guard.
///
/// Keys are lexically normalized, so `/p/./a.rs` and `/p/a.rs` share a lock.
/// Callers pass absolute project paths.
#[derive(Clone, Default)]
pub struct FileLocks {
    table: Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `path`. Released when the guard drops.
    pub async fn acquire(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.entry(normalize_path(path)).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Non-blocking variant; `None` if another holder has the file.
    pub fn try_acquire(&self, path: &Path) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.entry(normalize_path(path)).or_default().clone()
        };
        lock.try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_path_is_exclusive() {
        let locks = FileLocks::new();
        let guard = locks.acquire(Path::new("/p/a.rs")).await;
        assert!(locks.try_acquire(Path::new("/p/a.rs")).is_none());
        assert!(locks.try_acquire(Path::new("/p/b.rs")).is_some());
        drop(guard);
        assert!(locks.try_acquire(Path::new("/p/a.rs")).is_some());
    }

    #[tokio::test]
    async fn test_spellings_of_one_path_share_a_lock() {
        let locks = FileLocks::new();
        let _guard = locks.acquire(Path::new("/p/./src/../a.rs")).await;
        assert!(locks.try_acquire(Path::new("/p/a.rs")).is_none());
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let locks = FileLocks::new();
        let guard = locks.acquire(Path::new("/p/a.rs")).await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.acquire(Path::new("/p/a.rs")).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
