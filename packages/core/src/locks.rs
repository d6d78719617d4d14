// ABOUTME: Per-sandbox named lock table
// ABOUTME: Entries are removed on sandbox delete so the map cannot grow unbounded

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-process mutual exclusion per sandbox id.
///
/// All mutating sandbox operations (ensure-running, stop, delete, extend-ttl)
/// and destructive GC actions serialize on the same entry. Multi-instance
/// deployments additionally rely on row versions at the storage layer.
#[derive(Default)]
pub struct LockTable {
    entries: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the lock for a sandbox, creating it on first use.
    pub fn acquire(&self, sandbox_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(sandbox_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the entry for a deleted sandbox. In-flight holders keep their
    /// Arc; future callers get a fresh lock, which is harmless because the
    /// sandbox no longer exists.
    pub fn remove(&self, sandbox_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(sandbox_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_id_returns_same_lock() {
        let table = LockTable::new();
        let a = table.acquire("sandbox-1");
        let b = table.acquire("sandbox-1");
        assert!(Arc::ptr_eq(&a, &b));

        let c = table.acquire("sandbox-2");
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_lock_serializes_critical_sections() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let table = Arc::new(LockTable::new());
        let in_critical = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            let in_critical = in_critical.clone();
            handles.push(tokio::spawn(async move {
                let lock = table.acquire("sandbox-1");
                let _guard = lock.lock().await;
                assert!(!in_critical.swap(true, Ordering::SeqCst));
                tokio::task::yield_now().await;
                in_critical.store(false, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn test_remove_cleans_entry() {
        let table = LockTable::new();
        table.acquire("sandbox-1");
        assert_eq!(table.len(), 1);
        table.remove("sandbox-1");
        assert!(table.is_empty());
    }
}
