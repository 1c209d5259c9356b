use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Produces one mutual-exclusion handle per quota document. Handles are
/// created lazily with a double-checked lookup and never removed; the map
/// grows with the number of distinct documents ever seen, which is the
/// administrator-created document cardinality.
pub struct LockFactory {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockFactory {
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Fast path: shared read of an existing handle. Slow path on miss:
    /// exclusive write with a re-check, so a handle races into existence
    /// at most once.
    pub async fn get_lock(&self, name: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(name) {
            return lock.clone();
        }
        let mut locks = self.locks.write().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Default for LockFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_name_returns_same_handle() {
        let factory = LockFactory::new();
        let a = factory.get_lock("quota-a").await;
        let b = factory.get_lock("quota-a").await;
        assert!(Arc::ptr_eq(&a, &b));

        let c = factory.get_lock("quota-b").await;
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_handle() {
        let factory = Arc::new(LockFactory::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let factory = factory.clone();
            handles.push(tokio::spawn(
                async move { factory.get_lock("shared").await },
            ));
        }
        let mut locks = Vec::new();
        for handle in handles {
            locks.push(handle.await.unwrap());
        }
        for lock in &locks[1..] {
            assert!(Arc::ptr_eq(&locks[0], lock));
        }
    }

    #[tokio::test]
    async fn handle_serializes_critical_sections() {
        let factory = LockFactory::new();
        let lock = factory.get_lock("quota-a").await;
        let counter = Arc::new(std::sync::Mutex::new(0_i32));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let counter = counter.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = lock.lock().await;
                let value = *counter.lock().unwrap();
                tokio::task::yield_now().await;
                *counter.lock().unwrap() = value + 1;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 8);
    }
}
