use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockTable = HashMap<String, Arc<AsyncMutex<()>>>;

/// One async mutex per file id, created on demand and dropped once unused.
///
/// Holding a [`FileLockGuard`] serializes replace and delete of that file id.
/// Different file ids never contend.
#[derive(Debug, Default, Clone)]
pub struct FileLocks {
    table: Arc<Mutex<LockTable>>,
}

/// Exclusive hold on one file id, released on drop
#[derive(Debug)]
pub struct FileLockGuard {
    _guard: OwnedMutexGuard<()>,
    file_id: String,
    table: Arc<Mutex<LockTable>>,
}

impl FileLocks {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub async fn acquire(&self, file_id: &str) -> FileLockGuard {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(table.entry(file_id.to_string()).or_default())
        };

        FileLockGuard {
            _guard: lock.lock_owned().await,
            file_id: file_id.to_string(),
            table: Arc::clone(&self.table),
        }
    }

    /// Number of file ids currently locked or waited on
    #[inline]
    pub fn active(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl FileLockGuard {
    #[inline]
    pub fn file_id(&self) -> &str {
        &self.file_id
    }
}

impl Drop for FileLockGuard {
    #[inline]
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        // Two references left means only the table and this guard: nobody is waiting
        let unused = table
            .get(&self.file_id)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2);
        if unused {
            table.remove(&self.file_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_file_id_is_serialized() {
        let locks = FileLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                tokio::spawn(async move {
                    let _guard = locks.acquire("file_a").await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.expect("task should finish");
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn different_file_ids_do_not_contend() {
        let locks = FileLocks::new();
        let first = locks.acquire("file_a").await;
        let second = tokio::time::timeout(Duration::from_secs(1), locks.acquire("file_b"))
            .await
            .expect("other file id should not block");

        assert_eq!(first.file_id(), "file_a");
        assert_eq!(second.file_id(), "file_b");
        assert_eq!(locks.active(), 2);

        drop(first);
        drop(second);
        assert_eq!(locks.active(), 0);
    }
}
