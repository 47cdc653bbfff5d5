//! 内存键锁：串行化同一上传会话或同一目标路径上的写操作。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

/// Manages asynchronous mutexes keyed by upload id or storage-relative path.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 在给定超时时间内获取键锁，超时返回 Err。
    pub async fn lock_with_timeout(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, ()> {
        let key = normalize_lock_key(key);
        let lock = {
            let mut locks = self.locks.lock().await;
            // 无人持有也无人等待的锁可以回收。
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| ())
    }

    #[cfg(test)]
    async fn tracked_keys(&self) -> usize {
        self.locks.lock().await.len()
    }
}

fn normalize_lock_key(key: &str) -> String {
    let trimmed = key.trim();
    let trimmed = trimmed.trim_start_matches(['/', '\\']);
    trimmed.replace('\\', "/")
}
