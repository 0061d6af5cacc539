//! Serialization Governor
//!
//! Some resource types cannot tolerate concurrent writes: the remote side
//! reorders priorities or returns transient conflicts when two writes
//! overlap. The governor hands out one async mutex per resource type and
//! holds it across the whole write span (primary call, sub-actions and a
//! settle delay) so the next write only starts once the previous one has
//! been absorbed remotely.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

static GLOBAL: OnceLock<Arc<WriteGovernor>> = OnceLock::new();

/// Process-wide per-resource-type write locks
#[derive(Debug, Default)]
pub struct WriteGovernor {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl WriteGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared governor used when an engine is not given its own
    pub fn global() -> Arc<Self> {
        GLOBAL.get_or_init(|| Arc::new(Self::new())).clone()
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Run `span` while holding the lock for `key`, then wait `settle`
    /// before releasing it. The delay applies whether or not the span
    /// succeeded.
    pub async fn serialize<F, T>(&self, key: &str, settle: Duration, span: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        tracing::debug!("Acquired write lock for {}", key);
        let result = span.await;
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        tracing::debug!("Released write lock for {}", key);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[tokio::test]
    async fn test_spans_for_same_key_do_not_overlap() {
        let governor = Arc::new(WriteGovernor::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let governor = governor.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                governor
                    .serialize("enrollment", Duration::from_millis(5), async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_settle_delay_applies_after_failure() {
        let governor = WriteGovernor::new();
        let start = Instant::now();
        let result: Result<(), &str> = governor
            .serialize("x", Duration::from_millis(30), async { Err("boom") })
            .await;
        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_different_keys_run_concurrently() {
        let governor = Arc::new(WriteGovernor::new());
        let start = Instant::now();
        let a = governor.serialize("a", Duration::ZERO, tokio::time::sleep(Duration::from_millis(50)));
        let b = governor.serialize("b", Duration::ZERO, tokio::time::sleep(Duration::from_millis(50)));
        tokio::join!(a, b);
        assert!(start.elapsed() < Duration::from_millis(95));
    }
}
