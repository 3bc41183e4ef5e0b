//! Deferred deletion of remote objects.
//!
//! Object deletions requested by the engine are held back for a
//! configurable window (default one hour) before they are issued. The
//! window tolerates clock skew and slow readers, and lets a newly elected
//! owner "undelete" an object its stale predecessor asked to remove: a
//! completed write to a pending key cancels the delete.
//!
//! Pending work lives only in process memory. On shutdown it is abandoned;
//! if the engine still considers the objects obsolete it will re-request
//! the deletes on its next open.

use crate::config::RemotePath;
use crate::remote::RemoteStorage;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct PendingDelete {
    prefix: RemotePath,
    name: String,
    due: Instant,
}

/// Schedules and executes delayed object deletions.
pub struct DeferredDeleter {
    storage: Arc<RemoteStorage>,
    delay: Duration,
    /// Keyed by the full object key so a re-created object cancels exactly
    /// its own pending delete.
    pending: Mutex<BTreeMap<String, PendingDelete>>,
    notify: Notify,
    running: AtomicBool,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DeferredDeleter {
    pub fn new(storage: Arc<RemoteStorage>, delay: Duration) -> Self {
        Self {
            storage,
            delay,
            pending: Mutex::new(BTreeMap::new()),
            notify: Notify::new(),
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the background worker.
    pub fn start(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run().await;
        });
        *self.handle.lock() = Some(handle);
    }

    /// Enqueue a deletion of `prefix/name`, due after the configured delay.
    pub fn schedule(&self, prefix: &RemotePath, name: &str) {
        let key = prefix.key(name);
        let due = Instant::now() + self.delay;
        tracing::debug!(key = %key, delay = ?self.delay, "deferred delete scheduled");
        self.pending.lock().insert(
            key,
            PendingDelete {
                prefix: prefix.clone(),
                name: name.to_string(),
                due,
            },
        );
        self.notify.notify_one();
    }

    /// Cancel a pending deletion because the key was written again.
    /// Returns whether anything was pending.
    pub fn cancel(&self, prefix: &RemotePath, name: &str) -> bool {
        let key = prefix.key(name);
        let cancelled = self.pending.lock().remove(&key).is_some();
        if cancelled {
            tracing::debug!(key = %key, "deferred delete cancelled by re-create");
        }
        cancelled
    }

    /// Number of deletions currently pending.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Stop the worker. Pending deletions are abandoned.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_one();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let abandoned = self.pending_len();
        if abandoned > 0 {
            tracing::info!(abandoned, "deferred deleter shut down with pending work");
        }
    }

    async fn run(&self) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let next_due = self.pending.lock().values().map(|p| p.due).min();
            let wait = async {
                match next_due {
                    Some(due) => tokio::time::sleep_until(due).await,
                    None => tokio::time::sleep(Duration::from_secs(3600)).await,
                }
            };
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = wait => {}
            }

            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.drain_due().await;
        }
    }

    async fn drain_due(&self) {
        let now = Instant::now();
        let due: Vec<(String, PendingDelete)> = {
            let mut pending = self.pending.lock();
            let keys: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.due <= now)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| pending.remove(&k).map(|p| (k, p)))
                .collect()
        };

        for (key, item) in due {
            match self.storage.delete(&item.prefix, &item.name).await {
                Ok(()) => {
                    tracing::debug!(key = %key, "deferred delete issued");
                }
                Err(e) => {
                    // Retried on the next wake.
                    tracing::warn!(key = %key, error = %e, "deferred delete failed, requeueing");
                    self.pending.lock().insert(
                        key,
                        PendingDelete {
                            due: Instant::now() + self.delay,
                            ..item
                        },
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use object_store::memory::InMemory;

    fn setup(delay: Duration) -> (Arc<RemoteStorage>, Arc<DeferredDeleter>, RemotePath) {
        let storage = Arc::new(RemoteStorage::new(
            Arc::new(InMemory::new()),
            Duration::from_secs(2),
        ));
        let deleter = Arc::new(DeferredDeleter::new(storage.clone(), delay));
        deleter.clone().start();
        (storage, deleter, RemotePath::new("bucket", "db"))
    }

    #[tokio::test]
    async fn test_delete_happens_after_delay() {
        let (storage, deleter, prefix) = setup(Duration::from_millis(100));
        storage.put(&prefix, "f.sst", Bytes::from_static(b"x")).await.unwrap();

        deleter.schedule(&prefix, "f.sst");
        // Still present before the window elapses.
        assert!(storage.exists(&prefix, "f.sst").await.unwrap());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!storage.exists(&prefix, "f.sst").await.unwrap());
        assert_eq!(deleter.pending_len(), 0);
        deleter.shutdown().await;
    }

    #[tokio::test]
    async fn test_recreate_cancels_pending_delete() {
        let (storage, deleter, prefix) = setup(Duration::from_millis(150));
        storage.put(&prefix, "f.sst", Bytes::from_static(b"v1")).await.unwrap();

        deleter.schedule(&prefix, "f.sst");
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Re-create within the window: the pending delete is cancelled.
        storage.put(&prefix, "f.sst", Bytes::from_static(b"v2")).await.unwrap();
        assert!(deleter.cancel(&prefix, "f.sst"));

        // Twice the delay later the object is still there.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(storage.exists(&prefix, "f.sst").await.unwrap());
        deleter.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_without_pending_is_false() {
        let (_, deleter, prefix) = setup(Duration::from_millis(50));
        assert!(!deleter.cancel(&prefix, "nothing.sst"));
        deleter.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_abandons_pending() {
        let (storage, deleter, prefix) = setup(Duration::from_secs(30));
        storage.put(&prefix, "f.sst", Bytes::from_static(b"x")).await.unwrap();
        deleter.schedule(&prefix, "f.sst");
        deleter.shutdown().await;

        assert_eq!(deleter.pending_len(), 1);
        assert!(storage.exists(&prefix, "f.sst").await.unwrap());
    }

    #[tokio::test]
    async fn test_deleting_absent_object_succeeds() {
        let (storage, deleter, prefix) = setup(Duration::from_millis(50));
        deleter.schedule(&prefix, "never-existed.sst");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(deleter.pending_len(), 0);
        assert!(!storage.exists(&prefix, "never-existed.sst").await.unwrap());
        deleter.shutdown().await;
    }
}
