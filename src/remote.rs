//! Object-store client adapter.
//!
//! A thin façade over [`object_store::ObjectStore`] that scopes every call
//! to a `(bucket, prefix)` location, translates wire errors into
//! [`CloudError`] kinds, and retries transient failures on a fixed 100 ms
//! cadence within a configurable total budget.
//!
//! Existence and size probes use `head`, which the supported backends
//! serve with read-after-write consistency; listings are never used to
//! decide whether an object exists.

use crate::config::RemotePath;
use crate::{CloudError, CloudResult};
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Sleep between retries of a transient failure.
const RETRY_SLEEP: Duration = Duration::from_millis(100);

/// Size and modification time of a remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    /// Unix seconds.
    pub mtime: u64,
}

/// Prefix-scoped, retrying view of an object store.
///
/// Shared by the virtual environment, the manifest coordinator, the
/// tailer, and the deferred deleter; internally thread-safe.
pub struct RemoteStorage {
    store: Arc<dyn ObjectStore>,
    retry_budget: Duration,
    attributes: Attributes,
}

impl RemoteStorage {
    pub fn new(store: Arc<dyn ObjectStore>, retry_budget: Duration) -> Self {
        Self {
            store,
            retry_budget,
            attributes: Attributes::new(),
        }
    }

    /// Attach server-side-encryption attributes to every upload.
    pub fn with_sse(mut self, enabled: bool, key_id: Option<&str>) -> Self {
        if enabled {
            let mut attrs = Attributes::new();
            attrs.insert(
                Attribute::Metadata("server-side-encryption".into()),
                match key_id {
                    Some(_) => "aws:kms".into(),
                    None => "AES256".into(),
                },
            );
            if let Some(id) = key_id {
                attrs.insert(
                    Attribute::Metadata("encryption-key-id".into()),
                    id.to_string().into(),
                );
            }
            self.attributes = attrs;
        }
        self
    }

    fn location(path: &RemotePath, name: &str) -> Path {
        Path::from(path.key(name))
    }

    /// Retry `op` on transient failures, 100 ms apart, until the budget is
    /// exhausted; other errors surface immediately.
    pub(crate) async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> CloudResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = CloudResult<T>>,
    {
        let deadline = Instant::now() + self.retry_budget;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() => {
                    if Instant::now() + RETRY_SLEEP > deadline {
                        return Err(CloudError::Timeout(format!("{what}: {e}")));
                    }
                    tracing::debug!("transient failure in {what}, retrying: {e}");
                    tokio::time::sleep(RETRY_SLEEP).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Upload an object. Durable once this returns.
    pub async fn put(&self, path: &RemotePath, name: &str, data: Bytes) -> CloudResult<()> {
        let loc = Self::location(path, name);
        self.with_retry("put", || {
            let store = self.store.clone();
            let loc = loc.clone();
            let data = data.clone();
            let mut opts = PutOptions::default();
            opts.attributes = self.attributes.clone();
            async move {
                store.put_opts(&loc, data.into(), opts).await?;
                Ok(())
            }
        })
        .await
    }

    /// Fetch an entire object.
    pub async fn get(&self, path: &RemotePath, name: &str) -> CloudResult<Bytes> {
        let loc = Self::location(path, name);
        self.with_retry("get", || {
            let store = self.store.clone();
            let loc = loc.clone();
            async move {
                let result = store.get(&loc).await?;
                Ok(result.bytes().await?)
            }
        })
        .await
    }

    /// Fetch an object, mapping absence to `None`.
    pub async fn get_opt(&self, path: &RemotePath, name: &str) -> CloudResult<Option<Bytes>> {
        match self.get(path, name).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch an exact byte range. A zero-length range degenerates to an
    /// existence probe.
    pub async fn get_range(
        &self,
        path: &RemotePath,
        name: &str,
        offset: u64,
        len: u64,
    ) -> CloudResult<Bytes> {
        if len == 0 {
            self.head(path, name).await?;
            return Ok(Bytes::new());
        }
        let loc = Self::location(path, name);
        self.with_retry("get_range", || {
            let store = self.store.clone();
            let loc = loc.clone();
            async move { Ok(store.get_range(&loc, offset..offset + len).await?) }
        })
        .await
    }

    /// Size and mtime of an object; `NotFound` if absent.
    pub async fn head(&self, path: &RemotePath, name: &str) -> CloudResult<FileInfo> {
        let loc = Self::location(path, name);
        self.with_retry("head", || {
            let store = self.store.clone();
            let loc = loc.clone();
            async move {
                let meta = store.head(&loc).await?;
                Ok(FileInfo {
                    size: meta.size,
                    mtime: meta.last_modified.timestamp().max(0) as u64,
                })
            }
        })
        .await
    }

    /// Whether the object exists.
    pub async fn exists(&self, path: &RemotePath, name: &str) -> CloudResult<bool> {
        match self.head(path, name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// List object names under `path`, optionally narrowed by `sub`.
    /// Returned names are relative to the prefix root. The backend pages
    /// through results internally; callers must not rely on a listing
    /// reflecting just-written objects.
    pub async fn list(&self, path: &RemotePath, sub: &str) -> CloudResult<Vec<String>> {
        let root = path.root_key();
        let target = if sub.is_empty() {
            root.clone()
        } else {
            format!("{root}/{}", sub.trim_matches('/'))
        };
        let loc = Path::from(target);
        let strip = format!("{root}/");
        self.with_retry("list", || {
            let store = self.store.clone();
            let loc = loc.clone();
            let strip = strip.clone();
            async move {
                let metas: Vec<_> = store.list(Some(&loc)).try_collect().await?;
                let mut names: Vec<String> = metas
                    .into_iter()
                    .filter_map(|m| {
                        let key: &str = m.location.as_ref();
                        key.strip_prefix(strip.as_str()).map(|s| s.to_string())
                    })
                    .collect();
                names.sort();
                Ok(names)
            }
        })
        .await
    }

    /// Delete an object. Deleting an absent object succeeds.
    pub async fn delete(&self, path: &RemotePath, name: &str) -> CloudResult<()> {
        let loc = Self::location(path, name);
        let result = self
            .with_retry("delete", || {
                let store = self.store.clone();
                let loc = loc.clone();
                async move {
                    store.delete(&loc).await?;
                    Ok(())
                }
            })
            .await;
        match result {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Server-side copy, atomic per object.
    pub async fn copy(
        &self,
        src: &RemotePath,
        src_name: &str,
        dst: &RemotePath,
        dst_name: &str,
    ) -> CloudResult<()> {
        let from = Self::location(src, src_name);
        let to = Self::location(dst, dst_name);
        self.with_retry("copy", || {
            let store = self.store.clone();
            let from = from.clone();
            let to = to.clone();
            async move {
                store.copy(&from, &to).await?;
                Ok(())
            }
        })
        .await
    }

    /// Ensure the bucket namespace is writable. Idempotent; bucket
    /// provisioning proper belongs to the client configuration, so this
    /// writes a zero-byte marker at the bucket root.
    pub async fn create_bucket(&self, path: &RemotePath) -> CloudResult<()> {
        let loc = Path::from(format!("{}/.bucket", path.bucket));
        self.with_retry("create_bucket", || {
            let store = self.store.clone();
            let loc = loc.clone();
            async move {
                store.put(&loc, Bytes::new().into()).await?;
                Ok(())
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn storage() -> RemoteStorage {
        RemoteStorage::new(Arc::new(InMemory::new()), Duration::from_secs(2))
    }

    fn path() -> RemotePath {
        RemotePath::new("bucket", "db")
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let s = storage();
        let p = path();
        s.put(&p, "000001.sst", Bytes::from_static(b"hello")).await.unwrap();
        let data = s.get(&p, "000001.sst").await.unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let s = storage();
        let err = s.get(&path(), "nope.sst").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(s.get_opt(&path(), "nope.sst").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_range() {
        let s = storage();
        let p = path();
        s.put(&p, "f", Bytes::from_static(b"0123456789")).await.unwrap();
        let data = s.get_range(&p, "f", 2, 3).await.unwrap();
        assert_eq!(&data[..], b"234");

        // Zero-length range is the existence probe.
        let empty = s.get_range(&p, "f", 0, 0).await.unwrap();
        assert!(empty.is_empty());
        assert!(s.get_range(&p, "missing", 0, 0).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_head_and_exists() {
        let s = storage();
        let p = path();
        s.put(&p, "f", Bytes::from_static(b"abcd")).await.unwrap();
        let info = s.head(&p, "f").await.unwrap();
        assert_eq!(info.size, 4);
        assert!(s.exists(&p, "f").await.unwrap());
        assert!(!s.exists(&p, "g").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_is_prefix_scoped() {
        let s = storage();
        let p = path();
        let other = RemotePath::new("bucket", "elsewhere");
        s.put(&p, "a.sst", Bytes::new()).await.unwrap();
        s.put(&p, "dbids/x", Bytes::new()).await.unwrap();
        s.put(&other, "b.sst", Bytes::new()).await.unwrap();

        let all = s.list(&p, "").await.unwrap();
        assert_eq!(all, vec!["a.sst".to_string(), "dbids/x".to_string()]);

        let sub = s.list(&p, "dbids").await.unwrap();
        assert_eq!(sub, vec!["dbids/x".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let s = storage();
        let p = path();
        s.put(&p, "f", Bytes::from_static(b"x")).await.unwrap();
        s.delete(&p, "f").await.unwrap();
        // Second delete of an absent object is success.
        s.delete(&p, "f").await.unwrap();
        assert!(!s.exists(&p, "f").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy() {
        let s = storage();
        let src = path();
        let dst = RemotePath::new("bucket2", "clone");
        s.put(&src, "f", Bytes::from_static(b"payload")).await.unwrap();
        s.copy(&src, "f", &dst, "f").await.unwrap();
        assert_eq!(&s.get(&dst, "f").await.unwrap()[..], b"payload");
        // Source untouched.
        assert!(s.exists(&src, "f").await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient() {
        let s = storage();
        let mut attempts = 0;
        let result: CloudResult<u32> = s
            .with_retry("op", || {
                attempts += 1;
                let n = attempts;
                async move {
                    if n < 3 {
                        Err(CloudError::Transient("flaky".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_times_out() {
        let s = RemoteStorage::new(Arc::new(InMemory::new()), Duration::from_millis(250));
        let result: CloudResult<()> = s
            .with_retry("op", || async { Err(CloudError::Transient("down".into())) })
            .await;
        assert!(matches!(result.unwrap_err(), CloudError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let s = storage();
        let mut attempts = 0;
        let result: CloudResult<()> = s
            .with_retry("op", || {
                attempts += 1;
                async { Err(CloudError::Permanent("bad request".into())) }
            })
            .await;
        assert!(matches!(result.unwrap_err(), CloudError::Permanent(_)));
        assert_eq!(attempts, 1);
    }
}
