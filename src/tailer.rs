//! Background consumer of the WAL stream.
//!
//! One tailer runs per open database. It reads the log stream from its
//! persisted checkpoint (or from the current tail on first start, to avoid
//! replaying arbitrarily old WAL) and materializes Append/Delete/Close
//! records into ordinary files in a local cache directory, so that crash
//! recovery and sequential reads behave as if the log were a local file.
//!
//! The engine may read a file the tailer is still appending to: appends
//! grow the file atomically and readers use the length observed at open.
//! A record that fails to decode is fatal: the tailer marks itself
//! unhealthy and the environment's log operations start failing with
//! `Internal` carrying the last error.

use crate::config::RemotePath;
use crate::filename;
use crate::remote::RemoteStorage;
use crate::stream::{LogOp, LogRecord, LogStream};
use crate::{CloudError, CloudResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::time::Instant;

/// Persisted resume point, one object per tailer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailerCheckpoint {
    pub shard: u32,
    pub seqno: u64,
}

/// Settings the tailer reads from its owning environment's configuration.
/// Passed by value so the tailer holds no reference back to the
/// environment.
#[derive(Debug, Clone)]
pub struct TailerOptions {
    pub prefix: RemotePath,
    pub instance_id: String,
    pub cache_dir: PathBuf,
    pub poll_interval: Duration,
    pub checkpoint_records: usize,
    pub checkpoint_interval: Duration,
}

/// Materializes the WAL stream into a local cache directory.
pub struct LogTailer {
    stream: Arc<dyn LogStream>,
    storage: Arc<RemoteStorage>,
    opts: TailerOptions,
    running: AtomicBool,
    /// Seqno up to which records have been applied (exclusive).
    applied_seqno: AtomicU64,
    last_error: Mutex<Option<String>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LogTailer {
    pub fn new(
        stream: Arc<dyn LogStream>,
        storage: Arc<RemoteStorage>,
        opts: TailerOptions,
    ) -> Self {
        Self {
            stream,
            storage,
            opts,
            running: AtomicBool::new(false),
            applied_seqno: AtomicU64::new(0),
            last_error: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    fn checkpoint_key(&self) -> String {
        format!("tailer-checkpoint/{}", self.opts.instance_id)
    }

    /// Local cache path a logical log path materializes at.
    pub fn cache_path(&self, logical: &str) -> PathBuf {
        self.opts.cache_dir.join(filename::basename(logical))
    }

    /// `Err(Internal)` once the tailer has hit a fatal error.
    pub fn health(&self) -> CloudResult<()> {
        match &*self.last_error.lock() {
            Some(e) => Err(CloudError::Internal(format!("log tailer unhealthy: {e}"))),
            None => Ok(()),
        }
    }

    /// Seqno up to which the stream has been materialized locally.
    pub fn applied_seqno(&self) -> u64 {
        self.applied_seqno.load(Ordering::SeqCst)
    }

    /// Resolve the resume point and spawn the tail loop.
    pub async fn start(self: Arc<Self>) -> CloudResult<()> {
        tokio::fs::create_dir_all(&self.opts.cache_dir).await?;

        let start_seqno = match self
            .storage
            .get_opt(&self.opts.prefix, &self.checkpoint_key())
            .await?
        {
            Some(data) => {
                let ckpt: TailerCheckpoint = serde_json::from_slice(&data)?;
                ckpt.seqno
            }
            // No checkpoint: start at the tail rather than replaying
            // arbitrarily old WAL.
            None => self.stream.latest_seqno(0).await.unwrap_or(0),
        };
        self.applied_seqno.store(start_seqno, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            instance = %self.opts.instance_id,
            start_seqno,
            cache = %self.opts.cache_dir.display(),
            "log tailer starting"
        );

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run(start_seqno).await;
        });
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the tail loop and wait for it to exit.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Wait until records up to `seqno` (exclusive) have been applied.
    /// Returns false on timeout or an unhealthy tailer.
    pub async fn wait_until_applied(&self, seqno: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.applied_seqno() < seqno {
            if self.health().is_err() || Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    async fn run(&self, mut next: u64) {
        let mut since_checkpoint = 0usize;
        let mut last_checkpoint = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            let batch = match self.stream.read_from(0, next).await {
                Ok(batch) => batch,
                Err(e) if e.is_transient() || matches!(e, CloudError::Timeout(_)) => {
                    tracing::warn!(error = %e, "stream read failed, backing off");
                    tokio::time::sleep(self.opts.poll_interval).await;
                    continue;
                }
                Err(e) => {
                    self.mark_unhealthy(&e);
                    return;
                }
            };

            if batch.is_empty() {
                if since_checkpoint > 0
                    && last_checkpoint.elapsed() >= self.opts.checkpoint_interval
                {
                    self.write_checkpoint(next).await;
                    since_checkpoint = 0;
                    last_checkpoint = Instant::now();
                }
                tokio::time::sleep(self.opts.poll_interval).await;
                continue;
            }

            for (seqno, data) in batch {
                let record = match LogRecord::decode(&data) {
                    Ok(record) => record,
                    Err(e) => {
                        self.mark_unhealthy(&e);
                        return;
                    }
                };
                if let Err(e) = self.apply(&record).await {
                    self.mark_unhealthy(&e);
                    return;
                }
                next = seqno + 1;
                self.applied_seqno.store(next, Ordering::SeqCst);
                since_checkpoint += 1;
            }

            if since_checkpoint >= self.opts.checkpoint_records
                || last_checkpoint.elapsed() >= self.opts.checkpoint_interval
            {
                self.write_checkpoint(next).await;
                since_checkpoint = 0;
                last_checkpoint = Instant::now();
            }
        }

        // Best-effort final checkpoint so the next open resumes here.
        self.write_checkpoint(next).await;
        tracing::info!(instance = %self.opts.instance_id, next, "log tailer stopped");
    }

    async fn apply(&self, record: &LogRecord) -> CloudResult<()> {
        let path = self.cache_path(&record.path);
        match &record.op {
            LogOp::Append { offset, payload } => {
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(&path)
                    .await?;
                file.seek(SeekFrom::Start(*offset)).await?;
                file.write_all(payload).await?;
                file.flush().await?;
            }
            LogOp::Delete => {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            LogOp::Close { file_size } => {
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(&path)
                    .await?;
                file.set_len(*file_size).await?;
                file.sync_all().await?;
            }
        }
        tracing::trace!(path = %path.display(), op = record.op.kind(), "tailer applied record");
        Ok(())
    }

    async fn write_checkpoint(&self, seqno: u64) {
        let ckpt = TailerCheckpoint { shard: 0, seqno };
        let body = match serde_json::to_vec(&ckpt) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode tailer checkpoint");
                return;
            }
        };
        if let Err(e) = self
            .storage
            .put(&self.opts.prefix, &self.checkpoint_key(), body.into())
            .await
        {
            // Not fatal: the next flush retries, at worst we re-apply.
            tracing::warn!(error = %e, "failed to persist tailer checkpoint");
        }
    }

    fn mark_unhealthy(&self, e: &CloudError) {
        tracing::error!(error = %e, "log tailer is unhealthy");
        *self.last_error.lock() = Some(e.to_string());
    }
}

/// The WAL cache directory for a database's local directory.
pub fn cache_dir_for(local_dir: &Path) -> PathBuf {
    local_dir.join("wal-cache")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryLogStream;
    use bytes::Bytes;
    use object_store::memory::InMemory;

    async fn setup() -> (Arc<MemoryLogStream>, Arc<RemoteStorage>, Arc<LogTailer>, tempfile::TempDir) {
        let stream = Arc::new(MemoryLogStream::new());
        stream.create(1).await.unwrap();
        let storage = Arc::new(RemoteStorage::new(
            Arc::new(InMemory::new()),
            Duration::from_secs(2),
        ));
        let dir = tempfile::tempdir().unwrap();
        let tailer = Arc::new(LogTailer::new(
            stream.clone(),
            storage.clone(),
            TailerOptions {
                prefix: RemotePath::new("bucket", "db"),
                instance_id: "test-instance".to_string(),
                cache_dir: dir.path().join("wal-cache"),
                poll_interval: Duration::from_millis(10),
                checkpoint_records: 4,
                checkpoint_interval: Duration::from_millis(50),
            },
        ));
        (stream, storage, tailer, dir)
    }

    #[tokio::test]
    async fn test_append_records_materialize_file() {
        let (stream, _storage, tailer, _dir) = setup().await;
        tailer.clone().start().await.unwrap();

        let r1 = LogRecord::append("e", "000011.log", 0, Bytes::from_static(b"hello "));
        let r2 = LogRecord::append("e", "000011.log", 6, Bytes::from_static(b"world"));
        stream.append(r1.encode().unwrap()).await.unwrap();
        let (_, last) = stream.append(r2.encode().unwrap()).await.unwrap();

        assert!(tailer.wait_until_applied(last + 1, Duration::from_secs(2)).await);
        let contents = tokio::fs::read(tailer.cache_path("000011.log")).await.unwrap();
        assert_eq!(&contents[..], b"hello world");

        tailer.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_record_unlinks_file() {
        let (stream, _storage, tailer, _dir) = setup().await;
        tailer.clone().start().await.unwrap();

        let append = LogRecord::append("e", "000011.log", 0, Bytes::from_static(b"x"));
        stream.append(append.encode().unwrap()).await.unwrap();
        let delete = LogRecord::delete("e", "000011.log");
        let (_, last) = stream.append(delete.encode().unwrap()).await.unwrap();

        assert!(tailer.wait_until_applied(last + 1, Duration::from_secs(2)).await);
        assert!(!tailer.cache_path("000011.log").exists());

        tailer.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_record_fixes_size() {
        let (stream, _storage, tailer, _dir) = setup().await;
        tailer.clone().start().await.unwrap();

        let append = LogRecord::append("e", "000012.log", 0, Bytes::from_static(b"0123456789"));
        stream.append(append.encode().unwrap()).await.unwrap();
        let close = LogRecord::close("e", "000012.log", 4);
        let (_, last) = stream.append(close.encode().unwrap()).await.unwrap();

        assert!(tailer.wait_until_applied(last + 1, Duration::from_secs(2)).await);
        let meta = tokio::fs::metadata(tailer.cache_path("000012.log")).await.unwrap();
        assert_eq!(meta.len(), 4);

        tailer.shutdown().await;
    }

    #[tokio::test]
    async fn test_checkpoint_resume_skips_applied_records() {
        let (stream, storage, tailer, dir) = setup().await;
        tailer.clone().start().await.unwrap();

        for i in 0..5u64 {
            let r = LogRecord::append("e", "000013.log", i, Bytes::from_static(b"a"));
            stream.append(r.encode().unwrap()).await.unwrap();
        }
        assert!(tailer.wait_until_applied(5, Duration::from_secs(2)).await);
        tailer.shutdown().await;

        // A fresh tailer instance with the same id resumes from the
        // persisted checkpoint rather than the stream tail.
        let tailer2 = Arc::new(LogTailer::new(
            stream.clone(),
            storage.clone(),
            TailerOptions {
                prefix: RemotePath::new("bucket", "db"),
                instance_id: "test-instance".to_string(),
                cache_dir: dir.path().join("wal-cache-2"),
                poll_interval: Duration::from_millis(10),
                checkpoint_records: 4,
                checkpoint_interval: Duration::from_millis(50),
            },
        ));
        tailer2.clone().start().await.unwrap();
        assert_eq!(tailer2.applied_seqno(), 5);
        tailer2.shutdown().await;
    }

    #[tokio::test]
    async fn test_fresh_tailer_starts_at_tail() {
        let (stream, _storage, _tailer, dir) = setup().await;

        // Old records exist before this tailer ever starts.
        for _ in 0..3 {
            let r = LogRecord::append("e", "000014.log", 0, Bytes::from_static(b"old"));
            stream.append(r.encode().unwrap()).await.unwrap();
        }

        let storage2 = Arc::new(RemoteStorage::new(
            Arc::new(InMemory::new()),
            Duration::from_secs(2),
        ));
        let tailer = Arc::new(LogTailer::new(
            stream.clone(),
            storage2,
            TailerOptions {
                prefix: RemotePath::new("bucket", "db"),
                instance_id: "fresh".to_string(),
                cache_dir: dir.path().join("fresh-cache"),
                poll_interval: Duration::from_millis(10),
                checkpoint_records: 100,
                checkpoint_interval: Duration::from_secs(5),
            },
        ));
        tailer.clone().start().await.unwrap();
        assert_eq!(tailer.applied_seqno(), 3);
        // The old file was never materialized.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!tailer.cache_path("000014.log").exists());
        tailer.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_record_marks_unhealthy() {
        let (stream, _storage, tailer, _dir) = setup().await;
        tailer.clone().start().await.unwrap();

        stream.append(Bytes::from_static(b"garbage-record-bytes-000")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = tailer.health().unwrap_err();
        assert!(matches!(err, CloudError::Internal(_)));
        tailer.shutdown().await;
    }
}
