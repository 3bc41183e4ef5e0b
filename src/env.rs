//! The virtual environment: the filesystem-shaped interface the LSM engine
//! consumes.
//!
//! Every operation is dispatched on the filename class. Data files are
//! written to a buffered local file and uploaded to the destination prefix
//! on close; reads come from the local copy when one is kept, otherwise
//! from ranged reads against the source prefix. Log files are carried by
//! the log stream and materialized back into a local cache by the tailer.
//! Everything else is passed through to the local filesystem.
//!
//! Renaming a data or log file is forbidden: remote objects are immutable
//! and the engine never needs it, so the call fails with `NotSupported`
//! rather than emulating rename with a copy.

use crate::config::{CloudConfig, RemotePath};
use crate::dbid::{self, DbidRecord, DbidRegistry};
use crate::deferred::DeferredDeleter;
use crate::filename::{self, FileClass};
use crate::manifest::{ManifestCoordinator, OpenedManifest};
use crate::purge;
use crate::remote::{FileInfo, RemoteStorage};
use crate::stream::{LogRecord, LogStream, MAX_RECORD_BYTES};
use crate::tailer::{cache_dir_for, LogTailer, TailerOptions};
use crate::{CloudError, CloudResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Options the engine passes when opening a file.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvOptions {
    pub use_mmap_reads: bool,
}

/// Sequential read access to a file.
#[async_trait]
pub trait SequentialFile: Send {
    /// Read up to `n` bytes from the current position. Empty at EOF.
    async fn read(&mut self, n: usize) -> CloudResult<Bytes>;
    async fn skip(&mut self, n: u64) -> CloudResult<()>;
}

/// Positional read access to a file. The size is fixed at open time.
#[async_trait]
pub trait RandomAccessFile: Send + Sync {
    async fn read_at(&self, offset: u64, n: usize) -> CloudResult<Bytes>;
    fn size(&self) -> u64;
}

/// Append-only write access to a file.
#[async_trait]
pub trait WritableFile: Send {
    async fn append(&mut self, data: &[u8]) -> CloudResult<()>;
    async fn flush(&mut self) -> CloudResult<()>;
    async fn sync(&mut self) -> CloudResult<()>;
    /// Close the file. For data files this is the point of durability:
    /// the buffered local file is uploaded to the destination prefix.
    async fn close(&mut self) -> CloudResult<()>;
}

struct LocalSequentialFile {
    file: tokio::fs::File,
}

#[async_trait]
impl SequentialFile for LocalSequentialFile {
    async fn read(&mut self, n: usize) -> CloudResult<Bytes> {
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = self.file.read(&mut buf[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    async fn skip(&mut self, n: u64) -> CloudResult<()> {
        self.file.seek(SeekFrom::Current(n as i64)).await?;
        Ok(())
    }
}

struct LocalRandomAccessFile {
    file: tokio::sync::Mutex<tokio::fs::File>,
    size: u64,
}

#[async_trait]
impl RandomAccessFile for LocalRandomAccessFile {
    async fn read_at(&self, offset: u64, n: usize) -> CloudResult<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let end = self.size.min(offset + n as u64);
        let len = end.saturating_sub(offset) as usize;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let read = file.read(&mut buf[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    fn size(&self) -> u64 {
        self.size
    }
}

struct LocalWritableFile {
    file: tokio::fs::File,
}

#[async_trait]
impl WritableFile for LocalWritableFile {
    async fn append(&mut self, data: &[u8]) -> CloudResult<()> {
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn flush(&mut self) -> CloudResult<()> {
        self.file.flush().await?;
        Ok(())
    }

    async fn sync(&mut self) -> CloudResult<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }

    async fn close(&mut self) -> CloudResult<()> {
        self.sync().await
    }
}

struct RemoteSequentialFile {
    storage: Arc<RemoteStorage>,
    prefix: RemotePath,
    name: String,
    size: u64,
    pos: u64,
}

#[async_trait]
impl SequentialFile for RemoteSequentialFile {
    async fn read(&mut self, n: usize) -> CloudResult<Bytes> {
        let len = (n as u64).min(self.size.saturating_sub(self.pos));
        if len == 0 {
            return Ok(Bytes::new());
        }
        let data = self
            .storage
            .get_range(&self.prefix, &self.name, self.pos, len)
            .await?;
        self.pos += data.len() as u64;
        Ok(data)
    }

    async fn skip(&mut self, n: u64) -> CloudResult<()> {
        self.pos = (self.pos + n).min(self.size);
        Ok(())
    }
}

struct RemoteRandomAccessFile {
    storage: Arc<RemoteStorage>,
    prefix: RemotePath,
    name: String,
    size: u64,
}

#[async_trait]
impl RandomAccessFile for RemoteRandomAccessFile {
    async fn read_at(&self, offset: u64, n: usize) -> CloudResult<Bytes> {
        let end = self.size.min(offset + n as u64);
        let len = end.saturating_sub(offset);
        if len == 0 {
            return Ok(Bytes::new());
        }
        self.storage
            .get_range(&self.prefix, &self.name, offset, len)
            .await
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Buffered local writer for a data file; uploaded on close.
struct DataWritableFile {
    file: tokio::fs::File,
    local_path: PathBuf,
    remote_name: String,
    dst: Option<RemotePath>,
    storage: Arc<RemoteStorage>,
    deleter: Arc<DeferredDeleter>,
    keep_local: bool,
    validate_filesize: bool,
    closed: bool,
}

#[async_trait]
impl WritableFile for DataWritableFile {
    async fn append(&mut self, data: &[u8]) -> CloudResult<()> {
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn flush(&mut self) -> CloudResult<()> {
        self.file.flush().await?;
        Ok(())
    }

    async fn sync(&mut self) -> CloudResult<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }

    async fn close(&mut self) -> CloudResult<()> {
        if self.closed {
            return Ok(());
        }
        self.sync().await?;

        if let Some(dst) = self.dst.clone() {
            let data = Bytes::from(tokio::fs::read(&self.local_path).await?);
            let len = data.len() as u64;
            self.storage.put(&dst, &self.remote_name, data).await?;

            if self.validate_filesize {
                let info = self.storage.head(&dst, &self.remote_name).await?;
                if info.size != len {
                    return Err(CloudError::Internal(format!(
                        "uploaded {} as {} bytes but remote reports {}",
                        self.remote_name, len, info.size
                    )));
                }
            }

            // A completed write cancels any pending deferred delete for
            // this key.
            self.deleter.cancel(&dst, &self.remote_name);
            tracing::debug!(name = %self.remote_name, bytes = len, dst = %dst, "data file uploaded");

            if !self.keep_local {
                tokio::fs::remove_file(&self.local_path).await?;
            }
        }
        self.closed = true;
        Ok(())
    }
}

/// Chunk size for stream appends: record cap minus framing headroom.
const STREAM_CHUNK: usize = MAX_RECORD_BYTES - 1024;

/// Writes a log file as stream records, batched per flush.
struct StreamWritableFile {
    stream: Arc<dyn LogStream>,
    epoch: String,
    logical: String,
    pending: BytesMut,
    /// Stream offset of the first pending byte.
    offset: u64,
    mirror: Option<tokio::fs::File>,
    closed: bool,
}

impl StreamWritableFile {
    async fn flush_pending(&mut self) -> CloudResult<()> {
        while !self.pending.is_empty() {
            let take = self.pending.len().min(STREAM_CHUNK);
            let chunk = self.pending.split_to(take).freeze();
            let record = LogRecord::append(&self.epoch, &self.logical, self.offset, chunk);
            self.stream.append(record.encode()?).await?;
            self.offset += take as u64;
        }
        Ok(())
    }
}

#[async_trait]
impl WritableFile for StreamWritableFile {
    async fn append(&mut self, data: &[u8]) -> CloudResult<()> {
        self.pending.extend_from_slice(data);
        if let Some(mirror) = &mut self.mirror {
            mirror.write_all(data).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> CloudResult<()> {
        self.flush_pending().await?;
        if let Some(mirror) = &mut self.mirror {
            mirror.flush().await?;
        }
        Ok(())
    }

    async fn sync(&mut self) -> CloudResult<()> {
        self.flush_pending().await?;
        if let Some(mirror) = &mut self.mirror {
            mirror.flush().await?;
            mirror.sync_all().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> CloudResult<()> {
        if self.closed {
            return Ok(());
        }
        self.sync().await?;
        let record = LogRecord::close(&self.epoch, &self.logical, self.offset);
        self.stream.append(record.encode()?).await?;
        self.closed = true;
        Ok(())
    }
}

/// The cloud environment. Thread-safe; the engine may call it from many
/// tasks concurrently.
pub struct CloudEnv {
    config: CloudConfig,
    storage: Arc<RemoteStorage>,
    stream: Option<Arc<dyn LogStream>>,
    coordinator: Arc<ManifestCoordinator>,
    tailer: Option<Arc<LogTailer>>,
    deleter: Arc<DeferredDeleter>,
    registry: DbidRegistry,
    dbid: String,
    opened: Option<OpenedManifest>,
    running: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    purger: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    read_only: bool,
}

impl CloudEnv {
    /// Open as a writer: acquire ownership of the destination prefix (when
    /// one is configured), register the database identity, and start the
    /// background tasks.
    pub async fn open(
        config: CloudConfig,
        stream: Option<Arc<dyn LogStream>>,
    ) -> CloudResult<CloudEnv> {
        Self::open_inner(config, stream, false).await
    }

    /// Open without taking ownership: the pointer object is read but never
    /// written, and write operations fail.
    pub async fn open_readonly(
        config: CloudConfig,
        stream: Option<Arc<dyn LogStream>>,
    ) -> CloudResult<CloudEnv> {
        Self::open_inner(config, stream, true).await
    }

    async fn open_inner(
        mut config: CloudConfig,
        stream: Option<Arc<dyn LogStream>>,
        read_only: bool,
    ) -> CloudResult<CloudEnv> {
        config.verify()?;
        if config.dst.is_none() {
            // With no destination there is nowhere to upload, so the local
            // copy is the only copy.
            config.keep_local_sst = true;
        }
        tokio::fs::create_dir_all(&config.local_dir).await?;

        let storage = Arc::new(
            RemoteStorage::new(config.object_store.clone(), config.retry_budget).with_sse(
                config.server_side_encryption,
                config.encryption_key_id.as_deref(),
            ),
        );

        if config.create_bucket_if_missing {
            for path in config.dst.iter().chain(config.src.iter()) {
                storage.create_bucket(path).await?;
            }
        }

        let coordinator = Arc::new(ManifestCoordinator::new(
            storage.clone(),
            config.manifest_epoch_strategy,
        ));

        let opened = match (&config.src, &config.dst) {
            (_, Some(dst)) if !read_only => {
                let fallback = config.src.as_ref().filter(|s| *s != dst);
                Some(coordinator.open_as_writer(dst, fallback).await?)
            }
            (Some(src), _) => coordinator.open_as_reader(src).await?,
            (None, Some(dst)) => coordinator.open_as_reader(dst).await?,
            (None, None) => None,
        };

        let registry = DbidRegistry::new(storage.clone());
        let dbid = Self::resolve_identity(&config, &storage).await?;

        if !read_only {
            if let Some(dst) = &config.dst {
                storage
                    .put(dst, "IDENTITY", Bytes::from(dbid.clone().into_bytes()))
                    .await?;
                let source = config.src.clone().unwrap_or_else(|| dst.clone());
                let epoch = coordinator.current_epoch().unwrap_or_default();
                registry
                    .register(dst, &dbid, DbidRecord { source, epoch })
                    .await?;
            }
        }

        let deleter = Arc::new(DeferredDeleter::new(
            storage.clone(),
            config.file_deletion_delay,
        ));
        deleter.clone().start();

        let tailer = match (&stream, config.dst.as_ref().or(config.src.as_ref())) {
            (Some(stream), Some(prefix)) => {
                stream.create(1).await?;
                let tailer = Arc::new(LogTailer::new(
                    stream.clone(),
                    storage.clone(),
                    TailerOptions {
                        prefix: prefix.clone(),
                        instance_id: dbid.clone(),
                        cache_dir: cache_dir_for(&config.local_dir),
                        poll_interval: config.tailer_poll_interval,
                        checkpoint_records: config.tailer_checkpoint_records,
                        checkpoint_interval: config.tailer_checkpoint_interval,
                    },
                ));
                tailer.clone().start().await?;
                Some(tailer)
            }
            _ => None,
        };

        let env = CloudEnv {
            storage,
            stream,
            coordinator,
            tailer,
            deleter,
            registry,
            dbid,
            opened,
            running: Arc::new(AtomicBool::new(true)),
            shutdown_notify: Arc::new(Notify::new()),
            purger: parking_lot::Mutex::new(None),
            read_only,
            config,
        };

        if env.config.run_purger && !read_only {
            env.start_purger();
        }

        tracing::info!(
            src = ?env.config.src,
            dst = ?env.config.dst,
            dbid = %env.dbid,
            read_only,
            "cloud environment opened"
        );
        Ok(env)
    }

    /// Resolve the database identity. The durable copy in the prefix wins
    /// so that every local directory opening the same prefix sees the same
    /// identity; a clone gets a fresh one.
    async fn resolve_identity(
        config: &CloudConfig,
        storage: &Arc<RemoteStorage>,
    ) -> CloudResult<String> {
        let local = config.local_dir.join("IDENTITY");

        let remote_prefix = if config.is_clone() {
            config.dst.as_ref()
        } else {
            config.dst.as_ref().or(config.src.as_ref())
        };
        if let Some(prefix) = remote_prefix {
            if let Some(data) = storage.get_opt(prefix, "IDENTITY").await? {
                let id = String::from_utf8_lossy(&data).trim().to_string();
                tokio::fs::write(&local, &id).await?;
                return Ok(id);
            }
        }

        match tokio::fs::read_to_string(&local).await {
            Ok(id) if !id.trim().is_empty() => Ok(id.trim().to_string()),
            _ => {
                let id = dbid::generate_dbid();
                tokio::fs::write(&local, &id).await?;
                Ok(id)
            }
        }
    }

    fn start_purger(&self) {
        let storage = self.storage.clone();
        let deleter = self.deleter.clone();
        let prefix = match &self.config.dst {
            Some(dst) => dst.clone(),
            None => return,
        };
        let period = self.config.purger_periodicity;
        let running = self.running.clone();
        let notify = self.shutdown_notify.clone();

        let handle = tokio::spawn(async move {
            let registry = DbidRegistry::new(storage.clone());
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = notify.notified() => {}
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                match purge::find_obsolete_files(&storage, &prefix, &[prefix.clone()]).await {
                    Ok(names) => {
                        for name in names {
                            deleter.schedule(&prefix, &name);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "obsolete-file scan failed"),
                }

                match purge::find_obsolete_dbids(&storage, &prefix).await {
                    Ok(dbids) => {
                        for dbid in dbids {
                            if let Err(e) = registry.unregister(&prefix, &dbid).await {
                                tracing::warn!(dbid = %dbid, error = %e, "dbid unregister failed");
                            }
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "obsolete-dbid scan failed"),
                }
            }
        });
        *self.purger.lock() = Some(handle);
    }

    /// Stop background tasks and release ownership-adjacent resources.
    /// Idempotent.
    pub async fn close(&self) -> CloudResult<()> {
        self.running.store(false, Ordering::SeqCst);
        // notify_one stores a permit, so the purger wakes even if it has
        // not reached its select yet.
        self.shutdown_notify.notify_one();
        let purger = self.purger.lock().take();
        if let Some(handle) = purger {
            let _ = handle.await;
        }
        if let Some(tailer) = &self.tailer {
            tailer.shutdown().await;
        }
        self.deleter.shutdown().await;
        tracing::info!(dbid = %self.dbid, "cloud environment closed");
        Ok(())
    }

    /// The identity string of this database.
    pub fn dbid(&self) -> &str {
        &self.dbid
    }

    /// The manifest state this open inherited, if the prefix held one.
    pub fn opened_manifest(&self) -> Option<&OpenedManifest> {
        self.opened.as_ref()
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<RemoteStorage> {
        &self.storage
    }

    pub fn coordinator(&self) -> &Arc<ManifestCoordinator> {
        &self.coordinator
    }

    pub fn deleter(&self) -> &Arc<DeferredDeleter> {
        &self.deleter
    }

    pub fn dbid_registry(&self) -> &DbidRegistry {
        &self.registry
    }

    /// The engine rolled its manifest: persist it and flip the pointer.
    /// A no-op for purely local databases.
    pub async fn roll_manifest(&self, file_number: u64, body: Bytes) -> CloudResult<()> {
        self.check_writable()?;
        match &self.config.dst {
            Some(dst) => self.coordinator.roll_manifest(dst, file_number, body).await,
            None => Ok(()),
        }
    }

    fn check_writable(&self) -> CloudResult<()> {
        if self.read_only {
            Err(CloudError::Permanent(
                "environment is read-only".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn local_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.config.local_dir.join(path)
        }
    }

    fn read_prefixes(&self) -> Vec<&RemotePath> {
        let mut out = Vec::new();
        if let Some(dst) = &self.config.dst {
            out.push(dst);
        }
        if let Some(src) = &self.config.src {
            if !out.contains(&src) {
                out.push(src);
            }
        }
        out
    }

    /// Locate a data file remotely: destination first (clone-fresh files),
    /// then source (inherited files).
    async fn lookup_remote(&self, name: &str) -> CloudResult<(RemotePath, FileInfo)> {
        let mut last_missing = None;
        for prefix in self.read_prefixes() {
            match self.storage.head(prefix, name).await {
                Ok(info) => return Ok((prefix.clone(), info)),
                Err(e) if e.is_not_found() => last_missing = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_missing.unwrap_or_else(|| CloudError::NotFound(name.to_string())))
    }

    fn check_mmap(&self, opts: &EnvOptions) -> CloudResult<()> {
        if opts.use_mmap_reads && !self.config.keep_local_sst {
            return Err(CloudError::Permanent(
                "mmap reads require keep_local_sst".to_string(),
            ));
        }
        Ok(())
    }

    fn tailer_for_logs(&self) -> CloudResult<&Arc<LogTailer>> {
        let tailer = self.tailer.as_ref().ok_or_else(|| {
            CloudError::Internal("log stream is not configured".to_string())
        })?;
        tailer.health()?;
        Ok(tailer)
    }

    /// Path a log file is readable at: the local mirror when kept, else the
    /// tailer cache. The second value says whether the path is
    /// tailer-materialized (readers may need to wait for it).
    fn log_read_path(&self, path: &str) -> CloudResult<(PathBuf, bool)> {
        let local = self.local_path(path);
        if self.stream.is_none() {
            return Ok((local, false));
        }
        if self.config.keep_local_log && local.exists() {
            return Ok((local, false));
        }
        Ok((self.tailer_for_logs()?.cache_path(path), true))
    }

    /// Wait for a tailer-materialized file to appear, on the fixed retry
    /// cadence within the retry budget.
    async fn wait_for_local(&self, path: &Path) -> CloudResult<()> {
        let deadline = Instant::now() + self.config.retry_budget;
        loop {
            if tokio::fs::try_exists(path).await? {
                return Ok(());
            }
            if let Some(tailer) = &self.tailer {
                tailer.health()?;
            }
            if Instant::now() >= deadline {
                return Err(CloudError::Timeout(format!(
                    "log file {} was not materialized in time",
                    path.display()
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Open a file for sequential reading.
    pub async fn new_sequential_file(
        &self,
        path: &str,
        opts: EnvOptions,
    ) -> CloudResult<Box<dyn SequentialFile>> {
        match filename::classify(path) {
            FileClass::Data => {
                self.check_mmap(&opts)?;
                let local = self.local_path(path);
                if tokio::fs::try_exists(&local).await? {
                    let file = tokio::fs::File::open(&local).await?;
                    return Ok(Box::new(LocalSequentialFile { file }));
                }
                let name = self.coordinator.remap(path);
                let (prefix, info) = self.lookup_remote(&name).await?;
                Ok(Box::new(RemoteSequentialFile {
                    storage: self.storage.clone(),
                    prefix,
                    name,
                    size: info.size,
                    pos: 0,
                }))
            }
            FileClass::Log => {
                let (read_path, tailed) = self.log_read_path(path)?;
                if tailed {
                    self.wait_for_local(&read_path).await?;
                }
                let file = tokio::fs::File::open(&read_path).await?;
                Ok(Box::new(LocalSequentialFile { file }))
            }
            FileClass::Other => {
                let file = tokio::fs::File::open(self.local_path(path)).await?;
                Ok(Box::new(LocalSequentialFile { file }))
            }
        }
    }

    /// Open a file for positional reading.
    pub async fn new_random_access_file(
        &self,
        path: &str,
        opts: EnvOptions,
    ) -> CloudResult<Box<dyn RandomAccessFile>> {
        match filename::classify(path) {
            FileClass::Data => {
                self.check_mmap(&opts)?;
                let local = self.local_path(path);
                if tokio::fs::try_exists(&local).await? {
                    return Self::open_local_random(&local).await;
                }
                let name = self.coordinator.remap(path);
                let (prefix, info) = self.lookup_remote(&name).await?;
                Ok(Box::new(RemoteRandomAccessFile {
                    storage: self.storage.clone(),
                    prefix,
                    name,
                    size: info.size,
                }))
            }
            FileClass::Log => {
                let (read_path, tailed) = self.log_read_path(path)?;
                if tailed {
                    self.wait_for_local(&read_path).await?;
                }
                Self::open_local_random(&read_path).await
            }
            FileClass::Other => Self::open_local_random(&self.local_path(path)).await,
        }
    }

    async fn open_local_random(path: &Path) -> CloudResult<Box<dyn RandomAccessFile>> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(Box::new(LocalRandomAccessFile {
            file: tokio::sync::Mutex::new(file),
            size,
        }))
    }

    /// Create a file for writing.
    pub async fn new_writable_file(
        &self,
        path: &str,
        _opts: EnvOptions,
    ) -> CloudResult<Box<dyn WritableFile>> {
        self.check_writable()?;
        let local = self.local_path(path);
        match filename::classify(path) {
            FileClass::Data => {
                let file = tokio::fs::File::create(&local).await?;
                Ok(Box::new(DataWritableFile {
                    file,
                    local_path: local,
                    remote_name: self.coordinator.remap(path),
                    dst: self.config.dst.clone(),
                    storage: self.storage.clone(),
                    deleter: self.deleter.clone(),
                    keep_local: self.config.keep_local_sst,
                    validate_filesize: self.config.validate_filesize,
                    closed: false,
                }))
            }
            FileClass::Log => match &self.stream {
                Some(stream) => {
                    self.tailer_for_logs()?;
                    let mirror = if self.config.keep_local_log {
                        Some(tokio::fs::File::create(&local).await?)
                    } else {
                        None
                    };
                    Ok(Box::new(StreamWritableFile {
                        stream: stream.clone(),
                        epoch: self.coordinator.current_epoch().unwrap_or_default(),
                        logical: filename::basename(path).to_string(),
                        pending: BytesMut::new(),
                        offset: 0,
                        mirror,
                        closed: false,
                    }))
                }
                None => {
                    let file = tokio::fs::File::create(&local).await?;
                    Ok(Box::new(LocalWritableFile { file }))
                }
            },
            FileClass::Other => {
                let file = tokio::fs::File::create(&local).await?;
                Ok(Box::new(LocalWritableFile { file }))
            }
        }
    }

    /// Whether a file exists, per the class dispatch rules.
    pub async fn file_exists(&self, path: &str) -> CloudResult<bool> {
        match filename::classify(path) {
            FileClass::Data => {
                if self.read_prefixes().is_empty() {
                    return Ok(tokio::fs::try_exists(self.local_path(path)).await?);
                }
                let name = self.coordinator.remap(path);
                match self.lookup_remote(&name).await {
                    Ok(_) => {
                        self.warn_missing_local(path).await;
                        Ok(true)
                    }
                    Err(e) if e.is_not_found() => Ok(false),
                    Err(e) => Err(e),
                }
            }
            FileClass::Log => {
                let (read_path, _) = self.log_read_path(path)?;
                Ok(tokio::fs::try_exists(&read_path).await?)
            }
            FileClass::Other => Ok(tokio::fs::try_exists(self.local_path(path)).await?),
        }
    }

    /// Size of a file, per the class dispatch rules.
    pub async fn get_file_size(&self, path: &str) -> CloudResult<u64> {
        match filename::classify(path) {
            FileClass::Data => {
                if self.read_prefixes().is_empty() {
                    return Ok(tokio::fs::metadata(self.local_path(path)).await?.len());
                }
                let name = self.coordinator.remap(path);
                let (_, info) = self.lookup_remote(&name).await?;
                if self.config.keep_local_sst {
                    if let Ok(meta) = tokio::fs::metadata(self.local_path(path)).await {
                        if meta.len() != info.size {
                            tracing::warn!(
                                path,
                                remote = info.size,
                                local = meta.len(),
                                "local data file size differs from remote"
                            );
                        }
                    }
                }
                Ok(info.size)
            }
            FileClass::Log => {
                let (read_path, tailed) = self.log_read_path(path)?;
                if tailed {
                    self.wait_for_local(&read_path).await?;
                }
                Ok(tokio::fs::metadata(&read_path).await?.len())
            }
            FileClass::Other => Ok(tokio::fs::metadata(self.local_path(path)).await?.len()),
        }
    }

    /// Modification time (unix seconds) of a file.
    pub async fn get_file_mtime(&self, path: &str) -> CloudResult<u64> {
        match filename::classify(path) {
            FileClass::Data => {
                if self.read_prefixes().is_empty() {
                    return Self::local_mtime(&self.local_path(path)).await;
                }
                let name = self.coordinator.remap(path);
                let (_, info) = self.lookup_remote(&name).await?;
                Ok(info.mtime)
            }
            FileClass::Log => {
                let (read_path, tailed) = self.log_read_path(path)?;
                if tailed {
                    self.wait_for_local(&read_path).await?;
                }
                Self::local_mtime(&read_path).await
            }
            FileClass::Other => Self::local_mtime(&self.local_path(path)).await,
        }
    }

    async fn local_mtime(path: &Path) -> CloudResult<u64> {
        let meta = tokio::fs::metadata(path).await?;
        let mtime = meta
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Ok(mtime)
    }

    async fn warn_missing_local(&self, path: &str) {
        if self.config.keep_local_sst {
            let local = self.local_path(path);
            if !local.exists() {
                tracing::warn!(
                    path,
                    "data file exists remotely but not locally; reads will be served remotely"
                );
            }
        }
    }

    /// Delete a file. Data files go through the deferred scheduler against
    /// the destination; log files append a Delete record to the stream.
    pub async fn delete_file(&self, path: &str) -> CloudResult<()> {
        self.check_writable()?;
        let local = self.local_path(path);
        match filename::classify(path) {
            FileClass::Data => {
                if let Some(dst) = &self.config.dst {
                    let name = self.coordinator.remap(path);
                    self.deleter.schedule(dst, &name);
                }
                match tokio::fs::remove_file(&local).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(())
            }
            FileClass::Log => {
                if let Some(stream) = &self.stream {
                    self.tailer_for_logs()?;
                    let epoch = self.coordinator.current_epoch().unwrap_or_default();
                    let record = LogRecord::delete(&epoch, filename::basename(path));
                    stream.append(record.encode()?).await?;
                }
                match tokio::fs::remove_file(&local).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(())
            }
            FileClass::Other => {
                tokio::fs::remove_file(&local).await?;
                Ok(())
            }
        }
    }

    /// Rename a file. Forbidden for data and log files: remote objects are
    /// never renamed.
    pub async fn rename_file(&self, from: &str, to: &str) -> CloudResult<()> {
        self.check_writable()?;
        match filename::classify(to) {
            FileClass::Data => Err(CloudError::NotSupported(format!(
                "rename of data file {from} to {to}"
            ))),
            FileClass::Log => Err(CloudError::NotSupported(format!(
                "rename of log file {from} to {to}"
            ))),
            FileClass::Other => {
                tokio::fs::rename(self.local_path(from), self.local_path(to)).await?;
                Ok(())
            }
        }
    }

    /// List the children of the database directory: the union of the
    /// remote listing and local non-data entries. Local data files are
    /// suppressed so a stray local file cannot masquerade as live.
    pub async fn list_children(&self, dir: &str) -> CloudResult<Vec<String>> {
        let mut out = BTreeSet::new();

        for prefix in self.read_prefixes() {
            for key in self.storage.list(prefix, "").await? {
                if filename::is_data_file(&key) {
                    out.insert(filename::strip_epoch(&key));
                }
            }
        }

        let local_dir = self.local_path(dir);
        match tokio::fs::read_dir(&local_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if !filename::is_data_file(&name) {
                        out.insert(name);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(out.into_iter().collect())
    }

    /// Create a directory in the local filesystem.
    pub async fn create_dir_if_missing(&self, dir: &str) -> CloudResult<()> {
        tokio::fs::create_dir_all(self.local_path(dir)).await?;
        Ok(())
    }

    /// Locking is a no-op on remote-backed paths: there is no sound way to
    /// do an atomic check-and-create against the object store, and
    /// ownership is coordinated by the cloud manifest instead.
    pub fn lock_file(&self, _path: &str) -> CloudResult<()> {
        Ok(())
    }

    pub fn unlock_file(&self, _path: &str) -> CloudResult<()> {
        Ok(())
    }

    /// Names of the data files currently live under the destination (or
    /// source) prefix, in engine-visible form.
    pub async fn live_data_files(&self) -> CloudResult<Vec<String>> {
        let mut out = BTreeSet::new();
        for prefix in self.read_prefixes() {
            for key in self.storage.list(prefix, "").await? {
                if filename::is_data_file(&key) {
                    out.insert(key);
                }
            }
        }
        Ok(out.into_iter().collect())
    }
}
