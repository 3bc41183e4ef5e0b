//! Configuration for the cloud storage environment.

use object_store::memory::InMemory;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// A `(bucket, object-path-prefix)` pair naming a logical database location
/// in object storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemotePath {
    pub bucket: String,
    pub prefix: String,
}

impl RemotePath {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    /// Full object-store key for a name under this prefix.
    pub fn key(&self, name: &str) -> String {
        format!("{}/{}/{}", self.bucket, self.prefix.trim_matches('/'), name)
    }

    /// Full object-store key for the prefix itself (used for listing).
    pub fn root_key(&self) -> String {
        format!("{}/{}", self.bucket, self.prefix.trim_matches('/'))
    }
}

impl std::fmt::Display for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.prefix)
    }
}

/// How writer epochs are minted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochStrategy {
    /// Wall-clock nanoseconds, tie-broken by a random suffix. The default.
    NanosWithRandom,
    /// A process-local monotonic counter. Deterministic; used in tests.
    MonotonicCounter,
}

/// Static credentials for the object store and log stream clients.
///
/// Blank fields mean "use the ambient provider chain"; this crate only
/// carries the values through to the clients.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    /// Read credentials from the conventional test environment variables.
    pub fn from_env() -> Self {
        Self {
            access_key: std::env::var("aws_access_key_id").unwrap_or_default(),
            secret_key: std::env::var("aws_secret_access_key").unwrap_or_default(),
        }
    }
}

/// Configuration for a [`crate::CloudEnv`].
#[derive(Clone)]
pub struct CloudConfig {
    /// Source location: read remote state from here. `None` means there is
    /// no remote source (fresh local database).
    pub src: Option<RemotePath>,

    /// Destination location: uploads go here. `None` means writes stay
    /// local only.
    pub dst: Option<RemotePath>,

    /// Object-store region, carried through to the client.
    pub region: String,

    /// Auth material; blank fields fall back to the ambient provider chain.
    pub credentials: Credentials,

    /// The object store backend shared by every component.
    pub object_store: Arc<dyn ObjectStore>,

    /// Local directory the engine operates in.
    pub local_dir: PathBuf,

    /// Retain the local copy of a data file after a successful upload.
    /// Defaults to true; forced true when there is no destination bucket.
    pub keep_local_sst: bool,

    /// Also keep a local mirror of write-ahead-log files next to the
    /// stream copy. When false the tailer cache is the only local copy.
    pub keep_local_log: bool,

    /// Server-side encryption on uploads.
    pub server_side_encryption: bool,

    /// KMS key for SSE, when `server_side_encryption` is set.
    pub encryption_key_id: Option<String>,

    /// How long a requested object deletion is deferred before it is
    /// actually issued.
    pub file_deletion_delay: Duration,

    /// Verify the remote size of a data file after upload.
    pub validate_filesize: bool,

    /// Create the destination bucket on open if it does not exist.
    pub create_bucket_if_missing: bool,

    /// Run the background purger that reclaims unreferenced objects.
    pub run_purger: bool,

    /// How often the purger wakes.
    pub purger_periodicity: Duration,

    /// Total time budget for retrying a transient remote failure.
    pub retry_budget: Duration,

    /// Upper bound on a single remote request, enforced by the client.
    pub request_timeout: Duration,

    /// Page size for object listings.
    pub list_page_size: usize,

    /// Override for the log stream name; derived from the destination
    /// prefix when unset.
    pub stream_name: Option<String>,

    /// How the tailer polls an idle stream.
    pub tailer_poll_interval: Duration,

    /// Tailer checkpoint cadence: records.
    pub tailer_checkpoint_records: usize,

    /// Tailer checkpoint cadence: time.
    pub tailer_checkpoint_interval: Duration,

    /// Optional persistent block-cache location (consumed by the engine).
    pub persistent_cache_path: Option<PathBuf>,

    /// Persistent block-cache budget in gigabytes.
    pub persistent_cache_size_gb: u64,

    /// How writer epochs are minted.
    pub manifest_epoch_strategy: EpochStrategy,
}

impl CloudConfig {
    /// Config for an in-memory object store (testing).
    pub fn in_memory(local_dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(InMemory::new()), local_dir)
    }

    pub fn new(object_store: Arc<dyn ObjectStore>, local_dir: impl Into<PathBuf>) -> Self {
        Self {
            src: None,
            dst: None,
            region: String::new(),
            credentials: Credentials::default(),
            object_store,
            local_dir: local_dir.into(),
            keep_local_sst: true,
            keep_local_log: true,
            server_side_encryption: false,
            encryption_key_id: None,
            file_deletion_delay: Duration::from_secs(3600),
            validate_filesize: true,
            create_bucket_if_missing: true,
            run_purger: false,
            purger_periodicity: Duration::from_secs(600),
            retry_budget: Duration::from_secs(10),
            request_timeout: Duration::from_secs(600),
            list_page_size: 50,
            stream_name: None,
            tailer_poll_interval: Duration::from_millis(100),
            tailer_checkpoint_records: 100,
            tailer_checkpoint_interval: Duration::from_secs(5),
            persistent_cache_path: None,
            persistent_cache_size_gb: 0,
            manifest_epoch_strategy: EpochStrategy::NanosWithRandom,
        }
    }

    /// Builder-style: set the source location.
    pub fn with_src(mut self, path: RemotePath) -> Self {
        self.src = Some(path);
        self
    }

    /// Builder-style: set the destination location.
    pub fn with_dst(mut self, path: RemotePath) -> Self {
        self.dst = Some(path);
        self
    }

    /// Builder-style: set both locations to the same prefix (the common
    /// plain-reopen case).
    pub fn with_prefix(mut self, path: RemotePath) -> Self {
        self.src = Some(path.clone());
        self.dst = Some(path);
        self
    }

    /// Builder-style: keep or drop local data-file copies after upload.
    pub fn with_keep_local_sst(mut self, keep: bool) -> Self {
        self.keep_local_sst = keep;
        self
    }

    /// Builder-style: keep or drop the local WAL mirror.
    pub fn with_keep_local_log(mut self, keep: bool) -> Self {
        self.keep_local_log = keep;
        self
    }

    /// Builder-style: set the deferred-deletion window.
    pub fn with_deletion_delay(mut self, delay: Duration) -> Self {
        self.file_deletion_delay = delay;
        self
    }

    /// Builder-style: deterministic epochs for tests.
    pub fn with_epoch_strategy(mut self, strategy: EpochStrategy) -> Self {
        self.manifest_epoch_strategy = strategy;
        self
    }

    /// Builder-style: enable the background purger.
    pub fn with_purger(mut self, periodicity: Duration) -> Self {
        self.run_purger = true;
        self.purger_periodicity = periodicity;
        self
    }

    /// The stream name for this database's write-ahead log.
    pub fn wal_stream_name(&self) -> Option<String> {
        if let Some(name) = &self.stream_name {
            return Some(name.clone());
        }
        self.dst.as_ref().map(|p| {
            format!("{}-{}", p.bucket, p.prefix.trim_matches('/')).replace('/', "-")
        })
    }

    /// Whether this instance is a clone (destination differs from source).
    pub fn is_clone(&self) -> bool {
        match (&self.src, &self.dst) {
            (Some(s), Some(d)) => s != d,
            _ => false,
        }
    }

    /// Check configuration coherence before opening.
    pub fn verify(&self) -> crate::CloudResult<()> {
        for (name, path) in [("src", &self.src), ("dst", &self.dst)] {
            if let Some(p) = path {
                if p.bucket.is_empty() != p.prefix.is_empty() {
                    return Err(crate::CloudError::Permanent(format!(
                        "must specify both {name} bucket and prefix, or neither"
                    )));
                }
            }
        }
        if self.local_dir.as_os_str().is_empty() {
            return Err(crate::CloudError::Permanent(
                "local directory is required".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CloudConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudConfig")
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("local_dir", &self.local_dir)
            .field("keep_local_sst", &self.keep_local_sst)
            .field("keep_local_log", &self.keep_local_log)
            .field("file_deletion_delay", &self.file_deletion_delay)
            .field("manifest_epoch_strategy", &self.manifest_epoch_strategy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_path_keys() {
        let p = RemotePath::new("bucket", "db/one");
        assert_eq!(p.key("00001.sst"), "bucket/db/one/00001.sst");
        assert_eq!(p.root_key(), "bucket/db/one");
        assert_eq!(p.to_string(), "bucket/db/one");
    }

    #[test]
    fn test_clone_detection() {
        let cfg = CloudConfig::in_memory("/tmp/db")
            .with_src(RemotePath::new("b", "src"))
            .with_dst(RemotePath::new("b", "dst"));
        assert!(cfg.is_clone());

        let cfg = CloudConfig::in_memory("/tmp/db").with_prefix(RemotePath::new("b", "db"));
        assert!(!cfg.is_clone());
    }

    #[test]
    fn test_verify_rejects_half_configured_bucket() {
        let mut cfg = CloudConfig::in_memory("/tmp/db");
        cfg.src = Some(RemotePath::new("bucket", ""));
        assert!(cfg.verify().is_err());
    }

    #[test]
    fn test_wal_stream_name_derived_from_dst() {
        let cfg = CloudConfig::in_memory("/tmp/db")
            .with_prefix(RemotePath::new("bucket", "a/b"));
        assert_eq!(cfg.wal_stream_name().unwrap(), "bucket-a-b");
    }
}
