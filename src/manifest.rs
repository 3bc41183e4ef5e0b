//! The cloud manifest: epoch map and ownership pointer for a prefix.
//!
//! Every prefix holds a small `CLOUDMANIFEST` object naming the currently
//! authoritative engine manifest and recording which epoch each data-file
//! number belongs to. Acquiring ownership of a prefix means minting a new
//! epoch, uploading the inherited engine manifest under the new epoch's
//! name, and atomically overwriting the pointer; object stores are
//! single-key atomic, so the last writer wins cleanly.
//!
//! Because data files carry their epoch in their remote name, a stale
//! former owner can keep writing into the prefix without ever colliding
//! with the new owner: its files reference an engine manifest nothing
//! points to, and the purger eventually reclaims them.

use crate::config::{EpochStrategy, RemotePath};
use crate::filename::{self, FileClass};
use crate::remote::RemoteStorage;
use crate::{CloudError, CloudResult};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Well-known key of the pointer object inside each prefix.
pub const CLOUD_MANIFEST_FILE: &str = "CLOUDMANIFEST";

/// The serialized contents of the `CLOUDMANIFEST` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudManifest {
    /// `(end_file_number, epoch)` pairs, ascending and exclusive: a file
    /// numbered `n` belongs to the first entry with `end_file_number > n`.
    pub past_epochs: Vec<(u64, String)>,

    /// Epoch of the current owner; covers every file number past the last
    /// recorded boundary.
    pub current_epoch: String,

    /// Engine sequence number of the authoritative engine manifest.
    pub manifest_file_number: u64,
}

impl CloudManifest {
    pub fn new(epoch: String, manifest_file_number: u64) -> Self {
        Self {
            past_epochs: Vec::new(),
            current_epoch: epoch,
            manifest_file_number,
        }
    }

    /// The epoch a given engine file number belongs to.
    pub fn epoch_for(&self, file_number: u64) -> &str {
        for (end, epoch) in &self.past_epochs {
            if file_number < *end {
                return epoch;
            }
        }
        &self.current_epoch
    }

    /// Remote name of the authoritative engine manifest.
    pub fn manifest_name(&self) -> String {
        filename::with_epoch(
            &format!("MANIFEST-{:06}", self.manifest_file_number),
            &self.current_epoch,
        )
    }

    /// Retire the current epoch at `boundary` and install a new one.
    /// File numbers below `boundary` keep resolving to the old epoch.
    pub fn add_epoch(&mut self, boundary: u64, epoch: String) {
        let boundary = self
            .past_epochs
            .last()
            .map(|(end, _)| boundary.max(*end))
            .unwrap_or(boundary);
        let old = std::mem::replace(&mut self.current_epoch, epoch);
        self.past_epochs.push((boundary, old));
    }

    /// Transfer a name from the engine's domain to the remote domain:
    /// `00010.sst` becomes `{epoch}.00010.sst` for whichever epoch file 10
    /// was created under.
    pub fn remap(&self, name: &str) -> String {
        let base = filename::strip_epoch(name);
        match filename::classify(&base) {
            FileClass::Data | FileClass::Log => {
                let epoch = filename::file_number(&base)
                    .map(|n| self.epoch_for(n))
                    .unwrap_or(&self.current_epoch);
                filename::with_epoch(&base, epoch)
            }
            FileClass::Other => filename::with_epoch(&base, &self.current_epoch),
        }
    }

    pub fn to_bytes(&self) -> CloudResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec_pretty(self)?))
    }

    pub fn from_bytes(data: &[u8]) -> CloudResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| CloudError::Corruption(format!("malformed cloud manifest: {e}")))
    }
}

/// Parse an engine manifest body into the engine-visible names of its live
/// data files. The engine manifest is opaque to most of this crate; the
/// purge and savepoint layers consume exactly this contract.
pub fn parse_engine_manifest(data: &[u8]) -> CloudResult<Vec<String>> {
    serde_json::from_slice(data)
        .map_err(|e| CloudError::Corruption(format!("malformed engine manifest: {e}")))
}

/// Serialize live-file names into an engine manifest body.
pub fn encode_engine_manifest(files: &[String]) -> CloudResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec_pretty(&files)?))
}

/// Mints writer epochs.
pub struct EpochMinter {
    strategy: EpochStrategy,
    counter: AtomicU64,
}

impl EpochMinter {
    pub fn new(strategy: EpochStrategy) -> Self {
        Self {
            strategy,
            counter: AtomicU64::new(0),
        }
    }

    pub fn mint(&self) -> String {
        match self.strategy {
            EpochStrategy::NanosWithRandom => {
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos();
                format!("{:x}-{:08x}", nanos, rand::random::<u32>())
            }
            EpochStrategy::MonotonicCounter => {
                format!("{:016}", self.counter.fetch_add(1, Ordering::SeqCst) + 1)
            }
        }
    }

    /// Fold an epoch observed in a loaded cloud manifest into the counter,
    /// so counter-minted epochs stay monotonic across writers sharing a
    /// prefix. A no-op for non-counter epochs.
    pub fn observe(&self, epoch: &str) {
        if let Ok(n) = epoch.parse::<u64>() {
            self.counter.fetch_max(n, Ordering::SeqCst);
        }
    }
}

/// The result of acquiring (or observing) a prefix.
#[derive(Debug, Clone)]
pub struct OpenedManifest {
    pub manifest: CloudManifest,
    /// The engine manifest body this open inherited; handed to the engine
    /// for replay. Empty list for a fresh prefix.
    pub inherited: Bytes,
}

/// Owns the pointer object and the in-memory remap state for one open
/// database. Remap state is read under a reader-writer lock and mutated
/// only while executing an epoch bump or a manifest roll.
pub struct ManifestCoordinator {
    storage: Arc<RemoteStorage>,
    minter: EpochMinter,
    state: RwLock<Option<CloudManifest>>,
}

impl ManifestCoordinator {
    pub fn new(storage: Arc<RemoteStorage>, strategy: EpochStrategy) -> Self {
        Self {
            storage,
            minter: EpochMinter::new(strategy),
            state: RwLock::new(None),
        }
    }

    /// The currently loaded cloud manifest, if any.
    pub fn loaded(&self) -> Option<CloudManifest> {
        self.state.read().clone()
    }

    /// Epoch of the current owner, if a manifest is loaded.
    pub fn current_epoch(&self) -> Option<String> {
        self.state.read().as_ref().map(|m| m.current_epoch.clone())
    }

    /// Remap an engine-visible name to its remote name. Identity when no
    /// cloud manifest is loaded (purely local databases).
    pub fn remap(&self, name: &str) -> String {
        match &*self.state.read() {
            Some(m) => m.remap(name),
            None => filename::basename(name).to_string(),
        }
    }

    /// Fetch the pointer object of a prefix, `None` on a fresh prefix.
    pub async fn load(&self, prefix: &RemotePath) -> CloudResult<Option<CloudManifest>> {
        match self.storage.get_opt(prefix, CLOUD_MANIFEST_FILE).await? {
            Some(data) => Ok(Some(CloudManifest::from_bytes(&data)?)),
            None => Ok(None),
        }
    }

    /// Open a prefix without taking ownership: load the pointer and the
    /// engine manifest it names, install the remap state, and hand the
    /// manifest body back. `None` for a fresh prefix.
    pub async fn open_as_reader(
        &self,
        prefix: &RemotePath,
    ) -> CloudResult<Option<OpenedManifest>> {
        let manifest = match self.load(prefix).await? {
            Some(m) => m,
            None => return Ok(None),
        };
        let inherited = self.fetch_named_manifest(&manifest, prefix, None).await?;
        *self.state.write() = Some(manifest.clone());
        Ok(Some(OpenedManifest {
            manifest,
            inherited,
        }))
    }

    /// Acquire ownership of `prefix`. `fallback` is consulted for the
    /// engine manifest body when opening a clone whose destination does not
    /// hold it yet.
    ///
    /// On return the pointer object names a freshly uploaded engine
    /// manifest stamped with this process's new epoch, and this process is
    /// the owner of record.
    pub async fn open_as_writer(
        &self,
        prefix: &RemotePath,
        fallback: Option<&RemotePath>,
    ) -> CloudResult<OpenedManifest> {
        let mut existing = self.load(prefix).await?;
        if existing.is_none() {
            if let Some(src) = fallback {
                existing = self.load(src).await?;
            }
        }

        if let Some(m) = &existing {
            self.minter.observe(&m.current_epoch);
        }
        let epoch = self.minter.mint();
        let (manifest, inherited) = match existing {
            Some(mut m) => {
                let inherited = self.fetch_named_manifest(&m, prefix, fallback).await?;
                let boundary = next_file_number(&inherited)?;
                m.add_epoch(boundary, epoch);
                (m, inherited)
            }
            None => {
                let inherited = encode_engine_manifest(&[])?;
                (CloudManifest::new(epoch, 1), inherited)
            }
        };

        // The named engine manifest must be durable before the pointer
        // flips to it.
        self.storage
            .put(prefix, &manifest.manifest_name(), inherited.clone())
            .await?;
        self.storage
            .put(prefix, CLOUD_MANIFEST_FILE, manifest.to_bytes()?)
            .await?;

        tracing::info!(
            prefix = %prefix,
            epoch = %manifest.current_epoch,
            manifest = %manifest.manifest_name(),
            "acquired ownership"
        );

        *self.state.write() = Some(manifest.clone());
        Ok(OpenedManifest {
            manifest,
            inherited,
        })
    }

    /// The engine rolled its manifest: upload the new body under the
    /// current epoch's name, then flip the pointer to it.
    pub async fn roll_manifest(
        &self,
        prefix: &RemotePath,
        file_number: u64,
        body: Bytes,
    ) -> CloudResult<()> {
        let mut manifest = self.loaded().ok_or_else(|| {
            CloudError::Internal("manifest roll without a loaded cloud manifest".to_string())
        })?;
        manifest.manifest_file_number = file_number;

        self.storage
            .put(prefix, &manifest.manifest_name(), body)
            .await?;
        self.storage
            .put(prefix, CLOUD_MANIFEST_FILE, manifest.to_bytes()?)
            .await?;

        tracing::debug!(prefix = %prefix, manifest = %manifest.manifest_name(), "rolled engine manifest");
        *self.state.write() = Some(manifest);
        Ok(())
    }

    async fn fetch_named_manifest(
        &self,
        manifest: &CloudManifest,
        prefix: &RemotePath,
        fallback: Option<&RemotePath>,
    ) -> CloudResult<Bytes> {
        let name = manifest.manifest_name();
        if let Some(data) = self.storage.get_opt(prefix, &name).await? {
            return Ok(data);
        }
        if let Some(src) = fallback {
            if let Some(data) = self.storage.get_opt(src, &name).await? {
                return Ok(data);
            }
        }
        // A pointer naming a missing manifest means the prefix is damaged;
        // refuse to open.
        Err(CloudError::Corruption(format!(
            "cloud manifest of {prefix} names missing engine manifest {name}"
        )))
    }
}

/// First engine file number that belongs to the next epoch: one past the
/// highest number referenced by the inherited engine manifest.
fn next_file_number(manifest_body: &[u8]) -> CloudResult<u64> {
    let files = parse_engine_manifest(manifest_body)?;
    Ok(files
        .iter()
        .filter_map(|name| filename::file_number(name))
        .max()
        .map(|n| n + 1)
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use std::time::Duration;

    fn coordinator(store: Arc<RemoteStorage>) -> ManifestCoordinator {
        ManifestCoordinator::new(store, EpochStrategy::MonotonicCounter)
    }

    fn storage() -> Arc<RemoteStorage> {
        Arc::new(RemoteStorage::new(
            Arc::new(InMemory::new()),
            Duration::from_secs(2),
        ))
    }

    #[test]
    fn test_epoch_for_ranges() {
        let mut m = CloudManifest::new("e1".to_string(), 1);
        assert_eq!(m.epoch_for(0), "e1");
        assert_eq!(m.epoch_for(99), "e1");

        m.add_epoch(5, "e2".to_string());
        m.add_epoch(9, "e3".to_string());
        assert_eq!(m.epoch_for(4), "e1");
        assert_eq!(m.epoch_for(5), "e2");
        assert_eq!(m.epoch_for(8), "e2");
        assert_eq!(m.epoch_for(9), "e3");
    }

    #[test]
    fn test_remap_uses_creating_epoch() {
        let mut m = CloudManifest::new("e1".to_string(), 1);
        m.add_epoch(10, "e2".to_string());
        assert_eq!(m.remap("000005.sst"), "e1.000005.sst");
        assert_eq!(m.remap("/db/000012.sst"), "e2.000012.sst");
        // Already-remapped names resolve identically.
        assert_eq!(m.remap("e1.000005.sst"), "e1.000005.sst");
        assert_eq!(m.remap("MANIFEST-000003"), "MANIFEST-e2-000003");
        assert_eq!(m.remap("CURRENT"), "CURRENT");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut m = CloudManifest::new("e1".to_string(), 7);
        m.add_epoch(3, "e2".to_string());
        let bytes = m.to_bytes().unwrap();
        assert_eq!(CloudManifest::from_bytes(&bytes).unwrap(), m);
        assert!(CloudManifest::from_bytes(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_open_fresh_prefix() {
        let s = storage();
        let prefix = RemotePath::new("bucket", "db");
        let c = coordinator(s.clone());

        let opened = c.open_as_writer(&prefix, None).await.unwrap();
        assert!(opened.manifest.past_epochs.is_empty());
        assert_eq!(parse_engine_manifest(&opened.inherited).unwrap().len(), 0);

        // P1: the pointer names an engine manifest that exists.
        let pointer = c.load(&prefix).await.unwrap().unwrap();
        assert!(s
            .exists(&prefix, &pointer.manifest_name())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_reopen_inherits_and_bumps_epoch() {
        let s = storage();
        let prefix = RemotePath::new("bucket", "db");

        let c1 = coordinator(s.clone());
        let first = c1.open_as_writer(&prefix, None).await.unwrap();
        let e1 = first.manifest.current_epoch.clone();

        // Engine writes files 1 and 2 under e1 and rolls its manifest.
        let body = encode_engine_manifest(&["000001.sst".into(), "000002.sst".into()]).unwrap();
        c1.roll_manifest(&prefix, 3, body).await.unwrap();

        let c2 = coordinator(s.clone());
        let second = c2.open_as_writer(&prefix, None).await.unwrap();
        let e2 = second.manifest.current_epoch.clone();
        assert_ne!(e1, e2);

        // Files written under the first owner still resolve to its epoch;
        // new files get the new epoch.
        assert_eq!(second.manifest.remap("000002.sst"), format!("{e1}.000002.sst"));
        assert_eq!(second.manifest.remap("000003.sst"), format!("{e2}.000003.sst"));

        // The inherited manifest body is what the first owner rolled.
        let files = parse_engine_manifest(&second.inherited).unwrap();
        assert_eq!(files, vec!["000001.sst".to_string(), "000002.sst".to_string()]);
    }

    #[tokio::test]
    async fn test_last_writer_wins_pointer() {
        let s = storage();
        let prefix = RemotePath::new("bucket", "db");

        let w1 = coordinator(s.clone());
        w1.open_as_writer(&prefix, None).await.unwrap();
        let w2 = coordinator(s.clone());
        let second = w2.open_as_writer(&prefix, None).await.unwrap();

        let pointer = w2.load(&prefix).await.unwrap().unwrap();
        assert_eq!(pointer.current_epoch, second.manifest.current_epoch);
    }

    #[tokio::test]
    async fn test_dangling_pointer_is_corruption() {
        let s = storage();
        let prefix = RemotePath::new("bucket", "db");
        let c = coordinator(s.clone());
        c.open_as_writer(&prefix, None).await.unwrap();

        // Damage the prefix: remove the engine manifest the pointer names.
        let pointer = c.load(&prefix).await.unwrap().unwrap();
        s.delete(&prefix, &pointer.manifest_name()).await.unwrap();

        let c2 = coordinator(s.clone());
        let err = c2.open_as_writer(&prefix, None).await.unwrap_err();
        assert!(matches!(err, CloudError::Corruption(_)));
        let err = c2.open_as_reader(&prefix).await.unwrap_err();
        assert!(matches!(err, CloudError::Corruption(_)));
    }

    #[tokio::test]
    async fn test_reader_does_not_write_pointer() {
        let s = storage();
        let prefix = RemotePath::new("bucket", "db");
        let c = coordinator(s.clone());
        assert!(c.open_as_reader(&prefix).await.unwrap().is_none());
        assert!(!s.exists(&prefix, CLOUD_MANIFEST_FILE).await.unwrap());
    }

    #[test]
    fn test_minter_strategies() {
        let counter = EpochMinter::new(EpochStrategy::MonotonicCounter);
        assert_eq!(counter.mint(), "0000000000000001");
        assert_eq!(counter.mint(), "0000000000000002");

        let nanos = EpochMinter::new(EpochStrategy::NanosWithRandom);
        let a = nanos.mint();
        let b = nanos.mint();
        assert_ne!(a, b);
        assert!(a.contains('-'));
        // Epochs must never contain '.', which the remap format relies on.
        assert!(!a.contains('.'));
    }
}
