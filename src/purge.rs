//! Reclamation of unreferenced remote state.
//!
//! A data object under a prefix is obsolete when no reachable engine
//! manifest references it: not the prefix's own pointer, and not the
//! pointer of any clone that still reads through this prefix. The finder
//! computes the set difference between the prefix listing and the union of
//! live files of every reachable manifest; actual deletion goes through
//! the deferred scheduler, so late readers get a grace period.
//!
//! A dbid registration is obsolete when the prefix it points back at no
//! longer resolves to a readable manifest chain.

use crate::config::RemotePath;
use crate::dbid::{DbidRegistry, DBID_PREFIX};
use crate::env::CloudEnv;
use crate::filename;
use crate::manifest::{parse_engine_manifest, CloudManifest, CLOUD_MANIFEST_FILE};
use crate::remote::RemoteStorage;
use crate::{CloudError, CloudResult};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Keys under a prefix that are infrastructure, never purge candidates.
fn is_internal_key(key: &str) -> bool {
    key == CLOUD_MANIFEST_FILE
        || key == "IDENTITY"
        || key.starts_with(&format!("{DBID_PREFIX}/"))
        || key.starts_with("tailer-checkpoint/")
}

async fn load_pointer(
    storage: &Arc<RemoteStorage>,
    prefix: &RemotePath,
) -> CloudResult<Option<CloudManifest>> {
    match storage.get_opt(prefix, CLOUD_MANIFEST_FILE).await? {
        Some(data) => Ok(Some(CloudManifest::from_bytes(&data)?)),
        None => Ok(None),
    }
}

/// Live remote names referenced by the pointer of `root`, resolved through
/// that root's own epoch map. Errors rather than guesses when the chain is
/// damaged: purging on partial information would delete live data.
async fn live_files_of(
    storage: &Arc<RemoteStorage>,
    root: &RemotePath,
) -> CloudResult<Option<(CloudManifest, Vec<String>)>> {
    let Some(manifest) = load_pointer(storage, root).await? else {
        return Ok(None);
    };
    let body = storage
        .get_opt(root, &manifest.manifest_name())
        .await?
        .ok_or_else(|| {
            CloudError::Corruption(format!(
                "pointer of {root} names missing engine manifest {}",
                manifest.manifest_name()
            ))
        })?;
    let names = parse_engine_manifest(&body)?;
    let remapped = names.iter().map(|n| manifest.remap(n)).collect();
    Ok(Some((manifest, remapped)))
}

/// Report the objects under `prefix` that no reachable engine manifest
/// references. `roots` are the prefixes whose pointers are treated as
/// reachable: the prefix itself plus any known clone destinations that
/// still fall through to it.
pub async fn find_obsolete_files(
    storage: &Arc<RemoteStorage>,
    prefix: &RemotePath,
    roots: &[RemotePath],
) -> CloudResult<Vec<String>> {
    let mut live: BTreeSet<String> = BTreeSet::new();
    let mut live_manifests: BTreeSet<String> = BTreeSet::new();

    for root in roots {
        if let Some((manifest, files)) = live_files_of(storage, root).await? {
            live.extend(files);
            live_manifests.insert(manifest.manifest_name());
        }
    }

    let mut obsolete = Vec::new();
    for key in storage.list(prefix, "").await? {
        if is_internal_key(&key) {
            continue;
        }
        if filename::is_data_file(&key) {
            if !live.contains(&key) {
                obsolete.push(key);
            }
        } else if key.starts_with("MANIFEST-") && !live_manifests.contains(&key) {
            // Engine manifests from superseded epochs.
            obsolete.push(key);
        }
    }

    tracing::debug!(
        prefix = %prefix,
        live = live.len(),
        obsolete = obsolete.len(),
        "obsolete-file scan complete"
    );
    Ok(obsolete)
}

/// Report registered identities whose recorded source prefix no longer
/// resolves to a live manifest chain.
pub async fn find_obsolete_dbids(
    storage: &Arc<RemoteStorage>,
    prefix: &RemotePath,
) -> CloudResult<Vec<String>> {
    let registry = DbidRegistry::new(storage.clone());
    let mut obsolete = Vec::new();

    for (dbid, record) in registry.list(prefix).await? {
        let alive = match load_pointer(storage, &record.source).await {
            Ok(Some(manifest)) => storage
                .exists(&record.source, &manifest.manifest_name())
                .await?,
            Ok(None) => false,
            // An unreadable pointer is not proof of death; keep the record.
            Err(e) => {
                tracing::warn!(dbid = %dbid, error = %e, "dbid liveness check failed");
                true
            }
        };
        if !alive {
            obsolete.push(dbid);
        }
    }
    Ok(obsolete)
}

impl CloudEnv {
    /// Obsolete objects under the destination prefix, per the reachable
    /// roots this environment knows about (its own pointer).
    pub async fn find_obsolete_files(&self) -> CloudResult<Vec<String>> {
        let Some(dst) = &self.config().dst else {
            return Ok(Vec::new());
        };
        find_obsolete_files(self.storage(), dst, &[dst.clone()]).await
    }

    /// Orphaned dbid registrations under the destination prefix.
    pub async fn find_obsolete_dbids(&self) -> CloudResult<Vec<String>> {
        let Some(dst) = &self.config().dst else {
            return Ok(Vec::new());
        };
        find_obsolete_dbids(self.storage(), dst).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EpochStrategy;
    use crate::dbid::DbidRecord;
    use crate::manifest::{encode_engine_manifest, ManifestCoordinator};
    use bytes::Bytes;
    use object_store::memory::InMemory;
    use std::time::Duration;

    fn storage() -> Arc<RemoteStorage> {
        Arc::new(RemoteStorage::new(
            Arc::new(InMemory::new()),
            Duration::from_secs(2),
        ))
    }

    async fn open_writer(
        storage: &Arc<RemoteStorage>,
        prefix: &RemotePath,
    ) -> ManifestCoordinator {
        let c = ManifestCoordinator::new(storage.clone(), EpochStrategy::MonotonicCounter);
        c.open_as_writer(prefix, None).await.unwrap();
        c
    }

    #[tokio::test]
    async fn test_unreferenced_data_files_are_obsolete() {
        let s = storage();
        let prefix = RemotePath::new("bucket", "db");
        let c = open_writer(&s, &prefix).await;
        let epoch = c.current_epoch().unwrap();

        // Two uploads, only one referenced by the rolled manifest.
        s.put(&prefix, &format!("{epoch}.000001.sst"), Bytes::from_static(b"live"))
            .await
            .unwrap();
        s.put(&prefix, &format!("{epoch}.000002.sst"), Bytes::from_static(b"dead"))
            .await
            .unwrap();
        let body = encode_engine_manifest(&["000001.sst".to_string()]).unwrap();
        c.roll_manifest(&prefix, 3, body).await.unwrap();

        let obsolete = find_obsolete_files(&s, &prefix, &[prefix.clone()])
            .await
            .unwrap();
        assert!(obsolete.contains(&format!("{epoch}.000002.sst")));
        assert!(!obsolete.contains(&format!("{epoch}.000001.sst")));
        // The superseded manifest from the open is obsolete, the current
        // one is not.
        assert!(obsolete.iter().any(|k| k.starts_with("MANIFEST-") && k.ends_with("000001")));
        assert!(!obsolete.contains(&c.loaded().unwrap().manifest_name()));
        // Infrastructure keys never show up.
        assert!(!obsolete.iter().any(|k| k == CLOUD_MANIFEST_FILE));
    }

    #[tokio::test]
    async fn test_clone_root_protects_objects() {
        let s = storage();
        let src = RemotePath::new("bucket", "master");

        // Master writes file 1 and publishes a manifest referencing it.
        let master = open_writer(&s, &src).await;
        let epoch = master.current_epoch().unwrap();
        s.put(&src, &format!("{epoch}.000001.sst"), Bytes::from_static(b"d"))
            .await
            .unwrap();
        let body = encode_engine_manifest(&["000001.sst".to_string()]).unwrap();
        master.roll_manifest(&src, 2, body).await.unwrap();

        // A clone inherits that manifest; its epoch map keeps file 1
        // resolving to the master epoch.
        let dst = RemotePath::new("bucket", "clone");
        let clone = ManifestCoordinator::new(s.clone(), EpochStrategy::MonotonicCounter);
        clone.open_as_writer(&dst, Some(&src)).await.unwrap();

        // The master then reopens and drops file 1 from its own view.
        let master2 = open_writer(&s, &src).await;
        master2
            .roll_manifest(&src, 3, encode_engine_manifest(&[]).unwrap())
            .await
            .unwrap();

        // Without the clone root the object is obsolete; with it, it is
        // protected.
        let alone = find_obsolete_files(&s, &src, &[src.clone()]).await.unwrap();
        assert!(alone.contains(&format!("{epoch}.000001.sst")));

        let with_clone = find_obsolete_files(&s, &src, &[src.clone(), dst.clone()])
            .await
            .unwrap();
        assert!(!with_clone.contains(&format!("{epoch}.000001.sst")));
    }

    #[tokio::test]
    async fn test_dangling_pointer_fails_scan() {
        let s = storage();
        let prefix = RemotePath::new("bucket", "db");
        let c = open_writer(&s, &prefix).await;
        s.delete(&prefix, &c.loaded().unwrap().manifest_name())
            .await
            .unwrap();

        let err = find_obsolete_files(&s, &prefix, &[prefix.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Corruption(_)));
    }

    #[tokio::test]
    async fn test_obsolete_dbids() {
        let s = storage();
        let prefix = RemotePath::new("bucket", "db");
        open_writer(&s, &prefix).await;

        let registry = DbidRegistry::new(s.clone());
        registry
            .register(
                &prefix,
                "alive",
                DbidRecord {
                    source: prefix.clone(),
                    epoch: "e".to_string(),
                },
            )
            .await
            .unwrap();
        registry
            .register(
                &prefix,
                "orphan",
                DbidRecord {
                    source: RemotePath::new("bucket", "gone"),
                    epoch: "e".to_string(),
                },
            )
            .await
            .unwrap();

        let obsolete = find_obsolete_dbids(&s, &prefix).await.unwrap();
        assert_eq!(obsolete, vec!["orphan".to_string()]);
    }
}
