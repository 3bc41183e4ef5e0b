//! Durable registry of database identities.
//!
//! Every independent logical database in a bucket owns exactly one record
//! under `dbids/<identity>`, written on its first open as a writer. The
//! record points back at the prefix the database lives in (for a clone,
//! the clone's own destination) and the epoch it was created under, which
//! is what lets the purger recognize clone relationships and reclaim
//! orphaned registrations.

use crate::config::RemotePath;
use crate::remote::RemoteStorage;
use crate::CloudResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Sub-prefix the registry occupies inside each prefix.
pub const DBID_PREFIX: &str = "dbids";

/// Body of a `dbids/<identity>` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbidRecord {
    /// The prefix this database reads its remote state from.
    pub source: RemotePath,
    /// Epoch of the writer open that created the record.
    pub epoch: String,
}

/// Maintains `dbids/` records under a prefix.
pub struct DbidRegistry {
    storage: Arc<RemoteStorage>,
}

impl DbidRegistry {
    pub fn new(storage: Arc<RemoteStorage>) -> Self {
        Self { storage }
    }

    fn key(dbid: &str) -> String {
        format!("{DBID_PREFIX}/{dbid}")
    }

    /// Record `dbid` under `prefix` on first writer open. An existing
    /// record is left untouched so a logical database keeps exactly one
    /// registration no matter how many times it reopens.
    pub async fn register(
        &self,
        prefix: &RemotePath,
        dbid: &str,
        record: DbidRecord,
    ) -> CloudResult<DbidRecord> {
        if let Some(existing) = self.get(prefix, dbid).await? {
            tracing::debug!(dbid, prefix = %prefix, "dbid already registered");
            return Ok(existing);
        }
        let body = serde_json::to_vec_pretty(&record)?;
        self.storage.put(prefix, &Self::key(dbid), body.into()).await?;
        tracing::info!(dbid, prefix = %prefix, epoch = %record.epoch, "registered dbid");
        Ok(record)
    }

    pub async fn get(&self, prefix: &RemotePath, dbid: &str) -> CloudResult<Option<DbidRecord>> {
        match self.storage.get_opt(prefix, &Self::key(dbid)).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// All `(identity, record)` pairs registered under `prefix`.
    pub async fn list(&self, prefix: &RemotePath) -> CloudResult<Vec<(String, DbidRecord)>> {
        let keys = self.storage.list(prefix, DBID_PREFIX).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(dbid) = key.strip_prefix(&format!("{DBID_PREFIX}/")) else {
                continue;
            };
            if let Some(data) = self.storage.get_opt(prefix, &key).await? {
                out.push((dbid.to_string(), serde_json::from_slice(&data)?));
            }
        }
        Ok(out)
    }

    /// Remove an orphaned registration.
    pub async fn unregister(&self, prefix: &RemotePath, dbid: &str) -> CloudResult<()> {
        self.storage.delete(prefix, &Self::key(dbid)).await
    }
}

/// Mint a fresh database identity string.
pub fn generate_dbid() -> String {
    format!(
        "{:016x}{:016x}",
        rand::random::<u64>(),
        rand::random::<u64>()
    )
}
