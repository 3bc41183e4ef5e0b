//! Savepoint: make a clone independent of its source.
//!
//! A freshly opened clone reads data files it has not yet rewritten by
//! falling through to its source prefix. `savepoint` walks the clone's
//! live file set and server-side copies every object still missing from
//! the destination, after which the source can disappear without
//! affecting the clone. Object names are prefix-relative and carry their
//! creating epoch, so the copied objects keep their names and the engine
//! manifest needs no rewriting.

use crate::env::CloudEnv;
use crate::manifest::parse_engine_manifest;
use crate::{CloudError, CloudResult};

impl CloudEnv {
    /// Materialize this clone's dependency on its source by copying every
    /// live data object not yet present in the destination prefix.
    /// Returns the number of objects copied. A no-op on non-clones.
    pub async fn savepoint(&self) -> CloudResult<usize> {
        let (Some(src), Some(dst)) = (&self.config().src, &self.config().dst) else {
            return Ok(0);
        };
        if src == dst {
            return Ok(0);
        }

        let manifest = self.coordinator().loaded().ok_or_else(|| {
            CloudError::Internal("savepoint without a loaded cloud manifest".to_string())
        })?;
        let body = self
            .storage()
            .get_opt(dst, &manifest.manifest_name())
            .await?
            .ok_or_else(|| {
                CloudError::Corruption(format!(
                    "savepoint: engine manifest {} missing from {dst}",
                    manifest.manifest_name()
                ))
            })?;

        let mut copied = 0;
        for name in parse_engine_manifest(&body)? {
            let remote = manifest.remap(&name);
            if self.storage().exists(dst, &remote).await? {
                continue;
            }
            self.storage().copy(src, &remote, dst, &remote).await?;
            copied += 1;
            tracing::debug!(name = %remote, src = %src, dst = %dst, "savepoint copied object");
        }

        tracing::info!(copied, src = %src, dst = %dst, "savepoint complete");
        Ok(copied)
    }
}
