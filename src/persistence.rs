//! Durable ring membership: which virtual nodes this peer hosts and
//! their last known routing tables.
//!
//! The file is MessagePack with a leading format version. Writes go to a
//! sibling temporary file that is synced and then renamed over the
//! target, so a reader sees either the old or the new state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::core::identifier::NodeID;
use crate::core::location_table::LocationTable;
use crate::error::{Error, Result};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedVnode {
    pub node_id: NodeID,
    pub table: LocationTable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRingState {
    pub version: u32,
    pub vnodes: Vec<PersistedVnode>,
}

impl PersistedRingState {
    pub fn new(vnodes: Vec<PersistedVnode>) -> Self {
        Self {
            version: FORMAT_VERSION,
            vnodes,
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Read the persisted state. A missing file is `Ok(None)`.
pub async fn load(path: &Path) -> Result<Option<PersistedRingState>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no persisted ring state");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let state: PersistedRingState = rmp_serde::from_slice(&bytes)
        .map_err(|e| Error::PersistenceCorrupt(format!("{}: {e}", path.display())))?;
    if state.version != FORMAT_VERSION {
        return Err(Error::PersistenceCorrupt(format!(
            "{}: unsupported format version {}",
            path.display(),
            state.version
        )));
    }
    for vnode in &state.vnodes {
        if vnode.table.me().node_id != vnode.node_id {
            return Err(Error::PersistenceCorrupt(format!(
                "table of {} belongs to {}",
                vnode.node_id,
                vnode.table.me().node_id
            )));
        }
    }
    Ok(Some(state))
}

/// Atomically replace the persisted state at `path`.
pub async fn save(path: &Path, state: &PersistedRingState) -> Result<()> {
    let bytes = rmp_serde::to_vec_named(state)?;
    let tmp = temp_path(path);
    {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(&tmp, path).await?;
    info!(path = %path.display(), vnodes = state.vnodes.len(), "ring state saved");
    Ok(())
}
