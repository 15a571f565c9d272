/*!
 * State Store
 *
 * Durable record of every instance. Writes go to a sibling temp file which is
 * fsynced and then renamed over the target, so a reader (or a restart after a
 * crash) only ever sees a complete file. Writes are serialized and each one
 * snapshots the table while holding the write lock, so an older snapshot can
 * never overwrite a newer one.
 */

use crate::core::clock::Clock;
use crate::core::errors::{OrchestratorError, OrchestratorResult};
use crate::core::limits::STATE_FILE_VERSION;
use crate::core::types::TimestampMs;
use crate::instance::{InstanceTable, ServiceInstance};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// On-disk layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFile {
    pub version: u32,
    pub saved_at: TimestampMs,
    pub revision: u64,
    pub instances: Vec<ServiceInstance>,
}

pub struct StateStore {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    /// Table revision of the last successful write
    written: Mutex<Option<u64>>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
            written: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read persisted instances. A missing file is an empty fleet.
    pub async fn load(&self) -> OrchestratorResult<Vec<ServiceInstance>> {
        let Some(state) = read_json::<StateFile>(&self.path).await? else {
            info!(path = %self.path.display(), "No state file, starting with an empty fleet");
            return Ok(Vec::new());
        };
        if state.version != STATE_FILE_VERSION {
            return Err(OrchestratorError::Storage(format!(
                "unsupported state file version {} (expected {})",
                state.version, STATE_FILE_VERSION
            )));
        }
        info!(
            path = %self.path.display(),
            instances = state.instances.len(),
            "State loaded"
        );
        Ok(state.instances)
    }

    /// Write the table if it changed since the last write.
    /// Returns whether a write happened.
    pub async fn persist(&self, table: &InstanceTable) -> OrchestratorResult<bool> {
        let mut written = self.written.lock().await;
        let revision = table.revision();
        if *written == Some(revision) {
            return Ok(false);
        }
        self.write_locked(table, revision).await?;
        *written = Some(revision);
        Ok(true)
    }

    /// Write unconditionally
    pub async fn flush(&self, table: &InstanceTable) -> OrchestratorResult<()> {
        let mut written = self.written.lock().await;
        let revision = table.revision();
        self.write_locked(table, revision).await?;
        *written = Some(revision);
        Ok(())
    }

    async fn write_locked(&self, table: &InstanceTable, revision: u64) -> OrchestratorResult<()> {
        let state = StateFile {
            version: STATE_FILE_VERSION,
            saved_at: self.clock.now_ms(),
            revision,
            instances: table.snapshot(),
        };
        write_json_atomic(&self.path, &state).await?;
        debug!(revision, instances = state.instances.len(), "State persisted");
        Ok(())
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path`
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> OrchestratorResult<()> {
    let json = serde_json::to_vec_pretty(value).map_err(OrchestratorError::storage)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(OrchestratorError::storage)?;
    }

    let tmp_path = temp_path(path);
    let result = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, path).await
    }
    .await;

    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Atomic write failed");
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(OrchestratorError::storage(e));
    }
    Ok(())
}

/// Read JSON from `path`; `None` when the file does not exist
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> OrchestratorResult<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| OrchestratorError::Storage(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(OrchestratorError::storage(e)),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
