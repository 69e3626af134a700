use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunk::Chunk;
use crate::error::{CoreError, CoreResult};
use crate::storage::StorageBackend;

pub type PackageId = Uuid;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    #[default]
    None,
    Created,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::None => "none",
            DownloadStatus::Created => "created",
            DownloadStatus::Running => "running",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Stopped => "stopped",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(DownloadStatus::None),
            "created" => Some(DownloadStatus::Created),
            "running" => Some(DownloadStatus::Running),
            "paused" => Some(DownloadStatus::Paused),
            "stopped" => Some(DownloadStatus::Stopped),
            "completed" => Some(DownloadStatus::Completed),
            "failed" => Some(DownloadStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to resume one logical download, possibly in another
/// process. Transient buffers are never part of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadPackage {
    pub id: PackageId,
    pub urls: Vec<String>,
    pub chunks: Vec<Chunk>,
    pub total_file_size: u64,
    /// Sum of the chunks' received bytes. Kept after the chunks are released
    /// on success so the final size stays observable.
    pub received_bytes_size: u64,
    pub is_support_download_in_range: bool,
    pub file_name: Option<PathBuf>,
    pub in_memory: bool,
    pub is_saving: bool,
    pub is_save_complete: bool,
    pub save_progress: f64,
    pub status: DownloadStatus,
    #[serde(default, with = "storage_serde")]
    pub storage: Option<Arc<dyn StorageBackend>>,
}

impl Default for DownloadPackage {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            urls: Vec::new(),
            chunks: Vec::new(),
            total_file_size: 0,
            received_bytes_size: 0,
            is_support_download_in_range: false,
            file_name: None,
            in_memory: false,
            is_saving: false,
            is_save_complete: false,
            save_progress: 0.0,
            status: DownloadStatus::None,
            storage: None,
        }
    }
}

impl DownloadPackage {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            ..Self::default()
        }
    }

    pub fn recompute_received(&mut self) -> u64 {
        self.received_bytes_size = self.chunks.iter().map(Chunk::received).sum();
        self.received_bytes_size
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.total_file_size == 0 {
            return if self.is_save_complete { 100.0 } else { 0.0 };
        }
        (self.received_bytes_size as f64 * 100.0 / self.total_file_size as f64).min(100.0)
    }

    pub fn is_complete(&self) -> bool {
        !self.chunks.is_empty() && self.chunks.iter().all(Chunk::is_complete)
    }

    /// Releases the chunk list; the storage handle is untouched.
    pub fn clear_chunks(&mut self) {
        self.chunks.clear();
    }

    /// Disposes and drops the storage handle, if any.
    pub async fn release_storage(&mut self) -> CoreResult<()> {
        if let Some(storage) = self.storage.take() {
            storage.dispose().await?;
        }
        Ok(())
    }

    pub async fn clear(&mut self) -> CoreResult<()> {
        self.clear_chunks();
        self.is_saving = false;
        self.release_storage().await
    }

    pub async fn flush(&self) -> CoreResult<()> {
        match &self.storage {
            Some(storage) => storage.flush().await,
            None => Ok(()),
        }
    }

    /// All bytes currently held by the storage backend.
    pub async fn read_all(&self) -> CoreResult<Vec<u8>> {
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| CoreError::InvalidState("package has no storage".to_string()))?;
        let len = storage.len().await?;
        storage.read_range(0, len as usize).await
    }

    pub fn to_json(&self) -> CoreResult<String> {
        serde_json::to_string_pretty(self).map_err(|err| CoreError::Storage(err.to_string()))
    }

    pub fn from_json(value: &str) -> CoreResult<Self> {
        serde_json::from_str(value).map_err(|err| CoreError::Storage(err.to_string()))
    }
}

mod storage_serde {
    use std::sync::Arc;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::storage::{StorageBackend, StorageDescriptor};

    pub fn serialize<S>(storage: &Option<Arc<dyn StorageBackend>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        storage
            .as_ref()
            .filter(|storage| !storage.is_disposed())
            .map(|storage| storage.descriptor())
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Arc<dyn StorageBackend>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<StorageDescriptor>::deserialize(deserializer)?.map(StorageDescriptor::open))
    }
}
