use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{CoreError, CoreResult};
use crate::packet::Packet;

/// Offset-addressed byte sink shared by every chunk of a download.
///
/// Implementations must accept concurrent writes to disjoint ranges in any
/// order; there is no shared cursor.
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Writes the packet's valid bytes at its absolute position. Empty
    /// packets are a no-op.
    async fn write(&self, packet: &Packet) -> CoreResult<()>;
    async fn read_range(&self, offset: u64, len: usize) -> CoreResult<Vec<u8>>;
    async fn flush(&self) -> CoreResult<()>;
    async fn len(&self) -> CoreResult<u64>;
    /// Pre-allocates `size` bytes where the backend supports it.
    async fn reserve(&self, size: u64) -> CoreResult<()>;
    /// Releases the underlying handle. Disposing twice is a no-op.
    async fn dispose(&self) -> CoreResult<()>;
    fn is_disposed(&self) -> bool;
    fn path(&self) -> Option<&Path>;
    /// Serializable description used to reopen the storage after a restart.
    fn descriptor(&self) -> StorageDescriptor;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageDescriptor {
    File { path: PathBuf },
    Memory { data: Vec<u8> },
}

impl StorageDescriptor {
    pub fn open(self) -> Arc<dyn StorageBackend> {
        match self {
            StorageDescriptor::File { path } => Arc::new(FileStorage::new(path)),
            StorageDescriptor::Memory { data } => Arc::new(MemoryStorage::with_data(data)),
        }
    }
}

fn disposed_error() -> CoreError {
    CoreError::Storage("storage already disposed".to_string())
}

#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<File>>,
    disposed: AtomicBool,
}

impl FileStorage {
    /// The file is opened lazily on first access and never truncated, so a
    /// resumed download keeps the bytes written by earlier runs.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    async fn open_file(&self) -> CoreResult<File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .await?;
        Ok(file)
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn write(&self, packet: &Packet) -> CoreResult<()> {
        if packet.is_empty() {
            return Ok(());
        }
        if self.is_disposed() {
            return Err(disposed_error());
        }
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_file().await?);
        }
        let file = guard.as_mut().ok_or_else(disposed_error)?;
        file.seek(SeekFrom::Start(packet.position())).await?;
        file.write_all(packet.data()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_range(&self, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
        if self.is_disposed() {
            return Err(disposed_error());
        }
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_file().await?);
        }
        let file = guard.as_mut().ok_or_else(disposed_error)?;
        file.flush().await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut out = Vec::with_capacity(len);
        let mut reader = file.take(len as u64);
        reader.read_to_end(&mut out).await?;
        Ok(out)
    }

    async fn flush(&self) -> CoreResult<()> {
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }

    async fn len(&self) -> CoreResult<u64> {
        let guard = self.file.lock().await;
        if let Some(file) = guard.as_ref() {
            return Ok(file.metadata().await?.len());
        }
        match fs::metadata(&self.path).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    async fn reserve(&self, size: u64) -> CoreResult<()> {
        if self.is_disposed() {
            return Err(disposed_error());
        }
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_file().await?);
        }
        let file = guard.as_mut().ok_or_else(disposed_error)?;
        if file.metadata().await?.len() < size {
            file.set_len(size).await?;
        }
        Ok(())
    }

    async fn dispose(&self) -> CoreResult<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn descriptor(&self) -> StorageDescriptor {
        StorageDescriptor::File {
            path: self.path.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: Mutex<Vec<u8>>,
    disposed: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> CoreResult<Vec<u8>> {
        self.data
            .lock()
            .map(|data| data.clone())
            .map_err(|_| CoreError::Storage("memory storage lock poisoned".to_string()))
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn write(&self, packet: &Packet) -> CoreResult<()> {
        if packet.is_empty() {
            return Ok(());
        }
        if self.is_disposed() {
            return Err(disposed_error());
        }
        let mut data = self
            .data
            .lock()
            .map_err(|_| CoreError::Storage("memory storage lock poisoned".to_string()))?;
        let start = usize::try_from(packet.position())
            .map_err(|_| CoreError::Storage("offset exceeds memory storage".to_string()))?;
        let end = start
            .checked_add(packet.len())
            .ok_or_else(|| CoreError::Storage("offset exceeds memory storage".to_string()))?;
        if data.len() < end {
            grow(&mut data, end)?;
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(packet.data());
        Ok(())
    }

    async fn read_range(&self, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
        if self.is_disposed() {
            return Err(disposed_error());
        }
        let data = self
            .data
            .lock()
            .map_err(|_| CoreError::Storage("memory storage lock poisoned".to_string()))?;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn flush(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn len(&self) -> CoreResult<u64> {
        Ok(self.data.lock().map(|data| data.len() as u64).unwrap_or(0))
    }

    async fn reserve(&self, size: u64) -> CoreResult<()> {
        if self.is_disposed() {
            return Err(disposed_error());
        }
        let mut data = self
            .data
            .lock()
            .map_err(|_| CoreError::Storage("memory storage lock poisoned".to_string()))?;
        let wanted = usize::try_from(size)
            .map_err(|_| CoreError::Storage(format!("cannot hold {} bytes in memory", size)))?;
        if data.capacity() < wanted {
            grow(&mut data, wanted)?;
        }
        Ok(())
    }

    async fn dispose(&self) -> CoreResult<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut data) = self.data.lock() {
            *data = Vec::new();
        }
        Ok(())
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn path(&self) -> Option<&Path> {
        None
    }

    fn descriptor(&self) -> StorageDescriptor {
        StorageDescriptor::Memory {
            data: self.snapshot().unwrap_or_default(),
        }
    }
}

/// Makes room for `wanted` bytes without aborting when the allocator refuses.
fn grow(data: &mut Vec<u8>, wanted: usize) -> CoreResult<()> {
    let additional = wanted.saturating_sub(data.len());
    data.try_reserve(additional)
        .map_err(|err| CoreError::Storage(format!("cannot hold {} bytes in memory: {}", wanted, err)))
}
