use std::path::PathBuf;

use bytes::Bytes;

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressInfo {
    /// Set on chunk-level events, `None` on whole-file events.
    pub chunk_id: Option<u32>,
    pub progress_percentage: f64,
    pub total_bytes_to_receive: u64,
    pub received_bytes_size: u64,
    pub progressed_byte_size: u64,
    pub bytes_per_second_speed: f64,
    pub average_bytes_per_second_speed: f64,
    pub active_chunks: usize,
    /// The bytes just written, when `live_streaming` is enabled.
    pub received_bytes: Option<Bytes>,
}

/// Outcome carried by the single completion signal of a download run.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadCompletion {
    Success,
    Cancelled,
    Failed(CoreError),
}

impl DownloadCompletion {
    pub fn is_success(&self) -> bool {
        matches!(self, DownloadCompletion::Success)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadCompletion::Cancelled)
    }

    pub fn error(&self) -> Option<&CoreError> {
        match self {
            DownloadCompletion::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<(), CoreError> {
        match self {
            DownloadCompletion::Success => Ok(()),
            DownloadCompletion::Cancelled => Err(CoreError::Cancelled),
            DownloadCompletion::Failed(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Started {
        file_name: Option<PathBuf>,
        total_bytes_to_receive: u64,
    },
    ChunkProgress(ProgressInfo),
    Progress(ProgressInfo),
    Completed(DownloadCompletion),
}
