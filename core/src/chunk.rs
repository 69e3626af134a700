use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Active => "active",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ChunkStatus::Pending),
            "active" => Some(ChunkStatus::Active),
            "completed" => Some(ChunkStatus::Completed),
            "failed" => Some(ChunkStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One contiguous byte range `[start, end]` of the resource.
///
/// `position` is the absolute offset of the next byte to write, so
/// `start <= position <= end + 1` always holds. `end` is `None` when the total
/// size is unknown and the chunk runs until the server closes the body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub id: u32,
    pub start: u64,
    pub end: Option<u64>,
    pub position: u64,
    pub retry_count: u32,
    pub timeout_ms: u64,
    pub status: ChunkStatus,
}

impl Chunk {
    pub fn new(id: u32, start: u64, end: Option<u64>) -> Self {
        Self {
            id,
            start,
            end,
            position: start,
            retry_count: 0,
            timeout_ms: 0,
            status: ChunkStatus::Pending,
        }
    }

    /// Number of bytes the range covers, `None` for an open-ended chunk.
    pub fn length(&self) -> Option<u64> {
        self.end.map(|end| end + 1 - self.start)
    }

    pub fn received(&self) -> u64 {
        self.position.saturating_sub(self.start)
    }

    pub fn remaining(&self) -> Option<u64> {
        self.end
            .map(|end| (end + 1).saturating_sub(self.position))
    }

    pub fn is_complete(&self) -> bool {
        match self.end {
            Some(end) => self.position > end,
            None => self.status == ChunkStatus::Completed,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    /// Advances the write cursor by at most the bytes left in the range and
    /// returns how many were accepted.
    pub fn advance(&mut self, bytes: u64) -> u64 {
        let accepted = match self.remaining() {
            Some(remaining) => bytes.min(remaining),
            None => bytes,
        };
        self.position += accepted;
        if self.is_complete() {
            self.status = ChunkStatus::Completed;
        }
        accepted
    }

    /// Marks an open-ended chunk as finished once its body stream ended,
    /// fixing `end` to the last byte received.
    pub fn seal(&mut self) {
        if self.end.is_none() && self.position > self.start {
            self.end = Some(self.position - 1);
        }
        self.status = ChunkStatus::Completed;
    }

    /// Percentage of the range already received; open-ended chunks report 0
    /// until sealed.
    pub fn progress_percentage(&self) -> f64 {
        match self.length() {
            Some(0) | None if self.is_complete() => 100.0,
            Some(length) if length > 0 => self.received() as f64 * 100.0 / length as f64,
            _ => 0.0,
        }
    }

    pub fn clear(&mut self) {
        self.position = self.start;
        self.retry_count = 0;
        self.status = ChunkStatus::Pending;
    }
}
