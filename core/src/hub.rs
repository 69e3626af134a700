use tracing::{debug, warn};

use crate::chunk::{Chunk, ChunkStatus};
use crate::config::DownloadConfig;

/// What a package remembers about an earlier run, checked against a fresh
/// probe before any byte is reused.
#[derive(Debug, Clone, Default)]
pub struct PreviousRun {
    pub chunks: Vec<Chunk>,
    pub total_file_size: u64,
    pub supports_range: bool,
}

#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub chunks: Vec<Chunk>,
    /// False when earlier progress was discarded and chunks were rebuilt.
    pub resumed: bool,
}

/// Splits a resource into chunks, or validates the chunks of a resumed
/// package against what the server reports now.
#[derive(Debug, Clone)]
pub struct ChunkHub {
    chunk_count: u32,
    minimum_chunk_size: u64,
    timeout_ms: u64,
}

impl ChunkHub {
    pub fn new(config: &DownloadConfig) -> Self {
        Self {
            chunk_count: config.effective_chunk_count(),
            minimum_chunk_size: config.minimum_chunk_size,
            timeout_ms: config.timeout_ms,
        }
    }

    /// Chunk count actually used for `total_size` bytes.
    pub fn plan_count(&self, total_size: u64, supports_range: bool) -> u32 {
        if !supports_range || total_size == 0 {
            return 1;
        }
        let mut count = self.chunk_count.max(1) as u64;
        if self.minimum_chunk_size > 0 {
            count = count.min((total_size / self.minimum_chunk_size).max(1));
        }
        count.min(total_size) as u32
    }

    pub fn create_chunks(&self, total_size: u64, supports_range: bool) -> Vec<Chunk> {
        let count = self.plan_count(total_size, supports_range);
        let mut chunks = build_chunks(total_size, count, supports_range);
        self.apply_timeout(&mut chunks);
        chunks
    }

    /// Reuses the previous chunks when they still describe the resource,
    /// otherwise repartitions from offset zero.
    pub fn reconcile(&self, previous: PreviousRun, total_size: u64, supports_range: bool) -> ChunkPlan {
        if previous.chunks.is_empty() {
            return ChunkPlan {
                chunks: self.create_chunks(total_size, supports_range),
                resumed: false,
            };
        }

        if let Err(reason) = validate(&previous, total_size, supports_range) {
            warn!(reason, total_size, supports_range, "discarding resumed chunks");
            return ChunkPlan {
                chunks: self.create_chunks(total_size, supports_range),
                resumed: false,
            };
        }

        let mut chunks = previous.chunks;
        for chunk in &mut chunks {
            if chunk.is_complete() {
                chunk.status = ChunkStatus::Completed;
            } else {
                chunk.status = ChunkStatus::Pending;
            }
            chunk.retry_count = 0;
        }
        self.apply_timeout(&mut chunks);
        debug!(chunks = chunks.len(), "resuming previous chunks");
        ChunkPlan {
            chunks,
            resumed: true,
        }
    }

    fn apply_timeout(&self, chunks: &mut [Chunk]) {
        for chunk in chunks {
            chunk.timeout_ms = self.timeout_ms;
        }
    }
}

/// Splits `[0, total_size)` into `count` contiguous chunks of
/// `total_size / count` bytes, the remainder going to the last one.
pub fn build_chunks(total_size: u64, count: u32, supports_range: bool) -> Vec<Chunk> {
    if total_size == 0 {
        return vec![Chunk::new(0, 0, None)];
    }
    if !supports_range || count <= 1 {
        return vec![Chunk::new(0, 0, Some(total_size - 1))];
    }

    let count = (count as u64).min(total_size);
    let size = total_size / count;
    let mut chunks = Vec::with_capacity(count as usize);
    for index in 0..count {
        let start = index * size;
        let end = if index == count - 1 {
            total_size - 1
        } else {
            start + size - 1
        };
        chunks.push(Chunk::new(index as u32, start, Some(end)));
    }
    chunks
}

fn validate(previous: &PreviousRun, total_size: u64, supports_range: bool) -> Result<(), &'static str> {
    if previous.supports_range != supports_range {
        return Err("range support changed");
    }
    if total_size == 0 {
        return Err("total size unknown");
    }
    if previous.total_file_size != total_size {
        return Err("total size changed");
    }
    if !supports_range && previous.chunks.len() != 1 {
        return Err("server without range support needs a single chunk");
    }
    if !supports_range {
        let chunk = &previous.chunks[0];
        if !chunk.is_complete() && chunk.position != chunk.start {
            return Err("partial chunk cannot resume without range support");
        }
    }

    let mut expected_start = 0u64;
    for chunk in &previous.chunks {
        let Some(end) = chunk.end else {
            return Err("open-ended chunk with known size");
        };
        if chunk.start != expected_start || end < chunk.start {
            return Err("chunks are not contiguous");
        }
        if chunk.position < chunk.start || chunk.position > end + 1 {
            return Err("chunk position outside its range");
        }
        expected_start = end + 1;
    }
    if expected_start != total_size {
        return Err("chunks do not cover the resource");
    }
    Ok(())
}
