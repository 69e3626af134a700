use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub user_agent: String,
    pub headers: HashMap<String, String>,
    pub proxy: Option<String>,
    pub basic_auth: Option<(String, String)>,
    pub accept_invalid_certs: bool,
    pub connect_timeout_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            user_agent: "chunkdl/0.1".to_string(),
            headers: HashMap::new(),
            proxy: None,
            basic_auth: None,
            accept_invalid_certs: false,
            connect_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Number of chunks the resource is split into when ranges are supported.
    pub chunk_count: u32,
    /// Upper bound on chunks fetched at the same time.
    pub parallel_count: usize,
    pub parallel_download: bool,
    pub minimum_chunk_size: u64,
    pub retry_count: u32,
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    /// Per-read timeout of a chunk; a timed-out read is a retryable failure.
    pub timeout_ms: u64,
    /// Zero disables throttling.
    pub max_bytes_per_second: u64,
    pub clear_package_on_completion_with_failure: bool,
    pub buffer_block_size: usize,
    pub in_memory: bool,
    pub reserve_storage_space: bool,
    /// Attach each written packet to its progress events.
    pub live_streaming: bool,
    pub request: RequestConfig,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_count: 8,
            parallel_count: 4,
            parallel_download: true,
            minimum_chunk_size: 0,
            retry_count: 5,
            retry_backoff_ms: 500,
            max_retry_backoff_ms: 10_000,
            timeout_ms: 30_000,
            max_bytes_per_second: 0,
            clear_package_on_completion_with_failure: false,
            buffer_block_size: 64 * 1024,
            in_memory: false,
            reserve_storage_space: true,
            live_streaming: false,
            request: RequestConfig::default(),
        }
    }
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    /// Exponential backoff for the given 1-based attempt, capped at
    /// `max_retry_backoff_ms`.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.retry_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_retry_backoff_ms.max(self.retry_backoff_ms)))
    }

    /// Effective number of chunk tasks allowed to run at once.
    pub fn effective_parallel_count(&self) -> usize {
        if self.parallel_download {
            self.parallel_count.max(1)
        } else {
            1
        }
    }

    pub fn effective_chunk_count(&self) -> u32 {
        if self.parallel_download {
            self.chunk_count.max(1)
        } else {
            1
        }
    }

    pub fn buffer_block_size(&self) -> usize {
        self.buffer_block_size.max(1)
    }
}
