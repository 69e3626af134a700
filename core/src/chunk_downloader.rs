use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunk::{Chunk, ChunkStatus};
use crate::config::DownloadConfig;
use crate::error::{CoreError, CoreResult};
use crate::net::BodyStream;
use crate::packet::PacketPool;
use crate::pause::PauseCoordinator;
use crate::request::Request;
use crate::storage::StorageBackend;
use crate::throttle::Throttle;

/// Receives every state change of a chunk while it downloads.
pub trait ChunkObserver: Send + Sync {
    /// Called after `data` was written and `chunk.position` advanced past it.
    fn on_progress(&self, chunk: &Chunk, data: &[u8]);
    fn on_status(&self, chunk: &Chunk);
}

/// Collaborators shared by all chunk tasks of one download.
#[derive(Clone)]
pub struct ChunkContext {
    pub storage: Arc<dyn StorageBackend>,
    pub pool: Arc<PacketPool>,
    pub pause: Arc<PauseCoordinator>,
    pub throttle: Throttle,
    pub cancel: CancellationToken,
    pub config: Arc<DownloadConfig>,
    pub observer: Arc<dyn ChunkObserver>,
    /// Whether the server honours range requests for this resource.
    pub ranged: bool,
}

/// Drives one chunk to completion: open the range, stream packets into
/// storage, retry transient failures within the chunk's budget.
pub struct ChunkDownloader {
    chunk: Chunk,
    request: Request,
    ctx: ChunkContext,
}

impl ChunkDownloader {
    pub fn new(chunk: Chunk, request: Request, ctx: ChunkContext) -> Self {
        Self {
            chunk,
            request,
            ctx,
        }
    }

    pub async fn download(mut self) -> CoreResult<Chunk> {
        if self.chunk.is_complete() {
            return Ok(self.chunk);
        }
        self.set_status(ChunkStatus::Active);

        loop {
            match self.fetch().await {
                Ok(()) => {
                    if self.chunk.end.is_none() {
                        self.chunk.seal();
                    }
                    self.set_status(ChunkStatus::Completed);
                    debug!(chunk = self.chunk.id, bytes = self.chunk.received(), "chunk complete");
                    return Ok(self.chunk);
                }
                Err(CoreError::Cancelled) => {
                    self.set_status(ChunkStatus::Pending);
                    return Err(CoreError::Cancelled);
                }
                Err(err) if err.is_retryable() && self.chunk.retry_count < self.ctx.config.retry_count => {
                    self.chunk.retry_count += 1;
                    let delay = self.ctx.config.retry_backoff(self.chunk.retry_count);
                    warn!(
                        chunk = self.chunk.id,
                        attempt = self.chunk.retry_count,
                        url = self.request.url(),
                        error = %err,
                        "chunk fetch failed, retrying"
                    );
                    tokio::select! {
                        _ = self.ctx.cancel.cancelled() => {
                            self.set_status(ChunkStatus::Pending);
                            return Err(CoreError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    warn!(chunk = self.chunk.id, error = %err, "chunk failed");
                    self.set_status(ChunkStatus::Failed);
                    return Err(err);
                }
            }
        }
    }

    fn set_status(&mut self, status: ChunkStatus) {
        self.chunk.status = status;
        self.ctx.observer.on_status(&self.chunk);
    }

    async fn open_body(&self) -> CoreResult<BodyStream> {
        let open = self
            .request
            .open_range(self.chunk.position, self.chunk.end, self.ctx.ranged);
        tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => Err(CoreError::Cancelled),
            opened = tokio::time::timeout(self.chunk.timeout(), open) => match opened {
                Ok(resp) => Ok(resp?.body),
                Err(_) => Err(CoreError::Timeout(format!("opening chunk {}", self.chunk.id))),
            },
        }
    }

    async fn fetch(&mut self) -> CoreResult<()> {
        // Without range support the body always starts at zero, so bytes we
        // already hold are skipped instead of rewritten.
        let mut to_skip = if self.ctx.ranged {
            0
        } else {
            self.chunk.position - self.chunk.start
        };
        let mut body = self.open_body().await?;

        while !self.chunk.is_complete() {
            let next = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Err(CoreError::Cancelled),
                next = tokio::time::timeout(self.chunk.timeout(), body.next()) => next,
            };
            let item = match next {
                Err(_) => {
                    return Err(CoreError::Timeout(format!("reading chunk {}", self.chunk.id)))
                }
                Ok(None) => break,
                Ok(Some(item)) => item?,
            };

            let mut bytes = &item[..];
            if to_skip > 0 {
                let skipped = (to_skip.min(bytes.len() as u64)) as usize;
                bytes = &bytes[skipped..];
                to_skip -= skipped as u64;
            }

            while !bytes.is_empty() && !self.chunk.is_complete() {
                let mut packet = self.ctx.pool.checkout(self.chunk.position, bytes);
                if let Some(remaining) = self.chunk.remaining() {
                    packet.truncate(remaining.min(usize::MAX as u64) as usize);
                }
                let written = packet.len();
                self.ctx.storage.write(&packet).await?;
                self.chunk.advance(written as u64);
                self.ctx.observer.on_progress(&self.chunk, packet.data());
                packet.dispose();
                bytes = &bytes[written..];

                self.ctx.throttle.throttle(written as u64, &self.ctx.cancel).await?;
                self.ctx.pause.wait_while_paused(&self.ctx.cancel).await?;
            }
        }

        if self.chunk.end.is_some() && !self.chunk.is_complete() {
            return Err(CoreError::Network(format!(
                "body of chunk {} ended at {} before its range",
                self.chunk.id, self.chunk.position
            )));
        }
        Ok(())
    }
}
