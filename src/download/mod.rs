//! Adaptive download of archives back through the relay.
//!
//! Small files come back in one request, large ones as a fixed chunk plan
//! pulled by a small worker pool, and files of unknown size by following
//! the relay's `hasMore`/`nextOffset` cursor.

mod cache;

pub use cache::{ReaderCache, ViewHandle};

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::codec;
use crate::constants::{DOWNLOAD_CHUNK_BYTES, DOWNLOAD_WORKERS, SINGLE_SHOT_THRESHOLD_BYTES};
use crate::error::TransferError;
use crate::relay::ChunkReply;
use crate::retry::RetryPolicy;

/// Anything that can serve byte ranges of a stored file.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn fetch_chunk(
        &self,
        file_id: &str,
        offset: u64,
        length: u64,
    ) -> Result<ChunkReply, TransferError>;
}

/// One planned range of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: usize,
    pub start: u64,
    pub length: u64,
}

/// How a file will be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    SingleShot,
    Concurrent { chunk_count: u64 },
    SequentialUnknown,
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadConfig {
    pub chunk_size: u64,
    pub single_shot_threshold: u64,
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DOWNLOAD_CHUNK_BYTES,
            single_shot_threshold: SINGLE_SHOT_THRESHOLD_BYTES,
            workers: DOWNLOAD_WORKERS,
            retry: RetryPolicy::default(),
        }
    }
}

impl DownloadConfig {
    /// Pick the strategy for a file of the given declared size.
    #[must_use]
    pub fn strategy(&self, size: Option<u64>) -> Strategy {
        match size {
            None => Strategy::SequentialUnknown,
            Some(size) if size < self.single_shot_threshold => Strategy::SingleShot,
            Some(size) => Strategy::Concurrent {
                chunk_count: codec::chunk_count(size, self.chunk_size),
            },
        }
    }

    /// Chunk plan covering `[0, size)` in `chunk_size` pieces.
    #[must_use]
    pub fn plan(&self, size: u64) -> Vec<ChunkDescriptor> {
        let chunk = self.chunk_size.max(1);
        (0..codec::chunk_count(size, chunk))
            .map(|i| {
                let start = i * chunk;
                ChunkDescriptor {
                    index: i as usize,
                    start,
                    length: chunk.min(size - start),
                }
            })
            .collect()
    }
}

/// Resolved chunk payloads, stored by index as they arrive.
#[derive(Debug)]
pub struct ChunkSet {
    slots: Vec<Option<Vec<u8>>>,
}

impl ChunkSet {
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            slots: vec![None; count],
        }
    }

    /// Store the payload for `index`.
    ///
    /// # Errors
    ///
    /// Returns a resource error if `index` is outside the plan.
    pub fn insert(&mut self, index: usize, data: Vec<u8>) -> Result<(), TransferError> {
        let count = self.slots.len();
        let slot = self.slots.get_mut(index).ok_or_else(|| {
            TransferError::ResourceExhaustion(format!("chunk {index} outside plan of {count}"))
        })?;
        *slot = Some(data);
        Ok(())
    }

    /// Concatenate every payload in index order.
    ///
    /// # Errors
    ///
    /// Returns a resource error if any index is unresolved.
    pub fn assemble(self) -> Result<Vec<u8>, TransferError> {
        codec::join(self.slots)
    }
}

/// Size-aware downloader over a [`ChunkSource`].
pub struct AdaptiveDownloader {
    source: Arc<dyn ChunkSource>,
    config: DownloadConfig,
}

impl AdaptiveDownloader {
    #[must_use]
    pub fn new(source: Arc<dyn ChunkSource>, config: DownloadConfig) -> Self {
        Self { source, config }
    }

    #[must_use]
    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Fetch a whole file. `size` is the declared size, if known.
    ///
    /// # Errors
    ///
    /// Returns the first chunk failure that outlived its retries; the
    /// partial result is discarded.
    pub async fn download(&self, file_id: &str, size: Option<u64>) -> Result<Vec<u8>, TransferError> {
        let strategy = self.config.strategy(size);
        debug!(file_id, ?size, ?strategy, "Starting download");

        let bytes = match (strategy, size) {
            (Strategy::SingleShot, Some(0)) => Vec::new(),
            (Strategy::SingleShot, Some(size)) => {
                self.fetch_exact(
                    file_id,
                    ChunkDescriptor {
                        index: 0,
                        start: 0,
                        length: size,
                    },
                )
                .await?
            }
            (Strategy::Concurrent { .. }, Some(size)) => self.download_concurrent(file_id, size).await?,
            _ => self.download_sequential(file_id).await?,
        };

        info!(file_id, bytes = bytes.len(), "Download complete");
        Ok(bytes)
    }

    async fn download_concurrent(&self, file_id: &str, size: u64) -> Result<Vec<u8>, TransferError> {
        let plan = self.config.plan(size);
        if plan.is_empty() {
            return Err(TransferError::ResourceExhaustion(format!(
                "empty chunk plan for {file_id}"
            )));
        }

        let chunks = Mutex::new(ChunkSet::new(plan.len()));
        let pending = Mutex::new(plan.into_iter().collect::<VecDeque<_>>());
        let workers = self.config.workers.max(1);

        // try_join_all drops the remaining workers as soon as one fails.
        try_join_all((0..workers).map(|worker| self.worker_loop(worker, file_id, &pending, &chunks)))
            .await?;

        chunks.into_inner().assemble()
    }

    async fn worker_loop(
        &self,
        worker: usize,
        file_id: &str,
        pending: &Mutex<VecDeque<ChunkDescriptor>>,
        chunks: &Mutex<ChunkSet>,
    ) -> Result<(), TransferError> {
        loop {
            let Some(chunk) = pending.lock().await.pop_front() else {
                return Ok(());
            };
            let data = self.fetch_exact(file_id, chunk).await?;
            debug!(file_id, worker, chunk = chunk.index, "Chunk resolved");
            chunks.lock().await.insert(chunk.index, data)?;
        }
    }

    /// Fetch one planned range, retrying transient failures and short reads.
    async fn fetch_exact(&self, file_id: &str, chunk: ChunkDescriptor) -> Result<Vec<u8>, TransferError> {
        let source = self.source.as_ref();
        self.config
            .retry
            .run("chunk fetch", move |_| async move {
                let reply = source.fetch_chunk(file_id, chunk.start, chunk.length).await?;
                if reply.data.len() as u64 != chunk.length {
                    return Err(TransferError::TransientNetwork(format!(
                        "chunk {} returned {} of {} bytes",
                        chunk.index,
                        reply.data.len(),
                        chunk.length
                    )));
                }
                Ok(reply.data)
            })
            .await
    }

    async fn download_sequential(&self, file_id: &str) -> Result<Vec<u8>, TransferError> {
        let source = self.source.as_ref();
        let length = self.config.chunk_size;
        let mut out = Vec::new();
        let mut offset = 0u64;

        loop {
            let reply = self
                .config
                .retry
                .run("sequential chunk fetch", move |_| {
                    source.fetch_chunk(file_id, offset, length)
                })
                .await?;
            out.extend_from_slice(&reply.data);

            if !reply.has_more {
                return Ok(out);
            }
            if reply.next_offset <= offset {
                return Err(TransferError::Protocol(format!(
                    "relay cursor did not advance past {offset} for {file_id}"
                )));
            }
            offset = reply.next_offset;
        }
    }
}

impl std::fmt::Debug for AdaptiveDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveDownloader")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
