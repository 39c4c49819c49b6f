//! Chunked upload sessions through the relay.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{UploadReceipt, UploadRequest, UploadRoute};
use crate::codec;
use crate::error::TransferError;
use crate::relay::{InitReply, UploadTarget};
use crate::retry::RetryPolicy;

/// The relay operations an upload session needs.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open a session for a file of `total_size` bytes.
    async fn init(
        &self,
        folder_name: &str,
        file_name: &str,
        category: &str,
        total_size: u64,
    ) -> Result<InitReply, TransferError>;

    /// Send the bytes `[start, start + chunk.len())` of a `total`-byte file.
    async fn send_chunk(
        &self,
        target: &UploadTarget,
        chunk: &[u8],
        start: u64,
        total: u64,
    ) -> Result<(), TransferError>;
}

/// Where the most recent session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    SessionInit,
    Sending,
    Completed,
    Failed,
}

/// Progress of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub target: UploadTarget,
    pub total_size: u64,
    bytes_sent: u64,
}

impl UploadSession {
    #[must_use]
    pub fn new(target: UploadTarget, total_size: u64) -> Self {
        Self {
            target,
            total_size,
            bytes_sent: 0,
        }
    }

    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.bytes_sent == self.total_size
    }

    /// Record an acknowledged chunk ending at `end` (exclusive).
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the chunk does not continue where the
    /// previous one stopped or runs past the declared size.
    pub fn acknowledge(&mut self, start: u64, end: u64) -> Result<(), TransferError> {
        if start != self.bytes_sent || end < start || end > self.total_size {
            return Err(TransferError::Protocol(format!(
                "chunk {start}..{end} does not continue session at {} of {}",
                self.bytes_sent, self.total_size
            )));
        }
        self.bytes_sent = end;
        Ok(())
    }
}

/// Sends payloads to the relay in fixed-size, strictly ordered chunks.
///
/// Each chunk waits for its acknowledgment before the next is sent. A chunk
/// that fails transiently is resent (the relay treats repeats within one
/// session as idempotent); a protocol failure ends the session.
pub struct ResumableUploader {
    transport: Arc<dyn RelayTransport>,
    chunk_size: usize,
    retry: RetryPolicy,
    state: Mutex<UploadState>,
}

impl ResumableUploader {
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero.
    #[must_use]
    pub fn new(transport: Arc<dyn RelayTransport>, chunk_size: usize, retry: RetryPolicy) -> Self {
        assert!(chunk_size > 0, "upload chunk size must be positive");
        Self {
            transport,
            chunk_size,
            retry,
            state: Mutex::new(UploadState::Idle),
        }
    }

    /// State of the current or most recent session.
    #[must_use]
    pub fn state(&self) -> UploadState {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_state(&self, next: UploadState) {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = next;
    }

    /// Upload one payload.
    ///
    /// # Errors
    ///
    /// Returns the first error that ended the session; the state is then
    /// [`UploadState::Failed`].
    pub async fn upload(&self, request: &UploadRequest) -> Result<UploadReceipt, TransferError> {
        match self.run_session(request).await {
            Ok(receipt) => {
                self.set_state(UploadState::Completed);
                Ok(receipt)
            }
            Err(e) => {
                self.set_state(UploadState::Failed);
                warn!(file = %request.file_name, error = %e, "Relay upload failed");
                Err(e)
            }
        }
    }

    async fn run_session(&self, request: &UploadRequest) -> Result<UploadReceipt, TransferError> {
        let total = request.bytes.len() as u64;

        self.set_state(UploadState::SessionInit);
        let reply = self
            .transport
            .init(
                &request.destination,
                &request.file_name,
                &request.category,
                total,
            )
            .await?;
        let mut session = UploadSession::new(reply.target, total);
        debug!(file = %request.file_name, total, "Upload session opened");

        self.set_state(UploadState::Sending);
        let chunk_total = codec::chunk_count(total, self.chunk_size as u64);

        if total == 0 {
            // The relay finalizes on the chunk that reaches `total`, so an
            // empty file still needs one (empty) send.
            self.send(&session.target, &[], 0, 0).await?;
        }

        for chunk in codec::split(&request.bytes, self.chunk_size) {
            self.send(&session.target, chunk.data, chunk.start, total)
                .await?;
            session.acknowledge(chunk.start, chunk.end)?;
            debug!(
                file = %request.file_name,
                chunk = chunk.index + 1,
                chunks = chunk_total,
                progress_pct = session.bytes_sent() * 100 / total.max(1),
                "Chunk acknowledged"
            );
        }

        if !session.is_complete() {
            return Err(TransferError::Protocol(format!(
                "session ended at {} of {total} bytes",
                session.bytes_sent()
            )));
        }

        info!(file = %request.file_name, bytes = total, "Relay upload complete");
        Ok(UploadReceipt {
            route: UploadRoute::Relay,
            container_id: reply.container_id,
            file_id: None,
            bytes: total,
        })
    }

    async fn send(
        &self,
        target: &UploadTarget,
        data: &[u8],
        start: u64,
        total: u64,
    ) -> Result<(), TransferError> {
        let transport = self.transport.as_ref();
        self.retry
            .run("relay chunk send", move |_| {
                transport.send_chunk(target, data, start, total)
            })
            .await
    }
}

impl std::fmt::Debug for ResumableUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableUploader")
            .field("chunk_size", &self.chunk_size)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_bytes_sent_is_monotonic() {
        let mut session = UploadSession::new(UploadTarget("t".into()), 10);
        session.acknowledge(0, 4).unwrap();
        assert!(session.acknowledge(0, 4).is_err());
        assert!(session.acknowledge(4, 11).is_err());
        session.acknowledge(4, 10).unwrap();
        assert!(session.is_complete());
        assert_eq!(session.bytes_sent(), 10);
    }
}
