//! Client for the size-limited relay endpoint.

pub mod protocol;

pub use protocol::{ChunkReply, InitReply, RelayRequest, TokenReply, UploadTarget};

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::codec;
use crate::constants::ARCHIVAL_USER_AGENT;
use crate::download::ChunkSource;
use crate::error::TransferError;
use crate::processor::CacheInvalidator;
use crate::upload::{RelayTransport, TokenSource};

/// Relay endpoint client.
///
/// Every call is a single JSON POST bounded by `timeout`, covering both the
/// request and reading the reply body.
#[derive(Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl RelayClient {
    /// Create a relay client.
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(ARCHIVAL_USER_AGENT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            url: url.into(),
            timeout,
        }
    }

    /// Send one request and return the reply fields of a successful response.
    ///
    /// # Errors
    ///
    /// Returns a transient error on transport failure or timeout, and a
    /// protocol error when the relay reports failure.
    pub async fn call(&self, request: &RelayRequest) -> Result<Map<String, Value>, TransferError> {
        debug!(kind = request.kind(), "Relay request");

        let exchange = async {
            let response = self
                .http
                .post(&self.url)
                .json(request)
                .send()
                .await
                .map_err(|e| TransferError::from_reqwest(&e))?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| TransferError::from_reqwest(&e))?;
            Ok::<_, TransferError>((status, body))
        };

        let (status, body) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                TransferError::TransientNetwork(format!(
                    "relay {} timed out after {}s",
                    request.kind(),
                    self.timeout.as_secs()
                ))
            })??;

        if !status.is_success() {
            return Err(TransferError::from_status(status, &body));
        }
        protocol::parse_envelope(&body)
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RelayTransport for RelayClient {
    async fn init(
        &self,
        folder_name: &str,
        file_name: &str,
        category: &str,
        total_size: u64,
    ) -> Result<InitReply, TransferError> {
        let fields = self
            .call(&RelayRequest::Init {
                folder_name: folder_name.to_string(),
                file_name: file_name.to_string(),
                total_size,
                category: category.to_string(),
            })
            .await?;
        protocol::parse_init(&fields)
    }

    async fn send_chunk(
        &self,
        target: &UploadTarget,
        chunk: &[u8],
        start: u64,
        total: u64,
    ) -> Result<(), TransferError> {
        self.call(&RelayRequest::Upload {
            upload_url: target.0.clone(),
            chunk_data: codec::encode(chunk),
            start,
            end: start + chunk.len() as u64,
            total,
        })
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl ChunkSource for RelayClient {
    async fn fetch_chunk(
        &self,
        file_id: &str,
        offset: u64,
        length: u64,
    ) -> Result<ChunkReply, TransferError> {
        let fields = self
            .call(&RelayRequest::ViewGetChunk {
                file_id: file_id.to_string(),
                offset,
                length,
            })
            .await?;
        protocol::parse_chunk(&fields, offset)
    }
}

#[async_trait]
impl TokenSource for RelayClient {
    async fn fetch_token(&self) -> Result<TokenReply, TransferError> {
        let fields = self.call(&RelayRequest::GetToken).await?;
        protocol::parse_token(&fields)
    }
}

#[async_trait]
impl CacheInvalidator for RelayClient {
    async fn invalidate(&self, container_id: &str) -> Result<(), TransferError> {
        self.call(&RelayRequest::ClearCache {
            folder_id: container_id.to_string(),
        })
        .await
        .map(|_| ())
    }
}
