//! Archive upload: direct to the storage provider when possible, through
//! the relay otherwise.

mod direct;
mod drive;
mod resumable;
mod s3;

pub use direct::{DirectStore, FileMetadata, TokenCache, TokenSource};
pub use drive::DriveStore;
pub use resumable::{RelayTransport, ResumableUploader, UploadSession, UploadState};
pub use s3::{S3Settings, S3Store};

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::TransferError;

/// One archive to store.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Folder the file belongs in (usually the series title).
    pub destination: String,
    pub file_name: String,
    /// Logical category the destination folder is grouped under.
    pub category: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadRoute {
    Direct,
    Relay,
}

/// Outcome of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub route: UploadRoute,
    /// Container the file landed in, for cache invalidation.
    pub container_id: Option<String>,
    pub file_id: Option<String>,
    pub bytes: u64,
}

/// Direct-then-Relay upload policy.
///
/// The direct backend is attempted first if one is configured. Any failure
/// there falls through to a full relay session; a relay failure is final.
pub struct Uploader {
    relay: ResumableUploader,
    direct: Option<Arc<dyn DirectStore>>,
}

impl Uploader {
    #[must_use]
    pub fn new(relay: ResumableUploader, direct: Option<Arc<dyn DirectStore>>) -> Self {
        Self { relay, direct }
    }

    /// Store one archive.
    ///
    /// # Errors
    ///
    /// Returns the relay session's error when both routes fail.
    pub async fn upload(&self, request: &UploadRequest) -> Result<UploadReceipt, TransferError> {
        if let Some(direct) = &self.direct {
            match upload_direct(direct.as_ref(), request).await {
                Ok(receipt) => {
                    info!(
                        file = %request.file_name,
                        backend = direct.name(),
                        bytes = receipt.bytes,
                        "Direct upload complete"
                    );
                    return Ok(receipt);
                }
                Err(e) => {
                    warn!(
                        file = %request.file_name,
                        backend = direct.name(),
                        error = %e,
                        "Direct upload failed, falling back to relay"
                    );
                }
            }
        }

        self.relay.upload(request).await
    }

    /// State of the most recent relay session.
    #[must_use]
    pub fn relay_state(&self) -> UploadState {
        self.relay.state()
    }
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("relay", &self.relay)
            .field("direct", &self.direct.as_ref().map(|d| d.name()))
            .finish()
    }
}

async fn upload_direct(
    store: &dyn DirectStore,
    request: &UploadRequest,
) -> anyhow::Result<UploadReceipt> {
    let category = store.ensure_folder(&request.category, store.root()).await?;
    let folder = store
        .ensure_folder(&request.destination, &category)
        .await?;

    let metadata = FileMetadata {
        content_type: mime_guess::from_path(&request.file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
        sha256: hex::encode(Sha256::digest(&request.bytes)),
    };
    let file_id = store
        .upload_file(&folder, &request.file_name, &request.bytes, &metadata)
        .await?;

    Ok(UploadReceipt {
        route: UploadRoute::Direct,
        container_id: Some(folder),
        file_id: Some(file_id),
        bytes: request.bytes.len() as u64,
    })
}
