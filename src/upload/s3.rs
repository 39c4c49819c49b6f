//! S3 direct-upload backend.
//!
//! S3 has no folders; a "folder" is a key prefix, so creating one is free.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use tracing::{debug, info};

use super::direct::{DirectStore, FileMetadata};
use crate::archive::sanitize_filename;

const PART_SIZE: usize = 8 * 1024 * 1024; // S3 requires parts of at least 5MB

/// Connection settings for the S3 backend.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub prefix: String,
}

/// S3 uploader using the AWS SDK, with multipart for large payloads.
#[derive(Clone)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3Store {
    /// Create the client from settings and the ambient AWS credentials.
    pub async fn new(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));
        if let Some(ref endpoint) = settings.endpoint {
            // Custom endpoint (MinIO, R2, etc.)
            loader = loader.endpoint_url(endpoint);
        }
        let aws_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .force_path_style(settings.endpoint.is_some())
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: settings.bucket.clone(),
            prefix: settings.prefix.clone(),
        }
    }

    async fn put_small(&self, key: &str, bytes: &[u8], metadata: &FileMetadata) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(&metadata.content_type)
            .metadata("sha256", &metadata.sha256)
            .send()
            .await
            .context("Failed to upload object to S3")?;
        Ok(())
    }

    async fn put_multipart(&self, key: &str, bytes: &[u8], metadata: &FileMetadata) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&metadata.content_type)
            .metadata("sha256", &metadata.sha256)
            .send()
            .await
            .context("Failed to create multipart upload")?;
        let upload_id = created
            .upload_id()
            .context("No upload ID in response")?
            .to_string();

        match self.upload_parts(key, &upload_id, bytes).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .context("Failed to complete multipart upload")?;
                Ok(())
            }
            Err(e) => {
                debug!(upload_id = %upload_id, error = %e, "Aborting multipart upload");
                let _ = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        bytes: &[u8],
    ) -> Result<Vec<CompletedPart>> {
        let mut completed = Vec::new();
        for (i, part) in bytes.chunks(PART_SIZE).enumerate() {
            let part_number = i32::try_from(i + 1).context("Too many parts")?;
            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part.to_vec()))
                .send()
                .await
                .with_context(|| format!("Failed to upload part {part_number}"))?;

            let etag = output
                .e_tag()
                .context("No ETag in upload part response")?
                .to_string();
            completed.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(etag)
                    .build(),
            );
        }
        Ok(completed)
    }
}

#[async_trait]
impl DirectStore for S3Store {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn root(&self) -> &str {
        &self.prefix
    }

    async fn ensure_folder(&self, name: &str, parent: &str) -> Result<String> {
        Ok(folder_key(parent, name))
    }

    async fn upload_file(
        &self,
        folder_id: &str,
        file_name: &str,
        bytes: &[u8],
        metadata: &FileMetadata,
    ) -> Result<String> {
        let key = format!("{folder_id}{}", sanitize_filename(file_name));
        if bytes.len() < PART_SIZE {
            self.put_small(&key, bytes, metadata).await?;
        } else {
            info!(key = %key, size_mb = bytes.len() / 1_024 / 1_024, "Starting multipart upload");
            self.put_multipart(&key, bytes, metadata).await?;
        }
        Ok(key)
    }
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish()
    }
}

fn folder_key(parent: &str, name: &str) -> String {
    let parent = if parent.is_empty() || parent.ends_with('/') {
        parent.to_string()
    } else {
        format!("{parent}/")
    };
    format!("{parent}{}/", sanitize_filename(name))
}
