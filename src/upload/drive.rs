//! Google Drive direct-upload backend.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::direct::{DirectStore, FileMetadata, TokenCache};

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const DEFAULT_API_BASE: &str = "https://www.googleapis.com";

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileRef>,
}

#[derive(Debug, Deserialize)]
struct FileRef {
    id: String,
}

/// Drive client authenticating with tokens from a [`TokenCache`].
pub struct DriveStore {
    http: reqwest::Client,
    tokens: TokenCache,
    api_base: String,
    root: String,
    timeout: Duration,
}

impl DriveStore {
    #[must_use]
    pub fn new(tokens: TokenCache, root: impl Into<String>, timeout: Duration) -> Self {
        Self::with_api_base(tokens, root, timeout, DEFAULT_API_BASE)
    }

    /// Point the client at a different API host.
    #[must_use]
    pub fn with_api_base(
        tokens: TokenCache,
        root: impl Into<String>,
        timeout: Duration,
        api_base: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            tokens,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            root: root.into(),
            timeout,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let token = self.tokens.token().await?;
        let response = tokio::time::timeout(self.timeout, request.bearer_auth(token).send())
            .await
            .context("Drive request timed out")?
            .context("Drive request failed")?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Drive returned {status}: {}", body.trim());
        }
        Ok(response)
    }

    async fn find_folder(&self, name: &str, parent: &str) -> Result<Option<String>> {
        let query = format!(
            "name = '{}' and mimeType = '{FOLDER_MIME}' and '{}' in parents and trashed = false",
            escape_query(name),
            escape_query(parent)
        );
        let url = format!(
            "{}/drive/v3/files?q={}&fields=files(id)&spaces=drive",
            self.api_base,
            urlencoding::encode(&query)
        );
        let list: FileList = self
            .send(self.http.get(&url))
            .await?
            .json()
            .await
            .context("Invalid folder listing")?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }
}

#[async_trait]
impl DirectStore for DriveStore {
    fn name(&self) -> &'static str {
        "drive"
    }

    fn root(&self) -> &str {
        &self.root
    }

    async fn ensure_folder(&self, name: &str, parent: &str) -> Result<String> {
        if let Some(id) = self.find_folder(name, parent).await? {
            return Ok(id);
        }

        let url = format!("{}/drive/v3/files?fields=id", self.api_base);
        let body = json!({
            "name": name,
            "mimeType": FOLDER_MIME,
            "parents": [parent],
        });
        let created: FileRef = self
            .send(self.http.post(&url).json(&body))
            .await?
            .json()
            .await
            .context("Invalid folder creation reply")?;
        debug!(folder = %name, id = %created.id, "Created Drive folder");
        Ok(created.id)
    }

    async fn upload_file(
        &self,
        folder_id: &str,
        file_name: &str,
        bytes: &[u8],
        metadata: &FileMetadata,
    ) -> Result<String> {
        let meta = json!({
            "name": file_name,
            "parents": [folder_id],
            "mimeType": metadata.content_type,
            "appProperties": { "sha256": metadata.sha256 },
        });
        let boundary = random_boundary();
        let body = multipart_related(&boundary, &meta.to_string(), &metadata.content_type, bytes);

        let url = format!(
            "{}/upload/drive/v3/files?uploadType=multipart&fields=id",
            self.api_base
        );
        let uploaded: FileRef = self
            .send(
                self.http
                    .post(&url)
                    .header(
                        reqwest::header::CONTENT_TYPE,
                        format!("multipart/related; boundary={boundary}"),
                    )
                    .body(body),
            )
            .await?
            .json()
            .await
            .context("Invalid upload reply")?;
        Ok(uploaded.id)
    }
}

impl std::fmt::Debug for DriveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveStore")
            .field("api_base", &self.api_base)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn random_boundary() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("relay-{}", hex::encode(bytes))
}

/// Build a `multipart/related` body: JSON metadata, then the file bytes.
fn multipart_related(boundary: &str, metadata_json: &str, content_type: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(bytes.len() + metadata_json.len() + 256);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata_json}\r\n--{boundary}\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}
