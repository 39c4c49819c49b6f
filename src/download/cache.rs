//! Same-file cache for the reader.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::debug;

use super::AdaptiveDownloader;
use crate::error::TransferError;

/// A byte view written out for the reader to display.
///
/// Only valid while its file stays cached; invalidation deletes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewHandle {
    file_id: String,
    path: PathBuf,
}

impl ViewHandle {
    #[must_use]
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

struct CachedFile {
    file_id: String,
    bytes: Arc<Vec<u8>>,
    views: TempDir,
    view_count: usize,
}

/// Holds the bytes of the most recently opened file.
///
/// Opening a different file drops the previous entry, and with it every
/// view handle created for it.
pub struct ReaderCache {
    downloader: AdaptiveDownloader,
    work_dir: PathBuf,
    current: Mutex<Option<CachedFile>>,
}

impl ReaderCache {
    #[must_use]
    pub fn new(downloader: AdaptiveDownloader, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            downloader,
            work_dir: work_dir.into(),
            current: Mutex::new(None),
        }
    }

    /// File id currently cached, if any.
    pub async fn current_file_id(&self) -> Option<String> {
        self.current.lock().await.as_ref().map(|c| c.file_id.clone())
    }

    /// Bytes of `file_id`, downloading them unless already cached.
    ///
    /// # Errors
    ///
    /// Returns the download error; the cache is left empty in that case.
    pub async fn open(&self, file_id: &str, size: Option<u64>) -> Result<Arc<Vec<u8>>, TransferError> {
        let mut current = self.current.lock().await;

        if let Some(entry) = current.as_ref() {
            if entry.file_id == file_id {
                debug!(file_id, "Reader cache hit");
                return Ok(Arc::clone(&entry.bytes));
            }
        }
        release(&mut current);

        let bytes = Arc::new(self.downloader.download(file_id, size).await?);
        let views = self.view_dir().await?;
        *current = Some(CachedFile {
            file_id: file_id.to_string(),
            bytes: Arc::clone(&bytes),
            views,
            view_count: 0,
        });
        Ok(bytes)
    }

    /// Write `data` as a named view of the cached `file_id`.
    ///
    /// # Errors
    ///
    /// Fails if `file_id` is not the cached file or the write fails.
    pub async fn create_view(&self, file_id: &str, name: &str, data: &[u8]) -> anyhow::Result<ViewHandle> {
        let mut current = self.current.lock().await;
        let entry = current
            .as_mut()
            .filter(|c| c.file_id == file_id)
            .with_context(|| format!("{file_id} is not the cached file"))?;

        entry.view_count += 1;
        let file_name = Path::new(name)
            .file_name()
            .map_or_else(|| format!("view-{}", entry.view_count), |n| n.to_string_lossy().into_owned());
        let path = entry
            .views
            .path()
            .join(format!("{:04}-{file_name}", entry.view_count));
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("Failed to write view {}", path.display()))?;

        Ok(ViewHandle {
            file_id: file_id.to_string(),
            path,
        })
    }

    /// Drop the cached file and release its views.
    pub async fn invalidate(&self) {
        release(&mut *self.current.lock().await);
    }

    async fn view_dir(&self) -> Result<TempDir, TransferError> {
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.work_dir.display()))?;
        let dir = tempfile::Builder::new()
            .prefix("views-")
            .tempdir_in(&self.work_dir)
            .context("Failed to create view directory")?;
        Ok(dir)
    }
}

fn release(current: &mut Option<CachedFile>) {
    if let Some(entry) = current.take() {
        debug!(
            file_id = %entry.file_id,
            views = entry.view_count,
            "Releasing cached file"
        );
        // Dropping the TempDir deletes every view written into it.
        drop(entry);
    }
}

impl std::fmt::Debug for ReaderCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderCache")
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}
