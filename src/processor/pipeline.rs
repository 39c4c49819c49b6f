//! Per-task execution: load, guard, scrape, archive, upload each item.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{CacheInvalidator, TaskRunner, TaskSummary};
use crate::archive::{build_archive, sanitize_filename, ArchiveFormat, ArchiveMetadata};
use crate::error::TransferError;
use crate::guard::{BlockGuard, ContentFrame, FrameError};
use crate::queue::Task;
use crate::scrape::ChapterScraper;
use crate::upload::{UploadReceipt, UploadRequest, Uploader};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Logical category passed to the uploader.
    pub category: String,
}

/// Archives every item of a task and uploads the results.
///
/// A failing item is logged and skipped. The task fails only if nothing at
/// all could be archived.
pub struct ArchivePipeline {
    frame: Arc<dyn ContentFrame>,
    guard: Arc<BlockGuard>,
    scraper: Arc<dyn ChapterScraper>,
    format: Arc<dyn ArchiveFormat>,
    uploader: Uploader,
    invalidator: Arc<dyn CacheInvalidator>,
    settings: PipelineSettings,
}

impl ArchivePipeline {
    #[must_use]
    pub fn new(
        frame: Arc<dyn ContentFrame>,
        guard: Arc<BlockGuard>,
        scraper: Arc<dyn ChapterScraper>,
        format: Arc<dyn ArchiveFormat>,
        uploader: Uploader,
        invalidator: Arc<dyn CacheInvalidator>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            frame,
            guard,
            scraper,
            format,
            uploader,
            invalidator,
            settings,
        }
    }

    async fn run_item(&self, task: &Task, item: u32) -> Result<UploadReceipt, TransferError> {
        let url = self.scraper.item_url(task, item);
        self.frame.load(&url).await?;
        self.guard.wait_until_clear(self.frame.as_ref()).await?;

        let page = self.frame.inspect().await.map_err(|e| match e {
            FrameError::CrossOrigin(at) => {
                TransferError::BlockedContent(format!("item page moved to {at}"))
            }
            FrameError::Unavailable(e) => TransferError::Other(e),
        })?;
        let parts = self.scraper.collect_parts(&page).await?;
        let pages = parts.len();

        let metadata = ArchiveMetadata {
            series: task.title.clone(),
            number: item,
            source_url: url,
        };
        let bytes = build_archive(Arc::clone(&self.format), parts, metadata).await?;

        let file_name = sanitize_filename(&format!(
            "{} - {item:03}.{}",
            task.title,
            self.format.extension()
        ));
        let receipt = self
            .uploader
            .upload(&UploadRequest {
                destination: task.title.clone(),
                file_name,
                category: self.settings.category.clone(),
                bytes,
            })
            .await?;

        info!(task_id = %task.id, item, pages, route = ?receipt.route, "Item archived");
        Ok(receipt)
    }

    async fn invalidate_all(&self, containers: &BTreeSet<String>) {
        for container in containers {
            if let Err(e) = self.invalidator.invalidate(container).await {
                warn!(container = %container, error = %e, "Cache invalidation failed");
            }
        }
    }
}

#[async_trait]
impl TaskRunner for ArchivePipeline {
    async fn run(&self, task: &Task) -> Result<TaskSummary, TransferError> {
        if task.items.is_empty() {
            return Err(TransferError::ResourceExhaustion(format!(
                "task {} has no items",
                task.id
            )));
        }

        let mut summary = TaskSummary::default();
        let mut containers = BTreeSet::new();

        for &item in &task.items {
            match self.run_item(task, item).await {
                Ok(receipt) => {
                    summary.items_archived += 1;
                    summary.bytes_uploaded += receipt.bytes;
                    containers.extend(receipt.container_id);
                }
                Err(e) => {
                    warn!(task_id = %task.id, item, error = %e, "Item failed");
                    summary.items_failed.push((item, e.to_string()));
                }
            }
        }

        self.invalidate_all(&containers).await;

        if summary.items_archived == 0 {
            return Err(TransferError::ResourceExhaustion(format!(
                "none of {} items could be archived",
                task.items.len()
            )));
        }
        Ok(summary)
    }
}

impl std::fmt::Debug for ArchivePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchivePipeline")
            .field("settings", &self.settings)
            .field("uploader", &self.uploader)
            .finish_non_exhaustive()
    }
}
