//! Turning a loaded item page into archive parts.

use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

use crate::archive::ArchivePart;
use crate::constants::ARCHIVAL_USER_AGENT;
use crate::error::TransferError;
use crate::guard::PageSnapshot;
use crate::queue::Task;
use crate::retry::RetryPolicy;

/// Site-specific knowledge the pipeline needs.
#[async_trait]
pub trait ChapterScraper: Send + Sync {
    /// URL of one item (episode/chapter) of a task.
    fn item_url(&self, task: &Task, item: u32) -> String;

    /// Download the parts shown on a loaded item page, in reading order.
    async fn collect_parts(&self, page: &PageSnapshot) -> Result<Vec<ArchivePart>, TransferError>;
}

/// Render an item URL from a template with `{url}`, `{id}` and `{item}`.
#[must_use]
pub fn render_item_url(template: &str, task: &Task, item: u32) -> String {
    template
        .replace("{url}", task.resume_url.trim_end_matches('/'))
        .replace("{id}", &task.id)
        .replace("{item}", &item.to_string())
}

/// Generic scraper: every element matching a CSS selector is a page image.
pub struct ImageScraper {
    client: reqwest::Client,
    selector: String,
    url_template: String,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ImageScraper {
    /// # Errors
    ///
    /// Returns an error if `selector` is not valid CSS.
    pub fn new(
        selector: impl Into<String>,
        url_template: impl Into<String>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let selector = selector.into();
        Selector::parse(&selector)
            .map_err(|e| anyhow::anyhow!("Invalid image selector {selector:?}: {e}"))?;

        Ok(Self {
            client: reqwest::Client::builder()
                .user_agent(ARCHIVAL_USER_AGENT)
                .timeout(timeout)
                .build()
                .expect("Failed to build HTTP client"),
            selector,
            url_template: url_template.into(),
            retry,
            timeout,
        })
    }

    async fn fetch_image(&self, url: &Url, referer: &str) -> Result<(Vec<u8>, Option<String>), TransferError> {
        let exchange = async {
            let response = self
                .client
                .get(url.as_str())
                .header(reqwest::header::REFERER, referer)
                .send()
                .await
                .map_err(|e| TransferError::from_reqwest(&e))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(TransferError::from_status(status, &body));
            }
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|ct| ct.to_str().ok())
                .map(str::to_string);
            let bytes = response
                .bytes()
                .await
                .map_err(|e| TransferError::from_reqwest(&e))?;
            Ok((bytes.to_vec(), content_type))
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransferError::TransientNetwork(format!("image {url} timed out")))?
    }
}

#[async_trait]
impl ChapterScraper for ImageScraper {
    fn item_url(&self, task: &Task, item: u32) -> String {
        render_item_url(&self.url_template, task, item)
    }

    async fn collect_parts(&self, page: &PageSnapshot) -> Result<Vec<ArchivePart>, TransferError> {
        let urls = image_urls(page, &self.selector)?;
        debug!(page = %page.url, images = urls.len(), "Found page images");

        let referer = page.url.as_str();
        let mut parts = Vec::with_capacity(urls.len());
        for (index, url) in urls.iter().enumerate() {
            let fetched = self
                .retry
                .run("image download", move |_| self.fetch_image(url, referer))
                .await;
            match fetched {
                Ok((data, content_type)) => parts.push(ArchivePart {
                    name: format!("{:03}.{}", index + 1, extension_for(content_type.as_deref(), url)),
                    data,
                }),
                Err(e) => warn!(page = %page.url, image = %url, error = %e, "Skipping image"),
            }
        }

        if parts.is_empty() {
            return Err(TransferError::ResourceExhaustion(format!(
                "no images downloaded from {}",
                page.url
            )));
        }
        Ok(parts)
    }
}

impl std::fmt::Debug for ImageScraper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageScraper")
            .field("selector", &self.selector)
            .field("url_template", &self.url_template)
            .finish_non_exhaustive()
    }
}

/// Absolute image URLs on `page`, in document order, without repeats.
fn image_urls(page: &PageSnapshot, css: &str) -> Result<Vec<Url>, TransferError> {
    let selector = Selector::parse(css)
        .map_err(|e| TransferError::Other(anyhow::anyhow!("Invalid selector {css:?}: {e}")))?;
    let base = Url::parse(&page.url).ok();
    let document = Html::parse_document(&page.html);

    let mut urls: Vec<Url> = Vec::new();
    for element in document.select(&selector) {
        let value = element.value();
        // Lazy-loading pages keep the real source in a data attribute.
        let Some(src) = ["data-src", "data-original", "src"]
            .iter()
            .find_map(|attr| value.attr(attr))
            .map(str::trim)
            .filter(|s| !s.is_empty() && !s.starts_with("data:"))
        else {
            continue;
        };

        let resolved = match &base {
            Some(base) => base.join(src),
            None => Url::parse(src),
        };
        match resolved {
            Ok(url) if !urls.contains(&url) => urls.push(url),
            Ok(_) => {}
            Err(e) => debug!(src, error = %e, "Ignoring unparseable image URL"),
        }
    }
    Ok(urls)
}

fn extension_for(content_type: Option<&str>, url: &Url) -> String {
    let from_type = content_type
        .and_then(|ct| ct.split(';').next())
        .and_then(|ct| match ct.trim() {
            "image/jpeg" => Some("jpg"),
            "image/png" => Some("png"),
            "image/gif" => Some("gif"),
            "image/webp" => Some("webp"),
            "image/avif" => Some("avif"),
            _ => None,
        });
    if let Some(ext) = from_type {
        return ext.to_string();
    }

    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "jpg".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(html: &str) -> PageSnapshot {
        PageSnapshot {
            url: "https://comics.example/series/7/".to_string(),
            title: "Episode 7".to_string(),
            html: html.to_string(),
        }
    }

    #[test]
    fn test_image_urls_resolve_and_dedup() {
        let page = snapshot(
            r#"<div id="viewer">
                <img src="p1.jpg">
                <img data-src="/cdn/p2.png" src="data:image/gif;base64,R0lG">
                <img src="p1.jpg">
                <img src="">
            </div>"#,
        );
        let urls = image_urls(&page, "#viewer img").unwrap();
        let urls: Vec<_> = urls.iter().map(Url::as_str).collect();
        assert_eq!(
            urls,
            [
                "https://comics.example/series/7/p1.jpg",
                "https://comics.example/cdn/p2.png"
            ]
        );
    }

    #[test]
    fn test_extension_prefers_content_type() {
        let url = Url::parse("https://x.example/a/page.PNG?sig=1").unwrap();
        assert_eq!(extension_for(Some("image/webp; q=1"), &url), "webp");
        assert_eq!(extension_for(None, &url), "png");
        let bare = Url::parse("https://x.example/image").unwrap();
        assert_eq!(extension_for(None, &bare), "jpg");
    }

    #[test]
    fn test_render_item_url() {
        let task = Task::new("t1", "Saga", "https://comics.example/saga/", vec![3]);
        assert_eq!(
            render_item_url("{url}/episode-{item}", &task, 3),
            "https://comics.example/saga/episode-3"
        );
        assert_eq!(render_item_url("https://m.example/{id}/{item}", &task, 9), "https://m.example/t1/9");
    }
}
