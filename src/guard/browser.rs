//! Chrome session driving the worker's two pages over the DevTools
//! protocol: the main page the worker is "on", and the content page items
//! are loaded into.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use url::Url;

use super::{ContentFrame, FrameError, PageSnapshot};
use crate::processor::Navigator;

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Path to Chrome/Chromium (None for auto-detection).
    pub chrome_path: Option<String>,
    /// Headless sessions cannot be solved by hand, so the default is headed.
    pub headless: bool,
    /// Bound on each navigation and inspection.
    pub page_timeout: Duration,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: false,
            page_timeout: Duration::from_secs(30),
        }
    }
}

pub struct BrowserSession {
    browser: Mutex<Browser>,
    handler: JoinHandle<()>,
    main: Page,
    content: Page,
    loaded_origin: Mutex<Option<url::Origin>>,
    page_timeout: Duration,
}

impl BrowserSession {
    /// Launch the browser and open both pages.
    ///
    /// # Errors
    ///
    /// Fails if Chrome cannot be launched or a page cannot be opened.
    pub async fn launch(options: &BrowserOptions) -> Result<Self> {
        info!(headless = options.headless, "Launching browser");

        let mut builder = BrowserConfig::builder()
            .window_size(1280, 900)
            .request_timeout(options.page_timeout)
            .no_sandbox()
            .disable_default_args()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--disable-translate")
            .arg("--mute-audio");
        if options.headless {
            builder = builder.arg("--headless=new");
        } else {
            builder = builder.with_head();
        }
        if let Some(ref chrome_path) = options.chrome_path {
            builder = builder.chrome_executable(chrome_path);
        }
        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("Failed to launch browser")?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {e}");
                }
            }
        });

        let main = browser
            .new_page("about:blank")
            .await
            .context("Failed to open main page")?;
        let content = browser
            .new_page("about:blank")
            .await
            .context("Failed to open content page")?;
        main.bring_to_front()
            .await
            .context("Failed to focus main page")?;

        Ok(Self {
            browser: Mutex::new(browser),
            handler,
            main,
            content,
            loaded_origin: Mutex::new(None),
            page_timeout: options.page_timeout,
        })
    }

    async fn goto(&self, page: &Page, url: &str) -> Result<()> {
        tokio::time::timeout(self.page_timeout, async {
            page.goto(url).await?;
            page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        })
        .await
        .with_context(|| format!("Timed out loading {url}"))?
        .with_context(|| format!("Failed to load {url}"))
    }

    async fn snapshot(&self) -> Result<PageSnapshot> {
        let url = self.content.url().await?.unwrap_or_default();
        let title = self.content.get_title().await?.unwrap_or_default();
        let html = self.content.content().await?;
        Ok(PageSnapshot { url, title, html })
    }

    /// Close the browser.
    pub async fn shutdown(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            error!("Failed to close browser: {e}");
        } else {
            info!("Browser shutdown complete");
        }
        self.handler.abort();
    }
}

#[async_trait]
impl ContentFrame for BrowserSession {
    async fn load(&self, url: &str) -> Result<()> {
        let origin = Url::parse(url)
            .with_context(|| format!("Invalid item URL {url}"))?
            .origin();
        *self.loaded_origin.lock().await = Some(origin);
        self.goto(&self.content, url).await
    }

    async fn inspect(&self) -> Result<PageSnapshot, FrameError> {
        let page = tokio::time::timeout(self.page_timeout, self.snapshot())
            .await
            .context("Timed out inspecting content page")??;

        let expected = self.loaded_origin.lock().await.clone();
        if let Some(expected) = expected {
            let actual = Url::parse(&page.url).map(|u| u.origin());
            if actual.as_ref().ok() != Some(&expected) {
                return Err(FrameError::CrossOrigin(page.url));
            }
        }
        Ok(page)
    }

    async fn surface(&self) -> Result<()> {
        self.content.bring_to_front().await?;
        Ok(())
    }

    async fn restore(&self) -> Result<()> {
        self.main.bring_to_front().await?;
        Ok(())
    }
}

#[async_trait]
impl Navigator for BrowserSession {
    async fn current_location(&self) -> Result<String> {
        Ok(self.main.url().await?.unwrap_or_default())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.goto(&self.main, url).await
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

impl std::fmt::Debug for BrowserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserSession")
            .field("page_timeout", &self.page_timeout)
            .finish_non_exhaustive()
    }
}
