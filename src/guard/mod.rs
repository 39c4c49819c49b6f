//! Block and captcha detection for the content frame.
//!
//! After a page loads, [`BlockGuard::wait_until_clear`] decides whether its
//! content can be read. A blocked page is brought to the foreground and
//! re-checked every poll interval until the block disappears or the user
//! signals that they solved it, whichever happens first.

mod browser;

pub use browser::{BrowserOptions, BrowserSession};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::TransferError;

/// Where the guard stands for the current item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Clear,
    Blocked,
    AwaitingManualResume,
}

/// What the content frame showed when inspected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    pub html: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame ended up on an origin other than the one loaded.
    #[error("frame is on a different origin: {0}")]
    CrossOrigin(String),

    #[error(transparent)]
    Unavailable(#[from] anyhow::Error),
}

/// The embedded page that items are loaded into.
#[async_trait]
pub trait ContentFrame: Send + Sync {
    async fn load(&self, url: &str) -> anyhow::Result<()>;

    async fn inspect(&self) -> Result<PageSnapshot, FrameError>;

    /// Bring the frame in front of the user.
    async fn surface(&self) -> anyhow::Result<()>;

    /// Return the frame to its background presentation.
    async fn restore(&self) -> anyhow::Result<()>;
}

/// Why a page was judged unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    Challenge(&'static str),
    EdgeSecurity(&'static str),
    /// Expected content missing and the page looks like an HTTP error.
    SiteRule,
    /// The frame could not be inspected; treated as a possible block.
    Uninspectable(String),
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Challenge(marker) => write!(f, "interactive challenge ({marker})"),
            Self::EdgeSecurity(marker) => write!(f, "edge security challenge ({marker})"),
            Self::SiteRule => f.write_str("expected content missing on an error page"),
            Self::Uninspectable(why) => write!(f, "frame not inspectable: {why}"),
        }
    }
}

const CHALLENGE_MARKERS: &[&str] = &[
    "g-recaptcha",
    "www.google.com/recaptcha",
    "h-captcha",
    "hcaptcha.com",
    "cf-turnstile",
    "challenges.cloudflare.com/turnstile",
];

const EDGE_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "cf-challenge-running",
    "cdn-cgi/challenge-platform",
    "just a moment...",
    "attention required! | cloudflare",
    "ddos-guard",
];

static HTTP_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:403|404|429|500|502|503|504)\b|forbidden|too many requests|access denied|service unavailable|bad gateway",
    )
    .expect("valid HTTP error pattern")
});

/// Inspects page snapshots for block markers.
#[derive(Debug, Clone, Default)]
pub struct BlockDetector {
    expected_selector: Option<String>,
}

impl BlockDetector {
    /// Detector with an optional site rule: pages missing
    /// `expected_selector` that look like HTTP errors count as blocked.
    ///
    /// # Errors
    ///
    /// Returns an error if the selector does not parse.
    pub fn new(expected_selector: Option<String>) -> anyhow::Result<Self> {
        if let Some(ref css) = expected_selector {
            Selector::parse(css).map_err(|e| anyhow::anyhow!("Invalid selector {css:?}: {e}"))?;
        }
        Ok(Self { expected_selector })
    }

    #[must_use]
    pub fn detect(&self, page: &PageSnapshot) -> Option<BlockReason> {
        let title = page.title.to_lowercase();
        let html = page.html.to_lowercase();

        if let Some(marker) = CHALLENGE_MARKERS.iter().copied().find(|m| html.contains(m)) {
            return Some(BlockReason::Challenge(marker));
        }
        if let Some(marker) = EDGE_MARKERS
            .iter()
            .copied()
            .find(|m| title.contains(m) || html.contains(m))
        {
            return Some(BlockReason::EdgeSecurity(marker));
        }

        let css = self.expected_selector.as_deref()?;
        let selector = Selector::parse(css).ok()?;
        let document = Html::parse_document(&page.html);
        let missing = document.select(&selector).next().is_none();
        if missing && (HTTP_ERROR.is_match(&page.title) || HTTP_ERROR.is_match(&body_text(&document))) {
            return Some(BlockReason::SiteRule);
        }
        None
    }
}

fn body_text(document: &Html) -> String {
    let body = Selector::parse("body").expect("valid body selector");
    document
        .select(&body)
        .next()
        .map(|b| b.text().collect::<Vec<_>>().join(" "))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy)]
pub struct GuardConfig {
    /// Delay after load before the first inspection.
    pub settle: Duration,
    pub poll_interval: Duration,
    /// Bound on one inspection.
    pub inspect_timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(1500),
            poll_interval: Duration::from_secs(1),
            inspect_timeout: Duration::from_secs(30),
        }
    }
}

/// The user's "I solved it" signal.
#[derive(Debug, Default)]
pub struct ManualResume {
    requested: AtomicBool,
    notify: Notify,
}

impl ManualResume {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resume(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }
}

/// How a guarded load ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    /// No block was detected.
    Clear,
    ResolvedAutomatically,
    ResolvedManually,
}

pub struct BlockGuard {
    detector: BlockDetector,
    config: GuardConfig,
    resume: std::sync::Arc<ManualResume>,
    state: Mutex<GuardState>,
}

impl BlockGuard {
    #[must_use]
    pub fn new(detector: BlockDetector, config: GuardConfig, resume: std::sync::Arc<ManualResume>) -> Self {
        Self {
            detector,
            config,
            resume,
            state: Mutex::new(GuardState::Clear),
        }
    }

    #[must_use]
    pub fn state(&self) -> GuardState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: GuardState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Resolve once `frame`'s content is safe to read.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::BlockedContent`] only if a blocked frame
    /// could not be shown to the user.
    pub async fn wait_until_clear(&self, frame: &dyn ContentFrame) -> Result<GuardOutcome, TransferError> {
        self.set_state(GuardState::Clear);
        tokio::time::sleep(self.config.settle).await;

        let Some(reason) = self.check(frame).await else {
            return Ok(GuardOutcome::Clear);
        };

        self.set_state(GuardState::Blocked);
        warn!(%reason, "Content frame blocked, waiting for it to clear");
        // A resume requested before this block does not apply to it.
        self.resume.take();

        if let Err(e) = frame.surface().await {
            self.set_state(GuardState::Clear);
            return Err(TransferError::BlockedContent(format!(
                "{reason}; could not surface frame: {e:#}"
            )));
        }
        self.set_state(GuardState::AwaitingManualResume);

        let outcome = loop {
            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {
                    if self.resume.take() {
                        break GuardOutcome::ResolvedManually;
                    }
                    match self.check(frame).await {
                        None => break GuardOutcome::ResolvedAutomatically,
                        Some(reason) => debug!(%reason, "Still blocked"),
                    }
                }
                () = self.resume.notify.notified() => {
                    self.resume.take();
                    break GuardOutcome::ResolvedManually;
                }
            }
        };

        if let Err(e) = frame.restore().await {
            warn!(error = %e, "Failed to restore content frame");
        }
        self.set_state(GuardState::Clear);
        info!(?outcome, "Content frame clear");
        Ok(outcome)
    }

    async fn check(&self, frame: &dyn ContentFrame) -> Option<BlockReason> {
        match tokio::time::timeout(self.config.inspect_timeout, frame.inspect()).await {
            Err(_) => Some(BlockReason::Uninspectable("inspection timed out".to_string())),
            Ok(Err(FrameError::CrossOrigin(url))) => {
                Some(BlockReason::Uninspectable(format!("cross-origin frame at {url}")))
            }
            Ok(Err(FrameError::Unavailable(e))) => Some(BlockReason::Uninspectable(format!("{e:#}"))),
            Ok(Ok(page)) => self.detector.detect(&page),
        }
    }
}

impl std::fmt::Debug for BlockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockGuard")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    use super::*;

    fn page(title: &str, html: &str) -> PageSnapshot {
        PageSnapshot {
            url: "https://example.com/1".to_string(),
            title: title.to_string(),
            html: html.to_string(),
        }
    }

    /// Shows a captcha for the first `blocked_for` inspections.
    struct ScriptedFrame {
        inspections: AtomicU32,
        blocked_for: u32,
        surfaced: AtomicBool,
        restored: AtomicBool,
    }

    impl ScriptedFrame {
        fn new(blocked_for: u32) -> Self {
            Self {
                inspections: AtomicU32::new(0),
                blocked_for,
                surfaced: AtomicBool::new(false),
                restored: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ContentFrame for ScriptedFrame {
        async fn load(&self, _url: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn inspect(&self) -> Result<PageSnapshot, FrameError> {
            let n = self.inspections.fetch_add(1, Ordering::SeqCst);
            if n < self.blocked_for {
                Ok(page("Chapter 1", r#"<div class="g-recaptcha"></div>"#))
            } else {
                Ok(page("Chapter 1", r#"<div id="reader"><img src="a.jpg"></div>"#))
            }
        }

        async fn surface(&self) -> anyhow::Result<()> {
            self.surfaced.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn restore(&self) -> anyhow::Result<()> {
            self.restored.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn guard(resume: Arc<ManualResume>) -> BlockGuard {
        BlockGuard::new(BlockDetector::default(), GuardConfig::default(), resume)
    }

    #[test]
    fn test_detects_challenge_and_edge_markers() {
        let detector = BlockDetector::default();
        assert!(matches!(
            detector.detect(&page("x", r#"<iframe src="https://hcaptcha.com/x">"#)),
            Some(BlockReason::Challenge(_))
        ));
        assert!(matches!(
            detector.detect(&page("Just a moment...", "<body></body>")),
            Some(BlockReason::EdgeSecurity(_))
        ));
        assert_eq!(detector.detect(&page("Chapter 3", "<img src=a.jpg>")), None);
    }

    #[test]
    fn test_site_rule_needs_missing_content_and_error_signature() {
        let detector = BlockDetector::new(Some("#reader img".to_string())).unwrap();
        assert_eq!(
            detector.detect(&page("403 Forbidden", "<body>nope</body>")),
            Some(BlockReason::SiteRule)
        );
        // Missing content alone is not a block.
        assert_eq!(detector.detect(&page("Chapter 3", "<body>text</body>")), None);
        assert_eq!(
            detector.detect(&page("503", r#"<div id="reader"><img src=a></div>"#)),
            None
        );
    }

    #[test]
    fn test_invalid_selector_rejected() {
        assert!(BlockDetector::new(Some("[[".to_string())).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_path_never_surfaces() {
        let frame = ScriptedFrame::new(0);
        let guard = guard(Arc::new(ManualResume::new()));

        assert_eq!(guard.wait_until_clear(&frame).await.unwrap(), GuardOutcome::Clear);
        assert!(!frame.surfaced.load(Ordering::SeqCst));
        assert_eq!(guard.state(), GuardState::Clear);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_clears_within_two_polls() {
        // Blocked on the initial check and the first poll, clear on the second.
        let frame = ScriptedFrame::new(2);
        let config = GuardConfig::default();
        let guard = guard(Arc::new(ManualResume::new()));
        let started = tokio::time::Instant::now();

        let outcome = guard.wait_until_clear(&frame).await.unwrap();

        assert_eq!(outcome, GuardOutcome::ResolvedAutomatically);
        assert!(started.elapsed() <= config.settle + 2 * config.poll_interval);
        assert!(frame.surfaced.load(Ordering::SeqCst));
        assert!(frame.restored.load(Ordering::SeqCst));
        assert_eq!(guard.state(), GuardState::Clear);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_resume_wins_over_polling() {
        let frame = Arc::new(ScriptedFrame::new(u32::MAX));
        let resume = Arc::new(ManualResume::new());
        let guard = Arc::new(guard(Arc::clone(&resume)));

        let waiting = {
            let guard = Arc::clone(&guard);
            let frame = Arc::clone(&frame);
            tokio::spawn(async move { guard.wait_until_clear(frame.as_ref()).await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(guard.state(), GuardState::AwaitingManualResume);
        resume.resume();

        let outcome = waiting.await.unwrap().unwrap();
        assert_eq!(outcome, GuardOutcome::ResolvedManually);
        assert!(frame.restored.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cross_origin_counts_as_block() {
        struct Redirected(AtomicU32);

        #[async_trait]
        impl ContentFrame for Redirected {
            async fn load(&self, _url: &str) -> anyhow::Result<()> {
                Ok(())
            }
            async fn inspect(&self) -> Result<PageSnapshot, FrameError> {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(FrameError::CrossOrigin("https://challenge.example".into()))
                } else {
                    Ok(page("Chapter", "<img src=a>"))
                }
            }
            async fn surface(&self) -> anyhow::Result<()> {
                Ok(())
            }
            async fn restore(&self) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let guard = guard(Arc::new(ManualResume::new()));
        let outcome = guard
            .wait_until_clear(&Redirected(AtomicU32::new(0)))
            .await
            .unwrap();
        assert_eq!(outcome, GuardOutcome::ResolvedAutomatically);
    }
}
