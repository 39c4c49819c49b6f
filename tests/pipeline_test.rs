//! End-to-end tests for archiving a task: load, guard, scrape, build and
//! upload each item.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serial_archiver::archive::{ArchiveFormat, CbzFormat};
use serial_archiver::error::TransferError;
use serial_archiver::guard::{
    BlockDetector, BlockGuard, ContentFrame, FrameError, GuardConfig, ManualResume, PageSnapshot,
};
use serial_archiver::processor::{ArchivePipeline, CacheInvalidator, PipelineSettings, TaskRunner};
use serial_archiver::queue::Task;
use serial_archiver::relay::{InitReply, UploadTarget};
use serial_archiver::retry::RetryPolicy;
use serial_archiver::scrape::ImageScraper;
use serial_archiver::upload::{RelayTransport, ResumableUploader, Uploader};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SERIES_URL: &str = "https://comics.example/series/7";

/// Serves canned HTML for each loaded URL.
struct FakeFrame {
    pages: HashMap<String, String>,
    loaded: Mutex<Vec<String>>,
}

#[async_trait]
impl ContentFrame for FakeFrame {
    async fn load(&self, url: &str) -> anyhow::Result<()> {
        self.loaded.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn inspect(&self) -> Result<PageSnapshot, FrameError> {
        let url = self
            .loaded
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_default();
        let html = self.pages.get(&url).cloned().unwrap_or_default();
        Ok(PageSnapshot {
            url,
            title: "Episode".into(),
            html,
        })
    }

    async fn surface(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn restore(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Relay stand-in that keeps every uploaded file whole.
#[derive(Default)]
struct CollectingRelay {
    files: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl RelayTransport for CollectingRelay {
    async fn init(
        &self,
        _folder_name: &str,
        file_name: &str,
        _category: &str,
        _total_size: u64,
    ) -> Result<InitReply, TransferError> {
        self.files
            .lock()
            .unwrap()
            .push((file_name.to_string(), Vec::new()));
        Ok(InitReply {
            target: UploadTarget(file_name.to_string()),
            container_id: Some("F1".into()),
        })
    }

    async fn send_chunk(
        &self,
        _target: &UploadTarget,
        chunk: &[u8],
        _start: u64,
        _total: u64,
    ) -> Result<(), TransferError> {
        if let Some(last) = self.files.lock().unwrap().last_mut() {
            last.1.extend_from_slice(chunk);
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingInvalidator {
    containers: Mutex<Vec<String>>,
}

#[async_trait]
impl CacheInvalidator for RecordingInvalidator {
    async fn invalidate(&self, container_id: &str) -> Result<(), TransferError> {
        self.containers.lock().unwrap().push(container_id.to_string());
        Ok(())
    }
}

struct Fixture {
    _server: MockServer,
    frame: Arc<FakeFrame>,
    relay: Arc<CollectingRelay>,
    invalidator: Arc<RecordingInvalidator>,
    pipeline: ArchivePipeline,
}

/// Episode 1 has two good images, episode 2 only a missing one, episode 3
/// one good image.
async fn fixture() -> Fixture {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/img/a.png"))
        .and(header("referer", format!("{SERIES_URL}/episode/1").as_str()))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(b"png-a".to_vec(), "image/png"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/img/b.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpg-b".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/img/missing.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let base = server.uri();
    let mut pages = HashMap::new();
    pages.insert(
        format!("{SERIES_URL}/episode/1"),
        format!(
            r#"<div id="viewer"><img class="page" src="{base}/img/a.png"><img class="page" data-src="{base}/img/b.jpg" src="data:image/gif;base64,R0"></div>"#
        ),
    );
    pages.insert(
        format!("{SERIES_URL}/episode/2"),
        format!(r#"<div id="viewer"><img class="page" src="{base}/img/missing.jpg"></div>"#),
    );
    pages.insert(
        format!("{SERIES_URL}/episode/3"),
        format!(r#"<div id="viewer"><img class="page" src="{base}/img/b.jpg"></div>"#),
    );

    let frame = Arc::new(FakeFrame {
        pages,
        loaded: Mutex::new(Vec::new()),
    });
    let guard = Arc::new(BlockGuard::new(
        BlockDetector::new(None).unwrap(),
        GuardConfig {
            settle: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
            inspect_timeout: Duration::from_secs(5),
        },
        Arc::new(ManualResume::new()),
    ));
    let retry = RetryPolicy {
        attempts: 2,
        backoff: Duration::from_millis(10),
    };
    let scraper = Arc::new(
        ImageScraper::new("img.page", "{url}/episode/{item}", retry, Duration::from_secs(5)).unwrap(),
    );
    let relay = Arc::new(CollectingRelay::default());
    let invalidator = Arc::new(RecordingInvalidator::default());
    let pipeline = ArchivePipeline::new(
        frame.clone(),
        guard,
        scraper,
        Arc::new(CbzFormat),
        Uploader::new(ResumableUploader::new(relay.clone(), 1024, retry), None),
        invalidator.clone(),
        PipelineSettings {
            category: "Comics".into(),
        },
    );

    Fixture {
        _server: server,
        frame,
        relay,
        invalidator,
        pipeline,
    }
}

#[tokio::test]
async fn test_failed_item_is_skipped_and_others_uploaded() {
    let f = fixture().await;
    let task = Task::new("t1", "Space: Saga?", SERIES_URL, vec![1, 2, 3]);

    let summary = f.pipeline.run(&task).await.unwrap();

    assert_eq!(summary.items_archived, 2);
    assert_eq!(summary.items_failed.len(), 1);
    assert_eq!(summary.items_failed[0].0, 2);
    assert_eq!(
        f.frame.loaded.lock().unwrap().clone(),
        [
            format!("{SERIES_URL}/episode/1"),
            format!("{SERIES_URL}/episode/2"),
            format!("{SERIES_URL}/episode/3"),
        ]
    );

    let files = f.relay.files.lock().unwrap().clone();
    let names: Vec<&str> = files.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["Space_Saga_-_001.cbz", "Space_Saga_-_003.cbz"]);
    assert_eq!(
        summary.bytes_uploaded,
        files.iter().map(|(_, b)| b.len() as u64).sum::<u64>()
    );

    let parts = CbzFormat.extract(&files[0].1).unwrap();
    let pages: Vec<(&str, &[u8])> = parts
        .iter()
        .map(|p| (p.name.as_str(), p.data.as_slice()))
        .collect();
    assert_eq!(pages, [("001.png", &b"png-a"[..]), ("002.jpg", &b"jpg-b"[..])]);

    // Both uploads landed in F1; it is invalidated once.
    assert_eq!(f.invalidator.containers.lock().unwrap().clone(), ["F1"]);
}

#[tokio::test]
async fn test_task_fails_when_no_item_succeeds() {
    let f = fixture().await;
    let task = Task::new("t1", "Series", SERIES_URL, vec![2]);

    let err = f.pipeline.run(&task).await.unwrap_err();

    assert!(matches!(err, TransferError::ResourceExhaustion(_)), "{err:?}");
    assert!(f.relay.files.lock().unwrap().is_empty());
    assert!(f.invalidator.containers.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_task_without_items_fails() {
    let f = fixture().await;
    let task = Task::new("t1", "Series", SERIES_URL, Vec::new());

    let err = f.pipeline.run(&task).await.unwrap_err();

    assert!(matches!(err, TransferError::ResourceExhaustion(_)));
    assert!(f.frame.loaded.lock().unwrap().is_empty());
}
