use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use serial_archiver::archive::{sanitize_filename, ArchiveFormat, CbzFormat};
use serial_archiver::clock::{Clock, SystemClock};
use serial_archiver::config::{Config, DirectBackend};
use serial_archiver::download::{AdaptiveDownloader, ReaderCache};
use serial_archiver::guard::{BlockDetector, BlockGuard, BrowserSession, ManualResume};
use serial_archiver::lock::{LockManager, WorkerIdentity};
use serial_archiver::processor::{
    ArchivePipeline, LogNotifier, PipelineSettings, QueueProcessor,
};
use serial_archiver::queue::{parse_item_ranges, Task, TaskQueue};
use serial_archiver::relay::RelayClient;
use serial_archiver::scrape::ImageScraper;
use serial_archiver::store::{KvStore, SqliteStore};
use serial_archiver::upload::{
    DirectStore, DriveStore, ResumableUploader, S3Store, TokenCache, Uploader,
};

#[derive(Debug, Parser)]
#[command(name = "serial-archiver", version, about = "Archive serialized chapters to object storage")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll the shared queue and run tasks while holding the worker lease (default).
    Worker,
    /// Add a task to the queue.
    Enqueue {
        /// Unique task id.
        id: String,
        /// Series title; also the destination folder name.
        title: String,
        /// Page the worker must be on to run the task.
        resume_url: String,
        /// Items to archive, e.g. "1-10,12".
        #[arg(long)]
        items: String,
    },
    /// Show pending and failed tasks.
    Queue,
    /// Move a failed task back to the tail of the queue.
    Requeue { id: String },
    /// Download an archive through the relay and extract its pages.
    Fetch {
        file_id: String,
        /// Declared size in bytes, if known.
        #[arg(long)]
        size: Option<u64>,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();
    init_tracing()?;

    let cli = Cli::parse();

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    if let Some(parent) = config.database_path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create database directory: {}", parent.display())
        })?;
    }
    let store: Arc<dyn KvStore> = Arc::new(
        SqliteStore::open(&config.database_path)
            .await
            .context("Failed to open shared store")?,
    );

    match cli.command.unwrap_or(Command::Worker) {
        Command::Worker => run_worker(&config, store).await,
        Command::Enqueue {
            id,
            title,
            resume_url,
            items,
        } => {
            let items = parse_item_ranges(&items)?;
            let task = Task::new(id, title, resume_url, items);
            let task_id = task.id.clone();
            TaskQueue::new(store).enqueue(task).await?;
            info!(task_id = %task_id, "Task enqueued");
            Ok(())
        }
        Command::Queue => show_queue(&TaskQueue::new(store)).await,
        Command::Requeue { id } => {
            TaskQueue::new(store).requeue_failed(&id).await?;
            info!(task_id = %id, "Task requeued");
            Ok(())
        }
        Command::Fetch { file_id, size, out } => fetch(&config, &file_id, size, &out).await,
    }
}

async fn run_worker(config: &Config, store: Arc<dyn KvStore>) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let identity = config
        .worker_id
        .clone()
        .map_or_else(WorkerIdentity::random, WorkerIdentity::new);
    info!(worker = %identity, relay = %config.relay_url, "Starting worker");

    let relay = Arc::new(RelayClient::new(&config.relay_url, config.request_timeout));
    let direct = direct_backend(config, &relay, &clock).await;
    let uploader = Uploader::new(
        ResumableUploader::new(
            relay.clone(),
            config.upload_chunk_size(),
            config.retry_policy(),
        ),
        direct,
    );

    let browser = Arc::new(
        BrowserSession::launch(&config.browser_options())
            .await
            .context("Failed to start browser")?,
    );

    let resume = Arc::new(ManualResume::new());
    spawn_resume_listener(Arc::clone(&resume));
    let guard = Arc::new(BlockGuard::new(
        BlockDetector::new(config.expected_content_selector.clone())?,
        config.guard_config(),
        resume,
    ));
    let scraper = Arc::new(ImageScraper::new(
        config.image_selector.clone(),
        config.item_url_template.clone(),
        config.retry_policy(),
        config.request_timeout,
    )?);

    let pipeline = ArchivePipeline::new(
        browser.clone(),
        guard,
        scraper,
        Arc::new(CbzFormat),
        uploader,
        relay.clone(),
        PipelineSettings {
            category: config.upload_category.clone(),
        },
    );

    let lock = LockManager::new(Arc::clone(&store), clock, identity, config.lock_config());
    let processor = QueueProcessor::new(
        store,
        lock,
        browser.clone(),
        Arc::new(pipeline),
        Arc::new(LogNotifier),
        config.queue_poll_interval,
    );

    let shutdown = CancellationToken::new();
    let signal = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutting down...");
            shutdown.cancel();
        })
    };

    processor.run(shutdown).await;
    signal.abort();
    browser.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

async fn direct_backend(
    config: &Config,
    relay: &Arc<RelayClient>,
    clock: &Arc<dyn Clock>,
) -> Option<Arc<dyn DirectStore>> {
    match config.direct_backend {
        DirectBackend::None => {
            info!("Direct upload disabled, using relay only");
            None
        }
        DirectBackend::Drive => {
            let tokens = TokenCache::new(relay.clone(), Arc::clone(clock), config.token_refresh_margin);
            info!(root = %config.drive_root_folder_id, "Direct upload via Drive");
            Some(Arc::new(DriveStore::new(
                tokens,
                config.drive_root_folder_id.clone(),
                config.request_timeout,
            )))
        }
        DirectBackend::S3 => {
            let Some(settings) = config.s3_settings() else {
                warn!("S3 direct upload requested without a bucket, using relay only");
                return None;
            };
            info!(bucket = %settings.bucket, "Direct upload via S3");
            Some(Arc::new(S3Store::new(&settings).await))
        }
    }
}

/// Pressing Enter on the worker's terminal resumes a blocked frame.
fn spawn_resume_listener(resume: Arc<ManualResume>) {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(_)) = lines.next_line().await {
            info!("Manual resume requested");
            resume.resume();
        }
    });
}

async fn show_queue(queue: &TaskQueue) -> Result<()> {
    let pending = queue.list().await?;
    println!("Pending ({}):", pending.len());
    for task in &pending {
        println!(
            "  {}  {}  items={}  enqueued={}",
            task.id,
            task.title,
            task.items.len(),
            task.enqueued_at.to_rfc3339()
        );
    }

    let failed = queue.failed().await?;
    println!("Failed ({}):", failed.len());
    for entry in &failed {
        println!(
            "  {}  {}  failures={}{}  {}",
            entry.task.id,
            entry.task.title,
            entry.failures,
            if entry.requeued { " (requeued)" } else { "" },
            entry.error
        );
    }
    Ok(())
}

async fn fetch(config: &Config, file_id: &str, size: Option<u64>, out: &PathBuf) -> Result<()> {
    let relay = Arc::new(RelayClient::new(&config.relay_url, config.request_timeout));
    let cache = ReaderCache::new(
        AdaptiveDownloader::new(relay, config.download_config()),
        &config.work_dir,
    );

    let bytes = cache.open(file_id, size).await?;
    let parts = CbzFormat.extract(&bytes)?;
    tokio::fs::create_dir_all(out)
        .await
        .with_context(|| format!("Failed to create {}", out.display()))?;

    for part in &parts {
        let view = cache.create_view(file_id, &part.name, &part.data).await?;
        let target = out.join(sanitize_filename(&part.name));
        tokio::fs::copy(view.path(), &target)
            .await
            .with_context(|| format!("Failed to write {}", target.display()))?;
    }
    cache.invalidate().await;

    info!(file_id, pages = parts.len(), out = %out.display(), "Archive extracted");
    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,serial_archiver=debug"));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
