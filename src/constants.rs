//! Shared constants used across the application.

use std::time::Duration;

/// User agent string used for page and image requests.
///
/// A realistic browser user agent, so image hosts serve the same content
/// they would serve to the reader's own browser.
pub const ARCHIVAL_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const MIB: u64 = 1024 * 1024;

/// Size of one chunk sent to the relay. Stays under the relay's request ceiling
/// once base64 inflation is accounted for.
pub const UPLOAD_CHUNK_BYTES: u64 = 20 * MIB;

/// Size of one chunk requested from the relay when reading a file back.
pub const DOWNLOAD_CHUNK_BYTES: u64 = 10 * MIB;

/// Files strictly smaller than this are fetched with one request.
pub const SINGLE_SHOT_THRESHOLD_BYTES: u64 = 26 * MIB;

/// Number of concurrent chunk-fetch workers.
pub const DOWNLOAD_WORKERS: usize = 3;

/// Attempts per chunk before the whole transfer is abandoned.
pub const CHUNK_RETRY_ATTEMPTS: u32 = 3;

/// Fixed delay between chunk attempts.
pub const CHUNK_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// A lease whose heartbeat is older than this may be taken over.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat interval while a lease is held.
pub const LOCK_RENEW_INTERVAL: Duration = Duration::from_secs(2);

/// Interval between queue polls.
pub const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Access tokens are refreshed this long before they expire.
pub const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Failed tasks that reached this many failures cannot be requeued.
pub const MAX_TASK_FAILURES: u32 = 3;

/// KV key holding the worker lease.
pub const LOCK_KEY: &str = "worker:lock";

/// KV key holding the pending task list.
pub const QUEUE_KEY: &str = "queue:tasks";

/// KV key holding tasks that failed and were not requeued.
pub const FAILED_KEY: &str = "queue:failed";

/// KV key holding the task a worker dequeued but has not finished.
pub const ACTIVE_TASK_KEY: &str = "worker:active_task";
