//! Direct writes to the object-storage provider.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::{duration_ms, Clock};
use crate::error::TransferError;
use crate::relay::TokenReply;

/// Metadata stored alongside an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub content_type: String,
    /// Hex SHA-256 of the payload.
    pub sha256: String,
}

/// The two storage operations the direct path depends on.
#[async_trait]
pub trait DirectStore: Send + Sync {
    /// Backend name, for logging.
    fn name(&self) -> &'static str;

    /// Container that category folders are created under.
    fn root(&self) -> &str;

    /// Find a folder called `name` under `parent`, creating it if absent.
    async fn ensure_folder(&self, name: &str, parent: &str) -> Result<String>;

    /// Store `bytes` as `file_name` inside `folder_id` and return its id.
    async fn upload_file(
        &self,
        folder_id: &str,
        file_name: &str,
        bytes: &[u8],
        metadata: &FileMetadata,
    ) -> Result<String>;
}

/// Issues short-lived storage access tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<TokenReply, TransferError>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at_ms: i64,
}

/// Caches one access token and refreshes it a margin before it expires.
///
/// Concurrent callers wait on the same refresh instead of each fetching.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    clock: Arc<dyn Clock>,
    margin: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    #[must_use]
    pub fn new(source: Arc<dyn TokenSource>, clock: Arc<dyn Clock>, margin: Duration) -> Self {
        Self {
            source,
            clock,
            margin,
            cached: Mutex::new(None),
        }
    }

    /// A token valid for at least the refresh margin.
    ///
    /// # Errors
    ///
    /// Returns the token source's error if a refresh is needed and fails.
    pub async fn token(&self) -> Result<String, TransferError> {
        let mut cached = self.cached.lock().await;
        let now = self.clock.now_ms();

        if let Some(entry) = cached.as_ref() {
            if now + duration_ms(self.margin) < entry.expires_at_ms {
                return Ok(entry.token.clone());
            }
            debug!("Access token inside refresh margin, refreshing");
        }

        let reply = self.source.fetch_token().await?;
        let lifetime = Duration::from_secs(reply.expires_in_secs);
        *cached = Some(CachedToken {
            token: reply.token.clone(),
            expires_at_ms: now + duration_ms(lifetime),
        });
        debug!(expires_in_secs = reply.expires_in_secs, "Access token refreshed");
        Ok(reply.token)
    }

    /// Drop the cached token, e.g. after the provider rejected it.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("margin", &self.margin)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::clock::ManualClock;

    struct CountingSource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch_token(&self) -> Result<TokenReply, TransferError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TokenReply {
                token: format!("token-{n}"),
                expires_in_secs: 3600,
            })
        }
    }

    #[tokio::test]
    async fn test_token_refreshed_inside_margin() {
        let source = Arc::new(CountingSource {
            calls: AtomicU32::new(0),
        });
        let clock = Arc::new(ManualClock::new(0));
        let cache = TokenCache::new(source.clone(), clock.clone(), Duration::from_secs(300));

        assert_eq!(cache.token().await.unwrap(), "token-1");
        clock.advance(Duration::from_secs(3000));
        assert_eq!(cache.token().await.unwrap(), "token-1");

        // 3301s in: less than five minutes left.
        clock.advance(Duration::from_secs(301));
        assert_eq!(cache.token().await.unwrap(), "token-2");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let source = Arc::new(CountingSource {
            calls: AtomicU32::new(0),
        });
        let cache = TokenCache::new(
            source.clone(),
            Arc::new(ManualClock::new(0)),
            Duration::from_secs(300),
        );
        cache.token().await.unwrap();
        cache.invalidate().await;
        assert_eq!(cache.token().await.unwrap(), "token-2");
    }
}
