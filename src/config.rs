use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::constants;
use crate::download::DownloadConfig;
use crate::guard::{BrowserOptions, GuardConfig};
use crate::lock::LockConfig;
use crate::retry::RetryPolicy;
use crate::upload::S3Settings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as boolean: {value}")]
    ParseBool { name: String, value: String },
}

/// Which provider, if any, to try before the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectBackend {
    None,
    Drive,
    S3,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Relay
    pub relay_url: String,
    pub request_timeout: Duration,

    // Shared store
    pub database_path: PathBuf,
    pub work_dir: PathBuf,

    // Coordination
    pub worker_id: Option<String>,
    pub lock_timeout: Duration,
    pub lock_renew_interval: Duration,
    pub queue_poll_interval: Duration,

    // Transfers
    pub upload_chunk_bytes: u64,
    pub download_chunk_bytes: u64,
    pub single_shot_threshold_bytes: u64,
    pub download_workers: usize,
    pub chunk_retry_attempts: u32,
    pub chunk_retry_backoff: Duration,

    // Direct upload
    pub direct_backend: DirectBackend,
    pub drive_root_folder_id: String,
    pub token_refresh_margin: Duration,
    pub s3_bucket: Option<String>,
    pub s3_region: String,
    pub s3_endpoint: Option<String>,
    pub s3_prefix: String,
    pub upload_category: String,

    // Scraping
    pub item_url_template: String,
    pub image_selector: String,
    pub expected_content_selector: Option<String>,

    // Guard and browser
    pub guard_settle: Duration,
    pub guard_poll_interval: Duration,
    pub frame_timeout: Duration,
    pub chrome_path: Option<String>,
    pub browser_headless: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Relay
            relay_url: required_env("RELAY_URL")?,
            request_timeout: Duration::from_secs(parse_env("REQUEST_TIMEOUT_SECS", 120)?),

            // Shared store
            database_path: PathBuf::from(env_or_default("DATABASE_PATH", "./data/queue.sqlite")),
            work_dir: PathBuf::from(env_or_default("WORK_DIR", "./data/tmp")),

            // Coordination
            worker_id: optional_env("WORKER_ID"),
            lock_timeout: Duration::from_secs(parse_env(
                "LOCK_TIMEOUT_SECS",
                constants::LOCK_TIMEOUT.as_secs(),
            )?),
            lock_renew_interval: Duration::from_secs(parse_env(
                "LOCK_RENEW_INTERVAL_SECS",
                constants::LOCK_RENEW_INTERVAL.as_secs(),
            )?),
            queue_poll_interval: Duration::from_secs(parse_env(
                "QUEUE_POLL_INTERVAL_SECS",
                constants::QUEUE_POLL_INTERVAL.as_secs(),
            )?),

            // Transfers
            upload_chunk_bytes: parse_env("UPLOAD_CHUNK_BYTES", constants::UPLOAD_CHUNK_BYTES)?,
            download_chunk_bytes: parse_env(
                "DOWNLOAD_CHUNK_BYTES",
                constants::DOWNLOAD_CHUNK_BYTES,
            )?,
            single_shot_threshold_bytes: parse_env(
                "SINGLE_SHOT_THRESHOLD_BYTES",
                constants::SINGLE_SHOT_THRESHOLD_BYTES,
            )?,
            download_workers: parse_env("DOWNLOAD_WORKERS", constants::DOWNLOAD_WORKERS)?,
            chunk_retry_attempts: parse_env(
                "CHUNK_RETRY_ATTEMPTS",
                constants::CHUNK_RETRY_ATTEMPTS,
            )?,
            chunk_retry_backoff: Duration::from_millis(parse_env(
                "CHUNK_RETRY_BACKOFF_MS",
                constants::CHUNK_RETRY_BACKOFF.as_millis() as u64,
            )?),

            // Direct upload
            direct_backend: parse_direct_backend(&env_or_default("DIRECT_BACKEND", "none"))?,
            drive_root_folder_id: env_or_default("DRIVE_ROOT_FOLDER_ID", "root"),
            token_refresh_margin: Duration::from_secs(parse_env(
                "TOKEN_REFRESH_MARGIN_SECS",
                constants::TOKEN_REFRESH_MARGIN.as_secs(),
            )?),
            s3_bucket: optional_env("S3_BUCKET"),
            s3_region: env_or_default("S3_REGION", "us-east-1"),
            s3_endpoint: optional_env("S3_ENDPOINT"),
            s3_prefix: env_or_default("S3_PREFIX", "archives/"),
            upload_category: env_or_default("UPLOAD_CATEGORY", "Comics"),

            // Scraping
            item_url_template: env_or_default("ITEM_URL_TEMPLATE", "{url}/{item}"),
            image_selector: env_or_default("IMAGE_SELECTOR", "img"),
            expected_content_selector: optional_env("EXPECTED_CONTENT_SELECTOR"),

            // Guard and browser
            guard_settle: Duration::from_millis(parse_env("GUARD_SETTLE_MS", 1500)?),
            guard_poll_interval: Duration::from_millis(parse_env("GUARD_POLL_MS", 1000)?),
            frame_timeout: Duration::from_secs(parse_env("FRAME_TIMEOUT_SECS", 30)?),
            chrome_path: optional_env("CHROME_PATH"),
            browser_headless: parse_env_bool("BROWSER_HEADLESS", false)?,
        })
    }

    /// Defaults suitable for tests: no environment, local relay URL.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            relay_url: "http://127.0.0.1:9/relay".to_string(),
            request_timeout: Duration::from_secs(5),
            database_path: PathBuf::from(":memory:"),
            work_dir: std::env::temp_dir().join("serial-archiver-test"),
            worker_id: Some("test-worker".to_string()),
            lock_timeout: constants::LOCK_TIMEOUT,
            lock_renew_interval: constants::LOCK_RENEW_INTERVAL,
            queue_poll_interval: constants::QUEUE_POLL_INTERVAL,
            upload_chunk_bytes: constants::UPLOAD_CHUNK_BYTES,
            download_chunk_bytes: constants::DOWNLOAD_CHUNK_BYTES,
            single_shot_threshold_bytes: constants::SINGLE_SHOT_THRESHOLD_BYTES,
            download_workers: constants::DOWNLOAD_WORKERS,
            chunk_retry_attempts: constants::CHUNK_RETRY_ATTEMPTS,
            chunk_retry_backoff: constants::CHUNK_RETRY_BACKOFF,
            direct_backend: DirectBackend::None,
            drive_root_folder_id: "root".to_string(),
            token_refresh_margin: constants::TOKEN_REFRESH_MARGIN,
            s3_bucket: None,
            s3_region: "us-east-1".to_string(),
            s3_endpoint: None,
            s3_prefix: "archives/".to_string(),
            upload_category: "Comics".to_string(),
            item_url_template: "{url}/{item}".to_string(),
            image_selector: "img".to_string(),
            expected_content_selector: None,
            guard_settle: Duration::from_millis(1500),
            guard_poll_interval: Duration::from_secs(1),
            frame_timeout: Duration::from_secs(30),
            chrome_path: None,
            browser_headless: true,
        }
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay_url.is_empty() {
            return Err(invalid("RELAY_URL", "cannot be empty"));
        }
        if url::Url::parse(&self.relay_url).is_err() {
            return Err(invalid("RELAY_URL", "must be an absolute URL"));
        }
        if self.lock_renew_interval.is_zero() {
            return Err(invalid("LOCK_RENEW_INTERVAL_SECS", "must be at least 1"));
        }
        if self.queue_poll_interval.is_zero() {
            return Err(invalid("QUEUE_POLL_INTERVAL_SECS", "must be at least 1"));
        }
        if self.lock_renew_interval >= self.lock_timeout {
            return Err(invalid(
                "LOCK_RENEW_INTERVAL_SECS",
                "must be shorter than LOCK_TIMEOUT_SECS",
            ));
        }
        if self.upload_chunk_bytes == 0 {
            return Err(invalid("UPLOAD_CHUNK_BYTES", "must be at least 1"));
        }
        if self.download_chunk_bytes == 0 {
            return Err(invalid("DOWNLOAD_CHUNK_BYTES", "must be at least 1"));
        }
        if self.download_workers == 0 {
            return Err(invalid("DOWNLOAD_WORKERS", "must be at least 1"));
        }
        if self.chunk_retry_attempts == 0 {
            return Err(invalid("CHUNK_RETRY_ATTEMPTS", "must be at least 1"));
        }
        if self.direct_backend == DirectBackend::S3 && self.s3_bucket.is_none() {
            return Err(invalid("S3_BUCKET", "required when DIRECT_BACKEND=s3"));
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.chunk_retry_attempts,
            backoff: self.chunk_retry_backoff,
        }
    }

    #[must_use]
    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            timeout: self.lock_timeout,
            renew_interval: self.lock_renew_interval,
        }
    }

    #[must_use]
    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            chunk_size: self.download_chunk_bytes,
            single_shot_threshold: self.single_shot_threshold_bytes,
            workers: self.download_workers,
            retry: self.retry_policy(),
        }
    }

    /// Relay upload chunk size in bytes.
    #[must_use]
    pub fn upload_chunk_size(&self) -> usize {
        self.upload_chunk_bytes as usize
    }

    #[must_use]
    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            settle: self.guard_settle,
            poll_interval: self.guard_poll_interval,
            inspect_timeout: self.frame_timeout,
        }
    }

    #[must_use]
    pub fn browser_options(&self) -> BrowserOptions {
        BrowserOptions {
            chrome_path: self.chrome_path.clone(),
            headless: self.browser_headless,
            page_timeout: self.frame_timeout,
        }
    }

    /// S3 settings, if a bucket is configured.
    #[must_use]
    pub fn s3_settings(&self) -> Option<S3Settings> {
        self.s3_bucket.as_ref().map(|bucket| S3Settings {
            bucket: bucket.clone(),
            region: self.s3_region.clone(),
            endpoint: self.s3_endpoint.clone(),
            prefix: self.s3_prefix.clone(),
        })
    }
}

fn invalid(name: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message: message.to_string(),
    }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr<Err = std::num::ParseIntError>,
{
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.trim().parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::ParseBool {
                name: name.to_string(),
                value: val,
            }),
        },
        _ => Ok(default),
    }
}

fn parse_direct_backend(value: &str) -> Result<DirectBackend, ConfigError> {
    match value.to_lowercase().as_str() {
        "none" | "relay" => Ok(DirectBackend::None),
        "drive" | "gdrive" => Ok(DirectBackend::Drive),
        "s3" => Ok(DirectBackend::S3),
        _ => Err(ConfigError::InvalidValue {
            name: "DIRECT_BACKEND".to_string(),
            message: format!("must be 'none', 'drive' or 's3', got '{value}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    const VARS: &[&str] = &[
        "RELAY_URL",
        "LOCK_TIMEOUT_SECS",
        "LOCK_RENEW_INTERVAL_SECS",
        "DIRECT_BACKEND",
        "S3_BUCKET",
        "BROWSER_HEADLESS",
        "UPLOAD_CHUNK_BYTES",
        "QUEUE_POLL_INTERVAL_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_parse_direct_backend() {
        assert_eq!(parse_direct_backend("none").unwrap(), DirectBackend::None);
        assert_eq!(parse_direct_backend("DRIVE").unwrap(), DirectBackend::Drive);
        assert_eq!(parse_direct_backend("s3").unwrap(), DirectBackend::S3);
        assert!(parse_direct_backend("ftp").is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        std::env::set_var("RELAY_URL", "https://relay.example/exec");

        let config = Config::from_env().unwrap();
        config.validate().unwrap();

        assert_eq!(config.lock_timeout, Duration::from_secs(10));
        assert_eq!(config.lock_renew_interval, Duration::from_secs(2));
        assert_eq!(config.upload_chunk_bytes, 20 * 1024 * 1024);
        assert_eq!(config.direct_backend, DirectBackend::None);
        assert!(!config.browser_headless);
        assert_eq!(config.download_config().workers, 3);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_relay_url() {
        clear_env();
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::MissingEnvVar(name)) if name == "RELAY_URL"
        ));
    }

    #[test]
    #[serial]
    fn test_invalid_values_rejected() {
        clear_env();
        std::env::set_var("RELAY_URL", "https://relay.example/exec");
        std::env::set_var("UPLOAD_CHUNK_BYTES", "lots");
        assert!(matches!(Config::from_env(), Err(ConfigError::ParseInt { .. })));

        std::env::remove_var("UPLOAD_CHUNK_BYTES");
        std::env::set_var("LOCK_TIMEOUT_SECS", "2");
        std::env::set_var("LOCK_RENEW_INTERVAL_SECS", "2");
        assert!(Config::from_env().unwrap().validate().is_err());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_zero_intervals_rejected() {
        clear_env();
        std::env::set_var("RELAY_URL", "https://relay.example/exec");
        std::env::set_var("QUEUE_POLL_INTERVAL_SECS", "0");
        assert!(matches!(
            Config::from_env().unwrap().validate(),
            Err(ConfigError::InvalidValue { name, .. }) if name == "QUEUE_POLL_INTERVAL_SECS"
        ));

        std::env::remove_var("QUEUE_POLL_INTERVAL_SECS");
        std::env::set_var("LOCK_RENEW_INTERVAL_SECS", "0");
        assert!(matches!(
            Config::from_env().unwrap().validate(),
            Err(ConfigError::InvalidValue { name, .. }) if name == "LOCK_RENEW_INTERVAL_SECS"
        ));

        clear_env();
    }

    #[test]
    fn test_s3_backend_requires_bucket() {
        let mut config = Config::for_testing();
        config.direct_backend = DirectBackend::S3;
        assert!(config.validate().is_err());
        config.s3_bucket = Some("archives".to_string());
        assert!(config.validate().is_ok());
    }
}
