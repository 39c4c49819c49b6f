//! Serial archiver library.
//!
//! Workers on one device share a task queue and a single worker lease
//! through a local key-value store. The lease holder scrapes queued
//! chapters into archives and moves them to object storage, directly when
//! the provider is reachable and in relay-sized chunks otherwise. A reader
//! side pulls archives back through the same relay.

// Allow raw string hashes for safety - they're harmless and prevent issues if content changes
#![allow(clippy::needless_raw_string_hashes)]

pub mod archive;
pub mod clock;
pub mod codec;
pub mod config;
pub mod constants;
pub mod download;
pub mod error;
pub mod guard;
pub mod lock;
pub mod processor;
pub mod queue;
pub mod relay;
pub mod retry;
pub mod scrape;
pub mod store;
pub mod upload;
