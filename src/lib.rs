//! file-relay - Relays chat attachments to object storage and replies with expiring links
//!
//! A Telegram bot receives documents, videos, and audio, stages them on local
//! disk, pushes them to an S3-compatible bucket (multipart for large files),
//! and answers with a presigned download link plus player deep links.
//! Progress is reported by editing a single status message in place.
//!
//! A small HTTP API exposes health and the set of in-flight transfers.

pub mod api;
pub mod config;
pub mod format;
pub mod notifier;
pub mod object_store;
pub mod progress;
pub mod sanitize;
pub mod telegram;
pub mod transfer;
#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use transfer::Relay;

/// Shared application state
pub struct AppState {
    pub relay: Arc<Relay>,
}
