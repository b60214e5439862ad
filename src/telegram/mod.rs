//! Telegram Bot API adapter: the HTTP client, the file-download content
//! source, and the long-polling command loop.

mod bot;
mod client;
mod types;

pub use bot::{Bot, Command};
pub use client::{BotApi, TelegramDownload, DEFAULT_API_URL};
pub use types::{Chat, FileMeta, Message, RemoteFile, Update, User};

use std::time::Duration;

use thiserror::Error;

use crate::notifier::NotifierError;

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),
    #[error("Telegram API error {code}: {description}")]
    Api { code: i64, description: String },
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
}

impl From<reqwest::Error> for TelegramError {
    fn from(e: reqwest::Error) -> Self {
        // request URLs embed the bot token
        TelegramError::Http(e.without_url())
    }
}

impl From<TelegramError> for NotifierError {
    fn from(e: TelegramError) -> Self {
        match e {
            TelegramError::RateLimited { retry_after } => NotifierError::RateLimited { retry_after },
            TelegramError::Http(e) => NotifierError::Transport(e.to_string()),
            TelegramError::Api { .. } => NotifierError::Api(e.to_string()),
        }
    }
}
