use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("API error: {0}")]
    Api(String),
}

/// A status message that can be edited later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub chat_id: String,
    pub message_id: String,
}

/// A URL button attached to a status message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkButton {
    pub label: String,
    pub url: String,
}

impl LinkButton {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
        }
    }
}

/// Channel used to tell the requester what their upload is doing.
///
/// Delivery is best-effort: callers log failures and carry on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, chat_id: &str, text: &str) -> Result<MessageHandle, NotifierError>;
    async fn edit(
        &self,
        message: &MessageHandle,
        text: &str,
        buttons: &[LinkButton],
    ) -> Result<(), NotifierError>;
}

/// Wrap text in an inline code span. Backticks inside would end the span early,
/// so they are swapped for quotes.
pub fn code_span(text: &str) -> String {
    format!("`{}`", text.replace('`', "'"))
}
